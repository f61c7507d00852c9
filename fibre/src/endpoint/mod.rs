//! The endpoint-addressed call protocol: a request/response scheme layered
//! over the connection, addressing the legacy endpoint table.

pub mod client;
pub mod server;
pub mod table;

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::chunk::{BufChain, Chunk, Socket, WriteArgs, WriteResult};
    use crate::config::{AckPolicy, ConnectionConfig};
    use crate::connection::Connection;
    use crate::domain::{ServerTables, ServerTablesBuilder};
    use crate::endpoint::client::EndpointClientConnection;
    use crate::endpoint::server::EndpointServerConnection;
    use crate::endpoint::table::EndpointEntry;
    use crate::function::{ArgInfo, ArgStream, FunctionInfo, SyncFunction};
    use crate::logging;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            ack_policy: AckPolicy::Lenient,
            fifo_blocks: 256,
            resend_timeout_ms: 500,
        }
    }

    fn tables() -> Rc<ServerTables> {
        let mut builder = ServerTablesBuilder::new("e2e");
        let add = SyncFunction::new(
            FunctionInfo {
                name: "add".to_string(),
                inputs: vec![
                    ArgInfo::new("obj", "uint8"),
                    ArgInfo::new("a", "uint32"),
                    ArgInfo::new("b", "uint32"),
                ],
                outputs: vec![ArgInfo::new("sum", "uint32")],
            },
            Rc::new(|_t, args| {
                let a = LittleEndian::read_u32(&args[1]);
                let b = LittleEndian::read_u32(&args[2]);
                Ok(vec![(a + b).to_le_bytes().to_vec()])
            }),
        );
        let function_id = builder.add_function(Box::new(add));
        builder.add_endpoint(EndpointEntry::FunctionTrigger {
            function_id,
            object_id: 3,
        });
        Rc::new(builder.finish())
    }

    struct Caller {
        stream: ArgStream,
        received: Rc<RefCell<Vec<Vec<u8>>>>,
        done: Rc<RefCell<bool>>,
        current: Vec<u8>,
    }

    impl Socket for Caller {
        fn write(&mut self, args: WriteArgs<'_>) -> WriteResult {
            for chunk in args.buf.iter() {
                if chunk.layer() != 0 {
                    continue;
                }
                if chunk.is_buf() {
                    self.current.extend_from_slice(chunk.bytes());
                } else {
                    self.received.borrow_mut().push(std::mem::take(&mut self.current));
                }
            }
            if args.status.is_terminal() {
                *self.done.borrow_mut() = true;
            }
            WriteResult::new(args.status, args.buf.end_pos())
        }

        fn on_write_done(&mut self, result: WriteResult) -> WriteArgs<'_> {
            self.stream.acknowledge(result.end);
            self.stream.offer()
        }
    }

    /// Carries one peer's pending frames to the other: strips the routing
    /// preamble (layer 1) and shifts the connection stream down to the
    /// layers the input slot expects, exactly like a transport adapter
    /// would.
    fn shuttle(
        from: &mut Connection,
        from_slot: crate::connection::OutputSlotId,
        to: &mut Connection,
        to_slot: crate::connection::InputSlotId,
    ) -> bool {
        if !from.slot_has_data(from_slot) {
            return false;
        }

        let (shaped, end): (Vec<(u8, bool, Vec<u8>)>, _) = {
            let task = from.build_task(from_slot);
            let shaped = task
                .chunks
                .iter()
                .filter(|c| c.layer() >= 2)
                .map(|c| (c.layer() - 2, c.is_frame_boundary(), c.bytes().to_vec()))
                .collect();
            (shaped, task.chain().end_pos())
        };
        from.release_task(from_slot, end);

        let chunks: Vec<Chunk<'_>> = shaped
            .iter()
            .map(|(layer, bound, bytes)| {
                if *bound {
                    Chunk::frame_boundary(*layer)
                } else {
                    Chunk::buf(*layer, bytes)
                }
            })
            .collect();
        to.process_sync(to_slot, BufChain::from_chunks(chunks));
        true
    }

    #[test]
    fn test_full_call_round_trip_over_connections() {
        let log = logging::discard();
        let tables = tables();

        let mut client_conn = Connection::new(&log, &config(), 0, [1; 16]);
        let mut server_conn = Connection::new(&log, &config(), 0, [1; 16]);

        let client_tx = client_conn.open_tx_slot(0);
        let server_rx = server_conn.open_rx_slot();
        let server_tx = server_conn.open_tx_slot(0);
        let client_rx = client_conn.open_rx_slot();

        let mut client = EndpointClientConnection::new(&log);
        let mut server = EndpointServerConnection::new(&log, tables.clone());

        // queue the call: add(7, 35)
        let received = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(RefCell::new(false));
        let mut stream = ArgStream::new();
        stream.push_arg(7u32.to_le_bytes().to_vec());
        stream.push_arg(35u32.to_le_bytes().to_vec());
        stream.close();
        let caller = Caller {
            stream,
            received: received.clone(),
            done: done.clone(),
            current: Vec::new(),
        };
        client.start_call(1, tables.json.crc, Box::new(caller));

        // run both directions until the bus goes quiet
        for _ in 0..32 {
            client.pump_tx(&mut client_conn.tx_port());
            let forward = shuttle(&mut client_conn, client_tx, &mut server_conn, server_rx);
            server_conn.pump_rx(&mut server);

            let backward = shuttle(&mut server_conn, server_tx, &mut client_conn, client_rx);
            client_conn.pump_rx(&mut client);

            if !forward && !backward && *done.borrow() {
                break;
            }
        }

        assert!(*done.borrow());
        assert_eq!(*received.borrow(), vec![42u32.to_le_bytes().to_vec()]);

        // the acks collapsed both TX fifos down to nothing outstanding
        assert!(!client_conn.is_broken());
        assert!(!server_conn.is_broken());
    }

    #[test]
    fn test_two_calls_complete_in_order() {
        let log = logging::discard();
        let tables = tables();

        let mut client_conn = Connection::new(&log, &config(), 0, [2; 16]);
        let mut server_conn = Connection::new(&log, &config(), 0, [2; 16]);

        let client_tx = client_conn.open_tx_slot(0);
        let server_rx = server_conn.open_rx_slot();
        let server_tx = server_conn.open_tx_slot(0);
        let client_rx = client_conn.open_rx_slot();

        let mut client = EndpointClientConnection::new(&log);
        let mut server = EndpointServerConnection::new(&log, tables.clone());

        let mut outcomes = Vec::new();
        for (a, b) in &[(1u32, 2u32), (100, 200)] {
            let received = Rc::new(RefCell::new(Vec::new()));
            let done = Rc::new(RefCell::new(false));
            let mut stream = ArgStream::new();
            stream.push_arg(a.to_le_bytes().to_vec());
            stream.push_arg(b.to_le_bytes().to_vec());
            stream.close();
            client.start_call(
                1,
                tables.json.crc,
                Box::new(Caller {
                    stream,
                    received: received.clone(),
                    done: done.clone(),
                    current: Vec::new(),
                }),
            );
            outcomes.push((received, done));
        }

        for _ in 0..64 {
            client.pump_tx(&mut client_conn.tx_port());
            let forward = shuttle(&mut client_conn, client_tx, &mut server_conn, server_rx);
            server_conn.pump_rx(&mut server);
            let backward = shuttle(&mut server_conn, server_tx, &mut client_conn, client_rx);
            client_conn.pump_rx(&mut client);
            if !forward && !backward {
                break;
            }
        }

        assert_eq!(*outcomes[0].0.borrow(), vec![3u32.to_le_bytes().to_vec()]);
        assert_eq!(
            *outcomes[1].0.borrow(),
            vec![300u32.to_le_bytes().to_vec()]
        );
        assert!(*outcomes[0].1.borrow() && *outcomes[1].1.borrow());
    }
}
