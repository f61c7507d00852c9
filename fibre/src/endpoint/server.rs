//! Server side of the endpoint-addressed call protocol. Sits behind a
//! connection as its RX handler. Wire grammar per call, on the connection's
//! call-framing layer:
//!
//! ```text
//! <endpoint_id:u16_le (top bit = exchange)> <trailer_crc:u16_le>
//! <payload…> <layer-0 boundary>
//! ```
//!
//! The trailer is the protocol version for endpoint 0 and the JSON CRC for
//! every other endpoint. On mismatch the payload is swallowed until the
//! terminating boundary so the peer stays in frame.

use byteorder::{ByteOrder, LittleEndian};
use std::rc::Rc;

use crate::chunk::{BufChain, ChainPos, Chunk, Cont, Socket, WriteArgs, WriteResult};
use crate::connection::{RxHandler, TxPort};
use crate::domain::ServerTables;
use crate::endpoint::table::{split_endpoint_id, EndpointEntry};
use crate::logging::{debug, error, o, Logger};
use crate::status::Status;
use crate::PROTOCOL_VERSION;

const HEADER_SIZE: usize = 4;

/// Serves the embedded JSON descriptor. Expects a 4-byte little-endian
/// offset; `0xFFFFFFFF` yields the 4-byte version id, any other offset
/// yields the descriptor from that offset on (empty when past the end).
struct Endpoint0Socket {
    tables: Rc<ServerTables>,
    offset_buf: [u8; HEADER_SIZE],
    offset_pos: usize,
    version_id_buf: [u8; 4],
    response: Option<Response>,
    served: usize,
}

enum Response {
    Json { from: usize },
    VersionId,
}

impl Endpoint0Socket {
    fn new(tables: Rc<ServerTables>) -> Endpoint0Socket {
        let version_id_buf = tables.json.version_id.to_le_bytes();
        Endpoint0Socket {
            tables,
            offset_buf: [0; HEADER_SIZE],
            offset_pos: 0,
            version_id_buf,
            response: None,
            served: 0,
        }
    }

    fn response_bytes(&self) -> &[u8] {
        match self.response {
            Some(Response::Json { from }) => &self.tables.json.bytes[from..],
            Some(Response::VersionId) => &self.version_id_buf,
            None => &[],
        }
    }
}

impl Socket for Endpoint0Socket {
    fn write(&mut self, args: WriteArgs<'_>) -> WriteResult {
        for chunk in args.buf.iter() {
            // unrecognized chunks (argument boundaries) are ignored
            if chunk.is_buf() && chunk.layer() == 0 {
                let n_copy = (HEADER_SIZE - self.offset_pos).min(chunk.len());
                self.offset_buf[self.offset_pos..self.offset_pos + n_copy]
                    .copy_from_slice(&chunk.bytes()[..n_copy]);
                self.offset_pos += n_copy;
            }
        }

        if args.status == Status::Closed && self.response.is_none() {
            let offset = if self.offset_pos == HEADER_SIZE {
                LittleEndian::read_u32(&self.offset_buf)
            } else {
                0
            };

            self.response = Some(if offset == 0xffff_ffff {
                Response::VersionId
            } else {
                Response::Json {
                    from: (offset as usize).min(self.tables.json.bytes.len()),
                }
            });
        }

        WriteResult::new(args.status, args.buf.end_pos())
    }

    fn on_write_done(&mut self, result: WriteResult) -> WriteArgs<'_> {
        if self.response.is_none() {
            return WriteArgs::busy();
        }

        if result.end.chunk > 0 {
            self.served = self.response_bytes().len();
        } else {
            self.served += result.end.byte;
        }

        let remaining = &self.response_bytes()[self.served.min(self.response_bytes().len())..];
        let mut chain = BufChain::new();
        if !remaining.is_empty() {
            chain.push(Chunk::buf(0, remaining));
        }
        WriteArgs::new(chain, Status::Closed)
    }
}

/// Output side of the active call: the callee socket plus the consumption
/// state of its last offering.
struct OutCall {
    socket: Box<dyn Socket>,
    pending: WriteResult,
    output_done: bool,
}

pub struct EndpointServerConnection {
    log: Logger,
    tables: Rc<ServerTables>,
    header: [u8; HEADER_SIZE],
    header_pos: usize,
    /// An endpoint operation is in progress (payload streaming).
    rx_active: bool,
    /// The active operation failed validation; swallow its payload.
    discarding: bool,
    out_call: Option<OutCall>,
    /// The terminating layer-0 boundary still has to be emitted.
    footer_pending: bool,
}

impl EndpointServerConnection {
    pub fn new(log: &Logger, tables: Rc<ServerTables>) -> EndpointServerConnection {
        EndpointServerConnection {
            log: log.new(o!()),
            tables,
            header: [0; HEADER_SIZE],
            header_pos: 0,
            rx_active: false,
            discarding: false,
            out_call: None,
            footer_pending: false,
        }
    }

    /// Resolves the endpoint and constructs the callee socket, feeding it
    /// the object id as the first argument. Returns false when the payload
    /// must be discarded instead.
    fn start_endpoint_operation(&mut self, endpoint_id: u16, exchange: bool) -> bool {
        if endpoint_id == 0 {
            self.out_call = Some(OutCall {
                socket: Box::new(Endpoint0Socket::new(self.tables.clone())),
                pending: WriteResult::new(Status::Ok, ChainPos::default()),
                output_done: false,
            });
            return true;
        }

        let (function_id, object_id) = match self.tables.endpoint(endpoint_id) {
            Some(EndpointEntry::FunctionTrigger {
                function_id,
                object_id,
            }) => (*function_id, *object_id),
            Some(EndpointEntry::RoProperty {
                object_id,
                read_function_id,
            }) => (*read_function_id, *object_id),
            Some(EndpointEntry::RwProperty {
                object_id,
                read_function_id,
                exchange_function_id,
            }) => (
                if exchange {
                    *exchange_function_id
                } else {
                    *read_function_id
                },
                *object_id,
            ),
            _ => {
                error!(self.log, "unknown endpoint"; "endpoint" => endpoint_id);
                return false;
            }
        };

        let func = match self.tables.get_function(function_id) {
            Some(func) => func,
            None => {
                error!(self.log, "invalid function"; "function" => function_id);
                return false;
            }
        };

        let mut socket = func.start_call(&self.tables, &self.log);

        // the object id goes in as the first argument
        let id = [object_id];
        let first_arg = BufChain::from_chunks(vec![
            Chunk::buf(0, &id),
            Chunk::frame_boundary(0),
        ]);
        socket.write(WriteArgs::new(first_arg, Status::Ok));

        self.out_call = Some(OutCall {
            socket,
            pending: WriteResult::new(Status::Ok, ChainPos::default()),
            output_done: false,
        });
        true
    }

    /// Drains the active call's output into the TX fifo: payload elevated
    /// one layer up, then the terminating layer-0 boundary.
    pub fn pump_tx(&mut self, tx: &mut TxPort<'_>) {
        loop {
            let out = match &mut self.out_call {
                Some(out) => out,
                None => break,
            };
            if out.output_done {
                break;
            }

            let offered = out.socket.on_write_done(out.pending);
            if offered.is_busy() {
                return;
            }

            let status = offered.status;
            let to_send = WriteArgs::new(offered.buf.clone().elevated(1), Status::Ok);
            let total = to_send.buf.end_pos();
            let result = tx.write(&to_send);

            if result.is_busy() {
                out.pending = WriteResult::new(Status::Ok, ChainPos::default());
                return;
            }

            out.pending = WriteResult::new(Status::Ok, result.end);

            if result.end == total && status.is_terminal() {
                out.output_done = true;
                self.footer_pending = true;
                break;
            }
            if result.end != total {
                // TX fifo filled up mid-stream, resume later
                return;
            }
        }

        if self.footer_pending {
            let footer = WriteArgs::new(
                BufChain::from_chunks(vec![Chunk::frame_boundary(0)]),
                Status::Ok,
            );
            let result = tx.write(&footer);
            if !result.is_busy() && result.end.chunk == 1 {
                self.footer_pending = false;
                self.out_call = None;
            }
        }
    }
}

fn consume_chunks(base: &mut ChainPos, chain: &mut BufChain<'_>, n: usize) {
    chain.skip_chunks(n);
    *base = ChainPos::new(base.chunk + n, 0);
}

impl EndpointServerConnection {
    /// One iteration of the RX state machine: absorbs framing (header
    /// bytes, discarded payload) from the chain, then either hands out the
    /// next payload chain destined for the active call, or reports how far
    /// consumption got.
    fn rx_step<'a>(&mut self, chain: &mut BufChain<'a>, base: &mut ChainPos) -> Cont<'a> {
        loop {
            if !self.rx_active {
                let chunk = match chain.front() {
                    Some(chunk) => chunk,
                    None => return Cont::Done(WriteResult::new(Status::Ok, *base)),
                };

                if chunk.is_buf() && chunk.layer() == 0 {
                    let n_copy = (HEADER_SIZE - self.header_pos).min(chunk.len());
                    self.header[self.header_pos..self.header_pos + n_copy]
                        .copy_from_slice(&chunk.bytes()[..n_copy]);
                    self.header_pos += n_copy;

                    if n_copy == chunk.len() {
                        consume_chunks(base, chain, 1);
                    } else {
                        chain.skip_bytes(n_copy);
                        base.byte += n_copy;
                    }

                    if self.header_pos == HEADER_SIZE && n_copy > 0 {
                        let raw = LittleEndian::read_u16(&self.header[0..2]);
                        let trailer = LittleEndian::read_u16(&self.header[2..4]);
                        let (endpoint_id, exchange) = split_endpoint_id(raw);

                        let expected = if endpoint_id == 0 {
                            PROTOCOL_VERSION
                        } else {
                            self.tables.json.crc
                        };

                        self.header_pos = 0;
                        self.rx_active = true;

                        if trailer != expected {
                            debug!(self.log, "trailer mismatch";
                                   "endpoint" => endpoint_id,
                                   "expected" => expected,
                                   "got" => trailer);
                            // swallow the payload but still terminate the
                            // operation so the client stays in sync
                            self.discarding = true;
                        } else {
                            debug!(self.log, "trailer ok"; "endpoint" => endpoint_id);
                            self.discarding =
                                !self.start_endpoint_operation(endpoint_id, exchange);
                        }
                    }
                } else if chunk.is_frame_boundary() && chunk.layer() == 0 {
                    error!(
                        self.log,
                        "endpoint operation terminated without executing"
                    );
                    self.header_pos = 0;
                    consume_chunks(base, chain, 1);
                    // answer with a boundary so the peer stays in sync
                    self.footer_pending = true;
                } else {
                    // payload with no operation in progress
                    consume_chunks(base, chain, 1);
                }
                continue;
            }

            // an operation is active: stream payload up to the call boundary
            if chain.is_empty() {
                return Cont::Done(WriteResult::new(Status::Ok, *base));
            }

            // fifo padding records show up as empty layer-0 bufs, step over
            if let Some(front) = chain.front() {
                if front.is_buf() && front.layer() == 0 && front.len() == 0 {
                    consume_chunks(base, chain, 1);
                    continue;
                }
            }

            let bound = chain.find_layer0_bound();
            let mut n_payload = bound.unwrap_or_else(|| chain.n_chunks());
            let mut closing = bound.is_some();

            // stop short of an interior padding record; it is stepped over
            // on the next iteration
            if let Some(at) = chain
                .iter()
                .take(n_payload)
                .position(|c| c.is_buf() && c.layer() == 0 && c.len() == 0)
            {
                n_payload = at;
                closing = false;
            }

            // stray layer-0 payload bytes mid-operation: the peer violated
            // the wire grammar, discard the rest of this operation
            if !self.discarding
                && chain
                    .until(n_payload)
                    .iter()
                    .any(|c| c.is_buf() && c.layer() == 0)
            {
                error!(self.log, "unexpected layer-0 bytes in call payload");
                self.discarding = true;
            }

            if self.discarding {
                consume_chunks(base, chain, n_payload);
                if closing {
                    consume_chunks(base, chain, 1);
                    self.rx_active = false;
                    self.discarding = false;
                    self.footer_pending = true;
                }
                continue;
            }

            let payload = chain.until(n_payload).elevated(-1);
            let status = if closing { Status::Closed } else { Status::Ok };
            return Cont::Chain(WriteArgs::new(payload, status));
        }
    }
}

impl RxHandler for EndpointServerConnection {
    fn on_rx(&mut self, args: WriteArgs<'_>, tx: &mut TxPort<'_>) -> WriteResult {
        let mut chain = args.buf.clone();
        // consumption relative to the chain we were given
        let mut base = ChainPos::default();

        let result = loop {
            let call_args = match self.rx_step(&mut chain, &mut base) {
                Cont::Done(result) => break result,
                Cont::Chain(call_args) => call_args,
            };

            let total = call_args.buf.end_pos();
            let closing = call_args.status == Status::Closed;

            let result = match &mut self.out_call {
                Some(out) => out.socket.write(call_args),
                None => WriteResult::new(call_args.status, total),
            };

            if result.is_busy() {
                break if base == ChainPos::default() {
                    WriteResult::busy()
                } else {
                    WriteResult::new(Status::Ok, base)
                };
            }

            if result.end.chunk < total.chunk || result.end.byte > 0 {
                // partial consumption: report it and resume later
                consume_chunks(&mut base, &mut chain, result.end.chunk);
                if result.end.byte > 0 {
                    chain.skip_bytes(result.end.byte);
                    base.byte += result.end.byte;
                }
                break WriteResult::new(Status::Ok, base);
            }

            consume_chunks(&mut base, &mut chain, total.chunk);
            if closing {
                consume_chunks(&mut base, &mut chain, 1);
                self.rx_active = false;
            }
        };

        // stream any produced output back out
        self.pump_tx(tx);
        result
    }
}
