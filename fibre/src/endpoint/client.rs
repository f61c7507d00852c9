//! Client side of the endpoint-addressed call protocol. Calls are
//! serialized in FIFO order on both directions: only the front of the TX
//! queue may stream its header, input arguments and closing boundary, and
//! responses are matched to calls in the same order.

use byteorder::LittleEndian;
use byteorder::ByteOrder;
use std::collections::VecDeque;

use crate::chunk::{BufChain, ChainPos, Chunk, Cont, Socket, WriteArgs, WriteResult};
use crate::connection::{RxHandler, TxPort};
use crate::logging::{debug, error, o, trace, Logger};
use crate::status::Status;

const HEADER_SIZE: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CallKey(usize);

struct ClientCall {
    header: [u8; HEADER_SIZE],
    header_sent: usize,
    /// Caller-role socket: `on_write_done` yields input arguments,
    /// `write` receives response data.
    caller: Box<dyn Socket>,
    /// Consumption report to hand to the caller on the next input pull.
    pending: WriteResult,
    tx_done: bool,
    rx_done: bool,
}

pub struct EndpointClientConnection {
    log: Logger,
    calls: Vec<Option<ClientCall>>,
    tx_queue: VecDeque<usize>,
    rx_queue: VecDeque<usize>,
    /// The callee closed the current response early; skip inbound data
    /// until the next layer-0 boundary.
    call_closed: bool,
}

impl EndpointClientConnection {
    pub fn new(log: &Logger) -> EndpointClientConnection {
        EndpointClientConnection {
            log: log.new(o!()),
            calls: Vec::new(),
            tx_queue: VecDeque::new(),
            rx_queue: VecDeque::new(),
            call_closed: false,
        }
    }

    /// Allocates a call addressed at `ep_num`, enqueues it for transmission
    /// and for response matching. The caller socket is pulled for input
    /// argument bytes once the call reaches the front of the TX queue.
    pub fn start_call(
        &mut self,
        ep_num: u16,
        json_crc: u16,
        caller: Box<dyn Socket>,
    ) -> CallKey {
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut header[0..2], ep_num | 0x8000);
        LittleEndian::write_u16(&mut header[2..4], json_crc);

        let call = ClientCall {
            header,
            header_sent: 0,
            caller,
            pending: WriteResult::new(Status::Ok, ChainPos::default()),
            tx_done: false,
            rx_done: false,
        };

        let key = self
            .calls
            .iter()
            .position(|c| c.is_none())
            .unwrap_or_else(|| {
                self.calls.push(None);
                self.calls.len() - 1
            });
        self.calls[key] = Some(call);
        self.tx_queue.push_back(key);
        self.rx_queue.push_back(key);
        debug!(self.log, "call started"; "ep" => ep_num);
        CallKey(key)
    }

    /// True while the call is still in flight in either direction.
    pub fn call_pending(&self, key: CallKey) -> bool {
        self.calls
            .get(key.0)
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    fn retire_if_done(&mut self, key: usize) {
        let done = match &self.calls[key] {
            Some(call) => call.tx_done && call.rx_done,
            None => true,
        };
        if done {
            self.calls[key] = None;
        }
    }

    /// Streams the front call's header, input arguments (elevated one layer
    /// up) and closing boundary into the TX fifo, unblocking queued calls
    /// as each one completes.
    pub fn pump_tx(&mut self, tx: &mut TxPort<'_>) {
        while let Some(&front) = self.tx_queue.front() {
            let call = match self.calls[front].as_mut() {
                Some(call) => call,
                None => {
                    self.tx_queue.pop_front();
                    continue;
                }
            };

            // header first
            while call.header_sent < HEADER_SIZE {
                let args = WriteArgs::new(
                    BufChain::from_chunks(vec![Chunk::buf(
                        0,
                        &call.header[call.header_sent..],
                    )]),
                    Status::Ok,
                );
                let result = tx.write(&args);
                if result.is_busy() {
                    return;
                }
                call.header_sent += if result.end.chunk > 0 {
                    HEADER_SIZE - call.header_sent
                } else {
                    result.end.byte
                };
                if call.header_sent < HEADER_SIZE {
                    return;
                }
            }

            // then the caller's argument stream
            let offered = call.caller.on_write_done(call.pending);
            if offered.is_busy() {
                return;
            }

            let status = offered.status;
            let total = offered.buf.end_pos();
            let to_send = WriteArgs::new(offered.buf.clone().elevated(1), Status::Ok);
            trace!(self.log, "sending to server"; "chunks" => total.chunk);
            let result = tx.write(&to_send);
            if result.is_busy() {
                call.pending = WriteResult::new(Status::Ok, ChainPos::default());
                return;
            }
            call.pending = WriteResult::new(Status::Ok, result.end);
            if result.end != total {
                return;
            }

            if !status.is_terminal() {
                // more arguments to come from the caller
                continue;
            }

            // all inputs sent: closing layer-0 boundary
            let footer = WriteArgs::new(
                BufChain::from_chunks(vec![Chunk::frame_boundary(0)]),
                Status::Ok,
            );
            let result = tx.write(&footer);
            if result.is_busy() || result.end.chunk == 0 {
                return;
            }

            let call = self.calls[front].as_mut().unwrap();
            call.tx_done = true;
            self.tx_queue.pop_front();
            self.retire_if_done(front);
        }
    }
}

fn consume_chunks(base: &mut ChainPos, chain: &mut BufChain<'_>, n: usize) {
    chain.skip_chunks(n);
    *base = ChainPos::new(base.chunk + n, 0);
}

impl EndpointClientConnection {
    /// One iteration of the response state machine: absorbs skipped data
    /// from an early-closed call, then either hands out the next payload
    /// chain for the front call or reports how far consumption got.
    fn rx_step<'a>(&mut self, chain: &mut BufChain<'a>, base: &mut ChainPos) -> Cont<'a> {
        loop {
            if chain.is_empty() {
                return Cont::Done(WriteResult::new(Status::Ok, *base));
            }

            if self.call_closed {
                match chain.find_layer0_bound() {
                    Some(bound) => {
                        consume_chunks(base, chain, bound + 1);
                        self.call_closed = false;
                    }
                    None => {
                        let n = chain.n_chunks();
                        consume_chunks(base, chain, n);
                        return Cont::Done(WriteResult::new(Status::Ok, *base));
                    }
                }
                continue;
            }

            // fifo padding records show up as empty layer-0 bufs, step over
            if let Some(front) = chain.front() {
                if front.is_buf() && front.layer() == 0 && front.len() == 0 {
                    consume_chunks(base, chain, 1);
                    continue;
                }
            }

            if self.rx_queue.front().is_none() {
                // response without a pending call: leave it, this can only
                // resolve once a call is started
                error!(self.log, "unexpected response data");
                return Cont::Done(WriteResult::new(Status::Ok, *base));
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

            // stray layer-0 payload bytes violate the wire grammar; drop
            // them rather than feeding them to the caller
            if chain
                .iter()
                .take(n_payload)
                .any(|c| c.is_buf() && c.layer() == 0)
            {
                error!(self.log, "unexpected layer-0 bytes in response");
                consume_chunks(base, chain, n_payload);
                continue;
            }

            let payload = chain.until(n_payload).elevated(-1);
            let status = if closing { Status::Closed } else { Status::Ok };
            return Cont::Chain(WriteArgs::new(payload, status));
        }
    }
}

impl RxHandler for EndpointClientConnection {
    /// Routes response data to the call at the front of the RX queue. A
    /// layer-0 boundary completes the response; an early close by the
    /// callee skips ahead to the next boundary before new data is accepted.
    fn on_rx(&mut self, args: WriteArgs<'_>, _tx: &mut TxPort<'_>) -> WriteResult {
        let mut chain = args.buf.clone();
        let mut base = ChainPos::default();

        loop {
            let call_args = match self.rx_step(&mut chain, &mut base) {
                Cont::Done(result) => return result,
                Cont::Chain(call_args) => call_args,
            };

            let total = call_args.buf.end_pos();
            let closing = call_args.status == Status::Closed;
            let front = self.rx_queue.front().copied().expect("checked in rx_step");

            let call = match self.calls[front].as_mut() {
                Some(call) => call,
                None => {
                    self.rx_queue.pop_front();
                    continue;
                }
            };
            trace!(self.log, "sending to app"; "chunks" => total.chunk);
            let result = call.caller.write(call_args);

            if result.is_busy() {
                return WriteResult::new(Status::Ok, base);
            }

            let caller_terminated = result.status.is_terminal();

            if result.end.chunk < total.chunk {
                if !caller_terminated {
                    consume_chunks(&mut base, &mut chain, result.end.chunk);
                    if result.end.byte > 0 {
                        chain.skip_bytes(result.end.byte);
                        base.byte += result.end.byte;
                    }
                    return WriteResult::new(Status::Ok, base);
                }
            } else {
                consume_chunks(&mut base, &mut chain, total.chunk);
            }

            if closing || caller_terminated {
                let call = self.calls[front].as_mut().unwrap();
                call.rx_done = true;
                self.rx_queue.pop_front();
                self.retire_if_done(front);

                if closing && result.end.chunk >= total.chunk {
                    // consume the boundary itself
                    consume_chunks(&mut base, &mut chain, 1);
                } else {
                    // terminated early: resync on the next boundary
                    self.call_closed = true;
                }
            }
        }
    }
}
