//! Packet-based legacy protocol. Requests and responses are matched by a
//! 14-bit client sequence number (one extra bit is pinned high to avoid
//! aliasing with the ODrive ASCII protocol). A call is composed out of a
//! series of endpoint operations: each input argument's endpoint is
//! exchanged for that argument's bytes, the trigger endpoint fires the
//! function, and each output argument's endpoint is exchanged for its
//! bytes.
//!
//! Request payload:
//!
//! ```text
//! <seqno:u16_le> <endpoint_id:u16_le (top bit = expect_response)>
//! <expected_response_length:u16_le> <payload…> <trailer:u16_le>
//! ```
//!
//! Response payload: `<seqno | 0x8000 : u16_le> <response_bytes…>`.

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::chunk::{BufChain, ChainPos, Chunk, Socket, WriteArgs, WriteResult};
use crate::domain::ServerTables;
use crate::endpoint::table::EndpointEntry;
use crate::function::{ArgCollector, ArgStream};
use crate::logging::{debug, error, o, trace, Logger};
use crate::status::{RichResult, Status};
use crate::PROTOCOL_VERSION;

/// Transport-facing packet channel.
pub trait PacketSink {
    fn mtu(&self) -> usize;
    /// Hands one packet to the transport. False means "try again later";
    /// the protocol keeps the operation queued.
    fn send_packet(&mut self, payload: &[u8]) -> bool;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LegacyCallKey(usize);

/// What to do with an operation's response bytes.
#[derive(Debug, Copy, Clone)]
enum OpSlot {
    /// Input write, no interesting response.
    InArg,
    /// Response bytes belong to this output argument.
    OutArg(usize),
}

struct PendingOp {
    seqno: u16,
    endpoint_id: u16,
    tx: Vec<u8>,
    rx_expected: usize,
    call: usize,
    slot: OpSlot,
}

struct LegacyCall {
    ep_num: u16,
    json_crc: u16,
    in_eps: Vec<u16>,
    out_eps: Vec<u16>,
    caller: Box<dyn Socket>,
    inputs: ArgCollector,
    pending: WriteResult,
    ops_enqueued: bool,
    ops_remaining: usize,
    out_args: Vec<Vec<u8>>,
    error: bool,
}

/// Progress of a table-walking function invocation on the server side.
struct ServerCallState {
    expected_ep: u16,
    trigger_ep: u16,
    n_inputs: u16,
    n_outputs: u16,
    args: Vec<Vec<u8>>,
    out_flat: Vec<u8>,
    out_pos: usize,
}

impl ServerCallState {
    fn new() -> ServerCallState {
        ServerCallState {
            expected_ep: 0,
            trigger_ep: 0,
            n_inputs: 0,
            n_outputs: 0,
            args: Vec::new(),
            out_flat: Vec::new(),
            out_pos: 0,
        }
    }
}

pub struct LegacyProtocol {
    log: Logger,
    tables: Rc<ServerTables>,
    outbound_seq_no: u16,
    pending_ops: VecDeque<PendingOp>,
    expected_acks: HashMap<u16, PendingOp>,
    calls: Vec<Option<LegacyCall>>,
    server: ServerCallState,
    /// Chunk size of the re-issued endpoint-0 reads.
    json_chunk: usize,
}

impl LegacyProtocol {
    pub fn new(log: &Logger, tables: Rc<ServerTables>) -> LegacyProtocol {
        LegacyProtocol {
            log: log.new(o!()),
            tables,
            outbound_seq_no: 0,
            pending_ops: VecDeque::new(),
            expected_acks: HashMap::new(),
            calls: Vec::new(),
            server: ServerCallState::new(),
            json_chunk: 512,
        }
    }

    fn next_seqno(&mut self) -> u16 {
        self.outbound_seq_no = (self.outbound_seq_no + 1) & 0x7fff;
        // one bit is pinned high so the seqno can never look like an
        // ODrive ASCII protocol line
        self.outbound_seq_no | 0x0080
    }

    /// Starts a call against the remote endpoint table. The caller socket
    /// is pulled for input arguments on the next `pump`.
    pub fn start_call(
        &mut self,
        ep_num: u16,
        json_crc: u16,
        in_eps: Vec<u16>,
        out_eps: Vec<u16>,
        caller: Box<dyn Socket>,
    ) -> LegacyCallKey {
        let n_outputs = out_eps.len();
        let call = LegacyCall {
            ep_num,
            json_crc,
            in_eps,
            out_eps,
            caller,
            inputs: ArgCollector::new(),
            pending: WriteResult::new(Status::Ok, ChainPos::default()),
            ops_enqueued: false,
            ops_remaining: 0,
            out_args: vec![Vec::new(); n_outputs],
            error: false,
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
        LegacyCallKey(key)
    }

    pub fn call_pending(&self, key: LegacyCallKey) -> bool {
        self.calls
            .get(key.0)
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    /// Collects caller inputs, synthesizes endpoint operations and flushes
    /// the operation queue.
    pub fn pump(&mut self, sink: &mut dyn PacketSink) {
        for key in 0..self.calls.len() {
            self.collect_inputs(key);
            self.enqueue_ops(key);
        }
        self.send_ops(sink);
    }

    fn collect_inputs(&mut self, key: usize) {
        let call = match self.calls.get_mut(key).and_then(|c| c.as_mut()) {
            Some(call) => call,
            None => return,
        };
        if call.inputs.closed {
            return;
        }

        loop {
            let offered = call.caller.on_write_done(call.pending);
            if offered.is_busy() {
                return;
            }
            let end = offered.buf.end_pos();
            let terminal = offered.status.is_terminal();
            call.inputs.consume(&offered);
            call.pending = WriteResult::new(Status::Ok, end);
            if terminal {
                return;
            }
        }
    }

    fn enqueue_ops(&mut self, key: usize) {
        let (ops, error) = {
            let call = match self.calls.get_mut(key).and_then(|c| c.as_mut()) {
                Some(call) => call,
                None => return,
            };
            if !call.inputs.closed || call.ops_enqueued {
                return;
            }
            call.ops_enqueued = true;

            if call.inputs.complete.len() != call.in_eps.len() {
                error!(self.log, "argument count mismatch";
                       "got" => call.inputs.complete.len(),
                       "expected" => call.in_eps.len());
                call.error = true;
                (Vec::new(), true)
            } else {
                let in_args = call.inputs.complete.clone();
                let mut ops: Vec<(u16, Vec<u8>, usize, OpSlot)> = Vec::new();

                for (i, &ep) in call.in_eps.iter().enumerate() {
                    if ep != call.ep_num {
                        ops.push((ep, in_args[i].clone(), 0, OpSlot::InArg));
                    }
                }

                let trigger_tx = if call.in_eps.len() == 1 && call.in_eps[0] == call.ep_num {
                    in_args[0].clone()
                } else {
                    Vec::new()
                };
                let trigger_rx = if call.out_eps.len() == 1 && call.out_eps[0] == call.ep_num {
                    self.json_chunk
                } else {
                    0
                };
                let trigger_slot = if trigger_rx > 0 {
                    OpSlot::OutArg(0)
                } else {
                    OpSlot::InArg
                };
                ops.push((call.ep_num, trigger_tx, trigger_rx, trigger_slot));

                for (i, &ep) in call.out_eps.iter().enumerate() {
                    if ep != call.ep_num {
                        ops.push((ep, Vec::new(), self.json_chunk, OpSlot::OutArg(i)));
                    }
                }

                call.ops_remaining = ops.len();
                (ops, false)
            }
        };

        if error {
            self.finish_call(key);
            return;
        }

        for (endpoint_id, tx, rx_expected, slot) in ops {
            let seqno = self.next_seqno();
            self.pending_ops.push_back(PendingOp {
                seqno,
                endpoint_id,
                tx,
                rx_expected,
                call: key,
                slot,
            });
        }
    }

    fn send_ops(&mut self, sink: &mut dyn PacketSink) {
        while let Some(op) = self.pending_ops.pop_front() {
            let mut packet = Vec::new();
            let mut field = [0u8; 2];

            LittleEndian::write_u16(&mut field, op.seqno);
            packet.extend_from_slice(&field);
            LittleEndian::write_u16(&mut field, op.endpoint_id | 0x8000);
            packet.extend_from_slice(&field);
            LittleEndian::write_u16(&mut field, op.rx_expected as u16);
            packet.extend_from_slice(&field);

            let mtu = sink.mtu();
            let n_payload = (mtu.max(8) - 8).min(op.tx.len());
            packet.extend_from_slice(&op.tx[..n_payload]);

            let json_crc = self.calls[op.call].as_ref().map(|c| c.json_crc).unwrap_or(0);
            let trailer = if op.endpoint_id & 0x7fff == 0 {
                PROTOCOL_VERSION
            } else {
                json_crc
            };
            LittleEndian::write_u16(&mut field, trailer);
            packet.extend_from_slice(&field);

            trace!(self.log, "send request"; "seqno" => op.seqno, "ep" => op.endpoint_id);

            if sink.send_packet(&packet) {
                self.expected_acks.insert(op.seqno, op);
            } else {
                self.pending_ops.push_front(op);
                break;
            }
        }
    }

    /// Entry point for every received packet; dispatches between the ack
    /// path (client role) and the request path (server role).
    pub fn on_packet(&mut self, data: &[u8], sink: &mut dyn PacketSink) {
        if data.len() < 2 {
            error!(self.log, "packet too short");
            return;
        }
        let seqno = LittleEndian::read_u16(&data[0..2]);

        if seqno & 0x8000 != 0 {
            self.handle_ack(seqno & 0x7fff, &data[2..]);
            self.send_ops(sink);
        } else {
            self.handle_request(seqno, &data[2..], sink);
        }
    }

    fn handle_ack(&mut self, seqno: u16, response: &[u8]) {
        let op = match self.expected_acks.remove(&seqno) {
            Some(op) => op,
            None => {
                error!(self.log, "received unexpected ACK"; "seqno" => seqno);
                return;
            }
        };
        trace!(self.log, "received ACK"; "seqno" => seqno);

        enum Outcome {
            Progress { finished: bool },
            Rechunk { tx: Vec<u8> },
        }

        let key = op.call;
        let outcome = {
            let call = match self.calls.get_mut(key).and_then(|c| c.as_mut()) {
                Some(call) => call,
                None => return,
            };

            let got = &response[..response.len().min(op.rx_expected)];

            let mut outcome = None;
            if let OpSlot::OutArg(i) = op.slot {
                call.out_args[i].extend_from_slice(got);

                // Endpoint 0 serves the JSON descriptor in slices; a full
                // slice means there is more, so re-issue the read with the
                // offset advanced.
                let rechunk = call.ep_num == 0
                    && got.len() == op.rx_expected
                    && call.inputs.complete.len() == 1
                    && call.inputs.complete[0].len() == 4;
                if rechunk {
                    let mut offset = [0u8; 4];
                    LittleEndian::write_u32(&mut offset, call.out_args[i].len() as u32);
                    call.inputs.complete[0] = offset.to_vec();
                    outcome = Some(Outcome::Rechunk {
                        tx: offset.to_vec(),
                    });
                }
            }

            outcome.unwrap_or_else(|| {
                call.ops_remaining -= 1;
                Outcome::Progress {
                    finished: call.ops_remaining == 0,
                }
            })
        };

        match outcome {
            Outcome::Rechunk { tx } => {
                let seqno = self.next_seqno();
                self.pending_ops.push_front(PendingOp {
                    seqno,
                    endpoint_id: 0,
                    tx,
                    rx_expected: op.rx_expected,
                    call: key,
                    slot: op.slot,
                });
            }
            Outcome::Progress { finished } => {
                if finished {
                    self.finish_call(key);
                }
            }
        }
    }

    /// Streams the collected outputs to the caller and retires the call.
    fn finish_call(&mut self, key: usize) {
        let mut call = match self.calls.get_mut(key).and_then(|c| c.take()) {
            Some(call) => call,
            None => return,
        };

        let status = if call.error {
            Status::ProtocolError
        } else {
            Status::Closed
        };

        let mut stream = ArgStream::new();
        for arg in std::mem::take(&mut call.out_args) {
            stream.push_arg(arg);
        }
        stream.close();

        let mut result = WriteResult::new(Status::Ok, ChainPos::default());
        loop {
            stream.acknowledge(result.end);
            let offered = stream.offer();
            let done = offered.buf.is_empty();
            let args = WriteArgs::new(offered.buf, status);
            result = call.caller.write(args);
            if result.is_busy() {
                // the caller refused the tail of the response; nothing we
                // can re-drive it with, so the data is dropped
                error!(self.log, "caller rejected response data");
                break;
            }
            if done || stream.exhausted() {
                break;
            }
        }

        debug!(self.log, "call finished"; "status" => %status);
    }

    fn handle_request(&mut self, seqno: u16, rest: &[u8], sink: &mut dyn PacketSink) {
        if rest.len() < 6 {
            error!(self.log, "packet too short");
            return;
        }

        let raw_ep = LittleEndian::read_u16(&rest[0..2]);
        let expect_response = raw_ep & 0x8000 != 0;
        let endpoint_id = raw_ep & 0x7fff;

        let expected_trailer = if endpoint_id == 0 {
            PROTOCOL_VERSION
        } else {
            self.tables.json.crc
        };
        let actual_trailer = LittleEndian::read_u16(&rest[rest.len() - 2..]);
        if expected_trailer != actual_trailer {
            debug!(self.log, "trailer mismatch";
                   "endpoint" => endpoint_id,
                   "expected" => expected_trailer,
                   "got" => actual_trailer);
            return;
        }

        let mut expected_len = LittleEndian::read_u16(&rest[2..4]) as usize;
        let max_len = sink.mtu().max(2) - 2;
        if expected_len > max_len {
            expected_len = max_len;
        }

        let input = &rest[4..rest.len() - 2];

        let output = match self.endpoint_handler(endpoint_id, input, expected_len) {
            Ok(output) => output,
            Err(err) => {
                error!(self.log, "endpoint handler failed: {}", err);
                Vec::new()
            }
        };

        if expect_response {
            let mut packet = Vec::with_capacity(2 + output.len());
            let mut field = [0u8; 2];
            LittleEndian::write_u16(&mut field, seqno | 0x8000);
            packet.extend_from_slice(&field);
            packet.extend_from_slice(&output);
            debug!(self.log, "send response"; "seqno" => seqno, "len" => output.len());
            sink.send_packet(&packet);
        }
    }

    /// The legacy endpoint handler: serves endpoint 0 and walks the
    /// endpoint table for everything else, enforcing the declared argument
    /// sizes.
    fn endpoint_handler(
        &mut self,
        endpoint_id: u16,
        input: &[u8],
        max_out: usize,
    ) -> RichResult<Vec<u8>> {
        if endpoint_id == 0 {
            return self.endpoint0_handler(input, max_out);
        }

        let entry = *self
            .tables
            .endpoint(endpoint_id)
            .ok_or_else(|| rich_err!("invalid endpoint {}", endpoint_id))?;

        match entry {
            EndpointEntry::RoProperty {
                object_id,
                read_function_id,
            } => {
                if !input.is_empty() {
                    return Err(rich_err!("size mismatch"));
                }
                let outputs = self.invoke_sync(read_function_id, vec![vec![object_id]])?;
                let mut flat: Vec<u8> = outputs.into_iter().flatten().collect();
                flat.truncate(max_out);
                Ok(flat)
            }
            EndpointEntry::RwProperty {
                object_id,
                read_function_id,
                exchange_function_id,
            } => {
                let (function_id, args) = if input.is_empty() {
                    (read_function_id, vec![vec![object_id]])
                } else {
                    (exchange_function_id, vec![vec![object_id], input.to_vec()])
                };
                let outputs = self.invoke_sync(function_id, args)?;
                let mut flat: Vec<u8> = outputs.into_iter().flatten().collect();
                flat.truncate(max_out);
                Ok(flat)
            }
            EndpointEntry::FunctionTrigger { .. }
            | EndpointEntry::FunctionInput { .. }
            | EndpointEntry::FunctionOutput { .. } => {
                self.function_walk(endpoint_id, entry, input, max_out)
            }
            EndpointEntry::Json => Err(rich_err!("invalid endpoint {}", endpoint_id)),
        }
    }

    fn endpoint0_handler(&self, input: &[u8], max_out: usize) -> RichResult<Vec<u8>> {
        if input.len() < 4 {
            return Err(rich_err!("offset missing"));
        }
        let offset = LittleEndian::read_u32(&input[0..4]);

        if offset == 0xffff_ffff {
            return Ok(self.tables.json.version_id.to_le_bytes().to_vec());
        }

        let json = &self.tables.json.bytes;
        if offset as usize >= json.len() {
            return Ok(Vec::new());
        }

        let from = offset as usize;
        let n_copy = (json.len() - from).min(max_out);
        Ok(json[from..from + n_copy].to_vec())
    }

    /// One step of the function-call-by-endpoint-access protocol: input
    /// endpoints accumulate arguments, the trigger invokes the function,
    /// output endpoints drain the result.
    fn function_walk(
        &mut self,
        endpoint_id: u16,
        entry: EndpointEntry,
        input: &[u8],
        max_out: usize,
    ) -> RichResult<Vec<u8>> {
        if endpoint_id != self.server.expected_ep {
            // a new function call starts; determine the shape of the
            // function from the table
            self.server = ServerCallState::new();

            let mut n_inputs: u16 = 0;
            let mut n_outputs: u16 = 0;
            let mut i = endpoint_id + 1;
            while let Some(next) = self.tables.endpoint(i) {
                match next {
                    EndpointEntry::FunctionInput { .. } => n_inputs += 1,
                    EndpointEntry::FunctionOutput { .. } => n_outputs += 1,
                    _ => break,
                }
                i += 1;
            }

            let correct_first_access = match entry {
                // functions with no in args start at the trigger
                EndpointEntry::FunctionTrigger { .. } => n_inputs == 0,
                // functions with in args start at the first input
                EndpointEntry::FunctionInput { .. } => matches!(
                    self.tables.endpoint(endpoint_id - 1),
                    Some(EndpointEntry::FunctionTrigger { .. })
                ),
                _ => false,
            };
            if !correct_first_access {
                return Err(rich_err!("incorrect endpoint access"));
            }

            let trigger_ep = match entry {
                EndpointEntry::FunctionTrigger { .. } => endpoint_id,
                _ => endpoint_id - 1,
            };
            if let EndpointEntry::FunctionInput { .. } = entry {
                n_inputs += 1;
            }

            let object_id = match self.tables.endpoint(trigger_ep) {
                Some(EndpointEntry::FunctionTrigger { object_id, .. }) => *object_id,
                _ => return Err(rich_err!("incorrect endpoint access")),
            };

            self.server.trigger_ep = trigger_ep;
            self.server.n_inputs = n_inputs;
            self.server.n_outputs = n_outputs;
            self.server.args = vec![vec![object_id]];
            self.server.expected_ep = endpoint_id;
        }

        let trigger_ep = self.server.trigger_ep;
        let n_inputs = self.server.n_inputs;
        let n_outputs = self.server.n_outputs;
        let span = trigger_ep + n_inputs + 1 + n_outputs;

        match entry {
            EndpointEntry::FunctionInput { size } => {
                if input.len() != size as usize || max_out != 0 {
                    self.server = ServerCallState::new();
                    return Err(rich_err!("size mismatch"));
                }
                self.server.args.push(input.to_vec());
                self.server.expected_ep =
                    (endpoint_id + 1 - trigger_ep) % (n_inputs + 1) + trigger_ep;
                Ok(Vec::new())
            }
            EndpointEntry::FunctionTrigger { function_id, .. } => {
                if !input.is_empty() || max_out != 0 {
                    self.server = ServerCallState::new();
                    return Err(rich_err!("size mismatch"));
                }
                let args = std::mem::take(&mut self.server.args);
                let outputs = self.invoke_sync(function_id, args)?;
                self.server.out_flat = outputs.into_iter().flatten().collect();
                self.server.out_pos = 0;
                self.server.expected_ep = (trigger_ep + n_inputs + 1) % span;
                Ok(Vec::new())
            }
            EndpointEntry::FunctionOutput { size } => {
                if !input.is_empty() || max_out < size as usize {
                    self.server = ServerCallState::new();
                    return Err(rich_err!("size mismatch"));
                }
                let from = self.server.out_pos;
                let to = (from + size as usize).min(self.server.out_flat.len());
                let out = self.server.out_flat[from..to].to_vec();
                self.server.out_pos = to;
                self.server.expected_ep = (endpoint_id + 1) % span;
                Ok(out)
            }
            _ => Err(rich_err!("incorrect endpoint access")),
        }
    }

    /// Invokes a server function that must complete synchronously.
    fn invoke_sync(
        &self,
        function_id: u16,
        args: Vec<Vec<u8>>,
    ) -> RichResult<Vec<Vec<u8>>> {
        let func = self
            .tables
            .get_function(function_id)
            .ok_or_else(|| rich_err!("invalid function {}", function_id))?;

        let mut socket = func.start_call(&self.tables, &self.log);

        let mut chain = BufChain::new();
        for arg in &args {
            chain.push(Chunk::buf(0, arg));
            chain.push(Chunk::frame_boundary(0));
        }
        socket.write(WriteArgs::new(chain, Status::Closed));

        let mut outputs = ArgCollector::new();
        let mut result = WriteResult::new(Status::Ok, ChainPos::default());
        loop {
            let offered = socket.on_write_done(result);
            if offered.is_busy() {
                return Err(rich_err!("function did not complete synchronously"));
            }
            let end = offered.buf.end_pos();
            let terminal = offered.status.is_terminal();
            let empty = offered.buf.is_empty();
            outputs.consume(&offered);
            result = WriteResult::new(Status::Ok, end);
            if terminal && empty {
                break;
            }
        }

        Ok(outputs.complete)
    }

    #[cfg(test)]
    pub(crate) fn set_json_chunk(&mut self, chunk: usize) {
        self.json_chunk = chunk;
    }
}
