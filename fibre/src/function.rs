//! Typed function calls and the coroutine-style byte pipeline between
//! caller and callee. A call is a two-sided socket: the downstream side
//! accepts input arguments as `(buf chunks…, layer-0 boundary)` groups in
//! declared order, the upstream side emits output arguments in the same
//! shape.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::chunk::{BufChain, ChainPos, Chunk, Socket, WriteArgs, WriteResult};
use crate::codec::Transcode;
use crate::domain::{ObjectHandle, ServerTables};
use crate::logging::{error, o, Logger};
use crate::status::{RichStatus, Status};

/// One declared argument: a name and its wire codec.
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub name: String,
    pub codec: String,
}

impl ArgInfo {
    pub fn new(name: &str, codec: &str) -> ArgInfo {
        ArgInfo {
            name: name.to_string(),
            codec: codec.to_string(),
        }
    }

    /// The transcoder for this argument, if its wire codec has one.
    pub fn transcoder(&self, decode: bool) -> Option<Transcode> {
        Transcode::for_wire_codec(&self.codec, decode)
    }
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub inputs: Vec<ArgInfo>,
    pub outputs: Vec<ArgInfo>,
}

/// A callable exported by the server. `start_call` returns the callee-side
/// socket: arguments are written into it, outputs are pulled out of it.
pub trait Function {
    fn info(&self) -> &FunctionInfo;
    fn start_call(&self, tables: &Rc<ServerTables>, log: &Logger) -> Box<dyn Socket>;
}

/// One attribute of an interface: a named sub-object.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub name: String,
    pub object: ObjectHandle,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub attributes: Vec<AttrInfo>,
    pub functions: Vec<u16>,
}

/// An object interface. Attribute lookups navigate the object graph without
/// any wire traffic.
pub trait Interface {
    fn info(&self) -> &InterfaceInfo;
    fn get_attribute(&self, attr: usize) -> Option<ObjectHandle>;
}

pub struct StaticInterface {
    info: InterfaceInfo,
}

impl StaticInterface {
    pub fn new(info: InterfaceInfo) -> StaticInterface {
        StaticInterface { info }
    }
}

impl Interface for StaticInterface {
    fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    fn get_attribute(&self, attr: usize) -> Option<ObjectHandle> {
        self.info.attributes.get(attr).map(|a| a.object)
    }
}

/// Serves a list of finalized argument buffers as a chunk stream with
/// partial-consumption tracking. Each argument becomes its bytes followed by
/// a layer-0 frame boundary.
pub(crate) struct ArgStream {
    args: Vec<Vec<u8>>,
    /// No further arguments will be appended.
    closed: bool,
    arg_idx: usize,
    byte: usize,
    offered: Vec<OfferedChunk>,
}

#[derive(Debug, Copy, Clone)]
enum OfferedChunk {
    Buf { arg: usize, from: usize },
    Bound { arg: usize },
}

impl ArgStream {
    pub(crate) fn new() -> ArgStream {
        ArgStream {
            args: Vec::new(),
            closed: false,
            arg_idx: 0,
            byte: 0,
            offered: Vec::new(),
        }
    }

    pub(crate) fn push_arg(&mut self, arg: Vec<u8>) {
        self.args.push(arg);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.closed && self.arg_idx >= self.args.len()
    }

    /// Advances the serve cursor by a consumption report against the last
    /// offering.
    pub(crate) fn acknowledge(&mut self, end: ChainPos) {
        for chunk in self.offered.iter().take(end.chunk) {
            match *chunk {
                OfferedChunk::Buf { arg, .. } => {
                    self.arg_idx = arg;
                    self.byte = self.args[arg].len();
                }
                OfferedChunk::Bound { arg } => {
                    self.arg_idx = arg + 1;
                    self.byte = 0;
                }
            }
        }
        if end.byte > 0 {
            if let Some(OfferedChunk::Buf { arg, from }) = self.offered.get(end.chunk).copied() {
                self.arg_idx = arg;
                self.byte = from + end.byte;
            }
        }
    }

    /// Builds the next offering from the serve cursor. Returns busy when
    /// there is nothing to offer yet.
    pub(crate) fn offer(&mut self) -> WriteArgs<'_> {
        self.offered.clear();
        for arg in self.arg_idx..self.args.len() {
            let from = if arg == self.arg_idx { self.byte } else { 0 };
            if from < self.args[arg].len() {
                self.offered.push(OfferedChunk::Buf { arg, from });
            }
            self.offered.push(OfferedChunk::Bound { arg });
        }

        if self.offered.is_empty() && !self.closed {
            return WriteArgs::busy();
        }

        let mut chain = BufChain::new();
        for chunk in &self.offered {
            match *chunk {
                OfferedChunk::Buf { arg, from } => {
                    chain.push(Chunk::buf(0, &self.args[arg][from..]));
                }
                OfferedChunk::Bound { .. } => chain.push(Chunk::frame_boundary(0)),
            }
        }

        let status = if self.closed { Status::Closed } else { Status::Ok };
        WriteArgs::new(chain, status)
    }
}

/// Splits incoming `(buf…, boundary)` groups on layer 0 into complete
/// argument buffers.
pub(crate) struct ArgCollector {
    pub(crate) current: Vec<u8>,
    pub(crate) complete: Vec<Vec<u8>>,
    pub(crate) closed: bool,
}

impl ArgCollector {
    pub(crate) fn new() -> ArgCollector {
        ArgCollector {
            current: Vec::new(),
            complete: Vec::new(),
            closed: false,
        }
    }

    /// Consumes the whole chain. Chunks on layers other than 0 are ignored.
    pub(crate) fn consume(&mut self, args: &WriteArgs<'_>) {
        for chunk in args.buf.iter() {
            if chunk.layer() != 0 {
                continue;
            }
            if chunk.is_buf() {
                self.current.extend_from_slice(chunk.bytes());
            } else {
                self.complete.push(std::mem::take(&mut self.current));
            }
        }
        if args.status == Status::Closed {
            self.closed = true;
        }
    }
}

/// Handler of a synchronously completing function: all inputs in, all
/// outputs out, bounded time.
pub type SyncHandler =
    Rc<dyn Fn(&ServerTables, &[Vec<u8>]) -> Result<Vec<Vec<u8>>, RichStatus>>;

/// A function whose implementation runs to completion during the final
/// input write.
pub struct SyncFunction {
    info: FunctionInfo,
    handler: SyncHandler,
}

impl SyncFunction {
    pub fn new(info: FunctionInfo, handler: SyncHandler) -> SyncFunction {
        SyncFunction { info, handler }
    }
}

impl Function for SyncFunction {
    fn info(&self) -> &FunctionInfo {
        &self.info
    }

    fn start_call(&self, tables: &Rc<ServerTables>, log: &Logger) -> Box<dyn Socket> {
        Box::new(SyncCallSocket {
            log: log.new(o!()),
            tables: tables.clone(),
            handler: self.handler.clone(),
            inputs: ArgCollector::new(),
            outputs: ArgStream::new(),
            invoked: false,
        })
    }
}

/// Callee-side socket of a `SyncFunction`: `write` feeds argument groups,
/// the closing write invokes the handler, `on_write_done` streams the
/// outputs back.
struct SyncCallSocket {
    log: Logger,
    tables: Rc<ServerTables>,
    handler: SyncHandler,
    inputs: ArgCollector,
    outputs: ArgStream,
    invoked: bool,
}

impl Socket for SyncCallSocket {
    fn write(&mut self, args: WriteArgs<'_>) -> WriteResult {
        let end = args.buf.end_pos();
        self.inputs.consume(&args);

        if self.inputs.closed && !self.invoked {
            self.invoked = true;
            match (self.handler)(&self.tables, &self.inputs.complete) {
                Ok(outputs) => {
                    for out in outputs {
                        self.outputs.push_arg(out);
                    }
                }
                Err(err) => {
                    error!(self.log, "call failed: {}", err);
                }
            }
            self.outputs.close();
        }

        WriteResult::new(args.status, end)
    }

    fn on_write_done(&mut self, result: WriteResult) -> WriteArgs<'_> {
        if !self.invoked {
            return WriteArgs::busy();
        }
        self.outputs.acknowledge(result.end);
        self.outputs.offer()
    }
}

/// Application-side view of an in-flight client call.
pub struct CallBuffers {
    /// Completed input argument groups, in local form, pushed by the app.
    pub input: Vec<Vec<u8>>,
    /// The app wrote all inputs.
    pub input_closed: bool,
    /// Completed output argument groups, in local form.
    pub output: Vec<Vec<u8>>,
    /// The callee closed the call.
    pub done: bool,
    pub status: Status,
}

impl CallBuffers {
    pub fn new() -> Rc<RefCell<CallBuffers>> {
        Rc::new(RefCell::new(CallBuffers {
            input: Vec::new(),
            input_closed: false,
            output: Vec::new(),
            done: false,
            status: Status::Ok,
        }))
    }
}

/// Caller-side socket of a client call. Turns the app's local-form argument
/// groups into the wire-form stream the protocol pulls (`on_write_done`),
/// and the protocol's response stream back into local-form outputs
/// (`write`).
///
/// The first input argument is the 8-byte object handle; it selects the
/// remote endpoint and is not itself transmitted.
pub struct ClientCallDispatcher {
    log: Logger,
    tables: Rc<ServerTables>,
    inputs: Vec<ArgInfo>,
    outputs: Vec<ArgInfo>,
    expects_handle: bool,
    handle: Option<ObjectHandle>,
    buffers: Rc<RefCell<CallBuffers>>,
    /// Wire-form input stream being served to the protocol.
    tx: ArgStream,
    /// How many app input groups were already drained into `tx`.
    drained: usize,
    /// Accumulates the current wire-form output group.
    rx: ArgCollector,
    transcoded_out: usize,
}

impl ClientCallDispatcher {
    pub fn new(
        log: &Logger,
        tables: Rc<ServerTables>,
        inputs: Vec<ArgInfo>,
        outputs: Vec<ArgInfo>,
        expects_handle: bool,
        buffers: Rc<RefCell<CallBuffers>>,
    ) -> ClientCallDispatcher {
        ClientCallDispatcher {
            log: log.new(o!()),
            tables,
            inputs,
            outputs,
            expects_handle,
            handle: None,
            buffers,
            tx: ArgStream::new(),
            drained: 0,
            rx: ArgCollector::new(),
            transcoded_out: 0,
        }
    }

    /// The object handle captured from the first input group, once the app
    /// has written it.
    pub fn handle(&self) -> Option<ObjectHandle> {
        self.handle
    }

    /// Pulls newly completed app input groups into the wire-form stream,
    /// transcoding arguments whose codec requires it.
    fn drain_inputs(&mut self) {
        let (new_groups, input_closed) = {
            let buffers = self.buffers.borrow();
            (buffers.input[self.drained..].to_vec(), buffers.input_closed)
        };

        for group in new_groups {
            let mut arg_no = self.drained;
            self.drained += 1;

            if self.expects_handle && arg_no == 0 {
                if group.len() >= 8 {
                    self.handle = Some(ObjectHandle::from_raw(LittleEndian::read_u64(&group)));
                } else {
                    error!(self.log, "malformed object handle");
                }
                continue;
            }
            if self.expects_handle {
                arg_no -= 1;
            }

            let mut wire = group;
            if let Some(transcoder) =
                self.inputs.get(arg_no).and_then(|a| a.transcoder(false))
            {
                if !transcoder.transcode(self.tables.as_ref(), &mut wire) {
                    error!(self.log, "input transcode failed"; "arg" => arg_no);
                    wire = Vec::new();
                }
            }
            self.tx.push_arg(wire);
        }

        if input_closed && !self.tx.closed {
            self.tx.close();
        }
    }
}

impl Socket for ClientCallDispatcher {
    /// Receives response data from the protocol.
    fn write(&mut self, args: WriteArgs<'_>) -> WriteResult {
        let end = args.buf.end_pos();
        let status = args.status;
        self.rx.consume(&args);

        // transcode and publish completed output groups
        while self.transcoded_out < self.rx.complete.len() {
            let mut group = self.rx.complete[self.transcoded_out].clone();
            if let Some(transcoder) = self
                .outputs
                .get(self.transcoded_out)
                .and_then(|a| a.transcoder(true))
            {
                if !transcoder.transcode(self.tables.as_ref(), &mut group) {
                    error!(self.log, "output transcode failed"; "arg" => self.transcoded_out);
                    group = Vec::new();
                }
            }
            self.buffers.borrow_mut().output.push(group);
            self.transcoded_out += 1;
        }

        if status.is_terminal() {
            let mut buffers = self.buffers.borrow_mut();
            buffers.done = true;
            buffers.status = if status == Status::Closed {
                Status::Ok
            } else {
                status
            };
        }

        WriteResult::new(status, end)
    }

    /// Serves the wire-form input stream to the protocol.
    fn on_write_done(&mut self, result: WriteResult) -> WriteArgs<'_> {
        self.drain_inputs();
        self.tx.acknowledge(result.end);
        self.tx.offer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServerTablesBuilder;
    use crate::logging;

    fn empty_tables() -> Rc<ServerTables> {
        Rc::new(ServerTablesBuilder::new("test").finish())
    }

    fn adder() -> SyncFunction {
        SyncFunction::new(
            FunctionInfo {
                name: "add".to_string(),
                inputs: vec![ArgInfo::new("a", "uint32"), ArgInfo::new("b", "uint32")],
                outputs: vec![ArgInfo::new("sum", "uint32")],
            },
            Rc::new(|_tables, args| {
                let a = LittleEndian::read_u32(&args[0]);
                let b = LittleEndian::read_u32(&args[1]);
                Ok(vec![(a + b).to_le_bytes().to_vec()])
            }),
        )
    }

    fn write_args<'a>(chunks: Vec<Chunk<'a>>, status: Status) -> WriteArgs<'a> {
        WriteArgs::new(BufChain::from_chunks(chunks), status)
    }

    #[test]
    fn test_sync_function_runs_on_closing_write() {
        let tables = empty_tables();
        let func = adder();
        let mut call = func.start_call(&tables, &logging::discard());

        let a = 3u32.to_le_bytes();
        let b = 4u32.to_le_bytes();
        let result = call.write(write_args(
            vec![
                Chunk::buf(0, &a),
                Chunk::frame_boundary(0),
                Chunk::buf(0, &b),
                Chunk::frame_boundary(0),
            ],
            Status::Closed,
        ));
        assert_eq!(result.status, Status::Closed);

        // pull the outputs
        let out = call.on_write_done(WriteResult::new(Status::Ok, ChainPos::default()));
        assert_eq!(out.status, Status::Closed);
        let chunks: Vec<_> = out.buf.iter().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].bytes(), &7u32.to_le_bytes());
        assert!(chunks[1].is_frame_boundary());
    }

    #[test]
    fn test_sync_function_output_partial_consumption() {
        let tables = empty_tables();
        let func = adder();
        let mut call = func.start_call(&tables, &logging::discard());

        let a = 10u32.to_le_bytes();
        let b = 20u32.to_le_bytes();
        call.write(write_args(
            vec![
                Chunk::buf(0, &a),
                Chunk::frame_boundary(0),
                Chunk::buf(0, &b),
                Chunk::frame_boundary(0),
            ],
            Status::Closed,
        ));

        // consumer takes only 2 bytes of the 4-byte output
        let out = call.on_write_done(WriteResult::new(Status::Ok, ChainPos::default()));
        assert_eq!(out.buf.n_bytes(), 4);
        drop(out);

        let out = call.on_write_done(WriteResult::new(Status::Ok, ChainPos::new(0, 2)));
        let chunks: Vec<_> = out.buf.iter().collect();
        assert_eq!(chunks[0].bytes(), &30u32.to_le_bytes()[2..]);
        drop(out);

        // rest consumed: stream runs dry
        let out = call.on_write_done(WriteResult::new(Status::Closed, ChainPos::new(2, 0)));
        assert!(out.buf.is_empty());
        assert_eq!(out.status, Status::Closed);
    }

    #[test]
    fn test_sync_function_before_inputs_complete_is_busy() {
        let tables = empty_tables();
        let func = adder();
        let mut call = func.start_call(&tables, &logging::discard());

        let a = 1u32.to_le_bytes();
        call.write(write_args(
            vec![Chunk::buf(0, &a), Chunk::frame_boundary(0)],
            Status::Ok,
        ));

        let out = call.on_write_done(WriteResult::new(Status::Ok, ChainPos::default()));
        assert!(out.is_busy());
    }

    #[test]
    fn test_interface_attribute_navigation() {
        let axis = ObjectHandle::from_index(1);
        let intf = StaticInterface::new(InterfaceInfo {
            name: "root".to_string(),
            attributes: vec![AttrInfo {
                name: "axis0".to_string(),
                object: axis,
            }],
            functions: vec![0],
        });

        assert_eq!(intf.info().name, "root");
        assert_eq!(intf.get_attribute(0), Some(axis));
        assert_eq!(intf.get_attribute(1), None);
    }

    #[test]
    fn test_dispatcher_captures_handle_and_streams_inputs() {
        let tables = empty_tables();
        let buffers = CallBuffers::new();
        let mut dispatcher = ClientCallDispatcher::new(
            &logging::discard(),
            tables,
            vec![ArgInfo::new("value", "uint32")],
            vec![ArgInfo::new("result", "uint32")],
            true,
            buffers.clone(),
        );

        {
            let mut b = buffers.borrow_mut();
            b.input
                .push(ObjectHandle::from_index(2).to_raw().to_le_bytes().to_vec());
            b.input.push(5u32.to_le_bytes().to_vec());
            b.input_closed = true;
        }

        let out = dispatcher.on_write_done(WriteResult::new(Status::Ok, ChainPos::default()));
        assert_eq!(out.status, Status::Closed);
        let chunks: Vec<_> = out.buf.iter().collect();
        // the handle was captured, only the value argument is on the wire
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].bytes(), &5u32.to_le_bytes());
        drop(out);

        assert_eq!(dispatcher.handle(), Some(ObjectHandle::from_index(2)));
    }

    #[test]
    fn test_dispatcher_collects_outputs() {
        let tables = empty_tables();
        let buffers = CallBuffers::new();
        let mut dispatcher = ClientCallDispatcher::new(
            &logging::discard(),
            tables,
            vec![],
            vec![ArgInfo::new("result", "uint32")],
            false,
            buffers.clone(),
        );

        let payload = 99u32.to_le_bytes();
        let result = dispatcher.write(write_args(
            vec![Chunk::buf(0, &payload), Chunk::frame_boundary(0)],
            Status::Closed,
        ));
        assert_eq!(result.status, Status::Closed);

        let b = buffers.borrow();
        assert!(b.done);
        assert_eq!(b.status, Status::Ok);
        assert_eq!(b.output, vec![99u32.to_le_bytes().to_vec()]);
    }

    #[test]
    fn test_dispatcher_transcodes_endpoint_ref_output() {
        let mut builder = ServerTablesBuilder::new("test");
        let obj = builder.add_object("motor", 0, 9);
        let tables = Rc::new(builder.finish());
        let json_crc = tables.json.crc;

        let buffers = CallBuffers::new();
        let mut dispatcher = ClientCallDispatcher::new(
            &logging::discard(),
            tables,
            vec![],
            vec![ArgInfo::new("obj", "endpoint_ref")],
            false,
            buffers.clone(),
        );

        // wire form: (ep_num, json_crc) of the known object
        let mut payload = Vec::new();
        payload.extend_from_slice(&9u16.to_le_bytes());
        payload.extend_from_slice(&json_crc.to_le_bytes());
        dispatcher.write(write_args(
            vec![Chunk::buf(0, &payload), Chunk::frame_boundary(0)],
            Status::Closed,
        ));

        let b = buffers.borrow();
        let raw = LittleEndian::read_u64(&b.output[0]);
        assert_eq!(ObjectHandle::from_raw(raw), obj);
    }
}
