//! The domain is the scope within which nodes, endpoints and objects are
//! named. It owns the server tables (exported objects and functions, the
//! endpoint table and the embedded JSON descriptor), the node table, and
//! the per-node connections keyed by 16-byte call ids.

use hashbrown::HashMap;
use serde_json::json;
use std::rc::Rc;

use crate::chunk::BufChain;
use crate::codec::EndpointRef;
use crate::config::NodeConfig;
use crate::connection::{Connection, InputSlotId};
use crate::endpoint::server::EndpointServerConnection;
use crate::endpoint::table::EndpointEntry;
use crate::function::Function;
use crate::legacy::crc::crc16;
use crate::logging::{debug, o, Logger};
use crate::status::RichResult;
use crate::PROTOCOL_VERSION;

/// A Fibre peer, identified by 16 bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(pub [u8; 16]);

/// Identifies one call stream between two nodes.
pub type CallId = [u8; 16];

/// An arena index for a locally known object. The null handle refers to no
/// object and encodes as the zero `(ep_num, json_crc)` pair on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle(0);

    #[inline]
    pub fn from_index(index: usize) -> ObjectHandle {
        ObjectHandle(index as u64 + 1)
    }

    #[inline]
    pub fn index(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0 as usize - 1)
        }
    }

    #[inline]
    pub fn from_raw(raw: u64) -> ObjectHandle {
        ObjectHandle(raw)
    }

    #[inline]
    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Resolves object handles to wire references and back. The `endpoint_ref`
/// transcoder runs against this.
pub trait ObjectLookup {
    /// The locally known object with the given `(ep_num, json_crc)` pair, or
    /// the null handle.
    fn object_by_ref(&self, ep_num: u16, json_crc: u16) -> ObjectHandle;

    /// The wire reference of a handle. `None` for the null handle or an
    /// unknown index.
    fn ref_of(&self, handle: ObjectHandle) -> Option<EndpointRef>;
}

#[derive(Debug, Clone)]
pub struct ServerObject {
    pub name: String,
    pub interface_id: u16,
    /// The object's property/trigger anchor in the endpoint table.
    pub ep_num: u16,
}

/// The embedded JSON interface descriptor, served via endpoint 0.
#[derive(Debug, Clone)]
pub struct JsonDescriptor {
    pub bytes: Vec<u8>,
    /// CRC-16 over the descriptor bytes, seeded with the protocol version.
    /// Used as the trailer on all non-zero endpoints.
    pub crc: u16,
    /// 32-bit id served for offset 0xFFFFFFFF.
    pub version_id: u32,
}

/// Process-wide constant tables: exported functions and objects, the legacy
/// endpoint table and the JSON descriptor. Produced once at startup and
/// shared read-only with every connection.
pub struct ServerTables {
    pub functions: Vec<Box<dyn Function>>,
    pub objects: Vec<ServerObject>,
    pub endpoints: Vec<EndpointEntry>,
    pub json: JsonDescriptor,
}

impl ServerTables {
    pub fn get_function(&self, id: u16) -> Option<&dyn Function> {
        self.functions.get(id as usize).map(|f| f.as_ref())
    }

    pub fn endpoint(&self, id: u16) -> Option<&EndpointEntry> {
        self.endpoints.get(id as usize)
    }
}

impl ObjectLookup for ServerTables {
    fn object_by_ref(&self, ep_num: u16, json_crc: u16) -> ObjectHandle {
        if json_crc != self.json.crc {
            return ObjectHandle::NULL;
        }
        for (i, obj) in self.objects.iter().enumerate() {
            if obj.ep_num == ep_num {
                return ObjectHandle::from_index(i);
            }
        }
        ObjectHandle::NULL
    }

    fn ref_of(&self, handle: ObjectHandle) -> Option<EndpointRef> {
        let obj = self.objects.get(handle.index()?)?;
        Some(EndpointRef {
            ep_num: obj.ep_num,
            json_crc: self.json.crc,
        })
    }
}

pub struct ServerTablesBuilder {
    name: String,
    functions: Vec<Box<dyn Function>>,
    objects: Vec<ServerObject>,
    endpoints: Vec<EndpointEntry>,
}

impl ServerTablesBuilder {
    pub fn new(name: &str) -> ServerTablesBuilder {
        ServerTablesBuilder {
            name: name.to_string(),
            functions: Vec::new(),
            objects: Vec::new(),
            // endpoint 0 serves the JSON descriptor
            endpoints: vec![EndpointEntry::Json],
        }
    }

    pub fn add_function(&mut self, function: Box<dyn Function>) -> u16 {
        self.functions.push(function);
        (self.functions.len() - 1) as u16
    }

    pub fn add_object(&mut self, name: &str, interface_id: u16, ep_num: u16) -> ObjectHandle {
        self.objects.push(ServerObject {
            name: name.to_string(),
            interface_id,
            ep_num,
        });
        ObjectHandle::from_index(self.objects.len() - 1)
    }

    pub fn add_endpoint(&mut self, entry: EndpointEntry) -> u16 {
        self.endpoints.push(entry);
        (self.endpoints.len() - 1) as u16
    }

    /// Assembles the JSON descriptor and freezes the tables. The descriptor
    /// is a JSON array so clients can probe its first byte cheaply.
    pub fn finish(self) -> ServerTables {
        let functions: Vec<_> = self
            .functions
            .iter()
            .map(|f| {
                let info = f.info();
                json!({
                    "name": info.name,
                    "inputs": info.inputs.iter().map(|a| json!({
                        "name": a.name,
                        "type": a.codec,
                    })).collect::<Vec<_>>(),
                    "outputs": info.outputs.iter().map(|a| json!({
                        "name": a.name,
                        "type": a.codec,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        let objects: Vec<_> = self
            .objects
            .iter()
            .map(|o| {
                json!({
                    "name": o.name,
                    "interface": o.interface_id,
                    "ep": o.ep_num,
                })
            })
            .collect();

        let descriptor = json!([{
            "name": self.name,
            "objects": objects,
            "functions": functions,
        }]);

        let bytes = serde_json::to_vec(&descriptor).expect("descriptor serialization");
        let crc = crc16(PROTOCOL_VERSION, &bytes);
        let version_id = ((bytes.len() as u32) << 16) ^ crc as u32;

        ServerTables {
            functions: self.functions,
            objects: self.objects,
            endpoints: self.endpoints,
            json: JsonDescriptor {
                bytes,
                crc,
                version_id,
            },
        }
    }
}

pub struct Node {
    pub id: NodeId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnKey(usize);

struct ConnectionEntry {
    call_id: CallId,
    conn: Connection,
    input_slot: InputSlotId,
    handler: EndpointServerConnection,
}

pub struct Domain {
    log: Logger,
    config: NodeConfig,
    tables: Rc<ServerTables>,
    nodes: HashMap<NodeId, Node>,
    connections: Vec<Option<ConnectionEntry>>,
    calls: HashMap<CallId, ConnKey>,
}

impl Domain {
    pub fn new(log: &Logger, config: NodeConfig, tables: ServerTables) -> Domain {
        Domain {
            log: log.new(o!()),
            config,
            tables: Rc::new(tables),
            nodes: HashMap::new(),
            connections: Vec::new(),
            calls: HashMap::new(),
        }
    }

    #[inline]
    pub fn tables(&self) -> &Rc<ServerTables> {
        &self.tables
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Records a peer discovered by a transport adapter.
    pub fn on_found_node(&mut self, id: NodeId) -> &mut Node {
        debug!(self.log, "found node");
        self.nodes.entry(id).or_insert(Node { id })
    }

    /// Tears down a peer and every call stream associated with it.
    pub fn on_lost_node(&mut self, id: &NodeId) {
        debug!(self.log, "lost node");
        self.nodes.remove(id);
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Opens (or resumes) the call stream with the given id. A new stream
    /// gets a fresh connection with one input slot and a server-side
    /// endpoint handler.
    pub fn open_call(&mut self, call_id: CallId, protocol: u8, _node: NodeId) -> ConnKey {
        if let Some(&key) = self.calls.get(&call_id) {
            return key;
        }

        let mut conn = Connection::new(
            &self.log,
            &self.config.connection,
            protocol,
            call_id,
        );
        let input_slot = conn.open_rx_slot();
        let handler = EndpointServerConnection::new(&self.log, self.tables.clone());

        let entry = ConnectionEntry {
            call_id,
            conn,
            input_slot,
            handler,
        };

        let key = self
            .connections
            .iter()
            .position(|e| e.is_none())
            .unwrap_or_else(|| {
                self.connections.push(None);
                self.connections.len() - 1
            });
        self.connections[key] = Some(entry);
        self.calls.insert(call_id, ConnKey(key));
        debug!(self.log, "opened call");
        ConnKey(key)
    }

    pub fn close_call(&mut self, call_id: &CallId) {
        if let Some(key) = self.calls.remove(call_id) {
            self.connections[key.0] = None;
            debug!(self.log, "closed call");
        }
    }

    pub fn call_key(&self, call_id: &CallId) -> Option<ConnKey> {
        self.calls.get(call_id).copied()
    }

    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        self.connections
            .get_mut(key.0)?
            .as_mut()
            .map(|e| &mut e.conn)
    }

    /// Feeds inbound chunks into the connection's input slot and drains the
    /// RX fifo through the server-side endpoint handler. Returns false when
    /// the connection broke and was torn down.
    pub fn process_inbound(&mut self, key: ConnKey, chain: BufChain<'_>) -> bool {
        let entry = match self.connections.get_mut(key.0).and_then(|e| e.as_mut()) {
            Some(entry) => entry,
            None => return false,
        };

        entry.conn.process_sync(entry.input_slot, chain);
        entry.conn.pump_rx(&mut entry.handler);

        if entry.conn.is_broken() {
            let call_id = entry.call_id;
            self.close_call(&call_id);
            return false;
        }
        true
    }

    /// Re-drives a connection's RX handler and pending TX state. Called
    /// after acknowledgements freed fifo space.
    pub fn pump(&mut self, key: ConnKey) {
        if let Some(entry) = self.connections.get_mut(key.0).and_then(|e| e.as_mut()) {
            entry.conn.pump_rx(&mut entry.handler);
            let conn = &mut entry.conn;
            entry.handler.pump_tx(&mut conn.tx_port());
        }
    }
}

/// Splits a connection spec string of the form
/// `backend:key=value,key=value,…` into the backend name and its key-value
/// pairs.
pub fn parse_spec_string(spec: &str) -> RichResult<(&str, Vec<(&str, &str)>)> {
    let (backend, rest) = match spec.find(':') {
        Some(at) => (&spec[..at], &spec[at + 1..]),
        None => (spec, ""),
    };

    if backend.is_empty() {
        return Err(rich_err!("empty backend in spec string"));
    }

    let mut pairs = Vec::new();
    for part in rest.split(',').filter(|p| !p.is_empty()) {
        let at = part
            .find('=')
            .ok_or_else(|| rich_err!("malformed key-value pair: {}", part))?;
        pairs.push((&part[..at], &part[at + 1..]));
    }

    Ok((backend, pairs))
}
