//! Demo node: exports a couple of functions and properties over the UDP
//! transport. Peers can fetch the JSON descriptor through endpoint 0 and
//! invoke the exported functions through the endpoint-addressed protocol.

use byteorder::{ByteOrder, LittleEndian};
use std::rc::Rc;
use std::time::Duration;

use fibre::config::NodeConfig;
use fibre::connection::OutputSlotId;
use fibre::domain::{ConnKey, Domain, NodeId, ServerTables, ServerTablesBuilder};
use fibre::endpoint::table::EndpointEntry;
use fibre::function::{ArgInfo, FunctionInfo, SyncFunction};
use fibre::logging::{self, info, Logger};
use fibre::multiplexer::{FrameStreamSink, Multiplexer};
use fibre::transport::udp::UdpTransport;

const DEFAULT_BIND: &str = "0.0.0.0:9910";

fn build_tables() -> ServerTables {
    let mut builder = ServerTablesBuilder::new("fibre-demo");

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
        Rc::new(|_tables, args| {
            let a = LittleEndian::read_u32(&args[1]);
            let b = LittleEndian::read_u32(&args[2]);
            Ok(vec![a.wrapping_add(b).to_le_bytes().to_vec()])
        }),
    );
    let add_id = builder.add_function(Box::new(add));

    let vbus = SyncFunction::new(
        FunctionInfo {
            name: "get_vbus_voltage".to_string(),
            inputs: vec![ArgInfo::new("obj", "uint8")],
            outputs: vec![ArgInfo::new("value", "float")],
        },
        Rc::new(|_tables, _args| Ok(vec![24.0f32.to_bits().to_le_bytes().to_vec()])),
    );
    let vbus_id = builder.add_function(Box::new(vbus));

    builder.add_object("root", 0, 1);

    // ep 1: add trigger, ep 2+3: inputs, ep 4: output
    builder.add_endpoint(EndpointEntry::FunctionTrigger {
        function_id: add_id,
        object_id: 0,
    });
    builder.add_endpoint(EndpointEntry::FunctionInput { size: 4 });
    builder.add_endpoint(EndpointEntry::FunctionInput { size: 4 });
    builder.add_endpoint(EndpointEntry::FunctionOutput { size: 4 });
    // ep 5: vbus voltage as a read-only property
    builder.add_endpoint(EndpointEntry::RoProperty {
        object_id: 0,
        read_function_id: vbus_id,
    });

    builder.finish()
}

fn node_id_from_args(log: &Logger) -> NodeId {
    // a stable-but-unique id would come from hardware; the demo derives one
    // from the pid
    let pid = std::process::id();
    let mut id = [0x5au8; 16];
    id[..4].copy_from_slice(&pid.to_le_bytes());
    info!(log, "node id derived"; "pid" => pid);
    NodeId(id)
}

fn main() {
    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => NodeConfig::load(path).expect("failed to load configuration"),
        None => NodeConfig::default(),
    };

    let log = logging::init();
    let node_id = node_id_from_args(&log);

    let mut domain = Domain::new(&log, config, build_tables());
    let mut transport =
        UdpTransport::bind(&log, DEFAULT_BIND, node_id).expect("failed to bind socket");

    info!(log, "listening"; "addr" => %transport.local_addr().unwrap());

    let mut slots: Vec<(ConnKey, OutputSlotId)> = Vec::new();
    let mut mux: Multiplexer<(ConnKey, OutputSlotId)> = Multiplexer::new();

    loop {
        transport.poll_once(Duration::from_millis(100), &mut domain);

        // make sure every open connection has an output slot on this
        // transport
        for (addr, key) in transport.open_connections() {
            if !slots.iter().any(|(k, _)| *k == key) {
                // the hello handshake established the peer's identity
                let peer = match transport.peer_node(&addr) {
                    Some(peer) => peer,
                    None => continue,
                };
                let backend = match transport.open_output_slot(&peer) {
                    Some(backend) => backend,
                    None => continue,
                };
                if let Some(conn) = domain.connection_mut(key) {
                    let slot = conn.open_tx_slot(backend);
                    slots.push((key, slot));
                }
            }
        }

        // register every slot that has a frame to contribute, then let the
        // multiplexer hand them to the transport one frame at a time
        for &(key, slot) in &slots {
            if let Some(conn) = domain.connection_mut(key) {
                if conn.slot_has_data(slot) {
                    mux.add_source((key, slot));
                }
            }
        }

        while let Some((key, slot)) = mux.pop_source() {
            let conn = match domain.connection_mut(key) {
                Some(conn) => conn,
                None => continue,
            };
            if !conn.slot_has_data(slot) {
                continue;
            }

            let consumed = {
                let task = conn.build_task(slot);
                let mut tasks = [task];
                transport.start_write(&mut tasks)
            };
            match consumed {
                Some(end) => {
                    conn.release_task(slot, end);
                    if conn.slot_has_data(slot) {
                        mux.add_source((key, slot));
                    }
                }
                None => {
                    // transport refused the frame; try again next tick
                    conn.release_task(slot, fibre::chunk::ChainPos::default());
                }
            }
        }

        slots.retain(|(key, _)| domain.connection_mut(*key).is_some());
    }
}
