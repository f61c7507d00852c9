//! UDP transport: one Fibre frame per datagram, non-blocking via a mio
//! poll. Useful for loopback testing and LAN demos.
//!
//! Peers announce themselves with a hello frame (a single layer-0 buf
//! carrying their 16-byte node id); data frames use the same record layout
//! as the CAN adapter: routing info (protocol selector + call id) on
//! layer 1, connection payload above, shifted down two layers on delivery.

use hashbrown::HashMap;
use mio::net::UdpSocket;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::can::low_level;
use crate::chunk::{BufChain, ChainPos, Chunk};
use crate::connection::TxTask;
use crate::domain::{CallId, ConnKey, Domain, NodeId};
use crate::logging::{debug, error, o, trace, warn, Logger};
use crate::multiplexer::FrameStreamSink;
use crate::status::RichResult;

const SOCKET_TOKEN: Token = Token(0);
const MAX_DATAGRAM: usize = 1452;

/// Call-stream decode state per remote peer.
struct PeerContext {
    node: NodeId,
    routing_info: [u8; 17],
    routing_offset: usize,
    call_id: Option<CallId>,
    handler: Option<ConnKey>,
}

impl PeerContext {
    fn new(node: NodeId) -> PeerContext {
        PeerContext {
            node,
            routing_info: [0; 17],
            routing_offset: 0,
            call_id: None,
            handler: None,
        }
    }

    fn reset_at(&mut self, domain: &mut Domain, layer: u8) {
        if layer <= 1 {
            self.routing_offset = 0;
        }
        if layer == 0 {
            if let Some(call_id) = self.call_id.take() {
                domain.close_call(&call_id);
            }
            self.handler = None;
        }
    }
}

pub struct UdpTransport {
    log: Logger,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    node_id: NodeId,
    peers: HashMap<SocketAddr, PeerContext>,
    /// Destination address per back-end output slot.
    tx_slots: Vec<Option<SocketAddr>>,
    recv_buf: [u8; MAX_DATAGRAM],
}

impl UdpTransport {
    pub fn bind(log: &Logger, addr: &str, node_id: NodeId) -> RichResult<UdpTransport> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| rich_err!("invalid address {}: {}", addr, e))?;
        let socket =
            UdpSocket::bind(&addr).map_err(|e| rich_err!("bind failed: {}", e))?;
        let poll = Poll::new().map_err(|e| rich_err!("poll creation failed: {}", e))?;
        poll.register(&socket, SOCKET_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(|e| rich_err!("socket registration failed: {}", e))?;

        Ok(UdpTransport {
            log: log.new(o!()),
            socket,
            poll,
            events: Events::with_capacity(64),
            node_id,
            peers: HashMap::new(),
            tx_slots: Vec::new(),
            recv_buf: [0; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Announces this node to a peer.
    pub fn send_hello(&mut self, peer: &SocketAddr) {
        let id = self.node_id;
        let chain = BufChain::from_chunks(vec![Chunk::buf(0, &id.0)]);
        let mut frame = [0u8; 64];
        let (_, len) = low_level::pack(&chain, None, &mut frame);
        if let Err(err) = self.socket.send_to(&frame[..len], peer) {
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(self.log, "hello failed: {}", err);
            }
        }
    }

    /// Drains readable datagrams into the domain. Returns after `timeout`
    /// with no traffic.
    pub fn poll_once(&mut self, timeout: Duration, domain: &mut Domain) {
        self.poll
            .poll(&mut self.events, Some(timeout))
            .expect("udp poll failed");

        let mut ready = false;
        for event in &self.events {
            if event.token() == SOCKET_TOKEN && event.readiness().is_readable() {
                ready = true;
            }
        }
        if !ready {
            return;
        }

        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, addr)) => {
                    let data: Vec<u8> = self.recv_buf[..len].to_vec();
                    self.process_datagram(&data, addr, domain);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(self.log, "recv failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Decodes one datagram: hello frames establish the peer, everything
    /// else is routed into the peer's call stream.
    pub fn process_datagram(&mut self, data: &[u8], addr: SocketAddr, domain: &mut Domain) {
        let (reset, mut chain) = match low_level::unpack(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(self.log, "undecodable datagram from {}: {}", addr, err);
                return;
            }
        };

        // hello: exactly one layer-0 buf of 16 bytes
        if chain.n_chunks() == 1 {
            if let Some(chunk) = chain.front() {
                if chunk.is_buf() && chunk.layer() == 0 && chunk.len() == 16 {
                    let mut id = [0u8; 16];
                    id.copy_from_slice(chunk.bytes());
                    let node = NodeId(id);
                    debug!(self.log, "hello from {}", addr);
                    domain.on_found_node(node);
                    self.peers
                        .entry(addr)
                        .or_insert_with(|| PeerContext::new(node));
                    return;
                }
            }
        }

        let ctx = match self.peers.get_mut(&addr) {
            Some(ctx) => ctx,
            None => {
                trace!(self.log, "datagram from unknown peer {}", addr);
                return;
            }
        };

        if let Some(layer) = reset {
            ctx.reset_at(domain, layer);
        }

        while let Some(chunk) = chain.front() {
            if chunk.layer() <= 1 && chunk.is_frame_boundary() {
                ctx.reset_at(domain, chunk.layer());
                chain.skip_chunks(1);
            } else if chunk.layer() == 0 {
                chain.skip_chunks(1);
            } else if chunk.layer() == 1 {
                let n_copy = (ctx.routing_info.len() - ctx.routing_offset).min(chunk.len());
                ctx.routing_info[ctx.routing_offset..ctx.routing_offset + n_copy]
                    .copy_from_slice(&chunk.bytes()[..n_copy]);
                ctx.routing_offset += n_copy;

                if ctx.routing_offset >= 17 && ctx.handler.is_none() {
                    let protocol = ctx.routing_info[0];
                    if protocol <= 0x01 {
                        let mut call_id = [0u8; 16];
                        call_id.copy_from_slice(&ctx.routing_info[1..17]);
                        ctx.call_id = Some(call_id);
                        ctx.handler = Some(domain.open_call(call_id, protocol, ctx.node));
                    } else {
                        warn!(self.log, "unknown protocol selector"; "selector" => protocol);
                    }
                }
                chain.skip_chunks(1);
            } else {
                let until = chain
                    .iter()
                    .position(|c| c.layer() <= 1)
                    .unwrap_or_else(|| chain.n_chunks());
                let payload = chain.until(until).elevated(-2);

                if let Some(key) = ctx.handler {
                    domain.process_inbound(key, payload);
                } else {
                    trace!(self.log, "payload for unresolved call, discarded");
                }

                chain.skip_chunks(until);
            }
        }
    }

    /// The node id a peer address announced in its hello.
    pub fn peer_node(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.peers.get(addr).map(|ctx| ctx.node)
    }

    /// Connections opened by inbound traffic, with the peer they belong to.
    pub fn open_connections(&self) -> Vec<(SocketAddr, ConnKey)> {
        self.peers
            .iter()
            .filter_map(|(addr, ctx)| ctx.handler.map(|key| (*addr, key)))
            .collect()
    }
}

impl FrameStreamSink for UdpTransport {
    fn open_output_slot(&mut self, dest: &NodeId) -> Option<u64> {
        let addr = self
            .peers
            .iter()
            .find(|(_, ctx)| ctx.node == *dest)
            .map(|(addr, _)| *addr)?;

        let key = match self.tx_slots.iter().position(|s| s.is_none()) {
            Some(at) => {
                self.tx_slots[at] = Some(addr);
                at
            }
            None => {
                self.tx_slots.push(Some(addr));
                self.tx_slots.len() - 1
            }
        };
        Some(key as u64)
    }

    fn close_output_slot(&mut self, slot_id: u64) -> bool {
        match self.tx_slots.get_mut(slot_id as usize) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    fn start_write(&mut self, tasks: &mut [TxTask<'_>]) -> Option<ChainPos> {
        let task = tasks.first_mut()?;
        let addr = *self
            .tx_slots
            .get(task.backend_slot as usize)
            .and_then(|s| s.as_ref())?;

        let chain = task.chain();
        let mut frame = [0u8; MAX_DATAGRAM];
        let (consumed, len) = low_level::pack(&chain, None, &mut frame);
        if consumed == ChainPos::default() {
            return None;
        }

        match self.socket.send_to(&frame[..len], &addr) {
            Ok(_) => Some(consumed),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                error!(self.log, "send failed: {}", err);
                None
            }
        }
    }

    fn cancel_write(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::domain::ServerTablesBuilder;
    use crate::logging;

    fn domain() -> Domain {
        Domain::new(
            &logging::discard(),
            NodeConfig::default(),
            ServerTablesBuilder::new("udp-node").finish(),
        )
    }

    #[test]
    fn test_hello_registers_peer() {
        let log = logging::discard();
        let mut a = UdpTransport::bind(&log, "127.0.0.1:0", NodeId([1; 16])).unwrap();
        let b = UdpTransport::bind(&log, "127.0.0.1:0", NodeId([2; 16])).unwrap();
        let b_addr = b.local_addr().unwrap();
        let mut dom = domain();

        // decode b's hello frame directly (no network round trip needed to
        // exercise the path)
        let id = NodeId([2; 16]);
        let chain = BufChain::from_chunks(vec![Chunk::buf(0, &id.0)]);
        let mut frame = [0u8; 64];
        let (_, len) = low_level::pack(&chain, None, &mut frame);
        a.process_datagram(&frame[..len], b_addr, &mut dom);

        assert!(dom.node(&NodeId([2; 16])).is_some());
        assert!(a.open_output_slot(&NodeId([2; 16])).is_some());
    }

    #[test]
    fn test_datagram_opens_call_stream() {
        let log = logging::discard();
        let mut a = UdpTransport::bind(&log, "127.0.0.1:0", NodeId([1; 16])).unwrap();
        let peer_addr: SocketAddr = "127.0.0.1:49152".parse().unwrap();
        let mut dom = domain();

        // hello
        let id = NodeId([2; 16]);
        let chain = BufChain::from_chunks(vec![Chunk::buf(0, &id.0)]);
        let mut frame = [0u8; 64];
        let (_, len) = low_level::pack(&chain, None, &mut frame);
        a.process_datagram(&frame[..len], peer_addr, &mut dom);

        // routing info for a new call stream
        let mut routing = [0x77u8; 17];
        routing[0] = 0x00;
        let chain = BufChain::from_chunks(vec![
            Chunk::buf(1, &routing),
            Chunk::frame_boundary(1),
        ]);
        let (_, len) = low_level::pack(&chain, None, &mut frame);
        a.process_datagram(&frame[..len], peer_addr, &mut dom);

        assert!(dom.call_key(&[0x77; 16]).is_some());
        assert_eq!(a.open_connections().len(), 1);
    }

    #[test]
    fn test_unknown_peer_data_is_dropped() {
        let log = logging::discard();
        let mut a = UdpTransport::bind(&log, "127.0.0.1:0", NodeId([1; 16])).unwrap();
        let peer_addr: SocketAddr = "127.0.0.1:49153".parse().unwrap();
        let mut dom = domain();

        let payload = [1u8; 4];
        let chain = BufChain::from_chunks(vec![Chunk::buf(2, &payload)]);
        let mut frame = [0u8; 64];
        let (_, len) = low_level::pack(&chain, None, &mut frame);
        a.process_datagram(&frame[..len], peer_addr, &mut dom);

        assert!(a.open_connections().is_empty());
    }
}
