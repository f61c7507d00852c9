//! Fibre-on-CAN. A Fibre frame becomes a 29-bit extended id plus up to 64
//! bytes of CAN-FD payload. Id layout (MSB to LSB): bit 28 discriminates
//! Fibre traffic, then 8-bit destination id, 8-bit receive-slot id, 8-bit
//! sender id. Node ids are acquired with a masterless scheme loosely
//! following CANopen LSS: a node probes a candidate id twice (acquisition
//! messages carry its 16-byte randomness so simultaneous claims collide on
//! the data field), defends an owned id with guard messages, and abandons
//! it when someone else shows up using it.

use hashbrown::HashMap;

use crate::can::low_level;
use crate::chunk::ChainPos;
use crate::connection::TxTask;
use crate::domain::{CallId, ConnKey, Domain, NodeId};
use crate::logging::{debug, error, o, trace, warn, Logger};
use crate::multiplexer::FrameStreamSink;

/// All Fibre traffic lives under this 29-bit id prefix.
const FIBRE_ID_PREFIX: u32 = 0x1e00_0000;
const FIBRE_ID_MASK: u32 = 0x1f00_0000;

/// Heartbeat and guard messages (dominant variant).
const HEARTBEAT_ID_BASE: u32 = 0x1eaa_aa00;
/// Node-id acquisition messages (recessive variant, loses arbitration
/// against guards).
const ACQUISITION_ID_BASE: u32 = 0x1eaa_ab00;
const SPECIAL_ID_MASK: u32 = 0x1fff_ff00;

/// Mailbox assignments on the CAN interface.
const MAILBOX_HEARTBEAT: usize = 0;
const MAILBOX_DATA: usize = 1;

const MAX_OUTPUT_SLOTS_PER_DEST: usize = 8;

/// Consecutive data-collision transmit failures before an operational node
/// gives its id up.
const MAX_TX_COLLISIONS: u32 = 3;

#[derive(Debug, Clone)]
pub struct CanMessage {
    pub id: u32,
    pub fd_frame: bool,
    pub len: u8,
    pub data: [u8; 64],
}

impl CanMessage {
    pub fn new(id: u32, payload: &[u8]) -> CanMessage {
        let mut data = [0u8; 64];
        data[..payload.len()].copy_from_slice(payload);
        CanMessage {
            id,
            fd_frame: true,
            len: payload.len() as u8,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// The transmit half of a CAN interface. Completion (including arbitration
/// loss and data collisions) is reported back through
/// `CanAdapter::on_msg_sent`.
pub trait CanInterface {
    fn send_message(&mut self, mailbox: usize, msg: &CanMessage) -> bool;
    fn cancel_message(&mut self, mailbox: usize);
}

/// What the adapter wants from the timer provider.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerRequest {
    None,
    /// One shot after the acquisition probe delay.
    AcquisitionDelay,
    /// Periodic heartbeat.
    Heartbeat,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    /// First acquisition probe sent, awaiting its outcome / the delay.
    Joining0,
    /// Second probe passed, heartbeating but not yet confirmed.
    Joining1,
    Operational,
}

/// Per-ingress-stream context: routing info assembly and the connection
/// input slot it resolved to.
struct RxSlotContext {
    routing_info: [u8; 17],
    routing_offset: usize,
    call_id: Option<CallId>,
    handler: Option<ConnKey>,
}

impl RxSlotContext {
    fn new() -> RxSlotContext {
        RxSlotContext {
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

struct TxContext {
    dest: NodeId,
    slot_id: u8,
}

pub struct CanAdapter {
    log: Logger,
    /// This node's 16-byte identity; the payload of heartbeats and
    /// acquisition probes.
    fibre_node_id: NodeId,
    candidates: Box<dyn Iterator<Item = u8>>,
    node_id: u8,
    state: State,
    sending_heartbeat: bool,
    tx_collisions: u32,
    timer_request: TimerRequest,

    /// CAN id to Fibre node, learned from heartbeats.
    routes: HashMap<u8, NodeId>,
    rx_slots: HashMap<(u8, u8), RxSlotContext>,
    tx_slots: Vec<Option<TxContext>>,

    /// A data frame is in flight.
    data_busy: bool,
    /// Frame prepared by `start_write`, waiting for `flush_data`.
    pending_data_msg: Option<CanMessage>,
}

impl CanAdapter {
    pub fn new(
        log: &Logger,
        fibre_node_id: NodeId,
        candidates: Box<dyn Iterator<Item = u8>>,
    ) -> CanAdapter {
        CanAdapter {
            log: log.new(o!()),
            fibre_node_id,
            candidates,
            node_id: 0,
            state: State::Joining0,
            sending_heartbeat: false,
            tx_collisions: 0,
            timer_request: TimerRequest::None,
            routes: HashMap::new(),
            rx_slots: HashMap::new(),
            tx_slots: Vec::new(),
            data_busy: false,
            pending_data_msg: None,
        }
    }

    /// Derives the default candidate-id sequence from the node's identity.
    pub fn seeded_candidates(fibre_node_id: &NodeId) -> Box<dyn Iterator<Item = u8>> {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&fibre_node_id.0);
        seed[16..].copy_from_slice(&fibre_node_id.0);
        let mut rng = SmallRng::from_seed(seed);
        Box::new(std::iter::from_fn(move || Some(rng.gen::<u8>())))
    }

    #[inline]
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    #[inline]
    pub fn is_operational(&self) -> bool {
        self.state == State::Operational
    }

    /// What the adapter currently wants its timer to do. The owner arms
    /// the timer accordingly and calls `on_timer` when it fires.
    #[inline]
    pub fn timer_request(&self) -> TimerRequest {
        self.timer_request
    }

    fn heartbeat_message(&self, dominant: bool) -> CanMessage {
        let base = if dominant {
            HEARTBEAT_ID_BASE
        } else {
            ACQUISITION_ID_BASE
        };
        CanMessage::new(base | self.node_id as u32, &self.fibre_node_id.0)
    }

    /// Begins (or restarts) node-id acquisition with the next candidate.
    pub fn start<I: CanInterface>(&mut self, intf: &mut I) {
        self.send_acquisition_0(intf);
    }

    fn send_acquisition_0<I: CanInterface>(&mut self, intf: &mut I) {
        trace!(self.log, "send acquisition probe 0");
        self.state = State::Joining0;
        self.node_id = self.candidates.next().expect("candidate sequence ended");
        self.sending_heartbeat = true;
        self.timer_request = TimerRequest::None;
        let msg = self.heartbeat_message(false);
        intf.send_message(MAILBOX_HEARTBEAT, &msg);
    }

    fn send_acquisition_1<I: CanInterface>(&mut self, intf: &mut I) {
        trace!(self.log, "send acquisition probe 1");
        self.sending_heartbeat = true;
        let msg = self.heartbeat_message(false);
        intf.send_message(MAILBOX_HEARTBEAT, &msg);
    }

    fn send_heartbeat<I: CanInterface>(&mut self, intf: &mut I) {
        debug!(self.log, "send heartbeat");
        self.sending_heartbeat = true;
        let msg = self.heartbeat_message(true);
        intf.send_message(MAILBOX_HEARTBEAT, &msg);
    }

    /// Timer callback: advances acquisition or emits the periodic
    /// heartbeat.
    pub fn on_timer<I: CanInterface>(&mut self, intf: &mut I) {
        if self.state == State::Joining0 {
            self.send_acquisition_1(intf);
        } else {
            self.send_heartbeat(intf);
        }
    }

    /// Completion callback for the heartbeat/acquisition mailbox.
    pub fn on_heartbeat_sent<I: CanInterface>(&mut self, intf: &mut I, success: bool) {
        self.sending_heartbeat = false;

        match self.state {
            State::Joining0 => {
                if self.timer_request == TimerRequest::None {
                    // outcome of probe 0
                    if success {
                        self.timer_request = TimerRequest::AcquisitionDelay;
                    } else {
                        self.send_acquisition_0(intf);
                    }
                } else {
                    // outcome of probe 1
                    if success {
                        self.state = State::Joining1;
                        self.timer_request = TimerRequest::Heartbeat;
                        self.send_heartbeat(intf);
                    } else {
                        self.send_acquisition_0(intf);
                    }
                }
            }
            State::Joining1 | State::Operational => {
                if success {
                    if self.state != State::Operational {
                        debug!(self.log, "now operational"; "node_id" => self.node_id);
                        self.state = State::Operational;
                    }
                    self.tx_collisions = 0;
                } else {
                    // possibly collided with another node's heartbeat;
                    // back off and pick a new id
                    self.send_acquisition_0(intf);
                }
            }
        }
    }

    /// Completion callback for the data mailbox.
    pub fn on_data_sent(&mut self, success: bool) {
        self.data_busy = false;
        if success {
            self.tx_collisions = 0;
        } else {
            warn!(self.log, "failed to send data frame");
            self.tx_collisions += 1;
        }
    }

    /// True when repeated data collisions require abandoning the id. The
    /// owner should call `start` again.
    pub fn must_restrain(&self) -> bool {
        self.tx_collisions >= MAX_TX_COLLISIONS
    }

    /// Inbound message dispatch.
    pub fn on_can_msg<I: CanInterface>(
        &mut self,
        intf: &mut I,
        msg: &CanMessage,
        domain: &mut Domain,
    ) {
        if msg.id & FIBRE_ID_MASK != FIBRE_ID_PREFIX {
            return;
        }

        if msg.id & SPECIAL_ID_MASK == ACQUISITION_ID_BASE {
            self.on_acquisition_msg(intf, msg);
        } else if msg.id & SPECIAL_ID_MASK == HEARTBEAT_ID_BASE {
            self.on_heartbeat_msg(intf, msg, domain);
        } else if self.state == State::Operational
            && (msg.id & 0x1f00_ff00) == (FIBRE_ID_PREFIX | ((self.node_id as u32) << 8))
        {
            self.on_data_msg(msg, domain);
        } else {
            trace!(self.log, "ignoring message not for me"; "id" => msg.id);
        }
    }

    fn on_acquisition_msg<I: CanInterface>(&mut self, intf: &mut I, msg: &CanMessage) {
        let claimed = (msg.id & 0xff) as u8;
        if claimed != self.node_id {
            return;
        }

        if self.state == State::Operational {
            // defend the owned id
            debug!(self.log, "defending node id"; "node_id" => self.node_id);
            let guard = CanMessage::new(HEARTBEAT_ID_BASE | self.node_id as u32, &[]);
            intf.send_message(MAILBOX_HEARTBEAT, &guard);
        } else if msg.payload() != self.fibre_node_id.0 {
            // another node is claiming the same tentative id with
            // different randomness: both must back off
            debug!(self.log, "acquisition collision, restarting");
            if self.sending_heartbeat {
                intf.cancel_message(MAILBOX_HEARTBEAT);
                self.sending_heartbeat = false;
            }
            self.send_acquisition_0(intf);
        }
    }

    fn on_heartbeat_msg<I: CanInterface>(
        &mut self,
        intf: &mut I,
        msg: &CanMessage,
        domain: &mut Domain,
    ) {
        let sender = (msg.id & 0xff) as u8;

        if sender == self.node_id {
            // someone else is using our id (or guarding against us)
            debug!(self.log, "node id conflict, restraining");
            if self.sending_heartbeat {
                intf.cancel_message(MAILBOX_HEARTBEAT);
                self.sending_heartbeat = false;
            }
            self.send_acquisition_0(intf);
            return;
        }

        if msg.len < 16 {
            if msg.len != 0 {
                warn!(self.log, "invalid heartbeat length"; "len" => msg.len);
            }
            // guard messages carry no payload and need no route update
            return;
        }

        let mut fibre_id = [0u8; 16];
        fibre_id.copy_from_slice(&msg.payload()[..16]);
        let fibre_id = NodeId(fibre_id);

        let known = self.routes.get(&sender).copied();
        if known == Some(fibre_id) {
            return; // already known
        }
        if let Some(stale) = known {
            // the CAN id was reassigned to a new Fibre node
            domain.on_lost_node(&stale);
        }
        debug!(self.log, "new route"; "can_id" => sender);
        self.routes.insert(sender, fibre_id);
        domain.on_found_node(fibre_id);
    }

    fn on_data_msg(&mut self, msg: &CanMessage, domain: &mut Domain) {
        let sender = (msg.id & 0xff) as u8;
        let slot_id = ((msg.id >> 16) & 0xff) as u8;

        let node = match self.routes.get(&sender) {
            Some(node) => *node,
            None => {
                warn!(self.log, "data from unknown CAN node"; "can_id" => sender);
                return;
            }
        };

        let (reset, mut chain) = match low_level::unpack(msg.payload()) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!(self.log, "failed to unpack message: {}", err);
                return;
            }
        };

        let ctx = self
            .rx_slots
            .entry((sender, slot_id))
            .or_insert_with(RxSlotContext::new);

        if let Some(layer) = reset {
            ctx.reset_at(domain, layer);
        }

        while let Some(chunk) = chain.front() {
            if chunk.layer() <= 1 && chunk.is_frame_boundary() {
                ctx.reset_at(domain, chunk.layer());
                chain.skip_chunks(1);
            } else if chunk.layer() == 0 {
                // nothing meaningful on layer 0 between frames
                chain.skip_chunks(1);
            } else if chunk.layer() == 1 {
                // routing info: protocol selector byte plus 16-byte call id
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
                        ctx.handler = Some(domain.open_call(call_id, protocol, node));
                    } else {
                        warn!(self.log, "unknown protocol selector"; "selector" => protocol);
                    }
                }
                chain.skip_chunks(1);
            } else {
                // connection-level payload: everything up to the next
                // routing chunk, shifted down to the connection's layers
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
}

impl FrameStreamSink for CanAdapter {
    fn open_output_slot(&mut self, dest: &NodeId) -> Option<u64> {
        let mut in_use = [false; MAX_OUTPUT_SLOTS_PER_DEST];
        for slot in self.tx_slots.iter().flatten() {
            if slot.dest == *dest {
                in_use[slot.slot_id as usize] = true;
            }
        }
        let slot_id = (0..MAX_OUTPUT_SLOTS_PER_DEST).find(|&i| !in_use[i])? as u8;

        let ctx = TxContext {
            dest: *dest,
            slot_id,
        };
        let key = match self.tx_slots.iter().position(|s| s.is_none()) {
            Some(at) => {
                self.tx_slots[at] = Some(ctx);
                at
            }
            None => {
                self.tx_slots.push(Some(ctx));
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
        if self.state != State::Operational || self.data_busy {
            return None;
        }

        let task = tasks.first_mut()?;
        let tx_slot = self
            .tx_slots
            .get(task.backend_slot as usize)
            .and_then(|s| s.as_ref())?;

        let dest_can_id = self
            .routes
            .iter()
            .find(|(_, node)| **node == tx_slot.dest)
            .map(|(can_id, _)| *can_id);
        let dest_can_id = match dest_can_id {
            Some(id) => id,
            None => {
                warn!(self.log, "no route to host");
                return None;
            }
        };

        let chain = task.chain();
        let mut payload = [0u8; 64];
        let (consumed, len) = low_level::pack(&chain, None, &mut payload);
        if consumed == ChainPos::default() {
            error!(self.log, "failed to pack message");
            return None;
        }

        let msg = CanMessage {
            id: FIBRE_ID_PREFIX
                | ((dest_can_id as u32) << 8)
                | ((tx_slot.slot_id as u32) << 16)
                | self.node_id as u32,
            fd_frame: true,
            len: len as u8,
            data: payload,
        };

        self.data_busy = true;
        self.pending_data_msg = Some(msg);
        Some(consumed)
    }

    fn cancel_write(&mut self) {
        self.data_busy = false;
        self.pending_data_msg = None;
    }
}

impl CanAdapter {
    /// Takes the frame prepared by `start_write` and hands it to the
    /// interface. Split out so `start_write` itself never needs the
    /// interface handle.
    pub fn flush_data<I: CanInterface>(&mut self, intf: &mut I) {
        if let Some(msg) = self.pending_data_msg.take() {
            trace!(self.log, "send data frame"; "len" => msg.len);
            intf.send_message(MAILBOX_DATA, &msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::domain::ServerTablesBuilder;
    use crate::logging;

    struct MockIntf {
        sent: Vec<(usize, CanMessage)>,
        cancelled: Vec<usize>,
    }

    impl MockIntf {
        fn new() -> MockIntf {
            MockIntf {
                sent: Vec::new(),
                cancelled: Vec::new(),
            }
        }

        fn take(&mut self) -> Vec<(usize, CanMessage)> {
            std::mem::take(&mut self.sent)
        }
    }

    impl CanInterface for MockIntf {
        fn send_message(&mut self, mailbox: usize, msg: &CanMessage) -> bool {
            self.sent.push((mailbox, msg.clone()));
            true
        }
        fn cancel_message(&mut self, mailbox: usize) {
            self.cancelled.push(mailbox);
        }
    }

    fn adapter(seed: u8, candidates: Vec<u8>) -> CanAdapter {
        CanAdapter::new(
            &logging::discard(),
            NodeId([seed; 16]),
            Box::new(candidates.into_iter()),
        )
    }

    fn domain() -> Domain {
        Domain::new(
            &logging::discard(),
            NodeConfig::default(),
            ServerTablesBuilder::new("can-node").finish(),
        )
    }

    /// Walks one node through the full acquisition handshake.
    fn bring_up<I: CanInterface>(node: &mut CanAdapter, intf: &mut I) {
        node.start(intf);
        node.on_heartbeat_sent(intf, true); // probe 0 on the bus
        assert_eq!(node.timer_request(), TimerRequest::AcquisitionDelay);
        node.on_timer(intf); // delay elapsed, probe 1
        node.on_heartbeat_sent(intf, true);
        assert_eq!(node.timer_request(), TimerRequest::Heartbeat);
        node.on_heartbeat_sent(intf, true); // first heartbeat confirmed
        assert!(node.is_operational());
    }

    #[test]
    fn test_acquisition_happy_path() {
        let mut node = adapter(1, vec![0x42]);
        let mut intf = MockIntf::new();

        bring_up(&mut node, &mut intf);

        assert_eq!(node.node_id(), 0x42);
        let sent = intf.take();
        // two recessive probes, then a dominant heartbeat
        assert_eq!(sent[0].1.id, ACQUISITION_ID_BASE | 0x42);
        assert_eq!(sent[1].1.id, ACQUISITION_ID_BASE | 0x42);
        assert_eq!(sent[2].1.id, HEARTBEAT_ID_BASE | 0x42);
        assert_eq!(sent[2].1.payload(), &[1u8; 16]);
    }

    #[test]
    fn test_simultaneous_claims_converge() {
        // two nodes pick the same candidate first; the data collision sends
        // both back to the start and they converge on their second choices
        let mut a = adapter(0xaa, vec![0x10, 0x20]);
        let mut b = adapter(0xbb, vec![0x10, 0x30]);
        let mut intf_a = MockIntf::new();
        let mut intf_b = MockIntf::new();

        a.start(&mut intf_a);
        b.start(&mut intf_b);
        assert_eq!(a.node_id(), 0x10);
        assert_eq!(b.node_id(), 0x10);

        // same arbitration id, different payloads: the bus reports a data
        // collision to both
        a.on_heartbeat_sent(&mut intf_a, false);
        b.on_heartbeat_sent(&mut intf_b, false);

        assert_eq!(a.node_id(), 0x20);
        assert_eq!(b.node_id(), 0x30);

        // both finish acquisition undisturbed now
        a.on_heartbeat_sent(&mut intf_a, true);
        a.on_timer(&mut intf_a);
        a.on_heartbeat_sent(&mut intf_a, true);
        a.on_heartbeat_sent(&mut intf_a, true);
        b.on_heartbeat_sent(&mut intf_b, true);
        b.on_timer(&mut intf_b);
        b.on_heartbeat_sent(&mut intf_b, true);
        b.on_heartbeat_sent(&mut intf_b, true);

        assert!(a.is_operational());
        assert!(b.is_operational());
        assert_eq!(a.node_id(), 0x20);
        assert_eq!(b.node_id(), 0x30);
    }

    #[test]
    fn test_restrained_node_backs_off_on_foreign_claim() {
        let mut node = adapter(1, vec![0x10, 0x55]);
        let mut intf = MockIntf::new();

        node.start(&mut intf);
        node.on_heartbeat_sent(&mut intf, true);

        // while waiting for the probe delay, another node claims the same
        // id with different randomness
        let foreign = CanMessage::new(ACQUISITION_ID_BASE | 0x10, &[9u8; 16]);
        let mut dom = domain();
        node.on_can_msg(&mut intf, &foreign, &mut dom);

        assert_eq!(node.node_id(), 0x55);
    }

    #[test]
    fn test_operational_node_defends_its_id() {
        let mut node = adapter(1, vec![0x42]);
        let mut intf = MockIntf::new();
        let mut dom = domain();

        bring_up(&mut node, &mut intf);
        intf.take();

        let foreign = CanMessage::new(ACQUISITION_ID_BASE | 0x42, &[9u8; 16]);
        node.on_can_msg(&mut intf, &foreign, &mut dom);

        let sent = intf.take();
        assert_eq!(sent.len(), 1);
        // a guard: dominant id, no payload
        assert_eq!(sent[0].1.id, HEARTBEAT_ID_BASE | 0x42);
        assert_eq!(sent[0].1.len, 0);
        assert!(node.is_operational());
    }

    #[test]
    fn test_operational_node_abandons_id_on_conflict() {
        let mut node = adapter(1, vec![0x42, 0x43]);
        let mut intf = MockIntf::new();
        let mut dom = domain();

        bring_up(&mut node, &mut intf);

        // an application heartbeat from someone else under our id
        let foreign = CanMessage::new(HEARTBEAT_ID_BASE | 0x42, &[9u8; 16]);
        node.on_can_msg(&mut intf, &foreign, &mut dom);

        assert!(!node.is_operational());
        assert_eq!(node.node_id(), 0x43);
    }

    #[test]
    fn test_three_collisions_require_restraint() {
        let mut node = adapter(1, vec![0x42, 0x44]);
        let mut intf = MockIntf::new();

        bring_up(&mut node, &mut intf);

        for _ in 0..MAX_TX_COLLISIONS {
            assert!(!node.must_restrain());
            node.on_data_sent(false);
        }
        assert!(node.must_restrain());

        node.start(&mut intf);
        assert_eq!(node.node_id(), 0x44);
    }

    #[test]
    fn test_heartbeats_build_routes() {
        let mut node = adapter(1, vec![0x42]);
        let mut intf = MockIntf::new();
        let mut dom = domain();

        bring_up(&mut node, &mut intf);

        let peer = CanMessage::new(HEARTBEAT_ID_BASE | 0x07, &[5u8; 16]);
        node.on_can_msg(&mut intf, &peer, &mut dom);

        assert_eq!(node.routes.get(&0x07), Some(&NodeId([5; 16])));
        assert!(dom.node(&NodeId([5; 16])).is_some());

        // the same CAN id reappears with a different Fibre identity
        let reborn = CanMessage::new(HEARTBEAT_ID_BASE | 0x07, &[6u8; 16]);
        node.on_can_msg(&mut intf, &reborn, &mut dom);

        assert_eq!(node.routes.get(&0x07), Some(&NodeId([6; 16])));
        assert!(dom.node(&NodeId([5; 16])).is_none());
        assert!(dom.node(&NodeId([6; 16])).is_some());
    }

    #[test]
    fn test_data_frame_opens_call() {
        let mut node = adapter(1, vec![0x42]);
        let mut intf = MockIntf::new();
        let mut dom = domain();

        bring_up(&mut node, &mut intf);

        // learn the peer first
        let peer = CanMessage::new(HEARTBEAT_ID_BASE | 0x07, &[5u8; 16]);
        node.on_can_msg(&mut intf, &peer, &mut dom);

        // routing info: protocol 0, call id 16 x 0xcd, on layer 1
        let mut routing = [0xcdu8; 17];
        routing[0] = 0x00;
        let chain = crate::chunk::BufChain::from_chunks(vec![
            crate::chunk::Chunk::buf(1, &routing),
            crate::chunk::Chunk::frame_boundary(1),
        ]);
        let mut payload = [0u8; 64];
        let (_, len) = low_level::pack(&chain, None, &mut payload);

        let msg = CanMessage {
            id: FIBRE_ID_PREFIX | (0x42 << 8) | (3 << 16) | 0x07,
            fd_frame: true,
            len: len as u8,
            data: payload,
        };
        node.on_can_msg(&mut intf, &msg, &mut dom);

        assert!(dom.call_key(&[0xcd; 16]).is_some());
    }

    #[test]
    fn test_data_frame_addressing() {
        let mut node = adapter(1, vec![0x42]);
        let mut intf = MockIntf::new();
        let mut dom = domain();

        bring_up(&mut node, &mut intf);

        let peer = CanMessage::new(HEARTBEAT_ID_BASE | 0x07, &[5u8; 16]);
        node.on_can_msg(&mut intf, &peer, &mut dom);
        intf.take();

        let slot = node.open_output_slot(&NodeId([5; 16])).unwrap();

        let payload = [0xabu8; 4];
        let chunks = vec![
            crate::chunk::Chunk::buf(2, &payload),
            crate::chunk::Chunk::frame_boundary(2),
        ];
        let mut tasks = [TxTask {
            backend_slot: slot,
            chunks,
        }];
        let consumed = node.start_write(&mut tasks).unwrap();
        assert_eq!(consumed, ChainPos::new(2, 0));

        node.flush_data(&mut intf);
        let sent = intf.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MAILBOX_DATA);
        // dest 0x07, rx slot 0, sender 0x42
        assert_eq!(sent[0].1.id, FIBRE_ID_PREFIX | (0x07 << 8) | 0x42);

        // round trips through the low-level codec
        let (_, decoded) = low_level::unpack(sent[0].1.payload()).unwrap();
        assert_eq!(decoded.n_bytes(), 4);

        node.on_data_sent(true);
        assert!(!node.must_restrain());
    }

    #[test]
    fn test_seeded_candidates_are_deterministic_per_node() {
        let a: Vec<u8> = CanAdapter::seeded_candidates(&NodeId([1; 16]))
            .take(4)
            .collect();
        let b: Vec<u8> = CanAdapter::seeded_candidates(&NodeId([1; 16]))
            .take(4)
            .collect();
        let c: Vec<u8> = CanAdapter::seeded_candidates(&NodeId([2; 16]))
            .take(4)
            .collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_slot_allocation_is_bounded() {
        let mut node = adapter(1, vec![0x42]);
        let dest = NodeId([5; 16]);

        let mut slots = Vec::new();
        for _ in 0..MAX_OUTPUT_SLOTS_PER_DEST {
            slots.push(node.open_output_slot(&dest).unwrap());
        }
        assert!(node.open_output_slot(&dest).is_none());

        assert!(node.close_output_slot(slots[0]));
        assert!(node.open_output_slot(&dest).is_some());
    }
}
