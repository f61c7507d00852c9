//! Reliable-delivery connection endpoint. A connection owns one RX and one
//! TX fifo and runs two position-keyed state machines, one per direction.
//! Input slots absorb chunks from any number of ingress channels and
//! deduplicate them against the receive tail; output slots replay the TX
//! fifo into a frame sink and collapse it on acknowledgement.

use byteorder::{ByteOrder, LittleEndian};

use crate::chunk::{BufChain, ChainPos, Chunk, WriteArgs, WriteResult};
use crate::config::{AckPolicy, ConnectionConfig};
use crate::fifo::{Fifo, ReadIt, POS_LAYERS};
use crate::logging::{error, o, trace, Logger};
use crate::status::Status;

pub const CALL_ID_SIZE: usize = 16;

/// Layer-0 record: 1 type byte plus 3 little-endian `(frame_id, offset)`
/// pairs.
const LAYER0_RECORD_SIZE: usize = 13;
const RECORD_POS: u8 = 0x00;
const RECORD_ACK: u8 = 0x01;

/// Upper bound on the chunks handed out in one TX task or RX upcall.
const MAX_TASK_CHUNKS: usize = 16;

/// A per-layer stream position: frame counter plus byte offset within the
/// current frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ConnectionPos {
    pub frame_ids: [u16; POS_LAYERS],
    pub offsets: [u16; POS_LAYERS],
}

impl ConnectionPos {
    /// Serializes the position behind the given record type tag.
    pub fn to_record(&self, tag: u8) -> [u8; LAYER0_RECORD_SIZE] {
        let mut buf = [0u8; LAYER0_RECORD_SIZE];
        buf[0] = tag;
        for i in 0..POS_LAYERS {
            LittleEndian::write_u16(&mut buf[4 * i + 1..], self.frame_ids[i]);
            LittleEndian::write_u16(&mut buf[4 * i + 3..], self.offsets[i]);
        }
        buf
    }

    /// Parses a layer-0 record. Returns the type tag and the position.
    pub fn from_record(buf: &[u8; LAYER0_RECORD_SIZE]) -> (u8, ConnectionPos) {
        let mut pos = ConnectionPos::default();
        for i in 0..POS_LAYERS {
            pos.frame_ids[i] = LittleEndian::read_u16(&buf[4 * i + 1..]);
            pos.offsets[i] = LittleEndian::read_u16(&buf[4 * i + 3..]);
        }
        (buf[0], pos)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InputSlotId(usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OutputSlotId(usize);

struct InputSlot {
    cache: [u8; LAYER0_RECORD_SIZE],
    cache_pos: usize,
    pos: ConnectionPos,
}

struct OutputSlot {
    /// Back-end slot handle obtained from the frame sink.
    backend_slot: u64,
    sending: bool,
    sent_header_recently: bool,
    tx_it: ReadIt,
    // bookkeeping for the task currently out with the sink
    sending_tx_it: ReadIt,
    n_header_chunks: usize,
    n_task_chunks: usize,
    header_in_task: bool,
    ack_in_task: bool,
    pos_header: [u8; LAYER0_RECORD_SIZE],
    ack_buf: [u8; LAYER0_RECORD_SIZE],
}

/// One frame's worth of outgoing chunks, borrowed from the connection until
/// `release_task` is called with the consumed end.
pub struct TxTask<'a> {
    pub backend_slot: u64,
    pub chunks: Vec<Chunk<'a>>,
}

impl<'a> TxTask<'a> {
    pub fn chain(&self) -> BufChain<'a> {
        BufChain::from_chunks(self.chunks.clone())
    }
}

/// Write access to the connection's TX fifo, handed to the RX handler so it
/// can respond while it consumes.
pub struct TxPort<'a> {
    fifo: &'a mut Fifo,
}

impl<'a> TxPort<'a> {
    pub(crate) fn new(fifo: &'a mut Fifo) -> TxPort<'a> {
        TxPort { fifo }
    }

    /// Appends to the TX fifo. Returns `busy` when nothing fit; a partial
    /// `end` when the fifo filled up mid-chain.
    pub fn write(&mut self, args: &WriteArgs<'_>) -> WriteResult {
        let end = self.fifo.append(&args.buf);
        if end == ChainPos::default() && !args.buf.is_empty() {
            WriteResult::busy()
        } else {
            WriteResult::new(Status::Ok, end)
        }
    }
}

/// Consumer of RX upcalls. `on_rx` must consume what it can and report the
/// consumed end; it returns `busy` only when it consumed nothing at all.
pub trait RxHandler {
    fn on_rx(&mut self, args: WriteArgs<'_>, tx: &mut TxPort<'_>) -> WriteResult;
}

pub struct Connection {
    log: Logger,
    ack_policy: AckPolicy,
    rx_fifo: Fifo,
    tx_fifo: Fifo,
    /// Next expected per-layer frame/offset on the receive side.
    rx_tail: ConnectionPos,
    /// Acknowledged position on the transmit side.
    tx_head: ConnectionPos,
    send_ack: bool,
    tx_protocol: [u8; 1],
    tx_call_id: [u8; CALL_ID_SIZE],
    input_slots: Vec<Option<InputSlot>>,
    output_slots: Vec<Option<OutputSlot>>,
    /// Set when the fifo state became inconsistent or a strict-mode ack
    /// violation occurred; the owner must drop the connection.
    broken: bool,
}

impl Connection {
    pub fn new(
        log: &Logger,
        config: &ConnectionConfig,
        protocol: u8,
        call_id: [u8; CALL_ID_SIZE],
    ) -> Connection {
        Connection {
            log: log.new(o!()),
            ack_policy: config.ack_policy,
            rx_fifo: Fifo::new(config.fifo_blocks),
            tx_fifo: Fifo::new(config.fifo_blocks),
            rx_tail: ConnectionPos::default(),
            tx_head: ConnectionPos::default(),
            send_ack: false,
            tx_protocol: [protocol],
            tx_call_id: call_id,
            input_slots: Vec::new(),
            output_slots: Vec::new(),
            broken: false,
        }
    }

    /// True once the connection hit a state it cannot recover from. The
    /// owner is expected to tear it down.
    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn open_rx_slot(&mut self) -> InputSlotId {
        let slot = InputSlot {
            cache: [0; LAYER0_RECORD_SIZE],
            cache_pos: 0,
            pos: ConnectionPos::default(),
        };
        for (i, entry) in self.input_slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return InputSlotId(i);
            }
        }
        self.input_slots.push(Some(slot));
        InputSlotId(self.input_slots.len() - 1)
    }

    pub fn close_rx_slot(&mut self, id: InputSlotId) {
        self.input_slots[id.0] = None;
    }

    /// Allocates a front-end output slot bound to a sink's back-end slot.
    pub fn open_tx_slot(&mut self, backend_slot: u64) -> OutputSlotId {
        let slot = OutputSlot {
            backend_slot,
            sending: false,
            sent_header_recently: false,
            tx_it: self.tx_fifo.read_begin(),
            sending_tx_it: self.tx_fifo.read_begin(),
            n_header_chunks: 0,
            n_task_chunks: 0,
            header_in_task: false,
            ack_in_task: false,
            pos_header: [0; LAYER0_RECORD_SIZE],
            ack_buf: [0; LAYER0_RECORD_SIZE],
        };
        for (i, entry) in self.output_slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return OutputSlotId(i);
            }
        }
        self.output_slots.push(Some(slot));
        OutputSlotId(self.output_slots.len() - 1)
    }

    /// Frees the slot and returns its back-end handle so the caller can
    /// close it on the sink.
    pub fn close_tx_slot(&mut self, id: OutputSlotId) -> Option<u64> {
        self.output_slots[id.0].take().map(|s| s.backend_slot)
    }

    /// True when the slot would produce a non-empty task.
    pub fn slot_has_data(&self, id: OutputSlotId) -> bool {
        let slot = match &self.output_slots[id.0] {
            Some(slot) => slot,
            None => return false,
        };
        !slot.sending
            && (!slot.sent_header_recently
                || slot.tx_it != self.tx_fifo.read_end()
                || self.send_ack)
    }

    /// Feeds inbound chunks from one ingress channel through the reliable
    /// delivery logic. New in-order data lands in the RX fifo (elevated down
    /// one layer), retransmissions of already-accepted bytes are skipped and
    /// re-acknowledged, stale positions are walked over.
    pub fn process_sync(&mut self, id: InputSlotId, chain: BufChain<'_>) {
        let mut chain = chain;

        while let Some(chunk) = chain.front() {
            let layer = chunk.layer();

            if layer == 0 {
                let slot = match self.input_slots[id.0].as_mut() {
                    Some(slot) => slot,
                    None => return,
                };
                if chunk.is_buf() {
                    let n_copy =
                        (LAYER0_RECORD_SIZE - slot.cache_pos).min(chunk.len());
                    slot.cache[slot.cache_pos..slot.cache_pos + n_copy]
                        .copy_from_slice(&chunk.bytes()[..n_copy]);
                    slot.cache_pos += n_copy;
                } else {
                    if slot.cache_pos >= LAYER0_RECORD_SIZE {
                        let (tag, pos) = ConnectionPos::from_record(&slot.cache);
                        if tag == RECORD_POS {
                            slot.pos = pos;
                        } else {
                            trace!(self.log, "got ack");
                            self.on_ack(pos);
                        }
                    }
                    if let Some(slot) = self.input_slots[id.0].as_mut() {
                        slot.cache_pos = 0;
                    }
                }
                chain.skip_chunks(1);
                continue;
            }

            let l = (layer - 1) as usize;
            if l >= POS_LAYERS {
                chain.skip_chunks(1);
                continue;
            }

            let slot = match self.input_slots[id.0].as_mut() {
                Some(slot) => slot,
                None => return,
            };

            let same_frame = self.rx_tail.frame_ids == slot.pos.frame_ids;

            if same_frame && self.rx_tail.offsets[l] > slot.pos.offsets[l] && chunk.is_buf() {
                // the peer is retransmitting already-accepted bytes
                let n_skip = ((self.rx_tail.offsets[l] - slot.pos.offsets[l]) as usize)
                    .min(chunk.len());
                slot.pos.offsets[l] += n_skip as u16;
                chain.skip_bytes(n_skip);
                self.send_ack = true;
                continue;
            }

            let matches_tail = same_frame && self.rx_tail.offsets[l] == slot.pos.offsets[l];

            if matches_tail {
                let accepted = chunk.elevate(-1);
                let appended = self
                    .rx_fifo
                    .append(&BufChain::from_chunks(vec![accepted]));

                if chunk.is_buf() {
                    let n_in = if appended.chunk == 1 {
                        chunk.len()
                    } else {
                        appended.byte
                    };
                    self.rx_tail.offsets[l] += n_in as u16;
                    let slot = self.input_slots[id.0].as_mut().unwrap();
                    slot.pos.offsets[l] += n_in as u16;
                    self.send_ack = true;
                    if n_in < chunk.len() {
                        // RX fifo full: stop here, the unaccepted tail stays
                        // unacknowledged and will be retransmitted
                        break;
                    }
                    chain.skip_chunks(1);
                    continue;
                } else {
                    if appended.chunk == 0 {
                        // no room for the boundary record, try again later
                        break;
                    }
                    self.rx_tail.frame_ids[l] = self.rx_tail.frame_ids[l].wrapping_add(1);
                    self.rx_tail.offsets[l] = 0;
                    let slot = self.input_slots[id.0].as_mut().unwrap();
                    slot.pos.frame_ids[l] = slot.pos.frame_ids[l].wrapping_add(1);
                    slot.pos.offsets[l] = 0;
                    self.send_ack = true;
                    chain.skip_chunks(1);
                    continue;
                }
            }

            // position behind (or ahead of) the tail: walk over the chunk
            let slot = self.input_slots[id.0].as_mut().unwrap();
            if chunk.is_buf() {
                slot.pos.offsets[l] += chunk.len() as u16;
            } else {
                slot.pos.frame_ids[l] = slot.pos.frame_ids[l].wrapping_add(1);
                slot.pos.offsets[l] = 0;
            }
            chain.skip_chunks(1);
            self.send_ack = true;
        }

        if !self.rx_fifo.fsck() {
            error!(self.log, "RX fifo inconsistent");
            self.broken = true;
        }
    }

    /// Applies a peer acknowledgement: collapses the acked prefix of the TX
    /// fifo and advances the ack head. Returns false when the ack was ahead
    /// of the send cursor and the configured policy treats that as fatal.
    pub fn on_ack(&mut self, pos: ConnectionPos) -> bool {
        let mut n_frames = [0u16; POS_LAYERS];
        let mut n_bytes = [0u16; POS_LAYERS];

        for i in 0..POS_LAYERS {
            let diff = pos.frame_ids[i].wrapping_sub(self.tx_head.frame_ids[i]) as i16;
            if diff < 0 {
                // stale
            } else if diff == 0 {
                n_bytes[i] = pos.offsets[i].saturating_sub(self.tx_head.offsets[i]);
            } else {
                n_frames[i] = diff as u16;
                n_bytes[i] = pos.offsets[i];
            }
        }

        let it = self
            .tx_fifo
            .advance_counts(self.tx_fifo.read_begin(), n_frames, n_bytes);
        self.tx_fifo.drop_until(it);
        self.tx_head = pos;

        let mut ok = true;
        for entry in &mut self.output_slots {
            let slot = match entry {
                Some(slot) => slot,
                None => continue,
            };
            if !self.tx_fifo.fsck_at(slot.tx_it) {
                error!(self.log, "ack ahead of the send cursor");
                match self.ack_policy {
                    AckPolicy::Lenient => {
                        slot.tx_it = self.tx_fifo.read_begin();
                        slot.sending_tx_it = slot.tx_it;
                    }
                    AckPolicy::Strict => {
                        self.broken = true;
                        ok = false;
                    }
                }
            }
        }
        ok
    }

    /// Appends application data to the TX fifo. Returns `busy` when the fifo
    /// is completely full; a partial end when only a prefix fit. The caller
    /// keeps the unsent suffix and retries after the next acknowledgement.
    pub fn tx(&mut self, args: &WriteArgs<'_>) -> WriteResult {
        TxPort {
            fifo: &mut self.tx_fifo,
        }
        .write(args)
    }

    /// Write access to the TX fifo for owners that respond outside an RX
    /// upcall.
    pub fn tx_port(&mut self) -> TxPort<'_> {
        TxPort {
            fifo: &mut self.tx_fifo,
        }
    }

    /// Drains the RX fifo through the handler, advancing past everything the
    /// handler consumed. Stops when the fifo runs empty or the handler stops
    /// making progress.
    pub fn pump_rx<H: RxHandler>(&mut self, handler: &mut H) {
        loop {
            if !self.rx_fifo.has_data() {
                return;
            }

            let result = {
                let rx_fifo = &self.rx_fifo;
                let tx_fifo = &mut self.tx_fifo;
                let (chunks, _) = rx_fifo.collect_from(rx_fifo.read_begin(), MAX_TASK_CHUNKS);
                let args = WriteArgs::new(BufChain::from_chunks(chunks), Status::Ok);
                let mut tx = TxPort { fifo: tx_fifo };
                handler.on_rx(args, &mut tx)
            };

            if result.is_busy() {
                return;
            }

            let consumed = result.end;
            if consumed == ChainPos::default() {
                return;
            }
            let it = self
                .rx_fifo
                .advance_consumed(self.rx_fifo.read_begin(), consumed);
            self.rx_fifo.drop_until(it);
        }
    }

    /// Produces the next frame's worth of chunks for the given output slot:
    /// the one-shot protocol/call-id preamble and position header, a pending
    /// ack record, then as much of the TX fifo as fits, elevated three
    /// layers up.
    pub fn build_task(&mut self, id: OutputSlotId) -> TxTask<'_> {
        // mutable phase: refresh the slot's header buffers and bookkeeping
        let send_ack = self.send_ack;
        let tx_head = self.tx_head;
        let rx_tail = self.rx_tail;

        let (n_header, include_header, include_ack, task_it, backend_slot) = {
            let slot = self.output_slots[id.0]
                .as_mut()
                .expect("task built for a closed slot");

            let include_header = !slot.sent_header_recently;
            if include_header {
                slot.sent_header_recently = true;
                slot.pos_header = tx_head.to_record(RECORD_POS);
            }

            let include_ack = send_ack;
            if include_ack {
                slot.ack_buf = rx_tail.to_record(RECORD_ACK);
            }

            let n_header = if include_header { 5 } else { 0 } + if include_ack { 2 } else { 0 };

            slot.header_in_task = include_header;
            slot.ack_in_task = include_ack;
            slot.n_header_chunks = n_header;
            slot.sending = true;

            (n_header, include_header, include_ack, slot.tx_it, slot.backend_slot)
        };
        if include_ack {
            self.send_ack = false;
        }

        let (n_fifo, new_it) = self
            .tx_fifo
            .count_from(task_it, MAX_TASK_CHUNKS - n_header);
        {
            let slot = self.output_slots[id.0].as_mut().unwrap();
            slot.sending_tx_it = new_it;
            slot.n_task_chunks = n_header + n_fifo;
        }

        // shared phase: assemble the chunk list
        let slot = self.output_slots[id.0].as_ref().unwrap();
        let mut chunks = Vec::with_capacity(n_header + n_fifo);

        if include_header {
            chunks.push(Chunk::buf(1, &self.tx_protocol));
            chunks.push(Chunk::buf(1, &self.tx_call_id));
            chunks.push(Chunk::frame_boundary(1));
            chunks.push(Chunk::buf(2, &slot.pos_header));
            chunks.push(Chunk::frame_boundary(2));
        }
        if include_ack {
            chunks.push(Chunk::buf(2, &slot.ack_buf));
            chunks.push(Chunk::frame_boundary(2));
        }

        let (fifo_chunks, _) = self.tx_fifo.collect_from(task_it, n_fifo);
        for chunk in fifo_chunks {
            chunks.push(chunk.elevate(3));
        }

        trace!(self.log, "create TX task"; "chunks" => chunks.len());

        TxTask {
            backend_slot,
            chunks,
        }
    }

    /// Reports how far the sink consumed the task chain. Fully consumed
    /// payload advances the slot's send cursor; partially consumed headers
    /// are regenerated on the next attempt.
    pub fn release_task(&mut self, id: OutputSlotId, end: ChainPos) {
        let slot = match self.output_slots[id.0].as_mut() {
            Some(slot) => slot,
            None => return,
        };
        slot.sending = false;
        trace!(self.log, "release TX task");

        if end.chunk >= slot.n_header_chunks && (end.chunk > 0 || slot.n_header_chunks == 0) {
            if end.chunk == slot.n_task_chunks && end.byte == 0 {
                slot.tx_it = slot.sending_tx_it;
            } else {
                let rel = ChainPos::new(end.chunk - slot.n_header_chunks, end.byte);
                slot.tx_it = self.tx_fifo.advance_consumed(slot.tx_it, rel);
            }
        } else {
            // the sink took none or only some of the header chunks; they
            // will be regenerated on the next attempt
            if slot.header_in_task {
                slot.sent_header_recently = false;
            }
            if slot.ack_in_task {
                self.send_ack = true;
            }
        }
    }

    #[inline]
    pub fn rx_tail(&self) -> ConnectionPos {
        self.rx_tail
    }

    #[inline]
    pub fn tx_head(&self) -> ConnectionPos {
        self.tx_head
    }

    #[cfg(test)]
    pub(crate) fn rx_tail_mut(&mut self) -> &mut ConnectionPos {
        &mut self.rx_tail
    }

    #[cfg(test)]
    pub(crate) fn send_ack_flag(&self) -> bool {
        self.send_ack
    }

    #[cfg(test)]
    pub(crate) fn tx_fifo(&self) -> &Fifo {
        &self.tx_fifo
    }
}
