//! Layer-tagged chunks and chunk chains. A chain is the unit of data handed
//! between protocol components; payload bytes are borrowed, never copied,
//! until they reach a fifo or a frame buffer.

/// Highest framing layer stored in a fifo. Wire headers carry the layer in
/// 3 bits so transient (elevated) layers may go up to 7.
pub const MAX_LAYERS: u8 = 4;

/// A slice of payload bytes tagged with a framing layer, or a zero-length
/// marker terminating a logical frame on that layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Chunk<'a> {
    Buf { layer: u8, bytes: &'a [u8] },
    FrameBoundary { layer: u8 },
}

impl<'a> Chunk<'a> {
    #[inline]
    pub fn buf(layer: u8, bytes: &'a [u8]) -> Chunk<'a> {
        Chunk::Buf { layer, bytes }
    }

    #[inline]
    pub fn frame_boundary(layer: u8) -> Chunk<'a> {
        Chunk::FrameBoundary { layer }
    }

    #[inline]
    pub fn layer(&self) -> u8 {
        match self {
            Chunk::Buf { layer, .. } => *layer,
            Chunk::FrameBoundary { layer } => *layer,
        }
    }

    #[inline]
    pub fn is_buf(&self) -> bool {
        matches!(self, Chunk::Buf { .. })
    }

    #[inline]
    pub fn is_frame_boundary(&self) -> bool {
        matches!(self, Chunk::FrameBoundary { .. })
    }

    /// Payload bytes of a buf chunk. Boundaries have no bytes.
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        match self {
            Chunk::Buf { bytes, .. } => bytes,
            Chunk::FrameBoundary { .. } => &[],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Re-tags the chunk's layer by a signed offset. Used when a lower layer
    /// wraps bytes from a higher layer into its own payload.
    #[inline]
    pub fn elevate(self, delta: i8) -> Chunk<'a> {
        let layer = self.layer() as i16 + delta as i16;
        assert!((0..8).contains(&layer), "layer out of range: {}", layer);
        match self {
            Chunk::Buf { bytes, .. } => Chunk::Buf {
                layer: layer as u8,
                bytes,
            },
            Chunk::FrameBoundary { .. } => Chunk::FrameBoundary { layer: layer as u8 },
        }
    }
}

/// A position within a chain, as reported back by a consumer. Positions are
/// relative to the chain that was handed to the consumer: `chunk` counts
/// whole chunks consumed, `byte` counts bytes into the following chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ChainPos {
    pub chunk: usize,
    pub byte: usize,
}

impl ChainPos {
    #[inline]
    pub fn new(chunk: usize, byte: usize) -> ChainPos {
        ChainPos { chunk, byte }
    }
}

/// An ordered sequence of chunks with a byte offset into the first one.
#[derive(Debug, Clone, Default)]
pub struct BufChain<'a> {
    chunks: Vec<Chunk<'a>>,
    first_offset: usize,
}

impl<'a> BufChain<'a> {
    #[inline]
    pub fn new() -> BufChain<'a> {
        BufChain {
            chunks: Vec::new(),
            first_offset: 0,
        }
    }

    #[inline]
    pub fn from_chunks(chunks: Vec<Chunk<'a>>) -> BufChain<'a> {
        BufChain {
            chunks,
            first_offset: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, chunk: Chunk<'a>) {
        self.chunks.push(chunk);
    }

    #[inline]
    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total payload bytes remaining in the chain.
    pub fn n_bytes(&self) -> usize {
        self.iter().map(|c| c.len()).sum()
    }

    /// The first chunk, with the consumed prefix stripped.
    pub fn front(&self) -> Option<Chunk<'a>> {
        self.chunk_at(0)
    }

    fn chunk_at(&self, idx: usize) -> Option<Chunk<'a>> {
        let chunk = *self.chunks.get(idx)?;
        if idx == 0 {
            if let Chunk::Buf { layer, bytes } = chunk {
                return Some(Chunk::Buf {
                    layer,
                    bytes: &bytes[self.first_offset..],
                });
            }
        }
        Some(chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = Chunk<'a>> + '_ {
        (0..self.chunks.len()).filter_map(move |i| self.chunk_at(i))
    }

    /// Drops the first `n` chunks.
    pub fn skip_chunks(&mut self, n: usize) {
        let n = n.min(self.chunks.len());
        self.chunks.drain(..n);
        self.first_offset = 0;
    }

    /// Consumes `n` payload bytes from the front of the chain. Panics when
    /// asked to walk over a frame boundary or past the end of the chain.
    pub fn skip_bytes(&mut self, mut n: usize) {
        while n > 0 {
            let front = self.front().expect("skipped past end of chain");
            assert!(front.is_buf(), "skipped bytes across a frame boundary");
            let avail = front.len();
            if n >= avail {
                n -= avail;
                self.skip_chunks(1);
            } else {
                self.first_offset += n;
                n = 0;
            }
        }
    }

    /// Drops everything up to (but not including) `pos`.
    pub fn advance_to(&mut self, pos: ChainPos) {
        self.skip_chunks(pos.chunk);
        if pos.byte > 0 {
            self.first_offset += pos.byte;
        }
    }

    /// The chunk-granular prefix of the chain, up to `n_chunks` chunks.
    pub fn until(&self, n_chunks: usize) -> BufChain<'a> {
        let n = n_chunks.min(self.chunks.len());
        let mut prefix = BufChain {
            chunks: self.chunks[..n].to_vec(),
            first_offset: self.first_offset,
        };
        if n == 0 {
            prefix.first_offset = 0;
        }
        prefix
    }

    /// Re-tags every chunk's layer by a signed offset.
    pub fn elevated(mut self, delta: i8) -> BufChain<'a> {
        for chunk in &mut self.chunks {
            *chunk = chunk.elevate(delta);
        }
        self
    }

    /// Index of the first layer-0 frame boundary, if any.
    pub fn find_layer0_bound(&self) -> Option<usize> {
        self.chunks
            .iter()
            .position(|c| c.is_frame_boundary() && c.layer() == 0)
    }

    /// Index of the first chunk on the given layer, if any.
    pub fn find_chunk_on_layer(&self, layer: u8) -> Option<usize> {
        self.chunks.iter().position(|c| c.layer() == layer)
    }

    /// Position just past the last chunk.
    #[inline]
    pub fn end_pos(&self) -> ChainPos {
        ChainPos::new(self.chunks.len(), 0)
    }
}

/// Data pushed into a socket: a chain plus the status of the transfer it
/// belongs to. `Closed` marks the final write of a transfer.
#[derive(Debug, Clone, Default)]
pub struct WriteArgs<'a> {
    pub buf: BufChain<'a>,
    pub status: crate::status::Status,
}

impl<'a> WriteArgs<'a> {
    #[inline]
    pub fn new(buf: BufChain<'a>, status: crate::status::Status) -> WriteArgs<'a> {
        WriteArgs { buf, status }
    }

    /// "Nothing to hand over until further notice."
    #[inline]
    pub fn busy() -> WriteArgs<'a> {
        WriteArgs {
            buf: BufChain::new(),
            status: crate::status::Status::Busy,
        }
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.status == crate::status::Status::Busy
    }
}

/// Outcome of a socket write: how far the callee consumed the chain it was
/// given, and the resulting status.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteResult {
    pub status: crate::status::Status,
    pub end: ChainPos,
}

impl WriteResult {
    #[inline]
    pub fn new(status: crate::status::Status, end: ChainPos) -> WriteResult {
        WriteResult { status, end }
    }

    #[inline]
    pub fn busy() -> WriteResult {
        WriteResult {
            status: crate::status::Status::Busy,
            end: ChainPos::default(),
        }
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.status == crate::status::Status::Busy
    }
}

/// Continuation of an internal iteration step: either another chain to pass
/// on, or a final completion.
#[derive(Debug)]
pub enum Cont<'a> {
    Chain(WriteArgs<'a>),
    Done(WriteResult),
}

/// The cooperative byte-pipeline contract. `write` pushes caller-owned
/// chunks in; `on_write_done` acknowledges previously pulled output and
/// returns the next output chain, borrowed from the callee until the next
/// call into it.
pub trait Socket {
    fn write(&mut self, args: WriteArgs<'_>) -> WriteResult;
    fn on_write_done(&mut self, result: WriteResult) -> WriteArgs<'_>;
}
