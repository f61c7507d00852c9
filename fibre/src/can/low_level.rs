//! Packs chunk chains into frame payloads and back. One frame carries a
//! control byte followed by tagged records:
//!
//! ```text
//! <control: reset_layer in bits 0..3, 7 = none>
//! record := <tag: bit7 = boundary, bits 4..7 = layer> [<len:u8> <bytes…>]
//! ```
//!
//! Buf records may be split across frames; the per-layer boundaries make
//! the streams self-delimiting, so no continuation state is needed.

use crate::chunk::{BufChain, ChainPos, Chunk};
use crate::status::RichResult;

/// "No reset" marker in the control byte.
pub const NO_RESET: u8 = 0x07;

const TAG_BOUNDARY: u8 = 0x80;

/// Packs as much of the chain as fits into `out`. Returns the consumed
/// position (relative to `chain`) and the number of bytes written.
pub fn pack(chain: &BufChain<'_>, reset_layer: Option<u8>, out: &mut [u8]) -> (ChainPos, usize) {
    debug_assert!(!out.is_empty());

    out[0] = reset_layer.unwrap_or(NO_RESET) & 0x07;
    let mut at = 1;
    let mut consumed = ChainPos::default();
    let mut chain = chain.clone();

    while let Some(chunk) = chain.front() {
        if chunk.is_frame_boundary() {
            if at + 1 > out.len() {
                break;
            }
            out[at] = TAG_BOUNDARY | (chunk.layer() << 4);
            at += 1;
            chain.skip_chunks(1);
            consumed = ChainPos::new(consumed.chunk + 1, 0);
        } else {
            if at + 3 > out.len() {
                break;
            }
            let space = out.len() - at - 2;
            let n = space.min(chunk.len()).min(255);
            if n == 0 {
                // zero-length buf chunk, consume without a record
                chain.skip_chunks(1);
                consumed = ChainPos::new(consumed.chunk + 1, 0);
                continue;
            }
            out[at] = chunk.layer() << 4;
            out[at + 1] = n as u8;
            out[at + 2..at + 2 + n].copy_from_slice(&chunk.bytes()[..n]);
            at += 2 + n;

            if n == chunk.len() {
                chain.skip_chunks(1);
                consumed = ChainPos::new(consumed.chunk + 1, 0);
            } else {
                consumed = ChainPos::new(consumed.chunk, consumed.byte + n);
                break;
            }
        }
    }

    (consumed, at)
}

/// Unpacks a frame payload. Returns the reset layer (if any) and the
/// decoded chunks, borrowing the payload bytes.
pub fn unpack(data: &[u8]) -> RichResult<(Option<u8>, BufChain<'_>)> {
    if data.is_empty() {
        return Err(rich_err!("empty frame"));
    }

    let reset = match data[0] & 0x07 {
        NO_RESET => None,
        layer => Some(layer),
    };

    let mut chain = BufChain::new();
    let mut at = 1;
    while at < data.len() {
        let tag = data[at];
        let layer = (tag >> 4) & 0x07;
        if tag & TAG_BOUNDARY != 0 {
            chain.push(Chunk::frame_boundary(layer));
            at += 1;
        } else {
            if at + 2 > data.len() {
                return Err(rich_err!("truncated record header"));
            }
            let n = data[at + 1] as usize;
            if n == 0 || at + 2 + n > data.len() {
                return Err(rich_err!("truncated record payload"));
            }
            chain.push(Chunk::buf(layer, &data[at + 2..at + 2 + n]));
            at += 2 + n;
        }
    }

    Ok((reset, chain))
}
