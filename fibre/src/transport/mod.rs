//! Concrete transports that expose the frame sink/source contracts.

pub mod udp;
