//! The stream-level proxy: an opaque byte codec and the handler which fans
//! one client stream out to a primary and any number of secondaries.
//!
//! Frames are never interpreted here. The coordinator peeks at and rewrites
//! the first frame before routing; everything after is duplicated verbatim.

mod codec;
mod stream;

pub use codec::RawCodec;
pub use stream::{proxy_frames, Destination, RequestFinalizer, RpcOutcome, StreamParameters};
