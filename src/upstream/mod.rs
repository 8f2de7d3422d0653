//! Upstream chat service: HTTP calls, SSE line splitting and record decoding.

pub mod backend;
pub mod decoder;
pub mod lines;
pub(crate) mod retry;

pub use backend::{completion_payload, ByteStream, HttpBackend, UpstreamBackend};
pub use decoder::{decode_line, DecodeContext, DecodedRecord, FragmentKind, UpstreamFragment};
pub use lines::line_stream;
