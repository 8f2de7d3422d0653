//! Client-facing wire formats.

pub mod chat;
pub mod request;
pub mod responses;

pub use chat::ChatRenderer;
pub use request::{prepare_chat_request, prepare_responses_request, PreparedRequest};
pub use responses::ResponsesRenderer;
