pub mod chat;
pub(crate) mod completion;
pub mod health;
pub mod lease;
pub mod models;
pub mod responses;

pub use completion::TARGET_ACCOUNT_HEADER;
