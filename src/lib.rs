pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod lease;
pub mod models;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod stream;
pub mod toolcall;
pub mod upstream;

pub(crate) mod json_scan;
mod util;
