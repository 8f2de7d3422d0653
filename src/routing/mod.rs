//! Request routing for the hyper accept loop.

pub mod dispatch;

pub use dispatch::{dispatch_request, normalize_base_path};
