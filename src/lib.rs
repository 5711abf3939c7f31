//! Bridges an app's download calls to a platform download service and
//! resolves each call when the service announces the transfer finished.

pub mod bridge;
pub mod config;
pub mod plugin;
pub mod transfer;
pub mod utils;
