mod http;
mod memory;
mod service;
mod types;

pub use http::HttpTransferService;
pub use memory::MemoryTransferService;
pub use service::{CompletionSubscription, TransferError, TransferService};
pub use types::{
    reason, status_code, Destination, InvalidHeader, ListenerOptions, NetworkTypes,
    NotificationVisibility, TransferId, TransferRequest, TransferStatus,
};
