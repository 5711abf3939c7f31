mod coordinator;
mod errors;
mod registry;
mod request;
mod sink;

pub use coordinator::{DownloadCoordinator, NotificationOutcome};
pub use errors::{DownloadError, SubmissionError};
pub use registry::{CompletionRegistry, PendingRequest};
pub use request::DownloadRequest;
pub use sink::{PendingDownload, ResultHandler, ResultSink};
