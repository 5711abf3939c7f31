use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Opaque identifier handed out by the transfer service for each enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub i64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reason codes reported alongside a failed status.
///
/// HTTP error responses are reported as the HTTP status code itself.
pub mod reason {
    pub const ERROR_UNKNOWN: i32 = 1000;
    pub const ERROR_FILE_ERROR: i32 = 1001;
    pub const ERROR_UNHANDLED_HTTP_CODE: i32 = 1002;
    pub const ERROR_HTTP_DATA_ERROR: i32 = 1004;
}

/// Raw status codes used by the platform download service.
pub mod status_code {
    pub const PENDING: i32 = 1;
    pub const RUNNING: i32 = 2;
    pub const PAUSED: i32 = 4;
    pub const SUCCESSFUL: i32 = 8;
    pub const FAILED: i32 = 16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed { reason: i32 },
    Unknown { code: i32 },
}

impl TransferStatus {
    /// Interprets a `(status, reason)` pair as queried from the platform.
    pub fn from_codes(status: i32, reason: i32) -> Self {
        match status {
            status_code::PENDING => Self::Pending,
            status_code::RUNNING => Self::Running,
            status_code::PAUSED => Self::Paused,
            status_code::SUCCESSFUL => Self::Successful,
            status_code::FAILED => Self::Failed { reason },
            code => Self::Unknown { code },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed { .. })
    }
}

/// Network classes a transfer may run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkTypes {
    pub wifi: bool,
    pub mobile: bool,
}

impl NetworkTypes {
    pub const ALL: Self = Self {
        wifi: true,
        mobile: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationVisibility {
    Hidden,
    #[default]
    Visible,
    VisibleNotifyCompleted,
    VisibleNotifyOnlyCompletion,
}

/// Where the transferred file lands: a public directory plus a path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub directory: String,
    pub relative_path: String,
}

/// Request handed to [`TransferService::enqueue`](super::TransferService::enqueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: Url,
    pub network_types: NetworkTypes,
    pub allow_roaming: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub destination: Option<Destination>,
    pub notification: NotificationVisibility,
    pub headers: Vec<(String, String)>,
}

impl TransferRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            network_types: NetworkTypes::default(),
            allow_roaming: false,
            title: None,
            description: None,
            destination: None,
            notification: NotificationVisibility::default(),
            headers: Vec::new(),
        }
    }

    pub fn allowed_network_types(mut self, types: NetworkTypes) -> Self {
        self.network_types = types;
        self
    }

    pub fn allow_roaming(mut self, allowed: bool) -> Self {
        self.allow_roaming = allowed;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn destination_in_public_dir(
        mut self,
        directory: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Self {
        self.destination = Some(Destination {
            directory: directory.into(),
            relative_path: relative_path.into(),
        });
        self
    }

    pub fn notification_visibility(mut self, visibility: NotificationVisibility) -> Self {
        self.notification = visibility;
        self
    }

    /// Attaches a request header verbatim. Names must be non-empty and free of `:`.
    pub fn add_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, InvalidHeader> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidHeader {
                name,
                reason: "header name is empty",
            });
        }
        if name.contains(':') {
            return Err(InvalidHeader {
                name,
                reason: "header name must not contain ':'",
            });
        }
        self.headers.push((name, value.into()));
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHeader {
    pub name: String,
    pub reason: &'static str,
}

/// Options declared when subscribing to completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Accept events sent from outside the hosting process.
    pub exported: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self { exported: true }
    }
}
