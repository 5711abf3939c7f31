//! Action dispatch for the hybrid-app layer.
//!
//! Calls arrive as an action name plus a JSON argument array, the same shape
//! the app's script side sends. The only action is `download`, whose first
//! argument is `{url, headers, path, description}`.

use crate::bridge::{
    DownloadCoordinator, DownloadError, DownloadRequest, ResultSink, SubmissionError,
};
use crate::config::BridgeSettings;
use crate::transfer::{TransferError, TransferService};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ACTION_DOWNLOAD: &str = "download";

pub struct DownloaderPlugin {
    coordinator: DownloadCoordinator,
}

impl DownloaderPlugin {
    pub fn initialize(
        service: Arc<dyn TransferService>,
        settings: BridgeSettings,
    ) -> Result<Self, TransferError> {
        debug!("Initializing downloader plugin on {}", service.name());
        let coordinator = DownloadCoordinator::start(service, settings)?;
        Ok(Self { coordinator })
    }

    /// Run `action`. Returns whether the call was accepted; the outcome
    /// itself always arrives through `sink`.
    pub async fn execute(&self, action: &str, args: &Value, sink: ResultSink) -> bool {
        debug!("execute {}", action);

        if action != ACTION_DOWNLOAD {
            warn!("Unknown action: {}", action);
            sink.fail(DownloadError::InvalidAction {
                action: action.to_string(),
            });
            return false;
        }

        let request = match parse_download_args(args) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected download arguments: {}", e);
                sink.fail(DownloadError::from(&e));
                return false;
            }
        };

        self.coordinator.submit(request, sink).await.is_ok()
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
    }
}

fn required_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<String, SubmissionError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        None | Some(Value::Null) => Err(SubmissionError::MissingField(field)),
        Some(other) => Err(SubmissionError::InvalidArguments(format!(
            "`{field}` must be a string, got {other}"
        ))),
    }
}

fn parse_headers(value: Option<&Value>) -> Result<BTreeMap<String, String>, SubmissionError> {
    let object = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(object)) => object,
        Some(other) => {
            return Err(SubmissionError::InvalidArguments(format!(
                "`headers` must be an object, got {other}"
            )))
        }
    };

    object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(SubmissionError::InvalidHeader {
                        name: name.clone(),
                        reason: "header value must be a string".to_string(),
                    })
                }
            };
            Ok((name.clone(), value))
        })
        .collect()
}

/// Turns the `download` argument array into a [`DownloadRequest`].
pub fn parse_download_args(args: &Value) -> Result<DownloadRequest, SubmissionError> {
    let object = args
        .as_array()
        .and_then(|args| args.first())
        .and_then(Value::as_object)
        .ok_or_else(|| {
            SubmissionError::InvalidArguments("expected an argument object".to_string())
        })?;

    let description = match object.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(SubmissionError::InvalidArguments(format!(
                "`description` must be a string, got {other}"
            )))
        }
    };

    Ok(DownloadRequest {
        url: required_string(object, "url")?,
        headers: parse_headers(object.get("headers"))?,
        path: required_string(object, "path")?,
        description,
    })
}
