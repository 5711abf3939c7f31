use super::errors::SubmissionError;
use crate::transfer::{NetworkTypes, NotificationVisibility, TransferRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// What a caller asks to download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the transfer-service request, saving into `downloads_dir`.
    ///
    /// The title is the destination path, the same value shown in the
    /// platform notification.
    pub fn to_transfer_request(
        &self,
        downloads_dir: &str,
    ) -> Result<TransferRequest, SubmissionError> {
        if self.url.trim().is_empty() {
            return Err(SubmissionError::MissingField("url"));
        }
        if self.path.trim().is_empty() {
            return Err(SubmissionError::MissingField("path"));
        }
        let url = Url::parse(&self.url).map_err(|source| SubmissionError::InvalidUrl {
            url: self.url.clone(),
            source,
        })?;

        let mut request = TransferRequest::new(url)
            .allowed_network_types(NetworkTypes::ALL)
            .allow_roaming(true)
            .title(self.path.as_str())
            .destination_in_public_dir(downloads_dir, self.path.as_str())
            .notification_visibility(NotificationVisibility::VisibleNotifyCompleted);
        if let Some(description) = &self.description {
            request = request.description(description.as_str());
        }

        for (name, value) in &self.headers {
            request = request.add_header(name.as_str(), value.as_str()).map_err(|e| {
                SubmissionError::InvalidHeader {
                    name: e.name,
                    reason: e.reason.to_string(),
                }
            })?;
        }

        Ok(request)
    }
}
