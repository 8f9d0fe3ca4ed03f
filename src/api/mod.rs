//! B2 API plumbing
//!
//! Error types, the failure classifier, header escaping, wire types and the
//! request executor that every session handle goes through.

use std::fmt;
use thiserror::Error;

pub mod classify;
pub mod escape;
pub mod request;
pub mod types;

pub use classify::Action;

/// Path segment shared by every JSON API call.
pub const API_VERSION_PATH: &str = "/b2api/v3/";

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by every network-facing operation
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("request cancelled")]
    Cancelled,

    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(#[source] reqwest::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("{method}: invalid index {index}")]
    InvalidPartIndex { method: ApiMethod, index: u32 },

    #[error("large file {0} is no longer open")]
    LargeFileClosed(String),

    #[error("deferred hash unavailable: {0}")]
    DeferredHash(String),
}

impl From<crate::retry::Cancelled> for Error {
    fn from(_: crate::retry::Cancelled) -> Self {
        Error::Cancelled
    }
}

/// A failure reported by the service, or a transport failure standing in for one.
///
/// Fields are private; use the functions in [`classify`] to inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub(crate) message: String,
    pub(crate) method: Option<ApiMethod>,
    pub(crate) status: u16,
    pub(crate) code: String,
    pub(crate) retry_after: u64,
}

impl ServiceError {
    pub(crate) fn new(
        method: Option<ApiMethod>,
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after: u64,
    ) -> Self {
        Self {
            message: message.into(),
            method,
            status,
            code: code.into(),
            retry_after,
        }
    }

    /// Transport failures carry no method and ask for a one second backoff.
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::new(None, 0, "", message, 1)
    }
}

impl std::error::Error for ServiceError {}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            None => write!(f, "b2 error: {}", self.message),
            Some(method) => write!(f, "{}: {}: {}", method, self.status, self.message),
        }
    }
}

/// Names of the API calls this crate issues.
///
/// The name travels with every request so the classifier can tell an upload
/// failure from a listing failure with the same status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    AuthorizeAccount,
    CreateBucket,
    DeleteBucket,
    ListBuckets,
    GetUploadUrl,
    UploadFile,
    DeleteFileVersion,
    StartLargeFile,
    CancelLargeFile,
    ListParts,
    GetUploadPartUrl,
    UploadPart,
    FinishLargeFile,
    ListUnfinishedLargeFiles,
    ListFileNames,
    ListFileVersions,
    HideFile,
    GetFileInfo,
    GetDownloadAuthorization,
    DownloadFileByName,
    DownloadFileById,
}

impl ApiMethod {
    /// Wire name of the call, e.g. `b2_upload_part`
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::AuthorizeAccount => "b2_authorize_account",
            ApiMethod::CreateBucket => "b2_create_bucket",
            ApiMethod::DeleteBucket => "b2_delete_bucket",
            ApiMethod::ListBuckets => "b2_list_buckets",
            ApiMethod::GetUploadUrl => "b2_get_upload_url",
            ApiMethod::UploadFile => "b2_upload_file",
            ApiMethod::DeleteFileVersion => "b2_delete_file_version",
            ApiMethod::StartLargeFile => "b2_start_large_file",
            ApiMethod::CancelLargeFile => "b2_cancel_large_file",
            ApiMethod::ListParts => "b2_list_parts",
            ApiMethod::GetUploadPartUrl => "b2_get_upload_part_url",
            ApiMethod::UploadPart => "b2_upload_part",
            ApiMethod::FinishLargeFile => "b2_finish_large_file",
            ApiMethod::ListUnfinishedLargeFiles => "b2_list_unfinished_large_files",
            ApiMethod::ListFileNames => "b2_list_file_names",
            ApiMethod::ListFileVersions => "b2_list_file_versions",
            ApiMethod::HideFile => "b2_hide_file",
            ApiMethod::GetFileInfo => "b2_get_file_info",
            ApiMethod::GetDownloadAuthorization => "b2_get_download_authorization",
            ApiMethod::DownloadFileByName => "b2_download_file_by_name",
            ApiMethod::DownloadFileById => "b2_download_file_by_id",
        }
    }

    /// `b2_upload_file` or `b2_upload_part`
    pub fn is_upload(&self) -> bool {
        matches!(self, ApiMethod::UploadFile | ApiMethod::UploadPart)
    }

    pub fn is_download(&self) -> bool {
        matches!(
            self,
            ApiMethod::DownloadFileByName | ApiMethod::DownloadFileById
        )
    }

    /// URI of a JSON API call rooted at `api_url`
    pub(crate) fn uri(&self, api_url: &str) -> String {
        format!("{}{}{}", api_url, API_VERSION_PATH, self.as_str())
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::new(
            Some(ApiMethod::UploadPart),
            503,
            "service_unavailable",
            "c001 is too busy",
            0,
        );
        assert_eq!(err.to_string(), "b2_upload_part: 503: c001 is too busy");

        let transport = ServiceError::transport("connection reset");
        assert_eq!(transport.to_string(), "b2 error: connection reset");
    }

    #[test]
    fn test_invalid_part_index_display() {
        let err = Error::InvalidPartIndex {
            method: ApiMethod::FinishLargeFile,
            index: 3,
        };
        assert_eq!(err.to_string(), "b2_finish_large_file: invalid index 3");
    }

    #[test]
    fn test_method_uri() {
        assert_eq!(
            ApiMethod::ListParts.uri("https://api001.backblazeb2.com"),
            "https://api001.backblazeb2.com/b2api/v3/b2_list_parts"
        );
    }

    #[test]
    fn test_upload_and_download_methods() {
        assert!(ApiMethod::UploadFile.is_upload());
        assert!(ApiMethod::UploadPart.is_upload());
        assert!(!ApiMethod::GetUploadPartUrl.is_upload());
        assert!(ApiMethod::DownloadFileById.is_download());
        assert!(!ApiMethod::ListFileNames.is_download());
    }
}
