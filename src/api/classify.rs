//! Failure classification
//!
//! Maps any error returned by this crate onto one recommended recovery
//! [`Action`], plus the retry and re-upload budgets for it. Everything here
//! is pure so it can be tested without a network.

use super::{ApiMethod, Error, ServiceError};
use std::time::Duration;

/// Message prefix the service uses when two uploads race on one upload token.
const CONTENDED_UPLOAD_TOKEN: &str = "more than one upload using auth token";

/// What a caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// The account authorization token expired; authorize again and replace
    /// the session.
    ReAuthenticate,

    /// The upload URL or its token is no longer usable; request a new one
    /// with `get_upload_url` / `get_upload_part_url` and upload again.
    AttemptNewUpload,

    /// Wait (see [`backoff`]) and repeat the same call.
    Retry,

    /// Nothing useful can be done automatically; surface the error.
    Punt,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ReAuthenticate => "reauthenticate",
            Action::AttemptNewUpload => "attempt_new_upload",
            Action::Retry => "retry",
            Action::Punt => "punt",
        }
    }
}

/// Classify a failure from its parts.
pub fn classify(status: u16, method: Option<ApiMethod>, message: &str, retry_after: u64) -> Action {
    if retry_after > 0 {
        return Action::Retry;
    }
    let upload = method.is_some_and(|m| m.is_upload());
    if (500..600).contains(&status) && upload {
        return Action::AttemptNewUpload;
    }
    match status {
        401 => match method {
            Some(ApiMethod::AuthorizeAccount) => Action::Punt,
            Some(m) if m.is_upload() => Action::AttemptNewUpload,
            _ => Action::ReAuthenticate,
        },
        400 => {
            if method == Some(ApiMethod::UploadFile) && message.starts_with(CONTENDED_UPLOAD_TOKEN)
            {
                Action::AttemptNewUpload
            } else {
                Action::Punt
            }
        }
        408 => Action::AttemptNewUpload,
        429 | 500 | 503 => Action::Retry,
        _ => Action::Punt,
    }
}

fn service(err: &Error) -> Option<&ServiceError> {
    match err {
        Error::Service(e) => Some(e),
        _ => None,
    }
}

/// Recommended action for any error returned by this crate.
pub fn action(err: &Error) -> Action {
    match service(err) {
        Some(e) => classify(e.status, e.method, &e.message, e.retry_after),
        None => Action::Punt,
    }
}

/// How long the service asked us to wait.
///
/// Zero when the service gave no hint; callers that still see
/// [`Action::Retry`] should fall back to their own exponential backoff
/// starting at one second.
pub fn backoff(err: &Error) -> Duration {
    match service(err) {
        Some(e) => Duration::from_secs(e.retry_after),
        None => Duration::ZERO,
    }
}

/// Retry budget for the call that produced `err`.
pub fn max_retries(err: &Error) -> u32 {
    match service(err) {
        None => 0,
        Some(e) => match e.method {
            Some(m) if m.is_upload() || m.is_download() => 20,
            _ => 5,
        },
    }
}

/// Re-upload budget for the call that produced `err`.
///
/// Errors that never reached the service (a short read, a size mismatch)
/// get a few re-uploads as well.
pub fn max_reuploads(err: &Error) -> u32 {
    match service(err) {
        None => 5,
        Some(e) => match e.method {
            Some(m) if m.is_upload() => 5,
            _ => 0,
        },
    }
}

/// HTTP status and message of a service error.
pub fn code(err: &Error) -> Option<(u16, &str)> {
    service(err).map(|e| (e.status, e.message.as_str()))
}

/// HTTP status, service message code and message of a service error.
pub fn msg_code(err: &Error) -> Option<(u16, &str, &str)> {
    service(err).map(|e| (e.status, e.code.as_str(), e.message.as_str()))
}
