//! Request executor
//!
//! Builds and issues exactly one HTTP call per invocation. Non-200 responses
//! become [`ServiceError`]s carrying the originating method, transport
//! failures become retryable service errors, and cancellation is reported
//! as [`Error::Cancelled`]. Nothing here retries.

use super::{escape, types::ErrorMessage, ApiMethod, Error, Result, ServiceError};
use crate::logging::WIRE_TARGET;
use crate::session::SessionOptions;
use bytes::Bytes;
use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Carries the API method name of every request.
pub const METHOD_HEADER: &str = "x-b2e-method";

/// Carries a process-wide, monotonically increasing request id.
pub const REQUEST_ID_HEADER: &str = "x-b2e-request-id";

/// Asks the service to inject failures.
pub const TEST_MODE_HEADER: &str = "x-bz-test-mode";

/// Value of the content hash header that asks the service to read the hash
/// from the last 40 bytes of the body.
pub const DEFERRED_HASH_SENTINEL: &str = "hex_digits_at_end";

static REQUEST_ID: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref AUTH_TOKEN_FIELD: regex_lite::Regex =
        regex_lite::Regex::new(r#""authorizationToken"\s*:\s*"[^"]*""#).unwrap();
}

fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Body of a [`Call`]
enum Payload {
    Empty,
    Json(Vec<u8>),
    Stream { body: reqwest::Body, size: u64 },
}

/// One API call, fully described before it is sent.
pub(crate) struct Call {
    method: ApiMethod,
    verb: Method,
    uri: String,
    headers: Vec<(String, String)>,
    body: Payload,
}

impl Call {
    pub(crate) fn new(method: ApiMethod, verb: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            verb,
            uri: uri.into(),
            headers: Vec::new(),
            body: Payload::Empty,
        }
    }

    /// POST to a JSON API endpoint rooted at `api_url`
    pub(crate) fn api(method: ApiMethod, api_url: &str) -> Self {
        Self::new(method, Method::POST, method.uri(api_url))
    }

    pub(crate) fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn auth(self, token: &str) -> Self {
        self.header(AUTHORIZATION.as_str(), token)
    }

    pub(crate) fn json<T: Serialize>(mut self, request: &T) -> Result<Self> {
        self.body = Payload::Json(serde_json::to_vec(request)?);
        Ok(self)
    }

    /// Stream `size` bytes from `reader` as the body.
    ///
    /// The length is always sent explicitly. An empty stream is sent as an
    /// empty body rather than a chunked one.
    pub(crate) fn stream<R>(mut self, reader: R, size: u64) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let body = if size == 0 {
            reqwest::Body::from(Bytes::new())
        } else {
            reqwest::Body::wrap_stream(ReaderStream::new(reader))
        };
        self.body = Payload::Stream { body, size };
        self
    }
}

/// A response together with what is needed to log and classify it.
struct Sent {
    response: Response,
    method: ApiMethod,
    id: u64,
    started: Instant,
}

/// Issues [`Call`]s with the session's transport and request options.
#[derive(Debug, Clone)]
pub(crate) struct Executor {
    http: reqwest::Client,
    user_agent: String,
    test_modes: Vec<&'static str>,
}

impl Executor {
    pub(crate) fn new(options: &SessionOptions) -> Result<Self> {
        let http = match options.http_client() {
            Some(client) => client.clone(),
            None => reqwest::Client::builder().build()?,
        };
        Ok(Self {
            http,
            user_agent: options.user_agent_header(),
            test_modes: options.test_modes(),
        })
    }

    /// Issue `call` and decode a 200 response as `T`.
    pub(crate) async fn json<T: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        call: Call,
    ) -> Result<T> {
        let sent = self.dispatch(ctx, call).await?;
        let sent = self.accept(ctx, sent, &[StatusCode::OK]).await?;
        let status = sent.response.status();
        let body = cancellable(ctx, sent.response.bytes()).await?;
        let body = body.map_err(|e| Error::Service(ServiceError::transport(error_chain(&e))))?;
        log_response(sent.method, sent.id, status, None, Some(&body));
        Ok(serde_json::from_slice(&body)?)
    }

    /// Issue `call`, expect 200 and drain the body.
    pub(crate) async fn send(&self, ctx: &CancellationToken, call: Call) -> Result<()> {
        let sent = self.dispatch(ctx, call).await?;
        let sent = self.accept(ctx, sent, &[StatusCode::OK]).await?;
        let status = sent.response.status();
        match cancellable(ctx, sent.response.bytes()).await? {
            Ok(body) => log_response(sent.method, sent.id, status, None, Some(&body)),
            Err(e) => tracing::debug!(
                target: WIRE_TARGET,
                method = %sent.method,
                error = %e,
                "couldn't read response"
            ),
        }
        Ok(())
    }

    /// Issue `call` and hand back the unread response if its status is in
    /// `accepted`.
    pub(crate) async fn response(
        &self,
        ctx: &CancellationToken,
        call: Call,
        accepted: &[StatusCode],
    ) -> Result<Response> {
        let sent = self.dispatch(ctx, call).await?;
        let sent = self.accept(ctx, sent, accepted).await?;
        log_response(
            sent.method,
            sent.id,
            sent.response.status(),
            Some(sent.response.headers()),
            None,
        );
        Ok(sent.response)
    }

    async fn dispatch(&self, ctx: &CancellationToken, call: Call) -> Result<Sent> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Call {
            method,
            verb,
            uri,
            headers: extra,
            body,
        } = call;

        let id = next_request_id();
        let mut headers = HeaderMap::new();
        for (name, value) in &extra {
            let value = if escape::needs_escape(name) {
                escape::escape(value)
            } else {
                value.clone()
            };
            headers.insert(header_name(name)?, header_value(name, &value)?);
        }
        headers.insert(header_name(REQUEST_ID_HEADER)?, HeaderValue::from(id));
        headers.insert(
            header_name(METHOD_HEADER)?,
            HeaderValue::from_static(method.as_str()),
        );
        for mode in &self.test_modes {
            headers.append(header_name(TEST_MODE_HEADER)?, HeaderValue::from_static(mode));
        }
        headers.insert(
            reqwest::header::USER_AGENT,
            header_value("User-Agent", &self.user_agent)?,
        );

        let mut args = None;
        let builder = self.http.request(verb, &uri);
        let builder = match body {
            Payload::Empty => builder,
            Payload::Json(bytes) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                let body = Bytes::from(bytes);
                args = Some(body.clone());
                builder.body(body)
            }
            Payload::Stream { body, size } => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
                builder.body(body)
            }
        };
        let request = builder.headers(headers).build()?;
        log_request(&request, method, id, args.as_deref());

        let started = Instant::now();
        match cancellable(ctx, self.http.execute(request)).await? {
            Ok(response) => Ok(Sent {
                response,
                method,
                id,
                started,
            }),
            Err(e) => {
                tracing::debug!(
                    target: WIRE_TARGET,
                    method = %method,
                    uri = %uri,
                    error = %e,
                    ">> transport failure"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_request(method.as_str(), "transport", started.elapsed());
                Err(transport_error(e))
            }
        }
    }

    /// Pass `sent` through if its status is accepted, otherwise turn it into
    /// a [`ServiceError`].
    async fn accept(
        &self,
        ctx: &CancellationToken,
        sent: Sent,
        accepted: &[StatusCode],
    ) -> Result<Sent> {
        let status = sent.response.status();
        #[cfg(feature = "metrics")]
        crate::metrics::record_request(sent.method.as_str(), status.as_str(), sent.started.elapsed());
        if accepted.contains(&status) {
            return Ok(sent);
        }
        Err(service_error(ctx, sent).await)
    }
}

/// Run `fut` unless `ctx` is cancelled first.
pub(crate) async fn cancellable<F: Future>(ctx: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        output = fut => Ok(output),
    }
}

async fn service_error(ctx: &CancellationToken, sent: Sent) -> Error {
    let Sent {
        response,
        method,
        id,
        ..
    } = sent;
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let (code, message) = match cancellable(ctx, response.bytes()).await {
        Err(e) => return e,
        Ok(Err(e)) => (String::new(), format!("couldn't read message body: {}", e)),
        Ok(Ok(body)) => {
            log_response(method, id, status, None, Some(&body));
            match serde_json::from_slice::<ErrorMessage>(&body) {
                Ok(msg) => (msg.code, msg.message),
                Err(_) => (
                    String::new(),
                    String::from_utf8_lossy(&body).trim().to_string(),
                ),
            }
        }
    };
    Error::Service(ServiceError::new(
        Some(method),
        status.as_u16(),
        code,
        message,
        retry_after,
    ))
}

fn retry_after(headers: &HeaderMap) -> u64 {
    let Some(value) = headers.get(reqwest::header::RETRY_AFTER) else {
        return 0;
    };
    match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(secs) => secs,
        None => {
            tracing::debug!(retry_after = ?value, "couldn't parse retry-after header");
            0
        }
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if is_untrusted_certificate(&e) {
        return Error::UntrustedCertificate(e);
    }
    Error::Service(ServiceError::transport(error_chain(&e)))
}

/// The unknown-issuer failure surfaces somewhere in the source chain of the
/// connect error.
fn is_untrusted_certificate(e: &reqwest::Error) -> bool {
    let mut source: Option<&dyn std::error::Error> = Some(e);
    while let Some(err) = source {
        let text = err.to_string();
        if text.contains("UnknownIssuer") || text.contains("unknown issuer") {
            return true;
        }
        source = err.source();
    }
    false
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }
    text
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))
}

/// `Range` header value for a download of `size` bytes at `offset`.
///
/// `(0, 0)` asks for the whole object and yields `None`; a zero size means
/// "to the end".
pub fn make_range(offset: u64, size: u64) -> Option<String> {
    match (offset, size) {
        (0, 0) => None,
        (offset, 0) => Some(format!("bytes={}-", offset)),
        (offset, size) => Some(format!("bytes={}-{}", offset, offset + size - 1)),
    }
}

/// Replace authorization token values in a logged body.
pub(crate) fn redact(body: &str) -> String {
    AUTH_TOKEN_FIELD
        .replace_all(body, r#""authorizationToken": "[redacted]""#)
        .into_owned()
}

fn loggable_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .filter(|(name, _)| {
            *name != AUTHORIZATION
                && name.as_str() != METHOD_HEADER
                && name.as_str() != REQUEST_ID_HEADER
        })
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("<binary>")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn log_request(request: &reqwest::Request, method: ApiMethod, id: u64, args: Option<&[u8]>) {
    if !tracing::enabled!(target: WIRE_TARGET, Level::DEBUG) {
        return;
    }
    let headers = loggable_headers(request.headers());
    match args {
        Some(args) => tracing::debug!(
            target: WIRE_TARGET,
            request_id = id,
            ">> {} {} {} headers: {{{}}} args: ({})",
            method,
            request.method(),
            request.url(),
            headers,
            redact(&String::from_utf8_lossy(args))
        ),
        None => tracing::debug!(
            target: WIRE_TARGET,
            request_id = id,
            ">> {} {} {} {{{}}} (no args)",
            method,
            request.method(),
            request.url(),
            headers
        ),
    }
}

fn log_response(
    method: ApiMethod,
    id: u64,
    status: StatusCode,
    headers: Option<&HeaderMap>,
    reply: Option<&[u8]>,
) {
    if !tracing::enabled!(target: WIRE_TARGET, Level::DEBUG) {
        return;
    }
    let headers = headers.map(loggable_headers).unwrap_or_default();
    match reply {
        Some(reply) => tracing::debug!(
            target: WIRE_TARGET,
            request_id = id,
            "<< {} ({}) {} {{{}}} ({})",
            method,
            id,
            status,
            headers,
            redact(&String::from_utf8_lossy(reply))
        ),
        None => tracing::debug!(
            target: WIRE_TARGET,
            request_id = id,
            "<< {} ({}) {} {{{}}} (no reply)",
            method,
            id,
            status,
            headers
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_range() {
        assert_eq!(make_range(0, 0), None);
        assert_eq!(make_range(100, 0).as_deref(), Some("bytes=100-"));
        assert_eq!(make_range(0, 10).as_deref(), Some("bytes=0-9"));
        assert_eq!(make_range(5, 1).as_deref(), Some("bytes=5-5"));
    }

    #[test]
    fn test_redact_keeps_shape() {
        let body = r#"{"accountId": "a", "authorizationToken": "4_0022secret=", "apiUrl": "u"}"#;
        assert_eq!(
            redact(body),
            r#"{"accountId": "a", "authorizationToken": "[redacted]", "apiUrl": "u"}"#
        );

        let compact = r#"{"authorizationToken":"x","uploadUrl":"https://pod"}"#;
        assert_eq!(
            redact(compact),
            r#"{"authorizationToken": "[redacted]","uploadUrl":"https://pod"}"#
        );
    }

    #[test]
    fn test_request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[test]
    fn test_request_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| next_request_id()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_loggable_headers_strip_secrets() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("token"));
        headers.insert(
            HeaderName::from_static(METHOD_HEADER),
            HeaderValue::from_static("b2_list_buckets"),
        );
        headers.insert(
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderValue::from_static("7"),
        );
        headers.insert(
            HeaderName::from_static("x-bz-file-name"),
            HeaderValue::from_static("a.txt"),
        );
        assert_eq!(loggable_headers(&headers), "x-bz-file-name: a.txt");
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), 0);
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), 12);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), 0);
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = cancellable(&ctx, async { 1 }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
