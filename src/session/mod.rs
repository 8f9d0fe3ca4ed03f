//! Account session
//!
//! A [`Session`] is a cheap, cloneable handle on one authorized account.
//! Every bucket, file and lease handle keeps a clone, so replacing the
//! session after re-authentication is seen by all of them at once.

use crate::api::request::{Call, Executor};
use crate::api::types::{
    AuthorizeAccountResponse, BucketResponse, CreateBucketRequest, ListBucketsRequest,
    ListBucketsResponse,
};
use crate::api::{ApiMethod, Result};
use base64::Engine;
use parking_lot::RwLock;
use reqwest::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod bucket;
pub mod file;

pub use bucket::{Bucket, FileReader, UploadUrl};
pub use file::{File, FileInfo, FilePart};

/// Production API endpoint
pub const DEFAULT_API_BASE: &str = "https://api.backblazeb2.com";

/// User agent sent when no prefix is configured
pub const DEFAULT_USER_AGENT: &str = concat!("b2-engine/", env!("CARGO_PKG_VERSION"));

/// Per-session request settings.
///
/// # Example
///
/// ```
/// use b2_engine::session::SessionOptions;
///
/// let options = SessionOptions::new()
///     .user_agent("backup/2.1")
///     .fail_some_uploads();
/// assert!(options.user_agent_header().starts_with("backup/2.1 b2-engine/"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    transport: Option<reqwest::Client>,
    user_agent: Option<String>,
    api_base: Option<String>,
    fail_some_uploads: bool,
    expire_some_tokens: bool,
    force_cap_exceeded: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `client` for every request of the session.
    pub fn transport(mut self, client: reqwest::Client) -> Self {
        self.transport = Some(client);
        self
    }

    /// Prepend `agent` to the User-Agent header. May be given more than once;
    /// the last one given comes first.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        self.user_agent = Some(match self.user_agent.take() {
            None => agent,
            Some(existing) => format!("{} {}", agent, existing),
        });
        self
    }

    /// Authorize against `url` instead of [`DEFAULT_API_BASE`].
    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = Some(url.into());
        self
    }

    /// Ask the service to fail some uploads.
    pub fn fail_some_uploads(mut self) -> Self {
        self.fail_some_uploads = true;
        self
    }

    /// Ask the service to expire some account authorization tokens.
    pub fn expire_some_auth_tokens(mut self) -> Self {
        self.expire_some_tokens = true;
        self
    }

    /// Ask the service to treat every upload as over the storage cap.
    pub fn force_cap_exceeded(mut self) -> Self {
        self.force_cap_exceeded = true;
        self
    }

    pub fn user_agent_header(&self) -> String {
        match &self.user_agent {
            Some(prefix) => format!("{} {}", prefix, DEFAULT_USER_AGENT),
            None => DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)
    }

    pub(crate) fn http_client(&self) -> Option<&reqwest::Client> {
        self.transport.as_ref()
    }

    pub(crate) fn test_modes(&self) -> Vec<&'static str> {
        let mut modes = Vec::new();
        if self.fail_some_uploads {
            modes.push("fail_some_uploads");
        }
        if self.expire_some_tokens {
            modes.push("expire_some_account_authorization_tokens");
        }
        if self.force_cap_exceeded {
            modes.push("force_cap_exceeded");
        }
        modes
    }
}

/// Immutable snapshot of an authorized account.
pub(crate) struct SessionState {
    pub(crate) account_id: String,
    pub(crate) auth_token: String,
    pub(crate) api_url: String,
    pub(crate) download_url: String,
    pub(crate) s3_api_url: String,
    pub(crate) min_part_size: u64,
    pub(crate) recommended_part_size: u64,
    pub(crate) bucket_id: Option<String>,
    pub(crate) name_prefix: Option<String>,
    pub(crate) executor: Executor,
    options: SessionOptions,
    key_id: String,
    key: String,
}

/// Handle on an authorized account
#[derive(Clone)]
pub struct Session {
    state: Arc<RwLock<Arc<SessionState>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.snapshot();
        f.debug_struct("Session")
            .field("account_id", &state.account_id)
            .field("api_url", &state.api_url)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Authorize `account` with application key `key`.
    #[tracing::instrument(name = "b2.authorize", skip(ctx, key, options), err)]
    pub async fn authorize(
        ctx: &CancellationToken,
        account: &str,
        key: &str,
        options: SessionOptions,
    ) -> Result<Session> {
        let executor = Executor::new(&options)?;
        let basic = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", account, key));
        let method = ApiMethod::AuthorizeAccount;
        let call = Call::new(method, Method::GET, method.uri(options.api_base_url()))
            .auth(&format!("Basic {}", basic));
        let resp: AuthorizeAccountResponse = executor.json(ctx, call).await?;
        let storage = resp.api_info.storage_api;

        tracing::info!(
            account_id = %resp.account_id,
            api_url = %storage.api_url,
            "Authorized account"
        );

        Ok(Session {
            state: Arc::new(RwLock::new(Arc::new(SessionState {
                account_id: resp.account_id,
                auth_token: resp.authorization_token,
                api_url: storage.api_url,
                download_url: storage.download_url,
                s3_api_url: storage.s3_api_url,
                min_part_size: storage.absolute_minimum_part_size,
                recommended_part_size: storage.recommended_part_size,
                bucket_id: storage.bucket_id,
                name_prefix: storage.name_prefix,
                executor,
                options,
                key_id: account.to_string(),
                key: key.to_string(),
            }))),
        })
    }

    /// Swap in the state of `other`. Handles cloned from `self` see the new
    /// state on their next call; calls already in flight keep the old one.
    pub fn replace(&self, other: &Session) {
        let next = other.snapshot();
        *self.state.write() = next;
    }

    /// Authorize again with the same credentials and options, then
    /// [`replace`](Self::replace).
    pub async fn reauthenticate(&self, ctx: &CancellationToken) -> Result<()> {
        let state = self.snapshot();
        let fresh = Session::authorize(ctx, &state.key_id, &state.key, state.options.clone()).await?;
        self.replace(&fresh);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Arc<SessionState> {
        self.state.read().clone()
    }

    pub fn account_id(&self) -> String {
        self.snapshot().account_id.clone()
    }

    pub fn api_url(&self) -> String {
        self.snapshot().api_url.clone()
    }

    pub fn download_url(&self) -> String {
        self.snapshot().download_url.clone()
    }

    pub fn s3_api_url(&self) -> String {
        self.snapshot().s3_api_url.clone()
    }

    pub fn min_part_size(&self) -> u64 {
        self.snapshot().min_part_size
    }

    pub fn recommended_part_size(&self) -> u64 {
        self.snapshot().recommended_part_size
    }

    /// Bucket the key is restricted to, if any
    pub fn allowed_bucket_id(&self) -> Option<String> {
        self.snapshot().bucket_id.clone()
    }

    /// Name prefix the key is restricted to, if any
    pub fn name_prefix(&self) -> Option<String> {
        self.snapshot().name_prefix.clone()
    }

    /// Create a bucket. Any type other than `allPublic` becomes `allPrivate`.
    pub async fn create_bucket(
        &self,
        ctx: &CancellationToken,
        name: &str,
        bucket_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<Bucket> {
        let state = self.snapshot();
        let bucket_type = if bucket_type == "allPublic" {
            "allPublic"
        } else {
            "allPrivate"
        };
        let req = CreateBucketRequest {
            account_id: &state.account_id,
            bucket_name: name,
            bucket_type,
            bucket_info: (!info.is_empty()).then_some(info),
        };
        let call = Call::api(ApiMethod::CreateBucket, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: BucketResponse = state.executor.json(ctx, call).await?;
        Ok(Bucket::from_response(resp, self.clone()))
    }

    /// List buckets, or only the bucket called `name`.
    pub async fn list_buckets(
        &self,
        ctx: &CancellationToken,
        name: Option<&str>,
    ) -> Result<Vec<Bucket>> {
        let state = self.snapshot();
        let req = ListBucketsRequest {
            account_id: &state.account_id,
            bucket_id: state.bucket_id.as_deref(),
            bucket_name: name,
        };
        let call = Call::api(ApiMethod::ListBuckets, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: ListBucketsResponse = state.executor.json(ctx, call).await?;
        Ok(resp
            .buckets
            .into_iter()
            .map(|b| Bucket::from_response(b, self.clone()))
            .collect())
    }
}
