//! Large-file upload session
//!
//! A [`LargeFile`] owns the ledger of parts uploaded so far: part number to
//! content hash, plus the running byte total. Any number of [`PartUrl`]s
//! may upload into it concurrently; every update and the read that builds
//! the finish request happen under one async mutex.

use super::deferred_hash::DeferredHashReader;
use super::{ContentHash, Lease};
use crate::api::request::Call;
use crate::api::types::{
    FileIdRequest, FileResponse, FinishLargeFileRequest, GetUploadPartUrlRequest,
    UploadUrlResponse,
};
use crate::api::{ApiMethod, Error, Result};
use crate::retry::policy::{retrier, Recovery};
use crate::session::file::{list_parts, millitime};
use crate::session::{File, FilePart, Session};
use bytes::Bytes;
use reqwest::Method;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Cancelled,
}

#[derive(Debug)]
struct PartLedger {
    size: u64,
    hashes: BTreeMap<u32, String>,
    state: State,
}

impl PartLedger {
    fn ensure_open(&self, file_id: &str) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Finished | State::Cancelled => Err(Error::LargeFileClosed(file_id.to_string())),
        }
    }

    /// Hashes in part order. Fails on the first missing part number.
    fn ordered_hashes(&self) -> Result<Vec<String>> {
        let mut ordered = Vec::with_capacity(self.hashes.len());
        for (expected, (&number, hash)) in (1u32..).zip(&self.hashes) {
            if number != expected {
                return Err(Error::InvalidPartIndex {
                    method: ApiMethod::FinishLargeFile,
                    index: expected,
                });
            }
            ordered.push(hash.clone());
        }
        Ok(ordered)
    }
}

struct Inner {
    id: String,
    session: Session,
    ledger: Mutex<PartLedger>,
}

/// Handle on an unfinished large file. Clones share the ledger.
#[derive(Clone)]
pub struct LargeFile {
    inner: Arc<Inner>,
}

impl fmt::Debug for LargeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LargeFile")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl LargeFile {
    pub(crate) fn new(id: String, session: Session, size: u64, hashes: BTreeMap<u32, String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                session,
                ledger: Mutex::new(PartLedger {
                    size,
                    hashes,
                    state: State::Open,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Bytes recorded so far
    pub async fn size(&self) -> u64 {
        self.inner.ledger.lock().await.size
    }

    /// Copy of the recorded part hashes
    pub async fn hashes(&self) -> BTreeMap<u32, String> {
        self.inner.ledger.lock().await.hashes.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.ledger.lock().await.state == State::Open
    }

    /// Lease an endpoint for uploading parts.
    pub async fn get_upload_part_url(&self, ctx: &CancellationToken) -> Result<PartUrl> {
        let state = self.inner.session.snapshot();
        let call = Call::api(ApiMethod::GetUploadPartUrl, &state.api_url)
            .auth(&state.auth_token)
            .json(&GetUploadPartUrlRequest {
                file_id: &self.inner.id,
            })?;
        let resp: UploadUrlResponse = state.executor.json(ctx, call).await?;
        Ok(PartUrl {
            lease: Lease::new(resp.upload_url, resp.authorization_token),
            file: self.clone(),
        })
    }

    /// One page of the parts the service holds for this file.
    pub async fn list_parts(
        &self,
        ctx: &CancellationToken,
        next: u32,
        count: u32,
    ) -> Result<(Vec<FilePart>, Option<u32>)> {
        list_parts(&self.inner.session, ctx, &self.inner.id, next, count).await
    }

    /// Assemble the recorded parts into one file.
    ///
    /// Part numbers must run from 1 without gaps; otherwise this fails
    /// before contacting the service, naming the first missing part. The
    /// ledger stays locked until the service answers, so no part can land
    /// in between.
    #[tracing::instrument(
        name = "b2.large_file.finish",
        skip(self, ctx),
        fields(file_id = %self.inner.id),
        err
    )]
    pub async fn finish(&self, ctx: &CancellationToken) -> Result<File> {
        let mut ledger = self.inner.ledger.lock().await;
        ledger.ensure_open(&self.inner.id)?;
        let part_sha1_array = ledger.ordered_hashes()?;
        let parts = part_sha1_array.len();

        let state = self.inner.session.snapshot();
        let req = FinishLargeFileRequest {
            file_id: &self.inner.id,
            part_sha1_array,
        };
        let call = Call::api(ApiMethod::FinishLargeFile, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: FileResponse = state.executor.json(ctx, call).await?;
        ledger.state = State::Finished;

        tracing::info!(
            file = %resp.file_name,
            parts,
            size = ledger.size,
            "Finished large file"
        );
        #[cfg(feature = "metrics")]
        {
            crate::metrics::record_large_file("finished");
            crate::metrics::record_parts(parts);
        }

        Ok(File {
            name: resp.file_name,
            size: ledger.size,
            status: resp.action,
            timestamp: millitime(resp.upload_timestamp),
            info: None,
            id: resp.file_id,
            session: self.inner.session.clone(),
        })
    }

    /// Abandon the file and release its parts on the service.
    #[tracing::instrument(
        name = "b2.large_file.cancel",
        skip(self, ctx),
        fields(file_id = %self.inner.id),
        err
    )]
    pub async fn cancel(&self, ctx: &CancellationToken) -> Result<()> {
        let mut ledger = self.inner.ledger.lock().await;
        ledger.ensure_open(&self.inner.id)?;

        let state = self.inner.session.snapshot();
        let call = Call::api(ApiMethod::CancelLargeFile, &state.api_url)
            .auth(&state.auth_token)
            .json(&FileIdRequest {
                file_id: &self.inner.id,
            })?;
        state.executor.send(ctx, call).await?;
        ledger.state = State::Cancelled;

        tracing::info!("Cancelled large file");
        #[cfg(feature = "metrics")]
        crate::metrics::record_large_file("cancelled");
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        self.inner.ledger.lock().await.ensure_open(&self.inner.id)
    }

    async fn record(&self, index: u32, hash: String, size: u64) -> Result<()> {
        let mut ledger = self.inner.ledger.lock().await;
        ledger.ensure_open(&self.inner.id)?;
        ledger.hashes.insert(index, hash);
        ledger.size += size;
        Ok(())
    }
}

/// Upload lease for the parts of one large file.
///
/// One task at a time; give each concurrent uploader its own lease.
#[derive(Debug)]
pub struct PartUrl {
    lease: Lease,
    file: LargeFile,
}

impl PartUrl {
    pub fn large_file(&self) -> &LargeFile {
        &self.file
    }

    /// Replace the endpoint and token with a freshly issued pair. Uploads
    /// already running keep the pair they started with.
    pub async fn reload(&self, ctx: &CancellationToken) -> Result<()> {
        let next = self.file.get_upload_part_url(ctx).await?;
        self.lease.set(next.lease);
        Ok(())
    }

    /// Upload `size` bytes from `reader` as part `index` (1-based) and
    /// record its hash and size. Returns the bytes uploaded. Index 0 is
    /// rejected before anything is sent.
    ///
    /// With [`ContentHash::Deferred`] the last 40 bytes of the body are the
    /// part's hex hash and are what gets recorded. Uploading the same index
    /// twice keeps the later hash but counts both sizes.
    #[tracing::instrument(
        name = "b2.large_file.upload_part",
        skip(self, ctx, reader, hash),
        fields(file_id = %self.file.inner.id, part_number = index, upload.bytes = size),
        err
    )]
    pub async fn upload_part<R>(
        &self,
        ctx: &CancellationToken,
        reader: R,
        hash: ContentHash,
        size: u64,
        index: u32,
    ) -> Result<u64>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        if index == 0 {
            return Err(Error::InvalidPartIndex {
                method: ApiMethod::UploadPart,
                index,
            });
        }
        self.file.ensure_open().await?;

        let endpoint = self.lease.get();
        let call = Call::new(ApiMethod::UploadPart, Method::POST, endpoint.uri.as_str())
            .auth(&endpoint.token)
            .header("X-Bz-Part-Number", index.to_string())
            .header("X-Bz-Content-Sha1", hash.header_value());
        let (call, deferred) = match &hash {
            ContentHash::Known(_) => (call.stream(reader, size), None),
            ContentHash::Deferred => {
                let reader = DeferredHashReader::new(reader, size);
                let deferred = reader.hash();
                (call.stream(reader, size), Some(deferred))
            }
        };

        let state = self.file.inner.session.snapshot();
        state.executor.send(ctx, call).await?;

        let recorded = match deferred {
            Some(deferred) => deferred.resolve()?,
            None => hash.header_value().to_string(),
        };
        self.file.record(index, recorded, size).await?;

        tracing::debug!("Uploaded part");
        #[cfg(feature = "metrics")]
        crate::metrics::record_upload_bytes(ApiMethod::UploadPart.as_str(), size);
        Ok(size)
    }

    /// [`upload_part`](Self::upload_part) from memory, recovering from
    /// failures the classifier says are recoverable: a new lease on
    /// `AttemptNewUpload`, a new session on `ReAuthenticate`, a wait on
    /// `Retry`.
    pub async fn upload_part_with_retry(
        &self,
        ctx: &CancellationToken,
        data: Bytes,
        hash: ContentHash,
        index: u32,
    ) -> Result<u64> {
        let recovery = Recovery::new();
        let recovery = &recovery;
        let session = &self.file.inner.session;
        let size = data.len() as u64;
        retrier(recovery)
            .run(ctx, move |_| {
                let body = Cursor::new(data.clone());
                let hash = hash.clone();
                async move {
                    recovery.apply(ctx, session, self.reload(ctx)).await?;
                    self.upload_part(ctx, body, hash, size, index).await
                }
            })
            .await
    }
}
