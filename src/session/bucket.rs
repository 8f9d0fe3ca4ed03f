//! Bucket handles, plain-file upload leases and downloads

use super::file::{File, FileInfo};
use super::{Session, SessionState};
use crate::api::escape::{escape, unescape};
use crate::api::request::{make_range, Call};
use crate::api::types::{
    BucketResponse, DeleteBucketRequest, FileResponse, GetDownloadAuthorizationRequest,
    GetDownloadAuthorizationResponse, GetUploadUrlRequest, HideFileRequest,
    ListFileNamesRequest, ListFileNamesResponse, ListFileVersionsRequest,
    ListFileVersionsResponse, ListUnfinishedLargeFilesRequest,
    ListUnfinishedLargeFilesResponse, StartLargeFileRequest, UploadUrlResponse,
};
use crate::api::{ApiMethod, Error, Result};
use crate::retry::policy::{retrier, Recovery};
use crate::upload::{ContentHash, LargeFile, Lease};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

const INFO_HEADER_PREFIX: &str = "x-bz-info-";

/// Info key the service stores the whole-file hash of a large file under
const LARGE_FILE_SHA1: &str = "large_file_sha1";

/// Handle on one bucket
#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub id: String,
    /// `allPublic` or `allPrivate`
    pub bucket_type: String,
    pub info: HashMap<String, String>,
    pub revision: u64,
    pub(crate) session: Session,
}

impl Bucket {
    pub(crate) fn from_response(resp: BucketResponse, session: Session) -> Self {
        Self {
            name: resp.bucket_name,
            id: resp.bucket_id,
            bucket_type: resp.bucket_type,
            info: resp.bucket_info,
            revision: resp.revision,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn delete_bucket(&self, ctx: &CancellationToken) -> Result<()> {
        let state = self.session.snapshot();
        let req = DeleteBucketRequest {
            account_id: &state.account_id,
            bucket_id: &self.id,
        };
        let call = Call::api(ApiMethod::DeleteBucket, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        state.executor.send(ctx, call).await?;
        tracing::info!(bucket = %self.name, "Deleted bucket");
        Ok(())
    }

    /// Base of the bucket's download URLs
    pub fn base_url(&self) -> String {
        self.session.download_url()
    }

    /// Base of S3-compatible calls
    pub fn s3_url(&self) -> String {
        self.session.s3_api_url()
    }

    /// Bare handle on a file version known by id and name
    pub fn file(&self, id: impl Into<String>, name: impl Into<String>) -> File {
        File {
            name: name.into(),
            size: 0,
            status: "upload".to_string(),
            timestamp: Default::default(),
            info: None,
            id: id.into(),
            session: self.session.clone(),
        }
    }

    /// Lease an endpoint for plain uploads.
    pub async fn get_upload_url(&self, ctx: &CancellationToken) -> Result<UploadUrl> {
        let state = self.session.snapshot();
        let call = Call::api(ApiMethod::GetUploadUrl, &state.api_url)
            .auth(&state.auth_token)
            .json(&GetUploadUrlRequest { bucket_id: &self.id })?;
        let resp: UploadUrlResponse = state.executor.json(ctx, call).await?;
        Ok(UploadUrl {
            lease: Lease::new(resp.upload_url, resp.authorization_token),
            bucket: self.clone(),
        })
    }

    /// Start a large file. Parts are added through
    /// [`LargeFile::get_upload_part_url`].
    #[tracing::instrument(
        name = "b2.large_file.start",
        skip(self, ctx, info),
        fields(bucket = %self.name),
        err
    )]
    pub async fn start_large_file(
        &self,
        ctx: &CancellationToken,
        name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<LargeFile> {
        let state = self.session.snapshot();
        let req = StartLargeFileRequest {
            bucket_id: &self.id,
            file_name: name,
            content_type,
            file_info: (!info.is_empty()).then_some(info),
        };
        let call = Call::api(ApiMethod::StartLargeFile, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: FileResponse = state.executor.json(ctx, call).await?;
        tracing::info!(file_id = %resp.file_id, "Started large file");
        Ok(LargeFile::new(
            resp.file_id,
            self.session.clone(),
            0,
            BTreeMap::new(),
        ))
    }

    /// One page of unfinished large files, and where the next page starts.
    pub async fn list_unfinished_large_files(
        &self,
        ctx: &CancellationToken,
        count: u32,
        continuation: Option<&str>,
    ) -> Result<(Vec<File>, Option<String>)> {
        let state = self.session.snapshot();
        let req = ListUnfinishedLargeFilesRequest {
            bucket_id: &self.id,
            start_file_id: continuation,
            max_file_count: (count > 0).then_some(count),
        };
        let call = Call::api(ApiMethod::ListUnfinishedLargeFiles, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: ListUnfinishedLargeFilesResponse = state.executor.json(ctx, call).await?;
        let files = resp
            .files
            .into_iter()
            .map(|f| File::from_response(f, self.session.clone()))
            .collect();
        Ok((files, resp.next_file_id))
    }

    /// One page of the latest file versions, and the name the next page
    /// starts at. Without a prefix, the key's name restriction applies.
    pub async fn list_file_names(
        &self,
        ctx: &CancellationToken,
        count: u32,
        continuation: Option<&str>,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<(Vec<File>, Option<String>)> {
        let state = self.session.snapshot();
        let prefix = prefix.or(state.name_prefix.as_deref());
        let req = ListFileNamesRequest {
            bucket_id: &self.id,
            max_file_count: count,
            start_file_name: continuation,
            prefix,
            delimiter,
        };
        let call = Call::api(ApiMethod::ListFileNames, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: ListFileNamesResponse = state.executor.json(ctx, call).await?;
        let files = resp
            .files
            .into_iter()
            .map(|f| File::from_response(f, self.session.clone()))
            .collect();
        Ok((files, resp.next_file_name))
    }

    /// One page of all file versions, including hidden ones, and the
    /// name and id the next page starts at.
    pub async fn list_file_versions(
        &self,
        ctx: &CancellationToken,
        count: u32,
        start_name: Option<&str>,
        start_id: Option<&str>,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<(Vec<File>, Option<String>, Option<String>)> {
        let state = self.session.snapshot();
        let prefix = prefix.or(state.name_prefix.as_deref());
        let req = ListFileVersionsRequest {
            bucket_id: &self.id,
            max_file_count: count,
            start_file_name: start_name,
            start_file_id: start_id,
            prefix,
            delimiter,
        };
        let call = Call::api(ApiMethod::ListFileVersions, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: ListFileVersionsResponse = state.executor.json(ctx, call).await?;
        let files = resp
            .files
            .into_iter()
            .map(|f| File::from_response(f, self.session.clone()))
            .collect();
        Ok((files, resp.next_file_name, resp.next_file_id))
    }

    pub async fn hide_file(&self, ctx: &CancellationToken, name: &str) -> Result<File> {
        let state = self.session.snapshot();
        let req = HideFileRequest {
            bucket_id: &self.id,
            file_name: name,
        };
        let call = Call::api(ApiMethod::HideFile, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: FileResponse = state.executor.json(ctx, call).await?;
        let mut file = File::from_response(resp, self.session.clone());
        file.name = name.to_string();
        Ok(file)
    }

    /// Token granting downloads of names starting with `prefix` for `valid`.
    pub async fn get_download_authorization(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
        valid: Duration,
        content_disposition: Option<&str>,
    ) -> Result<String> {
        let state = self.session.snapshot();
        let req = GetDownloadAuthorizationRequest {
            bucket_id: &self.id,
            file_name_prefix: prefix,
            valid_duration_in_seconds: valid.as_secs(),
            content_disposition,
        };
        let call = Call::api(ApiMethod::GetDownloadAuthorization, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        let resp: GetDownloadAuthorizationResponse = state.executor.json(ctx, call).await?;
        Ok(resp.authorization_token)
    }

    /// Download `name`, or only its headers when `head_only` is set.
    /// See [`make_range`] for `offset` and `size`.
    pub async fn download_file_by_name(
        &self,
        ctx: &CancellationToken,
        name: &str,
        offset: u64,
        size: u64,
        head_only: bool,
    ) -> Result<FileReader> {
        let state = self.session.snapshot();
        let uri = format!("{}/file/{}/{}", state.download_url, self.name, escape(name));
        download(
            ctx,
            &state,
            ApiMethod::DownloadFileByName,
            uri,
            offset,
            size,
            head_only,
        )
        .await
    }
}

pub(crate) async fn download(
    ctx: &CancellationToken,
    state: &SessionState,
    method: ApiMethod,
    uri: String,
    offset: u64,
    size: u64,
    head_only: bool,
) -> Result<FileReader> {
    let verb = if head_only { Method::HEAD } else { Method::GET };
    let mut call = Call::new(method, verb, uri).auth(&state.auth_token);
    if let Some(range) = make_range(offset, size) {
        call = call.header("Range", range);
    }
    let response = state
        .executor
        .response(ctx, call, &[StatusCode::OK, StatusCode::PARTIAL_CONTENT])
        .await?;
    FileReader::from_response(response, ctx)
}

/// Body of a download, with the file's metadata from the response headers.
///
/// Reads fail once the token the download was started with is cancelled.
pub struct FileReader {
    pub content_length: u64,
    pub content_type: String,
    pub sha1: String,
    pub id: String,
    /// `X-Bz-Info-*` headers, unescaped and keyed by the lower-case suffix
    pub info: HashMap<String, String>,
    body: Pin<Box<dyn AsyncRead + Send>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("sha1", &self.sha1)
            .field("id", &self.id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str> {
    match headers.get(name) {
        None => Ok(""),
        Some(value) => value
            .to_str()
            .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e))),
    }
}

impl FileReader {
    fn from_response(response: Response, ctx: &CancellationToken) -> Result<Self> {
        let headers = response.headers();
        let content_length = header_str(headers, CONTENT_LENGTH.as_str())?
            .parse::<u64>()
            .map_err(|e| Error::InvalidHeader(format!("content-length: {}", e)))?;

        let mut info = HashMap::new();
        for (name, value) in headers {
            let Some(key) = name.as_str().strip_prefix(INFO_HEADER_PREFIX) else {
                continue;
            };
            let value = value
                .to_str()
                .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
            info.insert(unescape(key)?, unescape(value)?);
        }

        let mut sha1 = header_str(headers, "x-bz-content-sha1")?.to_string();
        if sha1 == "none" {
            if let Some(whole) = info.get(LARGE_FILE_SHA1).filter(|s| !s.is_empty()) {
                sha1 = whole.clone();
            }
        }
        let id = header_str(headers, "x-bz-file-id")?.to_string();
        let content_type = header_str(headers, CONTENT_TYPE.as_str())?.to_string();

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Self {
            content_length,
            content_type,
            sha1,
            id,
            info,
            body: Box::pin(StreamReader::new(stream)),
            cancelled: Box::pin(ctx.clone().cancelled_owned()),
        })
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                Error::Cancelled,
            )));
        }
        self.body.as_mut().poll_read(cx, buf)
    }
}

/// Upload lease for plain files.
///
/// One task at a time; give each concurrent uploader its own lease.
#[derive(Debug)]
pub struct UploadUrl {
    lease: Lease,
    bucket: Bucket,
}

impl UploadUrl {
    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Replace the endpoint and token with a freshly issued pair.
    pub async fn reload(&self, ctx: &CancellationToken) -> Result<()> {
        let next = self.bucket.get_upload_url(ctx).await?;
        self.lease.set(next.lease);
        Ok(())
    }

    /// Upload `size` bytes from `reader` as `name`.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(
        name = "b2.upload_file",
        skip(self, ctx, reader, hash, info),
        fields(bucket = %self.bucket.name, upload.bytes = size),
        err
    )]
    pub async fn upload_file<R>(
        &self,
        ctx: &CancellationToken,
        reader: R,
        size: u64,
        name: &str,
        content_type: &str,
        hash: ContentHash,
        info: &HashMap<String, String>,
    ) -> Result<File>
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        let endpoint = self.lease.get();
        let mut call = Call::new(ApiMethod::UploadFile, Method::POST, endpoint.uri.as_str())
            .auth(&endpoint.token)
            .header("X-Bz-File-Name", name)
            .header(CONTENT_TYPE.as_str(), content_type)
            .header("X-Bz-Content-Sha1", hash.header_value());
        for (key, value) in info {
            call = call.header(format!("X-Bz-Info-{}", key), value.as_str());
        }
        let call = call.stream(reader, size);

        let state = self.bucket.session.snapshot();
        let resp: FileResponse = state.executor.json(ctx, call).await?;

        #[cfg(feature = "metrics")]
        crate::metrics::record_upload_bytes(ApiMethod::UploadFile.as_str(), size);

        Ok(File {
            name: name.to_string(),
            size,
            status: resp.action.clone(),
            timestamp: super::file::millitime(resp.upload_timestamp),
            info: Some(FileInfo::from(&resp)),
            id: resp.file_id,
            session: self.bucket.session.clone(),
        })
    }

    /// [`upload_file`](Self::upload_file) from memory, recovering from
    /// failures the classifier says are recoverable: a new lease on
    /// `AttemptNewUpload`, a new session on `ReAuthenticate`, a wait on
    /// `Retry`.
    pub async fn upload_file_with_retry(
        &self,
        ctx: &CancellationToken,
        data: Bytes,
        name: &str,
        content_type: &str,
        hash: ContentHash,
        info: &HashMap<String, String>,
    ) -> Result<File> {
        let recovery = Recovery::new();
        let recovery = &recovery;
        let session = &self.bucket.session;
        let size = data.len() as u64;
        retrier(recovery)
            .run(ctx, move |_| {
                let body = io::Cursor::new(data.clone());
                let hash = hash.clone();
                async move {
                    recovery.apply(ctx, session, self.reload(ctx)).await?;
                    self.upload_file(ctx, body, size, name, content_type, hash, info)
                        .await
                }
            })
            .await
    }
}
