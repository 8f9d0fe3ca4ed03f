//! File handles

use super::bucket::{download, FileReader};
use super::Session;
use crate::api::request::Call;
use crate::api::types::{
    DeleteFileVersionRequest, FileIdRequest, FileResponse, ListPartsRequest, ListPartsResponse,
};
use crate::api::{ApiMethod, Result};
use crate::upload::LargeFile;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;

/// Parts requested per page when rebuilding a ledger from the service
pub const LIST_PARTS_PAGE: u32 = 1000;

pub(crate) fn millitime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Metadata of one file version
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub size: u64,
    pub content_type: Option<String>,
    pub info: HashMap<String, String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&FileResponse> for FileInfo {
    fn from(resp: &FileResponse) -> Self {
        Self {
            name: resp.file_name.clone(),
            sha1: resp.content_sha1.clone(),
            md5: resp.content_md5.clone(),
            size: resp.content_length,
            content_type: resp.content_type.clone(),
            info: resp.file_info.clone(),
            status: resp.action.clone(),
            timestamp: millitime(resp.upload_timestamp),
        }
    }
}

/// An uploaded part of an unfinished large file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub number: u32,
    pub sha1: String,
    pub size: u64,
}

/// Handle on one file version
#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub size: u64,
    /// `upload`, `hide`, `start` or `folder`
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub info: Option<FileInfo>,
    pub id: String,
    pub(crate) session: Session,
}

impl File {
    pub(crate) fn from_response(resp: FileResponse, session: Session) -> Self {
        let info = FileInfo::from(&resp);
        Self {
            name: resp.file_name,
            size: resp.content_length,
            status: resp.action,
            timestamp: millitime(resp.upload_timestamp),
            info: Some(info),
            id: resp.file_id,
            session,
        }
    }

    /// Fetch this version's metadata and refresh the handle with it.
    pub async fn get_file_info(&mut self, ctx: &CancellationToken) -> Result<FileInfo> {
        let state = self.session.snapshot();
        let call = Call::api(ApiMethod::GetFileInfo, &state.api_url)
            .auth(&state.auth_token)
            .json(&FileIdRequest { file_id: &self.id })?;
        let resp: FileResponse = state.executor.json(ctx, call).await?;
        let info = FileInfo::from(&resp);
        self.status = resp.action;
        self.name = resp.file_name;
        self.timestamp = millitime(resp.upload_timestamp);
        self.info = Some(info.clone());
        Ok(info)
    }

    pub async fn delete_file_version(&self, ctx: &CancellationToken) -> Result<()> {
        let state = self.session.snapshot();
        let req = DeleteFileVersionRequest {
            file_name: &self.name,
            file_id: &self.id,
        };
        let call = Call::api(ApiMethod::DeleteFileVersion, &state.api_url)
            .auth(&state.auth_token)
            .json(&req)?;
        state.executor.send(ctx, call).await?;
        tracing::debug!(file = %self.name, file_id = %self.id, "Deleted file version");
        Ok(())
    }

    /// One page of the parts uploaded so far, starting at part `next`.
    /// Also returns where the next page starts, if there is one.
    pub async fn list_parts(
        &self,
        ctx: &CancellationToken,
        next: u32,
        count: u32,
    ) -> Result<(Vec<FilePart>, Option<u32>)> {
        list_parts(&self.session, ctx, &self.id, next, count).await
    }

    /// Continue an unfinished large file from a ledger kept by the caller.
    ///
    /// `seen` maps part numbers to hashes and `size` is the total of those
    /// parts. Both are copied; neither is checked against the service.
    pub fn compile_parts(&self, size: u64, seen: &HashMap<u32, String>) -> LargeFile {
        let hashes: BTreeMap<u32, String> = seen.iter().map(|(k, v)| (*k, v.clone())).collect();
        LargeFile::new(self.id.clone(), self.session.clone(), size, hashes)
    }

    /// Continue an unfinished large file from what the service reports as
    /// uploaded.
    ///
    /// Paging stops early if the service hands back a next part number that
    /// does not move past the page just read.
    pub async fn resume_large_file(&self, ctx: &CancellationToken) -> Result<LargeFile> {
        let mut hashes = BTreeMap::new();
        let mut size = 0;
        let mut next = Some(1);
        while let Some(start) = next {
            let (parts, following) = self.list_parts(ctx, start, LIST_PARTS_PAGE).await?;
            for part in parts {
                size += part.size;
                hashes.insert(part.number, part.sha1);
            }
            next = match following {
                Some(n) if n <= start => {
                    tracing::warn!(
                        file_id = %self.id,
                        start,
                        next = n,
                        "List parts did not advance, stopping"
                    );
                    None
                }
                other => other,
            };
        }
        tracing::info!(
            file_id = %self.id,
            parts = hashes.len(),
            size,
            "Resumed large file from service"
        );
        Ok(LargeFile::new(self.id.clone(), self.session.clone(), size, hashes))
    }

    /// Large-file handle with an empty ledger, for cancelling or listing.
    pub fn as_large_file(&self) -> LargeFile {
        LargeFile::new(self.id.clone(), self.session.clone(), 0, BTreeMap::new())
    }

    /// Download this version by id. See [`make_range`](crate::api::request::make_range)
    /// for `offset` and `size`.
    pub async fn download(
        &self,
        ctx: &CancellationToken,
        offset: u64,
        size: u64,
    ) -> Result<FileReader> {
        let state = self.session.snapshot();
        let uri = format!(
            "{}{}{}?fileId={}",
            state.download_url,
            crate::api::API_VERSION_PATH,
            ApiMethod::DownloadFileById.as_str(),
            crate::api::escape::escape(&self.id)
        );
        download(
            ctx,
            &state,
            ApiMethod::DownloadFileById,
            uri,
            offset,
            size,
            false,
        )
        .await
    }
}

pub(crate) async fn list_parts(
    session: &Session,
    ctx: &CancellationToken,
    file_id: &str,
    next: u32,
    count: u32,
) -> Result<(Vec<FilePart>, Option<u32>)> {
    let state = session.snapshot();
    let req = ListPartsRequest {
        file_id,
        start_part_number: next,
        max_part_count: count,
    };
    let call = Call::api(ApiMethod::ListParts, &state.api_url)
        .auth(&state.auth_token)
        .json(&req)?;
    let resp: ListPartsResponse = state.executor.json(ctx, call).await?;
    let parts = resp
        .parts
        .into_iter()
        .map(|p| FilePart {
            number: p.part_number,
            sha1: p.content_sha1,
            size: p.content_length,
        })
        .collect();
    Ok((parts, resp.next_part_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millitime() {
        let t = millitime(1_700_000_000_123);
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_millis(), 123);
        assert_eq!(millitime(0).timestamp(), 0);
    }

    #[test]
    fn test_file_info_from_response() {
        let resp: FileResponse = serde_json::from_str(
            r#"{
                "fileId": "4_z1",
                "fileName": "a/b.txt",
                "contentLength": 12,
                "contentSha1": "none",
                "contentType": "text/plain",
                "fileInfo": {"large_file_sha1": "abc"},
                "action": "upload",
                "uploadTimestamp": 1700000000000
            }"#,
        )
        .unwrap();
        let info = FileInfo::from(&resp);
        assert_eq!(info.name, "a/b.txt");
        assert_eq!(info.size, 12);
        assert_eq!(info.sha1.as_deref(), Some("none"));
        assert!(info.md5.is_none());
        assert_eq!(info.info["large_file_sha1"], "abc");
        assert_eq!(info.timestamp.timestamp(), 1_700_000_000);
    }
}
