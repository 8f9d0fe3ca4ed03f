//! JSON request and response bodies of the B2 v3 API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageApiInfo {
    pub absolute_minimum_part_size: u64,
    pub recommended_part_size: u64,
    pub api_url: String,
    pub download_url: String,
    pub s3_api_url: String,
    pub bucket_id: Option<String>,
    pub bucket_name: Option<String>,
    pub name_prefix: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiInfo {
    pub storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeAccountResponse {
    pub account_id: String,
    pub authorization_token: String,
    #[serde(default)]
    pub api_info: ApiInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBucketRequest<'a> {
    pub account_id: &'a str,
    pub bucket_name: &'a str,
    pub bucket_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_info: Option<&'a HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketResponse {
    pub bucket_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_type: String,
    #[serde(default)]
    pub bucket_info: HashMap<String, String>,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBucketRequest<'a> {
    pub account_id: &'a str,
    pub bucket_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBucketsRequest<'a> {
    pub account_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ListBucketsResponse {
    pub buckets: Vec<BucketResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlRequest<'a> {
    pub bucket_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadPartUrlRequest<'a> {
    pub file_id: &'a str,
}

/// Shared by `b2_get_upload_url` and `b2_get_upload_part_url`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub upload_url: String,
    pub authorization_token: String,
}

/// File record returned by uploads, listings and `b2_get_file_info`
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileResponse {
    pub file_id: String,
    pub file_name: String,
    pub content_length: u64,
    pub content_sha1: Option<String>,
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    pub file_info: HashMap<String, String>,
    pub action: String,
    pub upload_timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFileVersionRequest<'a> {
    pub file_name: &'a str,
    pub file_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeFileRequest<'a> {
    pub bucket_id: &'a str,
    pub file_name: &'a str,
    pub content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<&'a HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdRequest<'a> {
    pub file_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsRequest<'a> {
    pub file_id: &'a str,
    pub start_part_number: u32,
    pub max_part_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResponse {
    pub part_number: u32,
    #[serde(default)]
    pub content_sha1: String,
    #[serde(default)]
    pub content_length: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsResponse {
    #[serde(default)]
    pub next_part_number: Option<u32>,
    #[serde(default)]
    pub parts: Vec<PartResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishLargeFileRequest<'a> {
    pub file_id: &'a str,
    pub part_sha1_array: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUnfinishedLargeFilesRequest<'a> {
    pub bucket_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUnfinishedLargeFilesResponse {
    #[serde(default)]
    pub files: Vec<FileResponse>,
    #[serde(default)]
    pub next_file_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileNamesRequest<'a> {
    pub bucket_id: &'a str,
    pub max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileNamesResponse {
    #[serde(default)]
    pub files: Vec<FileResponse>,
    #[serde(default)]
    pub next_file_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileVersionsRequest<'a> {
    pub bucket_id: &'a str,
    pub max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileVersionsResponse {
    #[serde(default)]
    pub files: Vec<FileResponse>,
    #[serde(default)]
    pub next_file_name: Option<String>,
    #[serde(default)]
    pub next_file_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HideFileRequest<'a> {
    pub bucket_id: &'a str,
    pub file_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDownloadAuthorizationRequest<'a> {
    pub bucket_id: &'a str,
    pub file_name_prefix: &'a str,
    pub valid_duration_in_seconds: u64,
    #[serde(rename = "b2ContentDisposition", skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDownloadAuthorizationResponse {
    pub authorization_token: String,
}
