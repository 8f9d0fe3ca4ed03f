//! Shared helpers for tests that run against a mocked B2 API.
#![allow(dead_code)]

use b2_engine::session::{Bucket, Session, SessionOptions};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ACCOUNT: &str = "0012ab";
pub const KEY: &str = "K001secret";
pub const TOKEN: &str = "4_0012ab_token";
pub const BUCKET_ID: &str = "b2bucket01";
pub const BUCKET_NAME: &str = "0012ab-b2-tests-alpha";
pub const LARGE_FILE_ID: &str = "4_zlarge_f200";

/// `/b2api/v3/<name>`
pub fn api(name: &str) -> String {
    format!("/b2api/v3/{}", name)
}

pub fn authorize_body(uri: &str) -> Value {
    json!({
        "accountId": ACCOUNT,
        "authorizationToken": TOKEN,
        "apiInfo": {
            "storageApi": {
                "absoluteMinimumPartSize": 5_000_000,
                "recommendedPartSize": 100_000_000,
                "apiUrl": uri,
                "downloadUrl": uri,
                "s3ApiUrl": uri,
                "capabilities": ["listBuckets", "writeFiles"]
            }
        }
    })
}

pub fn error_body(status: u16, code: &str, message: &str) -> Value {
    json!({"status": status, "code": code, "message": message})
}

pub fn bucket_body(id: &str, name: &str) -> Value {
    json!({
        "accountId": ACCOUNT,
        "bucketId": id,
        "bucketName": name,
        "bucketType": "allPrivate",
        "bucketInfo": {},
        "revision": 1
    })
}

pub fn file_body(id: &str, name: &str, size: u64) -> Value {
    json!({
        "fileId": id,
        "fileName": name,
        "contentLength": size,
        "contentType": "application/octet-stream",
        "fileInfo": {},
        "action": "upload",
        "uploadTimestamp": 1_700_000_000_000i64
    })
}

pub fn upload_url_body(uri: &str, suffix: &str, token: &str) -> Value {
    json!({
        "uploadUrl": format!("{}/upload/{}", uri, suffix),
        "authorizationToken": token
    })
}

pub async fn mount_authorize(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(api("b2_authorize_account")))
        .respond_with(ResponseTemplate::new(200).set_body_json(authorize_body(&server.uri())))
        .mount(server)
        .await;
}

pub fn options(server: &MockServer) -> SessionOptions {
    SessionOptions::new().api_base(server.uri())
}

pub async fn session(server: &MockServer) -> Session {
    mount_authorize(server).await;
    Session::authorize(&CancellationToken::new(), ACCOUNT, KEY, options(server))
        .await
        .unwrap()
}

/// Session plus a bucket handle obtained through `b2_list_buckets`.
pub async fn bucket(server: &MockServer) -> Bucket {
    let session = session(server).await;
    let list = Mock::given(method("POST"))
        .and(path(api("b2_list_buckets")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"buckets": [bucket_body(BUCKET_ID, BUCKET_NAME)]})),
        )
        .mount_as_scoped(server)
        .await;
    let bucket = session
        .list_buckets(&CancellationToken::new(), Some(BUCKET_NAME))
        .await
        .unwrap()
        .pop()
        .unwrap();
    drop(list);
    bucket
}

/// Mount `b2_start_large_file` and `b2_get_upload_part_url`, the latter
/// handing out `/upload/part`.
pub async fn mount_large_file(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(api("b2_start_large_file")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "fileId": LARGE_FILE_ID,
            "fileName": "big.bin",
            "contentType": "application/octet-stream",
            "fileInfo": {},
            "action": "start",
            "uploadTimestamp": 1_700_000_000_000i64
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(api("b2_get_upload_part_url")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(upload_url_body(&server.uri(), "part", "4_part_token")),
        )
        .mount(server)
        .await;
}

pub fn part_response(number: u32, size: u64, sha1: &str) -> Value {
    json!({
        "fileId": LARGE_FILE_ID,
        "partNumber": number,
        "contentLength": size,
        "contentSha1": sha1,
        "uploadTimestamp": 1_700_000_000_000i64
    })
}

/// 40 hex characters standing in for the SHA-1 of part `n`.
pub fn fake_sha1(n: u32) -> String {
    format!("{:040x}", n)
}
