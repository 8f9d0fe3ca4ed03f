//! Large-file upload protocol against a mocked B2 API
//!
//! ## Test Coverage
//!
//! - Start, part upload and finish with the ordered hash array
//! - Concurrent part uploads into one ledger
//! - Gap detection before finish (no network call)
//! - Deferred hashes taken from the end of the part body
//! - Cancel closes the ledger
//! - Resuming an unfinished file from `b2_list_parts`
//! - Lease reload after an upload failure

mod common;

#[cfg(test)]
mod tests {
    use crate::common::*;
    use b2_engine::api::ApiMethod;
    use b2_engine::upload::ContentHash;
    use b2_engine::Error;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Cursor;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn mount_part_upload(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .and(header("authorization", "4_part_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(part_response(1, 0, "")))
            .mount(server)
            .await;
    }

    // ========================================================================
    // Happy path
    // ========================================================================

    #[tokio::test]
    async fn test_start_upload_finish() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;

        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .and(header("x-bz-part-number", "1"))
            .and(header("x-bz-content-sha1", fake_sha1(1).as_str()))
            .and(header("content-length", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(part_response(1, 6, &fake_sha1(1))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .and(header("x-bz-part-number", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(part_response(2, 4, &fake_sha1(2))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_finish_large_file")))
            .and(body_partial_json(json!({
                "fileId": LARGE_FILE_ID,
                "partSha1Array": [fake_sha1(1), fake_sha1(2)]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_body(
                LARGE_FILE_ID,
                "big.bin",
                10,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(large.id(), LARGE_FILE_ID);

        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        let sent = part_url
            .upload_part(
                &ctx,
                Cursor::new(b"abcdef".to_vec()),
                ContentHash::Known(fake_sha1(1)),
                6,
                1,
            )
            .await
            .unwrap();
        assert_eq!(sent, 6);
        part_url
            .upload_part(
                &ctx,
                Cursor::new(b"ghij".to_vec()),
                ContentHash::Known(fake_sha1(2)),
                4,
                2,
            )
            .await
            .unwrap();

        let file = large.finish(&ctx).await.unwrap();
        assert_eq!(file.name, "big.bin");
        assert_eq!(file.id, LARGE_FILE_ID);
        assert_eq!(file.size, 10);
        assert!(!large.is_open().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_parts_share_one_ledger() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        mount_part_upload(&server).await;

        const PARTS: u32 = 64;
        let expected: Vec<String> = (1..=PARTS).map(fake_sha1).collect();
        Mock::given(method("POST"))
            .and(path(api("b2_finish_large_file")))
            .and(body_partial_json(json!({ "partSha1Array": expected })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_body(
                LARGE_FILE_ID,
                "big.bin",
                0,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();

        // Highest part numbers first, each task on its own lease.
        let mut tasks = Vec::new();
        for index in (1..=PARTS).rev() {
            let large = large.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let part_url = large.get_upload_part_url(&ctx).await.unwrap();
                let body = vec![b'x'; index as usize * 10];
                let size = body.len() as u64;
                part_url
                    .upload_part(&ctx, Cursor::new(body), ContentHash::Known(fake_sha1(index)), size, index)
                    .await
                    .unwrap()
            }));
        }
        let mut uploaded = 0;
        for task in tasks {
            uploaded += task.await.unwrap();
        }

        let total: u64 = (1..=PARTS as u64).map(|i| i * 10).sum();
        assert_eq!(uploaded, total);
        assert_eq!(large.size().await, total);
        assert_eq!(large.hashes().await.len(), PARTS as usize);

        let file = large.finish(&ctx).await.unwrap();
        assert_eq!(file.size, total);
    }

    // ========================================================================
    // Local failures
    // ========================================================================

    #[tokio::test]
    async fn test_finish_with_gap_never_calls_service() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        mount_part_upload(&server).await;
        Mock::given(method("POST"))
            .and(path(api("b2_finish_large_file")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        for index in [1u32, 2, 4] {
            part_url
                .upload_part(&ctx, Cursor::new(vec![0u8; 3]), ContentHash::Known(fake_sha1(index)), 3, index)
                .await
                .unwrap();
        }

        let err = large.finish(&ctx).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::InvalidPartIndex {
                    method: ApiMethod::FinishLargeFile,
                    index: 3
                }
            ),
            "unexpected error: {err}"
        );
        assert!(large.is_open().await, "a failed finish leaves the file open");
    }

    #[tokio::test]
    async fn test_cancel_closes_ledger() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        Mock::given(method("POST"))
            .and(path(api("b2_cancel_large_file")))
            .and(body_partial_json(json!({ "fileId": LARGE_FILE_ID })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fileId": LARGE_FILE_ID,
                "fileName": "big.bin"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        large.cancel(&ctx).await.unwrap();

        let err = part_url
            .upload_part(&ctx, Cursor::new(vec![1u8; 4]), ContentHash::Known(fake_sha1(1)), 4, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LargeFileClosed(_)));
        assert!(matches!(large.finish(&ctx).await, Err(Error::LargeFileClosed(_))));
        assert!(matches!(large.cancel(&ctx).await, Err(Error::LargeFileClosed(_))));
    }

    #[tokio::test]
    async fn test_part_zero_rejected_locally() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();

        let err = part_url
            .upload_part(&ctx, Cursor::new(vec![1u8; 4]), ContentHash::Known(fake_sha1(0)), 4, 0)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::InvalidPartIndex {
                    method: ApiMethod::UploadPart,
                    index: 0
                }
            ),
            "unexpected error: {err}"
        );
        assert_eq!(large.size().await, 0);
        assert!(large.hashes().await.is_empty());
    }

    // ========================================================================
    // Deferred hashes
    // ========================================================================

    #[tokio::test]
    async fn test_deferred_hash_recorded_from_body_tail() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;

        let digest = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let mut body = b"payload bytes".to_vec();
        body.extend_from_slice(digest.as_bytes());
        let size = body.len() as u64;

        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .and(header("x-bz-content-sha1", "hex_digits_at_end"))
            .and(header("content-length", size.to_string().as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(part_response(1, size, digest)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_finish_large_file")))
            .and(body_partial_json(json!({ "partSha1Array": [digest] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_body(
                LARGE_FILE_ID,
                "big.bin",
                size,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        part_url
            .upload_part(&ctx, Cursor::new(body), ContentHash::Deferred, size, 1)
            .await
            .unwrap();

        assert_eq!(large.hashes().await.get(&1).map(String::as_str), Some(digest));
        large.finish(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_hash_rejects_non_hex_tail() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        mount_part_upload(&server).await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        let body = vec![b'z'; 64];
        let err = part_url
            .upload_part(&ctx, Cursor::new(body), ContentHash::Deferred, 64, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeferredHash(_)));
        assert!(large.hashes().await.is_empty());
    }

    // ========================================================================
    // Resume
    // ========================================================================

    #[tokio::test]
    async fn test_resume_pages_through_list_parts() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(api("b2_list_parts")))
            .and(body_partial_json(json!({ "startPartNumber": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "parts": [part_response(1, 100, &fake_sha1(1)), part_response(2, 100, &fake_sha1(2))],
                "nextPartNumber": 3
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_list_parts")))
            .and(body_partial_json(json!({ "startPartNumber": 3 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "parts": [part_response(3, 50, &fake_sha1(3))],
                "nextPartNumber": null
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_finish_large_file")))
            .and(body_partial_json(json!({
                "partSha1Array": [fake_sha1(1), fake_sha1(2), fake_sha1(3)]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(file_body(
                LARGE_FILE_ID,
                "big.bin",
                250,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let unfinished = bucket.file(LARGE_FILE_ID, "big.bin");
        let large = unfinished.resume_large_file(&ctx).await.unwrap();
        assert_eq!(large.size().await, 250);
        assert_eq!(large.hashes().await.len(), 3);

        let file = large.finish(&ctx).await.unwrap();
        assert_eq!(file.size, 250);
    }

    #[tokio::test]
    async fn test_resume_stops_when_list_parts_stalls() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(api("b2_list_parts")))
            .and(body_partial_json(json!({ "startPartNumber": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "parts": [part_response(1, 100, &fake_sha1(1)), part_response(2, 100, &fake_sha1(2))],
                "nextPartNumber": 3
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_list_parts")))
            .and(body_partial_json(json!({ "startPartNumber": 3 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "parts": [part_response(3, 50, &fake_sha1(3))],
                "nextPartNumber": 3
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let unfinished = bucket.file(LARGE_FILE_ID, "big.bin");
        let large = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            unfinished.resume_large_file(&ctx),
        )
        .await
        .expect("resume kept paging")
        .unwrap();
        assert_eq!(large.size().await, 250);
        assert_eq!(large.hashes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_compile_parts_trusts_caller_ledger() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        Mock::given(method("POST"))
            .and(path(api("b2_list_parts")))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let seen: HashMap<u32, String> = [(1, fake_sha1(1)), (2, fake_sha1(2))].into_iter().collect();
        let large = bucket.file(LARGE_FILE_ID, "big.bin").compile_parts(42, &seen);
        assert_eq!(large.size().await, 42);
        assert_eq!(large.hashes().await.len(), 2);
        assert!(large.is_open().await);
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    #[tokio::test]
    async fn test_upload_part_with_retry_takes_new_lease() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(api("b2_start_large_file")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fileId": LARGE_FILE_ID,
                "fileName": "big.bin",
                "action": "start"
            })))
            .mount(&server)
            .await;
        // First lease points at a busy pod, the next one at a healthy pod.
        Mock::given(method("POST"))
            .and(path(api("b2_get_upload_part_url")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(upload_url_body(&server.uri(), "busy", "4_busy")),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api("b2_get_upload_part_url")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(upload_url_body(&server.uri(), "fresh", "4_fresh")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/busy"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(error_body(503, "service_unavailable", "no tomes available")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/fresh"))
            .and(header("authorization", "4_fresh"))
            .and(header("content-length", "8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(part_response(1, 8, &fake_sha1(1))))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        let sent = part_url
            .upload_part_with_retry(&ctx, Bytes::from_static(b"12345678"), ContentHash::Known(fake_sha1(1)), 1)
            .await
            .unwrap();
        assert_eq!(sent, 8);
        assert_eq!(large.size().await, 8);
    }

    #[tokio::test]
    async fn test_upload_part_with_retry_gives_up_on_bad_request() {
        let server = MockServer::start().await;
        let bucket = bucket(&server).await;
        mount_large_file(&server).await;
        Mock::given(method("POST"))
            .and(path("/upload/part"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(error_body(400, "bad_request", "sha1 did not match")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = ctx();
        let large = bucket
            .start_large_file(&ctx, "big.bin", "application/octet-stream", &HashMap::new())
            .await
            .unwrap();
        let part_url = large.get_upload_part_url(&ctx).await.unwrap();
        let err = part_url
            .upload_part_with_retry(&ctx, Bytes::from_static(b"abc"), ContentHash::Known(fake_sha1(9)), 1)
            .await
            .unwrap_err();
        assert_eq!(
            b2_engine::api::classify::msg_code(&err),
            Some((400, "bad_request", "sha1 did not match"))
        );
        assert!(large.hashes().await.is_empty());
    }
}
