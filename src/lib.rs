//! b2-engine
//!
//! Client engine for the Backblaze B2 JSON API that stays correct under
//! real-world network and service failures.
//!
//! # Features
//!
//! - **Failure classification**: every error maps to one recovery
//!   [`Action`](api::Action) with matching retry and re-upload budgets
//! - **Large files**: concurrent part uploads into one shared ledger, with
//!   gap detection before finish
//! - **Deferred hashes**: parts whose SHA-1 is appended to the body
//! - **Retry harness**: classifier-driven recovery with lease reload and
//!   re-authentication
//!
//! # Example
//!
//! ```no_run
//! use b2_engine::session::{Session, SessionOptions};
//! use b2_engine::upload::ContentHash;
//! use bytes::Bytes;
//! use std::collections::HashMap;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = CancellationToken::new();
//!     let session = Session::authorize(&ctx, "account", "key", SessionOptions::new()).await?;
//!     let bucket = session
//!         .list_buckets(&ctx, Some("my-bucket"))
//!         .await?
//!         .pop()
//!         .ok_or_else(|| anyhow::anyhow!("no such bucket"))?;
//!
//!     let large = bucket
//!         .start_large_file(&ctx, "video.mp4", "video/mp4", &HashMap::new())
//!         .await?;
//!     let part_url = large.get_upload_part_url(&ctx).await?;
//!     let part = Bytes::from(vec![0u8; 5_000_000]);
//!     let hash = ContentHash::Known("...".into());
//!     part_url.upload_part_with_retry(&ctx, part, hash, 1).await?;
//!     let file = large.finish(&ctx).await?;
//!     println!("uploaded {} ({} bytes)", file.name, file.size);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod logging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod retry;
pub mod session;
pub mod upload;

// Re-export commonly used types
pub use api::{Action, Error, Result};
pub use config::Config;
pub use session::{Bucket, File, Session, SessionOptions};
pub use upload::{ContentHash, LargeFile, PartUrl};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
