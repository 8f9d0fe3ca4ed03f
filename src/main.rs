//! b2-cleanup - remove leftover test buckets
//!
//! Deletes every bucket whose name marks it as a test bucket for the
//! account, along with all file versions and unfinished large files in it.

use anyhow::Context;
use b2_engine::retry::policy;
use b2_engine::session::{Bucket, Session};
use b2_engine::{config::Config, logging};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Remove test buckets and everything in them
#[derive(Parser, Debug)]
#[command(name = "b2-cleanup")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (B2_ACCOUNT_ID / B2_SECRET_KEY otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only print the buckets that would be removed
    #[arg(long)]
    dry_run: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => Config::from_env().context("reading credentials from the environment")?,
    };
    logging::init_subscriber(&config.logging)?;

    info!("Starting b2-cleanup v{}", b2_engine::VERSION);

    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            shutdown.cancel();
        }
    });

    let options = config.client.session_options()?;
    let session = Session::authorize(&ctx, &config.account.id, &config.account.key, options)
        .await
        .context("authorizing account")?;

    let buckets = policy::call(&ctx, &session, || session.list_buckets(&ctx, None)).await?;
    let selector = TestBuckets::new(&session.account_id(), &config.cleanup.bucket_suffixes);
    let doomed: Vec<Bucket> = buckets
        .into_iter()
        .filter(|b| selector.matches(&b.name))
        .collect();

    if doomed.is_empty() {
        info!("No test buckets found");
    }

    let mut failures = 0usize;
    if args.dry_run {
        for bucket in &doomed {
            println!("would remove {}", bucket.name);
        }
    } else {
        let page_size = config.cleanup.page_size;
        let mut tasks = Vec::with_capacity(doomed.len());
        for bucket in doomed {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let name = bucket.name.clone();
                (name, kill_bucket(&ctx, &bucket, page_size).await)
            }));
        }
        for task in tasks {
            match task.await {
                Ok((name, Ok(()))) => info!(bucket = %name, "Removed bucket"),
                Ok((name, Err(e))) => {
                    failures += 1;
                    error!(bucket = %name, error = %e, "Failed to remove bucket");
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, "Cleanup task panicked");
                }
            }
        }
    }

    if args.metrics {
        print_metrics();
    }

    if failures > 0 {
        anyhow::bail!("{} bucket(s) could not be removed", failures);
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn print_metrics() {
    print!("{}", b2_engine::metrics::render());
}

#[cfg(not(feature = "metrics"))]
fn print_metrics() {
    warn!("Built without the metrics feature");
}

/// Names that mark a bucket as a test bucket for one account: anything
/// under `<account>-b2-tests-`, plus exactly `<account>-<suffix>`.
#[derive(Debug, PartialEq, Eq)]
struct TestBuckets {
    prefix: String,
    names: Vec<String>,
}

impl TestBuckets {
    fn new(account: &str, suffixes: &[String]) -> Self {
        let account = account.to_lowercase();
        Self {
            prefix: format!("{}-b2-tests-", account),
            names: suffixes.iter().map(|s| format!("{}-{}", account, s)).collect(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        name.starts_with(self.prefix.as_str()) || self.names.iter().any(|n| n == name)
    }
}

/// Delete every file version and unfinished large file, then the bucket.
///
/// A file that cannot be deleted or cancelled is logged and skipped; a
/// listing failure ends the run for the bucket.
async fn kill_bucket(
    ctx: &CancellationToken,
    bucket: &Bucket,
    page_size: u32,
) -> b2_engine::Result<()> {
    let session = bucket.session();

    let mut start_name: Option<String> = None;
    let mut start_id: Option<String> = None;
    loop {
        let (files, next_name, next_id) = policy::call(ctx, session, || {
            bucket.list_file_versions(
                ctx,
                page_size,
                start_name.as_deref(),
                start_id.as_deref(),
                None,
                None,
            )
        })
        .await?;
        for file in &files {
            info!(bucket = %bucket.name, file = %file.name, "Deleting file");
            if let Err(e) = policy::call(ctx, session, || file.delete_file_version(ctx)).await {
                if ctx.is_cancelled() {
                    return Err(e);
                }
                error!(bucket = %bucket.name, file = %file.name, error = %e, "Failed to delete file");
            }
        }
        if next_name.is_none() {
            break;
        }
        start_name = next_name;
        start_id = next_id;
    }

    let mut continuation: Option<String> = None;
    loop {
        let (files, next) = policy::call(ctx, session, || {
            bucket.list_unfinished_large_files(ctx, page_size, continuation.as_deref())
        })
        .await?;
        for file in &files {
            info!(bucket = %bucket.name, file = %file.name, "Cancelling large file");
            let large = file.as_large_file();
            if let Err(e) = policy::call(ctx, session, || large.cancel(ctx)).await {
                if ctx.is_cancelled() {
                    return Err(e);
                }
                error!(bucket = %bucket.name, file = %file.name, error = %e, "Failed to cancel large file");
            }
        }
        if next.is_none() {
            break;
        }
        continuation = next;
    }

    policy::call(ctx, session, || bucket.delete_bucket(ctx)).await
}
