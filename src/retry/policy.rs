//! Classifier-driven retry policy
//!
//! Wires [`crate::api::classify`] into the generic [`Retry`] harness:
//! `Retry` waits and repeats, `AttemptNewUpload` reloads the lease first,
//! `ReAuthenticate` authorizes the session again first, `Punt` stops.
//! Each kind of recovery has its own budget.

use super::{backoff as next_backoff, Retry};
use crate::api::classify::{self, Action};
use crate::api::{Error, Result};
use crate::session::Session;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Re-authentications allowed within one retried call
pub const MAX_REAUTHENTICATIONS: u32 = 2;

/// Delay used for `Retry` when the service gave no hint
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Recovery owed before the next attempt, and what has been spent so far.
#[derive(Debug, Default)]
pub struct Recovery {
    reload: AtomicBool,
    reauthenticate: AtomicBool,
    retries: AtomicU32,
    reuploads: AtomicU32,
    reauthentications: AtomicU32,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the budget for the action recommended for `err` allows one
    /// more attempt. Spends from that budget when it does.
    fn allow(&self, err: &Error) -> bool {
        match classify::action(err) {
            Action::Punt => false,
            Action::Retry => self.retries.fetch_add(1, Ordering::SeqCst) < classify::max_retries(err),
            Action::AttemptNewUpload => {
                self.reuploads.fetch_add(1, Ordering::SeqCst) < classify::max_reuploads(err)
            }
            Action::ReAuthenticate => {
                self.reauthentications.fetch_add(1, Ordering::SeqCst) < MAX_REAUTHENTICATIONS
            }
        }
    }

    fn note(&self, err: &Error) {
        let action = classify::action(err);
        match action {
            Action::AttemptNewUpload => self.reload.store(true, Ordering::SeqCst),
            Action::ReAuthenticate => self.reauthenticate.store(true, Ordering::SeqCst),
            Action::Retry | Action::Punt => {}
        }
        tracing::warn!(action = action.as_str(), error = %err, "Retrying after failure");
        #[cfg(feature = "metrics")]
        crate::metrics::record_retry(action.as_str());
    }

    /// Perform the recovery owed by the previous failure. `reload` is only
    /// awaited when a new lease is owed.
    ///
    /// Flags are cleared only once their step succeeds, so a failed reload
    /// is attempted again on the next round.
    pub async fn apply<F>(&self, ctx: &CancellationToken, session: &Session, reload: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if self.reauthenticate.load(Ordering::SeqCst) {
            session.reauthenticate(ctx).await?;
            self.reauthenticate.store(false, Ordering::SeqCst);
        }
        if self.reload.load(Ordering::SeqCst) {
            reload.await?;
            self.reload.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Retrier whose budgets and waits come from the classifier.
///
/// The operation is expected to call [`Recovery::apply`] before doing its
/// work.
pub fn retrier(recovery: &Recovery) -> Retry<'_, Error> {
    Retry::new()
        .attempts(0)
        .retry_if(move |_, err| recovery.allow(err))
        .on_retry(move |_, err| {
            recovery.note(err);
            Ok(())
        })
        .dynamic_delay(|_, previous, err| match classify::action(err) {
            Action::Retry => {
                let hint = classify::backoff(err);
                if !hint.is_zero() {
                    hint
                } else if previous.is_zero() {
                    INITIAL_BACKOFF
                } else {
                    next_backoff(previous)
                }
            }
            _ => Duration::ZERO,
        })
}

/// Run a non-upload call under the classifier's policy.
///
/// `op` is invoked once per attempt and must build a fresh future each time.
pub async fn call<T, Op, Fut>(ctx: &CancellationToken, session: &Session, mut op: Op) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let recovery = Recovery::new();
    let recovery = &recovery;
    retrier(recovery)
        .run(ctx, move |_| {
            let attempt = op();
            async move {
                recovery
                    .apply(ctx, session, std::future::ready(Ok(())))
                    .await?;
                attempt.await
            }
        })
        .await
}
