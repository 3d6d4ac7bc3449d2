//! Bounded retry with backoff.
//!
//! Two disciplines share one implementation:
//!
//! - *linear*: waits grow by `min_wait` every round (`min_wait`,
//!   `2 * min_wait`, ...) — used for warehouse bulk loads where server-side
//!   pressure eases over seconds.
//! - *jittered*: every wait is drawn uniformly from `[0, min_wait)` — used
//!   for pointer-table commits where contending writers just need to be
//!   spread apart.
//!
//! Unlike an unbounded exponential backoff, every retry here has a budget:
//! exhausting it surfaces the last error to the caller.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::info;
use rand::prelude::*;
use std::ops::ControlFlow;
use std::time::Duration;

/// Retry budget and wait policy.
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Maximum number of attempts, including the first one.
    pub retries: usize,

    /// Base wait between attempts.
    pub min_wait: Duration,

    /// Draw each wait uniformly from `[0, min_wait)` instead of growing it
    /// linearly.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            min_wait: Duration::from_secs(1),
            jitter: false,
        }
    }
}

/// Error after the retry budget is used up or a fatal error was hit.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt failed with a retryable error but no attempts are
    /// left.
    Exhausted {
        /// Number of attempts that were made.
        attempts: usize,
        /// Error of the final attempt.
        source: E,
    },

    /// An attempt failed with an error that must not be retried.
    Fatal {
        /// The non-retryable error.
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error of the final attempt.
    pub fn into_source(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Fatal { source } => source,
        }
    }
}

impl<E> std::fmt::Display for RetryError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { attempts, source } => {
                write!(f, "retries exhausted after {attempts} attempts: {source}")
            }
            Self::Fatal { source } => write!(f, "fatal error: {source}"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::Fatal { source } => Some(source),
        }
    }
}

/// Retry result.
pub type BackoffResult<T, E> = Result<T, RetryError<E>>;

/// [`Backoff`] can be created from a [`BackoffConfig`].
///
/// Consecutive calls to [`Backoff::next`] return the wait before the next
/// attempt.
pub struct Backoff {
    min_wait_secs: f64,
    next_wait_secs: f64,
    retries: usize,
    jitter: bool,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("min_wait_secs", &self.min_wait_secs)
            .field("next_wait_secs", &self.next_wait_secs)
            .field("retries", &self.retries)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng is provided. Only jittered
    /// backoffs consult the rng at all.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let min_wait_secs = config.min_wait.as_secs_f64();
        Self {
            min_wait_secs,
            next_wait_secs: min_wait_secs,
            retries: config.retries,
            jitter: config.jitter,
            rng,
        }
    }

    /// Returns the next wait duration.
    fn next(&mut self) -> Duration {
        if self.jitter {
            if self.min_wait_secs == 0. {
                return Duration::ZERO;
            }
            let range = 0.0..self.min_wait_secs;
            let wait = match self.rng.as_mut() {
                Some(rng) => rng.gen_range(range),
                None => thread_rng().gen_range(range),
            };
            return Duration::from_secs_f64(wait);
        }

        let wait = self.next_wait_secs;
        self.next_wait_secs += self.min_wait_secs;
        Duration::from_secs_f64(wait)
    }

    /// Perform an async operation, retrying with this backoff while the
    /// budget lasts.
    ///
    /// `do_stuff` reports its outcome per attempt:
    ///
    /// - `ControlFlow::Break(Ok(v))` — success, `v` is returned.
    /// - `ControlFlow::Break(Err(e))` — fatal error, returned without
    ///   further attempts as [`RetryError::Fatal`].
    /// - `ControlFlow::Continue(e)` — retryable error; the backoff sleeps
    ///   and tries again, or returns [`RetryError::Exhausted`] once
    ///   `retries` attempts were made.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<Result<B, E>, E>> + Send,
        E: std::error::Error + Send,
    {
        // A budget of zero attempts would mean never running `do_stuff`;
        // treat it as one.
        let retries = self.retries.max(1);

        for attempt in 1..=retries {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                ControlFlow::Break(Ok(v)) => return Ok(v),
                ControlFlow::Break(Err(e)) => return Err(RetryError::Fatal { source: e }),
                ControlFlow::Continue(e) => e,
            };

            if attempt == retries {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: e,
                });
            }

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                attempt,
                backoff_millis = backoff.as_millis() as u64,
                "request encountered retryable error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }

        unreachable!("retry budget of zero attempts")
    }

    /// Retry all errors.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        self.retry_with_backoff(task_name, move || {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            async {
                match do_stuff.await {
                    Ok(b) => ControlFlow::Break(Ok(b)),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
    }
}
