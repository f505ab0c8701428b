//! Periodic self-registration against the primary.
//!
//! ```text
//!   start ──► attempt #0 ──err──► Err(..), nothing spawned
//!                │ ok
//!                ▼
//!        (first response returned to the caller)
//!                │
//!   ┌──────► wait interval ◄─── cancel ──► done
//!   │            │
//!   │   clone base → mutate → dispatch (attempt_timeout)
//!   │            │
//!   └── on_success / on_failure
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wsp_protocol::{RegisterProxyRequest, RegisterProxyResponse};

use crate::client::PrimaryApi;
use crate::types::{RegistrationFailure, SdkError};

pub type MutateFn = Box<dyn FnMut(&mut RegisterProxyRequest) + Send>;
pub type SuccessFn = Box<dyn FnMut(&RegisterProxyResponse) -> Result<(), SdkError> + Send>;
pub type FailureFn = Box<dyn FnMut(&RegistrationFailure) + Send>;

/// Timing of the loop.
#[derive(Debug, Clone, Copy)]
pub struct RegisterLoopOptions {
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RegisterLoopOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Caller-supplied hooks.
///
/// All three run on the loop task, one at a time, and must not block.
/// `on_success` returning `Err` turns the attempt into a failure.
pub struct RegisterHooks {
    mutate: MutateFn,
    on_success: SuccessFn,
    on_failure: FailureFn,
}

impl RegisterHooks {
    pub fn new() -> Self {
        Self {
            mutate: Box::new(|_| {}),
            on_success: Box::new(|_| Ok(())),
            on_failure: Box::new(|_| {}),
        }
    }

    /// Adjust each outgoing request (e.g. refresh `replica_error`).
    pub fn mutate(mut self, f: impl FnMut(&mut RegisterProxyRequest) + Send + 'static) -> Self {
        self.mutate = Box::new(f);
        self
    }

    /// Apply a background registration response.
    pub fn on_success(
        mut self,
        f: impl FnMut(&RegisterProxyResponse) -> Result<(), SdkError> + Send + 'static,
    ) -> Self {
        self.on_success = Box::new(f);
        self
    }

    pub fn on_failure(mut self, f: impl FnMut(&RegistrationFailure) + Send + 'static) -> Self {
        self.on_failure = Box::new(f);
        self
    }
}

impl Default for RegisterHooks {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running loop.
///
/// Dropping the handle does not stop the loop; cancel the token passed to
/// [`RegisterLoop::start`] instead.
pub struct RegisterLoopHandle {
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl RegisterLoopHandle {
    /// Resolves once the loop task has exited.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Wait for the loop to exit, at most `grace`.  Returns `false` on
    /// timeout.
    pub async fn wait_timeout(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.done.cancelled())
            .await
            .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Forcefully abort the loop task.  Only used after a missed grace
    /// period; the done signal still fires.
    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct RegisterLoop;

impl RegisterLoop {
    /// Register once, then keep re-registering every `opts.interval` until
    /// `cancel` fires.
    ///
    /// The first response is returned to the caller and is not passed to
    /// `on_success`.  When the first attempt fails the error is returned
    /// and no task is spawned.
    pub async fn start(
        client: Arc<dyn PrimaryApi>,
        request: RegisterProxyRequest,
        opts: RegisterLoopOptions,
        mut hooks: RegisterHooks,
        cancel: CancellationToken,
    ) -> Result<(RegisterProxyResponse, RegisterLoopHandle), SdkError> {
        let mut first = request.clone();
        (hooks.mutate)(&mut first);
        let resp = attempt(client.as_ref(), &first, opts.attempt_timeout).await?;

        tracing::info!(
            primary = %client.primary_url(),
            siblings = resp.sibling_replicas.len(),
            interval_secs = opts.interval.as_secs(),
            "registered with primary"
        );

        let done = CancellationToken::new();
        let task = tokio::spawn(run(client, request, opts, hooks, cancel, done.clone()));

        Ok((resp, RegisterLoopHandle { done, task }))
    }
}

async fn attempt(
    client: &dyn PrimaryApi,
    req: &RegisterProxyRequest,
    timeout: Duration,
) -> Result<RegisterProxyResponse, SdkError> {
    match tokio::time::timeout(timeout, client.register(req)).await {
        Ok(result) => result,
        Err(_) => Err(SdkError::Timeout(format!(
            "register attempt exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn run(
    client: Arc<dyn PrimaryApi>,
    base: RegisterProxyRequest,
    opts: RegisterLoopOptions,
    mut hooks: RegisterHooks,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    // Fires on every exit path, including abort and panic.
    let _done = done.drop_guard();

    let mut ticker = interval_at(Instant::now() + opts.interval, opts.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut req = base.clone();
        (hooks.mutate)(&mut req);
        let result = attempt(client.as_ref(), &req, opts.attempt_timeout).await;

        if cancel.is_cancelled() {
            tracing::debug!("discarding registration result after cancel");
            break;
        }

        match result.and_then(|resp| (hooks.on_success)(&resp)) {
            Ok(()) => {
                if consecutive_failures > 0 {
                    tracing::info!(
                        after_failures = consecutive_failures,
                        "registration recovered"
                    );
                }
                consecutive_failures = 0;
            }
            Err(error) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                tracing::warn!(
                    error = %error,
                    consecutive_failures,
                    "registration attempt failed"
                );
                (hooks.on_failure)(&RegistrationFailure {
                    error,
                    consecutive_failures,
                });
            }
        }
    }

    tracing::debug!("registration loop stopped");
}
