//! Completion by polling, for backends that model work as an asynchronous job.
//!
//! A job is submitted once and its status fetched repeatedly with exponential backoff
//! until it reaches a terminal status or the attempt budget runs out. Exhaustion is
//! reported as `None`, never as an empty result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

use crate::client::{Client, ClientError};
use crate::model::{Message, Response};
use crate::tools::ToolSpec;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Status of a job as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    RequiresAction,
    Completed,
    Incomplete,
    Failed,
    Cancelled,
    Expired,
    Unknown(String),
}

/// Whether polling should stop at a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminality {
    Terminal,
    Pending,
    /// Not in the table. Treated as pending.
    Unrecognized,
}

impl RunStatus {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "cancelling" => RunStatus::Cancelling,
            "requires_action" => RunStatus::RequiresAction,
            "completed" => RunStatus::Completed,
            "incomplete" => RunStatus::Incomplete,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            "expired" => RunStatus::Expired,
            other => RunStatus::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Cancelling => "cancelling",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Unknown(other) => other,
        }
    }

    pub fn terminality(&self) -> Terminality {
        match self {
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling => {
                Terminality::Pending
            }
            RunStatus::RequiresAction
            | RunStatus::Completed
            | RunStatus::Incomplete
            | RunStatus::Failed
            | RunStatus::Cancelled
            | RunStatus::Expired => Terminality::Terminal,
            RunStatus::Unknown(_) => Terminality::Unrecognized,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminality() == Terminality::Terminal
    }
}

impl From<String> for RunStatus {
    fn from(status: String) -> Self {
        RunStatus::from_wire(&status)
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub thread_id: String,
    /// The body that created or resumed the job.
    pub request: Value,
}

/// A status observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub thread_id: String,
    pub status: RunStatus,
    /// The backend's raw job object.
    pub detail: Value,
}

/// Bookkeeping for one `await_completion` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPollState {
    pub run_id: String,
    pub thread_id: String,
    pub attempt: u32,
    pub next_delay: Duration,
    pub status: Option<RunStatus>,
}

/// A backend that runs completions as jobs.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit work and return its handle.
    async fn create_job(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<RunHandle, ClientError>;

    async fn get_status(&self, handle: &RunHandle) -> Result<RunState, ClientError>;

    /// Collect the output of a job that reached a terminal status.
    async fn fetch_result(&self, state: &RunState) -> Result<Response, ClientError>;
}

/// Bounded polling with exponential backoff.
#[derive(Debug, Clone)]
pub struct RunPoller {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    span: tracing::Span,
}

impl Default for RunPoller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_DELAY)
    }
}

impl RunPoller {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            span: tracing::debug_span!("run_poller"),
        }
    }

    /// Log inside `span` instead of the poller's own span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Poll until the job reaches a terminal status.
    ///
    /// Each non-terminal observation waits `next_delay` and doubles it; no wait follows
    /// the final attempt. A failed status fetch counts as a non-terminal observation.
    /// Returns `None` once `max_attempts` observations were made without a terminal one.
    pub async fn await_completion<B: JobBackend + ?Sized>(
        &self,
        backend: &B,
        handle: &RunHandle,
    ) -> Option<RunState> {
        self.poll(backend, handle)
            .instrument(self.span.clone())
            .await
    }

    async fn poll<B: JobBackend + ?Sized>(&self, backend: &B, handle: &RunHandle) -> Option<RunState> {
        let mut state = RunPollState {
            run_id: handle.run_id.clone(),
            thread_id: handle.thread_id.clone(),
            attempt: 0,
            next_delay: self.initial_delay,
            status: None,
        };

        while state.attempt < self.max_attempts {
            state.attempt += 1;

            match backend.get_status(handle).await {
                Ok(run) => {
                    state.status = Some(run.status.clone());
                    match run.status.terminality() {
                        Terminality::Terminal => {
                            debug!(
                                "Run {} reached {} after {} attempts",
                                state.run_id, run.status, state.attempt
                            );
                            return Some(run);
                        }
                        Terminality::Pending => {
                            debug!(
                                "Run {} is {} (attempt {}/{})",
                                state.run_id, run.status, state.attempt, self.max_attempts
                            );
                        }
                        Terminality::Unrecognized => {
                            warn!(
                                "Run {} reported unrecognized status {}, still waiting",
                                state.run_id, run.status
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Polling run {} failed (attempt {}/{}): {}",
                        state.run_id, state.attempt, self.max_attempts, e
                    );
                }
            }

            if state.attempt < self.max_attempts {
                tokio::time::sleep(state.next_delay).await;
                state.next_delay = state.next_delay.saturating_mul(2);
            }
        }

        warn!(
            "Run {} did not finish after {} attempts (last status: {})",
            state.run_id,
            state.attempt,
            state
                .status
                .as_ref()
                .map(RunStatus::as_str)
                .unwrap_or("none")
        );
        None
    }
}

/// A [`Client`] over a [`JobBackend`]: submit, await with a [`RunPoller`], fetch.
pub struct RunClient<B> {
    backend: B,
    poller: RunPoller,
}

impl<B: JobBackend> RunClient<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            poller: RunPoller::default(),
        }
    }

    pub fn with_poller(mut self, poller: RunPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: JobBackend> Client for RunClient<B> {
    async fn request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<Response, ClientError> {
        let handle = self.backend.create_job(messages, tools).await?;

        let state = self
            .poller
            .await_completion(&self.backend, &handle)
            .await
            .ok_or_else(|| {
                ClientError::Incomplete(format!(
                    "run {} did not reach a terminal status after {} attempts",
                    handle.run_id, self.poller.max_attempts
                ))
            })?;

        match state.status {
            RunStatus::Completed | RunStatus::Incomplete | RunStatus::RequiresAction => {
                self.backend.fetch_result(&state).await
            }
            ref status => {
                let reason = state
                    .detail
                    .pointer("/last_error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("no error detail");
                Err(ClientError::ProviderError(format!(
                    "run {} ended with status {}: {}",
                    state.run_id, status, reason
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct ScriptedBackend {
        statuses: Mutex<VecDeque<Result<&'static str, &'static str>>>,
        polled_at: Mutex<Vec<Instant>>,
    }

    impl ScriptedBackend {
        fn new(statuses: Vec<Result<&'static str, &'static str>>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                polled_at: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let polled = self.polled_at.lock().unwrap();
            polled.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl JobBackend for ScriptedBackend {
        async fn create_job(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolSpec>,
        ) -> Result<RunHandle, ClientError> {
            Ok(handle())
        }

        async fn get_status(&self, handle: &RunHandle) -> Result<RunState, ClientError> {
            self.polled_at.lock().unwrap().push(Instant::now());
            let next = self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok("queued"));
            match next {
                Ok(status) => Ok(RunState {
                    run_id: handle.run_id.clone(),
                    thread_id: handle.thread_id.clone(),
                    status: RunStatus::from_wire(status),
                    detail: serde_json::json!({"status": status}),
                }),
                Err(e) => Err(ClientError::ProviderError(e.to_string())),
            }
        }

        async fn fetch_result(&self, _state: &RunState) -> Result<Response, ClientError> {
            Ok(Response {
                data: vec![Message::bot("done")],
                ..Default::default()
            })
        }
    }

    fn handle() -> RunHandle {
        RunHandle {
            run_id: "run_1".to_string(),
            thread_id: "thread_1".to_string(),
            request: Value::Null,
        }
    }

    #[test]
    fn test_status_table() {
        for pending in ["queued", "in_progress", "cancelling"] {
            assert_eq!(RunStatus::from_wire(pending).terminality(), Terminality::Pending);
        }
        for terminal in [
            "requires_action",
            "completed",
            "incomplete",
            "failed",
            "cancelled",
            "expired",
        ] {
            assert!(RunStatus::from_wire(terminal).is_terminal(), "{}", terminal);
        }
        let unknown = RunStatus::from_wire("paused");
        assert_eq!(unknown.terminality(), Terminality::Unrecognized);
        assert_eq!(unknown.to_string(), "paused");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_with_doubling_delays() {
        let backend = ScriptedBackend::new(vec![Ok("queued"); 5]);
        let poller = RunPoller::new(5, Duration::from_millis(100));

        let start = Instant::now();
        let result = poller.await_completion(&backend, &handle()).await;

        assert!(result.is_none());
        assert_eq!(backend.polled_at.lock().unwrap().len(), 5);
        let expected = [100, 200, 400, 800].map(Duration::from_millis);
        let gaps = backend.gaps();
        assert_eq!(gaps.len(), expected.len());
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want && *gap < want + Duration::from_millis(5), "{:?} vs {:?}", gap, want);
        }
        assert!(start.elapsed() < Duration::from_millis(1520));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_terminal_state() {
        let backend = ScriptedBackend::new(vec![Ok("queued"), Ok("in_progress"), Ok("completed")]);
        let poller = RunPoller::new(5, Duration::from_millis(100));

        let state = poller.await_completion(&backend, &handle()).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(backend.polled_at.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_and_unknown_statuses_keep_polling() {
        let backend = ScriptedBackend::new(vec![
            Err("connection reset"),
            Ok("paused"),
            Ok("failed"),
        ]);
        let poller = RunPoller::new(5, Duration::from_millis(10));

        let state = poller.await_completion(&backend, &handle()).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_client_maps_outcomes() {
        let completed = RunClient::new(ScriptedBackend::new(vec![Ok("completed")]))
            .with_poller(RunPoller::new(3, Duration::from_millis(10)));
        let response = completed.request(vec![Message::user("hi")], vec![]).await.unwrap();
        assert_eq!(response.data, vec![Message::bot("done")]);

        let expired = RunClient::new(ScriptedBackend::new(vec![Ok("expired")]))
            .with_poller(RunPoller::new(3, Duration::from_millis(10)));
        let err = expired.request(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, ClientError::ProviderError(_)));

        let stuck = RunClient::new(ScriptedBackend::new(vec![]))
            .with_poller(RunPoller::new(3, Duration::from_millis(10)));
        let err = stuck.request(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, ClientError::Incomplete(_)));
    }
}
