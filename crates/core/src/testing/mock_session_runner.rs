//! Mock session runner for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::transfer::{
    SessionOutcome, SessionProgress, SessionReport, SessionRequest, SessionRunner, TransferError,
};

#[derive(Debug, Clone)]
enum Ending {
    Outcome(SessionOutcome),
    BlockUntilCancelled,
    LaunchFailure,
}

/// Scripted behaviour for one session: progress deltas, then an ending.
#[derive(Debug, Clone)]
pub struct MockSession {
    deltas: Vec<u64>,
    ending: Ending,
}

impl MockSession {
    pub fn completes(deltas: Vec<u64>) -> Self {
        Self {
            deltas,
            ending: Ending::Outcome(SessionOutcome::Completed),
        }
    }

    pub fn stalls(deltas: Vec<u64>, idle_secs: u64) -> Self {
        Self {
            deltas,
            ending: Ending::Outcome(SessionOutcome::Stalled { idle_secs }),
        }
    }

    pub fn crashes(deltas: Vec<u64>, exit_code: Option<i32>, diagnostics: &str) -> Self {
        Self {
            deltas,
            ending: Ending::Outcome(SessionOutcome::Crashed {
                exit_code,
                diagnostics: diagnostics.to_string(),
            }),
        }
    }

    /// Reports `deltas`, then waits for the cancel signal.
    pub fn blocks_until_cancelled(deltas: Vec<u64>) -> Self {
        Self {
            deltas,
            ending: Ending::BlockUntilCancelled,
        }
    }

    /// The tool binary cannot be started.
    pub fn fails_to_launch() -> Self {
        Self {
            deltas: Vec::new(),
            ending: Ending::LaunchFailure,
        }
    }
}

/// Mock implementation of the SessionRunner trait.
///
/// Sessions play back scripts queued with [`MockSessionRunner::push`]
/// (or per job source with [`MockSessionRunner::push_for_source`]); with
/// nothing queued a session completes without progress.
#[derive(Debug, Clone, Default)]
pub struct MockSessionRunner {
    script: Arc<RwLock<VecDeque<MockSession>>>,
    by_source: Arc<RwLock<HashMap<String, VecDeque<MockSession>>>>,
    requests: Arc<RwLock<Vec<SessionRequest>>>,
}

impl MockSessionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour of the next session.
    pub async fn push(&self, session: MockSession) {
        self.script.write().await.push_back(session);
    }

    /// Queue a session for jobs whose source is `source`. Takes precedence
    /// over the shared queue.
    pub async fn push_for_source(&self, source: &str, session: MockSession) {
        self.by_source
            .write()
            .await
            .entry(source.to_string())
            .or_default()
            .push_back(session);
    }

    async fn next_session(&self, source: &str) -> MockSession {
        if let Some(session) = self
            .by_source
            .write()
            .await
            .get_mut(source)
            .and_then(VecDeque::pop_front)
        {
            return session;
        }
        self.script
            .write()
            .await
            .pop_front()
            .unwrap_or_else(|| MockSession::completes(Vec::new()))
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<SessionRequest> {
        self.requests.read().await.clone()
    }
}

#[async_trait]
impl SessionRunner for MockSessionRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run_session(
        &self,
        request: SessionRequest,
        progress: mpsc::Sender<SessionProgress>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, TransferError> {
        let session = self.next_session(&request.source).await;
        self.requests.write().await.push(request);

        if let Ending::LaunchFailure = session.ending {
            return Err(TransferError::Launch {
                binary: PathBuf::from("mock-transfer"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
            });
        }

        let mut bytes = 0;
        for delta in session.deltas {
            bytes += delta;
            let _ = progress.send(SessionProgress::bytes(delta)).await;
        }

        let outcome = match session.ending {
            Ending::Outcome(outcome) => outcome,
            Ending::BlockUntilCancelled | Ending::LaunchFailure => {
                while !*cancel.borrow_and_update() {
                    if cancel.changed().await.is_err() {
                        break;
                    }
                }
                SessionOutcome::Cancelled
            }
        };

        Ok(SessionReport {
            outcome,
            bytes,
            duration_ms: 0,
        })
    }
}
