//! Drives one transfer tool process: output parsing, stall detection,
//! cancellation and exit classification.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::command::build_command;
use super::config::TransferConfig;
use super::error::TransferError;
use super::progress::ProgressParser;
use super::traits::{SessionOutcome, SessionProgress, SessionReport, SessionRequest, SessionRunner};

/// Output lines kept for crash diagnostics.
const DIAGNOSTIC_LINES: usize = 20;

/// True once `now - last_progress` exceeds `stall_timeout`.
pub fn is_stalled(last_progress: Instant, now: Instant, stall_timeout: Duration) -> bool {
    now.saturating_duration_since(last_progress) > stall_timeout
}

/// [`SessionRunner`] backed by a real child process.
pub struct ProcessSupervisor {
    config: TransferConfig,
    stall_timeout: Duration,
    poll_interval: Duration,
}

impl ProcessSupervisor {
    /// Fails if the configured progress pattern does not compile.
    pub fn new(config: TransferConfig) -> Result<Self, TransferError> {
        ProgressParser::new(config.progress_pattern.as_deref())?;
        Ok(Self {
            stall_timeout: config.stall_timeout(),
            poll_interval: config.stall_poll_interval(),
            config,
        })
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn spawn(&self, request: &SessionRequest) -> Result<Child, TransferError> {
        let command = build_command(&self.config, request);
        info!(
            job_id = %request.job_id,
            identity = %request.identity,
            dry_run = request.dry_run,
            command = %command.display(),
            "Starting transfer session"
        );

        Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransferError::Launch {
                binary: command.program.clone(),
                source,
            })
    }
}

fn spawn_reader<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn kill(child: &mut Child, job_id: &str) {
    if let Err(e) = child.kill().await {
        warn!(job_id = %job_id, error = %e, "Failed to kill transfer process");
    }
}

fn diagnostics(tail: &VecDeque<String>) -> String {
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

#[async_trait]
impl SessionRunner for ProcessSupervisor {
    fn name(&self) -> &str {
        "process"
    }

    async fn run_session(
        &self,
        request: SessionRequest,
        progress: mpsc::Sender<SessionProgress>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, TransferError> {
        let started = Instant::now();
        let report = |outcome: SessionOutcome, bytes: u64| SessionReport {
            outcome,
            bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if *cancel.borrow() {
            return Ok(report(SessionOutcome::Cancelled, 0));
        }

        let mut parser = ProgressParser::new(self.config.progress_pattern.as_deref())?;
        let mut child = self.spawn(&request)?;

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, line_tx);
        }

        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut last_progress = Instant::now();
        let mut sent = 0u64;
        let mut cancel_open = true;
        let mut stall_check = interval(self.poll_interval);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    debug!(job_id = %request.job_id, "{}", line);

                    if let Some(sample) = parser.parse_line(&line) {
                        last_progress = Instant::now();
                        if sample.delta_bytes > 0 {
                            sent += sample.delta_bytes;
                            let update = SessionProgress {
                                delta_bytes: sample.delta_bytes,
                                speed: sample.speed,
                            };
                            if progress.send(update).await.is_err() {
                                warn!(job_id = %request.job_id, "Progress receiver dropped");
                            }
                        }
                    }

                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                _ = stall_check.tick() => {
                    let now = Instant::now();
                    if is_stalled(last_progress, now, self.stall_timeout) {
                        let idle_secs = now.saturating_duration_since(last_progress).as_secs();
                        warn!(
                            job_id = %request.job_id,
                            identity = %request.identity,
                            idle_secs,
                            "No transfer progress, killing stalled session"
                        );
                        kill(&mut child, &request.job_id).await;
                        return Ok(report(SessionOutcome::Stalled { idle_secs }, sent));
                    }
                }
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow_and_update() => {
                            info!(job_id = %request.job_id, "Cancelling transfer session");
                            kill(&mut child, &request.job_id).await;
                            return Ok(report(SessionOutcome::Cancelled, sent));
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }

        // Output closed; the process should be exiting.
        let status = match timeout(self.config.exit_timeout(), child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    job_id = %request.job_id,
                    timeout_secs = self.config.exit_timeout_secs,
                    "Transfer process did not exit after closing its output"
                );
                kill(&mut child, &request.job_id).await;
                tail.push_back(format!(
                    "process did not exit within {}s of closing its output",
                    self.config.exit_timeout_secs
                ));
                return Ok(report(
                    SessionOutcome::Crashed {
                        exit_code: None,
                        diagnostics: diagnostics(&tail),
                    },
                    sent,
                ));
            }
        };

        let outcome = if status.success() {
            SessionOutcome::Completed
        } else {
            SessionOutcome::Crashed {
                exit_code: status.code(),
                diagnostics: diagnostics(&tail),
            }
        };
        info!(
            job_id = %request.job_id,
            outcome = outcome.label(),
            exit_code = ?status.code(),
            bytes = sent,
            "Transfer session ended"
        );

        Ok(report(outcome, sent))
    }
}
