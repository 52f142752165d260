//! Job scheduler implementation.
//!
//! Each claimed job is advanced by exactly one session inside its own task:
//! acquire an identity, run the transfer, account progress, then decide
//! whether the job completes, restarts, rotates, fails or is cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::DomainProfile;
use crate::identity::{Identity, IdentityManager};
use crate::job::{EnqueueRequest, Job, JobCounter, JobFilter, JobState, JobStore};
use crate::metrics;
use crate::notify::Notifier;
use crate::quota::{format_size, QuotaStatus};
use crate::transfer::{
    SessionOutcome, SessionProgress, SessionReport, SessionRequest, SessionRunner, TransferError,
};

use super::config::SchedulerConfig;
use super::types::{ActiveSession, SchedulerError, SchedulerStatus, TickReport};

const PROGRESS_BUFFER: usize = 64;

/// Invoked with the latest copy of a job after every state change and
/// progress update.
pub type UpdateCallback = Arc<dyn Fn(&Job) + Send + Sync>;

#[derive(Debug, Clone)]
enum StopRequest {
    /// User cancellation; the job ends Cancelled.
    Cancel(String),
    /// Scheduler shutdown; the job stays runnable.
    Interrupt,
}

struct SessionSlot {
    domain: String,
    identity: Option<String>,
    claimed_at: DateTime<Utc>,
    session_bytes: u64,
    speed: Option<String>,
    cancel_tx: watch::Sender<bool>,
    stop: Option<StopRequest>,
    standby_requested: bool,
}

/// A job reserved for one session by [`JobScheduler::claim_next`].
pub struct Claim {
    job: Job,
    cancel_rx: watch::Receiver<bool>,
}

impl Claim {
    pub fn job(&self) -> &Job {
        &self.job
    }
}

struct SessionRun {
    job: Job,
    result: Result<SessionReport, TransferError>,
    session_bytes: u64,
    threshold_reached: bool,
    duration_ms: u64,
}

/// Drives jobs through sessions until they complete, fail or are cancelled.
#[derive(Clone)]
pub struct JobScheduler {
    config: SchedulerConfig,
    jobs: Arc<dyn JobStore>,
    identities: Arc<IdentityManager>,
    runner: Arc<dyn SessionRunner>,
    audit: Option<AuditHandle>,
    notifier: Option<Arc<dyn Notifier>>,
    on_update: Option<UpdateCallback>,

    // Runtime state
    running: Arc<AtomicBool>,
    active: Arc<Mutex<HashMap<String, SessionSlot>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<dyn JobStore>,
        identities: Arc<IdentityManager>,
        runner: Arc<dyn SessionRunner>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            jobs,
            identities,
            runner,
            audit: None,
            notifier: None,
            on_update: None,
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_update_callback(mut self, callback: UpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Persist a new job as Queued.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, SchedulerError> {
        if request.source.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("source is empty".to_string()));
        }
        if request.destination.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "destination is empty".to_string(),
            ));
        }
        if self.identities.profile(&request.domain).is_none() {
            return Err(SchedulerError::UnknownDomain(request.domain));
        }

        let job = self.jobs.create(request)?;
        info!(
            job_id = %job.id,
            domain = %job.domain,
            source = %job.source,
            destination = %job.destination,
            dry_run = job.dry_run,
            "Job enqueued"
        );

        self.emit(AuditEvent::JobEnqueued {
            job_id: job.id.clone(),
            requested_by: job.requested_by.clone(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            domain: job.domain.clone(),
            dry_run: job.dry_run,
        })
        .await;
        self.publish(&job);

        Ok(job)
    }

    /// Cancel a job.
    ///
    /// Jobs without a session in flight are Cancelled at once. A running
    /// session is signalled to stop and the job becomes Cancelled when it
    /// returns; the returned copy still shows the running state.
    pub async fn cancel(
        &self,
        job_id: &str,
        reason: Option<String>,
        cancelled_by: &str,
    ) -> Result<Job, SchedulerError> {
        let job = self
            .jobs
            .get(job_id)?
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;

        if !job.state.can_cancel() {
            return Err(SchedulerError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state.state_type().to_string(),
                operation: "cancel".to_string(),
            });
        }

        self.emit(AuditEvent::JobCancelled {
            job_id: job_id.to_string(),
            cancelled_by: cancelled_by.to_string(),
            reason: reason.clone(),
            previous_state: job.state.state_type().to_string(),
        })
        .await;

        let reason = reason.unwrap_or_else(|| format!("cancelled by {}", cancelled_by));

        // Claims happen under the same lock, so a job is either in flight
        // or cancelled here, never both.
        let cancelled = {
            let mut active = self.active.lock().unwrap();
            let updated = match active.get_mut(job_id) {
                Some(slot) => {
                    slot.stop = Some(StopRequest::Cancel(reason));
                    let _ = slot.cancel_tx.send(true);
                    None
                }
                None => Some(self.jobs.update_state(
                    job_id,
                    JobState::Cancelled {
                        reason,
                        cancelled_at: Utc::now(),
                    },
                )?),
            };
            updated
        };

        match cancelled {
            Some(updated) => {
                self.after_transition(&job.state, &updated).await;
                Ok(updated)
            }
            None => {
                info!(job_id = %job_id, "Cancellation signalled to in-flight session");
                Ok(job)
            }
        }
    }

    /// Reserve the oldest runnable job whose domain is idle, if the global
    /// session bound has room.
    pub fn claim_next(&self) -> Result<Option<Claim>, SchedulerError> {
        let mut active = self.active.lock().unwrap();
        if active.len() >= self.config.max_concurrent_sessions.max(1) {
            return Ok(None);
        }

        // Every claimed job holds its domain busy, so excluding busy domains
        // also excludes claimed jobs.
        let busy: HashSet<String> = active.values().map(|slot| slot.domain.clone()).collect();
        let filter = JobFilter::new()
            .runnable()
            .excluding_domains(busy)
            .with_limit(1);

        let Some(job) = self.jobs.list(&filter)?.into_iter().next() else {
            return Ok(None);
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        active.insert(
            job.id.clone(),
            SessionSlot {
                domain: job.domain.clone(),
                identity: None,
                claimed_at: Utc::now(),
                session_bytes: 0,
                speed: None,
                cancel_tx,
                stop: None,
                standby_requested: false,
            },
        );
        debug!(job_id = %job.id, domain = %job.domain, state = job.state.state_type(), "Claimed job");

        Ok(Some(Claim { job, cancel_rx }))
    }

    /// Claim and advance one job. `None` when nothing is runnable.
    pub async fn tick(&self) -> Result<Option<TickReport>, SchedulerError> {
        match self.claim_next()? {
            Some(claim) => self.advance(claim).await.map(Some),
            None => Ok(None),
        }
    }

    /// Advance a claimed job by one session and release the claim.
    pub async fn advance(&self, claim: Claim) -> Result<TickReport, SchedulerError> {
        let job_id = claim.job.id.clone();
        let mut result = self.run_claim(claim).await;
        if let Err(ref e) = result {
            error!(job_id = %job_id, error = %e, "Failed to advance job");
        }

        match self.release_claim(&job_id) {
            Ok(Some((previous, cancelled))) => {
                self.after_transition(&previous, &cancelled).await;
                result = Ok(match result {
                    Ok(report) => TickReport {
                        state: cancelled.state,
                        ..report
                    },
                    Err(_) => no_session(cancelled),
                });
            }
            Ok(None) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to settle late cancellation"),
        }
        result
    }

    /// Drop the claim on `job_id`, applying any cancellation that arrived
    /// after the session outcome was written. Holds the `active` lock
    /// throughout. Returns the previous state and the cancelled job.
    fn release_claim(&self, job_id: &str) -> Result<Option<(JobState, Job)>, SchedulerError> {
        let mut active = self.active.lock().unwrap();
        let Some(StopRequest::Cancel(reason)) = active.remove(job_id).and_then(|slot| slot.stop)
        else {
            return Ok(None);
        };

        let Some(job) = self.jobs.get(job_id)? else {
            return Ok(None);
        };
        if !job.state.can_cancel() {
            return Ok(None);
        }

        info!(job_id = %job_id, state = job.state.state_type(), "Applying cancellation received at session end");
        let cancelled = self.jobs.update_state(
            job_id,
            JobState::Cancelled {
                reason,
                cancelled_at: Utc::now(),
            },
        )?;
        Ok(Some((job.state, cancelled)))
    }

    async fn run_claim(&self, claim: Claim) -> Result<TickReport, SchedulerError> {
        let Claim { job, cancel_rx } = claim;

        let Some(profile) = self.identities.profile(&job.domain).cloned() else {
            let reason = format!("unknown domain {}", job.domain);
            let job = self.fail(&job, reason).await?;
            return Ok(no_session(job));
        };

        let limit = self.config.max_identities_per_job;
        if limit > 0 && job.rotation_count >= limit {
            let reason = format!("identity rotation limit reached ({} rotations)", limit);
            let job = self.fail(&job, reason).await?;
            return Ok(no_session(job));
        }

        let identity = match self
            .identities
            .acquire_preferred(&profile, job.state.identity())
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                warn!(job_id = %job.id, domain = %job.domain, error = %e, "Identity acquisition failed");
                let job = self.fail(&job, format!("identity acquisition failed: {}", e)).await?;
                return Ok(no_session(job));
            }
        };

        // Stopped while the identity was being acquired.
        match self.stop_request(&job.id) {
            Some(StopRequest::Cancel(reason)) => {
                let job = self.cancelled(&job, reason).await?;
                return Ok(no_session(job));
            }
            Some(StopRequest::Interrupt) => return Ok(no_session(job)),
            None => {}
        }

        self.identities.lease(&identity.handle);
        let run = self.run_session(&job, &profile, &identity, cancel_rx).await;
        if let Err(e) = self.identities.release(&identity.handle).await {
            warn!(handle = %identity.handle, error = %e, "Failed to release identity");
        }

        self.finish_session(run?, &identity).await
    }

    async fn run_session(
        &self,
        job: &Job,
        profile: &DomainProfile,
        identity: &Identity,
        cancel: watch::Receiver<bool>,
    ) -> Result<SessionRun, SchedulerError> {
        let counted = self.jobs.increment_counter(&job.id, JobCounter::Session)?;
        let job = self
            .transition(
                &counted,
                JobState::Running {
                    identity: identity.handle.clone(),
                    session: counted.sessions,
                    started_at: Utc::now(),
                },
            )
            .await?;

        if let Some(slot) = self.active.lock().unwrap().get_mut(&job.id) {
            slot.identity = Some(identity.handle.clone());
        }

        self.emit(AuditEvent::SessionStarted {
            job_id: job.id.clone(),
            identity: identity.handle.clone(),
            attempt: job.sessions,
        })
        .await;
        if job.sessions == 1 {
            self.notify(format!(
                "Job {} started: {} -> {} as {}",
                job.id, job.source, job.destination, identity.handle
            ));
        }

        let request = SessionRequest {
            job_id: job.id.clone(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            identity: identity.handle.clone(),
            credentials_path: profile.credentials_path.clone(),
            remote_credentials_path: profile.remote_credentials_path.clone(),
            dry_run: job.dry_run,
        };

        metrics::ACTIVE_SESSIONS.inc();
        let started = Instant::now();

        let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BUFFER);
        let session = self.runner.run_session(request, progress_tx, cancel);
        let consume = async {
            let mut session_bytes = 0u64;
            let mut threshold_reached = false;
            while let Some(progress) = progress_rx.recv().await {
                session_bytes += progress.delta_bytes;
                if self.account(&job.id, &identity.handle, &progress).await {
                    threshold_reached = true;
                }
            }
            (session_bytes, threshold_reached)
        };

        let (result, (session_bytes, threshold_reached)) = tokio::join!(session, consume);
        metrics::ACTIVE_SESSIONS.dec();

        Ok(SessionRun {
            job,
            result,
            session_bytes,
            threshold_reached,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Book one progress report. Returns true when it pushed the identity
    /// over its threshold.
    async fn account(&self, job_id: &str, handle: &str, progress: &SessionProgress) -> bool {
        if let Some(slot) = self.active.lock().unwrap().get_mut(job_id) {
            slot.session_bytes += progress.delta_bytes;
            if progress.speed.is_some() {
                slot.speed = progress.speed.clone();
            }
        }

        if progress.delta_bytes == 0 {
            return false;
        }

        let crossed = match self
            .identities
            .record_progress(handle, progress.delta_bytes)
            .await
        {
            Ok(status) => status == QuotaStatus::ThresholdReached,
            Err(e) => {
                warn!(job_id = %job_id, handle = %handle, error = %e, "Failed to record identity progress");
                false
            }
        };
        if !crossed {
            self.prepare_standby(job_id, handle);
        }

        match self.jobs.add_bytes(job_id, progress.delta_bytes) {
            Ok(job) => self.publish(&job),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to record job progress"),
        }
        metrics::BYTES_TRANSFERRED.inc_by(progress.delta_bytes);

        crossed
    }

    /// Once per session, when the identity is past `standby_at_percent` of
    /// its threshold, provision a spare for the domain in the background.
    fn prepare_standby(&self, job_id: &str, handle: &str) {
        let Some(percent) = self.config.standby_at_percent else {
            return;
        };
        let identity = match self.identities.get(handle) {
            Ok(Some(identity)) => identity,
            Ok(None) => return,
            Err(e) => {
                warn!(handle = %handle, error = %e, "Failed to read identity usage");
                return;
            }
        };

        let tracker = self.identities.tracker();
        let used = tracker.threshold() - tracker.remaining(&identity, Utc::now());
        if (used as u128) * 100 < (tracker.threshold() as u128) * (percent as u128) {
            return;
        }

        {
            let mut active = self.active.lock().unwrap();
            match active.get_mut(job_id) {
                Some(slot) if !slot.standby_requested => slot.standby_requested = true,
                _ => return,
            }
        }
        let Some(profile) = self.identities.profile(&identity.domain).cloned() else {
            return;
        };

        debug!(job_id = %job_id, handle = %handle, used, "Identity nearing threshold");
        let identities = self.identities.clone();
        let current = handle.to_string();
        tokio::spawn(async move {
            match identities.ensure_standby(&profile, &current).await {
                Ok(Some(standby)) => {
                    info!(domain = %profile.name, handle = %standby.handle, "Standby identity ready")
                }
                Ok(None) => {}
                Err(e) => warn!(domain = %profile.name, error = %e, "Failed to provision standby identity"),
            }
        });
    }

    async fn finish_session(
        &self,
        run: SessionRun,
        identity: &Identity,
    ) -> Result<TickReport, SchedulerError> {
        let SessionRun {
            mut job,
            result,
            session_bytes,
            threshold_reached,
            duration_ms,
        } = run;
        let handle = identity.handle.clone();

        let (label, diagnostics) = match result {
            Ok(ref report) => match report.outcome {
                SessionOutcome::Crashed {
                    ref diagnostics, ..
                } => ("crashed", Some(diagnostics.clone())),
                ref outcome => (outcome.label(), None),
            },
            Err(ref e) => ("launch_failed", Some(e.to_string())),
        };
        info!(
            job_id = %job.id,
            identity = %handle,
            outcome = label,
            session_bytes,
            duration_ms,
            "Session ended"
        );
        metrics::SESSIONS_TOTAL.with_label_values(&[label]).inc();
        metrics::SESSION_DURATION
            .with_label_values(&[label])
            .observe(duration_ms as f64 / 1000.0);
        self.emit(AuditEvent::SessionEnded {
            job_id: job.id.clone(),
            identity: handle.clone(),
            outcome: label.to_string(),
            session_bytes,
            duration_ms,
            diagnostics: diagnostics.clone(),
        })
        .await;

        let completed = matches!(
            result,
            Ok(SessionReport {
                outcome: SessionOutcome::Completed,
                ..
            })
        );

        if threshold_reached {
            match self.identities.retire_identity(&handle).await {
                Ok(outcome) => debug!(handle = %handle, ?outcome, "Exhausted identity retired"),
                Err(e) => warn!(handle = %handle, error = %e, "Failed to retire exhausted identity"),
            }
            if !completed {
                job = self.jobs.increment_counter(&job.id, JobCounter::Rotation)?;
                self.notify(format!(
                    "Job {}: identity {} reached its quota, rotating ({} so far)",
                    job.id, handle, job.rotation_count
                ));
            }
        }

        let last_identity = Some(handle);
        let now = Utc::now();
        let stop = self.stop_request(&job.id);

        let next = if completed {
            let prefix = if job.dry_run { "dry run: " } else { "" };
            JobState::Completed {
                summary: format!(
                    "{}transferred {} in {} session(s)",
                    prefix,
                    format_size(job.bytes_transferred),
                    job.sessions
                ),
                completed_at: now,
            }
        } else if let Some(StopRequest::Cancel(reason)) = stop {
            JobState::Cancelled {
                reason,
                cancelled_at: now,
            }
        } else if matches!(stop, Some(StopRequest::Interrupt))
            || matches!(
                result,
                Ok(SessionReport {
                    outcome: SessionOutcome::Cancelled,
                    ..
                })
            )
        {
            JobState::Restarting {
                reason: "session interrupted by scheduler stop".to_string(),
                last_identity,
                since: now,
            }
        } else if let Ok(SessionReport {
            outcome: SessionOutcome::Stalled { idle_secs },
            ..
        }) = result
        {
            job = self.jobs.increment_counter(&job.id, JobCounter::Stall)?;
            JobState::Restarting {
                reason: format!("stalled: no progress for {}s", idle_secs),
                last_identity,
                since: now,
            }
        } else if threshold_reached {
            // The tool stops itself at the upload limit.
            JobState::Restarting {
                reason: "identity reached its quota threshold; rotating".to_string(),
                last_identity,
                since: now,
            }
        } else {
            job = self.jobs.increment_counter(&job.id, JobCounter::Crash)?;
            let exit_code = match result {
                Ok(SessionReport {
                    outcome: SessionOutcome::Crashed { exit_code, .. },
                    ..
                }) => exit_code,
                _ => None,
            };
            let last_line = diagnostics
                .as_deref()
                .and_then(last_diagnostic_line)
                .unwrap_or("no output");

            if job.crash_count >= self.config.max_restarts {
                JobState::Failed {
                    reason: format!("crashed {} times; last error: {}", job.crash_count, last_line),
                    failed_at: now,
                }
            } else {
                JobState::Restarting {
                    reason: format!(
                        "crashed (exit code {}): {}; restart {}/{}",
                        exit_code.map_or("none".to_string(), |c| c.to_string()),
                        last_line,
                        job.crash_count,
                        self.config.max_restarts
                    ),
                    last_identity,
                    since: now,
                }
            }
        };

        let job = self.transition(&job, next).await?;
        Ok(TickReport {
            job_id: job.id.clone(),
            session: result.ok().map(|report| report.outcome),
            session_bytes,
            state: job.state,
        })
    }

    /// Turn jobs a previous run left Running into Restarting.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let stranded = self
            .jobs
            .list(&JobFilter::new().with_state("running").with_limit(i64::MAX))?;
        let in_flight: HashSet<String> = self.active.lock().unwrap().keys().cloned().collect();

        let mut recovered = 0;
        for job in stranded {
            if in_flight.contains(&job.id) {
                continue;
            }
            info!(job_id = %job.id, "Recovering job interrupted mid-session");
            let next = JobState::Restarting {
                reason: "service restarted during session".to_string(),
                last_identity: job.state.identity().map(String::from),
                since: Utc::now(),
            };
            self.transition(&job, next).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Start the scheduler (spawns the background loop).
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!("Starting job scheduler");

        match self.identities.recover().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Recovered stranded identities"),
            Err(e) => warn!(error = %e, "Identity recovery failed"),
        }
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Recovered interrupted jobs"),
            Err(e) => warn!(error = %e, "Job recovery failed"),
        }

        self.spawn_loop();

        info!("Job scheduler started");
    }

    /// Stop claiming jobs and interrupt in-flight sessions. Interrupted
    /// jobs stay runnable.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping job scheduler");

        let _ = self.shutdown_tx.send(());

        let interrupted = {
            let mut active = self.active.lock().unwrap();
            for slot in active.values_mut() {
                if slot.stop.is_none() {
                    slot.stop = Some(StopRequest::Interrupt);
                }
                let _ = slot.cancel_tx.send(true);
            }
            let count = active.len();
            count
        };
        if interrupted > 0 {
            info!(sessions = interrupted, "Interrupting in-flight sessions");
        }

        let deadline = Instant::now() + self.config.stop_timeout();
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                warn!(sessions = self.active_count(), "Timed out waiting for sessions to stop");
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        info!("Job scheduler stopped");
    }

    pub fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let active_sessions = {
            let active = self.active.lock().unwrap();
            let mut sessions: Vec<ActiveSession> = active
                .iter()
                .map(|(job_id, slot)| ActiveSession {
                    job_id: job_id.clone(),
                    domain: slot.domain.clone(),
                    identity: slot.identity.clone(),
                    claimed_at: slot.claimed_at,
                    session_bytes: slot.session_bytes,
                    speed: slot.speed.clone(),
                })
                .collect();
            sessions.sort_by_key(|s| s.claimed_at);
            sessions
        };

        let count = |state: &str| -> Result<usize, SchedulerError> {
            Ok(self.jobs.count(&JobFilter::new().with_state(state))? as usize)
        };

        Ok(SchedulerStatus {
            running: self.is_running(),
            active_sessions,
            queued_count: count("queued")?,
            running_count: count("running")?,
            restarting_count: count("restarting")?,
        })
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    fn stop_request(&self, job_id: &str) -> Option<StopRequest> {
        self.active
            .lock()
            .unwrap()
            .get(job_id)
            .and_then(|slot| slot.stop.clone())
    }

    fn spawn_loop(&self) {
        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            info!("Scheduling loop started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduling loop received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {
                        if !scheduler.running.load(Ordering::Relaxed) {
                            break;
                        }
                        scheduler.dispatch();
                    }
                }
            }

            info!("Scheduling loop stopped");
        });
    }

    /// Claim as many jobs as slots allow, each advanced in its own task.
    fn dispatch(&self) {
        loop {
            match self.claim_next() {
                Ok(Some(claim)) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        // Errors are logged by advance.
                        let _ = scheduler.advance(claim).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    break;
                }
            }
        }
    }

    async fn fail(&self, job: &Job, reason: String) -> Result<Job, SchedulerError> {
        self.transition(
            job,
            JobState::Failed {
                reason,
                failed_at: Utc::now(),
            },
        )
        .await
    }

    async fn cancelled(&self, job: &Job, reason: String) -> Result<Job, SchedulerError> {
        self.transition(
            job,
            JobState::Cancelled {
                reason,
                cancelled_at: Utc::now(),
            },
        )
        .await
    }

    async fn transition(&self, job: &Job, next: JobState) -> Result<Job, SchedulerError> {
        let updated = self.jobs.update_state(&job.id, next)?;
        self.after_transition(&job.state, &updated).await;
        Ok(updated)
    }

    async fn after_transition(&self, previous: &JobState, job: &Job) {
        let from = previous.state_type();
        let to = job.state.state_type();
        let reason = job.state.reason().map(String::from);

        info!(job_id = %job.id, from, to, reason = reason.as_deref().unwrap_or(""), "Job state changed");
        self.emit(AuditEvent::JobStateChanged {
            job_id: job.id.clone(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            reason: reason.clone(),
        })
        .await;

        if job.state.is_terminal() {
            metrics::JOBS_FINISHED.with_label_values(&[to]).inc();
            match job.state {
                JobState::Completed { ref summary, .. } => {
                    self.notify(format!("Job {} completed: {}", job.id, summary));
                }
                JobState::Failed { ref reason, .. } => {
                    self.notify(format!("Job {} failed: {}", job.id, reason));
                }
                _ => {}
            }
        }

        self.publish(job);
    }

    fn publish(&self, job: &Job) {
        if let Some(ref callback) = self.on_update {
            callback(job);
        }
    }

    /// Fire-and-forget; failures are logged.
    fn notify(&self, message: String) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&message).await {
                warn!(error = %e, "Failed to send notification");
            }
        });
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.emit(event).await;
        }
    }
}

fn no_session(job: Job) -> TickReport {
    TickReport {
        job_id: job.id,
        session: None,
        session_bytes: 0,
        state: job.state,
    }
}

fn last_diagnostic_line(diagnostics: &str) -> Option<&str> {
    diagnostics
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityFilter, IdentityState};
    use crate::job::{JobStoreError, SqliteJobStore};
    use crate::quota::GIB;
    use crate::testing::{fixtures, MockDirectoryClient, MockNotifier, MockSession, MockSessionRunner};

    struct Harness {
        scheduler: JobScheduler,
        jobs: Arc<SqliteJobStore>,
        identities: Arc<IdentityManager>,
        runner: Arc<MockSessionRunner>,
        directory: Arc<MockDirectoryClient>,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
        let directory = Arc::new(MockDirectoryClient::new());
        let identities = fixtures::identity_manager(directory.clone(), 10 * GIB);
        let runner = Arc::new(MockSessionRunner::new());
        let scheduler = JobScheduler::new(
            config,
            jobs.clone(),
            identities.clone(),
            runner.clone(),
        );
        Harness {
            scheduler,
            jobs,
            identities,
            runner,
            directory,
        }
    }

    fn request(domain: &str) -> EnqueueRequest {
        EnqueueRequest::new("/srv/media", "gdrive:Backup", domain)
    }

    #[test]
    fn test_last_diagnostic_line() {
        assert_eq!(
            last_diagnostic_line("starting\nERROR : quota exceeded\n\n"),
            Some("ERROR : quota exceeded")
        );
        assert_eq!(last_diagnostic_line("  \n"), None);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_domain() {
        let h = harness(fixtures::scheduler_config());
        let result = h.scheduler.enqueue(request("unknown.example")).await;
        assert!(matches!(result, Err(SchedulerError::UnknownDomain(_))));
        assert!(matches!(
            h.scheduler.enqueue(EnqueueRequest::new(" ", "gdrive:", "example.com")).await,
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_tick_with_nothing_runnable() {
        let h = harness(fixtures::scheduler_config());
        assert!(h.scheduler.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_session_completes_job() {
        let h = harness(fixtures::scheduler_config());
        h.runner
            .push(MockSession::completes(vec![GIB, GIB]))
            .await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert_eq!(report.job_id, job.id);
        assert_eq!(report.session, Some(SessionOutcome::Completed));
        assert_eq!(report.session_bytes, 2 * GIB);
        assert!(matches!(report.state, JobState::Completed { .. }));

        let job = h.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(job.bytes_transferred, 2 * GIB);
        assert_eq!(job.sessions, 1);

        // Identity stays active with the bytes booked against it.
        let active = h
            .identities
            .snapshot(&IdentityFilter::new().with_domain("example.com"))
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cumulative_bytes, 2 * GIB);
        assert_eq!(h.directory.created_accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_credentials_passed_to_runner() {
        let h = harness(fixtures::scheduler_config());
        h.scheduler
            .enqueue(request("example.com").with_dry_run(true))
            .await
            .unwrap();
        h.scheduler.tick().await.unwrap();

        let requests = h.runner.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].dry_run);
        assert!(requests[0].identity.ends_with("@example.com"));
        assert_eq!(
            requests[0].credentials_path,
            fixtures::domain_profile("example.com").credentials_path
        );
    }

    #[tokio::test]
    async fn test_crash_restarts_until_limit() {
        let h = harness(fixtures::scheduler_config().with_max_restarts(2));
        h.runner
            .push(MockSession::crashes(vec![], Some(1), "ERROR : first"))
            .await;
        h.runner
            .push(MockSession::crashes(vec![], Some(1), "ERROR : second"))
            .await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        let first = h.scheduler.tick().await.unwrap().unwrap();
        match first.state {
            JobState::Restarting { ref reason, .. } => {
                assert!(reason.contains("restart 1/2"), "{}", reason)
            }
            ref other => panic!("expected restarting, got {:?}", other),
        }

        let second = h.scheduler.tick().await.unwrap().unwrap();
        match second.state {
            JobState::Failed { ref reason, .. } => {
                assert_eq!(reason, "crashed 2 times; last error: ERROR : second")
            }
            ref other => panic!("expected failed, got {:?}", other),
        }
        assert_eq!(h.jobs.get(&job.id).unwrap().unwrap().crash_count, 2);
    }

    #[tokio::test]
    async fn test_stall_restarts_with_same_identity_uncounted() {
        let h = harness(fixtures::scheduler_config().with_max_restarts(1));
        h.runner.push(MockSession::stalls(vec![GIB], 600)).await;
        h.runner.push(MockSession::stalls(vec![], 600)).await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert!(matches!(report.state, JobState::Restarting { .. }));

        let job = h.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(job.stall_count, 2);
        assert_eq!(job.crash_count, 0);

        let requests = h.runner.requests().await;
        assert_eq!(requests[0].identity, requests[1].identity);
        assert_eq!(h.directory.created_accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_rotates_identity() {
        let h = harness(fixtures::scheduler_config());
        // 10 GiB threshold: the tool stops itself after crossing it.
        h.runner
            .push(MockSession::crashes(vec![6 * GIB, 5 * GIB], Some(7), "upload limit"))
            .await;
        h.runner.push(MockSession::completes(vec![GIB])).await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        let first = h.scheduler.tick().await.unwrap().unwrap();
        assert!(matches!(first.state, JobState::Restarting { .. }));
        let after_first = h.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(after_first.rotation_count, 1);
        assert_eq!(after_first.crash_count, 0);
        assert_eq!(h.directory.deleted_accounts().await.len(), 1);

        let second = h.scheduler.tick().await.unwrap().unwrap();
        assert!(matches!(second.state, JobState::Completed { .. }));

        let requests = h.runner.requests().await;
        assert_ne!(requests[0].identity, requests[1].identity);
        assert_eq!(
            h.jobs.get(&job.id).unwrap().unwrap().bytes_transferred,
            12 * GIB
        );
    }

    #[tokio::test]
    async fn test_rotation_limit_fails_job() {
        let h = harness(fixtures::scheduler_config().with_max_identities_per_job(1));
        h.runner
            .push(MockSession::crashes(vec![11 * GIB], Some(7), "upload limit"))
            .await;
        h.scheduler.enqueue(request("example.com")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert!(report.session.is_none());
        match report.state {
            JobState::Failed { ref reason, .. } => assert!(reason.contains("rotation limit")),
            ref other => panic!("expected failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquisition_failure_fails_job() {
        let h = harness(fixtures::scheduler_config());
        h.directory
            .fail_next_creates(vec![crate::directory::DirectoryError::Auth(
                "bad token".to_string(),
            )])
            .await;
        h.scheduler.enqueue(request("example.com")).await.unwrap();

        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert!(report.session.is_none());
        match report.state {
            JobState::Failed { ref reason, .. } => {
                assert!(reason.starts_with("identity acquisition failed"), "{}", reason)
            }
            ref other => panic!("expected failed, got {:?}", other),
        }
        assert!(h.runner.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_job_is_immediate() {
        let h = harness(fixtures::scheduler_config());
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        let cancelled = h
            .scheduler
            .cancel(&job.id, Some("not needed".to_string()), "admin")
            .await
            .unwrap();
        assert_eq!(cancelled.state.reason(), Some("not needed"));
        assert!(h.scheduler.tick().await.unwrap().is_none());

        let again = h.scheduler.cancel(&job.id, None, "admin").await;
        assert!(matches!(again, Err(SchedulerError::InvalidState { .. })));
        assert!(matches!(
            h.scheduler.cancel("missing", None, "admin").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_session() {
        let h = harness(fixtures::scheduler_config());
        h.runner
            .push(MockSession::blocks_until_cancelled(vec![GIB]))
            .await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        let claim = h.scheduler.claim_next().unwrap().unwrap();
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.advance(claim).await });

        // Wait until the session is in flight.
        for _ in 0..100 {
            if h.scheduler.status().unwrap().active_sessions[0].identity.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        h.scheduler
            .cancel(&job.id, Some("stop it".to_string()), "admin")
            .await
            .unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.session, Some(SessionOutcome::Cancelled));
        assert!(matches!(report.state, JobState::Cancelled { .. }));
        // Bytes accounted before the cancel are kept.
        assert_eq!(h.jobs.get(&job.id).unwrap().unwrap().bytes_transferred, GIB);
        assert!(h.scheduler.status().unwrap().active_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_one_session_per_domain() {
        let h = harness(fixtures::scheduler_config());
        let first = h.scheduler.enqueue(request("example.com")).await.unwrap();
        h.scheduler.enqueue(request("example.com")).await.unwrap();
        let other = h.scheduler.enqueue(request("example.org")).await.unwrap();

        let a = h.scheduler.claim_next().unwrap().unwrap();
        let b = h.scheduler.claim_next().unwrap().unwrap();
        assert_eq!(a.job().id, first.id);
        assert_eq!(b.job().id, other.id);
        assert!(h.scheduler.claim_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_global_session_bound() {
        let h = harness(fixtures::scheduler_config().with_max_concurrent_sessions(1));
        h.scheduler.enqueue(request("example.com")).await.unwrap();
        h.scheduler.enqueue(request("example.org")).await.unwrap();

        let _claim = h.scheduler.claim_next().unwrap().unwrap();
        assert!(h.scheduler.claim_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_running_jobs() {
        let h = harness(fixtures::scheduler_config());
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();
        h.jobs
            .update_state(
                &job.id,
                JobState::Running {
                    identity: "old@example.com".to_string(),
                    session: 1,
                    started_at: Utc::now(),
                },
            )
            .unwrap();

        assert_eq!(h.scheduler.recover().await.unwrap(), 1);
        let job = h.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(job.state.state_type(), "restarting");
        assert_eq!(job.state.identity(), Some("old@example.com"));
    }

    #[tokio::test]
    async fn test_update_callback_and_notifications() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier = Arc::new(MockNotifier::new());

        let h = harness(fixtures::scheduler_config());
        let scheduler = h
            .scheduler
            .clone()
            .with_update_callback(Arc::new(move |job: &Job| {
                sink.lock()
                    .unwrap()
                    .push(job.state.state_type().to_string());
            }))
            .with_notifier(notifier.clone());
        h.runner.push(MockSession::completes(vec![GIB])).await;

        scheduler.enqueue(request("example.com")).await.unwrap();
        scheduler.tick().await.unwrap();

        let states = seen.lock().unwrap().clone();
        assert_eq!(states.first().map(String::as_str), Some("queued"));
        assert!(states.contains(&"running".to_string()));
        assert_eq!(states.last().map(String::as_str), Some("completed"));

        // Notifications are sent from spawned tasks.
        for _ in 0..50 {
            if notifier.messages().await.len() >= 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let messages = notifier.messages().await;
        assert!(messages.iter().any(|m| m.contains("started")));
        assert!(messages.iter().any(|m| m.contains("completed")));
    }

    #[tokio::test]
    async fn test_start_and_stop_loop() {
        let h = harness(fixtures::scheduler_config());
        h.runner.push(MockSession::completes(vec![GIB])).await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        h.scheduler.start().await;
        assert!(h.scheduler.is_running());

        for _ in 0..100 {
            if h.jobs.get(&job.id).unwrap().unwrap().state.is_terminal() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.jobs.get(&job.id).unwrap().unwrap().state.state_type(),
            "completed"
        );

        h.scheduler.stop().await;
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_interrupts_without_cancelling() {
        let h = harness(fixtures::scheduler_config());
        h.runner
            .push(MockSession::blocks_until_cancelled(vec![]))
            .await;
        let job = h.scheduler.enqueue(request("example.com")).await.unwrap();

        h.scheduler.start().await;
        for _ in 0..100 {
            if h.jobs.get(&job.id).unwrap().unwrap().state.state_type() == "running" {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        h.scheduler.stop().await;

        let job = h.jobs.get(&job.id).unwrap().unwrap();
        assert_eq!(job.state.state_type(), "restarting");
        assert!(h.scheduler.status().unwrap().active_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_standby_provisioned_once_near_threshold() {
        let h = harness(fixtures::scheduler_config().with_standby_at_percent(50));
        h.runner
            .push(MockSession::completes(vec![2 * GIB, 4 * GIB, GIB]))
            .await;
        h.scheduler.enqueue(request("example.com")).await.unwrap();

        let report = h.scheduler.tick().await.unwrap().unwrap();
        assert_eq!(report.state.state_type(), "completed");

        for _ in 0..100 {
            if h.directory.created_accounts().await.len() >= 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(h.directory.created_accounts().await.len(), 2);
        let live = h
            .identities
            .snapshot(&IdentityFilter::new().with_domain("example.com").live())
            .unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|i| i.state == IdentityState::Active));
    }

    #[tokio::test]
    async fn test_no_standby_without_opt_in() {
        let h = harness(fixtures::scheduler_config());
        h.runner
            .push(MockSession::completes(vec![2 * GIB, 7 * GIB]))
            .await;
        h.scheduler.enqueue(request("example.com")).await.unwrap();

        h.scheduler.tick().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(h.directory.created_accounts().await.len(), 1);
    }

    /// Job store whose counts always fail.
    struct BrokenCounts(SqliteJobStore);

    impl JobStore for BrokenCounts {
        fn create(&self, request: EnqueueRequest) -> Result<Job, JobStoreError> {
            self.0.create(request)
        }
        fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
            self.0.get(id)
        }
        fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
            self.0.list(filter)
        }
        fn count(&self, _filter: &JobFilter) -> Result<i64, JobStoreError> {
            Err(JobStoreError::Database("database is locked".to_string()))
        }
        fn update_state(&self, id: &str, state: JobState) -> Result<Job, JobStoreError> {
            self.0.update_state(id, state)
        }
        fn add_bytes(&self, id: &str, delta: u64) -> Result<Job, JobStoreError> {
            self.0.add_bytes(id, delta)
        }
        fn increment_counter(&self, id: &str, counter: JobCounter) -> Result<Job, JobStoreError> {
            self.0.increment_counter(id, counter)
        }
    }

    #[test]
    fn test_status_reports_store_failure() {
        let directory = Arc::new(MockDirectoryClient::new());
        let scheduler = JobScheduler::new(
            fixtures::scheduler_config(),
            Arc::new(BrokenCounts(SqliteJobStore::in_memory().unwrap())),
            fixtures::identity_manager(directory, 10 * GIB),
            Arc::new(MockSessionRunner::new()),
        );

        match scheduler.status() {
            Err(SchedulerError::Store(JobStoreError::Database(msg))) => {
                assert_eq!(msg, "database is locked")
            }
            Ok(status) => panic!("expected a store error, got {:?}", status),
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
}
