//! Engine facade: the one entry point the dashboard API talks to.
//!
//! Everything returned is a copy; callers never hold references into the
//! scheduler's or identity manager's state.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::audit::{AuditEvent, AuditHandle};
use crate::identity::{
    DomainHealth, Identity, IdentityError, IdentityFilter, IdentityManager, ProvisionError,
    RetireOutcome,
};
use crate::job::{EnqueueRequest, Job, JobFilter, JobStore, JobStoreError};
use crate::scheduler::{JobScheduler, SchedulerError, SchedulerStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),
}

/// An identity as shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    #[serde(flatten)]
    pub identity: Identity,
    /// Bytes left before the threshold in the current window.
    pub remaining_bytes: u64,
    /// Held by an in-flight session.
    pub in_use: bool,
}

/// Live identities of one domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainPool {
    pub domain: String,
    pub threshold: u64,
    pub pool_size_limit: usize,
    pub identities: Vec<IdentitySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
    pub domains: usize,
    pub live_identities: usize,
}

pub struct Engine {
    scheduler: JobScheduler,
    identities: Arc<IdentityManager>,
    jobs: Arc<dyn JobStore>,
    audit: Option<AuditHandle>,
}

impl Engine {
    pub fn new(
        scheduler: JobScheduler,
        identities: Arc<IdentityManager>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            scheduler,
            identities,
            jobs,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, EngineError> {
        Ok(self.scheduler.enqueue(request).await?)
    }

    pub async fn cancel(
        &self,
        job_id: &str,
        reason: Option<String>,
        user_id: &str,
    ) -> Result<Job, EngineError> {
        Ok(self.scheduler.cancel(job_id, reason, user_id).await?)
    }

    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        Ok(self.jobs.list(filter)?)
    }

    pub fn job_count(&self, filter: &JobFilter) -> Result<i64, EngineError> {
        Ok(self.jobs.count(filter)?)
    }

    pub fn job(&self, id: &str) -> Result<Option<Job>, EngineError> {
        Ok(self.jobs.get(id)?)
    }

    /// Live identities per configured domain, with quota headroom.
    pub fn identity_pools(&self) -> Result<Vec<DomainPool>, EngineError> {
        let tracker = self.identities.tracker();
        let now = Utc::now();

        let mut pools = Vec::new();
        for profile in self.identities.profiles() {
            let identities = self
                .identities
                .snapshot(&IdentityFilter::new().with_domain(&profile.name).live())?
                .into_iter()
                .map(|identity| IdentitySummary {
                    remaining_bytes: tracker.remaining(&identity, now),
                    in_use: self.identities.is_leased(&identity.handle),
                    identity,
                })
                .collect();

            pools.push(DomainPool {
                domain: profile.name.clone(),
                threshold: tracker.threshold(),
                pool_size_limit: profile.pool_size_limit,
                identities,
            });
        }
        Ok(pools)
    }

    /// Manual override: retire an identity now (deferred while in use).
    pub async fn retire_now(
        &self,
        handle: &str,
        user_id: &str,
    ) -> Result<RetireOutcome, EngineError> {
        let outcome = self.identities.retire_identity(handle).await?;
        info!(handle = %handle, user_id = %user_id, ?outcome, "Manual retirement");

        self.emit(AuditEvent::IdentityRetireRequested {
            user_id: user_id.to_string(),
            handle: handle.to_string(),
            outcome: outcome.as_str().to_string(),
        })
        .await;
        Ok(outcome)
    }

    /// Manual override: provision an extra identity for `domain`.
    pub async fn provision_now(&self, domain: &str, user_id: &str) -> Result<Identity, EngineError> {
        let profile = self
            .identities
            .profile(domain)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;

        let result = self.identities.provision_now(&profile).await;
        info!(domain = %domain, user_id = %user_id, ok = result.is_ok(), "Manual provisioning");

        self.emit(AuditEvent::IdentityProvisionRequested {
            user_id: user_id.to_string(),
            domain: domain.to_string(),
            handle: result.as_ref().ok().map(|i| i.handle.clone()),
            error: result.as_ref().err().map(|e| e.to_string()),
        })
        .await;
        Ok(result?)
    }

    pub async fn check_domain(&self, domain: &str) -> Result<DomainHealth, EngineError> {
        let profile = self
            .identities
            .profile(domain)
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;
        Ok(self.identities.check_domain(profile).await)
    }

    /// Checks every domain concurrently.
    pub async fn check_all_domains(&self) -> Vec<DomainHealth> {
        let profiles = self.identities.profiles();
        join_all(
            profiles
                .into_iter()
                .map(|profile| self.identities.check_domain(profile)),
        )
        .await
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let live_identities = self
            .identities
            .snapshot(&IdentityFilter::new().live())?
            .len();

        Ok(EngineStatus {
            scheduler: self.scheduler.status()?,
            domains: self.identities.profiles().len(),
            live_identities,
        })
    }

    pub async fn start(&self, user_id: &str) {
        self.scheduler.start().await;
        self.emit(AuditEvent::SchedulerToggled {
            user_id: user_id.to_string(),
            running: true,
        })
        .await;
    }

    pub async fn stop(&self, user_id: &str) {
        self.scheduler.stop().await;
        self.emit(AuditEvent::SchedulerToggled {
            user_id: user_id.to_string(),
            running: false,
        })
        .await;
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.emit(event).await;
        }
    }
}
