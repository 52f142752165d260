//! Identity lifecycle: provisioning, leasing, quota accounting and retirement.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::naming::generate_handle;
use super::{
    Identity, IdentityError, IdentityFilter, IdentityState, IdentityStore, ProvisionError,
};
use crate::audit::{AuditEvent, AuditHandle};
use crate::config::DomainProfile;
use crate::directory::{DirectoryClient, DirectoryConfig, DirectoryError};
use crate::metrics;
use crate::quota::{QuotaStatus, QuotaTracker};

/// Result of a retirement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireOutcome {
    /// Torn down directory-side and removed locally.
    Retired,
    /// Nothing to do; the identity is already gone.
    AlreadyRetired,
    /// Marked Retiring; teardown runs when the in-flight session releases it.
    Deferred,
}

impl RetireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireOutcome::Retired => "retired",
            RetireOutcome::AlreadyRetired => "already_retired",
            RetireOutcome::Deferred => "deferred",
        }
    }
}

/// Result of a per-domain connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct DomainHealth {
    pub domain: String,
    pub credentials_present: bool,
    pub directory_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl DomainHealth {
    pub fn is_healthy(&self) -> bool {
        self.credentials_present && self.directory_ok
    }
}

/// Owns every identity record.
///
/// Quota counters change only through [`IdentityManager::record_progress`],
/// called from the scheduling task of the job holding the lease.
pub struct IdentityManager {
    store: Arc<dyn IdentityStore>,
    directory: Arc<dyn DirectoryClient>,
    tracker: QuotaTracker,
    config: DirectoryConfig,
    profiles: HashMap<String, DomainProfile>,
    audit: Option<AuditHandle>,
    leases: Mutex<HashSet<String>>,
    provisioning: tokio::sync::Mutex<()>,
}

impl IdentityManager {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        directory: Arc<dyn DirectoryClient>,
        tracker: QuotaTracker,
        config: DirectoryConfig,
        profiles: Vec<DomainProfile>,
    ) -> Self {
        Self {
            store,
            directory,
            tracker,
            config,
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
            audit: None,
            leases: Mutex::new(HashSet::new()),
            provisioning: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    pub fn profile(&self, domain: &str) -> Option<&DomainProfile> {
        self.profiles.get(domain)
    }

    /// Configured domains, by name.
    pub fn profiles(&self) -> Vec<&DomainProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub fn get(&self, handle: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.store.get(handle)?)
    }

    /// Copies of the stored records matching `filter`.
    pub fn snapshot(&self, filter: &IdentityFilter) -> Result<Vec<Identity>, IdentityError> {
        Ok(self.store.list(filter)?)
    }

    /// Hand out an Active identity under threshold, provisioning one if needed.
    pub async fn acquire_active_identity(
        &self,
        profile: &DomainProfile,
    ) -> Result<Identity, ProvisionError> {
        let now = Utc::now();
        let active = self.store.list(
            &IdentityFilter::new()
                .with_domain(&profile.name)
                .with_state(IdentityState::Active),
        )?;

        let mut exhausted = Vec::new();
        for identity in active {
            if !self.tracker.is_exhausted(&identity, now) {
                debug!(handle = %identity.handle, domain = %profile.name, "Reusing active identity");
                return Ok(identity);
            }
            exhausted.push(identity.handle);
        }

        // Leftovers from a run that stopped before rotating.
        for handle in exhausted {
            if self.is_leased(&handle) {
                continue;
            }
            if let Err(e) = self.retire_identity(&handle).await {
                warn!(handle = %handle, error = %e, "Failed to retire exhausted identity");
            }
        }

        self.provision(profile).await
    }

    /// Like [`Self::acquire_active_identity`], but keeps `preferred` when it is
    /// still Active and under threshold.
    pub async fn acquire_preferred(
        &self,
        profile: &DomainProfile,
        preferred: Option<&str>,
    ) -> Result<Identity, ProvisionError> {
        if let Some(handle) = preferred {
            if let Some(identity) = self.store.get(handle)? {
                if identity.state == IdentityState::Active
                    && identity.domain == profile.name
                    && !self.tracker.is_exhausted(&identity, Utc::now())
                {
                    return Ok(identity);
                }
            }
        }
        self.acquire_active_identity(profile).await
    }

    /// Make sure the domain has an Active identity under threshold besides
    /// `current`, provisioning one when it does not and the pool has room.
    /// Returns the identity provisioned, if any.
    pub async fn ensure_standby(
        &self,
        profile: &DomainProfile,
        current: &str,
    ) -> Result<Option<Identity>, ProvisionError> {
        let now = Utc::now();
        let live = self
            .store
            .list(&IdentityFilter::new().with_domain(&profile.name).live())?;

        let spare = live.iter().any(|identity| {
            identity.handle != current
                && identity.state == IdentityState::Active
                && !self.tracker.is_exhausted(identity, now)
        });
        if spare {
            debug!(domain = %profile.name, "Standby identity already available");
            return Ok(None);
        }
        if live.len() >= profile.pool_size_limit {
            debug!(domain = %profile.name, limit = profile.pool_size_limit, "No room for a standby identity");
            return Ok(None);
        }

        info!(domain = %profile.name, current = %current, "Provisioning standby identity");
        self.provision(profile).await.map(Some)
    }

    /// Manual override: provision a fresh identity even if one is active.
    pub async fn provision_now(&self, profile: &DomainProfile) -> Result<Identity, ProvisionError> {
        self.provision(profile).await
    }

    async fn provision(&self, profile: &DomainProfile) -> Result<Identity, ProvisionError> {
        let _guard = self.provisioning.lock().await;

        let live = self
            .store
            .list(&IdentityFilter::new().with_domain(&profile.name).live())?
            .len();
        if live >= profile.pool_size_limit {
            metrics::PROVISION_FAILURES
                .with_label_values(&["pool_exhausted"])
                .inc();
            return Err(ProvisionError::PoolExhausted {
                domain: profile.name.clone(),
                limit: profile.pool_size_limit,
            });
        }

        let handle = generate_handle(&profile.name);
        let mut identity = Identity::new(&handle, &profile.name, Utc::now());
        self.store.insert(&identity)?;
        info!(handle = %handle, domain = %profile.name, "Provisioning identity");

        if let Err((attempts, e)) = self
            .with_retry(profile, "create_account", &handle, || {
                self.directory.create_account(profile, &handle)
            })
            .await
        {
            self.mark_failed(&mut identity, &e).await;
            return Err(self.provision_failed(profile, "create_account", attempts, e));
        }

        let propagation = self.config.propagation_delay();
        if !propagation.is_zero() {
            debug!(handle = %handle, delay_ms = propagation.as_millis() as u64, "Waiting for account propagation");
            sleep(propagation).await;
        }

        let membership = self
            .with_retry(profile, "add_member", &handle, || {
                self.directory.add_member(profile, &profile.group, &handle)
            })
            .await;
        match membership {
            Ok(()) | Err((_, DirectoryError::AlreadyExists(_))) => {}
            Err((attempts, e)) => {
                self.mark_failed(&mut identity, &e).await;
                // Best effort; the account is useless without membership.
                if let Err(cleanup) = self.directory.delete_account(profile, &handle).await {
                    warn!(handle = %handle, error = %cleanup, "Failed to delete half-provisioned account");
                }
                return Err(self.provision_failed(profile, "add_member", attempts, e));
            }
        }

        let now = Utc::now();
        identity
            .transition(IdentityState::Active, now)
            .map_err(|(from, to)| {
                ProvisionError::Store(format!("identity {} cannot move from {} to {}", handle, from, to))
            })?;
        identity.cumulative_bytes = 0;
        identity.window_started_at = now;
        self.store.update(&identity)?;

        metrics::IDENTITIES_PROVISIONED.inc();
        self.emit(AuditEvent::IdentityProvisioned {
            handle: handle.clone(),
            domain: profile.name.clone(),
        })
        .await;
        info!(handle = %handle, domain = %profile.name, "Identity active");

        Ok(identity)
    }

    fn provision_failed(
        &self,
        profile: &DomainProfile,
        operation: &'static str,
        attempts: u32,
        source: DirectoryError,
    ) -> ProvisionError {
        metrics::PROVISION_FAILURES
            .with_label_values(&[source.kind()])
            .inc();
        ProvisionError::Directory {
            domain: profile.name.clone(),
            operation,
            attempts,
            source,
        }
    }

    /// Run a directory call with a per-call timeout, retrying transient
    /// failures with exponential backoff up to the configured attempts.
    async fn with_retry<T, F, Fut>(
        &self,
        profile: &DomainProfile,
        operation: &'static str,
        handle: &str,
        mut call: F,
    ) -> Result<T, (u32, DirectoryError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let max_attempts = self.config.provision_max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match timeout(self.config.call_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(DirectoryError::Timeout(self.config.call_timeout_secs)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff_for_attempt(attempt);
                    warn!(
                        domain = %profile.name,
                        handle = %handle,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Directory call failed, retrying"
                    );
                    self.emit(AuditEvent::ProvisionRetry {
                        domain: profile.name.clone(),
                        handle: handle.to_string(),
                        operation: operation.to_string(),
                        attempt,
                        error: e.to_string(),
                    })
                    .await;
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    /// Retire an identity: Retiring, drop group membership, delete the
    /// account, Retired, remove the local record.
    ///
    /// Calling this for an identity that is already gone is a no-op.
    pub async fn retire_identity(&self, handle: &str) -> Result<RetireOutcome, IdentityError> {
        let Some(mut identity) = self.store.get(handle)? else {
            return Ok(RetireOutcome::AlreadyRetired);
        };

        match identity.state {
            IdentityState::Retired => {
                self.store.delete(handle)?;
                return Ok(RetireOutcome::AlreadyRetired);
            }
            IdentityState::Failed => {
                return Err(IdentityError::InvalidTransition {
                    handle: handle.to_string(),
                    from: IdentityState::Failed,
                    to: IdentityState::Retiring,
                });
            }
            IdentityState::Retiring => {}
            _ => {
                self.transition(&mut identity, IdentityState::Retiring)?;
                self.store.update(&identity)?;
            }
        }

        if self.is_leased(handle) {
            info!(handle = %handle, "Identity in use, retirement deferred until its session ends");
            return Ok(RetireOutcome::Deferred);
        }

        self.teardown(identity).await
    }

    async fn teardown(&self, mut identity: Identity) -> Result<RetireOutcome, IdentityError> {
        let profile = self
            .profiles
            .get(&identity.domain)
            .ok_or_else(|| IdentityError::UnknownDomain(identity.domain.clone()))?;
        let handle = identity.handle.clone();

        if self.config.is_protected(&handle) {
            warn!(handle = %handle, "Protected account, skipping directory deletion");
        } else {
            let removal = self
                .with_retry(profile, "remove_member", &handle, || {
                    self.directory.remove_member(profile, &profile.group, &handle)
                })
                .await;
            if let Err((_, e)) = removal {
                if !matches!(e, DirectoryError::NotFound(_)) {
                    self.mark_failed(&mut identity, &e).await;
                    return Err(e.into());
                }
            }

            let deletion = self
                .with_retry(profile, "delete_account", &handle, || {
                    self.directory.delete_account(profile, &handle)
                })
                .await;
            if let Err((_, e)) = deletion {
                if !matches!(e, DirectoryError::NotFound(_)) {
                    self.mark_failed(&mut identity, &e).await;
                    return Err(e.into());
                }
            }
        }

        self.transition(&mut identity, IdentityState::Retired)?;
        self.store.update(&identity)?;
        self.store.delete(&handle)?;

        metrics::IDENTITIES_RETIRED.inc();
        self.emit(AuditEvent::IdentityRetired {
            handle: handle.clone(),
            domain: identity.domain.clone(),
            cumulative_bytes: identity.cumulative_bytes,
        })
        .await;
        info!(handle = %handle, bytes = identity.cumulative_bytes, "Identity retired");

        Ok(RetireOutcome::Retired)
    }

    /// Account `delta` bytes to the identity's quota window.
    pub async fn record_progress(
        &self,
        handle: &str,
        delta: u64,
    ) -> Result<QuotaStatus, IdentityError> {
        let mut identity = self
            .store
            .get(handle)?
            .ok_or_else(|| IdentityError::NotFound(handle.to_string()))?;

        let now = Utc::now();
        let status = self.tracker.record_progress(&mut identity, delta, now);
        identity.updated_at = now;
        self.store.update(&identity)?;

        if status == QuotaStatus::ThresholdReached {
            info!(
                handle = %handle,
                bytes = identity.cumulative_bytes,
                threshold = self.tracker.threshold(),
                "Identity reached its quota threshold"
            );
            self.emit(AuditEvent::QuotaThresholdReached {
                handle: handle.to_string(),
                domain: identity.domain.clone(),
                cumulative_bytes: identity.cumulative_bytes,
                threshold: self.tracker.threshold(),
            })
            .await;
        }

        Ok(status)
    }

    /// Mark an identity as referenced by a running session.
    pub fn lease(&self, handle: &str) -> bool {
        self.leases.lock().unwrap().insert(handle.to_string())
    }

    /// Drop a lease; finishes a deferred retirement.
    pub async fn release(&self, handle: &str) -> Result<(), IdentityError> {
        self.leases.lock().unwrap().remove(handle);

        if let Some(identity) = self.store.get(handle)? {
            if identity.state == IdentityState::Retiring {
                self.teardown(identity).await?;
            }
        }
        Ok(())
    }

    pub fn is_leased(&self, handle: &str) -> bool {
        self.leases.lock().unwrap().contains(handle)
    }

    /// Credential presence plus a lightweight directory read.
    pub async fn check_domain(&self, profile: &DomainProfile) -> DomainHealth {
        let credentials_present = tokio::fs::try_exists(&profile.credentials_path)
            .await
            .unwrap_or(false);

        let result = match timeout(
            self.config.call_timeout(),
            self.directory.check_connection(profile),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Timeout(self.config.call_timeout_secs)),
        };

        let error = match (&result, credentials_present) {
            (Err(e), _) => Some(e.to_string()),
            (Ok(()), false) => Some(format!(
                "credentials file {} not found",
                profile.credentials_path.display()
            )),
            (Ok(()), true) => None,
        };

        DomainHealth {
            domain: profile.name.clone(),
            credentials_present,
            directory_ok: result.is_ok(),
            error,
            checked_at: Utc::now(),
        }
    }

    /// Finish teardown for identities a crash left half-provisioned or
    /// half-retired. Returns how many were handled.
    pub async fn recover(&self) -> Result<usize, IdentityError> {
        let stranded = self.store.list(
            &IdentityFilter::new()
                .with_state(IdentityState::Provisioning)
                .with_state(IdentityState::Retiring),
        )?;

        let count = stranded.len();
        for identity in stranded {
            info!(handle = %identity.handle, state = %identity.state, "Recovering stranded identity");
            if let Err(e) = self.retire_identity(&identity.handle).await {
                warn!(handle = %identity.handle, error = %e, "Recovery teardown failed");
            }
        }
        Ok(count)
    }

    fn transition(
        &self,
        identity: &mut Identity,
        next: IdentityState,
    ) -> Result<(), IdentityError> {
        identity
            .transition(next, Utc::now())
            .map_err(|(from, to)| IdentityError::InvalidTransition {
                handle: identity.handle.clone(),
                from,
                to,
            })
    }

    async fn mark_failed(&self, identity: &mut Identity, error: &DirectoryError) {
        if identity.transition(IdentityState::Failed, Utc::now()).is_err() {
            return;
        }
        identity.failure_reason = Some(error.to_string());
        if let Err(e) = self.store.update(identity) {
            warn!(handle = %identity.handle, error = %e, "Failed to persist identity failure");
        }

        self.emit(AuditEvent::IdentityFailed {
            handle: identity.handle.clone(),
            domain: identity.domain.clone(),
            reason: error.to_string(),
        })
        .await;
        warn!(handle = %identity.handle, error = %error, "Identity failed");
    }

    async fn emit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.emit(event).await;
        }
    }
}
