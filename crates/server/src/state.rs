use std::sync::Arc;

use isync_core::audit::{AuditHandle, AuditStore};
use isync_core::{Authenticator, Config, Engine, SanitizedConfig};

use crate::api::WsBroadcaster;

/// Shared application state
pub struct AppState {
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    audit: AuditHandle,
    audit_store: Arc<dyn AuditStore>,
    engine: Arc<Engine>,
    ws_broadcaster: WsBroadcaster,
}

impl AppState {
    pub fn new(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        audit: AuditHandle,
        audit_store: Arc<dyn AuditStore>,
        engine: Arc<Engine>,
        ws_broadcaster: WsBroadcaster,
    ) -> Self {
        Self {
            config,
            authenticator,
            audit,
            audit_store,
            engine,
            ws_broadcaster,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }

    pub fn engine(&self) -> &Engine {
        self.engine.as_ref()
    }

    pub fn ws_broadcaster(&self) -> &WsBroadcaster {
        &self.ws_broadcaster
    }
}

/// State over in-memory stores and mocks, scheduler stopped.
#[cfg(test)]
pub(crate) fn test_state(auth: isync_core::config::AuthConfig) -> Arc<AppState> {
    use isync_core::audit::{create_audit_system, SqliteAuditStore};
    use isync_core::job::SqliteJobStore;
    use isync_core::quota::GIB;
    use isync_core::testing::{fixtures, MockDirectoryClient, MockSessionRunner};
    use isync_core::JobScheduler;

    let mut config = fixtures::config();
    config.auth = auth.clone();

    let authenticator: Arc<dyn Authenticator> =
        Arc::from(isync_core::create_authenticator(&auth).unwrap());
    let audit_store: Arc<dyn AuditStore> = Arc::new(SqliteAuditStore::in_memory().unwrap());
    let (audit, _writer) = create_audit_system(audit_store.clone(), 100);

    let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
    let identities = fixtures::identity_manager(Arc::new(MockDirectoryClient::new()), 10 * GIB);
    let scheduler = JobScheduler::new(
        fixtures::scheduler_config(),
        jobs.clone(),
        identities.clone(),
        Arc::new(MockSessionRunner::new()),
    );
    let engine = Arc::new(Engine::new(scheduler, identities, jobs));

    Arc::new(AppState::new(
        config,
        authenticator,
        audit,
        audit_store,
        engine,
        WsBroadcaster::default(),
    ))
}
