//! Common test utilities for router-level testing with mocks.
//!
//! The fixture builds the real router over file-backed SQLite stores, the
//! mock directory client, and scripted transfer sessions, so the API can be
//! exercised end to end without a directory service or transfer tool.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use isync_core::audit::{create_audit_system, AuditStore, SqliteAuditStore};
use isync_core::identity::SqliteIdentityStore;
use isync_core::job::{JobStore, SqliteJobStore};
use isync_core::quota::{QuotaTracker, GIB};
use isync_core::scheduler::UpdateCallback;
use isync_core::testing::{MockDirectoryClient, MockSessionRunner};
use isync_core::{
    Authenticator, Config, Engine, IdentityManager, Job, JobScheduler, NoneAuthenticator,
};

use isync_server::api::WsBroadcaster;

/// Re-export fixtures for test convenience
pub use isync_core::testing::fixtures;

/// In-process server with controllable mocks.
///
/// ```rust,ignore
/// let fixture = TestFixture::new().await;
/// let response = fixture.post("/api/v1/jobs", json!({
///     "source": "/srv/media",
///     "destination": "gdrive:Backup",
///     "domain": "example.com"
/// })).await;
/// assert_eq!(response.status, 201);
/// ```
pub struct TestFixture {
    pub router: Router,
    /// Scripted transfer sessions
    pub runner: Arc<MockSessionRunner>,
    /// Records account and group operations
    pub directory: Arc<MockDirectoryClient>,
    pub engine: Arc<Engine>,
    pub audit_store: Arc<dyn AuditStore>,
    pub broadcaster: WsBroadcaster,
    /// Holds the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    pub async fn new() -> Self {
        Self::with_config(TestConfig::default()).await
    }

    pub async fn with_config(test_config: TestConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let mut config: Config = fixtures::config();
        config.database.path = db_path.clone();
        for domain in &mut config.domains {
            domain.pool_size_limit = test_config.pool_size_limit;
        }

        let audit_store: Arc<dyn AuditStore> = Arc::new(
            SqliteAuditStore::new(&db_path).expect("Failed to create audit store"),
        );
        let job_store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(&db_path).expect("Failed to create job store"));
        let identity_store = Arc::new(
            SqliteIdentityStore::new(&db_path).expect("Failed to create identity store"),
        );

        let (audit_handle, audit_writer) = create_audit_system(Arc::clone(&audit_store), 100);
        tokio::spawn(audit_writer.run());

        let directory = Arc::new(MockDirectoryClient::new());
        let identities = Arc::new(
            IdentityManager::new(
                identity_store,
                directory.clone(),
                QuotaTracker::new(test_config.threshold, chrono::Duration::hours(24)),
                config.directory.clone(),
                config.domains.clone(),
            )
            .with_audit(audit_handle.clone()),
        );

        let broadcaster = WsBroadcaster::default();
        let for_callback = broadcaster.clone();
        let update_callback: UpdateCallback = Arc::new(move |job: &Job| {
            for_callback.job_updated(job);
        });

        let runner = Arc::new(MockSessionRunner::new());
        let scheduler = JobScheduler::new(
            fixtures::scheduler_config(),
            Arc::clone(&job_store),
            Arc::clone(&identities),
            runner.clone(),
        )
        .with_audit(audit_handle.clone())
        .with_update_callback(update_callback);

        let engine = Arc::new(
            Engine::new(scheduler, identities, job_store).with_audit(audit_handle.clone()),
        );

        let authenticator: Arc<dyn Authenticator> = Arc::new(NoneAuthenticator::new());
        let state = Arc::new(isync_server::state::AppState::new(
            config,
            authenticator,
            audit_handle,
            Arc::clone(&audit_store),
            Arc::clone(&engine),
            broadcaster.clone(),
        ));

        let router = isync_server::api::create_router(state);

        Self {
            router,
            runner,
            directory,
            engine,
            audit_store,
            broadcaster,
            temp_dir,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// POST without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    pub async fn delete_with_body(&self, path: &str, body: Value) -> TestResponse {
        self.request("DELETE", path, Some(body)).await
    }

    /// Send a POST request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Poll a job until it reaches `state` or `timeout` passes.
    pub async fn wait_for_job_state(&self, job_id: &str, state: &str, timeout: Duration) -> Value {
        let start = std::time::Instant::now();
        loop {
            let response = self.get(&format!("/api/v1/jobs/{}", job_id)).await;
            if response.body["state"]["type"] == state || start.elapsed() > timeout {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        self.send(request_builder.body(body).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body_bytes).into()))
        };

        TestResponse { status, body }
    }
}

/// Configuration for test fixture.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Quota threshold per identity
    pub threshold: u64,
    /// Live identities allowed per domain
    pub pool_size_limit: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            threshold: 10 * GIB,
            pool_size_limit: 10,
        }
    }
}

impl TestConfig {
    pub fn with_pool_size_limit(mut self, limit: usize) -> Self {
        self.pool_size_limit = limit;
        self
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
