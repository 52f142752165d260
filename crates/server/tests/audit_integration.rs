//! Audit history as seen through the real binary and its SQLite file.

use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Child;
use tokio::time::sleep;

fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Config with the scheduler off, so submitted jobs stay queued and no
/// transfer tool is needed.
fn idle_config(port: u16, db_path: &Path) -> String {
    format!(
        r#"
[auth]
method = "none"

[server]
host = "127.0.0.1"
port = {port}

[database]
path = "{db}"

[scheduler]
enabled = false

[[domains]]
name = "example.com"
admin = "admin@example.com"
group = "pool@example.com"
credentials_path = "/nonexistent/example.com.json"
"#,
        port = port,
        db = db_path.display()
    )
}

/// A spawned `isync` process plus the config file it reads.
struct RunningServer {
    child: Child,
    port: u16,
    client: Client,
    _config: NamedTempFile,
}

impl RunningServer {
    async fn start(db_path: &Path) -> Self {
        let port = get_available_port();
        let mut config = NamedTempFile::new().unwrap();
        config
            .write_all(idle_config(port, db_path).as_bytes())
            .unwrap();
        config.flush().unwrap();

        let child = tokio::process::Command::new(env!("CARGO_BIN_EXE_isync"))
            .env("ISYNC_CONFIG", config.path())
            .env("RUST_LOG", "error")
            .kill_on_drop(true)
            .spawn()
            .expect("Failed to spawn server");

        let server = Self {
            child,
            port,
            client: Client::new(),
            _config: config,
        };
        assert!(server.wait_ready(40).await, "Server did not start in time");
        // Let the audit writer flush service_started
        sleep(Duration::from_millis(100)).await;
        server
    }

    async fn wait_ready(&self, max_attempts: u32) -> bool {
        for _ in 0..max_attempts {
            if self.client.get(self.url("/health")).send().await.is_ok() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/api/v1{}", self.port, path)
    }

    async fn get(&self, path: &str) -> Value {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to send request");
        assert!(response.status().is_success(), "GET {} failed", path);
        response.json().await.expect("Failed to parse JSON")
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Failed to send request");
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn audit_events(&self, query: &str) -> Vec<Value> {
        let body = self.get(&format!("/audit{}", query)).await;
        body["events"]
            .as_array()
            .expect("events should be an array")
            .clone()
    }

    async fn stop(mut self) {
        self.child.kill().await.ok();
        sleep(Duration::from_millis(100)).await;
    }
}

fn temp_db() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("isync.db");
    (temp_dir, db_path)
}

#[tokio::test]
async fn test_startup_creates_database_and_records_service_started() {
    let (_dir, db_path) = temp_db();
    let server = RunningServer::start(&db_path).await;

    assert!(db_path.exists(), "Database file should be created on startup");

    let events = server.audit_events("?event_type=service_started").await;
    assert_eq!(events.len(), 1);
    assert!(events[0]["data"]["version"].is_string());
    assert_eq!(events[0]["data"]["config_hash"].as_str().unwrap().len(), 16);

    server.stop().await;
}

#[tokio::test]
async fn test_enqueued_job_is_audited_with_requester() {
    let (_dir, db_path) = temp_db();
    let server = RunningServer::start(&db_path).await;

    let (status, job) = server
        .post(
            "/jobs",
            json!({
                "source": "/srv/media",
                "destination": "gdrive:Backup",
                "domain": "example.com"
            }),
        )
        .await;
    assert_eq!(status, 201);
    let job_id = job["id"].as_str().unwrap().to_string();

    sleep(Duration::from_millis(100)).await;

    let events = server.audit_events(&format!("?job_id={}", job_id)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "job_enqueued");
    assert_eq!(events[0]["user_id"], "anonymous");
    assert_eq!(events[0]["data"]["domain"], "example.com");

    let status = server.get("/engine/status").await;
    assert_eq!(status["running"], false);
    assert_eq!(status["queued_count"], 1);

    server.stop().await;
}

#[tokio::test]
async fn test_audit_filters_and_pagination() {
    let (_dir, db_path) = temp_db();
    let server = RunningServer::start(&db_path).await;

    for n in 0..3 {
        let (status, _) = server
            .post(
                "/jobs",
                json!({
                    "source": format!("/srv/share-{}", n),
                    "destination": "gdrive:Backup",
                    "domain": "example.com",
                    "dry_run": true
                }),
            )
            .await;
        assert_eq!(status, 201);
    }
    sleep(Duration::from_millis(100)).await;

    let enqueued = server.audit_events("?event_type=job_enqueued").await;
    assert_eq!(enqueued.len(), 3);
    assert!(enqueued.iter().all(|e| e["data"]["dry_run"] == true));

    // No identity work happened with the scheduler off
    assert!(server.audit_events("?domain=example.com").await.is_empty());

    let page = server.get("/audit?limit=2&offset=0").await;
    assert_eq!(page["limit"], 2);
    assert_eq!(page["offset"], 0);
    assert_eq!(page["events"].as_array().unwrap().len(), 2);
    // service_started plus three enqueues
    assert_eq!(page["total"], 4);

    // Newest first
    let newest = &page["events"][0];
    assert_eq!(newest["event_type"], "job_enqueued");
    assert_eq!(newest["data"]["source"], "/srv/share-2");

    server.stop().await;
}

#[tokio::test]
async fn test_history_survives_restart() {
    let (_dir, db_path) = temp_db();

    let first = RunningServer::start(&db_path).await;
    let (status, job) = first
        .post(
            "/jobs",
            json!({
                "source": "/srv/media",
                "destination": "gdrive:Backup",
                "domain": "example.com"
            }),
        )
        .await;
    assert_eq!(status, 201);
    let job_id = job["id"].as_str().unwrap().to_string();
    sleep(Duration::from_millis(100)).await;
    first.stop().await;

    let second = RunningServer::start(&db_path).await;

    let starts = second.audit_events("?event_type=service_started").await;
    assert_eq!(starts.len(), 2, "one service_started per boot");

    // The queued job is still there after the restart
    let job = second.get(&format!("/jobs/{}", job_id)).await;
    assert_eq!(job["state"]["type"], "queued");
    assert_eq!(
        second
            .audit_events(&format!("?job_id={}", job_id))
            .await
            .len(),
        1
    );

    second.stop().await;
}
