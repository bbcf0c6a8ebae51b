//! Integration tests for the service lifecycle: health probing, the start
//! lock, record handling, and stop semantics.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use local_ai_core::config::Settings;
use local_ai_core::fetch::FetchOptions;
use local_ai_core::service::{
    HealthOptions, MetadataRetry, RECORD_VERSION, ServiceError, ServiceManager, ServiceRecord,
    StartLock, free_port, wait_for_health,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_settings(root: &Path) -> Settings {
    Settings {
        manifest_gateway: "http://127.0.0.1:1/ipfs/".to_string(),
        metadata_gateway: "http://127.0.0.1:1/ipfs/".to_string(),
        accept_invalid_certs: false,
        llama_server: PathBuf::from("/bin/true"),
        api_server: PathBuf::from("local-ai-api"),
        record_file: root.join("running_service.json"),
        lock_file: root.join("start.lock"),
        output_dir: root.join("storage"),
        work_dir: root.join("work"),
        resource_dir: root.join("resources"),
        log_dir: root.join("logs"),
    }
}

fn fast_manager(settings: Settings) -> ServiceManager {
    ServiceManager::with_options(
        settings,
        FetchOptions {
            max_attempts: 1,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(2),
            total_timeout: Duration::from_secs(2),
        },
        HealthOptions {
            request_timeout: Duration::from_millis(500),
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            budget: Duration::from_millis(800),
        },
        MetadataRetry {
            retries: 1,
            delay: Duration::from_millis(10),
            cap: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
        },
    )
}

fn record_with(hash: &str, pid: u32, app_pid: u32, port: u16, app_port: u16) -> ServiceRecord {
    ServiceRecord {
        version: RECORD_VERSION,
        hash: hash.to_string(),
        port,
        app_port,
        local_text_path: PathBuf::from("/models/model.gguf"),
        local_projector_path: None,
        multimodal: false,
        context_length: 32768,
        family: String::new(),
        ram: 20.0,
        running_ai_command: vec!["llama-server".to_string()],
        pid,
        app_pid,
        last_activity: ServiceRecord::now_epoch_secs(),
    }
}

// ───── health probing ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_succeeds_on_ok_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok"
        })))
        .mount(&server)
        .await;

    let port = server.address().port();
    let options = HealthOptions {
        request_timeout: Duration::from_secs(1),
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        budget: Duration::from_secs(5),
    };
    wait_for_health(port, &options).await.unwrap();
}

#[tokio::test]
async fn test_health_retries_until_ready() {
    let server = MockServer::start().await;
    // First two probes see a failing service, then it comes up.
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok"
        })))
        .mount(&server)
        .await;

    let port = server.address().port();
    let options = HealthOptions {
        request_timeout: Duration::from_secs(1),
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        budget: Duration::from_secs(5),
    };
    wait_for_health(port, &options).await.unwrap();
}

#[tokio::test]
async fn test_health_rejects_non_ok_payload_until_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "starting"
        })))
        .mount(&server)
        .await;

    let port = server.address().port();
    let options = HealthOptions {
        request_timeout: Duration::from_millis(500),
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        budget: Duration::from_millis(300),
    };
    let result = wait_for_health(port, &options).await;
    match result {
        Err(ServiceError::HealthTimeout { last_error, .. }) => {
            assert!(
                last_error.contains("starting") || last_error.contains("unexpected"),
                "last error should describe the payload: {last_error}"
            );
        }
        other => panic!("expected HealthTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_times_out_when_nothing_listens() {
    let port = free_port().unwrap();
    let options = HealthOptions {
        request_timeout: Duration::from_millis(200),
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        budget: Duration::from_millis(200),
    };
    let result = wait_for_health(port, &options).await;
    assert!(matches!(result, Err(ServiceError::HealthTimeout { .. })));
}

// ───── start lock ─────────────────────────────────────────────────────────

#[test]
fn test_lock_conflict_reports_live_holder_pid() {
    let root = TempDir::new().unwrap();
    let lock_path = root.path().join("start.lock");

    let _held = StartLock::acquire(&lock_path).unwrap();
    match StartLock::acquire(&lock_path) {
        Err(ServiceError::AlreadyStarting { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyStarting, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_fails_fast_when_lock_is_held() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());
    let manager = fast_manager(settings.clone());

    let _held = StartLock::acquire(&settings.lock_file).unwrap();
    let result = manager.start("QmA", free_port().unwrap(), "127.0.0.1", 4096).await;

    assert!(matches!(result, Err(ServiceError::AlreadyStarting { .. })));
    assert!(settings.lock_file.exists(), "holder's lock must survive");
}

#[tokio::test]
async fn test_failed_start_leaves_no_lock_file() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());
    let manager = fast_manager(settings.clone());

    // The unroutable gateway makes the fetch fail fast.
    let result = manager.start("QmA", free_port().unwrap(), "127.0.0.1", 4096).await;

    assert!(result.is_err());
    assert!(
        !settings.lock_file.exists(),
        "lock must be released on failed start"
    );
}

// ───── start preconditions ────────────────────────────────────────────────

#[tokio::test]
async fn test_start_rejects_occupied_port() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());
    let manager = fast_manager(settings);

    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let taken = listener.local_addr().unwrap().port();

    let result = manager.start("QmA", taken, "127.0.0.1", 4096).await;
    match result {
        Err(ServiceError::PortInUse { port, .. }) => assert_eq!(port, taken),
        other => panic!("expected PortInUse, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_is_idempotent_for_same_hash() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());

    // Model already installed and recorded as running; start must return
    // success without touching the network or spawning anything.
    std::fs::create_dir_all(&settings.output_dir).unwrap();
    std::fs::write(settings.output_dir.join("QmA.gguf"), b"model").unwrap();
    record_with("QmA", 1, 1, 1, 1)
        .save(&settings.record_file)
        .await
        .unwrap();

    let manager = fast_manager(settings.clone());
    manager
        .start("QmA", free_port().unwrap(), "127.0.0.1", 4096)
        .await
        .unwrap();

    assert!(settings.record_file.exists(), "record must survive idempotent start");
    assert!(!settings.lock_file.exists(), "lock must be released");
}

// ───── stop ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_without_record_is_noop_false() {
    let root = TempDir::new().unwrap();
    let manager = fast_manager(test_settings(root.path()));
    assert!(!manager.stop().await.unwrap());
}

#[tokio::test]
async fn test_stop_with_dead_pids_succeeds_and_removes_record() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());

    // PIDs far above pid_max: both count as already terminated.
    record_with(
        "QmA",
        999_999_998,
        999_999_997,
        free_port().unwrap(),
        free_port().unwrap(),
    )
    .save(&settings.record_file)
    .await
    .unwrap();

    let manager = fast_manager(settings.clone());
    assert!(manager.stop().await.unwrap());
    assert!(!settings.record_file.exists(), "record must be removed");

    // Second stop has nothing left to do.
    assert!(!manager.stop().await.unwrap());
}

#[tokio::test]
async fn test_stop_terminates_recorded_processes() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());

    let backend = local_ai_core::service::spawn_in_group(
        &["sleep".to_string(), "30".to_string()],
        &settings.log_dir.join("ai.log"),
        "backend",
    )
    .unwrap();
    let api = local_ai_core::service::spawn_in_group(
        &["sleep".to_string(), "30".to_string()],
        &settings.log_dir.join("api.log"),
        "api",
    )
    .unwrap();

    record_with(
        "QmA",
        backend.id(),
        api.id(),
        free_port().unwrap(),
        free_port().unwrap(),
    )
    .save(&settings.record_file)
    .await
    .unwrap();

    let manager = fast_manager(settings.clone());
    assert!(manager.stop().await.unwrap());
    assert!(!settings.record_file.exists());
    assert_ne!(
        local_ai_core::service::probe_pid(backend.id()),
        local_ai_core::service::PidState::Running
    );
    assert_ne!(
        local_ai_core::service::probe_pid(api.id()),
        local_ai_core::service::PidState::Running
    );
}

// ───── restart / status ───────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_without_record_is_false() {
    let root = TempDir::new().unwrap();
    let manager = fast_manager(test_settings(root.path()));
    assert!(!manager.restart().await.unwrap());
}

#[tokio::test]
async fn test_get_running_model_reads_record_hash() {
    let root = TempDir::new().unwrap();
    let settings = test_settings(root.path());

    let manager = fast_manager(settings.clone());
    assert!(manager.get_running_model().await.is_none());

    record_with("QmRunning", 1, 1, 1, 1)
        .save(&settings.record_file)
        .await
        .unwrap();
    assert_eq!(
        manager.get_running_model().await.as_deref(),
        Some("QmRunning")
    );
}
