//! File-backed resources: persistence round trips and reconnect recovery

use async_trait::async_trait;
use cm_resilience::RetryTimer;
use cm_resources::{
    ConnectionHandle, ConnectionStatus, Resource, ResourceCore, ResourceError, ResourceResult,
    ResourceStorage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

static OFFLINE_HOSTS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

fn set_offline(host: &str, offline: bool) {
    let mut hosts = OFFLINE_HOSTS.lock().unwrap();
    if offline {
        hosts.insert(host.to_string());
    } else {
        hosts.remove(host);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlugConfig {
    name: String,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Default)]
struct PlugState {
    on: bool,
}

/// Simulated device session
#[derive(Default)]
struct Link {
    endpoint: Mutex<String>,
    session: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

impl Link {
    fn connect(&self) -> ResourceResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let endpoint = self.endpoint.lock().unwrap().clone();
        let host = endpoint.split(':').next().unwrap_or_default().to_string();
        if OFFLINE_HOSTS.lock().unwrap().contains(&host) {
            return Err(ResourceError::Connection(format!("{} is offline", endpoint)));
        }
        *self.session.lock().unwrap() = Some(endpoint);
        Ok(())
    }
}

struct Plug {
    core: ResourceCore<PlugConfig, PlugState>,
    link: Arc<Link>,
    retry: RetryTimer,
}

#[async_trait]
impl Resource for Plug {
    const KIND: &'static str = "Plug";
    type Config = PlugConfig;
    type State = PlugState;

    fn from_core(core: ResourceCore<PlugConfig, PlugState>) -> Self {
        let link = Arc::new(Link::default());
        let retry = {
            let link = link.clone();
            let status: ConnectionHandle = core.connection_handle();
            RetryTimer::new(Duration::from_secs(5), move || {
                let link = link.clone();
                let status = status.clone();
                async move {
                    if link.connect().is_ok() {
                        status.set(ConnectionStatus::Connected);
                    }
                }
            })
        };
        Self { core, link, retry }
    }

    fn core(&self) -> &ResourceCore<PlugConfig, PlugState> {
        &self.core
    }

    fn validate(config: &PlugConfig) -> ResourceResult<()> {
        if config.port == 0 {
            return Err(ResourceError::InvalidConfig("port must be set".to_string()));
        }
        Ok(())
    }

    async fn reconstruct(&self) -> ResourceResult<()> {
        let config = self.config();
        *self.link.endpoint.lock().unwrap() = format!("{}:{}", config.host, config.port);
        self.link.connect()
    }

    async fn teardown(&self) {
        self.retry.cancel();
        *self.link.session.lock().unwrap() = None;
    }

    fn on_reconstruct_failed(&self, _error: &ResourceError) {
        self.retry.try_again();
    }
}

fn plug(name: &str, host: &str) -> PlugConfig {
    PlugConfig {
        name: name.to_string(),
        host: host.to_string(),
        port: 9999,
    }
}

// ==================== Persistence ====================

#[tokio::test]
async fn test_round_trip_through_files() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("Plug");

    let storage = ResourceStorage::<Plug>::file_backed(&dir);
    let desk = storage.create(plug("Desk", "10.1.0.1")).await.unwrap();
    storage
        .create_with_id("lamp", plug("Lamp", "10.1.0.2"))
        .await
        .unwrap();
    storage
        .apply_config("lamp", serde_json::json!({"port": 80}))
        .await
        .unwrap();

    // A fresh storage over the same directory sees the same resources
    let reloaded = ResourceStorage::<Plug>::file_backed(&dir);
    let report = reloaded.load_all().await.unwrap();
    assert_eq!(report.loaded.len(), 2);
    assert!(report.failed.is_empty());

    let desk_again = reloaded.get_by_id(desk.id()).unwrap();
    assert_eq!(desk_again.config(), desk.config());
    assert_eq!(
        desk_again.link.session.lock().unwrap().as_deref(),
        Some("10.1.0.1:9999")
    );

    let lamp = reloaded.get_by_id("lamp").unwrap();
    assert_eq!(lamp.config().port, 80);
    assert_eq!(lamp.link.session.lock().unwrap().as_deref(), Some("10.1.0.2:80"));
}

#[tokio::test]
async fn test_bad_files_do_not_stop_loading() {
    let temp = TempDir::new().unwrap();
    let storage = ResourceStorage::<Plug>::file_backed(temp.path());
    storage
        .create_with_id("good", plug("Good", "10.2.0.1"))
        .await
        .unwrap();

    std::fs::write(temp.path().join("garbled.json"), "{{{").unwrap();
    let invalid = serde_json::json!({
        "version": 1,
        "id": "portless",
        "config": {"name": "Portless", "host": "10.2.0.2", "port": 0}
    });
    std::fs::write(temp.path().join("portless.json"), invalid.to_string()).unwrap();

    let reloaded = ResourceStorage::<Plug>::file_backed(temp.path());
    let report = reloaded.load_all().await.unwrap();

    assert_eq!(report.loaded, vec!["good"]);
    let mut failed: Vec<_> = report.failed.iter().map(|e| e.id.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["garbled", "portless"]);
    assert_eq!(reloaded.ids(), vec!["good"]);
}

#[tokio::test]
async fn test_delete_removes_file() {
    let temp = TempDir::new().unwrap();
    let storage = ResourceStorage::<Plug>::file_backed(temp.path());
    storage
        .create_with_id("temp", plug("Temp", "10.3.0.1"))
        .await
        .unwrap();
    assert!(temp.path().join("temp.json").exists());

    storage.delete("temp").await.unwrap();

    assert!(!temp.path().join("temp.json").exists());
    let reloaded = ResourceStorage::<Plug>::file_backed(temp.path());
    assert!(reloaded.load_all().await.unwrap().loaded.is_empty());
}

// ==================== Recovery ====================

#[tokio::test(start_paused = true)]
async fn test_disconnected_resource_recovers_via_retry() {
    set_offline("10.4.0.1", true);
    let storage = ResourceStorage::<Plug>::new();

    let plug = storage
        .load("attic", plug("Attic", "10.4.0.1"))
        .await
        .unwrap();
    assert_eq!(plug.core().connection(), ConnectionStatus::Disconnected);
    assert!(plug.retry.is_pending());

    // Still offline when the first retry fires
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(plug.core().connection(), ConnectionStatus::Disconnected);
    assert_eq!(plug.link.attempts.load(Ordering::SeqCst), 2);

    set_offline("10.4.0.1", false);
    plug.retry.try_again();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(plug.core().connection(), ConnectionStatus::Connected);
    assert_eq!(
        plug.link.session.lock().unwrap().as_deref(),
        Some("10.4.0.1:9999")
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete_cancels_pending_retry() {
    set_offline("10.5.0.1", true);
    let storage = ResourceStorage::<Plug>::new();
    let plug = storage.load("shed", plug("Shed", "10.5.0.1")).await.unwrap();
    assert!(plug.retry.is_pending());

    storage.delete("shed").await.unwrap();

    assert!(!plug.retry.is_pending());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(plug.link.attempts.load(Ordering::SeqCst), 1);
}
