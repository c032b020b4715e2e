use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_switcher::backend::MockGpioBackend;
use relay_switcher::config::AppSettings;
use relay_switcher::error::AppError;
use relay_switcher::gpio::GpioBackend;
use relay_switcher::hub::Hub;
use relay_switcher::switcher::SwitcherState;
use relay_switcher::watcher::{ConfigWatcher, ReloadOutcome};

const INITIAL: &str = r#"{
    "serverPort": 8080,
    "routes": [
        { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
        { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 }
    ]
}"#;

const EXTENDED: &str = r#"{
    "serverPort": 8080,
    "routes": [
        { "sourceName": "Mic1", "outputName": "Studio", "relayPin": 5 },
        { "sourceName": "Mic2", "outputName": "Studio", "relayPin": 6 },
        { "sourceName": "Mic3", "outputName": "Studio", "relayPin": 9 }
    ],
    "defaultSource": "Mic3"
}"#;

fn start(path: &Path) -> (Arc<SwitcherState>, Arc<MockGpioBackend>) {
    fs::write(path, INITIAL).unwrap();
    let mock = Arc::new(MockGpioBackend::default());
    let backend: Arc<dyn GpioBackend> = mock.clone();
    let settings = AppSettings::load_from_file(path).unwrap();
    let switcher =
        Arc::new(SwitcherState::new(settings, backend, Arc::new(Hub::new(8))).unwrap());
    (switcher, mock)
}

#[actix_rt::test]
async fn reload_applies_a_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, mock) = start(&path);
    let watcher = ConfigWatcher::new(&path, switcher.clone());

    fs::write(&path, EXTENDED).unwrap();
    assert_eq!(watcher.reload().await.unwrap(), ReloadOutcome::Applied);

    assert_eq!(switcher.settings().routes.len(), 3);
    assert_eq!(switcher.system_state()["Mic3"], "Studio");
    assert_eq!(mock.open_pins(), vec![5, 6, 9]);
}

#[actix_rt::test]
async fn reload_skips_identical_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, mock) = start(&path);
    let watcher = ConfigWatcher::new(&path, switcher.clone());

    // same content, different formatting
    fs::write(&path, INITIAL.replace('\n', " ")).unwrap();
    assert_eq!(watcher.reload().await.unwrap(), ReloadOutcome::Unchanged);
    assert_eq!(mock.open_count(5), 1);
}

#[actix_rt::test]
async fn reload_keeps_listener_ports() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, _) = start(&path);
    let watcher = ConfigWatcher::new(&path, switcher.clone());

    fs::write(&path, INITIAL.replace("8080", "9090")).unwrap();
    assert_eq!(watcher.reload().await.unwrap(), ReloadOutcome::Unchanged);
    assert_eq!(switcher.settings().server_port, 8080);

    fs::write(&path, EXTENDED.replace("8080", "9090")).unwrap();
    assert_eq!(watcher.reload().await.unwrap(), ReloadOutcome::Applied);
    assert_eq!(switcher.settings().server_port, 8080);
    assert_eq!(switcher.settings().routes.len(), 3);
}

#[actix_rt::test]
async fn invalid_file_keeps_running_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, mock) = start(&path);
    switcher.switch_source("Mic2", "Studio").unwrap();
    let watcher = ConfigWatcher::new(&path, switcher.clone());

    fs::write(&path, INITIAL.replace("\"relayPin\": 6", "\"relayPin\": 5")).unwrap();
    let err = watcher.reload().await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    fs::write(&path, "{ not json").unwrap();
    let err = watcher.reload().await.unwrap_err();
    assert!(matches!(err, AppError::Config(_)));

    assert_eq!(switcher.system_state()["Mic2"], "Studio");
    assert_eq!(mock.open_count(6), 1);
}

#[actix_rt::test]
async fn unreadable_file_fails_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, _) = start(&path);
    let watcher = ConfigWatcher::new(&path, switcher.clone());

    fs::remove_file(&path).unwrap();
    let err = watcher.reload().await.unwrap_err();
    assert!(matches!(err, AppError::Io(_)));
    assert_eq!(switcher.settings().routes.len(), 2);
}

#[actix_rt::test]
async fn watcher_picks_up_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let (switcher, _) = start(&path);
    let _guard = ConfigWatcher::new(&path, switcher.clone()).start().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    fs::write(&path, EXTENDED).unwrap();

    let mut reloaded = false;
    for _ in 0..50 {
        if switcher.settings().routes.len() == 3 {
            reloaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reloaded, "configuration change was not applied");
}
