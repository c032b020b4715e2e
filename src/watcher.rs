use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::AppSettings;
use crate::error::AppError;
use crate::switcher::SwitcherState;
use crate::validation;

/// Editors write in several steps; wait for the file to settle.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);
pub const READ_RETRY_COUNT: u32 = 5;
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    Unchanged,
}

pub struct ConfigWatcher {
    path: PathBuf,
    switcher: Arc<SwitcherState>,
}

/// Keeps the file watch alive; dropping it stops reloading.
pub struct ConfigWatchGuard {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatchGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, switcher: Arc<SwitcherState>) -> Self {
        Self {
            path: path.into(),
            switcher,
        }
    }

    /// Watches the parent directory so that editors replacing the file are
    /// noticed too. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<ConfigWatchGuard, AppError> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                AppError::Config(format!(
                    "unable to watch configuration path '{}'",
                    self.path.display()
                ))
            })?;
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("configuration watch error: {e}"),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| AppError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| {
                AppError::Config(format!(
                    "failed to watch directory {}: {e}",
                    directory.display()
                ))
            })?;
        info!("watching configuration file at {}", self.path.display());

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                match self.reload().await {
                    Ok(ReloadOutcome::Applied) => info!("configuration reload completed"),
                    Ok(ReloadOutcome::Unchanged) => debug!("configuration unchanged"),
                    Err(e) => error!("configuration reload failed, keeping the running configuration: {e}"),
                }
            }
        });

        Ok(ConfigWatchGuard {
            _watcher: watcher,
            task,
        })
    }

    /// Re-reads and applies the configuration file. Ports of the running
    /// listeners are kept; changing them needs a restart.
    pub async fn reload(&self) -> Result<ReloadOutcome, AppError> {
        let mut settings = self.read_settings().await?;
        validation::validate(&settings).map_err(AppError::Validation)?;

        let current = self.switcher.settings();
        if settings.keep_listener_ports(&current) {
            warn!(
                "listener port change detected; restart to apply it. Keeping server port {}",
                current.server_port
            );
        }

        if settings == *current {
            return Ok(ReloadOutcome::Unchanged);
        }
        self.switcher.apply_settings(settings)?;
        Ok(ReloadOutcome::Applied)
    }

    pub async fn read_settings(&self) -> Result<AppSettings, AppError> {
        let mut attempt = 1;
        let contents = loop {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => break contents,
                Err(e) if attempt < READ_RETRY_COUNT => {
                    debug!("configuration read attempt {attempt} failed: {e}");
                    attempt += 1;
                    sleep(READ_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!("unable to read configuration file after {READ_RETRY_COUNT} attempts");
                    return Err(e.into());
                }
            }
        };
        AppSettings::from_json_str(&contents)
    }
}
