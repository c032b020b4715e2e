use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::{AppSettings, MirrorTarget};
use crate::error::AppError;

pub const MIRROR_TIMEOUT: Duration = Duration::from_secs(2);

/// Source name to the output it feeds, or `""` when unrouted.
pub type SystemState = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum HubMessage {
    SystemState(SystemState),
    Settings(AppSettings),
}

/// Where the switcher announces what it did. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn publish_state(&self, state: &SystemState);
    fn publish_settings(&self, settings: &AppSettings);
    fn send_mirror(&self, target: MirrorTarget, message: String);
}

/// Fan-out to connected observers plus the TCP mirror sender.
pub struct Hub {
    tx: broadcast::Sender<HubMessage>,
    runtime: Option<Handle>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    fn publish(&self, message: HubMessage) {
        // no subscribers is not an error
        if self.tx.send(message).is_err() {
            debug!("hub: no observers connected");
        }
    }
}

impl NotificationSink for Hub {
    fn publish_state(&self, state: &SystemState) {
        self.publish(HubMessage::SystemState(state.clone()));
    }

    fn publish_settings(&self, settings: &AppSettings) {
        self.publish(HubMessage::Settings(settings.clone()));
    }

    fn send_mirror(&self, target: MirrorTarget, message: String) {
        let Some(runtime) = &self.runtime else {
            warn!("mirror message to {target} dropped: no async runtime available");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = send_mirror_message(&target, &message).await {
                warn!("{e}");
            }
        });
    }
}

/// One connect-and-write attempt bounded by [`MIRROR_TIMEOUT`].
pub async fn send_mirror_message(target: &MirrorTarget, message: &str) -> Result<(), AppError> {
    let attempt = async {
        debug!("connecting to mirror endpoint {target}");
        let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.write_all(message.as_bytes()).await?;
        stream.shutdown().await
    };

    match timeout(MIRROR_TIMEOUT, attempt).await {
        Ok(Ok(())) => {
            info!("mirror message sent to {target}: {message}");
            Ok(())
        }
        Ok(Err(e)) => Err(AppError::Notification(format!(
            "failed to send mirror message to {target}: {e}"
        ))),
        Err(_) => Err(AppError::Notification(format!(
            "mirror connection to {target} timed out"
        ))),
    }
}
