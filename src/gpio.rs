use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::config::{EdgeDetect, PinLevel};
use crate::error::AppError;

/// Edge observed on an input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub edge: EdgeDetect,
    pub timestamp_ms: u64,
}

/// Forwards edges from driver threads to whoever owns the receiving end.
pub struct EdgeEventDispatcher {
    event_tx: mpsc::UnboundedSender<EdgeEvent>,
}

impl EdgeEventDispatcher {
    pub fn dispatch(&self, event: EdgeEvent) {
        if self.event_tx.send(event).is_err() {
            log::debug!("edge event dropped, no receiver");
        }
    }
}

pub type EventHandler = Arc<EdgeEventDispatcher>;

pub fn edge_event_channel() -> (EventHandler, mpsc::UnboundedReceiver<EdgeEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (Arc::new(EdgeEventDispatcher { event_tx }), event_rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Output,
    Input,
}

/// Line-level access to a GPIO chip. Every line is opened once, closed once,
/// and opening an already claimed line fails with [`AppError::PinBusy`].
pub trait GpioBackend: Send + Sync {
    fn open_output(&self, pin_id: u32, initial: PinLevel) -> Result<(), AppError>;
    fn open_input(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        event_handler: EventHandler,
    ) -> Result<(), AppError>;
    fn close(&self, pin_id: u32) -> Result<(), AppError>;
    fn mode(&self, pin_id: u32) -> Option<PinMode>;
    fn read_value(&self, pin_id: u32) -> Result<PinLevel, AppError>;
    fn write_value(&self, pin_id: u32, value: PinLevel) -> Result<(), AppError>;

    fn is_open(&self, pin_id: u32) -> bool {
        self.mode(pin_id).is_some()
    }
}

pub(crate) fn edge_matches(configured: EdgeDetect, observed: EdgeDetect) -> bool {
    match configured {
        EdgeDetect::None => false,
        EdgeDetect::Rising => observed == EdgeDetect::Rising,
        EdgeDetect::Falling => observed == EdgeDetect::Falling,
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
