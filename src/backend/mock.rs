use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use log::debug;
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinLevel};
use crate::error::AppError;
use crate::gpio::{
    EdgeEvent, EventHandler, GpioBackend, PinMode, edge_matches, epoch_millis,
};

/// In-memory GPIO chip used off-target and in tests.
#[derive(Default)]
pub struct MockGpioBackend {
    pins: RwLock<FxHashMap<u32, MockPinState>>, // open lines only
    levels: Mutex<FxHashMap<u32, PinLevel>>,   // last level, survives close
    counters: Mutex<FxHashMap<u32, PinCounters>>,
    failing: Mutex<HashSet<u32>>,
}

#[derive(Default)]
struct PinCounters {
    opens: usize,
    closes: usize,
    writes: usize,
}

struct MockPinState {
    mode: PinMode,
    edge: EdgeDetect,
    handler: Option<EventHandler>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Gpio(format!("lock poisoned: {e}"))
}

impl MockGpioBackend {
    /// Makes every later attempt to open `pin_id` fail.
    pub fn fail_open(&self, pin_id: u32) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(pin_id);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    /// Last level driven on or sensed at the pin, even after it was closed.
    pub fn level(&self, pin_id: u32) -> Option<PinLevel> {
        self.levels.lock().ok()?.get(&pin_id).copied()
    }

    pub fn open_count(&self, pin_id: u32) -> usize {
        self.count(pin_id, |c| c.opens)
    }

    pub fn close_count(&self, pin_id: u32) -> usize {
        self.count(pin_id, |c| c.closes)
    }

    /// Writes after the line was opened; the initial level is not counted.
    pub fn write_count(&self, pin_id: u32) -> usize {
        self.count(pin_id, |c| c.writes)
    }

    fn count(&self, pin_id: u32, field: impl Fn(&PinCounters) -> usize) -> usize {
        self.counters
            .lock()
            .map(|c| c.get(&pin_id).map(&field).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn open_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self
            .pins
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default();
        pins.sort_unstable();
        pins
    }

    /// Drives an input line to `level` from outside, as a pressed or
    /// released button would, and reports the resulting edge.
    pub fn simulate_input(&self, pin_id: u32, level: PinLevel) -> Result<(), AppError> {
        let pins = self.pins.read().map_err(poisoned)?;
        let pin = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState(format!("pin {pin_id} is not open")))?;
        if pin.mode != PinMode::Input {
            return Err(AppError::InvalidState(format!(
                "pin {pin_id} is not an input"
            )));
        }

        let old = self.store_level(pin_id, level)?;
        let edge = match (old, level) {
            (Some(PinLevel::Low), PinLevel::High) => Some(EdgeDetect::Rising),
            (Some(PinLevel::High), PinLevel::Low) => Some(EdgeDetect::Falling),
            _ => None,
        };

        if let Some(edge) = edge
            && edge_matches(pin.edge, edge)
            && let Some(handler) = &pin.handler
        {
            handler.dispatch(EdgeEvent {
                pin_id,
                edge,
                timestamp_ms: epoch_millis(),
            });
        }
        Ok(())
    }

    fn claim(&self, pin_id: u32, state: MockPinState, level: PinLevel) -> Result<(), AppError> {
        if self.failing.lock().map_err(poisoned)?.contains(&pin_id) {
            return Err(AppError::Gpio(format!("request lines: pin {pin_id} unavailable")));
        }

        let mut pins = self.pins.write().map_err(poisoned)?;
        if pins.contains_key(&pin_id) {
            return Err(AppError::PinBusy(pin_id));
        }
        debug!("mock gpio: open pin {pin_id} as {:?}", state.mode);
        pins.insert(pin_id, state);
        self.store_level(pin_id, level)?;
        self.counters.lock().map_err(poisoned)?.entry(pin_id).or_default().opens += 1;
        Ok(())
    }

    fn store_level(&self, pin_id: u32, level: PinLevel) -> Result<Option<PinLevel>, AppError> {
        Ok(self.levels.lock().map_err(poisoned)?.insert(pin_id, level))
    }
}

impl GpioBackend for MockGpioBackend {
    fn open_output(&self, pin_id: u32, initial: PinLevel) -> Result<(), AppError> {
        self.claim(
            pin_id,
            MockPinState {
                mode: PinMode::Output,
                edge: EdgeDetect::None,
                handler: None,
            },
            initial,
        )
    }

    fn open_input(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        event_handler: EventHandler,
    ) -> Result<(), AppError> {
        // Buttons rest at the level opposite to the edge they report.
        let idle = match edge {
            EdgeDetect::Falling => PinLevel::High,
            _ => PinLevel::Low,
        };
        self.claim(
            pin_id,
            MockPinState {
                mode: PinMode::Input,
                edge,
                handler: (edge != EdgeDetect::None).then_some(event_handler),
            },
            idle,
        )
    }

    fn close(&self, pin_id: u32) -> Result<(), AppError> {
        let mut pins = self.pins.write().map_err(poisoned)?;
        if pins.remove(&pin_id).is_none() {
            return Err(AppError::InvalidState(format!(
                "pin {pin_id} is not open"
            )));
        }
        debug!("mock gpio: close pin {pin_id}");
        self.counters.lock().map_err(poisoned)?.entry(pin_id).or_default().closes += 1;
        Ok(())
    }

    fn mode(&self, pin_id: u32) -> Option<PinMode> {
        self.pins.read().ok()?.get(&pin_id).map(|p| p.mode)
    }

    fn read_value(&self, pin_id: u32) -> Result<PinLevel, AppError> {
        if !self.pins.read().map_err(poisoned)?.contains_key(&pin_id) {
            return Err(AppError::InvalidState(
                "pin not configured, open it first".into(),
            ));
        }
        self.level(pin_id)
            .ok_or_else(|| AppError::Gpio(format!("no level recorded for pin {pin_id}")))
    }

    fn write_value(&self, pin_id: u32, value: PinLevel) -> Result<(), AppError> {
        let pins = self.pins.read().map_err(poisoned)?;
        let pin = pins.get(&pin_id).ok_or_else(|| {
            AppError::InvalidState("pin not configured, open it first".into())
        })?;
        if pin.mode != PinMode::Output {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }
        self.store_level(pin_id, value)?;
        self.counters.lock().map_err(poisoned)?.entry(pin_id).or_default().writes += 1;
        Ok(())
    }
}
