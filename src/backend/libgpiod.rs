use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinLevel};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, PinMode};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Character-device GPIO driver. Pin ids are line offsets on one chip.
pub struct LibgpiodBackend {
    chip: String,
    pins: RwLock<FxHashMap<u32, LineHandle>>, // keyed by line offset
}

struct LineHandle {
    listener: Option<EdgeListener>, // declared first so it is dropped before the request
    mode: PinMode,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin_id: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: EventHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error for pin {pin_id}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        warn!("read edge events error for pin {pin_id}: {e}");
                        yield_now();
                        continue;
                    }
                };
                for evt in events {
                    let Ok(evt) = evt else { continue };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => EdgeDetect::Rising,
                        Ok(line::EdgeKind::Falling) => EdgeDetect::Falling,
                        Err(_) => continue,
                    };

                    handler.dispatch(EdgeEvent {
                        pin_id,
                        edge,
                        timestamp_ms: evt.timestamp().as_millis() as u64,
                    });
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn to_line_value(level: PinLevel) -> line::Value {
    match level {
        PinLevel::Low => line::Value::InActive,
        PinLevel::High => line::Value::Active,
    }
}

impl LibgpiodBackend {
    pub fn new(chip: &str) -> Result<Self, AppError> {
        // Fail early when the chip is missing instead of on the first route.
        GpiodHandle::open_chip(chip)?;
        Ok(Self {
            chip: chip.to_string(),
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn output_settings(initial: PinLevel) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_drive(line::Drive::PushPull)
            .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
        ls.set_output_value(to_line_value(initial))
            .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
        Ok(ls)
    }

    fn input_settings(edge: EdgeDetect) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Input)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;

        // Falling-edge buttons idle high, everything else idles low.
        let bias = match edge {
            EdgeDetect::Falling => line::Bias::PullUp,
            _ => line::Bias::PullDown,
        };
        ls.set_bias(Some(bias))
            .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;

        let edge = match edge {
            EdgeDetect::None => None,
            EdgeDetect::Rising => Some(line::Edge::Rising),
            EdgeDetect::Falling => Some(line::Edge::Falling),
        };
        if edge.is_some() {
            ls.set_edge_detection(edge)
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
        }
        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn request(
        &self,
        pin_id: u32,
        mode: PinMode,
        settings: line::Settings,
        handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        let pins = self.pins.upgradable_read();
        if pins.contains_key(&pin_id) {
            return Err(AppError::PinBusy(pin_id));
        }

        // the upgradable guard is exclusive among writers, so the line can be
        // requested before taking the write lock
        let line_cfg = Self::make_line_config(pin_id, settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&self.chip, &line_cfg)?));
        let listener = match handler {
            Some(handler) => Some(EdgeListener::new(pin_id, gpiod_handle.clone(), handler)?),
            None => None,
        };

        debug!("libgpiod: requested line {pin_id} on {} as {mode:?}", self.chip);
        RwLockUpgradableReadGuard::upgrade(pins).insert(
            pin_id,
            LineHandle {
                listener,
                mode,
                gpiod_handle,
            },
        );
        Ok(())
    }
}

impl GpioBackend for LibgpiodBackend {
    fn open_output(&self, pin_id: u32, initial: PinLevel) -> Result<(), AppError> {
        self.request(pin_id, PinMode::Output, Self::output_settings(initial)?, None)
    }

    fn open_input(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        event_handler: EventHandler,
    ) -> Result<(), AppError> {
        let handler = (edge != EdgeDetect::None).then_some(event_handler);
        self.request(pin_id, PinMode::Input, Self::input_settings(edge)?, handler)
    }

    fn close(&self, pin_id: u32) -> Result<(), AppError> {
        // dropping the handle joins the listener and releases the request
        match self.pins.write().remove(&pin_id) {
            Some(_) => {
                debug!("libgpiod: released line {pin_id}");
                Ok(())
            }
            None => Err(AppError::InvalidState(format!("pin {pin_id} is not open"))),
        }
    }

    fn mode(&self, pin_id: u32) -> Option<PinMode> {
        self.pins.read().get(&pin_id).map(|h| h.mode)
    }

    fn read_value(&self, pin_id: u32) -> Result<PinLevel, AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, open it first".into()))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(pin_id)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => PinLevel::Low,
            line::Value::Active => PinLevel::High,
        })
    }

    fn write_value(&self, pin_id: u32, value: PinLevel) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, open it first".into()))?;

        if handle.mode != PinMode::Output {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(pin_id, to_line_value(value))
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }
}
