use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::config::{AppSettings, EdgeDetect, MirrorTarget, PinLevel};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, EventHandler, GpioBackend, PinMode, edge_event_channel};
use crate::hub::{NotificationSink, SystemState};
use crate::source::Source;
use crate::validation;

pub const BUTTON_DEBOUNCE: Duration = Duration::from_millis(200);

struct FailsafeRelay {
    pin_id: u32,
    inactive: PinLevel,
    engaged: bool,
}

impl FailsafeRelay {
    /// Writes the inactive level once; later calls are no-ops.
    fn disengage(&mut self, backend: &dyn GpioBackend) {
        if !self.engaged {
            return;
        }
        self.engaged = false;
        match backend.write_value(self.pin_id, self.inactive) {
            Ok(()) => info!("inactive relay on pin {} driven inactive", self.pin_id),
            Err(e) => error!("failed to drive inactive relay inactive: {e}"),
        }
    }
}

struct ButtonBinding {
    pin_id: u32,
    source: String,
    trigger: EdgeDetect,
}

struct Topology {
    sources: Vec<Source>,
    failsafe: Option<FailsafeRelay>,
    buttons: Vec<ButtonBinding>,
    test_pins: Vec<u32>,
    single_output: bool,
}

impl Topology {
    fn empty(single_output: bool) -> Self {
        Self {
            sources: Vec::new(),
            failsafe: None,
            buttons: Vec::new(),
            test_pins: Vec::new(),
            single_output,
        }
    }

    // on failure everything claimed so far is released again
    fn build(
        settings: &AppSettings,
        backend: &dyn GpioBackend,
        handler: &EventHandler,
    ) -> Result<Self, AppError> {
        let mut topology = Self::empty(settings.outputs().len() == 1);
        if let Err(e) = topology.open(settings, backend, handler) {
            topology.release(backend);
            return Err(e);
        }
        Ok(topology)
    }

    fn open(
        &mut self,
        settings: &AppSettings,
        backend: &dyn GpioBackend,
        handler: &EventHandler,
    ) -> Result<(), AppError> {
        for name in settings.sources() {
            self.sources.push(Source::new(name.as_str()));
            let Some(source) = self.sources.last_mut() else {
                continue;
            };
            for route in settings.routes.iter().filter(|r| r.source_name == name) {
                if source.has_output(&route.output_name) {
                    continue;
                }
                source.add_output_pin(backend, route)?;
            }
        }

        if let Some(relay) = &settings.inactive_relay {
            let pin_id = line_offset(relay.pin)?;
            backend.open_output(pin_id, relay.active_level())?;
            self.failsafe = Some(FailsafeRelay {
                pin_id,
                inactive: relay.inactive_level,
                engaged: true,
            });
            info!("inactive relay on pin {pin_id} driven active");
        }

        for (source, button) in &settings.physical_source_buttons {
            let Some(source) = settings.find_source(source) else {
                warn!("physical button for unknown source '{source}' ignored");
                continue;
            };
            let pin_id = line_offset(button.pin_number)?;
            backend.open_input(pin_id, button.trigger_edge(), handler.clone())?;
            self.buttons.push(ButtonBinding {
                pin_id,
                source: source.to_string(),
                trigger: button.trigger_edge(),
            });
            debug!("physical button for '{source}' on pin {pin_id}");
        }

        Ok(())
    }

    /// The inactive relay is driven inactive before any line is closed.
    fn release(&mut self, backend: &dyn GpioBackend) {
        if let Some(relay) = self.failsafe.as_mut() {
            relay.disengage(backend);
        }
        for source in &mut self.sources {
            source.close(backend);
        }
        self.sources.clear();

        let failsafe = self.failsafe.take().map(|r| r.pin_id);
        let buttons = self.buttons.drain(..).map(|b| b.pin_id);
        let test_pins = self.test_pins.drain(..);
        for pin_id in failsafe.into_iter().chain(buttons).chain(test_pins) {
            if let Err(e) = backend.close(pin_id) {
                warn!("failed to release pin {pin_id}: {e}");
            }
        }
    }

    fn owns_input(&self, pin_id: u32) -> bool {
        self.buttons.iter().any(|b| b.pin_id == pin_id)
    }

    fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name() == name)
    }

    fn snapshot(&self, backend: &dyn GpioBackend) -> SystemState {
        self.sources
            .iter()
            .map(|source| {
                let route = match source.current_route(backend) {
                    Ok(route) => route.unwrap_or_default().to_string(),
                    Err(e) => {
                        warn!("failed to read state of source '{}': {e}", source.name());
                        String::new()
                    }
                };
                (source.name().to_string(), route)
            })
            .collect()
    }

    fn switch(
        &self,
        backend: &dyn GpioBackend,
        source: &str,
        output: &str,
    ) -> Result<bool, AppError> {
        let Some(target) = self.source(source).filter(|s| s.has_output(output)) else {
            debug!("switch {source} -> {output} ignored: no such route");
            return Ok(false);
        };

        if self.single_output {
            for other in self.sources.iter().filter(|s| s.name() != source) {
                other.disable_output(backend)?;
            }
        } else {
            // an output is fed by at most one source
            for other in self.sources.iter().filter(|s| s.name() != source) {
                if other.current_route(backend)? == Some(output) {
                    info!(
                        "output '{output}' taken over by '{source}', clearing '{}'",
                        other.name()
                    );
                    other.disable_output(backend)?;
                }
            }
        }
        target.enable_output(backend, output)?;
        Ok(true)
    }
}

fn line_offset(pin: i32) -> Result<u32, AppError> {
    u32::try_from(pin).map_err(|_| AppError::InvalidValue(format!("pin {pin} is out of range")))
}

struct Engine {
    settings: Arc<AppSettings>,
    topology: Option<Topology>, // None once disposed
    last_button_edge: FxHashMap<u32, u64>,
}

impl Engine {
    fn topology(&self) -> Result<&Topology, AppError> {
        self.topology
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("switcher has been shut down".into()))
    }

    fn mirror_for(&self, source: &str, output: &str) -> Option<(MirrorTarget, String)> {
        let message = self
            .settings
            .find_route(source, output)?
            .mirror_message
            .clone()
            .filter(|m| !m.is_empty())?;
        Some((self.settings.mirror_target()?, message))
    }

    fn switch(
        &self,
        backend: &dyn GpioBackend,
        source: &str,
        output: &str,
    ) -> Result<Option<(MirrorTarget, String)>, AppError> {
        if self.topology()?.switch(backend, source, output)? {
            info!("switched {source} -> {output}");
            Ok(self.mirror_for(source, output))
        } else {
            Ok(None)
        }
    }

    fn state(&self, backend: &dyn GpioBackend) -> SystemState {
        self.topology
            .as_ref()
            .map(|t| t.snapshot(backend))
            .unwrap_or_default()
    }

    fn apply_default_routes(&self, backend: &dyn GpioBackend) -> Vec<(MirrorTarget, String)> {
        let settings = self.settings.clone();
        let mut mirrors = Vec::new();

        if !settings.default_routes.is_empty() {
            let mut claimed: Vec<&str> = Vec::new();
            for (source, output) in &settings.default_routes {
                let Some(route) = settings.find_route(source, output) else {
                    warn!("default route {source} -> {output} ignored: no such route");
                    continue;
                };
                if claimed
                    .iter()
                    .any(|o| o.eq_ignore_ascii_case(&route.output_name))
                {
                    warn!(
                        "default route {source} -> {output} ignored: output '{}' already has a default source",
                        route.output_name
                    );
                    continue;
                }
                claimed.push(&route.output_name);
                match self.switch(backend, &route.source_name, &route.output_name) {
                    Ok(mirror) => mirrors.extend(mirror),
                    Err(e) => error!(
                        "failed to apply default route {} -> {}: {e}",
                        route.source_name, route.output_name
                    ),
                }
            }
        } else if let Some(source) = &settings.default_source {
            match settings.first_route_for(source) {
                Some(route) => {
                    match self.switch(backend, &route.source_name, &route.output_name) {
                        Ok(mirror) => mirrors.extend(mirror),
                        Err(e) => error!("failed to apply default source '{source}': {e}"),
                    }
                }
                None => warn!("default source '{source}' has no route"),
            }
        }
        mirrors
    }

    fn restore(&self, backend: &dyn GpioBackend, state: &SystemState) {
        for (source, output) in state.iter().filter(|(_, o)| !o.is_empty()) {
            if let Err(e) = self.switch(backend, source, output) {
                error!("failed to restore route {source} -> {output}: {e}");
            }
        }
    }
}

pub struct SwitcherState {
    backend: Arc<dyn GpioBackend>,
    sink: Arc<dyn NotificationSink>,
    edge_handler: EventHandler,
    edge_rx: Mutex<Option<mpsc::UnboundedReceiver<EdgeEvent>>>,
    inner: Mutex<Engine>,
}

impl SwitcherState {
    /// Nothing stays claimed when this fails.
    pub fn new(
        settings: AppSettings,
        backend: Arc<dyn GpioBackend>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, AppError> {
        validation::validate(&settings).map_err(AppError::Validation)?;

        let (edge_handler, edge_rx) = edge_event_channel();
        let topology = Topology::build(&settings, backend.as_ref(), &edge_handler)?;
        let engine = Engine {
            settings: Arc::new(settings),
            topology: Some(topology),
            last_button_edge: FxHashMap::default(),
        };
        let mirrors = engine.apply_default_routes(backend.as_ref());
        info!(
            "switcher ready: {} sources, {} outputs",
            engine.settings.sources().len(),
            engine.settings.outputs().len()
        );

        let switcher = Self {
            backend,
            sink,
            edge_handler,
            edge_rx: Mutex::new(Some(edge_rx)),
            inner: Mutex::new(engine),
        };
        for (target, message) in mirrors {
            switcher.sink.send_mirror(target, message);
        }
        Ok(switcher)
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.inner.lock().settings.clone()
    }

    pub fn system_state(&self) -> SystemState {
        self.inner.lock().state(self.backend.as_ref())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().topology.is_none()
    }

    // unknown pairs are ignored
    pub fn switch_source(&self, source: &str, output: &str) -> Result<(), AppError> {
        let (mirror, state) = {
            let engine = self.inner.lock();
            let mirror = engine.switch(self.backend.as_ref(), source, output)?;
            (mirror, engine.state(self.backend.as_ref()))
        };
        self.announce(state, mirror);
        Ok(())
    }

    pub fn switch_route(&self, source: &str, output: &str) -> Result<(), AppError> {
        let (mirror, state) = {
            let engine = self.inner.lock();
            let route = engine.settings.find_route(source, output).ok_or_else(|| {
                AppError::NotFoundRoute(format!("{source} -> {output}"))
            })?;
            let (source, output) = (route.source_name.clone(), route.output_name.clone());
            let mirror = engine.switch(self.backend.as_ref(), &source, &output)?;
            (mirror, engine.state(self.backend.as_ref()))
        };
        self.announce(state, mirror);
        Ok(())
    }

    pub fn clear_source(&self, source: &str) -> Result<(), AppError> {
        let state = {
            let engine = self.inner.lock();
            if let Some(source) = engine.topology()?.source(source) {
                source.disable_output(self.backend.as_ref())?;
                info!("cleared source '{}'", source.name());
            }
            engine.state(self.backend.as_ref())
        };
        self.announce(state, None);
        Ok(())
    }

    /// If the new lines cannot be claimed, the previous configuration and its
    /// routing are restored and the error is returned.
    pub fn apply_settings(&self, new_settings: AppSettings) -> Result<(), AppError> {
        validation::validate(&new_settings).map_err(AppError::Validation)?;
        let new_settings = Arc::new(new_settings);
        let backend = self.backend.as_ref();

        let (result, settings, state, mirrors) = {
            let mut engine = self.inner.lock();
            let Some(mut current) = engine.topology.take() else {
                return Err(AppError::InvalidState("switcher has been shut down".into()));
            };

            let previous_state = current.snapshot(backend);
            current.release(backend);
            engine.last_button_edge.clear();

            let mut mirrors = Vec::new();
            let result = match Topology::build(&new_settings, backend, &self.edge_handler) {
                Ok(topology) => {
                    engine.topology = Some(topology);
                    engine.settings = new_settings;
                    mirrors = engine.apply_default_routes(backend);
                    info!("configuration applied");
                    Ok(())
                }
                Err(e) => {
                    error!("failed to apply configuration, restoring previous one: {e}");
                    match Topology::build(&engine.settings, backend, &self.edge_handler) {
                        Ok(topology) => {
                            engine.topology = Some(topology);
                            engine.restore(backend, &previous_state);
                        }
                        Err(e) => {
                            error!("failed to restore previous configuration: {e}");
                            engine.topology =
                                Some(Topology::empty(engine.settings.outputs().len() == 1));
                        }
                    }
                    Err(e)
                }
            };
            (result, engine.settings.clone(), engine.state(backend), mirrors)
        };

        if result.is_ok() {
            self.sink.publish_settings(&settings);
        }
        self.announce(state, mirrors);
        result
    }

    /// Idempotent; write failures are logged, never returned.
    pub fn set_inactive_relay_to_inactive_state(&self) {
        let mut engine = self.inner.lock();
        if let Some(relay) = engine.topology.as_mut().and_then(|t| t.failsafe.as_mut()) {
            relay.disengage(self.backend.as_ref());
        }
    }

    pub fn test_pin(&self, pin_id: u32, active_low: bool, active: bool) -> Result<(), AppError> {
        let level = match (active, active_low) {
            (true, true) | (false, false) => PinLevel::Low,
            (true, false) | (false, true) => PinLevel::High,
        };
        let backend = self.backend.as_ref();

        let state = {
            let mut engine = self.inner.lock();
            let topology = engine
                .topology
                .as_mut()
                .ok_or_else(|| AppError::InvalidState("switcher has been shut down".into()))?;

            if topology.owns_input(pin_id) || backend.mode(pin_id) == Some(PinMode::Input) {
                return Err(AppError::InvalidState(format!(
                    "pin {pin_id} is a button input and cannot be driven"
                )));
            }
            if backend.is_open(pin_id) {
                backend.write_value(pin_id, level)?;
            } else {
                backend.open_output(pin_id, level)?;
                topology.test_pins.push(pin_id);
            }
            info!("test pin {pin_id} driven {level:?}");
            engine.state(backend)
        };
        self.announce(state, None);
        Ok(())
    }

    /// Returns whether the edge caused a switch.
    pub fn handle_button_edge(&self, event: &EdgeEvent) -> bool {
        let (mirror, state) = {
            let mut engine = self.inner.lock();
            let Some(topology) = &engine.topology else {
                return false;
            };
            let Some(binding) = topology.buttons.iter().find(|b| b.pin_id == event.pin_id) else {
                debug!("edge on unbound pin {} ignored", event.pin_id);
                return false;
            };
            let (source, trigger) = (binding.source.clone(), binding.trigger);

            if let Some(last) = engine.last_button_edge.get(&event.pin_id)
                && event.timestamp_ms.saturating_sub(*last) < BUTTON_DEBOUNCE.as_millis() as u64
            {
                debug!("edge on pin {} debounced", event.pin_id);
                return false;
            }
            engine
                .last_button_edge
                .insert(event.pin_id, event.timestamp_ms);

            if event.edge != trigger {
                debug!(
                    "{:?} edge on button pin {} ignored, waiting for {trigger:?}",
                    event.edge, event.pin_id
                );
                return false;
            }
            let Some(route) = engine.settings.first_route_for(&source) else {
                warn!("button for '{source}' pressed but the source has no route");
                return false;
            };
            let (source, output) = (route.source_name.clone(), route.output_name.clone());

            info!("button on pin {} selects {source} -> {output}", event.pin_id);
            match engine.switch(self.backend.as_ref(), &source, &output) {
                Ok(mirror) => (mirror, engine.state(self.backend.as_ref())),
                Err(e) => {
                    error!("button switch {source} -> {output} failed: {e}");
                    return false;
                }
            }
        };
        self.announce(state, mirror);
        true
    }

    // only the first caller receives events
    pub async fn dispatch_button_events(self: Arc<Self>) {
        let Some(mut rx) = self.edge_rx.lock().take() else {
            warn!("button dispatcher already running");
            return;
        };
        let switcher = Arc::downgrade(&self);
        drop(self);

        while let Some(event) = rx.recv().await {
            let Some(switcher) = switcher.upgrade() else {
                break;
            };
            switcher.handle_button_edge(&event);
        }
        debug!("button dispatcher stopped");
    }

    pub fn shutdown(&self) {
        let mut engine = self.inner.lock();
        let Some(mut topology) = engine.topology.take() else {
            return;
        };
        topology.release(self.backend.as_ref());
        info!("switcher shut down, all pins released");
    }

    fn announce(
        &self,
        state: SystemState,
        mirrors: impl IntoIterator<Item = (MirrorTarget, String)>,
    ) {
        for (target, message) in mirrors {
            self.sink.send_mirror(target, message);
        }
        self.sink.publish_state(&state);
    }
}

impl Drop for SwitcherState {
    fn drop(&mut self) {
        self.shutdown();
    }
}
