use log::{debug, warn};

use crate::config::{PinLevel, RouteConfig};
use crate::error::AppError;
use crate::gpio::GpioBackend;

struct OutputPin {
    output_name: String,
    pin_id: u32,
    active_low: bool,
}

impl OutputPin {
    fn active_level(&self) -> PinLevel {
        if self.active_low {
            PinLevel::Low
        } else {
            PinLevel::High
        }
    }

    fn inactive_level(&self) -> PinLevel {
        self.active_level().inverted()
    }
}

/// Relay lines of one input feed. Callers serialize access.
pub struct Source {
    name: String,
    outputs: Vec<OutputPin>, // configuration order
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_output(&self, output: &str) -> bool {
        self.outputs.iter().any(|o| o.output_name == output)
    }

    pub fn add_output_pin(
        &mut self,
        backend: &dyn GpioBackend,
        route: &RouteConfig,
    ) -> Result<(), AppError> {
        let pin_id = u32::try_from(route.relay_pin).map_err(|_| {
            AppError::InvalidValue(format!("relay pin {} is out of range", route.relay_pin))
        })?;

        backend.open_output(pin_id, route.inactive_level())?;
        debug!(
            "source '{}': output '{}' on pin {pin_id} (active {})",
            self.name,
            route.output_name,
            if route.active_low { "low" } else { "high" }
        );
        self.outputs.push(OutputPin {
            output_name: route.output_name.clone(),
            pin_id,
            active_low: route.active_low,
        });
        Ok(())
    }

    /// Drives `output` active and every other output inactive. Unknown
    /// outputs leave the lines untouched.
    pub fn enable_output(&self, backend: &dyn GpioBackend, output: &str) -> Result<(), AppError> {
        let Some(target) = self.outputs.iter().find(|o| o.output_name == output) else {
            return Ok(());
        };

        // break before make
        for pin in self.outputs.iter().filter(|o| o.output_name != output) {
            backend.write_value(pin.pin_id, pin.inactive_level())?;
        }
        backend.write_value(target.pin_id, target.active_level())
    }

    pub fn disable_output(&self, backend: &dyn GpioBackend) -> Result<(), AppError> {
        for pin in &self.outputs {
            backend.write_value(pin.pin_id, pin.inactive_level())?;
        }
        Ok(())
    }

    pub fn current_route(&self, backend: &dyn GpioBackend) -> Result<Option<&str>, AppError> {
        for pin in &self.outputs {
            if backend.read_value(pin.pin_id)? == pin.active_level() {
                return Ok(Some(pin.output_name.as_str()));
            }
        }
        Ok(None)
    }

    /// Releases every owned line. Failures are logged; remaining lines are
    /// still released.
    pub fn close(&mut self, backend: &dyn GpioBackend) {
        for pin in self.outputs.drain(..) {
            if let Err(e) = backend.close(pin.pin_id) {
                warn!(
                    "source '{}': failed to release pin {}: {e}",
                    self.name, pin.pin_id
                );
            }
        }
    }
}
