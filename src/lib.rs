pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
pub mod hub;
pub mod routes;
pub mod source;
pub mod switcher;
pub mod udp;
pub mod validation;
pub mod watcher;

pub use config::{
    AppSettings, EdgeDetect, InactiveRelaySettings, MirrorTarget, PhysicalButtonConfig,
    PinLevel, RouteConfig,
};
pub use error::AppError;
pub use gpio::{EdgeEvent, EventHandler, GpioBackend, PinMode};
pub use hub::{Hub, HubMessage, NotificationSink, SystemState};
pub use routes::AppState;
pub use source::Source;
pub use switcher::SwitcherState;
pub use validation::{ValidationErrors, validate};
pub use watcher::ConfigWatcher;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
