use log::{error, info, warn};
use std::process;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use relay_switcher::gpio::GpioBackend;
use relay_switcher::udp::run_udp_listener;
use relay_switcher::{AppError, AppSettings, AppState, ConfigWatcher, Hub, MockGpioBackend, SwitcherState};

#[cfg(feature = "hardware-gpio")]
use relay_switcher::LibgpiodBackend;

const HUB_CAPACITY: usize = 64;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn select_backend(settings: &AppSettings) -> Arc<dyn GpioBackend> {
    #[cfg(feature = "hardware-gpio")]
    {
        if !settings.use_mock_gpio {
            match LibgpiodBackend::new(&settings.gpio_chip) {
                Ok(backend) => {
                    info!("using libgpiod backend on {}", settings.gpio_chip);
                    return Arc::new(backend);
                }
                Err(e) => warn!("GPIO chip unavailable, falling back to the mock backend: {e}"),
            }
        }
    }

    #[cfg(not(feature = "hardware-gpio"))]
    {
        if !settings.use_mock_gpio {
            warn!("built without hardware GPIO support, falling back to the mock backend");
        }
    }
    info!("using mock GPIO backend");
    Arc::new(MockGpioBackend::default())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_SWITCHER_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());

    let settings = match AppSettings::load_from_file(&config_path)
        .and_then(|s| relay_switcher::validate(&s).map(|_| s).map_err(AppError::Validation))
    {
        Ok(settings) => {
            init_logging(settings.logging);
            settings
        }
        Err(e) => {
            init_logging(false);
            error!("failed to load configuration from {config_path}: {e}");
            process::exit(1);
        }
    };
    info!("configuration loaded from {config_path}");

    let backend = select_backend(&settings);

    let hub = Arc::new(Hub::new(HUB_CAPACITY));
    let server_port = settings.server_port;
    let udp_port = settings.udp_api_port;
    let switcher = match SwitcherState::new(settings, backend, hub.clone()) {
        Ok(switcher) => Arc::new(switcher),
        Err(e) => {
            error!("failed to start switcher: {e}");
            process::exit(1);
        }
    };

    tokio::spawn(switcher.clone().dispatch_button_events());

    let _watch_guard = match ConfigWatcher::new(&config_path, switcher.clone()).start() {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("configuration hot reload disabled: {e}");
            None
        }
    };

    if let Some(port) = udp_port {
        let switcher = switcher.clone();
        tokio::spawn(async move {
            if let Err(e) = run_udp_listener(port, switcher).await {
                error!("UDP listener on port {port} stopped: {e}");
            }
        });
    }

    let app_state = AppState {
        switcher: switcher.clone(),
        hub,
        config_path: Some(config_path.into()),
    };
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope("/api"))
    })
    .bind(("0.0.0.0", server_port))?;

    info!("Starting server on 0.0.0.0:{server_port}...");
    let result = server.run().await;

    switcher.set_inactive_relay_to_inactive_state();
    switcher.shutdown();
    info!("shutdown complete");
    result
}
