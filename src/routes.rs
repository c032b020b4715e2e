use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::AppSettings;
use crate::error::AppError;
use crate::hub::{Hub, HubMessage};
use crate::switcher::SwitcherState;
use crate::validation;

#[derive(Clone)]
pub struct AppState {
    pub switcher: Arc<SwitcherState>,
    pub hub: Arc<Hub>,
    /// Where accepted settings are persisted; `None` keeps them in memory.
    pub config_path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct SwitchPayload {
    source: String,
    output: String,
}

#[derive(Deserialize)]
struct ClearPayload {
    source: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestPinPayload {
    pin: u32,
    #[serde(default)]
    active_low: bool,
    active: bool,
}

#[derive(Serialize)]
struct SaveResponse {
    success: bool,
}

async fn send_message(session: &mut Session, message: &HubMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => session.text(text).await.is_ok(),
        Err(e) => {
            warn!("failed to encode hub message: {e}");
            true
        }
    }
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<HubMessage>,
    switcher: Arc<SwitcherState>,
) {
    // observers start from the full picture
    let greeting = [
        HubMessage::Settings(switcher.settings().as_ref().clone()),
        HubMessage::SystemState(switcher.system_state()),
    ];
    drop(switcher);
    for message in &greeting {
        if !send_message(&mut session, message).await {
            return;
        }
    }

    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(message) => {
                        if !send_message(&mut session, &message).await {
                            warn!("WebSocket observer disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        // every message carries full state, the next one catches up
                        warn!("WebSocket observer lagged by {n} messages");
                    }
                }
            }
        }
    }
}

impl AppState {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/state")
                    .route(web::get().to(get_state))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/switch")
                    .route(web::post().to(switch_source))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/clear")
                    .route(web::post().to(clear_source))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/settings")
                    .route(web::get().to(get_settings))
                    .route(web::post().to(save_settings))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/test-pin")
                    .route(web::post().to(test_pin))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/version")
                    .route(web::get().to(version))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/events")
                    .route(web::get().to(events_ws))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn get_state(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.switcher.system_state()))
}

async fn switch_source(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let payload: SwitchPayload = parse_payload(&body)?;
    state
        .switcher
        .switch_route(&payload.source, &payload.output)?;

    Ok(web::Json(state.switcher.system_state()))
}

async fn clear_source(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let payload: ClearPayload = parse_payload(&body)?;
    let settings = state.switcher.settings();
    let source = settings
        .find_source(&payload.source)
        .ok_or_else(|| AppError::NotFoundRoute(format!("source '{}'", payload.source)))?;
    state.switcher.clear_source(source)?;

    Ok(web::Json(state.switcher.system_state()))
}

async fn get_settings(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.switcher.settings().as_ref().clone()))
}

/// Persists before applying so the file never lags behind the running
/// configuration. A configuration that cannot be applied is rolled back on
/// disk too.
async fn save_settings(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let text = std::str::from_utf8(&body)
        .map_err(|_| AppError::InvalidValue("Settings payload must be valid UTF-8".into()))?;
    let settings = AppSettings::from_json_str(text).map_err(|e| match e {
        AppError::Config(msg) => AppError::InvalidValue(msg),
        other => other,
    })?;
    validation::validate(&settings).map_err(AppError::Validation)?;

    let previous_file = match &state.config_path {
        Some(path) => {
            let previous = fs::read_to_string(path).ok();
            settings.save_to_file(path)?;
            info!("configuration saved to {}", path.display());
            previous
        }
        None => None,
    };

    let mut running = settings;
    if running.keep_listener_ports(&state.switcher.settings()) {
        warn!("listener port change saved; it takes effect after a restart");
    }
    if let Err(e) = state.switcher.apply_settings(running) {
        if let (Some(path), Some(previous)) = (&state.config_path, previous_file) {
            match fs::write(path, previous) {
                Ok(()) => warn!("configuration not applied, restored {}", path.display()),
                Err(write_err) => error!(
                    "failed to restore {} after rejected configuration: {write_err}",
                    path.display()
                ),
            }
        }
        return Err(e);
    }

    Ok(web::Json(SaveResponse { success: true }))
}

async fn test_pin(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let payload: TestPinPayload = parse_payload(&body)?;
    state
        .switcher
        .test_pin(payload.pin, payload.active_low, payload.active)?;

    Ok(HttpResponse::Ok())
}

async fn version() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn events_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let rx = state.hub.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Notification(format!("Websocket error: {e}")))?;

    let switcher = state.switcher.clone();
    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, switcher).await;
    });

    Ok(response)
}

fn parse_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body).map_err(|e| AppError::InvalidValue(format!("Invalid payload: {e}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
