use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::validation::ValidationErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(ValidationErrors),
    #[error("Route not found: {0}")]
    NotFoundRoute(String),
    #[error("Pin {0} is already in use")]
    PinBusy(u32),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Notification error: {0}")]
    Notification(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundRoute(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::InvalidState(_) | AppError::InvalidValue(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::PinBusy(_) => StatusCode::CONFLICT,
            AppError::Config(_)
            | AppError::Gpio(_)
            | AppError::Io(_)
            | AppError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            AppError::Validation(errors) => {
                json!({ "error": self.to_string(), "errors": errors.errors() })
            }
            _ => json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
