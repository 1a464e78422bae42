//! HTTP error responses.
//!
//! The resolver API answers with a JSON envelope; the proxy answers with
//! plain text so media players surface the message verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::RelayError;

/// Body of every resolver API response.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok(url: String) -> Self {
        Self {
            success: true,
            url: Some(url),
            error: None,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(message),
        }
    }
}

/// Resolution failure rendered as `{"success": false, "error": ...}`.
#[derive(Debug)]
pub struct ResolveError(pub RelayError);

impl ResolveError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(Envelope::failed(self.0.to_string()))).into_response()
    }
}

/// Proxy failure rendered as plain text.
#[derive(Debug)]
pub struct ProxyError(pub RelayError);

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.0.to_string()).into_response()
    }
}
