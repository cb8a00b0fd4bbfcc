//! Access guard: IP allowlist and shared-token check ahead of every API
//! route. `/healthz` is wired outside this layer and never guarded.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

pub async fn require_access(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.cfg.allowlist_enabled() {
        match remote_ip(&req) {
            Some(ip) if state.cfg.allowlist.iter().any(|rule| rule.matches(ip)) => {}
            Some(ip) => {
                return reject(
                    StatusCode::FORBIDDEN,
                    format!("remote ip {ip} is not allowed"),
                );
            }
            None => {
                return reject(
                    StatusCode::FORBIDDEN,
                    "remote address unavailable".to_string(),
                );
            }
        }
    }

    if !state.cfg.token.is_empty() {
        let provided = req
            .headers()
            .get(state.cfg.auth_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        if provided != state.cfg.token {
            return reject(StatusCode::UNAUTHORIZED, "invalid token".to_string());
        }
    }

    next.run(req).await
}

fn remote_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

fn reject(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
