//! Health check endpoints
//!
//! Component states are pushed in by the consumer as its broker session
//! changes. Readiness reports the worst of them.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::{
    ComponentHealth, HealthResponse, HealthStatus, ReadyResponse, ServerHealth, BUILD_INFO,
};

/// Application state for health checks
#[derive(Clone)]
pub struct HealthState {
    /// Shared state for component health tracking
    pub components: Arc<tokio::sync::RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthState {
    /// Create a new health state
    pub fn new() -> Self {
        Self {
            components: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// Update component health status
    pub async fn update_component(
        &self,
        name: impl Into<String>,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut components = self.components.write().await;
        components.insert(
            name.into(),
            ComponentHealth {
                status,
                message,
                last_check: Utc::now(),
            },
        );
    }

    /// Current state of one component
    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().await.get(name).cloned()
    }

    /// Get overall health status
    pub async fn get_status(&self) -> HealthStatus {
        let components = self.components.read().await;

        // If any component is unhealthy, overall status is unhealthy
        if components.values().any(|c| c.status == HealthStatus::Unhealthy) {
            return HealthStatus::Unhealthy;
        }

        // If any component is degraded, overall status is degraded
        if components.values().any(|c| c.status == HealthStatus::Degraded) {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Express-style health check polled by the platform load balancer
///
/// ```text
/// GET /.well-known/express/server-health
/// ```
pub async fn server_health() -> Response {
    let body = ServerHealth {
        status: "pass".to_string(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Basic liveness check endpoint
///
/// Returns 200 OK if the process is alive. External dependencies are not
/// checked here.
pub async fn health_check() -> Response {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Service is running".to_string()),
        timestamp: Utc::now(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness check endpoint
///
/// 503 while any component is unhealthy.
pub async fn ready_check(State(state): State<Arc<HealthState>>) -> Response {
    let components = state.components.read().await.clone();
    let overall_status = state.get_status().await;

    let response = ReadyResponse {
        status: overall_status,
        checks: components,
        timestamp: Utc::now(),
    };

    let status_code = overall_status.to_status_code();
    (status_code, Json(response)).into_response()
}

/// Build information endpoint
pub async fn build_info() -> Response {
    (StatusCode::OK, Json(&BUILD_INFO)).into_response()
}
