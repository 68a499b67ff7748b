//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Contents:
//! - **config**: the validated configuration, read-only after startup
//! - **metrics**: per-endpoint request counters, updated by the metrics middleware
//! - **manager**: the session manager; cheap to clone, every clone shares one registry
//! - **start_time**: for uptime reporting
//!
//! ## Arc<RwLock<T>> Pattern
//! Metrics are written on every request and read rarely, so they sit behind a
//! `std::sync::RwLock`. Lock guards are never held across an `.await`.

use crate::audio::SessionManager;
use crate::config::AppConfig;
use crate::error::AppResult;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub manager: SessionManager,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Key: route pattern (e.g. "POST /audio/chunk")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one route.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative time spent handling requests to this route (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, manager: SessionManager) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            manager,
            start_time: Instant::now(),
        }
    }

    /// Build the state, including the session manager, from configuration.
    pub fn from_config(config: AppConfig) -> AppResult<Self> {
        let manager = SessionManager::from_config(&config)?;
        Ok(Self::new(config, manager))
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// Record one finished request.
    ///
    /// ## Parameters:
    /// - **endpoint**: method and route pattern, e.g. "GET /ws/{client_id}"
    /// - **duration_ms**: how long the request took
    /// - **is_error**: whether the response was a 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
