//! Seams between the arrival engine and the outside world.
//!
//! Workers only see these traits. Every implementation must be safe to call
//! from many workers at once.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ArrivalRecord, MonitoringConfig, RecordId, VehicleLocation, VehicleSighting};

/// Failure talking to an upstream feed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream API error (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failure reading or writing local state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no monitoring config with id {0}")]
    UnknownConfig(i64),

    #[error("no arrival with id {0}")]
    UnknownArrival(RecordId),
}

/// Vehicles currently approaching a station on a route.
#[async_trait]
pub trait ArrivalSource: Send + Sync {
    async fn fetch_snapshot(
        &self,
        route_id: &str,
        station_id: &str,
    ) -> Result<Vec<VehicleSighting>, SourceError>;
}

/// Route-wide vehicle positions, used to confirm seats after a passage.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn fetch_locations(&self, route_id: &str) -> Result<Vec<VehicleLocation>, SourceError>;
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn list_active(&self) -> Result<Vec<MonitoringConfig>, StoreError>;
}

#[async_trait]
pub trait ArrivalSink: Send + Sync {
    async fn persist(&self, record: &ArrivalRecord) -> Result<RecordId, StoreError>;
}
