use crate::persistence::{ArrivalLog, ConfigStore};
use crate::supervisor::Supervisor;

use chrono_tz::Tz;
use std::sync::Arc;

/// Shared handles for the admin API.
pub struct AppState {
    pub supervisor: Supervisor,
    pub configs: Arc<ConfigStore>,
    pub arrivals: Arc<ArrivalLog>,
    /// Zone that arrival date filters are read in.
    pub timezone: Tz,
}

impl AppState {
    pub fn new(
        supervisor: Supervisor,
        configs: Arc<ConfigStore>,
        arrivals: Arc<ArrivalLog>,
        timezone: Tz,
    ) -> Self {
        Self {
            supervisor,
            configs,
            arrivals,
            timezone,
        }
    }
}
