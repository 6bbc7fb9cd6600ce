//! One polling loop per monitored route+station.

use crate::source::{ArrivalSink, ArrivalSource, LocationSource};
use crate::tracker::{BusTracker, StationKey, TrackerPolicy};
use crate::types::MonitoringConfig;
use crate::window::TimeWindow;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub window: TimeWindow,
    /// Zone whose wall clock the window is read in.
    pub timezone: Tz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    OutsideWindow,
    FetchFailed,
    Polled { sightings: usize, recorded: usize },
}

pub struct StationWorker {
    config: MonitoringConfig,
    settings: WorkerSettings,
    arrivals: Arc<dyn ArrivalSource>,
    tracker: BusTracker,
}

impl StationWorker {
    pub fn new(
        config: MonitoringConfig,
        settings: WorkerSettings,
        policy: TrackerPolicy,
        arrivals: Arc<dyn ArrivalSource>,
        locations: Arc<dyn LocationSource>,
        sink: Arc<dyn ArrivalSink>,
    ) -> Self {
        let tracker = BusTracker::new(StationKey::from(&config), policy, locations, sink);
        Self {
            config,
            settings,
            arrivals,
            tracker,
        }
    }

    /// Polls until `stop` fires. Unfinalized passages are dropped on exit.
    pub async fn run(mut self, stop: CancellationToken) {
        info!(
            config_id = self.config.id,
            route_id = %self.config.route_id,
            route = %self.config.route_name,
            station_id = %self.config.station_id,
            station = %self.config.station_name,
            "Collection started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A tick still waiting on GBIS is abandoned here.
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.tick(Utc::now()) => {}
            }
        }

        info!(
            config_id = self.config.id,
            route_id = %self.config.route_id,
            station = %self.config.station_name,
            dropped = self.tracker.len(),
            "Collection stopped"
        );
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let hour = now.with_timezone(&self.settings.timezone).hour();
        if !self.settings.window.contains(hour) {
            debug!(
                start_hour = self.settings.window.start_hour,
                end_hour = self.settings.window.end_hour,
                station = %self.config.station_name,
                "Outside time window, skipping collection"
            );
            return TickOutcome::OutsideWindow;
        }

        let sightings = match self
            .arrivals
            .fetch_snapshot(&self.config.route_id, &self.config.station_id)
            .await
        {
            Ok(sightings) => sightings,
            Err(e) => {
                warn!(
                    route_id = %self.config.route_id,
                    station_id = %self.config.station_id,
                    error = %e,
                    "Error fetching arrivals"
                );
                // Tracked buses stay as they were until the next good poll.
                return TickOutcome::FetchFailed;
            }
        };

        debug!(
            station = %self.config.station_name,
            arrivals = sightings.len(),
            tracking = self.tracker.len(),
            "Fetched arrivals"
        );

        let recorded = self.tracker.apply_snapshot(now, &sightings).await;
        TickOutcome::Polled {
            sightings: sightings.len(),
            recorded: recorded.len(),
        }
    }
}
