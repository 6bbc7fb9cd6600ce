//! Per-station bus tracking.
//!
//! The arrival feed never says "this bus just left". A bus is only ever
//! reported as N stops away, so a passage is inferred when a tracked plate
//! drops out of the latest snapshot. After a passage the route-wide location
//! feed is polled on every following tick for a post-passage seat count,
//! until one is found or the confirmation timeout runs out.

use crate::gc;
use crate::source::{ArrivalSink, LocationSource, SourceError};
use crate::types::{ArrivalRecord, MonitoringConfig, VehicleSighting};

use chrono::{DateTime, Duration, Utc};
use compact_str::CompactString;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Timing rules applied to every tracked bus.
#[derive(Clone, Debug)]
pub struct TrackerPolicy {
    /// How long after a passage the location feed is retried.
    pub confirmation_timeout: Duration,
    /// How long a finalized entry is kept after its last sighting.
    pub retention: Duration,
    /// Age after which an entry is dropped whatever its state.
    pub max_age: Duration,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::minutes(2),
            retention: Duration::minutes(10),
            max_age: Duration::hours(1),
        }
    }
}

/// Identity of the station a tracker watches, copied into every record.
#[derive(Clone, Debug)]
pub struct StationKey {
    pub config_id: i64,
    pub route_id: CompactString,
    pub station_id: CompactString,
    pub station_name: CompactString,
    pub sta_order: i32,
}

impl From<&MonitoringConfig> for StationKey {
    fn from(cfg: &MonitoringConfig) -> Self {
        Self {
            config_id: cfg.id,
            route_id: cfg.route_id.clone(),
            station_id: cfg.station_id.clone(),
            station_name: cfg.station_name.clone(),
            sta_order: cfg.sta_order,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BusState {
    pub plate: CompactString,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Seat count from the closest reading before the passage.
    pub seats_before: i32,
    pub approach_ordinal: i32,
    pub finalized: bool,
    pub passed_at: Option<DateTime<Utc>>,
    pub confirmation_attempts: u32,
}

impl BusState {
    fn new(sighting: &VehicleSighting, now: DateTime<Utc>) -> Self {
        Self {
            plate: sighting.plate.clone(),
            first_seen_at: now,
            last_seen_at: now,
            seats_before: sighting.seats,
            approach_ordinal: sighting.stops_away,
            finalized: false,
            passed_at: None,
            confirmation_attempts: 0,
        }
    }

    /// Returns true when the reading moved the bus closer and replaced the
    /// stored seat count.
    fn observe(&mut self, sighting: &VehicleSighting, now: DateTime<Utc>) -> bool {
        self.last_seen_at = now;
        if sighting.stops_away < self.approach_ordinal {
            self.seats_before = sighting.seats;
            self.approach_ordinal = sighting.stops_away;
            return true;
        }
        false
    }
}

/// Outcome of one lookup against the location feed.
#[derive(Debug)]
pub enum Confirmation {
    Confirmed(i32),
    /// The plate is missing from the feed or has no seat reading yet.
    Unavailable,
    /// The feed could not be reached; handled like `Unavailable`.
    Failed(SourceError),
}

pub async fn confirm(source: &dyn LocationSource, route_id: &str, plate: &str) -> Confirmation {
    let locations = match source.fetch_locations(route_id).await {
        Ok(locations) => locations,
        Err(e) => return Confirmation::Failed(e),
    };

    match locations.iter().find(|loc| loc.plate == plate) {
        Some(loc) => match loc.seats {
            Some(seats) => {
                debug!(plate, station_seq = loc.station_seq, seats, "Found bus in location feed");
                Confirmation::Confirmed(seats)
            }
            None => {
                debug!(plate, "Seat data not yet available");
                Confirmation::Unavailable
            }
        },
        None => {
            debug!(plate, "Bus not found in location feed");
            Confirmation::Unavailable
        }
    }
}

/// Tracks every bus seen near one station. Owned by exactly one worker.
pub struct BusTracker {
    station: StationKey,
    policy: TrackerPolicy,
    locations: Arc<dyn LocationSource>,
    sink: Arc<dyn ArrivalSink>,
    buses: HashMap<CompactString, BusState>,
}

impl BusTracker {
    pub fn new(
        station: StationKey,
        policy: TrackerPolicy,
        locations: Arc<dyn LocationSource>,
        sink: Arc<dyn ArrivalSink>,
    ) -> Self {
        Self {
            station,
            policy,
            locations,
            sink,
            buses: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    #[cfg(test)]
    pub fn get(&self, plate: &str) -> Option<&BusState> {
        self.buses.get(plate)
    }

    /// Applies one poll result and returns the arrivals persisted on this tick.
    pub async fn apply_snapshot(
        &mut self,
        now: DateTime<Utc>,
        sightings: &[VehicleSighting],
    ) -> Vec<ArrivalRecord> {
        let mut present: HashSet<CompactString> = HashSet::new();

        for sighting in sightings {
            if sighting.plate.trim().is_empty() {
                continue;
            }
            present.insert(sighting.plate.clone());
            self.observe(sighting, now);
        }

        let passed: Vec<CompactString> = self
            .buses
            .values()
            .filter(|bus| !bus.finalized && !present.contains(&bus.plate))
            .map(|bus| bus.plate.clone())
            .collect();

        let mut recorded = Vec::new();
        for plate in passed {
            if let Some(record) = self.resolve_passage(&plate, now).await {
                recorded.push(record);
            }
        }

        let removed = gc::sweep(&mut self.buses, now, &self.policy);
        if removed > 0 {
            debug!(
                station_id = %self.station.station_id,
                removed,
                tracking = self.buses.len(),
                "Cleaned up tracked buses"
            );
        }

        recorded
    }

    fn observe(&mut self, sighting: &VehicleSighting, now: DateTime<Utc>) {
        match self.buses.get_mut(&sighting.plate) {
            None => {
                debug!(
                    plate = %sighting.plate,
                    station = %self.station.station_name,
                    stops_away = sighting.stops_away,
                    seats = sighting.seats,
                    "New bus approaching"
                );
                self.buses
                    .insert(sighting.plate.clone(), BusState::new(sighting, now));
            }
            // Already recorded. Keep it alive while the bus is still listed
            // so retention can't drop it and start a second record.
            Some(bus) if bus.finalized => bus.last_seen_at = now,
            Some(bus) => {
                if bus.observe(sighting, now) {
                    debug!(
                        plate = %sighting.plate,
                        stops_away = sighting.stops_away,
                        seats = sighting.seats,
                        "Bus getting closer"
                    );
                }
            }
        }
    }

    async fn resolve_passage(
        &mut self,
        plate: &CompactString,
        now: DateTime<Utc>,
    ) -> Option<ArrivalRecord> {
        let bus = self.buses.get_mut(plate)?;
        let passed_at = *bus.passed_at.get_or_insert(now);

        let seats_after = match confirm(self.locations.as_ref(), &self.station.route_id, plate).await
        {
            Confirmation::Confirmed(seats) => Some(seats),
            Confirmation::Unavailable => None,
            Confirmation::Failed(e) => {
                warn!(
                    route_id = %self.station.route_id,
                    plate = %plate,
                    error = %e,
                    "Error getting bus locations"
                );
                None
            }
        };

        if seats_after.is_some() {
            return finalize(self.sink.as_ref(), &self.station, bus, seats_after).await;
        }

        bus.confirmation_attempts += 1;
        let elapsed = now - passed_at;
        if elapsed < self.policy.confirmation_timeout {
            debug!(
                plate = %plate,
                attempt = bus.confirmation_attempts,
                elapsed_secs = elapsed.num_seconds(),
                "Waiting for valid seat data"
            );
            return None;
        }

        warn!(
            plate = %plate,
            attempts = bus.confirmation_attempts,
            "Timeout waiting for seat data, saving without seats_after"
        );
        finalize(self.sink.as_ref(), &self.station, bus, None).await
    }
}

async fn finalize(
    sink: &dyn ArrivalSink,
    station: &StationKey,
    bus: &mut BusState,
    seats_after: Option<i32>,
) -> Option<ArrivalRecord> {
    let record = ArrivalRecord {
        config_id: station.config_id,
        route_id: station.route_id.clone(),
        station_id: station.station_id.clone(),
        sta_order: station.sta_order,
        plate: bus.plate.clone(),
        arrived_at: bus.last_seen_at,
        seats_before: bus.seats_before,
        seats_after,
    };

    match sink.persist(&record).await {
        Ok(id) => {
            bus.finalized = true;
            info!(
                record_id = id,
                route_id = %record.route_id,
                station = %station.station_name,
                plate = %record.plate,
                seats_before = record.seats_before,
                seats_after = ?record.seats_after,
                boarded = ?record.boarded(),
                "Recorded arrival"
            );
            Some(record)
        }
        Err(e) => {
            // Left unfinalized; the age ceiling reclaims it if writes keep failing.
            warn!(plate = %record.plate, error = %e, "Error saving bus arrival");
            None
        }
    }
}
