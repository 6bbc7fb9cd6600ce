use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

pub type RecordId = u64;

/// One vehicle reported near a station by the arrival feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleSighting {
    pub plate: CompactString,
    pub stops_away: i32,
    pub seats: i32,
}

/// One vehicle position reported by the route-wide location feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VehicleLocation {
    pub plate: CompactString,
    /// `None` while the feed has no seat reading for this vehicle yet.
    pub seats: Option<i32>,
    pub station_seq: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    pub id: i64,
    pub route_id: CompactString,
    pub route_name: CompactString,
    pub station_id: CompactString,
    pub station_name: CompactString,
    #[serde(default)]
    pub direction: CompactString,
    #[serde(default)]
    pub sta_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewMonitoringConfig {
    pub route_id: CompactString,
    pub route_name: CompactString,
    pub station_id: CompactString,
    pub station_name: CompactString,
    #[serde(default)]
    pub direction: CompactString,
    #[serde(default)]
    pub sta_order: i32,
}

/// A finalized passage of one vehicle past one monitored station.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ArrivalRecord {
    pub config_id: i64,
    pub route_id: CompactString,
    pub station_id: CompactString,
    /// Position of the station along the route when the arrival was recorded.
    #[serde(default)]
    pub sta_order: i32,
    pub plate: CompactString,
    pub arrived_at: DateTime<Utc>,
    pub seats_before: i32,
    /// Absent when no seat reading was confirmed before the timeout.
    pub seats_after: Option<i32>,
}

impl ArrivalRecord {
    /// Passengers who boarded, derived from the drop in free seats.
    pub fn boarded(&self) -> Option<i32> {
        self.seats_after.map(|after| self.seats_before - after)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredArrival {
    pub id: RecordId,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: ArrivalRecord,
}
