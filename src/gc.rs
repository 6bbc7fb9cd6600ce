use crate::tracker::{BusState, TrackerPolicy};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use std::collections::HashMap;

/// Drops tracked buses that are done or too old. Returns how many were removed.
///
/// A finalized bus is kept for `retention` after its last sighting so a late
/// duplicate in the feed cannot start a second record. Any bus older than
/// `max_age` is dropped even if it never resolved.
pub fn sweep(
    buses: &mut HashMap<CompactString, BusState>,
    now: DateTime<Utc>,
    policy: &TrackerPolicy,
) -> usize {
    let mut to_remove: Vec<CompactString> = Vec::new();

    for (plate, bus) in buses.iter() {
        let expired = bus.finalized && now - bus.last_seen_at > policy.retention;
        let too_old = now - bus.first_seen_at >= policy.max_age;
        if expired || too_old {
            to_remove.push(plate.clone());
        }
    }

    for plate in &to_remove {
        buses.remove(plate);
    }

    to_remove.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bus(plate: &str, first_seen: DateTime<Utc>, last_seen: DateTime<Utc>, finalized: bool) -> BusState {
        BusState {
            plate: plate.into(),
            first_seen_at: first_seen,
            last_seen_at: last_seen,
            seats_before: 10,
            approach_ordinal: 1,
            finalized,
            passed_at: finalized.then_some(last_seen),
            confirmation_attempts: 0,
        }
    }

    #[test]
    fn test_sweep_tracked_buses() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap();
        let policy = TrackerPolicy::default();
        let mut buses: HashMap<CompactString, BusState> = HashMap::new();

        // 1. Finalized, last seen 11 minutes ago
        buses.insert(
            "done_old".into(),
            bus("done_old", now - Duration::minutes(20), now - Duration::minutes(11), true),
        );
        // 2. Finalized, last seen 5 minutes ago
        buses.insert(
            "done_recent".into(),
            bus("done_recent", now - Duration::minutes(8), now - Duration::minutes(5), true),
        );
        // 3. Unresolved, last seen long ago but younger than the ceiling
        buses.insert(
            "pending".into(),
            bus("pending", now - Duration::minutes(50), now - Duration::minutes(45), false),
        );
        // 4. Unresolved, first seen exactly an hour ago
        buses.insert(
            "stuck".into(),
            bus("stuck", now - Duration::hours(1), now - Duration::minutes(1), false),
        );

        let removed = sweep(&mut buses, now, &policy);

        assert_eq!(removed, 2);
        assert!(!buses.contains_key("done_old"), "Expired finalized bus should be removed");
        assert!(buses.contains_key("done_recent"), "Recently finalized bus should remain");
        assert!(buses.contains_key("pending"), "Pending bus below the ceiling should remain");
        assert!(!buses.contains_key("stuck"), "Bus at the age ceiling should be removed");
    }

    #[test]
    fn retention_boundary_is_exclusive() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap();
        let policy = TrackerPolicy::default();
        let mut buses: HashMap<CompactString, BusState> = HashMap::new();
        buses.insert(
            "edge".into(),
            bus("edge", now - Duration::minutes(15), now - Duration::minutes(10), true),
        );

        assert_eq!(sweep(&mut buses, now, &policy), 0);
        assert_eq!(sweep(&mut buses, now + Duration::seconds(1), &policy), 1);
    }
}
