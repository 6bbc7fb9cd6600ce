use crate::source::{ArrivalSink, ConfigSource, StoreError};
use crate::types::{ArrivalRecord, MonitoringConfig, NewMonitoringConfig, RecordId, StoredArrival};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use compact_str::CompactString;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{info, warn};

const CONFIGS_FILE: &str = "configs.json";
const ARRIVALS_FILE: &str = "arrivals.jsonl";

const DEFAULT_PAGE_SIZE: usize = 20;
const TRIP_WINDOW_HOURS: i64 = 6;

/// Monitoring configurations, kept in memory and mirrored to a JSON file.
pub struct ConfigStore {
    path: PathBuf,
    configs: DashMap<i64, MonitoringConfig>,
    next_id: AtomicI64,
    save_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(CONFIGS_FILE);
        let configs = DashMap::new();

        if path.exists() {
            let f = File::open(&path)?;
            let loaded: Vec<MonitoringConfig> = serde_json::from_reader(BufReader::new(f))?;
            for cfg in loaded {
                configs.insert(cfg.id, cfg);
            }
            info!(count = configs.len(), path = %path.display(), "Loaded monitoring configs");
        }

        let next_id = configs.iter().map(|r| *r.key()).max().unwrap_or(0) + 1;
        Ok(Self {
            path,
            configs,
            next_id: AtomicI64::new(next_id),
            save_lock: Mutex::new(()),
        })
    }

    /// All configurations, ordered by route name then station order.
    pub fn list(&self) -> Vec<MonitoringConfig> {
        let mut configs: Vec<MonitoringConfig> =
            self.configs.iter().map(|r| r.value().clone()).collect();
        configs.sort_by(|a, b| {
            a.route_name
                .cmp(&b.route_name)
                .then(a.sta_order.cmp(&b.sta_order))
                .then(a.id.cmp(&b.id))
        });
        configs
    }

    pub fn get(&self, id: i64) -> Option<MonitoringConfig> {
        self.configs.get(&id).map(|r| r.value().clone())
    }

    // Mutations are undone in memory when the file can't be written.

    pub fn create(&self, new: NewMonitoringConfig) -> Result<MonitoringConfig, StoreError> {
        let now = Utc::now();
        let cfg = MonitoringConfig {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            route_id: new.route_id,
            route_name: new.route_name,
            station_id: new.station_id,
            station_name: new.station_name,
            direction: new.direction,
            sta_order: new.sta_order,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.configs.insert(cfg.id, cfg.clone());
        if let Err(e) = self.save() {
            self.configs.remove(&cfg.id);
            return Err(e);
        }
        Ok(cfg)
    }

    pub fn set_active(&self, id: i64, active: bool) -> Result<MonitoringConfig, StoreError> {
        let (previous, updated) = {
            let mut entry = self
                .configs
                .get_mut(&id)
                .ok_or(StoreError::UnknownConfig(id))?;
            let previous = entry.clone();
            entry.is_active = active;
            entry.updated_at = Utc::now();
            (previous, entry.clone())
        };
        if let Err(e) = self.save() {
            self.configs.insert(id, previous);
            return Err(e);
        }
        Ok(updated)
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        let (_, removed) = self
            .configs
            .remove(&id)
            .ok_or(StoreError::UnknownConfig(id))?;
        if let Err(e) = self.save() {
            self.configs.insert(id, removed);
            return Err(e);
        }
        Ok(())
    }

    fn save(&self) -> Result<(), StoreError> {
        let _guard = self.save_lock.lock();
        let tmp = self.path.with_extension("json.tmp");
        let f = File::create(&tmp)?;
        serde_json::to_writer_pretty(f, &self.list())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for ConfigStore {
    async fn list_active(&self) -> Result<Vec<MonitoringConfig>, StoreError> {
        Ok(self.list().into_iter().filter(|cfg| cfg.is_active).collect())
    }
}

/// Query for reading arrivals back out of the log. Days are local calendar
/// days, both ends inclusive.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ArrivalFilter {
    pub route_id: Option<CompactString>,
    pub station_id: Option<CompactString>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl ArrivalFilter {
    fn matches(&self, arrival: &StoredArrival) -> bool {
        let route_ok = self
            .route_id
            .as_ref()
            .is_none_or(|r| *r == arrival.record.route_id);
        let station_ok = self
            .station_id
            .as_ref()
            .is_none_or(|s| *s == arrival.record.station_id);
        route_ok && station_ok
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArrivalPage {
    pub data: Vec<StoredArrival>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

fn day_start(day: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&day.and_time(NaiveTime::MIN))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

trait LogFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Appends one full line or nothing.
fn append_line<F: LogFile>(file: &mut F, line: &[u8]) -> io::Result<()> {
    let start = file.size()?;
    if let Err(e) = file.write_all(line).and_then(|()| file.flush()) {
        // Cut off whatever part of the line made it to disk.
        if let Err(undo) = file.truncate(start) {
            warn!(error = %undo, "Could not roll back partial arrival write");
        }
        return Err(e);
    }
    Ok(())
}

struct LogWriter {
    file: File,
    next_id: RecordId,
}

/// Append-only arrival records, one JSON object per line.
pub struct ArrivalLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
}

impl ArrivalLog {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(ARRIVALS_FILE);

        let last_id = if path.exists() {
            read_log(&path)?.iter().map(|a| a.id).max().unwrap_or(0)
        } else {
            0
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if ends_mid_line(&path)? {
            file.write_all(b"\n")?;
        }
        info!(path = %path.display(), last_id, "Opened arrival log");
        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                next_id: last_id + 1,
            }),
        })
    }

    /// One page of matching arrivals, newest first, with the total match count.
    pub fn query(&self, filter: &ArrivalFilter, tz: Tz) -> Result<ArrivalPage, StoreError> {
        let page = filter.page.filter(|p| *p >= 1).unwrap_or(1);
        let limit = filter.limit.filter(|l| *l >= 1).unwrap_or(DEFAULT_PAGE_SIZE);
        let from = filter.from.and_then(|day| day_start(day, tz));
        // Up to the start of the day after `to`.
        let until = filter
            .to
            .and_then(|day| day.succ_opt())
            .and_then(|day| day_start(day, tz));

        let mut arrivals = read_log(&self.path)?;
        arrivals.retain(|a| {
            let at = a.record.arrived_at;
            filter.matches(a) && from.is_none_or(|f| at >= f) && until.is_none_or(|u| at < u)
        });
        arrivals.sort_by(|a, b| {
            b.record
                .arrived_at
                .cmp(&a.record.arrived_at)
                .then(b.id.cmp(&a.id))
        });

        let total = arrivals.len();
        let data = arrivals
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        Ok(ArrivalPage {
            data,
            total,
            page,
            limit,
        })
    }

    /// The whole run of stations one bus covered around the given arrival:
    /// same plate and route within six hours, with station order rising
    /// without a break through the given arrival.
    pub fn trip(&self, id: RecordId) -> Result<Vec<StoredArrival>, StoreError> {
        let arrivals = read_log(&self.path)?;
        let target = arrivals
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.record.clone())
            .ok_or(StoreError::UnknownArrival(id))?;

        let window = Duration::hours(TRIP_WINDOW_HOURS);
        let earliest = target.arrived_at - window;
        let latest = target.arrived_at + window;

        let mut legs: Vec<StoredArrival> = arrivals
            .into_iter()
            .filter(|a| {
                a.record.plate == target.plate
                    && a.record.route_id == target.route_id
                    && a.record.arrived_at >= earliest
                    && a.record.arrived_at <= latest
            })
            .collect();
        legs.sort_by(|a, b| {
            a.record
                .arrived_at
                .cmp(&b.record.arrived_at)
                .then(a.id.cmp(&b.id))
        });

        let at = legs
            .iter()
            .position(|a| a.id == id)
            .ok_or(StoreError::UnknownArrival(id))?;

        let mut start = at;
        while start > 0 && legs[start - 1].record.sta_order < legs[start].record.sta_order {
            start -= 1;
        }
        let mut end = at;
        while end + 1 < legs.len() && legs[end + 1].record.sta_order > legs[end].record.sta_order {
            end += 1;
        }

        Ok(legs.drain(start..=end).collect())
    }
}

#[async_trait]
impl ArrivalSink for ArrivalLog {
    async fn persist(&self, record: &ArrivalRecord) -> Result<RecordId, StoreError> {
        let mut writer = self.writer.lock();
        let stored = StoredArrival {
            id: writer.next_id,
            recorded_at: Utc::now(),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');
        append_line(&mut writer.file, line.as_bytes())?;
        writer.next_id += 1;
        Ok(stored.id)
    }
}

fn ends_mid_line(path: &Path) -> Result<bool, StoreError> {
    let bytes = std::fs::read(path)?;
    Ok(bytes.last().is_some_and(|b| *b != b'\n'))
}

fn read_log(path: &Path) -> Result<Vec<StoredArrival>, StoreError> {
    let f = File::open(path)?;
    let mut arrivals = Vec::new();
    for (n, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredArrival>(&line) {
            Ok(arrival) => arrivals.push(arrival),
            // Torn final line after a crash.
            Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable arrival"),
        }
    }
    Ok(arrivals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Seoul;

    fn new_config(route: &str, station: &str, order: i32) -> NewMonitoringConfig {
        NewMonitoringConfig {
            route_id: route.into(),
            route_name: route.into(),
            station_id: station.into(),
            station_name: format!("Stop {station}").into(),
            direction: "".into(),
            sta_order: order,
        }
    }

    fn record(route: &str, plate: &str) -> ArrivalRecord {
        ArrivalRecord {
            config_id: 1,
            route_id: route.into(),
            station_id: "206000087".into(),
            sta_order: 1,
            plate: plate.into(),
            arrived_at: Utc::now(),
            seats_before: 10,
            seats_after: Some(4),
        }
    }

    fn seoul(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Seoul
            .with_ymd_and_hms(2025, 3, d, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn leg(plate: &str, sta_order: i32, arrived_at: DateTime<Utc>) -> ArrivalRecord {
        ArrivalRecord {
            station_id: format!("st{sta_order}").into(),
            sta_order,
            arrived_at,
            ..record("7000", plate)
        }
    }

    // Turns the config file into a directory so the next save fails.
    fn break_config_file(dir: &Path) {
        let path = dir.join(CONFIGS_FILE);
        let _ = std::fs::remove_file(&path);
        std::fs::create_dir_all(path.join("blocked")).unwrap();
    }

    #[tokio::test]
    async fn config_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        let b = store.create(new_config("7000", "2", 9)).unwrap();
        let a = store.create(new_config("1550", "1", 4)).unwrap();
        assert_eq!((b.id, a.id), (1, 2));
        store.set_active(b.id, false).unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        let names: Vec<String> = reopened
            .list()
            .into_iter()
            .map(|c| c.route_name.to_string())
            .collect();
        assert_eq!(names, vec!["1550", "7000"]);

        let active = reopened.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let c = reopened.create(new_config("9", "3", 1)).unwrap();
        assert_eq!(c.id, 3);
    }

    #[test]
    fn unknown_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        assert!(matches!(
            store.set_active(42, true),
            Err(StoreError::UnknownConfig(42))
        ));
        assert!(matches!(store.delete(42), Err(StoreError::UnknownConfig(42))));

        let cfg = store.create(new_config("7000", "2", 9)).unwrap();
        store.delete(cfg.id).unwrap();
        assert!(store.get(cfg.id).is_none());
    }

    #[tokio::test]
    async fn failed_save_leaves_configs_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let kept = store.create(new_config("7000", "2", 9)).unwrap();

        break_config_file(dir.path());

        assert!(store.create(new_config("1550", "1", 4)).is_err());
        assert_eq!(store.list().len(), 1);

        assert!(store.set_active(kept.id, false).is_err());
        assert!(store.get(kept.id).unwrap().is_active);

        assert!(store.delete(kept.id).is_err());
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, kept.id);
    }

    #[tokio::test]
    async fn arrival_ids_continue_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let log = ArrivalLog::open(dir.path()).unwrap();
        assert_eq!(log.persist(&record("7000", "A1")).await.unwrap(), 1);
        assert_eq!(log.persist(&record("1550", "B2")).await.unwrap(), 2);
        drop(log);

        let log = ArrivalLog::open(dir.path()).unwrap();
        assert_eq!(log.persist(&record("7000", "C3")).await.unwrap(), 3);

        let all = log.query(&ArrivalFilter::default(), Seoul).unwrap();
        let plates: Vec<_> = all.data.iter().map(|a| a.record.plate.as_str()).collect();
        assert_eq!(plates, vec!["C3", "B2", "A1"]);
        assert_eq!(all.total, 3);

        let filter = ArrivalFilter {
            route_id: Some("7000".into()),
            limit: Some(1),
            ..Default::default()
        };
        let latest = log.query(&filter, Seoul).unwrap();
        assert_eq!(latest.total, 2);
        assert_eq!(latest.data.len(), 1);
        assert_eq!(latest.data[0].record.plate, "C3");
    }

    #[tokio::test]
    async fn query_pages_by_local_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = ArrivalLog::open(dir.path()).unwrap();

        // 00:10 and 23:50 on the 4th belong to the 4th in Seoul, not UTC.
        for (plate, at) in [
            ("A1", seoul(3, 23, 50)),
            ("B2", seoul(4, 0, 10)),
            ("C3", seoul(4, 12, 0)),
            ("D4", seoul(4, 23, 50)),
            ("E5", seoul(5, 0, 10)),
        ] {
            log.persist(&ArrivalRecord {
                arrived_at: at,
                ..record("7000", plate)
            })
            .await
            .unwrap();
        }

        let day = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let filter = ArrivalFilter {
            from: Some(day),
            to: Some(day),
            limit: Some(2),
            ..Default::default()
        };
        let first = log.query(&filter, Seoul).unwrap();
        assert_eq!(first.total, 3);
        assert_eq!((first.page, first.limit), (1, 2));
        let plates: Vec<_> = first.data.iter().map(|a| a.record.plate.as_str()).collect();
        assert_eq!(plates, vec!["D4", "C3"]);

        let second = log
            .query(
                &ArrivalFilter {
                    page: Some(2),
                    ..filter.clone()
                },
                Seoul,
            )
            .unwrap();
        let plates: Vec<_> = second.data.iter().map(|a| a.record.plate.as_str()).collect();
        assert_eq!(plates, vec!["B2"]);

        let empty = log
            .query(
                &ArrivalFilter {
                    page: Some(3),
                    ..filter
                },
                Seoul,
            )
            .unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.total, 3);
    }

    #[tokio::test]
    async fn trip_follows_rising_station_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ArrivalLog::open(dir.path()).unwrap();

        let legs = [
            // Previous run of the same bus.
            leg("A1", 7, seoul(4, 6, 0)),
            // This run: 2, 4, 5, 9.
            leg("A1", 2, seoul(4, 7, 0)),
            leg("A1", 4, seoul(4, 7, 10)),
            leg("A1", 5, seoul(4, 7, 15)),
            leg("A1", 9, seoul(4, 7, 40)),
            // Turned around.
            leg("A1", 3, seoul(4, 8, 30)),
            // Another bus, and the same bus far outside the window.
            leg("B2", 6, seoul(4, 7, 20)),
            leg("A1", 6, seoul(4, 20, 0)),
        ];
        let mut ids = Vec::new();
        for leg in &legs {
            ids.push(log.persist(leg).await.unwrap());
        }

        let trip = log.trip(ids[2]).unwrap();
        let orders: Vec<i32> = trip.iter().map(|a| a.record.sta_order).collect();
        assert_eq!(orders, vec![2, 4, 5, 9]);
        assert!(trip.iter().all(|a| a.record.plate == "A1"));

        let alone = log.trip(ids[7]).unwrap();
        assert_eq!(alone.len(), 1);

        assert!(matches!(log.trip(999), Err(StoreError::UnknownArrival(999))));
    }

    #[tokio::test]
    async fn torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = ArrivalLog::open(dir.path()).unwrap();
        log.persist(&record("7000", "A1")).await.unwrap();
        drop(log);

        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(ARRIVALS_FILE))
            .unwrap();
        f.write_all(b"{\"id\":2,\"recorded").unwrap();

        let log = ArrivalLog::open(dir.path()).unwrap();
        assert_eq!(log.query(&ArrivalFilter::default(), Seoul).unwrap().total, 1);
    }

    /// Takes `room` more bytes, then fails like a full disk.
    struct ShortDisk {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.room);
            if n == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for ShortDisk {
        fn size(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_line() {
        let mut disk = ShortDisk {
            data: b"{\"id\":4}\n".to_vec(),
            room: 6,
        };

        assert!(append_line(&mut disk, b"{\"id\":5,\"recorded_at\":\"x\"}\n").is_err());
        assert_eq!(disk.data, b"{\"id\":4}\n");

        disk.room = 64;
        append_line(&mut disk, b"{\"id\":5}\n").unwrap();
        assert_eq!(disk.data, b"{\"id\":4}\n{\"id\":5}\n");
    }
}
