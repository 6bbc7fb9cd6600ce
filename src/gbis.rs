//! Client for the Gyeonggi bus information (GBIS) open API.
//!
//! Two endpoints are used: the per-station arrival item, which lists at most
//! two approaching buses of a route, and the route-wide location list used
//! to read seats after a bus has left the station.

use crate::source::{ArrivalSource, LocationSource, SourceError};
use crate::types::{VehicleLocation, VehicleSighting};

use async_trait::async_trait;
use compact_str::CompactString;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://apis.data.go.kr/6410000";
const ARRIVAL_ITEM_PATH: &str = "busarrivalservice/v2/getBusArrivalItemv2";
const LOCATION_LIST_PATH: &str = "buslocationservice/v2/getBusLocationListv2";

const RESULT_OK: i64 = 0;
const RESULT_NO_DATA: i64 = 4;

/// Seat count reported when the feed has no reading for a bus.
const SEATS_UNKNOWN: i32 = -1;

pub struct GbisClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl GbisClient {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            service_key: service_key.into(),
        })
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!(%url, ?params, "Requesting GBIS");

        let response = self
            .http
            .get(&url)
            .query(&[("serviceKey", self.service_key.as_str()), ("format", "json")])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ArrivalSource for GbisClient {
    async fn fetch_snapshot(
        &self,
        route_id: &str,
        station_id: &str,
    ) -> Result<Vec<VehicleSighting>, SourceError> {
        let body = self
            .get(
                ARRIVAL_ITEM_PATH,
                &[("routeId", route_id), ("stationId", station_id)],
            )
            .await?;
        parse_arrival_item(&body)
    }
}

#[async_trait]
impl LocationSource for GbisClient {
    async fn fetch_locations(&self, route_id: &str) -> Result<Vec<VehicleLocation>, SourceError> {
        let body = self.get(LOCATION_LIST_PATH, &[("routeId", route_id)]).await?;
        parse_location_list(&body)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Response<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response<T> {
    msg_header: MsgHeader,
    msg_body: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MsgHeader {
    #[serde(default, deserialize_with = "lenient_int")]
    result_code: Option<i64>,
    #[serde(default)]
    result_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArrivalBody {
    bus_arrival_item: Option<ArrivalItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArrivalItem {
    #[serde(default)]
    plate_no1: Option<String>,
    #[serde(default)]
    plate_no2: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    location_no1: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    location_no2: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    remain_seat_cnt1: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    remain_seat_cnt2: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    #[serde(default)]
    bus_location_list: OneOrMany<LocationItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationItem {
    #[serde(default)]
    plate_no: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    remain_seat_cnt: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    station_seq: Option<i64>,
}

/// The API collapses single-element lists into a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Accepts an integer sent as a number, a numeric string, an empty string or null.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("not an integer: {n}"))),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("not an integer: {s:?}"))),
        other => Err(de::Error::custom(format!("unexpected value: {other}"))),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, SourceError> {
    let envelope: Envelope<T> = serde_json::from_slice(body)?;
    let header = envelope.response.msg_header;
    match header.result_code.unwrap_or(RESULT_OK) {
        RESULT_OK => Ok(envelope.response.msg_body),
        RESULT_NO_DATA => Ok(None),
        code => Err(SourceError::Api {
            code,
            message: header.result_message,
        }),
    }
}

fn to_i32(value: Option<i64>, fallback: i32) -> i32 {
    value
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(fallback)
}

fn sighting(plate: Option<String>, location: Option<i64>, seats: Option<i64>) -> Option<VehicleSighting> {
    let plate = plate?;
    let plate = plate.trim();
    if plate.is_empty() {
        return None;
    }
    Some(VehicleSighting {
        plate: CompactString::from(plate),
        // Unknown distance never blocks a later, closer reading.
        stops_away: to_i32(location, i32::MAX),
        seats: to_i32(seats, SEATS_UNKNOWN),
    })
}

pub fn parse_arrival_item(body: &[u8]) -> Result<Vec<VehicleSighting>, SourceError> {
    let Some(item) = decode::<ArrivalBody>(body)?.and_then(|b| b.bus_arrival_item) else {
        return Ok(Vec::new());
    };

    Ok([
        sighting(item.plate_no1, item.location_no1, item.remain_seat_cnt1),
        sighting(item.plate_no2, item.location_no2, item.remain_seat_cnt2),
    ]
    .into_iter()
    .flatten()
    .collect())
}

pub fn parse_location_list(body: &[u8]) -> Result<Vec<VehicleLocation>, SourceError> {
    let Some(body) = decode::<LocationBody>(body)? else {
        return Ok(Vec::new());
    };

    Ok(body
        .bus_location_list
        .into_vec()
        .into_iter()
        .filter_map(|item| {
            let plate = item.plate_no?;
            Some(VehicleLocation {
                plate: CompactString::from(plate.trim()),
                // Negative counts mean the feed has no reading yet.
                seats: item
                    .remain_seat_cnt
                    .filter(|seats| *seats >= 0)
                    .and_then(|seats| i32::try_from(seats).ok()),
                station_seq: to_i32(item.station_seq, 0),
            })
        })
        .collect())
}
