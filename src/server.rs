use crate::persistence::ArrivalFilter;
use crate::source::StoreError;
use crate::state::AppState;
use crate::types::NewMonitoringConfig;

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

#[derive(Serialize)]
struct StatusReply {
    running: bool,
    workers: Vec<i64>,
    configs: usize,
    active_configs: usize,
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct ActiveBody {
    is_active: bool,
}

fn message(status: StatusCode, message: &str) -> Response {
    warp::reply::with_status(warp::reply::json(&Message { message }), status).into_response()
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::UnknownConfig(_) | StoreError::UnknownArrival(_) => {
            message(StatusCode::NOT_FOUND, &e.to_string())
        }
        e => {
            error!(error = %e, "Storage error");
            message(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone()).boxed();

    // GET /status
    let status_route = warp::path!("status")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| {
            let configs = state.configs.list();
            warp::reply::json(&StatusReply {
                running: state.supervisor.is_running(),
                workers: state.supervisor.running_workers(),
                configs: configs.len(),
                active_configs: configs.iter().filter(|c| c.is_active).count(),
            })
            .into_response()
        });

    // POST /collector/start
    let start_route = warp::path!("collector" / "start")
        .and(warp::post())
        .and(state_filter.clone())
        .and_then(start_collector);

    // POST /collector/stop
    let stop_route = warp::path!("collector" / "stop")
        .and(warp::post())
        .and(state_filter.clone())
        .and_then(stop_collector);

    // GET /configs
    let list_configs_route = warp::path!("configs")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| warp::reply::json(&state.configs.list()).into_response());

    // GET /configs/{id}
    let get_config_route = warp::path!("configs" / i64)
        .and(warp::get())
        .and(state_filter.clone())
        .map(|id: i64, state: Arc<AppState>| match state.configs.get(id) {
            Some(cfg) => warp::reply::json(&cfg).into_response(),
            None => store_error(StoreError::UnknownConfig(id)),
        });

    // POST /configs
    let create_config_route = warp::path!("configs")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(create_config);

    // PUT /configs/{id}/active
    let set_active_route = warp::path!("configs" / i64 / "active")
        .and(warp::put())
        .and(warp::body::json())
        .and(state_filter.clone())
        .map(|id: i64, body: ActiveBody, state: Arc<AppState>| {
            match state.configs.set_active(id, body.is_active) {
                Ok(cfg) => {
                    info!(config_id = id, is_active = cfg.is_active, "Config toggled");
                    state.supervisor.notify_config_changed();
                    warp::reply::json(&cfg).into_response()
                }
                Err(e) => store_error(e),
            }
        });

    // DELETE /configs/{id}
    let delete_config_route = warp::path!("configs" / i64)
        .and(warp::delete())
        .and(state_filter.clone())
        .map(|id: i64, state: Arc<AppState>| match state.configs.delete(id) {
            Ok(()) => {
                info!(config_id = id, "Config deleted");
                state.supervisor.notify_config_changed();
                message(StatusCode::OK, "Config deleted")
            }
            Err(e) => store_error(e),
        });

    // GET /arrivals?route_id=&station_id=&from=&to=&page=&limit=
    let arrivals_route = warp::path!("arrivals")
        .and(warp::get())
        .and(warp::query::<ArrivalFilter>())
        .and(state_filter.clone())
        .map(|filter: ArrivalFilter, state: Arc<AppState>| {
            match state.arrivals.query(&filter, state.timezone) {
                Ok(page) => warp::reply::json(&page).into_response(),
                Err(e) => store_error(e),
            }
        });

    // GET /arrivals/{id}/trip
    let trip_route = warp::path!("arrivals" / u64 / "trip")
        .and(warp::get())
        .and(state_filter)
        .map(|id: u64, state: Arc<AppState>| match state.arrivals.trip(id) {
            Ok(trip) => warp::reply::json(&trip).into_response(),
            Err(e) => store_error(e),
        });

    status_route
        .or(start_route)
        .unify()
        .or(stop_route)
        .unify()
        .or(list_configs_route)
        .unify()
        .or(get_config_route)
        .unify()
        .or(create_config_route)
        .unify()
        .or(set_active_route)
        .unify()
        .or(delete_config_route)
        .unify()
        .or(arrivals_route)
        .unify()
        .or(trip_route)
        .unify()
}

async fn start_collector(state: Arc<AppState>) -> Result<Response, Infallible> {
    Ok(match state.supervisor.start().await {
        Ok(()) => message(StatusCode::OK, "Collector started"),
        Err(e) => message(StatusCode::CONFLICT, &e.to_string()),
    })
}

async fn stop_collector(state: Arc<AppState>) -> Result<Response, Infallible> {
    state.supervisor.stop().await;
    Ok(message(StatusCode::OK, "Collector stopped"))
}

async fn create_config(
    new: NewMonitoringConfig,
    state: Arc<AppState>,
) -> Result<Response, Infallible> {
    let cfg = match state.configs.create(new) {
        Ok(cfg) => cfg,
        Err(e) => return Ok(store_error(e)),
    };
    info!(
        config_id = cfg.id,
        route = %cfg.route_name,
        station = %cfg.station_name,
        "Config created"
    );

    if !state.supervisor.is_running() {
        if let Err(e) = state.supervisor.start().await {
            warn!(error = %e, "Collector auto-start failed");
        }
    }
    state.supervisor.notify_config_changed();

    Ok(warp::reply::with_status(warp::reply::json(&cfg), StatusCode::CREATED).into_response())
}
