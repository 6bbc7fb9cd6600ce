use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod gbis;
mod gc;
mod persistence;
mod server;
mod settings;
mod source;
mod state;
mod supervisor;
mod tracker;
mod types;
mod window;
mod worker;

use gbis::GbisClient;
use persistence::{ArrivalLog, ConfigStore};
use settings::Settings;
use state::AppState;
use supervisor::{Collaborators, Supervisor};

const DEFAULT_LOG_FILTER: &str = "bus_arrival_recorder=info,warn";

#[derive(Parser, Debug)]
#[command(name = "bus-arrival-recorder")]
#[command(about = "Records bus arrivals and boarding counts at monitored stations")]
struct Args {
    /// Settings file; missing values fall back to defaults
    #[arg(short, long, env = "SETTINGS_PATH", default_value = "./data/settings.json")]
    settings: PathBuf,

    /// GBIS open API service key
    #[arg(long, env = "SERVICE_KEY")]
    service_key: Option<String>,

    /// Directory holding configs.json and arrivals.jsonl
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Port to run the admin HTTP server on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Polling interval per station, in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// First local hour of collection (0-23)
    #[arg(long)]
    start_hour: Option<u32>,

    /// Local hour collection stops (0-23). 0 and 0 means all day
    #[arg(long)]
    end_hour: Option<u32>,

    /// IANA time zone the collection hours are read in
    #[arg(long)]
    timezone: Option<String>,

    /// Log filter, e.g. "bus_arrival_recorder=debug"
    #[arg(long)]
    log: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(key) = &self.service_key {
            settings.service_key = key.clone();
        }
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(interval_ms) = self.interval_ms {
            settings.interval_ms = interval_ms;
        }
        if let Some(hour) = self.start_hour {
            settings.start_hour = hour;
        }
        if let Some(hour) = self.end_hour {
            settings.end_hour = hour;
        }
        if let Some(tz) = &self.timezone {
            settings.timezone = tz.clone();
        }
    }
}

fn init_logging(directive: Option<&str>) {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let mut settings = Settings::load(&args.settings)
        .with_context(|| format!("loading {}", args.settings.display()))?;
    args.apply(&mut settings);
    let collector = settings.collector()?;

    if settings.service_key.is_empty() {
        warn!("No GBIS service key configured, upstream requests will be rejected");
    }
    info!(
        data_dir = %settings.data_dir.display(),
        interval_ms = collector.worker.interval.as_millis() as u64,
        start_hour = settings.start_hour,
        end_hour = settings.end_hour,
        timezone = %collector.worker.timezone,
        "Initializing bus arrival recorder"
    );

    // 1. Storage
    let configs = Arc::new(ConfigStore::open(&settings.data_dir).context("opening config store")?);
    let arrivals = Arc::new(ArrivalLog::open(&settings.data_dir).context("opening arrival log")?);

    // 2. Upstream
    let gbis = Arc::new(GbisClient::new(
        settings.api_base_url.clone(),
        settings.service_key.clone(),
        settings.request_timeout(),
    )?);

    // 3. Collector
    let timezone = collector.worker.timezone;
    let supervisor = Supervisor::new(
        Collaborators {
            configs: configs.clone(),
            arrivals: gbis.clone(),
            locations: gbis,
            sink: arrivals.clone(),
        },
        collector,
    );
    supervisor.start().await?;

    // 4. HTTP Server
    let state = Arc::new(AppState::new(supervisor.clone(), configs, arrivals, timezone));
    let routes = server::routes(state);
    let server_port = settings.port;
    tokio::spawn(warp::serve(routes).run(([0, 0, 0, 0], server_port)));
    info!(port = server_port, "Admin server running at http://localhost:{}", server_port);

    // 5. Wait for Ctrl-C, then drain workers
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    supervisor.stop().await;
    info!("Bye");
    Ok(())
}
