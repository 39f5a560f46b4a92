//! occupancyd - camera occupancy scanner daemon
//!
//! This daemon:
//! 1. Watches a JSON config file and applies it to the pipeline controller
//! 2. Scans every configured camera once per interval
//! 3. Publishes per-quadrant counts to MQTT (or the log with --dry-run)
//! 4. Serves saved frames over a loopback HTTP projection

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use camera_occupancy::{
    api::{ApiConfig, ApiServer, DEFAULT_API_ADDR},
    config_watch::ConfigWatcher,
    publish::{
        LogPublisher, MqttEndpoint, MqttPublisher, MqttSettings, TlsMaterials,
        DEFAULT_RECONNECT_DELAY,
    },
    CameraClient, DefaultModelLoader, DetectorAdapter, FrameStore, PipelineController, Publisher,
    ScanOrchestrator,
};

const DAEMON_NAME: &str = "occupancyd";

#[derive(Parser, Debug)]
#[command(author, version, about = "Periodic camera occupancy scanner")]
struct Args {
    /// Pipeline configuration file (JSON). Missing file means defaults.
    #[arg(long, env = "OCCUPANCY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// How often to check the config file for changes, in seconds.
    #[arg(long, env = "OCCUPANCY_CONFIG_POLL_SECS", default_value_t = 2)]
    config_poll_secs: u64,

    /// Directory for saved frames.
    #[arg(long, env = "OCCUPANCY_OUTPUT_DIR", default_value = "frames")]
    output_dir: PathBuf,

    /// Per-request camera timeout in seconds.
    #[arg(long, env = "OCCUPANCY_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Address for the read-only HTTP projection.
    #[arg(long, env = "OCCUPANCY_API_ADDR", default_value = DEFAULT_API_ADDR)]
    api_addr: String,

    /// Do not start the HTTP projection.
    #[arg(long, env = "OCCUPANCY_NO_API")]
    no_api: bool,

    /// Log summaries instead of publishing to MQTT.
    #[arg(long, env = "OCCUPANCY_DRY_RUN")]
    dry_run: bool,

    /// MQTT broker address.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (required for mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DAEMON_NAME)]
    mqtt_client_id: String,

    /// Prefix for the availability topic (`<prefix>/status`).
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "occupancy")]
    mqtt_topic_prefix: String,

    /// Seconds to wait before reconnecting after a broker error.
    #[arg(long, env = "MQTT_RECONNECT_SECS", default_value_t = DEFAULT_RECONNECT_DELAY.as_secs())]
    mqtt_reconnect_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (publisher, mqtt): (Arc<dyn Publisher>, Option<Arc<MqttPublisher>>) = if args.dry_run {
        log::info!("dry run: summaries are logged, not published");
        (Arc::new(LogPublisher), None)
    } else {
        let mqtt = Arc::new(connect_mqtt(&args)?);
        let publisher: Arc<dyn Publisher> = mqtt.clone();
        (publisher, Some(mqtt))
    };

    let store = FrameStore::new(&args.output_dir);
    let orchestrator = ScanOrchestrator::new(
        Arc::new(CameraClient::new(Duration::from_secs(args.fetch_timeout_secs))),
        DetectorAdapter::new(store.clone()),
        publisher,
    );
    let controller = Arc::new(PipelineController::new(
        orchestrator,
        Arc::new(DefaultModelLoader),
    )?);

    let api_handle = if args.no_api {
        None
    } else {
        let api_config = ApiConfig {
            addr: args.api_addr.clone(),
        };
        Some(ApiServer::new(api_config, controller.clone(), store).spawn()?)
    };

    let watcher = ConfigWatcher::new(&args.config, controller.clone())
        .spawn(Duration::from_secs(args.config_poll_secs.max(1)))?;
    log::info!(
        "{} running: config {}, frames under {}",
        DAEMON_NAME,
        args.config.display(),
        args.output_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("{} waiting for shutdown signal (Ctrl-C)...", DAEMON_NAME);
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    watcher.stop();
    controller.shutdown();
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    if let Some(mqtt) = mqtt {
        mqtt.disconnect()?;
    }
    Ok(())
}

fn connect_mqtt(args: &Args) -> Result<MqttPublisher> {
    let endpoint = MqttEndpoint::parse(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;
    let settings = MqttSettings {
        endpoint,
        tls,
        client_id: args.mqtt_client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
        topic_prefix: args.mqtt_topic_prefix.clone(),
        reconnect_delay: Duration::from_secs(args.mqtt_reconnect_secs.max(1)),
    };
    MqttPublisher::connect(&settings)
}
