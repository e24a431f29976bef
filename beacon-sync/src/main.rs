use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use beacon_core::{Collection, Group, SyncStatus};
use beacon_sync::{
    ChannelState, CycleOutcome, EngineConfig, NewGroup, SyncEngine, SyncObserver,
    default_config_path, load_config, logging::init_logging, save_config,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beacon-sync", about = "Offline-first sync client")]
struct Cli {
    /// Defaults to $BEACON_CONFIG_DIR/config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    socket_url: Option<String>,
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes a new config file from --server-url, --socket-url and --token.
    Init {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        store_path: Option<PathBuf>,
    },
    /// Runs one push/pull cycle.
    Sync,
    /// Prints the aggregated sync status and queue contents.
    Status,
    CreateGroup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Send {
        #[arg(long)]
        group: String,
        #[arg(long)]
        body: String,
    },
    SetStatus {
        #[arg(long)]
        status: String,
        #[arg(long)]
        message: Option<String>,
    },
    /// Keeps the realtime channel open and syncs periodically until Ctrl-C.
    Watch {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
}

struct LogObserver;

impl SyncObserver for LogObserver {
    fn on_status_change(&self, status: &SyncStatus) {
        info!(overall = ?status.overall, "sync status changed");
    }

    fn on_channel_state(&self, state: ChannelState) {
        info!(?state, "realtime channel");
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    device_id: &'a str,
    server_url: &'a str,
    status: SyncStatus,
    pending_mutations: usize,
    checkpoints: BTreeMap<Collection, String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    if let Err(err) = run(cli, config_path).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config_path: PathBuf) -> Result<(), String> {
    let Cli {
        server_url,
        socket_url,
        token,
        command,
        ..
    } = cli;
    let command = match command {
        Command::Init {
            device_id,
            store_path,
        } => {
            let (Some(server_url), Some(socket_url), Some(token)) = (server_url, socket_url, token)
            else {
                return Err("init needs --server-url, --socket-url and --token".to_owned());
            };
            let mut config = EngineConfig::new(server_url, socket_url, device_id, token);
            config.store_path = store_path;
            save_config(&config_path, &config).map_err(|err| err.to_string())?;
            info!(path = %config_path.display(), "config written");
            return Ok(());
        }
        command => command,
    };

    let mut config = load_config(&config_path).map_err(|err| err.to_string())?;
    if let Some(server_url) = server_url {
        config.server_url = server_url;
    }
    if let Some(socket_url) = socket_url {
        config.socket_url = socket_url;
    }
    if let Some(token) = token {
        config.token = token;
    }
    let engine = SyncEngine::open_http(config).map_err(|err| err.to_string())?;
    engine.register_observer(Arc::new(LogObserver));

    match command {
        Command::Init { .. } => Ok(()),
        Command::Sync => {
            let outcome = engine.sync_now().await;
            print_outcome(&outcome)
        }
        Command::Status => {
            let report = StatusReport {
                device_id: &engine.config().device_id,
                server_url: &engine.config().server_url,
                status: engine.status(),
                pending_mutations: engine.queue().list_pending().len(),
                checkpoints: engine.store().checkpoints(),
            };
            print_json(&report)
        }
        Command::CreateGroup { name, description } => {
            let group = engine
                .writer()
                .create_group(NewGroup {
                    name,
                    description,
                    ..NewGroup::default()
                })
                .map_err(|err| err.to_string())?;
            print_json(&group)
        }
        Command::Send { group, body } => {
            let message = engine
                .send_message(&group, body)
                .map_err(|err| err.to_string())?;
            print_json(&message)
        }
        Command::SetStatus { status, message } => {
            let record = engine
                .writer()
                .update_status(status, message)
                .map_err(|err| err.to_string())?;
            print_json(&record)
        }
        Command::Watch { interval_secs } => watch(&engine, interval_secs).await,
    }
}

async fn watch(engine: &SyncEngine, interval_secs: u64) -> Result<(), String> {
    let groups = engine
        .store()
        .query(|g: &Group| g.confirmed)
        .into_iter()
        .map(|g| g.id);
    engine.set_active_groups(groups);
    engine.start_realtime();
    let periodic = engine
        .orchestrator()
        .spawn_periodic(Duration::from_secs(interval_secs.max(1)));

    info!("watching, press Ctrl-C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {err}");
    }

    periodic.abort();
    engine.stop_realtime().await;
    info!("stopped");
    Ok(())
}

fn print_outcome(outcome: &CycleOutcome) -> Result<(), String> {
    match outcome {
        CycleOutcome::Completed(report) => print_json(report),
        CycleOutcome::Skipped(reason) => {
            println!("sync skipped: {reason:?}");
            Ok(())
        }
        CycleOutcome::Failed { report, error } => {
            print_json(report)?;
            Err(format!("sync failed: {error}"))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{text}");
    Ok(())
}
