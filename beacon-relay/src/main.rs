use beacon_relay::{AppState, DEFAULT_PAGE_LIMIT, RelayOptions, serve};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beacon-relay")]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
    /// Require this exact token from clients.
    #[arg(long)]
    token: Option<String>,
    /// Assign server ids to created groups.
    #[arg(long)]
    reassign_group_ids: bool,
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    page_limit: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let state = AppState::with_options(RelayOptions {
        token: args.token,
        reassign_group_ids: args.reassign_group_ids,
        page_limit: args.page_limit.max(1),
    });
    info!("relay starting on {}", args.bind_address);
    if let Err(err) = serve(listener, state).await {
        warn!("relay server exited: {}", err);
    }
}
