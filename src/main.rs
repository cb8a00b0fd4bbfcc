use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobforge::config::Config;
use jobforge::history::HistoryStore;
use jobforge::queue::QueueManager;
use jobforge::runner::{CommandRunner, FakeRunner, Runner};
use jobforge::server::{self, AppState};
use jobforge::shutdown::Shutdown;
use jobforge::store::Store;

#[derive(Parser, Debug)]
#[command(name = "jobforge")]
#[command(about = "Remote build queue that runs uploaded source bundles through an external tool")]
struct Args {
    /// Override JOBFORGE_LISTEN_ADDR
    #[arg(long)]
    listen_addr: Option<String>,

    /// Wire the fake runner instead of the external tool
    #[arg(long)]
    use_fake_runner: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = Config::from_env()?;
    if let Some(listen_addr) = args.listen_addr {
        cfg.listen_addr = listen_addr;
    }
    if args.use_fake_runner {
        cfg.use_fake_runner = true;
    }

    let addr: SocketAddr = cfg.listen_addr.parse()?;
    let runner: Arc<dyn Runner> = if cfg.use_fake_runner {
        tracing::info!("Using fake runner");
        Arc::new(FakeRunner::new())
    } else {
        tracing::info!(tool_bin = %cfg.tool_bin, "Using external tool runner");
        Arc::new(CommandRunner::new(cfg.tool_bin.clone()))
    };

    let shutdown = Shutdown::install();
    let token = shutdown.token();

    let store = Store::new(cfg.clone());
    let history = HistoryStore::new(cfg.history_path(), cfg.history_limit);
    let manager = Arc::new(QueueManager::new(
        cfg.clone(),
        store,
        runner,
        history,
    ));
    manager.start(token.clone()).await?;

    let state = AppState {
        manager,
        cfg: Arc::new(cfg),
        shutdown: token.clone(),
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting jobforge server");

    let drain_token = token.clone();
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain_token.cancelled().await });

    tokio::select! {
        result = async move { serve.await } => result?,
        _ = shutdown.grace_expired() => {
            tracing::warn!("Graceful shutdown period elapsed; exiting");
        }
    }

    Ok(())
}
