use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use paintboard_core::board::Board;
use paintboard_core::new_ulid;
use paintboard_core::scheduler::Scheduler;
use paintboard_core::throttle::RequestThrottle;
use paintboard_daemon::config::DaemonConfig;
use paintboard_daemon::directory::FileDirectory;
use paintboard_daemon::http::{self, AppState};
use paintboard_daemon::remote::{RemoteCanvas, RemotePaint, Routes};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LISTEN: &str = "127.0.0.1:8001";

#[derive(Parser, Debug)]
#[command(name = "paintboard-daemon", version, about = "Paints queued images onto the shared board")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Monitor listen address. Overrides the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// JSON file listing tasks and credentials.
    #[arg(long, default_value = "paintboard.json")]
    state: PathBuf,

    #[arg(long)]
    board_url: Option<String>,

    #[arg(long)]
    paint_url: Option<String>,

    #[arg(long)]
    websocket_url: Option<String>,

    /// Local address to send requests from. Repeat for several routes.
    #[arg(long = "egress")]
    egress: Vec<IpAddr>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

impl Cli {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        if let Some(url) = &self.board_url {
            config.remote.board_url = url.clone();
        }
        if let Some(url) = &self.paint_url {
            config.remote.paint_url = url.clone();
        }
        if let Some(url) = &self.websocket_url {
            config.remote.websocket_url = url.clone();
        }
        if !self.egress.is_empty() {
            config.remote.egress = self.egress.clone();
            config.engine.throttle.routes = self.egress.len();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = DaemonConfig::load(cli.config.as_deref()).await?;
    cli.apply(&mut config);
    config.engine.validate()?;
    let engine = config.engine.clone();
    let instance = new_ulid();
    info!(
        %instance,
        width = engine.width,
        height = engine.height,
        routes = engine.throttle.routes,
        "daemon starting"
    );

    let routes = Routes::new(&config.remote.egress, config.remote.request_timeout())?;
    let canvas = Arc::new(RemoteCanvas::new(routes.clone(), &config.remote));
    let api = Arc::new(RemotePaint::new(routes, &config.remote, engine.width, engine.height));

    let directory = FileDirectory::new(&cli.state);
    let summary = directory.reload().await?;
    info!(path = %cli.state.display(), tasks = summary.added, credentials = summary.credentials_added, "state loaded");
    let reload = directory.spawn_reload(engine.reconcile_interval());

    let board = Board::new(canvas, &engine);
    let throttle = Arc::new(RequestThrottle::new(&engine.throttle));
    let scheduler = Scheduler::new(
        engine,
        board.clone(),
        throttle,
        api,
        directory.clone(),
        directory,
    );
    let membership = tokio::spawn(scheduler.clone().run());

    let app = http::router(AppState {
        scheduler: scheduler.clone(),
        instance,
    });
    let listen = match config.listen {
        Some(listen) => listen,
        None => DEFAULT_LISTEN.parse()?,
    };
    info!(listen = %listen, "monitor listening");
    axum::serve(tokio::net::TcpListener::bind(listen).await?, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    reload.abort();
    membership.await?;
    board.close();
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
    scheduler.shutdown();
}
