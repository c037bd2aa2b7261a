mod core;
mod http;
mod mpv;
mod output;
mod socket;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tuner_proto::config::Config;
use tuner_proto::session::SessionController;
use tuner_proto::store::StationStore;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// A newly raised user-facing playback error.
    Error(String),
    Log(String),
}

/// Forwards WARN and ERROR events to connected clients as `Log` messages.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn init_logging(config: &Config, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> anyhow::Result<()> {
    let log_path = &config.daemon.log_file;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(BroadcastLayer {
            sender: broadcast_tx,
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tuner_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the logging layer can use it.
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let config = Config::load()?;
    init_logging(&config, broadcast_tx.clone())?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Every input funnels into SessionCore through this channel.
    let (event_tx, event_rx) = mpsc::channel::<core::SessionEvent>(256);

    let store = Arc::new(StationStore::new(config.stations.json_file.clone()));
    if let Err(e) = core::seed_store_from_toml(&store, &config.stations.toml_file).await {
        warn!("Could not seed stations from {:?}: {}", config.stations.toml_file, e);
    }

    let (output, output_worker) = output::MpvOutput::spawn(config.mpv.clone(), event_tx.clone());
    let controller = SessionController::with_volume(output, config.session.initial_volume);
    let mut session = core::SessionCore::new(controller, store.clone(), broadcast_tx.clone());
    if let Err(e) = session.reload_catalog().await {
        warn!("Starting with an empty catalog: {}", e);
    }

    let snapshot = session.snapshot_handle();

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        snapshot.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            snapshot.clone(),
            store.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(core::SessionEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    session.run(event_rx).await?;

    // Disposing the session queued a release; wait for mpv to be stopped.
    if let Err(e) = output_worker.await {
        warn!("Output worker ended abnormally: {}", e);
    }
    Ok(())
}
