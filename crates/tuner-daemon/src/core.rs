/// SessionCore — single-owner event loop for the playback session.
///
/// Every input (client commands from the socket and HTTP servers, output
/// notices from the mpv worker, catalog reloads after admin edits) arrives as a
/// [`SessionEvent`] on one mpsc channel.  Only this loop touches the
/// [`SessionController`]; everyone else reads the published snapshot.
///
/// After each event whose handling bumped the controller's revision the
/// snapshot is copied into [`SharedSnapshot`] and
/// `BroadcastMessage::StateUpdated` goes out to all listeners.
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use tuner_proto::output::{AudioOutput, OutputNotice};
use tuner_proto::protocol::Command;
use tuner_proto::session::{SessionController, SessionSnapshot};
use tuner_proto::station::{load_stations_from_toml, StationId};
use tuner_proto::store::StationStore;

use crate::BroadcastMessage;

pub type SharedSnapshot = Arc<RwLock<SessionSnapshot>>;

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command from a socket client or the HTTP API.
    Command(Command),
    /// Lifecycle notice from the audio output worker.
    Output(OutputNotice),
    /// The station store changed; re-read the active catalog.
    ReloadCatalog,
    Shutdown,
}

pub struct SessionCore<O: AudioOutput> {
    controller: SessionController<O>,
    store: Arc<StationStore>,
    snapshot: SharedSnapshot,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Revision last written to `snapshot`.
    last_rev: u64,
    /// Error message last announced, so each one is broadcast once.
    last_error: Option<String>,
}

impl<O: AudioOutput> SessionCore<O> {
    pub fn new(
        controller: SessionController<O>,
        store: Arc<StationStore>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(controller.snapshot()));
        let last_rev = controller.rev();
        Self {
            controller,
            store,
            snapshot,
            broadcast_tx,
            last_rev,
            last_error: None,
        }
    }

    /// Read side for the socket and HTTP servers.
    pub fn snapshot_handle(&self) -> SharedSnapshot {
        Arc::clone(&self.snapshot)
    }

    /// Replace the session catalog with the store's active stations.
    pub async fn reload_catalog(&mut self) -> anyhow::Result<()> {
        let stations = self.store.list_active().await?;
        info!("SessionCore: catalog reloaded, {} stations", stations.len());
        self.controller.set_stations(stations);
        self.publish().await;
        Ok(())
    }

    /// Run until `Shutdown` arrives or every sender is gone, then dispose the
    /// controller, which releases the output.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) -> anyhow::Result<()> {
        info!("SessionCore: starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("SessionCore: event channel closed, shutting down");
                    break;
                }
                Some(SessionEvent::Shutdown) => {
                    info!("SessionCore: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.controller.dispose();
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::Command(cmd) => {
                info!("SessionCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            SessionEvent::Output(notice) => {
                debug!("SessionCore: output {:?}", notice.event);
                self.controller.handle_output(notice);
            }
            SessionEvent::ReloadCatalog => {
                if let Err(e) = self.reload_catalog().await {
                    error!("SessionCore: catalog reload failed: {}", e);
                }
            }
            SessionEvent::Shutdown => {}
        }
        self.publish().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play { station_id: None } => self.controller.play(None),
            Command::Play {
                station_id: Some(id),
            } => match self.resolve_station(&id).await {
                Some(station) => self.controller.play(Some(station)),
                None => warn!("SessionCore: play for unknown station {}", id),
            },
            Command::Pause => self.controller.pause(),
            Command::Stop => self.controller.stop(),
            Command::Next => self.controller.next(),
            Command::Previous => self.controller.previous(),
            Command::SetVolume { value } => self.controller.set_volume(value),
            Command::ToggleMute => self.controller.toggle_mute(),
            Command::ReloadStations => {
                if let Err(e) = self.reload_catalog().await {
                    error!("SessionCore: catalog reload failed: {}", e);
                }
            }
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        }
    }

    /// Catalog first; a station added to the store since the last reload is
    /// still playable, just without a catalog position.
    async fn resolve_station(&self, id: &StationId) -> Option<tuner_proto::station::Station> {
        if let Some(station) = self.controller.find_station(id) {
            return Some(station.clone());
        }
        match self.store.get(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!("SessionCore: store lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    async fn publish(&mut self) {
        let rev = self.controller.rev();
        if rev == self.last_rev {
            return;
        }
        self.last_rev = rev;

        let snapshot = self.controller.snapshot();
        let error = snapshot.error.clone();
        *self.snapshot.write().await = snapshot;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);

        if error != self.last_error {
            if let Some(message) = &error {
                warn!("SessionCore: playback error: {}", message);
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::Error(message.clone()));
            }
            self.last_error = error;
        }
    }
}

/// Seed an absent JSON store from the hand-written TOML list, if there is one.
pub async fn seed_store_from_toml(store: &StationStore, toml_file: &Path) -> anyhow::Result<()> {
    if store.exists() || !toml_file.exists() {
        return Ok(());
    }
    let stations = load_stations_from_toml(toml_file)?;
    info!(
        "Seeding {} with {} stations from {}",
        store.path().display(),
        stations.len(),
        toml_file.display()
    );
    store.seed(&stations).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tuner_proto::output::{OutputEvent, Ticket};
    use tuner_proto::session::PlaybackPhase;
    use tuner_proto::station::StationDraft;

    /// Remembers the last ticket handed to `start`.
    #[derive(Clone, Default)]
    struct TicketOutput {
        started: Arc<Mutex<Option<Ticket>>>,
        released: Arc<Mutex<bool>>,
    }

    impl AudioOutput for TicketOutput {
        fn assign(&mut self, _ticket: &Ticket, _url: &str) {}
        fn start(&mut self, ticket: &Ticket) {
            *self.started.lock().unwrap() = Some(ticket.clone());
        }
        fn request_stop(&mut self) {}
        fn reset_position(&mut self) {}
        fn detach(&mut self) {}
        fn set_level(&mut self, _level: f32) {}
        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    async fn fixture(
        dir: &TempDir,
        names: &[&str],
    ) -> (
        SessionCore<TicketOutput>,
        TicketOutput,
        broadcast::Receiver<BroadcastMessage>,
    ) {
        let store = Arc::new(StationStore::new(dir.path().join("stations.json")));
        for name in names {
            store
                .create(StationDraft {
                    name: name.to_string(),
                    genre: "Pop".into(),
                    stream_url: format!("https://streams.example.com/{}", name),
                    ..StationDraft::default()
                })
                .await
                .unwrap();
        }
        let output = TicketOutput::default();
        let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
        let mut core = SessionCore::new(
            SessionController::new(output.clone()),
            store,
            broadcast_tx,
        );
        core.reload_catalog().await.unwrap();
        (core, output, broadcast_rx)
    }

    #[tokio::test]
    async fn test_reload_publishes_catalog() {
        let dir = TempDir::new().unwrap();
        let (core, _, mut rx) = fixture(&dir, &["uno", "dos"]).await;

        let snap = core.snapshot_handle().read().await.clone();
        assert_eq!(snap.stations.len(), 2);
        assert!(matches!(rx.try_recv(), Ok(BroadcastMessage::StateUpdated)));
    }

    #[tokio::test]
    async fn test_play_and_confirm() {
        let dir = TempDir::new().unwrap();
        let (mut core, output, _rx) = fixture(&dir, &["uno", "dos"]).await;
        let id = core.snapshot_handle().read().await.stations[1].id.clone();

        core.handle_event(SessionEvent::Command(Command::Play {
            station_id: Some(id.clone()),
        }))
        .await;
        {
            let snap = core.snapshot_handle();
            let snap = snap.read().await;
            assert_eq!(snap.phase, PlaybackPhase::Loading);
            assert_eq!(snap.current_index, Some(1));
        }

        let ticket = output.started.lock().unwrap().clone().unwrap();
        core.handle_event(SessionEvent::Output(OutputNotice::new(
            ticket,
            OutputEvent::Playing,
        )))
        .await;
        let snap = core.snapshot_handle().read().await.clone();
        assert!(snap.is_playing);
        assert!(snap.is_playing_station(&id));
    }

    #[tokio::test]
    async fn test_unknown_station_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (mut core, output, _rx) = fixture(&dir, &["uno"]).await;
        let before = core.snapshot_handle().read().await.rev;

        core.handle_event(SessionEvent::Command(Command::Play {
            station_id: Some("station-0".into()),
        }))
        .await;
        assert_eq!(core.snapshot_handle().read().await.rev, before);
        assert!(output.started.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_is_broadcast_once() {
        let dir = TempDir::new().unwrap();
        let (mut core, output, mut rx) = fixture(&dir, &["uno"]).await;
        core.handle_event(SessionEvent::Command(Command::Next)).await;
        let ticket = output.started.lock().unwrap().clone().unwrap();
        while rx.try_recv().is_ok() {}

        let failure = OutputNotice::new(
            ticket,
            OutputEvent::Error(tuner_proto::output::MediaErrorCode::Network),
        );
        core.handle_event(SessionEvent::Output(failure.clone())).await;
        core.handle_event(SessionEvent::Output(failure)).await;

        let mut errors = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let BroadcastMessage::Error(message) = msg {
                errors.push(message);
            }
        }
        assert_eq!(
            errors,
            vec!["Network error while attempting to play this station.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_shutdown_releases_output() {
        let dir = TempDir::new().unwrap();
        let (core, output, _rx) = fixture(&dir, &["uno"]).await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(SessionEvent::Shutdown).await.unwrap();

        core.run(rx).await.unwrap();
        assert!(*output.released.lock().unwrap());
    }

    #[tokio::test]
    async fn test_seed_from_toml() {
        let dir = TempDir::new().unwrap();
        let toml_file = dir.path().join("stations.toml");
        std::fs::write(
            &toml_file,
            "[[station]]\nname = \"Uno\"\nurl = \"http://uno\"\n",
        )
        .unwrap();
        let store = StationStore::new(dir.path().join("data").join("stations.json"));

        seed_store_from_toml(&store, &toml_file).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        // An existing store is left alone.
        seed_store_from_toml(&store, &toml_file).await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
