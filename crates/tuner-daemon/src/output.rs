/// mpv-backed [`AudioOutput`].
///
/// The trait methods only queue an [`OutputRequest`]; a worker task owns the
/// mpv process and the IPC handle, translates requests into IPC commands and
/// turns mpv's property changes and `end-file` events back into
/// [`OutputNotice`]s on the session event channel.
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tuner_proto::config::MpvConfig;
use tuner_proto::output::{AudioOutput, MediaErrorCode, OutputEvent, OutputNotice, Ticket};

use crate::core::SessionEvent;
use crate::mpv::{MpvEvent, MpvHandle, MpvProcess, OBS_CORE_IDLE, OBS_PAUSE};

const LIVENESS_INTERVAL_SECS: u64 = 10;

#[derive(Debug)]
enum OutputRequest {
    Assign { ticket: Ticket, url: String },
    Start(Ticket),
    Stop,
    Rewind,
    Detach,
    Level(f32),
    Release,
}

pub struct MpvOutput {
    tx: mpsc::UnboundedSender<OutputRequest>,
    released: bool,
}

impl MpvOutput {
    /// Start the worker.  mpv itself is only spawned on the first assign.
    ///
    /// The returned handle completes once the worker has processed `release`
    /// and mpv is gone.
    pub fn spawn(
        config: MpvConfig,
        notices: mpsc::Sender<SessionEvent>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config, notices);
        let join = tokio::spawn(worker.run(rx));
        let output = Self {
            tx,
            released: false,
        };
        (output, join)
    }

    fn request(&self, req: OutputRequest) {
        if self.released {
            return;
        }
        if let Err(e) = self.tx.send(req) {
            debug!("output: worker gone, dropping {:?}", e.0);
        }
    }
}

impl AudioOutput for MpvOutput {
    fn assign(&mut self, ticket: &Ticket, url: &str) {
        self.request(OutputRequest::Assign {
            ticket: ticket.clone(),
            url: url.to_string(),
        });
    }

    fn start(&mut self, ticket: &Ticket) {
        self.request(OutputRequest::Start(ticket.clone()));
    }

    fn request_stop(&mut self) {
        self.request(OutputRequest::Stop);
    }

    fn reset_position(&mut self) {
        self.request(OutputRequest::Rewind);
    }

    fn detach(&mut self) {
        self.request(OutputRequest::Detach);
    }

    fn set_level(&mut self, level: f32) {
        self.request(OutputRequest::Level(level));
    }

    fn release(&mut self) {
        self.request(OutputRequest::Release);
        self.released = true;
    }
}

/// Map mpv's `file_error` string of an `end-file` event onto the closed
/// failure taxonomy.
pub fn media_error_from_mpv(file_error: Option<&str>) -> MediaErrorCode {
    let Some(raw) = file_error else {
        return MediaErrorCode::Unknown;
    };
    let err = raw.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| err.contains(n));

    if has(&["network", "http", "tcp", "timed out", "timeout", "connection"]) {
        MediaErrorCode::Network
    } else if has(&["format", "codec", "decod", "no audio or video data"]) {
        MediaErrorCode::Decode
    } else if has(&["loading failed", "no such file", "nothing to play", "unsupported"]) {
        MediaErrorCode::SourceNotSupported
    } else if has(&["abort"]) {
        MediaErrorCode::Aborted
    } else {
        MediaErrorCode::Unknown
    }
}

struct Worker {
    process: MpvProcess,
    handle: Option<MpvHandle>,
    mpv_tx: mpsc::Sender<MpvEvent>,
    mpv_rx: mpsc::Receiver<MpvEvent>,
    notices: mpsc::Sender<SessionEvent>,
    connect_timeout: Duration,

    ticket: Option<Ticket>,
    url: Option<String>,
    /// mpv currently holds `url` (loadfile succeeded, no end-file since).
    loaded: bool,
    /// mpv playlist entry of the file loaded for `ticket`.  Events about any
    /// other entry belong to an earlier attempt.
    entry: Option<i64>,
    /// Entry of the most recent `start-file`.
    started_entry: Option<i64>,
    /// Set by a start, cleared once audio flows or the attempt fails.
    deadline: Option<Instant>,
    /// Audio confirmed and not paused since.
    audible: bool,
    core_idle: Option<bool>,
    level: f32,
}

impl Worker {
    fn new(config: MpvConfig, notices: mpsc::Sender<SessionEvent>) -> Self {
        let (mpv_tx, mpv_rx) = mpsc::channel(256);
        Self {
            process: MpvProcess::new(config.binary),
            handle: None,
            mpv_tx,
            mpv_rx,
            notices,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            ticket: None,
            url: None,
            loaded: false,
            entry: None,
            started_entry: None,
            deadline: None,
            audible: false,
            core_idle: None,
            level: 0.8,
        }
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<OutputRequest>) {
        let mut liveness =
            tokio::time::interval(Duration::from_secs(LIVENESS_INTERVAL_SECS));

        loop {
            let deadline = self.deadline;
            // mpv events first, so a request never acts on an outdated view.
            tokio::select! {
                biased;
                Some(evt) = self.mpv_rx.recv() => self.handle_mpv_event(evt).await,
                req = requests.recv() => match req {
                    None | Some(OutputRequest::Release) => break,
                    Some(req) => self.handle_request(req).await,
                },
                _ = wait_until(deadline) => self.connect_timed_out().await,
                _ = liveness.tick() => self.check_process().await,
            }
        }

        if let Some(h) = self.handle.take() {
            let _ = h.stop().await;
        }
        self.process.kill().await;
        info!("output: released");
    }

    async fn handle_request(&mut self, req: OutputRequest) {
        debug!("output: {:?}", req);
        match req {
            OutputRequest::Assign { ticket, url } => {
                self.ticket = Some(ticket);
                self.url = Some(url);
                self.loaded = false;
                self.entry = None;
                self.deadline = None;
                self.audible = false;
                // A failed load is retried, and reported, by the start that follows.
                match self.load().await {
                    Ok(()) => self.emit(OutputEvent::LoadStart).await,
                    Err(e) => warn!("output: load failed: {}", e),
                }
            }
            OutputRequest::Start(ticket) => {
                self.ticket = Some(ticket);
                self.audible = false;
                match self.begin_playback().await {
                    Ok(()) => self.deadline = Some(Instant::now() + self.connect_timeout),
                    Err(e) => {
                        warn!("output: start rejected: {}", e);
                        self.deadline = None;
                        self.emit(OutputEvent::StartRejected(e.to_string())).await;
                    }
                }
            }
            OutputRequest::Stop => {
                self.deadline = None;
                self.audible = false;
                if let Some(h) = &self.handle {
                    if let Err(e) = h.set_pause(true).await {
                        warn!("output: pause failed: {}", e);
                    }
                }
            }
            OutputRequest::Rewind => {
                if let Some(h) = &self.handle {
                    // Live streams are not seekable.
                    if let Err(e) = h.rewind().await {
                        debug!("output: rewind ignored: {}", e);
                    }
                }
            }
            OutputRequest::Detach => {
                self.ticket = None;
                self.url = None;
                self.loaded = false;
                self.entry = None;
                self.deadline = None;
                self.audible = false;
                if let Some(h) = &self.handle {
                    if let Err(e) = h.stop().await {
                        warn!("output: stop failed: {}", e);
                    }
                }
            }
            OutputRequest::Level(level) => {
                self.level = level.clamp(0.0, 1.0);
                self.process.initial_level = self.level;
                if let Some(h) = &self.handle {
                    if let Err(e) = h.set_volume(self.level).await {
                        warn!("output: set volume failed: {}", e);
                    }
                }
            }
            OutputRequest::Release => {}
        }
    }

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_CORE_IDLE => {
                    let idle = data.as_bool();
                    if idle != self.core_idle {
                        debug!("mpv: core-idle → {:?}", idle);
                        self.core_idle = idle;
                    }
                    if idle == Some(false) && self.deadline.is_some() {
                        if self.playing_ours() {
                            self.confirm_audio().await;
                        } else {
                            debug!("mpv: audio from entry {:?} is not ours", self.started_entry);
                        }
                    }
                }
                OBS_PAUSE => {
                    if data.as_bool() == Some(true) && self.audible {
                        self.audible = false;
                        self.emit(OutputEvent::Paused).await;
                    }
                }
                _ => {}
            }
            return;
        }

        if evt.event_name() == Some("start-file") {
            debug!("mpv: start-file entry {:?}", evt.entry_id());
            self.started_entry = evt.entry_id();
            return;
        }

        let Some((reason, file_error)) = evt.end_file() else {
            return;
        };
        info!(
            "mpv: end-file entry={:?} reason={} error={:?}",
            evt.entry_id(),
            reason,
            file_error
        );
        if matches!(reason, "eof" | "error") && !self.owns_entry(evt.entry_id()) {
            debug!("mpv: end-file for an earlier attempt dropped");
            return;
        }
        match reason {
            "eof" => {
                self.settle();
                self.emit(OutputEvent::Ended).await;
            }
            "error" => {
                let code = media_error_from_mpv(file_error);
                self.settle();
                self.emit(OutputEvent::Error(code)).await;
            }
            "quit" => {
                let was_active = self.deadline.is_some() || self.audible;
                self.settle();
                self.handle = None;
                self.core_idle = None;
                if was_active {
                    self.emit(OutputEvent::Error(MediaErrorCode::Unknown)).await;
                }
            }
            // stop: replaced or stopped by us; redirect: mpv follows it itself.
            _ => {}
        }
    }

    async fn connect_timed_out(&mut self) {
        self.deadline = None;
        warn!(
            "output: no audio after {}s, giving up",
            self.connect_timeout.as_secs()
        );
        if let Some(h) = &self.handle {
            let _ = h.stop().await;
        }
        self.loaded = false;
        self.entry = None;
        self.emit(OutputEvent::Error(MediaErrorCode::Network)).await;
    }

    async fn check_process(&mut self) {
        if self.handle.is_none() || self.process.alive() {
            return;
        }
        warn!("output: mpv process died");
        let was_active = self.deadline.is_some() || self.audible;
        self.settle();
        self.handle = None;
        self.core_idle = None;
        if was_active {
            self.emit(OutputEvent::Error(MediaErrorCode::Unknown)).await;
        }
    }

    /// Whether an `end-file` about `entry` concerns the current attempt.
    /// Without entry ids (old mpv) anything that ends a loaded file counts.
    fn owns_entry(&self, entry: Option<i64>) -> bool {
        if !self.loaded {
            return false;
        }
        match self.entry {
            Some(ours) => entry == Some(ours),
            None => true,
        }
    }

    /// Whether the file mpv last started is the one loaded for the ticket.
    fn playing_ours(&self) -> bool {
        if !self.loaded {
            return false;
        }
        match self.entry {
            Some(ours) => self.started_entry == Some(ours),
            None => true,
        }
    }

    /// The source is gone from mpv; nothing is pending or audible.
    fn settle(&mut self) {
        self.loaded = false;
        self.entry = None;
        self.deadline = None;
        self.audible = false;
    }

    async fn confirm_audio(&mut self) {
        self.deadline = None;
        self.audible = true;
        self.emit(OutputEvent::CanPlay).await;
        self.emit(OutputEvent::Playing).await;
    }

    async fn begin_playback(&mut self) -> anyhow::Result<()> {
        if !self.loaded {
            self.load().await?;
        }
        let handle = self.ensure_handle().await?;
        handle.set_pause(false).await
    }

    async fn load(&mut self) -> anyhow::Result<()> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no source assigned"))?;
        let handle = self.ensure_handle().await?;
        self.entry = handle.load_paused(&url).await?;
        self.loaded = true;
        Ok(())
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.handle.is_some() && !self.process.alive() {
            warn!("output: mpv process died, reconnecting");
            self.handle = None;
            self.loaded = false;
            self.entry = None;
            self.core_idle = None;
        }
        if let Some(h) = &self.handle {
            return Ok(h.clone());
        }

        let handle = self.process.spawn_and_connect(self.mpv_tx.clone()).await?;
        handle.observe_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn emit(&self, event: OutputEvent) {
        let Some(ticket) = self.ticket.clone() else {
            debug!("output: no ticket, dropping {:?}", event);
            return;
        };
        let notice = OutputNotice::new(ticket, event);
        if self.notices.send(SessionEvent::Output(notice)).await.is_err() {
            debug!("output: session loop gone");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn new_worker() -> (Worker, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let config = MpvConfig {
            binary: Some(PathBuf::from("/nonexistent/tuner-test/mpv")),
            ..MpvConfig::default()
        };
        (Worker::new(config, tx), rx)
    }

    fn ticket(station: &str, attempt: u64) -> Ticket {
        Ticket {
            station_id: station.into(),
            attempt,
        }
    }

    fn mpv(raw: serde_json::Value) -> MpvEvent {
        MpvEvent { raw }
    }

    /// State after a successful assign and start of playlist entry `entry`.
    fn started(worker: &mut Worker, ticket: Ticket, entry: i64) {
        worker.ticket = Some(ticket);
        worker.url = Some("https://streams.example.com/b".to_string());
        worker.loaded = true;
        worker.entry = Some(entry);
        worker.deadline = Some(Instant::now() + worker.connect_timeout);
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<(Ticket, OutputEvent)> {
        let mut out = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            if let SessionEvent::Output(notice) = evt {
                out.push((notice.ticket, notice.event));
            }
        }
        out
    }

    async fn confirm(worker: &mut Worker, entry: i64) {
        worker
            .handle_mpv_event(mpv(json!({"event": "start-file", "playlist_entry_id": entry})))
            .await;
        worker
            .handle_mpv_event(mpv(json!({"event": "property-change", "id": OBS_CORE_IDLE, "name": "core-idle", "data": false})))
            .await;
    }

    #[tokio::test]
    async fn test_end_file_of_replaced_station_is_not_reported() {
        let (mut worker, mut rx) = new_worker();
        worker.ticket = Some(ticket("a", 1));
        worker.loaded = true;
        worker.entry = Some(1);

        // mpv cannot be spawned here, so the load for B fails and nothing is loaded.
        worker
            .handle_request(OutputRequest::Assign {
                ticket: ticket("b", 2),
                url: "https://streams.example.com/b".to_string(),
            })
            .await;
        worker
            .handle_mpv_event(mpv(json!({"event": "end-file", "reason": "error", "file_error": "loading failed"})))
            .await;
        worker
            .handle_mpv_event(mpv(json!({"event": "end-file", "reason": "error", "file_error": "loading failed", "playlist_entry_id": 1})))
            .await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_end_file_is_matched_by_playlist_entry() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);

        worker
            .handle_mpv_event(mpv(json!({"event": "end-file", "reason": "error", "file_error": "network error", "playlist_entry_id": 1})))
            .await;
        assert!(drain(&mut rx).is_empty());
        assert!(worker.loaded);

        worker
            .handle_mpv_event(mpv(json!({"event": "end-file", "reason": "error", "file_error": "loading failed", "playlist_entry_id": 2})))
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![(
                ticket("b", 2),
                OutputEvent::Error(MediaErrorCode::SourceNotSupported)
            )]
        );
        assert!(!worker.loaded);
    }

    #[tokio::test]
    async fn test_first_audio_confirms_playing() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);

        confirm(&mut worker, 2).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                (ticket("b", 2), OutputEvent::CanPlay),
                (ticket("b", 2), OutputEvent::Playing),
            ]
        );
        assert!(worker.audible);
        assert!(worker.deadline.is_none());

        // Already confirmed: further core-idle flips stay quiet.
        confirm(&mut worker, 2).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_audio_from_previous_entry_does_not_confirm() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);

        confirm(&mut worker, 1).await;
        assert!(drain(&mut rx).is_empty());
        assert!(worker.deadline.is_some());
        assert!(!worker.audible);
    }

    #[tokio::test]
    async fn test_pause_while_audible_emits_paused() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);
        confirm(&mut worker, 2).await;
        drain(&mut rx);

        let paused = json!({"event": "property-change", "id": OBS_PAUSE, "name": "pause", "data": true});
        worker.handle_mpv_event(mpv(paused.clone())).await;
        worker.handle_mpv_event(mpv(paused)).await;
        assert_eq!(drain(&mut rx), vec![(ticket("b", 2), OutputEvent::Paused)]);
    }

    #[tokio::test]
    async fn test_eof_emits_ended() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);
        confirm(&mut worker, 2).await;
        drain(&mut rx);

        worker
            .handle_mpv_event(mpv(json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 2})))
            .await;
        assert_eq!(drain(&mut rx), vec![(ticket("b", 2), OutputEvent::Ended)]);
        assert!(!worker.loaded);
        assert!(!worker.audible);
    }

    #[tokio::test]
    async fn test_quit_mid_attempt_reports_unknown() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);

        let quit = json!({"event": "end-file", "reason": "quit", "playlist_entry_id": 2});
        worker.handle_mpv_event(mpv(quit.clone())).await;
        assert_eq!(
            drain(&mut rx),
            vec![(ticket("b", 2), OutputEvent::Error(MediaErrorCode::Unknown))]
        );

        // Nothing pending any more, so a second quit is silent.
        worker.handle_mpv_event(mpv(quit)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_reports_network() {
        let (mut worker, mut rx) = new_worker();
        started(&mut worker, ticket("b", 2), 2);
        let begun = Instant::now();

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(worker.run(req_rx));

        match rx.recv().await {
            Some(SessionEvent::Output(notice)) => {
                assert_eq!(notice.ticket, ticket("b", 2));
                assert_eq!(notice.event, OutputEvent::Error(MediaErrorCode::Network));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(begun.elapsed() >= Duration::from_secs(15));

        req_tx.send(OutputRequest::Release).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_handle_completes_after_release() {
        let (tx, _rx) = mpsc::channel(16);
        let (mut output, join) = MpvOutput::spawn(MpvConfig::default(), tx);
        output.set_level(0.3);
        output.release();

        tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .expect("worker did not stop after release")
            .unwrap();
    }

    #[test]
    fn test_mpv_error_mapping() {
        assert_eq!(media_error_from_mpv(None), MediaErrorCode::Unknown);
        assert_eq!(
            media_error_from_mpv(Some("network error")),
            MediaErrorCode::Network
        );
        assert_eq!(
            media_error_from_mpv(Some("HTTP error 404")),
            MediaErrorCode::Network
        );
        assert_eq!(
            media_error_from_mpv(Some("unrecognized file format")),
            MediaErrorCode::Decode
        );
        assert_eq!(
            media_error_from_mpv(Some("no audio or video data played")),
            MediaErrorCode::Decode
        );
        assert_eq!(
            media_error_from_mpv(Some("loading failed")),
            MediaErrorCode::SourceNotSupported
        );
        assert_eq!(
            media_error_from_mpv(Some("something else entirely")),
            MediaErrorCode::Unknown
        );
    }

    #[tokio::test]
    async fn test_requests_after_release_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = MpvOutput {
            tx,
            released: false,
        };
        output.set_level(0.5);
        output.release();
        output.set_level(0.2);

        assert!(matches!(rx.recv().await, Some(OutputRequest::Level(l)) if l == 0.5));
        assert!(matches!(rx.recv().await, Some(OutputRequest::Release)));
        drop(output);
        assert!(rx.recv().await.is_none());
    }
}
