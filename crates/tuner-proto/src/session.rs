//! Playback session controller — the single owner of the audio output.
//!
//! Every mutation goes through a method on [`SessionController`], called from
//! one event loop.  User operations update state optimistically and hand work
//! to the output; the output's asynchronous outcomes come back as
//! [`OutputNotice`]s and are applied by [`SessionController::handle_output`].
//!
//! Phases:
//!
//! ```text
//!   Idle ──play(s)──▶ Loading ──Playing──▶ Playing ──pause──▶ Paused
//!                        │                    │                 │
//!                        └──Error/Rejected──▶ Errored ◀─────────┘
//!   any ──stop──▶ Idle        Paused/Errored ──play()──▶ Loading
//! ```
//!
//! Output failures are absorbed into `error`; nothing is retried.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::output::{AudioOutput, OutputEvent, OutputNotice, Ticket, PLAYBACK_REJECTED_MESSAGE};
use crate::station::{Station, StationId};

pub const DEFAULT_VOLUME: u8 = 80;
pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    /// Nothing selected.
    #[default]
    Idle,
    /// Source assigned, waiting for first audio.
    Loading,
    Playing,
    /// Station selected, output silent, no error.
    Paused,
    /// The last attempt for the selected station failed.
    Errored,
}

/// Read-only view of the session handed to every UI surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Bumped on every state change.
    pub rev: u64,
    pub current_station: Option<Station>,
    /// Position of `current_station` in `stations`; `None` when nothing is
    /// selected or the station is not in the catalog.
    pub current_index: Option<usize>,
    pub is_playing: bool,
    pub volume: u8,
    pub is_muted: bool,
    pub error: Option<String>,
    pub phase: PlaybackPhase,
    /// Level actually applied to the output.
    pub output_level: f32,
    pub stations: Vec<Station>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            rev: 0,
            current_station: None,
            current_index: None,
            is_playing: false,
            volume: DEFAULT_VOLUME,
            is_muted: false,
            error: None,
            phase: PlaybackPhase::Idle,
            output_level: f32::from(DEFAULT_VOLUME) / 100.0,
            stations: Vec::new(),
        }
    }
}

impl SessionSnapshot {
    pub fn is_current(&self, id: &StationId) -> bool {
        self.current_station.as_ref().is_some_and(|s| &s.id == id)
    }

    /// True when `id` is selected and audible — what a station card shows as
    /// "now playing".
    pub fn is_playing_station(&self, id: &StationId) -> bool {
        self.is_playing && self.is_current(id)
    }
}

pub struct SessionController<O: AudioOutput> {
    output: O,
    stations: Vec<Station>,
    current: Option<Station>,
    current_index: Option<usize>,
    phase: PlaybackPhase,
    volume: u8,
    is_muted: bool,
    error: Option<String>,
    /// Ticket of the attempt whose notices are still accepted.
    live_ticket: Option<Ticket>,
    attempts: u64,
    rev: u64,
    released: bool,
}

impl<O: AudioOutput> SessionController<O> {
    pub fn new(output: O) -> Self {
        Self::with_volume(output, i32::from(DEFAULT_VOLUME))
    }

    pub fn with_volume(mut output: O, volume: i32) -> Self {
        let volume = clamp_volume(volume);
        output.set_level(effective_level(volume, false));
        Self {
            output,
            stations: Vec::new(),
            current: None,
            current_index: None,
            phase: PlaybackPhase::Idle,
            volume,
            is_muted: false,
            error: None,
            live_ticket: None,
            attempts: 0,
            rev: 1,
            released: false,
        }
    }

    // ── read side ─────────────────────────────────────────────────────────────

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn current_station(&self) -> Option<&Station> {
        self.current.as_ref()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn is_playing(&self) -> bool {
        self.phase == PlaybackPhase::Playing
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn output_level(&self) -> f32 {
        effective_level(self.volume, self.is_muted)
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn find_station(&self, id: &StationId) -> Option<&Station> {
        self.stations.iter().find(|s| &s.id == id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            rev: self.rev,
            current_station: self.current.clone(),
            current_index: self.current_index,
            is_playing: self.is_playing(),
            volume: self.volume,
            is_muted: self.is_muted,
            error: self.error.clone(),
            phase: self.phase,
            output_level: self.output_level(),
            stations: self.stations.clone(),
        }
    }

    // ── operations ────────────────────────────────────────────────────────────

    /// Play `station`, or resume the current one when `None`.
    ///
    /// Selecting the station that is already current resumes in place without
    /// reassigning the source.  The selection stands even if the attempt fails.
    pub fn play(&mut self, station: Option<Station>) {
        if self.released {
            warn!("session: play after release ignored");
            return;
        }

        let target = match station.or_else(|| self.current.clone()) {
            Some(s) => s,
            None => {
                debug!("session: play with nothing selected");
                return;
            }
        };

        let same_station = self.current.as_ref().is_some_and(|c| c.id == target.id);
        if same_station && self.phase == PlaybackPhase::Playing {
            debug!("session: '{}' already playing", target.name);
            return;
        }

        self.error = None;
        let ticket = self.issue_ticket(&target.id);

        if same_station {
            info!("session: resuming '{}'", target.name);
        } else {
            info!("session: tuning to '{}' ({})", target.name, target.stream_url);
            self.current_index = self.index_of(&target.id);
            self.output.assign(&ticket, &target.stream_url);
            self.current = Some(target);
        }

        self.phase = PlaybackPhase::Loading;
        self.output.start(&ticket);
        self.touch();
    }

    pub fn pause(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.output.request_stop();
        if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Loading) {
            self.phase = PlaybackPhase::Paused;
        }
        self.touch();
    }

    /// Back to Idle: drops the selection, rewinds and detaches the output.
    pub fn stop(&mut self) {
        if self.current.is_some() {
            self.output.request_stop();
            self.output.reset_position();
            self.output.detach();
        }
        self.current = None;
        self.current_index = None;
        self.phase = PlaybackPhase::Idle;
        self.error = None;
        self.live_ticket = None;
        self.touch();
    }

    pub fn next(&mut self) {
        let len = self.stations.len();
        if len == 0 {
            return;
        }
        let idx = match self.current_index {
            Some(i) => (i + 1) % len,
            None => 0,
        };
        let station = self.stations[idx].clone();
        self.play(Some(station));
    }

    pub fn previous(&mut self) {
        let len = self.stations.len();
        if len == 0 {
            return;
        }
        let idx = match self.current_index {
            Some(i) if i > 0 => i - 1,
            _ => len - 1,
        };
        let station = self.stations[idx].clone();
        self.play(Some(station));
    }

    /// Clamp to 0..=100 and apply.  Stored volume survives muting.
    pub fn set_volume(&mut self, volume: i32) {
        self.volume = clamp_volume(volume);
        self.output.set_level(self.output_level());
        self.touch();
    }

    pub fn toggle_mute(&mut self) {
        self.is_muted = !self.is_muted;
        self.output.set_level(self.output_level());
        self.touch();
    }

    /// Replace the catalog wholesale.  Playback is left alone; only the
    /// current index is recomputed.
    pub fn set_stations(&mut self, stations: Vec<Station>) {
        self.stations = stations;
        self.current_index = match &self.current {
            Some(current) => self.index_of(&current.id),
            None => None,
        };
        debug!(
            "session: catalog now {} stations, current index {:?}",
            self.stations.len(),
            self.current_index
        );
        self.touch();
    }

    /// Apply an asynchronous outcome from the output.  Returns `false` when
    /// the notice was stale and dropped.
    pub fn handle_output(&mut self, notice: OutputNotice) -> bool {
        if self.live_ticket.as_ref() != Some(&notice.ticket) {
            debug!(
                "session: dropping stale {:?} for {} attempt {}",
                notice.event, notice.ticket.station_id, notice.ticket.attempt
            );
            return false;
        }

        let before = (self.phase, self.error.clone());
        match notice.event {
            OutputEvent::LoadStart | OutputEvent::CanPlay => {
                if self.phase == PlaybackPhase::Loading {
                    self.error = None;
                }
            }
            OutputEvent::Playing => {
                // A confirmation that lands after pause() must not revive playback.
                if self.phase == PlaybackPhase::Loading {
                    self.phase = PlaybackPhase::Playing;
                    self.error = None;
                }
            }
            OutputEvent::Paused | OutputEvent::Ended => {
                if matches!(self.phase, PlaybackPhase::Playing | PlaybackPhase::Loading) {
                    self.phase = PlaybackPhase::Paused;
                }
            }
            OutputEvent::Error(code) => {
                warn!(
                    "session: output error {:?} on {}",
                    code, notice.ticket.station_id
                );
                self.fail(code.user_message());
            }
            OutputEvent::StartRejected(reason) => {
                warn!(
                    "session: start rejected on {}: {}",
                    notice.ticket.station_id, reason
                );
                self.fail(PLAYBACK_REJECTED_MESSAGE);
            }
        }

        if before != (self.phase, self.error.clone()) {
            debug!("session: {:?} → {:?}", before.0, self.phase);
            self.touch();
        }
        true
    }

    /// Release the output.  The session is inert afterwards.
    pub fn dispose(mut self) {
        self.release_output();
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn fail(&mut self, message: &str) {
        if self.current.is_none() {
            return;
        }
        self.phase = PlaybackPhase::Errored;
        self.error = Some(message.to_string());
    }

    fn issue_ticket(&mut self, station_id: &StationId) -> Ticket {
        self.attempts += 1;
        let ticket = Ticket {
            station_id: station_id.clone(),
            attempt: self.attempts,
        };
        self.live_ticket = Some(ticket.clone());
        ticket
    }

    fn index_of(&self, id: &StationId) -> Option<usize> {
        self.stations.iter().position(|s| &s.id == id)
    }

    fn touch(&mut self) {
        self.rev += 1;
    }

    fn release_output(&mut self) {
        if self.released {
            return;
        }
        info!("session: releasing audio output");
        self.output.release();
        self.released = true;
        self.live_ticket = None;
    }
}

impl<O: AudioOutput> Drop for SessionController<O> {
    fn drop(&mut self) {
        self.release_output();
    }
}

fn clamp_volume(volume: i32) -> u8 {
    volume.clamp(0, i32::from(MAX_VOLUME)) as u8
}

fn effective_level(volume: u8, muted: bool) -> f32 {
    if muted {
        0.0
    } else {
        f32::from(volume) / 100.0
    }
}
