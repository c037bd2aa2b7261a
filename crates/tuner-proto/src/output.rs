//! The audio output primitive the session controller drives.
//!
//! Calls into an [`AudioOutput`] never block and never fail: every outcome
//! comes back later as an [`OutputNotice`] that the owning event loop feeds to
//! [`SessionController::handle_output`](crate::session::SessionController::handle_output).

use serde::{Deserialize, Serialize};

use crate::station::StationId;

/// Shown when the output refuses to start at all (no media error code).
pub const PLAYBACK_REJECTED_MESSAGE: &str = "Could not play this station.";

/// Failure codes an output may report for a playback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaErrorCode {
    Aborted,
    Network,
    Decode,
    SourceNotSupported,
    Unknown,
}

impl MediaErrorCode {
    pub fn user_message(self) -> &'static str {
        match self {
            MediaErrorCode::Aborted => "Playback was aborted.",
            MediaErrorCode::Network => "Network error while attempting to play this station.",
            MediaErrorCode::Decode => "This station's format is not supported or is corrupted.",
            MediaErrorCode::SourceNotSupported => {
                "No valid source could be found for this station."
            }
            MediaErrorCode::Unknown => "Unknown error while playing this station.",
        }
    }
}

/// Identifies one playback attempt.  Notices carrying any other ticket than
/// the controller's live one are stale and get dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub station_id: StationId,
    pub attempt: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    LoadStart,
    CanPlay,
    /// First audio confirmed for the attempt.
    Playing,
    Paused,
    Ended,
    Error(MediaErrorCode),
    /// `start` was refused outright; the reason is for logs only.
    StartRejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputNotice {
    pub ticket: Ticket,
    pub event: OutputEvent,
}

impl OutputNotice {
    pub fn new(ticket: Ticket, event: OutputEvent) -> Self {
        Self { ticket, event }
    }
}

pub trait AudioOutput {
    /// Begin loading a new source, cancelling any pending load.
    fn assign(&mut self, ticket: &Ticket, url: &str);

    /// Attempt to produce audio for the assigned source.  Resolves later as
    /// `Playing`, `Error(_)` or `StartRejected(_)`.
    fn start(&mut self, ticket: &Ticket);

    /// Halt audio without dropping the source.
    fn request_stop(&mut self);

    /// Seek to the start of the source.  No-op for unseekable live streams.
    fn reset_position(&mut self);

    /// Drop the assigned source and any pending load.
    fn detach(&mut self);

    /// Linear output level, 0.0 to 1.0.
    fn set_level(&mut self, level: f32);

    /// Tear the output down.  Nothing may be called afterwards.
    fn release(&mut self);
}
