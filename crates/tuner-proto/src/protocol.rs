use serde::{Deserialize, Serialize};

use crate::session::SessionSnapshot;
use crate::station::StationId;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest JSON body a peer may announce in a frame header.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages sent from a player UI to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all_fields = "camelCase")]
pub enum Command {
    /// Play the given station, or resume the current one.
    Play {
        #[serde(default)]
        station_id: Option<StationId>,
    },
    Pause,
    Stop,
    Next,
    Previous,
    SetVolume {
        value: i32,
    },
    ToggleMute,
    /// Re-read the station store into the session catalog.
    ReloadStations,
    GetState,
}

/// Messages sent from the daemon to player UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast", rename_all_fields = "camelCase")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: SessionSnapshot,
    },
    State {
        data: SessionSnapshot,
    },
    /// A new user-facing playback error.
    Error {
        message: String,
    },
    Log {
        message: String,
    },
}

/// What the front of a receive buffer holds.
#[derive(Debug)]
pub enum Frame {
    /// Not a whole frame yet.
    Incomplete,
    /// A message and the number of bytes it occupied.
    Message(Message, usize),
    /// A whole frame of `len` bytes whose body is not a valid message.
    Malformed { len: usize, reason: String },
    /// The header announces a body above [`MAX_FRAME_LEN`].  The stream
    /// cannot be resynchronised after this.
    Oversized(usize),
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }

    /// Classify the frame at the front of `data`, telling a short read apart
    /// from a complete but unparseable frame.
    pub fn next_frame(data: &[u8]) -> Frame {
        if data.len() < 4 {
            return Frame::Incomplete;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Frame::Oversized(len);
        }
        if data.len() < 4 + len {
            return Frame::Incomplete;
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Frame::Message(msg, 4 + len),
            Err(e) => Frame::Malformed {
                len: 4 + len,
                reason: e.to_string(),
            },
        }
    }
}
