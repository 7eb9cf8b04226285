use crate::errors::CallError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;

/// Состояние звонка. Ровно одно текущее значение; меняется только
/// внутри актора машины состояний.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    WaitingForPeer,
    Incoming,
    Connecting,
    InCall,
    Ended,
    Error,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::WaitingForPeer => write!(f, "waiting_for_peer"),
            CallState::Incoming => write!(f, "incoming"),
            CallState::Connecting => write!(f, "connecting"),
            CallState::InCall => write!(f, "in_call"),
            CallState::Ended => write!(f, "ended"),
            CallState::Error => write!(f, "error"),
        }
    }
}

/// Публичный снимок движка для UI; доставляется через watch-канал
#[derive(Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    pub error: Option<CallError>,
    pub is_muted: bool,
    pub is_channel_connected: bool,
    pub is_peer_online: bool,
    pub remote_track: Option<Arc<TrackRemote>>,
    pub can_start: bool,
    pub is_initiator: bool,
}

impl CallSnapshot {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    pub fn has_incoming_offer(&self) -> bool {
        self.state == CallState::Incoming
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            error: None,
            is_muted: false,
            is_channel_connected: false,
            is_peer_online: false,
            remote_track: None,
            can_start: false,
            is_initiator: false,
        }
    }
}

impl fmt::Debug for CallSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSnapshot")
            .field("state", &self.state)
            .field("error", &self.error)
            .field("is_muted", &self.is_muted)
            .field("is_channel_connected", &self.is_channel_connected)
            .field("is_peer_online", &self.is_peer_online)
            .field("has_remote_track", &self.remote_track.is_some())
            .finish()
    }
}
