use thiserror::Error;

/// Ошибки захвата аудио. Каждый вариант несёт готовое сообщение для
/// пользователя вместо сырой ошибки платформы.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Microphone access blocked. Check system microphone permission for this app and close other apps using the mic.")]
    PermissionBlocked,

    #[error("Microphone is blocked by platform security policy.")]
    Insecure,

    #[error("No microphone found. Connect a microphone and try again.")]
    NoDevice,

    #[error("Microphone is in use or not readable. Close other apps using it and try again.")]
    DeviceBusy,

    #[error("Audio backend error: {0}")]
    Backend(String),

    #[error("Audio codec error: {0}")]
    Codec(String),
}

impl MediaError {
    /// Только такие ошибки сбрасывает permission monitor (см. call::machine)
    pub fn is_permission(&self) -> bool {
        matches!(self, MediaError::PermissionBlocked | MediaError::Insecure)
    }
}

/// Ошибки сигнального канала
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("failed to encode signal: {0}")]
    Encode(String),
}

/// Ошибки уровня звонка, попадают в снапшот состояния как есть
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Missing participant info")]
    MissingPeer,

    #[error("No incoming call")]
    NoIncomingOffer,

    #[error("Connection lost. Try Reconnect.")]
    ConnectionLost,

    #[error("Connection failed. Try Reconnect.")]
    ConnectionFailed,

    #[error("Failed to establish call")]
    Negotiation(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl CallError {
    pub fn is_permission(&self) -> bool {
        matches!(self, CallError::Media(m) if m.is_permission())
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Negotiation(e.to_string())
    }
}
