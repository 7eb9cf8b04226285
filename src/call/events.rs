use crate::errors::CallError;
use crate::media::backend::PermissionState;
use crate::signaling::transport::AdapterEvent;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

/// Команды публичной поверхности движка
#[derive(Debug, Clone)]
pub enum CallCommand {
    Start,
    Join,
    Hangup,
    ToggleMute,
    Reconnect,
    /// Смена микрофона на лету; `None` — устройство по умолчанию
    SwitchDevice(Option<String>),
    Shutdown,
}

/// События текущего экземпляра peer connection
pub(crate) enum ConnEvent {
    State(RTCPeerConnectionState),
    LocalCandidate(RTCIceCandidateInit),
    RemoteTrack(Arc<TrackRemote>),
}

/// Результат фоновой задачи переговоров (dial / answer)
pub(crate) enum NegotiationResult {
    /// Offer отправлен (или отложен из-за нестабильного signaling state)
    OfferSent,
    /// Answer отправлен, remote description применён в задаче
    AnswerSent,
    Failed(CallError),
}

/// Единая очередь оркестратора: сюда сериализуются команды UI, события
/// канала, колбэки соединения, таймеры и монитор разрешений
pub(crate) enum EngineEvent {
    Command(CallCommand),
    Channel(AdapterEvent),
    Conn {
        conn_id: String,
        event: ConnEvent,
    },
    Negotiation {
        conn_id: String,
        result: NegotiationResult,
    },
    GraceExpired {
        conn_id: String,
    },
    Permission(PermissionState),
}
