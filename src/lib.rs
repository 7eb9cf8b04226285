//! P2P-движок аудио-звонка для живых интервью-сессий: выбор
//! инициатора, обмен SDP/ICE через broadcast-канал, presence
//! собеседника, захват и смена микрофона, grace-период при потере
//! соединения и ручной reconnect. Вся логика сериализуется в одном
//! акторе на сеанс; UI получает состояние через watch-канал.

pub mod call;
pub mod config;
pub mod errors;
mod logger;
pub mod media;
mod permission;
pub mod peer;
pub mod signal;
pub mod signaling;
mod utils;

pub use call::{CallCommand, CallEngine, CallHandle, CallSnapshot, CallState};
pub use config::SessionConfig;
pub use errors::{CallError, MediaError, SignalingError};
pub use media::{
    AudioBackend, AudioDeviceInfo, CpalBackend, InputCapture, NullBackend, PermissionState,
};
pub use peer::types::ServerConfig;
pub use signal::{SignalBody, SignalMessage};
pub use signaling::{ChannelPipe, InboundFrame, MemoryHub, OutboundFrame, SignalingConnector};
