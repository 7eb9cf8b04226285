use crate::errors::SignalingError;
use crate::logger::log;
use crate::signal::{channel_topic, SignalBody, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Кадры, приходящие из broadcast-канала развертывания
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Статус подписки на канал
    Status { connected: bool },
    /// Полный список заявивших о себе участников (presence sync)
    Presence { members: Vec<String> },
    /// Широковещательное сигнальное сообщение; доставка at-least-once,
    /// эхо собственных сообщений не вырезается транспортом
    Signal { payload: serde_json::Value },
}

/// Кадры, уходящие в broadcast-канал
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Заявить о себе в presence-множестве канала
    Track { key: String },
    Signal { payload: serde_json::Value },
}

/// Пара каналов одного подключения к топику
pub struct ChannelPipe {
    pub tx: mpsc::UnboundedSender<OutboundFrame>,
    pub rx: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Шов к pub/sub-механизму развертывания (realtime-канал, ws-релей,
/// внутрипроцессный хаб). Движку нужен только топик с broadcast и
/// presence; см. `signaling::memory` для референсной реализации.
pub trait SignalingConnector: Send + Sync {
    fn connect(&self, topic: &str, presence_key: &str) -> Result<ChannelPipe, SignalingError>;
}

/// Нормализованные события канала для оркестратора
#[derive(Debug, Clone)]
pub(crate) enum AdapterEvent {
    Subscribed(bool),
    PeerOnline(bool),
    Message(SignalMessage),
}

/// Отправитель сигналов; дешёвый клон для задач переговоров
#[derive(Clone)]
pub(crate) struct SignalSender {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    local_id: String,
}

impl SignalSender {
    pub fn send(&self, body: SignalBody) -> Result<(), SignalingError> {
        log(&format!("Sending signal: {}", body.kind()));
        let msg = SignalMessage {
            sender_id: self.local_id.clone(),
            body,
        };
        let payload =
            serde_json::to_value(&msg).map_err(|e| SignalingError::Encode(e.to_string()))?;
        self.outbound
            .send(OutboundFrame::Signal { payload })
            .map_err(|_| SignalingError::ChannelClosed)
    }
}

/// Адаптер сигнального канала: заявляет о себе после подписки, выводит
/// presence собеседника из member-set и отбрасывает собственное эхо.
pub(crate) struct SignalingAdapter {
    sender: SignalSender,
    task: JoinHandle<()>,
}

impl SignalingAdapter {
    pub fn join(
        connector: &dyn SignalingConnector,
        session_id: &str,
        local_id: &str,
        remote_id: Option<String>,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<Self, SignalingError> {
        let topic = channel_topic(session_id);
        let pipe = connector.connect(&topic, local_id)?;
        let sender = SignalSender {
            outbound: pipe.tx.clone(),
            local_id: local_id.to_string(),
        };

        let local = local_id.to_string();
        let announce = pipe.tx;
        let mut rx = pipe.rx;
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    InboundFrame::Status { connected } => {
                        log(&format!("Channel status: connected={connected}"));
                        if connected {
                            // заявляем о себе, как только канал подписан
                            let _ = announce.send(OutboundFrame::Track { key: local.clone() });
                        }
                        if events.send(AdapterEvent::Subscribed(connected)).is_err() {
                            break;
                        }
                    }
                    InboundFrame::Presence { members } => {
                        let online = match &remote_id {
                            Some(remote) => members.iter().any(|m| m == remote),
                            None => false,
                        };
                        if events.send(AdapterEvent::PeerOnline(online)).is_err() {
                            break;
                        }
                    }
                    InboundFrame::Signal { payload } => {
                        let msg: SignalMessage = match serde_json::from_value(payload) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log(&format!("Dropping malformed signal: {e}"));
                                continue;
                            }
                        };
                        if msg.sender_id == local {
                            // подавление собственного эха
                            continue;
                        }
                        log(&format!(
                            "Signal received: kind={} from={}",
                            msg.body.kind(),
                            msg.sender_id
                        ));
                        if events.send(AdapterEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                }
            }
            log("Signaling channel stream ended");
        });

        Ok(Self { sender, task })
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn send(&self, body: SignalBody) -> Result<(), SignalingError> {
        self.sender.send(body)
    }
}

impl Drop for SignalingAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
