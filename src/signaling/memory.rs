use crate::errors::SignalingError;
use crate::logger::log;
use crate::signaling::transport::{ChannelPipe, InboundFrame, OutboundFrame, SignalingConnector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Внутрипроцессный pub/sub-хаб с presence: референсный коннектор для
/// однопроцессных развертываний и тестов. Broadcast доставляется всем
/// участникам топика, включая отправителя, — подавление эха остаётся
/// обязанностью адаптера.
#[derive(Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<String, Vec<Member>>>>,
}

struct Member {
    id: u64,
    key: String,
    announced: bool,
    tx: mpsc::UnboundedSender<InboundFrame>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn broadcast_presence(members: &mut Vec<Member>) {
        let mut online: Vec<String> = members
            .iter()
            .filter(|m| m.announced)
            .map(|m| m.key.clone())
            .collect();
        online.dedup();
        members.retain(|m| {
            m.tx.send(InboundFrame::Presence {
                members: online.clone(),
            })
            .is_ok()
        });
    }

    fn broadcast_signal(members: &mut Vec<Member>, payload: serde_json::Value) {
        members.retain(|m| {
            m.tx.send(InboundFrame::Signal {
                payload: payload.clone(),
            })
            .is_ok()
        });
    }
}

static NEXT_MEMBER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl SignalingConnector for MemoryHub {
    fn connect(&self, topic: &str, presence_key: &str) -> Result<ChannelPipe, SignalingError> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();

        let member_id = NEXT_MEMBER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut topics = self.topics.lock().unwrap();
            let members = topics.entry(topic.to_string()).or_default();
            members.push(Member {
                id: member_id,
                key: presence_key.to_string(),
                announced: false,
                tx: in_tx.clone(),
            });

            // новый участник сразу считается подписанным и получает
            // текущий снимок presence
            let _ = in_tx.send(InboundFrame::Status { connected: true });
            let online: Vec<String> = members
                .iter()
                .filter(|m| m.announced)
                .map(|m| m.key.clone())
                .collect();
            let _ = in_tx.send(InboundFrame::Presence { members: online });
        }

        let topics = self.topics.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let mut guard = topics.lock().unwrap();
                let Some(members) = guard.get_mut(&topic) else {
                    break;
                };
                match frame {
                    OutboundFrame::Track { key } => {
                        log(&format!("Hub: presence track for {key}"));
                        for m in members.iter_mut() {
                            if m.id == member_id {
                                m.announced = true;
                            }
                        }
                        MemoryHub::broadcast_presence(members);
                    }
                    OutboundFrame::Signal { payload } => {
                        MemoryHub::broadcast_signal(members, payload);
                    }
                }
            }

            // отправитель ушёл: убираем участника и оповещаем остальных
            let mut guard = topics.lock().unwrap();
            if let Some(members) = guard.get_mut(&topic) {
                members.retain(|m| m.id != member_id);
                MemoryHub::broadcast_presence(members);
                if members.is_empty() {
                    guard.remove(&topic);
                }
            }
        });

        Ok(ChannelPipe {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
