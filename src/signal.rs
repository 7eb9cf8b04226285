use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Сигнальное сообщение поверх broadcast-канала. Формат на проводе:
/// `{"senderId": "...", "kind": "offer"|"answer"|"ice"|"hangup", ...}`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalMessage {
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(flatten)]
    pub body: SignalBody,
}

/// Полезная нагрузка сигнального сообщения
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalBody {
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    Ice { candidate: RTCIceCandidateInit },
    Hangup,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::Ice { .. } => "ice",
            SignalBody::Hangup => "hangup",
        }
    }
}

/// Выбор инициатора: offer всегда создаёт сторона с лексикографически
/// меньшим идентификатором. Обе стороны вычисляют это независимо, без
/// дополнительного раунда переговоров — одновременный `start()` с двух
/// сторон никогда не даёт двух встречных offer.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Имя broadcast-канала для сеанса
pub fn channel_topic(session_id: &str) -> String {
    format!("interview_call_{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_election_is_symmetric_and_exclusive() {
        let pairs = [("alice", "bob"), ("b", "a"), ("user-1", "user-2"), ("0001", "zzzz")];
        for (a, b) in pairs {
            assert_ne!(a, b);
            // ровно одна из сторон — инициатор, и обе согласны
            assert_ne!(is_initiator(a, b), is_initiator(b, a));
        }
    }

    #[test]
    fn initiator_is_the_lexicographically_lower_id() {
        assert!(is_initiator("aaa", "bbb"));
        assert!(!is_initiator("bbb", "aaa"));
    }

    #[test]
    fn hangup_wire_shape() {
        let msg = SignalMessage {
            sender_id: "u1".into(),
            body: SignalBody::Hangup,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "u1");
        assert_eq!(json["kind"], "hangup");
    }

    #[test]
    fn ice_wire_shape_round_trips() {
        let msg = SignalMessage {
            sender_id: "u2".into(),
            body: SignalBody::Ice {
                candidate: RTCIceCandidateInit {
                    candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id, "u2");
        match back.body {
            SignalBody::Ice { candidate } => {
                assert!(candidate.candidate.contains("typ host"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("expected ice, got {}", other.kind()),
        }
    }

    #[test]
    fn channel_topic_matches_session() {
        assert_eq!(channel_topic("s-42"), "interview_call_s-42");
    }
}
