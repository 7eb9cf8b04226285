use crate::logger::log;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Кандидаты, полученные до установки remote description. Очередь
/// опустошается ровно один раз, сразу после установки описания,
/// с сохранением порядка прибытия.
#[derive(Default)]
pub(crate) struct PendingCandidates {
    queue: Vec<RTCIceCandidateInit>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: RTCIceCandidateInit) {
        self.queue.push(candidate);
    }

    pub fn drain(&mut self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut self.queue)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Применяет ICE кандидат от удаленной стороны
pub(crate) async fn add_remote_candidate(pc: &RTCPeerConnection, candidate: RTCIceCandidateInit) {
    match pc.add_ice_candidate(candidate).await {
        Ok(_) => log("Successfully added ICE candidate"),
        Err(e) => log(&format!("Failed to add ICE candidate: {:?}", e)),
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub(crate) async fn apply_pending_candidates(
    pc: &RTCPeerConnection,
    candidates: Vec<RTCIceCandidateInit>,
) {
    for candidate in candidates {
        log(&format!("Applying pending candidate: {}", candidate.candidate));
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            log(&format!("Failed to apply pending candidate: {:?}", e));
        }
    }
}
