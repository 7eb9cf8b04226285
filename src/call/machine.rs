use crate::call::events::{CallCommand, ConnEvent, EngineEvent, NegotiationResult};
use crate::call::state::{CallSnapshot, CallState};
use crate::config::{SessionConfig, GRACE_PERIOD};
use crate::errors::CallError;
use crate::logger::{dump_selected_pair, log};
use crate::media::backend::{AudioBackend, PermissionState};
use crate::media::MediaDeviceManager;
use crate::peer::connection::{
    add_local_track, create_answer_sdp, create_offer_sdp, new_peer, set_remote_answer, PeerHandle,
};
use crate::peer::ice::{add_remote_candidate, apply_pending_candidates, PendingCandidates};
use crate::signal::{is_initiator, SignalBody};
use crate::signaling::transport::{AdapterEvent, SignalSender, SignalingAdapter, SignalingConnector};
use crate::utils::random_id;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Renegotiation-offer на уже согласованном соединении отвечаем сразу,
/// без ручного `join()` — звонок уже принят пользователем
pub(crate) fn should_auto_answer(
    connection: RTCPeerConnectionState,
    signaling: RTCSignalingState,
) -> bool {
    matches!(
        connection,
        RTCPeerConnectionState::Connected | RTCPeerConnectionState::Connecting
    ) && signaling == RTCSignalingState::Stable
}

/// Актор звонка: единственный владелец всего изменяемого состояния.
/// Все источники (команды UI, канал, колбэки соединения, таймеры,
/// монитор разрешений) сериализуются через одну очередь.
pub(crate) struct CallActor {
    cfg: SessionConfig,
    connector: Arc<dyn SignalingConnector>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    snapshot_tx: watch::Sender<CallSnapshot>,

    adapter: Option<SignalingAdapter>,
    media: Arc<Mutex<MediaDeviceManager>>,
    pc: Option<PeerHandle>,

    state: CallState,
    error: Option<CallError>,
    muted: bool,
    channel_connected: bool,
    peer_online: bool,
    remote_track: Option<Arc<TrackRemote>>,

    pending_offer: Option<RTCSessionDescription>,
    pending_candidates: PendingCandidates,
    /// Установлено ли remote description текущего соединения. Очередь
    /// кандидатов сверяется с этим флагом, а не с асинхронным опросом
    /// соединения — так сохраняется порядок прибытия.
    remote_desc_applied: bool,

    /// Отложенная задача для graceful disconnect
    disconnect_task: Option<JoinHandle<()>>,
    /// Текущая фоновая задача переговоров (dial / answer)
    attempt: Option<JoinHandle<()>>,

    device_id: Option<String>,
}

impl CallActor {
    pub fn new(
        cfg: SessionConfig,
        connector: Arc<dyn SignalingConnector>,
        backend: Arc<dyn AudioBackend>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        snapshot_tx: watch::Sender<CallSnapshot>,
    ) -> Self {
        let device_id = cfg.audio_device_id.clone();
        Self {
            cfg,
            connector,
            events_tx,
            snapshot_tx,
            adapter: None,
            media: Arc::new(Mutex::new(MediaDeviceManager::new(backend))),
            pc: None,
            state: CallState::Idle,
            error: None,
            muted: false,
            channel_connected: false,
            peer_online: false,
            remote_track: None,
            pending_offer: None,
            pending_candidates: PendingCandidates::default(),
            remote_desc_applied: false,
            disconnect_task: None,
            attempt: None,
            device_id,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineEvent>) {
        // канал поднимается сразу, как только известны все участники
        if self.cfg.local_user_id.is_some() && self.cfg.remote_user_id.is_some() {
            if let Err(e) = self.ensure_channel() {
                log(&format!("Error joining signaling channel: {e}"));
            }
        }
        self.publish();

        while let Some(event) = inbox.recv().await {
            let shutdown = matches!(&event, EngineEvent::Command(CallCommand::Shutdown));
            self.handle_event(event).await;
            self.publish();
            if shutdown {
                break;
            }
        }
        log("Call actor stopped");
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(cmd) => self.handle_command(cmd).await,
            EngineEvent::Channel(ev) => self.handle_channel(ev).await,
            EngineEvent::Conn { conn_id, event } => {
                if !self.is_current_conn(&conn_id) {
                    log("Stale connection event, ignoring");
                    return;
                }
                self.handle_conn(event).await;
            }
            EngineEvent::Negotiation { conn_id, result } => {
                if !self.is_current_conn(&conn_id) {
                    log("Stale negotiation result, ignoring");
                    return;
                }
                self.attempt = None;
                self.handle_negotiation(result).await;
            }
            EngineEvent::GraceExpired { conn_id } => {
                if !self.is_current_conn(&conn_id) {
                    return;
                }
                self.disconnect_task = None;
                log("Grace period expired without recovery");
                self.fail(CallError::ConnectionLost);
            }
            EngineEvent::Permission(state) => self.handle_permission(state),
        }
    }

    async fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::Start => self.start().await,
            CallCommand::Join => self.join().await,
            CallCommand::Hangup => self.hangup().await,
            CallCommand::ToggleMute => {
                self.muted = !self.muted;
                self.media.lock().await.set_muted(self.muted);
            }
            CallCommand::Reconnect => self.reconnect().await,
            CallCommand::SwitchDevice(device_id) => self.switch_device(device_id).await,
            CallCommand::Shutdown => {
                log("Shutting down call engine");
                self.cleanup().await;
                self.adapter = None;
            }
        }
    }

    async fn start(&mut self) {
        if !self.cfg.can_start() {
            self.fail(CallError::MissingPeer);
            return;
        }
        if self.cfg.local_user_id.is_none() {
            self.fail(CallError::NotAuthenticated);
            return;
        }
        self.error = None;

        if let Err(e) = self.ensure_channel() {
            self.fail(e);
            return;
        }

        if !self.initiator() {
            // offer создаёт только сторона с меньшим id; мы лишь
            // заявляем о себе и ждём
            self.set_state(CallState::WaitingForPeer);
            return;
        }
        if !self.peer_online {
            log("Peer offline, deferring offer");
            self.set_state(CallState::WaitingForPeer);
            return;
        }

        self.set_state(CallState::Connecting);
        if let Err(e) = self.ensure_pc().await {
            self.fail(e);
            return;
        }
        self.spawn_dial();
    }

    async fn join(&mut self) {
        let Some(offer) = self.pending_offer.clone() else {
            self.fail(CallError::NoIncomingOffer);
            return;
        };
        if let Err(e) = self.ensure_channel() {
            self.fail(e);
            return;
        }
        self.error = None;
        self.set_state(CallState::Connecting);
        if let Err(e) = self.ensure_pc().await {
            self.fail(e);
            return;
        }
        self.spawn_answer(offer);
    }

    async fn hangup(&mut self) {
        log("Hangup requested");
        if let Some(adapter) = &self.adapter {
            // сбой отправки не мешает локальной уборке
            if let Err(e) = adapter.send(SignalBody::Hangup) {
                log(&format!("Hangup signal failed: {e}"));
            }
        }
        self.cleanup().await;
        self.set_state(CallState::Ended);
    }

    /// Полный ручной сброс транспорта с сохранением канала и идентичности
    async fn reconnect(&mut self) {
        log("Reconnect requested");
        self.error = None;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.remote_track = None;
        self.remote_desc_applied = false;
        if let Some(handle) = self.disconnect_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.attempt.take() {
            handle.abort();
        }
        if let Some(ph) = self.pc.take() {
            let _ = ph.pc.close().await;
        }

        if !self.cfg.can_start() {
            self.fail(CallError::MissingPeer);
            return;
        }
        if !self.peer_online {
            self.set_state(CallState::WaitingForPeer);
            return;
        }
        if self.initiator() {
            self.start().await;
            return;
        }
        self.set_state(CallState::WaitingForPeer);
    }

    async fn switch_device(&mut self, device_id: Option<String>) {
        self.device_id = device_id;
        let pc = self.pc.as_ref().map(|p| p.pc.clone());
        let mut media = self.media.lock().await;
        if !media.has_stream() {
            // захвата ещё нет — просто запоминаем предпочтение
            return;
        }
        if let Err(e) = media.acquire(self.device_id.as_deref(), pc.as_ref()).await {
            log(&format!("Error switching microphone: {e}"));
            self.error = Some(e.into());
        }
    }

    async fn handle_channel(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Subscribed(connected) => {
                self.channel_connected = connected;
            }
            AdapterEvent::PeerOnline(online) => {
                if online != self.peer_online {
                    log(&format!("Peer online: {online}"));
                }
                self.peer_online = online;
            }
            AdapterEvent::Message(msg) => match msg.body {
                SignalBody::Offer { sdp } => self.on_remote_offer(sdp).await,
                SignalBody::Answer { sdp } => self.on_remote_answer(sdp).await,
                SignalBody::Ice { candidate } => self.on_remote_ice(candidate).await,
                SignalBody::Hangup => {
                    log("Remote hangup received");
                    self.cleanup().await;
                    self.set_state(CallState::Ended);
                }
            },
        }
    }

    async fn on_remote_offer(&mut self, sdp: RTCSessionDescription) {
        if let Some(ph) = &self.pc {
            if should_auto_answer(ph.pc.connection_state(), ph.pc.signaling_state()) {
                log("Renegotiation offer on established connection, answering automatically");
                self.spawn_answer(sdp);
                return;
            }
        }

        match self.state {
            CallState::Idle | CallState::WaitingForPeer | CallState::Incoming => {
                if self.pending_offer.is_some() {
                    log("Overwriting buffered offer (last-offer-wins)");
                }
                self.pending_offer = Some(sdp);
                self.set_state(CallState::Incoming);
            }
            CallState::Connecting | CallState::InCall => {
                // сессия уже идёт: буферизуем, состояние не трогаем
                self.pending_offer = Some(sdp);
            }
            CallState::Ended | CallState::Error => {
                log("Offer received in terminal state, ignoring");
            }
        }
    }

    async fn on_remote_answer(&mut self, sdp: RTCSessionDescription) {
        if self.remote_desc_applied {
            // транспорт доставляет at-least-once: повтор не применяем
            log("Duplicate answer ignored");
            return;
        }
        let Some(ph) = &self.pc else {
            log("Answer received with no connection, ignoring");
            return;
        };
        let pc = ph.pc.clone();
        match set_remote_answer(&pc, sdp).await {
            Ok(()) => {
                self.remote_desc_applied = true;
                self.drain_candidates(&pc).await;
                self.set_state(CallState::InCall);
            }
            Err(e) => {
                log(&format!("Error setting remote answer: {e}"));
                self.fail(e);
            }
        }
    }

    async fn on_remote_ice(&mut self, candidate: RTCIceCandidateInit) {
        let pc = match (&self.pc, self.remote_desc_applied) {
            (Some(ph), true) => ph.pc.clone(),
            _ => {
                log("Remote description not set yet, queuing candidate");
                self.pending_candidates.push(candidate);
                return;
            }
        };
        add_remote_candidate(&pc, candidate).await;
    }

    async fn handle_conn(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::LocalCandidate(candidate) => {
                if let Some(adapter) = &self.adapter {
                    if let Err(e) = adapter.send(SignalBody::Ice { candidate }) {
                        log(&format!("Error sending ICE candidate: {e}"));
                    }
                }
            }
            ConnEvent::RemoteTrack(track) => {
                self.remote_track = Some(track);
            }
            ConnEvent::State(st) => self.on_conn_state(st).await,
        }
    }

    async fn on_conn_state(&mut self, st: RTCPeerConnectionState) {
        match st {
            RTCPeerConnectionState::Connected => {
                // отменяем отложенный disconnect, если он был
                if let Some(handle) = self.disconnect_task.take() {
                    log("Aborting pending disconnect task");
                    handle.abort();
                }
                self.error = None;
                self.set_state(CallState::InCall);
            }
            RTCPeerConnectionState::Connecting => {
                self.set_state(CallState::Connecting);
            }
            RTCPeerConnectionState::Disconnected => {
                let current = self.pc.as_ref().map(|ph| (ph.pc.clone(), ph.conn_id.clone()));
                if let Some((pc_stats, conn_id)) = current {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc_stats, "BEFORE-FAIL").await;
                    });
                    self.arm_grace(conn_id);
                }
                if self.state == CallState::InCall {
                    self.set_state(CallState::Connecting);
                }
            }
            RTCPeerConnectionState::Failed => {
                if let Some(handle) = self.disconnect_task.take() {
                    handle.abort();
                }
                self.fail(CallError::ConnectionFailed);
            }
            RTCPeerConnectionState::Closed => {
                self.cleanup().await;
                self.set_state(CallState::Ended);
            }
            other => {
                log(&format!("Peer connection state: {other:?} - ignoring"));
            }
        }
    }

    /// Ставим отложенную проверку; одновременно висит не больше одной
    fn arm_grace(&mut self, conn_id: String) {
        if self.disconnect_task.is_some() {
            log("Disconnect task already pending, ignoring");
            return;
        }
        log(&format!(
            "Grace period started, waiting {} ms",
            GRACE_PERIOD.as_millis()
        ));
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            sleep(GRACE_PERIOD).await;
            let _ = events.send(EngineEvent::GraceExpired { conn_id });
        });
        self.disconnect_task = Some(handle);
    }

    async fn handle_negotiation(&mut self, result: NegotiationResult) {
        match result {
            NegotiationResult::OfferSent => {
                if self.state == CallState::Connecting {
                    self.set_state(CallState::WaitingForPeer);
                }
            }
            NegotiationResult::AnswerSent => {
                self.pending_offer = None;
                self.remote_desc_applied = true;
                if let Some(ph) = &self.pc {
                    let pc = ph.pc.clone();
                    self.drain_candidates(&pc).await;
                }
                self.set_state(CallState::InCall);
            }
            NegotiationResult::Failed(e) => {
                log(&format!("Negotiation failed: {e}"));
                self.fail(e);
            }
        }
    }

    fn handle_permission(&mut self, state: PermissionState) {
        // узкое правило автосброса: только mic/permission-ошибки
        if state == PermissionState::Granted
            && self.state == CallState::Error
            && self.error.as_ref().map(|e| e.is_permission()).unwrap_or(false)
        {
            log("Microphone permission granted, clearing stale error");
            self.error = None;
            self.set_state(CallState::Idle);
        }
    }

    fn spawn_dial(&mut self) {
        let Some(ph) = &self.pc else { return };
        let Some(sender) = self.adapter.as_ref().map(|a| a.sender()) else {
            return;
        };
        let pc = ph.pc.clone();
        let conn_id = ph.conn_id.clone();
        let media = self.media.clone();
        let device_id = self.device_id.clone();
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let result = match dial(pc, media, device_id, sender).await {
                Ok(result) => result,
                Err(e) => NegotiationResult::Failed(e),
            };
            let _ = events.send(EngineEvent::Negotiation { conn_id, result });
        });
        if let Some(old) = self.attempt.replace(task) {
            old.abort();
        }
    }

    fn spawn_answer(&mut self, offer: RTCSessionDescription) {
        let Some(ph) = &self.pc else { return };
        let Some(sender) = self.adapter.as_ref().map(|a| a.sender()) else {
            return;
        };
        let pc = ph.pc.clone();
        let conn_id = ph.conn_id.clone();
        let media = self.media.clone();
        let device_id = self.device_id.clone();
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let result = match answer(pc, media, device_id, offer, sender).await {
                Ok(result) => result,
                Err(e) => NegotiationResult::Failed(e),
            };
            let _ = events.send(EngineEvent::Negotiation { conn_id, result });
        });
        if let Some(old) = self.attempt.replace(task) {
            old.abort();
        }
    }

    async fn drain_candidates(&mut self, pc: &RTCPeerConnection) {
        let queued = self.pending_candidates.drain();
        if !queued.is_empty() {
            log(&format!("Applying {} queued ICE candidates", queued.len()));
            apply_pending_candidates(pc, queued).await;
        }
    }

    fn ensure_channel(&mut self) -> Result<(), CallError> {
        if self.adapter.is_some() {
            return Ok(());
        }
        let Some(local) = self.cfg.local_user_id.clone() else {
            return Err(CallError::NotAuthenticated);
        };

        let (adapter_tx, mut adapter_rx) = mpsc::unbounded_channel();
        let adapter = SignalingAdapter::join(
            self.connector.as_ref(),
            &self.cfg.session_id,
            &local,
            self.cfg.remote_user_id.clone(),
            adapter_tx,
        )?;

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = adapter_rx.recv().await {
                if events.send(EngineEvent::Channel(ev)).is_err() {
                    break;
                }
            }
        });

        self.adapter = Some(adapter);
        Ok(())
    }

    async fn ensure_pc(&mut self) -> Result<(), CallError> {
        if self.pc.is_some() {
            return Ok(());
        }
        let conn_id = random_id();
        log(&format!("Creating peer connection {conn_id}"));
        let pc = new_peer(&self.cfg, conn_id.clone(), self.events_tx.clone()).await?;
        self.pc = Some(PeerHandle { pc, conn_id });
        self.remote_desc_applied = false;
        Ok(())
    }

    /// Идемпотентная уборка: все выходы из звонка проходят через неё
    async fn cleanup(&mut self) {
        if let Some(handle) = self.disconnect_task.take() {
            log("Aborting pending disconnect task");
            handle.abort();
        }
        if let Some(handle) = self.attempt.take() {
            handle.abort();
        }
        if let Some(ph) = self.pc.take() {
            if let Err(e) = ph.pc.close().await {
                log(&format!("Error closing peer connection: {e}"));
            }
        }
        self.media.lock().await.release();
        self.remote_track = None;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.remote_desc_applied = false;
    }

    fn initiator(&self) -> bool {
        match (&self.cfg.local_user_id, &self.cfg.remote_user_id) {
            (Some(local), Some(remote)) => is_initiator(local, remote),
            _ => false,
        }
    }

    fn is_current_conn(&self, conn_id: &str) -> bool {
        self.pc.as_ref().map(|p| p.conn_id.as_str()) == Some(conn_id)
    }

    fn fail(&mut self, error: CallError) {
        log(&format!("Call failed: {error}"));
        self.error = Some(error);
        self.set_state(CallState::Error);
    }

    fn set_state(&mut self, next: CallState) {
        if self.state != next {
            log(&format!("Call state: {} -> {}", self.state, next));
            self.state = next;
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send_replace(CallSnapshot {
            state: self.state,
            error: self.error.clone(),
            is_muted: self.muted,
            is_channel_connected: self.channel_connected,
            is_peer_online: self.peer_online,
            remote_track: self.remote_track.clone(),
            can_start: self.cfg.can_start(),
            is_initiator: self.initiator(),
        });
    }
}

/// Сторона-инициатор: захват, треки, offer
async fn dial(
    pc: Arc<RTCPeerConnection>,
    media: Arc<Mutex<MediaDeviceManager>>,
    device_id: Option<String>,
    sender: SignalSender,
) -> Result<NegotiationResult, CallError> {
    let track = {
        let mut media = media.lock().await;
        media.acquire(device_id.as_deref(), Some(&pc)).await?
    };
    add_local_track(&pc, track).await?;

    if pc.signaling_state() != RTCSignalingState::Stable {
        log("Signaling state not stable, deferring offer");
        return Ok(NegotiationResult::OfferSent);
    }

    let offer = create_offer_sdp(&pc).await?;
    sender.send(SignalBody::Offer { sdp: offer })?;
    Ok(NegotiationResult::OfferSent)
}

/// Сторона-ответчик (join или renegotiation): захват, треки, answer
async fn answer(
    pc: Arc<RTCPeerConnection>,
    media: Arc<Mutex<MediaDeviceManager>>,
    device_id: Option<String>,
    offer: RTCSessionDescription,
    sender: SignalSender,
) -> Result<NegotiationResult, CallError> {
    let track = {
        let mut media = media.lock().await;
        media.acquire(device_id.as_deref(), Some(&pc)).await?
    };
    add_local_track(&pc, track).await?;

    let answer = create_answer_sdp(&pc, offer).await?;
    sender.send(SignalBody::Answer { sdp: answer })?;
    Ok(NegotiationResult::AnswerSent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MediaError;
    use crate::media::backend::NullBackend;
    use crate::signal::SignalMessage;
    use crate::signaling::memory::MemoryHub;
    use std::time::Duration;

    fn test_actor(
        local: Option<&str>,
        remote: Option<&str>,
    ) -> (
        CallActor,
        mpsc::UnboundedReceiver<EngineEvent>,
        watch::Receiver<CallSnapshot>,
    ) {
        let cfg = SessionConfig {
            session_id: "session-1".into(),
            local_user_id: local.map(|s| s.to_string()),
            remote_user_id: remote.map(|s| s.to_string()),
            audio_device_id: None,
            ice_servers: vec![],
            include_loopback: false,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let actor = CallActor::new(
            cfg,
            Arc::new(MemoryHub::new()),
            Arc::new(NullBackend::new()),
            events_tx,
            snapshot_tx,
        );
        (actor, events_rx, snapshot_rx)
    }

    fn fake_offer(tag: &str) -> RTCSessionDescription {
        let sdp = format!(
            "v=0\r\no=- 4215775240449105457 2 IN IP4 127.0.0.1\r\ns={tag}\r\nt=0 0\r\n"
        );
        RTCSessionDescription::offer(sdp).expect("valid sdp")
    }

    fn offer_from(sender: &str, tag: &str) -> EngineEvent {
        EngineEvent::Channel(AdapterEvent::Message(SignalMessage {
            sender_id: sender.into(),
            body: SignalBody::Offer {
                sdp: fake_offer(tag),
            },
        }))
    }

    fn ice_from(sender: &str, n: u32) -> EngineEvent {
        EngineEvent::Channel(AdapterEvent::Message(SignalMessage {
            sender_id: sender.into(),
            body: SignalBody::Ice {
                candidate: RTCIceCandidateInit {
                    candidate: format!("candidate:{n}"),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        }))
    }

    #[tokio::test]
    async fn start_without_peer_id_is_fatal() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), None);
        actor.handle_event(EngineEvent::Command(CallCommand::Start)).await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::MissingPeer));
    }

    #[tokio::test]
    async fn start_without_identity_is_fatal() {
        let (mut actor, _events, _snap) = test_actor(None, Some("bob"));
        actor.handle_event(EngineEvent::Command(CallCommand::Start)).await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::NotAuthenticated));
    }

    #[tokio::test]
    async fn non_initiator_start_waits_and_sends_no_offer() {
        // "bob" > "alice": инициатор не мы
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.handle_event(EngineEvent::Command(CallCommand::Start)).await;
        assert_eq!(actor.state, CallState::WaitingForPeer);
        assert!(actor.pc.is_none(), "non-initiator must not build a connection");
        assert!(actor.attempt.is_none());
    }

    #[tokio::test]
    async fn initiator_with_offline_peer_defers_offer() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.handle_event(EngineEvent::Command(CallCommand::Start)).await;
        assert_eq!(actor.state, CallState::WaitingForPeer);
        assert!(actor.pc.is_none(), "offer must be deferred while peer is offline");
    }

    #[tokio::test]
    async fn remote_offer_buffers_and_moves_to_incoming() {
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.handle_event(offer_from("alice", "first")).await;
        assert_eq!(actor.state, CallState::Incoming);
        assert!(actor.pending_offer.as_ref().unwrap().sdp.contains("s=first"));

        // второй offer молча перезаписывает первый (last-offer-wins)
        actor.handle_event(offer_from("alice", "second")).await;
        assert_eq!(actor.state, CallState::Incoming);
        assert!(actor.pending_offer.as_ref().unwrap().sdp.contains("s=second"));
    }

    #[tokio::test]
    async fn terminal_states_ignore_remote_offers() {
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.state = CallState::Ended;
        actor.handle_event(offer_from("alice", "late")).await;
        assert_eq!(actor.state, CallState::Ended);
        assert!(actor.pending_offer.is_none());
    }

    #[tokio::test]
    async fn join_without_offer_is_an_error() {
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.handle_event(EngineEvent::Command(CallCommand::Join)).await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::NoIncomingOffer));
    }

    #[tokio::test]
    async fn ice_before_remote_description_is_queued() {
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.handle_event(ice_from("alice", 1)).await;
        actor.handle_event(ice_from("alice", 2)).await;
        assert_eq!(actor.pending_candidates.len(), 2);
        assert_eq!(actor.state, CallState::Idle, "ice must not change state");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_expiry_surfaces_connection_lost() {
        let (mut actor, mut events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor.state = CallState::InCall;
        let conn_id = actor.pc.as_ref().unwrap().conn_id.clone();

        actor
            .handle_event(EngineEvent::Conn {
                conn_id: conn_id.clone(),
                event: ConnEvent::State(RTCPeerConnectionState::Disconnected),
            })
            .await;
        assert_eq!(actor.state, CallState::Connecting);
        assert!(actor.disconnect_task.is_some());

        tokio::time::advance(GRACE_PERIOD + Duration::from_millis(100)).await;
        let fired = loop {
            match events.recv().await.expect("events channel closed") {
                EngineEvent::GraceExpired { conn_id } => break conn_id,
                _ => continue,
            }
        };
        actor.handle_event(EngineEvent::GraceExpired { conn_id: fired }).await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::ConnectionLost));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_within_grace_cancels_timer() {
        let (mut actor, mut events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor.state = CallState::InCall;
        let conn_id = actor.pc.as_ref().unwrap().conn_id.clone();

        actor
            .handle_event(EngineEvent::Conn {
                conn_id: conn_id.clone(),
                event: ConnEvent::State(RTCPeerConnectionState::Disconnected),
            })
            .await;
        assert!(actor.disconnect_task.is_some());

        actor
            .handle_event(EngineEvent::Conn {
                conn_id: conn_id.clone(),
                event: ConnEvent::State(RTCPeerConnectionState::Connected),
            })
            .await;
        assert_eq!(actor.state, CallState::InCall);
        assert!(actor.error.is_none());
        assert!(actor.disconnect_task.is_none());

        // таймер снят — истечение не приходит
        tokio::time::advance(GRACE_PERIOD + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, EngineEvent::GraceExpired { .. }),
                "grace timer must be cancelled on recovery"
            );
        }
    }

    #[tokio::test]
    async fn failed_transport_is_an_immediate_error() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        let conn_id = actor.pc.as_ref().unwrap().conn_id.clone();
        actor
            .handle_event(EngineEvent::Conn {
                conn_id,
                event: ConnEvent::State(RTCPeerConnectionState::Failed),
            })
            .await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::ConnectionFailed));
    }

    #[tokio::test]
    async fn stale_connection_events_are_discarded() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor
            .handle_event(EngineEvent::Conn {
                conn_id: "some-old-conn".into(),
                event: ConnEvent::State(RTCPeerConnectionState::Failed),
            })
            .await;
        assert_eq!(actor.state, CallState::Idle);
        assert!(actor.error.is_none());
    }

    #[tokio::test]
    async fn hangup_cleans_up_and_cleanup_is_idempotent() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor.pending_offer = Some(fake_offer("x"));
        actor.handle_event(EngineEvent::Command(CallCommand::Hangup)).await;
        assert_eq!(actor.state, CallState::Ended);
        assert!(actor.pc.is_none());
        assert!(actor.pending_offer.is_none());
        assert_eq!(actor.pending_candidates.len(), 0);

        // повторная уборка ничего не ломает
        actor.cleanup().await;
        actor.cleanup().await;
    }

    #[tokio::test]
    async fn remote_hangup_ends_the_call() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.state = CallState::InCall;
        actor
            .handle_event(EngineEvent::Channel(AdapterEvent::Message(SignalMessage {
                sender_id: "bob".into(),
                body: SignalBody::Hangup,
            })))
            .await;
        assert_eq!(actor.state, CallState::Ended);
    }

    #[tokio::test]
    async fn reconnect_from_error_resets_transport_only() {
        let (mut actor, _events, _snap) = test_actor(Some("bob"), Some("alice"));
        actor.ensure_pc().await.unwrap();
        actor.state = CallState::Error;
        actor.error = Some(CallError::ConnectionLost);
        actor.pending_offer = Some(fake_offer("stale"));

        actor.handle_event(EngineEvent::Command(CallCommand::Reconnect)).await;
        assert_eq!(actor.state, CallState::WaitingForPeer);
        assert!(actor.error.is_none());
        assert!(actor.pc.is_none());
        assert!(actor.pending_offer.is_none());
    }

    #[tokio::test]
    async fn permission_grant_clears_only_mic_errors() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.state = CallState::Error;
        actor.error = Some(CallError::Media(MediaError::PermissionBlocked));
        actor.handle_event(EngineEvent::Permission(PermissionState::Granted)).await;
        assert_eq!(actor.state, CallState::Idle);
        assert!(actor.error.is_none());

        // сетевые ошибки это правило не трогает
        actor.state = CallState::Error;
        actor.error = Some(CallError::ConnectionLost);
        actor.handle_event(EngineEvent::Permission(PermissionState::Granted)).await;
        assert_eq!(actor.state, CallState::Error);
        assert_eq!(actor.error, Some(CallError::ConnectionLost));
    }

    #[tokio::test]
    async fn toggle_mute_flips_flag_without_state_change() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.handle_event(EngineEvent::Command(CallCommand::ToggleMute)).await;
        assert!(actor.muted);
        actor.handle_event(EngineEvent::Command(CallCommand::ToggleMute)).await;
        assert!(!actor.muted);
        assert_eq!(actor.state, CallState::Idle);
    }

    #[tokio::test]
    async fn stale_negotiation_results_are_discarded() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor.state = CallState::Connecting;
        actor
            .handle_event(EngineEvent::Negotiation {
                conn_id: "old-conn".into(),
                result: NegotiationResult::AnswerSent,
            })
            .await;
        assert_eq!(actor.state, CallState::Connecting, "stale result must not apply");
    }

    #[tokio::test]
    async fn duplicate_answers_are_tolerated() {
        let (mut actor, _events, _snap) = test_actor(Some("alice"), Some("bob"));
        actor.ensure_pc().await.unwrap();
        actor.state = CallState::InCall;
        actor.remote_desc_applied = true;

        let sdp = "v=0\r\no=- 4215775240449105457 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let answer = RTCSessionDescription::answer(sdp.to_string()).expect("valid sdp");
        actor
            .handle_event(EngineEvent::Channel(AdapterEvent::Message(SignalMessage {
                sender_id: "bob".into(),
                body: SignalBody::Answer { sdp: answer },
            })))
            .await;
        assert_eq!(actor.state, CallState::InCall, "re-delivered answer must be a no-op");
        assert!(actor.error.is_none());
    }

    #[test]
    fn renegotiation_is_auto_answered_only_on_stable_established_connections() {
        assert!(should_auto_answer(
            RTCPeerConnectionState::Connected,
            RTCSignalingState::Stable
        ));
        assert!(should_auto_answer(
            RTCPeerConnectionState::Connecting,
            RTCSignalingState::Stable
        ));
        assert!(!should_auto_answer(
            RTCPeerConnectionState::Connected,
            RTCSignalingState::HaveLocalOffer
        ));
        assert!(!should_auto_answer(
            RTCPeerConnectionState::New,
            RTCSignalingState::Stable
        ));
        assert!(!should_auto_answer(
            RTCPeerConnectionState::Failed,
            RTCSignalingState::Stable
        ));
    }
}
