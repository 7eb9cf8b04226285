use crate::call::events::{ConnEvent, EngineEvent};
use crate::config::SessionConfig;
use crate::errors::CallError;
use crate::logger::{dump_candidate, log};
use crate::peer::types::{ServerConfig, DEFAULT_ICE_SERVERS};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Текущий экземпляр соединения. `conn_id` метит все события от его
/// колбэков: после пересоздания соединения события старого экземпляра
/// отбрасываются оркестратором.
pub(crate) struct PeerHandle {
    pub pc: Arc<RTCPeerConnection>,
    pub conn_id: String,
}

/// Создаём peer connection и подписываем его события в очередь оркестратора
pub(crate) async fn new_peer(
    cfg: &SessionConfig,
    conn_id: String,
    events: UnboundedSender<EngineEvent>,
) -> Result<Arc<RTCPeerConnection>, CallError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| CallError::Negotiation(e.to_string()))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| CallError::Negotiation(e.to_string()))?;

    let mut setting_engine = SettingEngine::default();
    if cfg.include_loopback {
        setting_engine.set_include_loopback_candidate(true);
    }

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(&cfg.ice_servers)).await?);

    // Обработчик локальных кандидатов: каждый сразу уходит в очередь,
    // оркестратор пересылает их собеседнику (Trickle-ICE)
    let candidate_events = events.clone();
    let candidate_conn = conn_id.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(c) = cand {
            if let Ok(init) = c.to_json() {
                dump_candidate("LOCAL", &init);
                let _ = candidate_events.send(EngineEvent::Conn {
                    conn_id: candidate_conn.clone(),
                    event: ConnEvent::LocalCandidate(init),
                });
            }
        } else {
            // cand == None означает конец сбора
            log("ICE candidate gathering completed (null candidate received)");
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        log(&format!("ICE gathering state changed to: {:?}", state));
        Box::pin(async {})
    }));

    let track_events = events.clone();
    let track_conn = conn_id.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        log(&format!("Remote track received: kind={}", track.kind()));
        let _ = track_events.send(EngineEvent::Conn {
            conn_id: track_conn.clone(),
            event: ConnEvent::RemoteTrack(track),
        });
        Box::pin(async {})
    }));

    // Единственный источник правды о живости соединения
    let state_events = events;
    let state_conn = conn_id;
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log(&format!("Peer connection state changed to: {:?}", st));
        let _ = state_events.send(EngineEvent::Conn {
            conn_id: state_conn.clone(),
            event: ConnEvent::State(st),
        });
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(custom_servers: &[ServerConfig]) -> RTCConfiguration {
    let servers = if custom_servers.is_empty() {
        DEFAULT_ICE_SERVERS.as_slice()
    } else {
        custom_servers
    };

    RTCConfiguration {
        ice_servers: map_ice_servers(servers),
        // Более агрессивные настройки ICE
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод пользовательской конфигурации серверов в формат webrtc
pub fn map_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| {
            let url = add_ice_url_scheme(config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// Добавляет локальные треки идемпотентно: трек, чей id уже закреплён
/// за существующим sender, второй раз не добавляется
pub(crate) async fn add_local_track(
    pc: &RTCPeerConnection,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<(), CallError> {
    for sender in pc.get_senders().await {
        if let Some(existing) = sender.track().await {
            if existing.id() == track.id() {
                log("Track already attached to a sender, skipping add");
                return Ok(());
            }
        }
    }
    pc.add_track(track).await?;
    Ok(())
}

/// Ищет sender аудио-трека (для замены трека при смене устройства)
pub(crate) async fn audio_sender(pc: &RTCPeerConnection) -> Option<Arc<RTCRtpSender>> {
    for sender in pc.get_senders().await {
        if let Some(track) = sender.track().await {
            if track.kind() == RTPCodecType::Audio {
                return Some(sender);
            }
        }
    }
    None
}

/// Создаёт offer и ставит его локальным описанием
pub(crate) async fn create_offer_sdp(
    pc: &RTCPeerConnection,
) -> Result<RTCSessionDescription, CallError> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    pc.local_description()
        .await
        .ok_or_else(|| CallError::Negotiation("no local description after offer".into()))
}

/// Принимает offer собеседника и создаёт answer
pub(crate) async fn create_answer_sdp(
    pc: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, CallError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    pc.local_description()
        .await
        .ok_or_else(|| CallError::Negotiation("no local description after answer".into()))
}

/// Применяет answer собеседника
pub(crate) async fn set_remote_answer(
    pc: &RTCPeerConnection,
    sdp: RTCSessionDescription,
) -> Result<(), CallError> {
    pc.set_remote_description(sdp).await?;
    Ok(())
}
