pub mod backend;
pub mod capture;

pub use backend::{AudioBackend, AudioDeviceInfo, InputCapture, NullBackend, PermissionState};
pub use capture::CpalBackend;

use crate::errors::MediaError;
use crate::logger::log;
use crate::media::backend::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::peer::connection::audio_sender;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Живой локальный аудио-поток: захват + opus-насос + локальный трек
struct LocalAudioStream {
    device_id: Option<String>,
    track: Arc<TrackLocalStaticSample>,
    capture: Box<dyn InputCapture>,
    muted: Arc<AtomicBool>,
}

impl LocalAudioStream {
    fn stop(&mut self) {
        // остановка захвата закрывает канал кадров, насос завершается сам
        self.capture.stop();
    }
}

/// Менеджер локального устройства захвата. Владеет максимум одним
/// потоком; смена устройства не прерывает активный звонок: сначала
/// открывается новый захват, затем трек подменяется в живом sender,
/// и только после этого старый поток останавливается.
pub(crate) struct MediaDeviceManager {
    backend: Arc<dyn AudioBackend>,
    current: Option<LocalAudioStream>,
    muted: bool,
}

impl MediaDeviceManager {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            current: None,
            muted: false,
        }
    }

    pub fn has_stream(&self) -> bool {
        self.current.is_some()
    }

    pub fn list_inputs(&self) -> Result<Vec<AudioDeviceInfo>, MediaError> {
        self.backend.list_inputs()
    }

    /// Идемпотентный захват: если уже держим запрошенное устройство,
    /// возвращаем существующий трек без перезапуска
    pub async fn acquire(
        &mut self,
        device_id: Option<&str>,
        pc: Option<&Arc<RTCPeerConnection>>,
    ) -> Result<Arc<TrackLocalStaticSample>, MediaError> {
        if let Some(current) = &self.current {
            if current.device_id.as_deref() == device_id {
                return Ok(current.track.clone());
            }
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let capture = self.backend.open_input(device_id, frames_tx)?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "interview-call".to_owned(),
        ));

        let muted = Arc::new(AtomicBool::new(self.muted));
        spawn_opus_pump(frames_rx, track.clone(), muted.clone())?;

        // при смене устройства новый трек сначала подменяется в живом
        // sender, и только потом глушится прежний захват
        if self.current.is_some() {
            if let Some(pc) = pc {
                if let Some(sender) = audio_sender(pc).await {
                    let replacement: Arc<dyn TrackLocal + Send + Sync> = track.clone();
                    if let Err(e) = sender.replace_track(Some(replacement)).await {
                        log(&format!("Error replacing audio track: {:?}", e));
                    } else {
                        log("Audio track replaced in active sender");
                    }
                }
            }
        }

        let previous = self.current.replace(LocalAudioStream {
            device_id: device_id.map(|s| s.to_string()),
            track: track.clone(),
            capture,
            muted,
        });
        if let Some(mut previous) = previous {
            previous.stop();
        }

        Ok(track)
    }

    /// Мьют не трогает захват и sender — насос просто шлёт тишину
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(current) = &self.current {
            current.muted.store(muted, Ordering::Relaxed);
        }
    }

    pub fn release(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.stop();
            log("Local media released");
        }
    }
}

/// Насос: кадры захвата → opus → сэмплы трека. Живёт в выделенном
/// потоке и завершается вместе с каналом кадров.
fn spawn_opus_pump(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
) -> Result<(), MediaError> {
    let handle = tokio::runtime::Handle::current();
    std::thread::Builder::new()
        .name("audio-opus-pump".into())
        .spawn(move || {
            let mut encoder =
                match opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        log(&format!("Opus encoder init failed: {e}"));
                        return;
                    }
                };
            let silence = vec![0i16; FRAME_SAMPLES];
            let mut pcm = vec![0i16; FRAME_SAMPLES];
            let mut packet = vec![0u8; 1500];

            while let Some(frame) = frames.blocking_recv() {
                if muted.load(Ordering::Relaxed) {
                    pcm.copy_from_slice(&silence);
                } else {
                    for (dst, src) in pcm.iter_mut().zip(frame.iter()) {
                        *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    }
                }
                let len = match encoder.encode(&pcm, &mut packet) {
                    Ok(len) => len,
                    Err(e) => {
                        log(&format!("Opus encode error: {e}"));
                        continue;
                    }
                };
                let sample = Sample {
                    data: Bytes::copy_from_slice(&packet[..len]),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if handle.block_on(track.write_sample(&sample)).is_err() {
                    break;
                }
            }
            log("Opus pump finished");
        })
        .map_err(|e| MediaError::Backend(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_same_device_is_idempotent() {
        let mut media = MediaDeviceManager::new(Arc::new(NullBackend::new()));
        let first = media.acquire(None, None).await.unwrap();
        let second = media.acquire(None, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second), "same device must reuse the stream");
        media.release();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn switching_device_creates_new_track() {
        let mut media = MediaDeviceManager::new(Arc::new(NullBackend::new()));
        let first = media.acquire(None, None).await.unwrap();
        let second = media.acquire(Some("other-mic"), None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // повторный запрос того же устройства снова идемпотентен
        let third = media.acquire(Some("other-mic"), None).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        media.release();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mute_flag_reaches_active_stream() {
        let mut media = MediaDeviceManager::new(Arc::new(NullBackend::new()));
        media.acquire(None, None).await.unwrap();
        media.set_muted(true);
        assert!(media.current.as_ref().unwrap().muted.load(Ordering::Relaxed));
        media.set_muted(false);
        assert!(!media.current.as_ref().unwrap().muted.load(Ordering::Relaxed));
        media.release();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_is_idempotent() {
        let mut media = MediaDeviceManager::new(Arc::new(NullBackend::new()));
        media.acquire(None, None).await.unwrap();
        media.release();
        media.release();
        assert!(!media.has_stream());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mute_survives_device_switch() {
        let mut media = MediaDeviceManager::new(Arc::new(NullBackend::new()));
        media.acquire(None, None).await.unwrap();
        media.set_muted(true);
        media.acquire(Some("other-mic"), None).await.unwrap();
        assert!(media.current.as_ref().unwrap().muted.load(Ordering::Relaxed));
        media.release();
    }
}
