use crate::errors::MediaError;
use crate::logger::log;
use crate::media::backend::{
    AudioBackend, AudioDeviceInfo, InputCapture, PermissionState, FRAME_SAMPLES, SAMPLE_RATE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Продакшен-бэкенд захвата на cpal. Поток cpal живёт в выделенном
/// std-потоке (cpal stream не Send); кадры пересекают границу через
/// канал уже в формате 48 кГц моно f32.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

struct CpalCapture {
    stop: Arc<AtomicBool>,
}

impl InputCapture for CpalCapture {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl AudioBackend for CpalBackend {
    fn list_inputs(&self) -> Result<Vec<AudioDeviceInfo>, MediaError> {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(classify_devices_error)?;
        let mut out = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                out.push(AudioDeviceInfo {
                    id: name.clone(),
                    label: name,
                });
            }
        }
        Ok(out)
    }

    fn open_input(
        &self,
        device_id: Option<&str>,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn InputCapture>, MediaError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let requested = device_id.map(|s| s.to_string());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

        std::thread::Builder::new()
            .name("cpal-audio-capture".into())
            .spawn(move || {
                let host = cpal::default_host();
                match build_stream(&host, requested.as_deref(), frames) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // поток cpal живёт, пока его держит этот поток
                        while !thread_stop.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                        log("Capture stream stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Box::new(CpalCapture { stop })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::Backend("audio backend did not start".into())),
        }
    }

    fn probe_permission(&self) -> PermissionState {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(_) => PermissionState::Granted,
            Err(cpal::DevicesError::BackendSpecific { err }) => {
                if looks_like_permission(&err.description) {
                    PermissionState::Denied
                } else {
                    PermissionState::Unsupported
                }
            }
        }
    }
}

fn pick_device(host: &Host, device_id: Option<&str>) -> Result<Device, MediaError> {
    match device_id {
        Some(id) => host
            .input_devices()
            .map_err(classify_devices_error)?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or(MediaError::NoDevice),
        None => host.default_input_device().ok_or(MediaError::NoDevice),
    }
}

fn build_stream(
    host: &Host,
    device_id: Option<&str>,
    frames: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, MediaError> {
    let device = pick_device(host, device_id)?;
    let supported = device.default_input_config().map_err(classify_config_error)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    log(&format!(
        "Opening capture: device={:?} rate={} channels={} format={:?}",
        device.name().unwrap_or_default(),
        config.sample_rate.0,
        config.channels,
        sample_format
    ));

    let mut chunker = FrameChunker::new(config.channels, config.sample_rate.0, frames);

    fn err_fn(err: cpal::StreamError) {
        log(&format!("Audio capture error: {err}"));
    }

    let stream = match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| chunker.push(data),
                err_fn,
                None,
            )
            .map_err(classify_build_error)?,
        SampleFormat::I16 => device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> =
                        data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                    chunker.push(&converted);
                },
                err_fn,
                None,
            )
            .map_err(classify_build_error)?,
        SampleFormat::U16 => device
            .build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|s| (*s as f32 - 32768.0) / 32768.0)
                        .collect();
                    chunker.push(&converted);
                },
                err_fn,
                None,
            )
            .map_err(classify_build_error)?,
        other => {
            return Err(MediaError::Backend(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| classify_backend_message(&e.to_string()))?;
    Ok(stream)
}

/// Сведение к моно и линейная передискретизация к 48 кГц с нарезкой
/// на кадры по 20 мс
struct FrameChunker {
    channels: usize,
    step: f64,
    pos: f64,
    mono: Vec<f32>,
    out: Vec<f32>,
    tx: mpsc::UnboundedSender<Vec<f32>>,
}

impl FrameChunker {
    fn new(channels: u16, in_rate: u32, tx: mpsc::UnboundedSender<Vec<f32>>) -> Self {
        Self {
            channels: channels.max(1) as usize,
            step: in_rate as f64 / SAMPLE_RATE as f64,
            pos: 0.0,
            mono: Vec::new(),
            out: Vec::with_capacity(FRAME_SAMPLES),
            tx,
        }
    }

    fn push(&mut self, data: &[f32]) {
        for frame in data.chunks(self.channels) {
            let sum: f32 = frame.iter().sum();
            self.mono.push(sum / self.channels as f32);
        }

        while (self.pos.floor() as usize) + 1 < self.mono.len() {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            let sample = self.mono[i] * (1.0 - frac) + self.mono[i + 1] * frac;
            self.out.push(sample);
            self.pos += self.step;

            if self.out.len() == FRAME_SAMPLES {
                let frame = std::mem::replace(&mut self.out, Vec::with_capacity(FRAME_SAMPLES));
                let _ = self.tx.send(frame);
            }
        }

        let consumed = self.pos.floor() as usize;
        if consumed > 0 {
            self.mono.drain(..consumed.min(self.mono.len()));
            self.pos -= consumed as f64;
        }
    }
}

fn looks_like_permission(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not permitted")
        || lower.contains("access")
}

fn classify_backend_message(description: &str) -> MediaError {
    if looks_like_permission(description) {
        return MediaError::PermissionBlocked;
    }
    let lower = description.to_lowercase();
    if lower.contains("in use") || lower.contains("busy") {
        return MediaError::DeviceBusy;
    }
    MediaError::Backend(description.to_string())
}

fn classify_devices_error(e: cpal::DevicesError) -> MediaError {
    match e {
        cpal::DevicesError::BackendSpecific { err } => classify_backend_message(&err.description),
    }
}

fn classify_config_error(e: cpal::DefaultStreamConfigError) -> MediaError {
    match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => MediaError::DeviceBusy,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            MediaError::Backend("stream type not supported".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
    }
}

fn classify_build_error(e: cpal::BuildStreamError) -> MediaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceBusy,
        cpal::BuildStreamError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
        other => MediaError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_emits_20ms_frames_for_48k_mono() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut chunker = FrameChunker::new(1, SAMPLE_RATE, tx);
        chunker.push(&vec![0.5f32; SAMPLE_RATE as usize]); // одна секунда

        let mut frames = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.len(), FRAME_SAMPLES);
            frames += 1;
        }
        assert!(frames >= 48, "expected ~50 frames, got {frames}");
    }

    #[test]
    fn chunker_downmixes_stereo_and_resamples() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // стерео 44.1 кГц → моно 48 кГц
        let mut chunker = FrameChunker::new(2, 44_100, tx);
        chunker.push(&vec![0.25f32; 44_100 * 2]);

        let mut total = 0usize;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.len(), FRAME_SAMPLES);
            for s in &frame {
                assert!((s - 0.25).abs() < 1e-3);
            }
            total += frame.len();
        }
        // секунда входа даёт около секунды выхода
        assert!(total >= 46_000 && total <= 49_000, "total={total}");
    }

    #[test]
    fn permission_flavored_backend_errors_are_classified() {
        assert_eq!(
            classify_backend_message("Access denied by the OS"),
            MediaError::PermissionBlocked
        );
        assert_eq!(
            classify_backend_message("device is busy"),
            MediaError::DeviceBusy
        );
        assert!(matches!(
            classify_backend_message("something else"),
            MediaError::Backend(_)
        ));
    }
}
