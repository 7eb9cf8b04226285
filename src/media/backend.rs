use crate::errors::MediaError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Частота, в которой бэкенды отдают кадры (и в которой кодирует opus)
pub const SAMPLE_RATE: u32 = 48_000;

/// Кадр 20 мс моно
pub const FRAME_SAMPLES: usize = 960;

/// Состояние разрешения на микрофон. `Unsupported` означает «платформа
/// не умеет отвечать» и не должно блокировать звонок.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    Unsupported,
}

/// Описание устройства ввода для выбора в UI
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub label: String,
}

/// Живой захват с одного устройства; `stop()` освобождает устройство
/// и закрывает поток кадров
pub trait InputCapture: Send {
    fn stop(&mut self);
}

/// Шов к аудио-подсистеме ОС. Продакшен-бэкенд — cpal (см.
/// `media::capture`); `NullBackend` — безустройственный вариант для
/// headless-окружений.
pub trait AudioBackend: Send + Sync {
    fn list_inputs(&self) -> Result<Vec<AudioDeviceInfo>, MediaError>;

    /// Открывает захват: кадры по `FRAME_SAMPLES` отсчётов моно 48 кГц
    /// уходят в `frames` до остановки захвата
    fn open_input(
        &self,
        device_id: Option<&str>,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn InputCapture>, MediaError>;

    fn probe_permission(&self) -> PermissionState;
}

/// Бэкенд без устройства: отдаёт тишину в реальном темпе. Нужен для
/// headless-запусков, где важен сигнальный уровень, а не звук.
#[derive(Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

struct NullCapture {
    stop: Arc<AtomicBool>,
}

impl InputCapture for NullCapture {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for NullCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl AudioBackend for NullBackend {
    fn list_inputs(&self) -> Result<Vec<AudioDeviceInfo>, MediaError> {
        Ok(vec![AudioDeviceInfo {
            id: "null".into(),
            label: "Null audio device".into(),
        }])
    }

    fn open_input(
        &self,
        _device_id: Option<&str>,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn InputCapture>, MediaError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("null-audio-capture".into())
            .spawn(move || {
                let frame = vec![0f32; FRAME_SAMPLES];
                while !thread_stop.load(Ordering::Relaxed) {
                    if frames.send(frame.clone()).is_err() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Ok(Box::new(NullCapture { stop }))
    }

    fn probe_permission(&self) -> PermissionState {
        PermissionState::Unsupported
    }
}
