use crate::call::events::EngineEvent;
use crate::config::PERMISSION_POLL;
use crate::logger::log;
use crate::media::backend::{AudioBackend, PermissionState};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Наблюдатель за разрешением на микрофон: опрашивает платформу
/// независимо от попыток звонка и сообщает оркестратору только
/// переходы. Узкое правило автосброса ошибки живёт в самой машине
/// состояний.
pub(crate) fn spawn_monitor(
    backend: Arc<dyn AudioBackend>,
    events: UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<PermissionState> = None;
        loop {
            let probe_backend = backend.clone();
            // опрос может дергать ОС — уводим его из реактора
            let state = tokio::task::spawn_blocking(move || probe_backend.probe_permission())
                .await
                .unwrap_or(PermissionState::Unsupported);

            if last != Some(state) {
                log(&format!("Microphone permission state: {state:?}"));
                last = Some(state);
                if events.send(EngineEvent::Permission(state)).is_err() {
                    break;
                }
            }
            tokio::time::sleep(PERMISSION_POLL).await;
        }
    })
}
