use crate::call::events::{CallCommand, EngineEvent};
use crate::call::machine::CallActor;
use crate::call::state::CallSnapshot;
use crate::config::SessionConfig;
use crate::logger::log;
use crate::media::backend::AudioBackend;
use crate::permission::spawn_monitor;
use crate::signaling::transport::SignalingConnector;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Движок звонка: один актор на сеанс. Создаётся внутри tokio runtime.
pub struct CallEngine;

impl CallEngine {
    /// Запускает актор сеанса и возвращает публичную ручку. Транспорт
    /// сигналинга и аудио-бэкенд передаются снаружи: продакшен — свой
    /// коннектор к realtime-каналу и `CpalBackend`, headless —
    /// `MemoryHub` и `NullBackend`.
    pub fn spawn(
        cfg: SessionConfig,
        connector: Arc<dyn SignalingConnector>,
        backend: Arc<dyn AudioBackend>,
    ) -> CallHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            can_start: cfg.can_start(),
            ..CallSnapshot::default()
        });

        let monitor = spawn_monitor(backend.clone(), events_tx.clone());
        let actor = CallActor::new(cfg, connector, backend, events_tx.clone(), snapshot_tx);
        let actor_task = tokio::spawn(actor.run(events_rx));

        CallHandle {
            commands: events_tx,
            snapshot: snapshot_rx,
            actor: actor_task,
            monitor,
        }
    }
}

/// Публичная поверхность движка для UI: команды — fire-and-forget,
/// состояние — через watch-канал снапшотов
pub struct CallHandle {
    commands: mpsc::UnboundedSender<EngineEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    actor: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl CallHandle {
    pub fn start(&self) {
        self.command(CallCommand::Start);
    }

    pub fn join(&self) {
        self.command(CallCommand::Join);
    }

    pub fn hangup(&self) {
        self.command(CallCommand::Hangup);
    }

    pub fn toggle_mute(&self) {
        self.command(CallCommand::ToggleMute);
    }

    pub fn reconnect(&self) {
        self.command(CallCommand::Reconnect);
    }

    /// Смена микрофона на лету; `None` — устройство по умолчанию
    pub fn switch_device(&self, device_id: Option<String>) {
        self.command(CallCommand::SwitchDevice(device_id));
    }

    /// Текущий снимок состояния
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Подписка на изменения состояния
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Полная остановка движка с уборкой ресурсов
    pub async fn shutdown(mut self) {
        self.command(CallCommand::Shutdown);
        self.monitor.abort();
        if let Err(e) = (&mut self.actor).await {
            if !e.is_cancelled() {
                log(&format!("Call actor join error: {e}"));
            }
        }
    }

    fn command(&self, cmd: CallCommand) {
        if self.commands.send(EngineEvent::Command(cmd)).is_err() {
            log("Call engine is already stopped");
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        // на размонтировании — та же уборка, что и при явном shutdown
        let _ = self.commands.send(EngineEvent::Command(CallCommand::Shutdown));
        self.monitor.abort();
    }
}
