// Конфигурация движка звонка
// Логирование можно отключить только в режиме разработки

use crate::peer::types::ServerConfig;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене все дополнительные настройки отключены
    pub const ENABLE_LOGGING: bool = false;
}

/// Период ожидания восстановления после `disconnected`, прежде чем
/// звонок считается потерянным
pub const GRACE_PERIOD: Duration = Duration::from_millis(4500);

/// Период опроса состояния разрешения на микрофон
pub const PERMISSION_POLL: Duration = Duration::from_secs(2);

/// Идентичность и настройки одного сеанса звонка. Неизменяемы на всё
/// время жизни движка; отсутствующие идентификаторы дают фатальную
/// ошибку при `start()`, а не при создании.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub local_user_id: Option<String>,
    pub remote_user_id: Option<String>,
    /// Предпочитаемый микрофон; `None` — устройство по умолчанию
    pub audio_device_id: Option<String>,
    /// Пустой список — дефолтные STUN серверы (см. peer::types)
    pub ice_servers: Vec<ServerConfig>,
    /// Разрешить loopback-кандидаты (для развертываний на одном хосте)
    pub include_loopback: bool,
}

impl SessionConfig {
    pub fn new(
        session_id: impl Into<String>,
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local_user_id: Some(local_user_id.into()),
            remote_user_id: Some(remote_user_id.into()),
            audio_device_id: None,
            ice_servers: Vec::new(),
            include_loopback: false,
        }
    }

    /// Звонок возможен только когда известны сеанс и собеседник
    pub fn can_start(&self) -> bool {
        !self.session_id.is_empty() && self.remote_user_id.is_some()
    }
}
