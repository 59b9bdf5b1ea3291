use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::config::InactivitySettings;

/// Por qué una sala se desconecta sola
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// No quedó nadie más en el canal de voz
    Alone,
    /// Demasiado tiempo sin reproducir
    Inactivity,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaveReason::Alone => write!(f, "alone"),
            LeaveReason::Inactivity => write!(f, "inactivity"),
        }
    }
}

/// Lo que ejecuta un timer al expirar
pub type LeaveCallback = Arc<dyn Fn(LeaveReason) + Send + Sync>;

/// Un timer cancelable; re-armarlo reemplaza el anterior
#[derive(Default)]
struct TimerSlot {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    fn arm(&self, after: Duration, reason: LeaveReason, on_expire: LeaveCallback) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("⚠️ Timer de {} sin runtime, no se arma", reason);
            return;
        };

        // Cancelar y programar bajo el mismo lock: nunca hay dos vivos
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(runtime.spawn(async move {
            tokio::time::sleep(after).await;
            info!("⏰ Timer de {} expirado", reason);
            on_expire(reason);
        }));
    }

    fn disarm(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn is_armed(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Par de timers por sala (solo en el canal / sin reproducir) que disparan la
/// desconexión automática.
pub struct InactivityHelper {
    alone: TimerSlot,
    idle: TimerSlot,
    alone_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    on_expire: LeaveCallback,
}

impl InactivityHelper {
    pub fn new(settings: &InactivitySettings, on_expire: LeaveCallback) -> Self {
        Self {
            alone: TimerSlot::default(),
            idle: TimerSlot::default(),
            alone_timeout: settings.alone_timeout(),
            idle_timeout: settings.idle_timeout(),
            on_expire,
        }
    }

    /// Solo queda el bot en el canal
    pub fn on_alone(&self) {
        if let Some(timeout) = self.alone_timeout {
            debug!("👤 Sala sin oyentes, saliendo en {:?}", timeout);
            self.alone.arm(timeout, LeaveReason::Alone, self.on_expire.clone());
        }
    }

    pub fn on_person_join(&self) {
        if self.alone.disarm() {
            debug!("👥 Oyente de vuelta, timer cancelado");
        }
    }

    /// Pausado o entre canciones
    pub fn on_not_playing(&self) {
        if let Some(timeout) = self.idle_timeout {
            debug!("💤 Sin reproducir, saliendo en {:?}", timeout);
            self.idle.arm(timeout, LeaveReason::Inactivity, self.on_expire.clone());
        }
    }

    pub fn on_playing(&self) {
        self.idle.disarm();
    }

    pub fn cancel_all(&self) {
        self.alone.disarm();
        self.idle.disarm();
    }

    pub fn is_alone_armed(&self) -> bool {
        self.alone.is_armed()
    }

    pub fn is_idle_armed(&self) -> bool {
        self.idle.is_armed()
    }
}

impl Drop for InactivityHelper {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settle;
    use pretty_assertions::assert_eq;

    fn helper(alone: i64, idle: i64) -> (InactivityHelper, Arc<Mutex<Vec<LeaveReason>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let settings = InactivitySettings {
            wait_rejoin_seconds: alone,
            bot_idle_seconds: idle,
        };
        let helper = InactivityHelper::new(&settings, Arc::new(move |reason| sink.lock().push(reason)));
        (helper, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn presence_within_window_cancels_teardown() {
        let (helper, fired) = helper(60, -1);

        helper.on_alone();
        assert!(helper.is_alone_armed());
        tokio::time::sleep(Duration::from_secs(30)).await;
        helper.on_person_join();
        assert!(!helper.is_alone_armed());

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn alone_timer_fires_once() {
        let (helper, fired) = helper(60, -1);

        helper.on_alone();
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(*fired.lock(), vec![LeaveReason::Alone]);
        assert!(!helper.is_alone_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_resets_the_deadline() {
        let (helper, fired) = helper(-1, 10);

        helper.on_not_playing();
        tokio::time::sleep(Duration::from_secs(8)).await;
        helper.on_not_playing();
        tokio::time::sleep(Duration::from_secs(8)).await;
        settle().await;
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(*fired.lock(), vec![LeaveReason::Inactivity]);
    }

    #[tokio::test(start_paused = true)]
    async fn playing_disarms_idle_timer() {
        let (helper, fired) = helper(-1, 10);

        helper.on_not_playing();
        helper.on_playing();
        assert!(!helper.is_idle_armed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_timeouts_never_arm() {
        let (helper, _) = helper(-1, -1);
        helper.on_alone();
        helper.on_not_playing();
        assert!(!helper.is_alone_armed());
        assert!(!helper.is_idle_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_both_timers() {
        let (helper, fired) = helper(5, 5);
        helper.on_alone();
        helper.on_not_playing();
        helper.cancel_all();

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert!(fired.lock().is_empty());
    }
}
