use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuración completa del núcleo de reproducción.
///
/// Se carga en capas: valores por defecto, archivo opcional
/// `open-music.toml` y variables de entorno con prefijo `OPEN_MUSIC`
/// (secciones separadas por `__`, p. ej. `OPEN_MUSIC_QUEUE__DEFAULT_VOLUME=80`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueSettings,
    pub inactivity: InactivitySettings,
    pub song_manager: SongManagerSettings,
    pub tools: ToolSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Volumen inicial de cada sala (porcentaje, 100 = volumen original)
    pub default_volume: u16,
    pub max_volume: u16,
    pub max_queue_size: usize,
    /// Reintentos al abrir un stream antes de darlo por perdido
    pub max_stream_retries: u32,
    /// Solo una sala activa: crear una nueva desconecta las demás
    pub single_room: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InactivitySettings {
    /// Segundos a esperar cuando el bot queda solo (negativo = nunca salir)
    pub wait_rejoin_seconds: i64,
    /// Segundos sin reproducir antes de salir (negativo = nunca salir)
    pub bot_idle_seconds: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SongManagerSettings {
    pub soft_limit: usize,
    pub hard_limit: usize,
    /// Espera entre programar una limpieza y ejecutarla
    pub clean_delay_seconds: u64,
    pub refresh_interval_seconds: u64,
    pub youtube_metadata_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolSettings {
    pub yt_dlp: String,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_volume: 70,
            max_volume: 200,
            max_queue_size: 1000,
            max_stream_retries: 3,
            single_room: false,
        }
    }
}

impl Default for InactivitySettings {
    fn default() -> Self {
        Self {
            wait_rejoin_seconds: 60,
            bot_idle_seconds: 600,
        }
    }
}

impl Default for SongManagerSettings {
    fn default() -> Self {
        Self {
            soft_limit: 250,
            hard_limit: 500,
            clean_delay_seconds: 60,
            refresh_interval_seconds: 600, // 10 minutos
            youtube_metadata_ttl_seconds: 3600,
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl InactivitySettings {
    pub fn alone_timeout(&self) -> Option<Duration> {
        seconds_or_disabled(self.wait_rejoin_seconds)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        seconds_or_disabled(self.bot_idle_seconds)
    }
}

impl SongManagerSettings {
    pub fn clean_delay(&self) -> Duration {
        Duration::from_secs(self.clean_delay_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn youtube_metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.youtube_metadata_ttl_seconds)
    }
}

fn seconds_or_disabled(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config: Self = ::config::Config::builder()
            .add_source(::config::File::with_name("open-music").required(false))
            .add_source(
                ::config::Environment::with_prefix("OPEN_MUSIC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - `hard_limit >= soft_limit > 0`
    /// - Default volume must not exceed the maximum volume
    /// - Queue size must be greater than 0
    pub fn validate(&self) -> Result<()> {
        let songs = &self.song_manager;
        if songs.soft_limit == 0 {
            anyhow::bail!("Song cache soft limit must be greater than 0");
        }

        if songs.hard_limit < songs.soft_limit {
            anyhow::bail!(
                "Song cache hard limit ({}) must be >= soft limit ({})",
                songs.hard_limit,
                songs.soft_limit
            );
        }

        if songs.refresh_interval_seconds == 0 {
            anyhow::bail!("Metadata refresh interval must be greater than 0");
        }

        if self.queue.default_volume > self.queue.max_volume {
            anyhow::bail!(
                "Default volume must be between 0 and {}, got: {}",
                self.queue.max_volume,
                self.queue.default_volume
            );
        }

        if self.queue.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        let timer = |t: Option<Duration>| {
            t.map_or("disabled".to_string(), |d| humantime::format_duration(d).to_string())
        };

        format!(
            "Config Summary:\n  \
            Queue: {}% vol (max {}%), {} songs max, {} stream retries, single room={}\n  \
            Inactivity: alone {}, idle {}\n  \
            Song cache: soft {}, hard {}, clean after {}, refresh every {}",
            self.queue.default_volume,
            self.queue.max_volume,
            self.queue.max_queue_size,
            self.queue.max_stream_retries,
            self.queue.single_room,
            timer(self.inactivity.alone_timeout()),
            timer(self.inactivity.idle_timeout()),
            self.song_manager.soft_limit,
            self.song_manager.hard_limit,
            humantime::format_duration(self.song_manager.clean_delay()),
            humantime::format_duration(self.song_manager.refresh_interval()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.default_volume, 70);
        assert_eq!(config.inactivity.alone_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.inactivity.idle_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn negative_timeouts_disable_timers() {
        let settings = InactivitySettings {
            wait_rejoin_seconds: -1,
            bot_idle_seconds: 0,
        };
        assert_eq!(settings.alone_timeout(), None);
        assert_eq!(settings.idle_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn rejects_hard_limit_below_soft_limit() {
        let mut config = Config::default();
        config.song_manager.soft_limit = 10;
        config.song_manager.hard_limit = 5;
        assert!(config.validate().is_err());

        config.song_manager.soft_limit = 0;
        config.song_manager.hard_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_default_volume_above_max() {
        let mut config = Config::default();
        config.queue.default_volume = 250;
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_mentions_disabled_timers() {
        let mut config = Config::default();
        config.inactivity.wait_rejoin_seconds = -5;
        let summary = config.summary();
        assert!(summary.contains("alone disabled"));
        assert!(summary.contains("idle 10m"));
    }
}
