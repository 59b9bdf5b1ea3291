pub mod file;
pub mod process;
pub mod youtube;

use anyhow::Context as _;
use async_trait::async_trait;
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};
use tokio::runtime::Handle;
use tracing::{info, warn};

pub use file::FileSource;
pub use youtube::YouTubeSource;

use crate::{
    config::{SongManagerSettings, ToolSettings},
    error::{QueueError, Result},
    song::{Song, SongMetadata, SourceKind},
};

/// Interfaz común para cada tipo de fuente (YouTube, archivo, ...).
///
/// El [`SongManager`](crate::cache::SongManager) solo depende de este trait:
/// resolver un localizador a metadata, abrir un stream con offset y describir
/// los campos extra para el embed de "now playing".
#[async_trait]
pub trait SongSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Verifica si el localizador pertenece a esta fuente
    fn accepts(&self, locator: &str) -> bool;

    /// Id canónico: dos localizadores de la misma canción dan el mismo id
    fn song_id(&self, locator: &str) -> Result<String>;

    async fn resolve(&self, locator: &str) -> Result<SongMetadata>;

    async fn open_stream(&self, song: &Song, seek: Duration) -> Result<AudioStream>;

    fn describe(&self, metadata: &SongMetadata) -> Vec<EmbedField>;

    /// Cuánto dura la metadata antes de considerarse vieja (`None` = nunca)
    fn metadata_ttl(&self) -> Option<Duration> {
        None
    }

    /// Entradas de una playlist, o `None` si el localizador no es una playlist
    async fn expand_playlist(&self, _locator: &str) -> Result<Option<Vec<PlaylistEntry>>> {
        Ok(None)
    }
}

/// Campo extra de un embed (nombre, valor, inline)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    pub fn inline(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline: true,
        }
    }
}

/// Canción de una playlist con metadata ya conocida
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub locator: String,
    pub metadata: SongMetadata,
}

/// Bytes de audio listos para el sink
#[derive(Debug)]
pub enum AudioStream {
    /// URL remota que el sink descarga directamente
    Url(String),
    /// Archivo local
    File(PathBuf),
    /// Proceso (ffmpeg) que escribe el audio por stdout
    Process(std::process::Child),
}

impl AudioStream {
    /// Libera el stream sin reproducirlo (mata el proceso si lo hay)
    pub fn discard(self) {
        let AudioStream::Process(mut child) = self else {
            return;
        };
        if let Err(e) = child.kill() {
            warn!("⚠️ No se pudo terminar el proceso de stream: {}", e);
        }

        // Recoger el proceso sin bloquear un worker del runtime
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = child.wait();
                });
            }
            Err(_) => {
                let _ = child.wait();
            }
        }
    }
}

/// Fuentes registradas, en orden de prioridad
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn SongSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// YouTube y archivos, configurados con las herramientas indicadas
    pub fn with_defaults(tools: &ToolSettings, songs: &SongManagerSettings) -> Self {
        Self::new()
            .register(Arc::new(YouTubeSource::new(tools.clone(), songs.youtube_metadata_ttl())))
            .register(Arc::new(FileSource::new(tools.clone())))
    }

    pub fn register(mut self, source: Arc<dyn SongSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn for_locator(&self, locator: &str) -> Result<Arc<dyn SongSource>> {
        self.sources
            .iter()
            .find(|source| source.accepts(locator))
            .cloned()
            .ok_or_else(|| QueueError::unresolvable(locator, "no source accepts this locator"))
    }

    pub fn for_kind(&self, kind: SourceKind) -> Option<Arc<dyn SongSource>> {
        self.sources.iter().find(|source| source.kind() == kind).cloned()
    }

    /// Verifica que yt-dlp, ffmpeg y ffprobe estén disponibles
    pub async fn verify_tools(tools: &ToolSettings) -> anyhow::Result<()> {
        let checks = [
            (tools.yt_dlp.as_str(), "--version"),
            (tools.ffmpeg.as_str(), "-version"),
            (tools.ffprobe.as_str(), "-version"),
        ];

        for (program, flag) in checks {
            let output = async_process::Command::new(program)
                .arg(flag)
                .output()
                .await
                .with_context(|| format!("{} no encontrado", program))?;

            if !output.status.success() {
                anyhow::bail!("{} no funciona correctamente", program);
            }

            let version = String::from_utf8_lossy(&output.stdout);
            info!("✅ {}: {}", program, version.lines().next().unwrap_or_default().trim());
        }

        Ok(())
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|source| source.kind()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SourceRegistry {
        SourceRegistry::with_defaults(&ToolSettings::default(), &SongManagerSettings::default())
    }

    #[test]
    fn picks_source_by_locator() {
        let registry = registry();

        let youtube = registry
            .for_locator("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .unwrap();
        assert_eq!(youtube.kind(), SourceKind::YouTube);

        let file = registry.for_locator("https://cdn.example.com/music/track.flac").unwrap();
        assert_eq!(file.kind(), SourceKind::File);
    }

    #[test]
    fn unknown_locator_is_unresolvable() {
        let err = registry().for_locator("https://example.com/page").err().unwrap();
        assert!(matches!(err, QueueError::Unresolvable { .. }));
    }

    #[test]
    fn finds_source_by_kind() {
        let registry = registry();
        assert!(registry.for_kind(SourceKind::File).is_some());
        assert!(SourceRegistry::new().for_kind(SourceKind::YouTube).is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn discard_kills_and_reaps_process() {
        let Ok(child) = std::process::Command::new("sleep").arg("30").spawn() else {
            return;
        };
        let pid = child.id();
        let started = std::time::Instant::now();

        AudioStream::Process(child).discard();
        assert!(started.elapsed() < Duration::from_secs(5));

        // Sin zombie: /proc/<pid> desaparece una vez recogido
        let proc_dir = PathBuf::from(format!("/proc/{}", pid));
        for _ in 0..500 {
            if !proc_dir.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {} was not reaped", pid);
    }
}
