//! Seams between the playback core and the voice transport.
//!
//! A room talks to two collaborators: the [`VoiceConnection`] (join/leave
//! the voice channel) and the [`OutputSink`] (play one stream at a time).
//! [`SongbirdSession`] implements both on top of songbird.

pub mod session;

pub use session::SongbirdSession;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{error::Result, sources::AudioStream};

/// Cómo terminó un stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Fin natural o `stop()` explícito
    Finished,
    Failed(String),
}

/// Evento de fin de stream, etiquetado con la generación que lo inició
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnd {
    pub generation: u64,
    pub outcome: StreamOutcome,
}

/// Se entrega al sink junto con cada stream.
///
/// El sink debe consumirlo exactamente una vez con [`finish`](Self::finish)
/// o [`fail`](Self::fail). Soltarlo sin consumirlo no emite nada.
#[derive(Debug)]
pub struct CompletionHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<StreamEnd>,
}

impl CompletionHandle {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<StreamEnd>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn finish(self) {
        self.send(StreamOutcome::Finished);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.send(StreamOutcome::Failed(reason.into()));
    }

    fn send(self, outcome: StreamOutcome) {
        let end = StreamEnd {
            generation: self.generation,
            outcome,
        };
        // La cola ya no existe: nadie espera este evento
        if self.tx.send(end).is_err() {
            debug!("Evento de fin de stream descartado (generación {})", self.generation);
        }
    }
}

/// Destino del audio de una sala
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Empieza a reproducir `stream`, reemplazando cualquier stream anterior.
    ///
    /// Si devuelve error el handle se descarta sin emitir nada.
    async fn subscribe(&self, stream: AudioStream, volume: u16, completion: CompletionHandle) -> Result<()>;

    async fn stop(&self);

    async fn pause(&self) -> Result<()>;

    async fn unpause(&self) -> Result<()>;

    async fn set_volume(&self, volume: u16) -> Result<()>;
}

/// Conexión al canal de voz de una sala
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    async fn join(&self) -> Result<()>;

    async fn leave(&self) -> Result<()>;
}

/// Convierte volumen en porcentaje (100 = original) a ganancia lineal.
///
/// La curva es logarítmica para que los pasos de volumen se perciban
/// uniformes.
pub fn volume_gain(volume: u16) -> f32 {
    (f32::from(volume) / 100.0).powf(1.660964)
}
