//! Events the playback core publishes for the chat/UI layer.
//!
//! Delivery is fire-and-forget: the core never waits on a notifier and never
//! fails because one did.

use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::{LeaveReason, LoopMode},
    song::SongSummary,
};

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Canciones agregadas; `position` es la posición 1-based de la primera
    Enqueued {
        room: GuildId,
        channel: ChannelId,
        requested_by: UserId,
        songs: Vec<SongSummary>,
        position: usize,
    },
    NowPlaying {
        room: GuildId,
        channel: ChannelId,
        requested_by: UserId,
        song: SongSummary,
        position: usize,
        total: usize,
        volume: u16,
        loop_mode: LoopMode,
    },
    /// Se terminó de reproducir toda la cola
    FinishedPlaying { room: GuildId, channel: ChannelId },
    /// Una canción falló más veces de las permitidas y se saltó
    PlaybackFailed {
        room: GuildId,
        channel: ChannelId,
        song_id: String,
        reason: String,
    },
    Leaving {
        room: GuildId,
        channel: ChannelId,
        reason: LeaveReason,
    },
    /// La sala se desconectó; la UI de la cola debe deshabilitarse
    Disconnected { room: GuildId },
}

impl QueueEvent {
    pub fn room(&self) -> GuildId {
        match self {
            QueueEvent::Enqueued { room, .. }
            | QueueEvent::NowPlaying { room, .. }
            | QueueEvent::FinishedPlaying { room, .. }
            | QueueEvent::PlaybackFailed { room, .. }
            | QueueEvent::Leaving { room, .. }
            | QueueEvent::Disconnected { room } => *room,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: QueueEvent);
}

/// Solo escribe los eventos en el log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: QueueEvent) {
        match event {
            QueueEvent::Enqueued { room, songs, position, .. } => {
                info!("➕ [{}] {} canciones agregadas en la posición {}", room, songs.len(), position);
            }
            QueueEvent::NowPlaying { room, song, position, total, .. } => {
                info!(
                    "🎵 [{}] Reproduciendo ({}/{}): {} [{}]",
                    room,
                    position,
                    total,
                    song.title,
                    song.formatted_duration()
                );
            }
            QueueEvent::FinishedPlaying { room, .. } => {
                info!("📭 [{}] Se terminaron de reproducir todas las canciones", room);
            }
            QueueEvent::PlaybackFailed { room, song_id, reason, .. } => {
                warn!("❌ [{}] No se pudo reproducir {}: {}", room, song_id, reason);
            }
            QueueEvent::Leaving { room, reason, .. } => {
                info!("👋 [{}] Saliendo del canal ({})", room, reason);
            }
            QueueEvent::Disconnected { room } => {
                debug!("🔌 [{}] Desconectado", room);
            }
        }
    }
}

/// Reenvía los eventos por un canal para que la capa de comandos los consuma
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<QueueEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: QueueEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("Evento sin receptor para la sala {}", e.0.room());
        }
    }
}
