use serenity::model::id::GuildId;
use thiserror::Error;

/// Errores del núcleo de reproducción.
///
/// La capa de comandos traduce cada variante a un mensaje para el usuario;
/// el núcleo solo se recupera por sí mismo de `StreamUnavailable` durante
/// la reproducción (reintentos acotados).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("song `{0}` is not in the cache")]
    SongNotFound(String),

    #[error("no queue exists for room {0}")]
    RoomNotFound(GuildId),

    #[error("position {position} is out of range (queue has {len} songs)")]
    OutOfRange { position: usize, len: usize },

    #[error("song cache is full ({limit} songs)")]
    CacheFull { limit: usize },

    #[error("queue is full ({limit} songs)")]
    QueueFull { limit: usize },

    #[error("could not resolve `{locator}`: {reason}")]
    Unresolvable { locator: String, reason: String },

    #[error("stream unavailable for `{song}`: {reason}")]
    StreamUnavailable { song: String, reason: String },

    #[error("song `{0}` already exists in the cache")]
    AlreadyExists(String),

    #[error("voice connection failed: {0}")]
    Voice(String),
}

impl QueueError {
    pub(crate) fn unresolvable(locator: &str, reason: impl ToString) -> Self {
        Self::Unresolvable {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn stream_unavailable(song: &str, reason: impl ToString) -> Self {
        Self::StreamUnavailable {
            song: song.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
