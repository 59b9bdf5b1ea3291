use serenity::model::id::{ChannelId, UserId};
use std::sync::Arc;

use super::Song;
use crate::{cache::SongManager, error::Result};

/// Handle ligero hacia una canción cacheada.
///
/// Acopla el id de la canción con quién la pidió y dónde avisar. No guarda
/// estado de la canción: [`SongReference::song`] la busca en el
/// [`SongManager`] cada vez. Las colas cuentan las referencias que contienen
/// (`Song::references`), no la creación del handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongReference {
    song_id: String,
    requested_by: UserId,
    notify_channel: ChannelId,
}

impl SongReference {
    pub(crate) fn new(song_id: impl Into<String>, requested_by: UserId, notify_channel: ChannelId) -> Self {
        Self {
            song_id: song_id.into(),
            requested_by,
            notify_channel,
        }
    }

    pub fn song_id(&self) -> &str {
        &self.song_id
    }

    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    pub fn notify_channel(&self) -> ChannelId {
        self.notify_channel
    }

    /// Falla con `SongNotFound` si la canción ya no está en caché
    pub fn song(&self, songs: &SongManager) -> Result<Arc<Song>> {
        songs.get(&self.song_id)
    }
}
