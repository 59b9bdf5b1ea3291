use serenity::model::id::{GuildId, UserId};
use std::time::Duration;

use super::{cursor::LoopMode, queue::PlaybackState};

/// Una entrada de la cola vista desde afuera
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Posición 1-based (la que usa `jump`)
    pub position: usize,
    pub song_id: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub requested_by: UserId,
}

/// Copia inmutable del estado de una sala, para listados y embeds
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub room: GuildId,
    pub state: PlaybackState,
    pub entries: Vec<SnapshotEntry>,
    /// Cursor 0-based; puede ser igual a `entries.len()` al terminar la cola
    pub index: usize,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u16,
    /// Progreso de la canción actual
    pub position: Option<Duration>,
}

impl QueueSnapshot {
    /// La canción bajo el cursor mientras hay algo reproduciéndose
    pub fn now_playing(&self) -> Option<&SnapshotEntry> {
        match self.state {
            PlaybackState::Idle => None,
            _ => self.entries.get(self.index),
        }
    }

    pub fn total_items(&self) -> usize {
        self.entries.len()
    }

    /// Suma de las duraciones conocidas
    pub fn total_duration(&self) -> Duration {
        self.entries.iter().filter_map(|entry| entry.duration).sum()
    }

    /// Obtiene una página específica de la cola
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_items = self.entries.len();
        let total_pages = if total_items == 0 { 1 } else { total_items.div_ceil(items_per_page) };
        let safe_page = page.clamp(1, total_pages);

        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(total_items);

        QueuePage {
            items: self.entries.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            current_page: safe_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePage {
    pub items: Vec<SnapshotEntry>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
