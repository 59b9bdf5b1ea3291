//! # Song Module
//!
//! Canonical, cacheable representation of one piece of media.
//!
//! A [`Song`] is owned by the [`SongManager`](crate::cache::SongManager) and
//! shared by every room that enqueues it; rooms hold [`SongReference`]s and
//! never own songs directly. Metadata is refreshed in place once it goes
//! stale, so readers always go through the accessor methods.

pub mod reference;

pub use reference::SongReference;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, warn};

use crate::sources::{EmbedField, SongSource};

/// Tipo de fuente de una canción
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    YouTube,
    File,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::YouTube => write!(f, "youtube"),
            SourceKind::File => write!(f, "file"),
        }
    }
}

/// Metadata resuelta de una canción.
///
/// `duration == None` significa duración desconocida (infinita hasta que se
/// resuelva).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: String,
    pub duration: Option<Duration>,
    pub artist: Option<String>,
    pub thumbnail: Option<String>,
    pub album: Option<String>,
    pub view_count: Option<u64>,
}

impl SongMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct Song {
    id: String,
    locator: String,
    kind: SourceKind,
    metadata: RwLock<SongMetadata>,
    /// `None` = la metadata nunca caduca
    metadata_expiry: RwLock<Option<DateTime<Utc>>>,
    references: AtomicUsize,
    refreshing: AtomicBool,
}

impl Song {
    pub fn new(
        id: impl Into<String>,
        locator: impl Into<String>,
        kind: SourceKind,
        metadata: SongMetadata,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            kind,
            metadata: RwLock::new(metadata),
            metadata_expiry: RwLock::new(expiry_from_now(ttl)),
            references: AtomicUsize::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn metadata(&self) -> SongMetadata {
        self.metadata.read().clone()
    }

    pub fn title(&self) -> String {
        self.metadata.read().title.clone()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.metadata.read().duration
    }

    pub fn metadata_expiry(&self) -> Option<DateTime<Utc>> {
        *self.metadata_expiry.read()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.metadata_expiry().is_some_and(|expiry| now > expiry)
    }

    /// Número de referencias vivas en colas
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Nunca baja de cero
    pub(crate) fn release(&self) {
        let released = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("⚠️ Liberación extra de referencia para {}", self.id);
        }
    }

    /// Fuerza la caducidad de la metadata (la próxima lectura la refresca)
    pub fn expire_metadata(&self) {
        *self.metadata_expiry.write() = Some(Utc::now() - chrono::Duration::seconds(1));
    }

    /// Refresca la metadata en su lugar usando la fuente de la canción.
    ///
    /// Best-effort: si falla se conserva la metadata anterior y la caducidad
    /// no cambia, así el siguiente barrido lo vuelve a intentar.
    pub async fn refresh(&self, source: &dyn SongSource) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        match source.resolve(&self.locator).await {
            Ok(metadata) => {
                debug!("🔄 Metadata actualizada: {}", metadata.title);
                *self.metadata.write() = metadata;
                *self.metadata_expiry.write() = expiry_from_now(source.metadata_ttl());
            }
            Err(e) => {
                warn!("⚠️ No se pudo refrescar la metadata de {}: {}", self.id, e);
            }
        }

        self.refreshing.store(false, Ordering::Release);
    }

    pub fn summary(&self, fields: Vec<EmbedField>) -> SongSummary {
        let metadata = self.metadata();
        SongSummary {
            id: self.id.clone(),
            locator: self.locator.clone(),
            title: metadata.title,
            duration: metadata.duration,
            artist: metadata.artist,
            thumbnail: metadata.thumbnail,
            fields,
        }
    }
}

fn expiry_from_now(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// Instantánea de una canción para mostrar en embeds y eventos
#[derive(Debug, Clone, PartialEq)]
pub struct SongSummary {
    pub id: String,
    pub locator: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub artist: Option<String>,
    pub thumbnail: Option<String>,
    pub fields: Vec<EmbedField>,
}

impl SongSummary {
    pub fn formatted_duration(&self) -> String {
        self.duration.map_or_else(|| "∞".to_string(), format_duration)
    }
}

/// Formatea una duración como `MM:SS` o `Hh MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs_f64().round() as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(ttl: Option<Duration>) -> Song {
        Song::new("file_a", "https://cdn.test/a.mp3", SourceKind::File, SongMetadata::titled("A"), ttl)
    }

    #[test]
    fn format_duration_pads_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(5)), "00:05");
        assert_eq!(format_duration(Duration::from_secs(185)), "03:05");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02:03");
        assert_eq!(format_duration(Duration::from_millis(59_600)), "01:00");
    }

    #[test]
    fn references_never_go_negative() {
        let song = song(None);
        song.release();
        assert_eq!(song.references(), 0);

        song.retain();
        song.retain();
        song.release();
        assert_eq!(song.references(), 1);
    }

    #[test]
    fn metadata_without_ttl_never_goes_stale() {
        let song = song(None);
        assert!(!song.is_stale(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn metadata_goes_stale_after_ttl() {
        let song = song(Some(Duration::from_secs(60)));
        assert!(!song.is_stale(Utc::now()));
        assert!(song.is_stale(Utc::now() + chrono::Duration::seconds(120)));

        song.expire_metadata();
        assert!(song.is_stale(Utc::now()));
    }
}
