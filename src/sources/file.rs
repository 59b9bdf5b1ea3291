use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};
use tracing::debug;
use url::Url;

use super::{process, AudioStream, EmbedField, SongSource};
use crate::{
    config::ToolSettings,
    error::{QueueError, Result},
    song::{Song, SongMetadata, SourceKind},
};

const FILE_EXTENSIONS: &[&str] = &["mp3", "ogg", "flac", "webm", "mp4", "mov", "wav", "m4a", "opus"];

/// Archivos de audio/video: URLs directas o rutas locales, probados con ffprobe
pub struct FileSource {
    tools: ToolSettings,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl ProbeFormat {
    /// Los tags de ffprobe cambian de mayúsculas según el contenedor
    fn tag(&self, name: &str) -> Option<String> {
        self.tags
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// Dónde vive el archivo
enum Location {
    Remote(Url),
    Local(PathBuf),
}

impl FileSource {
    pub fn new(tools: ToolSettings) -> Self {
        Self { tools }
    }

    fn locate(locator: &str) -> Option<Location> {
        let locator = locator.trim();
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(Location::Remote(url)),
            Ok(url) if url.scheme() == "file" => url.to_file_path().ok().map(Location::Local),
            // Rutas de Windows ("C:\...") se parsean como URL con esquema de una letra
            Ok(url) if url.scheme().len() > 1 => None,
            _ => Some(Location::Local(PathBuf::from(locator))),
        }
    }

    fn file_name(locator: &str) -> Option<String> {
        let name = match Self::locate(locator)? {
            Location::Remote(url) => url.path_segments()?.last()?.to_string(),
            Location::Local(path) => path.file_name()?.to_string_lossy().into_owned(),
        };
        (!name.is_empty()).then_some(name)
    }

    fn has_known_extension(locator: &str) -> bool {
        Self::file_name(locator)
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
            .is_some_and(|ext| FILE_EXTENSIONS.contains(&ext.as_str()))
    }

    fn probe_metadata(locator: &str, probe: ProbeOutput) -> SongMetadata {
        let format = probe.format;
        let title = format
            .tag("title")
            .or_else(|| Self::file_name(locator))
            .unwrap_or_else(|| locator.to_string());

        SongMetadata {
            title,
            duration: format
                .duration
                .as_deref()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(|secs| Duration::from_secs(secs.round() as u64)),
            artist: format.tag("artist"),
            album: format.tag("album"),
            thumbnail: None,
            view_count: None,
        }
    }
}

#[async_trait]
impl SongSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn accepts(&self, locator: &str) -> bool {
        Self::has_known_extension(locator)
    }

    fn song_id(&self, locator: &str) -> Result<String> {
        if !self.accepts(locator) {
            return Err(QueueError::unresolvable(locator, "unsupported file type"));
        }
        Ok(locator.trim().to_string())
    }

    async fn resolve(&self, locator: &str) -> Result<SongMetadata> {
        debug!("🔍 Probando archivo: {}", locator);
        let probe: ProbeOutput = process::run_json(
            &self.tools.ffprobe,
            &["-v", "quiet", "-print_format", "json", "-show_format", locator.trim()],
        )
        .await
        .map_err(|e| QueueError::unresolvable(locator, e))?;

        Ok(Self::probe_metadata(locator, probe))
    }

    async fn open_stream(&self, song: &Song, seek: Duration) -> Result<AudioStream> {
        let location = Self::locate(song.locator())
            .ok_or_else(|| QueueError::stream_unavailable(song.id(), "invalid locator"))?;

        if !seek.is_zero() {
            let input = match &location {
                Location::Remote(url) => url.to_string(),
                Location::Local(path) => path.to_string_lossy().into_owned(),
            };
            return process::ffmpeg_seek(&self.tools.ffmpeg, &input, seek)
                .map_err(|e| QueueError::stream_unavailable(song.id(), e));
        }

        match location {
            Location::Remote(url) => Ok(AudioStream::Url(url.to_string())),
            Location::Local(path) if path.is_file() => Ok(AudioStream::File(path)),
            Location::Local(path) => Err(QueueError::stream_unavailable(
                song.id(),
                format!("file not found: {}", path.display()),
            )),
        }
    }

    fn describe(&self, metadata: &SongMetadata) -> Vec<EmbedField> {
        vec![
            EmbedField::inline("Artist", metadata.artist.as_deref().unwrap_or("No artist")),
            EmbedField::inline("Album", metadata.album.as_deref().unwrap_or("No album")),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source() -> FileSource {
        FileSource::new(ToolSettings::default())
    }

    #[test]
    fn accepts_known_extensions_only() {
        let source = source();
        assert!(source.accepts("https://cdn.example.com/music/track.FLAC"));
        assert!(source.accepts("https://cdn.example.com/a.mp3?token=abc"));
        assert!(source.accepts("/srv/music/song.opus"));
        assert!(source.accepts("file:///srv/music/song.ogg"));
        assert!(!source.accepts("https://cdn.example.com/page.html"));
        assert!(!source.accepts("https://cdn.example.com/"));
        assert!(!source.accepts("ftp://cdn.example.com/a.mp3"));
    }

    #[test]
    fn song_id_is_the_locator() {
        let id = source().song_id("https://cdn.example.com/a.mp3").unwrap();
        assert_eq!(id, "https://cdn.example.com/a.mp3");
        assert!(source().song_id("https://cdn.example.com/a.txt").is_err());
    }

    #[test]
    fn probe_tags_are_case_insensitive() {
        let probe: ProbeOutput = serde_json::from_str(
            r#"{"format": {"duration": "183.6", "tags": {"TITLE": "Song", "Artist": "Band", "album": "Record"}}}"#,
        )
        .unwrap();

        let metadata = FileSource::probe_metadata("https://cdn.example.com/a.mp3", probe);
        assert_eq!(metadata.title, "Song");
        assert_eq!(metadata.artist.as_deref(), Some("Band"));
        assert_eq!(metadata.album.as_deref(), Some("Record"));
        assert_eq!(metadata.duration, Some(Duration::from_secs(184)));
    }

    #[test]
    fn title_falls_back_to_file_name() {
        let probe: ProbeOutput = serde_json::from_str(r#"{"format": {}}"#).unwrap();
        let metadata = FileSource::probe_metadata("https://cdn.example.com/music/track%201.mp3", probe);
        assert_eq!(metadata.title, "track%201.mp3");
        assert_eq!(metadata.duration, None);
    }

    #[test]
    fn file_metadata_never_expires() {
        assert_eq!(source().metadata_ttl(), None);
    }

    #[test]
    fn describe_lists_artist_and_album() {
        let fields = source().describe(&SongMetadata::titled("x"));
        assert_eq!(
            fields,
            vec![
                EmbedField::inline("Artist", "No artist"),
                EmbedField::inline("Album", "No album"),
            ]
        );
    }
}
