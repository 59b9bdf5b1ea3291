use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use super::{process, AudioStream, EmbedField, PlaylistEntry, SongSource};
use crate::{
    config::ToolSettings,
    error::{QueueError, Result},
    song::{Song, SongMetadata, SourceKind},
};

/// Fuente de YouTube basada en yt-dlp (metadata, URL de stream, playlists)
pub struct YouTubeSource {
    tools: ToolSettings,
    metadata_ttl: Duration,
    // Limitar llamadas concurrentes a yt-dlp para evitar rate limiting
    rate_limiter: Semaphore,
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct YtDlpPlaylist {
    #[serde(default)]
    entries: Vec<YtDlpPlaylistEntry>,
}

#[derive(Debug, Deserialize)]
struct YtDlpPlaylistEntry {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
}

impl YouTubeSource {
    pub fn new(tools: ToolSettings, metadata_ttl: Duration) -> Self {
        Self {
            tools,
            metadata_ttl,
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Id canónico a partir del id de video
    pub fn song_id_for(video_id: &str) -> String {
        format!("youtube_{}", video_id)
    }

    pub fn watch_url(video_id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", video_id)
    }

    pub fn thumbnail_url(video_id: &str) -> String {
        format!("https://img.youtube.com/vi/{}/maxresdefault.jpg", video_id)
    }

    /// Extrae el id de video de URLs `watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`
    pub fn extract_video_id(locator: &str) -> Option<String> {
        let parsed = Url::parse(locator.trim()).ok()?;
        let candidate = match youtube_host(&parsed)? {
            YouTubeHost::Short => parsed.path_segments()?.next().map(str::to_string),
            YouTubeHost::Main => {
                if parsed.path() == "/watch" {
                    parsed
                        .query_pairs()
                        .find(|(key, _)| key == "v")
                        .map(|(_, value)| value.into_owned())
                } else {
                    let mut segments = parsed.path_segments()?;
                    match segments.next() {
                        Some("shorts") | Some("embed") | Some("live") => {
                            segments.next().map(str::to_string)
                        }
                        _ => None,
                    }
                }
            }
        }?;

        is_video_id(&candidate).then_some(candidate)
    }

    /// Id de playlist (`list=`), ignorando "Ver más tarde" (WL)
    pub fn extract_playlist_id(locator: &str) -> Option<String> {
        let parsed = Url::parse(locator.trim()).ok()?;
        youtube_host(&parsed)?;

        parsed
            .query_pairs()
            .find(|(key, _)| key == "list")
            .map(|(_, value)| value.into_owned())
            .filter(|list| !list.is_empty() && list != "WL")
    }

    async fn stream_url(&self, url: &str) -> std::result::Result<String, String> {
        let _permit = self.rate_limiter.acquire().await.map_err(|e| e.to_string())?;

        debug!("🎵 Obteniendo URL de stream para: {}", url);
        let stdout = process::run_text(
            &self.tools.yt_dlp,
            &[
                "--no-playlist",
                "-f",
                "bestaudio[ext=m4a]/bestaudio/best",
                "--get-url",
                "--no-warnings",
                url,
            ],
        )
        .await?;

        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| "yt-dlp returned no stream url".to_string())
    }
}

enum YouTubeHost {
    Main,
    Short,
}

fn youtube_host(url: &Url) -> Option<YouTubeHost> {
    let host = url.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    let host = host.strip_prefix("m.").unwrap_or(host);

    match host {
        "youtube.com" | "music.youtube.com" => Some(YouTubeHost::Main),
        "youtu.be" => Some(YouTubeHost::Short),
        _ => None,
    }
}

fn is_video_id(candidate: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_-]{11}$")
        .map(|regex| regex.is_match(candidate))
        .unwrap_or(false)
}

fn seconds(duration: Option<f64>) -> Option<Duration> {
    duration
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| Duration::from_secs(secs.round() as u64))
}

#[async_trait]
impl SongSource for YouTubeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::YouTube
    }

    fn accepts(&self, locator: &str) -> bool {
        Self::extract_video_id(locator).is_some() || Self::extract_playlist_id(locator).is_some()
    }

    fn song_id(&self, locator: &str) -> Result<String> {
        Self::extract_video_id(locator)
            .map(|id| Self::song_id_for(&id))
            .ok_or_else(|| QueueError::unresolvable(locator, "not a YouTube video url"))
    }

    async fn resolve(&self, locator: &str) -> Result<SongMetadata> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| QueueError::unresolvable(locator, e))?;

        debug!("📊 Obteniendo info de: {}", locator);
        let info: YtDlpInfo = process::run_json(
            &self.tools.yt_dlp,
            &["--dump-single-json", "--no-playlist", "--skip-download", "--no-warnings", locator],
        )
        .await
        .map_err(|e| QueueError::unresolvable(locator, e))?;

        Ok(SongMetadata {
            thumbnail: Some(Self::thumbnail_url(&info.id)),
            title: info.title,
            duration: seconds(info.duration),
            artist: info.uploader.or(info.channel),
            album: None,
            view_count: info.view_count,
        })
    }

    async fn open_stream(&self, song: &Song, seek: Duration) -> Result<AudioStream> {
        let stream_url = self
            .stream_url(song.locator())
            .await
            .map_err(|e| QueueError::stream_unavailable(song.id(), e))?;

        if seek.is_zero() {
            return Ok(AudioStream::Url(stream_url));
        }

        process::ffmpeg_seek(&self.tools.ffmpeg, &stream_url, seek)
            .map_err(|e| QueueError::stream_unavailable(song.id(), e))
    }

    fn describe(&self, metadata: &SongMetadata) -> Vec<EmbedField> {
        let mut fields = vec![EmbedField::inline(
            "YT Channel",
            metadata.artist.as_deref().unwrap_or("No artist"),
        )];
        if let Some(views) = metadata.view_count {
            fields.push(EmbedField::inline("Views", views.to_string()));
        }
        fields
    }

    fn metadata_ttl(&self) -> Option<Duration> {
        Some(self.metadata_ttl)
    }

    async fn expand_playlist(&self, locator: &str) -> Result<Option<Vec<PlaylistEntry>>> {
        let Some(list_id) = Self::extract_playlist_id(locator) else {
            return Ok(None);
        };

        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| QueueError::unresolvable(locator, e))?;

        let playlist_url = format!("https://www.youtube.com/playlist?list={}", list_id);
        let playlist: YtDlpPlaylist = process::run_json(
            &self.tools.yt_dlp,
            &["--flat-playlist", "--dump-single-json", "--no-warnings", &playlist_url],
        )
        .await
        .map_err(|e| QueueError::unresolvable(locator, e))?;

        let entries: Vec<PlaylistEntry> = playlist
            .entries
            .into_iter()
            .filter(|entry| is_video_id(&entry.id))
            .map(|entry| PlaylistEntry {
                locator: Self::watch_url(&entry.id),
                metadata: SongMetadata {
                    title: entry.title.unwrap_or_else(|| "Unknown Title".to_string()),
                    duration: seconds(entry.duration),
                    artist: entry.uploader.or(entry.channel),
                    thumbnail: Some(Self::thumbnail_url(&entry.id)),
                    album: None,
                    view_count: None,
                },
            })
            .collect();

        info!("📃 Playlist {} con {} canciones", list_id, entries.len());
        Ok(Some(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source() -> YouTubeSource {
        YouTubeSource::new(ToolSettings::default(), Duration::from_secs(3600))
    }

    #[test]
    fn test_video_id_extraction() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            assert_eq!(
                YouTubeSource::extract_video_id(url).as_deref(),
                Some("dQw4w9WgXcQ"),
                "{}",
                url
            );
        }

        assert_eq!(YouTubeSource::extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ"), None);
        assert_eq!(YouTubeSource::extract_video_id("https://youtu.be/short"), None);
        assert_eq!(YouTubeSource::extract_video_id("not a url"), None);
    }

    #[test]
    fn same_video_gives_same_song_id() {
        let source = source();
        let a = source.song_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        let b = source.song_id("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(a, "youtube_dQw4w9WgXcQ");
        assert_eq!(a, b);
    }

    #[test]
    fn test_playlist_id_extraction() {
        assert_eq!(
            YouTubeSource::extract_playlist_id("https://www.youtube.com/playlist?list=PL1234567890").as_deref(),
            Some("PL1234567890")
        );
        assert_eq!(
            YouTubeSource::extract_playlist_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=WL"),
            None
        );
        assert_eq!(YouTubeSource::extract_playlist_id("https://example.com/?list=PL1"), None);
    }

    #[test]
    fn playlist_only_url_is_accepted_but_has_no_song_id() {
        let source = source();
        let url = "https://www.youtube.com/playlist?list=PL1234567890";
        assert!(source.accepts(url));
        assert!(source.song_id(url).is_err());
    }

    #[test]
    fn describe_adds_channel_field() {
        let mut metadata = SongMetadata::titled("Song");
        let fields = source().describe(&metadata);
        assert_eq!(fields, vec![EmbedField::inline("YT Channel", "No artist")]);

        metadata.artist = Some("Rick".to_string());
        metadata.view_count = Some(42);
        let fields = source().describe(&metadata);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value, "Rick");
        assert_eq!(fields[1].value, "42");
    }
}
