//! Fakes compartidos por los tests: fuente con fallos programables, sink que
//! registra cada stream y notifier que guarda los eventos.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    audio::{InactivityHelper, JoinContext, ServerQueue},
    cache::SongManager,
    config::{InactivitySettings, QueueSettings, SongManagerSettings},
    error::{QueueError, Result},
    notifier::{Notifier, QueueEvent},
    song::{Song, SongMetadata, SongReference, SourceKind},
    sources::{AudioStream, EmbedField, PlaylistEntry, SongSource, SourceRegistry},
    voice::{CompletionHandle, MockVoiceConnection, OutputSink, VoiceConnection},
};

pub const USER: UserId = UserId::new(10);
pub const TEXT: ChannelId = ChannelId::new(20);
pub const VOICE: ChannelId = ChannelId::new(21);

/// Deja correr las tareas pendientes (eventos de fin, timers, refrescos)
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}

/// Fuente `fake://<nombre>` con id `fake_<nombre>`
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<FakeSourceState>,
    resolves: AtomicUsize,
}

#[derive(Default)]
struct FakeSourceState {
    ttl: Option<Duration>,
    broken: HashSet<String>,
    titles: HashMap<String, String>,
    stream_failures: HashMap<String, u32>,
    playlists: HashMap<String, Vec<PlaylistEntry>>,
    opened: Vec<(String, Duration)>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ttl(&self, ttl: Option<Duration>) {
        self.state.lock().ttl = ttl;
    }

    pub fn fail_resolve(&self, locator: &str) {
        self.state.lock().broken.insert(locator.to_string());
    }

    pub fn retitle(&self, locator: &str, title: &str) {
        self.state.lock().titles.insert(locator.to_string(), title.to_string());
    }

    /// Las próximas `times` aperturas de stream fallan (`u32::MAX` = siempre)
    pub fn fail_streams(&self, locator: &str, times: u32) {
        self.state.lock().stream_failures.insert(locator.to_string(), times);
    }

    pub fn add_playlist(&self, locator: &str, entries: Vec<PlaylistEntry>) {
        self.state.lock().playlists.insert(locator.to_string(), entries);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<(String, Duration)> {
        self.state.lock().opened.clone()
    }

    fn name(locator: &str) -> &str {
        locator.trim_start_matches("fake://")
    }
}

#[async_trait]
impl SongSource for FakeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn accepts(&self, locator: &str) -> bool {
        locator.starts_with("fake://")
    }

    fn song_id(&self, locator: &str) -> Result<String> {
        Ok(format!("fake_{}", Self::name(locator)))
    }

    async fn resolve(&self, locator: &str) -> Result<SongMetadata> {
        tokio::task::yield_now().await;
        self.resolves.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        if state.broken.contains(locator) {
            return Err(QueueError::unresolvable(locator, "scripted failure"));
        }

        let title = state
            .titles
            .get(locator)
            .cloned()
            .unwrap_or_else(|| Self::name(locator).to_string());
        Ok(SongMetadata {
            duration: Some(Duration::from_secs(180)),
            ..SongMetadata::titled(title)
        })
    }

    async fn open_stream(&self, song: &Song, seek: Duration) -> Result<AudioStream> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.opened.push((song.locator().to_string(), seek));
        if let Some(remaining) = state.stream_failures.get_mut(song.locator()) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(QueueError::stream_unavailable(song.id(), "scripted failure"));
            }
        }

        Ok(AudioStream::Url(format!("{}#t={}", song.locator(), seek.as_secs())))
    }

    fn describe(&self, metadata: &SongMetadata) -> Vec<EmbedField> {
        vec![EmbedField::inline("Artist", metadata.artist.as_deref().unwrap_or("No artist"))]
    }

    fn metadata_ttl(&self) -> Option<Duration> {
        self.state.lock().ttl
    }

    async fn expand_playlist(&self, locator: &str) -> Result<Option<Vec<PlaylistEntry>>> {
        Ok(self.state.lock().playlists.get(locator).cloned())
    }
}

/// Sink que registra cada stream; a lo sumo uno activo
#[derive(Default)]
pub struct FakeSink {
    state: Mutex<FakeSinkState>,
}

#[derive(Default)]
struct FakeSinkState {
    current: Option<(String, CompletionHandle)>,
    subscriptions: Vec<String>,
    stops: usize,
    paused: bool,
    volume: Option<u16>,
    failing_subscribes: usize,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream activo, p. ej. `fake://a#t=30`
    pub fn active(&self) -> Option<String> {
        self.state.lock().current.as_ref().map(|(stream, _)| stream.clone())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn volume(&self) -> Option<u16> {
        self.state.lock().volume
    }

    pub fn fail_next_subscribes(&self, times: usize) {
        self.state.lock().failing_subscribes = times;
    }

    /// Fin natural del stream activo
    pub fn finish_current(&self) -> bool {
        match self.state.lock().current.take() {
            Some((_, completion)) => {
                completion.finish();
                true
            }
            None => false,
        }
    }

    /// Error de decodificación a mitad del stream
    pub fn fail_current(&self, reason: &str) -> bool {
        match self.state.lock().current.take() {
            Some((_, completion)) => {
                completion.fail(reason);
                true
            }
            None => false,
        }
    }

    fn describe(stream: &AudioStream) -> String {
        match stream {
            AudioStream::Url(url) => url.clone(),
            AudioStream::File(path) => path.display().to_string(),
            AudioStream::Process(_) => "process".to_string(),
        }
    }
}

#[async_trait]
impl OutputSink for FakeSink {
    async fn subscribe(&self, stream: AudioStream, volume: u16, completion: CompletionHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(QueueError::Voice("scripted subscribe failure".to_string()));
        }

        let description = Self::describe(&stream);
        // Como songbird: el stream nuevo reemplaza al anterior
        if let Some((_, previous)) = state.current.take() {
            previous.finish();
        }
        state.subscriptions.push(description.clone());
        state.current = Some((description, completion));
        state.volume = Some(volume);
        state.paused = false;
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock();
        if let Some((_, completion)) = state.current.take() {
            state.stops += 1;
            completion.finish();
        }
    }

    async fn pause(&self) -> Result<()> {
        self.state.lock().paused = true;
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        self.state.lock().paused = false;
        Ok(())
    }

    async fn set_volume(&self, volume: u16) -> Result<()> {
        self.state.lock().volume = Some(volume);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&QueueEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn now_playing(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                QueueEvent::NowPlaying { song, .. } => Some(song.title.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn finished(&self) -> usize {
        self.count(|event| matches!(event, QueueEvent::FinishedPlaying { .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(|event| matches!(event, QueueEvent::PlaybackFailed { .. }))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: QueueEvent) {
        self.events.lock().push(event);
    }
}

/// Conexión de voz que acepta cualquier join/leave
pub fn quiet_voice() -> Arc<dyn VoiceConnection> {
    let mut voice = MockVoiceConnection::new();
    voice.expect_join().returning(|| Ok(()));
    voice.expect_leave().returning(|| Ok(()));
    Arc::new(voice)
}

pub fn song_manager(source: Arc<FakeSource>) -> SongManager {
    SongManager::new(SourceRegistry::new().register(source), SongManagerSettings::default())
}

pub fn join_context(sink: Arc<FakeSink>, voice: Arc<dyn VoiceConnection>) -> JoinContext {
    JoinContext {
        text_channel: TEXT,
        voice_channel: VOICE,
        voice,
        sink,
    }
}

/// Una sala aislada con todas sus piezas falsas
pub struct Room {
    pub queue: ServerQueue,
    pub songs: SongManager,
    pub source: Arc<FakeSource>,
    pub sink: Arc<FakeSink>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Room {
    pub async fn new(settings: QueueSettings) -> Self {
        Self::with_voice(settings, quiet_voice()).await
    }

    pub async fn with_voice(settings: QueueSettings, voice: Arc<dyn VoiceConnection>) -> Self {
        Self::build(settings, SongManagerSettings::default(), voice)
    }

    /// Sala con límites de caché propios
    pub async fn with_cache(settings: QueueSettings, cache: SongManagerSettings) -> Self {
        Self::build(settings, cache, quiet_voice())
    }

    fn build(settings: QueueSettings, cache: SongManagerSettings, voice: Arc<dyn VoiceConnection>) -> Self {
        let source = Arc::new(FakeSource::new());
        let songs = SongManager::new(SourceRegistry::new().register(source.clone()), cache);
        let sink = Arc::new(FakeSink::new());
        let notifier = Arc::new(RecordingNotifier::default());

        // Sin timers: se prueban aparte
        let inactivity = InactivityHelper::new(
            &InactivitySettings {
                wait_rejoin_seconds: -1,
                bot_idle_seconds: -1,
            },
            Arc::new(|_| {}),
        );
        let queue = ServerQueue::new(
            GuildId::new(1),
            1,
            join_context(sink.clone(), voice),
            songs.clone(),
            notifier.clone(),
            settings,
            inactivity,
        );

        Self {
            queue,
            songs,
            source,
            sink,
            notifier,
        }
    }

    /// Sala con `names` ya en la cola (sin reproducir)
    pub async fn with_songs(names: &[&str]) -> Self {
        let room = Self::new(QueueSettings::default()).await;
        room.enqueue(names).await;
        room
    }

    pub async fn reference(&self, name: &str) -> SongReference {
        self.songs
            .get_or_create(&format!("fake://{}", name), USER, TEXT)
            .await
            .unwrap()
    }

    pub async fn enqueue(&self, names: &[&str]) {
        let mut references = Vec::new();
        for name in names {
            references.push(self.reference(name).await);
        }
        self.queue.add(references).unwrap();
    }

    pub fn references_of(&self, name: &str) -> usize {
        self.songs.get(&format!("fake_{}", name)).unwrap().references()
    }

    /// Termina el stream activo y espera la transición
    pub async fn finish(&self) {
        assert!(self.sink.finish_current(), "no active stream");
        settle().await;
    }
}
