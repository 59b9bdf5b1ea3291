use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    cursor::{next_index, LoopMode, ShufflePool},
    inactivity::InactivityHelper,
    manager::JoinContext,
    snapshot::{QueueSnapshot, SnapshotEntry},
};
use crate::{
    cache::SongManager,
    config::QueueSettings,
    error::{QueueError, Result},
    notifier::{Notifier, QueueEvent},
    song::{Song, SongReference, SongSummary},
    sources::AudioStream,
    voice::{CompletionHandle, OutputSink, StreamEnd, StreamOutcome, VoiceConnection},
};

/// Estado visible de una sala
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Esperando el stream de la fuente
    Loading,
    Streaming,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    /// Identidad estable de la entrada (la posición cambia al quitar)
    key: u64,
    reference: SongReference,
}

/// Qué hacer después de un cambio de estado
#[derive(Debug)]
enum Step {
    Play { seek: Duration, announce: bool },
    Finished,
    Nothing,
}

struct QueueState {
    entries: Vec<QueueEntry>,
    index: usize,
    next_key: u64,
    loop_mode: LoopMode,
    shuffle: bool,
    pool: ShufflePool,
    volume: u16,
    phase: Phase,
    paused: bool,
    /// Cada `play` la incrementa; eventos y fetches de otra generación se descartan
    generation: u64,
    fetch: Option<CancellationToken>,
    skip_requested: bool,
    /// Se quitó la entrada en reproducción: la próxima es la que ocupó su lugar
    current_removed: bool,
    stream_errors: u32,
    consecutive_failures: usize,
    /// Offset del stream más lo reproducido hasta la última pausa
    played: Duration,
    /// Desde cuándo suena sin pausa
    since: Option<Instant>,
}

impl QueueState {
    fn new(volume: u16) -> Self {
        Self {
            entries: Vec::new(),
            index: 0,
            next_key: 0,
            loop_mode: LoopMode::Off,
            shuffle: false,
            pool: ShufflePool::default(),
            volume,
            phase: Phase::Idle,
            paused: false,
            generation: 0,
            fetch: None,
            skip_requested: false,
            current_removed: false,
            stream_errors: 0,
            consecutive_failures: 0,
            played: Duration::ZERO,
            since: None,
        }
    }

    fn position(&self) -> Option<Duration> {
        if self.phase != Phase::Streaming {
            return None;
        }
        let running = self.since.map_or(Duration::ZERO, |since| since.elapsed());
        Some(self.played + running)
    }

    fn stop_clock(&mut self) {
        if let Some(since) = self.since.take() {
            self.played += since.elapsed();
        }
    }

    fn current_key(&self) -> Option<u64> {
        self.entries.get(self.index).map(|entry| entry.key)
    }

    /// Invalida cualquier play en curso
    fn supersede(&mut self) -> u64 {
        if let Some(fetch) = self.fetch.take() {
            fetch.cancel();
        }
        self.generation += 1;
        self.generation
    }

    fn go_idle(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.cancel();
        }
        self.phase = Phase::Idle;
        self.paused = false;
        self.skip_requested = false;
        self.played = Duration::ZERO;
        self.since = None;
    }

    fn next_position(&mut self) -> Option<usize> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        let removed = std::mem::take(&mut self.current_removed);

        if self.shuffle && self.loop_mode != LoopMode::Song {
            let keys: Vec<u64> = self.entries.iter().map(|entry| entry.key).collect();
            let current = if removed { None } else { self.current_key() };
            return self.pool.next(&keys, current, self.loop_mode, &mut rand::thread_rng());
        }

        if removed {
            return match self.loop_mode {
                LoopMode::Queue => Some(self.index % len),
                _ => (self.index < len).then_some(self.index),
            };
        }

        next_index(self.index, len, self.loop_mode)
    }

    /// Avanza el cursor según el modo de loop
    fn advance(&mut self) -> Step {
        match self.next_position() {
            Some(next) => {
                self.index = next;
                Step::Play {
                    seek: Duration::ZERO,
                    announce: true,
                }
            }
            None => {
                self.index = self.entries.len();
                self.go_idle();
                Step::Finished
            }
        }
    }

    /// La canción actual se da por perdida
    fn fatal(&mut self) -> Step {
        self.stream_errors = 0;
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.entries.len() {
            warn!("🚨 {} fallos consecutivos, deteniendo la reproducción", self.consecutive_failures);
            self.consecutive_failures = 0;
            self.go_idle();
            return Step::Finished;
        }

        self.advance()
    }
}

struct Shared {
    room: GuildId,
    session: u64,
    text_channel: ChannelId,
    voice_channel: ChannelId,
    state: Mutex<QueueState>,
    /// Serializa subscribe/stop sobre el sink
    sink_lock: AsyncMutex<()>,
    sink: Arc<dyn OutputSink>,
    voice: Arc<dyn VoiceConnection>,
    songs: SongManager,
    notifier: Arc<dyn Notifier>,
    inactivity: InactivityHelper,
    settings: QueueSettings,
    events: mpsc::UnboundedSender<StreamEnd>,
    closed: AtomicBool,
}

/// Cola de reproducción de una sala.
///
/// Clonar es barato. Todas las mutaciones de estado pasan por un mutex
/// síncrono que nunca se mantiene a través de un `await`; traer el stream
/// ocurre sin lock y el resultado solo se instala si su generación sigue
/// siendo la actual.
#[derive(Clone)]
pub struct ServerQueue {
    shared: Arc<Shared>,
}

impl ServerQueue {
    pub(crate) fn new(
        room: GuildId,
        session: u64,
        context: JoinContext,
        songs: SongManager,
        notifier: Arc<dyn Notifier>,
        settings: QueueSettings,
        inactivity: InactivityHelper,
    ) -> Self {
        let (events, mut rx) = mpsc::unbounded_channel::<StreamEnd>();

        let shared = Arc::new(Shared {
            room,
            session,
            text_channel: context.text_channel,
            voice_channel: context.voice_channel,
            state: Mutex::new(QueueState::new(settings.default_volume.min(settings.max_volume))),
            sink_lock: AsyncMutex::new(()),
            sink: context.sink,
            voice: context.voice,
            songs,
            notifier,
            inactivity,
            settings,
            events,
            closed: AtomicBool::new(false),
        });

        // Los eventos de fin de stream se procesan en orden, uno por uno
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(end) = rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                ServerQueue { shared }.on_stream_end(end).await;
            }
            debug!("🛑 Procesador de eventos de la sala {} detenido", room);
        });

        Self { shared }
    }

    pub fn room(&self) -> GuildId {
        self.shared.room
    }

    /// Identificador único de esta instancia (una sala puede recrearse)
    pub fn session(&self) -> u64 {
        self.shared.session
    }

    pub fn text_channel(&self) -> ChannelId {
        self.shared.text_channel
    }

    pub fn voice_channel(&self) -> ChannelId {
        self.shared.voice_channel
    }

    pub(crate) fn inactivity(&self) -> &InactivityHelper {
        &self.shared.inactivity
    }

    pub fn state(&self) -> PlaybackState {
        let state = self.shared.state.lock();
        match (state.phase, state.paused) {
            (Phase::Idle, _) => PlaybackState::Idle,
            (_, true) => PlaybackState::Paused,
            (_, false) => PlaybackState::Playing,
        }
    }

    pub fn index(&self) -> usize {
        self.shared.state.lock().index
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }

    pub fn volume(&self) -> u16 {
        self.shared.state.lock().volume
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.shared.state.lock().loop_mode
    }

    pub fn is_shuffle(&self) -> bool {
        self.shared.state.lock().shuffle
    }

    pub fn references(&self) -> Vec<SongReference> {
        let state = self.shared.state.lock();
        state.entries.iter().map(|entry| entry.reference.clone()).collect()
    }

    /// La referencia en reproducción (o cargando)
    pub fn current(&self) -> Option<SongReference> {
        let state = self.shared.state.lock();
        if state.phase == Phase::Idle {
            return None;
        }
        state.entries.get(state.index).map(|entry| entry.reference.clone())
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    pub async fn join(&self) -> Result<()> {
        self.shared.voice.join().await?;
        info!("🔗 Sala {} conectada al canal {}", self.shared.room, self.shared.voice_channel);
        Ok(())
    }

    /// Limpia todo, cancela los timers y suelta la conexión de voz.
    ///
    /// Solo la primera llamada tiene efecto.
    pub async fn leave(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.clear(true).await;
        self.shared.inactivity.cancel_all();

        if let Err(e) = self.shared.voice.leave().await {
            warn!("⚠️ Error al salir del canal de voz en {}: {}", self.shared.room, e);
        }

        self.shared.notifier.notify(QueueEvent::Disconnected { room: self.shared.room });
        info!("👋 Sala {} cerrada", self.shared.room);
    }

    /// Agrega referencias al final de la cola. No inicia la reproducción.
    ///
    /// Devuelve cuántas se agregaron.
    pub fn add(&self, references: Vec<SongReference>) -> Result<usize> {
        let Some(first) = references.first().cloned() else {
            return Ok(0);
        };

        let (songs, position) = {
            let mut state = self.shared.state.lock();
            let limit = self.shared.settings.max_queue_size;
            if state.entries.len() + references.len() > limit {
                return Err(QueueError::QueueFull { limit });
            }

            // Todas o ninguna: si una ya no está en caché se devuelven las tomadas
            let mut songs = Vec::with_capacity(references.len());
            for reference in &references {
                match self.shared.songs.acquire(reference.song_id()) {
                    Ok(song) => songs.push(song),
                    Err(e) => {
                        songs.iter().for_each(|song| song.release());
                        return Err(e);
                    }
                }
            }

            let position = state.entries.len() + 1;
            for reference in references {
                let key = state.next_key;
                state.next_key += 1;
                state.entries.push(QueueEntry { key, reference });
            }
            (songs, position)
        };

        info!("➕ {} canciones agregadas a la cola de {}", songs.len(), self.shared.room);
        self.shared.notifier.notify(QueueEvent::Enqueued {
            room: self.shared.room,
            channel: first.notify_channel(),
            requested_by: first.requested_by(),
            songs: songs.iter().map(|song| self.summarize(song)).collect(),
            position,
        });

        Ok(songs.len())
    }

    /// Quita la entrada en `index` (0-based).
    ///
    /// Quitar antes del cursor lo corre uno atrás para que siga apuntando a
    /// la misma canción. Quitar la actual no corta el stream: al terminar se
    /// sigue con la que quedó en su lugar.
    pub fn remove_song(&self, index: usize) -> Result<SongReference> {
        let entry = {
            let mut state = self.shared.state.lock();
            let len = state.entries.len();
            if index >= len {
                return Err(QueueError::OutOfRange { position: index, len });
            }

            let entry = state.entries.remove(index);
            state.pool.forget(entry.key);
            if index < state.index {
                state.index -= 1;
            } else if index == state.index && state.phase != Phase::Idle {
                state.current_removed = true;
            }
            entry
        };

        self.release(&entry.reference);
        debug!("❌ Canción eliminada en posición {}", index);
        Ok(entry.reference)
    }

    /// Empieza a reproducir si la sala está inactiva y hay algo en la cola
    pub async fn play_if_idle(&self) -> bool {
        let start = {
            let mut state = self.shared.state.lock();
            let len = state.entries.len();
            if state.phase != Phase::Idle || len == 0 {
                false
            } else if state.index < len {
                true
            } else if state.loop_mode == LoopMode::Queue {
                state.index = 0;
                true
            } else {
                false
            }
        };

        if start {
            self.run(Duration::ZERO, true).await;
        }
        start
    }

    /// (Re)inicia la canción actual en `seek`.
    ///
    /// Con `seek > 0` no se vuelve a anunciar la canción.
    pub async fn play(&self, seek: Duration) -> Result<()> {
        {
            let state = self.shared.state.lock();
            let len = state.entries.len();
            if state.index >= len {
                return Err(QueueError::OutOfRange {
                    position: state.index + 1,
                    len,
                });
            }
        }

        self.run(seek, seek.is_zero()).await;
        Ok(())
    }

    /// Salta a `position` dentro de la canción actual (acotado a su duración)
    pub async fn seek_to(&self, position: Duration) -> Result<Duration> {
        let reference = self.current().ok_or(QueueError::OutOfRange {
            position: self.index() + 1,
            len: self.len(),
        })?;
        let song = reference.song(&self.shared.songs)?;
        let seek = song.duration().map_or(position, |duration| position.min(duration));

        debug!("⏩ Seek a {:?} en {}", seek, song.id());
        self.run(seek, false).await;
        Ok(seek)
    }

    /// Cuánto lleva sonando la canción actual (`None` si no hay stream)
    pub fn position(&self) -> Option<Duration> {
        self.shared.state.lock().position()
    }

    /// Adelanta `delta` desde la posición actual, sin pasar del final
    pub async fn fast_forward(&self, delta: Duration) -> Result<Duration> {
        let position = self.position().ok_or_else(|| QueueError::OutOfRange {
            position: self.index() + 1,
            len: self.len(),
        })?;
        self.seek_to(position + delta).await
    }

    /// Da por terminada la canción actual; el avance respeta el modo de loop
    pub async fn skip(&self) -> Result<()> {
        let step = {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Idle => return Ok(()),
                Phase::Streaming => {
                    state.skip_requested = true;
                    None
                }
                Phase::Loading => {
                    state.supersede();
                    Some(state.advance())
                }
            }
        };

        info!("⏭️ Saltando canción en {}", self.shared.room);
        match step {
            // El fin del stream detenido avanza el cursor
            None => {
                let _sink = self.shared.sink_lock.lock().await;
                self.shared.sink.stop().await;
            }
            Some(step) => self.apply(step).await,
        }
        Ok(())
    }

    /// Reproduce la posición `position` (1-based)
    pub async fn jump(&self, position: usize) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let len = state.entries.len();
            if position == 0 || position > len {
                return Err(QueueError::OutOfRange { position, len });
            }
            state.index = position - 1;
            state.current_removed = false;
            state.stream_errors = 0;
        }

        info!("⏭️ Saltando a la posición {}", position);
        self.run(Duration::ZERO, true).await;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let streaming = {
            let mut state = self.shared.state.lock();
            if state.phase == Phase::Idle || state.paused {
                return Ok(());
            }
            state.paused = true;
            state.stop_clock();
            state.phase == Phase::Streaming
        };

        if streaming {
            let _sink = self.shared.sink_lock.lock().await;
            self.shared.sink.pause().await?;
        }

        info!("⏸️ Pausado en {}", self.shared.room);
        self.shared.inactivity.on_not_playing();
        Ok(())
    }

    /// Quita la pausa; si la sala está inactiva reproduce la cola desde el
    /// principio.
    pub async fn resume(&self) -> Result<()> {
        let restart = {
            let mut state = self.shared.state.lock();
            if state.phase == Phase::Idle {
                if state.entries.is_empty() {
                    return Ok(());
                }
                state.index = 0;
                state.current_removed = false;
                state.consecutive_failures = 0;
                state.pool.reset();
                true
            } else if state.paused {
                state.paused = false;
                if state.phase == Phase::Streaming {
                    state.since = Some(Instant::now());
                }
                false
            } else {
                return Ok(());
            }
        };

        if restart {
            info!("▶️ Reanudando la cola desde el inicio en {}", self.shared.room);
            self.run(Duration::ZERO, true).await;
            return Ok(());
        }

        {
            let _sink = self.shared.sink_lock.lock().await;
            self.shared.sink.unpause().await?;
        }
        info!("▶️ Reanudado en {}", self.shared.room);
        self.shared.inactivity.on_playing();
        Ok(())
    }

    pub fn set_loop_mode(&self, mode: LoopMode) {
        self.shared.state.lock().loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Song => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn shuffle_on(&self) {
        let mut state = self.shared.state.lock();
        state.shuffle = true;
        state.pool.reset();
        if state.phase != Phase::Idle {
            if let Some(key) = state.current_key() {
                state.pool.mark_played(key);
            }
        }
        info!("🔀 Modo aleatorio activado");
    }

    pub fn shuffle_off(&self) {
        let mut state = self.shared.state.lock();
        state.shuffle = false;
        state.pool.reset();
        info!("➡️ Modo aleatorio desactivado");
    }

    pub fn toggle_shuffle(&self) -> bool {
        if self.is_shuffle() {
            self.shuffle_off();
            false
        } else {
            self.shuffle_on();
            true
        }
    }

    /// Fija el volumen (acotado a `max_volume`) y devuelve el aplicado
    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        let (volume, streaming) = {
            let mut state = self.shared.state.lock();
            state.volume = volume.min(self.shared.settings.max_volume);
            (state.volume, state.phase == Phase::Streaming)
        };

        if streaming {
            let _sink = self.shared.sink_lock.lock().await;
            self.shared.sink.set_volume(volume).await?;
        }

        debug!("🔊 Volumen de {} en {}%", self.shared.room, volume);
        Ok(volume)
    }

    /// Detiene el stream y vacía la cola liberando cada referencia
    pub async fn clear(&self, restore_defaults: bool) {
        let removed = {
            let mut state = self.shared.state.lock();
            state.supersede();
            state.go_idle();
            state.index = 0;
            state.current_removed = false;
            state.stream_errors = 0;
            state.consecutive_failures = 0;
            state.pool.reset();
            if restore_defaults {
                state.loop_mode = LoopMode::Off;
                state.shuffle = false;
                state.volume = self.shared.settings.default_volume.min(self.shared.settings.max_volume);
            }
            std::mem::take(&mut state.entries)
        };

        {
            let _sink = self.shared.sink_lock.lock().await;
            self.shared.sink.stop().await;
        }

        for entry in &removed {
            self.release(&entry.reference);
        }

        info!("🗑️ Cola limpiada ({} canciones)", removed.len());
        self.shared.inactivity.on_not_playing();
    }

    /// Cambio en la cantidad de oyentes (sin contar al bot)
    pub fn on_listener_count(&self, others: usize) {
        if others == 0 {
            self.shared.inactivity.on_alone();
        } else {
            self.shared.inactivity.on_person_join();
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        let (references, index, loop_mode, shuffle, volume, position) = {
            let st = self.shared.state.lock();
            let references: Vec<SongReference> = st.entries.iter().map(|entry| entry.reference.clone()).collect();
            (references, st.index, st.loop_mode, st.shuffle, st.volume, st.position())
        };

        let entries = references
            .iter()
            .enumerate()
            .map(|(i, reference)| {
                let song = self.shared.songs.cached(reference.song_id());
                SnapshotEntry {
                    position: i + 1,
                    song_id: reference.song_id().to_string(),
                    title: song.as_ref().map_or_else(|| "Unknown Title".to_string(), |song| song.title()),
                    duration: song.as_ref().and_then(|song| song.duration()),
                    requested_by: reference.requested_by(),
                }
            })
            .collect();

        QueueSnapshot {
            room: self.shared.room,
            state,
            entries,
            index,
            loop_mode,
            shuffle,
            volume,
            position,
        }
    }

    // Métodos privados

    /// Reproduce la entrada bajo el cursor, reintentando y avanzando ante
    /// fallos hasta instalar un stream o quedar superado por otro `play`.
    async fn run(&self, mut seek: Duration, mut announce: bool) {
        let max_retries = self.shared.settings.max_stream_retries;
        let mut attempt: u32 = 0;
        let mut first = true;

        loop {
            // Solo el primer intento quita la pausa; los reintentos la respetan
            let Some((generation, fetch, reference)) = self.begin_play(std::mem::take(&mut first)) else {
                return;
            };

            {
                let _sink = self.shared.sink_lock.lock().await;
                if !self.is_current(generation) {
                    return;
                }
                self.shared.sink.stop().await;
            }

            let opened = tokio::select! {
                _ = fetch.cancelled() => {
                    debug!("🚫 Carga de {} cancelada (generación {})", reference.song_id(), generation);
                    return;
                }
                opened = self.open(&reference, seek) => opened,
            };

            let error = match opened {
                Ok(stream) => {
                    let announce = announce && seek.is_zero();
                    match self.install(generation, stream, &reference, seek, announce).await {
                        Ok(()) => return,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !self.is_current(generation) {
                return;
            }

            attempt += 1;
            if attempt <= max_retries {
                warn!(
                    "🔄 Reintentando stream de {} ({}/{}): {}",
                    reference.song_id(),
                    attempt,
                    max_retries,
                    error
                );
                continue;
            }

            error!("❌ No se pudo reproducir {}: {}", reference.song_id(), error);
            let step = {
                let mut state = self.shared.state.lock();
                if state.generation != generation {
                    return;
                }
                state.fatal()
            };
            self.notify_failure(&reference, error.to_string());

            match step {
                Step::Play { seek: next_seek, announce: next_announce } => {
                    seek = next_seek;
                    announce = next_announce;
                    attempt = 0;
                }
                Step::Finished => {
                    self.finished();
                    return;
                }
                Step::Nothing => return,
            }
        }
    }

    fn begin_play(&self, unpause: bool) -> Option<(u64, CancellationToken, SongReference)> {
        let mut state = self.shared.state.lock();
        let entry = state.entries.get(state.index).cloned()?;

        let generation = state.supersede();
        let fetch = CancellationToken::new();
        state.fetch = Some(fetch.clone());
        state.phase = Phase::Loading;
        if unpause {
            state.paused = false;
        }
        state.played = Duration::ZERO;
        state.since = None;
        state.skip_requested = false;
        state.current_removed = false;
        state.pool.mark_played(entry.key);

        Some((generation, fetch, entry.reference))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.state.lock().generation == generation
    }

    async fn open(&self, reference: &SongReference, seek: Duration) -> Result<AudioStream> {
        let song = reference.song(&self.shared.songs)?;
        let source = self.shared.songs.source_for(&song)?;
        source.open_stream(&song, seek).await
    }

    /// Instala el stream en el sink si la generación sigue vigente.
    ///
    /// Un stream obsoleto se descarta y cuenta como éxito.
    async fn install(
        &self,
        generation: u64,
        stream: AudioStream,
        reference: &SongReference,
        seek: Duration,
        announce: bool,
    ) -> Result<()> {
        let _sink = self.shared.sink_lock.lock().await;

        let volume = {
            let state = self.shared.state.lock();
            (state.generation == generation).then_some(state.volume)
        };
        let Some(volume) = volume else {
            debug!("🗑️ Stream obsoleto descartado (generación {})", generation);
            stream.discard();
            return Ok(());
        };

        let completion = CompletionHandle::new(generation, self.shared.events.clone());
        self.shared.sink.subscribe(stream, volume, completion).await?;

        let installed = {
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.phase = Phase::Streaming;
                state.fetch = None;
                state.played = seek;
                state.since = (!state.paused).then(Instant::now);
                Some((state.paused, state.index + 1, state.entries.len(), state.loop_mode))
            } else {
                None
            }
        };
        let Some((paused, position, total, loop_mode)) = installed else {
            return Ok(());
        };

        if paused {
            if let Err(e) = self.shared.sink.pause().await {
                warn!("⚠️ No se pudo pausar el stream nuevo: {}", e);
            }
        } else {
            self.shared.inactivity.on_playing();
        }

        debug!("🎵 Reproduciendo {} ({}/{})", reference.song_id(), position, total);
        if announce {
            if let Ok(song) = reference.song(&self.shared.songs) {
                self.shared.notifier.notify(QueueEvent::NowPlaying {
                    room: self.shared.room,
                    channel: reference.notify_channel(),
                    requested_by: reference.requested_by(),
                    song: self.summarize(&song),
                    position,
                    total,
                    volume,
                    loop_mode,
                });
            }
        }
        Ok(())
    }

    async fn on_stream_end(&self, end: StreamEnd) {
        let max_retries = self.shared.settings.max_stream_retries;

        let (step, failure) = {
            let mut state = self.shared.state.lock();
            if end.generation != state.generation || state.phase != Phase::Streaming {
                debug!("⏭️ Fin de stream obsoleto ignorado (generación {})", end.generation);
                return;
            }

            let skipped = std::mem::take(&mut state.skip_requested);
            match end.outcome {
                StreamOutcome::Failed(reason) if !skipped => {
                    state.stream_errors += 1;
                    if state.stream_errors <= max_retries {
                        warn!(
                            "🔄 Stream interrumpido, reintentando ({}/{}): {}",
                            state.stream_errors, max_retries, reason
                        );
                        let step = Step::Play {
                            seek: Duration::ZERO,
                            announce: false,
                        };
                        (step, None)
                    } else {
                        let reference = state.entries.get(state.index).map(|entry| entry.reference.clone());
                        (state.fatal(), reference.map(|reference| (reference, reason)))
                    }
                }
                _ => {
                    if !skipped {
                        state.consecutive_failures = 0;
                    }
                    state.stream_errors = 0;
                    (state.advance(), None)
                }
            }
        };

        if let Some((reference, reason)) = failure {
            error!("❌ {} falló demasiadas veces: {}", reference.song_id(), reason);
            self.notify_failure(&reference, reason);
        }
        self.apply(step).await;
    }

    async fn apply(&self, step: Step) {
        match step {
            Step::Play { seek, announce } => self.run(seek, announce).await,
            Step::Finished => self.finished(),
            Step::Nothing => {}
        }
    }

    fn finished(&self) {
        info!("📭 Cola de {} terminada", self.shared.room);
        self.shared.notifier.notify(QueueEvent::FinishedPlaying {
            room: self.shared.room,
            channel: self.shared.text_channel,
        });
        self.shared.inactivity.on_not_playing();
    }

    fn notify_failure(&self, reference: &SongReference, reason: String) {
        self.shared.notifier.notify(QueueEvent::PlaybackFailed {
            room: self.shared.room,
            channel: reference.notify_channel(),
            song_id: reference.song_id().to_string(),
            reason,
        });
    }

    fn release(&self, reference: &SongReference) {
        match self.shared.songs.cached(reference.song_id()) {
            Some(song) => song.release(),
            None => warn!("⚠️ {} ya no está en caché al liberar", reference.song_id()),
        }
    }

    fn summarize(&self, song: &Song) -> SongSummary {
        let fields = self
            .shared
            .songs
            .source_for(song)
            .map(|source| source.describe(&song.metadata()))
            .unwrap_or_default();
        song.summary(fields)
    }
}

impl std::fmt::Debug for ServerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerQueue")
            .field("room", &self.shared.room)
            .field("session", &self.shared.session)
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}
