use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::{ChannelId, UserId};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};
use tokio::{runtime::Handle, task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::SongManagerSettings,
    error::{QueueError, Result},
    song::{Song, SongReference},
    sources::{SongSource, SourceRegistry},
};

/// Caché de canciones con conteo de referencias y limpieza diferida.
///
/// Clonar es barato: todos los clones comparten el mismo estado.
#[derive(Clone)]
pub struct SongManager {
    inner: Arc<Inner>,
}

struct Inner {
    songs: DashMap<String, Arc<Song>>,
    sources: SourceRegistry,
    settings: SongManagerSettings,
    /// Canciones en caché más inserciones en curso; nunca supera `hard_limit`
    slots: AtomicUsize,
    /// Hay un barrido de limpieza programado o corriendo
    sweep_scheduled: AtomicBool,
    shutdown: CancellationToken,
}

impl SongManager {
    pub fn new(sources: SourceRegistry, settings: SongManagerSettings) -> Self {
        info!(
            "💾 Caché de canciones: soft {}, hard {}",
            settings.soft_limit, settings.hard_limit
        );

        Self {
            inner: Arc::new(Inner {
                songs: DashMap::new(),
                sources,
                settings,
                slots: AtomicUsize::new(0),
                sweep_scheduled: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.inner.sources
    }

    pub fn settings(&self) -> &SongManagerSettings {
        &self.inner.settings
    }

    pub fn len(&self) -> usize {
        self.inner.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.songs.is_empty()
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.inner.songs.contains_key(id)
    }

    /// Fuente que sabe abrir y describir esta canción
    pub fn source_for(&self, song: &Song) -> Result<Arc<dyn SongSource>> {
        self.inner
            .sources
            .for_kind(song.kind())
            .ok_or_else(|| QueueError::unresolvable(song.locator(), "no source registered for this kind"))
    }

    /// Devuelve una referencia a la canción del localizador, resolviéndola y
    /// cacheándola si todavía no existe.
    pub async fn get_or_create(
        &self,
        locator: &str,
        requested_by: UserId,
        notify_channel: ChannelId,
    ) -> Result<SongReference> {
        let source = self.inner.sources.for_locator(locator)?;
        let id = source.song_id(locator)?;

        if self.has_id(&id) {
            debug!("💾 Canción en caché: {}", id);
            return Ok(SongReference::new(id, requested_by, notify_channel));
        }

        // El lugar se reserva antes de resolver y se devuelve si no se usa
        let slot = self.reserve()?;

        let metadata = source.resolve(locator).await?;
        let song = Song::new(id.clone(), locator.trim(), source.kind(), metadata, source.metadata_ttl());

        match self.inner.songs.entry(id.clone()) {
            // Otra tarea la resolvió mientras esperábamos
            Entry::Occupied(_) => debug!("💾 Canción resuelta en paralelo: {}", id),
            Entry::Vacant(vacant) => {
                debug!("➕ Nueva canción en caché: {}", song.title());
                vacant.insert(Arc::new(song));
                slot.commit();
            }
        }

        self.check_cleanup();
        Ok(SongReference::new(id, requested_by, notify_channel))
    }

    /// Como [`get_or_create`](Self::get_or_create) pero expande playlists.
    ///
    /// Las entradas de la playlist traen metadata, así que las canciones
    /// nuevas se insertan sin resolver una por una. Si la caché se llena a
    /// mitad de camino se devuelven las que entraron.
    pub async fn get_or_create_playlist(
        &self,
        locator: &str,
        requested_by: UserId,
        notify_channel: ChannelId,
    ) -> Result<Vec<SongReference>> {
        let source = self.inner.sources.for_locator(locator)?;

        let Some(entries) = source.expand_playlist(locator).await? else {
            return Ok(vec![self.get_or_create(locator, requested_by, notify_channel).await?]);
        };

        let mut references = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = match source.song_id(&entry.locator) {
                Ok(id) => id,
                Err(e) => {
                    warn!("⚠️ Entrada de playlist ignorada: {}", e);
                    continue;
                }
            };

            if !self.has_id(&id) {
                let slot = match self.reserve() {
                    Ok(slot) => slot,
                    Err(e) if references.is_empty() => return Err(e),
                    Err(e) => {
                        warn!("⚠️ Playlist truncada en {} canciones: {}", references.len(), e);
                        break;
                    }
                };

                let song = Song::new(id.clone(), entry.locator, source.kind(), entry.metadata, source.metadata_ttl());
                if let Entry::Vacant(vacant) = self.inner.songs.entry(id.clone()) {
                    vacant.insert(Arc::new(song));
                    slot.commit();
                }
            }

            references.push(SongReference::new(id, requested_by, notify_channel));
        }

        info!("📃 {} canciones de playlist disponibles", references.len());
        self.check_cleanup();
        Ok(references)
    }

    /// Inserta una canción ya construida
    pub fn add_song(&self, song: Song) -> Result<()> {
        if self.has_id(song.id()) {
            return Err(QueueError::AlreadyExists(song.id().to_string()));
        }
        let slot = self.reserve()?;

        match self.inner.songs.entry(song.id().to_string()) {
            Entry::Occupied(occupied) => return Err(QueueError::AlreadyExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(song));
                slot.commit();
            }
        }

        self.check_cleanup();
        Ok(())
    }

    /// Referencia a una canción ya cacheada, sin resolver nada
    pub fn reference(&self, id: &str, requested_by: UserId, notify_channel: ChannelId) -> Result<SongReference> {
        if !self.has_id(id) {
            return Err(QueueError::SongNotFound(id.to_string()));
        }
        Ok(SongReference::new(id, requested_by, notify_channel))
    }

    /// Busca una canción; si su metadata está vieja lanza un refresco en
    /// segundo plano y devuelve la metadata actual sin esperar.
    pub fn get(&self, id: &str) -> Result<Arc<Song>> {
        let song = self
            .inner
            .songs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| QueueError::SongNotFound(id.to_string()))?;

        if song.is_stale(Utc::now()) {
            self.spawn_refresh(&song);
        }

        Ok(song)
    }

    /// Busca sin disparar refrescos
    pub(crate) fn cached(&self, id: &str) -> Option<Arc<Song>> {
        self.inner.songs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Suma una referencia de cola a la canción.
    ///
    /// El incremento ocurre con el guard del mapa tomado, así que un barrido
    /// no puede eliminarla entre la búsqueda y el incremento.
    pub(crate) fn acquire(&self, id: &str) -> Result<Arc<Song>> {
        let entry = self
            .inner
            .songs
            .get(id)
            .ok_or_else(|| QueueError::SongNotFound(id.to_string()))?;
        entry.value().retain();
        Ok(Arc::clone(entry.value()))
    }

    fn spawn_refresh(&self, song: &Arc<Song>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let Ok(source) = self.source_for(song) else {
            return;
        };

        debug!("🔄 Refrescando metadata de {}", song.id());
        let song = Arc::clone(song);
        runtime.spawn(async move {
            song.refresh(source.as_ref()).await;
        });
    }

    /// Reserva un lugar para una canción nueva
    fn reserve(&self) -> Result<Slot<'_>> {
        let limit = self.inner.settings.hard_limit;
        self.inner
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| (used < limit).then_some(used + 1))
            .map_err(|_| {
                warn!("🚫 Caché llena ({} canciones)", limit);
                QueueError::CacheFull { limit }
            })?;

        Ok(Slot {
            slots: &self.inner.slots,
            committed: false,
        })
    }

    /// Elimina toda canción sin referencias, solo si la caché supera el
    /// límite blando. Devuelve cuántas se eliminaron.
    pub fn evict_unreferenced(&self) -> usize {
        let songs = &self.inner.songs;
        if songs.len() <= self.inner.settings.soft_limit {
            return 0;
        }

        let mut removed = 0;
        songs.retain(|_, song| {
            let keep = song.references() > 0;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.inner.slots.fetch_sub(removed, Ordering::AcqRel);

        if removed > 0 {
            info!("🧹 Limpieza de caché: {} canciones eliminadas, {} quedan", removed, songs.len());
        }
        removed
    }

    /// Barrido programado por `check_cleanup`
    fn sweep(&self) {
        self.evict_unreferenced();
        self.inner.sweep_scheduled.store(false, Ordering::Release);
    }

    /// Programa un barrido si se superó el límite blando y no hay otro pendiente
    fn check_cleanup(&self) {
        if self.len() <= self.inner.settings.soft_limit {
            return;
        }
        if self.inner.sweep_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.sweep();
            return;
        };

        let manager = self.clone();
        let delay = self.inner.settings.clean_delay();
        debug!("🧹 Limpieza de caché programada en {:?}", delay);

        runtime.spawn(async move {
            tokio::select! {
                _ = manager.inner.shutdown.cancelled() => {
                    manager.inner.sweep_scheduled.store(false, Ordering::Release);
                }
                _ = tokio::time::sleep(delay) => manager.sweep(),
            }
        });
    }

    /// Refresca la metadata de todas las canciones caducadas. Nunca elimina.
    pub async fn refresh_stale(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<Arc<Song>> = self
            .inner
            .songs
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for song in &stale {
            match self.source_for(song) {
                Ok(source) => song.refresh(source.as_ref()).await,
                Err(e) => warn!("⚠️ {}", e),
            }
        }

        if !stale.is_empty() {
            debug!("🔄 {} canciones refrescadas", stale.len());
        }
        stale.len()
    }

    /// Tarea periódica de refresco de metadata.
    ///
    /// Termina con [`shutdown`](Self::shutdown) o cuando se suelta el último
    /// clon del manager.
    pub fn spawn_refresh_task(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.settings.refresh_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // El primer tick es inmediato
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SongManager { inner }.refresh_stale().await;
            }

            debug!("🛑 Tarea de refresco de metadata detenida");
        })
    }

    /// Detiene las tareas en segundo plano
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Lugar reservado bajo `hard_limit`; se devuelve al soltarlo salvo que se
/// haya usado para insertar.
struct Slot<'a> {
    slots: &'a AtomicUsize,
    committed: bool,
}

impl Slot<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for SongManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongManager")
            .field("songs", &self.len())
            .field("sources", &self.inner.sources)
            .finish()
    }
}
