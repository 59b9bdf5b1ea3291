use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tracing::{debug, info};

use super::{
    inactivity::{InactivityHelper, LeaveCallback, LeaveReason},
    queue::ServerQueue,
};
use crate::{
    cache::SongManager,
    config::{InactivitySettings, QueueSettings},
    notifier::{Notifier, QueueEvent},
    voice::{OutputSink, VoiceConnection},
};

/// Lo necesario para crear la cola de una sala
#[derive(Clone)]
pub struct JoinContext {
    /// Canal de texto para los avisos de la sala
    pub text_channel: ChannelId,
    pub voice_channel: ChannelId,
    pub voice: Arc<dyn VoiceConnection>,
    pub sink: Arc<dyn OutputSink>,
}

/// Registro de colas: a lo sumo una por sala
pub struct QueueManager {
    rooms: DashMap<GuildId, ServerQueue>,
    songs: SongManager,
    notifier: Arc<dyn Notifier>,
    queue_settings: QueueSettings,
    inactivity_settings: InactivitySettings,
    next_session: AtomicU64,
    this: Weak<QueueManager>,
}

impl QueueManager {
    pub fn new(
        songs: SongManager,
        notifier: Arc<dyn Notifier>,
        queue_settings: QueueSettings,
        inactivity_settings: InactivitySettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            rooms: DashMap::new(),
            songs,
            notifier,
            queue_settings,
            inactivity_settings,
            next_session: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn songs(&self) -> &SongManager {
        &self.songs
    }

    pub fn get(&self, room: GuildId) -> Option<ServerQueue> {
        self.rooms.get(&room).map(|queue| queue.value().clone())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn rooms(&self) -> Vec<GuildId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    /// Devuelve la cola de la sala, creándola si no existe.
    ///
    /// Crearla no conecta la voz ni inicia la reproducción. Con
    /// `single_room` se cierran todas las demás salas primero.
    pub async fn get_or_create(&self, room: GuildId, context: JoinContext) -> ServerQueue {
        if let Some(queue) = self.get(room) {
            return queue;
        }

        if self.queue_settings.single_room {
            let others: Vec<GuildId> = self.rooms().into_iter().filter(|other| *other != room).collect();
            for other in others {
                info!("🔀 Modo sala única: cerrando {}", other);
                self.remove(other).await;
            }
        }

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let inactivity = InactivityHelper::new(&self.inactivity_settings, self.teardown_callback(room, session));
        let queue = ServerQueue::new(
            room,
            session,
            context,
            self.songs.clone(),
            self.notifier.clone(),
            self.queue_settings.clone(),
            inactivity,
        );

        let queue = match self.rooms.entry(room) {
            // Otra tarea creó la sala mientras tanto
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(queue).value().clone(),
        };

        info!("🎶 Cola creada para la sala {}", room);
        queue.inactivity().on_not_playing();
        queue
    }

    /// Cierra y elimina la sala. No hace nada si no existe.
    pub async fn remove(&self, room: GuildId) {
        let Some((_, queue)) = self.rooms.remove(&room) else {
            debug!("Sala {} inexistente, nada que eliminar", room);
            return;
        };
        queue.leave().await;
    }

    /// Cambio de oyentes en el canal de voz de la sala
    pub fn on_listener_count(&self, room: GuildId, others: usize) {
        if let Some(queue) = self.get(room) {
            queue.on_listener_count(others);
        }
    }

    /// Cierra todas las salas
    pub async fn shutdown(&self) {
        let rooms = self.rooms();
        info!("🛑 Cerrando {} salas", rooms.len());
        join_all(rooms.into_iter().map(|room| self.remove(room))).await;
    }

    fn teardown_callback(&self, room: GuildId, session: u64) -> LeaveCallback {
        let manager = self.this.clone();
        Arc::new(move |reason| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                manager.teardown(room, session, reason).await;
            });
        })
    }

    /// Desconexión automática; si la sala ya se cerró (o es otra instancia)
    /// no hace nada.
    async fn teardown(&self, room: GuildId, session: u64, reason: LeaveReason) {
        let Some((_, queue)) = self.rooms.remove_if(&room, |_, queue| queue.session() == session) else {
            debug!("Sala {} ya cerrada, timer ignorado", room);
            return;
        };

        info!("👋 Saliendo de {} ({})", room, reason);
        self.notifier.notify(QueueEvent::Leaving {
            room,
            channel: queue.text_channel(),
            reason,
        });
        queue.leave().await;
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("rooms", &self.rooms())
            .field("songs", &self.songs)
            .finish()
    }
}
