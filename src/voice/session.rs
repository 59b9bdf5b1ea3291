use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::JoinError,
    input::{ChildContainer, File, HttpRequest, Input},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{volume_gain, CompletionHandle, OutputSink, VoiceConnection};
use crate::{
    error::{QueueError, Result},
    sources::AudioStream,
};

/// Conexión de voz y sink de audio de una sala sobre songbird
pub struct SongbirdSession {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel_id: ChannelId,
    http: reqwest::Client,
    track: Mutex<Option<TrackHandle>>,
}

impl SongbirdSession {
    pub fn new(manager: Arc<Songbird>, guild_id: GuildId, channel_id: ChannelId, http: reqwest::Client) -> Self {
        Self {
            manager,
            guild_id,
            channel_id,
            http,
            track: Mutex::new(None),
        }
    }

    fn input(&self, stream: AudioStream) -> Input {
        match stream {
            AudioStream::Url(url) => HttpRequest::new(self.http.clone(), url).into(),
            AudioStream::File(path) => File::new(path).into(),
            AudioStream::Process(child) => ChildContainer::from(child).into(),
        }
    }

    fn current_track(&self) -> Option<TrackHandle> {
        self.track.lock().clone()
    }
}

#[async_trait]
impl VoiceConnection for SongbirdSession {
    async fn join(&self) -> Result<()> {
        self.manager
            .join(self.guild_id, self.channel_id)
            .await
            .map_err(|e| QueueError::Voice(format!("{:?}", e)))?;

        info!("🔊 Conectado al canal de voz {} en guild {}", self.channel_id, self.guild_id);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.track.lock().take();

        match self.manager.remove(self.guild_id).await {
            Ok(()) => {
                info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
                Ok(())
            }
            Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(QueueError::Voice(format!("{:?}", e))),
        }
    }
}

#[async_trait]
impl OutputSink for SongbirdSession {
    async fn subscribe(&self, stream: AudioStream, volume: u16, completion: CompletionHandle) -> Result<()> {
        let Some(call) = self.manager.get(self.guild_id) else {
            stream.discard();
            return Err(QueueError::Voice("not connected to a voice channel".to_string()));
        };

        let input = self.input(stream);
        let generation = completion.generation();
        let handle = call.lock().await.play_only_input(input);

        if let Err(e) = handle.set_volume(volume_gain(volume)) {
            warn!("⚠️ No se pudo aplicar el volumen: {:?}", e);
        }

        // End y Error comparten el handle: el primero que llegue lo consume
        let completion = Arc::new(Mutex::new(Some(completion)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            let handler = TrackEndHandler {
                completion: completion.clone(),
            };
            if let Err(e) = handle.add_event(Event::Track(event), handler) {
                // Sin eventos la cola nunca se enteraría del final
                completion.lock().take();
                let _ = handle.stop();
                return Err(QueueError::Voice(format!("Error al agregar event handler: {:?}", e)));
            }
        }

        debug!("▶️ Stream suscrito (generación {}) en guild {}", generation, self.guild_id);
        *self.track.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(track) = self.track.lock().take() {
            if let Err(e) = track.stop() {
                debug!("Track ya detenido: {:?}", e);
            }
        }
    }

    async fn pause(&self) -> Result<()> {
        if let Some(track) = self.current_track() {
            track.pause().map_err(|e| QueueError::Voice(format!("{:?}", e)))?;
        }
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        if let Some(track) = self.current_track() {
            track.play().map_err(|e| QueueError::Voice(format!("{:?}", e)))?;
        }
        Ok(())
    }

    async fn set_volume(&self, volume: u16) -> Result<()> {
        if let Some(track) = self.current_track() {
            track
                .set_volume(volume_gain(volume))
                .map_err(|e| QueueError::Voice(format!("{:?}", e)))?;
        }
        Ok(())
    }
}

/// Handler para cuando termina (o falla) un track
struct TrackEndHandler {
    completion: Arc<Mutex<Option<CompletionHandle>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let Some(completion) = self.completion.lock().take() else {
            return None;
        };

        let failure = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{:?}", e)),
                _ => None,
            }),
            _ => None,
        };

        match failure {
            Some(reason) => {
                error!("❌ Error en el track: {}", reason);
                completion.fail(reason);
            }
            None => {
                debug!("Track terminado");
                completion.finish();
            }
        }

        None
    }
}
