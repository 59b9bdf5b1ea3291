//! # Open Music Core
//!
//! Núcleo de reproducción de Open Music: caché compartida de canciones,
//! una cola por sala y las costuras hacia la voz de Discord.
//!
//! - [`cache`]: canciones resueltas, deduplicadas y con conteo de referencias
//! - [`audio`]: colas por sala, loop, shuffle, seek y desconexión por inactividad
//! - [`sources`]: YouTube y archivos/URLs de audio vía yt-dlp y ffprobe
//! - [`voice`]: sink de audio y conexión de voz (songbird)

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod notifier;
pub mod song;
pub mod sources;
pub mod voice;

#[cfg(test)]
mod testing;

pub use audio::{LoopMode, PlaybackState, QueueManager, ServerQueue};
pub use cache::SongManager;
pub use config::Config;
pub use error::{QueueError, Result};
pub use song::{Song, SongReference};
