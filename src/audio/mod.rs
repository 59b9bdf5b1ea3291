//! # Audio Module
//!
//! Per-room playback for Open Music.
//!
//! ## Architecture
//!
//! ### [`manager`] - Room Registry
//! - One [`ServerQueue`] per room, created on demand
//! - Optional single active room policy
//! - Automatic teardown when an inactivity timer expires
//!
//! ### [`queue`] - Playback State Machine
//! - Ordered references into the shared song cache
//! - Loop (off/song/queue), shuffle, pause, volume, seek, jump
//! - Stale stream events are discarded by play generation
//! - Bounded stream retries; a bad song never stalls the queue
//!
//! ### [`inactivity`] - Idle Teardown
//! - Alone timer: nobody else in the voice channel
//! - Idle timer: nothing playing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_core::audio::{JoinContext, QueueManager};
//! use open_music_core::{cache::SongManager, config::Config, notifier::LogNotifier};
//! use open_music_core::sources::SourceRegistry;
//! use serenity::model::id::{GuildId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example(context: JoinContext) -> anyhow::Result<()> {
//! let config = Config::default();
//! let songs = SongManager::new(
//!     SourceRegistry::with_defaults(&config.tools, &config.song_manager),
//!     config.song_manager.clone(),
//! );
//! let rooms = QueueManager::new(songs.clone(), Arc::new(LogNotifier), config.queue, config.inactivity);
//!
//! let text_channel = context.text_channel;
//! let queue = rooms.get_or_create(GuildId::new(1), context).await;
//! queue.join().await?;
//!
//! let song = songs
//!     .get_or_create("https://youtu.be/dQw4w9WgXcQ", UserId::new(2), text_channel)
//!     .await?;
//! queue.add(vec![song])?;
//! queue.play_if_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod cursor;
pub mod inactivity;
pub mod manager;
pub mod queue;
pub mod snapshot;

pub use cursor::LoopMode;
pub use inactivity::{InactivityHelper, LeaveReason};
pub use manager::{JoinContext, QueueManager};
pub use queue::{PlaybackState, ServerQueue};
pub use snapshot::{QueuePage, QueueSnapshot, SnapshotEntry};
