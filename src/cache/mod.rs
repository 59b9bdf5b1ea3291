//! # Cache Module
//!
//! Process-wide song cache shared by every room.
//!
//! The [`SongManager`] deduplicates identical media across rooms: two
//! requests for the same source resolve to one [`Song`](crate::song::Song)
//! and each room keeps its own [`SongReference`](crate::song::SongReference).
//!
//! ## Limits
//!
//! - **Soft limit**: once exceeded, an eviction sweep is scheduled (one at a
//!   time) that drops every song no queue references.
//! - **Hard limit**: new songs are rejected with `CacheFull`; songs already
//!   cached are still served.
//!
//! ## Refresh
//!
//! Metadata with a TTL (YouTube) is refreshed in place, lazily on `get` and
//! periodically by [`SongManager::spawn_refresh_task`]. Refreshing never
//! evicts.
//!
//! ```env
//! OPEN_MUSIC_SONG_MANAGER__SOFT_LIMIT=250
//! OPEN_MUSIC_SONG_MANAGER__HARD_LIMIT=500
//! OPEN_MUSIC_SONG_MANAGER__REFRESH_INTERVAL_SECONDS=600
//! ```

pub mod song_manager;

pub use song_manager::SongManager;
