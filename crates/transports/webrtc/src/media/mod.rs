//! Local media: the live track set and its fan-out to peer connections

pub mod synchronizer;
pub mod track_source;

pub use synchronizer::TrackSynchronizer;
pub use track_source::{LocalTrack, MediaKind, TrackEvent, TrackId, TrackSource};
