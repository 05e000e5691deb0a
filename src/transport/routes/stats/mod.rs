pub mod info;
pub mod track;

pub use info::{get_info, get_stats, get_version, get_version_info};
pub use track::{decode_track, decode_tracks, load_tracks};
