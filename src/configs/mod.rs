pub mod base;
pub mod player;
pub mod server;
pub mod sources;

pub use base::*;
pub use player::*;
pub use server::*;
pub use sources::*;
