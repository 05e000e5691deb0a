pub mod destroy;
pub mod get;
pub mod update;

pub use destroy::destroy_player;
pub use get::{get_player, get_players};
pub use update::{update_player, update_session};

use std::sync::Arc;

use crate::{
    common::{RenodeError, types::SessionId},
    server::{AppState, Session},
};

fn session_or_404(
    state: &AppState,
    session_id: &SessionId,
    path: &str,
) -> Result<Arc<Session>, RenodeError> {
    state
        .session(session_id)
        .ok_or_else(|| RenodeError::not_found(format!("Session not found: {}", session_id), path))
}
