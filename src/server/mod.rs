pub mod app_state;
pub mod session;

pub use app_state::AppState;
pub use session::Session;
