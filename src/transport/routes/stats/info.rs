use std::sync::Arc;

use axum::{extract::State, response::Json};

use crate::{
    protocol::{GitInfo, Info, Stats, Version, VersionInfo, build_time},
    server::AppState,
};

/// GET /v4/info
pub async fn get_info(State(state): State<Arc<AppState>>) -> Json<Info> {
    tracing::debug!("GET /v4/info");
    Json(Info {
        version: Version::current(),
        build_time: build_time(),
        git: GitInfo::current(),
        source_managers: state.sources.names(),
        filters: Vec::new(),
        plugins: Vec::new(),
    })
}

/// GET /v4/stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    tracing::debug!("GET /v4/stats");
    Json(state.stats.collect(&state, None))
}

/// GET /version
pub async fn get_version() -> String {
    tracing::debug!("GET /version");
    env!("CARGO_PKG_VERSION").to_string()
}

/// GET /v4/version
pub async fn get_version_info() -> Json<VersionInfo> {
    tracing::debug!("GET /v4/version");
    Json(VersionInfo::current())
}
