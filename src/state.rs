use std::sync::Arc;

use axum::extract::FromRef;

use crate::config::Config;
use crate::engine::ExamEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExamEngine>,
    pub config: Config,
}

impl FromRef<AppState> for Arc<ExamEngine> {
    fn from_ref(state: &AppState) -> Self {
        state.engine.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
