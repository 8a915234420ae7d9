use std::sync::Arc;

use crate::engine::Flakewatch;

#[derive(Clone)]
pub struct AppState {
    pub app: Arc<Flakewatch>,
}

impl AppState {
    pub fn new(app: Arc<Flakewatch>) -> Self {
        Self { app }
    }
}
