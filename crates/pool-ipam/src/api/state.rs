//! Application state for the API

use crate::engine::NodeEngine;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<NodeEngine>,
}

impl AppState {
    pub fn new(engine: Arc<NodeEngine>) -> Self {
        Self { engine }
    }
}
