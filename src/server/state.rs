use std::sync::Arc;

use crate::session::SessionService;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServeState {
    pub service: Arc<SessionService>,
}

impl ServeState {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }
}
