mod routes;

pub use routes::build_router;

use std::sync::Arc;

use crate::engine::ProcessEngine;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProcessEngine>,
    pub store: Arc<dyn Store>,
}
