pub mod middleware;
pub mod protocol;
mod routes;
pub mod sessions;
pub mod socket;

use std::sync::Arc;

use axum::Router;

use crate::auth::Authenticator;
use crate::runs::manager::RunSessionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RunSessionManager>,
    pub auth: Authenticator,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
