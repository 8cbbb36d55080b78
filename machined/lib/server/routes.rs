//! Route table.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Builds the API router.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/machines",
            get(handlers::list_machines).post(handlers::create_machine),
        )
        .route(
            "/machines/{name}",
            get(handlers::get_machine)
                .put(handlers::update_machine)
                .delete(handlers::delete_machine),
        )
        .route("/machines/{name}/start", post(handlers::start_machine))
        .route("/machines/{name}/stop", post(handlers::stop_machine))
        .route("/machines/{name}/console", post(handlers::machine_console))
        .with_state(state)
}
