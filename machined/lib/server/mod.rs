//! The HTTP/UNIX API surface.
//!
//! A small JSON-over-HTTP router served on the daemon's UNIX socket:
//! - GET    /machines                 : list machines
//! - POST   /machines                 : define a machine
//! - GET    /machines/:name           : fetch one machine
//! - PUT    /machines/:name           : replace a definition
//! - DELETE /machines/:name           : delete a machine
//! - POST   /machines/:name/start     : start
//! - POST   /machines/:name/stop      : stop
//! - POST   /machines/:name/console   : console connection details

mod handlers;
mod routes;
mod state;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use routes::*;
pub use state::*;
pub use types::*;
