//! Request and response payloads.

use serde::{Deserialize, Serialize};

use crate::{config::MachineStatus, management::ConsoleKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Body of `POST /machines/:name/start`; `status` must be `running`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    /// The requested target status.
    pub status: MachineStatus,
}

/// Body of `POST /machines/:name/stop`; `status` must be `stopped`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopRequest {
    /// The requested target status.
    pub status: MachineStatus,

    /// Skip the graceful guest shutdown.
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /machines/:name/console`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsoleRequest {
    /// The console kind to connect to.
    #[serde(rename = "type")]
    pub kind: ConsoleKind,
}

/// Query parameters of `DELETE /machines/:name`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    /// Stop a running machine before deleting it.
    #[serde(default)]
    pub force: bool,
}

/// JSON error body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}
