//! Shared server state.

use std::sync::Arc;

use crate::management::MachineRegistry;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct ServerState {
    registry: Arc<MachineRegistry>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates server state around a registry.
    pub fn new(registry: Arc<MachineRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the machine registry.
    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }
}
