//! Declarative machine configuration types and validation.

mod cloudinit;
mod defaults;
mod disk;
mod machine;
mod nic;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cloudinit::*;
pub use defaults::*;
pub use disk::*;
pub use machine::*;
pub use nic::*;
