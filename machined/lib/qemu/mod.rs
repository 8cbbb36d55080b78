//! QEMU configuration synthesis: from a declarative machine definition to a
//! concrete argv and the set of sockets the VM will expose.

mod firmware;
mod index;
mod synth;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use firmware::*;
pub use index::*;
pub use synth::*;
