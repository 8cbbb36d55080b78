//! Arguments of the machined daemon binary.

use clap::Parser;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A daemon managing the lifecycle of QEMU/KVM virtual machines.
///
/// Serves a RESTful API on a per-user UNIX socket to define, start, stop,
/// and delete machines.
#[derive(Debug, Parser)]
#[command(name = "machined", version, about)]
pub struct MachinedArgs {
    /// Log filter, e.g. `info` or `machined=debug`.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
