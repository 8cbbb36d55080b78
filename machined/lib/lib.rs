//! `machined` is a per-user daemon managing the lifecycle of local virtual
//! machines backed by QEMU/KVM.
//!
//! # Overview
//!
//! machined keeps a registry of declaratively defined machines and drives
//! their runtime state: it synthesizes QEMU invocations, supervises the
//! emulator and its swtpm co-process, speaks QMP for control, and exposes
//! everything over a JSON HTTP API on a per-user UNIX socket.
//!
//! # Architecture
//!
//! - **config**: the declarative machine model (CPU/memory, disks, NICs,
//!   TPM, UEFI, cloud-init) with parse-time defaults and validation
//! - **qemu**: deterministic argv synthesis and firmware discovery
//! - **runtime**: the per-VM state machine, swtpm supervision, and the QMP
//!   session
//! - **management**: the machine registry, persistence, and daemon lifetime
//! - **server**: the REST API over the UNIX socket
//! - **utils**: per-user path resolution and filesystem helpers
//!
//! # Platform Support
//!
//! Linux only; VMs require `/dev/kvm` and the QEMU system emulator.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod management;
pub mod qemu;
pub mod runtime;
pub mod server;
pub mod utils;

pub use error::*;
