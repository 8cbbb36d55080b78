//! Defaults applied when parsing machine definitions.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs for a machine.
pub const DEFAULT_NUM_CPUS: u32 = 4;

/// The default amount of memory in MiB for a machine.
pub const DEFAULT_MEMORY_MIB: u32 = 4096;

/// The only machine backend type currently defined.
pub const MACHINE_TYPE_KVM: &str = "kvm";

/// The default NIC device driver.
pub const DEFAULT_NIC_DEVICE: &str = "virtio-net";

/// The default NIC network backend.
pub const DEFAULT_NIC_NETWORK: &str = "user";

/// The base port for SPICE remote displays.
pub const SPICE_PORT_BASE: u16 = 5900;

/// The address SPICE displays bind to.
pub const SPICE_HOST_ADDRESS: &str = "127.0.0.1";
