//! NIC declarations, port-forward rules, and address generation.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    config::{DEFAULT_NIC_DEVICE, DEFAULT_NIC_NETWORK},
    MachinedError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A network interface of a machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicDef {
    /// Identifier, unique within the machine.
    pub(crate) id: String,

    /// Device driver presented to the guest.
    #[serde(default = "default_nic_device")]
    pub(crate) device: String,

    /// MAC address; a random QEMU-prefixed address is generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) mac: Option<String>,

    /// Network backend name; `user` selects slirp user networking.
    #[serde(default = "default_nic_network")]
    pub(crate) network: String,

    /// Host-to-guest port forwarding rules (user networking only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) ports: Vec<PortRule>,

    /// Explicit PCI bus address.
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    pub(crate) bus_addr: Option<String>,

    /// Explicit boot index; unset means "allocate one".
    #[serde(rename = "bootindex", default, skip_serializing_if = "Option::is_none")]
    pub(crate) boot_index: Option<u32>,

    /// Option ROM image for the device.
    #[serde(rename = "romfile", default, skip_serializing_if = "Option::is_none")]
    pub(crate) rom_file: Option<PathBuf>,
}

/// The transport protocol of a port rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP forwarding.
    #[default]
    Tcp,
    /// UDP forwarding.
    Udp,
}

/// One endpoint of a port rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEndpoint {
    /// Bind/destination address; empty means "any".
    #[serde(rename = "addr", default)]
    pub(crate) address: String,

    /// Port number.
    pub(crate) port: u16,
}

/// A host-to-guest port forwarding rule.
///
/// Deserializes either from the structured form
/// `{protocol, host: {addr, port}, guest: {addr, port}}` or from the YAML
/// shorthand single-entry map `"tcp:localhost:22222": "localhost:22"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortRule {
    /// Transport protocol.
    pub(crate) protocol: Protocol,

    /// Host side of the forward.
    pub(crate) host: PortEndpoint,

    /// Guest side of the forward.
    pub(crate) guest: PortEndpoint,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NicDef {
    /// Returns the NIC identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the boot index, if one has been set or allocated.
    pub fn boot_index(&self) -> Option<u32> {
        self.boot_index
    }

    /// Returns true if this NIC uses slirp user networking.
    pub fn is_user_network(&self) -> bool {
        self.network == DEFAULT_NIC_NETWORK
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_nic_device() -> String {
    DEFAULT_NIC_DEVICE.to_string()
}

fn default_nic_network() -> String {
    DEFAULT_NIC_NETWORK.to_string()
}

/// Generates a random MAC address under the QEMU OUI prefix `52:54:00`.
pub fn random_qemu_mac() -> String {
    let mut rng = rand::thread_rng();
    let suffix: [u8; 3] = rng.gen();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        suffix[0], suffix[1], suffix[2]
    )
}

/// Generates a random 15-character tap interface name prefixed `anic`.
pub fn random_ifname() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..11)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("anic{}", suffix)
}

fn parse_port(s: &str) -> Result<u16, MachinedError> {
    s.parse()
        .map_err(|_| MachinedError::Validation(format!("invalid port number: {}", s)))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

impl FromStr for Protocol {
    type Err = MachinedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(MachinedError::Validation(format!(
                "invalid port rule protocol '{}', must be 'tcp' or 'udp'",
                other
            ))),
        }
    }
}

impl Display for PortRule {
    /// Renders the rule in QEMU hostfwd format:
    /// `proto:hostaddr:hostport-guestaddr:guestport`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}:{}",
            self.protocol, self.host.address, self.host.port, self.guest.address, self.guest.port
        )
    }
}

impl<'de> Deserialize<'de> for PortRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Structured {
                #[serde(default)]
                protocol: Protocol,
                host: PortEndpoint,
                guest: PortEndpoint,
            },
            Shorthand(BTreeMap<ShorthandKey, ShorthandValue>),
        }

        #[derive(Deserialize, PartialEq, Eq, PartialOrd, Ord)]
        #[serde(untagged)]
        enum ShorthandKey {
            Num(u16),
            Str(String),
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ShorthandValue {
            Num(u16),
            Str(String),
        }

        fn parse_host(key: &str) -> Result<(Protocol, PortEndpoint), MachinedError> {
            let tokens: Vec<&str> = key.split(':').collect();
            match tokens.as_slice() {
                [proto, addr, port] => Ok((
                    proto.parse()?,
                    PortEndpoint {
                        address: addr.to_string(),
                        port: parse_port(port)?,
                    },
                )),
                [addr, port] => Ok((
                    Protocol::Tcp,
                    PortEndpoint {
                        address: addr.to_string(),
                        port: parse_port(port)?,
                    },
                )),
                [port] => Ok((
                    Protocol::Tcp,
                    PortEndpoint {
                        address: String::new(),
                        port: parse_port(port)?,
                    },
                )),
                _ => Err(MachinedError::Validation(format!(
                    "invalid port rule host side: {}",
                    key
                ))),
            }
        }

        fn parse_guest(value: &str) -> Result<PortEndpoint, MachinedError> {
            match value.split(':').collect::<Vec<_>>().as_slice() {
                [addr, port] => Ok(PortEndpoint {
                    address: addr.to_string(),
                    port: parse_port(port)?,
                }),
                [port] => Ok(PortEndpoint {
                    address: String::new(),
                    port: parse_port(port)?,
                }),
                _ => Err(MachinedError::Validation(format!(
                    "invalid port rule guest side: {}",
                    value
                ))),
            }
        }

        match Repr::deserialize(deserializer)? {
            Repr::Structured {
                protocol,
                host,
                guest,
            } => Ok(PortRule {
                protocol,
                host,
                guest,
            }),
            Repr::Shorthand(map) => {
                let (key, value) = map.into_iter().next().ok_or_else(|| {
                    serde::de::Error::custom("port rule shorthand map is empty")
                })?;
                let host_value = match key {
                    ShorthandKey::Num(port) => port.to_string(),
                    ShorthandKey::Str(s) => s,
                };
                let guest_value = match value {
                    ShorthandValue::Num(port) => port.to_string(),
                    ShorthandValue::Str(s) => s,
                };
                let (protocol, host) =
                    parse_host(&host_value).map_err(serde::de::Error::custom)?;
                let guest = parse_guest(&guest_value).map_err(serde::de::Error::custom)?;
                Ok(PortRule {
                    protocol,
                    host,
                    guest,
                })
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
