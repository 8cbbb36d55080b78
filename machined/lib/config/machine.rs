//! The machine definition model: the declarative source of truth for one VM.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{CloudInitConfig, NicDef, QemuDisk, DEFAULT_MEMORY_MIB, DEFAULT_NUM_CPUS, MACHINE_TYPE_KVM},
    utils::path_exists,
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The externally visible status of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Defined but never started in this daemon's lifetime.
    Initialized,
    /// Not running.
    #[default]
    Stopped,
    /// Start requested, not yet running.
    Starting,
    /// The QEMU child is alive and the QMP session is usable.
    Running,
    /// Stop requested, not yet stopped.
    Stopping,
    /// The instance died or failed to become ready.
    Failed,
}

/// The TPM specification version a software TPM emulates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpmVersion {
    /// TPM 1.2.
    #[serde(rename = "1.2")]
    V1_2,
    /// TPM 2.0.
    #[default]
    #[serde(rename = "2.0")]
    V2_0,
}

/// The device class a machine prefers to boot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Boot from the attached cdrom.
    Cdrom,
    /// Network boot.
    Net,
    /// Boot from the first rotational disk.
    Hdd,
    /// Boot from the first solid-state disk.
    Ssd,
}

/// The emulator-level specification of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct VmDef {
    /// Number of vCPUs.
    #[serde(default = "default_cpus")]
    #[builder(default = DEFAULT_NUM_CPUS)]
    pub(crate) cpus: u32,

    /// Memory in MiB.
    #[serde(default = "default_memory")]
    #[builder(default = DEFAULT_MEMORY_MIB)]
    pub(crate) memory: u32,

    /// Boot with UEFI firmware.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub(crate) uefi: bool,

    /// Require secure-boot capable firmware.
    #[serde(default)]
    #[builder(default)]
    pub(crate) secure_boot: bool,

    /// Attach a software TPM.
    #[serde(default)]
    #[builder(default)]
    pub(crate) tpm: bool,

    /// TPM specification version.
    #[serde(default)]
    #[builder(default)]
    pub(crate) tpm_version: TpmVersion,

    /// Expose a graphical console over SPICE.
    #[serde(default)]
    #[builder(default)]
    pub(crate) gui: bool,

    /// Source path of a UEFI code blob, overriding system firmware discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) uefi_code: Option<PathBuf>,

    /// Source path of a UEFI vars template, overriding system firmware discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) uefi_vars: Option<PathBuf>,

    /// Optional cdrom image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) cdrom: Option<PathBuf>,

    /// Preferred boot device class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) boot: Option<BootDevice>,

    /// Disks, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) disks: Vec<QemuDisk>,

    /// NICs, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub(crate) nics: Vec<NicDef>,

    /// Cloud-init seed documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) cloud_init: Option<CloudInitConfig>,
}

/// A machine definition: the persisted, declarative description of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub with_prefix")]
pub struct MachineDef {
    /// Unique machine name; used as filesystem and API key.
    pub(crate) name: String,

    /// Backend type tag; only `kvm` is defined.
    #[serde(rename = "type", default = "default_machine_type")]
    #[builder(default = MACHINE_TYPE_KVM.to_string())]
    pub(crate) machine_type: String,

    /// Ephemeral machines are never persisted to disk.
    #[serde(default)]
    #[builder(default)]
    pub(crate) ephemeral: bool,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    #[builder(default)]
    pub(crate) description: String,

    /// The emulator-level specification.
    pub(crate) config: VmDef,

    /// Runtime status; present in API responses, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub(crate) status: Option<MachineStatus>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TpmVersion {
    /// Returns true for TPM 2.0.
    pub fn is_v2(&self) -> bool {
        matches!(self, TpmVersion::V2_0)
    }
}

impl VmDef {
    /// Rejects inconsistent or out-of-range declarations.
    pub fn validate(&self) -> MachinedResult<()> {
        if self.cpus < 1 {
            return Err(MachinedError::Validation("cpus must be at least 1".into()));
        }
        if self.memory < 1 {
            return Err(MachinedError::Validation(
                "memory must be at least 1 MiB".into(),
            ));
        }

        let mut nic_ids = HashSet::new();
        for nic in &self.nics {
            if nic.id().is_empty() {
                return Err(MachinedError::Validation("nic with empty id".into()));
            }
            if !nic_ids.insert(nic.id().to_string()) {
                return Err(MachinedError::Validation(format!(
                    "duplicate nic id: {}",
                    nic.id()
                )));
            }
        }

        for disk in &self.disks {
            if disk.file().as_os_str().is_empty() {
                return Err(MachinedError::Validation("disk with empty file".into()));
            }
        }

        self.validate_boot_indices()?;

        if self.boot == Some(BootDevice::Cdrom) && self.cdrom.is_none() {
            return Err(MachinedError::Validation(
                "boot=cdrom requires a cdrom image".into(),
            ));
        }

        Ok(())
    }

    /// Rejects boot-index collisions among explicitly indexed devices.
    ///
    /// When boot=cdrom, index 0 is reserved for the injected cdrom disk.
    fn validate_boot_indices(&self) -> MachinedResult<()> {
        let mut claimed: BTreeMap<u32, String> = BTreeMap::new();
        if self.boot == Some(BootDevice::Cdrom) {
            claimed.insert(0, "cdrom (boot=cdrom)".to_string());
        }

        let disks = self
            .disks
            .iter()
            .filter_map(|d| d.boot_index().map(|i| (i, format!("disk {}", d.file().display()))));
        let nics = self
            .nics
            .iter()
            .filter_map(|n| n.boot_index().map(|i| (i, format!("nic {}", n.id()))));

        for (index, device) in disks.chain(nics) {
            if let Some(holder) = claimed.get(&index) {
                return Err(MachinedError::Validation(format!(
                    "duplicate boot index {}: {} collides with {}",
                    index, device, holder
                )));
            }
            claimed.insert(index, device);
        }
        Ok(())
    }
}

impl MachineDef {
    /// Validates the whole definition.
    pub fn validate(&self) -> MachinedResult<()> {
        if self.name.is_empty() {
            return Err(MachinedError::Validation("machine name is empty".into()));
        }
        if self.name.contains('/') || self.name.contains(char::is_whitespace) {
            return Err(MachinedError::Validation(format!(
                "machine name '{}' must not contain '/' or whitespace",
                self.name
            )));
        }
        if self.machine_type != MACHINE_TYPE_KVM {
            return Err(MachinedError::Validation(format!(
                "unknown machine type '{}', only '{}' is supported",
                self.machine_type, MACHINE_TYPE_KVM
            )));
        }
        self.config.validate()
    }

    /// Rewrites user-supplied file paths to absolute paths.
    ///
    /// Absolute paths are used as-is, `~/` expands against `home`, and
    /// anything else is joined to `cwd`. Paths that must already exist are
    /// checked; disks that will be created (`size > 0`) are exempt.
    pub fn check_machine_file_paths(
        &mut self,
        home: Option<&Path>,
        cwd: &Path,
    ) -> MachinedResult<()> {
        for disk in &mut self.config.disks {
            if disk.size.bytes() == 0 {
                disk.file = resolve_existing_path(&disk.file, home, cwd)?;
            }
        }
        if let Some(cdrom) = self.config.cdrom.take() {
            self.config.cdrom = Some(resolve_existing_path(&cdrom, home, cwd)?);
        }
        if let Some(code) = self.config.uefi_code.take() {
            self.config.uefi_code = Some(resolve_existing_path(&code, home, cwd)?);
        }
        if let Some(vars) = self.config.uefi_vars.take() {
            self.config.uefi_vars = Some(resolve_existing_path(&vars, home, cwd)?);
        }
        Ok(())
    }

    /// Returns a copy with the given runtime status filled in.
    pub fn with_status(&self, status: MachineStatus) -> MachineDef {
        let mut def = self.clone();
        def.status = Some(status);
        def
    }

    /// Returns a copy with no runtime status, suitable for persisting.
    pub fn without_status(&self) -> MachineDef {
        let mut def = self.clone();
        def.status = None;
        def
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_cpus() -> u32 {
    DEFAULT_NUM_CPUS
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MIB
}

fn default_true() -> bool {
    true
}

fn default_machine_type() -> String {
    MACHINE_TYPE_KVM.to_string()
}

/// Expands `path` to an absolute path and verifies it exists.
fn resolve_existing_path(
    path: &Path,
    home: Option<&Path>,
    cwd: &Path,
) -> MachinedResult<PathBuf> {
    let resolved = expand_path(path, home, cwd)?;
    if !path_exists(&resolved) {
        return Err(MachinedError::AssetMissing(format!(
            "referenced file {} does not exist",
            resolved.display()
        )));
    }
    Ok(resolved)
}

/// Expands `~/` against `home` and joins relative paths to `cwd`.
pub fn expand_path(path: &Path, home: Option<&Path>, cwd: &Path) -> MachinedResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if let Ok(rest) = path.strip_prefix("~") {
        let home = home.ok_or_else(|| {
            MachinedError::Validation(format!(
                "cannot expand '{}': HOME is not set",
                path.display()
            ))
        })?;
        return Ok(home.join(rest));
    }
    Ok(cwd.join(path))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MachineStatus::Initialized => "initialized",
            MachineStatus::Stopped => "stopped",
            MachineStatus::Starting => "starting",
            MachineStatus::Running => "running",
            MachineStatus::Stopping => "stopping",
            MachineStatus::Failed => "failed",
        })
    }
}

impl Display for TpmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TpmVersion::V1_2 => "1.2",
            TpmVersion::V2_0 => "2.0",
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: slick-seal
type: kvm
ephemeral: false
description: test machine
config:
  cpus: 2
  memory: 2048
  tpm: true
  tpm-version: "2.0"
  secure-boot: true
  disks:
    - file: root.qcow2
      size: 50GiB
      type: ssd
      attach: virtio
      bootindex: 0
  nics:
    - id: nic0
      device: virtio-net
      network: user
"#;

    #[test]
    fn test_parse_applies_defaults() {
        let def: MachineDef = serde_yaml::from_str("name: vm0\nconfig: {}").unwrap();
        assert_eq!(def.machine_type, "kvm");
        assert!(!def.ephemeral);
        assert_eq!(def.config.cpus, DEFAULT_NUM_CPUS);
        assert_eq!(def.config.memory, DEFAULT_MEMORY_MIB);
        assert!(def.config.uefi);
        assert!(!def.config.tpm);
        assert_eq!(def.config.tpm_version, TpmVersion::V2_0);
        def.validate().unwrap();
    }

    #[test]
    fn test_builder_defaults_match_parse_defaults() {
        let built = VmDef::builder().build();
        let parsed: VmDef = serde_yaml::from_str("{}").unwrap();
        assert_eq!(built, parsed);

        let def = MachineDef::builder()
            .name("vm0".to_string())
            .config(VmDef::builder().cpus(2).build())
            .build();
        def.validate().unwrap();
        assert_eq!(def.machine_type, "kvm");
    }

    #[test]
    fn test_parse_sample() {
        let def: MachineDef = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(def.name, "slick-seal");
        assert_eq!(def.config.cpus, 2);
        assert!(def.config.tpm);
        assert!(def.config.secure_boot);
        assert_eq!(def.config.disks.len(), 1);
        assert_eq!(def.config.disks[0].boot_index(), Some(0));
        def.validate().unwrap();
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let def: MachineDef = serde_yaml::from_str(SAMPLE).unwrap();
        let yaml = serde_yaml::to_string(&def.without_status()).unwrap();
        let back: MachineDef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let r: Result<MachineDef, _> =
            serde_yaml::from_str("name: vm0\nconfig: {}\nflavour: spicy");
        assert!(r.is_err());
        let r: Result<MachineDef, _> =
            serde_yaml::from_str("name: vm0\nconfig: {turbo: true}");
        assert!(r.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_type() {
        let def: MachineDef =
            serde_yaml::from_str("name: vm0\ntype: xen\nconfig: {}").unwrap();
        let err = def.validate().unwrap_err();
        assert!(matches!(err, MachinedError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_zero_cpus() {
        let def: MachineDef =
            serde_yaml::from_str("name: vm0\nconfig: {cpus: 0}").unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_boot_index() {
        let def: MachineDef = serde_yaml::from_str(
            r#"
name: vm0
config:
  disks:
    - {file: a.qcow2, bootindex: 0}
    - {file: b.qcow2, bootindex: 0}
"#,
        )
        .unwrap();
        let err = def.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate boot index 0"));
        assert!(msg.contains("b.qcow2"));
    }

    #[test]
    fn test_validate_rejects_boot_cdrom_index_clash() {
        let def: MachineDef = serde_yaml::from_str(
            r#"
name: vm0
config:
  cdrom: /media/install.iso
  boot: cdrom
  disks:
    - {file: a.qcow2, bootindex: 0}
"#,
        )
        .unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_nic_id() {
        let def: MachineDef = serde_yaml::from_str(
            "name: vm0\nconfig:\n  nics:\n    - {id: nic0}\n    - {id: nic0}\n",
        )
        .unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_check_machine_file_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path();
        std::fs::write(cwd.join("existing.qcow2"), b"x").unwrap();

        let mut def: MachineDef = serde_yaml::from_str(
            "name: vm0\nconfig:\n  disks:\n    - {file: existing.qcow2}\n    - {file: new.qcow2, size: 1GiB}\n",
        )
        .unwrap();
        def.check_machine_file_paths(None, cwd).unwrap();

        // Existing disk is qualified against the cwd; to-be-created disk is
        // left for the run-directory join.
        assert_eq!(def.config.disks[0].file(), cwd.join("existing.qcow2"));
        assert_eq!(def.config.disks[1].file(), Path::new("new.qcow2"));
    }

    #[test]
    fn test_check_machine_file_paths_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut def: MachineDef = serde_yaml::from_str(
            "name: vm0\nconfig:\n  disks:\n    - {file: nope.qcow2}\n",
        )
        .unwrap();
        let err = def.check_machine_file_paths(None, dir.path()).unwrap_err();
        assert!(matches!(err, MachinedError::AssetMissing(_)));
    }

    #[test]
    fn test_expand_path_tilde() {
        let home = Path::new("/home/u");
        assert_eq!(
            expand_path(Path::new("~/images/a.iso"), Some(home), Path::new("/cwd")).unwrap(),
            PathBuf::from("/home/u/images/a.iso")
        );
        assert_eq!(
            expand_path(Path::new("rel.iso"), Some(home), Path::new("/cwd")).unwrap(),
            PathBuf::from("/cwd/rel.iso")
        );
        assert_eq!(
            expand_path(Path::new("/abs.iso"), Some(home), Path::new("/cwd")).unwrap(),
            PathBuf::from("/abs.iso")
        );
        assert!(expand_path(Path::new("~/x"), None, Path::new("/cwd")).is_err());
    }
}
