//! Disk declarations and the disk import/create planner.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::process::Command;

use crate::{
    utils::{copy_file_ref_sparse, path_exists, which},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A disk size in bytes.
///
/// Accepts either a plain byte count or a human-readable size literal
/// (`50GiB`, `512M`, `1.5TB`). A size of zero means "use the existing file".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiskSize(pub(crate) u64);

/// The on-disk image format of a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// QEMU copy-on-write v2.
    #[default]
    Qcow2,
    /// Raw image.
    Raw,
}

/// What kind of device the guest should see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// Rotational disk.
    Hdd,
    /// Solid-state disk.
    #[default]
    Ssd,
    /// Read-only optical media.
    Cdrom,
}

/// The bus a disk is attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskAttach {
    /// virtio-scsi with a dedicated iothread.
    #[default]
    Scsi,
    /// NVMe controller.
    Nvme,
    /// virtio-blk on the PCIe root bus.
    Virtio,
    /// AHCI / SATA.
    Ide,
    /// USB mass storage behind an xHCI controller.
    Usb,
}

/// A single disk of a machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QemuDisk {
    /// Path to the backing file. Bare filenames resolve against the VM's run
    /// directory.
    pub(crate) file: PathBuf,

    /// Image format.
    #[serde(default)]
    pub(crate) format: DiskFormat,

    /// Size in bytes; zero means the file must already exist.
    #[serde(default)]
    pub(crate) size: DiskSize,

    /// Device kind presented to the guest.
    #[serde(rename = "type", default)]
    pub(crate) disk_type: DiskType,

    /// Attachment bus.
    #[serde(default)]
    pub(crate) attach: DiskAttach,

    /// Logical/physical block size in bytes.
    #[serde(rename = "blocksize", default, skip_serializing_if = "Option::is_none")]
    pub(crate) block_size: Option<u32>,

    /// Explicit PCI bus address.
    #[serde(rename = "addr", default, skip_serializing_if = "Option::is_none")]
    pub(crate) bus_addr: Option<String>,

    /// Explicit boot index; unset means "allocate one".
    #[serde(rename = "bootindex", default, skip_serializing_if = "Option::is_none")]
    pub(crate) boot_index: Option<u32>,

    /// Attach the device read-only.
    #[serde(rename = "read-only", default)]
    pub(crate) read_only: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DiskSize {
    /// Returns the size in bytes.
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl QemuDisk {
    /// Returns the backing file path.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Returns the device kind.
    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    /// Returns the attachment bus.
    pub fn attach(&self) -> DiskAttach {
        self.attach
    }

    /// Returns the boot index, if one has been set or allocated.
    pub fn boot_index(&self) -> Option<u32> {
        self.boot_index
    }

    /// Applies defaults and path rules and rejects inconsistent declarations.
    ///
    /// Bare filenames (no `/` component) are resolved against `run_dir`;
    /// cdrom media is forced read-only.
    pub fn sanitize(&mut self, run_dir: &Path) -> MachinedResult<()> {
        if self.file.as_os_str().is_empty() {
            return Err(MachinedError::Validation("disk with empty file".into()));
        }

        if self.file.components().count() == 1 && !self.file.is_absolute() {
            self.file = run_dir.join(&self.file);
        }

        if self.disk_type == DiskType::Cdrom {
            self.read_only = true;
        }

        Ok(())
    }

    /// Returns the device serial presented to the guest.
    ///
    /// The serial is the filename stem; virtio-attached SSDs get an `ssd-`
    /// prefix so guest tooling can recognise them (virtio-blk has no
    /// rotation_rate property).
    pub fn serial(&self) -> String {
        let stem = self
            .file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.disk_type == DiskType::Ssd
            && self.attach == DiskAttach::Virtio
            && !stem.starts_with("ssd-")
        {
            return format!("ssd-{}", stem);
        }
        stem
    }

    /// Returns the rotation rate to advertise, when the bus supports one.
    pub fn rotation_rate(&self) -> Option<u32> {
        match (self.attach, self.disk_type) {
            (DiskAttach::Scsi, DiskType::Ssd) | (DiskAttach::Ide, DiskType::Ssd) => Some(1),
            (DiskAttach::Scsi, DiskType::Hdd) => Some(15000),
            (DiskAttach::Ide, DiskType::Hdd) => Some(7200),
            _ => None,
        }
    }

    /// Creates the backing file with `qemu-img` if it does not exist.
    ///
    /// Cdrom media and zero-sized disks are never created.
    pub async fn create(&self) -> MachinedResult<()> {
        if self.disk_type == DiskType::Cdrom || self.size.bytes() == 0 {
            tracing::debug!(file = %self.file.display(), "skipping create");
            return Ok(());
        }

        if which("qemu-img").is_none() {
            return Err(MachinedError::AssetMissing(
                "no 'qemu-img' command found in PATH".into(),
            ));
        }

        tracing::info!(
            file = %self.file.display(),
            format = ?self.format,
            size = self.size.bytes(),
            "creating disk image"
        );
        let format = match self.format {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        };
        let output = Command::new("qemu-img")
            .args(["create", "-f", format])
            .arg(&self.file)
            .arg(self.size.bytes().to_string())
            .output()
            .await?;
        if !output.status.success() {
            return Err(MachinedError::custom(anyhow::anyhow!(
                "qemu-img create {} failed: {}",
                self.file.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Imports or creates the backing file under `run_dir`.
    ///
    /// Disks with a size are created in place if missing. Existing images
    /// outside the run directory are reflink-copied in and the disk's `file`
    /// is rewritten to the imported copy. Cdrom media is referenced in place.
    pub async fn import(&mut self, run_dir: &Path) -> MachinedResult<()> {
        if self.size.bytes() > 0 {
            if path_exists(&self.file) {
                tracing::info!(file = %self.file.display(), "skipping creation of existing disk");
                return Ok(());
            }
            return self.create().await;
        }

        if !path_exists(&self.file) {
            return Err(MachinedError::AssetMissing(format!(
                "disk file {} does not exist",
                self.file.display()
            )));
        }

        if self.disk_type == DiskType::Cdrom {
            tracing::info!(file = %self.file.display(), "skipping import of cdrom");
            return Ok(());
        }

        let src = self.file.clone();
        let file_name = src.file_name().ok_or_else(|| {
            MachinedError::Validation(format!("disk file {} has no filename", src.display()))
        })?;
        let dest = run_dir.join(file_name);

        if src != dest {
            tracing::info!(src = %src.display(), dest = %dest.display(), "importing disk image");
            copy_file_ref_sparse(&src, &dest).await?;
            self.file = dest;
        } else {
            tracing::info!(file = %src.display(), "disk already imported");
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a byte count from a human-readable size literal.
///
/// Decimal suffixes (`KB`, `MB`, ...) are powers of 1000; binary suffixes
/// (`KiB`, `MiB`, ...) are powers of 1024. A bare `K`/`M`/`G`/`T` is binary.
pub fn parse_size(input: &str) -> MachinedResult<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(MachinedError::Validation("empty size literal".into()));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| MachinedError::Validation(format!("invalid size literal: {}", input)))?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "mb" => 1000_u64.pow(2),
        "gb" => 1000_u64.pow(3),
        "tb" => 1000_u64.pow(4),
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        other => {
            return Err(MachinedError::Validation(format!(
                "unknown size suffix '{}' in: {}",
                other, input
            )))
        }
    };

    Ok((value * multiplier as f64) as u64)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        })
    }
}

impl FromStr for DiskSize {
    type Err = MachinedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(DiskSize)
    }
}

impl Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DiskSize {
    fn from(bytes: u64) -> Self {
        DiskSize(bytes)
    }
}

impl Serialize for DiskSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for DiskSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DiskSizeVisitor;

        impl serde::de::Visitor<'_> for DiskSizeVisitor {
            type Value = DiskSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a size literal like \"50GiB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<DiskSize, E> {
                Ok(DiskSize(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<DiskSize, E> {
                if v < 0 {
                    return Err(E::custom("disk size cannot be negative"));
                }
                Ok(DiskSize(v as u64))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<DiskSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DiskSizeVisitor)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(yaml: &str) -> QemuDisk {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_size_literals() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("50GiB").unwrap(), 50 * (1 << 30));
        assert_eq!(parse_size("50GB").unwrap(), 50_000_000_000);
        assert_eq!(parse_size("1.5MiB").unwrap(), 3 * (1 << 19));
        assert!(parse_size("50 GiB").is_ok());
        assert!(parse_size("banana").is_err());
        assert!(parse_size("50XB").is_err());
    }

    #[test]
    fn test_disk_defaults() {
        let d = disk("file: root.qcow2\nsize: 50GiB");
        assert_eq!(d.format, DiskFormat::Qcow2);
        assert_eq!(d.disk_type, DiskType::Ssd);
        assert_eq!(d.attach, DiskAttach::Scsi);
        assert_eq!(d.size.bytes(), 50 * (1 << 30));
        assert!(!d.read_only);
    }

    #[test]
    fn test_disk_size_accepts_integer_bytes() {
        let d = disk("file: root.qcow2\nsize: 1048576");
        assert_eq!(d.size.bytes(), 1 << 20);
    }

    #[test]
    fn test_disk_rejects_unknown_field() {
        let r: Result<QemuDisk, _> = serde_yaml::from_str("file: a\nsparkle: yes");
        assert!(r.is_err());
    }

    #[test]
    fn test_disk_rejects_bad_enum() {
        let r: Result<QemuDisk, _> = serde_yaml::from_str("file: a\nattach: floppy");
        assert!(r.is_err());
        let r: Result<QemuDisk, _> = serde_yaml::from_str("file: a\nformat: vmdk");
        assert!(r.is_err());
    }

    #[test]
    fn test_sanitize_joins_bare_filename() {
        let mut d = disk("file: root.qcow2");
        d.sanitize(Path::new("/state/machines/vm1")).unwrap();
        assert_eq!(d.file, PathBuf::from("/state/machines/vm1/root.qcow2"));

        let mut d = disk("file: /images/root.qcow2");
        d.sanitize(Path::new("/state/machines/vm1")).unwrap();
        assert_eq!(d.file, PathBuf::from("/images/root.qcow2"));
    }

    #[test]
    fn test_sanitize_forces_cdrom_read_only() {
        let mut d = disk("file: install.iso\ntype: cdrom\nattach: ide");
        d.sanitize(Path::new("/run")).unwrap();
        assert!(d.read_only);
    }

    #[test]
    fn test_sanitize_rejects_empty_file() {
        let mut d = disk("file: ''");
        assert!(d.sanitize(Path::new("/run")).is_err());
    }

    #[test]
    fn test_serial_rule() {
        let d = disk("file: /x/root.qcow2\ntype: ssd\nattach: virtio");
        assert_eq!(d.serial(), "ssd-root");

        let d = disk("file: /x/root.qcow2\ntype: ssd\nattach: scsi");
        assert_eq!(d.serial(), "root");

        let d = disk("file: /x/data.raw\ntype: hdd\nattach: ide");
        assert_eq!(d.serial(), "data");
    }

    #[test]
    fn test_rotation_rates() {
        assert_eq!(disk("file: a\ntype: ssd\nattach: scsi").rotation_rate(), Some(1));
        assert_eq!(
            disk("file: a\ntype: hdd\nattach: scsi").rotation_rate(),
            Some(15000)
        );
        assert_eq!(
            disk("file: a\ntype: hdd\nattach: ide").rotation_rate(),
            Some(7200)
        );
        assert_eq!(disk("file: a\ntype: ssd\nattach: virtio").rotation_rate(), None);
    }

    #[tokio::test]
    async fn test_import_requires_existing_file_for_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = disk("file: /nonexistent/root.qcow2");
        let err = d.import(dir.path()).await.unwrap_err();
        assert!(matches!(err, MachinedError::AssetMissing(_)));
    }

    #[tokio::test]
    async fn test_import_copies_into_run_dir() {
        let src_dir = tempfile::tempdir().unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("root.qcow2");
        std::fs::write(&src, b"image-bits").unwrap();

        let mut d = disk(&format!("file: {}", src.display()));
        d.import(run_dir.path()).await.unwrap();

        let dest = run_dir.path().join("root.qcow2");
        assert_eq!(d.file, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"image-bits");
    }

    #[tokio::test]
    async fn test_import_leaves_cdrom_in_place() {
        let src_dir = tempfile::tempdir().unwrap();
        let run_dir = tempfile::tempdir().unwrap();
        let iso = src_dir.path().join("install.iso");
        std::fs::write(&iso, b"iso").unwrap();

        let mut d = disk(&format!("file: {}\ntype: cdrom\nattach: ide", iso.display()));
        d.import(run_dir.path()).await.unwrap();
        assert_eq!(d.file, iso);
        assert!(!run_dir.path().join("install.iso").exists());
    }
}
