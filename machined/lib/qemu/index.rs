//! Per-synthesis allocators for device ids and boot indices.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    config::{BootDevice, DiskType, NicDef, QemuDisk},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Allocates monotonically increasing ids per device class and tracks boot
/// index reservations for one synthesis run.
///
/// One instance exists per argv synthesis; it is never shared across VMs.
#[derive(Debug, Default)]
pub struct QemuTypeIndex {
    counters: HashMap<&'static str, u32>,
    boot_indices: BTreeSet<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QemuTypeIndex {
    /// Creates a fresh allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id for the given device class, starting at 0.
    pub fn next(&mut self, kind: &'static str) -> u32 {
        let counter = self.counters.entry(kind).or_insert(0);
        let value = *counter;
        *counter += 1;
        value
    }

    /// Reserves an explicitly requested boot index.
    pub fn set_boot_index(&mut self, index: u32) -> MachinedResult<()> {
        if !self.boot_indices.insert(index) {
            return Err(MachinedError::Validation(format!(
                "duplicate boot index {}",
                index
            )));
        }
        Ok(())
    }

    /// Allocates the lowest free non-negative boot index.
    pub fn next_boot_index(&mut self) -> u32 {
        let mut candidate = 0;
        while self.boot_indices.contains(&candidate) {
            candidate += 1;
        }
        self.boot_indices.insert(candidate);
        candidate
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Assigns boot indices to every disk and NIC of a machine.
///
/// Runs in two passes: explicit indices are reserved first (collisions are
/// rejected, naming both holders), then every unindexed device gets the
/// lowest free slot. When no boot preference and no explicit indices exist,
/// the first SSD is seeded with index 0 and the first HDD with index 1.
pub fn plan_boot_indices(
    disks: &mut [QemuDisk],
    nics: &mut [NicDef],
    boot: Option<BootDevice>,
    qti: &mut QemuTypeIndex,
) -> MachinedResult<()> {
    let mut claimed: BTreeMap<u32, String> = BTreeMap::new();
    let explicit = disks
        .iter()
        .filter_map(|d| {
            d.boot_index()
                .map(|i| (i, format!("disk {}", d.file().display())))
        })
        .chain(
            nics.iter()
                .filter_map(|n| n.boot_index().map(|i| (i, format!("nic {}", n.id())))),
        );
    for (index, device) in explicit {
        if let Some(holder) = claimed.get(&index) {
            return Err(MachinedError::Validation(format!(
                "duplicate boot index {}: {} collides with {}",
                index, device, holder
            )));
        }
        qti.set_boot_index(index)?;
        claimed.insert(index, device);
    }

    let no_explicit = disks.iter().all(|d| d.boot_index().is_none())
        && nics.iter().all(|n| n.boot_index().is_none());
    if boot.is_none() && no_explicit {
        if let Some(first_ssd) = disks
            .iter_mut()
            .find(|d| d.disk_type() == DiskType::Ssd)
        {
            qti.set_boot_index(0)?;
            first_ssd.boot_index = Some(0);
        }
        if let Some(first_hdd) = disks
            .iter_mut()
            .find(|d| d.disk_type() == DiskType::Hdd)
        {
            qti.set_boot_index(1)?;
            first_hdd.boot_index = Some(1);
        }
    }

    for disk in disks.iter_mut() {
        if disk.boot_index().is_none() {
            let index = qti.next_boot_index();
            tracing::debug!(file = %disk.file().display(), index, "allocated disk boot index");
            disk.boot_index = Some(index);
        }
    }
    for nic in nics.iter_mut() {
        if nic.boot_index().is_none() {
            let index = qti.next_boot_index();
            tracing::debug!(nic = nic.id(), index, "allocated nic boot index");
            nic.boot_index = Some(index);
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
