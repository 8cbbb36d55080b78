//! Deterministic synthesis of a QEMU argv from a machine definition.

use std::{
    collections::HashSet,
    net::TcpListener,
    path::{Path, PathBuf},
};

use crate::{
    config::{
        random_ifname, random_qemu_mac, BootDevice, DiskAttach, DiskFormat, DiskSize, DiskType,
        NicDef, QemuDisk, VmDef, SPICE_HOST_ADDRESS, SPICE_PORT_BASE,
    },
    qemu::{plan_boot_indices, QemuTypeIndex, UefiFirmware},
    utils::{check_socket_path, path_exists},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Directories searched for the KVM-capable emulator binary.
pub const EMULATOR_SEARCH_PATHS: [&str; 2] = ["/usr/libexec", "/usr/bin"];

/// The name of the cloud-init seed directory inside a VM's run directory.
pub const SEED_DIR_NAME: &str = "seed";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The guest architecture a machine is synthesized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// x86_64 with the q35 machine type.
    X86_64,
    /// aarch64 with the virt machine type.
    Aarch64,
}

/// The SPICE endpoint of a machine with a graphical console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiceEndpoint {
    /// Listen address.
    pub addr: String,

    /// Listen port.
    pub port: u16,

    /// Whether the port is TLS-secured.
    pub tls: bool,
}

/// Every socket a synthesized VM will expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMap {
    /// Serial console socket.
    pub console: PathBuf,

    /// Human monitor socket.
    pub monitor: PathBuf,

    /// QMP control socket.
    pub qmp: PathBuf,

    /// swtpm control socket, when the machine has a TPM.
    pub tpm: Option<PathBuf>,

    /// SPICE display endpoint, when the machine has a GUI.
    pub spice: Option<SpiceEndpoint>,
}

/// The result of argv synthesis: the emulator binary, its arguments, and the
/// sockets the VM will expose.
#[derive(Debug, Clone)]
pub struct QemuCommand {
    /// Path of the emulator binary.
    pub kvm_path: PathBuf,

    /// Arguments, excluding the binary itself.
    pub argv: Vec<String>,

    /// The VM's socket map.
    pub sockets: SocketMap,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Arch {
    /// Returns the architecture of the host this daemon runs on.
    pub fn host() -> MachinedResult<Arch> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            other => Err(MachinedError::Validation(format!(
                "unsupported host architecture: {}",
                other
            ))),
        }
    }

    fn emulator_candidates(&self) -> &'static [&'static str] {
        match self {
            Arch::X86_64 => &["qemu-kvm", "qemu-system-x86_64", "kvm"],
            Arch::Aarch64 => &["qemu-system-aarch64"],
        }
    }
}

impl SocketMap {
    /// Returns the sockets bound by QEMU itself, in readiness-wait order.
    pub fn qemu_sockets(&self) -> Vec<&Path> {
        vec![&self.console, &self.monitor, &self.qmp]
    }

    /// Checks every UNIX socket path against the kernel's length cap.
    pub fn validate(&self) -> MachinedResult<()> {
        for path in self.qemu_sockets() {
            check_socket_path(path)?;
        }
        if let Some(tpm) = &self.tpm {
            check_socket_path(tpm)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Finds the KVM-capable emulator binary for `arch`.
pub fn discover_kvm_binary(arch: Arch) -> MachinedResult<PathBuf> {
    discover_kvm_binary_in(&EMULATOR_SEARCH_PATHS.map(PathBuf::from), arch)
}

/// [`discover_kvm_binary`] with explicit search directories.
pub fn discover_kvm_binary_in(dirs: &[PathBuf], arch: Arch) -> MachinedResult<PathBuf> {
    for name in arch.emulator_candidates() {
        for dir in dirs {
            let candidate = dir.join(name);
            if path_exists(&candidate) {
                return Ok(candidate);
            }
        }
    }
    Err(MachinedError::AssetMissing(format!(
        "no QEMU/KVM binary {:?} found in {:?}",
        arch.emulator_candidates(),
        dirs
    )))
}

/// Finds a free SPICE display port starting at [`SPICE_PORT_BASE`].
fn next_free_port(base: u16) -> MachinedResult<u16> {
    for port in base..base.saturating_add(100) {
        if TcpListener::bind((SPICE_HOST_ADDRESS, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(MachinedError::Validation(format!(
        "no free display port in range {}..{}",
        base,
        base + 100
    )))
}

/// Synthesizes the QEMU invocation for one machine.
///
/// `cfg` must already be sanitized and have its disks imported; the working
/// copy is updated in place with injected cdrom media, generated MACs, and
/// allocated boot indices. The declarative definition held by the registry is
/// never passed here.
pub fn synthesize(
    name: &str,
    cfg: &mut VmDef,
    kvm_path: PathBuf,
    run_dir: &Path,
    sock_dir: &Path,
    firmware: Option<&UefiFirmware>,
    has_seed: bool,
) -> MachinedResult<QemuCommand> {
    synthesize_for(Arch::host()?, name, cfg, kvm_path, run_dir, sock_dir, firmware, has_seed)
}

/// [`synthesize`] for an explicit guest architecture.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_for(
    arch: Arch,
    name: &str,
    cfg: &mut VmDef,
    kvm_path: PathBuf,
    run_dir: &Path,
    sock_dir: &Path,
    firmware: Option<&UefiFirmware>,
    has_seed: bool,
) -> MachinedResult<QemuCommand> {
    let sockets = SocketMap {
        console: sock_dir.join("console.sock"),
        monitor: sock_dir.join("monitor.sock"),
        qmp: sock_dir.join("qmp.sock"),
        tpm: cfg.tpm.then(|| sock_dir.join("tpm0.sock")),
        spice: match (arch, cfg.gui) {
            (Arch::X86_64, true) => Some(SpiceEndpoint {
                addr: SPICE_HOST_ADDRESS.to_string(),
                port: next_free_port(SPICE_PORT_BASE)?,
                tls: false,
            }),
            _ => None,
        },
    };
    sockets.validate()?;

    let mut args: Vec<String> = Vec::new();

    push(&mut args, "-name", name.to_string());
    match arch {
        Arch::X86_64 => {
            push(&mut args, "-machine", "q35,smm=on,accel=kvm".into());
            push(&mut args, "-cpu", "qemu64,+x2apic".into());
        }
        Arch::Aarch64 => {
            push(&mut args, "-machine", "virt,accel=kvm".into());
            push(&mut args, "-cpu", "host".into());
        }
    }
    push(&mut args, "-smp", cfg.cpus.to_string());
    push(&mut args, "-m", format!("{}m", cfg.memory));

    // Serial console, monitor and QMP are always exposed over UNIX sockets.
    push(
        &mut args,
        "-chardev",
        format!(
            "socket,id=serial0,path={},server=on,wait=off",
            sockets.console.display()
        ),
    );
    match arch {
        Arch::X86_64 => push(&mut args, "-serial", "chardev:serial0".into()),
        Arch::Aarch64 => push(&mut args, "-device", "pci-serial,chardev=serial0".into()),
    }
    push(
        &mut args,
        "-chardev",
        format!(
            "socket,id=monitor0,path={},server=on,wait=off",
            sockets.monitor.display()
        ),
    );
    push(&mut args, "-monitor", "chardev:monitor0".into());
    push(
        &mut args,
        "-qmp",
        format!("unix:{},server=on,wait=off", sockets.qmp.display()),
    );

    if arch == Arch::X86_64 {
        push(&mut args, "-object", "rng-random,id=rng0,filename=/dev/urandom".into());
        push(&mut args, "-device", "virtio-rng-pci,rng=rng0,bus=pcie.0".into());
        push(
            &mut args,
            "-device",
            "pcie-root-port,id=root-port.0x4.0,bus=pcie.0,chassis=0x0,slot=0x00,port=0x0,addr=0x5,multifunction=on"
                .into(),
        );
        push(
            &mut args,
            "-device",
            "pcie-root-port,id=root-port.0x4.1,bus=pcie.0,chassis=0x1,slot=0x00,port=0x1,addr=0x5.0x1"
                .into(),
        );
        args.push("-no-hpet".to_string());
        push(&mut args, "-global", "ICH9-LPC.disable_s3=1".into());
        push(&mut args, "-global", "driver=cfi.pflash01,property=secure,value=on".into());
    }

    if let Some(fw) = firmware {
        push(
            &mut args,
            "-drive",
            format!("if=pflash,format=raw,readonly=on,file={}", fw.code.display()),
        );
        push(&mut args, "-drive", format!("if=pflash,format=raw,file={}", fw.vars.display()));
    }

    match &sockets.spice {
        Some(spice) => {
            push(&mut args, "-vga", "qxl".into());
            push(
                &mut args,
                "-spice",
                format!(
                    "port={},addr={},disable-ticketing=on",
                    spice.port, spice.addr
                ),
            );
        }
        None => push(&mut args, "-display", "none".into()),
    }

    if let Some(tpm_sock) = &sockets.tpm {
        push(
            &mut args,
            "-chardev",
            format!("socket,id=chrtpm0,path={}", tpm_sock.display()),
        );
        push(&mut args, "-tpmdev", "emulator,id=tpm0,chardev=chrtpm0".into());
        let tpm_device = match arch {
            Arch::X86_64 => "tpm-tis,tpmdev=tpm0",
            Arch::Aarch64 => "tpm-tis-device,tpmdev=tpm0",
        };
        push(&mut args, "-device", tpm_device.into());
    }

    // Inject the cdrom as an IDE disk; boot=cdrom reserves boot index 0 for
    // it before planning runs.
    if let Some(cdrom) = cfg.cdrom.clone() {
        cfg.disks.push(QemuDisk {
            file: cdrom,
            format: DiskFormat::Raw,
            size: DiskSize::default(),
            disk_type: DiskType::Cdrom,
            attach: DiskAttach::Ide,
            block_size: None,
            bus_addr: None,
            boot_index: (cfg.boot == Some(BootDevice::Cdrom)).then_some(0),
            read_only: true,
        });
    }

    let mut qti = QemuTypeIndex::new();
    {
        let VmDef {
            disks, nics, boot, ..
        } = cfg;
        plan_boot_indices(disks, nics, *boot, &mut qti)?;
    }

    let mut seen_buses: HashSet<DiskAttach> = HashSet::new();
    for disk in &cfg.disks {
        emit_controller(&mut args, disk.attach(), &mut seen_buses, &mut qti);
        emit_disk(&mut args, disk, &mut qti);
    }

    if has_seed {
        args.push("-blockdev".to_string());
        args.push(format!(
            "driver=vvfat,node-name=cidata0,dir={},label=cidata",
            run_dir.join(SEED_DIR_NAME).display()
        ));
        args.push("-device".to_string());
        args.push("virtio-blk-pci,drive=cidata0".to_string());
    }

    for nic in &mut cfg.nics {
        emit_nic(&mut args, nic, &mut qti);
    }

    Ok(QemuCommand {
        kvm_path,
        argv: args,
        sockets,
    })
}

/// Appends a flag/value argument pair.
fn push(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

/// Emits the controller device for a disk bus, once per attach kind.
fn emit_controller(
    args: &mut Vec<String>,
    attach: DiskAttach,
    seen: &mut HashSet<DiskAttach>,
    qti: &mut QemuTypeIndex,
) {
    if !seen.insert(attach) {
        return;
    }
    match attach {
        DiskAttach::Scsi => {
            let iothread = qti.next("iothread");
            let scsi = qti.next("scsi");
            args.push("-object".to_string());
            args.push(format!("iothread,id=iothread{}", iothread));
            args.push("-device".to_string());
            args.push(format!(
                "virtio-scsi-pci,id=scsi{},iothread=iothread{}",
                scsi, iothread
            ));
        }
        DiskAttach::Ide => {
            args.push("-device".to_string());
            args.push(format!("ich9-ahci,id=ide{}", qti.next("ide")));
        }
        DiskAttach::Usb => {
            args.push("-device".to_string());
            args.push(format!("qemu-xhci,id=usb{}", qti.next("usb")));
        }
        DiskAttach::Virtio | DiskAttach::Nvme => {}
    }
}

/// Emits the `-drive`/`-device` pair for one disk.
fn emit_disk(args: &mut Vec<String>, disk: &QemuDisk, qti: &mut QemuTypeIndex) {
    let drive_id = format!("drive{}", qti.next("drive"));
    let is_cdrom = disk.disk_type() == DiskType::Cdrom;

    let mut drive = format!(
        "file={},if=none,id={},format={},aio=threads,cache=unsafe,discard=unmap,detect-zeroes=unmap",
        disk.file().display(),
        drive_id,
        disk.format
    );
    if is_cdrom {
        drive.push_str(",media=cdrom");
    }
    if disk.read_only {
        drive.push_str(",readonly=on");
    }
    args.push("-drive".to_string());
    args.push(drive);

    let serial = disk.serial();
    let mut device = match disk.attach() {
        DiskAttach::Virtio => format!(
            "virtio-blk-pci,drive={},serial={},bus=pcie.0",
            drive_id, serial
        ),
        DiskAttach::Scsi => {
            let driver = if is_cdrom { "scsi-cd" } else { "scsi-hd" };
            format!("{},drive={},bus=scsi0.0,serial={}", driver, drive_id, serial)
        }
        DiskAttach::Ide => {
            let driver = if is_cdrom { "ide-cd" } else { "ide-hd" };
            format!("{},drive={},bus=ide.0,serial={}", driver, drive_id, serial)
        }
        DiskAttach::Nvme => format!("nvme,drive={},serial={}", drive_id, serial),
        DiskAttach::Usb => format!("usb-storage,drive={}", drive_id),
    };

    if !is_cdrom {
        if let Some(rate) = disk.rotation_rate() {
            device.push_str(&format!(",rotation_rate={}", rate));
        }
    }
    if let Some(block_size) = disk.block_size {
        if disk.attach() != DiskAttach::Usb {
            device.push_str(&format!(
                ",logical_block_size={},physical_block_size={}",
                block_size, block_size
            ));
        }
    }
    if let Some(addr) = &disk.bus_addr {
        if matches!(disk.attach(), DiskAttach::Virtio | DiskAttach::Nvme) {
            device.push_str(&format!(",addr={}", addr));
        }
    }
    if let Some(index) = disk.boot_index() {
        device.push_str(&format!(",bootindex={}", index));
    }

    args.push("-device".to_string());
    args.push(device);
}

/// Emits the `-netdev`/`-device` pair for one NIC, generating a MAC when the
/// declaration has none.
fn emit_nic(args: &mut Vec<String>, nic: &mut NicDef, qti: &mut QemuTypeIndex) {
    let net_id = format!("net{}", qti.next("net"));

    let netdev = if nic.is_user_network() {
        let mut value = format!("user,id={}", net_id);
        for rule in &nic.ports {
            value.push_str(&format!(",hostfwd={}", rule));
        }
        value
    } else {
        format!(
            "tap,id={},ifname={},script=no,downscript=no",
            net_id,
            random_ifname()
        )
    };
    args.push("-netdev".to_string());
    args.push(netdev);

    let mac = nic.mac.clone().unwrap_or_else(random_qemu_mac);
    nic.mac = Some(mac.clone());

    let mut device = format!("{},netdev={},mac={},bus=pcie.0", nic.device, net_id, mac);
    if let Some(addr) = &nic.bus_addr {
        device.push_str(&format!(",addr={}", addr));
    }
    if let Some(index) = nic.boot_index() {
        device.push_str(&format!(",bootindex={}", index));
    }
    if let Some(rom) = &nic.rom_file {
        device.push_str(&format!(",romfile={}", rom.display()));
    }
    args.push("-device".to_string());
    args.push(device);
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_def(yaml: &str) -> VmDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn synth(cfg: &mut VmDef) -> QemuCommand {
        synthesize_for(
            Arch::X86_64,
            "vm1",
            cfg,
            PathBuf::from("/usr/bin/qemu-kvm"),
            Path::new("/state/machine/machines/vm1"),
            Path::new("/tmp/msockets-abc123"),
            None,
            false,
        )
        .unwrap()
    }

    fn value_of<'a>(cmd: &'a QemuCommand, flag: &str) -> Vec<&'a str> {
        cmd.argv
            .windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_base_machine_args() {
        let mut cfg = vm_def("cpus: 2\nmemory: 2048");
        let cmd = synth(&mut cfg);

        assert_eq!(value_of(&cmd, "-machine"), vec!["q35,smm=on,accel=kvm"]);
        assert_eq!(value_of(&cmd, "-cpu"), vec!["qemu64,+x2apic"]);
        assert_eq!(value_of(&cmd, "-smp"), vec!["2"]);
        assert_eq!(value_of(&cmd, "-m"), vec!["2048m"]);
        assert!(cmd.argv.contains(&"-no-hpet".to_string()));
        assert_eq!(
            value_of(&cmd, "-qmp"),
            vec!["unix:/tmp/msockets-abc123/qmp.sock,server=on,wait=off"]
        );
        // No GUI: headless display.
        assert_eq!(value_of(&cmd, "-display"), vec!["none"]);
    }

    #[test]
    fn test_sockets_live_under_sock_dir() {
        let mut cfg = vm_def("tpm: true");
        let cmd = synth(&mut cfg);

        for sock in cmd.sockets.qemu_sockets() {
            assert!(sock.starts_with("/tmp/msockets-abc123"));
            assert!(sock.as_os_str().len() + 1 <= crate::utils::LINUX_UNIX_SOCKET_MAX_LEN);
        }
        let tpm = cmd.sockets.tpm.as_ref().unwrap();
        assert_eq!(tpm, &PathBuf::from("/tmp/msockets-abc123/tpm0.sock"));
        assert!(cmd
            .argv
            .iter()
            .any(|a| a.contains("socket,id=chrtpm0,path=/tmp/msockets-abc123/tpm0.sock")));
        assert!(cmd.argv.iter().any(|a| a == "tpm-tis,tpmdev=tpm0"));
    }

    #[test]
    fn test_socket_dir_too_long_is_rejected() {
        let mut cfg = vm_def("{}");
        let long_dir = format!("/tmp/{}", "s".repeat(120));
        let result = synthesize_for(
            Arch::X86_64,
            "vm1",
            &mut cfg,
            PathBuf::from("/usr/bin/qemu-kvm"),
            Path::new("/run"),
            Path::new(&long_dir),
            None,
            false,
        );
        assert!(matches!(result, Err(MachinedError::PathTooLong { .. })));
    }

    #[test]
    fn test_disk_controllers_emitted_once() {
        let mut cfg = vm_def(
            r#"
disks:
  - {file: /i/a.qcow2, attach: scsi}
  - {file: /i/b.qcow2, attach: scsi}
  - {file: /i/c.qcow2, attach: virtio}
"#,
        );
        let cmd = synth(&mut cfg);

        let scsi_controllers: Vec<_> = cmd
            .argv
            .iter()
            .filter(|a| a.starts_with("virtio-scsi-pci"))
            .collect();
        assert_eq!(scsi_controllers.len(), 1);
        assert_eq!(scsi_controllers[0], "virtio-scsi-pci,id=scsi0,iothread=iothread0");
        assert!(cmd.argv.contains(&"iothread,id=iothread0".to_string()));
    }

    #[test]
    fn test_disk_drive_and_device_lines() {
        let mut cfg = vm_def(
            "disks:\n  - {file: /i/root.qcow2, type: ssd, attach: virtio, bootindex: 0}\n",
        );
        let cmd = synth(&mut cfg);

        let drives = value_of(&cmd, "-drive");
        assert_eq!(
            drives[0],
            "file=/i/root.qcow2,if=none,id=drive0,format=qcow2,aio=threads,cache=unsafe,discard=unmap,detect-zeroes=unmap"
        );
        let devices = value_of(&cmd, "-device");
        assert!(devices
            .iter()
            .any(|d| *d == "virtio-blk-pci,drive=drive0,serial=ssd-root,bus=pcie.0,bootindex=0"));
    }

    #[test]
    fn test_scsi_hdd_rotation_rate() {
        let mut cfg = vm_def("disks:\n  - {file: /i/slow.raw, format: raw, type: hdd, attach: scsi}\n");
        let cmd = synth(&mut cfg);
        assert!(cmd
            .argv
            .iter()
            .any(|d| d.starts_with("scsi-hd,") && d.contains("rotation_rate=15000")));
    }

    #[test]
    fn test_cdrom_injection_with_boot_cdrom() {
        let mut cfg = vm_def(
            "cdrom: /media/install.iso\nboot: cdrom\ndisks:\n  - {file: /i/root.qcow2, attach: virtio}\n",
        );
        let cmd = synth(&mut cfg);

        let cd_device = cmd
            .argv
            .iter()
            .find(|d| d.starts_with("ide-cd,"))
            .expect("injected cdrom device");
        assert!(cd_device.contains("bootindex=0"));
        assert!(cmd.argv.iter().any(|d| d.starts_with("ich9-ahci,")));
        assert!(cmd
            .argv
            .iter()
            .any(|d| d.contains("file=/media/install.iso") && d.contains("media=cdrom") && d.contains("readonly=on")));
        // The pre-existing disk got pushed past the cdrom.
        assert!(cmd
            .argv
            .iter()
            .any(|d| d.starts_with("virtio-blk-pci,") && d.contains("bootindex=1")));
    }

    #[test]
    fn test_boot_indices_pairwise_distinct() {
        let mut cfg = vm_def(
            r#"
cdrom: /media/install.iso
disks:
  - {file: /i/a.qcow2, type: ssd}
  - {file: /i/b.qcow2, type: hdd}
nics:
  - {id: nic0}
  - {id: nic1, bootindex: 7}
"#,
        );
        let cmd = synth(&mut cfg);

        let mut indices: Vec<u32> = cmd
            .argv
            .iter()
            .filter_map(|a| {
                a.split(',')
                    .find_map(|kv| kv.strip_prefix("bootindex="))
                    .map(|v| v.parse().unwrap())
            })
            .collect();
        assert_eq!(indices.len(), 5);
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 5, "boot indices must be pairwise distinct");
    }

    #[test]
    fn test_nic_user_hostfwd() {
        let mut cfg = vm_def(
            r#"
nics:
  - id: nic0
    mac: "52:54:00:11:22:33"
    ports:
      - "tcp:127.0.0.1:2222": ":22"
      - 8080: 80
"#,
        );
        let cmd = synth(&mut cfg);

        let netdevs = value_of(&cmd, "-netdev");
        assert_eq!(
            netdevs[0],
            "user,id=net0,hostfwd=tcp:127.0.0.1:2222-:22,hostfwd=tcp::8080-:80"
        );
        assert!(cmd
            .argv
            .iter()
            .any(|d| d.starts_with("virtio-net,") && d.contains("mac=52:54:00:11:22:33")));
    }

    #[test]
    fn test_nic_generated_mac_is_recorded() {
        let mut cfg = vm_def("nics:\n  - {id: nic0}\n");
        let cmd = synth(&mut cfg);

        let mac = cfg.nics[0].mac.clone().expect("generated mac recorded");
        assert!(mac.starts_with("52:54:00:"));
        assert!(cmd.argv.iter().any(|d| d.contains(&format!("mac={}", mac))));
    }

    #[test]
    fn test_nic_tap_network() {
        let mut cfg = vm_def("nics:\n  - {id: nic0, network: bridge0}\n");
        let cmd = synth(&mut cfg);

        let netdevs = value_of(&cmd, "-netdev");
        assert!(netdevs[0].starts_with("tap,id=net0,ifname=anic"));
        assert!(netdevs[0].ends_with(",script=no,downscript=no"));
        let ifname = netdevs[0]
            .split(',')
            .find_map(|kv| kv.strip_prefix("ifname="))
            .unwrap();
        assert_eq!(ifname.len(), 15);
    }

    #[test]
    fn test_uefi_pflash_drives() {
        let mut cfg = vm_def("{}");
        let fw = UefiFirmware {
            code: PathBuf::from("/run/vm1/uefi-code.fd"),
            vars: PathBuf::from("/run/vm1/uefi-vars.fd"),
        };
        let cmd = synthesize_for(
            Arch::X86_64,
            "vm1",
            &mut cfg,
            PathBuf::from("/usr/bin/qemu-kvm"),
            Path::new("/run/vm1"),
            Path::new("/tmp/msockets-x"),
            Some(&fw),
            false,
        )
        .unwrap();

        let drives = value_of(&cmd, "-drive");
        assert!(drives
            .iter()
            .any(|d| *d == "if=pflash,format=raw,readonly=on,file=/run/vm1/uefi-code.fd"));
        assert!(drives
            .iter()
            .any(|d| *d == "if=pflash,format=raw,file=/run/vm1/uefi-vars.fd"));
    }

    #[test]
    fn test_gui_enables_spice() {
        let mut cfg = vm_def("gui: true");
        let cmd = synth(&mut cfg);

        let spice = cmd.sockets.spice.as_ref().expect("spice endpoint");
        assert_eq!(spice.addr, "127.0.0.1");
        assert!(spice.port >= SPICE_PORT_BASE);
        assert!(!spice.tls);
        assert_eq!(value_of(&cmd, "-vga"), vec!["qxl"]);
        assert!(value_of(&cmd, "-spice")[0].contains("disable-ticketing=on"));
    }

    #[test]
    fn test_cloud_init_seed_blockdev() {
        let mut cfg = vm_def("{}");
        let cmd = synthesize_for(
            Arch::X86_64,
            "vm1",
            &mut cfg,
            PathBuf::from("/usr/bin/qemu-kvm"),
            Path::new("/run/vm1"),
            Path::new("/tmp/msockets-x"),
            None,
            true,
        )
        .unwrap();

        assert!(cmd
            .argv
            .iter()
            .any(|a| a == "driver=vvfat,node-name=cidata0,dir=/run/vm1/seed,label=cidata"));
        assert!(cmd.argv.contains(&"virtio-blk-pci,drive=cidata0".to_string()));
    }

    #[test]
    fn test_aarch64_base_args() {
        let mut cfg = vm_def("{}");
        let cmd = synthesize_for(
            Arch::Aarch64,
            "vm1",
            &mut cfg,
            PathBuf::from("/usr/bin/qemu-system-aarch64"),
            Path::new("/run/vm1"),
            Path::new("/tmp/msockets-x"),
            None,
            false,
        )
        .unwrap();

        assert_eq!(value_of(&cmd, "-machine"), vec!["virt,accel=kvm"]);
        assert_eq!(value_of(&cmd, "-cpu"), vec!["host"]);
        assert!(cmd
            .argv
            .iter()
            .any(|d| d == "pci-serial,chardev=serial0"));
        assert!(!cmd.argv.contains(&"-no-hpet".to_string()));
    }

    #[test]
    fn test_discover_kvm_binary_in() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qemu-system-x86_64"), b"").unwrap();

        let found =
            discover_kvm_binary_in(&[dir.path().to_path_buf()], Arch::X86_64).unwrap();
        assert_eq!(found, dir.path().join("qemu-system-x86_64"));

        let err = discover_kvm_binary_in(&[PathBuf::from("/nonexistent")], Arch::X86_64);
        assert!(matches!(err, Err(MachinedError::AssetMissing(_))));
    }
}
