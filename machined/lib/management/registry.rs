//! The machine registry: the set of defined machines and their lifecycle
//! operations.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::{MachineDef, MachineStatus},
    runtime::{Vm, VmState},
    utils::{ensure_dir, path_exists, DaemonPaths, MACHINE_CONFIG_FILENAME},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Global deadline for fleet shutdown; stragglers are force-stopped.
pub const FLEET_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of console a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleKind {
    /// The serial console UNIX socket.
    #[serde(rename = "console")]
    Serial,
    /// The SPICE graphical display.
    #[serde(rename = "vga")]
    Vga,
}

/// A handle to a machine's console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// The requested console kind.
    #[serde(rename = "type")]
    pub kind: ConsoleKind,

    /// Serial socket path, for serial consoles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Display host address, for SPICE consoles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Display port, for SPICE consoles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Whether the display port is TLS-secured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

/// One defined machine: its declarative definition plus runtime state.
///
/// The definition is guarded separately from the instance so status queries
/// never wait on a lifecycle operation; the instance lock serializes
/// start/stop/delete per machine.
#[derive(Debug)]
pub struct Machine {
    def: RwLock<MachineDef>,
    status: RwLock<MachineStatus>,
    vm: Mutex<Option<Vm>>,
}

/// The set of defined machines, keyed by unique name.
///
/// Mutations of the set are serialized through the outer write lock; machine
/// lifecycle operations run outside it so one machine's start never blocks
/// another's status query.
#[derive(Debug)]
pub struct MachineRegistry {
    paths: DaemonPaths,
    machines: RwLock<Vec<Arc<Machine>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods: Machine
//--------------------------------------------------------------------------------------------------

impl Machine {
    fn new(def: MachineDef, status: MachineStatus) -> Arc<Machine> {
        Arc::new(Machine {
            def: RwLock::new(def),
            status: RwLock::new(status),
            vm: Mutex::new(None),
        })
    }

    async fn name(&self) -> String {
        self.def.read().await.get_name().clone()
    }

    /// Returns the current status, refreshed from the instance when one
    /// exists and no lifecycle operation is in flight.
    pub async fn status(&self) -> MachineStatus {
        let current = *self.status.read().await;
        if matches!(current, MachineStatus::Starting | MachineStatus::Stopping) {
            return current;
        }

        // A held instance lock means an operation is mutating the VM; report
        // the last settled status rather than waiting on it.
        let derived = match self.vm.try_lock() {
            Ok(guard) => match guard.as_ref() {
                None => MachineStatus::Stopped,
                Some(vm) => match vm.state() {
                    VmState::Init => MachineStatus::Initialized,
                    VmState::Started => MachineStatus::Running,
                    VmState::Stopped | VmState::Cleaned => MachineStatus::Stopped,
                    VmState::Failed => MachineStatus::Failed,
                },
            },
            Err(_) => return current,
        };

        if derived != current {
            *self.status.write().await = derived;
        }
        derived
    }

    /// Returns the definition with the refreshed status filled in.
    pub async fn snapshot(&self) -> MachineDef {
        let status = self.status().await;
        self.def.read().await.with_status(status)
    }

    async fn set_status(&self, status: MachineStatus) {
        *self.status.write().await = status;
    }

    async fn start(&self, paths: &DaemonPaths) -> MachinedResult<()> {
        let mut vm_guard = self.vm.lock().await;

        if vm_guard.as_ref().is_some_and(Vm::is_running) {
            return Err(MachinedError::Busy(format!(
                "machine '{}' is already running",
                self.name().await
            )));
        }

        let def = self.def.read().await.clone();
        self.set_status(MachineStatus::Starting).await;

        let run_dir = paths.machine_run_dir(def.get_name());
        let mut vm = match Vm::prepare(def.get_name(), def.get_config(), run_dir).await {
            Ok(vm) => vm,
            Err(e) => {
                // Preparation failures leave the machine stopped with its
                // declarative config intact.
                self.set_status(MachineStatus::Stopped).await;
                return Err(e);
            }
        };

        match vm.start().await {
            Ok(()) => {
                *vm_guard = Some(vm);
                self.set_status(MachineStatus::Running).await;
                Ok(())
            }
            Err(e) => {
                *vm_guard = Some(vm);
                self.set_status(MachineStatus::Failed).await;
                Err(e)
            }
        }
    }

    async fn stop(&self, force: bool) -> MachinedResult<()> {
        let mut vm_guard = self.vm.lock().await;

        let running = vm_guard.as_ref().is_some_and(Vm::is_running);
        if !running {
            return Err(MachinedError::Busy(format!(
                "machine '{}' is not running",
                self.name().await
            )));
        }

        self.set_status(MachineStatus::Stopping).await;
        let result = vm_guard
            .as_mut()
            .expect("instance checked above")
            .stop(force)
            .await;
        match &result {
            Ok(()) => self.set_status(MachineStatus::Stopped).await,
            Err(_) => self.set_status(MachineStatus::Failed).await,
        }
        result
    }

    /// Tears down the instance (if any) and removes the machine's on-disk
    /// run state.
    async fn delete_instance(&self, force: bool, paths: &DaemonPaths) -> MachinedResult<()> {
        let mut vm_guard = self.vm.lock().await;

        if let Some(vm) = vm_guard.as_mut() {
            if vm.is_running() && !force {
                return Err(MachinedError::Busy(format!(
                    "machine '{}' is running, use force to delete",
                    self.name().await
                )));
            }
            vm.delete().await?;
            *vm_guard = None;
        }

        let name = self.name().await;
        for dir in [
            paths.machine_config_dir(&name),
            paths.machine_data_dir(&name),
            paths.machine_run_dir(&name),
        ] {
            if path_exists(&dir) {
                tracing::info!(machine = %name, dir = %dir.display(), "removing machine dir");
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(())
    }

    /// Persists the definition as `machine.yaml`, atomically.
    async fn persist(&self, paths: &DaemonPaths) -> MachinedResult<()> {
        let def = self.def.read().await;
        if *def.get_ephemeral() {
            return Ok(());
        }

        let config_dir = paths.machine_config_dir(def.get_name());
        ensure_dir(&config_dir).await?;

        let contents = serde_yaml::to_string(&def.without_status())?;
        let temp = tempfile::NamedTempFile::new_in(&config_dir)?;
        tokio::fs::write(temp.path(), contents.as_bytes()).await?;
        temp.persist(config_dir.join(MACHINE_CONFIG_FILENAME))
            .map_err(|e| MachinedError::Io(e.error))?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: MachineRegistry
//--------------------------------------------------------------------------------------------------

impl MachineRegistry {
    /// Creates an empty registry.
    pub fn new(paths: DaemonPaths) -> Self {
        Self {
            paths,
            machines: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry and rehydrates persisted machines from disk.
    ///
    /// Instances do not survive the daemon, so every rehydrated machine
    /// starts out stopped. Unparseable definitions are logged and skipped.
    pub async fn load(paths: DaemonPaths) -> MachinedResult<Self> {
        let registry = Self::new(paths);

        let machines_dir = registry.paths.machines_config_dir();
        if !path_exists(&machines_dir) {
            return Ok(registry);
        }

        let mut entries = tokio::fs::read_dir(&machines_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let config_file = entry.path().join(MACHINE_CONFIG_FILENAME);
            if !path_exists(&config_file) {
                continue;
            }
            let contents = match tokio::fs::read_to_string(&config_file).await {
                Ok(contents) => contents,
                Err(e) => {
                    tracing::warn!(file = %config_file.display(), error = %e, "skipping unreadable machine config");
                    continue;
                }
            };
            let def: MachineDef = match serde_yaml::from_str(&contents) {
                Ok(def) => def,
                Err(e) => {
                    tracing::warn!(file = %config_file.display(), error = %e, "skipping unparseable machine config");
                    continue;
                }
            };
            tracing::info!(machine = %def.get_name(), "loaded saved machine config");
            registry
                .machines
                .write()
                .await
                .push(Machine::new(def.without_status(), MachineStatus::Stopped));
        }

        Ok(registry)
    }

    /// Defines a new machine.
    ///
    /// The definition is validated, its file paths resolved, and, unless the
    /// machine is ephemeral, persisted before it becomes visible.
    pub async fn add_machine(&self, mut def: MachineDef) -> MachinedResult<()> {
        def.validate()?;
        let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
        let cwd = std::env::current_dir()?;
        def.check_machine_file_paths(home.as_deref(), &cwd)?;

        let mut machines = self.machines.write().await;
        for existing in machines.iter() {
            if existing.name().await == *def.get_name() {
                return Err(MachinedError::AlreadyExists(def.get_name().clone()));
            }
        }

        let machine = Machine::new(def.without_status(), MachineStatus::Stopped);
        machine.persist(&self.paths).await?;
        machines.push(machine);
        Ok(())
    }

    /// Returns snapshots of all machines, statuses refreshed.
    pub async fn machines(&self) -> Vec<MachineDef> {
        let machines = self.machines.read().await.clone();
        let mut snapshots = Vec::with_capacity(machines.len());
        for machine in machines {
            snapshots.push(machine.snapshot().await);
        }
        snapshots
    }

    /// Returns a snapshot of one machine.
    pub async fn machine(&self, name: &str) -> MachinedResult<MachineDef> {
        Ok(self.find(name).await?.snapshot().await)
    }

    /// Replaces a machine's definition.
    ///
    /// Updates are rejected while the machine is starting, running, or
    /// stopping; the semantics of editing a live instance are undefined.
    pub async fn update_machine(&self, name: &str, mut def: MachineDef) -> MachinedResult<()> {
        if def.get_name() != name {
            return Err(MachinedError::Validation(format!(
                "machine name '{}' does not match '{}'",
                def.get_name(),
                name
            )));
        }
        def.validate()?;
        let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
        let cwd = std::env::current_dir()?;
        def.check_machine_file_paths(home.as_deref(), &cwd)?;

        let machine = self.find(name).await?;
        let status = machine.status().await;
        if matches!(
            status,
            MachineStatus::Running | MachineStatus::Starting | MachineStatus::Stopping
        ) {
            return Err(MachinedError::Busy(format!(
                "machine '{}' is {}, stop it before updating",
                name, status
            )));
        }

        let ephemeral = *def.get_ephemeral();
        *machine.def.write().await = def.without_status();

        if ephemeral {
            // A definition turned ephemeral must not linger on disk.
            let config_file = self.paths.machine_config_file(name);
            if path_exists(&config_file) {
                tokio::fs::remove_file(&config_file).await?;
            }
        } else {
            machine.persist(&self.paths).await?;
        }
        tracing::info!(machine = name, "updated machine");
        Ok(())
    }

    /// Removes a machine, stopping it first when `force` is given.
    pub async fn delete_machine(&self, name: &str, force: bool) -> MachinedResult<()> {
        let machine = self.find(name).await?;
        machine.delete_instance(force, &self.paths).await?;

        let mut machines = self.machines.write().await;
        let mut index = None;
        for (i, existing) in machines.iter().enumerate() {
            if existing.name().await == name {
                index = Some(i);
                break;
            }
        }
        if let Some(i) = index {
            machines.remove(i);
        }
        tracing::info!(machine = name, "deleted machine");
        Ok(())
    }

    /// Starts a machine.
    pub async fn start_machine(&self, name: &str) -> MachinedResult<()> {
        self.find(name).await?.start(&self.paths).await
    }

    /// Stops a machine.
    pub async fn stop_machine(&self, name: &str, force: bool) -> MachinedResult<()> {
        self.find(name).await?.stop(force).await
    }

    /// Fleet shutdown: gracefully stops every running machine concurrently,
    /// force-stopping any that miss [`FLEET_SHUTDOWN_TIMEOUT`].
    pub async fn stop_machines(&self) {
        let machines = self.machines.read().await.clone();

        let stops = machines.into_iter().map(|machine| async move {
            if machine.status().await != MachineStatus::Running {
                return;
            }
            let name = machine.name().await;
            let graceful = tokio::time::timeout(FLEET_SHUTDOWN_TIMEOUT, machine.stop(false)).await;
            match graceful {
                Ok(Ok(())) => {
                    tracing::info!(machine = %name, "machine stopped");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(machine = %name, error = %e, "graceful stop failed, forcing");
                }
                Err(_) => {
                    tracing::warn!(machine = %name, "graceful stop timed out, forcing");
                }
            }
            if machine.status().await == MachineStatus::Running {
                if let Err(e) = machine.stop(true).await {
                    tracing::error!(machine = %name, error = %e, "forced stop failed");
                }
            }
        });
        join_all(stops).await;
    }

    /// Returns console connection details for a machine.
    pub async fn machine_console(
        &self,
        name: &str,
        kind: ConsoleKind,
    ) -> MachinedResult<ConsoleInfo> {
        let machine = self.find(name).await?;
        let vm_guard = machine.vm.lock().await;
        let vm = vm_guard.as_ref().ok_or_else(|| {
            MachinedError::Busy(format!("machine '{}' has no running instance", name))
        })?;

        match kind {
            ConsoleKind::Serial => Ok(ConsoleInfo {
                kind,
                path: Some(vm.serial_console_path().display().to_string()),
                addr: None,
                port: None,
                secure: None,
            }),
            ConsoleKind::Vga => {
                let spice = vm.spice_endpoint().ok_or_else(|| {
                    MachinedError::Validation(format!(
                        "machine '{}' has no graphical console (gui disabled)",
                        name
                    ))
                })?;
                Ok(ConsoleInfo {
                    kind,
                    path: None,
                    addr: Some(spice.addr),
                    port: Some(spice.port),
                    secure: Some(spice.tls),
                })
            }
        }
    }

    /// Looks up a machine by name.
    async fn find(&self, name: &str) -> MachinedResult<Arc<Machine>> {
        let machines = self.machines.read().await;
        for machine in machines.iter() {
            if machine.name().await == name {
                return Ok(machine.clone());
            }
        }
        Err(MachinedError::NotFound(name.to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(root: &std::path::Path) -> DaemonPaths {
        let root = root.to_string_lossy().to_string();
        DaemonPaths::resolve_with(move |name| match name {
            "XDG_CONFIG_HOME" => Some(format!("{}/config", root)),
            "XDG_DATA_HOME" => Some(format!("{}/data", root)),
            "XDG_STATE_HOME" => Some(format!("{}/state", root)),
            "XDG_RUNTIME_DIR" => Some("/tmp/machined-test-rt".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn sample_def(name: &str, ephemeral: bool) -> MachineDef {
        serde_yaml::from_str(&format!(
            "name: {}\nephemeral: {}\nconfig:\n  cpus: 2\n  memory: 2048\n",
            name, ephemeral
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_get_machine() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MachineRegistry::new(test_paths(dir.path()));

        registry.add_machine(sample_def("vm1", true)).await.unwrap();

        let snapshot = registry.machine("vm1").await.unwrap();
        assert_eq!(snapshot.get_name(), "vm1");
        assert_eq!(snapshot.get_status(), &Some(MachineStatus::Stopped));

        let err = registry.machine("ghost").await.unwrap_err();
        assert!(matches!(err, MachinedError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MachineRegistry::new(test_paths(dir.path()));

        registry.add_machine(sample_def("vm1", true)).await.unwrap();
        let err = registry
            .add_machine(sample_def("vm1", true))
            .await
            .unwrap_err();
        assert!(matches!(err, MachinedError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_persistence_and_rehydration() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        let registry = MachineRegistry::new(paths.clone());
        registry
            .add_machine(sample_def("durable", false))
            .await
            .unwrap();
        registry
            .add_machine(sample_def("fleeting", true))
            .await
            .unwrap();

        // Persisted iff not ephemeral, and the file parses back to the
        // definition that was added.
        let config_file = paths.machine_config_file("durable");
        assert!(config_file.exists());
        let on_disk: MachineDef =
            serde_yaml::from_str(&std::fs::read_to_string(&config_file).unwrap()).unwrap();
        assert_eq!(on_disk, sample_def("durable", false));
        assert!(!paths.machine_config_file("fleeting").exists());

        // A fresh registry (daemon restart) sees only the durable machine,
        // stopped.
        let reloaded = MachineRegistry::load(paths).await.unwrap();
        let machines = reloaded.machines().await;
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].get_name(), "durable");
        assert_eq!(machines[0].get_status(), &Some(MachineStatus::Stopped));
    }

    #[tokio::test]
    async fn test_rehydration_skips_unparseable_configs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        let registry = MachineRegistry::new(paths.clone());
        registry.add_machine(sample_def("good", false)).await.unwrap();

        let bad_dir = paths.machine_config_dir("bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(MACHINE_CONFIG_FILENAME), "{not yaml").unwrap();

        let reloaded = MachineRegistry::load(paths).await.unwrap();
        let machines = reloaded.machines().await;
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].get_name(), "good");
    }

    #[tokio::test]
    async fn test_delete_machine_is_idempotent_via_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let registry = MachineRegistry::new(paths.clone());

        registry.add_machine(sample_def("vm1", false)).await.unwrap();
        assert!(paths.machine_config_file("vm1").exists());

        registry.delete_machine("vm1", false).await.unwrap();
        assert!(!paths.machine_config_dir("vm1").exists());
        assert!(registry.machines().await.is_empty());

        let err = registry.delete_machine("vm1", false).await.unwrap_err();
        assert!(matches!(err, MachinedError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_machine_repersists() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let registry = MachineRegistry::new(paths.clone());

        registry.add_machine(sample_def("vm1", false)).await.unwrap();

        let mut updated = sample_def("vm1", false);
        updated.config.memory = 8192;
        registry.update_machine("vm1", updated).await.unwrap();

        let snapshot = registry.machine("vm1").await.unwrap();
        assert_eq!(*snapshot.get_config().get_memory(), 8192);

        let on_disk: MachineDef = serde_yaml::from_str(
            &std::fs::read_to_string(paths.machine_config_file("vm1")).unwrap(),
        )
        .unwrap();
        assert_eq!(*on_disk.get_config().get_memory(), 8192);
    }

    #[tokio::test]
    async fn test_update_rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MachineRegistry::new(test_paths(dir.path()));
        registry.add_machine(sample_def("vm1", true)).await.unwrap();

        let err = registry
            .update_machine("vm1", sample_def("vm2", true))
            .await
            .unwrap_err();
        assert!(matches!(err, MachinedError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_to_ephemeral_removes_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let registry = MachineRegistry::new(paths.clone());

        registry.add_machine(sample_def("vm1", false)).await.unwrap();
        assert!(paths.machine_config_file("vm1").exists());

        registry
            .update_machine("vm1", sample_def("vm1", true))
            .await
            .unwrap();
        assert!(!paths.machine_config_file("vm1").exists());
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_definition() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MachineRegistry::new(test_paths(dir.path()));

        let def: MachineDef =
            serde_yaml::from_str("name: vm1\ntype: xen\nconfig: {}").unwrap();
        let err = registry.add_machine(def).await.unwrap_err();
        assert!(matches!(err, MachinedError::Validation(_)));

        let def: MachineDef = serde_yaml::from_str(
            "name: vm1\nconfig:\n  disks:\n    - {file: a, bootindex: 2}\n    - {file: b, bootindex: 2}\n",
        )
        .unwrap();
        let err = registry.add_machine(def).await.unwrap_err();
        assert!(err.to_string().contains("duplicate boot index"));
    }

    #[tokio::test]
    async fn test_stop_machine_not_running_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MachineRegistry::new(test_paths(dir.path()));
        registry.add_machine(sample_def("vm1", true)).await.unwrap();

        let err = registry.stop_machine("vm1", false).await.unwrap_err();
        assert!(matches!(err, MachinedError::Busy(_)));
    }
}
