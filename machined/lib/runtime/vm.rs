//! The per-VM instance: one QEMU child, its swtpm, and its QMP session.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
    time,
};

use crate::{
    config::{create_local_datasource, VmDef},
    qemu::{
        discover_kvm_binary, prepare_uefi, synthesize, Arch, QemuCommand, SpiceEndpoint,
        SEED_DIR_NAME,
    },
    runtime::{QmpClient, Swtpm},
    utils::{ensure_dir, force_symlink, temp_socket_dir, wait_for_path},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Retries for each synthesized socket to appear during start.
const SOCKET_WAIT_RETRIES: u32 = 10;

/// Poll interval for socket readiness and QMP connect retries.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts to connect to the QMP socket before giving up.
const QMP_CONNECT_RETRIES: u32 = 10;

/// How long a graceful shutdown may take before the child is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the child to be reaped after its sockets closed.
const REAP_GRACE: Duration = Duration::from_secs(2);

/// Lines of child stderr retained for failure reports.
const STDERR_TAIL_LINES: usize = 50;

/// Name of the symlink inside the run directory pointing at the socket dir.
const SOCKETS_LINK_NAME: &str = "sockets";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Prepared but not started.
    Init,
    /// QEMU child alive and QMP usable.
    Started,
    /// Child exited after a requested stop.
    Stopped,
    /// Child died or never became ready.
    Failed,
    /// Stopped and directories removed.
    Cleaned,
}

/// One virtual machine instance.
///
/// Owns the QEMU child process, the optional swtpm co-process, and the QMP
/// session. Created lazily on the first start of a machine.
#[derive(Debug)]
pub struct Vm {
    name: String,
    cfg: VmDef,
    run_dir: PathBuf,
    sock_dir: PathBuf,
    command: QemuCommand,
    state_tx: watch::Sender<VmState>,
    stop_requested: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    pid: Option<u32>,
    exit_rx: Option<watch::Receiver<bool>>,
    swtpm: Option<Swtpm>,
    qmp: Option<QmpClient>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Vm {
    /// Prepares a new instance: run directory, socket directory and symlink,
    /// disk import, firmware, cloud-init seed, and the synthesized argv.
    ///
    /// Nothing is spawned; the instance is returned in `Init` state.
    pub async fn prepare(name: &str, config: &VmDef, run_dir: PathBuf) -> MachinedResult<Vm> {
        ensure_dir(&run_dir).await?;

        let sock_dir = temp_socket_dir()?;
        force_symlink(&sock_dir, run_dir.join(SOCKETS_LINK_NAME)).await?;

        // Work on a private copy; the declarative definition is never
        // mutated, not even by a failed start.
        let mut cfg = config.clone();

        for disk in &mut cfg.disks {
            disk.sanitize(&run_dir)?;
            disk.import(&run_dir).await?;
        }

        let firmware = if cfg.uefi {
            Some(
                prepare_uefi(
                    &run_dir,
                    cfg.uefi_code.as_deref(),
                    cfg.uefi_vars.as_deref(),
                    cfg.secure_boot,
                )
                .await?,
            )
        } else {
            None
        };

        let mut has_seed = false;
        if let Some(cloud_init) = &mut cfg.cloud_init {
            if cloud_init.has_config() {
                cloud_init.prepare_metadata(name)?;
                create_local_datasource(cloud_init, run_dir.join(SEED_DIR_NAME)).await?;
                has_seed = true;
            }
        }

        let kvm_path = discover_kvm_binary(Arch::host()?)?;
        let command = synthesize(
            name,
            &mut cfg,
            kvm_path,
            &run_dir,
            &sock_dir,
            firmware.as_ref(),
            has_seed,
        )?;
        tracing::info!(vm = name, kvm = %command.kvm_path.display(), "synthesized qemu config");

        Ok(Self::from_command(name, cfg, run_dir, sock_dir, command))
    }

    /// Builds an instance around an already-synthesized command.
    fn from_command(
        name: &str,
        cfg: VmDef,
        run_dir: PathBuf,
        sock_dir: PathBuf,
        command: QemuCommand,
    ) -> Vm {
        let (state_tx, _) = watch::channel(VmState::Init);
        Vm {
            name: name.to_string(),
            cfg,
            run_dir,
            sock_dir,
            command,
            state_tx,
            stop_requested: Arc::new(AtomicBool::new(false)),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            pid: None,
            exit_rx: None,
            swtpm: None,
            qmp: None,
        }
    }

    /// Returns the VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> VmState {
        *self.state_tx.borrow()
    }

    /// Returns true while the instance counts as running.
    pub fn is_running(&self) -> bool {
        self.state() == VmState::Started
    }

    /// Returns the client-visible serial console socket path.
    ///
    /// Clients get the run-directory path; the `sockets` component is a
    /// symlink to the short socket directory the VM actually binds.
    pub fn serial_console_path(&self) -> PathBuf {
        self.run_dir.join(SOCKETS_LINK_NAME).join("console.sock")
    }

    /// Returns the SPICE endpoint, when the machine has a GUI.
    pub fn spice_endpoint(&self) -> Option<SpiceEndpoint> {
        self.command.sockets.spice.clone()
    }

    /// Starts the instance: swtpm first, then the QEMU child, then waits for
    /// its sockets and opens the QMP session.
    ///
    /// On success the state is `Started` and callers may rely on QMP being
    /// usable. On failure everything spawned so far is torn down and the
    /// state is `Failed`.
    pub async fn start(&mut self) -> MachinedResult<()> {
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(vm = %self.name, error = %e, "start failed, cleaning up");
                let _ = self.stop(true).await;
                self.set_state(VmState::Failed);
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> MachinedResult<()> {
        if self.cfg.tpm {
            let tpm_dir = self.run_dir.join("tpm");
            ensure_dir(&tpm_dir).await?;
            let socket = self
                .command
                .sockets
                .tpm
                .clone()
                .expect("tpm socket synthesized for tpm machine");
            let mut swtpm = Swtpm::new(tpm_dir, socket, self.cfg.tpm_version);
            swtpm.start().await?;
            self.swtpm = Some(swtpm);
        }

        tracing::info!(vm = %self.name, "starting qemu process");
        let mut child = Command::new(&self.command.kvm_path)
            .args(&self.command.argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                MachinedError::SpawnFailed(format!(
                    "{}: {}",
                    self.command.kvm_path.display(),
                    e
                ))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| MachinedError::SpawnFailed("qemu exited immediately".into()))?;
        self.pid = Some(pid);

        // Capture the stderr tail for failure reports.
        if let Some(stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().expect("stderr tail lock");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // The child-wait task observes the exit no matter how the VM goes
        // down and settles the terminal state.
        let (exit_tx, exit_rx) = watch::channel(false);
        self.exit_rx = Some(exit_rx);
        let state_tx = self.state_tx.clone();
        let stop_requested = self.stop_requested.clone();
        let stderr_tail = self.stderr_tail.clone();
        let vm_name = self.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            if stop_requested.load(Ordering::SeqCst) {
                tracing::info!(vm = %vm_name, ?status, "qemu process exited");
                let _ = state_tx.send(VmState::Stopped);
            } else {
                let tail: Vec<String> =
                    stderr_tail.lock().expect("stderr tail lock").iter().cloned().collect();
                tracing::error!(
                    vm = %vm_name,
                    ?status,
                    stderr = %tail.join("\n"),
                    "qemu process exited unexpectedly"
                );
                let _ = state_tx.send(VmState::Failed);
            }
            let _ = exit_tx.send(true);
        });

        // Readiness: every socket the synthesizer promised must appear.
        for socket in self.command.sockets.qemu_sockets() {
            if !wait_for_path(socket, SOCKET_WAIT_RETRIES, RETRY_INTERVAL).await {
                return Err(MachinedError::Timeout(format!(
                    "socket {} did not appear",
                    socket.display()
                )));
            }
            self.ensure_child_alive()?;
        }

        let qmp = self.connect_qmp().await?;
        match qmp.query_status().await {
            Ok(status) => {
                tracing::info!(vm = %self.name, status = %status.status, "qmp ready")
            }
            Err(e) => tracing::warn!(vm = %self.name, error = %e, "query-status failed"),
        }
        match qmp.query_cpus().await {
            Ok(cpus) => tracing::debug!(vm = %self.name, cpus = cpus.len(), "guest cpus"),
            Err(e) => tracing::debug!(vm = %self.name, error = %e, "query-cpus failed"),
        }
        self.qmp = Some(qmp);

        // An unexpected swtpm death is terminal for the VM.
        if let Some(mut exited) = self.swtpm.as_ref().and_then(Swtpm::exited) {
            let state_tx = self.state_tx.clone();
            let stop_requested = self.stop_requested.clone();
            let vm_name = self.name.clone();
            tokio::spawn(async move {
                if exited.wait_for(|e| *e).await.is_ok()
                    && !stop_requested.load(Ordering::SeqCst)
                {
                    tracing::error!(vm = %vm_name, "swtpm died, marking VM failed");
                    let _ = state_tx.send(VmState::Failed);
                }
            });
        }

        self.set_state(VmState::Started);
        tracing::info!(vm = %self.name, pid, "vm started");
        Ok(())
    }

    /// Connects the QMP session, retrying once per second.
    async fn connect_qmp(&mut self) -> MachinedResult<QmpClient> {
        let qmp_socket = self.command.sockets.qmp.clone();
        let mut last_error = MachinedError::QmpClosed;
        for attempt in 1..=QMP_CONNECT_RETRIES {
            self.ensure_child_alive()?;
            tracing::debug!(vm = %self.name, attempt, "connecting to qmp socket");
            match QmpClient::connect(&qmp_socket).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::debug!(vm = %self.name, error = %e, "qmp connect failed, retrying");
                    last_error = e;
                }
            }
            time::sleep(RETRY_INTERVAL).await;
        }
        Err(MachinedError::Timeout(format!(
            "qmp session not ready after {} attempts: {}",
            QMP_CONNECT_RETRIES, last_error
        )))
    }

    /// Fails fast when the child already exited during readiness waits.
    fn ensure_child_alive(&self) -> MachinedResult<()> {
        if let Some(exit_rx) = &self.exit_rx {
            if *exit_rx.borrow() {
                return Err(MachinedError::SpawnFailed(format!(
                    "qemu exited before becoming ready: {}",
                    self.stderr_tail_string()
                )));
            }
        }
        Ok(())
    }

    /// Stops the instance.
    ///
    /// With a usable QMP session the guest is asked to power down (or quit,
    /// when forced) and given [`STOP_TIMEOUT`]; otherwise, or on timeout, the
    /// child is killed. The run directory is left intact.
    pub async fn stop(&mut self, force: bool) -> MachinedResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);

        if let Some(qmp) = self.qmp.take() {
            let request = if force {
                tracing::info!(vm = %self.name, "stopping via quit");
                qmp.quit().await
            } else {
                tracing::info!(vm = %self.name, "graceful shutdown via system_powerdown");
                qmp.system_powerdown().await
            };
            if let Err(e) = request {
                tracing::warn!(vm = %self.name, error = %e, "qmp shutdown request failed");
            }

            let mut closed = qmp.closed();
            let exited = self.wait_child_exit();
            tokio::select! {
                _ = exited => {
                    tracing::info!(vm = %self.name, "child exited");
                }
                _ = closed.wait_for(|c| *c) => {
                    tracing::info!(vm = %self.name, "qmp socket closed");
                }
                _ = time::sleep(STOP_TIMEOUT) => {
                    tracing::warn!(vm = %self.name, "shutdown timed out, killing child");
                    self.kill_child();
                }
            }
        } else {
            self.kill_child();
        }

        self.reap_child().await;

        if let Some(swtpm) = &mut self.swtpm {
            if let Err(e) = swtpm.stop().await {
                tracing::warn!(vm = %self.name, error = %e, "failed to stop swtpm");
            }
        }

        if matches!(self.state(), VmState::Init | VmState::Started) {
            self.set_state(VmState::Stopped);
        }
        Ok(())
    }

    /// Stops the instance if needed and removes its on-disk state.
    pub async fn delete(&mut self) -> MachinedResult<()> {
        if self.is_running() {
            self.stop(true).await?;
        }

        for dir in [&self.run_dir, &self.sock_dir] {
            if dir.exists() {
                tracing::info!(vm = %self.name, dir = %dir.display(), "removing");
                tokio::fs::remove_dir_all(dir).await?;
            }
        }

        self.set_state(VmState::Cleaned);
        Ok(())
    }

    /// Returns the retained tail of the child's stderr.
    pub fn stderr_tail_string(&self) -> String {
        self.stderr_tail
            .lock()
            .expect("stderr tail lock")
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn set_state(&self, state: VmState) {
        let _ = self.state_tx.send(state);
    }

    fn kill_child(&self) {
        let Some(pid) = self.pid else { return };
        if let Some(exit_rx) = &self.exit_rx {
            if *exit_rx.borrow() {
                return;
            }
        }
        tracing::info!(vm = %self.name, pid, "killing qemu child");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    /// Resolves when the child-wait task has observed the exit.
    async fn wait_child_exit(&self) {
        let Some(exit_rx) = self.exit_rx.clone() else {
            return;
        };
        let mut exit_rx = exit_rx;
        let _ = exit_rx.wait_for(|e| *e).await;
    }

    /// Makes sure the child is reaped, escalating to SIGKILL after a grace
    /// period.
    async fn reap_child(&mut self) {
        let Some(exit_rx) = self.exit_rx.clone() else {
            return;
        };
        let mut exit_rx = exit_rx;
        if time::timeout(REAP_GRACE, exit_rx.wait_for(|e| *e))
            .await
            .is_err()
        {
            self.kill_child();
            let _ = exit_rx.wait_for(|e| *e).await;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VmState::Init => "initialized",
            VmState::Started => "started",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
            VmState::Cleaned => "cleaned",
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::{synthesize_for, SocketMap};
    use serde_json::{json, Value};
    use std::path::Path;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt},
        net::UnixListener,
    };

    /// Serves one scripted QMP session on `path`.
    fn spawn_fake_qmp(path: &Path) -> tokio::task::JoinHandle<()> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(b"{\"QMP\": {\"version\": {\"qemu\": \"9.0.0\"}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut reader = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let reply = match request["execute"].as_str().unwrap() {
                    "query-status" => json!({"return": {"running": true, "status": "running"}}),
                    "quit" => {
                        let _ = write_half.write_all(b"{\"return\": {}}\n").await;
                        return;
                    }
                    _ => json!({"return": {}}),
                };
                let mut line = reply.to_string();
                line.push('\n');
                let _ = write_half.write_all(line.as_bytes()).await;
            }
        })
    }

    /// A Vm whose "qemu" is a long sleep and whose sockets are pre-created by
    /// the test, with a scripted QMP server behind the qmp socket.
    async fn fake_vm() -> (Vm, tempfile::TempDir, tokio::task::JoinHandle<()>) {
        let run = tempfile::tempdir().unwrap();
        let sock_dir = temp_socket_dir().unwrap();
        let run_dir = run.path().to_path_buf();
        force_symlink(&sock_dir, run_dir.join(SOCKETS_LINK_NAME))
            .await
            .unwrap();

        let mut cfg: VmDef = serde_yaml::from_str("uefi: false").unwrap();
        let mut command = synthesize_for(
            Arch::X86_64,
            "fake",
            &mut cfg,
            PathBuf::from("/bin/sleep"),
            &run_dir,
            &sock_dir,
            None,
            false,
        )
        .unwrap();
        command.argv = vec!["300".to_string()];

        // The "qemu" child does not bind sockets, so stand them up here.
        std::fs::write(&command.sockets.console, b"").unwrap();
        std::fs::write(&command.sockets.monitor, b"").unwrap();
        let qmp_server = spawn_fake_qmp(&command.sockets.qmp);

        let sockets = SocketMap {
            console: command.sockets.console.clone(),
            monitor: command.sockets.monitor.clone(),
            qmp: command.sockets.qmp.clone(),
            tpm: None,
            spice: None,
        };
        command.sockets = sockets;

        let vm = Vm::from_command("fake", cfg, run_dir, sock_dir, command);
        (vm, run, qmp_server)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (mut vm, _run, _server) = fake_vm().await;
        assert_eq!(vm.state(), VmState::Init);

        vm.start().await.unwrap();
        assert_eq!(vm.state(), VmState::Started);
        assert!(vm.is_running());
        assert!(vm.pid.is_some());

        vm.stop(true).await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(vm.qmp.is_none());

        // The child must be reaped.
        let mut exit_rx = vm.exit_rx.clone().unwrap();
        assert!(*exit_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_unexpected_child_exit_marks_failed() {
        let (mut vm, _run, _server) = fake_vm().await;
        vm.start().await.unwrap();

        // Kill the child out from under the VM.
        kill(
            Pid::from_raw(vm.pid.unwrap() as i32),
            Signal::SIGKILL,
        )
        .unwrap();

        let mut state_rx = vm.state_tx.subscribe();
        time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| *s == VmState::Failed))
            .await
            .expect("state settles to failed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_directories() {
        let (mut vm, run, _server) = fake_vm().await;
        vm.start().await.unwrap();

        let sock_dir = vm.sock_dir.clone();
        vm.delete().await.unwrap();

        assert_eq!(vm.state(), VmState::Cleaned);
        assert!(!run.path().exists() || std::fs::read_dir(run.path()).unwrap().next().is_none());
        assert!(!sock_dir.exists());
    }

    #[tokio::test]
    async fn test_serial_console_path_is_run_dir_relative() {
        let (vm, run, _server) = fake_vm().await;
        assert_eq!(
            vm.serial_console_path(),
            run.path().join("sockets/console.sock")
        );
        // The symlinked path resolves into the short socket directory.
        assert_eq!(
            std::fs::read_link(run.path().join("sockets")).unwrap(),
            vm.sock_dir
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let (mut vm, _run, _server) = fake_vm().await;
        vm.command.kvm_path = PathBuf::from("/nonexistent/qemu-kvm");

        let err = vm.start().await.unwrap_err();
        assert!(matches!(err, MachinedError::SpawnFailed(_)));
        assert_eq!(vm.state(), VmState::Failed);
    }
}
