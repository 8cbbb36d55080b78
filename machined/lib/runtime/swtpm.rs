//! Supervision of the per-VM software TPM (swtpm) co-process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{process::Command, sync::watch, time};

use crate::{
    config::TpmVersion,
    utils::{ensure_dir, path_exists, wait_for_path, which},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long to wait for the swtpm control socket to appear.
const SWTPM_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL on stop.
const SWTPM_STOP_GRACE: Duration = Duration::from_secs(2);

/// Minimum swtpm_setup version able to provision TPM 2.0 with secure boot.
const SWTPM_SETUP_MIN_VERSION: (u32, u32, u32) = (0, 7, 3);

/// State file swtpm_setup writes; its presence marks a provisioned TPM.
const SWTPM_PROVISIONED_MARKER: &str = "tpm-00.permall";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A supervised swtpm child process.
///
/// The VM owns its `Swtpm`; an unexpected exit is published on the death
/// watch and treated as terminal by the owning VM.
#[derive(Debug)]
pub struct Swtpm {
    /// swtpm state directory (`<run_dir>/tpm`).
    state_dir: PathBuf,

    /// Control socket path handed to QEMU's tpm chardev.
    socket: PathBuf,

    /// Emulated TPM specification version.
    version: TpmVersion,

    /// The child pid while running.
    pid: Option<u32>,

    /// Flips to true when the child exits.
    exited_rx: Option<watch::Receiver<bool>>,

    /// Set before a deliberate stop so the wait task can tell an expected
    /// exit from a crash.
    stopping: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Swtpm {
    /// Creates a supervisor for a TPM stored under `state_dir`, exposing its
    /// control socket at `socket`.
    pub fn new(state_dir: impl Into<PathBuf>, socket: impl Into<PathBuf>, version: TpmVersion) -> Self {
        Self {
            state_dir: state_dir.into(),
            socket: socket.into(),
            version,
            pid: None,
            exited_rx: None,
            stopping: Default::default(),
        }
    }

    /// Returns the control socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Returns a watch that flips to true when the child exits.
    pub fn exited(&self) -> Option<watch::Receiver<bool>> {
        self.exited_rx.clone()
    }

    /// First-time provisioning via `swtpm_setup`.
    ///
    /// Renders the localca/setup configuration into the state directory and
    /// creates the EK, EK certificate and platform certificate. Provisioning
    /// is skipped when TPM state already exists, and for TPM 2.0 when the
    /// installed swtpm_setup is too old to handle it.
    pub async fn setup(&self) -> MachinedResult<()> {
        ensure_dir(&self.state_dir).await?;

        if path_exists(self.state_dir.join(SWTPM_PROVISIONED_MARKER)) {
            tracing::debug!(state_dir = %self.state_dir.display(), "swtpm already provisioned");
            return Ok(());
        }

        if which("swtpm_setup").is_none() {
            return Err(MachinedError::AssetMissing(
                "no 'swtpm_setup' command found in PATH".into(),
            ));
        }

        let version = swtpm_setup_version().await?;
        tracing::info!(?version, "found swtpm_setup");
        if self.version.is_v2() && version < SWTPM_SETUP_MIN_VERSION {
            tracing::info!(
                ?version,
                "skipping swtpm_setup for TPM 2.0, need at least {}.{}.{}",
                SWTPM_SETUP_MIN_VERSION.0,
                SWTPM_SETUP_MIN_VERSION.1,
                SWTPM_SETUP_MIN_VERSION.2
            );
            return Ok(());
        }

        let certs_tool = which("swtpm_localca").ok_or_else(|| {
            MachinedError::AssetMissing("no 'swtpm_localca' command found in PATH".into())
        })?;
        self.render_setup_files(&certs_tool).await?;

        let config = self.state_dir.join("swtpm_setup.conf");
        let mut command = Command::new("swtpm_setup");
        command
            .arg("--tpm-state")
            .arg(format!("dir://{}", self.state_dir.display()))
            .arg(format!("--config={}", config.display()))
            .arg(format!("--log={}", self.state_dir.join("log").display()))
            .args([
                "--createek",
                "--create-ek-cert",
                "--create-platform-cert",
                "--lock-nvram",
                "--not-overwrite",
            ])
            .arg(format!("--write-ek-cert-files={}", self.state_dir.display()));
        if !self.version.is_v2() {
            // TPM 1.2 needs well-known values; they break 2.0 secure boot.
            command.args(["--srk-well-known", "--owner-well-known"]);
        }

        let output = command.output().await?;
        if !output.status.success() {
            return Err(MachinedError::custom(anyhow::anyhow!(
                "swtpm_setup failed (rc {:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Starts the swtpm child and waits for its control socket.
    ///
    /// Provisioning failures are fatal for TPM 1.2; for 2.0 the TPM starts
    /// degraded (some features unavailable) and the failure is logged.
    pub async fn start(&mut self) -> MachinedResult<()> {
        if which("swtpm").is_none() {
            return Err(MachinedError::AssetMissing(
                "no 'swtpm' command found in PATH".into(),
            ));
        }

        if let Err(e) = self.setup().await {
            if !self.version.is_v2() {
                return Err(MachinedError::SpawnFailed(format!(
                    "required swtpm setup for TPM 1.2 failed: {}",
                    e
                )));
            }
            tracing::warn!(error = %e, "swtpm setup failed, some TPM features may not function");
        }

        let mut command = Command::new("swtpm");
        command
            .arg("socket")
            .arg(format!("--tpmstate=dir={}", self.state_dir.display()))
            .arg(format!("--ctrl=type=unixio,path={}", self.socket.display()))
            .arg(format!(
                "--log=level=20,file={}",
                self.state_dir.join("log").display()
            ))
            .arg(format!("--pid=file={}", self.state_dir.join("pid").display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if self.version.is_v2() {
            command.arg("--tpm2");
        }

        let mut child = command
            .spawn()
            .map_err(|e| MachinedError::SpawnFailed(format!("swtpm: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| MachinedError::SpawnFailed("swtpm exited immediately".into()))?;

        let (exited_tx, exited_rx) = watch::channel(false);
        let stopping = self.stopping.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            if !stopping.load(std::sync::atomic::Ordering::SeqCst) {
                tracing::error!(pid, ?status, "swtpm exited unexpectedly");
            } else {
                tracing::info!(pid, ?status, "swtpm exited");
            }
            let _ = exited_tx.send(true);
        });

        if !wait_for_path(&self.socket, 10, Duration::from_secs(1)).await {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            return Err(MachinedError::Timeout(format!(
                "swtpm control socket {} did not appear within {:?}",
                self.socket.display(),
                SWTPM_START_TIMEOUT
            )));
        }

        tracing::info!(pid, version = %self.version, "swtpm started");
        self.pid = Some(pid);
        self.exited_rx = Some(exited_rx);
        Ok(())
    }

    /// Stops the child: SIGTERM, a short grace period, then SIGKILL.
    pub async fn stop(&mut self) -> MachinedResult<()> {
        let Some(pid) = self.pid.take() else {
            return Ok(());
        };
        self.stopping
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let nix_pid = Pid::from_raw(pid as i32);
        match kill(nix_pid, Signal::SIGTERM) {
            Ok(_) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(()),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to SIGTERM swtpm");
            }
        }

        if let Some(mut exited) = self.exited_rx.take() {
            let exited_in_time = {
                time::timeout(SWTPM_STOP_GRACE, exited.wait_for(|e| *e))
                    .await
                    .is_ok()
            };
            if exited_in_time {
                tracing::info!(pid, "swtpm exited after SIGTERM");
            } else {
                tracing::info!(pid, "swtpm did not exit in time, killing");
                let _ = kill(nix_pid, Signal::SIGKILL);
                let _ = exited.wait_for(|e| *e).await;
            }
        }
        Ok(())
    }

    /// Renders swtpm-localca.conf, swtpm-localca.options and swtpm_setup.conf
    /// into the state directory.
    async fn render_setup_files(&self, certs_tool: &Path) -> MachinedResult<()> {
        let state = self.state_dir.display();

        let localca_conf = format!(
            "statedir = {state}\n\
             signingkey = {state}/signingkey.pem\n\
             issuercert = {state}/issuercert.pem\n\
             certserial = {state}/certserial\n"
        );
        let localca_options = format!(
            "--tpm-manufacturer IBM\n\
             --tpm-model swtpm-libtpms\n\
             --tpm-version {}\n\
             --platform-manufacturer MachineOS\n\
             --platform-version 2.1\n\
             --platform-model QEMU\n",
            self.version
        );
        let setup_conf = format!(
            "create_certs_tool={}\n\
             create_certs_tool_config={state}/swtpm-localca.conf\n\
             create_certs_tool_options={state}/swtpm-localca.options\n",
            certs_tool.display()
        );

        for (name, contents) in [
            ("swtpm-localca.conf", localca_conf),
            ("swtpm-localca.options", localca_options),
            ("swtpm_setup.conf", setup_conf),
        ] {
            tokio::fs::write(self.state_dir.join(name), contents).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Queries `swtpm_setup --version` and parses the trailing version token.
///
/// Older swtpm_setup releases exit 1 on --version, so the exit code is not
/// checked as long as output was produced.
async fn swtpm_setup_version() -> MachinedResult<(u32, u32, u32)> {
    let output = Command::new("swtpm_setup").arg("--version").output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_swtpm_version(&stdout)
}

/// Parses "TPM emulator setup tool version 0.7.1" into (0, 7, 1).
fn parse_swtpm_version(output: &str) -> MachinedResult<(u32, u32, u32)> {
    let token = output
        .trim()
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or_default();
    let mut parts = token.split('.');
    let parse = |part: Option<&str>| -> MachinedResult<u32> {
        part.and_then(|p| p.parse().ok()).ok_or_else(|| {
            MachinedError::Validation(format!("failed to parse swtpm_setup version: {:?}", output))
        })
    };
    let major = parse(parts.next())?;
    let minor = parse(parts.next())?;
    let micro = parse(parts.next())?;
    Ok((major, minor, micro))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
