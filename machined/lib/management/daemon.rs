//! Daemon lifetime: socket setup, signal handling, graceful shutdown.

use std::{
    os::fd::{FromRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::UnixListener,
    signal::unix::{signal, SignalKind},
    sync::watch,
};

use crate::{
    management::MachineRegistry,
    server::{create_router, ServerState},
    utils::{ensure_dir, path_exists, DaemonPaths},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Window after the first signal during which a second signal aborts.
const ABORT_WINDOW: Duration = Duration::from_secs(30);

/// Exit code for an abort forced by a second signal.
pub const EXIT_CODE_ABORTED: i32 = 2;

/// The first file descriptor passed by a socket-activation parent.
const SD_LISTEN_FDS_START: RawFd = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The machined daemon: an API listener plus the machine registry.
pub struct Daemon {
    paths: DaemonPaths,
    registry: Arc<MachineRegistry>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Daemon {
    /// Resolves paths and rehydrates the registry from disk.
    pub async fn new() -> MachinedResult<Self> {
        let paths = DaemonPaths::from_env()?;
        let registry = Arc::new(MachineRegistry::load(paths.clone()).await?);
        Ok(Self { paths, registry })
    }

    /// Runs the daemon until a termination signal arrives, then performs
    /// fleet shutdown.
    ///
    /// Returns `Ok` on clean shutdown. A second signal within the abort
    /// window exits the process immediately with [`EXIT_CODE_ABORTED`].
    pub async fn run(self) -> MachinedResult<()> {
        let (listener, inherited) = self.bind_listener().await?;
        let socket_path = self.paths.api_socket_path();
        tracing::info!(socket = %socket_path.display(), inherited, "machined service running");

        let state = ServerState::new(self.registry.clone());
        let router = create_router(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut sigint =
                signal(SignalKind::interrupt()).expect("installing SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("installing SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("shutting down gracefully, press Ctrl+C again to force");
            let _ = shutdown_tx.send(true);

            // A second signal within the window aborts without waiting for
            // machines to stop.
            let abort = async {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            };
            if tokio::time::timeout(ABORT_WINDOW, abort).await.is_ok() {
                tracing::warn!("second signal received, aborting");
                std::process::exit(EXIT_CODE_ABORTED);
            }
        });

        let serve_result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|s| *s).await;
            })
            .await;

        tracing::info!("stopping all machines");
        self.registry.stop_machines().await;

        if !inherited && path_exists(&socket_path) {
            let _ = tokio::fs::remove_file(&socket_path).await;
        }

        serve_result.map_err(MachinedError::Io)?;
        tracing::info!("machined exiting");
        Ok(())
    }

    /// Binds the API listener, preferring a socket-activation fd when the
    /// parent passed one.
    async fn bind_listener(&self) -> MachinedResult<(UnixListener, bool)> {
        if let Some(listener) = inherited_listener()? {
            return Ok((listener, true));
        }

        let socket_path = self.paths.api_socket_path();
        let parent = socket_path
            .parent()
            .ok_or_else(|| MachinedError::Validation("api socket path has no parent".into()))?;
        ensure_dir(parent).await?;

        // A stale socket from a previous run would make bind fail.
        if path_exists(&socket_path) {
            tokio::fs::remove_file(&socket_path).await?;
        }

        Ok((UnixListener::bind(&socket_path)?, false))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the listener inherited via the systemd socket-activation
/// convention (`LISTEN_FDS`/`LISTEN_PID`), if any.
fn inherited_listener() -> MachinedResult<Option<UnixListener>> {
    let Some(listen_fds) = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
    else {
        return Ok(None);
    };
    if listen_fds == 0 {
        return Ok(None);
    }

    if let Some(listen_pid) = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
    {
        if listen_pid != std::process::id() {
            tracing::warn!(listen_pid, "LISTEN_PID is not us, ignoring inherited fds");
            return Ok(None);
        }
    }

    tracing::info!(listen_fds, "using socket-activation listener");
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(SD_LISTEN_FDS_START) };
    std_listener.set_nonblocking(true)?;
    Ok(Some(UnixListener::from_std(std_listener)?))
}
