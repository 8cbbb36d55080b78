//! Per-user directory resolution and UNIX socket path rules.

use std::path::{Path, PathBuf};

use getset::Getters;

use crate::{MachinedError, MachinedResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory (under each XDG root) where machined artifacts are stored.
pub const MACHINE_SUBDIR: &str = "machine";

/// The sub directory where per-machine configs and run state live.
pub const MACHINES_SUBDIR: &str = "machines";

/// The filename of a persisted machine definition.
pub const MACHINE_CONFIG_FILENAME: &str = "machine.yaml";

/// The sub directory (under the runtime root) holding the API socket.
pub const API_SOCKET_SUBDIR: &str = "machined";

/// The filename of the API socket.
pub const API_SOCKET_FILENAME: &str = "machined.socket";

/// The prefix for the short per-VM socket directories under /tmp.
pub const SOCK_DIR_PREFIX: &str = "msockets-";

/// Maximum length of a UNIX socket path including the trailing NUL byte.
pub const LINUX_UNIX_SOCKET_MAX_LEN: usize = 108;

/// The longest socket filename a socket directory will ever host.
const LONGEST_SOCKET_FILENAME: &str = "monitor.socket";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-user directory roots the daemon operates in.
///
/// Resolved from `XDG_CONFIG_HOME`, `XDG_DATA_HOME`, `XDG_STATE_HOME` and
/// `XDG_RUNTIME_DIR`, falling back to the usual `$HOME`-relative defaults and
/// `/run/user/<uid>`.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DaemonPaths {
    /// Root for persisted machine definitions.
    config_dir: PathBuf,

    /// Root for machine data (disk image templates, media).
    data_dir: PathBuf,

    /// Root for per-machine run state (imported disks, firmware vars, tpm).
    state_dir: PathBuf,

    /// Root for the API socket.
    runtime_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DaemonPaths {
    /// Resolves the daemon roots from the process environment.
    pub fn from_env() -> MachinedResult<Self> {
        Self::resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolves the daemon roots using the given environment lookup.
    pub fn resolve_with(get: impl Fn(&str) -> Option<String>) -> MachinedResult<Self> {
        let home = get("HOME").map(PathBuf::from);
        let home_join = |tail: &[&str]| -> MachinedResult<PathBuf> {
            let mut p = home.clone().ok_or_else(|| {
                MachinedError::Validation("HOME is not set and no XDG directory overrides it".into())
            })?;
            for seg in tail {
                p.push(seg);
            }
            Ok(p)
        };

        let config_root = match get("XDG_CONFIG_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home_join(&[".config"])?,
        };
        let data_root = match get("XDG_DATA_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home_join(&[".local", "share"])?,
        };
        let state_root = match get("XDG_STATE_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => home_join(&[".local", "state"])?,
        };
        let runtime_root = match get("XDG_RUNTIME_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/run/user/{}", uid))
            }
        };

        let paths = Self {
            config_dir: config_root.join(MACHINE_SUBDIR),
            data_dir: data_root.join(MACHINE_SUBDIR),
            state_dir: state_root.join(MACHINE_SUBDIR),
            runtime_dir: runtime_root.join(API_SOCKET_SUBDIR),
        };
        check_socket_path(&paths.api_socket_path())?;

        Ok(paths)
    }

    /// Returns the path of the UNIX socket the API listens on.
    pub fn api_socket_path(&self) -> PathBuf {
        self.runtime_dir.join(API_SOCKET_FILENAME)
    }

    /// Returns the directory holding all persisted machine definitions.
    pub fn machines_config_dir(&self) -> PathBuf {
        self.config_dir.join(MACHINES_SUBDIR)
    }

    /// Returns the config directory of a single machine.
    pub fn machine_config_dir(&self, name: &str) -> PathBuf {
        self.machines_config_dir().join(name)
    }

    /// Returns the persisted definition file of a single machine.
    pub fn machine_config_file(&self, name: &str) -> PathBuf {
        self.machine_config_dir(name).join(MACHINE_CONFIG_FILENAME)
    }

    /// Returns the data directory of a single machine.
    pub fn machine_data_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(MACHINES_SUBDIR).join(name)
    }

    /// Returns the run directory of a single machine.
    pub fn machine_run_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join(MACHINES_SUBDIR).join(name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `dir` can hold every socket filename the daemon binds without
/// exceeding [`LINUX_UNIX_SOCKET_MAX_LEN`].
pub fn check_socket_dir(dir: &Path) -> MachinedResult<()> {
    let candidate = dir.join(LONGEST_SOCKET_FILENAME);
    check_socket_path(&candidate)
}

/// Checks a single socket path against [`LINUX_UNIX_SOCKET_MAX_LEN`].
pub fn check_socket_path(path: &Path) -> MachinedResult<()> {
    let len = path.as_os_str().len() + 1;
    if len > LINUX_UNIX_SOCKET_MAX_LEN {
        return Err(MachinedError::PathTooLong {
            path: path.display().to_string(),
            len,
        });
    }
    Ok(())
}

/// Creates a fresh short-lived socket directory under `/tmp`.
///
/// UNIX socket paths are capped at 108 bytes, so sockets are bound under a
/// short `/tmp/msockets-XXXXXX` directory and the per-VM run directory gets a
/// `sockets` symlink pointing at it.
pub fn temp_socket_dir() -> MachinedResult<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(SOCK_DIR_PREFIX)
        .tempdir_in("/tmp")?
        .into_path();
    if let Err(e) = check_socket_dir(&dir) {
        let _ = std::fs::remove_dir_all(&dir);
        return Err(e);
    }
    Ok(dir)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_resolve_with_xdg_overrides() {
        let paths = DaemonPaths::resolve_with(env(&[
            ("XDG_CONFIG_HOME", "/xdg/config"),
            ("XDG_DATA_HOME", "/xdg/data"),
            ("XDG_STATE_HOME", "/xdg/state"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]))
        .unwrap();

        assert_eq!(paths.get_config_dir(), &PathBuf::from("/xdg/config/machine"));
        assert_eq!(paths.get_data_dir(), &PathBuf::from("/xdg/data/machine"));
        assert_eq!(paths.get_state_dir(), &PathBuf::from("/xdg/state/machine"));
        assert_eq!(
            paths.api_socket_path(),
            PathBuf::from("/run/user/1000/machined/machined.socket")
        );
    }

    #[test]
    fn test_resolve_with_home_fallbacks() {
        let paths = DaemonPaths::resolve_with(env(&[("HOME", "/home/u")])).unwrap();

        assert_eq!(
            paths.get_config_dir(),
            &PathBuf::from("/home/u/.config/machine")
        );
        assert_eq!(
            paths.get_data_dir(),
            &PathBuf::from("/home/u/.local/share/machine")
        );
        assert_eq!(
            paths.get_state_dir(),
            &PathBuf::from("/home/u/.local/state/machine")
        );
        assert_eq!(
            paths.machine_config_file("vm1"),
            PathBuf::from("/home/u/.config/machine/machines/vm1/machine.yaml")
        );
    }

    #[test]
    fn test_resolve_without_home_or_xdg_fails() {
        assert!(DaemonPaths::resolve_with(|_| None).is_err());
    }

    #[test]
    fn test_check_socket_path_limit() {
        assert!(check_socket_path(Path::new("/tmp/msockets-abc/qmp.sock")).is_ok());

        let long = format!("/tmp/{}/monitor.socket", "x".repeat(120));
        let err = check_socket_path(Path::new(&long)).unwrap_err();
        assert!(matches!(err, MachinedError::PathTooLong { .. }));
    }

    #[test]
    fn test_runtime_dir_too_long_is_rejected() {
        let long_runtime = format!("/run/user/1000/{}", "y".repeat(110));
        let result = DaemonPaths::resolve_with(env(&[
            ("HOME", "/home/u"),
            ("XDG_RUNTIME_DIR", long_runtime.as_str()),
        ]));
        assert!(matches!(result, Err(MachinedError::PathTooLong { .. })));
    }

    #[test]
    fn test_temp_socket_dir_is_short_and_fresh() {
        let a = temp_socket_dir().unwrap();
        let b = temp_socket_dir().unwrap();
        assert_ne!(a, b);
        assert!(a.exists());
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SOCK_DIR_PREFIX));
        check_socket_dir(&a).unwrap();
        let _ = std::fs::remove_dir_all(&a);
        let _ = std::fs::remove_dir_all(&b);
    }
}
