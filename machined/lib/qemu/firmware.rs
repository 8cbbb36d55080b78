//! UEFI firmware discovery and per-VM import.

use std::path::{Path, PathBuf};

use crate::{
    utils::{copy_file_bits, path_exists},
    MachinedError, MachinedResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where distribution OVMF builds live.
pub const SYSTEM_OVMF_DIR: &str = "/usr/share/OVMF";

/// The per-VM copy of the UEFI code blob.
pub const UEFI_CODE_FILENAME: &str = "uefi-code.fd";

/// The per-VM writable copy of the UEFI vars template.
pub const UEFI_VARS_FILENAME: &str = "uefi-vars.fd";

const SECBOOT_CODE_CANDIDATES: [&str; 2] = ["OVMF_CODE.secboot.fd", "OVMF_CODE_4M.secboot.fd"];
const SECBOOT_VARS_CANDIDATES: [&str; 2] = ["OVMF_VARS.secboot.fd", "OVMF_VARS_4M.secboot.fd"];
const CODE_CANDIDATES: [&str; 2] = ["OVMF_CODE.fd", "OVMF_CODE_4M.fd"];
const VARS_CANDIDATES: [&str; 2] = ["OVMF_VARS.fd", "OVMF_VARS_4M.fd"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-VM firmware blobs a UEFI machine boots with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiFirmware {
    /// Read-only code blob inside the run directory.
    pub code: PathBuf,

    /// Writable NVRAM vars file inside the run directory.
    pub vars: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Locates a system firmware pair under `base`.
///
/// `secure_boot` requires a secboot-capable code blob and matching vars
/// template.
pub fn find_system_firmware(base: &Path, secure_boot: bool) -> MachinedResult<(PathBuf, PathBuf)> {
    let (code_candidates, vars_candidates) = if secure_boot {
        (&SECBOOT_CODE_CANDIDATES, &SECBOOT_VARS_CANDIDATES)
    } else {
        (&CODE_CANDIDATES, &VARS_CANDIDATES)
    };

    let find = |candidates: &[&str]| -> Option<PathBuf> {
        candidates
            .iter()
            .map(|name| base.join(name))
            .find(|p| path_exists(p))
    };

    let code = find(code_candidates);
    let vars = find(vars_candidates);
    match (code, vars) {
        (Some(code), Some(vars)) => Ok((code, vars)),
        _ => Err(MachinedError::AssetMissing(format!(
            "no {}UEFI firmware found under {} (looked for {:?} / {:?})",
            if secure_boot { "secure-boot " } else { "" },
            base.display(),
            code_candidates,
            vars_candidates
        ))),
    }
}

/// Imports UEFI firmware into the VM's run directory.
///
/// The code blob is copied on every start; the vars template is copied only
/// when the per-VM copy is missing, so guest NVRAM survives restarts.
/// Explicit source paths override system firmware discovery.
pub async fn prepare_uefi(
    run_dir: &Path,
    src_code: Option<&Path>,
    src_vars: Option<&Path>,
    secure_boot: bool,
) -> MachinedResult<UefiFirmware> {
    prepare_uefi_from(Path::new(SYSTEM_OVMF_DIR), run_dir, src_code, src_vars, secure_boot).await
}

/// [`prepare_uefi`] with an explicit system firmware directory.
pub async fn prepare_uefi_from(
    system_dir: &Path,
    run_dir: &Path,
    src_code: Option<&Path>,
    src_vars: Option<&Path>,
    secure_boot: bool,
) -> MachinedResult<UefiFirmware> {
    let (sys_code, sys_vars) = match (src_code, src_vars) {
        (Some(_), Some(_)) => (PathBuf::new(), PathBuf::new()),
        _ => find_system_firmware(system_dir, secure_boot)?,
    };
    let code_src = src_code.map(Path::to_path_buf).unwrap_or(sys_code);
    let vars_src = src_vars.map(Path::to_path_buf).unwrap_or(sys_vars);

    for src in [&code_src, &vars_src] {
        if !path_exists(src) {
            return Err(MachinedError::AssetMissing(format!(
                "UEFI firmware blob {} does not exist",
                src.display()
            )));
        }
    }

    let code_dest = run_dir.join(UEFI_CODE_FILENAME);
    tracing::info!(src = %code_src.display(), dest = %code_dest.display(), "importing UEFI code");
    copy_file_bits(&code_src, &code_dest).await?;

    let vars_dest = run_dir.join(UEFI_VARS_FILENAME);
    if !path_exists(&vars_dest) {
        tracing::info!(src = %vars_src.display(), dest = %vars_dest.display(), "importing UEFI vars");
        copy_file_bits(&vars_src, &vars_dest).await?;
    } else {
        tracing::info!(dest = %vars_dest.display(), "UEFI vars already imported, not overwriting");
    }

    Ok(UefiFirmware {
        code: code_dest,
        vars: vars_dest,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
