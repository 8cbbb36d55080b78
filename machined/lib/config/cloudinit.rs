//! Cloud-init NoCloud seed rendering.
//!
//! The lifecycle engine only invokes the small surface here: fill in metadata
//! defaults and render the seed directory that gets attached to the guest as
//! a VVFAT volume labelled `cidata`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::{utils::ensure_dir, MachinedError, MachinedResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filesystem label cloud-init looks for on NoCloud seed volumes.
pub const NOCLOUD_FS_LABEL: &str = "cidata";

const SEED_FILES: [&str; 3] = ["network-config", "user-data", "meta-data"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Raw cloud-init documents carried in a machine definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitConfig {
    /// The `network-config` document.
    #[serde(rename = "network-config", default, skip_serializing_if = "Option::is_none")]
    pub(crate) network_config: Option<String>,

    /// The `user-data` document.
    #[serde(rename = "user-data", default, skip_serializing_if = "Option::is_none")]
    pub(crate) user_data: Option<String>,

    /// The `meta-data` document.
    #[serde(rename = "meta-data", default, skip_serializing_if = "Option::is_none")]
    pub(crate) meta_data: Option<String>,
}

#[derive(Debug, Serialize)]
struct MetaData {
    #[serde(rename = "instance-id")]
    instance_id: String,

    #[serde(rename = "local-hostname")]
    local_hostname: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CloudInitConfig {
    /// Returns true if any seed document is present.
    pub fn has_config(&self) -> bool {
        self.network_config.is_some() || self.user_data.is_some() || self.meta_data.is_some()
    }

    /// Fills `meta-data` with a fresh instance-id and the machine name as
    /// local-hostname, unless metadata was provided explicitly.
    pub fn prepare_metadata(&mut self, hostname: &str) -> MachinedResult<()> {
        if self.meta_data.is_some() {
            return Ok(());
        }
        let md = MetaData {
            instance_id: Uuid::new_v4().to_string(),
            local_hostname: hostname.to_string(),
        };
        self.meta_data = Some(serde_yaml::to_string(&md)?);
        Ok(())
    }

    fn documents(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        SEED_FILES
            .into_iter()
            .zip([
                self.network_config.as_deref(),
                self.user_data.as_deref(),
                self.meta_data.as_deref(),
            ])
            .filter_map(|(name, doc)| doc.map(|d| (name, d)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the cloud-init seed directory for a NoCloud local datasource.
///
/// Each present document is written atomically (temp file + rename) into
/// `dir`, and the rendered tree is verified against the config afterwards.
pub async fn create_local_datasource(
    config: &CloudInitConfig,
    dir: impl AsRef<Path>,
) -> MachinedResult<()> {
    let dir = dir.as_ref();
    ensure_dir(dir).await?;

    let mut rendered = 0;
    for (name, contents) in config.documents() {
        let target = dir.join(name);
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(temp.path(), contents.as_bytes()).await?;
        temp.persist(&target)
            .map_err(|e| MachinedError::Io(e.error))?;
        rendered += 1;
    }

    if rendered == 0 {
        return Err(MachinedError::Validation(
            "cloud-init config has no documents to render".into(),
        ));
    }

    verify_datasource(config, dir).await
}

/// Checks that the rendered seed directory matches the config it came from.
async fn verify_datasource(config: &CloudInitConfig, dir: &Path) -> MachinedResult<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let expected = match name.as_ref() {
            "network-config" => config.network_config.as_deref(),
            "user-data" => config.user_data.as_deref(),
            "meta-data" => config.meta_data.as_deref(),
            other => {
                return Err(MachinedError::Validation(format!(
                    "unexpected file '{}' in cloud-init seed directory",
                    other
                )))
            }
        };
        let expected = expected.ok_or_else(|| {
            MachinedError::Validation(format!(
                "rendered cloud-init file '{}' has no matching document",
                name
            ))
        })?;
        let actual = fs::read_to_string(entry.path()).await?;
        if actual != expected {
            return Err(MachinedError::Validation(format!(
                "cloud-init file '{}' does not match its source document",
                name
            )));
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
