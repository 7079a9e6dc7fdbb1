use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{NodeError, Result};

const DOMAIN: &str = "ar";
const COMPANY: &str = "xmas";
const PRODUCT: &str = "vmark-node";

fn project() -> Result<ProjectDirs> {
    ProjectDirs::from(DOMAIN, COMPANY, PRODUCT)
        .ok_or_else(|| NodeError::Persistence("unable to determine project directories".into()))
}

/// Path of a file under the user-scoped configuration directory, creating
/// the directory if needed.
pub fn config_file(file: &str) -> Result<PathBuf> {
    let dirs = project()?;
    let config_dir = dirs.config_dir();
    std::fs::create_dir_all(config_dir)
        .map_err(|e| NodeError::Persistence(format!("create {}: {e}", config_dir.display())))?;
    Ok(config_dir.join(file))
}

/// Default location of the forwarding-rule snapshot.
pub fn rules_snapshot() -> Result<PathBuf> {
    config_file("rules.json")
}
