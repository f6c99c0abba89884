pub mod check;
pub mod diff;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};

use keymirror_core::{config, Config};

/// Load and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    config::load_at(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}
