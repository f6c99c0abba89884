//! `keymirror run`: the long-running mirror.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use keymirror_daemon::start_blocking;

use super::load_config;

/// Arguments for `keymirror run`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {}

impl RunArgs {
    pub fn run(self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        start_blocking(config).context("mirror stopped with an error")?;
        Ok(())
    }
}
