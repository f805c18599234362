// CLI subcommand dispatch and shared fixture plumbing.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Subcommand;
use serde::de::DeserializeOwned;
use tether_core::config::GatewayConfig;

use crate::exit_code::ExitCode;
use crate::output::OutputFormat;

pub mod anchor;
pub mod backoff;
pub mod check;
pub mod dirty;
pub mod relocate;

#[derive(Subcommand)]
pub enum Command {
    /// Encode or decode opaque anchor tokens
    #[command(subcommand)]
    Anchor(anchor::AnchorCommand),
    /// Run a gateway request against a document snapshot
    Check(check::CheckArgs),
    /// Relocate an anchor through a batch of block transforms
    Relocate(relocate::RelocateArgs),
    /// Compute the dirty region of an edit
    Dirty(dirty::DirtyArgs),
    /// Print the retry backoff schedule for a policy
    Backoff(backoff::BackoffArgs),
}

/// Settings shared by every subcommand.
pub struct Context {
    pub format: OutputFormat,
    pub config_path: Option<PathBuf>,
}

impl Context {
    /// An explicit `--config` must load; the default location falls back to
    /// built-in defaults.
    pub fn config(&self) -> anyhow::Result<GatewayConfig> {
        match &self.config_path {
            Some(path) => GatewayConfig::load_from(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(GatewayConfig::load()),
        }
    }
}

pub fn run(cmd: Command, ctx: &Context) -> anyhow::Result<ExitCode> {
    match cmd {
        Command::Anchor(cmd) => anchor::run(cmd, ctx),
        Command::Check(args) => check::run(args, ctx),
        Command::Relocate(args) => relocate::run(args, ctx),
        Command::Dirty(args) => dirty::run(args, ctx),
        Command::Backoff(args) => backoff::run(args, ctx),
    }
}

pub(crate) fn read_fixture<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing fixture {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context { format: OutputFormat::Json, config_path: Some(dir.path().join("absent.toml")) };
        let err = ctx.config().unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[neighbors]\nneighbor_expand_k = 3\n").unwrap();
        let ctx = Context { format: OutputFormat::Json, config_path: Some(path) };
        assert_eq!(ctx.config().unwrap().neighbors.neighbor_expand_k, 3);
    }

    #[test]
    fn read_fixture_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        let err = read_fixture::<serde_json::Value>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Usage);
    }
}
