//! `sshmountd` command line.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::path::PathBuf;

use crate::config::SshmountConfig;
use crate::service::{Collaborators, MountService};
use crate::supervisor::SubmitOutcome;
use crate::types::AuthMode;

/// Command line of `sshmountd`.
#[derive(Parser)]
#[command(name = "sshmountd")]
#[command(about = "SSHFS mount supervisor", long_about = None)]
pub struct Cli {
    /// Config file, TOML or JSON by extension.
    #[arg(short, long, env = "SSHMOUNT_CONFIG", default_value = "/etc/sshmount/sshmount.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `sshmountd` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Start recovery, auto-connect, and unmount everything on Ctrl-C.
    Run,
    /// Validate the config file and list the remotes.
    Check,
    /// Probe every remote once and print diagnostics as JSON.
    Status,
    /// Mount a remote on a throwaway mount point and tear it down again.
    Test {
        /// Remote name from the config file.
        remote: String,
    },
}

impl Cli {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load_config(&self) -> Result<SshmountConfig> {
        if self.config.exists() {
            Ok(SshmountConfig::from_file(&self.config)?)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", self.config.display());
            Ok(SshmountConfig::default())
        }
    }

    /// Dispatch the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Run => serve(config).await,
            Command::Check => check(&config),
            Command::Status => status(config).await,
            Command::Test { ref remote } => test(&config, remote).await,
        }
    }
}

async fn serve(config: SshmountConfig) -> Result<()> {
    let service = MountService::new(&config, Collaborators::system(&config));
    let recovery = service.start_recovery();

    for (remote_id, outcome) in service.startup().await {
        tracing::info!(remote_id = %remote_id, outcome = ?outcome, "startup connect finished");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    recovery.stop().await;

    for (remote_id, outcome) in service.terminate().await {
        match outcome {
            SubmitOutcome::Completed(status) => {
                tracing::info!(remote_id = %remote_id, state = %status.state, "unmounted at shutdown")
            }
            other => tracing::warn!(remote_id = %remote_id, outcome = ?other, "unmount at shutdown incomplete"),
        }
    }
    Ok(())
}

fn check(config: &SshmountConfig) -> Result<()> {
    println!("config ok: {} remote(s)", config.remotes.len());
    for remote in &config.remotes {
        let auth = match &remote.auth {
            AuthMode::Password => "password".to_string(),
            AuthMode::PrivateKey { identity_file } => format!("key {}", identity_file.display()),
        };
        println!(
            "  {:<20} {}@{}:{} -> {} ({}{})",
            remote.name,
            remote.username,
            remote.host,
            remote.port,
            remote.mount_point.display(),
            auth,
            if remote.auto_connect { ", auto-connect" } else { "" }
        );
    }
    Ok(())
}

async fn status(config: SshmountConfig) -> Result<()> {
    let service = MountService::new(&config, Collaborators::system(&config));
    join_all(config.remotes.iter().map(|r| service.refresh_status(r.id))).await;
    println!("{}", service.diagnostics().to_json_pretty()?);
    Ok(())
}

async fn test(config: &SshmountConfig, name: &str) -> Result<()> {
    let remote = config
        .remote_by_name(name)
        .cloned()
        .ok_or_else(|| anyhow!("no remote named '{name}' in config"))?;
    let service = MountService::new(config, Collaborators::system(config));

    match service.test_connection(remote).await {
        SubmitOutcome::Tested(report) if report.success => {
            println!("ok: {} ({} ms)", report.message, report.elapsed.as_millis());
            Ok(())
        }
        SubmitOutcome::Tested(report) => Err(anyhow!("test failed: {}", report.message)),
        SubmitOutcome::TimedOut(status) => Err(anyhow!(
            "test failed: {}",
            status.last_error.unwrap_or_default()
        )),
        other => Err(anyhow!("test did not run: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_test_subcommand() {
        let cli = Cli::parse_from(["sshmountd", "--config", "/tmp/s.toml", "--json", "test", "media"]);
        assert!(cli.json);
        assert_eq!(cli.config, PathBuf::from("/tmp/s.toml"));
        assert!(matches!(cli.command, Command::Test { ref remote } if remote == "media"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let cli = Cli::parse_from(["sshmountd", "--config", "/nonexistent/sshmount.toml", "check"]);
        let config = cli.load_config().unwrap();
        assert!(config.remotes.is_empty());
    }
}
