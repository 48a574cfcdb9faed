//! KS-026: `install` steps.
//!
//! Adds packages with the project's package manager. The manager is taken
//! from the step or detected from lockfiles in the working directory; the
//! command itself goes through the shell runner.

use super::shell::{check_exit, run_command};
use super::{config, config_report, RetryBackoff, Tool, ToolContext, ToolOutput};
use crate::core::types::{Step, ToolKind, ValidationReport};
use crate::error::ToolError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Bun,
    Pnpm,
    Yarn,
    Npm,
    Cargo,
    Pip,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bun => "bun",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Npm => "npm",
            Self::Cargo => "cargo",
            Self::Pip => "pip",
        };
        f.write_str(s)
    }
}

/// Lockfiles checked in priority order.
const LOCKFILES: &[(&str, PackageManager)] = &[
    ("bun.lockb", PackageManager::Bun),
    ("bun.lock", PackageManager::Bun),
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("package-lock.json", PackageManager::Npm),
    ("Cargo.toml", PackageManager::Cargo),
    ("requirements.txt", PackageManager::Pip),
    ("pyproject.toml", PackageManager::Pip),
    ("package.json", PackageManager::Npm),
];

/// Detect the package manager for a project directory.
pub fn detect(dir: &Path) -> Option<PackageManager> {
    LOCKFILES
        .iter()
        .find(|(file, _)| dir.join(file).exists())
        .map(|(_, pm)| *pm)
}

/// The install command line for `packages`.
pub fn command_line(pm: PackageManager, packages: &[String], dev: bool) -> String {
    let pkgs = packages.join(" ");
    match (pm, dev) {
        (PackageManager::Bun, false) => format!("bun add {}", pkgs),
        (PackageManager::Bun, true) => format!("bun add -d {}", pkgs),
        (PackageManager::Pnpm, false) => format!("pnpm add {}", pkgs),
        (PackageManager::Pnpm, true) => format!("pnpm add -D {}", pkgs),
        (PackageManager::Yarn, false) => format!("yarn add {}", pkgs),
        (PackageManager::Yarn, true) => format!("yarn add -D {}", pkgs),
        (PackageManager::Npm, false) => format!("npm install {}", pkgs),
        (PackageManager::Npm, true) => format!("npm install --save-dev {}", pkgs),
        (PackageManager::Cargo, false) => format!("cargo add {}", pkgs),
        (PackageManager::Cargo, true) => format!("cargo add --dev {}", pkgs),
        (PackageManager::Pip, _) => format!("pip install {}", pkgs),
    }
}

#[derive(Debug, Deserialize)]
struct InstallConfig {
    packages: Vec<String>,
    #[serde(default)]
    dev: bool,
    #[serde(default)]
    manager: Option<PackageManager>,
}

pub struct InstallTool;

#[async_trait]
impl Tool for InstallTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Install
    }

    fn validate(&self, step: &Step, _ctx: &ToolContext) -> ValidationReport {
        let (cfg, mut report) = config_report::<InstallConfig>(step);
        if let Some(cfg) = cfg {
            if cfg.packages.is_empty() {
                report.warnings.push("install step lists no packages".to_string());
            }
        }
        report
    }

    async fn execute(&self, step: &Step, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let cfg: InstallConfig = config(step)?;
        if cfg.packages.is_empty() {
            return Ok(ToolOutput::default().message("nothing to install"));
        }
        let packages = cfg
            .packages
            .iter()
            .map(|p| ctx.interpolate(p))
            .collect::<Result<Vec<_>, _>>()?;
        let pm = match cfg.manager {
            Some(pm) => pm,
            None => detect(&ctx.cwd).ok_or_else(|| {
                ToolError::Failed(format!(
                    "cannot detect a package manager in {}; set 'manager'",
                    ctx.cwd.display()
                ))
            })?,
        };
        let command = command_line(pm, &packages, cfg.dev);

        let output = json!({"manager": pm.to_string(), "packages": packages, "command": command});
        if ctx.dry_run {
            return Ok(ToolOutput::default()
                .with_output(output)
                .message(format!("would run: {}", command)));
        }
        let out = run_command(&command, &ctx.cwd, &BTreeMap::new(), ctx).await?;
        check_exit(&command, &out)?;
        Ok(ToolOutput::default()
            .with_output(output)
            .message(format!("installed {} package(s) with {}", packages.len(), pm)))
    }

    fn backoff(&self) -> RetryBackoff {
        RetryBackoff::NETWORK
    }
}
