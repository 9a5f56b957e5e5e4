//! Command-line surface
//!
//! Each subcommand resolves the workspace and project, builds a validated
//! [`EngineConfig`] and hands over to the library. Nothing here touches
//! artifacts directly.

pub mod archive;
pub mod decide;
pub mod init;
pub mod log;
pub mod propose;
pub mod run;
pub mod status;

use crate::engine::Engine;
use crate::gate::FileDecisionSource;
use crate::models::EngineConfig;
use crate::orchestrator::CommandCapability;
use crate::store::{ProjectPaths, Workspace};
use crate::ProjectId;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::Path;

/// Resolved workspace, project and configuration
pub struct Target {
    pub workspace: Workspace,
    pub project: ProjectId,
    pub config: EngineConfig,
}

impl Target {
    /// Resolve `--project`, falling back to the only project in the workspace
    pub fn open(workspace: &Path, project: Option<&str>) -> Result<Self> {
        let config = EngineConfig::load(workspace)
            .with_context(|| format!("Failed to load config from {}", workspace.display()))?;
        let ws = Workspace::new(workspace);
        let project = match project {
            Some(name) => ProjectId::new(name)?,
            None => {
                let mut projects = ws.list_projects()?;
                match projects.len() {
                    1 => projects.remove(0),
                    0 => bail!("No project found. Run 'inkgate init --project <name>' first."),
                    _ => bail!("Several projects found; pass --project <name>"),
                }
            }
        };
        let paths = ws.project(&project);
        if !paths.exists() {
            bail!("Project '{}' not found in {}", project, workspace.display());
        }
        Ok(Self {
            workspace: ws,
            project,
            config,
        })
    }

    pub fn paths(&self) -> ProjectPaths {
        self.workspace.project(&self.project)
    }

    /// Start a run with the configured producer commands and file decisions
    pub fn start(&self, config: EngineConfig) -> Result<Engine> {
        let capability = CommandCapability::from_config(&config)?.with_progress(true);
        let missing = capability.missing_roles();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|r| r.as_str()).collect();
            tracing::warn!(roles = %names.join(", "), "no producer command configured");
        }
        let decisions = FileDecisionSource::new(self.paths());
        let engine = Engine::start(
            &self.workspace,
            self.project.clone(),
            config,
            Box::new(capability),
            Box::new(decisions),
        )
        .with_context(|| format!("Failed to start a run for '{}'", self.project))?;
        println!(
            "{}",
            format!("▶ {} {}", self.project, engine.run_id()).cyan().bold()
        );
        Ok(engine)
    }
}
