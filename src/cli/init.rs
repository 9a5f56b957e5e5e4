use crate::models::{EngineConfig, CONFIG_FILE};
use crate::store::Workspace;
use crate::{ProjectId, Result};
use anyhow::Context;
use colored::Colorize;
use std::path::Path;

const BRIEF_TEMPLATE: &str = r#"# Brief

## Premise

## World

## Characters

## Tone

## Constraints
"#;

pub fn run(workspace: &Path, project: &str, brief: Option<&Path>) -> Result<()> {
    let project = ProjectId::new(project)?;
    let ws = Workspace::new(workspace);
    let paths = ws.project(&project);

    if !workspace.join(CONFIG_FILE).exists() {
        EngineConfig::default().save(workspace)?;
        println!("   {} {}", "Created".green(), CONFIG_FILE);
    }

    let existed = paths.exists();
    paths.ensure_layout()?;

    match brief {
        Some(source) => {
            std::fs::copy(source, paths.brief_path())
                .with_context(|| format!("Failed to copy brief from {}", source.display()))?;
            println!("   {} brief.md from {}", "Copied".green(), source.display());
        }
        None if !paths.brief_path().exists() => {
            std::fs::write(paths.brief_path(), BRIEF_TEMPLATE)?;
            println!("   {} brief.md (template)", "Created".green());
        }
        None => {}
    }

    if existed {
        println!("{}", format!("Project '{}' already initialized; layout checked", project).yellow());
    } else {
        println!("{}", format!("✅ Project '{}' initialized", project).green().bold());
    }
    println!("   Edit {} then run 'inkgate run --project {}'", paths.brief_path().display(), project);
    Ok(())
}
