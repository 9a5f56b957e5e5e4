use super::Target;
use crate::Result;
use colored::Colorize;

/// Archive a finished run (the latest one by default) into its stage
pub fn run(target: &Target, run: Option<&str>, yes: bool) -> Result<()> {
    let paths = target.paths();
    let archived = match run {
        Some(name) => paths.find_run(name)?,
        None => paths
            .list_runs()?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No runs to archive"))?,
    };
    if !yes {
        println!("{}", "⚠️  Archiving copies the run log and session into stages/".yellow());
        println!("   Re-run with --yes to confirm");
        return Ok(());
    }

    let mut engine = target.start(target.config.clone())?;
    let result = engine.archive(&archived, yes);
    engine.finish()?;
    let dest = result?;
    println!("{}", format!("📦 Archived {}", archived).green().bold());
    println!("   {}", dest.display());
    Ok(())
}
