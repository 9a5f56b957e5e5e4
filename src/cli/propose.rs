use super::Target;
use crate::models::ProposalInput;
use crate::Result;
use anyhow::Context;
use colored::Colorize;
use std::path::Path;

/// Submit a change proposal from a YAML or JSON file and run it to its gate
pub fn run(target: &Target, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read proposal file {}", file.display()))?;
    let input: ProposalInput = serde_yaml::from_str(&content)
        .with_context(|| format!("Invalid proposal in {}", file.display()))?;

    let mut engine = target.start(target.config.clone())?;
    let result = (|| {
        let record = engine.proposals().submit(input)?;
        let outcome = engine.proposals().drive(&record.id)?;
        Ok::<_, crate::EngineError>((record, outcome))
    })();
    engine.finish()?;
    let (record, outcome) = result?;

    println!("{}", format!("📝 Submitted {}", record.id).green().bold());
    println!("   Target:  v{:03}", record.target_version);
    println!("   What:    {}", record.what);
    println!("   Outcome: {}", serde_json::to_string(&outcome)?);
    Ok(())
}
