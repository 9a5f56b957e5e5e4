use super::Target;
use crate::gate::write_decision_file;
use crate::models::RawDecision;
use crate::Result;
use anyhow::{bail, Context};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct DecideArgs {
    /// Gate to decide (see 'inkgate status')
    pub gate_id: String,

    /// Action from the gate's vocabulary
    pub action: Option<String>,

    /// Why this decision was taken
    #[arg(short, long)]
    pub rationale: Option<String>,

    /// Anchor, unit or issue id backing the decision (repeatable)
    #[arg(long = "ref")]
    pub references: Vec<String>,

    /// Rewrite or revision instruction (repeatable)
    #[arg(short, long = "instruction")]
    pub instructions: Vec<String>,

    /// Review issue id to waive (repeatable)
    #[arg(long = "issue")]
    pub issues: Vec<String>,

    /// Open question answer as ID=TEXT (repeatable)
    #[arg(long = "answer")]
    pub answers: Vec<String>,

    /// Read the whole decision from a YAML file instead
    #[arg(long, conflicts_with = "action")]
    pub file: Option<PathBuf>,
}

fn build(args: &DecideArgs) -> Result<RawDecision> {
    if let Some(file) = &args.file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read decision file {}", file.display()))?;
        return Ok(serde_yaml::from_str(&content)?);
    }
    let Some(action) = &args.action else {
        bail!("Either an action or --file is required");
    };
    let mut raw = RawDecision::new(action.as_str());
    raw.rationale = args.rationale.clone().unwrap_or_default();
    raw.references = args.references.clone();
    raw.instructions = args.instructions.clone();
    raw.issues = args.issues.clone();
    for answer in &args.answers {
        let Some((id, text)) = answer.split_once('=') else {
            bail!("--answer expects ID=TEXT, got '{}'", answer);
        };
        raw.answers.insert(id.trim().to_string(), text.trim().to_string());
    }
    Ok(raw)
}

pub fn run(target: &Target, args: DecideArgs) -> Result<()> {
    let raw = build(&args)?;
    let path = write_decision_file(&target.paths(), &target.project, &args.gate_id, &raw)?;
    println!(
        "{}",
        format!("✅ Decision '{}' recorded for {}", raw.action, args.gate_id).green().bold()
    );
    println!("   File: {}", path.display());
    println!("   Resume with: inkgate run --project {}", target.project);
    Ok(())
}
