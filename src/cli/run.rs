use super::Target;
use crate::engine::{CycleOutcome, RunSummary};
use crate::Result;
use clap::Args;
use colored::Colorize;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Number of units to produce
    #[arg(long)]
    pub chapters: Option<u32>,

    /// Rewrite rounds allowed per unit
    #[arg(long)]
    pub rewrite_budget: Option<u32>,

    /// Archive the run into its stage when it ends
    #[arg(long)]
    pub auto_archive: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(target: &Target, args: RunArgs) -> Result<()> {
    let mut config = target.config.clone();
    if let Some(chapters) = args.chapters {
        anyhow::ensure!(chapters > 0, "--chapters must be at least 1");
        config.run.chapters = chapters;
    }
    if let Some(budget) = args.rewrite_budget {
        config.workflow.max_rewrite_rounds = budget;
    }
    if args.auto_archive {
        config.run.auto_archive = true;
    }

    let mut engine = target.start(config)?;
    let result = engine.run();
    engine.finish()?;
    let summary = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    match summary.frozen_version {
        Some(v) => println!("   Frozen:    v{:03}", v),
        None => println!("   Frozen:    {}", "not yet".bright_black()),
    }
    if !summary.chapters_completed.is_empty() {
        let done: Vec<String> = summary.chapters_completed.iter().map(|c| c.to_string()).collect();
        println!("   Completed: {}", done.join(", "));
    }
    match &summary.stopped {
        None => println!("{}", "✅ All planned cycles completed".green().bold()),
        Some(CycleOutcome::Completed) => println!("{}", "✅ Completed".green().bold()),
        Some(CycleOutcome::AwaitingDecision { gate_id }) => {
            println!("{}", format!("⏸  Waiting on gate {}", gate_id).yellow().bold());
            println!("   Decide with: inkgate decide {} <action> -r \"<rationale>\"", gate_id);
        }
        Some(CycleOutcome::Suspended { proposal_id }) => {
            println!("{}", format!("⏸  Suspended on change proposal {}", proposal_id).yellow().bold());
            println!("   Decide with: inkgate decide {}-approval approve|reject -r \"<rationale>\"", proposal_id);
        }
    }
}
