//! Audit log maintenance commands

use super::Target;
use crate::audit::{all_events, call_graph_by_chapter, rebuild_index, verify_run};
use crate::context::RunId;
use crate::store::ProjectPaths;
use crate::Result;
use anyhow::bail;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum LogCommands {
    /// Check the index stream and payload hashes of a run
    Verify {
        /// Run directory name (defaults to every run)
        run: Option<String>,
    },

    /// Rebuild a run's index stream from its event stream
    RebuildIndex {
        /// Run directory name (defaults to every run)
        run: Option<String>,
    },

    /// Render the Mermaid call graph grouped by chapter
    Graph {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn runs(paths: &ProjectPaths, run: Option<&str>) -> Result<Vec<RunId>> {
    Ok(match run {
        Some(name) => vec![paths.find_run(name)?],
        None => paths.list_runs()?,
    })
}

pub fn run(target: &Target, cmd: LogCommands) -> Result<()> {
    let paths = target.paths();
    let caller = &target.project;

    match cmd {
        LogCommands::Verify { run } => {
            let mut dirty = 0;
            for run in runs(&paths, run.as_deref())? {
                let report = verify_run(&paths, caller, &run)?;
                if report.is_clean() {
                    println!("   {} {} ({} events)", "✓".green(), run, report.events);
                } else {
                    dirty += 1;
                    println!("   {} {} ({} events)", "✗".red(), run, report.events);
                    if report.index_len != report.events {
                        println!("     index has {} records", report.index_len);
                    }
                    for seq in &report.index_mismatches {
                        println!("     index mismatch at seq {}", seq);
                    }
                    for payload in &report.bad_payloads {
                        println!("     bad payload {}", payload);
                    }
                }
            }
            if dirty > 0 {
                bail!("{} run(s) failed verification; 'inkgate log rebuild-index' repairs the index", dirty);
            }
        }
        LogCommands::RebuildIndex { run } => {
            for run in runs(&paths, run.as_deref())? {
                let count = rebuild_index(&paths, caller, &run)?;
                println!("   {} {} ({} records)", "Rebuilt".green(), run, count);
            }
        }
        LogCommands::Graph { output } => {
            let events = all_events(&paths, caller)?;
            let graph = call_graph_by_chapter(events.iter().map(|(_, e)| e));
            match output {
                Some(path) => {
                    std::fs::write(&path, graph)?;
                    println!("   {} {}", "Wrote".green(), path.display());
                }
                None => print!("{}", graph),
            }
        }
    }
    Ok(())
}
