use super::Target;
use crate::audit::all_events;
use crate::engine::replay::CycleTable;
use crate::gate::GateController;
use crate::models::ProposalRecord;
use crate::state::{ContinuationStatus, ContinuationStore, ProjectLock, RunMeta};
use crate::store::{ArtifactStore, ProjectPaths};
use crate::Result;
use colored::Colorize;
use serde_json::json;

fn proposals(paths: &ProjectPaths) -> Result<Vec<ProposalRecord>> {
    let dir = paths.changes_dir();
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let file = entry?.path().join("proposal.json");
        if file.is_file() {
            out.push(serde_json::from_slice(&std::fs::read(&file)?)?);
        }
    }
    out.sort_by(|a: &ProposalRecord, b| a.id.cmp(&b.id));
    Ok(out)
}

/// Read-only view of a project; never takes the lock
pub fn run(target: &Target, as_json: bool) -> Result<()> {
    let paths = target.paths();
    let caller = &target.project;

    let history = all_events(&paths, caller)?;
    let cycles = CycleTable::replay(&history)?;
    let frozen = ArtifactStore::open(paths.clone()).frozen_version(caller)?;
    let holder = ProjectLock::holder(&paths)?;
    let last_run = match paths.list_runs()?.last() {
        Some(run) => RunMeta::load(&paths, caller, run)?,
        None => None,
    };
    let gates = GateController::new(paths.clone()).pending(caller)?;
    let continuations = ContinuationStore::new(paths.clone()).list(caller)?;
    let proposals = proposals(&paths)?;

    if as_json {
        let value = json!({
            "project": caller.as_str(),
            "frozen_version": frozen,
            "lock": holder,
            "last_run": last_run,
            "cycles": cycles.cycles().collect::<Vec<_>>(),
            "open_gates": gates,
            "continuations": continuations,
            "proposals": proposals
                .iter()
                .map(|p| json!({"id": p.id, "state": p.state, "target_version": p.target_version, "halted": p.halted}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", format!("Status for: {}", caller).cyan().bold());
    println!();
    match frozen {
        Some(v) => println!("   Frozen:    {}", format!("v{:03}", v).green()),
        None => println!("   Frozen:    {}", "not yet".bright_black()),
    }
    if let Some(meta) = &last_run {
        let status = format!("{:?}", meta.status);
        let colored = match meta.status {
            crate::state::RunStatus::Completed => status.green(),
            crate::state::RunStatus::Halted => status.red(),
            crate::state::RunStatus::Running => status.blue(),
            _ => status.yellow(),
        };
        println!("   Last run:  {} {}", meta.run_id, colored);
    }
    if let Some(lock) = &holder {
        println!(
            "   Lock:      {} (pid {}, heartbeat {})",
            lock.run_id,
            lock.pid,
            lock.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!();
    println!("{}", "Cycles".bold());
    let mut any = false;
    for snap in cycles.cycles() {
        any = true;
        let state = snap.state.as_str().unwrap_or("?");
        println!(
            "   {:<24} {:<10} {:<22} round {} v{:03}",
            snap.cycle, snap.machine, state, snap.round, snap.version
        );
    }
    if !any {
        println!("   {}", "none".bright_black());
    }

    if !gates.is_empty() {
        println!();
        println!("{}", "Open gates".bold());
        for gate in &gates {
            println!("   {} {}", "●".yellow(), gate.gate_id.yellow());
            println!("     subject: {}", gate.subject);
            if !gate.summary.is_empty() {
                println!("     {}", gate.summary);
            }
            println!("     actions: {}", gate.vocabulary.join(" | "));
        }
    }

    let suspended: Vec<_> = continuations
        .iter()
        .filter(|c| !matches!(c.status, ContinuationStatus::Resumed { .. }))
        .collect();
    if !suspended.is_empty() {
        println!();
        println!("{}", "Suspended cycles".bold());
        for c in suspended {
            println!(
                "   {} waiting on {}",
                c.cycle,
                c.proposal_id.as_deref().unwrap_or("a proposal")
            );
        }
    }

    if !proposals.is_empty() {
        println!();
        println!("{}", "Change proposals".bold());
        for p in &proposals {
            let halted = if p.halted.is_some() { " (halted)".red().to_string() } else { String::new() };
            println!("   {} {:?} → v{:03}{}", p.id, p.state, p.target_version, halted);
        }
    }
    Ok(())
}
