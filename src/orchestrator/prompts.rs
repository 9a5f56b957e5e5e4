/// Instruction templates handed to producer and reviewer capabilities
///
/// Each capability call carries a short instruction text plus a structured
/// JSON context. The templates here only describe the task and the expected
/// output shape; everything the capability needs to read travels in the
/// context.

/// Materials author: first draft from the project brief
pub fn draft_materials_prompt(project: &str) -> String {
    format!(
        r#"## Project
{project}

## Task
Draft the materials pack for this project from the brief in `context.brief`.

## Output
Return one JSON object with these four layers, all objects:
- `canon`: world (with `rules`), characters (with `characters`), timeline (with `events`), style
- `planning`: outline (with a non-empty `chapters` list), tone
- `execution`: decisions (list), checklists, glossary, constraints (non-empty)
- `risk`: open_questions (list of {{id, question, severity, blocking, default_assumption}}), conflicts, risks

Mark a question `severity: "blocker"` only when production cannot start without an answer.
"#,
        project = project
    )
}

/// Materials reviewer: structured review of one draft version
pub fn review_materials_prompt(version: u32, round: u32) -> String {
    format!(
        r#"## Draft
materials_pack v{version:03} (review round {round})

## Task
Review the draft in `context.pack`. `context.dod` lists the structural issues already found.

## Output
Return `{{"verdict": "pass" | "needs_changes", "summary": "...", "issues": [...]}}`.
Every issue needs a unique `id`, a `severity`, a `kind` and a `description`.
Use `kind: "glossary"` for terminology drift and list the anchors an issue refers to in `anchors`.
"#,
        version = version,
        round = round
    )
}

/// Materials author: revise a draft from review findings or a human instruction
pub fn revise_materials_prompt(version: u32, instructions: &[String]) -> String {
    let list = instructions
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"## Draft
materials_pack v{version:03}

## Revision Instructions
{list}

## Task
Apply the instructions to `context.pack` and return the complete revised pack as one JSON object.
Keep every existing `anchor` field unchanged.
"#,
        version = version,
        list = list
    )
}

/// Writer: first draft of a unit against the frozen materials
pub fn write_unit_prompt(chapter: u32, frozen_version: u32) -> String {
    format!(
        r#"## Unit
Chapter {chapter}

## Materials
Frozen materials v{frozen_version:03} are in `context.materials`. Treat them as read-only.

## Output
Return `{{"text": "...", "summary": "..."}}`.
"#,
        chapter = chapter,
        frozen_version = frozen_version
    )
}

/// Editor: structured review of a unit draft
pub fn review_unit_prompt(chapter: u32, round: u32) -> String {
    format!(
        r#"## Unit
Chapter {chapter}, draft round {round}

## Task
Review `context.text` against the frozen materials in `context.materials`.

## Output
Return `{{"verdict": "pass" | "needs_changes", "summary": "...", "issues": [...]}}`.
Reference materials entries by anchor id (e.g. `WR-002`) in each issue's `anchors`.
"#,
        chapter = chapter,
        round = round
    )
}

/// Writer: rewrite a unit following human instructions
pub fn rewrite_unit_prompt(chapter: u32, round: u32, instructions: &[String]) -> String {
    let list = instructions
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"## Unit
Chapter {chapter}, rewrite of round {round}

## Rewrite Instructions
{list}

## Output
Return `{{"text": "...", "summary": "..."}}` with the full rewritten text.
"#,
        chapter = chapter,
        round = round,
        list = list
    )
}

/// Advisor: turn an escalation into a change proposal
pub fn draft_proposal_prompt(chapter: u32, gate_id: &str, reason: &str) -> String {
    format!(
        r#"## Escalation
Gate {gate_id} (chapter {chapter})

## Reason
{reason}

## Task
The frozen materials need an upstream change. Draft a change proposal against `context.materials`.

## Output
Return `{{"what", "why", "impact", "migration_plan", "alternatives", "evidence"}}`.
`migration_plan` is a list of steps `{{"id", "description", "op": "set" | "append" | "remove", "path", "value"}}`
whose paths start with canon, planning, execution or risk.
`evidence` lists anchor ids, unit ids (`unit-003`) or issues (`unit-003#ISS-1`).
"#,
        gate_id = gate_id,
        chapter = chapter,
        reason = reason
    )
}

/// Advisor: review a submitted proposal before the human decides
pub fn review_proposal_prompt(proposal_id: &str, target_version: u32) -> String {
    format!(
        r#"## Proposal
{proposal_id} targeting frozen materials v{target_version:03}

## Task
Assess `context.proposal` against `context.materials`. You may not modify anything.

## Output
Return `{{"recommendation": "approve" | "reject", "notes": "...", "risks": [...]}}`.
"#,
        proposal_id = proposal_id,
        target_version = target_version
    )
}
