//! Mermaid call graph derived from `node_start` events, grouped by chapter

use super::event::{Event, EventType};
use std::collections::BTreeMap;

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Render a `flowchart TD` with one subgraph per chapter (0 = materials).
/// Consecutive nodes within a chapter are linked in event order; repeated
/// node names are collapsed.
pub fn call_graph_by_chapter<'a>(events: impl IntoIterator<Item = &'a Event>) -> String {
    let mut chapters: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for event in events {
        if event.event_type != EventType::NodeStart || event.node.is_empty() {
            continue;
        }
        let nodes = chapters.entry(event.chapter).or_default();
        if nodes.last() != Some(&event.node) {
            nodes.push(event.node.clone());
        }
    }

    let mut out = String::from("flowchart TD\n");
    for (chapter, nodes) in &chapters {
        let title = if *chapter == 0 {
            "materials".to_string()
        } else {
            format!("chapter {}", chapter)
        };
        out.push_str(&format!("  subgraph c{}[\"{}\"]\n", chapter, title));
        let mut edges: Vec<(String, String)> = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            out.push_str(&format!("    c{}_{}[\"{}\"]\n", chapter, sanitize(node), node));
            if i > 0 {
                let edge = (sanitize(&nodes[i - 1]), sanitize(node));
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }
        for (from, to) in edges {
            out.push_str(&format!("    c{c}_{} --> c{c}_{}\n", from, to, c = chapter));
        }
        out.push_str("  end\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(seq: u64, chapter: u32, name: &str) -> Event {
        Event {
            event_id: format!("e{}", seq),
            run_id: "run-0001-aaaaaaaa".to_string(),
            project: "alpha".to_string(),
            seq,
            ts: String::new(),
            stage: "stage1".to_string(),
            phase: String::new(),
            chapter,
            node: name.to_string(),
            event_type: EventType::NodeStart,
            fields: Default::default(),
            payloads: BTreeMap::new(),
        }
    }

    #[test]
    fn test_graph_groups_by_chapter() {
        let events = vec![
            node(1, 0, "materials.produce"),
            node(2, 0, "materials.review"),
            node(3, 1, "unit.write"),
            node(4, 1, "unit.review"),
            node(5, 1, "unit.write"),
            node(6, 1, "unit.review"),
        ];
        let graph = call_graph_by_chapter(&events);
        assert!(graph.starts_with("flowchart TD\n"));
        assert!(graph.contains("subgraph c0[\"materials\"]"));
        assert!(graph.contains("subgraph c1[\"chapter 1\"]"));
        assert!(graph.contains("c0_materials_produce --> c0_materials_review"));
        assert_eq!(graph.matches("c1_unit_write --> c1_unit_review").count(), 1);
        assert!(graph.contains("c1_unit_review --> c1_unit_write"));
    }
}
