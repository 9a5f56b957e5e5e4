//! Append-only audit log
//!
//! Two streams per run: the full event stream and a derived index stream.
//! Large fields live in a content-addressed payload area and are referenced
//! by path, size and hash.

pub mod event;
pub mod graph;
pub mod log;
pub mod payload;

pub use event::{Event, EventDraft, EventType, IndexRecord, PayloadRef};
pub use graph::call_graph_by_chapter;
pub use log::{all_events, read_events, read_index, rebuild_index, verify_run, AuditLog, VerifyReport, EVENTS_FILE, INDEX_FILE};
