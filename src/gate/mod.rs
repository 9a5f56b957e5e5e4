//! Gate predicates and human decision gates

pub mod controller;
pub mod dod;

pub use controller::{write_decision_file, DecisionSource, FileDecisionSource, GateController, GateKind, GateRecord, GateRequest};
pub use dod::{evaluate, freeze_predicates, DodIssue, DodReport, Severity};
