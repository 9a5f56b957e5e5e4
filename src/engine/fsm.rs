//! State machine definitions
//!
//! Each machine is a transition table over closed state and action enums.
//! [`step`] is the only way to move; an action that is not defined from the
//! current state is an [`EngineError::IllegalTransition`] and never coerced.

use crate::error::{EngineError, EngineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub trait Machine {
    const NAME: &'static str;
    type State: Copy + Eq + Debug + Serialize + DeserializeOwned;
    type Action: Copy + Eq + Debug + Serialize;

    fn initial() -> Self::State;
    fn next(state: Self::State, action: Self::Action) -> Option<Self::State>;
    fn is_terminal(state: Self::State) -> bool;
}

/// Apply `action` to `state` or fail with the offending pair
pub fn step<M: Machine>(state: M::State, action: M::Action) -> EngineResult<M::State> {
    M::next(state, action).ok_or_else(|| EngineError::illegal(M::NAME, state, action))
}

/// snake_case name of a state or action
pub fn name_of<T: Serialize + Debug>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => format!("{:?}", value),
    }
}

// =============================================================================
// Materials
// =============================================================================

pub struct MaterialsMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialsState {
    Intake,
    Draft,
    AgentReviewLoop,
    HumanReviewGate,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialsAction {
    /// Producer writes draft v1
    Produce,
    /// First agent review of the draft
    Review,
    /// Revise from the agent review and review again
    NeedsAnotherRound,
    /// Hand the reviewed draft to the human gate
    RequestHuman,
    Freeze,
    Revise,
    AnswerQuestions,
}

impl Machine for MaterialsMachine {
    const NAME: &'static str = "materials";
    type State = MaterialsState;
    type Action = MaterialsAction;

    fn initial() -> MaterialsState {
        MaterialsState::Intake
    }

    fn next(state: MaterialsState, action: MaterialsAction) -> Option<MaterialsState> {
        use MaterialsAction as A;
        use MaterialsState as S;
        match (state, action) {
            (S::Intake, A::Produce) => Some(S::Draft),
            (S::Draft, A::Review) => Some(S::AgentReviewLoop),
            (S::AgentReviewLoop, A::NeedsAnotherRound) => Some(S::AgentReviewLoop),
            (S::AgentReviewLoop, A::RequestHuman) => Some(S::HumanReviewGate),
            (S::HumanReviewGate, A::Freeze) => Some(S::Frozen),
            (S::HumanReviewGate, A::Revise) => Some(S::AgentReviewLoop),
            (S::HumanReviewGate, A::AnswerQuestions) => Some(S::AgentReviewLoop),
            _ => None,
        }
    }

    fn is_terminal(state: MaterialsState) -> bool {
        state == MaterialsState::Frozen
    }
}

// =============================================================================
// Unit
// =============================================================================

/// Per-chapter production cycle. `NextChapter` ends the chapter's cycle; the
/// run loop starts the following chapter at `Draft`.
pub struct UnitMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Draft,
    AgentReview,
    HumanReviewGate,
    RewriteLoop,
    Deposit,
    Suspended,
    NextChapter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    Write,
    Review,
    Accept,
    RequestRewrite,
    Rewrite,
    Waive,
    Escalate,
    Resume,
    DepositMemory,
}

impl Machine for UnitMachine {
    const NAME: &'static str = "unit";
    type State = UnitState;
    type Action = UnitAction;

    fn initial() -> UnitState {
        UnitState::Draft
    }

    fn next(state: UnitState, action: UnitAction) -> Option<UnitState> {
        use UnitAction as A;
        use UnitState as S;
        match (state, action) {
            (S::Draft, A::Write) => Some(S::AgentReview),
            (S::AgentReview, A::Review) => Some(S::HumanReviewGate),
            (S::HumanReviewGate, A::Accept) => Some(S::Deposit),
            (S::HumanReviewGate, A::RequestRewrite) => Some(S::RewriteLoop),
            (S::HumanReviewGate, A::Waive) => Some(S::NextChapter),
            (S::HumanReviewGate, A::Escalate) => Some(S::Suspended),
            (S::RewriteLoop, A::Rewrite) => Some(S::AgentReview),
            (S::Deposit, A::DepositMemory) => Some(S::NextChapter),
            (S::Suspended, A::Resume) => Some(S::HumanReviewGate),
            _ => None,
        }
    }

    fn is_terminal(state: UnitState) -> bool {
        state == UnitState::NextChapter
    }
}

// =============================================================================
// Change proposal
// =============================================================================

pub struct ProposalMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    DraftProposal,
    AdvisorReview,
    HumanDecision,
    Migration,
    ReFreeze,
    Closed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    Advise,
    RequestDecision,
    Approve,
    Reject,
    Migrate,
    Refreeze,
}

impl Machine for ProposalMachine {
    const NAME: &'static str = "proposal";
    type State = ProposalState;
    type Action = ProposalAction;

    fn initial() -> ProposalState {
        ProposalState::DraftProposal
    }

    fn next(state: ProposalState, action: ProposalAction) -> Option<ProposalState> {
        use ProposalAction as A;
        use ProposalState as S;
        match (state, action) {
            (S::DraftProposal, A::Advise) => Some(S::AdvisorReview),
            (S::AdvisorReview, A::RequestDecision) => Some(S::HumanDecision),
            (S::HumanDecision, A::Approve) => Some(S::Migration),
            (S::HumanDecision, A::Reject) => Some(S::Rejected),
            (S::Migration, A::Migrate) => Some(S::ReFreeze),
            (S::ReFreeze, A::Refreeze) => Some(S::Closed),
            _ => None,
        }
    }

    fn is_terminal(state: ProposalState) -> bool {
        matches!(state, ProposalState::Closed | ProposalState::Rejected)
    }
}
