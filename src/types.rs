//! Core types for the task settlement engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored or submitted enum string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle status of a task.
///
/// `Draft` only exists as the `from_status` of the synthesized POST event;
/// tasks are stored already `Posted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Draft,
    Posted,
    Matched,
    Escrowed,
    Accepted,
    InProgress,
    ProofSubmitted,
    Verified,
    Paid,
    Closed,
    TimedOut,
    Refunded,
    ProofRejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 13] = [
        TaskStatus::Draft,
        TaskStatus::Posted,
        TaskStatus::Matched,
        TaskStatus::Escrowed,
        TaskStatus::Accepted,
        TaskStatus::InProgress,
        TaskStatus::ProofSubmitted,
        TaskStatus::Verified,
        TaskStatus::Paid,
        TaskStatus::Closed,
        TaskStatus::TimedOut,
        TaskStatus::Refunded,
        TaskStatus::ProofRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "DRAFT",
            TaskStatus::Posted => "POSTED",
            TaskStatus::Matched => "MATCHED",
            TaskStatus::Escrowed => "ESCROWED",
            TaskStatus::Accepted => "ACCEPTED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::ProofSubmitted => "PROOF_SUBMITTED",
            TaskStatus::Verified => "VERIFIED",
            TaskStatus::Paid => "PAID",
            TaskStatus::Closed => "CLOSED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Refunded => "REFUNDED",
            TaskStatus::ProofRejected => "PROOF_REJECTED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("task status", s))
    }
}

/// Action that drives a state-machine transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Post,
    Match,
    Claim,
    Escrow,
    Accept,
    Start,
    SubmitProof,
    Verify,
    Pay,
    Close,
    Timeout,
    Refund,
    RejectProof,
    RetryProof,
}

impl TaskAction {
    pub const ALL: [TaskAction; 14] = [
        TaskAction::Post,
        TaskAction::Match,
        TaskAction::Claim,
        TaskAction::Escrow,
        TaskAction::Accept,
        TaskAction::Start,
        TaskAction::SubmitProof,
        TaskAction::Verify,
        TaskAction::Pay,
        TaskAction::Close,
        TaskAction::Timeout,
        TaskAction::Refund,
        TaskAction::RejectProof,
        TaskAction::RetryProof,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Post => "POST",
            TaskAction::Match => "MATCH",
            TaskAction::Claim => "CLAIM",
            TaskAction::Escrow => "ESCROW",
            TaskAction::Accept => "ACCEPT",
            TaskAction::Start => "START",
            TaskAction::SubmitProof => "SUBMIT_PROOF",
            TaskAction::Verify => "VERIFY",
            TaskAction::Pay => "PAY",
            TaskAction::Close => "CLOSE",
            TaskAction::Timeout => "TIMEOUT",
            TaskAction::Refund => "REFUND",
            TaskAction::RejectProof => "REJECT_PROOF",
            TaskAction::RetryProof => "RETRY_PROOF",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("task action", s))
    }
}

/// What an event row records: a state-machine transition, or a settlement
/// annotation that leaves the status unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Transition(TaskAction),
    /// Escrow funded on chain.
    Fund,
    /// Escrow tx reference set manually.
    EscrowTx,
    /// Repair written by the reconciliation pass.
    Reconcile,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Transition(action) => action.as_str(),
            EventAction::Fund => "FUND",
            EventAction::EscrowTx => "ESCROW_TX",
            EventAction::Reconcile => "RECONCILE",
        }
    }

    pub fn transition(&self) -> Option<TaskAction> {
        match self {
            EventAction::Transition(action) => Some(*action),
            _ => None,
        }
    }
}

impl From<TaskAction> for EventAction {
    fn from(action: TaskAction) -> Self {
        EventAction::Transition(action)
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FUND" => Ok(EventAction::Fund),
            "ESCROW_TX" => Ok(EventAction::EscrowTx),
            "RECONCILE" => Ok(EventAction::Reconcile),
            other => TaskAction::from_str(other)
                .map(EventAction::Transition)
                .map_err(|_| ParseEnumError::new("event action", other)),
        }
    }
}

impl Serialize for EventAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventAction::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Who a task is aimed at. Only human-targeted tasks can be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTarget {
    #[default]
    Human,
    Agent,
}

impl TaskTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskTarget::Human => "human",
            TaskTarget::Agent => "agent",
        }
    }
}

impl FromStr for TaskTarget {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(TaskTarget::Human),
            "agent" => Ok(TaskTarget::Agent),
            _ => Err(ParseEnumError::new("task target", s)),
        }
    }
}

/// A task in the marketplace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub target: TaskTarget,
    pub capability_id: String,
    pub goal: String,
    pub budget_amount: f64,
    pub currency: String,
    pub sla_seconds: i64,
    pub urgent: bool,
    pub min_stake: f64,
    pub task_hash: String,
    pub provider_id: Option<String>,
    pub claimed_by: Option<String>,
    pub escrow_tx: Option<String>,
    pub deposit_tx: Option<String>,
    pub payout_tx: Option<String>,
    pub refund_tx: Option<String>,
    pub requester_address: Option<String>,
    /// Reservation token held while a money-moving call is in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_settlement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Millisecond timestamp at which the SLA expires.
    pub fn sla_deadline_ms(&self) -> i64 {
        self.created_at
            .saturating_add(self.sla_seconds.saturating_mul(1000))
    }

    pub fn has_budget(&self) -> bool {
        self.budget_amount > 0.0
    }
}

/// Immutable audit record of one transition or settlement annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub action: EventAction,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub tx_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

/// One piece of evidence attached to a proof.
///
/// Field order is part of the proof hash and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofArtifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Approved => "approved",
            VerificationStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "approved" => Ok(VerificationStatus::Approved),
            "rejected" => Ok(VerificationStatus::Rejected),
            _ => Err(ParseEnumError::new("verification status", s)),
        }
    }
}

/// A proof submission. The most recent row per task is the current proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub id: String,
    pub task_id: String,
    pub artifacts: Vec<ProofArtifact>,
    pub proof_hash: String,
    pub notes: String,
    pub verification_status: VerificationStatus,
    pub verification_notes: Option<String>,
    pub created_at: i64,
}

/// A provider that can be matched to tasks. Read-only to the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub wallet_address: String,
    pub capability_ids: Vec<String>,
    pub price: f64,
    pub eta_minutes: i64,
    pub rating: f64,
    pub success_rate: f64,
    pub stake_amount: f64,
    pub created_at: i64,
}

/// Task together with its audit trail and current proof.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub events: Vec<TaskEvent>,
    pub proof: Option<Proof>,
}

/// Readiness check result for `poll`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PollResult {
    Ready {
        ready: bool,
        task: Box<Task>,
    },
    Pending {
        ready: bool,
        #[serde(rename = "currentStatus")]
        current_status: TaskStatus,
    },
}
