use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Shared plumbing error used at trait boundaries between engine crates.
///
/// Components keep their own `thiserror` enums; `GateError` carries the
/// flattened message across `dyn` seams (audit sinks, dispatchers, memory
/// and model backends).
#[derive(Debug, Error, Clone)]
pub enum GateError {
    #[error("{message}")]
    Message { message: String },
}

impl GateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

uuid_id!(
    /// Isolation boundary every other entity belongs to.
    TenantId
);
uuid_id!(
    /// A human or agent identity subject to authorization.
    ActorId
);
uuid_id!(CredentialId);
uuid_id!(
    /// One unit of orchestrated, authorized work.
    TaskId
);
uuid_id!(
    /// Groups sub-tasks spawned from one originating request.
    CorrelationId
);
uuid_id!(DecisionId);
uuid_id!(RoleId);

impl TenantId {
    /// The reserved tenant that owns engine-internal actors.
    pub fn system() -> Self {
        Self("system".to_string())
    }
}

/// Closed set of action types the engine authorizes and routes.
///
/// Kept as an enum rather than free-form strings so tier membership and
/// worker capability checks are set membership over a finite domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ChatReply,
    DocumentDraft,
    ReportCompile,
    DataAnalyze,
    LedgerSync,
    InvoiceMatch,
    PortalScrape,
    CalendarSync,
    MailboxSweep,
    CodeReview,
}

impl ActionType {
    pub const ALL: [ActionType; 10] = [
        ActionType::ChatReply,
        ActionType::DocumentDraft,
        ActionType::ReportCompile,
        ActionType::DataAnalyze,
        ActionType::LedgerSync,
        ActionType::InvoiceMatch,
        ActionType::PortalScrape,
        ActionType::CalendarSync,
        ActionType::MailboxSweep,
        ActionType::CodeReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::ChatReply => "chat_reply",
            ActionType::DocumentDraft => "document_draft",
            ActionType::ReportCompile => "report_compile",
            ActionType::DataAnalyze => "data_analyze",
            ActionType::LedgerSync => "ledger_sync",
            ActionType::InvoiceMatch => "invoice_match",
            ActionType::PortalScrape => "portal_scrape",
            ActionType::CalendarSync => "calendar_sync",
            ActionType::MailboxSweep => "mailbox_sweep",
            ActionType::CodeReview => "code_review",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the five fixed subscription/permission levels.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TierLevel {
    Trial,
    Starter,
    Standard,
    Professional,
    Enterprise,
}

impl TierLevel {
    pub const ALL: [TierLevel; 5] = [
        TierLevel::Trial,
        TierLevel::Starter,
        TierLevel::Standard,
        TierLevel::Professional,
        TierLevel::Enterprise,
    ];

    pub fn rank(self) -> u8 {
        match self {
            TierLevel::Trial => 1,
            TierLevel::Starter => 2,
            TierLevel::Standard => 3,
            TierLevel::Professional => 4,
            TierLevel::Enterprise => 5,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.rank() == rank)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TierLevel::Trial => "trial",
            TierLevel::Starter => "starter",
            TierLevel::Standard => "standard",
            TierLevel::Professional => "professional",
            TierLevel::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for TierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
}

/// Machine-readable outcome attached to every permission decision.
///
/// Denials are always specific so the UI layer can render actionable
/// messaging (upgrade tier vs retry vs account suspended).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Allowed,
    UnknownActor,
    ActorRevoked,
    TenantSuspended,
    ActionNotPermitted,
    ScopeExceeded,
    RateLimitExceeded,
    InfrastructureUnavailable,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Allowed => "allowed",
            ReasonCode::UnknownActor => "unknown_actor",
            ReasonCode::ActorRevoked => "actor_revoked",
            ReasonCode::TenantSuspended => "tenant_suspended",
            ReasonCode::ActionNotPermitted => "action_not_permitted",
            ReasonCode::ScopeExceeded => "scope_exceeded",
            ReasonCode::RateLimitExceeded => "rate_limit_exceeded",
            ReasonCode::InfrastructureUnavailable => "infrastructure_unavailable",
        }
    }

    pub fn is_allow(self) -> bool {
        matches!(self, ReasonCode::Allowed)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
