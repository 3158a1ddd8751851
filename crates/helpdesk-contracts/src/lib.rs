use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

id_type!(
    TicketId,
    CustomerId,
    StaffId,
    DepartmentId,
    AssignmentId,
    ReplyId,
    EvaluationId,
);

/// Returned when a stored enum column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),* $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)*
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

string_enum!(Priority, "priority", {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    Assigned,
    InProgress,
    Resolved,
    Closed,
}

string_enum!(TicketStatus, "ticket status", {
    Open => "OPEN",
    Assigned => "ASSIGNED",
    InProgress => "IN_PROGRESS",
    Resolved => "RESOLVED",
    Closed => "CLOSED",
});

/// Capability category an assignment requires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Specialty {
    Financial,
    Technical,
}

string_enum!(Specialty, "specialty", {
    Financial => "FINANCIAL",
    Technical => "TECHNICAL",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StaffRole {
    Admin,
    Lead,
    CustomerServiceAgent,
    TechnicalSupport,
    FinancialSupport,
}

string_enum!(StaffRole, "staff role", {
    Admin => "ADMIN",
    Lead => "LEAD",
    CustomerServiceAgent => "CUSTOMER_SERVICE_AGENT",
    TechnicalSupport => "TECHNICAL_SUPPORT",
    FinancialSupport => "FINANCIAL_SUPPORT",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderKind {
    Customer,
    Staff,
}

string_enum!(SenderKind, "sender kind", {
    Customer => "CUSTOMER",
    Staff => "STAFF",
});

/// Who is performing an operation. Every entry point takes one explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Staff(StaffId),
    Customer(CustomerId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Staff(id) => write!(f, "staff:{id}"),
            Actor::Customer(id) => write!(f, "customer:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Department {
    pub department_id: DepartmentId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Staff {
    pub staff_id: StaffId,
    pub name: String,
    pub department_id: DepartmentId,
    pub role: StaffRole,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub customer_id: CustomerId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub customer_id: CustomerId,
    pub department_id: DepartmentId,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub reopened_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub closed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTicket {
    pub department_id: DepartmentId,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketAssignment {
    pub assignment_id: AssignmentId,
    pub ticket_id: TicketId,
    pub assigned_to: StaffId,
    pub assigned_by: StaffId,
    pub assigned_at: NaiveDateTime,
    pub role_needed: Specialty,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketReply {
    pub reply_id: ReplyId,
    pub ticket_id: TicketId,
    pub sender_kind: SenderKind,
    pub sender_id: i64,
    pub message: String,
    #[serde(default)]
    pub image_ref: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evaluation {
    pub evaluation_id: EvaluationId,
    pub ticket_id: TicketId,
    pub customer_id: CustomerId,
    pub score: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaffRatingSummary {
    pub staff_id: StaffId,
    pub average_score: f64,
    pub review_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketDashboardStats {
    pub total_tickets: u64,
    pub pending_tickets: u64,
    pub resolved_tickets: u64,
    pub urgent_tickets: u64,
}

/// One evaluation as seen from the evaluated staff member's side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaffTicketEvaluation {
    pub evaluation_id: EvaluationId,
    pub ticket_id: TicketId,
    pub subject: String,
    pub customer_id: CustomerId,
    pub score: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Outcome of one auto-close sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub closed: usize,
    pub skipped: usize,
    pub failed: usize,
}
