use chrono::{Duration, NaiveDateTime};
use helpdesk_contracts::{
    Actor, Priority, SenderKind, Specialty, Staff, StaffId, StaffRatingSummary, StaffRole, Ticket,
    TicketAssignment, TicketDashboardStats, TicketReply, TicketStatus,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Fixed-width storage form so text ordering matches time ordering.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Assign,
    StartWork,
    Resolve,
    InactivityTimeout,
    Close,
    Reopen { target: TicketStatus },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Assign => "assign",
            LifecycleEvent::StartWork => "start_work",
            LifecycleEvent::Resolve => "resolve",
            LifecycleEvent::InactivityTimeout => "inactivity_timeout",
            LifecycleEvent::Close => "close",
            LifecycleEvent::Reopen { .. } => "reopen",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {event} a ticket in status {from}")]
    Illegal {
        from: TicketStatus,
        event: &'static str,
    },
    #[error("a closed ticket can only be reopened into OPEN or IN_PROGRESS, not {target}")]
    BadReopenTarget { target: TicketStatus },
}

/// The single authority on ticket status changes.
pub fn transition(
    from: TicketStatus,
    event: LifecycleEvent,
) -> Result<TicketStatus, TransitionError> {
    use TicketStatus::*;

    let to = match (from, event) {
        (Open, LifecycleEvent::Assign) => Assigned,
        (Assigned, LifecycleEvent::StartWork) => InProgress,
        (InProgress, LifecycleEvent::Resolve) => Resolved,
        (InProgress, LifecycleEvent::InactivityTimeout) => Closed,
        (Open | Assigned | InProgress | Resolved, LifecycleEvent::Close) => Closed,
        (Closed, LifecycleEvent::Reopen { target }) => match target {
            Open | InProgress => target,
            other => return Err(TransitionError::BadReopenTarget { target: other }),
        },
        (from, event) => {
            return Err(TransitionError::Illegal {
                from,
                event: event.name(),
            })
        }
    };
    Ok(to)
}

/// A customer reopen goes back to the queue for re-triage. Staff and the system resume work on
/// tickets that already had an assignee.
pub fn reopen_target(actor: Actor, has_assignment: bool) -> TicketStatus {
    match actor {
        Actor::Customer(_) => TicketStatus::Open,
        Actor::Staff(_) | Actor::System if has_assignment => TicketStatus::InProgress,
        Actor::Staff(_) | Actor::System => TicketStatus::Open,
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Forbidden(String),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }

    pub fn into_result(self) -> Result<(), String> {
        match self {
            Authorization::Allowed => Ok(()),
            Authorization::Forbidden(reason) => Err(reason),
        }
    }
}

pub fn has_role(staff: &Staff, required: StaffRole) -> Authorization {
    if !staff.active {
        return Authorization::Forbidden(format!("staff {} is inactive", staff.staff_id));
    }
    if staff.role != required {
        return Authorization::Forbidden(format!(
            "staff {} has role {}, {} required",
            staff.staff_id, staff.role, required
        ));
    }
    Authorization::Allowed
}

pub fn same_department(staff: &Staff, ticket: &Ticket) -> Authorization {
    if staff.department_id == ticket.department_id {
        Authorization::Allowed
    } else {
        Authorization::Forbidden(format!(
            "ticket {} does not belong to department {}",
            ticket.ticket_id, staff.department_id
        ))
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

pub fn specialty_for_role(role: StaffRole) -> Option<Specialty> {
    match role {
        StaffRole::FinancialSupport => Some(Specialty::Financial),
        StaffRole::TechnicalSupport => Some(Specialty::Technical),
        StaffRole::Admin | StaffRole::Lead | StaffRole::CustomerServiceAgent => None,
    }
}

/// Most recent assignment by time, ties broken by id.
pub fn current_assignment(assignments: &[TicketAssignment]) -> Option<&TicketAssignment> {
    assignments
        .iter()
        .max_by_key(|a| (a.assigned_at, a.assignment_id))
}

/// Keeps assignment history monotonic even if the clock steps backwards.
pub fn next_assigned_at(now: NaiveDateTime, previous: Option<&TicketAssignment>) -> NaiveDateTime {
    match previous {
        Some(prev) if prev.assigned_at > now => prev.assigned_at,
        _ => now,
    }
}

// ---------------------------------------------------------------------------
// Inactivity
// ---------------------------------------------------------------------------

pub fn inactivity_window(hours: u64) -> Duration {
    Duration::hours(hours as i64)
}

/// Last customer reply, or the reopen/creation time when the customer never replied.
pub fn activity_anchor(ticket: &Ticket, replies: &[TicketReply]) -> NaiveDateTime {
    let reference = ticket.reopened_at.unwrap_or(ticket.created_at);
    replies
        .iter()
        .filter(|r| r.sender_kind == SenderKind::Customer)
        .max_by_key(|r| (r.created_at, r.reply_id))
        .map(|r| r.created_at)
        .unwrap_or(reference)
}

pub fn is_inactive(
    ticket: &Ticket,
    replies: &[TicketReply],
    now: NaiveDateTime,
    window: Duration,
) -> bool {
    ticket.status == TicketStatus::InProgress && now - activity_anchor(ticket, replies) > window
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("score must be between 1 and 5, got {0}")]
    OutOfRange(i64),
    #[error("score must be a whole number, got {0}")]
    NotInteger(f64),
}

pub fn validate_score(score: i64) -> Result<u8, ScoreError> {
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(ScoreError::OutOfRange(score));
    }
    Ok(score as u8)
}

/// For callers holding a loosely typed number, e.g. decoded JSON.
pub fn validate_score_value(score: f64) -> Result<u8, ScoreError> {
    if !score.is_finite() || score.fract() != 0.0 {
        return Err(ScoreError::NotInteger(score));
    }
    validate_score(score as i64)
}

pub fn rating_summary(staff_id: StaffId, scores: &[u8]) -> StaffRatingSummary {
    let review_count = scores.len();
    let average_score = if review_count == 0 {
        0.0
    } else {
        scores.iter().map(|s| f64::from(*s)).sum::<f64>() / review_count as f64
    };
    StaffRatingSummary {
        staff_id,
        average_score,
        review_count,
    }
}

pub fn dashboard_stats(tickets: &[Ticket]) -> TicketDashboardStats {
    let mut stats = TicketDashboardStats {
        total_tickets: tickets.len() as u64,
        ..TicketDashboardStats::default()
    };
    for t in tickets {
        match t.status {
            TicketStatus::Open => {
                stats.pending_tickets += 1;
                if t.priority == Priority::High {
                    stats.urgent_tickets += 1;
                }
            }
            TicketStatus::Closed => stats.resolved_tickets += 1,
            _ => {}
        }
    }
    stats
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
