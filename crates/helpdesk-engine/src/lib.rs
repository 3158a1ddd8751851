//! Ticket lifecycle and assignment engine.
//!
//! [`Desk`] is the single entry point. Every operation takes the caller's identity explicitly,
//! runs its read-validate-write under the store lock, and leaves one record in the audit trail
//! when it changes state.

mod audit;
mod collaborators;
mod scheduler;
mod store;

use std::sync::Arc;

use chrono::Duration;
use helpdesk_config::Config;
use helpdesk_contracts::{
    Actor, Customer, CustomerId, Department, DepartmentId, Evaluation, NewTicket, SenderKind,
    Staff, StaffId, StaffRatingSummary, StaffRole, StaffTicketEvaluation, Ticket,
    TicketAssignment, TicketDashboardStats, TicketId, TicketReply, TicketStatus,
};
use helpdesk_kernel::{
    activity_anchor, current_assignment, dashboard_stats, format_timestamp, has_role,
    is_inactive, next_assigned_at, rating_summary, reopen_target, same_department,
    specialty_for_role, transition, validate_score, LifecycleEvent, ScoreError, TransitionError,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::store::{
    AssignmentDraft, EvaluationDraft, EvaluationInsert, ReplyDraft, StatusWrite, StoreBackend,
    TicketDraft,
};

pub use crate::audit::{verify_audit_chain, verify_audit_chain_with_mirror};
pub use crate::collaborators::{
    Clock, ImageStore, ManualClock, NoopImageStore, OrderLedger, OrderValidation, SystemClock,
};
pub use crate::scheduler::AutoCloseScheduler;

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store failure: {0}")]
    Store(String),
}

/// Stable, client-facing classification of a [`DeskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidState,
    ValidationError,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl DeskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeskError::NotFound(_) => ErrorKind::NotFound,
            DeskError::Forbidden(_) => ErrorKind::Forbidden,
            DeskError::InvalidState(_) => ErrorKind::InvalidState,
            DeskError::Validation(_) => ErrorKind::ValidationError,
            DeskError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl From<TransitionError> for DeskError {
    fn from(err: TransitionError) -> Self {
        DeskError::InvalidState(err.to_string())
    }
}

impl From<ScoreError> for DeskError {
    fn from(err: ScoreError) -> Self {
        DeskError::Validation(err.to_string())
    }
}

/// External services the desk calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub orders: Arc<dyn OrderValidation>,
    pub images: Arc<dyn ImageStore>,
}

impl Collaborators {
    /// System clock and a no-op image store around the given order lookup.
    pub fn new(orders: Arc<dyn OrderValidation>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            orders,
            images: Arc::new(NoopImageStore),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_images(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = images;
        self
    }
}

pub(crate) enum SweepOutcome {
    Closed,
    Skipped,
}

#[derive(Clone)]
pub struct Desk {
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
    clock: Arc<dyn Clock>,
    orders: Arc<dyn OrderValidation>,
    images: Arc<dyn ImageStore>,
}

impl Desk {
    pub async fn open(cfg: &Config, collaborators: Collaborators) -> Result<Self, DeskError> {
        let store = StoreBackend::open(&cfg.store).map_err(DeskError::Store)?;
        let audit = AuditJsonl::open(
            &cfg.audit.jsonl_path,
            cfg.audit.immutable_mirror_path.as_deref(),
        )
        .await
        .map_err(DeskError::Store)?;
        info!(store = %cfg.store.kind, audit = %cfg.audit.jsonl_path, "helpdesk opened");
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            audit: Arc::new(audit),
            clock: collaborators.clock,
            orders: collaborators.orders,
            images: collaborators.images,
        })
    }

    pub fn scheduler(&self, cfg: &helpdesk_config::Scheduler) -> AutoCloseScheduler {
        AutoCloseScheduler::new(self.clone(), cfg)
    }

    // -- directory ---------------------------------------------------------

    pub async fn register_department(&self, name: &str) -> Result<Department, DeskError> {
        let name = required_text("department name", name)?;
        let mut store = self.store.lock().await;
        store.insert_department(&name).map_err(DeskError::Store)
    }

    pub async fn register_staff(
        &self,
        name: &str,
        department_id: DepartmentId,
        role: StaffRole,
    ) -> Result<Staff, DeskError> {
        let name = required_text("staff name", name)?;
        let mut store = self.store.lock().await;
        require_department(&store, department_id)?;
        store
            .insert_staff(&name, department_id, role)
            .map_err(DeskError::Store)
    }

    pub async fn register_customer(&self, name: &str) -> Result<Customer, DeskError> {
        let name = required_text("customer name", name)?;
        let mut store = self.store.lock().await;
        store.insert_customer(&name).map_err(DeskError::Store)
    }

    // -- tickets -----------------------------------------------------------

    /// Opens a ticket for a customer with at least one prior order.
    pub async fn create_ticket(
        &self,
        customer_id: CustomerId,
        new: NewTicket,
    ) -> Result<Ticket, DeskError> {
        let mut store = self.store.lock().await;
        require_customer(&store, customer_id)?;
        require_department(&store, new.department_id)?;
        let subject = required_text("subject", &new.subject)?;
        if !self.orders.has_orders(customer_id) {
            return Err(DeskError::Forbidden(format!(
                "customer {customer_id} has no orders"
            )));
        }

        let ticket = store
            .insert_ticket(TicketDraft {
                customer_id,
                department_id: new.department_id,
                subject,
                description: new.description.trim().to_string(),
                priority: new.priority.unwrap_or_default(),
                created_at: self.clock.now(),
            })
            .map_err(DeskError::Store)?;

        info!(
            ticket_id = %ticket.ticket_id,
            customer_id = %customer_id,
            department_id = %ticket.department_id,
            priority = %ticket.priority,
            "ticket created"
        );
        self.record(
            "ticket_created",
            Actor::Customer(customer_id),
            Some(ticket.ticket_id),
            json!({
                "department_id": ticket.department_id,
                "priority": ticket.priority,
            }),
        )
        .await;
        Ok(ticket)
    }

    pub async fn get_ticket(&self, ticket_id: TicketId) -> Result<Ticket, DeskError> {
        let store = self.store.lock().await;
        require_ticket(&store, ticket_id)
    }

    /// Newest first.
    pub async fn list_tickets_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Ticket>, DeskError> {
        let store = self.store.lock().await;
        require_customer(&store, customer_id)?;
        store
            .tickets_by_customer(customer_id)
            .map_err(DeskError::Store)
    }

    /// Newest first.
    pub async fn list_tickets_by_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<Vec<Ticket>, DeskError> {
        let store = self.store.lock().await;
        require_department(&store, department_id)?;
        store
            .tickets_by_department(department_id)
            .map_err(DeskError::Store)
    }

    /// Removes a ticket its owner opened by mistake. Only OPEN, never-assigned tickets qualify.
    pub async fn delete_ticket(
        &self,
        ticket_id: TicketId,
        customer_id: CustomerId,
    ) -> Result<(), DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        if ticket.customer_id != customer_id {
            return Err(DeskError::Forbidden(format!(
                "customer {customer_id} does not own ticket {ticket_id}"
            )));
        }
        if ticket.status != TicketStatus::Open {
            return Err(DeskError::InvalidState(format!(
                "ticket {ticket_id} is {} and can no longer be deleted",
                ticket.status
            )));
        }
        if !store
            .assignments_for_ticket(ticket_id)
            .map_err(DeskError::Store)?
            .is_empty()
        {
            return Err(DeskError::InvalidState(format!(
                "ticket {ticket_id} has been assigned and can no longer be deleted"
            )));
        }

        let images: Vec<String> = store
            .replies_for_ticket(ticket_id)
            .map_err(DeskError::Store)?
            .into_iter()
            .filter_map(|r| r.image_ref)
            .collect();
        if !store.delete_ticket(ticket_id).map_err(DeskError::Store)? {
            return Err(DeskError::InvalidState(format!(
                "ticket {ticket_id} changed while being deleted"
            )));
        }

        for url in &images {
            if let Err(err) = self.images.delete(url) {
                warn!(ticket_id = %ticket_id, image = %url, error = %err, "reply image not deleted");
            }
        }
        info!(ticket_id = %ticket_id, customer_id = %customer_id, "ticket deleted");
        self.record(
            "ticket_deleted",
            Actor::Customer(customer_id),
            Some(ticket_id),
            json!({ "images": images.len() }),
        )
        .await;
        Ok(())
    }

    // -- assignment --------------------------------------------------------

    /// Binds an OPEN ticket to a support specialist on the lead's own team.
    pub async fn assign_ticket(
        &self,
        ticket_id: TicketId,
        staff_id: StaffId,
        leader_id: StaffId,
        note: Option<String>,
    ) -> Result<TicketAssignment, DeskError> {
        let mut store = self.store.lock().await;
        let leader = require_leader(&store, leader_id)?;

        let ticket = require_ticket(&store, ticket_id)?;
        if ticket.status == TicketStatus::Closed {
            return Err(DeskError::InvalidState(format!("ticket {ticket_id} is closed")));
        }
        same_department(&leader, &ticket)
            .into_result()
            .map_err(DeskError::Forbidden)?;
        let to = transition(ticket.status, LifecycleEvent::Assign)?;

        let staff = require_staff(&store, staff_id)?;
        if staff.department_id != ticket.department_id {
            return Err(DeskError::Forbidden(format!(
                "staff {staff_id} is not in department {}",
                ticket.department_id
            )));
        }
        if !staff.active {
            return Err(DeskError::Forbidden(format!("staff {staff_id} is inactive")));
        }
        let role_needed = specialty_for_role(staff.role).ok_or_else(|| {
            DeskError::Validation(format!(
                "staff {staff_id} has role {}, which is not an assignable specialty",
                staff.role
            ))
        })?;

        let history = store
            .assignments_for_ticket(ticket_id)
            .map_err(DeskError::Store)?;
        let assigned_at = next_assigned_at(self.clock.now(), current_assignment(&history));
        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let assignment = store
            .assign(AssignmentDraft {
                ticket_id,
                assigned_to: staff_id,
                assigned_by: leader_id,
                assigned_at,
                role_needed,
                note,
            })
            .map_err(DeskError::Store)?
            .ok_or_else(|| {
                DeskError::InvalidState(format!("ticket {ticket_id} is no longer open"))
            })?;

        info!(
            ticket_id = %ticket_id,
            staff_id = %staff_id,
            leader_id = %leader_id,
            role_needed = %role_needed,
            "ticket assigned"
        );
        self.record(
            "ticket_assigned",
            Actor::Staff(leader_id),
            Some(ticket_id),
            json!({
                "assignment_id": assignment.assignment_id,
                "assigned_to": staff_id,
                "role_needed": role_needed,
                "note": assignment.note,
                "from": ticket.status,
                "to": to,
            }),
        )
        .await;
        Ok(assignment)
    }

    pub async fn current_assignment(
        &self,
        ticket_id: TicketId,
    ) -> Result<Option<TicketAssignment>, DeskError> {
        let history = self.assignment_history(ticket_id).await?;
        Ok(current_assignment(&history).cloned())
    }

    /// Oldest first.
    pub async fn assignment_history(
        &self,
        ticket_id: TicketId,
    ) -> Result<Vec<TicketAssignment>, DeskError> {
        let store = self.store.lock().await;
        require_ticket(&store, ticket_id)?;
        store
            .assignments_for_ticket(ticket_id)
            .map_err(DeskError::Store)
    }

    // -- activity log ------------------------------------------------------

    /// Appends to the ticket's reply log. Never changes the ticket's status.
    pub async fn append_reply(
        &self,
        ticket_id: TicketId,
        sender: Actor,
        message: &str,
        image_ref: Option<String>,
    ) -> Result<TicketReply, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        let (sender_kind, sender_id) = match sender {
            Actor::Customer(id) => {
                if id != ticket.customer_id {
                    return Err(DeskError::Forbidden(format!(
                        "customer {id} does not own ticket {ticket_id}"
                    )));
                }
                (SenderKind::Customer, id.0)
            }
            Actor::Staff(id) => {
                let staff = require_staff(&store, id)?;
                same_department(&staff, &ticket)
                    .into_result()
                    .map_err(DeskError::Forbidden)?;
                (SenderKind::Staff, id.0)
            }
            Actor::System => {
                return Err(DeskError::Forbidden(
                    "replies must come from a customer or a staff member".to_string(),
                ))
            }
        };
        if message.trim().is_empty() {
            return Err(DeskError::Validation("reply message is empty".to_string()));
        }

        let reply = store
            .insert_reply(ReplyDraft {
                ticket_id,
                sender_kind,
                sender_id,
                message: message.to_string(),
                image_ref: image_ref.filter(|r| !r.trim().is_empty()),
                created_at: self.clock.now(),
            })
            .map_err(DeskError::Store)?;
        debug!(ticket_id = %ticket_id, reply_id = %reply.reply_id, sender = %sender, "reply appended");
        Ok(reply)
    }

    /// Oldest first.
    pub async fn list_replies(&self, ticket_id: TicketId) -> Result<Vec<TicketReply>, DeskError> {
        let store = self.store.lock().await;
        require_ticket(&store, ticket_id)?;
        store.replies_for_ticket(ticket_id).map_err(DeskError::Store)
    }

    // -- lifecycle ---------------------------------------------------------

    pub async fn start_work(
        &self,
        ticket_id: TicketId,
        staff_id: StaffId,
    ) -> Result<Ticket, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        require_worker(&store, staff_id, &ticket)?;
        self.commit_transition(
            &mut store,
            ticket,
            LifecycleEvent::StartWork,
            Actor::Staff(staff_id),
        )
        .await
    }

    pub async fn resolve_ticket(
        &self,
        ticket_id: TicketId,
        staff_id: StaffId,
    ) -> Result<Ticket, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        require_worker(&store, staff_id, &ticket)?;
        self.commit_transition(
            &mut store,
            ticket,
            LifecycleEvent::Resolve,
            Actor::Staff(staff_id),
        )
        .await
    }

    pub async fn close_ticket(&self, ticket_id: TicketId, actor: Actor) -> Result<Ticket, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        authorize_ticket_actor(&store, actor, &ticket)?;
        self.commit_transition(&mut store, ticket, LifecycleEvent::Close, actor)
            .await
    }

    /// Customers send the ticket back to OPEN for re-triage. Staff and the system resume
    /// IN_PROGRESS when the ticket was ever assigned.
    pub async fn reopen_ticket(
        &self,
        ticket_id: TicketId,
        actor: Actor,
    ) -> Result<Ticket, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        authorize_ticket_actor(&store, actor, &ticket)?;
        let assigned = !store
            .assignments_for_ticket(ticket_id)
            .map_err(DeskError::Store)?
            .is_empty();
        let event = LifecycleEvent::Reopen {
            target: reopen_target(actor, assigned),
        };
        self.commit_transition(&mut store, ticket, event, actor)
            .await
    }

    async fn commit_transition(
        &self,
        store: &mut StoreBackend,
        ticket: Ticket,
        event: LifecycleEvent,
        actor: Actor,
    ) -> Result<Ticket, DeskError> {
        let from = ticket.status;
        let to = transition(from, event)?;
        let now = self.clock.now();
        let reopened_at = match event {
            LifecycleEvent::Reopen { .. } => Some(now),
            _ => ticket.reopened_at,
        };
        let closed_at = (to == TicketStatus::Closed).then_some(now);

        let swapped = store
            .update_status(
                ticket.ticket_id,
                from,
                StatusWrite {
                    to,
                    reopened_at,
                    closed_at,
                },
            )
            .map_err(DeskError::Store)?;
        if !swapped {
            return Err(DeskError::InvalidState(format!(
                "ticket {} is no longer {from}",
                ticket.ticket_id
            )));
        }

        info!(
            ticket_id = %ticket.ticket_id,
            from = %from,
            to = %to,
            event = event.name(),
            actor = %actor,
            "ticket status changed"
        );
        self.record(
            "status_changed",
            actor,
            Some(ticket.ticket_id),
            json!({ "from": from, "to": to, "event": event.name() }),
        )
        .await;
        Ok(Ticket {
            status: to,
            reopened_at,
            closed_at,
            ..ticket
        })
    }

    /// One scheduler step: closes the ticket if it is IN_PROGRESS and the customer went quiet.
    pub(crate) async fn close_if_inactive(
        &self,
        ticket_id: TicketId,
        window: Duration,
    ) -> Result<SweepOutcome, DeskError> {
        let mut store = self.store.lock().await;
        let Some(ticket) = store.get_ticket(ticket_id).map_err(DeskError::Store)? else {
            return Ok(SweepOutcome::Skipped);
        };
        let replies = store
            .replies_for_ticket(ticket_id)
            .map_err(DeskError::Store)?;
        let now = self.clock.now();
        if !is_inactive(&ticket, &replies, now, window) {
            return Ok(SweepOutcome::Skipped);
        }
        let anchor = activity_anchor(&ticket, &replies);

        let to = transition(ticket.status, LifecycleEvent::InactivityTimeout)?;
        let swapped = store
            .update_status(
                ticket_id,
                TicketStatus::InProgress,
                StatusWrite {
                    to,
                    reopened_at: ticket.reopened_at,
                    closed_at: Some(now),
                },
            )
            .map_err(DeskError::Store)?;
        if !swapped {
            debug!(ticket_id = %ticket_id, "ticket left IN_PROGRESS before auto-close");
            return Ok(SweepOutcome::Skipped);
        }

        info!(ticket_id = %ticket_id, last_activity = %anchor, "ticket auto-closed");
        self.record(
            "auto_closed",
            Actor::System,
            Some(ticket_id),
            json!({
                "from": ticket.status,
                "to": to,
                "last_activity": format_timestamp(anchor),
            }),
        )
        .await;
        Ok(SweepOutcome::Closed)
    }

    /// One page of IN_PROGRESS ticket ids after `after`, for the sweep.
    pub(crate) async fn in_progress_page(
        &self,
        after: Option<TicketId>,
        limit: usize,
    ) -> Result<Vec<TicketId>, DeskError> {
        let store = self.store.lock().await;
        store
            .ticket_ids_by_status_page(TicketStatus::InProgress, after, limit)
            .map_err(DeskError::Store)
    }

    // -- lead views --------------------------------------------------------

    /// All tickets of the lead's department, newest first.
    pub async fn department_tickets_for_leader(
        &self,
        leader_id: StaffId,
    ) -> Result<Vec<Ticket>, DeskError> {
        let store = self.store.lock().await;
        let leader = require_leader(&store, leader_id)?;
        store
            .tickets_by_department(leader.department_id)
            .map_err(DeskError::Store)
    }

    /// The lead's assignment queue.
    pub async fn open_tickets_for_leader(
        &self,
        leader_id: StaffId,
    ) -> Result<Vec<Ticket>, DeskError> {
        let mut tickets = self.department_tickets_for_leader(leader_id).await?;
        tickets.retain(|t| t.status == TicketStatus::Open);
        Ok(tickets)
    }

    /// Staff the lead can assign work to. Other leads are left out.
    pub async fn department_staff_for_leader(
        &self,
        leader_id: StaffId,
    ) -> Result<Vec<Staff>, DeskError> {
        let store = self.store.lock().await;
        let leader = require_leader(&store, leader_id)?;
        let mut staff = store
            .staff_in_department(leader.department_id)
            .map_err(DeskError::Store)?;
        staff.retain(|s| s.role != StaffRole::Lead);
        Ok(staff)
    }

    pub async fn leader_dashboard(
        &self,
        leader_id: StaffId,
    ) -> Result<TicketDashboardStats, DeskError> {
        let tickets = self.department_tickets_for_leader(leader_id).await?;
        Ok(dashboard_stats(&tickets))
    }

    pub async fn tickets_assigned_to_staff(
        &self,
        staff_id: StaffId,
        leader_id: StaffId,
    ) -> Result<Vec<Ticket>, DeskError> {
        let store = self.store.lock().await;
        let leader = require_leader(&store, leader_id)?;
        let staff = require_staff(&store, staff_id)?;
        if staff.department_id != leader.department_id {
            return Err(DeskError::Forbidden(format!(
                "staff {staff_id} is not in department {}",
                leader.department_id
            )));
        }
        currently_assigned(&store, staff_id)
    }

    // -- staff views -------------------------------------------------------

    /// Tickets whose current assignee is `staff_id`.
    pub async fn assigned_tickets(&self, staff_id: StaffId) -> Result<Vec<Ticket>, DeskError> {
        let store = self.store.lock().await;
        require_staff(&store, staff_id)?;
        currently_assigned(&store, staff_id)
    }

    pub async fn assigned_ticket_stats(
        &self,
        staff_id: StaffId,
    ) -> Result<TicketDashboardStats, DeskError> {
        let tickets = self.assigned_tickets(staff_id).await?;
        Ok(dashboard_stats(&tickets))
    }

    // -- evaluation --------------------------------------------------------

    /// Accepts the owner's single satisfaction score for a CLOSED ticket.
    pub async fn submit_evaluation(
        &self,
        customer_id: CustomerId,
        ticket_id: TicketId,
        score: i64,
        comment: Option<String>,
    ) -> Result<Evaluation, DeskError> {
        let mut store = self.store.lock().await;
        let ticket = require_ticket(&store, ticket_id)?;
        if ticket.customer_id != customer_id {
            return Err(DeskError::Forbidden(format!(
                "customer {customer_id} does not own ticket {ticket_id}"
            )));
        }
        if ticket.status != TicketStatus::Closed {
            return Err(DeskError::InvalidState(format!(
                "ticket {ticket_id} is {}, only closed tickets can be evaluated",
                ticket.status
            )));
        }
        if store
            .evaluation_for_ticket(ticket_id)
            .map_err(DeskError::Store)?
            .is_some()
        {
            return Err(already_evaluated(ticket_id));
        }
        let score = validate_score(score)?;

        let inserted = store
            .insert_evaluation(EvaluationDraft {
                ticket_id,
                customer_id,
                score,
                comment: comment
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty()),
                created_at: self.clock.now(),
            })
            .map_err(DeskError::Store)?;
        let evaluation = match inserted {
            EvaluationInsert::Inserted(evaluation) => evaluation,
            EvaluationInsert::Duplicate => return Err(already_evaluated(ticket_id)),
        };

        info!(ticket_id = %ticket_id, customer_id = %customer_id, score, "evaluation submitted");
        self.record(
            "evaluation_submitted",
            Actor::Customer(customer_id),
            Some(ticket_id),
            json!({ "evaluation_id": evaluation.evaluation_id, "score": score }),
        )
        .await;
        Ok(evaluation)
    }

    pub async fn evaluation_for_ticket(
        &self,
        ticket_id: TicketId,
    ) -> Result<Option<Evaluation>, DeskError> {
        let store = self.store.lock().await;
        require_ticket(&store, ticket_id)?;
        store
            .evaluation_for_ticket(ticket_id)
            .map_err(DeskError::Store)
    }

    /// Evaluations of tickets whose current assignee is `staff_id`.
    pub async fn evaluations_by_staff(
        &self,
        staff_id: StaffId,
    ) -> Result<Vec<StaffTicketEvaluation>, DeskError> {
        let store = self.store.lock().await;
        require_staff(&store, staff_id)?;
        let mut out = Vec::new();
        for ticket in currently_assigned(&store, staff_id)? {
            let Some(evaluation) = store
                .evaluation_for_ticket(ticket.ticket_id)
                .map_err(DeskError::Store)?
            else {
                continue;
            };
            out.push(StaffTicketEvaluation {
                evaluation_id: evaluation.evaluation_id,
                ticket_id: ticket.ticket_id,
                subject: ticket.subject,
                customer_id: evaluation.customer_id,
                score: evaluation.score,
                comment: evaluation.comment,
                created_at: evaluation.created_at,
            });
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub async fn staff_rating_summary(
        &self,
        staff_id: StaffId,
    ) -> Result<StaffRatingSummary, DeskError> {
        let evaluations = self.evaluations_by_staff(staff_id).await?;
        let scores: Vec<u8> = evaluations.iter().map(|e| e.score).collect();
        Ok(rating_summary(staff_id, &scores))
    }

    async fn record(&self, action: &str, actor: Actor, ticket_id: Option<TicketId>, detail: Value) {
        let rec = AuditRecord::new(action, actor, ticket_id, self.clock.now(), detail);
        if let Err(err) = self.audit.append(rec).await {
            warn!(action, error = %err, "audit append failed");
        }
    }
}

fn already_evaluated(ticket_id: TicketId) -> DeskError {
    DeskError::InvalidState(format!("ticket {ticket_id} has already been evaluated"))
}

fn required_text(field: &str, value: &str) -> Result<String, DeskError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DeskError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn require_ticket(store: &StoreBackend, id: TicketId) -> Result<Ticket, DeskError> {
    store
        .get_ticket(id)
        .map_err(DeskError::Store)?
        .ok_or_else(|| DeskError::NotFound(format!("ticket {id}")))
}

fn require_staff(store: &StoreBackend, id: StaffId) -> Result<Staff, DeskError> {
    store
        .get_staff(id)
        .map_err(DeskError::Store)?
        .ok_or_else(|| DeskError::NotFound(format!("staff {id}")))
}

fn require_customer(store: &StoreBackend, id: CustomerId) -> Result<Customer, DeskError> {
    store
        .get_customer(id)
        .map_err(DeskError::Store)?
        .ok_or_else(|| DeskError::NotFound(format!("customer {id}")))
}

fn require_department(store: &StoreBackend, id: DepartmentId) -> Result<Department, DeskError> {
    store
        .get_department(id)
        .map_err(DeskError::Store)?
        .ok_or_else(|| DeskError::NotFound(format!("department {id}")))
}

fn require_leader(store: &StoreBackend, id: StaffId) -> Result<Staff, DeskError> {
    let leader = require_staff(store, id)?;
    has_role(&leader, StaffRole::Lead)
        .into_result()
        .map_err(DeskError::Forbidden)?;
    Ok(leader)
}

/// The current assignee, or a lead of the ticket's department.
fn require_worker(store: &StoreBackend, staff_id: StaffId, ticket: &Ticket) -> Result<Staff, DeskError> {
    let staff = require_staff(store, staff_id)?;
    same_department(&staff, ticket)
        .into_result()
        .map_err(DeskError::Forbidden)?;
    let history = store
        .assignments_for_ticket(ticket.ticket_id)
        .map_err(DeskError::Store)?;
    let is_assignee = current_assignment(&history)
        .map(|a| a.assigned_to == staff_id)
        .unwrap_or(false);
    if is_assignee || has_role(&staff, StaffRole::Lead).is_allowed() {
        Ok(staff)
    } else {
        Err(DeskError::Forbidden(format!(
            "staff {staff_id} is not working on ticket {}",
            ticket.ticket_id
        )))
    }
}

/// Who may close or reopen: the owner, department staff, or the system.
fn authorize_ticket_actor(
    store: &StoreBackend,
    actor: Actor,
    ticket: &Ticket,
) -> Result<(), DeskError> {
    match actor {
        Actor::System => Ok(()),
        Actor::Customer(id) if id == ticket.customer_id => Ok(()),
        Actor::Customer(id) => Err(DeskError::Forbidden(format!(
            "customer {id} does not own ticket {}",
            ticket.ticket_id
        ))),
        Actor::Staff(id) => {
            let staff = require_staff(store, id)?;
            if !staff.active {
                return Err(DeskError::Forbidden(format!("staff {id} is inactive")));
            }
            same_department(&staff, ticket)
                .into_result()
                .map_err(DeskError::Forbidden)
        }
    }
}

fn currently_assigned(store: &StoreBackend, staff_id: StaffId) -> Result<Vec<Ticket>, DeskError> {
    let mut tickets = Vec::new();
    for ticket_id in store
        .ticket_ids_ever_assigned_to(staff_id)
        .map_err(DeskError::Store)?
    {
        let history = store
            .assignments_for_ticket(ticket_id)
            .map_err(DeskError::Store)?;
        if current_assignment(&history).map(|a| a.assigned_to) != Some(staff_id) {
            continue;
        }
        if let Some(ticket) = store.get_ticket(ticket_id).map_err(DeskError::Store)? {
            tickets.push(ticket);
        }
    }
    Ok(tickets)
}
