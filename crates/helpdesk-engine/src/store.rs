use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use helpdesk_config::Store as StoreConfig;
use helpdesk_contracts::{
    AssignmentId, Customer, CustomerId, Department, DepartmentId, Evaluation, EvaluationId,
    Priority, ReplyId, SenderKind, Specialty, Staff, StaffId, StaffRole, Ticket,
    TicketAssignment, TicketId, TicketReply, TicketStatus,
};
use helpdesk_kernel::{format_timestamp, parse_timestamp};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Row};

pub(crate) struct TicketDraft {
    pub customer_id: CustomerId,
    pub department_id: DepartmentId,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub created_at: NaiveDateTime,
}

pub(crate) struct AssignmentDraft {
    pub ticket_id: TicketId,
    pub assigned_to: StaffId,
    pub assigned_by: StaffId,
    pub assigned_at: NaiveDateTime,
    pub role_needed: Specialty,
    pub note: Option<String>,
}

pub(crate) struct ReplyDraft {
    pub ticket_id: TicketId,
    pub sender_kind: SenderKind,
    pub sender_id: i64,
    pub message: String,
    pub image_ref: Option<String>,
    pub created_at: NaiveDateTime,
}

pub(crate) struct EvaluationDraft {
    pub ticket_id: TicketId,
    pub customer_id: CustomerId,
    pub score: u8,
    pub comment: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Final values of the lifecycle columns after a transition.
pub(crate) struct StatusWrite {
    pub to: TicketStatus,
    pub reopened_at: Option<NaiveDateTime>,
    pub closed_at: Option<NaiveDateTime>,
}

pub(crate) enum EvaluationInsert {
    Inserted(Evaluation),
    Duplicate,
}

pub(crate) enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    departments: BTreeMap<DepartmentId, Department>,
    staff: BTreeMap<StaffId, Staff>,
    customers: BTreeMap<CustomerId, Customer>,
    tickets: BTreeMap<TicketId, Ticket>,
    assignments: Vec<TicketAssignment>,
    replies: Vec<TicketReply>,
    evaluations: Vec<Evaluation>,
    seq: Sequences,
}

#[derive(Default)]
struct Sequences {
    department: i64,
    staff: i64,
    customer: i64,
    ticket: i64,
    assignment: i64,
    reply: i64,
    evaluation: i64,
}

fn bump(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

pub(crate) struct SqliteStore {
    conn: Connection,
}

impl StoreBackend {
    pub(crate) fn open(cfg: &StoreConfig) -> Result<Self, String> {
        match cfg.kind.as_str() {
            "memory" => Ok(StoreBackend::Memory(MemoryStore::default())),
            "sqlite" => {
                let path = cfg
                    .sqlite_path
                    .as_deref()
                    .ok_or_else(|| "store.sqlite_path is required for sqlite".to_string())?;
                Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
            }
            other => Err(format!("unsupported store type: {other}")),
        }
    }

    // -- directory ---------------------------------------------------------

    pub(crate) fn insert_department(&mut self, name: &str) -> Result<Department, String> {
        match self {
            StoreBackend::Memory(store) => {
                let department = Department {
                    department_id: DepartmentId(bump(&mut store.seq.department)),
                    name: name.to_string(),
                };
                store
                    .departments
                    .insert(department.department_id, department.clone());
                Ok(department)
            }
            StoreBackend::Sqlite(store) => store.insert_department(name),
        }
    }

    pub(crate) fn insert_staff(
        &mut self,
        name: &str,
        department_id: DepartmentId,
        role: StaffRole,
    ) -> Result<Staff, String> {
        match self {
            StoreBackend::Memory(store) => {
                let staff = Staff {
                    staff_id: StaffId(bump(&mut store.seq.staff)),
                    name: name.to_string(),
                    department_id,
                    role,
                    active: true,
                };
                store.staff.insert(staff.staff_id, staff.clone());
                Ok(staff)
            }
            StoreBackend::Sqlite(store) => store.insert_staff(name, department_id, role),
        }
    }

    pub(crate) fn insert_customer(&mut self, name: &str) -> Result<Customer, String> {
        match self {
            StoreBackend::Memory(store) => {
                let customer = Customer {
                    customer_id: CustomerId(bump(&mut store.seq.customer)),
                    name: name.to_string(),
                };
                store
                    .customers
                    .insert(customer.customer_id, customer.clone());
                Ok(customer)
            }
            StoreBackend::Sqlite(store) => store.insert_customer(name),
        }
    }

    pub(crate) fn get_department(&self, id: DepartmentId) -> Result<Option<Department>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.departments.get(&id).cloned()),
            StoreBackend::Sqlite(store) => store.get_department(id),
        }
    }

    pub(crate) fn get_staff(&self, id: StaffId) -> Result<Option<Staff>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.staff.get(&id).cloned()),
            StoreBackend::Sqlite(store) => store.get_staff(id),
        }
    }

    pub(crate) fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.customers.get(&id).cloned()),
            StoreBackend::Sqlite(store) => store.get_customer(id),
        }
    }

    /// Staff of one department, ascending id.
    pub(crate) fn staff_in_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<Vec<Staff>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .staff
                .values()
                .filter(|s| s.department_id == department_id)
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.staff_in_department(department_id),
        }
    }

    // -- tickets -----------------------------------------------------------

    pub(crate) fn insert_ticket(&mut self, draft: TicketDraft) -> Result<Ticket, String> {
        match self {
            StoreBackend::Memory(store) => {
                let ticket = Ticket {
                    ticket_id: TicketId(bump(&mut store.seq.ticket)),
                    customer_id: draft.customer_id,
                    department_id: draft.department_id,
                    subject: draft.subject,
                    description: draft.description,
                    priority: draft.priority,
                    status: TicketStatus::Open,
                    created_at: draft.created_at,
                    reopened_at: None,
                    closed_at: None,
                };
                store.tickets.insert(ticket.ticket_id, ticket.clone());
                Ok(ticket)
            }
            StoreBackend::Sqlite(store) => store.insert_ticket(draft),
        }
    }

    pub(crate) fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.tickets.get(&id).cloned()),
            StoreBackend::Sqlite(store) => store.get_ticket(id),
        }
    }

    /// Newest first.
    pub(crate) fn tickets_by_customer(&self, customer_id: CustomerId) -> Result<Vec<Ticket>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(newest_first(
                store
                    .tickets
                    .values()
                    .filter(|t| t.customer_id == customer_id)
                    .cloned()
                    .collect(),
            )),
            StoreBackend::Sqlite(store) => store.query_all(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE customer_id = ?1
                     ORDER BY created_at DESC, ticket_id DESC"
                ),
                params![customer_id.0],
                ticket_from_row,
            ),
        }
    }

    /// Newest first.
    pub(crate) fn tickets_by_department(
        &self,
        department_id: DepartmentId,
    ) -> Result<Vec<Ticket>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(newest_first(
                store
                    .tickets
                    .values()
                    .filter(|t| t.department_id == department_id)
                    .cloned()
                    .collect(),
            )),
            StoreBackend::Sqlite(store) => store.query_all(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE department_id = ?1
                     ORDER BY created_at DESC, ticket_id DESC"
                ),
                params![department_id.0],
                ticket_from_row,
            ),
        }
    }

    /// One page of ticket ids in `status`, ascending, strictly after `after`. Rows are not
    /// decoded here, so one malformed ticket cannot sink the whole page.
    pub(crate) fn ticket_ids_by_status_page(
        &self,
        status: TicketStatus,
        after: Option<TicketId>,
        limit: usize,
    ) -> Result<Vec<TicketId>, String> {
        let after = after.map(|id| id.0).unwrap_or(0);
        match self {
            StoreBackend::Memory(store) => Ok(store
                .tickets
                .range(TicketId(after.saturating_add(1))..)
                .filter(|(_, t)| t.status == status)
                .map(|(id, _)| *id)
                .take(limit)
                .collect()),
            StoreBackend::Sqlite(store) => store.query_all(
                "SELECT ticket_id FROM tickets WHERE status = ?1 AND ticket_id > ?2
                 ORDER BY ticket_id ASC LIMIT ?3",
                params![status.as_str(), after, limit as i64],
                |row| Ok(TicketId(row.get(0)?)),
            ),
        }
    }

    /// Compare-and-swap on status. `Ok(false)` when the ticket moved on or vanished.
    pub(crate) fn update_status(
        &mut self,
        id: TicketId,
        expected: TicketStatus,
        write: StatusWrite,
    ) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => match store.tickets.get_mut(&id) {
                Some(ticket) if ticket.status == expected => {
                    ticket.status = write.to;
                    ticket.reopened_at = write.reopened_at;
                    ticket.closed_at = write.closed_at;
                    Ok(true)
                }
                _ => Ok(false),
            },
            StoreBackend::Sqlite(store) => store.update_status(id, expected, write),
        }
    }

    /// Removes an OPEN, never-assigned ticket together with its replies.
    pub(crate) fn delete_ticket(&mut self, id: TicketId) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => {
                let deletable = store
                    .tickets
                    .get(&id)
                    .map(|t| t.status == TicketStatus::Open)
                    .unwrap_or(false)
                    && !store.assignments.iter().any(|a| a.ticket_id == id);
                if !deletable {
                    return Ok(false);
                }
                store.replies.retain(|r| r.ticket_id != id);
                store.tickets.remove(&id);
                Ok(true)
            }
            StoreBackend::Sqlite(store) => store.delete_ticket(id),
        }
    }

    // -- assignments -------------------------------------------------------

    /// Inserts the assignment and moves the ticket OPEN -> ASSIGNED as one unit.
    /// `Ok(None)` when the ticket was no longer OPEN.
    pub(crate) fn assign(
        &mut self,
        draft: AssignmentDraft,
    ) -> Result<Option<TicketAssignment>, String> {
        match self {
            StoreBackend::Memory(store) => {
                match store.tickets.get_mut(&draft.ticket_id) {
                    Some(ticket) if ticket.status == TicketStatus::Open => {
                        ticket.status = TicketStatus::Assigned;
                    }
                    _ => return Ok(None),
                }
                let assignment = TicketAssignment {
                    assignment_id: AssignmentId(bump(&mut store.seq.assignment)),
                    ticket_id: draft.ticket_id,
                    assigned_to: draft.assigned_to,
                    assigned_by: draft.assigned_by,
                    assigned_at: draft.assigned_at,
                    role_needed: draft.role_needed,
                    note: draft.note,
                };
                store.assignments.push(assignment.clone());
                Ok(Some(assignment))
            }
            StoreBackend::Sqlite(store) => store.assign(draft),
        }
    }

    /// Oldest first by (assigned_at, id).
    pub(crate) fn assignments_for_ticket(
        &self,
        ticket_id: TicketId,
    ) -> Result<Vec<TicketAssignment>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut out: Vec<TicketAssignment> = store
                    .assignments
                    .iter()
                    .filter(|a| a.ticket_id == ticket_id)
                    .cloned()
                    .collect();
                out.sort_by_key(|a| (a.assigned_at, a.assignment_id));
                Ok(out)
            }
            StoreBackend::Sqlite(store) => store.query_all(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM ticket_assignments WHERE ticket_id = ?1
                     ORDER BY assigned_at ASC, assignment_id ASC"
                ),
                params![ticket_id.0],
                assignment_from_row,
            ),
        }
    }

    /// Every ticket the staff member was ever assigned, ascending id.
    pub(crate) fn ticket_ids_ever_assigned_to(
        &self,
        staff_id: StaffId,
    ) -> Result<Vec<TicketId>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut ids: Vec<TicketId> = store
                    .assignments
                    .iter()
                    .filter(|a| a.assigned_to == staff_id)
                    .map(|a| a.ticket_id)
                    .collect();
                ids.sort();
                ids.dedup();
                Ok(ids)
            }
            StoreBackend::Sqlite(store) => store.query_all(
                "SELECT DISTINCT ticket_id FROM ticket_assignments WHERE assigned_to = ?1
                 ORDER BY ticket_id ASC",
                params![staff_id.0],
                |row| Ok(TicketId(row.get(0)?)),
            ),
        }
    }

    // -- replies -----------------------------------------------------------

    pub(crate) fn insert_reply(&mut self, draft: ReplyDraft) -> Result<TicketReply, String> {
        match self {
            StoreBackend::Memory(store) => {
                let reply = TicketReply {
                    reply_id: ReplyId(bump(&mut store.seq.reply)),
                    ticket_id: draft.ticket_id,
                    sender_kind: draft.sender_kind,
                    sender_id: draft.sender_id,
                    message: draft.message,
                    image_ref: draft.image_ref,
                    created_at: draft.created_at,
                };
                store.replies.push(reply.clone());
                Ok(reply)
            }
            StoreBackend::Sqlite(store) => store.insert_reply(draft),
        }
    }

    /// Oldest first by (created_at, id).
    pub(crate) fn replies_for_ticket(&self, ticket_id: TicketId) -> Result<Vec<TicketReply>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let mut out: Vec<TicketReply> = store
                    .replies
                    .iter()
                    .filter(|r| r.ticket_id == ticket_id)
                    .cloned()
                    .collect();
                out.sort_by_key(|r| (r.created_at, r.reply_id));
                Ok(out)
            }
            StoreBackend::Sqlite(store) => store.query_all(
                &format!(
                    "SELECT {REPLY_COLUMNS} FROM ticket_replies WHERE ticket_id = ?1
                     ORDER BY created_at ASC, reply_id ASC"
                ),
                params![ticket_id.0],
                reply_from_row,
            ),
        }
    }

    // -- evaluations -------------------------------------------------------

    /// At most one evaluation per ticket; the second writer gets `Duplicate`.
    pub(crate) fn insert_evaluation(
        &mut self,
        draft: EvaluationDraft,
    ) -> Result<EvaluationInsert, String> {
        match self {
            StoreBackend::Memory(store) => {
                if store
                    .evaluations
                    .iter()
                    .any(|e| e.ticket_id == draft.ticket_id)
                {
                    return Ok(EvaluationInsert::Duplicate);
                }
                let evaluation = Evaluation {
                    evaluation_id: EvaluationId(bump(&mut store.seq.evaluation)),
                    ticket_id: draft.ticket_id,
                    customer_id: draft.customer_id,
                    score: draft.score,
                    comment: draft.comment,
                    created_at: draft.created_at,
                };
                store.evaluations.push(evaluation.clone());
                Ok(EvaluationInsert::Inserted(evaluation))
            }
            StoreBackend::Sqlite(store) => store.insert_evaluation(draft),
        }
    }

    pub(crate) fn evaluation_for_ticket(
        &self,
        ticket_id: TicketId,
    ) -> Result<Option<Evaluation>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .evaluations
                .iter()
                .find(|e| e.ticket_id == ticket_id)
                .cloned()),
            StoreBackend::Sqlite(store) => store.evaluation_for_ticket(ticket_id),
        }
    }
}

fn newest_first(mut tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets.sort_by(|a, b| (b.created_at, b.ticket_id).cmp(&(a.created_at, a.ticket_id)));
    tickets
}

const TICKET_COLUMNS: &str = "ticket_id, customer_id, department_id, subject, description, \
                              priority, status, created_at, reopened_at, closed_at";
const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, ticket_id, assigned_to, assigned_by, assigned_at, role_needed, note";
const REPLY_COLUMNS: &str =
    "reply_id, ticket_id, sender_kind, sender_id, message, image_ref, created_at";
const EVALUATION_COLUMNS: &str =
    "evaluation_id, ticket_id, customer_id, score, comment, created_at";
const STAFF_COLUMNS: &str = "staff_id, name, department_id, role, active";

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS departments (
                department_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS staff (
                staff_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                department_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                active INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS customers (
                customer_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tickets (
                ticket_id INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_id INTEGER NOT NULL,
                department_id INTEGER NOT NULL,
                subject TEXT NOT NULL,
                description TEXT NOT NULL,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                reopened_at TEXT,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS tickets_by_status ON tickets (status, ticket_id);
            CREATE INDEX IF NOT EXISTS tickets_by_customer ON tickets (customer_id);
            CREATE INDEX IF NOT EXISTS tickets_by_department ON tickets (department_id);
            CREATE TABLE IF NOT EXISTS ticket_assignments (
                assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL,
                assigned_to INTEGER NOT NULL,
                assigned_by INTEGER NOT NULL,
                assigned_at TEXT NOT NULL,
                role_needed TEXT NOT NULL,
                note TEXT
            );
            CREATE INDEX IF NOT EXISTS assignments_by_ticket ON ticket_assignments (ticket_id);
            CREATE INDEX IF NOT EXISTS assignments_by_staff ON ticket_assignments (assigned_to);
            CREATE TABLE IF NOT EXISTS ticket_replies (
                reply_id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL,
                sender_kind TEXT NOT NULL,
                sender_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                image_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS replies_by_ticket ON ticket_replies (ticket_id);
            CREATE TABLE IF NOT EXISTS evaluations (
                evaluation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL UNIQUE,
                customer_id INTEGER NOT NULL,
                score INTEGER NOT NULL CHECK (score BETWEEN 1 AND 5),
                comment TEXT,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn query_all<T, P: Params>(
        &self,
        sql: &str,
        args: P,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, String> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(args, map)
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| e.to_string());
        rows
    }

    fn insert_department(&mut self, name: &str) -> Result<Department, String> {
        self.conn
            .execute("INSERT INTO departments(name) VALUES (?1)", params![name])
            .map_err(|e| e.to_string())?;
        Ok(Department {
            department_id: DepartmentId(self.conn.last_insert_rowid()),
            name: name.to_string(),
        })
    }

    fn insert_staff(
        &mut self,
        name: &str,
        department_id: DepartmentId,
        role: StaffRole,
    ) -> Result<Staff, String> {
        self.conn
            .execute(
                "INSERT INTO staff(name, department_id, role, active) VALUES (?1, ?2, ?3, 1)",
                params![name, department_id.0, role.as_str()],
            )
            .map_err(|e| e.to_string())?;
        Ok(Staff {
            staff_id: StaffId(self.conn.last_insert_rowid()),
            name: name.to_string(),
            department_id,
            role,
            active: true,
        })
    }

    fn insert_customer(&mut self, name: &str) -> Result<Customer, String> {
        self.conn
            .execute("INSERT INTO customers(name) VALUES (?1)", params![name])
            .map_err(|e| e.to_string())?;
        Ok(Customer {
            customer_id: CustomerId(self.conn.last_insert_rowid()),
            name: name.to_string(),
        })
    }

    fn get_department(&self, id: DepartmentId) -> Result<Option<Department>, String> {
        self.conn
            .query_row(
                "SELECT department_id, name FROM departments WHERE department_id = ?1",
                params![id.0],
                |row| {
                    Ok(Department {
                        department_id: DepartmentId(row.get(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn get_staff(&self, id: StaffId) -> Result<Option<Staff>, String> {
        self.conn
            .query_row(
                &format!("SELECT {STAFF_COLUMNS} FROM staff WHERE staff_id = ?1"),
                params![id.0],
                staff_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>, String> {
        self.conn
            .query_row(
                "SELECT customer_id, name FROM customers WHERE customer_id = ?1",
                params![id.0],
                |row| {
                    Ok(Customer {
                        customer_id: CustomerId(row.get(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn staff_in_department(&self, department_id: DepartmentId) -> Result<Vec<Staff>, String> {
        self.query_all(
            &format!(
                "SELECT {STAFF_COLUMNS} FROM staff WHERE department_id = ?1 ORDER BY staff_id ASC"
            ),
            params![department_id.0],
            staff_from_row,
        )
    }

    fn insert_ticket(&mut self, draft: TicketDraft) -> Result<Ticket, String> {
        self.conn
            .execute(
                "INSERT INTO tickets
                 (customer_id, department_id, subject, description, priority, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    draft.customer_id.0,
                    draft.department_id.0,
                    draft.subject,
                    draft.description,
                    draft.priority.as_str(),
                    TicketStatus::Open.as_str(),
                    format_timestamp(draft.created_at),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(Ticket {
            ticket_id: TicketId(self.conn.last_insert_rowid()),
            customer_id: draft.customer_id,
            department_id: draft.department_id,
            subject: draft.subject,
            description: draft.description,
            priority: draft.priority,
            status: TicketStatus::Open,
            created_at: draft.created_at,
            reopened_at: None,
            closed_at: None,
        })
    }

    fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, String> {
        self.conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id = ?1"),
                params![id.0],
                ticket_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn update_status(
        &mut self,
        id: TicketId,
        expected: TicketStatus,
        write: StatusWrite,
    ) -> Result<bool, String> {
        let updated = self
            .conn
            .execute(
                "UPDATE tickets SET status = ?1, reopened_at = ?2, closed_at = ?3
                 WHERE ticket_id = ?4 AND status = ?5",
                params![
                    write.to.as_str(),
                    write.reopened_at.map(format_timestamp),
                    write.closed_at.map(format_timestamp),
                    id.0,
                    expected.as_str(),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(updated == 1)
    }

    fn delete_ticket(&mut self, id: TicketId) -> Result<bool, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let deleted = tx
            .execute(
                "DELETE FROM tickets WHERE ticket_id = ?1 AND status = ?2
                 AND NOT EXISTS (SELECT 1 FROM ticket_assignments WHERE ticket_id = ?1)",
                params![id.0, TicketStatus::Open.as_str()],
            )
            .map_err(|e| e.to_string())?;
        if deleted == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM ticket_replies WHERE ticket_id = ?1",
            params![id.0],
        )
        .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(true)
    }

    fn assign(&mut self, draft: AssignmentDraft) -> Result<Option<TicketAssignment>, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let moved = tx
            .execute(
                "UPDATE tickets SET status = ?1 WHERE ticket_id = ?2 AND status = ?3",
                params![
                    TicketStatus::Assigned.as_str(),
                    draft.ticket_id.0,
                    TicketStatus::Open.as_str(),
                ],
            )
            .map_err(|e| e.to_string())?;
        if moved == 0 {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO ticket_assignments
             (ticket_id, assigned_to, assigned_by, assigned_at, role_needed, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                draft.ticket_id.0,
                draft.assigned_to.0,
                draft.assigned_by.0,
                format_timestamp(draft.assigned_at),
                draft.role_needed.as_str(),
                draft.note,
            ],
        )
        .map_err(|e| e.to_string())?;
        let assignment_id = AssignmentId(tx.last_insert_rowid());
        tx.commit().map_err(|e| e.to_string())?;
        Ok(Some(TicketAssignment {
            assignment_id,
            ticket_id: draft.ticket_id,
            assigned_to: draft.assigned_to,
            assigned_by: draft.assigned_by,
            assigned_at: draft.assigned_at,
            role_needed: draft.role_needed,
            note: draft.note,
        }))
    }

    fn insert_reply(&mut self, draft: ReplyDraft) -> Result<TicketReply, String> {
        self.conn
            .execute(
                "INSERT INTO ticket_replies
                 (ticket_id, sender_kind, sender_id, message, image_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.ticket_id.0,
                    draft.sender_kind.as_str(),
                    draft.sender_id,
                    draft.message,
                    draft.image_ref,
                    format_timestamp(draft.created_at),
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(TicketReply {
            reply_id: ReplyId(self.conn.last_insert_rowid()),
            ticket_id: draft.ticket_id,
            sender_kind: draft.sender_kind,
            sender_id: draft.sender_id,
            message: draft.message,
            image_ref: draft.image_ref,
            created_at: draft.created_at,
        })
    }

    fn insert_evaluation(&mut self, draft: EvaluationDraft) -> Result<EvaluationInsert, String> {
        let inserted = self.conn.execute(
            "INSERT INTO evaluations (ticket_id, customer_id, score, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                draft.ticket_id.0,
                draft.customer_id.0,
                i64::from(draft.score),
                draft.comment,
                format_timestamp(draft.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Ok(EvaluationInsert::Duplicate);
            }
            Err(e) => return Err(e.to_string()),
        }
        Ok(EvaluationInsert::Inserted(Evaluation {
            evaluation_id: EvaluationId(self.conn.last_insert_rowid()),
            ticket_id: draft.ticket_id,
            customer_id: draft.customer_id,
            score: draft.score,
            comment: draft.comment,
            created_at: draft.created_at,
        }))
    }

    fn evaluation_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Evaluation>, String> {
        self.conn
            .query_row(
                &format!("SELECT {EVALUATION_COLUMNS} FROM evaluations WHERE ticket_id = ?1"),
                params![ticket_id.0],
                evaluation_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {raw}")))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp: {raw}"))),
        None => Ok(None),
    }
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        ticket_id: TicketId(row.get(0)?),
        customer_id: CustomerId(row.get(1)?),
        department_id: DepartmentId(row.get(2)?),
        subject: row.get(3)?,
        description: row.get(4)?,
        priority: enum_column(row, 5)?,
        status: enum_column(row, 6)?,
        created_at: timestamp_column(row, 7)?,
        reopened_at: optional_timestamp_column(row, 8)?,
        closed_at: optional_timestamp_column(row, 9)?,
    })
}

fn staff_from_row(row: &Row<'_>) -> rusqlite::Result<Staff> {
    Ok(Staff {
        staff_id: StaffId(row.get(0)?),
        name: row.get(1)?,
        department_id: DepartmentId(row.get(2)?),
        role: enum_column(row, 3)?,
        active: row.get(4)?,
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<TicketAssignment> {
    Ok(TicketAssignment {
        assignment_id: AssignmentId(row.get(0)?),
        ticket_id: TicketId(row.get(1)?),
        assigned_to: StaffId(row.get(2)?),
        assigned_by: StaffId(row.get(3)?),
        assigned_at: timestamp_column(row, 4)?,
        role_needed: enum_column(row, 5)?,
        note: row.get(6)?,
    })
}

fn reply_from_row(row: &Row<'_>) -> rusqlite::Result<TicketReply> {
    Ok(TicketReply {
        reply_id: ReplyId(row.get(0)?),
        ticket_id: TicketId(row.get(1)?),
        sender_kind: enum_column(row, 2)?,
        sender_id: row.get(3)?,
        message: row.get(4)?,
        image_ref: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

fn evaluation_from_row(row: &Row<'_>) -> rusqlite::Result<Evaluation> {
    let score: i64 = row.get(3)?;
    Ok(Evaluation {
        evaluation_id: EvaluationId(row.get(0)?),
        ticket_id: TicketId(row.get(1)?),
        customer_id: CustomerId(row.get(2)?),
        score: u8::try_from(score).map_err(|e| conversion_error(3, e.to_string()))?,
        comment: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 4, day)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    /// Memory and SQLite stores; the SQLite file goes away once the loop is done.
    struct Backends {
        stores: std::vec::IntoIter<StoreBackend>,
        db_path: std::path::PathBuf,
    }

    impl Iterator for Backends {
        type Item = StoreBackend;

        fn next(&mut self) -> Option<StoreBackend> {
            self.stores.next()
        }
    }

    impl Drop for Backends {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn backends() -> Backends {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let n = SEQ.fetch_add(1, Ordering::SeqCst);
        let db_path = std::env::temp_dir().join(format!("helpdesk-store-{nanos}-{n}.db"));
        let stores = vec![
            StoreBackend::Memory(MemoryStore::default()),
            StoreBackend::Sqlite(SqliteStore::new(&db_path.to_string_lossy()).unwrap()),
        ];
        Backends {
            stores: stores.into_iter(),
            db_path,
        }
    }

    fn draft(customer: CustomerId, department: DepartmentId, day: u32) -> TicketDraft {
        TicketDraft {
            customer_id: customer,
            department_id: department,
            subject: format!("ticket from day {day}"),
            description: String::new(),
            priority: Priority::Medium,
            created_at: at(day),
        }
    }

    #[test]
    fn status_write_is_compare_and_swap() {
        for mut store in backends() {
            let ticket = store
                .insert_ticket(draft(CustomerId(1), DepartmentId(1), 1))
                .unwrap();
            let close = || StatusWrite {
                to: TicketStatus::Closed,
                reopened_at: None,
                closed_at: Some(at(2)),
            };
            assert!(!store
                .update_status(ticket.ticket_id, TicketStatus::InProgress, close())
                .unwrap());
            assert!(store
                .update_status(ticket.ticket_id, TicketStatus::Open, close())
                .unwrap());
            let stored = store.get_ticket(ticket.ticket_id).unwrap().unwrap();
            assert_eq!(stored.status, TicketStatus::Closed);
            assert_eq!(stored.closed_at, Some(at(2)));
        }
    }

    #[test]
    fn assign_moves_status_and_records_history_together() {
        for mut store in backends() {
            let ticket = store
                .insert_ticket(draft(CustomerId(1), DepartmentId(1), 1))
                .unwrap();
            let assignment = |note: &str| AssignmentDraft {
                ticket_id: ticket.ticket_id,
                assigned_to: StaffId(2),
                assigned_by: StaffId(3),
                assigned_at: at(2),
                role_needed: Specialty::Technical,
                note: Some(note.to_string()),
            };
            assert!(store.assign(assignment("first")).unwrap().is_some());
            assert!(store.assign(assignment("second")).unwrap().is_none());
            let history = store.assignments_for_ticket(ticket.ticket_id).unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].note.as_deref(), Some("first"));
            assert_eq!(
                store.get_ticket(ticket.ticket_id).unwrap().unwrap().status,
                TicketStatus::Assigned
            );
        }
    }

    #[test]
    fn customer_listing_is_newest_first() {
        for mut store in backends() {
            for day in [3, 1, 2] {
                store
                    .insert_ticket(draft(CustomerId(7), DepartmentId(1), day))
                    .unwrap();
            }
            store
                .insert_ticket(draft(CustomerId(8), DepartmentId(1), 4))
                .unwrap();
            let days: Vec<NaiveDateTime> = store
                .tickets_by_customer(CustomerId(7))
                .unwrap()
                .into_iter()
                .map(|t| t.created_at)
                .collect();
            assert_eq!(days, vec![at(3), at(2), at(1)]);
        }
    }

    #[test]
    fn status_pages_resume_after_cursor() {
        for mut store in backends() {
            for day in 1..=5 {
                store
                    .insert_ticket(draft(CustomerId(1), DepartmentId(1), day))
                    .unwrap();
            }
            let first = store
                .ticket_ids_by_status_page(TicketStatus::Open, None, 2)
                .unwrap();
            assert_eq!(first.len(), 2);
            let second = store
                .ticket_ids_by_status_page(TicketStatus::Open, Some(first[1]), 10)
                .unwrap();
            assert_eq!(second.len(), 3);
            assert!(second[0] > first[1]);
        }
    }

    #[test]
    fn second_evaluation_for_a_ticket_is_a_duplicate() {
        for mut store in backends() {
            let evaluation = |score| EvaluationDraft {
                ticket_id: TicketId(1),
                customer_id: CustomerId(1),
                score,
                comment: None,
                created_at: at(1),
            };
            assert!(matches!(
                store.insert_evaluation(evaluation(4)).unwrap(),
                EvaluationInsert::Inserted(_)
            ));
            assert!(matches!(
                store.insert_evaluation(evaluation(5)).unwrap(),
                EvaluationInsert::Duplicate
            ));
            assert_eq!(
                store
                    .evaluation_for_ticket(TicketId(1))
                    .unwrap()
                    .map(|e| e.score),
                Some(4)
            );
        }
    }

    #[test]
    fn delete_takes_replies_with_the_ticket() {
        for mut store in backends() {
            let ticket = store
                .insert_ticket(draft(CustomerId(1), DepartmentId(1), 1))
                .unwrap();
            store
                .insert_reply(ReplyDraft {
                    ticket_id: ticket.ticket_id,
                    sender_kind: SenderKind::Customer,
                    sender_id: 1,
                    message: "hello".to_string(),
                    image_ref: None,
                    created_at: at(1),
                })
                .unwrap();
            assert!(store.delete_ticket(ticket.ticket_id).unwrap());
            assert!(store.get_ticket(ticket.ticket_id).unwrap().is_none());
            assert!(store.replies_for_ticket(ticket.ticket_id).unwrap().is_empty());
            assert!(!store.delete_ticket(ticket.ticket_id).unwrap());
        }
    }
}
