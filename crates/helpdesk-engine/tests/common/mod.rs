#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, NaiveDateTime};
use helpdesk_config::{Audit, Config, Logging, Scheduler, Store};
use helpdesk_contracts::{
    CustomerId, DepartmentId, NewTicket, Priority, StaffId, StaffRole, Ticket,
};
use helpdesk_engine::{Collaborators, Desk, ImageStore, ManualClock, OrderLedger};

pub const BACKENDS: [&str; 2] = ["memory", "sqlite"];

static SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn temp_path(prefix: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let n = SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("{prefix}-{nanos}-{n}.{ext}"))
        .to_string_lossy()
        .to_string()
}

pub fn test_config(store_kind: &str) -> Config {
    Config {
        store: Store {
            kind: store_kind.to_string(),
            sqlite_path: (store_kind == "sqlite").then(|| temp_path("helpdesk-db", "db")),
        },
        scheduler: Scheduler::default(),
        audit: Audit {
            jsonl_path: temp_path("helpdesk-audit", "jsonl"),
            immutable_mirror_path: None,
        },
        logging: Logging::default(),
    }
}

/// Removes the store and audit files a test config points at.
pub struct TempFiles(Vec<String>);

impl TempFiles {
    pub fn of(cfg: &Config) -> Self {
        let mut paths = vec![cfg.audit.jsonl_path.clone()];
        paths.extend(cfg.audit.immutable_mirror_path.clone());
        paths.extend(cfg.store.sqlite_path.clone());
        Self(paths)
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(format!("{path}-journal"));
        }
    }
}

pub fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
}

/// Records deletions; urls containing "broken" fail.
#[derive(Default)]
pub struct RecordingImages {
    pub deleted: Mutex<Vec<String>>,
}

impl ImageStore for RecordingImages {
    fn delete(&self, url: &str) -> Result<(), String> {
        if url.contains("broken") {
            return Err("image host unavailable".to_string());
        }
        self.deleted.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub desk: Desk,
    pub cfg: Config,
    pub clock: Arc<ManualClock>,
    pub orders: Arc<OrderLedger>,
    pub images: Arc<RecordingImages>,
    pub support: DepartmentId,
    pub billing: DepartmentId,
    pub lead: StaffId,
    pub tech: StaffId,
    pub finance: StaffId,
    pub agent: StaffId,
    pub billing_lead: StaffId,
    pub billing_tech: StaffId,
    pub customer: CustomerId,
    pub other_customer: CustomerId,
    files: Option<TempFiles>,
}

/// A harness on fresh temp files, removed when it drops.
pub async fn harness(store_kind: &str) -> Harness {
    let cfg = test_config(store_kind);
    let files = TempFiles::of(&cfg);
    let mut h = harness_with(cfg).await;
    h.files = Some(files);
    h
}

/// The caller owns the config's files; pair with [`TempFiles::of`].

pub async fn harness_with(cfg: Config) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let orders = Arc::new(OrderLedger::default());
    let images = Arc::new(RecordingImages::default());
    let desk = Desk::open(
        &cfg,
        Collaborators::new(orders.clone())
            .with_clock(clock.clone())
            .with_images(images.clone()),
    )
    .await
    .unwrap();

    let support = desk.register_department("Support").await.unwrap().department_id;
    let billing = desk.register_department("Billing").await.unwrap().department_id;
    let staff = |name: &'static str, dept: DepartmentId, role: StaffRole| {
        let desk = desk.clone();
        async move { desk.register_staff(name, dept, role).await.unwrap().staff_id }
    };
    let lead = staff("Lena Lead", support, StaffRole::Lead).await;
    let tech = staff("Tom Tech", support, StaffRole::TechnicalSupport).await;
    let finance = staff("Fay Finance", support, StaffRole::FinancialSupport).await;
    let agent = staff("Ada Agent", support, StaffRole::CustomerServiceAgent).await;
    let billing_lead = staff("Bo Lead", billing, StaffRole::Lead).await;
    let billing_tech = staff("Bea Tech", billing, StaffRole::TechnicalSupport).await;

    let customer = desk.register_customer("Cora").await.unwrap().customer_id;
    let other_customer = desk.register_customer("Otto").await.unwrap().customer_id;
    orders.record_order(customer);
    orders.record_order(other_customer);

    Harness {
        desk,
        cfg,
        clock,
        orders,
        images,
        support,
        billing,
        lead,
        tech,
        finance,
        agent,
        billing_lead,
        billing_tech,
        customer,
        other_customer,
        files: None,
    }
}

impl Harness {
    pub async fn open_ticket(&self, subject: &str) -> Ticket {
        self.open_ticket_with(subject, Priority::Medium).await
    }

    pub async fn open_ticket_with(&self, subject: &str, priority: Priority) -> Ticket {
        self.desk
            .create_ticket(
                self.customer,
                NewTicket {
                    department_id: self.support,
                    subject: subject.to_string(),
                    description: "details".to_string(),
                    priority: Some(priority),
                },
            )
            .await
            .unwrap()
    }

    /// OPEN -> ASSIGNED (tech) -> IN_PROGRESS.
    pub async fn in_progress_ticket(&self, subject: &str) -> Ticket {
        let ticket = self.open_ticket(subject).await;
        self.desk
            .assign_ticket(ticket.ticket_id, self.tech, self.lead, None)
            .await
            .unwrap();
        self.desk
            .start_work(ticket.ticket_id, self.tech)
            .await
            .unwrap()
    }

    pub async fn closed_ticket(&self, subject: &str) -> Ticket {
        let ticket = self.in_progress_ticket(subject).await;
        self.desk
            .close_ticket(ticket.ticket_id, helpdesk_contracts::Actor::Staff(self.tech))
            .await
            .unwrap()
    }
}
