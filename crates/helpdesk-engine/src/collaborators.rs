use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{Duration, NaiveDateTime, Utc};
use helpdesk_contracts::CustomerId;

/// Source of "now" for every timestamp the desk writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Purchase history lookup owned by the order subsystem.
pub trait OrderValidation: Send + Sync {
    fn count_orders(&self, customer: CustomerId) -> u64;

    fn has_orders(&self, customer: CustomerId) -> bool {
        self.count_orders(customer) > 0
    }
}

/// In-process order counts, for embedding without an order service and for tests.
#[derive(Debug, Default)]
pub struct OrderLedger {
    counts: RwLock<HashMap<CustomerId, u64>>,
}

impl OrderLedger {
    pub fn record_order(&self, customer: CustomerId) {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        *counts.entry(customer).or_insert(0) += 1;
    }
}

impl OrderValidation for OrderLedger {
    fn count_orders(&self, customer: CustomerId) -> u64 {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&customer)
            .copied()
            .unwrap_or(0)
    }
}

/// Remote storage for reply attachments. Deletion is best-effort.
pub trait ImageStore: Send + Sync {
    fn delete(&self, url: &str) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopImageStore;

impl ImageStore for NoopImageStore {
    fn delete(&self, _url: &str) -> Result<(), String> {
        Ok(())
    }
}
