//! Accounts held between a prepare call and the stream that uses them.

use crate::account::PooledAccount;
use crate::util::random_hex;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Lease {
    account: PooledAccount,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseCounters {
    created: AtomicU64,
    released: AtomicU64,
    expired: AtomicU64,
    release_not_found: AtomicU64,
    sweep_runs: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LeaseStats {
    pub active: usize,
    pub created_total: u64,
    pub released_total: u64,
    pub expired_total: u64,
    pub release_not_found_total: u64,
    pub sweep_runs_total: u64,
    pub estimated_unreleased: u64,
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

pub struct LeaseTable {
    leases: Mutex<FxHashMap<String, Lease>>,
    counters: LeaseCounters,
    ttl: Duration,
    sweep_interval: Duration,
}

impl LeaseTable {
    #[must_use]
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            leases: Mutex::new(FxHashMap::default()),
            counters: LeaseCounters::default(),
            ttl,
            sweep_interval,
        })
    }

    /// Park an account under a fresh lease id.
    pub fn hold(&self, account: PooledAccount) -> String {
        self.hold_at(account, Instant::now())
    }

    fn hold_at(&self, account: PooledAccount, now: Instant) -> String {
        let lease_id = random_hex(16);
        let expired = {
            let mut leases = self.leases.lock();
            let expired = pop_expired(&mut leases, now);
            leases.insert(
                lease_id.clone(),
                Lease {
                    account,
                    expires_at: now + self.ttl,
                },
            );
            expired
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.note_expired(expired);
        lease_id
    }

    /// Release a lease's account back to the pool. `false` when the id is
    /// unknown or already gone.
    pub fn release(&self, lease_id: &str) -> bool {
        self.release_at(lease_id, Instant::now())
    }

    fn release_at(&self, lease_id: &str, now: Instant) -> bool {
        let lease_id = lease_id.trim();
        let (lease, expired) = {
            let mut leases = self.leases.lock();
            let expired = pop_expired(&mut leases, now);
            let lease = if lease_id.is_empty() {
                None
            } else {
                leases.remove(lease_id)
            };
            (lease, expired)
        };
        self.note_expired(expired);
        match lease {
            Some(lease) => {
                debug!(account = %lease.account.id(), "lease released");
                lease.account.release();
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.counters.release_not_found.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drop every lease past its deadline.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        self.counters.sweep_runs.fetch_add(1, Ordering::Relaxed);
        let expired = pop_expired(&mut self.leases.lock(), now);
        self.note_expired(expired)
    }

    fn note_expired(&self, expired: Vec<Lease>) -> usize {
        let count = expired.len();
        if count > 0 {
            self.counters
                .expired
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(count, "expired stream leases released");
        }
        // dropping the guards returns the accounts to the pool
        drop(expired);
        count
    }

    #[must_use]
    pub fn stats(&self) -> LeaseStats {
        let active = self.leases.lock().len();
        let created = self.counters.created.load(Ordering::Relaxed);
        let released = self.counters.released.load(Ordering::Relaxed);
        let expired = self.counters.expired.load(Ordering::Relaxed);
        LeaseStats {
            active,
            created_total: created,
            released_total: released,
            expired_total: expired,
            release_not_found_total: self.counters.release_not_found.load(Ordering::Relaxed),
            sweep_runs_total: self.counters.sweep_runs.load(Ordering::Relaxed),
            estimated_unreleased: created.saturating_sub(released + expired),
            ttl_seconds: self.ttl.as_secs(),
            sweep_interval_seconds: self.sweep_interval.as_secs(),
        }
    }

    /// Periodic sweeper. Stops once the table itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let table: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.sweep();
            }
        })
    }
}

fn pop_expired(leases: &mut FxHashMap<String, Lease>, now: Instant) -> Vec<Lease> {
    if leases.is_empty() {
        return Vec::new();
    }
    let expired_ids: Vec<String> = leases
        .iter()
        .filter(|(_, lease)| now > lease.expires_at)
        .map(|(id, _)| id.clone())
        .collect();
    expired_ids
        .iter()
        .filter_map(|id| leases.remove(id))
        .collect()
}
