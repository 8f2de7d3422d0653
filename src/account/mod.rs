//! Round-robin pool of upstream accounts.

use crate::config::AccountConfig;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub token: String,
}

impl Account {
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

#[derive(Debug, Default)]
struct PoolQueue {
    available: VecDeque<String>,
    in_use: FxHashSet<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub available_accounts: Vec<String>,
    pub in_use_accounts: Vec<String>,
}

#[derive(Debug)]
pub struct AccountPool {
    accounts: FxHashMap<String, Arc<Account>>,
    queue: Mutex<PoolQueue>,
}

impl AccountPool {
    /// Accounts with a token go to the front; configuration order is kept
    /// otherwise.
    #[must_use]
    pub fn new(configs: &[AccountConfig]) -> Arc<Self> {
        let mut accounts = FxHashMap::default();
        let mut with_token = Vec::new();
        let mut without_token = Vec::new();
        for config in configs {
            let id = config.identifier();
            if id.is_empty() || accounts.contains_key(id) {
                continue;
            }
            let account = Arc::new(Account {
                id: id.to_string(),
                token: config.token.clone(),
            });
            if account.has_token() {
                with_token.push(account.id.clone());
            } else {
                without_token.push(account.id.clone());
            }
            accounts.insert(account.id.clone(), account);
        }
        let available: VecDeque<String> = with_token.into_iter().chain(without_token).collect();
        info!(total = available.len(), "account pool initialized");
        Arc::new(Self {
            accounts,
            queue: Mutex::new(PoolQueue {
                available,
                in_use: FxHashSet::default(),
            }),
        })
    }

    /// Take an account out of rotation.
    ///
    /// With a `target`, only that account is considered and `exclude` is
    /// ignored. Otherwise the first available account with a token wins,
    /// then any available account.
    #[must_use]
    pub fn acquire(
        self: &Arc<Self>,
        target: Option<&str>,
        exclude: &FxHashSet<String>,
    ) -> Option<PooledAccount> {
        let mut queue = self.queue.lock();
        let position = match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => queue.available.iter().position(|id| id == target)?,
            None => {
                let eligible = |id: &String| !exclude.contains(id) && self.accounts.contains_key(id);
                queue
                    .available
                    .iter()
                    .position(|id| eligible(id) && self.accounts[id].has_token())
                    .or_else(|| queue.available.iter().position(eligible))?
            }
        };
        let id = queue.available.remove(position)?;
        let account = self.accounts.get(&id).cloned()?;
        queue.in_use.insert(id);
        drop(queue);
        debug!(account = %account.id, "account acquired");
        Some(PooledAccount {
            pool: Arc::clone(self),
            account,
            released: false,
        })
    }

    /// Return an account to the back of the queue. Returns `false` when the
    /// account was not in use.
    pub fn release(&self, id: &str) -> bool {
        let mut queue = self.queue.lock();
        if !queue.in_use.remove(id) {
            return false;
        }
        queue.available.push_back(id.to_string());
        drop(queue);
        debug!(account = %id, "account released");
        true
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let queue = self.queue.lock();
        let available_accounts: Vec<String> = queue.available.iter().cloned().collect();
        let mut in_use_accounts: Vec<String> = queue.in_use.iter().cloned().collect();
        in_use_accounts.sort_unstable();
        PoolStatus {
            available: available_accounts.len(),
            in_use: in_use_accounts.len(),
            total: self.accounts.len(),
            available_accounts,
            in_use_accounts,
        }
    }
}

/// An acquired account. Goes back to the pool exactly once, when released
/// explicitly or when dropped.
#[derive(Debug)]
pub struct PooledAccount {
    pool: Arc<AccountPool>,
    account: Arc<Account>,
    released: bool,
}

impl PooledAccount {
    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.account.id
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.account.id);
        }
    }
}

impl Drop for PooledAccount {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, token: &str) -> AccountConfig {
        AccountConfig {
            email: Some(id.to_string()),
            mobile: None,
            token: token.to_string(),
        }
    }

    #[test]
    fn accounts_with_tokens_are_preferred() {
        let pool = AccountPool::new(&[account("a", ""), account("b", "tok")]);
        let first = pool.acquire(None, &FxHashSet::default()).expect("account");
        assert_eq!(first.id(), "b");
        let second = pool.acquire(None, &FxHashSet::default()).expect("account");
        assert_eq!(second.id(), "a");
        assert!(pool.acquire(None, &FxHashSet::default()).is_none());
    }

    #[test]
    fn target_and_exclude_are_honoured() {
        let pool = AccountPool::new(&[account("a", "t"), account("b", "t")]);
        let exclude: FxHashSet<String> = ["a".to_string()].into_iter().collect();
        let picked = pool.acquire(None, &exclude).expect("account");
        assert_eq!(picked.id(), "b");
        assert!(pool.acquire(Some("b"), &FxHashSet::default()).is_none());
        let targeted = pool.acquire(Some("a"), &exclude).expect("target ignores exclude");
        assert_eq!(targeted.id(), "a");
    }

    #[test]
    fn drop_releases_once_and_release_is_idempotent() {
        let pool = AccountPool::new(&[account("a", "t")]);
        let guard = pool.acquire(None, &FxHashSet::default()).expect("account");
        assert_eq!(pool.status().in_use, 1);
        drop(guard);
        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.available_accounts, vec!["a".to_string()]);
        assert!(!pool.release("a"));
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn released_accounts_rotate_to_the_back() {
        let pool = AccountPool::new(&[account("a", "t"), account("b", "t")]);
        pool.acquire(None, &FxHashSet::default())
            .expect("account")
            .release();
        assert_eq!(pool.status().available_accounts, vec!["b", "a"]);
    }
}
