//! Per-symbol mutual exclusion so at most one in-flight order can touch a given symbol's balance
//! reservations and position state at a time. An explicit lock with a release-on-every-exit-path
//! guard.

use crate::balance::FnvIndexMap;
use smol_str::SmolStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for symbol lock")]
    Timeout(std::time::Duration),
}

struct Registry {
    mutexes: FnvIndexMap<SmolStr, Arc<tokio::sync::Mutex<()>>>,
    owners: FnvIndexMap<SmolStr, String>,
}

/// Owns one `tokio::sync::Mutex<()>` per symbol, created lazily on first use and never removed
/// (symbol sets are small and bounded by the venue's instrument list).
pub struct SymbolLocker {
    registry: parking_lot::Mutex<Registry>,
}

impl SymbolLocker {
    pub fn new() -> Self {
        Self {
            registry: parking_lot::Mutex::new(Registry {
                mutexes: FnvIndexMap::default(),
                owners: FnvIndexMap::default(),
            }),
        }
    }

    fn mutex_for(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self.registry.lock();
        registry
            .mutexes
            .entry(SmolStr::new(symbol))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `symbol`, blocking (asynchronously) until available.
    pub async fn lock(&self, symbol: &str, owner_tag: impl Into<String>) -> SymbolGuard<'_> {
        let mutex = self.mutex_for(symbol);
        let permit = mutex.lock_owned().await;
        self.registry
            .lock()
            .owners
            .insert(SmolStr::new(symbol), owner_tag.into());
        SymbolGuard {
            locker: self,
            symbol: SmolStr::new(symbol),
            _permit: permit,
        }
    }

    /// Acquire the lock for `symbol`, failing with [`LockError::Timeout`] if it cannot be
    /// acquired within `timeout`. Used by the gateway's submit path so a stuck holder cannot wedge
    /// the whole symbol indefinitely.
    pub async fn try_lock(
        &self,
        symbol: &str,
        owner_tag: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<SymbolGuard<'_>, LockError> {
        let mutex = self.mutex_for(symbol);
        let permit = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockError::Timeout(timeout))?;
        self.registry
            .lock()
            .owners
            .insert(SmolStr::new(symbol), owner_tag.into());
        Ok(SymbolGuard {
            locker: self,
            symbol: SmolStr::new(symbol),
            _permit: permit,
        })
    }

    /// Debug/observability snapshot of which owner tag currently (or most recently) held each
    /// symbol's lock. Not synchronized with actual lock state beyond best-effort.
    pub fn owners_snapshot(&self) -> Vec<(String, String)> {
        self.registry
            .lock()
            .owners
            .iter()
            .map(|(symbol, owner)| (symbol.to_string(), owner.clone()))
            .collect()
    }
}

impl Default for SymbolLocker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a held symbol lock. Released on every exit path — normal return, early
/// `?`-propagated error, or panic unwind — because release happens in `Drop`, never in caller code.
pub struct SymbolGuard<'a> {
    locker: &'a SymbolLocker,
    symbol: SmolStr,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl SymbolGuard<'_> {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Drop for SymbolGuard<'_> {
    fn drop(&mut self) {
        self.locker.registry.lock().owners.remove(&self.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_waits_for_first_to_drop() {
        let locker = SymbolLocker::new();
        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let guard = locker.lock("BTC-USDT", "order-1").await;

        let first = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            order.lock().push(1);
            drop(guard);
        };
        let second = async {
            let _guard = locker.lock("BTC-USDT", "order-2").await;
            order.lock().push(2);
        };
        tokio::join!(first, second);

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn try_lock_times_out_when_held() {
        let locker = SymbolLocker::new();
        let _guard = locker.lock("BTC-USDT", "order-1").await;

        let result = locker
            .try_lock("BTC-USDT", "order-2", std::time::Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
    }

    #[tokio::test]
    async fn owner_tag_cleared_after_guard_drops() {
        let locker = SymbolLocker::new();
        {
            let _guard = locker.lock("ETH-USDT", "order-7").await;
            assert!(locker
                .owners_snapshot()
                .iter()
                .any(|(s, o)| s == "ETH-USDT" && o == "order-7"));
        }
        assert!(locker.owners_snapshot().is_empty());
    }
}
