//! Atomic per-currency balances with reserve / commit / release semantics.
//!
//! One `parking_lot::Mutex` per currency behind an `FnvIndexMap` so mutators are serialized
//! per currency rather than behind a single global lock.

use crate::{
    event_bus::{EventBus, Topic},
    money::{Currency, Money},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};
use thiserror::Error;

pub type FnvIndexMap<K, V> = indexmap::IndexMap<K, V, fnv::FnvBuildHasher>;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BalanceError {
    #[error("currency {0} is not configured")]
    UnknownCurrency(String),
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: String, available: String },
    #[error("reservation {0} not found")]
    UnknownReservation(u64),
    #[error("commit actual_used ({actual_used}) exceeds reservation amount ({amount})")]
    CommitExceedsReservation { actual_used: String, amount: String },
    #[error("timed out waiting to acquire balance lock for {0}")]
    Timeout(String),
}

/// Per-currency `(total, available, reserved)` triple. `total == available + reserved` always.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: Currency,
    pub total: Money,
    pub available: Money,
    pub reserved: Money,
}

impl Balance {
    pub fn zero(currency: &Currency) -> Self {
        Self {
            currency: currency.clone(),
            total: Money::zero_in(currency),
            available: Money::zero_in(currency),
            reserved: Money::zero_in(currency),
        }
    }

    pub fn new(currency: &Currency, total: Money) -> Self {
        Self {
            currency: currency.clone(),
            total: total.clone(),
            available: total,
            reserved: Money::zero_in(currency),
        }
    }
}

/// A handle produced by [`BalanceManager::reserve`], consumed exactly once by
/// [`BalanceManager::commit`] or [`BalanceManager::release`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: u64,
    pub currency: Currency,
    pub amount: Money,
    pub owner_tag: String,
    pub created_at: DateTime<Utc>,
}

struct CurrencyLedger {
    balance: Mutex<Balance>,
    /// Live reservations against this currency, keyed by reservation id. Orphan-scanned by
    /// startup recovery.
    reservations: Mutex<HashMap<u64, Reservation>>,
}

/// The sole writer of balances. No other component mutates `Balance` state directly.
pub struct BalanceManager {
    ledgers: FnvIndexMap<Currency, CurrencyLedger>,
    next_reservation_id: AtomicU64,
    events: EventBus,
}

impl BalanceManager {
    pub fn new(starting: Vec<Balance>, events: EventBus) -> Self {
        let ledgers = starting
            .into_iter()
            .map(|balance| {
                let currency = balance.currency.clone();
                (
                    currency,
                    CurrencyLedger {
                        balance: Mutex::new(balance),
                        reservations: Mutex::new(HashMap::new()),
                    },
                )
            })
            .collect();

        Self {
            ledgers,
            next_reservation_id: AtomicU64::new(1),
            events,
        }
    }

    fn ledger(&self, currency: &Currency) -> Result<&CurrencyLedger, BalanceError> {
        self.ledgers
            .get(currency)
            .ok_or_else(|| BalanceError::UnknownCurrency(currency.as_str().to_string()))
    }

    /// Reserve `amount` of `currency` for `owner_tag`. Fails with `InsufficientFunds` if
    /// `available < amount`.
    pub fn reserve(
        &self,
        currency: &Currency,
        amount: Money,
        owner_tag: impl Into<String>,
    ) -> Result<Reservation, BalanceError> {
        let ledger = self.ledger(currency)?;
        let mut balance = ledger.balance.lock();

        let available = balance
            .available
            .checked_cmp(&amount)
            .map_err(|_| BalanceError::UnknownCurrency(currency.as_str().to_string()))?;
        if available == std::cmp::Ordering::Less {
            return Err(BalanceError::InsufficientFunds {
                requested: amount.as_decimal().to_string(),
                available: balance.available.as_decimal().to_string(),
            });
        }

        balance.available = balance
            .available
            .checked_sub(&amount)
            .expect("currency checked above");
        balance.reserved = balance
            .reserved
            .checked_add(&amount)
            .expect("same currency by construction");

        let id = self.next_reservation_id.fetch_add(1, AtomicOrdering::Relaxed);
        let reservation = Reservation {
            id,
            currency: currency.clone(),
            amount,
            owner_tag: owner_tag.into(),
            created_at: Utc::now(),
        };
        ledger
            .reservations
            .lock()
            .insert(id, reservation.clone());

        self.events.publish(Topic::BalanceChanged, &balance.clone());
        Ok(reservation)
    }

    /// Commit a reservation: `actual_used <= reservation.amount` is subtracted from `total`, the
    /// full reservation amount is released from `reserved`, and the difference refunds
    /// `available`.
    pub fn commit(
        &self,
        reservation: &Reservation,
        actual_used: Money,
    ) -> Result<(), BalanceError> {
        let ledger = self.ledger(&reservation.currency)?;

        if actual_used
            .checked_cmp(&reservation.amount)
            .map(|ord| ord == std::cmp::Ordering::Greater)
            .unwrap_or(true)
        {
            return Err(BalanceError::CommitExceedsReservation {
                actual_used: actual_used.as_decimal().to_string(),
                amount: reservation.amount.as_decimal().to_string(),
            });
        }

        let removed = ledger.reservations.lock().remove(&reservation.id);
        if removed.is_none() {
            return Err(BalanceError::UnknownReservation(reservation.id));
        }

        let mut balance = ledger.balance.lock();
        let refund = reservation
            .amount
            .checked_sub(&actual_used)
            .expect("actual_used <= amount checked above");

        balance.total = balance
            .total
            .checked_sub(&actual_used)
            .expect("same currency by construction");
        balance.reserved = balance
            .reserved
            .checked_sub(&reservation.amount)
            .expect("same currency by construction");
        balance.available = balance
            .available
            .checked_add(&refund)
            .expect("same currency by construction");

        self.events.publish(Topic::BalanceChanged, &balance.clone());
        Ok(())
    }

    /// Release a reservation in full back to `available`.
    pub fn release(&self, reservation: &Reservation) -> Result<(), BalanceError> {
        let ledger = self.ledger(&reservation.currency)?;

        let removed = ledger.reservations.lock().remove(&reservation.id);
        if removed.is_none() {
            return Err(BalanceError::UnknownReservation(reservation.id));
        }

        let mut balance = ledger.balance.lock();
        balance.reserved = balance
            .reserved
            .checked_sub(&reservation.amount)
            .expect("same currency by construction");
        balance.available = balance
            .available
            .checked_add(&reservation.amount)
            .expect("same currency by construction");

        self.events.publish(Topic::BalanceChanged, &balance.clone());
        Ok(())
    }

    /// Increase `total` and `available` — used when a fill credits the receive-side asset.
    pub fn credit(
        &self,
        currency: &Currency,
        amount: Money,
        _reason: impl Into<String>,
    ) -> Result<(), BalanceError> {
        let ledger = self.ledger(currency)?;
        let mut balance = ledger.balance.lock();
        balance.total = balance
            .total
            .checked_add(&amount)
            .expect("same currency by construction");
        balance.available = balance
            .available
            .checked_add(&amount)
            .expect("same currency by construction");

        self.events.publish(Topic::BalanceChanged, &balance.clone());
        Ok(())
    }

    /// Immutable view of every configured currency's balance.
    pub fn snapshot(&self) -> Vec<Balance> {
        self.ledgers
            .values()
            .map(|ledger| ledger.balance.lock().clone())
            .collect()
    }

    pub fn balance_of(&self, currency: &Currency) -> Result<Balance, BalanceError> {
        Ok(self.ledger(currency)?.balance.lock().clone())
    }

    /// Reservations with no associated non-terminal order, as seen by the Balance Manager alone.
    /// Startup recovery cross-references this against Order Persistence before releasing any of
    /// them.
    pub fn live_reservations(&self) -> Vec<Reservation> {
        self.ledgers
            .values()
            .flat_map(|ledger| ledger.reservations.lock().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Force-release a reservation by id without requiring the caller to hold the `Reservation`
    /// value — used by startup recovery when reconstructing orphans from disk.
    pub fn release_by_id(&self, currency: &Currency, id: u64) -> Result<(), BalanceError> {
        let reservation = self.reservation_by_id(currency, id)?;
        self.release(&reservation)
    }

    /// Commit a reservation by id without requiring the caller to hold the `Reservation` value —
    /// used when recovering a reservation from a durable `OrderRecord` that only stored the id.
    pub fn commit_by_id(
        &self,
        currency: &Currency,
        id: u64,
        actual_used: Money,
    ) -> Result<(), BalanceError> {
        let reservation = self.reservation_by_id(currency, id)?;
        self.commit(&reservation, actual_used)
    }

    /// Look up a live reservation by id, cloning the handle. Fails with
    /// [`BalanceError::UnknownReservation`] once the reservation has already been committed or
    /// released — reservations are consumed exactly once.
    pub fn reservation_by_id(&self, currency: &Currency, id: u64) -> Result<Reservation, BalanceError> {
        let ledger = self.ledger(currency)?;
        ledger
            .reservations
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BalanceError::UnknownReservation(id))
    }

    /// Verifies that the sum of live reservations per currency equals `reserved`.
    pub fn verify_invariants(&self) -> Result<(), BalanceError> {
        for (currency, ledger) in self.ledgers.iter() {
            let balance = ledger.balance.lock();
            let sum_reserved = ledger
                .reservations
                .lock()
                .values()
                .try_fold(Money::zero_in(currency), |acc, r| acc.checked_add(&r.amount))
                .expect("reservations share ledger currency");

            if sum_reserved != balance.reserved {
                return Err(BalanceError::CommitExceedsReservation {
                    actual_used: sum_reserved.as_decimal().to_string(),
                    amount: balance.reserved.as_decimal().to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use proptest::prelude::*;

    fn usdt_manager(starting: &str) -> (BalanceManager, Currency) {
        let usdt = Currency::new("usdt");
        let bus = EventBus::new(Default::default());
        let balance = Balance::new(&usdt, Money::parse(&usdt, starting).unwrap());
        (BalanceManager::new(vec![balance], bus), usdt)
    }

    #[test]
    fn reserve_then_commit_moves_total_and_available() {
        let (mgr, usdt) = usdt_manager("10000");
        let reservation = mgr
            .reserve(&usdt, Money::parse(&usdt, "5005").unwrap(), "agent-a")
            .unwrap();

        mgr.commit(&reservation, Money::parse(&usdt, "5005").unwrap())
            .unwrap();

        let balance = mgr.balance_of(&usdt).unwrap();
        assert_eq!(balance.total.as_decimal().to_string(), "4995.00000000");
        assert_eq!(balance.available.as_decimal().to_string(), "4995.00000000");
        assert_eq!(balance.reserved.as_decimal().to_string(), "0.00000000");
    }

    #[test]
    fn reserve_insufficient_funds() {
        let (mgr, usdt) = usdt_manager("100");
        let err = mgr
            .reserve(&usdt, Money::parse(&usdt, "5005").unwrap(), "agent-a")
            .unwrap_err();
        assert!(matches!(err, BalanceError::InsufficientFunds { .. }));
    }

    #[test]
    fn release_refunds_available_in_full() {
        let (mgr, usdt) = usdt_manager("10000");
        let reservation = mgr
            .reserve(&usdt, Money::parse(&usdt, "500").unwrap(), "agent-a")
            .unwrap();
        mgr.release(&reservation).unwrap();

        let balance = mgr.balance_of(&usdt).unwrap();
        assert_eq!(balance.available.as_decimal().to_string(), "10000.00000000");
        assert_eq!(balance.reserved.as_decimal().to_string(), "0.00000000");
    }

    #[test]
    fn partial_commit_refunds_difference() {
        let (mgr, usdt) = usdt_manager("10000");
        let reservation = mgr
            .reserve(&usdt, Money::parse(&usdt, "1000").unwrap(), "agent-a")
            .unwrap();
        mgr.commit(&reservation, Money::parse(&usdt, "600").unwrap())
            .unwrap();

        let balance = mgr.balance_of(&usdt).unwrap();
        // total -= 600, reserved -= 1000, available += (1000 - 600)
        assert_eq!(balance.total.as_decimal().to_string(), "9400.00000000");
        assert_eq!(balance.available.as_decimal().to_string(), "9400.00000000");
        assert_eq!(balance.reserved.as_decimal().to_string(), "0.00000000");
    }

    #[test]
    fn invariant_holds_across_concurrent_reservations() {
        let (mgr, usdt) = usdt_manager("1000000");
        std::thread::scope(|scope| {
            for i in 0..50 {
                let mgr = &mgr;
                let usdt = &usdt;
                scope.spawn(move || {
                    let r = mgr
                        .reserve(usdt, Money::parse(usdt, "10").unwrap(), format!("agent-{i}"))
                        .unwrap();
                    mgr.commit(&r, Money::parse(usdt, "5").unwrap()).unwrap();
                });
            }
        });
        mgr.verify_invariants().unwrap();
        let balance = mgr.balance_of(&usdt).unwrap();
        assert_eq!(balance.total.as_decimal().to_string(), "999750.00000000");
    }

    proptest! {
        // Testable property #1: for every currency, total == available + reserved and all three
        // stay non-negative, across an arbitrary interleaving of reserve/commit/release/credit.
        #[test]
        fn balance_invariant_holds_across_any_operation_sequence(
            ops in proptest::collection::vec(balance_op_strategy(), 1..200)
        ) {
            let (mgr, usdt) = usdt_manager("1000000000");
            let mut open: Vec<Reservation> = Vec::new();

            for op in ops {
                match op {
                    BalanceOp::Reserve(amount) => {
                        if let Ok(r) = mgr.reserve(&usdt, Money::parse(&usdt, &amount.to_string()).unwrap(), "proptest") {
                            open.push(r);
                        }
                    }
                    BalanceOp::Commit(idx, used_fraction) => {
                        if open.is_empty() {
                            continue;
                        }
                        let r = open.swap_remove(idx % open.len());
                        let used = (r.amount.as_decimal() * used_fraction).round_dp(8);
                        let used_money = Money::parse(&usdt, &used.to_string()).unwrap();
                        mgr.commit(&r, used_money).unwrap();
                    }
                    BalanceOp::Release(idx) => {
                        if open.is_empty() {
                            continue;
                        }
                        let r = open.swap_remove(idx % open.len());
                        mgr.release(&r).unwrap();
                    }
                    BalanceOp::Credit(amount) => {
                        mgr.credit(&usdt, Money::parse(&usdt, &amount.to_string()).unwrap(), "proptest").unwrap();
                    }
                }

                let balance = mgr.balance_of(&usdt).unwrap();
                prop_assert!(!balance.total.is_negative());
                prop_assert!(!balance.available.is_negative());
                prop_assert!(!balance.reserved.is_negative());
                prop_assert_eq!(
                    balance.total.as_decimal(),
                    balance.available.as_decimal() + balance.reserved.as_decimal()
                );
                prop_assert!(mgr.verify_invariants().is_ok());
            }
        }
    }

    #[derive(Debug, Clone)]
    enum BalanceOp {
        Reserve(rust_decimal::Decimal),
        Commit(usize, rust_decimal::Decimal),
        Release(usize),
        Credit(rust_decimal::Decimal),
    }

    fn balance_op_strategy() -> impl Strategy<Value = BalanceOp> {
        prop_oneof![
            (1u64..5_000).prop_map(|cents| BalanceOp::Reserve(rust_decimal::Decimal::new(cents as i64, 2))),
            (any::<usize>(), 0u32..100)
                .prop_map(|(idx, pct)| BalanceOp::Commit(idx, rust_decimal::Decimal::new(pct as i64, 2))),
            any::<usize>().prop_map(BalanceOp::Release),
            (1u64..5_000).prop_map(|cents| BalanceOp::Credit(rust_decimal::Decimal::new(cents as i64, 2))),
        ]
    }
}
