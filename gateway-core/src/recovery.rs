//! Startup recovery: before the gateway accepts any new submission, resolve every in-flight order
//! left over from an unclean shutdown against the exchange's true state, release orphaned
//! reservations, and run one reconciliation pass. Structured as a single `run` entry point that
//! performs a one-shot state rebuild before the main loop starts.

use crate::{
    balance::BalanceManager,
    circuit_breaker::CircuitBreaker,
    exchange::Exchange,
    money::Money,
    order::{OrderStatus, Position},
    persistence::OrderPersistence,
    reconciler::{CycleOutcome, PositionReconciler},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("persistence error during recovery: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
    #[error("balance error during recovery: {0}")]
    Balance(#[from] crate::balance::BalanceError),
    #[error("circuit breaker error during recovery: {0}")]
    CircuitBreaker(#[from] crate::circuit_breaker::CircuitBreakerError),
}

/// Outcome of one recovery pass, surfaced to the operator at startup.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub resolved_orders: usize,
    pub orphaned_reservations_released: usize,
    pub reconcile_outcome: CycleOutcome,
}

/// Resolve every non-terminal [`OrderRecord`](crate::order::OrderRecord) against `exchange`'s
/// authoritative state, release any reservation with no owning in-flight order, then run one
/// reconciliation cycle before returning. The Circuit Breaker's own reload already happened in
/// [`CircuitBreaker::load_or_new`]; this function only seeds its in-flight set back from
/// persistence and, if DRAINING was collapsed to OPEN, leaves it there — a restart mid-drain is
/// treated as equivalent to a completed drain.
pub async fn run<E: Exchange>(
    persistence: Arc<OrderPersistence>,
    balances: Arc<BalanceManager>,
    breaker: Arc<CircuitBreaker>,
    exchange: Arc<E>,
    reconciler: Arc<PositionReconciler<E>>,
) -> Result<RecoveryReport, RecoveryError> {
    let in_flight = persistence.list_needing_recovery();
    let mut resolved = 0usize;

    for mut record in in_flight {
        let snapshot = exchange.fetch(&record.client_order_id).await;

        match snapshot {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                record.filled_amount = snapshot.filled_amount;
                record.avg_fill_price = snapshot.avg_fill_price;
                record.fees_paid = Money::parse(&snapshot.fee_currency, &snapshot.fees_paid.to_string())
                    .unwrap_or_else(|_| Money::zero_in(&snapshot.fee_currency));

                if let (Some(reservation_id), Some(currency)) =
                    (record.reservation_id, record.reservation_currency.clone())
                {
                    if let Ok(reservation) = balances.reservation_by_id(&currency, reservation_id) {
                        let actual_used = match record.side {
                            crate::order::Side::Buy => {
                                snapshot.filled_amount * snapshot.avg_fill_price.unwrap_or_default()
                                    + snapshot.fees_paid
                            }
                            crate::order::Side::Sell => snapshot.filled_amount,
                        };
                        if let Ok(actual_used_money) = Money::parse(&currency, &actual_used.to_string()) {
                            if balances.commit(&reservation, actual_used_money).is_err() {
                                balances.release(&reservation)?;
                            }
                        } else {
                            balances.release(&reservation)?;
                        }
                    }
                }

                if snapshot.filled_amount > rust_decimal::Decimal::ZERO {
                    let mut position = reconciler
                        .internal_position(&record.symbol)
                        .unwrap_or_else(|| Position::flat(record.symbol.clone(), record.fees_paid.currency()));
                    position.apply_fill(
                        record.side,
                        snapshot.filled_amount,
                        snapshot.avg_fill_price.unwrap_or_default(),
                    );
                    reconciler.record_internal_position(position);
                }

                record.transition(snapshot.status, Some("resolved during startup recovery".into()));
                persistence.put(record).await?;
                resolved += 1;
            }
            Ok(_unterminal_snapshot) => {
                // Exchange reports the order is still live; leave it in place for the gateway's
                // own poll loop (or a later recovery pass) to resolve.
            }
            Err(_) => {
                // Exchange is unreachable or never heard of this order: mark it expired and
                // release whatever it was holding rather than block startup indefinitely.
                if let (Some(reservation_id), Some(currency)) =
                    (record.reservation_id, record.reservation_currency.clone())
                {
                    let _ = balances.release_by_id(&currency, reservation_id);
                }
                record.transition(OrderStatus::Expired, Some("exchange unreachable during recovery".into()));
                persistence.put(record).await?;
                resolved += 1;
            }
        }
    }

    // Orphaned reservations: a live reservation whose owning order is now terminal (or never
    // durably recorded, e.g. a crash between reserve() and put()). Reservations are tagged with
    // the submitting agent id, not a client order id, so ownership is resolved through the
    // `reservation_id` each `OrderRecord` stores rather than `owner_tag`.
    let still_owned_reservation_ids: std::collections::HashSet<u64> = persistence
        .list_needing_recovery()
        .into_iter()
        .filter_map(|record| record.reservation_id)
        .collect();

    let mut orphans_released = 0usize;
    for reservation in balances.live_reservations() {
        if !still_owned_reservation_ids.contains(&reservation.id) {
            if balances.release_by_id(&reservation.currency, reservation.id).is_ok() {
                orphans_released += 1;
            }
        }
    }

    let reconcile_outcome = reconciler.run_cycle().await;

    Ok(RecoveryReport {
        resolved_orders: resolved,
        orphaned_reservations_released: orphans_released,
        reconcile_outcome,
    })
}
