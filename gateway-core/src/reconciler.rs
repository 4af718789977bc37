//! Periodic internal-vs-exchange position diff: auto-correct within tolerance, otherwise trip the
//! Circuit Breaker and cancel in-flight orders for the mismatched symbol. Runs as a
//! `tokio::time::interval` loop spawned as a background task, publishing outcomes onto the
//! `EventBus` rather than returning them.

use crate::{
    circuit_breaker::CircuitBreaker,
    event_bus::{EventBus, Topic},
    exchange::Exchange,
    order::{Position, VenueOrderId},
    persistence::OrderPersistence,
};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub interval: std::time::Duration,
    pub tolerance: Decimal,
    pub fail_limit: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(30),
            tolerance: Decimal::new(1, 2), // 1%
            fail_limit: 3,
        }
    }
}

pub struct PositionReconciler<E: Exchange> {
    config: ReconcilerConfig,
    exchange: Arc<E>,
    breaker: Arc<CircuitBreaker>,
    persistence: Arc<OrderPersistence>,
    events: EventBus,
    internal_positions: parking_lot::Mutex<std::collections::HashMap<SmolStr, Position>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CycleOutcome {
    Ok,
    Mismatch,
}

impl<E: Exchange> PositionReconciler<E> {
    pub fn new(
        config: ReconcilerConfig,
        exchange: Arc<E>,
        breaker: Arc<CircuitBreaker>,
        persistence: Arc<OrderPersistence>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            exchange,
            breaker,
            persistence,
            events,
            internal_positions: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Record this gateway's own view of `symbol`'s position, as maintained by order fills. The
    /// reconciler diffs this snapshot against the exchange's, it does not derive it
    /// independently.
    pub fn record_internal_position(&self, position: Position) {
        self.internal_positions
            .lock()
            .insert(position.symbol.clone(), position);
    }

    pub fn internal_position(&self, symbol: &str) -> Option<Position> {
        self.internal_positions.lock().get(symbol).cloned()
    }

    /// Run every tracked symbol through one reconciliation cycle, returning the worst outcome
    /// observed (used by startup recovery to decide whether to trip the breaker).
    pub async fn run_cycle(&self) -> CycleOutcome {
        let symbols: Vec<SmolStr> = self.internal_positions.lock().keys().cloned().collect();
        let mut worst = CycleOutcome::Ok;

        for symbol in symbols {
            let outcome = self.reconcile_symbol(&symbol).await;
            if outcome == CycleOutcome::Mismatch {
                worst = CycleOutcome::Mismatch;
            }
        }
        worst
    }

    async fn reconcile_symbol(&self, symbol: &str) -> CycleOutcome {
        let internal = self
            .internal_positions
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol, &crate::money::Currency::new("usd")));

        let exchange_positions = self
            .exchange
            .fetch_positions(Some(symbol))
            .await
            .unwrap_or_default();
        let exchange_position = exchange_positions.into_iter().next();

        let exchange_qty = exchange_position
            .as_ref()
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        let denom = exchange_qty.abs().max(Decimal::ONE);
        let relative_diff = (internal.quantity - exchange_qty).abs() / denom;

        if relative_diff <= self.config.tolerance {
            let mut synced = internal;
            synced.quantity = exchange_qty;
            self.internal_positions
                .lock()
                .insert(SmolStr::new(symbol), synced);
            let _ = self.breaker.record_reconcile_result(true);
            self.events.publish(
                Topic::ReconcileOk,
                &serde_json::json!({"symbol": symbol, "qty": exchange_qty.to_string()}),
            );
            CycleOutcome::Ok
        } else {
            self.events
                .publish_critical(
                    Topic::RiskPositionMismatch,
                    &serde_json::json!({
                        "symbol": symbol,
                        "internal_qty": internal.quantity.to_string(),
                        "exchange_qty": exchange_qty.to_string(),
                        "relative_diff": relative_diff.to_string(),
                    }),
                )
                .await
                .ok();

            self.cancel_in_flight_for_symbol(symbol).await;
            let _ = self.breaker.record_reconcile_result(false);
            if self.breaker.snapshot().consecutive_reconcile_failures >= self.config.fail_limit {
                let _ = self.breaker.trip(format!("position mismatch on {symbol}"));
            }
            CycleOutcome::Mismatch
        }
    }

    async fn cancel_in_flight_for_symbol(&self, symbol: &str) {
        for record in self.persistence.list_by_symbol(symbol) {
            if record.status.is_terminal() {
                continue;
            }
            if let Some(venue_id) = &record.venue_order_id {
                let _ = self.exchange.cancel(venue_id).await;
            }
        }
    }

    /// Spawn the periodic background loop. Returns a handle the caller can `.abort()` on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }
}
