//! The Order Gateway: the single chokepoint every order passes through. Composes the Circuit
//! Breaker, Symbol Locker, Balance Manager, Exchange, and Order Persistence from independently
//! owned components — no component here holds a back-reference to the Gateway, the Event Bus is
//! the only reverse channel.

use crate::{
    balance::BalanceManager,
    circuit_breaker::CircuitBreaker,
    event_bus::{EventBus, Topic},
    exchange::{Exchange, OrderRequest, RejectReason, SubmitOutcome, ValidateOutcome},
    money::{Currency, Money},
    order::{ClientOrderId, OrderKind, OrderRecord, OrderStatus, Side},
    persistence::OrderPersistence,
    reconciler::PositionReconciler,
    symbol_lock::SymbolLocker,
};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub symbol_lock_timeout: std::time::Duration,
    pub submit_timeout: std::time::Duration,
    pub fetch_poll_interval: std::time::Duration,
    pub fetch_poll_deadline: std::time::Duration,
    /// Extra fraction of notional reserved on top of the estimated fee, to absorb slippage between
    /// estimate and actual fill (`fee_buffer = notional * (fee_rate + fee_buffer_rate)`).
    pub fee_buffer_rate: Decimal,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            symbol_lock_timeout: std::time::Duration::from_millis(500),
            submit_timeout: std::time::Duration::from_secs(5),
            fetch_poll_interval: std::time::Duration::from_millis(200),
            fetch_poll_deadline: std::time::Duration::from_secs(30),
            fee_buffer_rate: Decimal::new(1, 3), // 0.001 extra
        }
    }
}

/// Everything needed to describe one prospective submission. `reference_price` is used only to
/// size the Balance Manager reservation (notional estimate for market orders, or the limit price
/// itself); it is never sent to the exchange for market orders.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub agent_id: String,
    pub symbol: SmolStr,
    pub side: Side,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub limit_price: Option<Decimal>,
    pub reference_price: Decimal,
    pub currency: Currency,
    pub fee_rate_estimate: Decimal,
    /// Caller-supplied nonce: combined with the rest of the request into a deterministic client
    /// order id, so identical retries collapse onto the same id.
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectKind {
    CircuitBreaker,
    SymbolBusy,
    Validation(RejectReason),
    InsufficientFunds,
    ExchangeRejected(RejectReason),
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectKind::CircuitBreaker => write!(f, "circuit_breaker"),
            RejectKind::SymbolBusy => write!(f, "symbol_busy"),
            RejectKind::Validation(reason) => write!(f, "validation:{reason}"),
            RejectKind::InsufficientFunds => write!(f, "insufficient_funds"),
            RejectKind::ExchangeRejected(reason) => write!(f, "exchange_rejected:{reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GatewayOutcome {
    /// A terminal record: `Filled`, `Cancelled`, `Rejected`, or `Expired`.
    Terminal(OrderRecord),
    /// `Exchange.submit` or the post-accept poll timed out; the reservation is retained and
    /// startup recovery must resolve the true outcome.
    PendingVerification(OrderRecord),
    Rejected(RejectKind),
}

/// Deterministic client order id from the request plus its nonce. Uses `fnv`, which is
/// explicitly documented as non-randomized (unlike the default `SipHash`), which this id
/// generator requires.
fn deterministic_client_order_id(request: &SubmitRequest) -> ClientOrderId {
    let mut hasher = fnv::FnvHasher::default();
    request.agent_id.hash(&mut hasher);
    request.symbol.hash(&mut hasher);
    (request.side as u8).hash(&mut hasher);
    request.amount.to_string().hash(&mut hasher);
    request.limit_price.map(|p| p.to_string()).hash(&mut hasher);
    (request.kind as u8).hash(&mut hasher);
    request.nonce.hash(&mut hasher);
    ClientOrderId::new(format!("{:016x}", hasher.finish()))
}

pub struct OrderGateway<E: Exchange> {
    config: GatewayConfig,
    breaker: Arc<CircuitBreaker>,
    locker: Arc<SymbolLocker>,
    balances: Arc<BalanceManager>,
    exchange: Arc<E>,
    persistence: Arc<OrderPersistence>,
    reconciler: Arc<PositionReconciler<E>>,
    events: EventBus,
    portfolio_value: parking_lot::Mutex<Decimal>,
}

impl<E: Exchange> OrderGateway<E> {
    pub fn new(
        config: GatewayConfig,
        breaker: Arc<CircuitBreaker>,
        locker: Arc<SymbolLocker>,
        balances: Arc<BalanceManager>,
        exchange: Arc<E>,
        persistence: Arc<OrderPersistence>,
        reconciler: Arc<PositionReconciler<E>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            breaker,
            locker,
            balances,
            exchange,
            persistence,
            reconciler,
            events,
            portfolio_value: parking_lot::Mutex::new(Decimal::ZERO),
        }
    }

    /// Fed by whatever external valuation pipeline the caller wires up (out of scope for this
    /// core: market-data pricing and the Kelly sizer live in the strategy layer). `submit` reads
    /// the most recent value set here as the `current_value` argument to `CircuitBreaker.check`.
    pub fn mark_portfolio_value(&self, value: Decimal) {
        *self.portfolio_value.lock() = value;
    }

    #[tracing::instrument(skip(self), fields(agent = %request.agent_id, symbol = %request.symbol))]
    pub async fn submit(&self, request: SubmitRequest) -> GatewayOutcome {
        let client_order_id = deterministic_client_order_id(&request);
        let portfolio_value = *self.portfolio_value.lock();

        // Step 2: circuit breaker.
        if self.breaker.check(portfolio_value).is_err() {
            return GatewayOutcome::Rejected(RejectKind::CircuitBreaker);
        }

        // Step 3: symbol lock.
        let guard = match self
            .locker
            .try_lock(&request.symbol, &request.agent_id, self.config.symbol_lock_timeout)
            .await
        {
            Ok(guard) => guard,
            Err(_) => return GatewayOutcome::Rejected(RejectKind::SymbolBusy),
        };

        let order_request = OrderRequest {
            client_order_id: client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            amount: request.amount,
            price: request.limit_price,
        };

        // Step 4: exchange-side predictive validation.
        if let ValidateOutcome::Reject(reason) = self.exchange.validate(&order_request).await {
            drop(guard);
            return GatewayOutcome::Rejected(RejectKind::Validation(reason));
        }

        // Step 5: idempotency check.
        if let Some(existing) = self.persistence.get_by_client_id(&client_order_id) {
            if existing.status.is_terminal() {
                drop(guard);
                return GatewayOutcome::Terminal(existing);
            }
            // Non-terminal record from a previous crashed attempt: adopt it and resume polling.
            return self.poll_until_terminal(existing, guard).await;
        }

        // Step 6: reserve funds.
        let notional = request.amount * request.reference_price;
        let fee_buffer = notional * (request.fee_rate_estimate + self.config.fee_buffer_rate);
        let reserve_amount = notional + fee_buffer;
        let reserve_money = match Money::parse(&request.currency, &reserve_amount.to_string()) {
            Ok(money) => money,
            Err(_) => {
                drop(guard);
                return GatewayOutcome::Rejected(RejectKind::Validation(RejectReason::Other));
            }
        };

        let reservation = match self
            .balances
            .reserve(&request.currency, reserve_money, request.agent_id.clone())
        {
            Ok(reservation) => reservation,
            Err(_) => {
                drop(guard);
                return GatewayOutcome::Rejected(RejectKind::InsufficientFunds);
            }
        };

        // Step 7: persist RESERVED, register with the breaker, publish.
        let mut record = OrderRecord::new(
            client_order_id.clone(),
            request.agent_id.clone(),
            request.symbol.clone(),
            request.side,
            request.kind,
            request.amount,
            request.limit_price,
            &request.currency,
        );
        record.reservation_id = Some(reservation.id);
        record.reservation_currency = Some(request.currency.clone());
        record.transition(OrderStatus::Reserved, None);
        if self.persistence.put(record.clone()).await.is_err() {
            let _ = self.balances.release(&reservation);
            drop(guard);
            return GatewayOutcome::Rejected(RejectKind::Validation(RejectReason::Other));
        }
        let _ = self.breaker.register(client_order_id.as_str());
        self.events.publish(Topic::OrderSubmitted, &client_order_id.to_string());

        // Step 8: submit to the exchange.
        record.transition(OrderStatus::Submitted, None);
        let _ = self.persistence.put(record.clone()).await;

        let submit_result =
            tokio::time::timeout(self.config.submit_timeout, self.exchange.submit(&order_request)).await;

        let submit_outcome = match submit_result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => {
                return self.handle_submit_timeout(record, guard).await;
            }
        };

        match submit_outcome {
            SubmitOutcome::Rejected(reason) => {
                let _ = self.balances.release(&reservation);
                record.transition(OrderStatus::Rejected, Some(reason.to_string()));
                let _ = self.persistence.put(record.clone()).await;
                let _ = self.breaker.complete(client_order_id.as_str(), false);
                self.events
                    .publish(Topic::OrderTerminal, &serde_json::json!({"status": "rejected"}));
                drop(guard);
                GatewayOutcome::Rejected(RejectKind::ExchangeRejected(reason))
            }
            SubmitOutcome::Timeout => self.handle_submit_timeout(record, guard).await,
            SubmitOutcome::Accepted(venue_id) => {
                record.venue_order_id = Some(venue_id);
                record.transition(OrderStatus::Accepted, None);
                let _ = self.persistence.put(record.clone()).await;
                self.poll_until_terminal(record, guard).await
            }
        }
    }

    async fn handle_submit_timeout(
        &self,
        mut record: OrderRecord,
        guard: crate::symbol_lock::SymbolGuard<'_>,
    ) -> GatewayOutcome {
        record.transition(OrderStatus::PendingVerification, None);
        let _ = self.persistence.put(record.clone()).await;
        self.events
            .publish_critical(
                Topic::RiskAlert,
                &serde_json::json!({
                    "client_order_id": record.client_order_id.to_string(),
                    "reason": "submit_timeout",
                }),
            )
            .await
            .ok();
        drop(guard);
        GatewayOutcome::PendingVerification(record)
    }

    /// Poll `Exchange.fetch` with bounded backoff until terminal or deadline.
    async fn poll_until_terminal(
        &self,
        mut record: OrderRecord,
        guard: crate::symbol_lock::SymbolGuard<'_>,
    ) -> GatewayOutcome {
        let deadline = tokio::time::Instant::now() + self.config.fetch_poll_deadline;

        loop {
            let snapshot = match self.exchange.fetch(&record.client_order_id).await {
                Ok(snapshot) => snapshot,
                Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        return self.handle_submit_timeout(record, guard).await;
                    }
                    tokio::time::sleep(self.config.fetch_poll_interval).await;
                    continue;
                }
            };

            if snapshot.status.is_terminal() {
                self.apply_terminal_side_effects(&mut record, &snapshot);
                let _ = self.persistence.put(record.clone()).await;
                let success = snapshot.status == OrderStatus::Filled;
                let _ = self.breaker.complete(record.client_order_id.as_str(), success);
                self.events.publish(
                    Topic::OrderTerminal,
                    &serde_json::json!({"status": snapshot.status.to_string()}),
                );
                drop(guard);
                return GatewayOutcome::Terminal(record);
            }

            if tokio::time::Instant::now() >= deadline {
                return self.handle_submit_timeout(record, guard).await;
            }
            tokio::time::sleep(self.config.fetch_poll_interval).await;
        }
    }

    /// Commit (or release) the reservation and update the internal position to match the
    /// exchange's reported fill.
    fn apply_terminal_side_effects(
        &self,
        record: &mut OrderRecord,
        snapshot: &crate::exchange::OrderSnapshot,
    ) {
        record.venue_order_id = snapshot.venue_order_id.clone().or(record.venue_order_id.clone());
        record.filled_amount = snapshot.filled_amount;
        record.avg_fill_price = snapshot.avg_fill_price;
        record.fees_paid = Money::parse(&snapshot.fee_currency, &snapshot.fees_paid.to_string())
            .unwrap_or_else(|_| Money::zero_in(&snapshot.fee_currency));

        if let (Some(reservation_id), Some(currency)) =
            (record.reservation_id, record.reservation_currency.clone())
        {
            let reservation = self.balances.reservation_by_id(&currency, reservation_id);
            if let Ok(reservation) = reservation {
                let actual_used = self.actual_used(record, snapshot);
                if let Ok(actual_used_money) = Money::parse(&currency, &actual_used.to_string()) {
                    if self.balances.commit(&reservation, actual_used_money).is_err() {
                        let _ = self.balances.release(&reservation);
                    }
                } else {
                    let _ = self.balances.release(&reservation);
                }
            }
        }

        if snapshot.status == OrderStatus::Filled || snapshot.filled_amount > Decimal::ZERO {
            let mut position = self
                .reconciler
                .internal_position(&record.symbol)
                .unwrap_or_else(|| crate::order::Position::flat(record.symbol.clone(), record.fees_paid.currency()));
            position.apply_fill(record.side, snapshot.filled_amount, snapshot.avg_fill_price.unwrap_or_default());
            self.reconciler.record_internal_position(position);
        }

        record.transition(snapshot.status, None);
    }

    /// The quote-currency amount actually consumed from the reservation: notional plus fees for a
    /// buy (the reservation was sized in quote currency), or just the filled base quantity for a
    /// sell (the reservation was sized in base currency; proceeds are credited separately).
    fn actual_used(&self, record: &OrderRecord, snapshot: &crate::exchange::OrderSnapshot) -> Decimal {
        match record.side {
            Side::Buy => {
                let notional = snapshot.filled_amount * snapshot.avg_fill_price.unwrap_or_default();
                notional + snapshot.fees_paid
            }
            Side::Sell => snapshot.filled_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
        event_bus::EventBus,
        mock_exchange::{MockExchange, SymbolSpec},
        reconciler::ReconcilerConfig,
    };
    use rust_decimal_macros::dec;

    async fn build_system(
        label: &str,
    ) -> (OrderGateway<MockExchange>, Currency, Arc<BalanceManager>) {
        let usdt = Currency::new("usdt");
        let btc = Currency::new("btc");
        let events = EventBus::new(Default::default());

        let breaker_path = std::env::temp_dir().join(format!("gateway_test_cb_{label}.json"));
        let _ = std::fs::remove_file(&breaker_path);
        let breaker = Arc::new(
            CircuitBreaker::load_or_new(
                breaker_path,
                dec!(10000),
                CircuitBreakerConfig {
                    loss_threshold: dec!(0.1),
                    reconcile_fail_limit: 3,
                    drain_deadline: std::time::Duration::from_secs(5),
                    cooldown: chrono::Duration::seconds(0),
                },
                events.clone(),
            )
            .unwrap(),
        );

        let locker = Arc::new(SymbolLocker::new());
        let balances = Arc::new(BalanceManager::new(
            vec![crate::balance::Balance::new(&usdt, Money::parse(&usdt, "10000").unwrap())],
            events.clone(),
        ));

        let exchange = Arc::new(MockExchange::new(
            vec![SymbolSpec {
                symbol: SmolStr::new("BTC-USDT"),
                base: btc.clone(),
                quote: usdt.clone(),
                min_notional: dec!(10),
                tick_size: dec!(0.01),
                maker_fee: dec!(0.0008),
                taker_fee: dec!(0.001),
            }],
            vec![crate::balance::Balance::new(&usdt, Money::parse(&usdt, "1000000").unwrap())],
            dec!(0),
            usdt.clone(),
            events.clone(),
        ));
        exchange.set_reference_price("BTC-USDT", dec!(50000));

        let persistence_path = std::env::temp_dir().join(format!("gateway_test_persist_{label}.jsonl"));
        let _ = std::fs::remove_file(&persistence_path);
        let persistence = Arc::new(OrderPersistence::open(persistence_path).await.unwrap());

        let reconciler = Arc::new(PositionReconciler::new(
            ReconcilerConfig::default(),
            exchange.clone(),
            breaker.clone(),
            persistence.clone(),
            events.clone(),
        ));

        let gateway = OrderGateway::new(
            GatewayConfig::default(),
            breaker,
            locker,
            balances.clone(),
            exchange,
            persistence,
            reconciler,
            events,
        );
        gateway.mark_portfolio_value(dec!(10000));

        (gateway, usdt, balances)
    }

    fn req(nonce: u64) -> SubmitRequest {
        SubmitRequest {
            agent_id: "agent-a".into(),
            symbol: SmolStr::new("BTC-USDT"),
            side: Side::Buy,
            kind: OrderKind::Market,
            amount: dec!(0.1),
            limit_price: None,
            reference_price: dec!(50000),
            currency: Currency::new("usdt"),
            fee_rate_estimate: dec!(0.001),
            nonce,
        }
    }

    #[tokio::test]
    async fn happy_path_fills_and_settles_balance() {
        let (gateway, usdt, balances) = build_system("happy_path").await;

        let outcome = gateway.submit(req(1)).await;
        let record = match outcome {
            GatewayOutcome::Terminal(record) => record,
            other => panic!("expected terminal outcome, got {other:?}"),
        };
        assert_eq!(record.status, OrderStatus::Filled);

        let balance = balances.balance_of(&usdt).unwrap();
        assert_eq!(balance.total.as_decimal().to_string(), "4995.00000000");
        assert_eq!(balance.available.as_decimal().to_string(), "4995.00000000");
        assert_eq!(balance.reserved.as_decimal().to_string(), "0.00000000");
    }

    #[tokio::test]
    async fn insufficient_funds_rejected_with_no_reservation() {
        let (gateway, usdt, balances) = build_system("insufficient_funds").await;
        let mut request = req(2);
        request.amount = dec!(1); // notional 50_000 against a 10_000 balance
        let outcome = gateway.submit(request).await;
        assert!(matches!(
            outcome,
            GatewayOutcome::Rejected(RejectKind::InsufficientFunds)
        ));

        let balance = balances.balance_of(&usdt).unwrap();
        assert_eq!(balance.reserved.as_decimal().to_string(), "0.00000000");
    }

    #[tokio::test]
    async fn idempotent_retry_returns_existing_terminal_record() {
        let (gateway, _usdt, balances) = build_system("idempotent_retry").await;
        let first = gateway.submit(req(42)).await;
        let first_record = match first {
            GatewayOutcome::Terminal(record) => record,
            other => panic!("expected terminal, got {other:?}"),
        };

        let second = gateway.submit(req(42)).await;
        let second_record = match second {
            GatewayOutcome::Terminal(record) => record,
            other => panic!("expected terminal, got {other:?}"),
        };

        assert_eq!(first_record.client_order_id, second_record.client_order_id);
        let balance = balances.balance_of(&Currency::new("usdt")).unwrap();
        // Only one fill's worth of notional+fees was ever debited.
        assert_eq!(balance.total.as_decimal().to_string(), "4995.00000000");
    }
}
