//! Deterministic in-memory reference exchange: an account struct holding its own balances and an
//! order book keyed by instrument, matched against a configurable reference-price-plus-slippage
//! model. Exposed directly as a `Mutex`-guarded struct implementing [`Exchange`] since there is
//! exactly one in-process caller (the Gateway) and no cross-task fan-in to arbitrate.

use crate::{
    balance::{Balance, BalanceManager},
    exchange::{
        CancelOutcome, Exchange, ExchangeError, OrderRequest, OrderSnapshot, RejectReason,
        SubmitOutcome, ValidateOutcome,
    },
    money::{Currency, Money},
    order::{ClientOrderId, OrderKind, OrderStatus, Position, Side, VenueOrderId},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

/// Per-symbol venue rules enforced identically by `validate` and `submit`.
#[derive(Debug, Clone)]
pub struct SymbolSpec {
    pub symbol: SmolStr,
    pub base: Currency,
    pub quote: Currency,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
}

struct BookedOrder {
    client_order_id: ClientOrderId,
    venue_order_id: VenueOrderId,
    symbol: SmolStr,
    side: Side,
    kind: OrderKind,
    amount: Decimal,
    price: Option<Decimal>,
    snapshot: OrderSnapshot,
}

/// Reference-price-plus-slippage deterministic matching engine. Given the same seed, price tape,
/// and submission sequence it produces bit-identical outputs — there is no wall-clock or RNG
/// dependence in the fill path, only the caller-supplied reference price and a fixed slippage bps.
pub struct MockExchange {
    specs: HashMap<SmolStr, SymbolSpec>,
    reference_prices: parking_lot::Mutex<HashMap<SmolStr, Decimal>>,
    slippage_bps: Decimal,
    balances: BalanceManager,
    orders: parking_lot::Mutex<HashMap<ClientOrderId, BookedOrder>>,
    positions: parking_lot::Mutex<HashMap<SmolStr, Position>>,
    next_venue_id: AtomicU64,
    pnl_currency: Currency,
}

impl MockExchange {
    pub fn new(
        specs: Vec<SymbolSpec>,
        starting_balances: Vec<Balance>,
        slippage_bps: Decimal,
        pnl_currency: Currency,
        events: crate::event_bus::EventBus,
    ) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.symbol.clone(), spec))
                .collect(),
            reference_prices: parking_lot::Mutex::new(HashMap::new()),
            slippage_bps,
            balances: BalanceManager::new(starting_balances, events),
            orders: parking_lot::Mutex::new(HashMap::new()),
            positions: parking_lot::Mutex::new(HashMap::new()),
            next_venue_id: AtomicU64::new(1),
            pnl_currency,
        }
    }

    /// Feed the next reference price for `symbol` — the "price tape" driving deterministic fills.
    pub fn set_reference_price(&self, symbol: &str, price: Decimal) {
        self.reference_prices
            .lock()
            .insert(SmolStr::new(symbol), price);
    }

    pub fn reference_price(&self, symbol: &str) -> Option<Decimal> {
        self.reference_prices.lock().get(symbol).copied()
    }

    /// The venue-side balance ledger, independent of the Gateway's own account ledger.
    pub fn balances(&self) -> &BalanceManager {
        &self.balances
    }

    fn spec(&self, symbol: &str) -> Option<&SymbolSpec> {
        self.specs.get(symbol)
    }

    fn fill_price(&self, spec: &SymbolSpec, side: Side, reference: Decimal) -> Decimal {
        let slip = reference * (self.slippage_bps / dec!(10000));
        match side {
            Side::Buy => reference + slip,
            Side::Sell => reference - slip,
        }
    }

    fn validate_inner(&self, request: &OrderRequest) -> ValidateOutcome {
        let Some(spec) = self.spec(&request.symbol) else {
            return ValidateOutcome::Reject(RejectReason::SymbolUnknown);
        };

        if let Some(price) = request.price {
            if price <= Decimal::ZERO {
                return ValidateOutcome::Reject(RejectReason::PriceOutOfBand);
            }
            if spec.tick_size > Decimal::ZERO && (price % spec.tick_size) != Decimal::ZERO {
                return ValidateOutcome::Reject(RejectReason::TickSizeViolation);
            }
        } else if request.kind == OrderKind::Limit {
            return ValidateOutcome::Reject(RejectReason::PriceOutOfBand);
        }

        let reference = request
            .price
            .or_else(|| self.reference_price(&request.symbol))
            .unwrap_or(Decimal::ZERO);
        let notional = request.amount * reference;
        if notional < spec.min_notional {
            return ValidateOutcome::Reject(RejectReason::AmountBelowMin);
        }

        ValidateOutcome::Ok
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn validate(&self, request: &OrderRequest) -> ValidateOutcome {
        self.validate_inner(request)
    }

    async fn submit(&self, request: &OrderRequest) -> Result<SubmitOutcome, ExchangeError> {
        if let Some(existing) = self.orders.lock().get(&request.client_order_id) {
            return Ok(match existing.snapshot.status {
                OrderStatus::Rejected => SubmitOutcome::Rejected(RejectReason::Other),
                _ => SubmitOutcome::Accepted(existing.venue_order_id.clone()),
            });
        }

        if let ValidateOutcome::Reject(reason) = self.validate_inner(request) {
            return Ok(SubmitOutcome::Rejected(reason));
        }

        let spec = self
            .spec(&request.symbol)
            .ok_or(ExchangeError::Transport("symbol disappeared after validate".into()))?
            .clone();

        let reference = request
            .price
            .or_else(|| self.reference_price(&request.symbol))
            .unwrap_or(Decimal::ZERO);

        let venue_id = VenueOrderId::new(format!(
            "venue-{}",
            self.next_venue_id.fetch_add(1, AtomicOrdering::Relaxed)
        ));

        // Market orders fill instantly; limit orders fill instantly too when the reference price
        // already crosses the limit (a marketable limit), otherwise they remain open until a later
        // `fetch` call re-checks against an updated reference price.
        let crosses = match (request.kind, request.side) {
            (OrderKind::Market, _) => true,
            (OrderKind::Limit, Side::Buy) => reference <= request.price.unwrap_or(reference),
            (OrderKind::Limit, Side::Sell) => reference >= request.price.unwrap_or(reference),
        };

        let fee_rate = match request.kind {
            OrderKind::Market => spec.taker_fee,
            OrderKind::Limit => spec.maker_fee,
        };

        let snapshot = if crosses {
            let fill_price = self.fill_price(&spec, request.side, reference);
            let notional = request.amount * fill_price;
            let fee = notional * fee_rate;

            self.apply_venue_fill(&spec, request.side, request.amount, fill_price, fee);

            OrderSnapshot {
                client_order_id: request.client_order_id.clone(),
                venue_order_id: Some(venue_id.clone()),
                status: OrderStatus::Filled,
                filled_amount: request.amount,
                avg_fill_price: Some(fill_price),
                fees_paid: fee,
                fee_currency: spec.quote.clone(),
            }
        } else {
            OrderSnapshot {
                client_order_id: request.client_order_id.clone(),
                venue_order_id: Some(venue_id.clone()),
                status: OrderStatus::Accepted,
                filled_amount: Decimal::ZERO,
                avg_fill_price: None,
                fees_paid: Decimal::ZERO,
                fee_currency: spec.quote.clone(),
            }
        };

        self.orders.lock().insert(
            request.client_order_id.clone(),
            BookedOrder {
                client_order_id: request.client_order_id.clone(),
                venue_order_id: venue_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                kind: request.kind,
                amount: request.amount,
                price: request.price,
                snapshot,
            },
        );

        Ok(SubmitOutcome::Accepted(venue_id))
    }

    async fn fetch(&self, client_order_id: &ClientOrderId) -> Result<OrderSnapshot, ExchangeError> {
        let mut orders = self.orders.lock();
        let booked = orders
            .get_mut(client_order_id)
            .ok_or_else(|| ExchangeError::UnknownClientOrder(client_order_id.clone()))?;

        if booked.kind == OrderKind::Limit && booked.snapshot.status == OrderStatus::Accepted {
            if let Some(reference) = self.reference_price(&booked.symbol) {
                let limit_price = booked.price.unwrap_or(reference);
                let crosses = match booked.side {
                    Side::Buy => reference <= limit_price,
                    Side::Sell => reference >= limit_price,
                };
                if crosses {
                    let spec = self.spec(&booked.symbol).cloned();
                    if let Some(spec) = spec {
                        let fill_price = self.fill_price(&spec, booked.side, reference);
                        let notional = booked.amount * fill_price;
                        let fee = notional * spec.maker_fee;
                        self.apply_venue_fill(&spec, booked.side, booked.amount, fill_price, fee);
                        booked.snapshot.status = OrderStatus::Filled;
                        booked.snapshot.filled_amount = booked.amount;
                        booked.snapshot.avg_fill_price = Some(fill_price);
                        booked.snapshot.fees_paid = fee;
                    }
                }
            }
        }

        Ok(booked.snapshot.clone())
    }

    async fn cancel(&self, venue_order_id: &VenueOrderId) -> Result<CancelOutcome, ExchangeError> {
        let mut orders = self.orders.lock();
        let booked = orders
            .values_mut()
            .find(|o| &o.venue_order_id == venue_order_id)
            .ok_or_else(|| ExchangeError::UnknownVenueOrder(venue_order_id.clone()))?;

        if booked.snapshot.status.is_terminal() {
            return Ok(CancelOutcome::CancelRejected(RejectReason::Other));
        }
        booked.snapshot.status = OrderStatus::Cancelled;
        Ok(CancelOutcome::CancelAccepted)
    }

    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ExchangeError> {
        let positions = self.positions.lock();
        Ok(match symbol {
            Some(symbol) => positions.get(symbol).cloned().into_iter().collect(),
            None => positions.values().cloned().collect(),
        })
    }
}

impl MockExchange {
    fn apply_venue_fill(
        &self,
        spec: &SymbolSpec,
        side: Side,
        amount: Decimal,
        fill_price: Decimal,
        fee: Decimal,
    ) {
        let mut positions = self.positions.lock();
        let position = positions
            .entry(spec.symbol.clone())
            .or_insert_with(|| Position::flat(spec.symbol.clone(), &self.pnl_currency));
        position.apply_fill(side, amount, fill_price);
        drop(positions);

        let notional = Money::parse(&spec.quote, &(amount * fill_price).to_string())
            .unwrap_or_else(|_| Money::zero_in(&spec.quote));
        let fee_money =
            Money::parse(&spec.quote, &fee.to_string()).unwrap_or_else(|_| Money::zero_in(&spec.quote));
        let base_money = Money::parse(&spec.base, &amount.to_string())
            .unwrap_or_else(|_| Money::zero_in(&spec.base));

        match side {
            Side::Buy => {
                // Venue receives quote notional + fee; base is delivered to the counterparty's
                // ledger, not tracked on the venue side.
                let _ = self.balances.credit(&spec.quote, notional, "fill");
                let _ = self.balances.credit(&spec.quote, fee_money, "fee");
            }
            Side::Sell => {
                let _ = self.balances.credit(&spec.base, base_money, "fill");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;

    fn venue() -> MockExchange {
        let usdt = Currency::new("usdt");
        let btc = Currency::new("btc");
        MockExchange::new(
            vec![SymbolSpec {
                symbol: SmolStr::new("BTC-USDT"),
                base: btc.clone(),
                quote: usdt.clone(),
                min_notional: dec!(10),
                tick_size: dec!(0.01),
                maker_fee: dec!(0.0008),
                taker_fee: dec!(0.001),
            }],
            vec![Balance::new(&usdt, Money::parse(&usdt, "1000000").unwrap())],
            dec!(0),
            usdt,
            EventBus::new(Default::default()),
        )
    }

    fn market_buy(cid: &str, amount: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: ClientOrderId::new(cid),
            symbol: SmolStr::new("BTC-USDT"),
            side: Side::Buy,
            kind: OrderKind::Market,
            amount,
            price: None,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_at_reference_price() {
        let exchange = venue();
        exchange.set_reference_price("BTC-USDT", dec!(50000));

        let request = market_buy("cid-1", dec!(0.1));
        let outcome = exchange.submit(&request).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Accepted(_)));

        let snapshot = exchange.fetch(&request.client_order_id).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.avg_fill_price, Some(dec!(50000)));
        assert_eq!(snapshot.fees_paid, dec!(5));
    }

    #[tokio::test]
    async fn submit_is_idempotent_on_client_order_id() {
        let exchange = venue();
        exchange.set_reference_price("BTC-USDT", dec!(50000));
        let request = market_buy("cid-1", dec!(0.1));

        let first = exchange.submit(&request).await.unwrap();
        let second = exchange.submit(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.orders.lock().len(), 1);
    }

    #[tokio::test]
    async fn rejects_amount_below_min_notional() {
        let exchange = venue();
        exchange.set_reference_price("BTC-USDT", dec!(50000));
        let request = market_buy("cid-small", dec!(0.0001));
        let outcome = exchange.submit(&request).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(RejectReason::AmountBelowMin)
        );
    }
}
