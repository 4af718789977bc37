//! Order and Position entities. Orders are append-only: every state change is recorded as a
//! [`Transition`] rather than overwriting the record in place. Identifiers use small
//! stack-backed strings rather than heap `Uuid`s.

use crate::money::Money;
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Display)]
pub struct ClientOrderId(pub SmolStr);

impl ClientOrderId {
    pub fn new<S: Into<SmolStr>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Display)]
pub struct VenueOrderId(pub SmolStr);

impl VenueOrderId {
    pub fn new<S: Into<SmolStr>>(id: S) -> Self {
        Self(id.into())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Display)]
pub enum Side {
    #[display("buy")]
    Buy,
    #[display("sell")]
    Sell,
}

impl Side {
    /// `+1` for `Buy`, `-1` for `Sell` — the sign applied to filled quantity when accumulating a
    /// [`Position`]'s net quantity.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Display)]
pub enum OrderKind {
    Market,
    Limit,
}

/// Terminal states are marked in the doc comment below; `is_terminal` is the single source of
/// truth callers should use rather than re-deriving it from the variant list.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Display)]
pub enum OrderStatus {
    New,
    Validating,
    Reserved,
    Submitted,
    Accepted,
    PartiallyFilled,
    /// Terminal.
    Filled,
    /// Terminal.
    Cancelled,
    /// Terminal.
    Rejected,
    /// Terminal.
    Expired,
    /// Terminal from the gateway's own point of view: `Exchange.submit` timed out, so a retry
    /// with the same client order id gets this status back rather than re-polling. The
    /// reservation is retained and the true outcome is still unconfirmed, so
    /// `OrderPersistence::list_needing_recovery` treats it as work for startup recovery despite
    /// `is_terminal` returning `true` here.
    PendingVerification,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::PendingVerification
        )
    }
}

/// One append-only audit entry recorded every time an order's status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// The durable record of one order's whole lifecycle. `status` always equals
/// `transitions.last().status`; `transitions` is never rewritten, only appended to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub agent_id: String,
    pub symbol: SmolStr,
    pub side: Side,
    pub kind: OrderKind,
    pub requested_amount: Decimal,
    pub requested_price: Option<Decimal>,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fees_paid: Money,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub reservation_id: Option<u64>,
    pub reservation_currency: Option<crate::money::Currency>,
    pub transitions: Vec<Transition>,
}

impl OrderRecord {
    pub fn new(
        client_order_id: ClientOrderId,
        agent_id: impl Into<String>,
        symbol: impl Into<SmolStr>,
        side: Side,
        kind: OrderKind,
        requested_amount: Decimal,
        requested_price: Option<Decimal>,
        fee_currency: &crate::money::Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_order_id,
            venue_order_id: None,
            agent_id: agent_id.into(),
            symbol: symbol.into(),
            side,
            kind,
            requested_amount,
            requested_price,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            fees_paid: Money::zero_in(fee_currency),
            status: OrderStatus::New,
            submitted_at: now,
            terminal_at: None,
            reservation_id: None,
            reservation_currency: None,
            transitions: vec![Transition {
                status: OrderStatus::New,
                at: now,
                note: None,
            }],
        }
    }

    /// Append a transition and update `status`/`terminal_at`. Never mutates an earlier entry.
    pub fn transition(&mut self, status: OrderStatus, note: Option<String>) {
        let at = Utc::now();
        if status.is_terminal() {
            self.terminal_at = Some(at);
        }
        self.status = status;
        self.transitions.push(Transition { status, at, note });
    }
}

/// Per-(account, symbol) record. Retained with zero quantity until explicit removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: SmolStr,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Money,
    pub last_update: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: impl Into<SmolStr>, pnl_currency: &crate::money::Currency) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Money::zero_in(pnl_currency),
            last_update: Utc::now(),
        }
    }

    /// Apply a fill: accumulate quantity in the signed direction of `side`, update the
    /// volume-weighted average entry price for additions, realize P&L against `fill_price` on
    /// reductions.
    pub fn apply_fill(&mut self, side: Side, fill_qty: Decimal, fill_price: Decimal) {
        let signed_qty = side.sign() * fill_qty;
        let same_direction = self.quantity.is_zero()
            || (self.quantity.is_sign_positive() == signed_qty.is_sign_positive());

        if same_direction {
            let new_quantity = self.quantity + signed_qty;
            if !new_quantity.is_zero() {
                self.avg_entry_price = ((self.avg_entry_price * self.quantity.abs())
                    + (fill_price * signed_qty.abs()))
                    / new_quantity.abs();
            }
            self.quantity = new_quantity;
        } else {
            let closing_qty = signed_qty.abs().min(self.quantity.abs());
            let pnl_per_unit = if self.quantity.is_sign_positive() {
                fill_price - self.avg_entry_price
            } else {
                self.avg_entry_price - fill_price
            };
            let realized = pnl_per_unit * closing_qty;
            let realized_money = Money::parse(self.realized_pnl.currency(), &realized.to_string())
                .unwrap_or_else(|_| Money::zero_in(self.realized_pnl.currency()));
            self.realized_pnl = self
                .realized_pnl
                .checked_add(&realized_money)
                .unwrap_or_else(|_| self.realized_pnl.clone());
            self.quantity += signed_qty;
        }
        self.last_update = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_fill_sets_position_and_avg_price() {
        let usdt = Currency::new("usdt");
        let mut pos = Position::flat("BTC-USDT", &usdt);
        pos.apply_fill(Side::Buy, dec!(0.1), dec!(50000));
        assert_eq!(pos.quantity, dec!(0.1));
        assert_eq!(pos.avg_entry_price, dec!(50000));
    }

    #[test]
    fn order_record_is_append_only() {
        let usdt = Currency::new("usdt");
        let mut record = OrderRecord::new(
            ClientOrderId::new("cid-1"),
            "agent-a",
            "BTC-USDT",
            Side::Buy,
            OrderKind::Market,
            dec!(0.1),
            None,
            &usdt,
        );
        assert_eq!(record.transitions.len(), 1);
        record.transition(OrderStatus::Reserved, None);
        record.transition(OrderStatus::Filled, Some("filled at 50000".into()));
        assert_eq!(record.transitions.len(), 3);
        assert_eq!(record.status, OrderStatus::Filled);
        assert!(record.terminal_at.is_some());
        // Earlier entries are untouched.
        assert_eq!(record.transitions[0].status, OrderStatus::New);
    }
}
