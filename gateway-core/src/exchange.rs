//! Abstract exchange contract the Gateway depends upon, modeled as an `async_trait` with a
//! simulated in-process implementation alongside real venue adapters.

use crate::{
    money::Currency,
    order::{ClientOrderId, OrderKind, OrderStatus, Position, Side, VenueOrderId},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    AmountBelowMin,
    PriceOutOfBand,
    SymbolUnknown,
    LeverageUnsupported,
    TickSizeViolation,
    Other,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RejectReason::AmountBelowMin => "amount-below-min",
            RejectReason::PriceOutOfBand => "price-out-of-band",
            RejectReason::SymbolUnknown => "symbol-unknown",
            RejectReason::LeverageUnsupported => "leverage-unsupported",
            RejectReason::TickSizeViolation => "tick-size-violation",
            RejectReason::Other => "other",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange call timed out")]
    Timeout,
    #[error("unknown venue order id {0}")]
    UnknownVenueOrder(VenueOrderId),
    #[error("unknown client order id {0}")]
    UnknownClientOrder(ClientOrderId),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ValidateOutcome {
    Ok,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SubmitOutcome {
    Accepted(VenueOrderId),
    Rejected(RejectReason),
    Timeout,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CancelOutcome {
    CancelAccepted,
    CancelRejected(RejectReason),
}

/// Exchange-reported snapshot of one order, as returned by `fetch`.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub client_order_id: ClientOrderId,
    pub venue_order_id: Option<VenueOrderId>,
    pub status: OrderStatus,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fees_paid: Decimal,
    pub fee_currency: Currency,
}

/// Everything the Gateway needs to describe a prospective order, passed to `validate` and
/// `submit` alike so the two calls can't drift on interpretation of the same request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: SmolStr,
    pub side: Side,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

/// Abstract interface the Gateway depends upon. `submit` must be idempotent on
/// `client_order_id`: a second call with the same id returns the earlier outcome rather than
/// placing a second venue order.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Purely predictive; no side effects.
    async fn validate(&self, request: &OrderRequest) -> ValidateOutcome;

    async fn submit(&self, request: &OrderRequest) -> Result<SubmitOutcome, ExchangeError>;

    async fn fetch(&self, client_order_id: &ClientOrderId) -> Result<OrderSnapshot, ExchangeError>;

    async fn cancel(&self, venue_order_id: &VenueOrderId) -> Result<CancelOutcome, ExchangeError>;

    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<Position>, ExchangeError>;
}
