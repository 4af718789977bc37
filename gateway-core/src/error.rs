//! Top-level error taxonomy. Composed from per-component errors via `#[from]`.

use crate::{
    balance::BalanceError, circuit_breaker::CircuitBreakerError, exchange::ExchangeError,
    money::MoneyError, persistence::PersistenceError, symbol_lock::LockError, wal::WalError,
};
use thiserror::Error;

/// Errors that can terminate the process outright (configuration, corruption).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("balance manager: {0}")]
    Balance(#[from] BalanceError),

    #[error("symbol locker: {0}")]
    Lock(#[from] LockError),

    #[error("circuit breaker: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("write-ahead log: {0}")]
    Wal(#[from] WalError),

    #[error("money: {0}")]
    Money(#[from] MoneyError),

    #[error("reconciliation mismatch for {symbol}: internal={internal} exchange={exchange}")]
    ReconcileMismatch {
        symbol: String,
        internal: String,
        exchange: String,
    },

    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl GatewayError {
    /// Process exit code: 0 success, 1 recoverable, 2 fatal configuration, 3 corruption.
    ///
    /// Per the error taxonomy's `WAL / Persistence -> Corruption -> fatal` row, every `Wal` and
    /// `Persistence` failure is treated as the `Corruption` kind and exits 3, not just a parse
    /// failure on an already-written record: a WAL write failing for any reason, including the
    /// disk filling up, means a critical event cannot be made durable before acknowledgement,
    /// which this spec treats as fatal rather than the silent-proceed the source used to do.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::Corruption(_) => 3,
            Self::Wal(_) => 3,
            Self::Persistence(_) => 3,
            _ => 1,
        }
    }
}
