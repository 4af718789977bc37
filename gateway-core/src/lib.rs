//! `gateway_core`: the order pipeline and its supporting state machines. Every order from every
//! strategy agent passes through [`gateway::OrderGateway`], the single chokepoint that composes
//! the Circuit Breaker, Symbol Locker, Atomic Balance Manager, Exchange contract, and Order
//! Persistence into one transactional submission path.
//!
//! [`System`] is the composition root: it owns every shared component, builds them from a
//! [`config::GatewayConfig`], and runs [`recovery::run`] once before exposing a ready gateway.

pub mod balance;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod exchange;
pub mod gateway;
pub mod logging;
pub mod mock_exchange;
pub mod money;
pub mod order;
pub mod persistence;
pub mod reconciler;
pub mod recovery;
pub mod symbol_lock;
pub mod wal;

use crate::{
    balance::{Balance, BalanceManager},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    config::GatewayConfig as Config,
    error::GatewayError,
    event_bus::{EventBus, EventBusConfig},
    exchange::Exchange,
    gateway::{GatewayConfig, OrderGateway},
    mock_exchange::MockExchange,
    persistence::OrderPersistence,
    reconciler::{PositionReconciler, ReconcilerConfig},
    recovery::RecoveryReport,
    symbol_lock::SymbolLocker,
    wal::WriteAheadLog,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Wires every component from a loaded [`Config`], runs startup recovery, and exposes the single
/// ready-to-serve [`OrderGateway`]. Generic over the exchange implementation so paper trading
/// (`MockExchange`) and a real venue adapter are built through the same path.
pub struct System<E: Exchange> {
    pub config: Config,
    pub events: EventBus,
    pub balances: Arc<BalanceManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub locker: Arc<SymbolLocker>,
    pub exchange: Arc<E>,
    pub persistence: Arc<OrderPersistence>,
    pub reconciler: Arc<PositionReconciler<E>>,
    pub gateway: Arc<OrderGateway<E>>,
    pub wal: Arc<WriteAheadLog>,
}

/// Assembles a [`System`] from a loaded [`Config`], mirroring the teacher's own
/// `ExchangeBuilder`/`EngineStateBuilder` convention: configure, then consume the builder with a
/// single `build_*` call rather than a constructor with a long positional argument list.
pub struct SystemBuilder {
    config: Config,
    exchange_symbols: Vec<crate::mock_exchange::SymbolSpec>,
    exchange_starting_balances: Vec<Balance>,
}

impl SystemBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            exchange_symbols: Vec::new(),
            exchange_starting_balances: Vec::new(),
        }
    }

    /// Symbols the paper-trading [`MockExchange`] should accept and validate orders against.
    pub fn exchange_symbols(mut self, symbols: Vec<crate::mock_exchange::SymbolSpec>) -> Self {
        self.exchange_symbols = symbols;
        self
    }

    /// Starting balances credited to the [`MockExchange`]'s own ledger (the venue side, distinct
    /// from the Gateway's account ledger).
    pub fn exchange_starting_balances(mut self, balances: Vec<Balance>) -> Self {
        self.exchange_starting_balances = balances;
        self
    }

    /// Build a paper-trading system: every exchange call is served by the in-process
    /// [`MockExchange`] rather than a real venue adapter. Refuses to build if
    /// `config.paper_trading` is false, since that flag selects this constructor.
    pub async fn build_paper_trading(self) -> Result<System<MockExchange>, GatewayError> {
        let Self {
            config,
            exchange_symbols,
            exchange_starting_balances,
        } = self;

        if !config.paper_trading {
            return Err(GatewayError::Configuration(
                "paper trading system requested but config.paper_trading is false".into(),
            ));
        }

        let events = EventBus::new(EventBusConfig {
            max_queue_size: config.event_bus_max_queue_size,
        });

        let wal = Arc::new(WriteAheadLog::open(&config.wal_dir).await?);
        events.attach_wal(wal.clone());

        let starting_currency = config.starting_capital_currency();
        let starting_capital = config.starting_capital_decimal();

        let balances = Arc::new(BalanceManager::new(
            vec![Balance::new(
                &starting_currency,
                crate::money::Money::parse(&starting_currency, &starting_capital.to_string())?,
            )],
            events.clone(),
        ));

        let breaker = Arc::new(CircuitBreaker::load_or_new(
            &config.circuit_breaker_state_path,
            starting_capital,
            CircuitBreakerConfig {
                loss_threshold: config.loss_threshold_decimal(),
                reconcile_fail_limit: config.reconcile_fail_limit,
                drain_deadline: std::time::Duration::from_millis(config.submit_timeout_ms),
                cooldown: chrono::Duration::seconds(config.circuit_breaker_cooldown_seconds),
            },
            events.clone(),
        )?);

        let locker = Arc::new(SymbolLocker::new());

        let persistence = Arc::new(OrderPersistence::open(&config.persistence_path).await?);

        let exchange_quote = config.starting_capital_currency();
        let exchange = Arc::new(MockExchange::new(
            exchange_symbols,
            exchange_starting_balances,
            Decimal::ZERO,
            exchange_quote,
            events.clone(),
        ));

        let reconciler = Arc::new(PositionReconciler::new(
            ReconcilerConfig {
                interval: std::time::Duration::from_secs(config.reconcile_interval_seconds),
                tolerance: config.reconcile_tolerance_decimal(),
                fail_limit: config.reconcile_fail_limit,
            },
            exchange.clone(),
            breaker.clone(),
            persistence.clone(),
            events.clone(),
        ));

        let gateway = Arc::new(OrderGateway::new(
            GatewayConfig {
                symbol_lock_timeout: std::time::Duration::from_millis(config.symbol_lock_timeout_ms),
                submit_timeout: std::time::Duration::from_millis(config.submit_timeout_ms),
                fetch_poll_interval: std::time::Duration::from_millis(config.fetch_poll_interval_ms),
                fetch_poll_deadline: std::time::Duration::from_millis(config.fetch_poll_deadline_ms),
                fee_buffer_rate: Decimal::new(1, 3),
            },
            breaker.clone(),
            locker.clone(),
            balances.clone(),
            exchange.clone(),
            persistence.clone(),
            reconciler.clone(),
            events.clone(),
        ));

        Ok(System {
            config,
            events,
            balances,
            breaker,
            locker,
            exchange,
            persistence,
            reconciler,
            gateway,
            wal,
        })
    }
}

impl System<MockExchange> {
    /// Convenience entry point equivalent to
    /// `SystemBuilder::new(config).exchange_symbols(symbols).exchange_starting_balances(balances).build_paper_trading()`.
    pub async fn build_paper_trading(
        config: Config,
        exchange_symbols: Vec<crate::mock_exchange::SymbolSpec>,
        exchange_starting_balances: Vec<Balance>,
    ) -> Result<Self, GatewayError> {
        SystemBuilder::new(config)
            .exchange_symbols(exchange_symbols)
            .exchange_starting_balances(exchange_starting_balances)
            .build_paper_trading()
            .await
    }
}

impl<E: Exchange> System<E> {
    /// Resolve in-flight orders against the exchange, release orphaned reservations, and run one
    /// reconciliation cycle. Must succeed before the gateway accepts any submission.
    pub async fn recover(&self) -> Result<RecoveryReport, crate::recovery::RecoveryError> {
        recovery::run(
            self.persistence.clone(),
            self.balances.clone(),
            self.breaker.clone(),
            self.exchange.clone(),
            self.reconciler.clone(),
        )
        .await
    }

    /// Spawn the periodic reconciliation background task. Returns a handle the caller can abort
    /// on shutdown.
    pub fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        self.reconciler.clone().spawn()
    }
}
