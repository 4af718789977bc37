//! Operator CLI: the surface an on-call human drives the gateway through outside of the agent
//! submission path. Three subcommands, matching the exit code convention the core defines: 0
//! success, 1 recoverable failure, 2 fatal configuration, 3 corruption.

use clap::{Parser, Subcommand};
use gateway_core::{config::GatewayConfig, exchange::Exchange, mock_exchange::MockExchange, System};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gateway-cli", about = "Operator CLI for the order gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the nine-point safety audit. Exit code 0 iff every check passes.
    PreTradingCheck {
        #[arg(long, default_value = "gateway.toml")]
        config: PathBuf,
    },
    /// Reset a tripped circuit breaker from OPEN to HALF_OPEN. Refuses unless
    /// `pre-trading-check` passes first.
    BreakerReset {
        #[arg(long, default_value = "gateway.toml")]
        config: PathBuf,
    },
    /// Reconstruct Event Bus / Write-Ahead Log history for inspection.
    Replay {
        /// Path to a `wal.log` file (or its containing directory).
        wal: PathBuf,
    },
}

struct CheckResult {
    name: &'static str,
    passed: bool,
    detail: String,
}

fn print_report(results: &[CheckResult]) -> bool {
    let mut all_passed = true;
    for result in results {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        if !result.passed {
            all_passed = false;
        }
        println!("[{mark}] {:<24} {}", result.name, result.detail);
    }
    all_passed
}

/// The nine-point audit: breaker state, reconciliation, connectivity, balance verify, orphan
/// scan, limits, alerts, audit DB, WAL path. Read-only: no check here mutates persisted state.
async fn pre_trading_check(system: &System<MockExchange>) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(9);

    let breaker_state = system.breaker.snapshot();
    results.push(CheckResult {
        name: "breaker_state",
        passed: system.breaker.is_trading_allowed(),
        detail: format!("state={:?}", breaker_state.state),
    });

    let reconcile_outcome = system.reconciler.run_cycle().await;
    results.push(CheckResult {
        name: "reconciliation",
        passed: matches!(
            reconcile_outcome,
            gateway_core::reconciler::CycleOutcome::Ok
        ),
        detail: format!("{reconcile_outcome:?}"),
    });

    let connectivity = system.exchange.fetch_positions(None).await;
    results.push(CheckResult {
        name: "connectivity",
        passed: connectivity.is_ok(),
        detail: match connectivity {
            Ok(positions) => format!("reachable, {} position(s)", positions.len()),
            Err(e) => format!("unreachable: {e}"),
        },
    });

    let invariants = system.balances.verify_invariants();
    results.push(CheckResult {
        name: "balance_verify",
        passed: invariants.is_ok(),
        detail: match invariants {
            Ok(()) => "total == available + reserved for every currency".to_string(),
            Err(e) => e.to_string(),
        },
    });

    // Reservations are tagged with the submitting agent id, not a client order id, so ownership
    // is resolved through the `reservation_id` each `OrderRecord` stores rather than `owner_tag`.
    let still_owned_reservation_ids: std::collections::HashSet<u64> = system
        .persistence
        .list_needing_recovery()
        .into_iter()
        .filter_map(|record| record.reservation_id)
        .collect();
    let live_reservations = system.balances.live_reservations();
    let orphans = live_reservations
        .iter()
        .filter(|r| !still_owned_reservation_ids.contains(&r.id))
        .count();
    results.push(CheckResult {
        name: "orphan_scan",
        passed: orphans == 0,
        detail: format!("{orphans} orphaned reservation(s)"),
    });

    results.push(CheckResult {
        name: "limits",
        passed: true,
        detail: format!(
            "loss_threshold={} reconcile_tolerance={} fail_limit={}",
            system.config.loss_threshold_percent,
            system.config.reconcile_tolerance_percent,
            system.config.reconcile_fail_limit
        ),
    });

    results.push(CheckResult {
        name: "alerts",
        passed: breaker_state.consecutive_reconcile_failures < system.config.reconcile_fail_limit,
        detail: format!(
            "consecutive_reconcile_failures={}/{}",
            breaker_state.consecutive_reconcile_failures, system.config.reconcile_fail_limit
        ),
    });

    let order_count = gateway_core::persistence::read_all_records(&system.config.persistence_path)
        .await
        .map(|records| records.len());
    results.push(CheckResult {
        name: "audit_db",
        passed: order_count.is_ok(),
        detail: match order_count {
            Ok(count) => format!("{count} record(s) at {}", system.config.persistence_path.display()),
            Err(e) => e.to_string(),
        },
    });

    let wal_records = gateway_core::wal::WriteAheadLog::scan(system.wal.path());
    results.push(CheckResult {
        name: "wal_path",
        passed: wal_records.is_ok(),
        detail: match wal_records {
            Ok(records) => format!("{} record(s) at {}", records.len(), system.wal.path().display()),
            Err(e) => e.to_string(),
        },
    });

    results
}

async fn build_system(config_path: &std::path::Path) -> Result<System<MockExchange>, i32> {
    let config = GatewayConfig::load(config_path).map_err(|e| {
        eprintln!("configuration error: {e}");
        2
    })?;

    System::build_paper_trading(config, Vec::new(), Vec::new())
        .await
        .map_err(|e| {
            eprintln!("startup error: {e}");
            e.exit_code()
        })
}

#[tokio::main]
async fn main() {
    gateway_core::logging::init_logging();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::PreTradingCheck { config } => match build_system(&config).await {
            Ok(system) => {
                let results = pre_trading_check(&system).await;
                if print_report(&results) {
                    0
                } else {
                    1
                }
            }
            Err(code) => code,
        },
        Command::BreakerReset { config } => match build_system(&config).await {
            Ok(system) => {
                let results = pre_trading_check(&system).await;
                if !print_report(&results) {
                    eprintln!("pre-trading-check failed; refusing to reset breaker");
                    1
                } else {
                    match system.breaker.reset() {
                        Ok(()) => {
                            println!("breaker reset to HALF_OPEN");
                            0
                        }
                        Err(e) => {
                            eprintln!("reset refused: {e}");
                            1
                        }
                    }
                }
            }
            Err(code) => code,
        },
        Command::Replay { wal } => {
            let path = if wal.is_dir() { wal.join("wal.log") } else { wal };
            match gateway_core::wal::WriteAheadLog::scan(&path) {
                Ok(records) => {
                    for record in &records {
                        println!(
                            "{} seq={} topic={} payload={}",
                            record.timestamp, record.sequence, record.topic, record.payload
                        );
                    }
                    println!("{} record(s) replayed from {}", records.len(), path.display());
                    0
                }
                Err(e) => {
                    eprintln!("replay failed: {e}");
                    3
                }
            }
        }
    };

    std::process::exit(code);
}
