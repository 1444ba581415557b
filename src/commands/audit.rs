//! Audit command
//!
//! Offline consistency check: replays each strategy's trade history against
//! its persisted cycle state and reports mismatches. With `--rebuild`, a
//! corrupt state is replaced by the replayed one (and un-halted), which is
//! the recovery path after the safety monitor halts a strategy.

use anyhow::{Context, Result};
use tracing::{info, warn};

use dca_ott::config::Config;
use dca_ott::safety;
use dca_ott::store::StateStore;
use dca_ott::types::Money;

pub fn run(config_path: String, strategy_filter: Option<String>, rebuild: bool) -> Result<()> {
    let config = Config::from_file(&config_path).context("Failed to load configuration")?;

    let mut checked = 0usize;
    let mut inconsistent = 0usize;

    for strategy in &config.strategies {
        if let Some(filter) = &strategy_filter {
            if &strategy.id != filter {
                continue;
            }
        }
        checked += 1;

        let store = StateStore::open(&config.engine.state_dir, &strategy.id)
            .with_context(|| format!("Failed to open store for {}", strategy.id))?;

        let Some(state) = store.load_cycle_state()? else {
            info!(strategy = %strategy.id, "no persisted state yet, nothing to audit");
            continue;
        };
        let trades = store.load_trade_history()?;

        let report = safety::audit(&state, &trades);
        if report.is_consistent() {
            info!(
                strategy = %strategy.id,
                trades = trades.len(),
                cycle = state.cycle_number,
                halted = state.halted,
                "state is consistent with trade history"
            );
            continue;
        }

        inconsistent += 1;
        warn!(strategy = %strategy.id, "state is INCONSISTENT with trade history:");
        for issue in &report.issues {
            warn!(strategy = %strategy.id, "  {:?}", issue);
        }

        if rebuild {
            let rebuilt = safety::rebuild(
                &strategy.id,
                Money::from_f64(strategy.params.initial_balance),
                &trades,
            )
            .map_err(|e| anyhow::anyhow!("replay failed for {}: {e}", strategy.id))?;
            store.save_cycle_state(&rebuilt)?;
            info!(
                strategy = %strategy.id,
                cycle = rebuilt.cycle_number,
                quantity = %rebuilt.position.quantity,
                cash = %rebuilt.balance.cash_balance,
                "state rebuilt from trade history"
            );
        } else {
            warn!(strategy = %strategy.id, "re-run with --rebuild to restore from trade history");
        }
    }

    if checked == 0 {
        warn!("no strategies matched the audit request");
    } else {
        info!(checked, inconsistent, "audit finished");
    }
    Ok(())
}
