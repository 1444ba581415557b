//! Strategy engine
//!
//! One tokio task per strategy instance owns that strategy's cycle state,
//! store and pending set; nothing else mutates them. Each tick runs
//! reconcile -> safety check -> signal -> decide -> submit. External readers
//! get snapshots over a watch channel, and a command channel carries
//! pause/resume/stop/update-params from the outside.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DcaParams, EngineConfig, OttParams, StrategyConfig};
use crate::cycle::CycleState;
use crate::error::OmsError;
use crate::exchange::{Exchange, MarketInfo};
use crate::indicators::{self, CMO_PERIOD};
use crate::notify::{NotifyService, Severity};
use crate::oms::{OrderManager, OrderManagerConfig};
use crate::safety::{self, ErrorCounter};
use crate::store::StateStore;
use crate::strategy::{decide, Decision};
use crate::types::{Money, PositionSide, Symbol};

/// Control commands accepted by a running strategy task
#[derive(Debug)]
pub enum EngineCommand {
    Pause,
    Resume,
    Stop,
    UpdateParams(DcaParams),
}

/// Read-only view published after every tick
#[derive(Debug, Clone, Serialize)]
pub struct StrategySnapshot {
    pub strategy_id: String,
    pub symbol: String,
    pub cycle_number: u32,
    pub cycle_step: u32,
    pub position_quantity: Money,
    pub average_cost: Money,
    pub position_side: PositionSide,
    pub reference_price: Money,
    pub cash_balance: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub last_price: Money,
    pub pending_orders: usize,
    pub paused: bool,
    pub halted: bool,
    pub error_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// How a tick failed, and therefore what happens next
enum TickError {
    /// Retried next tick, counted toward the error threshold
    Transient(String),
    /// Halts the strategy immediately
    Consistency(String),
    /// Alerting is down; trading without it is prohibited
    NotifyFailed(String),
}

impl From<OmsError> for TickError {
    fn from(e: OmsError) -> Self {
        if e.is_transient() {
            TickError::Transient(e.to_string())
        } else {
            TickError::Consistency(e.to_string())
        }
    }
}

/// Owns one strategy's full trading loop.
pub struct StrategyRunner {
    id: String,
    symbol: Symbol,
    ott: OttParams,
    params: DcaParams,
    kline_interval: String,
    exchange: Arc<dyn Exchange>,
    store: Arc<StateStore>,
    notify: Arc<NotifyService>,
    order_manager: OrderManager,
    state: CycleState,
    market: Option<MarketInfo>,
    errors: ErrorCounter,
    safety_every: u64,
    tick_interval: Duration,
    tick_count: u64,
    last_price: Money,
    paused: bool,
}

impl StrategyRunner {
    pub fn new(
        strategy: &StrategyConfig,
        engine: &EngineConfig,
        kline_interval: String,
        exchange: Arc<dyn Exchange>,
        notify: Arc<NotifyService>,
    ) -> anyhow::Result<Self> {
        let symbol = strategy.symbol();
        let store = Arc::new(StateStore::open(&engine.state_dir, &strategy.id)?);

        let state = match store.load_cycle_state()? {
            Some(state) => {
                info!(
                    strategy = %strategy.id,
                    cycle = state.cycle_number,
                    halted = state.halted,
                    "recovered persisted cycle state"
                );
                state
            }
            None => CycleState::new(
                strategy.id.clone(),
                Money::from_f64(strategy.params.initial_balance),
            ),
        };

        let om_config = OrderManagerConfig {
            order_timeout: chrono::Duration::minutes(engine.order_timeout_minutes),
            not_found_grace: chrono::Duration::minutes(engine.not_found_grace_minutes),
        };
        let order_manager = OrderManager::new(
            strategy.id.clone(),
            symbol.clone(),
            exchange.clone(),
            store.clone(),
            om_config,
        );

        Ok(StrategyRunner {
            id: strategy.id.clone(),
            symbol,
            ott: strategy.ott,
            params: strategy.params,
            kline_interval,
            exchange,
            store,
            notify,
            order_manager,
            state,
            market: None,
            errors: ErrorCounter::new(engine.max_errors),
            safety_every: engine.safety_check_every_ticks.max(1),
            tick_interval: Duration::from_secs(engine.tick_interval_secs),
            tick_count: 0,
            last_price: Money::ZERO,
            paused: false,
        })
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        let pending = self
            .store
            .load_pending()
            .map(|p| p.iter().filter(|i| i.is_open()).count())
            .unwrap_or(0);
        StrategySnapshot {
            strategy_id: self.id.clone(),
            symbol: self.symbol.to_string(),
            cycle_number: self.state.cycle_number,
            cycle_step: self.state.cycle_step,
            position_quantity: self.state.position.quantity,
            average_cost: self.state.position.average_cost,
            position_side: self.state.position.side(),
            reference_price: self.state.reference_price,
            cash_balance: self.state.balance.cash_balance,
            realized_pnl: self.state.balance.realized_pnl,
            unrealized_pnl: self.state.unrealized_pnl(self.last_price),
            last_price: self.last_price,
            pending_orders: pending,
            paused: self.paused,
            halted: self.state.halted,
            error_count: self.errors.count(),
            updated_at: Utc::now(),
        }
    }

    /// One scheduler tick. Transient failures are counted and retried;
    /// consistency and notification failures halt the strategy.
    pub async fn tick(&mut self) {
        if self.state.halted {
            return;
        }
        self.tick_count += 1;

        match self.tick_inner().await {
            Ok(()) => self.errors.reset(),
            Err(TickError::Transient(msg)) => {
                warn!(strategy = %self.id, error = %msg, "tick failed, will retry");
                if self.errors.record() {
                    self.halt(&format!("error threshold reached: {msg}")).await;
                }
            }
            Err(TickError::Consistency(msg)) => {
                error!(strategy = %self.id, error = %msg, "consistency failure");
                self.halt(&msg).await;
            }
            Err(TickError::NotifyFailed(msg)) => {
                error!(strategy = %self.id, error = %msg, "notification channel down");
                self.halt(&format!("notification delivery failed: {msg}")).await;
            }
        }
    }

    async fn tick_inner(&mut self) -> Result<(), TickError> {
        // 1. Reconcile pending intents first - this is also the crash
        // recovery path on the first tick after a restart.
        let report = self.order_manager.reconcile(&mut self.state).await?;
        for trade in &report.fills {
            let message = format!(
                "{} {} {} @ {} ({}) realized {}",
                self.symbol,
                trade.side,
                trade.quantity,
                trade.price,
                trade.cycle_label,
                trade.realized_pnl
            );
            self.notify
                .notify(Severity::Info, &message)
                .await
                .map_err(|e| TickError::NotifyFailed(e.to_string()))?;
        }

        // 2. Slow-period audit of state against trade history
        if self.tick_count % self.safety_every == 0 {
            let trades = self
                .store
                .load_trade_history()
                .map_err(|e| TickError::Transient(e.to_string()))?;
            let audit = safety::audit(&self.state, &trades);
            if !audit.is_consistent() {
                return Err(TickError::Consistency(format!(
                    "audit found {} issue(s): {:?}",
                    audit.issues.len(),
                    audit.issues
                )));
            }
        }

        if self.paused {
            return Ok(());
        }

        // 3. Single order in flight: wait for the open intent to resolve
        if report.still_open > 0 || self.order_manager.has_open_intent()? {
            debug!(strategy = %self.id, "open intent pending, skipping signal evaluation");
            return Ok(());
        }

        // 4. Market data
        let market = match self.market {
            Some(market) => market,
            None => {
                let market = self
                    .exchange
                    .get_market_info(&self.symbol)
                    .await
                    .map_err(|e| TickError::Transient(e.to_string()))?;
                self.market = Some(market);
                market
            }
        };

        let window = self.ott.period.max(CMO_PERIOD) + CMO_PERIOD + 2;
        let candles = self
            .exchange
            .get_klines(&self.symbol, &self.kline_interval, window * 2)
            .await
            .map_err(|e| TickError::Transient(e.to_string()))?;
        if candles.len() < 2 {
            debug!(strategy = %self.id, "not enough candles yet");
            return Ok(());
        }
        // The last candle is still forming; signal on closed bars only
        let closes: Vec<f64> = candles[..candles.len() - 1]
            .iter()
            .map(|c| c.close)
            .collect();

        let price = self
            .exchange
            .get_price(&self.symbol)
            .await
            .map_err(|e| TickError::Transient(e.to_string()))?;
        self.last_price = price;

        // 5. Indicator; insufficient/unusable history is a quiet no-op
        let Some(signal) = indicators::compute_signal(&closes, self.ott.period, self.ott.opt)
        else {
            debug!(strategy = %self.id, "no indicator signal");
            return Ok(());
        };

        // 6. Decide and submit
        match decide(&self.state, &signal, price, &self.params, &market) {
            Decision::Hold(reason) => {
                debug!(strategy = %self.id, %price, mode = ?signal.mode, reason, "holding");
                Ok(())
            }
            Decision::Trade(proposal) => {
                info!(
                    strategy = %self.id,
                    kind = ?proposal.kind,
                    side = %proposal.side,
                    quantity = %proposal.quantity,
                    %price,
                    "decision produced an order proposal"
                );
                match self.order_manager.propose_and_submit(&proposal, &self.state).await {
                    Ok(intent) => {
                        let message = format!(
                            "{} {} {} order placed ({})",
                            self.symbol,
                            proposal.side,
                            proposal.quantity,
                            intent.cycle_label
                        );
                        self.notify
                            .notify(Severity::Info, &message)
                            .await
                            .map_err(|e| TickError::NotifyFailed(e.to_string()))?;
                        Ok(())
                    }
                    Err(OmsError::IntentInFlight) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Stop proposing orders permanently (until a manual rebuild) and alert.
    async fn halt(&mut self, reason: &str) {
        error!(strategy = %self.id, reason, "halting strategy");
        self.state.halted = true;
        if let Err(e) = self.store.save_cycle_state(&self.state) {
            error!(strategy = %self.id, error = %e, "failed to persist halted state");
        }
        // Already halting; a failed alert here cannot make things worse
        let _ = self
            .notify
            .notify(
                Severity::Critical,
                &format!("strategy {} halted: {reason}", self.id),
            )
            .await;
    }

    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Pause => {
                info!(strategy = %self.id, "paused");
                self.paused = true;
            }
            EngineCommand::Resume => {
                info!(strategy = %self.id, "resumed");
                self.paused = false;
            }
            EngineCommand::UpdateParams(params) => match params.validate() {
                Ok(()) => {
                    info!(strategy = %self.id, "parameters updated");
                    self.params = params;
                }
                Err(e) => warn!(strategy = %self.id, error = %e, "rejected parameter update"),
            },
            EngineCommand::Stop => {
                info!(strategy = %self.id, "stopping");
                return false;
            }
        }
        true
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        snapshots: watch::Sender<StrategySnapshot>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                    let _ = snapshots.send(self.snapshot());
                }
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => false,
                    };
                    let _ = snapshots.send(self.snapshot());
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(strategy = %self.id, "strategy task finished");
    }
}

/// Control handle for one running strategy task.
pub struct StrategyHandle {
    pub id: String,
    commands: mpsc::Sender<EngineCommand>,
    snapshots: watch::Receiver<StrategySnapshot>,
    task: JoinHandle<()>,
}

impl StrategyHandle {
    pub fn snapshot(&self) -> StrategySnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(EngineCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(EngineCommand::Resume).await;
    }

    pub async fn update_params(&self, params: DcaParams) {
        let _ = self.commands.send(EngineCommand::UpdateParams(params)).await;
    }

    pub async fn stop(self) {
        let _ = self.commands.send(EngineCommand::Stop).await;
        let _ = self.task.await;
    }
}

/// Supervises all configured strategy tasks.
pub struct Engine {
    handles: Vec<StrategyHandle>,
}

impl Engine {
    /// Build and spawn every configured strategy. Fails fast on fatal
    /// configuration/store problems before any task starts trading.
    pub fn start(
        config: &Config,
        exchange: Arc<dyn Exchange>,
        notify: Arc<NotifyService>,
    ) -> anyhow::Result<Engine> {
        let mut engine = Engine {
            handles: Vec::with_capacity(config.strategies.len()),
        };
        for strategy in &config.strategies {
            engine.spawn_strategy(
                strategy,
                &config.engine,
                config.exchange.kline_interval.clone(),
                exchange.clone(),
                notify.clone(),
            )?;
        }
        Ok(engine)
    }

    pub fn spawn_strategy(
        &mut self,
        strategy: &StrategyConfig,
        engine_config: &EngineConfig,
        kline_interval: String,
        exchange: Arc<dyn Exchange>,
        notify: Arc<NotifyService>,
    ) -> anyhow::Result<()> {
        let runner = StrategyRunner::new(strategy, engine_config, kline_interval, exchange, notify)?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(runner.snapshot());
        let id = runner.id.clone();

        let task = tokio::spawn(runner.run(command_rx, snapshot_tx));
        self.handles.push(StrategyHandle {
            id,
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        });
        Ok(())
    }

    pub fn handles(&self) -> &[StrategyHandle] {
        &self.handles
    }

    pub fn get(&self, strategy_id: &str) -> Option<&StrategyHandle> {
        self.handles.iter().find(|h| h.id == strategy_id)
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.handles.iter().map(|h| h.snapshot()).collect()
    }

    /// Stop every strategy and wait for the tasks to drain.
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.stop().await;
        }
        info!("engine shut down");
    }
}
