//! Order lifecycle management
//!
//! Centralizes the path from a strategy proposal to an applied fill:
//!
//! 1. The intent is written to the durable pending set BEFORE any network
//!    call (write-ahead), so a crash mid-submit is recoverable.
//! 2. Reconciliation compares every open intent against the exchange on each
//!    tick and immediately on process start. Fills are applied to cycle state
//!    exactly once: trade append, state snapshot and pending removal commit
//!    in a single store transaction, keyed by the exchange order id.
//! 3. Intents that stay open past the timeout are cancelled; intents the
//!    exchange cannot find past a grace period are failed without touching
//!    position state.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cycle::CycleState;
use crate::error::{ConsistencyError, ExchangeError, OmsError};
use crate::exchange::{Exchange, OrderLookup, OrderStatusKind, OrderStatusReport, PlaceOrderRequest};
use crate::oms::types::{IntentStatus, OrderIntent};
use crate::store::StateStore;
use crate::strategy::Proposal;
use crate::types::{Money, Symbol, TradeRecord};

#[derive(Debug, Clone, Copy)]
pub struct OrderManagerConfig {
    /// Open intents older than this get a cancel request
    pub order_timeout: Duration,
    /// Intents unfindable on the exchange for this long are failed
    pub not_found_grace: Duration,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        OrderManagerConfig {
            order_timeout: Duration::minutes(5),
            not_found_grace: Duration::minutes(5),
        }
    }
}

/// What one reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub fills: Vec<TradeRecord>,
    pub cancelled: usize,
    pub failed: usize,
    pub still_open: usize,
}

pub struct OrderManager {
    strategy_id: String,
    symbol: Symbol,
    exchange: Arc<dyn Exchange>,
    store: Arc<StateStore>,
    config: OrderManagerConfig,
}

impl OrderManager {
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: Symbol,
        exchange: Arc<dyn Exchange>,
        store: Arc<StateStore>,
        config: OrderManagerConfig,
    ) -> Self {
        OrderManager {
            strategy_id: strategy_id.into(),
            symbol,
            exchange,
            store,
            config,
        }
    }

    /// Non-terminal intents currently in the durable pending set
    pub fn open_intents(&self) -> Result<Vec<OrderIntent>, OmsError> {
        let intents = self.store.load_pending()?;
        Ok(intents.into_iter().filter(|i| i.is_open()).collect())
    }

    pub fn has_open_intent(&self) -> Result<bool, OmsError> {
        Ok(!self.open_intents()?.is_empty())
    }

    /// Turn a strategy proposal into a durably-logged, submitted order.
    ///
    /// Rejects when an intent is already in flight (single-order-in-flight
    /// discipline). The intent is persisted as `Created` before the network
    /// call; a failed submission leaves it in the pending set for recovery by
    /// client-order-id on the next reconcile pass.
    pub async fn propose_and_submit(
        &self,
        proposal: &Proposal,
        state: &CycleState,
    ) -> Result<OrderIntent, OmsError> {
        if self.has_open_intent()? {
            return Err(OmsError::IntentInFlight);
        }

        let mut intent = OrderIntent::new(
            proposal.side,
            proposal.quantity,
            proposal.price,
            state.next_trade_label(),
        );
        self.store.write_pending(&intent)?;
        info!(
            strategy = %self.strategy_id,
            intent = %intent.client_order_id,
            side = %proposal.side,
            quantity = %proposal.quantity,
            label = %intent.cycle_label,
            "order intent logged, submitting"
        );

        let request = PlaceOrderRequest {
            symbol: self.symbol.clone(),
            side: proposal.side,
            quantity: proposal.quantity,
            price: proposal.price,
            client_order_id: intent.client_order_id.to_string(),
        };

        match self.exchange.place_order(&request).await {
            Ok(exchange_order_id) => {
                intent.exchange_order_id = Some(exchange_order_id.clone());
                intent.status = IntentStatus::Submitted;
                self.store.write_pending(&intent)?;
                info!(
                    strategy = %self.strategy_id,
                    intent = %intent.client_order_id,
                    exchange_order_id,
                    "order accepted by exchange"
                );
                Ok(intent)
            }
            Err(e) => {
                // The order may or may not exist on the exchange; the intent
                // stays Created and reconciliation resolves it by client id.
                warn!(
                    strategy = %self.strategy_id,
                    intent = %intent.client_order_id,
                    error = %e,
                    "order submission failed, intent kept for reconciliation"
                );
                Err(e.into())
            }
        }
    }

    /// Reconcile every open intent against the exchange.
    ///
    /// Runs on every tick and on process start. Transient exchange errors on
    /// individual intents are logged and surfaced once at the end so the rest
    /// of the pending set still makes progress.
    pub async fn reconcile(&self, state: &mut CycleState) -> Result<ReconcileReport, OmsError> {
        let pending = self.open_intents()?;
        let mut report = ReconcileReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        debug!(
            strategy = %self.strategy_id,
            count = pending.len(),
            "reconciling pending intents"
        );

        let mut first_error: Option<OmsError> = None;
        for intent in pending {
            let lookup = match &intent.exchange_order_id {
                Some(id) => OrderLookup::ExchangeId(id.clone()),
                None => OrderLookup::ClientId(intent.client_order_id.to_string()),
            };

            match self.exchange.order_status(&self.symbol, &lookup).await {
                Ok(status) => {
                    if let Err(e) = self
                        .process_report(state, intent, status, &mut report)
                        .await
                    {
                        if !e.is_transient() {
                            return Err(e);
                        }
                        first_error.get_or_insert(e);
                    }
                }
                Err(ExchangeError::OrderNotFound(_)) => {
                    self.handle_missing(intent, &mut report).await?;
                }
                Err(e) => {
                    warn!(
                        strategy = %self.strategy_id,
                        intent = %intent.client_order_id,
                        error = %e,
                        "order status query failed, retrying next tick"
                    );
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn process_report(
        &self,
        state: &mut CycleState,
        mut intent: OrderIntent,
        status: OrderStatusReport,
        report: &mut ReconcileReport,
    ) -> Result<(), OmsError> {
        match status.status {
            OrderStatusKind::Filled => self.apply_fill(state, &intent, &status, report),
            OrderStatusKind::Cancelled | OrderStatusKind::Rejected | OrderStatusKind::Expired => {
                info!(
                    strategy = %self.strategy_id,
                    intent = %intent.client_order_id,
                    status = ?status.status,
                    "intent closed without execution"
                );
                self.store.remove_pending(&intent.client_order_id)?;
                report.cancelled += 1;
                Ok(())
            }
            OrderStatusKind::New | OrderStatusKind::PartiallyFilled => {
                intent.status = match status.status {
                    OrderStatusKind::PartiallyFilled => IntentStatus::PartiallyFilled,
                    _ if intent.status == IntentStatus::CancelPending => {
                        IntentStatus::CancelPending
                    }
                    _ => IntentStatus::Acknowledged,
                };
                if intent.exchange_order_id.is_none() {
                    // Submit crashed after the exchange accepted; adopt the id
                    intent.exchange_order_id = Some(status.exchange_order_id.clone());
                }
                intent.last_checked_at = Some(Utc::now());
                self.store.write_pending(&intent)?;

                if intent.age(Utc::now()) > self.config.order_timeout
                    && intent.status != IntentStatus::CancelPending
                {
                    warn!(
                        strategy = %self.strategy_id,
                        intent = %intent.client_order_id,
                        "intent exceeded timeout, requesting cancellation"
                    );
                    self.request_cancel(&mut intent).await?;
                }
                report.still_open += 1;
                Ok(())
            }
        }
    }

    /// Apply a FILLED report to cycle state exactly once.
    fn apply_fill(
        &self,
        state: &mut CycleState,
        intent: &OrderIntent,
        status: &OrderStatusReport,
        report: &mut ReconcileReport,
    ) -> Result<(), OmsError> {
        let order_id = status.exchange_order_id.clone();

        // Already applied (crash between commit and a second reconcile, or a
        // duplicate report): clear the stale intent and move on.
        if self.store.has_trade(&order_id)? {
            debug!(
                strategy = %self.strategy_id,
                order_id,
                "fill already applied, removing stale intent"
            );
            self.store.remove_pending(&intent.client_order_id)?;
            return Ok(());
        }

        if !status.executed_qty.is_positive() || !status.avg_price.is_positive() {
            error!(
                strategy = %self.strategy_id,
                order_id,
                executed = %status.executed_qty,
                price = %status.avg_price,
                "exchange reported FILLED with unusable execution data"
            );
            return Err(ConsistencyError::InvalidFill {
                order_id,
                reason: format!(
                    "executed_qty={} avg_price={}",
                    status.executed_qty, status.avg_price
                ),
            }
            .into());
        }

        // Apply on a scratch copy first; the durable commit decides whether
        // the in-memory state advances (apply-before-clear, exactly once).
        let mut next_state = state.clone();
        let applied = next_state.apply_fill(
            intent.side,
            status.executed_qty,
            status.avg_price,
            &order_id,
            status.updated_at,
        )?;

        let trade = TradeRecord {
            timestamp: status.updated_at,
            side: intent.side,
            quantity: status.executed_qty,
            price: status.avg_price,
            cycle_label: applied.cycle_label.clone(),
            realized_pnl: applied.realized_pnl,
            commission: Money::ZERO,
            order_id: order_id.clone(),
        };

        let inserted = self
            .store
            .commit_fill(&next_state, &trade, &intent.client_order_id)?;
        if inserted {
            *state = next_state;
            info!(
                strategy = %self.strategy_id,
                order_id,
                label = %trade.cycle_label,
                realized = %trade.realized_pnl,
                "fill reconciled and applied"
            );
            report.fills.push(trade);
        }
        Ok(())
    }

    /// The exchange does not know this order. Young intents are left alone
    /// (submission may still be propagating); past the grace period the
    /// intent is failed without mutating position state.
    async fn handle_missing(
        &self,
        mut intent: OrderIntent,
        report: &mut ReconcileReport,
    ) -> Result<(), OmsError> {
        let age = intent.age(Utc::now());
        if age <= self.config.not_found_grace {
            intent.last_checked_at = Some(Utc::now());
            self.store.write_pending(&intent)?;
            report.still_open += 1;
            return Ok(());
        }

        warn!(
            strategy = %self.strategy_id,
            intent = %intent.client_order_id,
            age_minutes = age.num_minutes(),
            "intent unfindable on exchange past grace period, failing it"
        );
        if let Some(exchange_order_id) = &intent.exchange_order_id {
            // Belt and braces: a cancel for an unknown order is a no-op
            let _ = self
                .exchange
                .cancel_order(&self.symbol, exchange_order_id)
                .await;
        }
        self.store.remove_pending(&intent.client_order_id)?;
        report.failed += 1;
        Ok(())
    }

    /// Request cancellation of an open intent. A failed cancel leaves the
    /// intent pending; it is retried on the next tick, never dropped.
    pub async fn request_cancel(&self, intent: &mut OrderIntent) -> Result<(), OmsError> {
        let Some(exchange_order_id) = intent.exchange_order_id.clone() else {
            // Nothing to cancel on the exchange yet; not-found handling will
            // resolve this intent once the grace period passes.
            return Ok(());
        };

        match self
            .exchange
            .cancel_order(&self.symbol, &exchange_order_id)
            .await
        {
            Ok(_) => {
                intent.status = IntentStatus::CancelPending;
                intent.last_checked_at = Some(Utc::now());
                self.store.write_pending(intent)?;
                Ok(())
            }
            Err(e) => {
                warn!(
                    strategy = %self.strategy_id,
                    intent = %intent.client_order_id,
                    error = %e,
                    "cancel request failed, will retry next tick"
                );
                Err(e.into())
            }
        }
    }
}
