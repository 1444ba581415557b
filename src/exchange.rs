//! Binance Exchange API client
//!
//! HTTP client for the Binance spot REST API behind the `Exchange` trait, plus
//! a paper implementation that reuses real market data while simulating order
//! execution. Every call is fallible and treated as retryable by the caller.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ExchangeError;
use crate::types::{Candle, Money, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Exchange trading filters for one symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketInfo {
    pub tick_size: Money,
    pub step_size: Money,
    pub min_qty: Money,
    pub min_notional: Money,
}

impl MarketInfo {
    /// Permissive defaults for venues/tests without filter metadata
    pub fn unrestricted() -> Self {
        MarketInfo {
            tick_size: Money::ZERO,
            step_size: Money::ZERO,
            min_qty: Money::ZERO,
            min_notional: Money::ZERO,
        }
    }
}

/// Exchange-reported order state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusKind {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatusKind {
    fn parse(s: &str) -> Result<Self, ExchangeError> {
        match s {
            "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => Ok(OrderStatusKind::New),
            "PARTIALLY_FILLED" => Ok(OrderStatusKind::PartiallyFilled),
            "FILLED" | "CLOSED" => Ok(OrderStatusKind::Filled),
            "CANCELED" | "CANCELLED" => Ok(OrderStatusKind::Cancelled),
            "REJECTED" => Ok(OrderStatusKind::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatusKind::Expired),
            other => Err(ExchangeError::BadResponse(format!(
                "unknown order status: {other}"
            ))),
        }
    }
}

/// Snapshot of one order as the exchange reports it
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub exchange_order_id: String,
    pub status: OrderStatusKind,
    pub executed_qty: Money,
    /// Average fill price over the executed quantity; zero when nothing filled
    pub avg_price: Money,
    pub updated_at: DateTime<Utc>,
}

/// Order submission request
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Money,
    /// None = market order
    pub price: Option<Money>,
    pub client_order_id: String,
}

/// How to look an order up on the exchange
#[derive(Debug, Clone)]
pub enum OrderLookup {
    ExchangeId(String),
    /// Fallback for intents that crashed before the ack was recorded
    ClientId(String),
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError>;

    async fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo, ExchangeError>;

    /// Submit an order; returns the exchange-assigned order id
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<String, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &Symbol,
        lookup: &OrderLookup,
    ) -> Result<OrderStatusReport, ExchangeError>;

    /// Returns true when the cancel was accepted
    async fn cancel_order(&self, symbol: &Symbol, exchange_order_id: &str)
        -> Result<bool, ExchangeError>;
}

// ============================================================================
// Binance REST implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct BinanceClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BinanceOrder {
    #[serde(rename = "orderId")]
    order_id: u64,
    status: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty", default)]
    cummulative_quote_qty: String,
    #[serde(rename = "price", default)]
    price: String,
    #[serde(rename = "updateTime", default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
struct SymbolFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize", default)]
    tick_size: Option<String>,
    #[serde(rename = "stepSize", default)]
    step_size: Option<String>,
    #[serde(rename = "minQty", default)]
    min_qty: Option<String>,
    #[serde(rename = "minNotional", default)]
    min_notional: Option<String>,
}

fn parse_money(s: &str, field: &str) -> Result<Money, ExchangeError> {
    s.parse::<f64>()
        .map(Money::from_f64)
        .map_err(|_| ExchangeError::BadResponse(format!("unparseable {field}: {s}")))
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String, base_url: String) -> Self {
        BinanceClient {
            api_key,
            api_secret,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut query: String) -> String {
        let timestamp = Utc::now().timestamp_millis();
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={timestamp}"));
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn check_api_error(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || body.contains("\"code\":-2013") {
            // -2013: "Order does not exist"
            return Err(ExchangeError::OrderNotFound(body));
        }
        Err(ExchangeError::Api(format!("{status}: {body}")))
    }

    fn report_from(order: BinanceOrder) -> Result<OrderStatusReport, ExchangeError> {
        let status = OrderStatusKind::parse(&order.status)?;
        let executed_qty = if order.executed_qty.is_empty() {
            Money::ZERO
        } else {
            parse_money(&order.executed_qty, "executedQty")?
        };
        let quote_qty = if order.cummulative_quote_qty.is_empty() {
            Money::ZERO
        } else {
            parse_money(&order.cummulative_quote_qty, "cummulativeQuoteQty")?
        };
        // Market fills report no price; derive the average from the quote leg
        let avg_price = if executed_qty.is_positive() && quote_qty.is_positive() {
            quote_qty / executed_qty
        } else if order.price.is_empty() {
            Money::ZERO
        } else {
            parse_money(&order.price, "price")?
        };
        let updated_at = Utc
            .timestamp_millis_opt(order.update_time)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(OrderStatusReport {
            exchange_order_id: order.order_id.to_string(),
            status,
            executed_qty,
            avg_price,
            updated_at,
        })
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn get_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let response = Self::check_api_error(self.client.get(&url).send().await?).await?;
        let ticker: TickerPrice = response.json().await?;
        let price = parse_money(&ticker.price, "price")?;
        if !price.is_positive() {
            return Err(ExchangeError::BadResponse(format!(
                "non-positive ticker price: {price}"
            )));
        }
        Ok(price)
    }

    async fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let response = Self::check_api_error(self.client.get(&url).send().await?).await?;
        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 6 {
                return Err(ExchangeError::BadResponse("short kline row".to_string()));
            }
            let open_time = row[0]
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| ExchangeError::BadResponse("bad kline timestamp".to_string()))?;
            let field = |idx: usize| -> Result<f64, ExchangeError> {
                row[idx]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| ExchangeError::BadResponse(format!("bad kline field {idx}")))
            };
            let candle = Candle::new(
                open_time,
                field(1)?,
                field(2)?,
                field(3)?,
                field(4)?,
                field(5)?,
            )
            .map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
            candles.push(candle);
        }
        Ok(candles)
    }

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo, ExchangeError> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let response = Self::check_api_error(self.client.get(&url).send().await?).await?;
        let info: ExchangeInfo = response.json().await?;
        let symbol_info = info
            .symbols
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::BadResponse(format!("no exchange info for {symbol}")))?;

        let mut market = MarketInfo::unrestricted();
        for filter in symbol_info.filters {
            match filter.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Some(ts) = filter.tick_size {
                        market.tick_size = parse_money(&ts, "tickSize")?;
                    }
                }
                "LOT_SIZE" => {
                    if let Some(ss) = filter.step_size {
                        market.step_size = parse_money(&ss, "stepSize")?;
                    }
                    if let Some(mq) = filter.min_qty {
                        market.min_qty = parse_money(&mq, "minQty")?;
                    }
                }
                "NOTIONAL" | "MIN_NOTIONAL" => {
                    if let Some(mn) = filter.min_notional {
                        market.min_notional = parse_money(&mn, "minNotional")?;
                    }
                }
                _ => {}
            }
        }
        Ok(market)
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<String, ExchangeError> {
        let mut query = format!(
            "symbol={}&side={}&newClientOrderId={}&quantity={}",
            request.symbol,
            request.side.as_str(),
            request.client_order_id,
            request.quantity
        );
        match request.price {
            Some(price) => {
                query.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={price}"));
            }
            None => query.push_str("&type=MARKET"),
        }

        let url = format!("{}/api/v3/order?{}", self.base_url, self.signed_query(query));
        let response = Self::check_api_error(
            self.client
                .post(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await?,
        )
        .await?;
        let order: BinanceOrder = response.json().await?;
        Ok(order.order_id.to_string())
    }

    async fn order_status(
        &self,
        symbol: &Symbol,
        lookup: &OrderLookup,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let query = match lookup {
            OrderLookup::ExchangeId(id) => format!("symbol={symbol}&orderId={id}"),
            OrderLookup::ClientId(id) => format!("symbol={symbol}&origClientOrderId={id}"),
        };
        let url = format!("{}/api/v3/order?{}", self.base_url, self.signed_query(query));
        let response = Self::check_api_error(
            self.client
                .get(&url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await?,
        )
        .await?;
        let order: BinanceOrder = response.json().await?;
        Self::report_from(order)
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        exchange_order_id: &str,
    ) -> Result<bool, ExchangeError> {
        let query = format!("symbol={symbol}&orderId={exchange_order_id}");
        let url = format!("{}/api/v3/order?{}", self.base_url, self.signed_query(query));
        let response = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        match Self::check_api_error(response).await {
            Ok(_) => Ok(true),
            Err(ExchangeError::OrderNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Paper trading implementation
// ============================================================================

#[derive(Debug, Clone)]
struct PaperOrder {
    exchange_order_id: String,
    client_order_id: String,
    status: OrderStatusKind,
    executed_qty: Money,
    avg_price: Money,
}

/// Simulated execution over real market data.
///
/// Delegates price, kline and filter lookups to the wrapped exchange and fills
/// every order instantly at the current price (or the limit price when given),
/// so paper mode exercises the exact same order-manager code path as live.
pub struct PaperExchange<E> {
    inner: E,
    orders: Mutex<HashMap<String, PaperOrder>>,
    next_id: AtomicU64,
}

impl<E> PaperExchange<E> {
    pub fn new(inner: E) -> Self {
        PaperExchange {
            inner,
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl<E: Exchange> Exchange for PaperExchange<E> {
    async fn get_price(&self, symbol: &Symbol) -> Result<Money, ExchangeError> {
        self.inner.get_price(symbol).await
    }

    async fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.get_klines(symbol, interval, limit).await
    }

    async fn get_market_info(&self, symbol: &Symbol) -> Result<MarketInfo, ExchangeError> {
        self.inner.get_market_info(symbol).await
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<String, ExchangeError> {
        let fill_price = match request.price {
            Some(price) => price,
            None => self.inner.get_price(&request.symbol).await?,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let exchange_order_id = format!("paper-{id}");
        let order = PaperOrder {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: OrderStatusKind::Filled,
            executed_qty: request.quantity,
            avg_price: fill_price,
        };
        self.orders
            .lock()
            .expect("paper order map poisoned")
            .insert(exchange_order_id.clone(), order);
        Ok(exchange_order_id)
    }

    async fn order_status(
        &self,
        _symbol: &Symbol,
        lookup: &OrderLookup,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let orders = self.orders.lock().expect("paper order map poisoned");
        let order = match lookup {
            OrderLookup::ExchangeId(id) => orders.get(id),
            OrderLookup::ClientId(id) => orders.values().find(|o| &o.client_order_id == id),
        }
        .ok_or_else(|| {
            ExchangeError::OrderNotFound(match lookup {
                OrderLookup::ExchangeId(id) | OrderLookup::ClientId(id) => id.clone(),
            })
        })?;
        Ok(OrderStatusReport {
            exchange_order_id: order.exchange_order_id.clone(),
            status: order.status,
            executed_qty: order.executed_qty,
            avg_price: order.avg_price,
            updated_at: Utc::now(),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        exchange_order_id: &str,
    ) -> Result<bool, ExchangeError> {
        let mut orders = self.orders.lock().expect("paper order map poisoned");
        match orders.get_mut(exchange_order_id) {
            Some(order) if order.status == OrderStatusKind::New => {
                order.status = OrderStatusKind::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }
}
