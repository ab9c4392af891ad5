//! Bybit v5 linear perpetual connector

use crate::{
    config::ExchangeConfig,
    connectors::{
        rest::{format_decimal, hmac_sha256, map_transport_error, parse_number, query_string},
        traits::*,
        Exchange,
    },
    market_data::MarketDataProvider,
    ArbitrageError,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, warn};

const CATEGORY: &str = "linear";
const FUNDING_INTERVAL_HOURS: u32 = 8;
const FILL_POLL_ATTEMPTS: usize = 5;
const FILL_POLL_DELAY: Duration = Duration::from_millis(200);
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit exchange connector
pub struct BybitConnector {
    rest_client: BybitRestClient,
}

impl BybitConnector {
    /// Create a new Bybit connector
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        Ok(Self {
            rest_client: BybitRestClient::new(config)?,
        })
    }

    async fn query_order(&self, symbol: &str, order_id: &str) -> ConnectorResult<Option<BybitOrder>> {
        let list: BybitList<BybitOrder> = self
            .rest_client
            .get_signed(
                "/v5/order/realtime",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(list.list.into_iter().next())
    }

    /// Market orders settle asynchronously; poll until the order reaches a final state
    async fn wait_for_fill(&self, symbol: &str, order_id: &str) -> ConnectorResult<OrderFill> {
        let mut last_seen: Option<BybitOrder> = None;

        for attempt in 0..FILL_POLL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(FILL_POLL_DELAY).await;
            }
            if let Some(order) = self.query_order(symbol, order_id).await? {
                let done = order.is_final();
                last_seen = Some(order);
                if done {
                    break;
                }
            }
        }

        let order = last_seen.ok_or_else(|| {
            ConnectorError::DataUnavailable(format!("order {} not visible after placement", order_id))
        })?;
        let filled_quantity = parse_number("cumExecQty", &order.cum_exec_qty)?;
        if order.order_status == "Rejected" && filled_quantity == 0.0 {
            return Err(ConnectorError::ExchangeRejected(format!("order {} rejected", order_id)));
        }

        Ok(OrderFill {
            order_id: order.order_id,
            filled_quantity,
            average_price: parse_number("avgPrice", &order.avg_price)?,
            fee: parse_number("cumExecFee", &order.cum_exec_fee)?,
        })
    }

    async fn ticker(&self, symbol: &str) -> ConnectorResult<BybitTicker> {
        let list: BybitList<BybitTicker> = self
            .rest_client
            .get_public(
                "/v5/market/tickers",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
            )
            .await?;
        list.list
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::DataUnavailable(format!("no ticker for {}", symbol)))
    }
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn place_order(&self, order: &OrderRequest) -> ConnectorResult<OrderFill> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": bybit_side(order.side),
            "orderType": match order.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": format_decimal(order.quantity),
            "reduceOnly": order.reduce_only,
        });
        if let Some(price) = order.price {
            body["price"] = json!(format_decimal(price));
            body["timeInForce"] = json!("GTC");
        }
        if let Some(id) = &order.client_order_id {
            body["orderLinkId"] = json!(id);
        }

        let envelope: BybitResponse<BybitOrderCreated> =
            self.rest_client.post_signed("/v5/order/create", &body).await?;
        let created = envelope.into_result(Some(order))?;
        debug!(symbol = %order.symbol, order_id = %created.order_id, "Bybit order accepted");

        self.wait_for_fill(&order.symbol, &created.order_id).await
    }

    async fn get_position(&self, symbol: &str) -> ConnectorResult<Option<PositionSnapshot>> {
        let list: BybitList<BybitPosition> = self
            .rest_client
            .get_signed(
                "/v5/position/list",
                &[("category", CATEGORY.to_string()), ("symbol", symbol.to_string())],
            )
            .await?;

        for position in list.list {
            let size = parse_number("size", &position.size)?;
            if size <= 0.0 {
                continue;
            }
            let side = match position.side.as_str() {
                "Buy" => PositionSide::Long,
                "Sell" => PositionSide::Short,
                other => {
                    return Err(ConnectorError::DataUnavailable(format!("unknown position side '{}'", other)))
                }
            };
            return Ok(Some(PositionSnapshot {
                symbol: position.symbol,
                side,
                size,
                entry_price: parse_number("avgPrice", &position.avg_price)?,
                mark_price: parse_number("markPrice", &position.mark_price)?,
            }));
        }
        Ok(None)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, _side: Option<PositionSide>) -> ConnectorResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        let envelope: BybitResponse<serde_json::Value> =
            self.rest_client.post_signed("/v5/position/set-leverage", &body).await?;
        if envelope.ret_code == LEVERAGE_NOT_MODIFIED {
            return Ok(());
        }
        envelope.into_result(None).map(|_| ())
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        _side: PositionSide,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> ConnectorResult<()> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "tpslMode": "Full",
            "positionIdx": 0,
        });
        if let Some(tp) = take_profit {
            body["takeProfit"] = json!(format_decimal(tp));
        }
        if let Some(sl) = stop_loss {
            body["stopLoss"] = json!(format_decimal(sl));
        }
        let envelope: BybitResponse<serde_json::Value> =
            self.rest_client.post_signed("/v5/position/trading-stop", &body).await?;
        envelope.into_result(None).map(|_| ())
    }

    async fn close_position(&self, symbol: &str) -> ConnectorResult<CloseOutcome> {
        let Some(position) = self.get_position(symbol).await? else {
            return Ok(CloseOutcome::NoPosition);
        };
        let order = OrderRequest::market(symbol, position.side.closing_side(), position.size).reduce_only();
        self.place_order(&order).await.map(CloseOutcome::Closed)
    }

    async fn get_funding_rate(&self, symbol: &str) -> ConnectorResult<FundingRateInfo> {
        let ticker = self.ticker(symbol).await?;
        let next_ms = parse_number("nextFundingTime", &ticker.next_funding_time)? as i64;
        Ok(FundingRateInfo {
            rate: parse_number("fundingRate", &ticker.funding_rate)?,
            next_payment_time: DateTime::from_timestamp_millis(next_ms)
                .ok_or_else(|| ConnectorError::DataUnavailable("invalid nextFundingTime".to_string()))?,
            interval_hours: FUNDING_INTERVAL_HOURS,
        })
    }

    async fn get_funding_history(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<FundingPayment>> {
        let mut params = vec![
            ("accountType", "UNIFIED".to_string()),
            ("category", CATEGORY.to_string()),
            ("type", "SETTLEMENT".to_string()),
            ("symbol", symbol.to_string()),
        ];
        if let Some(since) = since {
            params.push(("startTime", since.timestamp_millis().to_string()));
        }

        let list: BybitList<BybitTransaction> = self
            .rest_client
            .get_signed("/v5/account/transaction-log", &params)
            .await?;

        list.list
            .into_iter()
            .map(|tx| {
                let ts = parse_number("transactionTime", &tx.transaction_time)? as i64;
                Ok(FundingPayment {
                    id: tx.id,
                    symbol: tx.symbol,
                    amount: parse_number("change", &tx.change)?,
                    rate: tx.fee_rate.parse::<f64>().ok(),
                    timestamp: DateTime::from_timestamp_millis(ts)
                        .ok_or_else(|| ConnectorError::DataUnavailable("invalid transactionTime".to_string()))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataProvider for BybitConnector {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        match self.ticker(symbol).await {
            Ok(ticker) => parse_number("lastPrice", &ticker.last_price).ok().filter(|p| *p > 0.0),
            Err(e) => {
                warn!(symbol, error = %e, "Bybit price unavailable");
                None
            }
        }
    }

    async fn get_funding_rate(&self, symbol: &str) -> Option<FundingRateInfo> {
        ExchangeConnector::get_funding_rate(self, symbol).await.ok()
    }
}

fn bybit_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

/// Map a non-zero `retCode` onto the connector taxonomy
fn map_error_code(code: i64, message: &str, order: Option<&OrderRequest>) -> ConnectorError {
    let detail = format!("{} (retCode {})", message, code);
    match code {
        10006 | 10018 => ConnectorError::RateLimited(detail),
        110094 | 170136 | 170140 => ConnectorError::MinimumQuantityViolation {
            symbol: order.map(|o| o.symbol.clone()).unwrap_or_default(),
            quantity: order.map(|o| o.quantity).unwrap_or_default(),
            detail,
        },
        _ if message.to_lowercase().contains("liquidity") => ConnectorError::InsufficientLiquidity(detail),
        _ => ConnectorError::ExchangeRejected(detail),
    }
}

/// Bybit REST client
struct BybitRestClient {
    base_url: String,
    api_key: String,
    secret_key: String,
    recv_window_ms: u64,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl BybitRestClient {
    fn new(config: &ExchangeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.connection_timeout_secs))
            .build()
            .map_err(|e| ArbitrageError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            recv_window_ms: config.recv_window_ms,
            timeout_ms: config.connection_timeout_secs * 1000,
            client,
        })
    }

    /// `X-BAPI-SIGN` over timestamp + key + recv window + payload
    fn auth_headers(&self, payload: &str) -> ConnectorResult<Vec<(&'static str, String)>> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let recv_window = self.recv_window_ms.to_string();
        let prehash = format!("{}{}{}{}", timestamp, self.api_key, recv_window, payload);
        Ok(vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", recv_window),
            ("X-BAPI-SIGN", hmac_sha256(&self.secret_key, &prehash)?),
        ])
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> ConnectorResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, query_string(params));
        let envelope: BybitResponse<T> = self.send(self.client.get(&url), path).await?;
        envelope.into_result(None)
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> ConnectorResult<T> {
        let query = query_string(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut request = self.client.get(&url);
        for (name, value) in self.auth_headers(&query)? {
            request = request.header(name, value);
        }
        let envelope: BybitResponse<T> = self.send(request, path).await?;
        envelope.into_result(None)
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> ConnectorResult<BybitResponse<T>> {
        let payload = body.to_string();
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload.clone());
        for (name, value) in self.auth_headers(&payload)? {
            request = request.header(name, value);
        }
        self.send(request, path).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> ConnectorResult<BybitResponse<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, operation, self.timeout_ms))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            return Err(ConnectorError::RateLimited(format!("HTTP {} on {}", status, operation)));
        }
        if !status.is_success() {
            return Err(ConnectorError::Connection(format!(
                "HTTP request failed with status: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ConnectorError::DataUnavailable(format!("Failed to parse {} response: {}", operation, e)))
    }
}

// Bybit API response types

/// Error responses carry `"result": {}`, so the payload is only decoded on success
#[derive(Debug, Deserialize)]
struct BybitResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(skip)]
    payload: PhantomData<T>,
}

impl<T: DeserializeOwned> BybitResponse<T> {
    fn into_result(self, order: Option<&OrderRequest>) -> ConnectorResult<T> {
        if self.ret_code != 0 {
            return Err(map_error_code(self.ret_code, &self.ret_msg, order));
        }
        if self.result.is_null() {
            return Err(ConnectorError::DataUnavailable("response without result".to_string()));
        }
        serde_json::from_value(self.result)
            .map_err(|e| ConnectorError::DataUnavailable(format!("unexpected result shape: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct BybitList<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BybitOrderCreated {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct BybitOrder {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "cumExecFee", default)]
    cum_exec_fee: String,
}

impl BybitOrder {
    fn is_final(&self) -> bool {
        matches!(
            self.order_status.as_str(),
            "Filled" | "Cancelled" | "PartiallyFilledCanceled" | "Rejected" | "Deactivated"
        )
    }
}

#[derive(Debug, Deserialize)]
struct BybitPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct BybitTicker {
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: String,
}

#[derive(Debug, Deserialize)]
struct BybitTransaction {
    #[serde(default)]
    id: String,
    symbol: String,
    #[serde(default)]
    change: String,
    #[serde(rename = "feeRate", default)]
    fee_rate: String,
    #[serde(rename = "transactionTime")]
    transaction_time: String,
}
