//! Binance USDⓈ-M futures connector

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
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const FUNDING_INTERVAL_HOURS: u32 = 8;

/// Binance futures connector
pub struct BinanceConnector {
    rest_client: BinanceRestClient,
    taker_fee: f64,
}

impl BinanceConnector {
    /// Create a new Binance connector
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        Ok(Self {
            rest_client: BinanceRestClient::new(config)?,
            taker_fee: config.taker_fee,
        })
    }

    async fn premium_index(&self, symbol: &str) -> ConnectorResult<BinancePremiumIndex> {
        self.rest_client
            .public("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn place_order(&self, order: &OrderRequest) -> ConnectorResult<OrderFill> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.to_string()),
            ("type", order.order_type.to_string()),
            ("quantity", format_decimal(order.quantity)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if let Some(price) = order.price {
            params.push(("price", format_decimal(price)));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(id) = &order.client_order_id {
            params.push(("newClientOrderId", id.clone()));
        }

        let response: BinanceOrder = self
            .rest_client
            .signed(Method::POST, "/fapi/v1/order", params, Some(order))
            .await?;
        debug!(symbol = %order.symbol, order_id = response.order_id, status = %response.status, "Binance order placed");

        if response.status == "REJECTED" || response.status == "EXPIRED" {
            let executed = parse_number("executedQty", &response.executed_qty)?;
            if executed == 0.0 {
                return Err(ConnectorError::InsufficientLiquidity(format!(
                    "order {} {}",
                    response.order_id, response.status
                )));
            }
        }

        let filled_quantity = parse_number("executedQty", &response.executed_qty)?;
        let average_price = parse_number("avgPrice", &response.avg_price)?;
        Ok(OrderFill {
            order_id: response.order_id.to_string(),
            filled_quantity,
            average_price,
            // the order response carries no commission; estimate it from the configured taker rate
            fee: filled_quantity * average_price * self.taker_fee,
        })
    }

    async fn get_position(&self, symbol: &str) -> ConnectorResult<Option<PositionSnapshot>> {
        let positions: Vec<BinancePositionRisk> = self
            .rest_client
            .signed(Method::GET, "/fapi/v2/positionRisk", vec![("symbol", symbol.to_string())], None)
            .await?;

        for position in positions {
            let amount = parse_number("positionAmt", &position.position_amt)?;
            if amount == 0.0 {
                continue;
            }
            return Ok(Some(PositionSnapshot {
                symbol: position.symbol,
                side: if amount > 0.0 { PositionSide::Long } else { PositionSide::Short },
                size: amount.abs(),
                entry_price: parse_number("entryPrice", &position.entry_price)?,
                mark_price: parse_number("markPrice", &position.mark_price)?,
            }));
        }
        Ok(None)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, _side: Option<PositionSide>) -> ConnectorResult<()> {
        let _: serde_json::Value = self
            .rest_client
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
                None,
            )
            .await?;
        Ok(())
    }

    /// Binance has no position-level TP/SL; attach close-position trigger orders instead
    async fn set_trading_stop(
        &self,
        symbol: &str,
        side: PositionSide,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> ConnectorResult<()> {
        let triggers = [("TAKE_PROFIT_MARKET", take_profit), ("STOP_MARKET", stop_loss)];
        for (order_type, price) in triggers {
            let Some(price) = price else { continue };
            let params = vec![
                ("symbol", symbol.to_string()),
                ("side", side.closing_side().to_string()),
                ("type", order_type.to_string()),
                ("stopPrice", format_decimal(price)),
                ("closePosition", "true".to_string()),
                ("workingType", "MARK_PRICE".to_string()),
            ];
            let _: serde_json::Value = self
                .rest_client
                .signed(Method::POST, "/fapi/v1/order", params, None)
                .await?;
        }
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> ConnectorResult<CloseOutcome> {
        let Some(position) = self.get_position(symbol).await? else {
            return Ok(CloseOutcome::NoPosition);
        };
        let order = OrderRequest::market(symbol, position.side.closing_side(), position.size).reduce_only();
        self.place_order(&order).await.map(CloseOutcome::Closed)
    }

    async fn get_funding_rate(&self, symbol: &str) -> ConnectorResult<FundingRateInfo> {
        let index = self.premium_index(symbol).await?;
        Ok(FundingRateInfo {
            rate: parse_number("lastFundingRate", &index.last_funding_rate)?,
            next_payment_time: DateTime::from_timestamp_millis(index.next_funding_time)
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
            ("symbol", symbol.to_string()),
            ("incomeType", "FUNDING_FEE".to_string()),
        ];
        if let Some(since) = since {
            params.push(("startTime", since.timestamp_millis().to_string()));
        }

        let incomes: Vec<BinanceIncome> = self
            .rest_client
            .signed(Method::GET, "/fapi/v1/income", params, None)
            .await?;

        incomes
            .into_iter()
            .map(|income| {
                Ok(FundingPayment {
                    id: income.tran_id.to_string(),
                    symbol: income.symbol,
                    amount: parse_number("income", &income.income)?,
                    rate: None,
                    timestamp: DateTime::from_timestamp_millis(income.time)
                        .ok_or_else(|| ConnectorError::DataUnavailable("invalid income time".to_string()))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataProvider for BinanceConnector {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        let ticker: ConnectorResult<BinanceTickerPrice> = self
            .rest_client
            .public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await;
        match ticker {
            Ok(ticker) => parse_number("price", &ticker.price).ok().filter(|p| *p > 0.0),
            Err(e) => {
                warn!(symbol, error = %e, "Binance price unavailable");
                None
            }
        }
    }

    async fn get_funding_rate(&self, symbol: &str) -> Option<FundingRateInfo> {
        ExchangeConnector::get_funding_rate(self, symbol).await.ok()
    }
}

/// Map a Binance error code onto the connector taxonomy
fn map_error_code(code: i64, message: &str, order: Option<&OrderRequest>) -> ConnectorError {
    let detail = format!("{} (code {})", message, code);
    match code {
        -1003 | -1015 => ConnectorError::RateLimited(detail),
        -1013 | -4003 | -4164 => ConnectorError::MinimumQuantityViolation {
            symbol: order.map(|o| o.symbol.clone()).unwrap_or_default(),
            quantity: order.map(|o| o.quantity).unwrap_or_default(),
            detail,
        },
        -4131 => ConnectorError::InsufficientLiquidity(detail),
        _ => ConnectorError::ExchangeRejected(detail),
    }
}

/// Binance REST client
struct BinanceRestClient {
    base_url: String,
    api_key: String,
    secret_key: String,
    recv_window_ms: u64,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl BinanceRestClient {
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

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> ConnectorResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, query_string(params));
        self.send(self.client.get(&url), path, None).await
    }

    /// Signed request: HMAC over the full query string, appended as `signature`
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        order: Option<&OrderRequest>,
    ) -> ConnectorResult<T> {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = query_string(&params);
        let signature = hmac_sha256(&self.secret_key, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let request = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.send(request, path, order).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
        order: Option<&OrderRequest>,
    ) -> ConnectorResult<T> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, operation, self.timeout_ms))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(ConnectorError::RateLimited(format!("HTTP {} on {}", status, operation)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, operation, self.timeout_ms))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<BinanceError>(&body) {
                Ok(error) => map_error_code(error.code, &error.msg, order),
                Err(_) => ConnectorError::Connection(format!("HTTP request failed with status: {}", status)),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| ConnectorError::DataUnavailable(format!("Failed to parse {} response: {}", operation, e)))
    }
}

// Binance API response types
#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct BinanceOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    status: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct BinancePositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct BinancePremiumIndex {
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceTickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BinanceIncome {
    symbol: String,
    income: String,
    time: i64,
    #[serde(rename = "tranId")]
    tran_id: i64,
}
