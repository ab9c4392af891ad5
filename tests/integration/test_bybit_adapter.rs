//! Bybit v5 adapter against a mocked REST API

use graduated_arbitrage::{
    config::ExchangeConfig,
    connectors::{
        BybitConnector, CloseOutcome, ConnectorError, ExchangeConnector, OrderRequest, OrderSide, PositionSide,
    },
    market_data::MarketDataProvider,
    Result,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn connector(server: &MockServer) -> Result<BybitConnector> {
    let config = ExchangeConfig {
        rest_api_url: server.uri(),
        api_key: "test-key".to_string(),
        secret_key: "test-secret".to_string(),
        ..ExchangeConfig::default()
    };
    BybitConnector::new(&config)
}

fn ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "retCode": 0, "retMsg": "OK", "result": result }))
}

#[tokio::test]
async fn test_ticker_provides_price_and_funding() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/tickers"))
        .and(query_param("category", "linear"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ok(json!({
            "category": "linear",
            "list": [{
                "symbol": "BTCUSDT",
                "lastPrice": "50123.5",
                "fundingRate": "0.0001",
                "nextFundingTime": "1700006400000"
            }]
        })))
        .mount(&server)
        .await;

    let bybit = connector(&server)?;
    assert_eq!(MarketDataProvider::get_price(&bybit, "BTCUSDT").await, Some(50123.5));

    let funding = ExchangeConnector::get_funding_rate(&bybit, "BTCUSDT").await?;
    assert_eq!(funding.rate, 0.0001);
    assert_eq!(funding.interval_hours, 8);
    assert_eq!(funding.next_payment_time.timestamp_millis(), 1_700_006_400_000);
    Ok(())
}

#[tokio::test]
async fn test_market_order_is_polled_until_filled() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(header_exists("X-BAPI-SIGN"))
        .and(body_partial_json(json!({
            "category": "linear",
            "symbol": "BTCUSDT",
            "side": "Buy",
            "orderType": "Market",
            "qty": "0.01",
            "orderLinkId": "abc-p1"
        })))
        .respond_with(ok(json!({ "orderId": "bybit-order-1", "orderLinkId": "abc-p1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/order/realtime"))
        .and(query_param("orderId", "bybit-order-1"))
        .respond_with(ok(json!({
            "list": [{
                "orderId": "bybit-order-1",
                "orderStatus": "Filled",
                "cumExecQty": "0.01",
                "avgPrice": "50010",
                "cumExecFee": "0.275"
            }]
        })))
        .mount(&server)
        .await;

    let bybit = connector(&server)?;
    let order = OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.01).with_client_order_id("abc-p1");
    let fill = bybit.place_order(&order).await?;

    assert_eq!(fill.order_id, "bybit-order-1");
    assert_eq!(fill.filled_quantity, 0.01);
    assert_eq!(fill.average_price, 50010.0);
    assert_eq!(fill.fee, 0.275);
    Ok(())
}

#[tokio::test]
async fn test_error_codes_map_to_connector_errors() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(body_partial_json(json!({ "symbol": "BTCUSDT" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 10006,
            "retMsg": "Too many visits!",
            "result": {}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/order/create"))
        .and(body_partial_json(json!({ "symbol": "ETHUSDT" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 110094,
            "retMsg": "Order does not meet minimum order value",
            "result": {}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/position/list"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let bybit = connector(&server)?;
    let err = bybit
        .place_order(&OrderRequest::market("BTCUSDT", OrderSide::Sell, 0.01))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::RateLimited(_)), "{:?}", err);
    assert!(err.is_transient());

    let err = bybit
        .place_order(&OrderRequest::market("ETHUSDT", OrderSide::Buy, 0.001))
        .await
        .unwrap_err();
    match err {
        ConnectorError::MinimumQuantityViolation { symbol, quantity, .. } => {
            assert_eq!(symbol, "ETHUSDT");
            assert_eq!(quantity, 0.001);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let err = bybit.get_position("BTCUSDT").await.unwrap_err();
    assert!(matches!(err, ConnectorError::RateLimited(_)), "{:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_positions_and_idempotent_close() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/position/list"))
        .and(query_param("symbol", "ETHUSDT"))
        .respond_with(ok(json!({
            "list": [{
                "symbol": "ETHUSDT",
                "side": "Sell",
                "size": "1.5",
                "avgPrice": "3000",
                "markPrice": "2990.5"
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v5/position/list"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ok(json!({
            "list": [{ "symbol": "BTCUSDT", "side": "", "size": "0", "avgPrice": "0", "markPrice": "50000" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v5/position/set-leverage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "retCode": 110043,
            "retMsg": "leverage not modified",
            "result": {}
        })))
        .mount(&server)
        .await;

    let bybit = connector(&server)?;
    let snapshot = bybit.get_position("ETHUSDT").await?.unwrap();
    assert_eq!(snapshot.side, PositionSide::Short);
    assert_eq!(snapshot.size, 1.5);
    assert_eq!(snapshot.entry_price, 3000.0);
    assert_eq!(snapshot.mark_price, 2990.5);

    // a flat symbol closes without placing an order
    assert!(bybit.get_position("BTCUSDT").await?.is_none());
    assert_eq!(bybit.close_position("BTCUSDT").await?, CloseOutcome::NoPosition);

    bybit.set_leverage("BTCUSDT", 3, Some(PositionSide::Long)).await?;
    Ok(())
}

#[tokio::test]
async fn test_funding_history_from_transaction_log() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/account/transaction-log"))
        .and(query_param("type", "SETTLEMENT"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(header_exists("X-BAPI-API-KEY"))
        .respond_with(ok(json!({
            "list": [
                {
                    "id": "tx-1",
                    "symbol": "BTCUSDT",
                    "change": "-0.42",
                    "feeRate": "0.0001",
                    "transactionTime": "1700000000000"
                },
                {
                    "id": "tx-2",
                    "symbol": "BTCUSDT",
                    "change": "0.13",
                    "feeRate": "",
                    "transactionTime": "1700028800000"
                }
            ]
        })))
        .mount(&server)
        .await;

    let bybit = connector(&server)?;
    let payments = bybit.get_funding_history("BTCUSDT", None).await?;
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0].id, "tx-1");
    assert_eq!(payments[0].amount, -0.42);
    assert_eq!(payments[0].rate, Some(0.0001));
    assert_eq!(payments[1].rate, None);
    assert_eq!(payments[1].timestamp.timestamp_millis(), 1_700_028_800_000);
    Ok(())
}
