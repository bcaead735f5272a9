use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tradegate_binance::BinanceFutures;
use tradegate_core::config::GatewayConfig;
use tradegate_core::{HistoryCursor, Order, OrderSide, OrderStatus, Timeframe, TradeGateError};
use tradegate_exchange::testing::MockConnector;
use tradegate_exchange::ConnectionState;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const START_MS: i64 = 1_700_000_000_000;

fn config(server: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::binance_futures().with_credentials("test-key", "test-secret");
    config.rest.base_url = format!("{}/fapi/v1/", server.uri());
    config.websocket.market_url = "wss://test/stream".to_string();
    config.websocket.user_url = "wss://test/ws".to_string();
    config.websocket.control_interval_ms = 0;
    config
}

async fn gateway() -> (BinanceFutures, MockServer, MockConnector) {
    let server = MockServer::start().await;
    let connector = MockConnector::new();
    let gateway = BinanceFutures::with_parts(config(&server), Arc::new(connector.clone())).unwrap();
    (gateway, server, connector)
}

fn kline_rows(first_open_ms: i64, count: usize) -> Value {
    let rows: Vec<Value> = (0..count as i64)
        .map(|i| {
            let open = first_open_ms + i * 60_000;
            json!([open, "1.0", "2.0", "0.5", "1.5", "10", open + 59_999, "15", 7, "4", "6", "0"])
        })
        .collect();
    Value::Array(rows)
}

fn agg_trade_rows(first_id: u64, count: usize) -> Value {
    let rows: Vec<Value> = (0..count as u64)
        .map(|i| json!({"a": first_id + i, "p": "100.5", "q": "0.1", "f": 1, "l": 1, "T": START_MS, "m": i % 2 == 0}))
        .collect();
    Value::Array(rows)
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(START_MS).unwrap()
}

#[tokio::test]
async fn test_open_loads_symbols_and_budgets() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rateLimits": [
                {"rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 2400},
                {"rateLimitType": "ORDERS", "interval": "MINUTE", "intervalNum": 1, "limit": 1200}
            ],
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING"},
                {"symbol": "ETHUSDT", "status": "TRADING"},
                {"symbol": "OLDUSDT", "status": "DELIVERING"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    gateway.open().await.unwrap();

    let symbols: Vec<String> = gateway.symbols().iter().map(|s| s.to_string()).collect();
    assert_eq!(symbols, vec!["btcusdt", "ethusdt"]);

    let budgets = gateway.rest().rate_limiter().budgets();
    assert_eq!(budgets["x-mbx-used-weight-1m"].limit, 2400);
    assert_eq!(budgets["x-mbx-order-count-1m"].limit, 1200);
}

#[tokio::test]
async fn test_open_rejects_unknown_limit() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rateLimits": [{"rateLimitType": "RAW_REQUESTS", "interval": "MINUTE", "intervalNum": 1, "limit": 1}],
            "symbols": []
        })))
        .mount(&server)
        .await;

    let err = gateway.open().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_candle_history_pages_by_open_time() {
    let (gateway, server, _connector) = gateway().await;
    let second_start = START_MS + 1499 * 60_000 + 1;

    Mock::given(method("GET"))
        .and(path("/fapi/v1/klines"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("interval", "1m"))
        .and(query_param("startTime", START_MS.to_string()))
        .and(query_param("limit", "1500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_rows(START_MS, 1500)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/klines"))
        .and(query_param("startTime", second_start.to_string()))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_rows(START_MS + 1500 * 60_000, 100)))
        .expect(1)
        .mount(&server)
        .await;

    let candles = gateway.candle_history("btcusdt", Timeframe::M1, start(), 1600).await.unwrap();

    assert_eq!(candles.len(), 1600);
    assert!(candles.iter().all(|c| c.closed));
    assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));
    assert_eq!(candles[0].close, dec!(1.5));
}

#[tokio::test]
async fn test_candle_history_stops_on_short_batch() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/klines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_rows(START_MS, 20)))
        .expect(1)
        .mount(&server)
        .await;

    let candles = gateway.candle_history("btcusdt", Timeframe::M1, start(), 500).await.unwrap();
    assert_eq!(candles.len(), 20);
}

#[tokio::test]
async fn test_trade_history_switches_to_id_cursor() {
    let (gateway, server, _connector) = gateway().await;

    Mock::given(method("GET"))
        .and(path("/fapi/v1/aggTrades"))
        .and(query_param("startTime", START_MS.to_string()))
        .and(query_param("limit", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(agg_trade_rows(5_000, 1000)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/aggTrades"))
        .and(query_param("fromId", "6000"))
        .and(query_param("limit", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(agg_trade_rows(6_000, 3)))
        .expect(1)
        .mount(&server)
        .await;

    let trades = gateway
        .trade_history("btcusdt", HistoryCursor::Time(start()), 1500)
        .await
        .unwrap();

    assert_eq!(trades.len(), 1003);
    assert_eq!(trades[0].id, 5_000);
    assert_eq!(trades.last().unwrap().id, 6_002);
    assert!(!trades[0].taker_buy);
    assert!(trades[1].taker_buy);
}

#[tokio::test]
async fn test_trade_history_from_id() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/aggTrades"))
        .and(query_param("fromId", "42"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(agg_trade_rows(42, 10)))
        .expect(1)
        .mount(&server)
        .await;

    let trades = gateway.trade_history("btcusdt", HistoryCursor::Id(42), 10).await.unwrap();
    assert_eq!(trades.len(), 10);
}

#[tokio::test]
async fn test_market_streams_share_one_connection() {
    let (gateway, _server, connector) = gateway().await;

    let mut candles = gateway.candle_stream(&[("btcusdt", Timeframe::M3)]);
    let mut trades = gateway.trade_stream(&["btcusdt", "ethusdt"]);
    candles.open().await.unwrap();
    trades.open().await.unwrap();

    assert_eq!(connector.urls(), vec!["wss://test/stream?streams=btcusdt@kline_3m".to_string()]);
    let session = connector.last_session().unwrap();
    let subscribe: Value = serde_json::from_str(&session.sent()[0]).unwrap();
    assert_eq!(subscribe["method"], "SUBSCRIBE");
    assert_eq!(subscribe["params"], json!(["btcusdt@aggTrade", "ethusdt@aggTrade"]));

    session.push(
        r#"{"stream":"ethusdt@aggTrade","data":{"e":"aggTrade","E":1,"s":"ETHUSDT","a":77,"p":"1800.1","q":"2","f":1,"l":1,"T":1,"m":true}}"#,
    );
    let trade = trades.read().await.unwrap();
    assert_eq!(trade.id, 77);
    assert_eq!(trade.symbol.as_str(), "ethusdt");

    trades.close().await.unwrap();
    let unsubscribe: Value = serde_json::from_str(&session.sent()[1]).unwrap();
    assert_eq!(unsubscribe["method"], "UNSUBSCRIBE");

    candles.close().await.unwrap();
    assert!(session.is_closed());
    assert_eq!(
        gateway.market_snapshot().await.unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_submitted_order_receives_its_updates() {
    let (gateway, server, connector) = gateway().await;

    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .and(query_param("type", "LIMIT"))
        .and(query_param("timeInForce", "GTC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orderId": 1, "status": "NEW"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/listenKey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"listenKey": "lk-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fapi/v1/listenKey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut order = Order::new_limit("btcusdt", OrderSide::Buy, dec!(0.01), dec!(30000));
    let submitted = gateway.submit(&mut order).await.unwrap();
    let id = order.id.clone().unwrap();
    assert_eq!(id.len(), 32);
    assert_eq!(submitted.id.as_deref(), Some(id.as_str()));

    let mut updates = gateway.order_update_stream(&[&order]).unwrap();
    updates.open().await.unwrap();
    assert_eq!(connector.urls(), vec!["wss://test/ws/lk-1".to_string()]);

    let session = connector.last_session().unwrap();
    session.push(
        json!({
            "e": "ORDER_TRADE_UPDATE", "E": 2, "T": 1,
            "o": {"s": "BTCUSDT", "c": id.as_str(), "S": "BUY", "o": "LIMIT", "f": "GTC", "q": "0.01", "p": "30000",
                  "ap": "29999.9", "sp": "0", "x": "TRADE", "X": "FILLED", "i": 1, "l": "0.01", "z": "0.01",
                  "L": "29999.9", "R": false}
        })
        .to_string(),
    );

    let update = updates.read().await.unwrap();
    assert_eq!(update.status, OrderStatus::Fill);
    assert_eq!(update.total_size, dec!(0.01));
    assert!(Arc::ptr_eq(&update.order, &submitted));
    assert!(gateway.correlator().is_retired(&id));

    updates.close().await.unwrap();
    assert!(session.is_closed());
    assert!(!gateway.user_snapshot().await.unwrap().has_session_key);
}

#[tokio::test]
async fn test_failed_submit_untracks_order() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"code":-2019,"msg":"Margin is insufficient."}"#),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/order"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orderId": 2, "status": "NEW"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut order = Order::new_market("btcusdt", OrderSide::Sell, dec!(1));
    let err = gateway.submit(&mut order).await.unwrap_err();

    match err {
        TradeGateError::Request { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("-2019"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(gateway.correlator().live_count(), 0);
    assert!(order.id.is_none());

    // The same order can be resubmitted under a fresh id.
    let submitted = gateway.submit(&mut order).await.unwrap();
    assert!(order.id.is_some());
    assert_eq!(submitted.id, order.id);
    assert_eq!(gateway.correlator().live_count(), 1);
}

#[tokio::test]
async fn test_cancel_uses_client_order_id() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("DELETE"))
        .and(path("/fapi/v1/order"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("origClientOrderId", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "CANCELED"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut order = Order::new_limit("btcusdt", OrderSide::Buy, dec!(1), dec!(100));
    assert!(matches!(gateway.cancel(&order).await, Err(TradeGateError::InvalidOrder(_))));

    order.id = Some("abc123".to_string());
    gateway.cancel(&order).await.unwrap();
}

#[tokio::test]
async fn test_order_stream_requires_submitted_orders() {
    let (gateway, _server, _connector) = gateway().await;
    let order = Order::new_market("btcusdt", OrderSide::Buy, dec!(1));
    assert!(gateway.order_update_stream(&[&order]).is_err());
}

#[tokio::test]
async fn test_persisted_user_stream_outlives_its_consumers() {
    let (gateway, server, connector) = gateway().await;
    Mock::given(method("POST"))
        .and(path("/fapi/v1/listenKey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"listenKey": "lk-9"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fapi/v1/listenKey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    gateway.persist_order_updates().await.unwrap();
    let mut updates = gateway.all_order_updates();
    updates.open().await.unwrap();
    updates.close().await.unwrap();

    let snapshot = gateway.user_snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert!(snapshot.persistent);
    assert_eq!(connector.connect_count(), 1);

    gateway.close().await.unwrap();
    assert!(connector.last_session().unwrap().is_closed());
}

#[tokio::test]
async fn test_unbounded_history_request_stops_when_data_runs_out() {
    let (gateway, server, _connector) = gateway().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/klines"))
        .and(query_param("limit", "1500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/aggTrades"))
        .and(query_param("limit", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let candles = gateway
        .candle_history("btcusdt", Timeframe::M1, start(), usize::MAX)
        .await
        .unwrap();
    assert!(candles.is_empty());

    let trades = gateway
        .trade_history("btcusdt", HistoryCursor::Time(start()), usize::MAX)
        .await
        .unwrap();
    assert!(trades.is_empty());
}

#[tokio::test]
async fn test_gateway_rejects_keepalive_outside_key_lifetime() {
    let server = MockServer::start().await;
    for secs in [0, 3600] {
        let mut config = config(&server);
        config.user_stream.keepalive_interval_secs = secs;
        let result = BinanceFutures::with_parts(config, Arc::new(MockConnector::new()));
        assert!(matches!(result, Err(TradeGateError::Config(_))), "interval {}s accepted", secs);
    }
}
