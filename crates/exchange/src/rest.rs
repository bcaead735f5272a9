use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use tradegate_core::config::{Credentials, RestConfig};
use tradegate_core::utils::now_timestamp_ms;
use tradegate_core::{Result, TradeGateError};
use url::form_urlencoded;

use crate::rate_limiter::AdaptiveRateLimiter;

/// Form-encodes parameters in insertion order.
pub fn encode_params(params: &[(&str, String)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| TradeGateError::Authentication(format!("Invalid secret key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// REST executor: signs, sends, classifies the response and applies the
/// adaptive rate limiter before handing the body back.
#[derive(Debug)]
pub struct RestClientImpl {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    rate_limiter: Arc<AdaptiveRateLimiter>,
}

impl RestClientImpl {
    pub fn new(config: &RestConfig, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            credentials,
            recv_window_ms: config.recv_window_ms,
            rate_limiter: Arc::new(AdaptiveRateLimiter::new()),
        })
    }

    pub fn rate_limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.rate_limiter
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Query string for a signed call: `params`, then `recvWindow` and
    /// `timestamp`, then `signature` over everything before it.
    pub fn signed_query(&self, params: &[(&str, String)], timestamp: u64) -> Result<String> {
        let credentials = self.credentials()?;

        let mut signed: Vec<(&str, String)> = params.to_vec();
        signed.push(("recvWindow", self.recv_window_ms.to_string()));
        signed.push(("timestamp", timestamp.to_string()));

        let query = encode_params(&signed);
        let signature = sign(&credentials.secret_key, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    pub async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value> {
        let query = if signed {
            self.signed_query(params, now_timestamp_ms())?
        } else {
            encode_params(params)
        };

        let mut url = format!("{}{}", self.base_url, endpoint);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        // Signed URLs are not logged.
        debug!(method = %method, endpoint = %endpoint, signed, "Sending REST request");

        let mut request = self.client.request(method.clone(), &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.credentials()?.api_key);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let elapsed = started.elapsed();

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(method = %method, endpoint = %endpoint, status = status.as_u16(), body = %body, "REST request failed");
            return Err(TradeGateError::Request {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        debug!(endpoint = %endpoint, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "REST response");

        self.rate_limiter.throttle(&headers, elapsed).await?;
        Ok(value)
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| TradeGateError::Authentication("API credentials not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateBudget;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOC_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";

    fn rest_config(base_url: &str, recv_window_ms: u64) -> RestConfig {
        RestConfig {
            base_url: base_url.to_string(),
            recv_window_ms,
            timeout_ms: 5_000,
        }
    }

    fn credentials() -> Option<Credentials> {
        Some(Credentials {
            api_key: "test-key".to_string(),
            secret_key: DOC_SECRET.to_string(),
        })
    }

    #[test]
    fn test_signed_query_matches_exchange_vector() {
        let client = RestClientImpl::new(&rest_config("http://localhost/", 5000), credentials()).unwrap();
        let params = vec![
            ("symbol", "LTCBTC".to_string()),
            ("side", "BUY".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", "1".to_string()),
            ("price", "0.1".to_string()),
        ];

        let query = client.signed_query(&params, 1_499_827_319_559).unwrap();
        assert_eq!(
            query,
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1\
             &recvWindow=5000&timestamp=1499827319559\
             &signature=c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signature_is_deterministic_for_fixed_timestamp() {
        let client = RestClientImpl::new(&rest_config("http://localhost/", 10_000), credentials()).unwrap();
        let params = vec![("symbol", "BTCUSDT".to_string())];

        let first = client.signed_query(&params, 1_700_000_000_000).unwrap();
        let second = client.signed_query(&params, 1_700_000_000_000).unwrap();
        let later = client.signed_query(&params, 1_700_000_000_001).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, later);
        assert!(first.starts_with("symbol=BTCUSDT&recvWindow=10000&timestamp=1700000000000&signature="));
    }

    #[test]
    fn test_signing_without_credentials_fails() {
        let client = RestClientImpl::new(&rest_config("http://localhost/", 10_000), None).unwrap();
        let err = client.signed_query(&[], 1).unwrap_err();
        assert!(matches!(err, TradeGateError::Authentication(_)));
    }

    #[test]
    fn test_encode_params_keeps_order_and_escapes() {
        let encoded = encode_params(&[("b", "2".to_string()), ("a", "x y&z".to_string())]);
        assert_eq!(encoded, "b=2&a=x+y%26z");
    }

    #[tokio::test]
    async fn test_unsigned_get_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([[1, "2"]])))
            .expect(1)
            .mount(&server)
            .await;

        let client = RestClientImpl::new(&rest_config(&format!("{}/fapi/v1/", server.uri()), 10_000), None).unwrap();
        let value = client
            .execute(Method::GET, "klines", &[("symbol", "BTCUSDT".to_string())], false)
            .await
            .unwrap();

        assert_eq!(value, serde_json::json!([[1, "2"]]));
    }

    #[tokio::test]
    async fn test_signed_request_sends_key_header_and_signature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fapi/v1/order"))
            .and(header("X-MBX-APIKEY", "test-key"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("recvWindow", "10000"))
            .and(|request: &wiremock::Request| {
                request
                    .url
                    .query()
                    .map(|q| q.contains("&timestamp=") && q.contains("&signature="))
                    .unwrap_or(false)
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"orderId": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            RestClientImpl::new(&rest_config(&format!("{}/fapi/v1/", server.uri()), 10_000), credentials()).unwrap();
        let value = client
            .execute(Method::POST, "order", &[("symbol", "BTCUSDT".to_string())], true)
            .await
            .unwrap();

        assert_eq!(value["orderId"], 1);
    }

    #[tokio::test]
    async fn test_non_success_status_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/exchangeInfo"))
            .respond_with(ResponseTemplate::new(418).set_body_string(r#"{"code":-1003,"msg":"banned"}"#))
            .mount(&server)
            .await;

        let client = RestClientImpl::new(&rest_config(&format!("{}/fapi/v1/", server.uri()), 10_000), None).unwrap();
        let err = client.execute(Method::GET, "exchangeInfo", &[], false).await.unwrap_err();

        match err {
            TradeGateError::Request { status, body } => {
                assert_eq!(status, 418);
                assert!(body.contains("-1003"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrecognized_usage_header_fails_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/time"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-MBX-USED-WEIGHT-1S", "1")
                    .set_body_json(serde_json::json!({"serverTime": 1})),
            )
            .mount(&server)
            .await;

        let client = RestClientImpl::new(&rest_config(&format!("{}/fapi/v1/", server.uri()), 10_000), None).unwrap();
        client
            .rate_limiter()
            .set_budget("X-MBX-USED-WEIGHT-1M", RateBudget::new(2400, Duration::from_secs(60)));

        let err = client.execute(Method::GET, "time", &[], false).await.unwrap_err();
        assert!(matches!(err, TradeGateError::RateLimitIntegrity(_)));
    }

    #[tokio::test]
    async fn test_known_usage_header_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fapi/v1/time"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-MBX-USED-WEIGHT-1M", "10")
                    .set_body_json(serde_json::json!({"serverTime": 1})),
            )
            .mount(&server)
            .await;

        let client = RestClientImpl::new(&rest_config(&format!("{}/fapi/v1/", server.uri()), 10_000), None).unwrap();
        // 10ms base spacing keeps the pause short
        client
            .rate_limiter()
            .set_budget("X-MBX-USED-WEIGHT-1M", RateBudget::new(100, Duration::from_secs(1)));

        let value = client.execute(Method::GET, "time", &[], false).await.unwrap();
        assert_eq!(value["serverTime"], 1);
    }
}
