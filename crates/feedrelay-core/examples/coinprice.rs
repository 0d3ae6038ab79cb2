//! A complete adapter for a fictional crypto price provider, wired with
//! both a WebSocket transport and an HTTP polling fallback.
//!
//! ```sh
//! cargo run --example coinprice
//! ```

use std::sync::Arc;

use serde_json::{json, Value};

use feedrelay_core::{
    Adapter, AdapterEndpoint, AdapterRequest, EngineConfig, EngineError, HttpPollingHandler,
    HttpTransport, InputParameter, InputParameters, ProviderHttpRequest, ProviderHttpResponse,
    ProviderResult, ReqwestHttpClient, RequestData, SubscriptionEntry, WebSocketEndpoint,
    WebSocketTransport,
};

/// WebSocket side of the provider: one shared stream, JSON subscribe
/// frames, price events shaped as `{ "pair": "ETH/USD", "price": 123.4 }`.
struct CoinPriceStream;

impl WebSocketEndpoint for CoinPriceStream {
    fn url(&self, _desired: &[SubscriptionEntry]) -> Result<String, EngineError> {
        Ok(String::from("wss://stream.coinprice.example/v1"))
    }

    fn subscribe_message(&self, params: &Value) -> Option<Value> {
        Some(json!({ "op": "subscribe", "pair": pair(params)? }))
    }

    fn unsubscribe_message(&self, params: &Value) -> Option<Value> {
        Some(json!({ "op": "unsubscribe", "pair": pair(params)? }))
    }

    fn handle_message(&self, message: Value, desired: &[Value]) -> Option<Vec<ProviderResult>> {
        let incoming = message["pair"].as_str()?;
        let price = message["price"].as_f64()?;

        let params = desired
            .iter()
            .find(|params| pair(params).as_deref() == Some(incoming))?;

        Some(vec![ProviderResult::new(params.clone(), json!(price))
            .with_data(json!({ "pair": incoming, "price": price }))])
    }
}

/// REST side of the provider: batched symbol lookups.
struct CoinPricePoller;

impl HttpPollingHandler for CoinPricePoller {
    fn max_batch_size(&self) -> usize {
        25
    }

    fn build_request(&self, group: &[Value]) -> Result<ProviderHttpRequest, EngineError> {
        let pairs: Vec<String> = group.iter().filter_map(|params| pair(params)).collect();
        Ok(ProviderHttpRequest::get(format!(
            "https://api.coinprice.example/v1/spot?pairs={}",
            pairs.join(",")
        )))
    }

    fn parse_response(
        &self,
        group: &[Value],
        response: &ProviderHttpResponse,
    ) -> Result<Vec<ProviderResult>, EngineError> {
        let body = response.json()?;
        Ok(group
            .iter()
            .filter_map(|params| {
                let pair = pair(params)?;
                let price = body[pair.as_str()].as_f64()?;
                Some(
                    ProviderResult::new(params.clone(), json!(price))
                        .with_data(json!({ "pair": pair, "price": price })),
                )
            })
            .collect())
    }
}

fn pair(params: &Value) -> Option<String> {
    let base = params["base"].as_str()?;
    let quote = params["quote"].as_str()?;
    Some(format!("{base}/{quote}"))
}

fn price_endpoint() -> AdapterEndpoint {
    let schema = InputParameters::new(vec![
        (
            String::from("base"),
            InputParameter::string().required().with_aliases(&["from", "coin"]),
        ),
        (
            String::from("quote"),
            InputParameter::string().with_default(json!("USD")),
        ),
    ])
    .expect("price schema is consistent");

    AdapterEndpoint::new("price", schema)
        .with_alias("spot")
        .with_override("WETH", "ETH")
        .with_transport("ws", Arc::new(WebSocketTransport::websocket(CoinPriceStream)))
        .expect("valid transport name")
        .with_transport(
            "rest",
            Arc::new(HttpTransport::new(
                CoinPricePoller,
                Arc::new(ReqwestHttpClient::new()),
            )),
        )
        .expect("valid transport name")
        .with_default_transport("ws")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = Adapter::builder("coinprice")
        .with_config(EngineConfig::from_env()?)
        .with_endpoint(price_endpoint())
        .build()?;

    adapter.start().await?;

    let request = AdapterRequest::new(
        RequestData::for_endpoint("price")
            .with_param("base", json!("ETH"))
            .with_transport("rest"),
    );

    match adapter.handle(request).await {
        Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
        Err(error) => eprintln!("request failed: {error}"),
    }

    adapter.shutdown().await;
    Ok(())
}
