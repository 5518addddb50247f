use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use sleuth_core::error::{Result, SleuthError};
use sleuth_core::traits::{GraphSink, Transform};
use sleuth_core::types::{fingerprint, EdgeUpsert, NodeUpsert, ParamSpec};

const BLOCKCHAIN_API: &str = "https://blockchain.info";
const DEFAULT_TX_LIMIT: u64 = 10;
const SATOSHI_PER_BTC: f64 = 100_000_000.0;

/// Looks up BTC wallet balances and recent transactions.
pub struct WalletLookupTransform;

#[derive(Deserialize)]
struct RawAddr {
    address: String,
    final_balance: i64,
    n_tx: u64,
    total_received: i64,
    #[serde(default)]
    txs: Vec<RawTx>,
}

#[derive(Deserialize)]
struct RawTx {
    hash: String,
    #[serde(default)]
    time: i64,
    /// Net effect on the queried address in satoshi; negative = outgoing.
    #[serde(default)]
    result: i64,
}

impl Transform for WalletLookupTransform {
    fn name(&self) -> &str {
        "wallet_lookup"
    }

    fn category(&self) -> &str {
        "financial"
    }

    fn key(&self) -> &str {
        "address"
    }

    fn description(&self) -> &str {
        "Look up balance and recent transactions for a BTC wallet address."
    }

    fn icon(&self) -> &str {
        "wallet"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "address": { "type": "string" } },
            "required": ["address"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "address": { "type": "string" },
                "balance_btc": { "type": "number" },
                "tx_count": { "type": "integer" },
                "total_received_btc": { "type": "number" },
                "transactions": { "type": "array" }
            }
        })
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("tx_limit", "Transactions to fetch per address")
            .with_default(json!(DEFAULT_TX_LIMIT))]
    }

    fn scan<'a>(
        &'a self,
        values: &'a [Value],
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            let tx_limit = params
                .get("tx_limit")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_TX_LIMIT);

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .user_agent("Sleuth/0.3")
                .build()
                .map_err(|e| SleuthError::TransformRuntime {
                    transform: "wallet_lookup".into(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let mut results = Vec::new();
            for value in values {
                let Some(address) = value.as_str() else {
                    continue;
                };

                let url = format!("{}/rawaddr/{}?limit={}", BLOCKCHAIN_API, address, tx_limit);
                let resp = client.get(&url).send().await.map_err(|e| {
                    SleuthError::TransformRuntime {
                        transform: "wallet_lookup".into(),
                        message: format!("blockchain.info request failed: {}", e),
                    }
                })?;

                if !resp.status().is_success() {
                    debug!(address, status = resp.status().as_u16(), "Address lookup failed");
                    continue;
                }

                let raw: RawAddr = match resp.json().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(address, error = %e, "Malformed address response");
                        continue;
                    }
                };

                results.push(address_record(&raw));
            }
            Ok(results)
        })
    }

    fn postprocess<'a>(
        &'a self,
        results: Vec<Value>,
        _values: &'a [Value],
        sink: &'a mut dyn GraphSink,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            for result in &results {
                let Some(address) = result.get("address").and_then(Value::as_str) else {
                    continue;
                };
                let wallet_fp = fingerprint("Wallet", address);

                sink.upsert_node(NodeUpsert {
                    entity_type: "Wallet".into(),
                    key_prop: "address".into(),
                    key_value: json!(address),
                    fingerprint: wallet_fp.clone(),
                    properties: json!({
                        "currency": "BTC",
                        "balance_btc": result.get("balance_btc").cloned(),
                        "tx_count": result.get("tx_count").cloned(),
                        "total_received_btc": result.get("total_received_btc").cloned(),
                    }),
                })
                .await?;

                let transactions = result
                    .get("transactions")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                for tx in &transactions {
                    let Some(hash) = tx.get("hash").and_then(Value::as_str) else {
                        continue;
                    };
                    let tx_fp = fingerprint("Transaction", hash);

                    sink.upsert_node(NodeUpsert {
                        entity_type: "Transaction".into(),
                        key_prop: "hash".into(),
                        key_value: json!(hash),
                        fingerprint: tx_fp.clone(),
                        properties: json!({
                            "time": tx.get("time").cloned(),
                            "amount_btc": tx.get("amount_btc").cloned(),
                        }),
                    })
                    .await?;

                    let outgoing = tx
                        .get("direction")
                        .and_then(Value::as_str)
                        .is_some_and(|d| d == "sent");

                    let upsert = if outgoing {
                        EdgeUpsert {
                            from_type: "Wallet".into(),
                            from_fingerprint: wallet_fp.clone(),
                            to_type: "Transaction".into(),
                            to_fingerprint: tx_fp,
                            rel_type: "SENT".into(),
                            properties: json!({}),
                        }
                    } else {
                        EdgeUpsert {
                            from_type: "Transaction".into(),
                            from_fingerprint: tx_fp,
                            to_type: "Wallet".into(),
                            to_fingerprint: wallet_fp.clone(),
                            rel_type: "RECEIVED".into(),
                            properties: json!({}),
                        }
                    };
                    sink.upsert_relationship(upsert).await?;
                }
            }
            Ok(results)
        })
    }
}

fn address_record(raw: &RawAddr) -> Value {
    let transactions: Vec<Value> = raw
        .txs
        .iter()
        .map(|tx| {
            json!({
                "hash": tx.hash,
                "time": chrono::DateTime::from_timestamp(tx.time, 0)
                    .map(|dt| dt.to_rfc3339()),
                "direction": if tx.result < 0 { "sent" } else { "received" },
                "amount_btc": satoshi_to_btc(tx.result.abs()),
            })
        })
        .collect();

    json!({
        "address": raw.address,
        "balance_btc": satoshi_to_btc(raw.final_balance),
        "tx_count": raw.n_tx,
        "total_received_btc": satoshi_to_btc(raw.total_received),
        "transactions": transactions,
    })
}

fn satoshi_to_btc(satoshi: i64) -> f64 {
    satoshi as f64 / SATOSHI_PER_BTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use sleuth_core::types::SketchId;
    use sleuth_graph::{GraphWriteBatcher, MemoryGraphClient};
    use std::sync::Arc;

    fn sample() -> RawAddr {
        RawAddr {
            address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(),
            final_balance: 5_000_000_000,
            n_tx: 2,
            total_received: 5_000_000_000,
            txs: vec![
                RawTx {
                    hash: "aa".repeat(32),
                    time: 1231006505,
                    result: 5_000_000_000,
                },
                RawTx {
                    hash: "bb".repeat(32),
                    time: 1231006700,
                    result: -1_000_000_000,
                },
            ],
        }
    }

    #[test]
    fn satoshi_conversion() {
        assert_eq!(satoshi_to_btc(100_000_000), 1.0);
        assert_eq!(satoshi_to_btc(0), 0.0);
        assert_eq!(satoshi_to_btc(50_000_000), 0.5);
    }

    #[test]
    fn address_record_classifies_directions() {
        let record = address_record(&sample());
        assert_eq!(record["balance_btc"], json!(50.0));
        let txs = record["transactions"].as_array().unwrap();
        assert_eq!(txs[0]["direction"], json!("received"));
        assert_eq!(txs[1]["direction"], json!("sent"));
        assert_eq!(txs[1]["amount_btc"], json!(10.0));
    }

    #[tokio::test]
    async fn postprocess_writes_wallet_and_transactions() {
        let client = Arc::new(MemoryGraphClient::new());
        let mut batcher =
            GraphWriteBatcher::new(client.clone(), SketchId::from_string("sk1"), 100);

        let record = address_record(&sample());
        let transform = WalletLookupTransform;
        transform
            .postprocess(vec![record], &[], &mut batcher)
            .await
            .unwrap();
        batcher.flush().await.unwrap();

        // Wallet + two transactions
        assert_eq!(client.node_count(), 3);
        assert_eq!(client.rel_count(), 2);

        let wallet_fp = fingerprint("Wallet", "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
        let received_fp = fingerprint("Transaction", &"aa".repeat(32));
        let sent_fp = fingerprint("Transaction", &"bb".repeat(32));

        assert!(client
            .get_rel(&received_fp, &wallet_fp, "RECEIVED", "sk1")
            .is_some());
        assert!(client.get_rel(&wallet_fp, &sent_fp, "SENT", "sk1").is_some());
    }
}
