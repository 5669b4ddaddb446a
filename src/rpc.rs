//! JSON-RPC client for EVM nodes.
//!
//! Reads go to the primary endpoint and fall back to the others in order
//! when a node is unreachable. Broadcasts fan out to every endpoint at once
//! and succeed if any of them accepts the transaction, or if none of them
//! answers in time.

use alloy_primitives::{Address, B256, Bytes, U64, U256, keccak256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::abi::{self, CoordinatorEvent, LogEntry};
use crate::chain::{CoordinatorChain, TxReceipt, VrfLogs};
use crate::error::ChainError;

/// JSON-RPC client bound to one coordinator contract.
#[derive(Clone)]
pub struct RpcClient {
    endpoints: Vec<String>,
    http: reqwest::Client,
    send_timeout: Duration,
    coordinator: Address,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A log as returned by `eth_getLogs` and `eth_subscribe` notifications.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<B256>,
    #[serde(default)]
    removed: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    status: Option<U64>,
}

impl RpcClient {
    /// `endpoints[0]` is the primary; all of them receive broadcasts.
    pub fn new(
        endpoints: Vec<String>,
        coordinator: Address,
        rpc_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!endpoints.is_empty(), "at least one RPC endpoint is required");
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoints,
            http,
            send_timeout,
            coordinator,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;
        if !response.status().is_success() {
            return Err(ChainError::Transport {
                method,
                message: format!("http status {}", response.status()),
            });
        }
        let resp: JsonRpcResponse<T> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ChainError::Timeout { method }
            } else {
                ChainError::Decode {
                    method,
                    message: e.to_string(),
                }
            }
        })?;

        if let Some(err) = resp.error {
            return Err(ChainError::Rpc {
                method,
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result)
    }

    /// Call the primary endpoint, falling back on transport failures.
    async fn read<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let mut last_error = None;
        for url in &self.endpoints {
            match self.call(url, method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transport() => {
                    debug!(endpoint = %url, error = %e, "Endpoint unavailable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(ChainError::Transport {
            method,
            message: "no endpoints configured".into(),
        }))
    }

    async fn read_required<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, ChainError> {
        self.read(method, params).await?.ok_or(ChainError::Decode {
            method,
            message: "null result".into(),
        })
    }
}

fn transport_error(method: &'static str, e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout { method }
    } else {
        ChainError::Transport {
            method,
            message: e.to_string(),
        }
    }
}

fn block_tag(block: u64) -> String {
    format!("{block:#x}")
}

/// Topic filter matching both coordinator events.
pub(crate) fn coordinator_topics() -> Value {
    json!([[abi::requested_topic(), abi::fulfilled_topic()]])
}

/// Decode a coordinator log, dropping removed, pending and unknown ones.
pub(crate) fn decode_rpc_log(log: RpcLog) -> Option<CoordinatorEvent> {
    if log.removed {
        return None;
    }
    // Pending logs carry no block yet.
    let block_number = log.block_number?;
    let entry = LogEntry {
        topics: log.topics,
        data: log.data,
        block_number: block_number.to::<u64>(),
        tx_hash: log.transaction_hash,
    };
    match abi::decode_log(&entry) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                block = entry.block_number,
                tx = ?entry.tx_hash,
                error = %e,
                "Skipping undecodable coordinator log"
            );
            None
        }
    }
}

#[async_trait]
impl CoordinatorChain for RpcClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let block: U64 = self.read_required("eth_blockNumber", json!([])).await?;
        Ok(block.to::<u64>())
    }

    async fn vrf_logs(&self, from_block: u64, to_block: u64) -> Result<VrfLogs, ChainError> {
        let filter = json!({
            "fromBlock": block_tag(from_block),
            "toBlock": block_tag(to_block),
            "address": self.coordinator,
            "topics": coordinator_topics(),
        });
        let logs: Vec<RpcLog> = self.read_required("eth_getLogs", json!([filter])).await?;

        let mut out = VrfLogs::default();
        for log in logs {
            match decode_rpc_log(log) {
                Some(CoordinatorEvent::Requested(request)) => out.requested.push(request),
                Some(CoordinatorEvent::Fulfilled(fulfilled)) => out.fulfilled.push(fulfilled),
                None => {}
            }
        }
        Ok(out)
    }

    async fn commitment(&self, request_id: U256) -> Result<B256, ChainError> {
        let call = json!({
            "to": self.coordinator,
            "data": abi::encode_get_commitment(request_id),
        });
        let output: Bytes = self.read_required("eth_call", json!([call, "latest"])).await?;
        abi::decode_commitment(&output).map_err(|e| ChainError::Decode {
            method: "eth_call",
            message: e.to_string(),
        })
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let count: U64 = self
            .read_required("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(count.to::<u64>())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<B256, ChainError> {
        const METHOD: &str = "eth_sendRawTransaction";
        let payload = Bytes::copy_from_slice(raw_tx);

        let sends = self.endpoints.iter().map(|url| {
            let params = json!([payload]);
            async move {
                tokio::time::timeout(self.send_timeout, self.call::<B256>(url, METHOD, params))
                    .await
            }
        });
        let results = join_all(sends).await;

        let mut accepted = 0usize;
        let mut timed_out = 0usize;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Ok(_)) => accepted += 1,
                Ok(Err(ChainError::Timeout { .. })) | Err(_) => timed_out += 1,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(
            endpoints = self.endpoints.len(),
            accepted, timed_out, "Multisend finished"
        );

        if accepted > 0 {
            return Ok(keccak256(raw_tx));
        }
        match first_error {
            Some(e) => Err(e),
            // Slow nodes usually still take the transaction; the receipt
            // wait settles whether it landed.
            None => {
                warn!(timed_out, "No endpoint answered the broadcast in time, assuming sent");
                Ok(keccak256(raw_tx))
            }
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .read("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(receipt.and_then(|r| {
            // A receipt without a block is not final yet.
            let block_number = r.block_number?.to::<u64>();
            Some(TxReceipt {
                tx_hash: r.transaction_hash,
                block_number,
                success: r.status.is_some_and(|s| s == U64::from(1)),
            })
        }))
    }
}
