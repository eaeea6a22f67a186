// JSON-RPC ledger client
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{LedgerClient, LedgerError, NodeInfo, Transfer, TransferState, TxRef};
use crate::keyspace::Address;

pub struct RpcLedgerClient {
    url: String,
    client: Client,
    request_id: AtomicU64,
}

impl RpcLedgerClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unreachable(format!("http client: {}", e)))?;
        Ok(Self {
            url,
            client,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        debug!("rpc {} #{}", method, id);

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(format!("RPC request failed: {}", e)))?;

        if response.status().is_server_error() {
            return Err(LedgerError::Unreachable(format!("RPC status {}", response.status())));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::BadResponse(format!("Failed to parse response: {}", e)))?;

        parse_response(json)
    }
}

fn parse_response<T: DeserializeOwned>(json: Value) -> Result<T, LedgerError> {
    if let Some(error) = json.get("error") {
        return Err(LedgerError::Rejected(
            error["message"].as_str().unwrap_or("Unknown error").to_string(),
        ));
    }
    let result = json
        .get("result")
        .cloned()
        .ok_or_else(|| LedgerError::BadResponse("missing result".to_string()))?;
    serde_json::from_value(result).map_err(|e| LedgerError::BadResponse(e.to_string()))
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn node_info(&self) -> Result<NodeInfo, LedgerError> {
        self.call("getNodeInfo", Value::Null).await
    }

    async fn submit_transfer(&self, transfer: &Transfer) -> Result<TxRef, LedgerError> {
        let result: Value = self.call("submitTransfer", json!({ "outputs": transfer.outputs })).await?;
        result["txRef"]
            .as_str()
            .map(|s| TxRef(s.to_string()))
            .ok_or_else(|| LedgerError::BadResponse("missing txRef".to_string()))
    }

    async fn query_balance(&self, address: &Address) -> Result<u64, LedgerError> {
        let result: Value = self.call("getBalance", json!({ "address": address })).await?;
        result["balance"]
            .as_u64()
            .ok_or_else(|| LedgerError::BadResponse("missing balance".to_string()))
    }

    async fn query_deposits(&self, address: &Address) -> Result<Vec<u64>, LedgerError> {
        let result: Value = self.call("getDeposits", json!({ "address": address })).await?;
        serde_json::from_value(result["deposits"].clone())
            .map_err(|e| LedgerError::BadResponse(e.to_string()))
    }

    async fn transfer_status(&self, tx_ref: &TxRef) -> Result<TransferState, LedgerError> {
        let result: Value = self.call("getTransferStatus", json!({ "txRef": tx_ref.0 })).await?;
        serde_json::from_value(result["state"].clone())
            .map_err(|e| LedgerError::BadResponse(e.to_string()))
    }
}
