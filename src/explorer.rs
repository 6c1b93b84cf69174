//! Esplora block-explorer client (mempool.space, Blockstream).

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("explorer returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxStatus {
    #[serde(default)]
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    pub scriptpubkey_address: Option<String>,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    /// Absent for coinbase inputs.
    pub prevout: Option<TxOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    #[serde(default)]
    pub status: TxStatus,
}

impl EsploraTx {
    /// None if the outputs overflow a u64, which no real transaction does.
    pub fn total_output_value(&self) -> Option<u64> {
        self.vout.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    pub fn has_input_from(&self, address: &str) -> bool {
        self.vin.iter().any(|i| {
            i.prevout
                .as_ref()
                .and_then(|p| p.scriptpubkey_address.as_deref())
                == Some(address)
        })
    }

    pub fn outputs_to<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a TxOutput> + 'a {
        self.vout
            .iter()
            .filter(move |o| o.scriptpubkey_address.as_deref() == Some(address))
    }
}

#[derive(Clone)]
pub struct Explorer {
    base_url: String,
    client: reqwest::Client,
}

impl Explorer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExplorerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExplorerError> {
        let res = self.client.get(self.url(path)).send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ExplorerError::NotFound(path.to_owned()));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ExplorerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = res.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ExplorerError::Decode(e.to_string()))
    }

    pub async fn transaction(&self, txid: &str) -> Result<EsploraTx, ExplorerError> {
        self.get(&format!("tx/{txid}")).await
    }

    /// Newest first, as served by Esplora.
    pub async fn address_transactions(&self, address: &str) -> Result<Vec<EsploraTx>, ExplorerError> {
        self.get(&format!("address/{address}/txs")).await
    }
}
