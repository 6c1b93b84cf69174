// src/types.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::ListFilter;

#[derive(Serialize)]
pub struct ChallengeRes {
    pub k1: String,
    pub lnurl: String,
    pub qr_code: String,
    pub expires_at: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub k1: String,
    pub key: String,
    pub sig: String,
    pub tag: Option<String>,
    pub action: Option<String>,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    pub k1: String,
}

/// LNURL wallets and the polling frontend read `status` as OK / PENDING / ERROR.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct LnurlStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

impl LnurlStatus {
    pub fn ok(pubkey: Option<String>) -> Self {
        Self { status: "OK", reason: None, pubkey }
    }
    pub fn pending() -> Self {
        Self { status: "PENDING", reason: None, pubkey: None }
    }
    pub fn error(reason: impl Into<String>) -> Self {
        Self { status: "ERROR", reason: Some(reason.into()), pubkey: None }
    }
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    pub verified_only: bool,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl From<ListQuery> for ListFilter {
    fn from(q: ListQuery) -> Self {
        let d = ListFilter::default();
        ListFilter {
            verified_only: q.verified_only,
            offset: q.skip.unwrap_or(d.offset),
            limit: q.limit.unwrap_or(d.limit).min(500),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateStoreReq {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub btc_address: String,
    pub verification_amount: Option<u64>,
}

#[derive(Deserialize)]
pub struct UpdateStoreReq {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub btc_address: Option<String>,
}

#[derive(Deserialize)]
pub struct VerifyStoreReq {
    pub txid: String,
}

#[derive(Deserialize)]
pub struct CheckStoreTxReq {
    pub txid: String,
    pub address: String,
    pub amount: u64,
}

#[derive(Deserialize)]
pub struct CreateReviewReq {
    pub store_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    pub txid: String,
    /// A verified LNURL-auth challenge; links the review to the signer's key.
    pub k1: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateReviewReq {
    pub rating: Option<u8>,
    pub comment: Option<String>,
    pub txid: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct VerifyReviewReq {
    pub amount: Option<u64>,
}

#[derive(Deserialize)]
pub struct CheckReviewTxReq {
    pub txid: String,
    pub store_id: Uuid,
    pub amount: Option<u64>,
}
