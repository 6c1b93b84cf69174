use serde::Serialize;
use tracing::{debug, warn};

use crate::explorer::{EsploraTx, Explorer, ExplorerError};

/// What a transaction has to prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The store controls the address: an input spends from it and the
    /// outputs total exactly `amount`.
    Store { amount: u64 },
    /// A customer paid the store: an output pays the address, exactly
    /// `amount` when given, otherwise at least the configured minimum.
    Review { amount: Option<u64> },
}

/// Outcome of a verification. `verified` always comes with `amount` and
/// `txid`; a failure always carries `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    txid: Option<String>,
}

impl VerificationResult {
    pub fn success(txid: impl Into<String>, amount: u64) -> Self {
        Self {
            verified: true,
            amount: Some(amount),
            error: None,
            txid: Some(txid.into()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            verified: false,
            amount: None,
            error: Some(error.into()),
            txid: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn amount(&self) -> Option<u64> {
        self.amount
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn txid(&self) -> Option<&str> {
        self.txid.as_deref()
    }
}

pub struct TransactionVerifier {
    explorer: Explorer,
    review_min_amount: u64,
}

impl TransactionVerifier {
    pub fn new(explorer: Explorer, review_min_amount: u64) -> Self {
        Self {
            explorer,
            review_min_amount: review_min_amount.max(1),
        }
    }

    pub fn explorer(&self) -> &Explorer {
        &self.explorer
    }

    /// Fetch `txid` and judge it. Upstream failures become a failed result;
    /// nothing is retried.
    pub async fn verify(&self, txid: &str, expected_address: &str, mode: Mode) -> VerificationResult {
        if !is_txid(txid) {
            return VerificationResult::failure("Invalid transaction id");
        }

        let tx = match self.explorer.transaction(txid).await {
            Ok(tx) => tx,
            Err(ExplorerError::NotFound(_)) => {
                debug!("transaction {txid} not found");
                return VerificationResult::failure("Transaction not found");
            }
            Err(e) => {
                warn!("explorer lookup for {txid} failed: {e}");
                return VerificationResult::failure(format!("Error verifying transaction: {e}"));
            }
        };

        let result = self.evaluate(&tx, expected_address, mode);
        debug!(
            "tx {txid} at height {:?} against {expected_address} ({mode:?}): {result:?}",
            tx.status.block_height
        );
        result
    }

    pub async fn verify_store(&self, txid: &str, address: &str, amount: u64) -> VerificationResult {
        self.verify(txid, address, Mode::Store { amount }).await
    }

    pub async fn verify_review(&self, txid: &str, address: &str, amount: Option<u64>) -> VerificationResult {
        self.verify(txid, address, Mode::Review { amount }).await
    }

    pub fn evaluate(&self, tx: &EsploraTx, address: &str, mode: Mode) -> VerificationResult {
        if !tx.status.confirmed {
            return VerificationResult::failure("Transaction not confirmed yet");
        }
        match mode {
            Mode::Store { amount } => evaluate_store(tx, address, amount),
            Mode::Review { amount } => evaluate_review(tx, address, amount, self.review_min_amount),
        }
    }
}

fn evaluate_store(tx: &EsploraTx, address: &str, required: u64) -> VerificationResult {
    if !tx.has_input_from(address) {
        return VerificationResult::failure(format!("No input spends from {address}"));
    }
    let Some(total) = tx.total_output_value() else {
        return VerificationResult::failure("Amount mismatch: transaction output values overflow");
    };
    if total != required {
        return VerificationResult::failure(format!(
            "Amount mismatch: transaction outputs total {total} sats, exactly {required} sats required"
        ));
    }
    VerificationResult::success(&tx.txid, total)
}

fn evaluate_review(tx: &EsploraTx, address: &str, exact: Option<u64>, min: u64) -> VerificationResult {
    let values: Vec<u64> = tx.outputs_to(address).map(|o| o.value).collect();
    let Some(&first) = values.first() else {
        return VerificationResult::failure(format!("No output pays {address}"));
    };

    match exact {
        Some(required) => match values.iter().find(|&&v| v == required) {
            Some(&v) => VerificationResult::success(&tx.txid, v),
            None => VerificationResult::failure(format!(
                "Amount mismatch: output pays {first} sats, exactly {required} sats required"
            )),
        },
        None => match values.iter().find(|&&v| v >= min) {
            Some(&v) => VerificationResult::success(&tx.txid, v),
            None => VerificationResult::failure(format!(
                "Output pays {first} sats, at least {min} sats required"
            )),
        },
    }
}

fn is_txid(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
    const STORE: &str = "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh";
    const OTHER: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

    fn tx(v: Value) -> EsploraTx {
        serde_json::from_value(v).unwrap()
    }

    fn store_tx(confirmed: bool) -> Value {
        json!({
            "txid": TXID,
            "status": {"confirmed": confirmed},
            "vin": [{"prevout": {"scriptpubkey_address": STORE, "value": 50000}}],
            "vout": [
                {"scriptpubkey_address": OTHER, "value": 6000},
                {"scriptpubkey_address": STORE, "value": 4000}
            ]
        })
    }

    fn review_tx() -> Value {
        json!({
            "txid": TXID,
            "status": {"confirmed": true},
            "vin": [{"prevout": {"scriptpubkey_address": OTHER, "value": 9000}}],
            "vout": [
                {"scriptpubkey_address": STORE, "value": 5000},
                {"scriptpubkey_address": OTHER, "value": 3500}
            ]
        })
    }

    fn offline_verifier(min: u64) -> TransactionVerifier {
        let explorer = Explorer::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        TransactionVerifier::new(explorer, min)
    }

    #[test]
    fn store_mode_requires_exact_total() {
        let v = offline_verifier(1);
        let t = tx(store_tx(true));

        let ok = v.evaluate(&t, STORE, Mode::Store { amount: 10000 });
        assert_eq!(ok, VerificationResult::success(TXID, 10000));

        let bad = v.evaluate(&t, STORE, Mode::Store { amount: 9999 });
        assert!(!bad.is_verified());
        let msg = bad.error().unwrap();
        assert!(msg.contains("10000") && msg.contains("9999"), "{msg}");
    }

    #[test]
    fn overflowing_outputs_fail_store_mode() {
        let v = offline_verifier(1);
        let t = tx(json!({
            "txid": TXID,
            "status": {"confirmed": true},
            "vin": [{"prevout": {"scriptpubkey_address": STORE, "value": 50000}}],
            "vout": [
                {"scriptpubkey_address": OTHER, "value": u64::MAX},
                {"scriptpubkey_address": STORE, "value": 1}
            ]
        }));
        assert_eq!(t.total_output_value(), None);

        let r = v.evaluate(&t, STORE, Mode::Store { amount: 0 });
        assert!(!r.is_verified());
        assert!(r.error().unwrap().contains("overflow"));
    }

    #[test]
    fn store_mode_requires_input_from_address() {
        let v = offline_verifier(1);
        let r = v.evaluate(&tx(review_tx()), STORE, Mode::Store { amount: 8500 });
        assert!(!r.is_verified());
        assert!(r.error().unwrap().contains("No input"));
    }

    #[test]
    fn unconfirmed_fails_regardless_of_match() {
        let v = offline_verifier(1);
        let r = v.evaluate(&tx(store_tx(false)), STORE, Mode::Store { amount: 10000 });
        assert!(!r.is_verified());
        assert!(r.error().unwrap().contains("not confirmed"));
        assert_eq!(r.amount(), None);
        assert_eq!(r.txid(), None);
    }

    #[test]
    fn review_mode_without_amount_takes_positive_output() {
        let v = offline_verifier(1);
        let r = v.evaluate(&tx(review_tx()), STORE, Mode::Review { amount: None });
        assert_eq!(r, VerificationResult::success(TXID, 5000));
    }

    #[test]
    fn review_mode_threshold_applies_without_amount() {
        let v = offline_verifier(5001);
        let r = v.evaluate(&tx(review_tx()), STORE, Mode::Review { amount: None });
        assert!(!r.is_verified());
        assert!(r.error().unwrap().contains("at least 5001"));
    }

    #[test]
    fn review_mode_exact_amount() {
        let v = offline_verifier(1);
        let t = tx(review_tx());
        assert!(v.evaluate(&t, STORE, Mode::Review { amount: Some(5000) }).is_verified());

        let r = v.evaluate(&t, STORE, Mode::Review { amount: Some(4999) });
        assert!(!r.is_verified());
        assert!(r.error().unwrap().contains("Amount mismatch"));
    }

    #[test]
    fn review_mode_requires_output_to_address() {
        let v = offline_verifier(1);
        let r = v.evaluate(&tx(review_tx()), "bc1qnobody", Mode::Review { amount: None });
        assert!(r.error().unwrap().contains("No output"));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let ok = serde_json::to_value(VerificationResult::success(TXID, 5000)).unwrap();
        assert_eq!(ok, json!({"verified": true, "amount": 5000, "txid": TXID}));
        let bad = serde_json::to_value(VerificationResult::failure("nope")).unwrap();
        assert_eq!(bad, json!({"verified": false, "error": "nope"}));
    }

    #[tokio::test]
    async fn malformed_txid_is_rejected_before_fetch() {
        let r = offline_verifier(1).verify_store("../address/x", STORE, 1).await;
        assert_eq!(r.error(), Some("Invalid transaction id"));
    }

    #[tokio::test]
    async fn fetch_failures_become_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/tx/{TXID}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let v = TransactionVerifier::new(
            Explorer::new(&server.uri(), Duration::from_secs(2)).unwrap(),
            1,
        );
        let r = v.verify_review(TXID, STORE, None).await;
        assert_eq!(r.error(), Some("Transaction not found"));

        let r = offline_verifier(1).verify_review(TXID, STORE, None).await;
        assert!(!r.is_verified());
        assert!(r.error().unwrap().starts_with("Error verifying transaction"));
    }

    #[tokio::test]
    async fn verifies_fetched_store_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/tx/{TXID}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(store_tx(true)))
            .mount(&server)
            .await;
        let v = TransactionVerifier::new(
            Explorer::new(&server.uri(), Duration::from_secs(2)).unwrap(),
            1,
        );

        let r = v.verify_store(TXID, STORE, 10000).await;
        assert!(r.is_verified());
        assert_eq!(r.amount(), Some(10000));
        assert_eq!(r.txid(), Some(TXID));
    }
}
