use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::AppState,
    directory::{Directory, DirectoryError, NewStore, Store, StorePatch},
    error::{bad, not_found, ApiError},
    explorer::{EsploraTx, ExplorerError},
    monitor::AddressMonitor,
    types::*,
    verify::{Mode, TransactionVerifier, VerificationResult},
};

/// How many polls an unconfirmed candidate transaction is followed for.
const CONFIRMATION_POLLS: u32 = 120;

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateStoreReq>,
) -> Result<Json<Store>, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(bad("name"));
    }
    let btc_address = req.btc_address.trim();
    if btc_address.is_empty() {
        return Err(bad("btc_address"));
    }
    let verification_amount = req
        .verification_amount
        .unwrap_or(state.config.store_verification_amount);
    if verification_amount == 0 {
        return Err(bad("verification_amount"));
    }

    let store = state
        .directory
        .insert_store(NewStore {
            name: name.to_owned(),
            description: req.description,
            category: req.category,
            website: req.website,
            btc_address: btc_address.to_owned(),
            verification_amount,
        })
        .await?;
    info!("created store {} ({})", store.id, store.name);
    Ok(Json(store))
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Store>>, ApiError> {
    Ok(Json(state.directory.list_stores(q.into()).await?))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Store>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    Ok(Json(store))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStoreReq>,
) -> Result<Json<Store>, ApiError> {
    let current = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(bad("name"));
    }

    let mut patch = StorePatch {
        name: req.name,
        description: req.description,
        category: req.category,
        website: req.website,
        ..Default::default()
    };
    if let Some(address) = req.btc_address {
        let address = address.trim().to_owned();
        if address.is_empty() {
            return Err(bad("btc_address"));
        }
        // verification proved control of the old address only
        if address != current.btc_address {
            patch.verified = Some(false);
            state.monitor.stop(&current.btc_address).await;
        }
        patch.btc_address = Some(address);
    }

    let store = state.directory.update_store(id, patch).await?.ok_or(not_found("Store"))?;
    Ok(Json(store))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    if !state.directory.delete_store(id).await? {
        return Err(not_found("Store"));
    }
    state.monitor.stop(&store.btc_address).await;
    Ok(Json(json!({"status": "success", "message": "Store deleted successfully"})))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<VerifyStoreReq>,
) -> Result<Json<Store>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    if store.verified {
        return Err(ApiError::BadRequest("Store is already verified".into()));
    }
    if store.btc_address.is_empty() {
        return Err(ApiError::BadRequest("Store has no Bitcoin address".into()));
    }

    let result = state
        .verifier
        .verify_store(req.txid.trim(), &store.btc_address, store.verification_amount)
        .await;
    if !result.is_verified() {
        let reason = result.error().unwrap_or("Invalid verification transaction");
        return Err(ApiError::BadRequest(reason.to_owned()));
    }

    let store = mark_verified(state.directory.as_ref(), id, &result)
        .await?
        .ok_or(not_found("Store"))?;
    state.monitor.stop(&store.btc_address).await;
    info!("store {id} verified by {}", req.txid);
    Ok(Json(store))
}

pub async fn check_transaction(
    State(state): State<AppState>,
    Json(req): Json<CheckStoreTxReq>,
) -> Json<VerificationResult> {
    Json(
        state
            .verifier
            .verify_store(req.txid.trim(), req.address.trim(), req.amount)
            .await,
    )
}

/// Watch the store's address and verify it as soon as a matching
/// transaction confirms.
pub async fn start_monitor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    if store.verified {
        return Err(ApiError::BadRequest("Store is already verified".into()));
    }

    let ctx = AutoVerify {
        watch: StoreWatch {
            directory: state.directory.clone(),
            verifier: state.verifier.clone(),
            monitor: Arc::downgrade(&state.monitor),
            recheck: state.config.monitor_interval,
            store_id: store.id,
            address: store.btc_address.clone(),
        },
        pending: Arc::default(),
    };
    let started = state.monitor.watch(&store.btc_address, move |tx| {
        let ctx = ctx.clone();
        async move { ctx.on_transaction(tx).await }
    });

    Ok(Json(json!({
        "address": store.btc_address,
        "watching": true,
        "started": started,
        "verification_amount": store.verification_amount,
    })))
}

pub async fn monitor_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    Ok(Json(json!({
        "address": store.btc_address,
        "watching": state.monitor.is_watching(&store.btc_address),
        "last_seen": state.monitor.last_seen(&store.btc_address),
        "active_monitors": state.monitor.active_count(),
    })))
}

pub async fn stop_monitor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.directory.get_store(id).await?.ok_or(not_found("Store"))?;
    let stopped = state.monitor.stop(&store.btc_address).await;
    Ok(Json(json!({"address": store.btc_address, "watching": false, "stopped": stopped})))
}

pub(crate) async fn mark_verified(
    directory: &dyn Directory,
    id: Uuid,
    result: &VerificationResult,
) -> Result<Option<Store>, DirectoryError> {
    directory
        .update_store(
            id,
            StorePatch {
                verified: Some(true),
                verification_txid: result.txid().map(str::to_owned),
                verification_amount: result.amount(),
                ..Default::default()
            },
        )
        .await
}

#[derive(Clone)]
struct AutoVerify {
    watch: StoreWatch,
    pending: Arc<PendingConfirmations>,
}

/// What a confirmation wait needs. Holds no reference to the pending set,
/// so stopping the monitor drops that set and aborts the waits.
#[derive(Clone)]
struct StoreWatch {
    directory: Arc<dyn Directory>,
    verifier: Arc<TransactionVerifier>,
    monitor: Weak<AddressMonitor>,
    recheck: Duration,
    store_id: Uuid,
    address: String,
}

/// Confirmation waits for unconfirmed candidates, keyed by txid.
#[derive(Default)]
struct PendingConfirmations(Mutex<HashMap<String, JoinHandle<()>>>);

impl PendingConfirmations {
    fn track(&self, txid: &str, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut waits = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        waits.retain(|_, h| !h.is_finished());
        if waits.contains_key(txid) {
            return false;
        }
        waits.insert(txid.to_owned(), spawn());
        true
    }
}

impl Drop for PendingConfirmations {
    fn drop(&mut self) {
        let waits = self.0.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in waits.drain() {
            handle.abort();
        }
    }
}

impl AutoVerify {
    /// Runs inside the poll loop, so it never waits on confirmations itself.
    async fn on_transaction(&self, tx: EsploraTx) {
        let Some(mode) = self.watch.store_mode().await else {
            return;
        };

        let mut candidate = tx.clone();
        candidate.status.confirmed = true;
        if !self.watch.verifier.evaluate(&candidate, &self.watch.address, mode).is_verified() {
            debug!("tx {} does not verify store {}", tx.txid, self.watch.store_id);
            return;
        }

        if tx.status.confirmed {
            self.watch.settle(tx).await;
            return;
        }

        let txid = tx.txid.clone();
        let watch = self.watch.clone();
        let started = self.pending.track(&txid, move || {
            tokio::spawn(async move {
                if let Some(tx) = watch.await_confirmation(tx).await {
                    watch.settle(tx).await;
                }
            })
        });
        if started {
            debug!("waiting for {txid} to confirm for store {}", self.watch.store_id);
        }
    }
}

impl StoreWatch {
    /// Store-mode rule for a store still awaiting verification.
    async fn store_mode(&self) -> Option<Mode> {
        match self.directory.get_store(self.store_id).await {
            Ok(Some(store)) if !store.verified => Some(Mode::Store {
                amount: store.verification_amount,
            }),
            Ok(_) => {
                self.finish();
                None
            }
            Err(e) => {
                warn!("auto-verify lookup for store {} failed: {e}", self.store_id);
                None
            }
        }
    }

    async fn settle(&self, tx: EsploraTx) {
        let Some(mode) = self.store_mode().await else {
            return;
        };
        let result = self.verifier.evaluate(&tx, &self.address, mode);
        if !result.is_verified() {
            return;
        }
        match mark_verified(self.directory.as_ref(), self.store_id, &result).await {
            Ok(_) => {
                info!("store {} auto-verified by {}", self.store_id, tx.txid);
                self.finish();
            }
            Err(e) => warn!("failed to persist verification of {}: {e}", self.store_id),
        }
    }

    async fn await_confirmation(&self, mut tx: EsploraTx) -> Option<EsploraTx> {
        let mut polls = 0;
        while !tx.status.confirmed {
            if polls == CONFIRMATION_POLLS {
                warn!("gave up waiting for {} to confirm", tx.txid);
                return None;
            }
            polls += 1;
            tokio::time::sleep(self.recheck).await;
            match self.verifier.explorer().transaction(&tx.txid).await {
                Ok(fresh) => tx = fresh,
                Err(ExplorerError::NotFound(_)) => {
                    debug!("{} dropped from mempool", tx.txid);
                    return None;
                }
                Err(e) => warn!("recheck of {} failed: {e}", tx.txid),
            }
        }
        Some(tx)
    }

    /// Stop the monitor from outside its own task.
    fn finish(&self) {
        if let Some(monitor) = self.monitor.upgrade() {
            let address = self.address.clone();
            tokio::spawn(async move {
                monitor.stop(&address).await;
            });
        }
    }
}
