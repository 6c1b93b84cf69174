use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    api::AppState,
    directory::{NewReview, Review, ReviewPatch},
    error::{bad, not_found, ApiError},
    types::*,
    verify::VerificationResult,
};

fn valid_rating(rating: u8) -> Result<u8, ApiError> {
    if (1..=5).contains(&rating) {
        Ok(rating)
    } else {
        Err(bad("rating"))
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateReviewReq>,
) -> Result<Json<Review>, ApiError> {
    let rating = valid_rating(req.rating)?;
    let txid = req.txid.trim();
    if txid.is_empty() {
        return Err(bad("txid"));
    }
    state
        .directory
        .get_store(req.store_id)
        .await?
        .ok_or(not_found("Store"))?;

    let user_pubkey = match req.k1.as_deref() {
        Some(k1) => Some(
            state
                .lnurl
                .get_pubkey_from_challenge(k1)
                .ok_or_else(|| ApiError::Unauthorized("LNURL-auth challenge not verified".into()))?,
        ),
        None => None,
    };

    let review = state
        .directory
        .insert_review(NewReview {
            store_id: req.store_id,
            rating,
            comment: req.comment,
            txid: txid.to_owned(),
            user_pubkey,
        })
        .await?;
    info!("review {} added to store {}", review.id, review.store_id);
    Ok(Json(review))
}

pub async fn list(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Review>>, ApiError> {
    Ok(Json(state.directory.list_reviews(store_id, q.into()).await?))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Review>, ApiError> {
    let review = state.directory.get_review(id).await?.ok_or(not_found("Review"))?;
    Ok(Json(review))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateReviewReq>,
) -> Result<Json<Review>, ApiError> {
    let current = state.directory.get_review(id).await?.ok_or(not_found("Review"))?;
    let mut patch = ReviewPatch {
        rating: req.rating.map(valid_rating).transpose()?,
        comment: req.comment,
        ..Default::default()
    };
    if let Some(txid) = req.txid {
        let txid = txid.trim().to_owned();
        if txid.is_empty() {
            return Err(bad("txid"));
        }
        // a new payment has to be verified again
        if txid != current.txid {
            patch.verified = Some(false);
        }
        patch.txid = Some(txid);
    }

    let review = state.directory.update_review(id, patch).await?.ok_or(not_found("Review"))?;
    Ok(Json(review))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.directory.delete_review(id).await? {
        return Err(not_found("Review"));
    }
    Ok(Json(json!({"status": "success", "message": "Review deleted successfully"})))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<VerifyReviewReq>>,
) -> Result<Json<Review>, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let review = state.directory.get_review(id).await?.ok_or(not_found("Review"))?;
    if review.verified {
        return Err(ApiError::BadRequest("Review is already verified".into()));
    }
    let store = state
        .directory
        .get_store(review.store_id)
        .await?
        .ok_or(not_found("Associated store"))?;

    let result = state
        .verifier
        .verify_review(&review.txid, &store.btc_address, req.amount)
        .await;
    if !result.is_verified() {
        let reason = result.error().unwrap_or("Invalid payment transaction");
        return Err(ApiError::BadRequest(reason.to_owned()));
    }

    let patch = ReviewPatch {
        verified: Some(true),
        ..Default::default()
    };
    let review = state.directory.update_review(id, patch).await?.ok_or(not_found("Review"))?;
    info!("review {id} verified by {}", review.txid);
    Ok(Json(review))
}

pub async fn check_transaction(
    State(state): State<AppState>,
    Json(req): Json<CheckReviewTxReq>,
) -> Result<Json<VerificationResult>, ApiError> {
    let store = state
        .directory
        .get_store(req.store_id)
        .await?
        .ok_or(not_found("Store"))?;
    Ok(Json(
        state
            .verifier
            .verify_review(req.txid.trim(), &store.btc_address, req.amount)
            .await,
    ))
}
