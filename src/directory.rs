use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Store {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub btc_address: String,
    pub verified: bool,
    pub verification_txid: Option<String>,
    pub verification_amount: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Review {
    pub id: Uuid,
    pub store_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    pub txid: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_pubkey: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewStore {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub btc_address: String,
    pub verification_amount: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StorePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub website: Option<String>,
    pub btc_address: Option<String>,
    pub verified: Option<bool>,
    pub verification_txid: Option<String>,
    pub verification_amount: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub store_id: Uuid,
    pub rating: u8,
    pub comment: Option<String>,
    pub txid: String,
    pub user_pubkey: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewPatch {
    pub rating: Option<u8>,
    pub comment: Option<String>,
    pub txid: Option<String>,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
pub struct ListFilter {
    pub verified_only: bool,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            verified_only: false,
            offset: 0,
            limit: 100,
        }
    }
}

/// Persistence for stores and their reviews.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn insert_store(&self, new: NewStore) -> Result<Store, DirectoryError>;
    async fn get_store(&self, id: Uuid) -> Result<Option<Store>, DirectoryError>;
    async fn list_stores(&self, filter: ListFilter) -> Result<Vec<Store>, DirectoryError>;
    async fn update_store(&self, id: Uuid, patch: StorePatch) -> Result<Option<Store>, DirectoryError>;
    /// Also removes the store's reviews.
    async fn delete_store(&self, id: Uuid) -> Result<bool, DirectoryError>;

    async fn insert_review(&self, new: NewReview) -> Result<Review, DirectoryError>;
    async fn get_review(&self, id: Uuid) -> Result<Option<Review>, DirectoryError>;
    async fn list_reviews(&self, store_id: Uuid, filter: ListFilter) -> Result<Vec<Review>, DirectoryError>;
    async fn update_review(&self, id: Uuid, patch: ReviewPatch) -> Result<Option<Review>, DirectoryError>;
    async fn delete_review(&self, id: Uuid) -> Result<bool, DirectoryError>;
}

/// Process-local backend used when no database is configured.
#[derive(Default)]
pub struct MemoryDirectory {
    stores: RwLock<HashMap<Uuid, Store>>,
    reviews: RwLock<HashMap<Uuid, Review>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: Vec<T>, filter: ListFilter) -> Vec<T> {
    items.into_iter().skip(filter.offset).take(filter.limit).collect()
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn insert_store(&self, new: NewStore) -> Result<Store, DirectoryError> {
        let now = Utc::now();
        let store = Store {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            category: new.category,
            website: new.website,
            btc_address: new.btc_address,
            verified: false,
            verification_txid: None,
            verification_amount: new.verification_amount,
            created_at: now,
            updated_at: now,
        };
        self.stores.write().await.insert(store.id, store.clone());
        Ok(store)
    }

    async fn get_store(&self, id: Uuid) -> Result<Option<Store>, DirectoryError> {
        Ok(self.stores.read().await.get(&id).cloned())
    }

    async fn list_stores(&self, filter: ListFilter) -> Result<Vec<Store>, DirectoryError> {
        let mut stores: Vec<Store> = self
            .stores
            .read()
            .await
            .values()
            .filter(|s| !filter.verified_only || s.verified)
            .cloned()
            .collect();
        stores.sort_by_key(|s| s.created_at);
        Ok(page(stores, filter))
    }

    async fn update_store(&self, id: Uuid, patch: StorePatch) -> Result<Option<Store>, DirectoryError> {
        let mut stores = self.stores.write().await;
        let Some(s) = stores.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = patch.name {
            s.name = v;
        }
        if let Some(v) = patch.description {
            s.description = Some(v);
        }
        if let Some(v) = patch.category {
            s.category = Some(v);
        }
        if let Some(v) = patch.website {
            s.website = Some(v);
        }
        if let Some(v) = patch.btc_address {
            s.btc_address = v;
        }
        if let Some(v) = patch.verified {
            s.verified = v;
        }
        if let Some(v) = patch.verification_txid {
            s.verification_txid = Some(v);
        }
        if let Some(v) = patch.verification_amount {
            s.verification_amount = v;
        }
        s.updated_at = Utc::now();
        Ok(Some(s.clone()))
    }

    async fn delete_store(&self, id: Uuid) -> Result<bool, DirectoryError> {
        let removed = self.stores.write().await.remove(&id).is_some();
        if removed {
            self.reviews.write().await.retain(|_, r| r.store_id != id);
        }
        Ok(removed)
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, DirectoryError> {
        let now = Utc::now();
        let review = Review {
            id: Uuid::new_v4(),
            store_id: new.store_id,
            rating: new.rating,
            comment: new.comment,
            txid: new.txid,
            verified: false,
            created_at: now,
            updated_at: now,
            user_pubkey: new.user_pubkey,
        };
        self.reviews.write().await.insert(review.id, review.clone());
        Ok(review)
    }

    async fn get_review(&self, id: Uuid) -> Result<Option<Review>, DirectoryError> {
        Ok(self.reviews.read().await.get(&id).cloned())
    }

    async fn list_reviews(&self, store_id: Uuid, filter: ListFilter) -> Result<Vec<Review>, DirectoryError> {
        let mut reviews: Vec<Review> = self
            .reviews
            .read()
            .await
            .values()
            .filter(|r| r.store_id == store_id && (!filter.verified_only || r.verified))
            .cloned()
            .collect();
        reviews.sort_by_key(|r| r.created_at);
        Ok(page(reviews, filter))
    }

    async fn update_review(&self, id: Uuid, patch: ReviewPatch) -> Result<Option<Review>, DirectoryError> {
        let mut reviews = self.reviews.write().await;
        let Some(r) = reviews.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(v) = patch.rating {
            r.rating = v;
        }
        if let Some(v) = patch.comment {
            r.comment = Some(v);
        }
        if let Some(v) = patch.txid {
            r.txid = v;
        }
        if let Some(v) = patch.verified {
            r.verified = v;
        }
        r.updated_at = Utc::now();
        Ok(Some(r.clone()))
    }

    async fn delete_review(&self, id: Uuid) -> Result<bool, DirectoryError> {
        Ok(self.reviews.write().await.remove(&id).is_some())
    }
}
