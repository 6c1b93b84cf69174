use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::directory::{
    Directory, DirectoryError, ListFilter, NewReview, NewStore, Review, ReviewPatch, Store, StorePatch,
};

pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub async fn connect(url: &str) -> Result<Self, DirectoryError> {
        let db = PgPool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&db).await?;
        info!("postgres directory ready");
        Ok(Self { db })
    }
}

fn sats(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn store_from_row(r: &PgRow) -> Result<Store, sqlx::Error> {
    Ok(Store {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        description: r.try_get("description")?,
        category: r.try_get("category")?,
        website: r.try_get("website")?,
        btc_address: r.try_get("btc_address")?,
        verified: r.try_get("verified")?,
        verification_txid: r.try_get("verification_txid")?,
        verification_amount: r.try_get::<i64, _>("verification_amount")?.max(0) as u64,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn review_from_row(r: &PgRow) -> Result<Review, sqlx::Error> {
    Ok(Review {
        id: r.try_get("id")?,
        store_id: r.try_get("store_id")?,
        rating: r.try_get::<i16, _>("rating")?.clamp(0, 255) as u8,
        comment: r.try_get("comment")?,
        txid: r.try_get("txid")?,
        verified: r.try_get("verified")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        user_pubkey: r.try_get("user_pubkey")?,
    })
}

fn page(filter: ListFilter) -> (i64, i64) {
    let clamp = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    (clamp(filter.limit), clamp(filter.offset))
}

#[async_trait]
impl Directory for PgDirectory {
    async fn insert_store(&self, new: NewStore) -> Result<Store, DirectoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stores (id, name, description, category, website, btc_address, verification_amount)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.category)
        .bind(&new.website)
        .bind(&new.btc_address)
        .bind(sats(new.verification_amount))
        .fetch_one(&self.db)
        .await?;
        Ok(store_from_row(&row)?)
    }

    async fn get_store(&self, id: Uuid) -> Result<Option<Store>, DirectoryError> {
        let row = sqlx::query("SELECT * FROM stores WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.as_ref().map(store_from_row).transpose()?)
    }

    async fn list_stores(&self, filter: ListFilter) -> Result<Vec<Store>, DirectoryError> {
        let (limit, offset) = page(filter);
        let rows = sqlx::query(
            "SELECT * FROM stores
             WHERE ($1 = FALSE OR verified)
             ORDER BY created_at ASC
             LIMIT $2 OFFSET $3",
        )
        .bind(filter.verified_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(store_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_store(&self, id: Uuid, patch: StorePatch) -> Result<Option<Store>, DirectoryError> {
        let row = sqlx::query(
            r#"
            UPDATE stores
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                category = COALESCE($4, category),
                website = COALESCE($5, website),
                btc_address = COALESCE($6, btc_address),
                verified = COALESCE($7, verified),
                verification_txid = COALESCE($8, verification_txid),
                verification_amount = COALESCE($9, verification_amount),
                updated_at = now()
            WHERE id=$1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.name)
        .bind(patch.description)
        .bind(patch.category)
        .bind(patch.website)
        .bind(patch.btc_address)
        .bind(patch.verified)
        .bind(patch.verification_txid)
        .bind(patch.verification_amount.map(sats))
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(store_from_row).transpose()?)
    }

    async fn delete_store(&self, id: Uuid) -> Result<bool, DirectoryError> {
        let res = sqlx::query("DELETE FROM stores WHERE id=$1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, DirectoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO reviews (id, store_id, rating, comment, txid, user_pubkey)
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.store_id)
        .bind(i16::from(new.rating))
        .bind(&new.comment)
        .bind(&new.txid)
        .bind(&new.user_pubkey)
        .fetch_one(&self.db)
        .await?;
        Ok(review_from_row(&row)?)
    }

    async fn get_review(&self, id: Uuid) -> Result<Option<Review>, DirectoryError> {
        let row = sqlx::query("SELECT * FROM reviews WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.as_ref().map(review_from_row).transpose()?)
    }

    async fn list_reviews(&self, store_id: Uuid, filter: ListFilter) -> Result<Vec<Review>, DirectoryError> {
        let (limit, offset) = page(filter);
        let rows = sqlx::query(
            "SELECT * FROM reviews
             WHERE store_id=$1 AND ($2 = FALSE OR verified)
             ORDER BY created_at ASC
             LIMIT $3 OFFSET $4",
        )
        .bind(store_id)
        .bind(filter.verified_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(review_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_review(&self, id: Uuid, patch: ReviewPatch) -> Result<Option<Review>, DirectoryError> {
        let row = sqlx::query(
            r#"
            UPDATE reviews
            SET rating = COALESCE($2, rating),
                comment = COALESCE($3, comment),
                txid = COALESCE($4, txid),
                verified = COALESCE($5, verified),
                updated_at = now()
            WHERE id=$1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.rating.map(i16::from))
        .bind(patch.comment)
        .bind(patch.txid)
        .bind(patch.verified)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(review_from_row).transpose()?)
    }

    async fn delete_review(&self, id: Uuid) -> Result<bool, DirectoryError> {
        let res = sqlx::query("DELETE FROM reviews WHERE id=$1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
