use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::debug;

pub const CHALLENGE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    pub pubkey: Option<String>,
}

impl Challenge {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// In-memory registry of LNURL-auth challenges. One mutex guards the whole
/// map and is never held across an await.
#[derive(Default)]
pub struct ChallengeStore {
    inner: Mutex<HashMap<String, Challenge>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Challenge>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> (String, DateTime<Utc>) {
        self.create_at(Utc::now())
    }

    pub fn create_at(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let mut b = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut b);
        let id = hex::encode(b);
        let expires_at = now + Duration::seconds(CHALLENGE_TTL_SECS);

        self.map().insert(
            id.clone(),
            Challenge {
                id: id.clone(),
                created_at: now,
                expires_at,
                verified: false,
                pubkey: None,
            },
        );
        (id, expires_at)
    }

    pub fn get(&self, id: &str) -> Option<Challenge> {
        self.get_at(id, Utc::now())
    }

    pub fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<Challenge> {
        let mut map = self.map();
        match map.get(id) {
            Some(c) if c.is_live(now) => Some(c.clone()),
            Some(_) => {
                debug!("challenge {id} expired");
                map.remove(id);
                None
            }
            None => None,
        }
    }

    /// Single-use transition to verified. Fails without mutating when the
    /// challenge is missing, expired or already verified.
    pub fn mark_verified(&self, id: &str, pubkey: &str) -> bool {
        self.mark_verified_at(id, pubkey, Utc::now())
    }

    pub fn mark_verified_at(&self, id: &str, pubkey: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.map();
        let Some(c) = map.get_mut(id) else {
            return false;
        };
        if !c.is_live(now) {
            map.remove(id);
            return false;
        }
        if c.verified {
            return false;
        }
        c.verified = true;
        c.pubkey = Some(pubkey.to_owned());
        true
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, c| c.is_live(now));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }
}

pub async fn run_reaper(store: Arc<ChallengeStore>, period: StdDuration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let evicted = store.purge_expired();
        if evicted > 0 {
            debug!("reaped {evicted} expired challenges, {} live", store.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_issues_hex_id_with_five_minute_ttl() {
        let store = ChallengeStore::new();
        let now = Utc::now();
        let (id, exp) = store.create_at(now);
        assert_eq!(id.len(), 64);
        assert!(hex::decode(&id).is_ok());
        assert_eq!(exp - now, Duration::seconds(300));

        let c = store.get_at(&id, now).unwrap();
        assert!(!c.verified);
        assert!(c.pubkey.is_none());
    }

    #[test]
    fn ids_are_distinct() {
        let store = ChallengeStore::new();
        let (a, _) = store.create();
        let (b, _) = store.create();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn expiry_boundary_is_300_seconds() {
        let store = ChallengeStore::new();
        let t = Utc::now();
        let (id, _) = store.create_at(t);

        assert!(store.get_at(&id, t + Duration::seconds(299)).is_some());
        assert!(store.get_at(&id, t + Duration::seconds(300)).is_some());
        assert!(store.get_at(&id, t + Duration::seconds(301)).is_none());
        // evicted on the failed lookup
        assert_eq!(store.len(), 0);
        assert!(store.get_at(&id, t).is_none());
    }

    #[test]
    fn mark_verified_is_single_use() {
        let store = ChallengeStore::new();
        let (id, _) = store.create();

        assert!(store.mark_verified(&id, "02aa"));
        assert!(!store.mark_verified(&id, "02bb"));

        let c = store.get(&id).unwrap();
        assert!(c.verified);
        assert_eq!(c.pubkey.as_deref(), Some("02aa"));
    }

    #[test]
    fn mark_verified_rejects_unknown_and_expired() {
        let store = ChallengeStore::new();
        assert!(!store.mark_verified("deadbeef", "02aa"));

        let t = Utc::now();
        let (id, _) = store.create_at(t);
        assert!(!store.mark_verified_at(&id, "02aa", t + Duration::seconds(301)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn purge_only_drops_expired() {
        let store = ChallengeStore::new();
        let t = Utc::now();
        let (old, _) = store.create_at(t - Duration::seconds(400));
        let (fresh, _) = store.create_at(t);

        assert_eq!(store.purge_expired_at(t), 1);
        assert!(store.get_at(&old, t).is_none());
        assert!(store.get_at(&fresh, t).is_some());
    }

    #[test]
    fn concurrent_verification_has_one_winner() {
        let store = Arc::new(ChallengeStore::new());
        let (id, _) = store.create();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || store.mark_verified(&id, &format!("key{i}")))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
