use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domino_core::{MatchOutcome, MatchSettings, MoveRecord};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{PlayerId, ServiceError, ServiceResult, game::MatchId};

/// Immutable archive entry for one finished match. Together with the seed
/// the move history replays to the exact final state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub finished_at: DateTime<Utc>,
    pub players: Vec<PlayerId>,
    pub settings: MatchSettings,
    pub seed: u64,
    pub history: Vec<MoveRecord>,
    pub outcome: MatchOutcome,
    pub rated: bool,
}

/// One append-only rating ledger entry. `match_id` is None for decay
/// adjustments, which are not tied to any match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingChangeRecord {
    pub player: PlayerId,
    pub match_id: Option<MatchId>,
    pub delta: f64,
    pub rating_after: f64,
    pub games_played: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait MatchHistoryRepository {
    async fn append(&self, record: &MatchRecord) -> ServiceResult<()>;
    async fn get_match(&self, match_id: &MatchId) -> ServiceResult<Option<MatchRecord>>;
}

#[async_trait]
pub trait RatingRepository {
    async fn append(&self, record: &RatingChangeRecord) -> ServiceResult<()>;
    async fn read_latest_rating(
        &self,
        player: &PlayerId,
    ) -> ServiceResult<Option<RatingChangeRecord>>;
}

#[async_trait]
impl<T: MatchHistoryRepository + Send + Sync> MatchHistoryRepository for std::sync::Arc<T> {
    async fn append(&self, record: &MatchRecord) -> ServiceResult<()> {
        (**self).append(record).await
    }

    async fn get_match(&self, match_id: &MatchId) -> ServiceResult<Option<MatchRecord>> {
        (**self).get_match(match_id).await
    }
}

#[async_trait]
impl<T: RatingRepository + Send + Sync> RatingRepository for std::sync::Arc<T> {
    async fn append(&self, record: &RatingChangeRecord) -> ServiceResult<()> {
        (**self).append(record).await
    }

    async fn read_latest_rating(
        &self,
        player: &PlayerId,
    ) -> ServiceResult<Option<RatingChangeRecord>> {
        (**self).read_latest_rating(player).await
    }
}

#[derive(Default)]
pub struct InMemoryMatchHistoryRepository {
    records: DashMap<MatchId, MatchRecord>,
}

impl InMemoryMatchHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MatchHistoryRepository for InMemoryMatchHistoryRepository {
    async fn append(&self, record: &MatchRecord) -> ServiceResult<()> {
        if self.records.contains_key(&record.match_id) {
            return ServiceError::internal(format!(
                "match {} already archived",
                record.match_id
            ));
        }
        self.records.insert(record.match_id, record.clone());
        Ok(())
    }

    async fn get_match(&self, match_id: &MatchId) -> ServiceResult<Option<MatchRecord>> {
        Ok(self.records.get(match_id).map(|r| r.clone()))
    }
}

#[derive(Default)]
pub struct InMemoryRatingRepository {
    log: DashMap<PlayerId, Vec<RatingChangeRecord>>,
}

impl InMemoryRatingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, player: &PlayerId) -> Vec<RatingChangeRecord> {
        self.log.get(player).map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RatingRepository for InMemoryRatingRepository {
    async fn append(&self, record: &RatingChangeRecord) -> ServiceResult<()> {
        self.log
            .entry(record.player.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_latest_rating(
        &self,
        player: &PlayerId,
    ) -> ServiceResult<Option<RatingChangeRecord>> {
        Ok(self.log.get(player).and_then(|v| v.last().cloned()))
    }
}

/// Records whose persistence retries were exhausted, parked for manual
/// replay. Writes here never fail; draining is an operator action.
#[derive(Default)]
pub struct DeadLetterLog {
    entries: Mutex<Vec<(String, serde_json::Value)>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park<T: Serialize>(&self, kind: &str, record: &T) {
        let value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        self.entries
            .lock()
            .expect("dead letter lock poisoned")
            .push((kind.to_string(), value));
    }

    pub fn drain(&self) -> Vec<(String, serde_json::Value)> {
        std::mem::take(&mut *self.entries.lock().expect("dead letter lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead letter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Retry an append with exponential backoff, off the game path. The caller
/// parks the record in the dead letter log when this returns Err.
pub async fn with_backoff<F, Fut>(what: &str, attempts: u32, mut op: F) -> ServiceResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<()>>,
{
    let mut delay = Duration::from_millis(250);
    for attempt in 1..=attempts {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("{} append failed (attempt {}/{}): {}", what, attempt, attempts, e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    ServiceError::internal(format!("{}: retries exhausted", what))
}
