use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::{
    PlayerId, ServiceError, ServiceResult,
    app::ArcRatingRepository,
    game::MatchId,
    persistence::{DeadLetterLog, RatingChangeRecord, with_backoff},
};

#[derive(Clone, Debug)]
pub struct RatingConfig {
    pub k: f64,
    pub divisor: f64,
    pub initial: f64,
    /// K is scaled by `1 / (1 + games / damping_games)` so established
    /// ratings move less. Zero disables damping.
    pub damping_games: u32,
    pub decay_after: Duration,
    pub decay_fraction: f64,
    pub baseline: f64,
    pub floor: f64,
    pub sweep_interval: Duration,
}

impl Default for RatingConfig {
    fn default() -> Self {
        RatingConfig {
            k: 32.0,
            divisor: 400.0,
            initial: 1000.0,
            damping_games: 0,
            decay_after: Duration::from_secs(30 * 24 * 3600),
            decay_fraction: 0.02,
            baseline: 1000.0,
            floor: 100.0,
            sweep_interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerRating {
    pub rating: f64,
    pub games_played: u32,
    pub last_active: DateTime<Utc>,
}

/// Per-seat outcome handed to the rating engine: 1.0 for the winner, 0.0
/// for the rest, 0.5 all around when nobody won.
pub type SeatScore = (PlayerId, f64);

pub trait RatingService {
    fn current_rating(&self, player: &PlayerId) -> f64;
    fn snapshot(&self, player: &PlayerId) -> PlayerRating;
    /// Whether a finished match still awaits its rating application.
    fn is_pending(&self, player: &PlayerId) -> bool;
    fn mark_pending(&self, match_id: &MatchId, players: &[PlayerId]);
    /// Fold one finished match into the ratings, clear the pending flags,
    /// and append one ledger record per player.
    fn apply_match(&self, match_id: &MatchId, scores: &[SeatScore]) -> ServiceResult<Vec<RatingChangeRecord>>;
    /// Pull inactive ratings toward the baseline. Returns how many changed.
    fn decay_sweep(&self, now: DateTime<Utc>) -> usize;
}

pub fn expected_score(rating_a: f64, rating_b: f64, divisor: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / divisor))
}

#[derive(Clone)]
pub struct RatingServiceImpl {
    config: RatingConfig,
    ratings: Arc<DashMap<PlayerId, PlayerRating>>,
    pending: Arc<DashMap<PlayerId, MatchId>>,
    repository: ArcRatingRepository,
    dead_letters: Arc<DeadLetterLog>,
}

impl RatingServiceImpl {
    pub fn new(
        config: RatingConfig,
        repository: ArcRatingRepository,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            config,
            ratings: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            repository,
            dead_letters,
        }
    }

    fn k_for(&self, games_played: u32) -> f64 {
        if self.config.damping_games == 0 {
            return self.config.k;
        }
        self.config.k / (1.0 + games_played as f64 / self.config.damping_games as f64)
    }

    fn persist_record(&self, record: RatingChangeRecord) {
        let repository = self.repository.clone();
        let dead_letters = self.dead_letters.clone();
        tokio::spawn(async move {
            let result = with_backoff("rating change", 5, || {
                let repository = repository.clone();
                let record = record.clone();
                async move { repository.append(&record).await }
            })
            .await;
            if let Err(e) = result {
                error!(
                    "rating change for {} lost to storage, parked for manual replay: {}",
                    record.player, e
                );
                dead_letters.park("rating_change", &record);
            }
        });
    }

    /// Periodic decay sweep; cancelled on shutdown.
    pub fn run_decay_sweeper(&self, cancel: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(service.config.sweep_interval) => {}
                }
                let decayed = service.decay_sweep(Utc::now());
                if decayed > 0 {
                    info!("rating decay adjusted {} inactive players", decayed);
                }
            }
        });
    }
}

impl RatingService for RatingServiceImpl {
    fn current_rating(&self, player: &PlayerId) -> f64 {
        self.ratings
            .get(player)
            .map(|r| r.rating)
            .unwrap_or(self.config.initial)
    }

    fn snapshot(&self, player: &PlayerId) -> PlayerRating {
        self.ratings.get(player).map(|r| r.clone()).unwrap_or(PlayerRating {
            rating: self.config.initial,
            games_played: 0,
            last_active: Utc::now(),
        })
    }

    fn is_pending(&self, player: &PlayerId) -> bool {
        self.pending.contains_key(player)
    }

    fn mark_pending(&self, match_id: &MatchId, players: &[PlayerId]) {
        for player in players {
            self.pending.insert(player.clone(), *match_id);
        }
    }

    fn apply_match(
        &self,
        match_id: &MatchId,
        scores: &[SeatScore],
    ) -> ServiceResult<Vec<RatingChangeRecord>> {
        if scores.len() < 2 {
            return ServiceError::validation("a rated match needs at least two players");
        }
        let n = scores.len() as f64;
        let now = Utc::now();

        let before: Vec<PlayerRating> = scores
            .iter()
            .map(|(player, _)| self.snapshot(player))
            .collect();

        let mut records = Vec::with_capacity(scores.len());
        for (i, (player, actual_i)) in scores.iter().enumerate() {
            // Pairwise Elo against every other seat, scaled by 1/(n-1).
            let mut delta = 0.0;
            for (j, (_, actual_j)) in scores.iter().enumerate() {
                if i == j {
                    continue;
                }
                let expected = expected_score(before[i].rating, before[j].rating, self.config.divisor);
                let actual = if actual_i > actual_j {
                    1.0
                } else if actual_i < actual_j {
                    0.0
                } else {
                    0.5
                };
                delta += self.k_for(before[i].games_played) * (actual - expected);
            }
            delta /= n - 1.0;

            let rating_after = (before[i].rating + delta).max(self.config.floor);
            let games_played = before[i].games_played + 1;
            self.ratings.insert(
                player.clone(),
                PlayerRating {
                    rating: rating_after,
                    games_played,
                    last_active: now,
                },
            );
            records.push(RatingChangeRecord {
                player: player.clone(),
                match_id: Some(*match_id),
                delta,
                rating_after,
                games_played,
                at: now,
            });
        }

        for record in &records {
            debug!(
                "match {}: {} {:+.1} -> {:.1}",
                match_id, record.player, record.delta, record.rating_after
            );
            self.persist_record(record.clone());
        }
        for (player, _) in scores {
            self.pending.remove(player);
        }
        Ok(records)
    }

    fn decay_sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.decay_after)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let mut decayed = 0;
        for mut entry in self.ratings.iter_mut() {
            if now.signed_duration_since(entry.last_active) <= cutoff {
                continue;
            }
            let pull = (self.config.baseline - entry.rating) * self.config.decay_fraction;
            if pull.abs() < f64::EPSILON {
                continue;
            }
            let rating_after = (entry.rating + pull).max(self.config.floor);
            entry.rating = rating_after;
            decayed += 1;

            let record = RatingChangeRecord {
                player: entry.key().clone(),
                match_id: None,
                delta: pull,
                rating_after,
                games_played: entry.games_played,
                at: now,
            };
            self.persist_record(record);
        }
        decayed
    }
}

/// Preset ratings, no persistence. For tests of services that only read.
#[derive(Clone, Default)]
pub struct MockRatingService {
    pub ratings: Arc<DashMap<PlayerId, f64>>,
    pub pending: Arc<DashMap<PlayerId, ()>>,
    pub applied: Arc<std::sync::Mutex<Vec<(MatchId, Vec<SeatScore>)>>>,
}

impl MockRatingService {
    pub fn with_rating(self, player: &str, rating: f64) -> Self {
        self.ratings.insert(player.to_string(), rating);
        self
    }
}

impl RatingService for MockRatingService {
    fn current_rating(&self, player: &PlayerId) -> f64 {
        self.ratings.get(player).map(|r| *r).unwrap_or(1000.0)
    }

    fn snapshot(&self, player: &PlayerId) -> PlayerRating {
        PlayerRating {
            rating: self.current_rating(player),
            games_played: 0,
            last_active: Utc::now(),
        }
    }

    fn is_pending(&self, player: &PlayerId) -> bool {
        self.pending.contains_key(player)
    }

    fn mark_pending(&self, _match_id: &MatchId, players: &[PlayerId]) {
        for player in players {
            self.pending.insert(player.clone(), ());
        }
    }

    fn apply_match(
        &self,
        match_id: &MatchId,
        scores: &[SeatScore],
    ) -> ServiceResult<Vec<RatingChangeRecord>> {
        self.applied
            .lock()
            .unwrap()
            .push((*match_id, scores.to_vec()));
        for (player, _) in scores {
            self.pending.remove(player);
        }
        Ok(Vec::new())
    }

    fn decay_sweep(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}
