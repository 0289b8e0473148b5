use std::{
    cmp::Ordering,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    PlayerId, ServiceError, ServiceResult,
    app::{ArcAbuseService, ArcMatchService, ArcRatingService},
    game::MatchId,
};

#[derive(Clone, Debug)]
pub struct MatchmakingConfig {
    pub sweep_interval: Duration,
    /// Largest acceptable rating gap to a queue neighbour, per ticket.
    pub initial_band: f64,
    /// Added to a ticket's band after every sweep it sits out.
    pub band_widen: f64,
    pub max_band: f64,
    /// Tickets that have waited this long pair regardless of band.
    pub max_wait: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        MatchmakingConfig {
            sweep_interval: Duration::from_secs(2),
            initial_band: 50.0,
            band_widen: 25.0,
            max_band: 400.0,
            max_wait: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug)]
struct Ticket {
    player: PlayerId,
    rating: f64,
    enqueued_at: Instant,
    /// Arrival order tiebreaker for equal ratings.
    seq: u64,
    band: f64,
}

pub trait MatchmakingService {
    fn join_queue(&self, player: &PlayerId) -> ServiceResult<()>;
    fn cancel(&self, player: &PlayerId) -> ServiceResult<()>;
    fn is_queued(&self, player: &PlayerId) -> bool;
    fn queue_len(&self) -> usize;
    /// One pairing pass over the queue; returns the matches it created.
    fn sweep(&self) -> Vec<MatchId>;
}

#[derive(Clone)]
pub struct MatchmakingServiceImpl {
    config: MatchmakingConfig,
    players_per_match: usize,
    rated: bool,
    match_service: ArcMatchService,
    rating: ArcRatingService,
    abuse: ArcAbuseService,
    tickets: Arc<DashMap<PlayerId, Ticket>>,
    next_seq: Arc<AtomicU64>,
}

impl MatchmakingServiceImpl {
    pub fn new(
        config: MatchmakingConfig,
        players_per_match: usize,
        rated: bool,
        match_service: ArcMatchService,
        rating: ArcRatingService,
        abuse: ArcAbuseService,
    ) -> Self {
        Self {
            config,
            players_per_match,
            rated,
            match_service,
            rating,
            abuse,
            tickets: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn run_sweeper(&self, cancel: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("matchmaking sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let created = service.sweep();
                        if !created.is_empty() {
                            debug!("sweep created {} match(es)", created.len());
                        }
                    }
                }
            }
        });
    }

    /// Claims the group's tickets and creates their match. A member whose
    /// ticket is already gone (cancelled since the sweep snapshot) aborts
    /// the pairing; everything claimed so far goes back into the queue.
    fn pair_group(&self, group: &[Ticket]) -> Option<MatchId> {
        let mut claimed = Vec::with_capacity(group.len());
        for ticket in group {
            match self.tickets.remove(&ticket.player) {
                Some((_, t)) => claimed.push(t),
                None => {
                    debug!("{} left the queue mid-sweep, skipping group", ticket.player);
                    self.requeue(claimed);
                    return None;
                }
            }
        }
        let players: Vec<PlayerId> = claimed.iter().map(|t| t.player.clone()).collect();
        match self.match_service.create_match(players.clone(), self.rated) {
            Ok(id) => {
                info!("paired {:?} into match {}", players, id);
                Some(id)
            }
            Err(e) => {
                warn!("pairing {:?} failed, requeueing: {}", players, e);
                self.requeue(claimed);
                None
            }
        }
    }

    /// Puts claimed tickets back, never clobbering a fresher entry for the
    /// same player.
    fn requeue(&self, tickets: Vec<Ticket>) {
        for ticket in tickets {
            self.tickets.entry(ticket.player.clone()).or_insert(ticket);
        }
    }

    /// Adjacent tickets pair when the gap fits both bands; a ticket past
    /// max_wait waives the check for its pairs.
    fn compatible(&self, group: &[Ticket], now: Instant) -> bool {
        group.windows(2).all(|pair| {
            let gap = pair[1].rating - pair[0].rating;
            gap <= pair[0].band && gap <= pair[1].band
                || pair
                    .iter()
                    .any(|t| now.saturating_duration_since(t.enqueued_at) >= self.config.max_wait)
        })
    }
}

impl MatchmakingService for MatchmakingServiceImpl {
    fn join_queue(&self, player: &PlayerId) -> ServiceResult<()> {
        if self.abuse.is_suspended(player) {
            return ServiceError::suspended("you are suspended from ranked play");
        }
        if self.match_service.has_active_match(player) {
            return ServiceError::not_possible("finish your current match first");
        }
        if self.rating.is_pending(player) {
            return ServiceError::not_possible("your previous result is still being rated");
        }
        if self.tickets.contains_key(player) {
            return ServiceError::not_possible("already queued");
        }
        let ticket = Ticket {
            player: player.clone(),
            rating: self.rating.current_rating(player),
            enqueued_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            band: self.config.initial_band,
        };
        info!("{} queued at rating {:.0}", player, ticket.rating);
        self.tickets.insert(player.clone(), ticket);
        Ok(())
    }

    fn cancel(&self, player: &PlayerId) -> ServiceResult<()> {
        match self.tickets.remove(player) {
            Some(_) => {
                info!("{} left the queue", player);
                Ok(())
            }
            None => ServiceError::not_found("not queued"),
        }
    }

    fn is_queued(&self, player: &PlayerId) -> bool {
        self.tickets.contains_key(player)
    }

    fn queue_len(&self) -> usize {
        self.tickets.len()
    }

    fn sweep(&self) -> Vec<MatchId> {
        let now = Instant::now();
        let mut waiting: Vec<Ticket> = self.tickets.iter().map(|e| e.value().clone()).collect();
        waiting.sort_by(|a, b| {
            a.rating
                .partial_cmp(&b.rating)
                .unwrap_or(Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });

        let mut created = Vec::new();
        let mut i = 0;
        while i + self.players_per_match <= waiting.len() {
            let group = &waiting[i..i + self.players_per_match];
            if !self.compatible(group, now) {
                i += 1;
                continue;
            }
            match self.pair_group(group) {
                Some(id) => {
                    created.push(id);
                    i += self.players_per_match;
                }
                None => i += 1,
            }
        }

        // Everyone still waiting tolerates a wider gap next time.
        for mut entry in self.tickets.iter_mut() {
            entry.band = (entry.band + self.config.band_widen).min(self.config.max_band);
        }
        created
    }
}
