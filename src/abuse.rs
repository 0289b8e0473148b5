use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use domino_core::MoveRecord;
use log::warn;
use serde::Serialize;

use crate::{PlayerId, game::MatchId};

#[derive(Clone, Debug)]
pub struct AbuseConfig {
    /// Moves applied faster than this are counted as reaction-time outliers.
    pub min_reaction: Duration,
    pub warn_streak: u32,
    pub suspend_streak: u32,
    /// Pairs with at least this many shared matches are screened for
    /// one-sided outcomes.
    pub collusion_min_games: u32,
    pub collusion_onesided_ratio: f64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        AbuseConfig {
            min_reaction: Duration::from_millis(150),
            warn_streak: 8,
            suspend_streak: 20,
            collusion_min_games: 10,
            collusion_onesided_ratio: 0.9,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AbuseSignal {
    Warn,
    Suspend,
    VoidMatch,
}

/// A signal plus the evidence that produced it. The validator only reports;
/// it never mutates match state.
#[derive(Clone, Debug, Serialize)]
pub struct AbuseReport {
    pub player: PlayerId,
    pub match_id: Option<MatchId>,
    pub signal: AbuseSignal,
    pub reason: String,
    pub evidence: Vec<MoveRecord>,
}

pub trait ModerationSink {
    fn submit(&self, report: AbuseReport);
}

/// Production sink: the moderation pipeline is out of process, so reports
/// land in the log at warn level.
pub struct LogModerationSink;

impl ModerationSink for LogModerationSink {
    fn submit(&self, report: AbuseReport) {
        warn!(
            "abuse signal {:?} for {} ({}): {} evidence moves",
            report.signal,
            report.player,
            report.reason,
            report.evidence.len()
        );
    }
}

#[derive(Clone, Default)]
pub struct MockModerationSink {
    pub reports: Arc<Mutex<Vec<AbuseReport>>>,
}

impl MockModerationSink {
    pub fn signals(&self) -> Vec<AbuseSignal> {
        self.reports.lock().unwrap().iter().map(|r| r.signal).collect()
    }
}

impl ModerationSink for MockModerationSink {
    fn submit(&self, report: AbuseReport) {
        self.reports.lock().unwrap().push(report);
    }
}

pub trait AbuseService {
    fn is_suspended(&self, player: &PlayerId) -> bool;
    fn is_match_voided(&self, match_id: &MatchId) -> bool;
    /// Called for every successfully applied, unforced move.
    fn observe_move(
        &self,
        match_id: &MatchId,
        player: &PlayerId,
        elapsed: Duration,
        history: &[MoveRecord],
    );
    /// Called once per finished match, before rating application.
    fn observe_result(&self, match_id: &MatchId, players: &[PlayerId], winner: Option<usize>);
}

/// Preset suspensions and voids, observes nothing.
#[derive(Clone, Default)]
pub struct MockAbuseService {
    pub suspended: Arc<DashMap<PlayerId, ()>>,
    pub voided: Arc<DashMap<MatchId, ()>>,
}

impl MockAbuseService {
    pub fn with_suspended(self, player: &str) -> Self {
        self.suspended.insert(player.to_string(), ());
        self
    }
}

impl AbuseService for MockAbuseService {
    fn is_suspended(&self, player: &PlayerId) -> bool {
        self.suspended.contains_key(player)
    }

    fn is_match_voided(&self, match_id: &MatchId) -> bool {
        self.voided.contains_key(match_id)
    }

    fn observe_move(
        &self,
        _match_id: &MatchId,
        _player: &PlayerId,
        _elapsed: Duration,
        _history: &[MoveRecord],
    ) {
    }

    fn observe_result(&self, _match_id: &MatchId, _players: &[PlayerId], _winner: Option<usize>) {}
}

#[derive(Default)]
struct PairStats {
    games: u32,
    wins: [u32; 2],
}

pub struct AbuseServiceImpl {
    config: AbuseConfig,
    sink: Arc<Box<dyn ModerationSink + Send + Sync + 'static>>,
    fast_streaks: DashMap<PlayerId, u32>,
    suspended: DashMap<PlayerId, ()>,
    voided: DashMap<MatchId, ()>,
    pair_stats: DashMap<(PlayerId, PlayerId), PairStats>,
}

impl AbuseServiceImpl {
    pub fn new(config: AbuseConfig, sink: Arc<Box<dyn ModerationSink + Send + Sync>>) -> Self {
        Self {
            config,
            sink,
            fast_streaks: DashMap::new(),
            suspended: DashMap::new(),
            voided: DashMap::new(),
            pair_stats: DashMap::new(),
        }
    }

    fn report(
        &self,
        player: &PlayerId,
        match_id: Option<MatchId>,
        signal: AbuseSignal,
        reason: String,
        history: &[MoveRecord],
    ) {
        let evidence = history.iter().rev().take(8).rev().copied().collect();
        self.sink.submit(AbuseReport {
            player: player.clone(),
            match_id,
            signal,
            reason,
            evidence,
        });
    }

    fn ordered_pair(a: &PlayerId, b: &PlayerId) -> ((PlayerId, PlayerId), bool) {
        if a <= b {
            ((a.clone(), b.clone()), false)
        } else {
            ((b.clone(), a.clone()), true)
        }
    }
}

impl AbuseService for AbuseServiceImpl {
    fn is_suspended(&self, player: &PlayerId) -> bool {
        self.suspended.contains_key(player)
    }

    fn is_match_voided(&self, match_id: &MatchId) -> bool {
        self.voided.contains_key(match_id)
    }

    fn observe_move(
        &self,
        match_id: &MatchId,
        player: &PlayerId,
        elapsed: Duration,
        history: &[MoveRecord],
    ) {
        if elapsed >= self.config.min_reaction {
            self.fast_streaks.insert(player.clone(), 0);
            return;
        }
        let mut streak = self.fast_streaks.entry(player.clone()).or_insert(0);
        *streak += 1;
        let streak = *streak;

        if streak == self.config.warn_streak {
            self.report(
                player,
                Some(*match_id),
                AbuseSignal::Warn,
                format!("{} consecutive sub-{:?} moves", streak, self.config.min_reaction),
                history,
            );
        } else if streak >= self.config.suspend_streak {
            self.suspended.insert(player.clone(), ());
            self.report(
                player,
                Some(*match_id),
                AbuseSignal::Suspend,
                format!("sustained inhuman move timing ({} moves)", streak),
                history,
            );
        }
    }

    fn observe_result(&self, match_id: &MatchId, players: &[PlayerId], winner: Option<usize>) {
        for i in 0..players.len() {
            for j in (i + 1)..players.len() {
                let (key, swapped) = Self::ordered_pair(&players[i], &players[j]);
                let mut stats = self.pair_stats.entry(key.clone()).or_default();
                stats.games += 1;
                if let Some(w) = winner {
                    if w == i {
                        stats.wins[usize::from(swapped)] += 1;
                    } else if w == j {
                        stats.wins[usize::from(!swapped)] += 1;
                    }
                }

                if stats.games < self.config.collusion_min_games {
                    continue;
                }
                let dominant = stats.wins[0].max(stats.wins[1]);
                let ratio = dominant as f64 / stats.games as f64;
                if ratio < self.config.collusion_onesided_ratio {
                    continue;
                }
                let beneficiary = if stats.wins[0] >= stats.wins[1] {
                    key.0.clone()
                } else {
                    key.1.clone()
                };
                drop(stats);

                self.voided.insert(*match_id, ());
                self.report(
                    &beneficiary,
                    Some(*match_id),
                    AbuseSignal::VoidMatch,
                    format!(
                        "one-sided record against a repeat opponent ({:.0}% over {}+ games)",
                        ratio * 100.0,
                        self.config.collusion_min_games
                    ),
                    &[],
                );
            }
        }
    }
}
