use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use domino_core::{
    ClockExpiry, MatchSettings, Move, MatchState, Seat, TurnClock,
};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    PlayerId, ServiceError, ServiceResult,
    app::{
        ArcAbuseService, ArcMatchHistoryRepository, ArcRatingService, ArcTransportService,
    },
    persistence::{DeadLetterLog, MatchRecord, with_backoff},
    protocol::{MatchResult, RatingDelta, ServerMessage, StateChange, StateView, error_message},
    rating::SeatScore,
};

pub type MatchId = Uuid;

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub turn_duration: Duration,
    pub grace_count: u32,
    pub grace_duration: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        TurnConfig {
            turn_duration: Duration::from_secs(30),
            grace_count: 1,
            grace_duration: Duration::from_secs(10),
        }
    }
}

/// Everything a match can be asked to do. Commands are applied strictly in
/// arrival order by the one runner task that owns the state.
#[derive(Clone, Debug)]
pub enum MatchCommand {
    Move { player: PlayerId, mv: Move },
    Forfeit { player: PlayerId },
    Resync { player: PlayerId, last_cursor: Option<u64> },
    Disconnected { player: PlayerId },
    Shutdown,
}

pub trait MatchService {
    fn create_match(&self, players: Vec<PlayerId>, rated: bool) -> ServiceResult<MatchId>;
    fn submit(&self, match_id: &MatchId, cmd: MatchCommand) -> ServiceResult<()>;
    fn has_active_match(&self, player: &PlayerId) -> bool;
    fn active_match_of(&self, player: &PlayerId) -> Option<MatchId>;
    fn match_count(&self) -> usize;
    fn shutdown_all(&self);
}

struct MatchHandle {
    tx: UnboundedSender<MatchCommand>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct MatchServiceImpl {
    settings: MatchSettings,
    turn: TurnConfig,
    snapshot_threshold: u64,
    transport: ArcTransportService,
    rating: ArcRatingService,
    abuse: ArcAbuseService,
    history: ArcMatchHistoryRepository,
    dead_letters: Arc<DeadLetterLog>,
    handles: Arc<DashMap<MatchId, MatchHandle>>,
    by_player: Arc<DashMap<PlayerId, MatchId>>,
}

impl MatchServiceImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: MatchSettings,
        turn: TurnConfig,
        snapshot_threshold: u64,
        transport: ArcTransportService,
        rating: ArcRatingService,
        abuse: ArcAbuseService,
        history: ArcMatchHistoryRepository,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            settings,
            turn,
            snapshot_threshold,
            transport,
            rating,
            abuse,
            history,
            dead_letters,
            handles: Arc::new(DashMap::new()),
            by_player: Arc::new(DashMap::new()),
        }
    }

    fn remove_match(&self, id: &MatchId, players: &[PlayerId]) {
        self.handles.remove(id);
        for player in players {
            self.by_player.remove_if(player, |_, v| v == id);
        }
    }
}

impl MatchService for MatchServiceImpl {
    fn create_match(&self, players: Vec<PlayerId>, rated: bool) -> ServiceResult<MatchId> {
        for player in &players {
            if self.by_player.contains_key(player) {
                return ServiceError::not_possible(format!(
                    "player {} is already in a match",
                    player
                ));
            }
        }
        let mut state = MatchState::new(self.settings, players.len())?;
        let seed = rand::random::<u64>();
        state.start(seed)?;

        let id = MatchId::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.handles.insert(
            id,
            MatchHandle {
                tx,
                cancel: cancel.clone(),
            },
        );
        for player in &players {
            self.by_player.insert(player.clone(), id);
        }

        let clock = TurnClock::new(
            self.turn.turn_duration,
            self.turn.grace_count,
            self.turn.grace_duration,
            players.len(),
        );
        let hand_counts = state.hand_sizes();
        let boneyard_count = state.boneyard_len();
        let runner = MatchRunner {
            id,
            players: players.clone(),
            rated,
            seed,
            state,
            clock,
            deltas: Vec::new(),
            applied: 0,
            hand_counts,
            boneyard_count,
            turn_started: Instant::now(),
            defect: false,
            service: self.clone(),
        };
        info!("match {} created for {:?} (rated: {})", id, players, rated);
        tokio::spawn(runner.run(rx, cancel));
        Ok(id)
    }

    fn submit(&self, match_id: &MatchId, cmd: MatchCommand) -> ServiceResult<()> {
        let Some(handle) = self.handles.get(match_id) else {
            return ServiceError::not_found(format!("no active match {}", match_id));
        };
        handle
            .tx
            .send(cmd)
            .map_err(|_| ServiceError::Internal(format!("match {} runner is gone", match_id)))
    }

    fn has_active_match(&self, player: &PlayerId) -> bool {
        self.by_player.contains_key(player)
    }

    fn active_match_of(&self, player: &PlayerId) -> Option<MatchId> {
        self.by_player.get(player).map(|id| *id)
    }

    fn match_count(&self) -> usize {
        self.handles.len()
    }

    fn shutdown_all(&self) {
        for entry in self.handles.iter() {
            let _ = entry.tx.send(MatchCommand::Shutdown);
            entry.cancel.cancel();
        }
    }
}

/// The single owner of one match's state. All mutation happens on this
/// task; everyone else goes through the command queue.
struct MatchRunner {
    id: MatchId,
    players: Vec<PlayerId>,
    rated: bool,
    seed: u64,
    state: MatchState,
    clock: TurnClock,
    /// Unredacted, in application order; `seq` of a delta is its index.
    deltas: Vec<StateChange>,
    /// History records already folded into `deltas`.
    applied: usize,
    hand_counts: Vec<usize>,
    boneyard_count: usize,
    turn_started: Instant,
    defect: bool,
    service: MatchServiceImpl,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

impl MatchRunner {
    async fn run(mut self, mut rx: UnboundedReceiver<MatchCommand>, cancel: CancellationToken) {
        self.announce_match_found();
        let now = Instant::now();
        self.clock.arm(now);
        self.turn_started = now;

        loop {
            if self.state.is_over() {
                self.finish();
                break;
            }
            if self.defect {
                error!("match {} runner aborting after internal defect", self.id);
                break;
            }
            let deadline = self.clock.deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("match {} cancelled", self.id);
                    break;
                }
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(MatchCommand::Shutdown) => {
                            info!("match {} shutting down", self.id);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd, Instant::now()),
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    self.handle_deadline(Instant::now());
                }
            }
        }
        self.service.remove_match(&self.id, &self.players);
    }

    fn handle_command(&mut self, cmd: MatchCommand, now: Instant) {
        match cmd {
            MatchCommand::Move { player, mv } => self.handle_move(&player, mv, now),
            MatchCommand::Forfeit { player } => self.handle_forfeit(&player, now),
            MatchCommand::Resync {
                player,
                last_cursor,
            } => self.handle_resync(&player, last_cursor),
            MatchCommand::Disconnected { player } => {
                // The clock keeps running; the absent player can reconnect
                // and resync, or the timer will move for them.
                debug!("match {}: {} disconnected mid-match", self.id, player);
            }
            MatchCommand::Shutdown => {}
        }
    }

    fn seat_of(&self, player: &PlayerId) -> Option<Seat> {
        self.players.iter().position(|p| p == player)
    }

    fn reply_error(&self, player: &PlayerId, err: &ServiceError) {
        self.service
            .transport
            .try_player_send(player, &error_message(err));
    }

    fn handle_move(&mut self, player: &PlayerId, mv: Move, now: Instant) {
        let Some(seat) = self.seat_of(player) else {
            self.reply_error(
                player,
                &ServiceError::NotFound(format!("you are not seated in match {}", self.id)),
            );
            return;
        };
        let elapsed = now.saturating_duration_since(self.turn_started);
        let seat_before = self.state.current_seat();
        match self.state.submit_move(seat, mv) {
            Ok(()) => {
                self.service
                    .abuse
                    .observe_move(&self.id, player, elapsed, self.state.history());
                self.broadcast_new_records();
                self.rearm_if_turn_changed(seat_before, now);
            }
            Err(e) => {
                debug!("match {}: rejected move from {}: {}", self.id, player, e);
                self.reply_error(player, &ServiceError::RuleViolation(e));
            }
        }
    }

    fn handle_forfeit(&mut self, player: &PlayerId, now: Instant) {
        let Some(seat) = self.seat_of(player) else {
            self.reply_error(
                player,
                &ServiceError::NotFound(format!("you are not seated in match {}", self.id)),
            );
            return;
        };
        let seat_before = self.state.current_seat();
        match self.state.forfeit(seat) {
            Ok(()) => {
                info!("match {}: seat {} ({}) forfeited", self.id, seat, player);
                let change = StateChange::SeatForfeited {
                    seat,
                    current_seat: self.state.current_seat(),
                };
                self.push_delta(change);
                self.rearm_if_turn_changed(seat_before, now);
            }
            Err(e) => self.reply_error(player, &ServiceError::RuleViolation(e)),
        }
    }

    /// Replay `(cursor, latest]` for a reconnecting player, or fall back to
    /// a snapshot when no cursor is presented or the gap is too large.
    fn handle_resync(&mut self, player: &PlayerId, last_cursor: Option<u64>) {
        let Some(seat) = self.seat_of(player) else {
            self.reply_error(
                player,
                &ServiceError::NotFound(format!("you are not seated in match {}", self.id)),
            );
            return;
        };
        let latest = self.deltas.len() as u64;
        let send_snapshot = match last_cursor {
            None => true,
            // A cursor beyond the log means the client and server disagree;
            // resettle it with a snapshot.
            Some(cursor) => {
                cursor >= latest
                    || latest - (cursor + 1) > self.service.snapshot_threshold
            }
        };
        if send_snapshot {
            let msg = ServerMessage::StateSnapshot {
                match_id: self.id,
                seq: latest,
                state: self.view_for(seat),
            };
            self.service.transport.try_player_send(player, &msg);
            return;
        }
        let cursor = last_cursor.unwrap_or(0);
        for (i, change) in self.deltas.iter().enumerate().skip((cursor + 1) as usize) {
            let msg = ServerMessage::StateDelta {
                match_id: self.id,
                seq: i as u64,
                change: change.redacted_for(seat),
            };
            self.service.transport.try_player_send(player, &msg);
        }
    }

    fn handle_deadline(&mut self, now: Instant) {
        if self.state.is_over() {
            return;
        }
        let seat = self.state.current_seat();
        match self.clock.on_expiry(seat, now) {
            ClockExpiry::GraceGranted { .. } => {
                debug!("match {}: seat {} consumed its grace allowance", self.id, seat);
            }
            ClockExpiry::Forced => match self.state.forced_move(seat) {
                Ok(records) => {
                    info!(
                        "match {}: seat {} timed out, forced {} action(s)",
                        self.id,
                        seat,
                        records.len()
                    );
                    self.broadcast_new_records();
                    self.rearm_if_turn_changed(seat, now);
                }
                Err(e) => {
                    // The deadline only ever belongs to the current seat, so
                    // this is a state machine defect. Abort loudly rather
                    // than guess.
                    error!("match {}: forced move failed: {}", self.id, e);
                    self.defect = true;
                }
            },
        }
    }

    fn rearm_if_turn_changed(&mut self, seat_before: Seat, now: Instant) {
        if self.state.is_over() {
            self.clock.disarm();
            return;
        }
        if self.state.current_seat() != seat_before {
            self.clock.arm(now);
            self.turn_started = now;
        }
    }

    /// Fold history records applied since the last call into sequenced,
    /// per-recipient-redacted deltas.
    fn broadcast_new_records(&mut self) {
        let history = self.state.history();
        let new = &history[self.applied..];
        if new.is_empty() {
            return;
        }
        let mut changes = Vec::with_capacity(new.len());
        for (offset, record) in new.iter().enumerate() {
            match record.mv {
                Move::Play { .. } => self.hand_counts[record.seat] -= 1,
                Move::Draw => {
                    self.hand_counts[record.seat] += 1;
                    self.boneyard_count -= 1;
                }
                Move::Pass => {}
            }
            // Intermediate records (a draw before a forced play) leave the
            // turn with the actor; only the last one reflects the advance.
            let current_seat = if offset == new.len() - 1 {
                self.state.current_seat()
            } else {
                record.seat
            };
            changes.push(StateChange::from_record(
                record,
                current_seat,
                self.hand_counts.clone(),
                self.boneyard_count,
            ));
        }
        self.applied = history.len();
        for change in changes {
            self.push_delta(change);
        }
    }

    fn push_delta(&mut self, change: StateChange) {
        let seq = self.deltas.len() as u64;
        self.deltas.push(change.clone());
        for (seat, player) in self.players.iter().enumerate() {
            let msg = ServerMessage::StateDelta {
                match_id: self.id,
                seq,
                change: change.redacted_for(seat),
            };
            self.service.transport.try_player_send(player, &msg);
        }
    }

    fn view_for(&self, seat: Seat) -> StateView {
        StateView {
            seat,
            players: self.players.clone(),
            status: self.state.status(),
            current_seat: self.state.current_seat(),
            board: self.state.board().clone(),
            hand: self.state.hand(seat).to_vec(),
            hand_counts: self.state.hand_sizes(),
            boneyard_count: self.state.boneyard_len(),
        }
    }

    fn announce_match_found(&self) {
        for (seat, player) in self.players.iter().enumerate() {
            let msg = ServerMessage::MatchFound {
                match_id: self.id,
                seat,
                players: self.players.clone(),
                initial_state: self.view_for(seat),
            };
            self.service.transport.try_player_send(player, &msg);
        }
    }

    fn finish(&mut self) {
        let Some(outcome) = self.state.outcome().cloned() else {
            return;
        };
        self.clock.disarm();

        // Moderation sees the result first so a voided match is excluded
        // from rating.
        self.service
            .abuse
            .observe_result(&self.id, &self.players, outcome.winner);
        let rated = self.rated && !self.service.abuse.is_match_voided(&self.id);

        let mut rating_changes = Vec::new();
        if rated {
            self.service.rating.mark_pending(&self.id, &self.players);
            let scores: Vec<SeatScore> = self
                .players
                .iter()
                .enumerate()
                .map(|(seat, player)| {
                    let actual = match outcome.winner {
                        Some(winner) if winner == seat => 1.0,
                        Some(_) => 0.0,
                        None => 0.5,
                    };
                    (player.clone(), actual)
                })
                .collect();
            match self.service.rating.apply_match(&self.id, &scores) {
                Ok(records) => {
                    rating_changes = records
                        .into_iter()
                        .map(|r| RatingDelta {
                            player: r.player,
                            delta: r.delta,
                            rating: r.rating_after,
                        })
                        .collect();
                }
                Err(e) => error!("match {}: rating application failed: {}", self.id, e),
            }
        }

        let result = MatchResult {
            winner_seat: outcome.winner,
            winner: outcome.winner.map(|seat| self.players[seat].clone()),
            hand_scores: outcome.hand_scores.clone(),
            reason: outcome.reason,
            rated,
            rating_changes,
        };
        for player in &self.players {
            self.service.transport.try_player_send(
                player,
                &ServerMessage::MatchEnded {
                    match_id: self.id,
                    result: result.clone(),
                },
            );
        }
        info!(
            "match {} over: winner {:?}, reason {:?}, rated {}",
            self.id, result.winner, result.reason, rated
        );

        self.state.finalize();
        let record = MatchRecord {
            match_id: self.id,
            finished_at: Utc::now(),
            players: self.players.clone(),
            settings: *self.state.settings(),
            seed: self.seed,
            history: self.state.history().to_vec(),
            outcome,
            rated,
        };
        let repository = self.service.history.clone();
        let dead_letters = self.service.dead_letters.clone();
        tokio::spawn(async move {
            let result = with_backoff("match record", 5, || {
                let repository = repository.clone();
                let record = record.clone();
                async move { repository.append(&record).await }
            })
            .await;
            if let Err(e) = result {
                error!(
                    "match {} archive lost to storage, parked for manual replay: {}",
                    record.match_id, e
                );
                dead_letters.park("match_record", &record);
            }
        });
    }
}

/// Records calls, spawns nothing. For tests of services that hand players
/// over to a match.
#[derive(Clone, Default)]
pub struct MockMatchService {
    pub created: Arc<std::sync::Mutex<Vec<(MatchId, Vec<PlayerId>, bool)>>>,
    pub active: Arc<DashMap<PlayerId, MatchId>>,
    pub submitted: Arc<std::sync::Mutex<Vec<(MatchId, MatchCommand)>>>,
    pub fail_create: Arc<std::sync::atomic::AtomicBool>,
}

impl MatchService for MockMatchService {
    fn create_match(&self, players: Vec<PlayerId>, rated: bool) -> ServiceResult<MatchId> {
        if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
            return ServiceError::internal("match creation disabled");
        }
        let id = MatchId::new_v4();
        for player in &players {
            self.active.insert(player.clone(), id);
        }
        self.created.lock().unwrap().push((id, players, rated));
        Ok(id)
    }

    fn submit(&self, match_id: &MatchId, cmd: MatchCommand) -> ServiceResult<()> {
        self.submitted.lock().unwrap().push((*match_id, cmd));
        Ok(())
    }

    fn has_active_match(&self, player: &PlayerId) -> bool {
        self.active.contains_key(player)
    }

    fn active_match_of(&self, player: &PlayerId) -> Option<MatchId> {
        self.active.get(player).map(|id| *id)
    }

    fn match_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn shutdown_all(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abuse::{AbuseConfig, AbuseServiceImpl, MockModerationSink},
        client::MockTransportService,
        persistence::{InMemoryMatchHistoryRepository, MatchHistoryRepository},
        rating::MockRatingService,
    };
    use domino_core::{BoardEnd, Tile};

    struct Harness {
        service: MatchServiceImpl,
        transport: MockTransportService,
        rating: MockRatingService,
        history: Arc<InMemoryMatchHistoryRepository>,
    }

    fn harness() -> Harness {
        let transport = MockTransportService::default();
        let rating = MockRatingService::default();
        let sink: crate::app::ArcModerationSink =
            Arc::new(Box::new(MockModerationSink::default()));
        let abuse: ArcAbuseService =
            Arc::new(Box::new(AbuseServiceImpl::new(AbuseConfig::default(), sink)));
        let history = Arc::new(InMemoryMatchHistoryRepository::new());
        let service = MatchServiceImpl::new(
            MatchSettings::default(),
            TurnConfig::default(),
            8,
            Arc::new(Box::new(transport.clone())),
            Arc::new(Box::new(rating.clone())),
            abuse,
            Arc::new(Box::new(history.clone())),
            Arc::new(DeadLetterLog::new()),
        );
        Harness {
            service,
            transport,
            rating,
            history,
        }
    }

    fn direct_runner(harness: &Harness, players: Vec<&str>, seed: u64) -> MatchRunner {
        let players: Vec<PlayerId> = players.into_iter().map(|p| p.to_string()).collect();
        let mut state = MatchState::new(MatchSettings::default(), players.len()).unwrap();
        state.start(seed).unwrap();
        let clock = TurnClock::new(
            Duration::from_secs(30),
            1,
            Duration::from_secs(5),
            players.len(),
        );
        let hand_counts = state.hand_sizes();
        let boneyard_count = state.boneyard_len();
        MatchRunner {
            id: MatchId::new_v4(),
            players,
            rated: true,
            seed,
            state,
            clock,
            deltas: Vec::new(),
            applied: 0,
            hand_counts,
            boneyard_count,
            turn_started: Instant::now(),
            defect: false,
            service: harness.service.clone(),
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn match_found_view(
        transport: &MockTransportService,
        player: &str,
    ) -> Option<(MatchId, StateView)> {
        transport
            .to(&player.to_string())
            .into_iter()
            .find_map(|msg| match msg {
                ServerMessage::MatchFound {
                    match_id,
                    initial_state,
                    ..
                } => Some((match_id, initial_state)),
                _ => None,
            })
    }

    /// The opening lead the state machine will accept: the opener's highest
    /// double (the opener holds the overall highest), or the heaviest tile.
    fn opening_play(hand: &[Tile]) -> Move {
        let tile = hand
            .iter()
            .copied()
            .filter(|t| t.is_double())
            .max()
            .unwrap_or_else(|| {
                hand.iter()
                    .copied()
                    .max_by_key(|t| (t.pip_sum(), *t))
                    .unwrap()
            });
        Move::Play {
            tile,
            end: BoardEnd::Right,
        }
    }

    #[tokio::test]
    async fn test_create_match_announces_and_applies_first_move() {
        let h = harness();
        let id = h
            .service
            .create_match(vec!["alice".to_string(), "bob".to_string()], true)
            .unwrap();

        wait_for(|| {
            match_found_view(&h.transport, "alice").is_some()
                && match_found_view(&h.transport, "bob").is_some()
        })
        .await;

        let (found_id, alice_view) = match_found_view(&h.transport, "alice").unwrap();
        assert_eq!(found_id, id);
        assert_eq!(alice_view.seat, 0);
        assert_eq!(alice_view.hand.len(), 7);
        assert_eq!(alice_view.boneyard_count, 14);

        let current = alice_view.players[alice_view.current_seat].clone();
        let (_, current_view) = match_found_view(&h.transport, &current).unwrap();
        let mv = opening_play(&current_view.hand);
        h.service
            .submit(
                &id,
                MatchCommand::Move {
                    player: current.clone(),
                    mv,
                },
            )
            .unwrap();

        let has_delta = |player: &str| {
            h.transport
                .to(&player.to_string())
                .iter()
                .any(|m| matches!(m, ServerMessage::StateDelta { seq: 0, .. }))
        };
        wait_for(|| has_delta("alice") && has_delta("bob")).await;
    }

    #[tokio::test]
    async fn test_out_of_turn_move_is_rejected_without_state_change() {
        let h = harness();
        let id = h
            .service
            .create_match(vec!["alice".to_string(), "bob".to_string()], true)
            .unwrap();
        wait_for(|| match_found_view(&h.transport, "bob").is_some()).await;

        let (_, alice_view) = match_found_view(&h.transport, "alice").unwrap();
        let waiting = alice_view.players[1 - alice_view.current_seat].clone();
        let (_, waiting_view) = match_found_view(&h.transport, &waiting).unwrap();
        let tile = waiting_view.hand[0];
        h.service
            .submit(
                &id,
                MatchCommand::Move {
                    player: waiting.clone(),
                    mv: Move::Play {
                        tile,
                        end: BoardEnd::Right,
                    },
                },
            )
            .unwrap();

        wait_for(|| {
            h.transport.to(&waiting).iter().any(|m| {
                matches!(
                    m,
                    ServerMessage::Error {
                        code: crate::protocol::ErrorCode::RuleViolation,
                        ..
                    }
                )
            })
        })
        .await;
        // No delta was produced by the rejected move.
        assert!(
            !h.transport
                .to(&"alice".to_string())
                .iter()
                .any(|m| matches!(m, ServerMessage::StateDelta { .. }))
        );
    }

    #[tokio::test]
    async fn test_forfeit_finishes_rates_and_archives() {
        let h = harness();
        let id = h
            .service
            .create_match(vec!["alice".to_string(), "bob".to_string()], true)
            .unwrap();
        wait_for(|| match_found_view(&h.transport, "bob").is_some()).await;

        h.service
            .submit(
                &id,
                MatchCommand::Forfeit {
                    player: "alice".to_string(),
                },
            )
            .unwrap();

        let ended = |player: &str| {
            h.transport
                .to(&player.to_string())
                .into_iter()
                .find_map(|m| match m {
                    ServerMessage::MatchEnded { result, .. } => Some(result),
                    _ => None,
                })
        };
        wait_for(|| ended("alice").is_some() && ended("bob").is_some()).await;

        let result = ended("bob").unwrap();
        assert_eq!(result.winner, Some("bob".to_string()));
        assert_eq!(result.reason, domino_core::OutcomeReason::Forfeit);
        assert!(result.rated);

        wait_for(|| h.service.match_count() == 0).await;
        assert!(!h.service.has_active_match(&"alice".to_string()));
        assert_eq!(h.rating.applied.lock().unwrap().len(), 1);
        wait_for(|| h.history.len() == 1).await;
        let record = h
            .history
            .get_match(&id)
            .await
            .unwrap()
            .expect("match archived");
        assert_eq!(record.players, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_player_cannot_join_two_matches() {
        let h = harness();
        h.service
            .create_match(vec!["alice".to_string(), "bob".to_string()], true)
            .unwrap();
        let err = h
            .service
            .create_match(vec!["alice".to_string(), "carol".to_string()], true)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotPossible(_)));
    }

    #[tokio::test]
    async fn test_deadline_grace_then_forced_move() {
        let h = harness();
        let mut runner = direct_runner(&h, vec!["alice", "bob"], 7);
        let now = Instant::now();
        runner.clock.arm(now);
        let seat = runner.state.current_seat();

        // First expiry burns the grace allowance; nothing is forced.
        runner.handle_deadline(now + Duration::from_secs(30));
        assert!(runner.deltas.is_empty());
        assert_eq!(runner.state.current_seat(), seat);
        assert!(runner.clock.deadline().is_some());

        // Second expiry forces exactly one turn-ending action.
        runner.handle_deadline(now + Duration::from_secs(35));
        assert!(!runner.deltas.is_empty());
        let enders = runner
            .deltas
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    StateChange::MoveApplied { mv, forced: true, .. } if !matches!(mv, Move::Draw)
                )
            })
            .count();
        assert_eq!(enders, 1);
        if !runner.state.is_over() {
            assert_ne!(runner.state.current_seat(), seat);
            assert!(runner.clock.deadline().is_some(), "clock rearmed for next turn");
        }
    }

    #[tokio::test]
    async fn test_resync_replays_exactly_past_cursor() {
        let h = harness();
        let mut runner = direct_runner(&h, vec!["alice", "bob"], 13);

        // Build up a few deltas by forcing moves.
        while runner.deltas.len() < 4 && !runner.state.is_over() {
            let seat = runner.state.current_seat();
            let records = runner.state.forced_move(seat).unwrap();
            assert!(!records.is_empty());
            runner.broadcast_new_records();
        }
        assert!(runner.deltas.len() >= 4);
        let latest = runner.deltas.len() as u64;
        h.transport.clear();

        runner.handle_resync(&"bob".to_string(), Some(1));
        let replayed: Vec<u64> = h
            .transport
            .to(&"bob".to_string())
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::StateDelta { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, (2..latest).collect::<Vec<u64>>());

        // A caught-up cursor replays nothing.
        h.transport.clear();
        runner.handle_resync(&"bob".to_string(), Some(latest - 1));
        assert!(h.transport.to(&"bob".to_string()).is_empty());
    }

    #[tokio::test]
    async fn test_resync_snapshot_on_missing_cursor_or_large_gap() {
        let h = harness();
        let mut runner = direct_runner(&h, vec!["alice", "bob"], 13);
        runner.service.snapshot_threshold = 1;

        while runner.deltas.len() < 4 && !runner.state.is_over() {
            let seat = runner.state.current_seat();
            runner.state.forced_move(seat).unwrap();
            runner.broadcast_new_records();
        }
        h.transport.clear();

        runner.handle_resync(&"alice".to_string(), None);
        let msgs = h.transport.to(&"alice".to_string());
        assert_eq!(msgs.len(), 1);
        let ServerMessage::StateSnapshot { seq, state, .. } = &msgs[0] else {
            panic!("expected a snapshot, got {:?}", msgs[0]);
        };
        assert_eq!(*seq, runner.deltas.len() as u64);
        assert_eq!(state.seat, 0);
        assert_eq!(state.hand, runner.state.hand(0).to_vec());

        // Gap beyond the threshold also snapshots.
        h.transport.clear();
        runner.handle_resync(&"alice".to_string(), Some(0));
        let msgs = h.transport.to(&"alice".to_string());
        assert!(matches!(msgs[0], ServerMessage::StateSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_draw_delta_redacted_for_opponent() {
        // Force playouts over seeds until one produces a draw.
        for seed in 0..64 {
            let h = harness();
            let mut runner = direct_runner(&h, vec!["alice", "bob"], seed);
            let mut drew = None;
            while !runner.state.is_over() {
                let seat = runner.state.current_seat();
                let records = runner.state.forced_move(seat).unwrap();
                runner.broadcast_new_records();
                if let Some(r) = records.iter().find(|r| matches!(r.mv, Move::Draw)) {
                    drew = Some(r.seat);
                    break;
                }
            }
            let Some(drawer) = drew else {
                continue;
            };

            let drawer_name = runner.players[drawer].clone();
            let other_name = runner.players[1 - drawer].clone();
            let draw_seen_by = |player: &PlayerId| {
                h.transport
                    .to(player)
                    .into_iter()
                    .find_map(|m| match m {
                        ServerMessage::StateDelta {
                            change: StateChange::MoveApplied { mv: Move::Draw, drawn, .. },
                            ..
                        } => Some(drawn),
                        _ => None,
                    })
            };
            assert!(draw_seen_by(&drawer_name).unwrap().is_some());
            assert!(draw_seen_by(&other_name).unwrap().is_none());
            return;
        }
        panic!("no seed produced a draw");
    }
}
