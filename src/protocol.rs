use domino_core::{Board, MatchStatus, Move, MoveRecord, OutcomeReason, Seat, Tile};
use serde::{Deserialize, Serialize};

use crate::{
    PlayerId, ServiceError,
    app::AppState,
    client::{ClientId, TransportServiceImpl},
    game::{MatchCommand, MatchId},
};

/// Client -> server requests, JSON-tagged, identical over WebSocket text
/// frames and line-delimited TCP.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    Hello { player_id: PlayerId },
    JoinQueue,
    CancelQueue,
    SubmitMove { match_id: MatchId, mv: Move },
    Forfeit { match_id: MatchId },
    Reconnect { match_id: MatchId, last_cursor: Option<u64> },
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome {
        player_id: PlayerId,
    },
    Pong,
    QueueJoined,
    QueueLeft,
    MatchFound {
        match_id: MatchId,
        seat: Seat,
        players: Vec<PlayerId>,
        initial_state: StateView,
    },
    /// One applied transition. `seq` numbers are per match, monotonic from 0
    /// and gap-free; clients discard anything at or below their cursor.
    StateDelta {
        match_id: MatchId,
        seq: u64,
        change: StateChange,
    },
    /// Full authoritative view, replacing whatever the client holds. Deltas
    /// with a seq below `seq` are already folded into the view; the next
    /// delta carries exactly this seq.
    StateSnapshot {
        match_id: MatchId,
        seq: u64,
        state: StateView,
    },
    MatchEnded {
        match_id: MatchId,
        result: MatchResult,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    ConnectionClosed {
        reason: DisconnectReason,
    },
}

/// Per-recipient projection of the match state: the viewer's own hand in
/// full, everyone else reduced to counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub seat: Seat,
    pub players: Vec<PlayerId>,
    pub status: MatchStatus,
    pub current_seat: Seat,
    pub board: Board,
    pub hand: Vec<Tile>,
    pub hand_counts: Vec<usize>,
    pub boneyard_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StateChange {
    MoveApplied {
        seat: Seat,
        mv: Move,
        forced: bool,
        /// Only present for the drawing player; redacted for everyone else.
        drawn: Option<Tile>,
        current_seat: Seat,
        hand_counts: Vec<usize>,
        boneyard_count: usize,
    },
    SeatForfeited {
        seat: Seat,
        current_seat: Seat,
    },
}

impl StateChange {
    pub fn from_record(
        record: &MoveRecord,
        current_seat: Seat,
        hand_counts: Vec<usize>,
        boneyard_count: usize,
    ) -> Self {
        StateChange::MoveApplied {
            seat: record.seat,
            mv: record.mv,
            forced: record.forced,
            drawn: record.drawn,
            current_seat,
            hand_counts,
            boneyard_count,
        }
    }

    /// Strip information the viewer is not entitled to see.
    pub fn redacted_for(&self, viewer: Seat) -> StateChange {
        match self {
            StateChange::MoveApplied { seat, drawn, .. } if *seat != viewer && drawn.is_some() => {
                let mut change = self.clone();
                if let StateChange::MoveApplied { drawn, .. } = &mut change {
                    *drawn = None;
                }
                change
            }
            _ => self.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub winner_seat: Option<Seat>,
    pub winner: Option<PlayerId>,
    pub hand_scores: Vec<u32>,
    pub reason: OutcomeReason,
    pub rated: bool,
    pub rating_changes: Vec<RatingDelta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingDelta {
    pub player: PlayerId,
    pub delta: f64,
    pub rating: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    RuleViolation,
    NotFound,
    NotPossible,
    Suspended,
    Internal,
}

impl From<&ServiceError> for ErrorCode {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::Validation(_) => ErrorCode::Validation,
            ServiceError::RuleViolation(_) => ErrorCode::RuleViolation,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::NotPossible(_) => ErrorCode::NotPossible,
            ServiceError::Suspended(_) => ErrorCode::Suspended,
            ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    NewSession,
    Inactivity,
    ServerShutdown,
}

pub fn error_message(err: &ServiceError) -> ServerMessage {
    ServerMessage::Error {
        code: ErrorCode::from(err),
        message: err.to_string(),
    }
}

/// Entry point for every inbound frame. Rejections are replied to the
/// sending connection; authoritative state is never touched on rejection.
pub fn handle_client_message(
    app: &AppState,
    transport: &TransportServiceImpl,
    id: &ClientId,
    text: String,
) {
    let request = match serde_json::from_str::<ClientRequest>(&text) {
        Ok(request) => request,
        Err(e) => {
            transport.send_to_client(
                id,
                &ServerMessage::Error {
                    code: ErrorCode::Validation,
                    message: format!("malformed request: {}", e),
                },
            );
            return;
        }
    };

    match request {
        ClientRequest::Hello { player_id } => match transport.associate_player(id, &player_id) {
            Ok(()) => transport.send_to_client(id, &ServerMessage::Welcome { player_id }),
            Err(e) => transport.send_to_client(id, &error_message(&e)),
        },
        ClientRequest::Heartbeat => {
            transport.send_to_client(id, &ServerMessage::Pong);
        }
        other => {
            let Some(player) = transport.get_associated_player(id) else {
                let err = ServiceError::NotPossible("send Hello before anything else".into());
                transport.send_to_client(id, &error_message(&err));
                return;
            };
            if let Err(e) = handle_player_request(app, &player, other) {
                transport.send_to_client(id, &error_message(&e));
            }
        }
    }
}

fn handle_player_request(
    app: &AppState,
    player: &PlayerId,
    request: ClientRequest,
) -> crate::ServiceResult<()> {
    match request {
        ClientRequest::JoinQueue => {
            app.matchmaking_service.join_queue(player)?;
            app.transport_service
                .try_player_send(player, &ServerMessage::QueueJoined);
        }
        ClientRequest::CancelQueue => {
            app.matchmaking_service.cancel(player)?;
            app.transport_service
                .try_player_send(player, &ServerMessage::QueueLeft);
        }
        ClientRequest::SubmitMove { match_id, mv } => {
            if app.abuse_service.is_suspended(player) {
                return ServiceError::suspended(format!("player {} is suspended", player));
            }
            app.match_service.submit(
                &match_id,
                MatchCommand::Move {
                    player: player.clone(),
                    mv,
                },
            )?;
        }
        ClientRequest::Forfeit { match_id } => {
            app.match_service.submit(
                &match_id,
                MatchCommand::Forfeit {
                    player: player.clone(),
                },
            )?;
        }
        ClientRequest::Reconnect {
            match_id,
            last_cursor,
        } => {
            app.match_service.submit(
                &match_id,
                MatchCommand::Resync {
                    player: player.clone(),
                    last_cursor,
                },
            )?;
        }
        ClientRequest::Hello { .. } | ClientRequest::Heartbeat => {
            // Handled before player lookup.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domino_core::BoardEnd;

    #[test]
    fn test_request_wire_shape() {
        let text = r#"{"type":"SubmitMove","match_id":"00000000-0000-0000-0000-000000000001","mv":{"Play":{"tile":{"low":2,"high":5},"end":"Right"}}}"#;
        let request: ClientRequest = serde_json::from_str(text).unwrap();
        assert_eq!(
            request,
            ClientRequest::SubmitMove {
                match_id: "00000000-0000-0000-0000-000000000001".parse().unwrap(),
                mv: Move::Play {
                    tile: Tile::new(2, 5),
                    end: BoardEnd::Right,
                },
            }
        );

        let hello: ClientRequest = serde_json::from_str(
            r#"{"type":"Hello","player_id":"alice"}"#,
        )
        .unwrap();
        assert_eq!(
            hello,
            ClientRequest::Hello {
                player_id: "alice".into()
            }
        );
    }

    #[test]
    fn test_draw_redacted_for_other_seats() {
        let change = StateChange::MoveApplied {
            seat: 0,
            mv: Move::Draw,
            forced: false,
            drawn: Some(Tile::new(3, 4)),
            current_seat: 0,
            hand_counts: vec![8, 7],
            boneyard_count: 13,
        };

        // The drawer keeps the tile; the opponent sees only the count shift.
        assert_eq!(change.redacted_for(0), change);
        let StateChange::MoveApplied { drawn, hand_counts, .. } = change.redacted_for(1) else {
            panic!("redaction changed the variant");
        };
        assert_eq!(drawn, None);
        assert_eq!(hand_counts, vec![8, 7]);
    }

    #[test]
    fn test_play_not_redacted() {
        let change = StateChange::MoveApplied {
            seat: 0,
            mv: Move::Play {
                tile: Tile::new(6, 6),
                end: BoardEnd::Right,
            },
            forced: true,
            drawn: None,
            current_seat: 1,
            hand_counts: vec![6, 7],
            boneyard_count: 14,
        };
        assert_eq!(change.redacted_for(1), change);
    }

    #[test]
    fn test_error_code_mapping() {
        let err = ServiceError::Suspended("x".into());
        assert_eq!(ErrorCode::from(&err), ErrorCode::Suspended);
        let err = ServiceError::RuleViolation(domino_core::MatchError::NotInProgress);
        assert_eq!(ErrorCode::from(&err), ErrorCode::RuleViolation);
    }
}
