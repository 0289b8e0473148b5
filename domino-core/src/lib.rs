mod board;
mod clock;
mod game;

pub use board::{Board, BoardEnd, PlacedTile};
pub use clock::{ClockExpiry, TurnClock};
pub use game::{
    BlockedTieRule, MAX_PLAYERS, MIN_PLAYERS, MatchOutcome, MatchSettings, MatchState,
    MatchStatus, Move, MoveRecord, OutcomeReason, Seat, StartingRule,
};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Pip = u8;

/// Tile-set configuration: the maximum pip value determines the inventory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    DoubleSix,
    DoubleNine,
}

impl Variant {
    pub fn max_pip(&self) -> Pip {
        match self {
            Variant::DoubleSix => 6,
            Variant::DoubleNine => 9,
        }
    }

    pub fn tile_count(&self) -> usize {
        let n = self.max_pip() as usize;
        (n + 1) * (n + 2) / 2
    }

    /// The full ordered tile set for this variant. Deterministic and pure.
    pub fn tile_set(&self) -> Vec<Tile> {
        let n = self.max_pip();
        let mut tiles = Vec::with_capacity(self.tile_count());
        for a in 0..=n {
            for b in a..=n {
                tiles.push(Tile::new(a, b));
            }
        }
        tiles
    }
}

/// An unordered pair of pip counts, stored normalized with `low <= high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tile {
    pub low: Pip,
    pub high: Pip,
}

impl Tile {
    pub fn new(a: Pip, b: Pip) -> Self {
        if a <= b {
            Tile { low: a, high: b }
        } else {
            Tile { low: b, high: a }
        }
    }

    pub fn is_double(&self) -> bool {
        self.low == self.high
    }

    pub fn pip_sum(&self) -> u32 {
        self.low as u32 + self.high as u32
    }

    pub fn has(&self, pip: Pip) -> bool {
        self.low == pip || self.high == pip
    }

    /// The pip on the other half, given the half that joins the chain.
    pub fn other_end(&self, pip: Pip) -> Option<Pip> {
        if self.low == pip {
            Some(self.high)
        } else if self.high == pip {
            Some(self.low)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}|{}]", self.low, self.high)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IllegalMoveError {
    #[error("tile {tile} does not fit {end:?} end (open pip {open})")]
    PipMismatch { tile: Tile, end: BoardEnd, open: Pip },
    #[error("{end:?} end is not open")]
    EndNotOpen { end: BoardEnd },
    #[error("tile {0} is not in hand")]
    TileNotInHand(Tile),
    #[error("the opening play must lead with {0}")]
    MustLeadWith(Tile),
    #[error("cannot draw while a legal play exists")]
    DrawWithLegalPlay,
    #[error("cannot draw from an empty boneyard")]
    BoneyardEmpty,
    #[error("cannot pass while a legal play exists")]
    PassWithLegalPlay,
    #[error("must draw before passing while the boneyard holds tiles")]
    PassWithTilesToDraw,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    #[error("invalid player count {0}, expected 2 to 4")]
    InvalidPlayerCount(usize),
    #[error("insufficient tiles: {players} hands of {hand_size} exceed the {tile_count}-tile set")]
    InsufficientTiles {
        players: usize,
        hand_size: usize,
        tile_count: usize,
    },
    #[error("not seat {0}'s turn")]
    OutOfTurn(Seat),
    #[error(transparent)]
    IllegalMove(#[from] IllegalMoveError),
    #[error("match is not in progress")]
    NotInProgress,
    #[error("seat {0} is no longer active")]
    SeatInactive(Seat),
    #[error("invalid match settings")]
    InvalidSettings,
}

/// A dealt partition of the tile set: one hand per player plus the boneyard.
#[derive(Clone, Debug)]
pub struct Deal {
    pub hands: Vec<Vec<Tile>>,
    pub boneyard: Vec<Tile>,
}

/// Uniformly random partition of the full tile set using the supplied rng.
pub fn deal<R: Rng + ?Sized>(
    variant: Variant,
    player_count: usize,
    hand_size: usize,
    rng: &mut R,
) -> Result<Deal, MatchError> {
    let mut tiles = variant.tile_set();
    if player_count * hand_size > tiles.len() {
        return Err(MatchError::InsufficientTiles {
            players: player_count,
            hand_size,
            tile_count: tiles.len(),
        });
    }
    tiles.shuffle(rng);
    let mut hands = Vec::with_capacity(player_count);
    for _ in 0..player_count {
        let rest = tiles.split_off(tiles.len() - hand_size);
        hands.push(rest);
    }
    Ok(Deal {
        hands,
        boneyard: tiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeSet;

    #[test]
    fn test_tile_set_sizes() {
        assert_eq!(Variant::DoubleSix.tile_count(), 28);
        assert_eq!(Variant::DoubleNine.tile_count(), 55);
        assert_eq!(Variant::DoubleSix.tile_set().len(), 28);
        assert_eq!(Variant::DoubleNine.tile_set().len(), 55);
    }

    #[test]
    fn test_tile_normalization() {
        assert_eq!(Tile::new(5, 2), Tile::new(2, 5));
        assert!(Tile::new(3, 3).is_double());
        assert!(!Tile::new(3, 4).is_double());
        assert_eq!(Tile::new(2, 5).pip_sum(), 7);
        assert_eq!(Tile::new(2, 5).other_end(2), Some(5));
        assert_eq!(Tile::new(2, 5).other_end(5), Some(2));
        assert_eq!(Tile::new(2, 5).other_end(3), None);
        assert_eq!(Tile::new(4, 4).other_end(4), Some(4));
    }

    #[test]
    fn test_deal_partitions_tile_set() {
        let mut rng = StdRng::seed_from_u64(7);
        let deal = deal(Variant::DoubleSix, 2, 7, &mut rng).unwrap();
        assert_eq!(deal.hands.len(), 2);
        assert_eq!(deal.hands[0].len(), 7);
        assert_eq!(deal.hands[1].len(), 7);
        assert_eq!(deal.boneyard.len(), 14);

        let mut all: Vec<Tile> = deal.boneyard.clone();
        for hand in &deal.hands {
            all.extend(hand.iter().copied());
        }
        let unique: BTreeSet<Tile> = all.iter().copied().collect();
        assert_eq!(unique.len(), 28);
        assert_eq!(
            unique,
            Variant::DoubleSix.tile_set().into_iter().collect()
        );
    }

    #[test]
    fn test_deal_is_seeded() {
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = deal(Variant::DoubleNine, 4, 10, &mut rng_a).unwrap();
        let b = deal(Variant::DoubleNine, 4, 10, &mut rng_b).unwrap();
        assert_eq!(a.hands, b.hands);
        assert_eq!(a.boneyard, b.boneyard);
    }

    #[test]
    fn test_deal_insufficient_tiles() {
        let mut rng = StdRng::seed_from_u64(0);
        let result = deal(Variant::DoubleSix, 4, 8, &mut rng);
        assert_eq!(
            result.unwrap_err(),
            MatchError::InsufficientTiles {
                players: 4,
                hand_size: 8,
                tile_count: 28,
            }
        );
    }
}
