use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{IllegalMoveError, Pip, Tile};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardEnd {
    Left,
    Right,
}

/// A tile placed on the chain, oriented left-to-right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedTile {
    pub tile: Tile,
    pub toward_left: Pip,
    pub toward_right: Pip,
}

/// The two-ended chain of placed tiles. Invariant: every adjacent pair of
/// placed tiles shares the matching pip value at the join.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    chain: VecDeque<PlacedTile>,
}

impl Board {
    pub fn new() -> Self {
        Board {
            chain: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn placed(&self) -> impl Iterator<Item = &PlacedTile> {
        self.chain.iter()
    }

    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        self.chain.iter().map(|p| p.tile)
    }

    /// The exposed pip value at the given end, None while the board is empty.
    pub fn open_end(&self, end: BoardEnd) -> Option<Pip> {
        match end {
            BoardEnd::Left => self.chain.front().map(|p| p.toward_left),
            BoardEnd::Right => self.chain.back().map(|p| p.toward_right),
        }
    }

    pub fn can_play(&self, tile: Tile, end: BoardEnd) -> bool {
        match self.open_end(end) {
            None => end == BoardEnd::Right,
            Some(open) => tile.has(open),
        }
    }

    /// All (tile, end) placements playable from `hand`. An empty sequence
    /// signals the player must draw or pass. The first tile opens at Right.
    pub fn legal_moves(&self, hand: &[Tile]) -> Vec<(Tile, BoardEnd)> {
        let mut moves = Vec::new();
        for &tile in hand {
            for end in [BoardEnd::Left, BoardEnd::Right] {
                if self.can_play(tile, end) {
                    moves.push((tile, end));
                }
            }
        }
        moves
    }

    pub fn play(&mut self, tile: Tile, end: BoardEnd) -> Result<(), IllegalMoveError> {
        let Some(open) = self.open_end(end) else {
            if end != BoardEnd::Right {
                return Err(IllegalMoveError::EndNotOpen { end });
            }
            self.chain.push_back(PlacedTile {
                tile,
                toward_left: tile.low,
                toward_right: tile.high,
            });
            return Ok(());
        };
        let outward = tile
            .other_end(open)
            .ok_or(IllegalMoveError::PipMismatch { tile, end, open })?;
        match end {
            BoardEnd::Left => self.chain.push_front(PlacedTile {
                tile,
                toward_left: outward,
                toward_right: open,
            }),
            BoardEnd::Right => self.chain.push_back(PlacedTile {
                tile,
                toward_left: open,
                toward_right: outward,
            }),
        }
        Ok(())
    }

    /// Whether every join in the chain matches. Always true for boards built
    /// through `play`; exposed so tests can assert the invariant directly.
    pub fn joins_matched(&self) -> bool {
        self.chain
            .iter()
            .zip(self.chain.iter().skip(1))
            .all(|(a, b)| a.toward_right == b.toward_left)
    }
}
