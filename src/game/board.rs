//! Board State and Shot Resolution
//!
//! Coin racks are assigned symmetrically from a derived seed so every
//! participant starts with the same coin values in a shuffled order.
//!
//! Real trajectory physics is an external collaborator: the engine only
//! depends on the `ShotModel` trait, and ships a seeded demo model plus a
//! scripted model for tests.

use serde::{Deserialize, Serialize};

use crate::core::rng::DeterministicRng;
use crate::game::moves::{MovePayload, MoveResult};

/// Coin values dealt to every participant in CLASSIC play.
///
/// The multiset is identical per player; only the order differs per rack.
pub const CLASSIC_COIN_VALUES: [u8; 9] = [1, 1, 1, 2, 2, 2, 3, 3, 5];

/// Per-match board: one coin rack per participant slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardState {
    /// Remaining coin values per participant slot, index-aligned with the
    /// match participant order.
    pub racks: Vec<Vec<u8>>,

    /// Seed the racks were assigned from (kept for replay verification).
    pub rack_seed: u64,
}

impl BoardState {
    /// Deal symmetric racks for `slots` participants.
    ///
    /// Every rack holds the same coin multiset; per-rack order is shuffled
    /// from `seed` so assignment is deterministic but not predictable by a
    /// participant before the match fills.
    pub fn assign(seed: u64, slots: usize, coins_per_player: u8) -> Self {
        let mut rng = DeterministicRng::new(seed);
        let mut racks = Vec::with_capacity(slots);

        for _ in 0..slots {
            let mut rack: Vec<u8> = CLASSIC_COIN_VALUES
                .iter()
                .cycle()
                .take(coins_per_player as usize)
                .copied()
                .collect();
            rng.shuffle(&mut rack);
            racks.push(rack);
        }

        Self {
            racks,
            rack_seed: seed,
        }
    }

    /// Pocket up to `count` coins from a slot's rack, returning points gained.
    ///
    /// Coins come off the top of the rack (last dealt first).
    pub fn pocket(&mut self, slot: usize, count: u8) -> u32 {
        let mut points = 0u32;
        if let Some(rack) = self.racks.get_mut(slot) {
            for _ in 0..count {
                match rack.pop() {
                    Some(value) => points += value as u32,
                    None => break,
                }
            }
        }
        points
    }

    /// Remaining coin count for a slot.
    pub fn remaining(&self, slot: usize) -> usize {
        self.racks.get(slot).map(|r| r.len()).unwrap_or(0)
    }

    /// Whether a slot has pocketed out its entire rack.
    pub fn exhausted(&self, slot: usize) -> bool {
        self.racks.get(slot).map(|r| r.is_empty()).unwrap_or(false)
    }
}

/// Effect of one resolved strike on the mover's board slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShotEffect {
    /// Strike outcome.
    pub result: MoveResult,
    /// Coins pocketed from the mover's rack.
    pub coins_pocketed: u8,
}

/// Pluggable shot resolution collaborator.
///
/// Implementations must be deterministic in their inputs: the engine replays
/// moves from the journal and expects identical effects.
pub trait ShotModel: Send + Sync {
    /// Resolve a strike for the participant at `slot`.
    fn resolve(&self, board: &BoardState, slot: usize, payload: &MovePayload, seq: u32)
        -> ShotEffect;
}

/// Deterministic demo model: outcome derived from a hash of the rack seed,
/// sequence number, and payload. Not a physics simulation.
#[derive(Clone, Copy, Debug)]
pub struct SeededShotModel {
    /// Pocket probability in percent, 0..=100.
    pub pocket_pct: u8,
    /// Foul probability in percent, applied after the pocket roll.
    pub foul_pct: u8,
}

impl Default for SeededShotModel {
    fn default() -> Self {
        Self {
            pocket_pct: 45,
            foul_pct: 10,
        }
    }
}

impl ShotModel for SeededShotModel {
    fn resolve(
        &self,
        board: &BoardState,
        _slot: usize,
        payload: &MovePayload,
        seq: u32,
    ) -> ShotEffect {
        let mix = board
            .rack_seed
            .wrapping_mul(0x9E3779B97F4A7C15)
            .wrapping_add(seq as u64)
            .wrapping_add(payload.force as u64)
            .wrapping_add((payload.angle_deci as u64) << 8);
        let mut rng = DeterministicRng::new(mix);
        let roll = rng.next_int(100) as u8;

        if roll < self.pocket_pct {
            ShotEffect {
                result: MoveResult::Pocket,
                coins_pocketed: 1,
            }
        } else if roll < self.pocket_pct.saturating_add(self.foul_pct) {
            ShotEffect {
                result: MoveResult::Foul,
                coins_pocketed: 0,
            }
        } else {
            ShotEffect {
                result: MoveResult::Miss,
                coins_pocketed: 0,
            }
        }
    }
}

/// Test model that replays a fixed script of effects, cycling at the end.
#[derive(Clone, Debug)]
pub struct ScriptedShotModel {
    /// Effects returned in sequence order.
    pub script: Vec<ShotEffect>,
}

impl ShotModel for ScriptedShotModel {
    fn resolve(
        &self,
        _board: &BoardState,
        _slot: usize,
        _payload: &MovePayload,
        seq: u32,
    ) -> ShotEffect {
        if self.script.is_empty() {
            return ShotEffect {
                result: MoveResult::Miss,
                coins_pocketed: 0,
            };
        }
        self.script[seq as usize % self.script.len()]
    }
}
