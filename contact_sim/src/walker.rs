//! Random-walk entities on a square grid.
//!
//! Each walker starts on a random cell and, at its own speed, steps to one of
//! the eight neighbouring cells. Steps that would leave the board are clamped
//! to the edge, so a walker in a corner may stay put.

use contact_core::EntityId;
use nalgebra::Vector2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// The eight king-move directions.
pub const DIRECTIONS: [(i64, i64); 8] = [
    (0, 1),
    (1, 0),
    (0, -1),
    (-1, 0),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// A single simulated entity.
#[derive(Debug, Clone)]
pub struct Walker {
    id: EntityId,
    cell: (u32, u32),
    board_size: u32,
    /// Moves per second
    speed: f64,
    /// Fractional moves carried over between ticks
    carry: f64,
    rng: ChaCha8Rng,
}

impl Walker {
    /// Places a walker on a random cell of a `board_size` x `board_size` board.
    pub fn new(id: impl Into<EntityId>, board_size: u32, speed: f64, mut rng: ChaCha8Rng) -> Self {
        let board_size = board_size.max(1);
        let cell = (rng.gen_range(0..board_size), rng.gen_range(0..board_size));
        Self {
            id: id.into(),
            cell,
            board_size,
            speed: speed.max(0.0),
            carry: 0.0,
            rng,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn cell(&self) -> (u32, u32) {
        self.cell
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.cell.0 as f64, self.cell.1 as f64)
    }

    /// Makes one move and returns the new cell.
    pub fn step(&mut self) -> (u32, u32) {
        let (dx, dy) = DIRECTIONS[self.rng.gen_range(0..DIRECTIONS.len())];
        let max = self.board_size as i64 - 1;
        let x = (self.cell.0 as i64 + dx).clamp(0, max);
        let y = (self.cell.1 as i64 + dy).clamp(0, max);
        self.cell = (x as u32, y as u32);
        self.cell
    }

    /// Advances `dt` seconds and returns every cell visited, in order.
    pub fn advance(&mut self, dt: f64) -> Vec<(u32, u32)> {
        self.carry += self.speed * dt.max(0.0);
        let moves = self.carry.floor();
        self.carry -= moves;
        (0..moves as usize).map(|_| self.step()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut a = Walker::new("A", 10, 1.0, rng(3));
        let mut b = Walker::new("A", 10, 1.0, rng(3));

        assert_eq!(a.cell(), b.cell());
        for _ in 0..50 {
            assert_eq!(a.step(), b.step());
        }
    }

    #[test]
    fn test_speed_sets_move_count() {
        let mut walker = Walker::new("A", 10, 2.5, rng(1));

        // 0.1s ticks at 2.5 moves/s: 25 moves over 10s.
        let total: usize = (0..100).map(|_| walker.advance(0.1).len()).sum();
        assert!((24..=25).contains(&total), "moves: {total}");
    }

    #[test]
    fn test_single_cell_board_never_moves() {
        let mut walker = Walker::new("A", 1, 5.0, rng(9));
        for cell in walker.advance(2.0) {
            assert_eq!(cell, (0, 0));
        }
    }

    #[test]
    fn test_stationary_walker() {
        let mut walker = Walker::new("A", 10, 0.0, rng(9));
        let start = walker.cell();
        assert!(walker.advance(10.0).is_empty());
        assert_eq!(walker.cell(), start);
    }

    proptest! {
        #[test]
        fn prop_walk_stays_on_board_and_moves_one_cell(seed in any::<u64>(), board in 1u32..20, steps in 1usize..200) {
            let mut walker = Walker::new("P", board, 1.0, rng(seed));
            let mut previous = walker.cell();
            for _ in 0..steps {
                let cell = walker.step();
                prop_assert!(cell.0 < board && cell.1 < board);
                prop_assert!((cell.0 as i64 - previous.0 as i64).abs() <= 1);
                prop_assert!((cell.1 as i64 - previous.1 as i64).abs() <= 1);
                previous = cell;
            }
        }
    }
}
