//! Canonical arena state owned by the worker thread
//!
//! Holds the authoritative tile grid and the bounds tracker, and implements
//! every grid mutation: spawn squares, trail fills, captured-area resolution
//! and tile clearing. Each mutation is recorded so the worker can publish a
//! single change notification per request.

use bitvec::prelude::*;
use rustc_hash::FxHashMap;

use crate::game::bounds::PlayerBounds;
use crate::game::constants::{broadcast, player, tile};
use crate::game::grid::{TileGrid, TileValue};
use crate::game::player::PlayerId;
use crate::util::rect::{compress_tiles, Rect, TilePos};

/// A rectangle filled with a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFill {
    pub rect: Rect,
    pub value: TileValue,
}

/// Everything one request changed in the grid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileChanges {
    pub fills: Vec<TileFill>,
    /// Net owned-tile change per player id
    pub owner_deltas: Vec<(PlayerId, i64)>,
}

impl TileChanges {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }
}

/// Result of a captured-area resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureResult {
    pub filled: Vec<Rect>,
    pub filled_tiles: u32,
}

pub struct ArenaState {
    grid: TileGrid,
    bounds: PlayerBounds,
    /// Flood fill scratch mask, reused between captures
    visited: BitVec,
    stack: Vec<TilePos>,
    pending_fills: Vec<TileFill>,
    pending_deltas: FxHashMap<PlayerId, i64>,
    spawn_radius: i32,
}

impl ArenaState {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            grid: TileGrid::new(width, height),
            bounds: PlayerBounds::new(),
            visited: BitVec::new(),
            stack: Vec::with_capacity(1024),
            pending_fills: Vec::new(),
            pending_deltas: FxHashMap::default(),
            spawn_radius: player::SPAWN_RADIUS,
        }
    }

    pub fn with_spawn_radius(mut self, radius: i32) -> Self {
        self.spawn_radius = radius;
        self
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn bounds(&self) -> &PlayerBounds {
        &self.bounds
    }

    /// Interior of the arena, everything except the border ring
    fn interior(&self) -> Rect {
        self.grid.bounds().dilate(-1)
    }

    /// Fill and record the change. Returns the number of tiles that changed value.
    fn fill(&mut self, rect: Rect, value: TileValue) -> u32 {
        let deltas = &mut self.pending_deltas;
        let mut changed = 0u32;
        let clamped = self.grid.fill_rect_with(rect, value, |old| {
            changed += 1;
            if old > 0 {
                *deltas.entry(old as PlayerId).or_insert(0) -= 1;
            }
        });
        if changed > 0 {
            if value > 0 {
                *deltas.entry(value as PlayerId).or_insert(0) += changed as i64;
            }
            self.pending_fills.push(TileFill {
                rect: clamped,
                value,
            });
        }
        changed
    }

    /// Drain the changes recorded since the last call
    pub fn take_changes(&mut self) -> TileChanges {
        let mut owner_deltas: Vec<(PlayerId, i64)> = self
            .pending_deltas
            .drain()
            .filter(|(_, delta)| *delta != 0)
            .collect();
        owner_deltas.sort_unstable_by_key(|(id, _)| *id);
        TileChanges {
            fills: std::mem::take(&mut self.pending_fills),
            owner_deltas,
        }
    }

    /// Fill the spawn square around `pos` and start tracking the player
    pub fn fill_player_spawn(&mut self, pos: TilePos, player_id: PlayerId) -> Rect {
        assert!(
            !self.bounds.is_tracked(player_id),
            "player {} spawned while already tracked",
            player_id
        );
        let rect = Rect::around(pos, self.spawn_radius).clamp(&self.interior());
        self.fill(rect, player_id as TileValue);
        self.bounds.initialize_player(player_id, rect);
        rect
    }

    /// Fill every segment of an orthogonal polyline with the player's id
    pub fn fill_player_trail(&mut self, vertices: &[TilePos], player_id: PlayerId) {
        let interior = self.interior();
        let value = player_id as TileValue;
        if let [only] = vertices {
            self.fill(Rect::from_point(*only).clamp(&interior), value);
        }
        for pair in vertices.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(
                a.x == b.x || a.y == b.y,
                "diagonal trail segment {:?} -> {:?} for player {}",
                a,
                b,
                player_id
            );
            self.fill(Rect::spanning(a, b).clamp(&interior), value);
        }
        for vertex in vertices {
            self.bounds.expand_bounds_with_point(player_id, *vertex);
        }
    }

    /// Fill all tiles enclosed by the player's territory.
    ///
    /// Floods the non-owned tiles of the player's bounds (dilated by one so a
    /// free ring surrounds the territory) from the top-left corner and from
    /// every other player's location. Whatever non-owned tile the flood never
    /// reached is enclosed and becomes the player's.
    pub fn update_captured_area(
        &mut self,
        player_id: PlayerId,
        other_player_locations: &[TilePos],
    ) -> CaptureResult {
        let value = player_id as TileValue;
        let scan = self
            .bounds
            .get_bounds(player_id)
            .dilate(1)
            .clamp(&self.grid.bounds());
        let width = scan.width() as usize;

        self.visited.clear();
        self.visited.resize(width * scan.height() as usize, false);
        self.stack.clear();

        let seed = scan.min;
        assert!(
            self.grid.get_pos(seed) != value,
            "capture seed {:?} is owned by player {}, bounds are stale",
            seed,
            player_id
        );
        self.stack.push(seed);
        for location in other_player_locations {
            if scan.contains(*location) && self.grid.get_pos(*location) != value {
                self.stack.push(*location);
            }
        }

        let index = |p: TilePos| (p.y - scan.min.y) as usize * width + (p.x - scan.min.x) as usize;
        while let Some(p) = self.stack.pop() {
            let idx = index(p);
            if self.visited[idx] || self.grid.get_pos(p) == value {
                continue;
            }
            self.visited.set(idx, true);
            for next in [p.offset(1, 0), p.offset(-1, 0), p.offset(0, 1), p.offset(0, -1)] {
                if scan.contains(next) && !self.visited[index(next)] {
                    self.stack.push(next);
                }
            }
        }

        let grid = &self.grid;
        let visited = &self.visited;
        let enclosed = compress_tiles(scan, |x, y| {
            let tile = grid.get(x, y);
            let reached = visited[index(TilePos::new(x, y))];
            (tile != value && tile != tile::BORDER && !reached).then_some(())
        });

        let mut result = CaptureResult::default();
        for run in &enclosed {
            self.fill(run.rect, value);
            result.filled_tiles += run.rect.area();
            result.filled.push(run.rect);
        }

        // The scan covers everything the player owns, so this is the exact extent
        let mut owned_extent = Rect::default();
        for p in scan.tiles() {
            if self.grid.get_pos(p) == value {
                owned_extent = owned_extent.union_point(p);
            }
        }
        if !owned_extent.is_empty() {
            self.bounds.update_bounds(player_id, owned_extent);
        }

        result
    }

    /// Reset every tile the player owns to empty and stop tracking it.
    /// Returns the number of tiles cleared.
    pub fn clear_all_player_tiles(&mut self, player_id: PlayerId) -> u32 {
        let value = player_id as TileValue;
        let area = self.bounds.get_bounds(player_id).clamp(&self.grid.bounds());
        let grid = &self.grid;
        let owned = compress_tiles(area, |x, y| (grid.get(x, y) == value).then_some(()));

        let mut cleared = 0;
        for run in owned {
            cleared += self.fill(run.rect, tile::EMPTY);
        }
        self.bounds.delete_player(player_id);
        cleared
    }

    /// Stop tracking a player, leaving its tiles in place
    pub fn release_player(&mut self, player_id: PlayerId) {
        self.bounds.delete_player(player_id);
    }

    pub fn minimap_part(&self, part: u8) -> Vec<u8> {
        minimap_part(&self.grid, part)
    }
}

/// Down-sampled filled/unfilled bitset of one arena quadrant.
///
/// Parts are numbered row-major: 0 top-left, 1 top-right, 2 bottom-left,
/// 3 bottom-right. Bits are MSB-first, row-major.
pub fn minimap_part(grid: &TileGrid, part: u8) -> Vec<u8> {
    assert!(part < broadcast::MINIMAP_PARTS, "minimap part {} out of range", part);
    let size = broadcast::MINIMAP_PART_SIZE;
    let half_w = grid.width() / 2;
    let half_h = grid.height() / 2;
    let (qx, qw) = if part % 2 == 0 {
        (0, half_w)
    } else {
        (half_w, grid.width() - half_w)
    };
    let (qy, qh) = if part / 2 == 0 {
        (0, half_h)
    } else {
        (half_h, grid.height() - half_h)
    };

    let mut bits: BitVec<u8, Msb0> = BitVec::with_capacity(size * size);
    for sy in 0..size {
        let y = qy + (sy as i32 * qh) / size as i32;
        for sx in 0..size {
            let x = qx + (sx as i32 * qw) / size as i32;
            bits.push(grid.get(x, y) > 0);
        }
    }
    bits.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_ring(state: &mut ArenaState, player_id: PlayerId, rect: Rect) {
        // Border tiles of `rect` only, via trail fills
        let corners = [
            rect.min,
            TilePos::new(rect.max.x - 1, rect.min.y),
            TilePos::new(rect.max.x - 1, rect.max.y - 1),
            TilePos::new(rect.min.x, rect.max.y - 1),
            rect.min,
        ];
        state.fill_player_trail(&corners, player_id);
    }

    #[test]
    fn test_spawn_fills_square_and_bounds() {
        let mut state = ArenaState::new(20, 20);
        let rect = state.fill_player_spawn(TilePos::new(10, 10), 1);
        assert_eq!(rect, Rect::new(8, 8, 13, 13));
        assert_eq!(state.grid().count_in(rect, 1), 25);
        assert_eq!(state.bounds().get_bounds(1), rect);

        let changes = state.take_changes();
        assert_eq!(changes.fills, vec![TileFill { rect, value: 1 }]);
        assert_eq!(changes.owner_deltas, vec![(1, 25)]);
        assert!(state.take_changes().is_empty());
    }

    #[test]
    fn test_spawn_never_touches_border() {
        let mut state = ArenaState::new(10, 10);
        let rect = state.fill_player_spawn(TilePos::new(1, 1), 4);
        assert_eq!(rect.min, TilePos::new(1, 1));
        assert_eq!(state.grid().get(0, 0), tile::BORDER);
    }

    #[test]
    #[should_panic]
    fn test_double_spawn_panics() {
        let mut state = ArenaState::new(20, 20);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.fill_player_spawn(TilePos::new(5, 5), 1);
    }

    #[test]
    #[should_panic]
    fn test_diagonal_trail_panics() {
        let mut state = ArenaState::new(20, 20);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.fill_player_trail(&[TilePos::new(12, 10), TilePos::new(14, 12)], 1);
    }

    #[test]
    fn test_trail_fill_expands_bounds() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.fill_player_trail(
            &[TilePos::new(12, 10), TilePos::new(20, 10), TilePos::new(20, 15)],
            1,
        );
        assert_eq!(state.grid().get(16, 10), 1);
        assert_eq!(state.grid().get(20, 13), 1);
        assert_eq!(state.bounds().get_bounds(1), Rect::new(8, 8, 21, 16));
    }

    #[test]
    fn test_capture_fills_closed_ring_interior() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(5, 5), 2);
        let ring = Rect::new(5, 5, 15, 15);
        square_ring(&mut state, 2, ring);
        state.take_changes();

        let outside_before = state.grid().count_in(Rect::new(16, 0, 30, 30), tile::EMPTY);
        let result = state.update_captured_area(2, &[]);

        // 8x8 interior minus the spawn tiles already inside it (x,y in 6..8)
        let interior = Rect::new(6, 6, 14, 14);
        assert_eq!(result.filled_tiles, interior.area() - 4);
        let filled_area: u32 = result.filled.iter().map(|r| r.area()).sum();
        assert_eq!(filled_area, result.filled_tiles);
        assert_eq!(state.grid().count_in(interior, 2), interior.area());
        assert_eq!(
            state.grid().count_in(Rect::new(16, 0, 30, 30), tile::EMPTY),
            outside_before
        );
    }

    #[test]
    fn test_capture_open_ring_fills_nothing() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(5, 5), 2);
        state.fill_player_trail(
            &[
                TilePos::new(7, 5),
                TilePos::new(14, 5),
                TilePos::new(14, 14),
                TilePos::new(5, 14),
                TilePos::new(5, 9),
            ],
            2,
        );
        let result = state.update_captured_area(2, &[]);
        assert_eq!(result.filled_tiles, 0);
        assert!(result.filled.is_empty());
    }

    #[test]
    fn test_capture_takes_enemy_tiles() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(10, 10), 3);
        state.fill_player_spawn(TilePos::new(5, 5), 2);
        square_ring(&mut state, 2, Rect::new(5, 5, 17, 17));
        state.take_changes();

        state.update_captured_area(2, &[]);
        let changes = state.take_changes();
        assert_eq!(state.grid().count_in(Rect::new(8, 8, 13, 13), 2), 25);
        assert!(changes.owner_deltas.contains(&(3, -25)));
    }

    #[test]
    fn test_capture_skips_region_with_other_player() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(5, 5), 2);
        square_ring(&mut state, 2, Rect::new(5, 5, 15, 15));
        let result = state.update_captured_area(2, &[TilePos::new(10, 10)]);
        assert_eq!(result.filled_tiles, 0);
        assert_eq!(state.grid().get(10, 10), tile::EMPTY);
    }

    #[test]
    fn test_capture_shrinks_bounds_to_owned_extent() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.bounds.update_bounds(1, Rect::new(3, 3, 25, 25));
        state.update_captured_area(1, &[]);
        assert_eq!(state.bounds().get_bounds(1), Rect::new(8, 8, 13, 13));
    }

    #[test]
    fn test_capture_along_border() {
        let mut state = ArenaState::new(20, 20);
        state.fill_player_spawn(TilePos::new(3, 3), 1);
        // Territory touching the border column never captures border tiles
        state.fill_player_trail(&[TilePos::new(1, 3), TilePos::new(1, 18)], 1);
        state.update_captured_area(1, &[]);
        assert_eq!(state.grid().count_in(state.grid().bounds(), tile::BORDER), 4 * 19);
    }

    #[test]
    fn test_clear_all_player_tiles() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.fill_player_trail(&[TilePos::new(12, 10), TilePos::new(20, 10)], 1);
        state.take_changes();

        let cleared = state.clear_all_player_tiles(1);
        assert_eq!(cleared, 25 + 8);
        assert_eq!(state.grid().count_in(state.grid().bounds(), 1), 0);
        assert!(!state.bounds().is_tracked(1));
        let changes = state.take_changes();
        assert_eq!(changes.owner_deltas, vec![(1, -33)]);
        assert!(changes.fills.iter().all(|f| f.value == tile::EMPTY));
    }

    #[test]
    fn test_release_keeps_tiles() {
        let mut state = ArenaState::new(30, 30);
        state.fill_player_spawn(TilePos::new(10, 10), 1);
        state.release_player(1);
        assert!(!state.bounds().is_tracked(1));
        assert_eq!(state.grid().get(10, 10), 1);
        // Id can spawn again once released
        state.fill_player_spawn(TilePos::new(20, 20), 1);
    }

    #[test]
    fn test_minimap_part_bits() {
        let mut state = ArenaState::new(80, 80);
        let empty = state.minimap_part(0);
        let size = broadcast::MINIMAP_PART_SIZE;
        assert_eq!(empty.len(), size * size / 8);
        assert!(empty.iter().all(|b| *b == 0));

        state.fill_player_spawn(TilePos::new(10, 10), 1);
        let part = state.minimap_part(0);
        assert!(part.iter().any(|b| *b != 0));
        assert!(state.minimap_part(3).iter().all(|b| *b == 0));
    }
}
