//! Dense tile ownership grid
//!
//! Values: `-1` border, `0` unclaimed, `N > 0` owned by player `N`.
//! The worker holds the canonical copy; the coordinator holds a mirror
//! that only changes through worker notifications.

use crate::game::constants::tile;
use crate::util::rect::{Rect, TilePos};

/// Raw tile ownership value
pub type TileValue = i32;

#[derive(Debug, Clone)]
pub struct TileGrid {
    width: i32,
    height: i32,
    tiles: Vec<TileValue>,
}

impl TileGrid {
    /// Allocate a grid with an empty interior and a border ring
    pub fn new(width: i32, height: i32) -> Self {
        assert!(width > 2 && height > 2, "grid must be larger than its border: {}x{}", width, height);
        let mut grid = Self {
            width,
            height,
            tiles: vec![tile::EMPTY; (width * height) as usize],
        };
        let full = grid.bounds();
        for p in full.tiles() {
            if p.x == 0 || p.y == 0 || p.x == width - 1 || p.y == height - 1 {
                grid.set(p.x, p.y, tile::BORDER);
            }
        }
        grid
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Rect covering the whole grid
    #[inline]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    #[inline]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> usize {
        assert!(
            self.in_bounds(x, y),
            "tile ({}, {}) outside {}x{} grid",
            x,
            y,
            self.width,
            self.height
        );
        (y * self.width + x) as usize
    }

    /// Tile value at `(x, y)`. Panics outside the grid.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> TileValue {
        self.tiles[self.index(x, y)]
    }

    #[inline]
    pub fn get_pos(&self, p: TilePos) -> TileValue {
        self.get(p.x, p.y)
    }

    /// Set a single tile. Panics outside the grid.
    #[inline]
    pub fn set(&mut self, x: i32, y: i32, value: TileValue) {
        let idx = self.index(x, y);
        self.tiles[idx] = value;
    }

    /// Fill `rect` (clamped to the grid) with `value`. Returns the clamped rect.
    pub fn fill_rect(&mut self, rect: Rect, value: TileValue) -> Rect {
        self.fill_rect_with(rect, value, |_| {})
    }

    /// Like [`fill_rect`](Self::fill_rect), calling `on_change(old)` for each
    /// tile whose value actually changed.
    pub fn fill_rect_with(
        &mut self,
        rect: Rect,
        value: TileValue,
        mut on_change: impl FnMut(TileValue),
    ) -> Rect {
        let clamped = rect.clamp(&self.bounds());
        if clamped.is_empty() {
            return clamped;
        }
        for y in clamped.min.y..clamped.max.y {
            let row = (y * self.width) as usize;
            for x in clamped.min.x..clamped.max.x {
                let slot = &mut self.tiles[row + x as usize];
                if *slot != value {
                    on_change(*slot);
                    *slot = value;
                }
            }
        }
        clamped
    }

    /// Number of tiles in `rect` with exactly `value`
    pub fn count_in(&self, rect: Rect, value: TileValue) -> u32 {
        let clamped = rect.clamp(&self.bounds());
        clamped.tiles().filter(|p| self.get_pos(*p) == value).count() as u32
    }
}
