//! Integer tile coordinates and axis-aligned rectangles
//!
//! Rectangles are half-open: `min` is inclusive, `max` is exclusive.
//! `compress_tiles` turns an arbitrary tile classification into a small set
//! of covering rectangles, which is what gets sent over the wire and what the
//! capture engine fills.

use smallvec::SmallVec;

/// Integer tile coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub const ZERO: TilePos = TilePos { x: 0, y: 0 };

    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// Manhattan distance
    #[inline]
    pub fn manhattan(self, other: TilePos) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }
}

/// Axis-aligned rectangle, `max` exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub min: TilePos,
    pub max: TilePos,
}

impl Rect {
    #[inline]
    pub const fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min: TilePos::new(min_x, min_y),
            max: TilePos::new(max_x, max_y),
        }
    }

    /// Rect covering exactly one tile
    #[inline]
    pub fn from_point(p: TilePos) -> Self {
        Self {
            min: p,
            max: p.offset(1, 1),
        }
    }

    /// Smallest rect containing both points (inclusive)
    pub fn spanning(a: TilePos, b: TilePos) -> Self {
        Self::new(
            a.x.min(b.x),
            a.y.min(b.y),
            a.x.max(b.x) + 1,
            a.y.max(b.y) + 1,
        )
    }

    /// Square of `radius` tiles around `center` (side = 2 * radius + 1)
    pub fn around(center: TilePos, radius: i32) -> Self {
        Self::new(
            center.x - radius,
            center.y - radius,
            center.x + radius + 1,
            center.y + radius + 1,
        )
    }

    #[inline]
    pub fn width(&self) -> i32 {
        (self.max.x - self.min.x).max(0)
    }

    #[inline]
    pub fn height(&self) -> i32 {
        (self.max.y - self.min.y).max(0)
    }

    #[inline]
    pub fn area(&self) -> u32 {
        self.width() as u32 * self.height() as u32
    }

    /// A rect with no tiles. Clamping can produce these; fills treat them as no-ops.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y
    }

    #[inline]
    pub fn contains(&self, p: TilePos) -> bool {
        p.x >= self.min.x && p.x < self.max.x && p.y >= self.min.y && p.y < self.max.y
    }

    /// True if the two rects share at least one tile
    #[inline]
    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.clamp(other).is_empty()
    }

    /// Intersection of two rects. May be empty.
    #[inline]
    pub fn clamp(&self, bounds: &Rect) -> Rect {
        Rect {
            min: TilePos::new(self.min.x.max(bounds.min.x), self.min.y.max(bounds.min.y)),
            max: TilePos::new(self.max.x.min(bounds.max.x), self.max.y.min(bounds.max.y)),
        }
    }

    /// Smallest rect containing both
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect {
            min: TilePos::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            max: TilePos::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        }
    }

    /// Grow to include `p`
    pub fn union_point(&self, p: TilePos) -> Rect {
        self.union(&Rect::from_point(p))
    }

    /// Grow by `amount` tiles on every side
    #[inline]
    pub fn dilate(&self, amount: i32) -> Rect {
        Rect::new(
            self.min.x - amount,
            self.min.y - amount,
            self.max.x + amount,
            self.max.y + amount,
        )
    }

    /// Parts of `self` not covered by `other` (at most four rects)
    pub fn subtract(&self, other: &Rect) -> SmallVec<[Rect; 4]> {
        let mut out = SmallVec::new();
        let overlap = self.clamp(other);
        if overlap.is_empty() {
            if !self.is_empty() {
                out.push(*self);
            }
            return out;
        }

        // Full-width bands above and below, then the side pieces of the middle band
        let pieces = [
            Rect::new(self.min.x, self.min.y, self.max.x, overlap.min.y),
            Rect::new(self.min.x, overlap.max.y, self.max.x, self.max.y),
            Rect::new(self.min.x, overlap.min.y, overlap.min.x, overlap.max.y),
            Rect::new(overlap.max.x, overlap.min.y, self.max.x, overlap.max.y),
        ];
        for piece in pieces {
            if !piece.is_empty() {
                out.push(piece);
            }
        }
        out
    }

    /// Iterate all tiles, column by column
    pub fn tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        (self.min.x..self.max.x)
            .flat_map(move |x| (self.min.y..self.max.y).map(move |y| TilePos::new(x, y)))
    }
}

/// A rectangle of tiles that all classified to `key`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRun<K> {
    pub rect: Rect,
    pub key: K,
}

/// Vertical run inside one column, still open for merging with the next column
struct OpenRun<K> {
    min_y: i32,
    max_y: i32,
    key: K,
    start_x: i32,
}

/// Compress the tiles of `rect` into covering rectangles.
///
/// Each column is split into vertical runs of equal classification; a run
/// that matches a run of the previous column exactly (same rows, same key)
/// extends that rectangle to the right instead of starting a new one.
///
/// Every tile for which `classify` returns `Some` ends up in exactly one
/// output rectangle, and tiles returning `None` in none. Grouping is by key
/// equality, so callers that want two groups kept apart must hand out
/// distinct keys.
pub fn compress_tiles<K, F>(rect: Rect, mut classify: F) -> Vec<TileRun<K>>
where
    K: Copy + Eq,
    F: FnMut(i32, i32) -> Option<K>,
{
    let mut output = Vec::new();
    if rect.is_empty() {
        return output;
    }

    let mut open: Vec<OpenRun<K>> = Vec::new();
    let mut next_open: Vec<OpenRun<K>> = Vec::new();
    let mut column: Vec<(i32, i32, K)> = Vec::new();

    for x in rect.min.x..rect.max.x {
        column.clear();
        let mut current: Option<(i32, K)> = None;
        for y in rect.min.y..rect.max.y {
            let key = classify(x, y);
            match (current, key) {
                (Some((_, k)), Some(nk)) if k == nk => {}
                (Some((start, k)), next) => {
                    column.push((start, y, k));
                    current = next.map(|nk| (y, nk));
                }
                (None, next) => {
                    current = next.map(|nk| (y, nk));
                }
            }
        }
        if let Some((start, k)) = current {
            column.push((start, rect.max.y, k));
        }

        // Both lists are sorted by min_y and disjoint, so a merge walk pairs them up
        next_open.clear();
        let mut prev = open.drain(..).peekable();
        for &(min_y, max_y, key) in &column {
            while let Some(run) = prev.next_if(|run| run.min_y < min_y) {
                output.push(close_run(run, x));
            }
            let start_x = match prev.peek() {
                Some(run) if run.min_y == min_y && run.max_y == max_y && run.key == key => {
                    prev.next().map(|run| run.start_x).unwrap_or(x)
                }
                _ => x,
            };
            next_open.push(OpenRun {
                min_y,
                max_y,
                key,
                start_x,
            });
        }
        for run in prev {
            output.push(close_run(run, x));
        }
        std::mem::swap(&mut open, &mut next_open);
    }

    for run in open.drain(..) {
        output.push(close_run(run, rect.max.x));
    }
    output
}

fn close_run<K>(run: OpenRun<K>, end_x: i32) -> TileRun<K> {
    TileRun {
        rect: Rect::new(run.start_x, run.min_y, end_x, run.max_y),
        key: run.key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn coverage<K: Copy + Eq + std::fmt::Debug>(runs: &[TileRun<K>]) -> HashMap<TilePos, K> {
        let mut seen = HashMap::new();
        for run in runs {
            for p in run.rect.tiles() {
                assert!(seen.insert(p, run.key).is_none(), "tile {:?} covered twice", p);
            }
        }
        seen
    }

    #[test]
    fn test_clamp_disjoint_is_empty() {
        let a = Rect::new(0, 0, 5, 5);
        let b = Rect::new(10, 10, 20, 20);
        assert!(a.clamp(&b).is_empty());
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_clamp_partial() {
        let a = Rect::new(-3, -3, 5, 5);
        let bounds = Rect::new(0, 0, 4, 10);
        assert_eq!(a.clamp(&bounds), Rect::new(0, 0, 4, 5));
    }

    #[test]
    fn test_union_and_point() {
        let r = Rect::from_point(TilePos::new(2, 3));
        let r = r.union_point(TilePos::new(5, 1));
        assert_eq!(r, Rect::new(2, 1, 6, 4));
        assert_eq!(Rect::default().union(&r), r);
    }

    #[test]
    fn test_spanning_and_around() {
        assert_eq!(
            Rect::spanning(TilePos::new(5, 2), TilePos::new(1, 2)),
            Rect::new(1, 2, 6, 3)
        );
        let spawn = Rect::around(TilePos::new(10, 10), 2);
        assert_eq!(spawn.width(), 5);
        assert_eq!(spawn.area(), 25);
    }

    #[test]
    fn test_subtract_covers_difference() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(3, 3, 6, 12);
        let pieces = a.subtract(&b);
        let total: u32 = pieces.iter().map(|r| r.area()).sum();
        assert_eq!(total, a.area() - a.clamp(&b).area());
        for piece in &pieces {
            assert!(!piece.overlaps(&b));
        }
    }

    #[test]
    fn test_subtract_no_overlap_returns_self() {
        let a = Rect::new(0, 0, 2, 2);
        let pieces = a.subtract(&Rect::new(5, 5, 6, 6));
        assert_eq!(pieces.as_slice(), &[a]);
    }

    #[test]
    fn test_compress_solid_block_is_single_rect() {
        let rect = Rect::new(0, 0, 8, 6);
        let runs = compress_tiles(rect, |_, _| Some(1u8));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].rect, rect);
    }

    #[test]
    fn test_compress_empty_classification() {
        let runs = compress_tiles(Rect::new(0, 0, 4, 4), |_, _| None::<u8>);
        assert!(runs.is_empty());
    }

    #[test]
    fn test_compress_distinct_keys_do_not_merge() {
        let rect = Rect::new(0, 0, 4, 1);
        let runs = compress_tiles(rect, |x, _| Some(if x < 2 { 'a' } else { 'b' }));
        assert_eq!(runs.len(), 2);
        let seen = coverage(&runs);
        assert_eq!(seen[&TilePos::new(0, 0)], 'a');
        assert_eq!(seen[&TilePos::new(3, 0)], 'b');
    }

    #[test]
    fn test_compress_covers_exactly() {
        // Ring with a hole plus a stray tile
        let rect = Rect::new(0, 0, 9, 7);
        let classify = |x: i32, y: i32| {
            let ring = (1..6).contains(&x) && (1..6).contains(&y) && !(x == 3 && y == 3);
            if ring || (x == 8 && y == 0) {
                Some(())
            } else {
                None
            }
        };
        let runs = compress_tiles(rect, classify);
        let seen = coverage(&runs);
        for p in rect.tiles() {
            assert_eq!(seen.contains_key(&p), classify(p.x, p.y).is_some(), "at {:?}", p);
        }
    }

    #[test]
    fn test_compress_pseudo_random_patterns() {
        // Deterministic LCG so the patterns are irregular but stable
        let mut state: u32 = 12345;
        for _ in 0..20 {
            let mut cells = [[0u8; 13]; 11];
            for row in cells.iter_mut() {
                for cell in row.iter_mut() {
                    state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    *cell = ((state >> 16) % 3) as u8;
                }
            }
            let rect = Rect::new(2, 3, 15, 14);
            let classify = |x: i32, y: i32| {
                let v = cells[(y - 3) as usize][(x - 2) as usize];
                if v == 0 {
                    None
                } else {
                    Some(v)
                }
            };
            let runs = compress_tiles(rect, classify);
            let seen = coverage(&runs);
            for p in rect.tiles() {
                assert_eq!(seen.get(&p).copied(), classify(p.x, p.y));
            }
        }
    }

    #[test]
    fn test_compress_merges_identical_columns() {
        // Two horizontal bars: each should be one rect, not one per column
        let rect = Rect::new(0, 0, 6, 5);
        let runs = compress_tiles(rect, |_, y| if y == 1 || y == 3 { Some(()) } else { None });
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.rect.width() == 6 && r.rect.height() == 1));
    }
}
