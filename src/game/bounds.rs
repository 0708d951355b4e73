//! Per-player bounding boxes of "tiles that might be owned"
//!
//! Bounds are a conservative superset of the tiles a player owns. Extra
//! area only makes capture scans a little larger; a missing tile would make
//! the capture flood fill wrong, so bounds only ever grow except through
//! [`PlayerBounds::update_bounds`] with a freshly computed extent.

use hashbrown::HashMap;

use crate::game::player::PlayerId;
use crate::util::rect::{Rect, TilePos};

#[derive(Debug, Default)]
pub struct PlayerBounds {
    bounds: HashMap<PlayerId, Rect>,
}

impl PlayerBounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the initial bounds of a player. Panics if already registered.
    pub fn initialize_player(&mut self, id: PlayerId, rect: Rect) {
        let previous = self.bounds.insert(id, rect);
        assert!(previous.is_none(), "player {} bounds initialized twice", id);
    }

    pub fn is_tracked(&self, id: PlayerId) -> bool {
        self.bounds.contains_key(&id)
    }

    pub fn expand_bounds_with_rect(&mut self, id: PlayerId, rect: Rect) {
        let bounds = self.get_mut(id);
        *bounds = bounds.union(&rect);
    }

    pub fn expand_bounds_with_point(&mut self, id: PlayerId, point: TilePos) {
        let bounds = self.get_mut(id);
        *bounds = bounds.union_point(point);
    }

    /// Replace the bounds outright
    pub fn update_bounds(&mut self, id: PlayerId, rect: Rect) {
        *self.get_mut(id) = rect;
    }

    /// Copy of the current bounds. Panics for unknown players.
    pub fn get_bounds(&self, id: PlayerId) -> Rect {
        match self.bounds.get(&id) {
            Some(rect) => *rect,
            None => panic!("no bounds tracked for player {}", id),
        }
    }

    pub fn delete_player(&mut self, id: PlayerId) {
        self.bounds.remove(&id);
    }

    fn get_mut(&mut self, id: PlayerId) -> &mut Rect {
        match self.bounds.get_mut(&id) {
            Some(rect) => rect,
            None => panic!("no bounds tracked for player {}", id),
        }
    }
}
