//! Player entity and movement state machine
//!
//! Position, direction and the open trail are authoritative here. Clients
//! only submit `(direction, position)` requests; they are queued and checked
//! against the current server position when the tick drains them. Requests
//! that no longer fit are dropped without telling the client.

use std::collections::VecDeque;
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::game::constants::{player, skin};
use crate::util::rect::{Rect, TilePos};

/// Player identifier, also the tile value of the player's territory
pub type PlayerId = u16;

/// Connection identifier assigned by the transport
pub type ConnectionId = u64;

/// Movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Right,
    Down,
    Left,
    Up,
    Paused,
}

impl Direction {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Right),
            1 => Some(Direction::Down),
            2 => Some(Direction::Left),
            3 => Some(Direction::Up),
            4 => Some(Direction::Paused),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Direction::Right => 0,
            Direction::Down => 1,
            Direction::Left => 2,
            Direction::Up => 3,
            Direction::Paused => 4,
        }
    }

    /// Unit step for this direction
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Right => (1, 0),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Up => (0, -1),
            Direction::Paused => (0, 0),
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Right | Direction::Left)
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, Direction::Down | Direction::Up)
    }

    pub fn is_opposite(self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Direction::Right, Direction::Left)
                | (Direction::Left, Direction::Right)
                | (Direction::Up, Direction::Down)
                | (Direction::Down, Direction::Up)
        )
    }
}

/// A queued client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub direction: Direction,
    pub position: TilePos,
}

/// An accepted request, resolved against the current position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveTarget {
    pub direction: Direction,
    pub position: TilePos,
    /// Tiles to travel forward to reach `position`; negative means backwards
    pub ahead: i32,
}

/// Why a player died, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathType {
    None,
    Player,
    Bounds,
    SelfHit,
}

impl DeathType {
    pub fn to_wire(self) -> u8 {
        match self {
            DeathType::None => 0,
            DeathType::Player => 1,
            DeathType::Bounds => 2,
            DeathType::SelfHit => 3,
        }
    }
}

#[derive(Debug)]
pub struct Player {
    id: PlayerId,
    connection_id: ConnectionId,
    name: String,
    skin_id: u8,
    pattern_id: u8,

    position: TilePos,
    direction: Direction,
    /// Fractional progress towards the next tile
    progress: f32,
    trail: Vec<TilePos>,
    /// Tiles travelled since the last turn; bounds how far a correction may go back
    steps_since_turn: i32,
    move_queue: VecDeque<MoveRequest>,
    /// False until the worker confirmed the spawn square
    spawned: bool,

    pub kills: u32,
    pub highest_rank: u16,
    pub seconds_ranked_first: f32,
    pub last_honk: Option<Instant>,
    /// Last (tiles, kills) sent as MY_SCORE
    pub reported_score: Option<(u32, u32)>,
    joined_at: Instant,

    /// Players announced to this player's client (skin and name sent)
    known_players: FxHashSet<PlayerId>,
    /// Players currently inside this player's viewport
    visible_players: FxHashSet<PlayerId>,
    /// Viewport whose tiles the client already has
    sent_viewport: Rect,
}

impl Player {
    pub fn new(
        id: PlayerId,
        connection_id: ConnectionId,
        name: String,
        skin_id: u8,
        pattern_id: u8,
        position: TilePos,
        now: Instant,
    ) -> Self {
        Self {
            id,
            connection_id,
            name,
            skin_id,
            pattern_id,
            position,
            direction: Direction::Paused,
            progress: 0.0,
            trail: Vec::new(),
            steps_since_turn: 0,
            move_queue: VecDeque::new(),
            spawned: false,
            kills: 0,
            highest_rank: 0,
            seconds_ranked_first: 0.0,
            last_honk: None,
            reported_score: None,
            joined_at: now,
            known_players: FxHashSet::default(),
            visible_players: FxHashSet::default(),
            sent_viewport: Rect::default(),
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn skin_id(&self) -> u8 {
        self.skin_id
    }

    pub fn pattern_id(&self) -> u8 {
        self.pattern_id
    }

    pub fn position(&self) -> TilePos {
        self.position
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn trail(&self) -> &[TilePos] {
        &self.trail
    }

    pub fn has_trail(&self) -> bool {
        !self.trail.is_empty()
    }

    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    pub fn mark_spawned(&mut self) {
        self.spawned = true;
    }

    pub fn time_alive(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.joined_at).as_secs_f32()
    }

    /// Square region this player receives updates for
    pub fn viewport(&self, half_size: i32) -> Rect {
        Rect::around(self.position, half_size)
    }

    pub fn in_viewport(&self, half_size: i32, p: TilePos) -> bool {
        self.viewport(half_size).contains(p)
    }

    // === Movement queue ===

    /// Queue a client request. Requests beyond the queue limit are dropped.
    pub fn queue_move(&mut self, direction: Direction, position: TilePos) {
        if self.move_queue.len() >= player::MAX_QUEUED_MOVES {
            return;
        }
        self.move_queue.push_back(MoveRequest {
            direction,
            position,
        });
    }

    pub fn pop_queued_move(&mut self) -> Option<MoveRequest> {
        self.move_queue.pop_front()
    }

    /// Check a request against the current authoritative state.
    ///
    /// Same or opposite direction is refused, turns must happen on the line
    /// currently travelled, and the requested position may be at most
    /// `max_correction` tiles away. A backwards correction may only cover
    /// tiles travelled since the last turn and may not cross the last trail
    /// vertex.
    pub fn validate_move(&self, request: MoveRequest, max_correction: i32) -> Option<MoveTarget> {
        let MoveRequest {
            direction,
            position,
        } = request;
        if direction == self.direction || direction.is_opposite(self.direction) {
            return None;
        }

        let aligned = if self.direction.is_horizontal() {
            position.y == self.position.y
        } else if self.direction.is_vertical() {
            position.x == self.position.x
        } else {
            position == self.position
        };
        if !aligned || position.manhattan(self.position) > max_correction {
            return None;
        }

        let (dx, dy) = self.direction.delta();
        let ahead = (position.x - self.position.x) * dx + (position.y - self.position.y) * dy;
        if ahead < 0 {
            if -ahead > self.steps_since_turn {
                return None;
            }
            if let Some(last) = self.trail.last() {
                let past_vertex = (position.x - last.x) * dx + (position.y - last.y) * dy;
                if past_vertex < 0 {
                    return None;
                }
            }
        }

        Some(MoveTarget {
            direction,
            position,
            ahead,
        })
    }

    /// Jump back along the current line. Only valid for targets from
    /// [`validate_move`](Self::validate_move) with `ahead < 0`.
    pub fn retreat_to(&mut self, position: TilePos) {
        self.steps_since_turn -= position.manhattan(self.position);
        self.position = position;
        if self.trail.len() == 1 && self.trail[0] == position {
            // Back on the tile the trail started from
            self.trail.clear();
        }
    }

    /// Apply the direction of an accepted request at the current position
    pub fn turn(&mut self, direction: Direction) {
        if self.has_trail() && self.trail.last() != Some(&self.position) {
            self.trail.push(self.position);
        }
        self.direction = direction;
        self.steps_since_turn = 0;
        if direction == Direction::Paused {
            self.progress = 0.0;
        }
    }

    // === Tick integration ===

    /// Accumulate travel and return how many whole tiles to move this tick
    pub fn advance(&mut self, dt: f32, speed: f32) -> u32 {
        if !self.spawned || self.direction == Direction::Paused {
            return 0;
        }
        self.progress += dt * speed;
        let mut steps = 0;
        while self.progress >= 1.0 {
            self.progress -= 1.0;
            steps += 1;
        }
        steps
    }

    /// Tile the player would enter with its next step
    pub fn next_position(&self) -> TilePos {
        let (dx, dy) = self.direction.delta();
        self.position.offset(dx, dy)
    }

    /// Move one tile in the current direction
    pub fn step(&mut self) -> TilePos {
        self.position = self.next_position();
        self.steps_since_turn += 1;
        self.position
    }

    // === Trail ===

    /// Start a trail at `origin`, the last tile inside own territory
    pub fn open_trail(&mut self, origin: TilePos) {
        debug_assert!(self.trail.is_empty());
        self.trail.push(origin);
    }

    /// Finish the trail at the current position and hand back its vertices
    pub fn close_trail(&mut self) -> Vec<TilePos> {
        if self.trail.last() != Some(&self.position) {
            self.trail.push(self.position);
        }
        std::mem::take(&mut self.trail)
    }

    pub fn clear_trail(&mut self) {
        self.trail.clear();
    }

    /// Vertices including the implicit segment to the head
    pub fn trail_with_head(&self) -> Vec<TilePos> {
        let mut vertices = self.trail.clone();
        if !vertices.is_empty() && vertices.last() != Some(&self.position) {
            vertices.push(self.position);
        }
        vertices
    }

    /// True if `p` lies on the open trail, counting the segment to the head.
    /// `exclude_head` leaves the current position out, for self checks.
    pub fn trail_contains(&self, p: TilePos, exclude_head: bool) -> bool {
        if self.trail.is_empty() {
            return false;
        }
        if exclude_head && p == self.position {
            return false;
        }
        let head = [self.position];
        let points = self.trail.iter().chain(head.iter());
        let mut previous: Option<&TilePos> = None;
        for vertex in points {
            let on_segment = match previous {
                Some(prev) => Rect::spanning(*prev, *vertex).contains(p),
                None => *vertex == p,
            };
            if on_segment {
                return true;
            }
            previous = Some(vertex);
        }
        false
    }

    // === Viewport bookkeeping ===

    pub fn knows(&self, other: PlayerId) -> bool {
        self.known_players.contains(&other)
    }

    /// Returns true if `other` was not known before
    pub fn mark_known(&mut self, other: PlayerId) -> bool {
        self.known_players.insert(other)
    }

    pub fn forget(&mut self, other: PlayerId) {
        self.known_players.remove(&other);
        self.visible_players.remove(&other);
    }

    /// Returns true if `other` just became visible
    pub fn set_visible(&mut self, other: PlayerId, visible: bool) -> bool {
        if visible {
            self.visible_players.insert(other)
        } else {
            self.visible_players.remove(&other);
            false
        }
    }

    pub fn sent_viewport(&self) -> Rect {
        self.sent_viewport
    }

    pub fn set_sent_viewport(&mut self, rect: Rect) {
        self.sent_viewport = rect;
    }

    // === Skins ===

    /// Skin this player's client should draw another player with.
    ///
    /// A player never sees someone else in its own color. On a collision the
    /// substitute is derived from the other player's id, so it is stable and
    /// different from the shared skin.
    pub fn skin_id_for_player(&self, other_id: PlayerId, other_skin: u8) -> u8 {
        skin_id_for_viewer(self.id, self.skin_id, other_id, other_skin)
    }
}

/// Free-function form of [`Player::skin_id_for_player`], usable for tiles of
/// players that already left.
pub fn skin_id_for_viewer(viewer_id: PlayerId, viewer_skin: u8, other_id: PlayerId, other_skin: u8) -> u8 {
    if other_id == viewer_id || other_skin != viewer_skin {
        return other_skin;
    }
    // Pick among the COUNT - 1 skins that are not the viewer's
    let mut substitute = (other_id % (skin::COUNT as u16 - 1)) as u8 + 1;
    if substitute >= viewer_skin {
        substitute += 1;
    }
    substitute
}

/// Deterministic skin for ids with no live player
pub fn fallback_skin(id: PlayerId) -> u8 {
    (id % skin::COUNT as u16) as u8 + 1
}
