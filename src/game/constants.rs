/// Tile values stored in the grid
pub mod tile {
    /// Permanent border tile, forms the outer ring
    pub const BORDER: i32 = -1;
    /// Unclaimed tile
    pub const EMPTY: i32 = 0;
}

/// Player movement and spawning
pub mod player {
    /// Spawn square radius (side = 2 * radius + 1)
    pub const SPAWN_RADIUS: i32 = 2;
    /// Travel speed in tiles per second
    pub const TRAVEL_SPEED: f32 = 6.0;
    /// Furthest a queued move may place the player from its server position
    pub const MAX_POSITION_CORRECTION: i32 = 6;
    /// Attempts to find a spawn square that is fully unclaimed
    pub const SPAWN_ATTEMPTS: u32 = 20;
    /// Minimum distance between a spawn square and the border
    pub const SPAWN_MARGIN: i32 = 4;
    /// Maximum queued movement requests per player
    pub const MAX_QUEUED_MOVES: usize = 16;
}

/// Player ids
pub mod ids {
    /// Wire sentinel meaning "the receiving player"
    pub const SELF_ID: u16 = 0;
    /// Largest assignable id
    pub const MAX_ID: u16 = u16::MAX;
}

/// Skins and colors
pub mod skin {
    /// Number of selectable color skins (ids 1..=COUNT)
    pub const COUNT: u8 = 13;
    /// Number of selectable patterns
    pub const PATTERN_COUNT: u8 = 28;
    /// Wire tile type for border tiles
    pub const TILE_TYPE_BORDER: u8 = 0;
    /// Wire tile type for unclaimed tiles
    pub const TILE_TYPE_EMPTY: u8 = 1;
    /// Offset from a skin id to its wire tile type
    pub const TILE_TYPE_SKIN_OFFSET: u8 = 1;
}

/// Viewport and broadcast fan-out
pub mod viewport {
    /// Half-size of the square a player receives updates for
    pub const UPDATES_VIEWPORT_RECT_SIZE: i32 = 20;
}

/// Periodic broadcasts
pub mod broadcast {
    /// Seconds between leaderboard broadcasts
    pub const LEADERBOARD_INTERVAL: f32 = 1.0;
    /// Seconds between minimap part broadcasts
    pub const MINIMAP_INTERVAL: f32 = 0.5;
    /// Leaderboard entries sent
    pub const LEADERBOARD_SIZE: usize = 10;
    /// Samples per side of one minimap quadrant
    pub const MINIMAP_PART_SIZE: usize = 40;
    /// Number of minimap quadrants
    pub const MINIMAP_PARTS: u8 = 4;
}

/// Honking
pub mod honk {
    /// Shortest honk accepted
    pub const MIN_DURATION: u8 = 1;
    /// Longest honk accepted
    pub const MAX_DURATION: u8 = 70;
    /// Seconds a player must wait between honks
    pub const COOLDOWN: f32 = 1.0;
}

/// Tick timing
pub mod tick {
    /// Default simulation tick rate in Hz
    pub const TICK_RATE: u32 = 30;
}

/// Networking constants
pub mod net {
    /// Maximum framed message size
    pub const MAX_MESSAGE_SIZE: usize = 65536;
    /// Maximum player name length in characters
    pub const MAX_NAME_LENGTH: usize = 16;
    /// Connection event channel capacity
    pub const EVENT_BUFFER_SIZE: usize = 4096;
    /// Encoded messages queued per connection before it counts as lagging
    pub const OUTBOX_CAPACITY: usize = 1024;
}
