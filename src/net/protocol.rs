//! Binary wire protocol
//!
//! Every message starts with a one-byte type tag. Multi-byte integers are
//! big-endian, coordinates are `u16`, strings are raw UTF-8 running to the
//! end of the message unless length-prefixed.

use thiserror::Error;

use crate::game::player::{DeathType, Direction, PlayerId};
use crate::util::rect::{Rect, TilePos};

/// Server to client message tags
pub mod server_tag {
    pub const PLAYER_STATE: u8 = 2;
    pub const FILL_RECT: u8 = 3;
    pub const SET_PLAYER_TRAIL: u8 = 4;
    pub const PLAYER_DIE: u8 = 5;
    pub const CHUNK_OF_BLOCKS: u8 = 6;
    pub const REMOVE_PLAYER: u8 = 7;
    pub const PLAYER_NAME: u8 = 8;
    pub const MY_SCORE: u8 = 9;
    pub const MY_RANK: u8 = 10;
    pub const LEADERBOARD: u8 = 11;
    pub const MAP_SIZE: u8 = 12;
    pub const GAME_OVER: u8 = 13;
    pub const MINIMAP: u8 = 14;
    pub const PLAYER_SKIN: u8 = 15;
    pub const EMPTY_TRAIL_WITH_LAST_POS: u8 = 16;
    pub const READY: u8 = 17;
    pub const PLAYER_HIT_LINE: u8 = 18;
    pub const PLAYER_HONK: u8 = 20;
    pub const PONG: u8 = 21;
    pub const UNDO_PLAYER_DIE: u8 = 22;
    pub const TEAM_LIFE_COUNT: u8 = 23;
}

/// Client to server message tags
pub mod client_tag {
    pub const UPDATE_MY_POS: u8 = 1;
    pub const SET_USERNAME: u8 = 2;
    pub const SKIN: u8 = 3;
    pub const READY: u8 = 4;
    pub const HONK: u8 = 6;
    pub const PING: u8 = 7;
    pub const REQUEST_MY_TRAIL: u8 = 8;
    pub const VERSION: u8 = 11;
    pub const PATREON_CODE: u8 = 12;
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `direction` is `None` for direction bytes the server does not know
    UpdateMyPos {
        direction: Option<Direction>,
        position: TilePos,
    },
    SetUsername(String),
    Skin { color_id: u8, pattern_id: u8 },
    Ready,
    Honk { duration: u8 },
    Ping,
    RequestMyTrail,
    Version { kind: u8, version: u16 },
    PatreonCode(String),
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    PlayerState {
        position: TilePos,
        player_id: PlayerId,
        direction: Direction,
        has_trail: bool,
    },
    FillRect {
        rect: Rect,
        tile_type: u8,
        pattern_id: u8,
        is_edge_chunk: bool,
    },
    SetPlayerTrail {
        player_id: PlayerId,
        vertices: Vec<TilePos>,
    },
    PlayerDie {
        player_id: PlayerId,
        position: Option<TilePos>,
    },
    /// `tiles` holds `rect.area()` tile types, row-major
    ChunkOfBlocks { rect: Rect, tiles: Vec<u8> },
    RemovePlayer { player_id: PlayerId },
    PlayerName { player_id: PlayerId, name: String },
    MyScore { tiles: u32, kills: u16 },
    MyRank { rank: u16 },
    Leaderboard {
        total_players: u16,
        entries: Vec<LeaderboardEntry>,
    },
    MapSize { size: u16 },
    GameOver(GameOverStats),
    Minimap { part: u8, bits: Vec<u8> },
    PlayerSkin { player_id: PlayerId, color_id: u8 },
    EmptyTrailWithLastPos {
        player_id: PlayerId,
        position: TilePos,
    },
    Ready,
    PlayerHitLine {
        by_player_id: PlayerId,
        color_id: u8,
        position: TilePos,
        hit_self: bool,
    },
    PlayerHonk { player_id: PlayerId, duration: u8 },
    Pong,
    UndoPlayerDie { player_id: PlayerId },
    TeamLifeCount { current: u8, total: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub score: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOverStats {
    pub tiles: u32,
    pub kills: u16,
    pub highest_rank: u16,
    pub time_alive_secs: u32,
    pub ranking_first_secs: u32,
    pub death_type: DeathType,
    pub killer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("message type {tag} truncated: needed {needed} more bytes")]
    Truncated { tag: u8, needed: usize },
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },
}

/// Grid coordinate on the wire; coordinates never leave `0..=u16::MAX`
#[inline]
fn coord(v: i32) -> u16 {
    v.clamp(0, u16::MAX as i32) as u16
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(tag: u8, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 1);
        buf.push(tag);
        Self { buf }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn pos(&mut self, p: TilePos) -> &mut Self {
        self.u16(coord(p.x)).u16(coord(p.y))
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    tag: u8,
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < n {
            return Err(DecodeError::Truncated {
                tag: self.tag,
                needed: n - self.data.len(),
            });
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn pos(&mut self) -> Result<TilePos, DecodeError> {
        let x = self.u16()?;
        let y = self.u16()?;
        Ok(TilePos::new(x as i32, y as i32))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    fn rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.rest()).into_owned()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn split_tag(data: &[u8]) -> Result<Reader<'_>, DecodeError> {
    match data.split_first() {
        Some((tag, rest)) => Ok(Reader {
            tag: *tag,
            data: rest,
        }),
        None => Err(DecodeError::Empty),
    }
}

impl ClientMessage {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = split_tag(data)?;
        let message = match r.tag {
            client_tag::UPDATE_MY_POS => {
                let raw = r.u8()? as i8;
                let direction = u8::try_from(raw).ok().and_then(Direction::from_wire);
                ClientMessage::UpdateMyPos {
                    direction,
                    position: r.pos()?,
                }
            }
            client_tag::SET_USERNAME => ClientMessage::SetUsername(r.rest_string()),
            client_tag::SKIN => ClientMessage::Skin {
                color_id: r.u8()?,
                pattern_id: r.u8()?,
            },
            client_tag::READY => ClientMessage::Ready,
            client_tag::HONK => ClientMessage::Honk { duration: r.u8()? },
            client_tag::PING => ClientMessage::Ping,
            client_tag::REQUEST_MY_TRAIL => ClientMessage::RequestMyTrail,
            client_tag::VERSION => ClientMessage::Version {
                kind: r.u8()?,
                version: r.u16()?,
            },
            client_tag::PATREON_CODE => ClientMessage::PatreonCode(r.rest_string()),
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::UpdateMyPos {
                direction,
                position,
            } => {
                let dir = direction.map(Direction::to_wire).unwrap_or(u8::MAX);
                let mut w = Writer::new(client_tag::UPDATE_MY_POS, 5);
                w.u8(dir).pos(*position);
                w.finish()
            }
            ClientMessage::SetUsername(name) => {
                let mut w = Writer::new(client_tag::SET_USERNAME, name.len());
                w.bytes(name.as_bytes());
                w.finish()
            }
            ClientMessage::Skin {
                color_id,
                pattern_id,
            } => {
                let mut w = Writer::new(client_tag::SKIN, 2);
                w.u8(*color_id).u8(*pattern_id);
                w.finish()
            }
            ClientMessage::Ready => vec![client_tag::READY],
            ClientMessage::Honk { duration } => vec![client_tag::HONK, *duration],
            ClientMessage::Ping => vec![client_tag::PING],
            ClientMessage::RequestMyTrail => vec![client_tag::REQUEST_MY_TRAIL],
            ClientMessage::Version { kind, version } => {
                let mut w = Writer::new(client_tag::VERSION, 3);
                w.u8(*kind).u16(*version);
                w.finish()
            }
            ClientMessage::PatreonCode(code) => {
                let mut w = Writer::new(client_tag::PATREON_CODE, code.len());
                w.bytes(code.as_bytes());
                w.finish()
            }
        }
    }
}

impl ServerMessage {
    pub fn tag(&self) -> u8 {
        match self {
            ServerMessage::PlayerState { .. } => server_tag::PLAYER_STATE,
            ServerMessage::FillRect { .. } => server_tag::FILL_RECT,
            ServerMessage::SetPlayerTrail { .. } => server_tag::SET_PLAYER_TRAIL,
            ServerMessage::PlayerDie { .. } => server_tag::PLAYER_DIE,
            ServerMessage::ChunkOfBlocks { .. } => server_tag::CHUNK_OF_BLOCKS,
            ServerMessage::RemovePlayer { .. } => server_tag::REMOVE_PLAYER,
            ServerMessage::PlayerName { .. } => server_tag::PLAYER_NAME,
            ServerMessage::MyScore { .. } => server_tag::MY_SCORE,
            ServerMessage::MyRank { .. } => server_tag::MY_RANK,
            ServerMessage::Leaderboard { .. } => server_tag::LEADERBOARD,
            ServerMessage::MapSize { .. } => server_tag::MAP_SIZE,
            ServerMessage::GameOver(_) => server_tag::GAME_OVER,
            ServerMessage::Minimap { .. } => server_tag::MINIMAP,
            ServerMessage::PlayerSkin { .. } => server_tag::PLAYER_SKIN,
            ServerMessage::EmptyTrailWithLastPos { .. } => server_tag::EMPTY_TRAIL_WITH_LAST_POS,
            ServerMessage::Ready => server_tag::READY,
            ServerMessage::PlayerHitLine { .. } => server_tag::PLAYER_HIT_LINE,
            ServerMessage::PlayerHonk { .. } => server_tag::PLAYER_HONK,
            ServerMessage::Pong => server_tag::PONG,
            ServerMessage::UndoPlayerDie { .. } => server_tag::UNDO_PLAYER_DIE,
            ServerMessage::TeamLifeCount { .. } => server_tag::TEAM_LIFE_COUNT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(self.tag(), 16);
        match self {
            ServerMessage::PlayerState {
                position,
                player_id,
                direction,
                has_trail,
            } => {
                w.pos(*position)
                    .u16(*player_id)
                    .u8(direction.to_wire())
                    .u8(*has_trail as u8);
            }
            ServerMessage::FillRect {
                rect,
                tile_type,
                pattern_id,
                is_edge_chunk,
            } => {
                w.pos(rect.min)
                    .u16(coord(rect.width()))
                    .u16(coord(rect.height()))
                    .u8(*tile_type)
                    .u8(*pattern_id)
                    .u8(*is_edge_chunk as u8);
            }
            ServerMessage::SetPlayerTrail {
                player_id,
                vertices,
            } => {
                w.u16(*player_id);
                for v in vertices {
                    w.pos(*v);
                }
            }
            ServerMessage::PlayerDie {
                player_id,
                position,
            } => {
                w.u16(*player_id);
                if let Some(p) = position {
                    w.pos(*p);
                }
            }
            ServerMessage::ChunkOfBlocks { rect, tiles } => {
                debug_assert_eq!(tiles.len(), rect.area() as usize);
                w.pos(rect.min)
                    .u16(coord(rect.width()))
                    .u16(coord(rect.height()))
                    .bytes(tiles);
            }
            ServerMessage::RemovePlayer { player_id }
            | ServerMessage::UndoPlayerDie { player_id } => {
                w.u16(*player_id);
            }
            ServerMessage::PlayerName { player_id, name } => {
                w.u16(*player_id).bytes(name.as_bytes());
            }
            ServerMessage::MyScore { tiles, kills } => {
                w.u32(*tiles).u16(*kills);
            }
            ServerMessage::MyRank { rank } => {
                w.u16(*rank);
            }
            ServerMessage::Leaderboard {
                total_players,
                entries,
            } => {
                w.u16(*total_players);
                for entry in entries {
                    let name = truncate_utf8(&entry.name, u8::MAX as usize);
                    w.u32(entry.score).u8(name.len() as u8).bytes(name.as_bytes());
                }
            }
            ServerMessage::MapSize { size } => {
                w.u16(*size);
            }
            ServerMessage::GameOver(stats) => {
                w.u32(stats.tiles)
                    .u16(stats.kills)
                    .u16(stats.highest_rank)
                    .u32(stats.time_alive_secs)
                    .u32(stats.ranking_first_secs)
                    .u8(stats.death_type.to_wire())
                    .bytes(stats.killer_name.as_bytes());
            }
            ServerMessage::Minimap { part, bits } => {
                w.u8(*part).bytes(bits);
            }
            ServerMessage::PlayerSkin {
                player_id,
                color_id,
            } => {
                w.u16(*player_id).u8(*color_id);
            }
            ServerMessage::EmptyTrailWithLastPos {
                player_id,
                position,
            } => {
                w.u16(*player_id).pos(*position);
            }
            ServerMessage::Ready | ServerMessage::Pong => {}
            ServerMessage::PlayerHitLine {
                by_player_id,
                color_id,
                position,
                hit_self,
            } => {
                w.u16(*by_player_id)
                    .u8(*color_id)
                    .pos(*position)
                    .u8(*hit_self as u8);
            }
            ServerMessage::PlayerHonk {
                player_id,
                duration,
            } => {
                w.u16(*player_id).u8(*duration);
            }
            ServerMessage::TeamLifeCount { current, total } => {
                w.u8(*current).u8(*total);
            }
        }
        w.finish()
    }

    /// Parse a server message; used by tooling and tests acting as a client
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = split_tag(data)?;
        let message = match r.tag {
            server_tag::PLAYER_STATE => {
                let position = r.pos()?;
                let player_id = r.u16()?;
                let dir = r.u8()?;
                let direction = Direction::from_wire(dir).ok_or(DecodeError::InvalidValue {
                    field: "direction",
                    value: dir,
                })?;
                ServerMessage::PlayerState {
                    position,
                    player_id,
                    direction,
                    has_trail: r.u8()? != 0,
                }
            }
            server_tag::FILL_RECT => ServerMessage::FillRect {
                rect: read_rect(&mut r)?,
                tile_type: r.u8()?,
                pattern_id: r.u8()?,
                is_edge_chunk: r.u8()? != 0,
            },
            server_tag::SET_PLAYER_TRAIL => {
                let player_id = r.u16()?;
                let mut vertices = Vec::new();
                while !r.is_empty() {
                    vertices.push(r.pos()?);
                }
                ServerMessage::SetPlayerTrail {
                    player_id,
                    vertices,
                }
            }
            server_tag::PLAYER_DIE => {
                let player_id = r.u16()?;
                let position = if r.is_empty() { None } else { Some(r.pos()?) };
                ServerMessage::PlayerDie {
                    player_id,
                    position,
                }
            }
            server_tag::CHUNK_OF_BLOCKS => {
                let rect = read_rect(&mut r)?;
                let tiles = r.take(rect.area() as usize)?.to_vec();
                ServerMessage::ChunkOfBlocks { rect, tiles }
            }
            server_tag::REMOVE_PLAYER => ServerMessage::RemovePlayer {
                player_id: r.u16()?,
            },
            server_tag::PLAYER_NAME => ServerMessage::PlayerName {
                player_id: r.u16()?,
                name: r.rest_string(),
            },
            server_tag::MY_SCORE => ServerMessage::MyScore {
                tiles: r.u32()?,
                kills: r.u16()?,
            },
            server_tag::MY_RANK => ServerMessage::MyRank { rank: r.u16()? },
            server_tag::LEADERBOARD => {
                let total_players = r.u16()?;
                let mut entries = Vec::new();
                while !r.is_empty() {
                    let score = r.u32()?;
                    let len = r.u8()? as usize;
                    let name = String::from_utf8_lossy(r.take(len)?).into_owned();
                    entries.push(LeaderboardEntry { score, name });
                }
                ServerMessage::Leaderboard {
                    total_players,
                    entries,
                }
            }
            server_tag::MAP_SIZE => ServerMessage::MapSize { size: r.u16()? },
            server_tag::GAME_OVER => {
                let tiles = r.u32()?;
                let kills = r.u16()?;
                let highest_rank = r.u16()?;
                let time_alive_secs = r.u32()?;
                let ranking_first_secs = r.u32()?;
                let raw = r.u8()?;
                let death_type = match raw {
                    0 => DeathType::None,
                    1 => DeathType::Player,
                    2 => DeathType::Bounds,
                    3 => DeathType::SelfHit,
                    value => {
                        return Err(DecodeError::InvalidValue {
                            field: "death type",
                            value,
                        })
                    }
                };
                ServerMessage::GameOver(GameOverStats {
                    tiles,
                    kills,
                    highest_rank,
                    time_alive_secs,
                    ranking_first_secs,
                    death_type,
                    killer_name: r.rest_string(),
                })
            }
            server_tag::MINIMAP => ServerMessage::Minimap {
                part: r.u8()?,
                bits: r.rest().to_vec(),
            },
            server_tag::PLAYER_SKIN => ServerMessage::PlayerSkin {
                player_id: r.u16()?,
                color_id: r.u8()?,
            },
            server_tag::EMPTY_TRAIL_WITH_LAST_POS => ServerMessage::EmptyTrailWithLastPos {
                player_id: r.u16()?,
                position: r.pos()?,
            },
            server_tag::READY => ServerMessage::Ready,
            server_tag::PLAYER_HIT_LINE => ServerMessage::PlayerHitLine {
                by_player_id: r.u16()?,
                color_id: r.u8()?,
                position: r.pos()?,
                hit_self: r.u8()? != 0,
            },
            server_tag::PLAYER_HONK => ServerMessage::PlayerHonk {
                player_id: r.u16()?,
                duration: r.u8()?,
            },
            server_tag::PONG => ServerMessage::Pong,
            server_tag::UNDO_PLAYER_DIE => ServerMessage::UndoPlayerDie {
                player_id: r.u16()?,
            },
            server_tag::TEAM_LIFE_COUNT => ServerMessage::TeamLifeCount {
                current: r.u8()?,
                total: r.u8()?,
            },
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }
}

fn read_rect(r: &mut Reader<'_>) -> Result<Rect, DecodeError> {
    let min = r.pos()?;
    let w = r.u16()? as i32;
    let h = r.u16()? as i32;
    Ok(Rect::new(min.x, min.y, min.x + w, min.y + h))
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_state_bytes() {
        let msg = ServerMessage::PlayerState {
            position: TilePos::new(300, 5),
            player_id: 0x0102,
            direction: Direction::Up,
            has_trail: true,
        };
        assert_eq!(msg.encode(), vec![2, 0x01, 0x2C, 0x00, 0x05, 0x01, 0x02, 3, 1]);
    }

    #[test]
    fn test_player_state_round_trip_at_coordinate_limits() {
        for position in [TilePos::new(0, 0), TilePos::new(65535, 65535)] {
            for value in 0..5u8 {
                let direction = Direction::from_wire(value).unwrap();
                for has_trail in [false, true] {
                    let msg = ServerMessage::PlayerState {
                        position,
                        player_id: 65535,
                        direction,
                        has_trail,
                    };
                    let bytes = msg.encode();
                    assert_eq!(bytes.len(), 9);
                    assert_eq!(bytes[7], value);
                    assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
                }
            }
        }
    }

    #[test]
    fn test_fill_rect_bytes() {
        let msg = ServerMessage::FillRect {
            rect: Rect::new(10, 20, 15, 22),
            tile_type: 4,
            pattern_id: 7,
            is_edge_chunk: false,
        };
        assert_eq!(msg.encode(), vec![3, 0, 10, 0, 20, 0, 5, 0, 2, 4, 7, 0]);
    }

    #[test]
    fn test_game_over_bytes() {
        let msg = ServerMessage::GameOver(GameOverStats {
            tiles: 1000,
            kills: 2,
            highest_rank: 1,
            time_alive_secs: 65,
            ranking_first_secs: 9,
            death_type: DeathType::Player,
            killer_name: "Zed".to_string(),
        });
        let bytes = msg.encode();
        assert_eq!(bytes[0], server_tag::GAME_OVER);
        assert_eq!(&bytes[1..5], &1000u32.to_be_bytes());
        assert_eq!(&bytes[5..7], &[0, 2]);
        assert_eq!(&bytes[7..9], &[0, 1]);
        assert_eq!(&bytes[9..13], &65u32.to_be_bytes());
        assert_eq!(&bytes[13..17], &9u32.to_be_bytes());
        assert_eq!(bytes[17], 1);
        assert_eq!(&bytes[18..], b"Zed");
    }

    #[test]
    fn test_payloadless_messages() {
        assert_eq!(ServerMessage::Ready.encode(), vec![17]);
        assert_eq!(ServerMessage::Pong.encode(), vec![21]);
    }

    #[test]
    fn test_player_die_optional_position() {
        let without = ServerMessage::PlayerDie {
            player_id: 9,
            position: None,
        };
        assert_eq!(without.encode(), vec![5, 0, 9]);
        let with = ServerMessage::PlayerDie {
            player_id: 9,
            position: Some(TilePos::new(1, 2)),
        };
        assert_eq!(with.encode(), vec![5, 0, 9, 0, 1, 0, 2]);
        assert_eq!(ServerMessage::decode(&with.encode()).unwrap(), with);
        assert_eq!(ServerMessage::decode(&without.encode()).unwrap(), without);
    }

    #[test]
    fn test_leaderboard_names_are_length_prefixed() {
        let msg = ServerMessage::Leaderboard {
            total_players: 3,
            entries: vec![
                LeaderboardEntry {
                    score: 50,
                    name: "ab".to_string(),
                },
                LeaderboardEntry {
                    score: 7,
                    name: String::new(),
                },
            ],
        };
        let bytes = msg.encode();
        assert_eq!(bytes, vec![11, 0, 3, 0, 0, 0, 50, 2, b'a', b'b', 0, 0, 0, 7, 0]);
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_server_messages_decode_back() {
        let messages = vec![
            ServerMessage::SetPlayerTrail {
                player_id: 0,
                vertices: vec![TilePos::new(1, 1), TilePos::new(1, 9), TilePos::new(4, 9)],
            },
            ServerMessage::ChunkOfBlocks {
                rect: Rect::new(2, 3, 4, 6),
                tiles: vec![0, 1, 2, 3, 4, 5],
            },
            ServerMessage::PlayerName {
                player_id: 12,
                name: "Ünïcode".to_string(),
            },
            ServerMessage::Minimap {
                part: 2,
                bits: vec![0b1000_0001, 0xFF],
            },
            ServerMessage::PlayerHitLine {
                by_player_id: 3,
                color_id: 5,
                position: TilePos::new(40, 41),
                hit_self: true,
            },
            ServerMessage::EmptyTrailWithLastPos {
                player_id: 0,
                position: TilePos::new(7, 8),
            },
            ServerMessage::TeamLifeCount {
                current: 1,
                total: 3,
            },
        ];
        for msg in messages {
            assert_eq!(ServerMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_update_my_pos() {
        let bytes = [1, 2, 0x01, 0x00, 0x00, 0x20];
        assert_eq!(
            ClientMessage::decode(&bytes).unwrap(),
            ClientMessage::UpdateMyPos {
                direction: Some(Direction::Left),
                position: TilePos::new(256, 32),
            }
        );
    }

    #[test]
    fn test_unknown_direction_decodes_as_none() {
        let bytes = [1, 0xFF, 0, 1, 0, 1];
        match ClientMessage::decode(&bytes).unwrap() {
            ClientMessage::UpdateMyPos { direction, .. } => assert!(direction.is_none()),
            other => panic!("unexpected {:?}", other),
        }
        let bytes = [1, 9, 0, 1, 0, 1];
        assert!(matches!(
            ClientMessage::decode(&bytes).unwrap(),
            ClientMessage::UpdateMyPos { direction: None, .. }
        ));
    }

    #[test]
    fn test_decode_client_messages() {
        assert_eq!(ClientMessage::decode(&[4]).unwrap(), ClientMessage::Ready);
        assert_eq!(ClientMessage::decode(&[7]).unwrap(), ClientMessage::Ping);
        assert_eq!(ClientMessage::decode(&[8]).unwrap(), ClientMessage::RequestMyTrail);
        assert_eq!(
            ClientMessage::decode(&[6, 30]).unwrap(),
            ClientMessage::Honk { duration: 30 }
        );
        assert_eq!(
            ClientMessage::decode(&[3, 5, 2]).unwrap(),
            ClientMessage::Skin {
                color_id: 5,
                pattern_id: 2
            }
        );
        assert_eq!(
            ClientMessage::decode(&[11, 0, 0, 28]).unwrap(),
            ClientMessage::Version {
                kind: 0,
                version: 28
            }
        );
        assert_eq!(
            ClientMessage::decode(b"\x02Alice").unwrap(),
            ClientMessage::SetUsername("Alice".to_string())
        );
    }

    #[test]
    fn test_client_encode_matches_decode() {
        let messages = vec![
            ClientMessage::UpdateMyPos {
                direction: Some(Direction::Paused),
                position: TilePos::new(3, 4),
            },
            ClientMessage::SetUsername("Bob".to_string()),
            ClientMessage::PatreonCode("code".to_string()),
            ClientMessage::Honk { duration: 70 },
        ];
        for msg in messages {
            assert_eq!(ClientMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(ClientMessage::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(ClientMessage::decode(&[99]), Err(DecodeError::UnknownType(99)));
        assert_eq!(
            ClientMessage::decode(&[1, 0, 0]),
            Err(DecodeError::Truncated { tag: 1, needed: 1 })
        );
        assert!(matches!(
            ClientMessage::decode(&[3, 1]),
            Err(DecodeError::Truncated { tag: 3, .. })
        ));
        assert!(matches!(
            ServerMessage::decode(&[2, 0, 0, 0, 0, 0, 1, 9, 0]),
            Err(DecodeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_coordinates_clamp_to_u16() {
        let msg = ServerMessage::EmptyTrailWithLastPos {
            player_id: 1,
            position: TilePos::new(-4, 70000),
        };
        assert_eq!(msg.encode(), vec![16, 0, 1, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn test_truncate_utf8_boundary() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }
}
