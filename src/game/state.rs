//! Game coordinator
//!
//! Owns players and connections, runs the per-tick movement simulation and
//! fans every change out to the players whose viewport it touches. Grid
//! writes go to the arena worker; the coordinator keeps a read-only mirror
//! that changes only through worker notifications.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::ArenaConfig;
use crate::game::capture::{ArenaState, TileChanges};
use crate::game::constants::{broadcast, honk, ids, net, player as player_consts, skin, tile};
use crate::game::grid::{TileGrid, TileValue};
use crate::game::input_buffer::{ConnectionEvent, EventBuffer, EventSender};
use crate::game::player::{fallback_skin, ConnectionId, DeathType, Direction, Player, PlayerId};
use crate::game::score::{death_type_name, rank_players, ScoreReport, ScoreSink};
use crate::game::worker::{ArenaWorker, RequestId, WorkerError, WorkerOutput, WorkerRequest, WorkerResponse};
use crate::metrics::Metrics;
use crate::net::connection::{sanitize_name, Connection, ConnectionState};
use crate::net::protocol::{ClientMessage, GameOverStats, LeaderboardEntry, ServerMessage};
use crate::util::rect::{Rect, TilePos};

/// Skin and tile count of an id that owns (or may own) tiles
#[derive(Debug, Clone)]
struct OwnerInfo {
    skin_id: u8,
    pattern_id: u8,
    tiles: u32,
    /// A player with this id is in the arena
    live: bool,
    /// A release or clear request for this id is still in flight
    releasing: bool,
}

/// What to do when a worker response arrives
#[derive(Debug, Clone, Copy)]
enum Pending {
    Spawn { player_id: PlayerId },
    Trail { player_id: PlayerId },
    Capture { player_id: PlayerId },
    Release { player_id: PlayerId },
    Minimap,
}

#[derive(Debug, Clone, Copy)]
struct Death {
    victim: PlayerId,
    death_type: DeathType,
    killer: Option<PlayerId>,
    position: TilePos,
}

/// Per-tick copy of what viewers need to announce another player
struct PlayerSnapshot {
    id: PlayerId,
    position: TilePos,
    direction: Direction,
    trail: Vec<TilePos>,
    skin_id: u8,
    name: String,
}

#[inline]
fn wire_id(viewer: PlayerId, id: PlayerId) -> PlayerId {
    if viewer == id {
        ids::SELF_ID
    } else {
        id
    }
}

/// Wire color of `owner` as seen by `viewer`
fn color_for(owners: &FxHashMap<PlayerId, OwnerInfo>, viewer: &Player, owner: PlayerId) -> u8 {
    let owner_skin = owners
        .get(&owner)
        .map(|o| o.skin_id)
        .unwrap_or_else(|| fallback_skin(owner));
    viewer.skin_id_for_player(owner, owner_skin)
}

fn tile_type_for(owners: &FxHashMap<PlayerId, OwnerInfo>, viewer: &Player, value: TileValue) -> (u8, u8) {
    match value {
        tile::BORDER => (skin::TILE_TYPE_BORDER, 0),
        v if v <= tile::EMPTY => (skin::TILE_TYPE_EMPTY, 0),
        v => {
            let owner = v as PlayerId;
            let pattern = owners.get(&owner).map(|o| o.pattern_id).unwrap_or(0);
            (color_for(owners, viewer, owner) + skin::TILE_TYPE_SKIN_OFFSET, pattern)
        }
    }
}

/// Row-major wire tile types of `rect`
fn chunk_tiles(grid: &TileGrid, owners: &FxHashMap<PlayerId, OwnerInfo>, viewer: &Player, rect: Rect) -> Vec<u8> {
    let mut tiles = Vec::with_capacity(rect.area() as usize);
    for y in rect.min.y..rect.max.y {
        for x in rect.min.x..rect.max.x {
            tiles.push(tile_type_for(owners, viewer, grid.get(x, y)).0);
        }
    }
    tiles
}

fn deliver(
    connections: &mut FxHashMap<ConnectionId, Connection>,
    metrics: &Metrics,
    connection_id: ConnectionId,
    message: &ServerMessage,
) {
    if let Some(conn) = connections.get_mut(&connection_id) {
        let sent = conn.send(message);
        if sent > 0 {
            metrics.record_sent(sent);
        }
    }
}

/// Send a per-viewer message to each of `viewers`; `build` may skip a viewer
fn broadcast<F>(
    players: &FxHashMap<PlayerId, Player>,
    connections: &mut FxHashMap<ConnectionId, Connection>,
    metrics: &Metrics,
    viewers: &[PlayerId],
    mut build: F,
) where
    F: FnMut(&Player) -> Option<ServerMessage>,
{
    for viewer_id in viewers {
        let Some(viewer) = players.get(viewer_id) else {
            continue;
        };
        if let Some(message) = build(viewer) {
            deliver(connections, metrics, viewer.connection_id(), &message);
        }
    }
}

pub struct GameState {
    config: ArenaConfig,
    worker: ArenaWorker,
    worker_lost: bool,
    /// Mirror of the worker's grid
    grid: TileGrid,
    players: FxHashMap<PlayerId, Player>,
    connections: FxHashMap<ConnectionId, Connection>,
    owners: FxHashMap<PlayerId, OwnerInfo>,
    pending: FxHashMap<RequestId, Pending>,
    events: EventBuffer,
    score_sink: Box<dyn ScoreSink>,
    metrics: Arc<Metrics>,
    rng: StdRng,
    next_player_id: PlayerId,
    deaths: Vec<Death>,
    leaderboard_timer: f32,
    minimap_timer: f32,
    next_minimap_part: u8,
    now: Instant,
}

impl GameState {
    pub fn new(config: ArenaConfig, score_sink: Box<dyn ScoreSink>, metrics: Arc<Metrics>) -> Result<Self, WorkerError> {
        let arena = ArenaState::new(config.size, config.size).with_spawn_radius(config.spawn_radius);
        let grid = arena.grid().clone();
        let worker = ArenaWorker::spawn(arena)?;

        info!("Arena {}x{} ready", config.size, config.size);

        Ok(Self {
            config,
            worker,
            worker_lost: false,
            grid,
            players: FxHashMap::default(),
            connections: FxHashMap::default(),
            owners: FxHashMap::default(),
            pending: FxHashMap::default(),
            events: EventBuffer::new(net::EVENT_BUFFER_SIZE),
            score_sink,
            metrics,
            rng: StdRng::from_entropy(),
            next_player_id: 1,
            deaths: Vec::new(),
            leaderboard_timer: 0.0,
            minimap_timer: 0.0,
            next_minimap_part: 0,
            now: Instant::now(),
        })
    }

    /// Sender handle for connection tasks
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Coordinator's mirror of the grid
    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&connection_id).map(|c| c.state)
    }

    pub fn player_for_connection(&self, connection_id: ConnectionId) -> Option<PlayerId> {
        self.connections.get(&connection_id).and_then(|c| c.player_id)
    }

    /// Exact number of tiles owned by `id`
    pub fn tile_count(&self, id: PlayerId) -> u32 {
        self.owners.get(&id).map(|o| o.tiles).unwrap_or(0)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Connection events waiting for the next tick
    pub fn pending_events(&self) -> usize {
        self.events.pending_count()
    }

    // === Tick ===

    /// Advance the simulation by `dt` seconds
    pub fn tick(&mut self, now: Instant, dt: f32) -> Result<(), WorkerError> {
        self.now = now;

        let outputs = self.worker.drain().map_err(|e| {
            error!("Lost arena worker: {}", e);
            e
        })?;
        for output in outputs {
            self.handle_worker_output(output);
        }

        for event in self.events.drain() {
            self.handle_event(event);
        }

        self.update_players(dt);
        self.resolve_deaths();
        self.update_viewports();
        self.send_scores();

        self.leaderboard_timer += dt;
        if self.leaderboard_timer >= self.config.leaderboard_interval {
            self.leaderboard_timer -= self.config.leaderboard_interval;
            self.broadcast_leaderboard(self.config.leaderboard_interval);
        }

        self.minimap_timer += dt;
        if self.minimap_timer >= self.config.minimap_interval {
            self.minimap_timer -= self.config.minimap_interval;
            self.request_minimap();
        }

        self.close_stale_connections();

        self.metrics.players.store(self.players.len() as u64, Ordering::Relaxed);
        self.metrics
            .connections_active
            .store(self.connections.len() as u64, Ordering::Relaxed);
        self.metrics
            .worker_requests_in_flight
            .store(self.pending.len() as u64, Ordering::Relaxed);

        if self.worker_lost {
            error!("Arena worker stopped accepting requests");
            return Err(WorkerError::Disconnected);
        }
        Ok(())
    }

    /// Block until every in-flight worker request is answered, up to
    /// `timeout`. Returns false on timeout.
    pub fn wait_for_worker(&mut self, timeout: Duration) -> Result<bool, WorkerError> {
        let deadline = Instant::now() + timeout;
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.worker.recv_timeout(remaining)? {
                Some(output) => self.handle_worker_output(output),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    // === Worker plumbing ===

    fn worker_send(&mut self, request: WorkerRequest, pending: Pending) {
        match self.worker.send(request) {
            Ok(id) => {
                self.pending.insert(id, pending);
            }
            Err(e) => {
                error!("Failed to reach arena worker: {}", e);
                self.worker_lost = true;
            }
        }
    }

    fn handle_worker_output(&mut self, output: WorkerOutput) {
        match output {
            WorkerOutput::TilesChanged(changes) => self.apply_tile_changes(changes),
            WorkerOutput::Response { id, response } => {
                let Some(pending) = self.pending.remove(&id) else {
                    warn!("Worker response {} has no pending request", id);
                    return;
                };
                match (pending, response) {
                    (Pending::Spawn { player_id }, WorkerResponse::SpawnFilled { rect }) => {
                        self.finish_spawn(player_id, rect);
                    }
                    (Pending::Trail { .. }, WorkerResponse::TrailFilled) => {}
                    (Pending::Capture { player_id }, WorkerResponse::CaptureResolved(result)) => {
                        self.metrics.record_capture(result.filled_tiles);
                        if result.filled_tiles > 0 {
                            debug!(
                                "Player {} captured {} tiles in {} rects",
                                player_id,
                                result.filled_tiles,
                                result.filled.len()
                            );
                        }
                    }
                    (
                        Pending::Release { player_id },
                        WorkerResponse::TilesCleared { .. } | WorkerResponse::PlayerReleased,
                    ) => {
                        if let Some(owner) = self.owners.get_mut(&player_id) {
                            owner.releasing = false;
                        }
                        self.forget_owner_if_unused(player_id);
                    }
                    (Pending::Minimap, WorkerResponse::MinimapPart { part, bits }) => {
                        self.broadcast_minimap(part, bits);
                    }
                    (pending, response) => {
                        warn!("Unexpected worker response {:?} for {:?}", response, pending);
                    }
                }
            }
        }
    }

    fn apply_tile_changes(&mut self, changes: TileChanges) {
        for fill in &changes.fills {
            self.grid.fill_rect(fill.rect, fill.value);
        }

        for (id, delta) in &changes.owner_deltas {
            match self.owners.get_mut(id) {
                Some(owner) => {
                    let tiles = (owner.tiles as i64 + delta).clamp(0, u32::MAX as i64);
                    owner.tiles = tiles as u32;
                }
                None => debug!("Tile delta {} for untracked id {}", delta, id),
            }
        }
        for (id, _) in &changes.owner_deltas {
            self.forget_owner_if_unused(*id);
        }

        for fill in &changes.fills {
            let viewers = self.get_overlapping_viewport_players_for_rect(fill.rect);
            let owners = &self.owners;
            broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
                let (tile_type, pattern_id) = tile_type_for(owners, viewer, fill.value);
                Some(ServerMessage::FillRect {
                    rect: fill.rect,
                    tile_type,
                    pattern_id,
                    is_edge_chunk: fill.value == tile::BORDER,
                })
            });
        }
    }

    /// Drop the owner record once an id has no player, no tiles and no
    /// request in flight, making the id reusable.
    fn forget_owner_if_unused(&mut self, id: PlayerId) {
        let unused = self
            .owners
            .get(&id)
            .map(|o| !o.live && !o.releasing && o.tiles == 0)
            .unwrap_or(false);
        if unused {
            self.owners.remove(&id);
        }
    }

    // === Connection events ===

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened {
                connection_id,
                outbox,
            } => {
                debug!("Connection {} opened", connection_id);
                self.connections
                    .insert(connection_id, Connection::new(connection_id, outbox, self.now));
            }
            ConnectionEvent::Message {
                connection_id,
                payload,
            } => self.handle_message(connection_id, &payload),
            ConnectionEvent::Closed { connection_id } => {
                self.close_connection(connection_id, "closed by peer");
            }
        }
    }

    fn handle_message(&mut self, connection_id: ConnectionId, payload: &[u8]) {
        let Some(conn) = self.connections.get_mut(&connection_id) else {
            debug!("Message for unknown connection {}", connection_id);
            return;
        };
        conn.record_received(payload.len());
        self.metrics.record_received(payload.len());

        let message = match ClientMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Connection {}: dropping malformed message: {}", connection_id, e);
                return;
            }
        };

        match message {
            ClientMessage::UpdateMyPos {
                direction: Some(direction),
                position,
            } => {
                if let Some(player) = self.playing_player_mut(connection_id) {
                    player.queue_move(direction, position);
                }
            }
            ClientMessage::UpdateMyPos { direction: None, .. } => {
                debug!("Connection {}: ignoring unknown direction", connection_id);
            }
            ClientMessage::SetUsername(name) => {
                if conn.accepts_options() {
                    conn.options.name = sanitize_name(&name, net::MAX_NAME_LENGTH);
                }
            }
            ClientMessage::Skin {
                color_id,
                pattern_id,
            } => {
                if conn.accepts_options() {
                    conn.options.skin_id = (1..=skin::COUNT).contains(&color_id).then_some(color_id);
                    conn.options.pattern_id = if pattern_id < skin::PATTERN_COUNT {
                        pattern_id
                    } else {
                        0
                    };
                }
            }
            ClientMessage::Ready => {
                if conn.state == ConnectionState::Lobby {
                    self.create_player(connection_id);
                }
            }
            ClientMessage::Honk { duration } => self.honk(connection_id, duration),
            ClientMessage::Ping => {
                conn.touch(self.now);
                deliver(&mut self.connections, &self.metrics, connection_id, &ServerMessage::Pong);
            }
            ClientMessage::RequestMyTrail => {
                if let Some(player) = conn.player_id.and_then(|id| self.players.get(&id)) {
                    let message = ServerMessage::SetPlayerTrail {
                        player_id: ids::SELF_ID,
                        vertices: player.trail().to_vec(),
                    };
                    deliver(&mut self.connections, &self.metrics, connection_id, &message);
                }
            }
            ClientMessage::Version { kind, version } => {
                debug!("Connection {}: client type {} version {}", connection_id, kind, version);
            }
            ClientMessage::PatreonCode(_) => {
                debug!("Connection {}: ignoring supporter code", connection_id);
            }
        }
    }

    fn playing_player_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Player> {
        let conn = self.connections.get(&connection_id)?;
        if conn.state != ConnectionState::Playing {
            return None;
        }
        let id = conn.player_id?;
        self.players.get_mut(&id)
    }

    fn close_connection(&mut self, connection_id: ConnectionId, reason: &str) {
        let Some(conn) = self.connections.remove(&connection_id) else {
            return;
        };
        if let Some(player_id) = conn.player_id {
            self.remove_player(player_id);
        }
        info!(
            "Connection {} closed ({}), sent {} bytes, received {} bytes",
            connection_id, reason, conn.bytes_sent, conn.bytes_received
        );
    }

    /// Close connections that stopped pinging or stopped reading
    fn close_stale_connections(&mut self) {
        let now = self.now;
        let timeout = self.config.idle_timeout;
        let stale: Vec<(ConnectionId, &'static str)> = self
            .connections
            .values()
            .filter_map(|c| {
                if c.is_lagging() {
                    Some((c.id, "outbox full"))
                } else if c.is_idle(now, timeout) {
                    Some((c.id, "idle timeout"))
                } else {
                    None
                }
            })
            .collect();
        for (connection_id, reason) in stale {
            self.close_connection(connection_id, reason);
        }
    }

    // === Player lifecycle ===

    /// Create a player for a connection and request its spawn square.
    /// The player stays inactive until the worker confirms the spawn.
    pub fn create_player(&mut self, connection_id: ConnectionId) -> Option<PlayerId> {
        self.create_player_at(connection_id, None)
    }

    fn create_player_at(&mut self, connection_id: ConnectionId, position: Option<TilePos>) -> Option<PlayerId> {
        let options = self.connections.get(&connection_id)?.options.clone();
        let Some(player_id) = self.allocate_player_id() else {
            warn!("No free player id for connection {}", connection_id);
            return None;
        };
        let skin_id = options
            .skin_id
            .unwrap_or_else(|| self.rng.gen_range(1..=skin::COUNT));
        let position = position.unwrap_or_else(|| self.pick_spawn_position());

        let player = Player::new(
            player_id,
            connection_id,
            options.name.clone(),
            skin_id,
            options.pattern_id,
            position,
            self.now,
        );
        self.players.insert(player_id, player);
        self.owners.insert(
            player_id,
            OwnerInfo {
                skin_id,
                pattern_id: options.pattern_id,
                tiles: 0,
                live: true,
                releasing: false,
            },
        );
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.player_id = Some(player_id);
            conn.state = ConnectionState::Joining;
        }

        self.worker_send(
            WorkerRequest::FillPlayerSpawn {
                position,
                player_id,
            },
            Pending::Spawn { player_id },
        );

        info!(
            "Player {} ('{}') joining at ({}, {})",
            player_id, options.name, position.x, position.y
        );
        Some(player_id)
    }

    /// Cycle through 1..=MAX_ID, skipping ids in use or still owning tiles
    fn allocate_player_id(&mut self) -> Option<PlayerId> {
        for _ in 0..ids::MAX_ID {
            let candidate = self.next_player_id;
            self.next_player_id = if candidate == ids::MAX_ID { 1 } else { candidate + 1 };
            if !self.owners.contains_key(&candidate) && !self.players.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Random position whose spawn square is unclaimed in the mirror, or the
    /// last candidate when none is found.
    fn pick_spawn_position(&mut self) -> TilePos {
        let radius = self.config.spawn_radius;
        let min = player_consts::SPAWN_MARGIN + radius;
        let max = (self.config.size - 1 - min).max(min);
        let mut candidate = TilePos::new(self.config.size / 2, self.config.size / 2);
        for _ in 0..player_consts::SPAWN_ATTEMPTS {
            candidate = TilePos::new(self.rng.gen_range(min..=max), self.rng.gen_range(min..=max));
            let square = Rect::around(candidate, radius);
            let free = self.grid.count_in(square, tile::EMPTY) == square.area();
            let on_trail = self.players.values().any(|p| p.trail_contains(candidate, false));
            if free && !on_trail {
                return candidate;
            }
        }
        candidate
    }

    fn finish_spawn(&mut self, player_id: PlayerId, rect: Rect) {
        let view_size = self.config.viewport_size;
        let map_size = self.config.size;
        let bounds = self.grid.bounds();
        let tiles = self.tile_count(player_id);

        let Some(player) = self.players.get_mut(&player_id) else {
            debug!("Spawn confirmed for departed player {}", player_id);
            return;
        };
        player.mark_spawned();
        let viewport = player.viewport(view_size).clamp(&bounds);
        player.set_sent_viewport(viewport);
        player.reported_score = Some((tiles, player.kills));

        let player = &self.players[&player_id];
        let connection_id = player.connection_id();
        let messages = [
            ServerMessage::MapSize {
                size: map_size.clamp(0, u16::MAX as i32) as u16,
            },
            ServerMessage::ChunkOfBlocks {
                rect: viewport,
                tiles: chunk_tiles(&self.grid, &self.owners, player, viewport),
            },
            ServerMessage::PlayerSkin {
                player_id: ids::SELF_ID,
                color_id: player.skin_id() - 1,
            },
            ServerMessage::PlayerState {
                position: player.position(),
                player_id: ids::SELF_ID,
                direction: player.direction(),
                has_trail: false,
            },
            ServerMessage::Ready,
            ServerMessage::MyScore {
                tiles,
                kills: player.kills.min(u16::MAX as u32) as u16,
            },
        ];
        for message in &messages {
            deliver(&mut self.connections, &self.metrics, connection_id, message);
        }
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.state = ConnectionState::Playing;
        }

        debug!("Player {} spawned in {:?}", player_id, rect);
    }

    /// Unregister a player. Its territory stays on the grid.
    pub fn remove_player(&mut self, player_id: PlayerId) {
        self.remove_player_with(player_id, false, true);
    }

    fn remove_player_with(&mut self, player_id: PlayerId, clear_tiles: bool, announce: bool) {
        let Some(player) = self.players.remove(&player_id) else {
            return;
        };

        for other in self.players.values_mut() {
            let knew = other.knows(player_id);
            other.forget(player_id);
            if knew && announce {
                deliver(
                    &mut self.connections,
                    &self.metrics,
                    other.connection_id(),
                    &ServerMessage::RemovePlayer { player_id },
                );
            }
        }

        if let Some(owner) = self.owners.get_mut(&player_id) {
            owner.live = false;
            owner.releasing = true;
        }
        let request = if clear_tiles {
            WorkerRequest::ClearAllPlayerTiles { player_id }
        } else {
            WorkerRequest::ReleasePlayer { player_id }
        };
        self.worker_send(request, Pending::Release { player_id });

        if let Some(conn) = self.connections.get_mut(&player.connection_id()) {
            if conn.player_id == Some(player_id) {
                conn.player_id = None;
            }
        }
        info!("Player {} ('{}') left the arena", player_id, player.name());
    }

    // === Spatial queries ===

    /// Active players whose viewport intersects `rect`
    pub fn get_overlapping_viewport_players_for_rect(&self, rect: Rect) -> Vec<PlayerId> {
        let size = self.config.viewport_size;
        self.players
            .values()
            .filter(|p| p.is_spawned() && p.viewport(size).overlaps(&rect))
            .map(|p| p.id())
            .collect()
    }

    /// Active players whose viewport contains `pos`
    pub fn get_overlapping_viewport_players_for_pos(&self, pos: TilePos) -> Vec<PlayerId> {
        let size = self.config.viewport_size;
        self.players
            .values()
            .filter(|p| p.is_spawned() && p.in_viewport(size, pos))
            .map(|p| p.id())
            .collect()
    }

    /// Wire `(tile type, pattern)` of a raw tile value for `viewer`
    pub fn get_tile_type_for_message(&self, viewer: &Player, value: TileValue) -> (u8, u8) {
        tile_type_for(&self.owners, viewer, value)
    }

    // === Movement ===

    fn is_dying(&self, id: PlayerId) -> bool {
        self.deaths.iter().any(|d| d.victim == id)
    }

    fn spawned_ids(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.is_spawned())
            .map(|p| p.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn update_players(&mut self, dt: f32) {
        let speed = self.config.travel_speed;
        for id in self.spawned_ids() {
            if self.is_dying(id) {
                continue;
            }
            self.apply_queued_moves(id);
            if self.is_dying(id) {
                continue;
            }
            let steps = match self.players.get_mut(&id) {
                Some(player) => player.advance(dt, speed),
                None => continue,
            };
            for _ in 0..steps {
                if !self.step_player(id) {
                    break;
                }
            }
        }
    }

    fn apply_queued_moves(&mut self, id: PlayerId) {
        let max_correction = self.config.max_position_correction;
        let interior = self.grid.bounds().dilate(-1);
        loop {
            let Some(player) = self.players.get_mut(&id) else {
                return;
            };
            let Some(request) = player.pop_queued_move() else {
                return;
            };
            let Some(target) = player
                .validate_move(request, max_correction)
                .filter(|t| interior.contains(t.position))
            else {
                debug!("Player {}: dropped move {:?}", id, request);
                continue;
            };

            if target.ahead > 0 {
                for _ in 0..target.ahead {
                    if !self.step_player(id) {
                        return;
                    }
                }
            } else if target.ahead < 0 {
                player.retreat_to(target.position);
            }

            let Some(player) = self.players.get_mut(&id) else {
                return;
            };
            player.turn(target.direction);
            self.broadcast_player_state(id);
        }
    }

    /// Move a player one tile. Returns false if it died.
    fn step_player(&mut self, id: PlayerId) -> bool {
        let Some(player) = self.players.get(&id) else {
            return false;
        };
        let current = player.position();
        let next = player.next_position();
        if next == current {
            return true;
        }

        let value = self.grid.get_pos(next);
        if value == tile::BORDER {
            self.queue_death(id, DeathType::Bounds, None, current);
            return false;
        }
        let owned = value == id as TileValue;
        let had_trail = player.has_trail();

        if !owned && player.trail_contains(next, false) {
            self.broadcast_hit_line(id, next, true);
            self.queue_death(id, DeathType::SelfHit, None, next);
            return false;
        }

        let victims: Vec<PlayerId> = self
            .players
            .values()
            .filter(|o| o.id() != id && o.is_spawned() && o.trail_contains(next, false))
            .map(|o| o.id())
            .collect();
        for victim in victims {
            if self.is_dying(victim) {
                continue;
            }
            self.broadcast_hit_line(id, next, false);
            self.queue_death(victim, DeathType::Player, Some(id), next);
            if let Some(player) = self.players.get_mut(&id) {
                player.kills += 1;
            }
        }

        let Some(player) = self.players.get_mut(&id) else {
            return false;
        };
        player.step();
        if !had_trail && !owned {
            player.open_trail(current);
            self.broadcast_trail(id);
        } else if had_trail && owned {
            let vertices = player.close_trail();
            self.finish_trail(id, vertices, next);
        }
        true
    }

    /// Fill a closed trail and resolve what it encloses
    fn finish_trail(&mut self, id: PlayerId, vertices: Vec<TilePos>, last: TilePos) {
        let other_player_locations: Vec<TilePos> = self
            .players
            .values()
            .filter(|o| o.id() != id && o.is_spawned())
            .map(|o| o.position())
            .collect();

        self.worker_send(
            WorkerRequest::FillPlayerTrail {
                vertices,
                player_id: id,
            },
            Pending::Trail { player_id: id },
        );
        self.worker_send(
            WorkerRequest::UpdateCapturedArea {
                player_id: id,
                other_player_locations,
            },
            Pending::Capture { player_id: id },
        );

        let viewers = self.get_overlapping_viewport_players_for_pos(last);
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            (viewer.id() == id || viewer.knows(id)).then(|| ServerMessage::EmptyTrailWithLastPos {
                player_id: wire_id(viewer.id(), id),
                position: last,
            })
        });
    }

    fn queue_death(&mut self, victim: PlayerId, death_type: DeathType, killer: Option<PlayerId>, position: TilePos) {
        if !self.is_dying(victim) {
            self.deaths.push(Death {
                victim,
                death_type,
                killer,
                position,
            });
        }
    }

    fn resolve_deaths(&mut self) {
        for death in std::mem::take(&mut self.deaths) {
            self.kill_player(death);
        }
    }

    fn kill_player(&mut self, death: Death) {
        let Some(victim) = self.players.get(&death.victim) else {
            return;
        };
        let killer_name = death
            .killer
            .and_then(|k| self.players.get(&k))
            .map(|k| k.name().to_string());
        let tiles = self.tile_count(death.victim);
        let time_alive = victim.time_alive(self.now);
        let connection_id = victim.connection_id();

        let report = ScoreReport {
            name: victim.name().to_string(),
            tiles,
            kills: victim.kills,
            time_alive_secs: time_alive,
            highest_rank: victim.highest_rank,
            seconds_ranked_first: victim.seconds_ranked_first,
            death_type: death_type_name(death.death_type),
            killer: killer_name.clone(),
        };
        let game_over = ServerMessage::GameOver(GameOverStats {
            tiles,
            kills: victim.kills.min(u16::MAX as u32) as u16,
            highest_rank: victim.highest_rank,
            time_alive_secs: time_alive as u32,
            ranking_first_secs: victim.seconds_ranked_first as u32,
            death_type: death.death_type,
            killer_name: killer_name.unwrap_or_default(),
        });

        let viewers = self.get_overlapping_viewport_players_for_pos(death.position);
        let victim_id = death.victim;
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            (viewer.id() == victim_id || viewer.knows(victim_id)).then(|| ServerMessage::PlayerDie {
                player_id: wire_id(viewer.id(), victim_id),
                position: Some(death.position),
            })
        });
        deliver(&mut self.connections, &self.metrics, connection_id, &game_over);

        self.score_sink.report_player_score(&report);
        self.metrics.deaths_total.fetch_add(1, Ordering::Relaxed);
        info!(
            "Player {} died ({}) with {} tiles",
            victim_id,
            death_type_name(death.death_type),
            tiles
        );

        self.remove_player_with(victim_id, self.config.clear_tiles_on_death, false);
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.state = ConnectionState::Dead;
        }
    }

    // === Broadcasts ===

    fn broadcast_player_state(&mut self, id: PlayerId) {
        let Some(player) = self.players.get(&id) else {
            return;
        };
        let (position, direction, has_trail) = (player.position(), player.direction(), player.has_trail());
        let viewers = self.get_overlapping_viewport_players_for_pos(position);
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            (viewer.id() == id || viewer.knows(id)).then(|| ServerMessage::PlayerState {
                position,
                player_id: wire_id(viewer.id(), id),
                direction,
                has_trail,
            })
        });
    }

    fn broadcast_trail(&mut self, id: PlayerId) {
        let Some(player) = self.players.get(&id) else {
            return;
        };
        let vertices = player.trail().to_vec();
        let viewers = self.get_overlapping_viewport_players_for_pos(player.position());
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            (viewer.id() == id || viewer.knows(id)).then(|| ServerMessage::SetPlayerTrail {
                player_id: wire_id(viewer.id(), id),
                vertices: vertices.clone(),
            })
        });
    }

    fn broadcast_hit_line(&mut self, by: PlayerId, position: TilePos, hit_self: bool) {
        let viewers = self.get_overlapping_viewport_players_for_pos(position);
        let owners = &self.owners;
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            Some(ServerMessage::PlayerHitLine {
                by_player_id: wire_id(viewer.id(), by),
                color_id: color_for(owners, viewer, by) - 1,
                position,
                hit_self,
            })
        });
    }

    fn honk(&mut self, connection_id: ConnectionId, duration: u8) {
        let now = self.now;
        let cooldown = self.config.honk_cooldown;
        let Some(player) = self.playing_player_mut(connection_id) else {
            return;
        };
        if let Some(last) = player.last_honk {
            if now.saturating_duration_since(last).as_secs_f32() < cooldown {
                return;
            }
        }
        player.last_honk = Some(now);
        let id = player.id();
        let position = player.position();
        let duration = duration.clamp(honk::MIN_DURATION, honk::MAX_DURATION);

        let viewers = self.get_overlapping_viewport_players_for_pos(position);
        broadcast(&self.players, &mut self.connections, &self.metrics, &viewers, |viewer| {
            (viewer.id() != id && viewer.knows(id)).then_some(ServerMessage::PlayerHonk {
                player_id: id,
                duration,
            })
        });
    }

    /// Send newly exposed tiles and announce players entering each viewport
    fn update_viewports(&mut self) {
        let view_size = self.config.viewport_size;
        let bounds = self.grid.bounds();
        let snapshots: Vec<PlayerSnapshot> = self
            .spawned_ids()
            .into_iter()
            .filter_map(|id| self.players.get(&id))
            .map(|p| PlayerSnapshot {
                id: p.id(),
                position: p.position(),
                direction: p.direction(),
                trail: p.trail().to_vec(),
                skin_id: p.skin_id(),
                name: p.name().to_string(),
            })
            .collect();

        for viewer_snapshot in &snapshots {
            let Some(viewer) = self.players.get_mut(&viewer_snapshot.id) else {
                continue;
            };
            let view = viewer.viewport(view_size);
            let mut messages = Vec::new();

            let viewport = view.clamp(&bounds);
            let previous = viewer.sent_viewport();
            if viewport != previous {
                viewer.set_sent_viewport(viewport);
                for strip in viewport.subtract(&previous) {
                    messages.push(ServerMessage::ChunkOfBlocks {
                        rect: strip,
                        tiles: Vec::new(),
                    });
                }
            }

            for other in &snapshots {
                if other.id == viewer_snapshot.id {
                    continue;
                }
                let in_view = view.contains(other.position);
                if !viewer.set_visible(other.id, in_view) {
                    continue;
                }
                if viewer.mark_known(other.id) {
                    messages.push(ServerMessage::PlayerSkin {
                        player_id: other.id,
                        color_id: viewer.skin_id_for_player(other.id, other.skin_id) - 1,
                    });
                    messages.push(ServerMessage::PlayerName {
                        player_id: other.id,
                        name: other.name.clone(),
                    });
                }
                messages.push(ServerMessage::PlayerState {
                    position: other.position,
                    player_id: other.id,
                    direction: other.direction,
                    has_trail: !other.trail.is_empty(),
                });
                if !other.trail.is_empty() {
                    messages.push(ServerMessage::SetPlayerTrail {
                        player_id: other.id,
                        vertices: other.trail.clone(),
                    });
                }
            }

            let viewer = &self.players[&viewer_snapshot.id];
            let connection_id = viewer.connection_id();
            for mut message in messages {
                if let ServerMessage::ChunkOfBlocks { rect, tiles } = &mut message {
                    *tiles = chunk_tiles(&self.grid, &self.owners, viewer, *rect);
                }
                deliver(&mut self.connections, &self.metrics, connection_id, &message);
            }
        }
    }

    /// MY_SCORE for every player whose tiles or kills changed
    fn send_scores(&mut self) {
        for id in self.spawned_ids() {
            let tiles = self.tile_count(id);
            let Some(player) = self.players.get_mut(&id) else {
                continue;
            };
            let score = (tiles, player.kills);
            if player.reported_score == Some(score) {
                continue;
            }
            player.reported_score = Some(score);
            let message = ServerMessage::MyScore {
                tiles,
                kills: score.1.min(u16::MAX as u32) as u16,
            };
            let connection_id = player.connection_id();
            deliver(&mut self.connections, &self.metrics, connection_id, &message);
        }
    }

    fn broadcast_leaderboard(&mut self, interval: f32) {
        let rankings = rank_players(
            self.players
                .values()
                .filter(|p| p.is_spawned())
                .map(|p| (p.id(), p.name(), self.owners.get(&p.id()).map(|o| o.tiles).unwrap_or(0))),
        );
        if rankings.is_empty() {
            return;
        }
        let leaderboard = ServerMessage::Leaderboard {
            total_players: rankings.len().min(u16::MAX as usize) as u16,
            entries: rankings
                .iter()
                .take(broadcast::LEADERBOARD_SIZE)
                .map(|r| LeaderboardEntry {
                    score: r.tiles,
                    name: r.name.clone(),
                })
                .collect(),
        };

        for ranking in &rankings {
            let Some(player) = self.players.get_mut(&ranking.player_id) else {
                continue;
            };
            if player.highest_rank == 0 || ranking.rank < player.highest_rank {
                player.highest_rank = ranking.rank;
            }
            if ranking.rank == 1 {
                player.seconds_ranked_first += interval;
            }
            let connection_id = player.connection_id();
            deliver(&mut self.connections, &self.metrics, connection_id, &leaderboard);
            deliver(
                &mut self.connections,
                &self.metrics,
                connection_id,
                &ServerMessage::MyRank { rank: ranking.rank },
            );
        }
    }

    /// Ask the worker for the next quadrant; the response is broadcast
    fn request_minimap(&mut self) {
        let part = self.next_minimap_part;
        self.next_minimap_part = (part + 1) % broadcast::MINIMAP_PARTS;
        self.worker_send(WorkerRequest::MinimapPart { part }, Pending::Minimap);
    }

    fn broadcast_minimap(&mut self, part: u8, bits: Vec<u8>) {
        let message = ServerMessage::Minimap { part, bits };
        for id in self.spawned_ids() {
            if let Some(player) = self.players.get(&id) {
                deliver(&mut self.connections, &self.metrics, player.connection_id(), &message);
            }
        }
    }
}
