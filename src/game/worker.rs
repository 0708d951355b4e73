//! Arena worker thread
//!
//! The canonical grid and per-player bounds live on a dedicated OS thread so
//! flood fills never stall the tick loop. Requests are processed strictly in
//! arrival order. For every request the worker first publishes the grid
//! changes it made, then the response, on a single output channel.
//!
//! A panic inside the worker (an invariant violation) drops the output
//! sender; callers observe it as [`WorkerError::Disconnected`].

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, trace};

use crate::game::capture::{ArenaState, CaptureResult, TileChanges};
use crate::game::player::PlayerId;
use crate::util::rect::{Rect, TilePos};

/// Correlates a response with the request that caused it
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    FillPlayerSpawn {
        position: TilePos,
        player_id: PlayerId,
    },
    FillPlayerTrail {
        vertices: Vec<TilePos>,
        player_id: PlayerId,
    },
    UpdateCapturedArea {
        player_id: PlayerId,
        other_player_locations: Vec<TilePos>,
    },
    ClearAllPlayerTiles {
        player_id: PlayerId,
    },
    ReleasePlayer {
        player_id: PlayerId,
    },
    MinimapPart {
        part: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    SpawnFilled { rect: Rect },
    TrailFilled,
    CaptureResolved(CaptureResult),
    TilesCleared { count: u32 },
    PlayerReleased,
    MinimapPart { part: u8, bits: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutput {
    /// Grid changes, always delivered before the response of the same request
    TilesChanged(TileChanges),
    Response {
        id: RequestId,
        response: WorkerResponse,
    },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("arena worker disconnected")]
    Disconnected,
    #[error("failed to spawn arena worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle to the arena worker thread
pub struct ArenaWorker {
    requests: Option<Sender<(RequestId, WorkerRequest)>>,
    outputs: Receiver<WorkerOutput>,
    next_id: RequestId,
    handle: Option<JoinHandle<()>>,
}

impl ArenaWorker {
    /// Start a worker thread that takes ownership of `arena`
    pub fn spawn(arena: ArenaState) -> Result<Self, WorkerError> {
        let (request_tx, request_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        let (width, height) = (arena.grid().width(), arena.grid().height());

        let handle = thread::Builder::new()
            .name("arena-worker".to_string())
            .spawn(move || run(arena, request_rx, output_tx))?;

        debug!("Arena worker started for {}x{} arena", width, height);

        Ok(Self {
            requests: Some(request_tx),
            outputs: output_rx,
            next_id: 1,
            handle: Some(handle),
        })
    }

    /// Queue a request and return its id
    pub fn send(&mut self, request: WorkerRequest) -> Result<RequestId, WorkerError> {
        let id = self.next_id;
        self.next_id += 1;
        let sender = self.requests.as_ref().ok_or(WorkerError::Disconnected)?;
        sender
            .send((id, request))
            .map_err(|_| WorkerError::Disconnected)?;
        Ok(id)
    }

    /// Collect every output available right now, without blocking
    pub fn drain(&self) -> Result<Vec<WorkerOutput>, WorkerError> {
        let mut outputs = Vec::new();
        loop {
            match self.outputs.try_recv() {
                Ok(output) => outputs.push(output),
                Err(TryRecvError::Empty) => return Ok(outputs),
                Err(TryRecvError::Disconnected) => {
                    // Hand out what arrived; the next call reports the failure
                    if outputs.is_empty() {
                        return Err(WorkerError::Disconnected);
                    }
                    return Ok(outputs);
                }
            }
        }
    }

    /// Block for the next output up to `timeout`. `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerOutput>, WorkerError> {
        match self.outputs.recv_timeout(timeout) {
            Ok(output) => Ok(Some(output)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::Disconnected),
        }
    }
}

impl Drop for ArenaWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Arena worker had panicked before shutdown");
            }
        }
    }
}

fn run(
    mut arena: ArenaState,
    requests: Receiver<(RequestId, WorkerRequest)>,
    outputs: Sender<WorkerOutput>,
) {
    for (id, request) in requests.iter() {
        let started = Instant::now();
        let response = handle_request(&mut arena, request);
        let changes = arena.take_changes();
        trace!(
            "Request {} handled in {:?} ({} fills)",
            id,
            started.elapsed(),
            changes.fills.len()
        );

        if !changes.is_empty() && outputs.send(WorkerOutput::TilesChanged(changes)).is_err() {
            break;
        }
        if outputs.send(WorkerOutput::Response { id, response }).is_err() {
            break;
        }
    }
    debug!("Arena worker stopped");
}

fn handle_request(arena: &mut ArenaState, request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::FillPlayerSpawn {
            position,
            player_id,
        } => WorkerResponse::SpawnFilled {
            rect: arena.fill_player_spawn(position, player_id),
        },
        WorkerRequest::FillPlayerTrail {
            vertices,
            player_id,
        } => {
            arena.fill_player_trail(&vertices, player_id);
            WorkerResponse::TrailFilled
        }
        WorkerRequest::UpdateCapturedArea {
            player_id,
            other_player_locations,
        } => WorkerResponse::CaptureResolved(
            arena.update_captured_area(player_id, &other_player_locations),
        ),
        WorkerRequest::ClearAllPlayerTiles { player_id } => WorkerResponse::TilesCleared {
            count: arena.clear_all_player_tiles(player_id),
        },
        WorkerRequest::ReleasePlayer { player_id } => {
            arena.release_player(player_id);
            WorkerResponse::PlayerReleased
        }
        WorkerRequest::MinimapPart { part } => WorkerResponse::MinimapPart {
            part,
            bits: arena.minimap_part(part),
        },
    }
}
