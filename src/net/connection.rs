use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::game::input_buffer::Outbox;
use crate::game::player::{ConnectionId, PlayerId};
use crate::net::protocol::ServerMessage;

/// Connection lifecycle as seen by the game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Configuring name and skin, no player yet
    Lobby,
    /// Player created, waiting for the spawn square
    Joining,
    /// Player active in the arena
    Playing,
    /// Player died; the connection stays open but never respawns
    Dead,
}

/// Pre-join choices of a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    pub name: String,
    /// `None` picks a random skin
    pub skin_id: Option<u8>,
    pub pattern_id: u8,
}

/// Client connection information
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub player_id: Option<PlayerId>,
    pub state: ConnectionState,
    pub options: JoinOptions,
    pub created_at: Instant,
    /// Last PING received
    pub last_ping: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    outbox: Outbox,
    /// The outbox filled up; the client is not reading
    lagging: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, outbox: Outbox, now: Instant) -> Self {
        Self {
            id,
            player_id: None,
            state: ConnectionState::Lobby,
            options: JoinOptions::default(),
            created_at: now,
            last_ping: now,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            outbox,
            lagging: false,
        }
    }

    /// Encode and queue a message. A closed or lagging peer is logged,
    /// never an error.
    pub fn send(&mut self, message: &ServerMessage) -> usize {
        if self.lagging {
            return 0;
        }
        let bytes = message.encode();
        let len = bytes.len();
        match self.outbox.try_send(bytes) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Connection {}: outbox full, client is lagging", self.id);
                self.lagging = true;
                return 0;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection {}: dropped message {} after close", self.id, message.tag());
                return 0;
            }
        }
        self.bytes_sent += len as u64;
        self.packets_sent += 1;
        len
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_ping = now;
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ping)
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_time(now) > timeout
    }

    /// True while name/skin may still be changed
    pub fn accepts_options(&self) -> bool {
        self.state == ConnectionState::Lobby
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// True once a message could not be queued because the outbox was full
    pub fn is_lagging(&self) -> bool {
        self.lagging
    }
}

/// Trim, drop control characters and markup, collapse whitespace and cap
/// the length in characters.
pub fn sanitize_name(raw: &str, max_chars: usize) -> String {
    let mut name = String::with_capacity(raw.len().min(max_chars * 4));
    let mut pending_space = false;
    let mut count = 0;
    for c in raw.chars() {
        if c.is_whitespace() {
            pending_space = count > 0;
            continue;
        }
        if c.is_control() || matches!(c, '<' | '>' | '&') {
            continue;
        }
        if pending_space {
            if count + 1 >= max_chars {
                break;
            }
            name.push(' ');
            count += 1;
            pending_space = false;
        }
        if count >= max_chars {
            break;
        }
        name.push(c);
        count += 1;
    }
    name
}
