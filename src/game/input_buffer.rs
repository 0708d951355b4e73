//! Connection event buffer between network tasks and the tick loop
//!
//! Uses crossbeam-channel for lock-free MPSC communication from connection
//! handlers to the game loop, which drains everything at the start of a tick.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tokio::sync::mpsc;

use crate::game::player::ConnectionId;

/// Sink for encoded server messages of one connection
pub type Outbox = mpsc::Sender<Vec<u8>>;

/// Something that happened on a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened { connection_id: ConnectionId, outbox: Outbox },
    Message { connection_id: ConnectionId, payload: Vec<u8> },
    Closed { connection_id: ConnectionId },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Opened { connection_id, .. }
            | ConnectionEvent::Message { connection_id, .. }
            | ConnectionEvent::Closed { connection_id } => *connection_id,
        }
    }
}

/// Event buffer: client messages are bounded and dropped when full,
/// lifecycle events go through their own unbounded channel and are never
/// dropped. At most one opened and one closed event exist per connection,
/// so the lifecycle channel is bounded by the connection limit.
pub struct EventBuffer {
    messages: Sender<ConnectionEvent>,
    message_rx: Receiver<ConnectionEvent>,
    lifecycle: Sender<ConnectionEvent>,
    lifecycle_rx: Receiver<ConnectionEvent>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let (messages, message_rx) = bounded(capacity);
        let (lifecycle, lifecycle_rx) = unbounded();
        Self {
            messages,
            message_rx,
            lifecycle,
            lifecycle_rx,
        }
    }

    /// Create a sender handle for a connection task
    pub fn sender(&self) -> EventSender {
        EventSender {
            messages: self.messages.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Drain all pending events for this tick, ordered as opened events,
    /// then messages, then closed events.
    pub fn drain(&self) -> Vec<ConnectionEvent> {
        // Messages are taken first so the opened event of every drained
        // message is in this batch or an earlier one
        let messages: Vec<ConnectionEvent> = self.message_rx.try_iter().collect();
        let (mut events, closed): (Vec<_>, Vec<_>) = self
            .lifecycle_rx
            .try_iter()
            .partition(|e| matches!(e, ConnectionEvent::Opened { .. }));
        events.extend(messages);
        events.extend(closed);
        events
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.message_rx.len() + self.lifecycle_rx.len()
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(crate::game::constants::net::EVENT_BUFFER_SIZE)
    }
}

/// Clonable sender handle for connection tasks. No method ever blocks.
#[derive(Clone)]
pub struct EventSender {
    messages: Sender<ConnectionEvent>,
    lifecycle: Sender<ConnectionEvent>,
}

impl EventSender {
    /// Submit a client message (non-blocking). Fails when the buffer is full.
    #[inline]
    pub fn try_message(&self, connection_id: ConnectionId, payload: Vec<u8>) -> Result<(), EventBufferError> {
        self.messages
            .try_send(ConnectionEvent::Message {
                connection_id,
                payload,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => EventBufferError::Full,
                TrySendError::Disconnected(_) => EventBufferError::Disconnected,
            })
    }

    /// Announce a new connection
    pub fn opened(&self, connection_id: ConnectionId, outbox: Outbox) -> Result<(), EventBufferError> {
        self.lifecycle
            .send(ConnectionEvent::Opened {
                connection_id,
                outbox,
            })
            .map_err(|_| EventBufferError::Disconnected)
    }

    /// Announce a closed connection
    pub fn closed(&self, connection_id: ConnectionId) -> Result<(), EventBufferError> {
        self.lifecycle
            .send(ConnectionEvent::Closed { connection_id })
            .map_err(|_| EventBufferError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EventBufferError {
    #[error("event buffer full")]
    Full,
    #[error("game loop stopped")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::channel;

    #[test]
    fn test_events_drain_in_order() {
        let buffer = EventBuffer::new(10);
        let sender = buffer.sender();
        let (outbox, _rx) = channel(4);

        sender.opened(1, outbox).unwrap();
        sender.try_message(1, vec![1, 2]).unwrap();
        sender.closed(1).unwrap();
        assert_eq!(buffer.pending_count(), 3);

        let events = buffer.drain();
        assert!(matches!(events[0], ConnectionEvent::Opened { connection_id: 1, .. }));
        match &events[1] {
            ConnectionEvent::Message {
                connection_id,
                payload,
            } => {
                assert_eq!(*connection_id, 1);
                assert_eq!(payload, &vec![1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[2], ConnectionEvent::Closed { connection_id: 1 }));
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn test_message_backpressure() {
        let buffer = EventBuffer::new(2);
        let sender = buffer.sender();

        assert!(sender.try_message(1, vec![0]).is_ok());
        assert!(sender.try_message(2, vec![0]).is_ok());
        assert_eq!(sender.try_message(3, vec![0]), Err(EventBufferError::Full));

        buffer.drain();
        assert!(sender.try_message(3, vec![0]).is_ok());
    }

    #[test]
    fn test_sender_clone() {
        let buffer = EventBuffer::new(10);
        let a = buffer.sender();
        let b = a.clone();
        a.try_message(1, vec![]).unwrap();
        b.try_message(2, vec![]).unwrap();

        let ids: Vec<_> = buffer.drain().iter().map(|e| e.connection_id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_disconnected_after_drop() {
        let buffer = EventBuffer::new(4);
        let sender = buffer.sender();
        drop(buffer);
        assert_eq!(sender.try_message(1, vec![]), Err(EventBufferError::Disconnected));
        assert_eq!(sender.closed(1), Err(EventBufferError::Disconnected));
    }

    #[test]
    fn test_lifecycle_events_never_wait_for_room() {
        let buffer = EventBuffer::new(2);
        let sender = buffer.sender();
        let (outbox, _rx) = channel(4);

        sender.opened(3, outbox).unwrap();
        sender.try_message(1, vec![0]).unwrap();
        sender.try_message(2, vec![0]).unwrap();
        assert_eq!(sender.try_message(3, vec![0]), Err(EventBufferError::Full));
        for id in 1..=100 {
            sender.closed(id).unwrap();
        }
        assert_eq!(buffer.pending_count(), 103);

        let events = buffer.drain();
        assert!(matches!(events[0], ConnectionEvent::Opened { connection_id: 3, .. }));
        assert!(matches!(events[1], ConnectionEvent::Message { connection_id: 1, .. }));
        assert!(matches!(events[2], ConnectionEvent::Message { connection_id: 2, .. }));
        assert!(events[3..]
            .iter()
            .all(|e| matches!(e, ConnectionEvent::Closed { .. })));
    }
}
