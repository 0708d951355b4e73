//! TCP transport
//!
//! Each client connection gets a reader loop feeding the game's event
//! buffer and a writer loop draining its outbox. Frames are length-prefixed
//! (see [`crate::net::framing`]).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{channel, Receiver};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::game::constants::net;
use crate::game::input_buffer::{EventBufferError, EventSender};
use crate::game::player::ConnectionId;
use crate::net::framing::{read_message, write_frame, FramingError};

/// Game server accepting client connections
pub struct ArenaServer {
    config: ServerConfig,
    events: EventSender,
    next_connection_id: Arc<AtomicU64>,
    active_connections: Arc<AtomicUsize>,
}

impl ArenaServer {
    pub fn new(config: ServerConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            next_connection_id: Arc::new(AtomicU64::new(1)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        info!("Arena server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;

            let active = self.active_connections.load(Ordering::Relaxed);
            if active >= self.config.max_connections {
                warn!("Connection from {} rejected: {} connections open", peer, active);
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let events = self.events.clone();
            let active_connections = self.active_connections.clone();
            active_connections.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                debug!("Connection {} from {}", connection_id, peer);
                handle_connection(stream, connection_id, events).await;
                active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, connection_id: ConnectionId, events: EventSender) {
    let (reader, writer) = stream.into_split();
    run_connection(reader, writer, connection_id, events).await;
}

/// Drive one connection until either side closes, then report it closed
pub async fn run_connection<R, W>(mut reader: R, writer: W, connection_id: ConnectionId, events: EventSender)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (outbox, outbox_rx) = channel(net::OUTBOX_CAPACITY);
    if events.opened(connection_id, outbox).is_err() {
        warn!("Connection {}: game loop is gone", connection_id);
        return;
    }

    tokio::select! {
        result = read_loop(&mut reader, connection_id, &events) => {
            if let Err(e) = result {
                debug!("Connection {} read ended: {}", connection_id, e);
            }
        }
        result = write_loop(writer, outbox_rx) => {
            if let Err(e) = result {
                debug!("Connection {} write ended: {}", connection_id, e);
            }
        }
    }

    if events.closed(connection_id).is_err() {
        debug!("Connection {}: close not delivered, game loop is gone", connection_id);
    }
}

async fn read_loop<R>(reader: &mut R, connection_id: ConnectionId, events: &EventSender) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = match read_message(reader).await {
            Ok(payload) => payload,
            Err(FramingError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match events.try_message(connection_id, payload) {
            Ok(()) => {}
            Err(EventBufferError::Full) => {
                warn!("Connection {}: event buffer full, message dropped", connection_id);
            }
            Err(EventBufferError::Disconnected) => return Ok(()),
        }
    }
}

/// Write queued messages until the game drops the outbox
async fn write_loop<W>(mut writer: W, mut outbox: Receiver<Vec<u8>>) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        write_frame(&mut writer, &message).await?;
        // Batch whatever else is already queued before flushing
        while let Ok(message) = outbox.try_recv() {
            write_frame(&mut writer, &message).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input_buffer::{ConnectionEvent, EventBuffer};
    use crate::net::protocol::{ClientMessage, ServerMessage};
    use std::time::Duration;
    use tokio::io::duplex;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn test_connection_events_in_order() {
        let buffer = EventBuffer::new(64);
        let mut input = frame(&ClientMessage::Ping.encode());
        input.extend(frame(&ClientMessage::Ready.encode()));
        let reader = tokio_test::io::Builder::new().read(&input).build();
        let (writer, _peer) = duplex(1024);

        run_connection(reader, writer, 7, buffer.sender()).await;

        let events = buffer.drain();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ConnectionEvent::Opened { connection_id: 7, .. }));
        match &events[1] {
            ConnectionEvent::Message { payload, .. } => {
                assert_eq!(ClientMessage::decode(payload).unwrap(), ClientMessage::Ping);
            }
            other => panic!("unexpected {:?}", other.connection_id()),
        }
        assert!(matches!(events[3], ConnectionEvent::Closed { connection_id: 7 }));
    }

    #[tokio::test]
    async fn test_close_completes_with_full_buffer() {
        let buffer = EventBuffer::new(1);
        buffer.sender().try_message(1, vec![0]).unwrap();
        let mut input = frame(&ClientMessage::Ping.encode());
        input.extend(frame(&ClientMessage::Ready.encode()));
        let reader = tokio_test::io::Builder::new().read(&input).build();
        let (writer, _peer) = duplex(1024);

        tokio::time::timeout(Duration::from_secs(1), run_connection(reader, writer, 9, buffer.sender()))
            .await
            .expect("connection task finished");

        let events = buffer.drain();
        assert!(matches!(events[0], ConnectionEvent::Opened { connection_id: 9, .. }));
        assert!(matches!(events.last(), Some(ConnectionEvent::Closed { connection_id: 9 })));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_outbox_is_framed() {
        let (tx, rx) = channel(8);
        let (writer, mut peer) = duplex(1024);
        tx.try_send(ServerMessage::Pong.encode()).unwrap();
        tx.try_send(ServerMessage::MyRank { rank: 2 }.encode()).unwrap();
        drop(tx);

        write_loop(writer, rx).await.unwrap();

        assert_eq!(read_message(&mut peer).await.unwrap(), vec![21]);
        assert_eq!(read_message(&mut peer).await.unwrap(), vec![10, 0, 2]);
    }

    #[tokio::test]
    async fn test_serve_accepts_tcp_clients() {
        let buffer = EventBuffer::new(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ArenaServer::new(ServerConfig::default(), buffer.sender());
        let handle = tokio::spawn(server.serve(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&frame(&ClientMessage::Ping.encode())).await.unwrap();
        client.flush().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.extend(buffer.drain());
            if seen.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(seen[0], ConnectionEvent::Opened { .. }));
        assert!(matches!(seen[1], ConnectionEvent::Message { .. }));
        handle.abort();
    }
}
