pub mod protocol;
pub mod framing;
pub mod connection;
pub mod game_session;
pub mod transport;
