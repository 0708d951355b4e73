//! Splix Arena Server Library
//!
//! A real-time territory-capture game server. Players steer across a shared
//! tile grid, leave trails outside their territory and capture everything a
//! closed trail encloses. Grid writes and flood fills run on a dedicated
//! arena worker thread; the tick loop mirrors the grid and fans changes out
//! over a compact big-endian binary protocol.

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
