use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::game::constants::{broadcast, honk, player, tick, viewport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("port cannot be 0")]
    ZeroPort,
    #[error("max_connections must be at least 1")]
    ZeroConnections,
    #[error("tick_rate must be 1-1000, got {0}")]
    TickRate(u32),
    #[error("arena size {size} must be between {min} and {max}")]
    ArenaSize { size: i32, min: i32, max: i32 },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// Gameplay settings of one arena
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Side length in tiles, border included
    pub size: i32,
    pub spawn_radius: i32,
    /// Tiles per second
    pub travel_speed: f32,
    /// Half-size of each player's update viewport
    pub viewport_size: i32,
    pub max_position_correction: i32,
    pub idle_timeout: Duration,
    pub leaderboard_interval: f32,
    pub minimap_interval: f32,
    pub honk_cooldown: f32,
    /// Reset a dead player's territory to unclaimed
    pub clear_tiles_on_death: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            size: 600,
            spawn_radius: player::SPAWN_RADIUS,
            travel_speed: player::TRAVEL_SPEED,
            viewport_size: viewport::UPDATES_VIEWPORT_RECT_SIZE,
            max_position_correction: player::MAX_POSITION_CORRECTION,
            idle_timeout: Duration::from_secs(300),
            leaderboard_interval: broadcast::LEADERBOARD_INTERVAL,
            minimap_interval: broadcast::MINIMAP_INTERVAL,
            honk_cooldown: honk::COOLDOWN,
            clear_tiles_on_death: false,
        }
    }
}

impl ArenaConfig {
    /// Smallest arena that fits a spawn square and its margin inside the border
    pub fn min_size(&self) -> i32 {
        2 * (player::SPAWN_MARGIN + self.spawn_radius) + 3
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.min_size();
        let max = u16::MAX as i32;
        if self.size < min || self.size > max {
            return Err(ConfigError::ArenaSize {
                size: self.size,
                min,
                max,
            });
        }
        if self.travel_speed <= 0.0 || !self.travel_speed.is_finite() {
            return Err(ConfigError::NotPositive("travel_speed"));
        }
        if self.viewport_size <= 0 {
            return Err(ConfigError::NotPositive("viewport_size"));
        }
        if self.leaderboard_interval <= 0.0 {
            return Err(ConfigError::NotPositive("leaderboard_interval"));
        }
        if self.minimap_interval <= 0.0 {
            return Err(ConfigError::NotPositive("minimap_interval"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::NotPositive("idle_timeout"));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Game port
    pub port: u16,
    /// Prometheus metrics port
    pub metrics_port: u16,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Simulation ticks per second
    pub tick_rate: u32,
    pub arena: ArenaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7777,
            metrics_port: 9090,
            max_connections: 500,
            tick_rate: tick::TICK_RATE,
            arena: ArenaConfig::default(),
        }
    }
}

/// Parse `name` from the environment; keep `current` and warn when the value
/// is unparsable or rejected by `accept`.
fn env_override<T>(name: &str, current: &mut T, accept: impl Fn(&T) -> bool)
where
    T: FromStr,
{
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => *current = parsed,
        Ok(_) => tracing::warn!("{} value '{}' out of range, using default", name, raw),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_override("BIND_ADDRESS", &mut config.bind_address, |_| true);
        env_override("PORT", &mut config.port, |p| *p > 0);
        env_override("METRICS_PORT", &mut config.metrics_port, |p| *p > 0);
        env_override("MAX_CONNECTIONS", &mut config.max_connections, |n| (1..=100_000).contains(n));
        env_override("TICK_RATE", &mut config.tick_rate, |n| (1..=1000).contains(n));
        env_override("ARENA_SIZE", &mut config.arena.size, |n| *n > 0 && *n <= u16::MAX as i32);
        env_override("CLEAR_TILES_ON_DEATH", &mut config.arena.clear_tiles_on_death, |_| true);

        let mut idle_secs = config.arena.idle_timeout.as_secs();
        env_override("IDLE_TIMEOUT_SECS", &mut idle_secs, |n| *n > 0);
        config.arena.idle_timeout = Duration::from_secs(idle_secs);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        self.arena.validate()
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7777);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.arena.size, 600);
        assert_eq!(config.arena.idle_timeout, Duration::from_secs(300));
        assert!(!config.arena.clear_tiles_on_death);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_arena_size_limits() {
        let mut arena = ArenaConfig::default();
        arena.size = arena.min_size();
        assert!(arena.validate().is_ok());
        arena.size -= 1;
        assert!(matches!(arena.validate(), Err(ConfigError::ArenaSize { .. })));
        arena.size = 70_000;
        assert!(matches!(arena.validate(), Err(ConfigError::ArenaSize { .. })));
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = ServerConfig::default();
        config.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPort));

        let mut config = ServerConfig::default();
        config.tick_rate = 0;
        assert_eq!(config.validate(), Err(ConfigError::TickRate(0)));

        let mut config = ServerConfig::default();
        config.arena.travel_speed = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("travel_speed")));
    }

    #[test]
    fn test_tick_duration() {
        let mut config = ServerConfig::default();
        config.tick_rate = 50;
        assert_eq!(config.tick_duration(), Duration::from_millis(20));
    }
}
