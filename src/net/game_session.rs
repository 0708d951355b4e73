//! Game session - runs the arena tick loop

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::game::input_buffer::EventSender;
use crate::game::score::ScoreSink;
use crate::game::state::GameState;
use crate::game::worker::WorkerError;
use crate::metrics::Metrics;

/// Seconds between periodic stats log lines
const STATS_INTERVAL_SECS: u64 = 30;

/// The arena and the clock that drives it
pub struct GameSession {
    pub state: GameState,
    metrics: Arc<Metrics>,
    tick_rate: u32,
    tick_count: u64,
    last_tick: Option<Instant>,
}

impl GameSession {
    pub fn new(
        config: &ServerConfig,
        score_sink: Box<dyn ScoreSink>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, WorkerError> {
        let state = GameState::new(config.arena.clone(), score_sink, metrics.clone())?;
        Ok(Self {
            state,
            metrics,
            tick_rate: config.tick_rate,
            tick_count: 0,
            last_tick: None,
        })
    }

    /// Handle for connection tasks to submit events
    pub fn event_sender(&self) -> EventSender {
        self.state.event_sender()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Run one tick using wall-clock time since the previous one
    pub fn tick(&mut self, now: Instant) -> Result<(), WorkerError> {
        let nominal = 1.0 / self.tick_rate.max(1) as f32;
        let dt = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(nominal);
        self.last_tick = Some(now);

        let started = std::time::Instant::now();
        self.state.tick(now.into_std(), dt)?;
        self.metrics.record_tick_time(started.elapsed());
        self.tick_count += 1;
        Ok(())
    }

    fn log_stats(&self, uptime: Duration) {
        info!(
            "Arena: {}s, tick {}, {} players, {} connections, {} queued events, {} worker requests in flight",
            uptime.as_secs(),
            self.tick_count,
            self.state.player_count(),
            self.state.connection_count(),
            self.state.pending_events(),
            self.state.pending_requests()
        );
    }
}

/// Start the fixed-rate game loop. The task only ends when the arena worker
/// is lost, returning that error.
pub fn start_game_loop(mut session: GameSession) -> JoinHandle<Result<(), WorkerError>> {
    tokio::spawn(async move {
        let tick_duration = Duration::from_secs_f64(1.0 / session.tick_rate.max(1) as f64);
        let mut ticker = interval(tick_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Game loop started at {} Hz", session.tick_rate);
        let start = Instant::now();
        let stats_every = session.tick_rate.max(1) as u64 * STATS_INTERVAL_SECS;

        loop {
            let now = ticker.tick().await;

            if let Err(e) = session.tick(now) {
                error!("Game loop stopped: {}", e);
                return Err(e);
            }

            if session.tick_count % stats_every == 0 {
                session.log_stats(start.elapsed());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::score::RecordingScoreSink;
    use std::sync::atomic::Ordering;

    fn session() -> (GameSession, Arc<Metrics>) {
        let mut config = ServerConfig::default();
        config.arena.size = 40;
        let metrics = Arc::new(Metrics::new());
        let session = GameSession::new(&config, Box::new(RecordingScoreSink::new()), metrics.clone()).unwrap();
        (session, metrics)
    }

    #[test]
    fn test_tick_records_metrics() {
        let (mut session, metrics) = session();
        let start = Instant::now();
        session.tick(start).unwrap();
        session.tick(start + Duration::from_millis(33)).unwrap();

        assert_eq!(session.tick_count(), 2);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_game_loop_runs() {
        let (session, metrics) = session();
        let handle = start_game_loop(session);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(metrics.tick_count.load(Ordering::Relaxed) > 0);
        handle.abort();
    }
}
