//! Leaderboard ranking and score reporting
//!
//! Rankings are recomputed from exact owned-tile counts every leaderboard
//! interval. When a player dies its final score goes to a [`ScoreSink`];
//! persisting it is the sink's business.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::game::player::{DeathType, PlayerId};

/// Player ranking on the leaderboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRanking {
    pub player_id: PlayerId,
    pub name: String,
    pub tiles: u32,
    pub rank: u16,
}

/// Rank players by owned tiles (desc), ties broken by id (asc).
/// Ranks start at 1.
pub fn rank_players<'a, I>(players: I) -> Vec<PlayerRanking>
where
    I: IntoIterator<Item = (PlayerId, &'a str, u32)>,
{
    let mut rankings: Vec<PlayerRanking> = players
        .into_iter()
        .map(|(player_id, name, tiles)| PlayerRanking {
            player_id,
            name: name.to_string(),
            tiles,
            rank: 0,
        })
        .collect();

    rankings.sort_by(|a, b| b.tiles.cmp(&a.tiles).then_with(|| a.player_id.cmp(&b.player_id)));

    for (i, ranking) in rankings.iter_mut().enumerate() {
        ranking.rank = (i + 1).min(u16::MAX as usize) as u16;
    }
    rankings
}

/// Final score of a player, handed to the score sink on death
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub name: String,
    pub tiles: u32,
    pub kills: u32,
    pub time_alive_secs: f32,
    pub highest_rank: u16,
    pub seconds_ranked_first: f32,
    pub death_type: &'static str,
    pub killer: Option<String>,
}

pub fn death_type_name(death_type: DeathType) -> &'static str {
    match death_type {
        DeathType::None => "none",
        DeathType::Player => "player",
        DeathType::Bounds => "bounds",
        DeathType::SelfHit => "self",
    }
}

/// Collaborator receiving final scores
pub trait ScoreSink: Send {
    fn report_player_score(&self, report: &ScoreReport);
}

/// Writes each report as a JSON log line
#[derive(Debug, Default)]
pub struct LogScoreSink;

impl ScoreSink for LogScoreSink {
    fn report_player_score(&self, report: &ScoreReport) {
        match serde_json::to_string(report) {
            Ok(json) => info!(target: "score", "{}", json),
            Err(e) => warn!("Failed to serialize score report: {}", e),
        }
    }
}

/// Keeps reports in memory; clones share the same storage
#[derive(Debug, Default, Clone)]
pub struct RecordingScoreSink {
    reports: Arc<Mutex<Vec<ScoreReport>>>,
}

impl RecordingScoreSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ScoreReport> {
        self.reports.lock().clone()
    }
}

impl ScoreSink for RecordingScoreSink {
    fn report_player_score(&self, report: &ScoreReport) {
        self.reports.lock().push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_by_tiles() {
        let rankings = rank_players(vec![(1, "Alice", 30), (2, "Bob", 120), (3, "Carol", 75)]);
        assert_eq!(rankings[0].name, "Bob");
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].name, "Carol");
        assert_eq!(rankings[2].name, "Alice");
        assert_eq!(rankings[2].rank, 3);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let rankings = rank_players(vec![(9, "late", 25), (4, "early", 25)]);
        assert_eq!(rankings[0].player_id, 4);
        assert_eq!(rankings[1].player_id, 9);
    }

    #[test]
    fn test_empty_ranking() {
        let rankings = rank_players(Vec::<(PlayerId, &str, u32)>::new());
        assert!(rankings.is_empty());
    }

    #[test]
    fn test_report_serializes() {
        let report = ScoreReport {
            name: "Alice".to_string(),
            tiles: 42,
            kills: 2,
            time_alive_secs: 12.5,
            highest_rank: 1,
            seconds_ranked_first: 3.0,
            death_type: death_type_name(DeathType::SelfHit),
            killer: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tiles"], 42);
        assert_eq!(json["death_type"], "self");
        assert!(json["killer"].is_null());
    }

    #[test]
    fn test_recording_sink_shares_storage() {
        let sink = RecordingScoreSink::new();
        let clone = sink.clone();
        clone.report_player_score(&ScoreReport {
            name: "Bob".to_string(),
            tiles: 1,
            kills: 0,
            time_alive_secs: 0.0,
            highest_rank: 3,
            seconds_ranked_first: 0.0,
            death_type: "bounds",
            killer: None,
        });
        assert_eq!(sink.reports().len(), 1);
    }
}
