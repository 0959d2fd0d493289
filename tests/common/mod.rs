#![allow(dead_code)]

use std::collections::BTreeMap;

use pl_role_discovery::config::{EmbeddingConfig, PipelineConfig, SurrogateConfig};
use pl_role_discovery::dataset::{
    COL_MINUTES, COL_PLAYER, COL_POSITION, COL_TEAM, RAW_STAT_COUNT, RawCell, RawStat, RawTable,
    required_columns,
};

/// Season totals per profile, in `RawStat::ALL` order.
pub const DEFENSIVE: [f64; RAW_STAT_COUNT] = [
    1.0, 1.0, 10.0, 8.0, 20.0, 1500.0, 60.0, 40.0, 20.0, 5.0, 90.0, 60.0, 40.0, 120.0, 80.0,
];
pub const CREATIVE: [f64; RAW_STAT_COUNT] = [
    5.0, 12.0, 40.0, 80.0, 160.0, 1300.0, 180.0, 150.0, 90.0, 50.0, 30.0, 20.0, 10.0, 10.0, 10.0,
];
pub const SCORING: [f64; RAW_STAT_COUNT] = [
    20.0, 4.0, 110.0, 25.0, 70.0, 500.0, 20.0, 20.0, 40.0, 30.0, 10.0, 5.0, 5.0, 5.0, 30.0,
];

pub const PROFILES: [(&str, &str, [f64; RAW_STAT_COUNT]); 3] = [
    ("Defender", "DF", DEFENSIVE),
    ("Creator", "MF", CREATIVE),
    ("Striker", "FW", SCORING),
];

pub fn row(
    player: &str,
    team: &str,
    position: &str,
    minutes: f64,
    stats: &[f64; RAW_STAT_COUNT],
) -> BTreeMap<String, RawCell> {
    let mut out = BTreeMap::new();
    out.insert(COL_PLAYER.to_string(), RawCell::Text(player.to_string()));
    out.insert(COL_TEAM.to_string(), RawCell::Text(team.to_string()));
    out.insert(COL_POSITION.to_string(), RawCell::Text(position.to_string()));
    out.insert(COL_MINUTES.to_string(), RawCell::Number(minutes));
    for stat in RawStat::ALL {
        out.insert(stat.column().to_string(), RawCell::Number(stats[stat.index()]));
    }
    out
}

/// Deterministic ±4% jitter so players inside a profile are not identical.
pub fn jittered(base: &[f64; RAW_STAT_COUNT], i: usize) -> [f64; RAW_STAT_COUNT] {
    let mut out = *base;
    for (s, v) in out.iter_mut().enumerate() {
        let step = ((i * 7 + s * 3) % 5) as f64 - 2.0;
        *v *= 1.0 + 0.02 * step;
    }
    out
}

pub fn player_name(profile: &str, i: usize) -> String {
    format!("{profile} {i}")
}

pub fn player_id(profile: &str, i: usize) -> String {
    format!("{}_{i}", profile.to_ascii_lowercase())
}

/// Ten players per profile, 30 in total, all above the minutes floor.
pub fn three_profile_table() -> RawTable {
    let mut table = RawTable {
        columns: required_columns().iter().map(|c| c.to_string()).collect(),
        rows: Vec::new(),
    };
    for (name, position, base) in PROFILES {
        for i in 0..10 {
            let minutes = 2400.0 + ((i * 53) % 500) as f64;
            table.rows.push(row(
                &player_name(name, i),
                &format!("Club {}", i % 4),
                position,
                minutes,
                &jittered(&base, i),
            ));
        }
    }
    table
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        k_min: 3,
        k_max: 3,
        bootstrap_samples: 20,
        surrogate: SurrogateConfig {
            n_trees: 30,
            ..SurrogateConfig::default()
        },
        embedding: EmbeddingConfig {
            enabled: true,
            perplexity: 5.0,
            iterations: 250,
        },
        ..PipelineConfig::default()
    }
}
