use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::PipelineError;

pub const RAW_STAT_COUNT: usize = 15;

/// Raw season counting statistics every input row must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStat {
    Goals,
    Assists,
    ShotsTotal,
    KeyPasses,
    ShotCreatingActions,
    PassesCompleted,
    ProgressivePasses,
    PassesIntoFinalThird,
    ProgressiveCarries,
    SuccessfulTakeOns,
    Tackles,
    Interceptions,
    Blocks,
    Clearances,
    AerialsWon,
}

impl RawStat {
    pub const ALL: [RawStat; RAW_STAT_COUNT] = [
        RawStat::Goals,
        RawStat::Assists,
        RawStat::ShotsTotal,
        RawStat::KeyPasses,
        RawStat::ShotCreatingActions,
        RawStat::PassesCompleted,
        RawStat::ProgressivePasses,
        RawStat::PassesIntoFinalThird,
        RawStat::ProgressiveCarries,
        RawStat::SuccessfulTakeOns,
        RawStat::Tackles,
        RawStat::Interceptions,
        RawStat::Blocks,
        RawStat::Clearances,
        RawStat::AerialsWon,
    ];

    pub fn column(self) -> &'static str {
        match self {
            RawStat::Goals => "goals",
            RawStat::Assists => "assists",
            RawStat::ShotsTotal => "shots_total",
            RawStat::KeyPasses => "key_passes",
            RawStat::ShotCreatingActions => "shot_creating_actions",
            RawStat::PassesCompleted => "passes_completed",
            RawStat::ProgressivePasses => "progressive_passes",
            RawStat::PassesIntoFinalThird => "passes_into_final_third",
            RawStat::ProgressiveCarries => "progressive_carries",
            RawStat::SuccessfulTakeOns => "successful_take_ons",
            RawStat::Tackles => "tackles",
            RawStat::Interceptions => "interceptions",
            RawStat::Blocks => "blocks",
            RawStat::Clearances => "clearances",
            RawStat::AerialsWon => "aerials_won",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

pub const COL_PLAYER: &str = "player";
pub const COL_TEAM: &str = "team";
pub const COL_POSITION: &str = "position";
pub const COL_MINUTES: &str = "minutes";

#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Text(String),
    Number(f64),
    Missing,
    Unsupported(String),
}

/// Input table as loaded from disk, before any schema assertion.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, RawCell>>,
}

/// One outfield player-season after multi-team aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub player_id: String,
    pub player: String,
    pub team: String,
    pub position: String,
    pub minutes: f64,
    pub stats: [f64; RAW_STAT_COUNT],
}

impl PlayerRecord {
    pub fn stat(&self, stat: RawStat) -> f64 {
        self.stats[stat.index()]
    }

    pub fn is_goalkeeper(&self) -> bool {
        is_goalkeeper_position(&self.position)
    }
}

/// Records that made it into the modeling population plus who was left out.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    pub records: Vec<PlayerRecord>,
    pub excluded_low_minutes: Vec<String>,
    pub excluded_goalkeepers: Vec<String>,
}

pub fn required_columns() -> Vec<&'static str> {
    let mut cols = vec![COL_PLAYER, COL_TEAM, COL_POSITION, COL_MINUTES];
    cols.extend(RawStat::ALL.iter().map(|s| s.column()));
    cols
}

pub fn load_table(path: &Path) -> Result<RawTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "parquet" => load_parquet(path),
        "json" => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            parse_json_table(&raw).with_context(|| format!("parse {}", path.display()))
        }
        other => Err(anyhow!("unsupported input extension '{other}' ({})", path.display())),
    }
}

/// Parses a JSON array of row objects.
pub fn parse_json_table(raw: &str) -> Result<RawTable> {
    let value: serde_json::Value = serde_json::from_str(raw).context("decode json")?;
    let serde_json::Value::Array(items) = value else {
        return Err(anyhow!("expected a json array of player rows"));
    };

    let mut table = RawTable::default();
    for (idx, item) in items.into_iter().enumerate() {
        let serde_json::Value::Object(map) = item else {
            return Err(anyhow!("row {idx} is not a json object"));
        };
        if idx == 0 {
            table.columns = map.keys().cloned().collect();
        }
        let row = map
            .into_iter()
            .map(|(k, v)| {
                let cell = match v {
                    serde_json::Value::Null => RawCell::Missing,
                    serde_json::Value::Number(n) => n
                        .as_f64()
                        .map(RawCell::Number)
                        .unwrap_or_else(|| RawCell::Unsupported(n.to_string())),
                    serde_json::Value::String(s) => RawCell::Text(s),
                    other => RawCell::Unsupported(other.to_string()),
                };
                (k, cell)
            })
            .collect();
        table.rows.push(row);
    }
    Ok(table)
}

fn load_parquet(path: &Path) -> Result<RawTable> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file).context("open parquet reader players")?;
    let columns = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>();
    let iter = reader.get_row_iter(None).context("iterate player rows")?;

    let mut rows = Vec::new();
    for (idx, row) in iter.enumerate() {
        let row = row.with_context(|| format!("decode parquet row {idx}"))?;
        let mut out = BTreeMap::new();
        for (name, field) in row.get_column_iter() {
            out.insert(name.clone(), cell_from_field(field));
        }
        rows.push(out);
    }
    Ok(RawTable { columns, rows })
}

fn cell_from_field(field: &Field) -> RawCell {
    match field {
        Field::Null => RawCell::Missing,
        Field::Str(s) => RawCell::Text(s.clone()),
        Field::Double(v) => RawCell::Number(*v),
        Field::Float(v) => RawCell::Number(*v as f64),
        Field::Long(v) => RawCell::Number(*v as f64),
        Field::Int(v) => RawCell::Number(*v as f64),
        Field::Short(v) => RawCell::Number(*v as f64),
        Field::Byte(v) => RawCell::Number(*v as f64),
        Field::ULong(v) => RawCell::Number(*v as f64),
        Field::UInt(v) => RawCell::Number(*v as f64),
        Field::UShort(v) => RawCell::Number(*v as f64),
        Field::UByte(v) => RawCell::Number(*v as f64),
        other => RawCell::Unsupported(format!("{other}")),
    }
}

/// Asserts the schema, aggregates multi-team rows and applies the outfield /
/// minutes filters. Any row-level defect fails the whole batch.
pub fn build_cohort(table: &RawTable, min_minutes: f64) -> Result<Cohort, PipelineError> {
    for col in required_columns() {
        if !table.columns.iter().any(|c| c == col) {
            return Err(PipelineError::schema_header(col, "required column missing"));
        }
    }

    let mut order: Vec<String> = Vec::new();
    let mut merged: BTreeMap<String, PlayerRecord> = BTreeMap::new();
    for (idx, row) in table.rows.iter().enumerate() {
        let rec = parse_row(idx, row)?;
        match merged.get_mut(&rec.player_id) {
            Some(existing) => {
                debug!(player = %rec.player, team = %rec.team, "aggregating multi-team row");
                existing.minutes += rec.minutes;
                for (acc, v) in existing.stats.iter_mut().zip(rec.stats.iter()) {
                    *acc += v;
                }
                if !existing.team.split(", ").any(|t| t == rec.team) {
                    existing.team = format!("{}, {}", existing.team, rec.team);
                }
                if existing.position.is_empty() {
                    existing.position = rec.position;
                }
            }
            None => {
                order.push(rec.player_id.clone());
                merged.insert(rec.player_id.clone(), rec);
            }
        }
    }

    let mut cohort = Cohort::default();
    for id in order {
        let Some(rec) = merged.remove(&id) else {
            continue;
        };
        if rec.is_goalkeeper() {
            cohort.excluded_goalkeepers.push(rec.player_id);
        } else if rec.minutes < min_minutes {
            cohort.excluded_low_minutes.push(rec.player_id);
        } else {
            cohort.records.push(rec);
        }
    }
    info!(
        kept = cohort.records.len(),
        low_minutes = cohort.excluded_low_minutes.len(),
        goalkeepers = cohort.excluded_goalkeepers.len(),
        "cohort built"
    );
    Ok(cohort)
}

fn parse_row(idx: usize, row: &BTreeMap<String, RawCell>) -> Result<PlayerRecord, PipelineError> {
    let player = text_cell(idx, row, COL_PLAYER)?;
    let team = text_cell(idx, row, COL_TEAM)?;
    let position = match row.get(COL_POSITION) {
        Some(RawCell::Text(s)) => s.trim().to_string(),
        Some(RawCell::Missing) => String::new(),
        _ => return Err(PipelineError::schema_row(idx, COL_POSITION, "expected text")),
    };
    let minutes = number_cell(idx, row, COL_MINUTES)?;
    if minutes < 0.0 {
        return Err(PipelineError::schema_row(idx, COL_MINUTES, "negative minutes"));
    }

    let mut stats = [0.0; RAW_STAT_COUNT];
    for stat in RawStat::ALL {
        stats[stat.index()] = number_cell(idx, row, stat.column())?;
    }

    let player_id = normalize_name(&player);
    if player_id.is_empty() {
        return Err(PipelineError::schema_row(idx, COL_PLAYER, "empty player name"));
    }
    Ok(PlayerRecord {
        player_id,
        player,
        team,
        position,
        minutes,
        stats,
    })
}

fn text_cell(
    idx: usize,
    row: &BTreeMap<String, RawCell>,
    col: &str,
) -> Result<String, PipelineError> {
    match row.get(col) {
        Some(RawCell::Text(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(RawCell::Text(_)) => Err(PipelineError::schema_row(idx, col, "empty text")),
        None | Some(RawCell::Missing) => Err(PipelineError::schema_row(idx, col, "missing value")),
        Some(_) => Err(PipelineError::schema_row(idx, col, "expected text")),
    }
}

fn number_cell(
    idx: usize,
    row: &BTreeMap<String, RawCell>,
    col: &str,
) -> Result<f64, PipelineError> {
    match row.get(col) {
        Some(RawCell::Number(v)) if v.is_finite() => Ok(*v),
        Some(RawCell::Number(_)) => Err(PipelineError::schema_row(idx, col, "non-finite number")),
        None | Some(RawCell::Missing) => Err(PipelineError::schema_row(idx, col, "missing value")),
        Some(_) => Err(PipelineError::schema_row(idx, col, "expected number")),
    }
}

pub fn is_goalkeeper_position(position: &str) -> bool {
    position
        .split([',', '/', ' '])
        .any(|tok| tok.trim().eq_ignore_ascii_case("gk"))
}

/// Stable digest of the aggregated population, used in the bundle version key.
pub fn cohort_digest(records: &[PlayerRecord]) -> String {
    let mut hasher = Sha256::new();
    for rec in records {
        hasher.update(rec.player_id.as_bytes());
        hasher.update(rec.team.as_bytes());
        hasher.update(rec.minutes.to_le_bytes());
        for v in rec.stats {
            hasher.update(v.to_le_bytes());
        }
    }
    hex(&hasher.finalize())
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn normalize_name(input: &str) -> String {
    let lower = input.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut prev_us = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_us = false;
        } else if !prev_us && !out.is_empty() {
            out.push('_');
            prev_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_json(player: &str, team: &str, pos: &str, minutes: f64, goals: f64) -> String {
        let mut fields = vec![
            format!("\"player\": \"{player}\""),
            format!("\"team\": \"{team}\""),
            format!("\"position\": \"{pos}\""),
            format!("\"minutes\": {minutes}"),
        ];
        for stat in RawStat::ALL {
            let v = if stat == RawStat::Goals { goals } else { 1.0 };
            fields.push(format!("\"{}\": {v}", stat.column()));
        }
        format!("{{{}}}", fields.join(", "))
    }

    #[test]
    fn normalize_basic() {
        assert_eq!(normalize_name("  Bukayo Saka "), "bukayo_saka");
        assert_eq!(normalize_name("A.B-C"), "a_b_c");
    }

    #[test]
    fn multi_team_rows_are_summed() {
        let raw = format!(
            "[{}, {}]",
            row_json("Jo Ng", "Alpha", "MF", 400.0, 2.0),
            row_json("Jo Ng", "Beta", "MF", 500.0, 3.0)
        );
        let table = parse_json_table(&raw).unwrap();
        let cohort = build_cohort(&table, 600.0).unwrap();
        assert_eq!(cohort.records.len(), 1);
        let rec = &cohort.records[0];
        assert_eq!(rec.minutes, 900.0);
        assert_eq!(rec.stat(RawStat::Goals), 5.0);
        assert_eq!(rec.team, "Alpha, Beta");
    }

    #[test]
    fn goalkeepers_and_low_minutes_are_excluded() {
        let raw = format!(
            "[{}, {}, {}]",
            row_json("Keeper", "Alpha", "GK", 3000.0, 0.0),
            row_json("Bench", "Alpha", "DF", 200.0, 0.0),
            row_json("Starter", "Alpha", "DF,MF", 2500.0, 1.0)
        );
        let cohort = build_cohort(&parse_json_table(&raw).unwrap(), 600.0).unwrap();
        assert_eq!(cohort.records.len(), 1);
        assert_eq!(cohort.excluded_goalkeepers, vec!["keeper"]);
        assert_eq!(cohort.excluded_low_minutes, vec!["bench"]);
    }

    #[test]
    fn missing_column_fails_batch() {
        let raw = r#"[{"player": "x", "team": "y", "position": "MF", "minutes": 900}]"#;
        let err = build_cohort(&parse_json_table(raw).unwrap(), 600.0).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }

    #[test]
    fn ill_typed_cell_fails_batch() {
        let good = row_json("Good", "Alpha", "MF", 900.0, 1.0);
        let bad = row_json("Bad", "Alpha", "MF", 900.0, 1.0)
            .replace("\"tackles\": 1", "\"tackles\": \"many\"");
        let raw = format!("[{good}, {bad}]");
        let err = build_cohort(&parse_json_table(&raw).unwrap(), 600.0).unwrap_err();
        match err {
            PipelineError::SchemaMismatch { location, column, .. } => {
                assert_eq!(location, "row 1");
                assert_eq!(column, "tackles");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
