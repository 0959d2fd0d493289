use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pl_role_discovery::artifacts::{InferenceBundle, RoleInference};
use pl_role_discovery::dataset::{build_cohort, load_table, normalize_name};
use pl_role_discovery::discovery::SimilarPlayer;

#[derive(Debug, Serialize)]
struct ScoredPlayer {
    #[serde(flatten)]
    inference: RoleInference,
    player: String,
    team: String,
    role_prototypes: Vec<String>,
    similar_players: Vec<SimilarPlayer>,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let bundle_dir = arg_value("--bundle")
        .map(PathBuf::from)
        .context("missing --bundle <artifacts/VERSION>")?;
    let input = arg_value("--input")
        .map(PathBuf::from)
        .context("missing --input <players.parquet|players.json>")?;
    let only = arg_value("--player").map(|p| normalize_name(&p));
    let similar_n = arg_value("--similar")
        .map(|raw| raw.trim().parse::<usize>())
        .transpose()
        .context("parse --similar <N>")?
        .unwrap_or(0);

    let bundle = InferenceBundle::load(&bundle_dir)?;
    let table = load_table(&input)?;
    // No minutes floor here: a zero-minute row surfaces as a divide-by-zero.
    let cohort = build_cohort(&table, 0.0)?;
    for gk in &cohort.excluded_goalkeepers {
        warn!(player = %gk, "goalkeeper skipped");
    }

    let mut scored = Vec::new();
    for rec in &cohort.records {
        if let Some(id) = &only
            && &rec.player_id != id
        {
            continue;
        }
        let inference = bundle
            .infer(rec)
            .with_context(|| format!("score {}", rec.player))?;
        println!(
            "{:<28} {:<24} -> [{}] {} ({:.2})",
            rec.player, rec.team, inference.cluster, inference.role_name, inference.confidence
        );
        let similar: Vec<SimilarPlayer> = bundle
            .similar_to(&rec.player_id)
            .iter()
            .take(similar_n)
            .cloned()
            .collect();
        for s in &similar {
            println!("    ~ {:<28} {:.3}", s.player, s.distance);
        }
        scored.push(ScoredPlayer {
            role_prototypes: bundle.representatives(inference.cluster),
            similar_players: similar,
            inference,
            player: rec.player.clone(),
            team: rec.team.clone(),
        });
    }
    println!(
        "Scored {} player(s) against bundle {}",
        scored.len(),
        bundle.manifest.version
    );

    if let Some(out) = arg_value("--out") {
        let out_path = PathBuf::from(out);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let raw = serde_json::to_string_pretty(&scored).context("serialize scores")?;
        fs::write(&out_path, raw).with_context(|| format!("write {}", out_path.display()))?;
    }
    Ok(())
}

fn arg_value(flag: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(v) = arg.strip_prefix(&prefix)
            && !v.trim().is_empty()
        {
            return Some(v.to_string());
        }
        if arg == flag
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.clone());
        }
    }
    None
}
