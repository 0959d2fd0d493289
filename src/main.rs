use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use pl_role_discovery::config::{ClusterFamily, PipelineConfig};
use pl_role_discovery::dataset::load_table;
use pl_role_discovery::discovery::{
    DistinctPrototypeReview, InterpretabilityReview, RecordedReview, ReviewDecision,
    ShortlistedConfiguration,
};
use pl_role_discovery::pipeline;

const DEFAULT_OUT_DIR: &str = "artifacts";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let input = arg_value("--input")
        .or_else(|| std::env::var("ROLE_INPUT").ok())
        .map(PathBuf::from)
        .context("missing --input <players.parquet|players.json>")?;
    let out_dir = arg_value("--out")
        .or_else(|| std::env::var("ROLE_OUT_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));

    let cfg = match arg_value("--config") {
        Some(path) => PipelineConfig::from_file(&PathBuf::from(path))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    let reviewer = build_reviewer()?;
    let table = load_table(&input)?;
    let output = pipeline::run(&cfg, &table, reviewer.as_ref())?;
    let dir = output.bundle.write(&out_dir)?;

    let bundle = &output.bundle;
    println!("Role discovery complete");
    println!("Bundle: {}", dir.display());
    println!(
        "Players: {} (excluded: {} low minutes, {} goalkeepers)",
        bundle.manifest.players,
        bundle.manifest.excluded_low_minutes.len(),
        bundle.manifest.excluded_goalkeepers.len()
    );
    println!(
        "Projection: {} components, {:.1}% of variance",
        bundle.projector.retained,
        bundle.projector.retained_ratio() * 100.0
    );
    println!(
        "Promoted: K={} {} | review: {}",
        bundle.role_model.k,
        bundle.role_model.family.label(),
        bundle.model_selection.decision.rationale()
    );
    for (id, entry) in &bundle.role_model.legend {
        let size = bundle.assignments.iter().filter(|a| a.cluster == *id).count();
        println!("  [{id}] {:<40} {:>4} players  {}", entry.name, size, entry.color);
    }
    println!(
        "Stability (ARI): mean {:.3} sd {:.3} -> {}",
        bundle.stability.mean,
        bundle.stability.std,
        if bundle.stability.passed { "ok" } else { "below threshold, review" }
    );
    if let Some(acc) = bundle.surrogate.holdout_accuracy {
        println!("Surrogate holdout accuracy: {acc:.3}");
    }
    if !bundle.attributions.warnings.is_empty() {
        println!("Attribution warnings: {}", bundle.attributions.warnings.len());
        for w in bundle.attributions.warnings.iter().take(8) {
            println!(" - {w}");
        }
    }
    Ok(())
}

/// Exactly one review source is used; without one the shortlist is printed
/// and the run stops before promotion.
fn build_reviewer() -> Result<Box<dyn InterpretabilityReview>> {
    if let Some(raw) = arg_value("--approve") {
        let (k, family) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("--approve expects K:family, got '{raw}'"))?;
        let k: usize = k.trim().parse().with_context(|| format!("parse K in '{raw}'"))?;
        let family = ClusterFamily::parse(family)
            .ok_or_else(|| anyhow!("unknown clustering family in '{raw}'"))?;
        let rationale = arg_value("--rationale")
            .unwrap_or_else(|| format!("approved K={k} {} on the command line", family.label()));
        return Ok(Box::new(RecordedReview { k, family, rationale }));
    }
    if let Some(path) = arg_value("--review-file") {
        return Ok(Box::new(RecordedReview::from_file(&PathBuf::from(path))?));
    }
    if has_flag("--auto-review") {
        return Ok(Box::new(DistinctPrototypeReview::default()));
    }
    Ok(Box::new(|shortlist: &[ShortlistedConfiguration]| {
        print_shortlist(shortlist);
        ReviewDecision::Reject {
            rationale: "no review decision supplied; rerun with --approve K:family, \
                        --review-file <decision.json> or --auto-review"
                .to_string(),
        }
    }))
}

fn print_shortlist(shortlist: &[ShortlistedConfiguration]) {
    println!("Shortlist awaiting review:");
    for cfg in shortlist {
        println!(
            "K={} {} | silhouette {:.3} | davies-bouldin {:.3} | calinski-harabasz {:.1}",
            cfg.k,
            cfg.family.label(),
            cfg.scores.silhouette,
            cfg.scores.davies_bouldin,
            cfg.scores.calinski_harabasz
        );
        for advisory in &cfg.advisories {
            println!("  ! {advisory}");
        }
        for c in &cfg.clusters {
            let top: Vec<String> = c
                .deviations
                .iter()
                .take(3)
                .map(|d| format!("{} {:+.2}", d.feature, d.z))
                .collect();
            println!(
                "  [{}] n={:<4} {} | e.g. {}",
                c.cluster,
                c.size,
                top.join(", "),
                c.representatives.join(", ")
            );
        }
    }
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

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|a| a == flag)
}
