use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use ndarray::Array2;
use tracing::info;

use crate::artifacts::{ArtifactBundle, Manifest, version_key};
use crate::attribution::Explainer;
use crate::config::PipelineConfig;
use crate::dataset::{Cohort, RawTable, build_cohort, cohort_digest};
use crate::discovery::{
    DiscoveryInput, InterpretabilityReview, RoleDiscoverer, SimilarPlayer, similar_players,
};
use crate::embedding::embed;
use crate::features::{FeatureBuilder, FeatureSet};
use crate::projector::ProjectorModel;
use crate::stability::StabilityAuditor;
use crate::surrogate::SurrogateModel;

/// A finished run: the bundle to persist plus the in-memory intermediates
/// callers may want to inspect.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub bundle: ArtifactBundle,
    pub cohort: Cohort,
    pub features: FeatureSet,
    pub projected: Array2<f64>,
}

/// Runs every stage in order. Any stage failure aborts the run; nothing is
/// returned partially.
pub fn run(
    cfg: &PipelineConfig,
    table: &RawTable,
    reviewer: &dyn InterpretabilityReview,
) -> Result<PipelineOutput> {
    let started = Instant::now();
    cfg.validate()?;

    let cohort = build_cohort(table, cfg.min_minutes)?;
    let features = FeatureBuilder::new(cfg).build(&cohort.records)?;

    let projector = ProjectorModel::fit(&features.scaled.values, cfg.variance_target)?;
    let projected = projector.transform(&features.scaled.values);

    let discovery = RoleDiscoverer::new(cfg).discover(
        DiscoveryInput {
            records: &cohort.records,
            features: &features,
            projector: &projector,
            projected: &projected,
        },
        reviewer,
    )?;
    let labels = discovery.labels();

    let stability = StabilityAuditor::new(cfg).audit(
        discovery.role_model.family,
        discovery.role_model.k,
        &projected,
        &labels,
    )?;

    let surrogate = SurrogateModel::fit(
        &features.scaled.values,
        &labels,
        &features.scaling.feature_names,
        &cfg.surrogate,
        cfg.seed,
    )?;
    let attributions = Explainer::new(cfg).explain(
        &surrogate,
        &features.scaled.values,
        &features.scaled.player_ids,
        &labels,
    );

    let embedding = cfg
        .embedding
        .enabled
        .then(|| embed(&projected, &features.scaled.player_ids, &cfg.embedding));

    let similar: BTreeMap<String, Vec<SimilarPlayer>> = discovery
        .assignments
        .iter()
        .map(|a| {
            let near = similar_players(
                &discovery.assignments,
                &projected,
                &a.player_id,
                cfg.similar_players,
            )
            .unwrap_or_default();
            (a.player_id.clone(), near)
        })
        .collect();

    let digest = cohort_digest(&cohort.records);
    let review_rationale = discovery.report.decision.rationale().to_string();
    let version = version_key(
        &digest,
        cfg,
        discovery.role_model.k,
        discovery.role_model.family,
        &review_rationale,
    )
    .context("derive bundle version")?;
    let manifest = Manifest {
        version,
        created_at: Utc::now().to_rfc3339(),
        crate_version: env!("CARGO_PKG_VERSION").to_string(),
        cohort_digest: digest,
        players: cohort.records.len(),
        excluded_low_minutes: cohort.excluded_low_minutes.clone(),
        excluded_goalkeepers: cohort.excluded_goalkeepers.clone(),
        retained_features: features.scaling.feature_names.clone(),
        retained_components: projector.retained,
        variance_table: projector.variance_table(),
        promoted_k: discovery.role_model.k,
        promoted_family: discovery.role_model.family,
        stability_mean: stability.mean,
        review_rationale,
        config: cfg.clone(),
        files: ArtifactBundle::bundle_files(embedding.is_some()),
    };

    info!(
        version = %manifest.version,
        players = manifest.players,
        k = manifest.promoted_k,
        family = manifest.promoted_family.label(),
        stability = stability.mean,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "pipeline finished"
    );
    Ok(PipelineOutput {
        bundle: ArtifactBundle {
            manifest,
            scaling: features.scaling.clone(),
            projector,
            role_model: discovery.role_model,
            assignments: discovery.assignments,
            similar,
            model_selection: discovery.report,
            stability,
            surrogate,
            attributions,
            embedding,
        },
        cohort,
        features,
        projected,
    })
}
