//! Versioned, write-once artifact bundles and the single-player inference
//! path that reads them back.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::attribution::AttributionReport;
use crate::config::{ClusterFamily, PipelineConfig};
use crate::dataset::{PlayerRecord, hex};
use crate::discovery::{ModelSelectionReport, RoleAssignment, RoleModel, SimilarPlayer};
use crate::embedding::Embedding2d;
use crate::error::PipelineError;
use crate::features::ScalingModel;
use crate::projector::{ProjectorModel, VarianceRow};
use crate::stability::StabilityReport;
use crate::surrogate::SurrogateModel;

pub const SCALING_FILE: &str = "scaling_model.json";
pub const PROJECTOR_FILE: &str = "projector_model.json";
pub const ROLE_MODEL_FILE: &str = "role_model.json";
pub const ASSIGNMENTS_FILE: &str = "role_assignments.json";
pub const ASSIGNMENTS_XLSX: &str = "role_assignments.xlsx";
pub const SIMILAR_FILE: &str = "similar_players.json";
pub const MODEL_SELECTION_FILE: &str = "model_selection.json";
pub const STABILITY_FILE: &str = "stability_report.json";
pub const SURROGATE_FILE: &str = "surrogate_model.json";
pub const ATTRIBUTIONS_FILE: &str = "attributions.json";
pub const EMBEDDING_FILE: &str = "embedding_2d.json";
pub const MANIFEST_FILE: &str = "manifest.json";

const VERSION_LEN: usize = 16;

/// Version key: SHA-256 over the cohort digest, the serialized config and
/// the reviewed promotion, so each promoted model gets its own directory.
pub fn version_key(
    cohort_digest: &str,
    cfg: &PipelineConfig,
    promoted_k: usize,
    promoted_family: ClusterFamily,
    review_rationale: &str,
) -> Result<String> {
    let cfg_raw = serde_json::to_vec(cfg).context("serialize config for version key")?;
    let mut hasher = Sha256::new();
    hasher.update(cohort_digest.as_bytes());
    hasher.update(b"\n");
    hasher.update(&cfg_raw);
    hasher.update(format!("\nk={promoted_k};family={}\n", promoted_family.label()).as_bytes());
    hasher.update(review_rationale.as_bytes());
    let digest = hex(&hasher.finalize());
    Ok(digest[..VERSION_LEN].to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub created_at: String,
    pub crate_version: String,
    pub cohort_digest: String,
    pub players: usize,
    #[serde(default)]
    pub excluded_low_minutes: Vec<String>,
    #[serde(default)]
    pub excluded_goalkeepers: Vec<String>,
    pub retained_features: Vec<String>,
    pub retained_components: usize,
    pub variance_table: Vec<VarianceRow>,
    pub promoted_k: usize,
    pub promoted_family: ClusterFamily,
    pub stability_mean: f64,
    pub review_rationale: String,
    pub config: PipelineConfig,
    pub files: Vec<String>,
}

/// Everything one pipeline run produces.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub manifest: Manifest,
    pub scaling: ScalingModel,
    pub projector: ProjectorModel,
    pub role_model: RoleModel,
    pub assignments: Vec<RoleAssignment>,
    /// Same-role neighbours per player id, nearest first.
    pub similar: BTreeMap<String, Vec<SimilarPlayer>>,
    pub model_selection: ModelSelectionReport,
    pub stability: StabilityReport,
    pub surrogate: SurrogateModel,
    pub attributions: AttributionReport,
    pub embedding: Option<Embedding2d>,
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = dir.join(name);
    let raw = serde_json::to_string_pretty(value).with_context(|| format!("serialize {name}"))?;
    fs::write(&path, raw).with_context(|| format!("write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Fills `<root>/.<version>.tmp` and renames it to `<root>/<version>` once
/// `fill` succeeds, so a version directory only ever holds a complete bundle.
/// On failure the staging directory is removed.
fn commit_staged(
    root: &Path,
    version: &str,
    fill: impl FnOnce(&Path) -> Result<()>,
) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let dir = root.join(version);
    let exists = || PipelineError::ArtifactExists {
        version: version.to_string(),
    };
    if dir.exists() {
        return Err(exists().into());
    }

    let staging = root.join(format!(".{version}.tmp"));
    if staging.exists() {
        warn!(dir = %staging.display(), "removing staging directory of an interrupted write");
        fs::remove_dir_all(&staging).with_context(|| format!("remove {}", staging.display()))?;
    }
    fs::create_dir(&staging).with_context(|| format!("create {}", staging.display()))?;
    if let Err(err) = fill(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    if dir.exists() {
        let _ = fs::remove_dir_all(&staging);
        return Err(exists().into());
    }
    if let Err(err) = fs::rename(&staging, &dir) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err).with_context(|| format!("move bundle into {}", dir.display()));
    }
    Ok(dir)
}

impl ArtifactBundle {
    /// Writes the bundle to `<root>/<version>/`. An existing version
    /// directory is never touched and yields [`PipelineError::ArtifactExists`].
    pub fn write(&self, root: &Path) -> Result<PathBuf> {
        let dir = commit_staged(root, &self.manifest.version, |dir| self.write_files(dir))?;
        info!(version = %self.manifest.version, dir = %dir.display(), "bundle written");
        Ok(dir)
    }

    fn write_files(&self, dir: &Path) -> Result<()> {
        write_json(dir, SCALING_FILE, &self.scaling)?;
        write_json(dir, PROJECTOR_FILE, &self.projector)?;
        write_json(dir, ROLE_MODEL_FILE, &self.role_model)?;
        write_json(dir, ASSIGNMENTS_FILE, &self.assignments)?;
        write_json(dir, SIMILAR_FILE, &self.similar)?;
        write_json(dir, MODEL_SELECTION_FILE, &self.model_selection)?;
        write_json(dir, STABILITY_FILE, &self.stability)?;
        write_json(dir, SURROGATE_FILE, &self.surrogate)?;
        write_json(dir, ATTRIBUTIONS_FILE, &self.attributions)?;
        if let Some(embedding) = &self.embedding {
            write_json(dir, EMBEDDING_FILE, embedding)?;
        }
        self.write_workbook(&dir.join(ASSIGNMENTS_XLSX))?;
        write_json(dir, MANIFEST_FILE, &self.manifest)
    }

    pub fn bundle_files(with_embedding: bool) -> Vec<String> {
        let mut files = vec![
            SCALING_FILE,
            PROJECTOR_FILE,
            ROLE_MODEL_FILE,
            ASSIGNMENTS_FILE,
            ASSIGNMENTS_XLSX,
            SIMILAR_FILE,
            MODEL_SELECTION_FILE,
            STABILITY_FILE,
            SURROGATE_FILE,
            ATTRIBUTIONS_FILE,
        ];
        if with_embedding {
            files.push(EMBEDDING_FILE);
        }
        files.push(MANIFEST_FILE);
        files.into_iter().map(str::to_string).collect()
    }

    fn write_workbook(&self, path: &Path) -> Result<()> {
        let mut assignment_rows = vec![vec![
            "Player ID".to_string(),
            "Player".to_string(),
            "Team".to_string(),
            "Cluster".to_string(),
            "Role".to_string(),
            "Confidence".to_string(),
        ]];
        for a in &self.assignments {
            assignment_rows.push(vec![
                a.player_id.clone(),
                a.player.clone(),
                a.team.clone(),
                a.cluster.to_string(),
                a.role_name.clone(),
                format!("{:.4}", a.confidence),
            ]);
        }

        let mut legend_rows = vec![vec![
            "Cluster".to_string(),
            "Role".to_string(),
            "Color".to_string(),
            "Signature".to_string(),
        ]];
        for (id, entry) in &self.role_model.legend {
            legend_rows.push(vec![
                id.to_string(),
                entry.name.clone(),
                entry.color.clone(),
                entry.signature.join(", "),
            ]);
        }

        let mut importance_rows = vec![vec![
            "Feature".to_string(),
            "Mean |Shapley|".to_string(),
            "Permutation Drop".to_string(),
        ]];
        for c in &self.attributions.global.contributions {
            let drop = self
                .attributions
                .permutation
                .iter()
                .find(|p| p.feature == c.feature)
                .map(|p| format!("{:.4}", p.mean_drop))
                .unwrap_or_default();
            importance_rows.push(vec![c.feature.clone(), format!("{:.4}", c.value), drop]);
        }

        let mut workbook = Workbook::new();
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Assignments")?;
            write_rows(sheet, &assignment_rows)?;
        }
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Legend")?;
            write_rows(sheet, &legend_rows)?;
        }
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("GlobalImportance")?;
            write_rows(sheet, &importance_rows)?;
        }
        workbook
            .save(path)
            .with_context(|| format!("failed writing workbook to {}", path.display()))?;
        Ok(())
    }
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleInference {
    pub player_id: String,
    pub cluster: usize,
    pub role_name: String,
    pub confidence: f64,
    pub projected: Vec<f64>,
}

/// The read-only subset of a bundle needed to score new players.
#[derive(Debug, Clone)]
pub struct InferenceBundle {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub scaling: ScalingModel,
    pub projector: ProjectorModel,
    pub role_model: RoleModel,
    pub model_selection: ModelSelectionReport,
    pub similar: BTreeMap<String, Vec<SimilarPlayer>>,
}

impl InferenceBundle {
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest: Manifest = read_json(dir, MANIFEST_FILE)?;
        let scaling: ScalingModel = read_json(dir, SCALING_FILE)?;
        let projector: ProjectorModel = read_json(dir, PROJECTOR_FILE)?;
        let role_model: RoleModel = read_json(dir, ROLE_MODEL_FILE)?;
        let model_selection: ModelSelectionReport = read_json(dir, MODEL_SELECTION_FILE)?;
        let similar: BTreeMap<String, Vec<SimilarPlayer>> = read_json(dir, SIMILAR_FILE)?;
        if scaling.n_features() != projector.mean.len() {
            return Err(PipelineError::invalid_config(format!(
                "bundle {} pairs {} scaled features with a {}-wide projector",
                manifest.version,
                scaling.n_features(),
                projector.mean.len()
            ))
            .into());
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            scaling,
            projector,
            role_model,
            model_selection,
            similar,
        })
    }

    /// Scales with the stored population statistics, projects, and assigns.
    pub fn infer(&self, record: &PlayerRecord) -> Result<RoleInference, PipelineError> {
        if record.is_goalkeeper() {
            warn!(player = %record.player, "scoring a goalkeeper against an outfield role model");
        }
        let scaled = self.scaling.transform_record(record)?;
        let projected = self.projector.transform_row(&scaled);
        let (cluster, role_name, confidence) = self.role_model.assign(&projected);
        Ok(RoleInference {
            player_id: record.player_id.clone(),
            cluster,
            role_name,
            confidence,
            projected,
        })
    }

    /// Same-role neighbours of a player from the fitted population. Empty for
    /// players the bundle was not fit on.
    pub fn similar_to(&self, player_id: &str) -> &[SimilarPlayer] {
        self.similar.get(player_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Prototypical players of `cluster`, closest to the center first.
    pub fn representatives(&self, cluster: usize) -> Vec<String> {
        let report = &self.model_selection;
        report
            .shortlist
            .iter()
            .find(|s| s.k == report.promoted_k && s.family == report.promoted_family)
            .and_then(|s| s.clusters.iter().find(|c| c.cluster == cluster))
            .map(|c| c.representatives.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(
        digest: &str,
        cfg: &PipelineConfig,
        k: usize,
        family: ClusterFamily,
        why: &str,
    ) -> String {
        version_key(digest, cfg, k, family, why).expect("key")
    }

    #[test]
    fn version_key_tracks_data_and_config() {
        let cfg = PipelineConfig::default();
        let a = key("abc", &cfg, 6, ClusterFamily::KMeans, "ok");
        assert_eq!(a.len(), VERSION_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, key("abc", &cfg, 6, ClusterFamily::KMeans, "ok"));
        assert_ne!(a, key("abd", &cfg, 6, ClusterFamily::KMeans, "ok"));

        let reseeded = PipelineConfig {
            seed: cfg.seed + 1,
            ..cfg.clone()
        };
        assert_ne!(a, key("abc", &reseeded, 6, ClusterFamily::KMeans, "ok"));
    }

    #[test]
    fn version_key_tracks_the_reviewed_promotion() {
        let cfg = PipelineConfig::default();
        let base = key("abc", &cfg, 3, ClusterFamily::KMeans, "analyst approved");
        assert_ne!(base, key("abc", &cfg, 4, ClusterFamily::KMeans, "analyst approved"));
        assert_ne!(
            base,
            key("abc", &cfg, 3, ClusterFamily::GaussianMixture, "analyst approved")
        );
        assert_ne!(base, key("abc", &cfg, 3, ClusterFamily::KMeans, "second look"));
    }

    #[test]
    fn failed_fill_leaves_nothing_behind() {
        let root = tempfile::tempdir().expect("tempdir");
        let err = commit_staged(root.path(), "abc123", |dir| {
            fs::write(dir.join(SCALING_FILE), "{}")?;
            Err(anyhow::anyhow!("disk full"))
        })
        .expect_err("fill failure propagates");
        assert!(err.to_string().contains("disk full"));
        assert_eq!(fs::read_dir(root.path()).expect("read root").count(), 0);

        let dir = commit_staged(root.path(), "abc123", |dir| {
            fs::write(dir.join(SCALING_FILE), "{}")?;
            Ok(())
        })
        .expect("retry after a failed write succeeds");
        assert!(dir.join(SCALING_FILE).is_file());

        let again = commit_staged(root.path(), "abc123", |_| Ok(())).expect_err("write-once");
        assert!(matches!(
            again.downcast_ref::<PipelineError>(),
            Some(PipelineError::ArtifactExists { .. })
        ));
    }

    #[test]
    fn manifest_is_written_last() {
        let files = ArtifactBundle::bundle_files(false);
        assert_eq!(files.last().map(String::as_str), Some(MANIFEST_FILE));
        assert!(!files.iter().any(|f| f == EMBEDDING_FILE));
        assert!(ArtifactBundle::bundle_files(true).iter().any(|f| f == EMBEDDING_FILE));
    }
}
