//! Deploy pipeline: ordered, idempotent upserts of a harvested manifest.
//!
//! Skills deploy first, then agents, then workflows, because later kinds
//! reference earlier ones by slug. Apply is atomic per resource but not
//! across resources; re-running `apply` is the recovery path for partial
//! failures.
use std::{
    fmt,
    sync::{Mutex, OnceLock},
};

use tracing::{info, warn};
use ulid::Generator;

use crate::{
    error::{StigmerError, UpstreamError},
    gateway::Backend,
    manifest::{Manifest, ManifestEntry, ResourceKind},
    rpc::proto::{UpsertOutcome, UpsertRequest},
};

/// Per-resource result of an apply.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The resource did not exist and was created.
    Created,
    /// The resource existed and its spec changed.
    Updated,
    /// The resource existed and its spec was identical.
    Unchanged,
    /// The upsert RPC failed; apply continued with the remaining entries.
    Failed(String),
    /// Dry run: no RPC was issued.
    WouldApply,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Created => write!(f, "created"),
            ApplyOutcome::Updated => write!(f, "updated"),
            ApplyOutcome::Unchanged => write!(f, "unchanged"),
            ApplyOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            ApplyOutcome::WouldApply => write!(f, "would create/update"),
        }
    }
}

/// One line of the deploy report.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResult {
    /// Kind of the resource.
    pub kind: ResourceKind,
    /// Slug of the resource.
    pub slug: String,
    /// Server-confirmed id, when the upsert succeeded.
    pub id: Option<String>,
    /// Outcome of the upsert.
    pub outcome: ApplyOutcome,
}

/// Aggregate result of an apply.
#[derive(Debug, Clone, Default)]
pub struct DeployReport {
    /// Per-resource results, in deploy order.
    pub results: Vec<ResourceResult>,
}

impl DeployReport {
    /// True when any entry failed.
    pub fn has_failures(&self) -> bool {
        self.results
            .iter()
            .any(|result| matches!(result.outcome, ApplyOutcome::Failed(_)))
    }

    fn count(&self, kind: ResourceKind) -> usize {
        self.results
            .iter()
            .filter(|result| {
                result.kind == kind && !matches!(result.outcome, ApplyOutcome::Failed(_))
            })
            .count()
    }

    /// One-line summary printed after apply.
    pub fn summary(&self) -> String {
        format!(
            "Deployed: {} agent(s) and {} workflow(s)",
            self.count(ResourceKind::Agent),
            self.count(ResourceKind::Workflow)
        )
    }
}

/// Mints a time-sortable resource id: `<kind-prefix>-<lowercase ULID>`.
/// A process-local monotonic generator keeps ids ordered within a
/// millisecond.
pub fn mint_id(kind: ResourceKind) -> String {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut guard = generator.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let ulid = guard
        .generate()
        .unwrap_or_else(|_| ulid::Ulid::new());
    format!("{}-{}", kind.id_prefix(), ulid.to_string().to_lowercase())
}

/// Reports what an apply would do without issuing any RPC.
pub fn apply_dry_run(manifest: &Manifest) -> DeployReport {
    let mut report = DeployReport::default();
    for kind in ResourceKind::deploy_order() {
        for entry in manifest.entries(kind) {
            report.results.push(ResourceResult {
                kind,
                slug: entry.metadata.name.clone(),
                id: None,
                outcome: ApplyOutcome::WouldApply,
            });
        }
    }
    report
}

/// Applies a manifest against the backend.
pub fn apply(backend: &Backend, manifest: &Manifest) -> Result<DeployReport, StigmerError> {
    let mut report = DeployReport::default();

    for kind in ResourceKind::deploy_order() {
        for entry in manifest.entries(kind) {
            let slug = entry.metadata.name.clone();
            match upsert(backend, kind, entry) {
                Ok((id, outcome)) => {
                    info!("{} '{}' {}", kind.as_str(), slug, outcome);
                    report.results.push(ResourceResult {
                        kind,
                        slug,
                        id: Some(id),
                        outcome,
                    });
                }
                Err(err) => {
                    warn!("{} '{}' failed: {}", kind.as_str(), slug, err);
                    report.results.push(ResourceResult {
                        kind,
                        slug,
                        id: None,
                        outcome: ApplyOutcome::Failed(err.to_string()),
                    });
                }
            }
        }
    }

    Ok(report)
}

fn upsert(
    backend: &Backend,
    kind: ResourceKind,
    entry: &ManifestEntry,
) -> Result<(String, ApplyOutcome), UpstreamError> {
    let request = UpsertRequest {
        org: backend.org.clone(),
        slug: entry.metadata.name.clone(),
        display_name: entry
            .metadata
            .display_name
            .clone()
            .unwrap_or_else(|| entry.metadata.name.clone()),
        spec_json: entry.spec.to_string(),
        id: mint_id(kind),
    };

    let response = crate::gateway::block_on(async {
        match kind {
            ResourceKind::Skill => backend.skills().upsert_skill(request).await,
            ResourceKind::Agent => backend.agents().upsert_agent(request).await,
            ResourceKind::Workflow => backend.workflows().upsert_workflow(request).await,
        }
    })
    .map_err(|err| UpstreamError::Internal(err.to_string()))?
    .map_err(UpstreamError::from)?
    .into_inner();

    let outcome = match response.outcome() {
        UpsertOutcome::Created => ApplyOutcome::Created,
        UpsertOutcome::Updated => ApplyOutcome::Updated,
        UpsertOutcome::Unchanged => ApplyOutcome::Unchanged,
        UpsertOutcome::Unspecified => ApplyOutcome::Updated,
    };
    Ok((response.id, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_prefixed_lowercase_and_sortable() {
        let first = mint_id(ResourceKind::Agent);
        let second = mint_id(ResourceKind::Agent);

        for id in [&first, &second] {
            let (prefix, ulid) = id.split_once('-').expect("prefix separator");
            assert_eq!(prefix, "agt");
            assert_eq!(ulid.len(), 26);
            assert!(ulid.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
        assert!(second > first, "ids must be monotonic: {first} vs {second}");
    }

    #[test]
    fn id_prefixes_match_kinds() {
        assert!(mint_id(ResourceKind::Skill).starts_with("skl-"));
        assert!(mint_id(ResourceKind::Workflow).starts_with("wfl-"));
    }

    #[test]
    fn dry_run_reports_without_ids_in_deploy_order() {
        let manifest: crate::manifest::Manifest = serde_json::from_str(
            r#"{
                "agents": [{"metadata": {"name": "a"}, "spec": {}}],
                "workflows": [{"metadata": {"name": "w"}, "spec": {}}],
                "skills": [{"metadata": {"name": "s"}, "spec": {}}]
            }"#,
        )
        .expect("manifest");

        let report = apply_dry_run(&manifest);
        let order: Vec<ResourceKind> = report.results.iter().map(|r| r.kind).collect();
        assert_eq!(
            order,
            vec![ResourceKind::Skill, ResourceKind::Agent, ResourceKind::Workflow]
        );
        assert!(report
            .results
            .iter()
            .all(|r| r.id.is_none() && r.outcome == ApplyOutcome::WouldApply));
        assert!(!report.has_failures());
    }

    #[test]
    fn report_summary_counts_agents_and_workflows() {
        let report = DeployReport {
            results: vec![
                ResourceResult {
                    kind: ResourceKind::Agent,
                    slug: "a".into(),
                    id: Some("agt-x".into()),
                    outcome: ApplyOutcome::Created,
                },
                ResourceResult {
                    kind: ResourceKind::Workflow,
                    slug: "w".into(),
                    id: None,
                    outcome: ApplyOutcome::Failed("boom".into()),
                },
                ResourceResult {
                    kind: ResourceKind::Skill,
                    slug: "s".into(),
                    id: Some("skl-x".into()),
                    outcome: ApplyOutcome::Unchanged,
                },
            ],
        };
        assert_eq!(report.summary(), "Deployed: 1 agent(s) and 0 workflow(s)");
        assert!(report.has_failures());
    }
}
