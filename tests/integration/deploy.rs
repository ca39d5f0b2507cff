#[path = "common/mod.rs"]
mod common;

use common::HomeEnvGuard;
use stigmer::{
    deploy::{self, ApplyOutcome},
    manifest::{Manifest, ResourceKind},
};

fn sample_manifest() -> Manifest {
    serde_json::from_str(
        r#"{
            "agents": [
                {"metadata": {"name": "code-reviewer", "displayName": "Code Reviewer"},
                 "spec": {"description": "Reviews pull requests"}}
            ],
            "workflows": [
                {"metadata": {"name": "review-pipeline"},
                 "spec": {"steps": [{"name": "review", "message": "reviewed"}]}}
            ],
            "skills": [
                {"metadata": {"name": "lint"}, "spec": {}}
            ]
        }"#,
    )
    .expect("manifest")
}

#[test]
fn dry_run_contacts_nothing_and_reports_every_entry() {
    let _home = HomeEnvGuard::new();
    unsafe {
        // If anything tried to dial, this endpoint would refuse instantly.
        std::env::set_var(stigmer::constants::ENV_SERVER_ADDR, "localhost:1");
    }

    let report = deploy::apply_dry_run(&sample_manifest());
    assert_eq!(report.results.len(), 3);
    assert!(report
        .results
        .iter()
        .all(|result| result.outcome == ApplyOutcome::WouldApply));
    assert!(!report.has_failures());

    // Skills first, then agents, then workflows.
    assert_eq!(report.results[0].kind, ResourceKind::Skill);
    assert_eq!(report.results[1].kind, ResourceKind::Agent);
    assert_eq!(report.results[2].kind, ResourceKind::Workflow);

    unsafe {
        std::env::remove_var(stigmer::constants::ENV_SERVER_ADDR);
    }
}

#[test]
fn minted_ids_are_kind_prefixed_ulids() {
    let id = deploy::mint_id(ResourceKind::Agent);
    let (prefix, rest) = id.split_once('-').expect("separator");
    assert_eq!(prefix, "agt");
    assert_eq!(rest.len(), 26);
    assert_eq!(rest, rest.to_lowercase());
}

#[test]
fn summary_line_matches_the_apply_contract() {
    let report = deploy::apply_dry_run(&sample_manifest());
    // Dry runs count toward the summary the same way successes do.
    assert_eq!(report.summary(), "Deployed: 1 agent(s) and 1 workflow(s)");
}
