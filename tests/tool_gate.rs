//! Signature gate end to end: discovery, verification and invocation
//! through the `Cynapse` runtime.
#![cfg(unix)]

use cynapse::audit_log::{AuditAction, AuditResult, Severity, SignatureStatus};
use cynapse::config::CynapseConfig;
use cynapse::errors::{CynapseError, ExecutionError};
use cynapse::keys::ToolSigningKey;
use cynapse::registry::ToolManifest;
use cynapse::signature::SignatureRecord;
use cynapse::Cynapse;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup(enforce: bool) -> (TempDir, CynapseConfig, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = CynapseConfig::rooted_at(dir.path());
    config.signature.enforce = enforce;
    config.execution.timeout_secs = 10;

    let tool_dir = config.tool_root.join("hasher");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("hash.sh"), "echo \"hashed $2\"\n").unwrap();
    std::fs::write(
        tool_dir.join("manifest.json"),
        r#"{
            "name": "hasher",
            "version": "2.1.0",
            "description": "digest helper",
            "entry_point": "hash.sh",
            "public_key_id": "release",
            "commands": { "digest": "compute a digest" },
            "author": "ops"
        }"#,
    )
    .unwrap();
    (dir, config, tool_dir)
}

fn sign(config: &CynapseConfig, tool_dir: &Path) {
    let key = ToolSigningKey::generate("release").unwrap();
    key.save_public(&config.keys_dir).unwrap();
    let manifest = ToolManifest::load(tool_dir).unwrap();
    let binary = std::fs::read(&manifest.entry_path).unwrap();
    SignatureRecord::sign(&key, &manifest, &binary)
        .save(&SignatureRecord::path_for(&manifest))
        .unwrap();
}

fn invoke_entries(runtime: &Cynapse) -> Vec<(AuditResult, SignatureStatus, Severity)> {
    runtime
        .audit()
        .entries()
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::Invoke)
        .map(|e| (e.result, e.signature_status, e.severity))
        .collect()
}

#[tokio::test]
async fn verified_tool_runs() {
    let (_dir, config, tool_dir) = setup(true);
    sign(&config, &tool_dir);
    let runtime = Cynapse::open(config, "operator").unwrap();

    let out = runtime
        .run("hasher", "digest", vec!["abc".into()], None)
        .await
        .unwrap();
    assert_eq!(out.stdout.trim(), "hashed abc");
    assert_eq!(
        invoke_entries(&runtime).last().copied(),
        Some((AuditResult::Success, SignatureStatus::Verified, Severity::Info))
    );
}

#[tokio::test]
async fn tampered_binary_never_launches() {
    let (_dir, config, tool_dir) = setup(true);
    sign(&config, &tool_dir);
    let marker = tool_dir.join("launched");
    std::fs::write(
        tool_dir.join("hash.sh"),
        format!("touch {}\necho \"hashed $2\"\n", marker.display()),
    )
    .unwrap();
    let runtime = Cynapse::open(config, "operator").unwrap();

    let err = runtime
        .run("hasher", "digest", vec!["abc".into()], None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CynapseError::Execution(ExecutionError::SignatureRejected { .. })
    ));
    assert!(!marker.exists());
    assert_eq!(
        invoke_entries(&runtime),
        vec![(
            AuditResult::SignatureRejected,
            SignatureStatus::Rejected,
            Severity::Critical
        )]
    );
}

#[tokio::test]
async fn unsigned_tool_with_enforcement_off_is_bypassed_loudly() {
    let (_dir, config, _tool_dir) = setup(false);
    let runtime = Cynapse::open(config, "operator").unwrap();

    runtime
        .run("hasher", "digest", vec!["abc".into()], None)
        .await
        .unwrap();
    let entries = invoke_entries(&runtime);
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|(_, status, severity)| *status == SignatureStatus::Bypassed
            && *severity == Severity::Critical));
}
