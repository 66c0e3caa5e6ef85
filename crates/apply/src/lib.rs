//! Deckhand apply: one-shot application of a rendered manifest.
//!
//! Takes the deployment target chosen for this invocation, reads the manifest
//! the renderer wrote for that target, and submits every resource to the
//! cluster in manifest order with create-or-replace semantics. Stops at the
//! first failure; whatever was applied before it stays applied.

#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use deckhand_core::{
    dedup_by_identity, has_registry, select_target, DeploymentResult, DeploymentTarget,
    ImageBuildProvenance, ResourceDocument, S2I,
};
use deckhand_kubehub::{ClusterError, ClusterHandle, ErrorClassifier};

/// Everything that can end a deploy invocation. All of these are fatal to
/// the invocation; the caller decides what happens to the larger pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("a deployment was requested but no container image build produced a result; configure one of the image providers: jib, docker, s2i")]
    NoImageBuilder,
    #[error("multiple container image builds produced results ({}); refusing to guess which image to deploy", providers.join(", "))]
    AmbiguousImageBuilder { providers: Vec<String> },
    #[error("can't find the rendered manifest: {}", path.display())]
    ManifestNotFound { path: PathBuf },
    #[error("failed to parse manifest {}: {message}", path.display())]
    ManifestParse { path: PathBuf, message: String },
    #[error("error reading manifest {}: {source}", path.display())]
    ManifestIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("applying {kind} {name}: {detail}")]
    Cluster {
        kind: String,
        name: String,
        detail: String,
        #[source]
        source: ClusterError,
    },
    #[error("no {kind} found under: {}", path.display())]
    TargetResourceMissing { kind: String, path: PathBuf },
}

/// Entry point for one deploy invocation.
///
/// Validates the image-build inputs before any I/O, picks the deployment
/// target and applies the manifest rendered for it.
pub async fn deploy(
    image_results: &[ImageBuildProvenance],
    candidates: &[DeploymentTarget],
    client: &dyn ClusterHandle,
    classifier: &dyn ErrorClassifier,
    output_dir: &Path,
) -> Result<DeploymentResult, DeployError> {
    let provenance = match image_results {
        [] => return Err(DeployError::NoImageBuilder),
        [one] => one,
        many => {
            return Err(DeployError::AmbiguousImageBuilder {
                providers: many.iter().map(|p| p.provider.clone()).collect(),
            })
        }
    };
    if !has_registry(&provenance.image) && provenance.provider != S2I {
        warn!(
            image = %provenance.image,
            "a deployment was requested but the image will not be pushed to any registry; \
             the deployment will only work if the cluster uses the local container daemon"
        );
    }
    let target = select_target(candidates, provenance);
    info!(platform = %target.platform, kind = %target.kind, "selected deployment target");
    apply_manifest(&target, client, classifier, output_dir).await
}

/// Apply the manifest rendered for `target` and report the primary workload.
pub async fn apply_manifest(
    target: &DeploymentTarget,
    client: &dyn ClusterHandle,
    classifier: &dyn ErrorClassifier,
    output_dir: &Path,
) -> Result<DeploymentResult, DeployError> {
    let t0 = Instant::now();
    counter!("deploy_attempts", 1u64);
    let result = run_apply(target, client, classifier, output_dir).await;
    match &result {
        Ok(r) => {
            histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("deploy_ok", 1u64);
            info!(name = %r.name, took_ms = %t0.elapsed().as_millis(), "deploy ok");
        }
        Err(_) => {
            counter!("deploy_err", 1u64);
        }
    }
    result
}

async fn run_apply(
    target: &DeploymentTarget,
    client: &dyn ClusterHandle,
    classifier: &dyn ErrorClassifier,
    output_dir: &Path,
) -> Result<DeploymentResult, DeployError> {
    let namespace = client.namespace().unwrap_or_else(|| "default".to_string());
    let path = manifest_path(output_dir, target);
    info!(
        platform = %target.platform,
        namespace = %namespace,
        path = %path.display(),
        "deploying"
    );

    let documents = read_manifest(&path)?;

    // Resources are applied one at a time in manifest order; later documents
    // may implicitly depend on earlier ones (namespaces before workloads).
    let mut applied = 0usize;
    for doc in dedup_by_identity(&documents) {
        if let Err(e) = client.create_or_replace(&namespace, &doc).await {
            let detail = classifier.classify(&e);
            return Err(DeployError::Cluster {
                kind: doc.kind,
                name: doc.name,
                detail,
                source: e,
            });
        }
        counter!("resources_applied", 1u64);
        applied += 1;
        info!(kind = %doc.kind, name = %doc.name, "applied");
    }
    debug!(parsed = documents.len(), applied, "apply loop done");

    // Duplicates share identity, so scanning the pre-dedup sequence is fine.
    let primary = documents
        .iter()
        .find(|d| d.kind == target.kind)
        .ok_or_else(|| DeployError::TargetResourceMissing {
            kind: target.kind.clone(),
            path: path.clone(),
        })?;
    Ok(DeploymentResult { name: primary.name.clone(), labels: primary.labels.clone() })
}

/// Where the manifest renderer writes the file for a platform. The renderer
/// and this applier must agree on this layout.
pub fn manifest_path(output_dir: &Path, target: &DeploymentTarget) -> PathBuf {
    output_dir
        .join("kubernetes")
        .join(format!("{}.yml", target.platform.to_lowercase()))
}

fn read_manifest(path: &Path) -> Result<Vec<ResourceDocument>, DeployError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeployError::ManifestNotFound { path: path.to_path_buf() })
        }
        Err(e) => return Err(DeployError::ManifestIo { path: path.to_path_buf(), source: e }),
    };
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| DeployError::ManifestIo { path: path.to_path_buf(), source: e })?;
    // the handle drops here, released on every exit path
    parse_documents(&text)
        .map_err(|e| DeployError::ManifestParse { path: path.to_path_buf(), message: format!("{e:#}") })
}

/// Parse a multi-document YAML manifest into resource documents.
///
/// A document of kind List is flattened into its items. Null documents (a
/// trailing `---` for instance) are skipped.
pub fn parse_documents(text: &str) -> anyhow::Result<Vec<ResourceDocument>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc).context("parsing YAML")?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).context("converting YAML to JSON")?;
        if json.get("kind").and_then(Json::as_str) == Some("List") {
            for item in json.get("items").and_then(Json::as_array).cloned().unwrap_or_default() {
                out.push(ResourceDocument::from_json(item)?);
            }
        } else {
            out.push(ResourceDocument::from_json(json)?);
        }
    }
    Ok(out)
}
