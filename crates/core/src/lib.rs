//! Deckhand core types: resource documents, deployment targets, selection.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Platform name of plain Kubernetes targets.
pub const KUBERNETES: &str = "kubernetes";
/// Platform name of OpenShift targets.
pub const OPENSHIFT: &str = "openshift";
/// Workload kind used by the fallback target.
pub const DEPLOYMENT: &str = "Deployment";
/// Provider id of the source-to-image build strategy.
pub const S2I: &str = "s2i";

/// One declarative resource out of a rendered manifest.
///
/// The identity fields are extracted up front; `raw` keeps the full document
/// body so the cluster boundary can submit it unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDocument {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub raw: Json,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document missing {0}")]
    MissingField(&'static str),
}

impl ResourceDocument {
    /// Shape a parsed document into a resource description.
    ///
    /// Only string-valued labels are kept, like the cluster stores them.
    pub fn from_json(raw: Json) -> Result<Self, DocumentError> {
        let api_version = raw
            .get("apiVersion")
            .and_then(Json::as_str)
            .ok_or(DocumentError::MissingField("apiVersion"))?
            .to_string();
        let kind = raw
            .get("kind")
            .and_then(Json::as_str)
            .ok_or(DocumentError::MissingField("kind"))?
            .to_string();
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(Json::as_str)
            .ok_or(DocumentError::MissingField("metadata.name"))?
            .to_string();
        let mut labels = BTreeMap::new();
        if let Some(lbls) = meta.and_then(|m| m.get("labels")).and_then(Json::as_object) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() {
                    labels.insert(k.clone(), val.to_string());
                }
            }
        }
        Ok(Self { api_version, kind, name, labels, raw })
    }

    /// Uniqueness key used to drop duplicate documents within one batch.
    pub fn identity_key(&self) -> String {
        format!("{}/{}:{}", self.api_version, self.kind, self.name)
    }
}

/// Keep the first document seen for each identity key, preserving the
/// relative order of the survivors. The seen set is scoped to this call.
pub fn dedup_by_identity(docs: &[ResourceDocument]) -> Vec<ResourceDocument> {
    let mut seen: HashSet<String> = HashSet::new();
    docs.iter().filter(|d| seen.insert(d.identity_key())).cloned().collect()
}

/// The (platform, workload kind) pair a deploy invocation aims at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentTarget {
    pub platform: String,
    pub kind: String,
}

impl DeploymentTarget {
    pub fn new(platform: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { platform: platform.into(), kind: kind.into() }
    }

    /// Hardcoded target used when no candidate survives selection.
    pub fn fallback() -> Self {
        Self::new(KUBERNETES, DEPLOYMENT)
    }
}

/// Which build strategy produced the container image, and the image
/// reference it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageBuildProvenance {
    pub provider: String,
    pub image: String,
}

/// Terminal output of a deploy invocation: identity of the primary workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentResult {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Pick the deployment target for this invocation.
///
/// An s2i-built image is only deployable as an OpenShift resource, so an s2i
/// provenance restricts the scan to openshift candidates; any other build
/// strategy accepts the first candidate unconditionally. The hardcoded
/// kubernetes/Deployment fallback keeps this total.
pub fn select_target(
    candidates: &[DeploymentTarget],
    provenance: &ImageBuildProvenance,
) -> DeploymentTarget {
    candidates
        .iter()
        .find(|t| provenance.provider != S2I || t.platform == OPENSHIFT)
        .cloned()
        .unwrap_or_else(DeploymentTarget::fallback)
}

/// Whether an image reference names an explicit registry.
///
/// The first path segment is a registry when it looks like a host: contains
/// a dot or a port, or is exactly "localhost".
pub fn has_registry(image: &str) -> bool {
    match image.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}
