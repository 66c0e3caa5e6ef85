//! Deckhand kube integration: the cluster handle and error classification.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::debug;

use deckhand_core::ResourceDocument;

/// Failures at the cluster boundary.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster configuration: {0}")]
    Config(String),
    #[error("api error ({code} {reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("kind not served by the cluster: {0}")]
    UnknownKind(String),
    #[error("document is not a valid resource: {0}")]
    InvalidResource(String),
}

/// Capability the applier borrows for one invocation: namespace lookup plus
/// create-or-replace. The owner authenticated it and keeps owning it; the
/// applier never closes or reconfigures it.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Namespace the client is configured for, if any.
    fn namespace(&self) -> Option<String>;

    /// Create the resource in `namespace`, replacing a live object with the
    /// same identity if one exists.
    async fn create_or_replace(
        &self,
        namespace: &str,
        doc: &ResourceDocument,
    ) -> Result<(), ClusterError>;
}

/// Enriches a failed cluster call with an operator-facing diagnostic before
/// the applier surfaces it. A trait so cluster-specific message knowledge
/// stays out of the apply path.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &ClusterError) -> String;
}

/// Status-code aware classifier for stock Kubernetes API errors.
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &ClusterError) -> String {
        match err {
            ClusterError::Api { code: 401, .. } => {
                format!("{err}; the current credentials were rejected, the token may have expired")
            }
            ClusterError::Api { code: 403, .. } => {
                format!("{err}; the current user lacks permission or a quota was exceeded")
            }
            ClusterError::Api { code: 409, .. } => {
                format!("{err}; the live object was modified concurrently")
            }
            ClusterError::Api { code: 422, .. } => {
                format!("{err}; the cluster rejected the manifest contents")
            }
            ClusterError::Transport(_) | ClusterError::Config(_) => {
                format!("{err}; is the cluster reachable from this machine?")
            }
            _ => err.to_string(),
        }
    }
}

/// kube-rs backed handle. API discovery runs once at connect time and is
/// reused for every GVK lookup in the apply loop.
pub struct KubeCluster {
    client: Client,
    discovery: Discovery,
}

impl KubeCluster {
    /// Connect using the standard kubeconfig/in-cluster inference.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(to_cluster_error)?;
        Ok(Self { client, discovery })
    }

    fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        for g in self.discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                if ar.group == group && ar.version == version && ar.kind == kind {
                    return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                }
            }
        }
        Err(ClusterError::UnknownKind(format!("{}/{}", api_version, kind)))
    }
}

fn to_cluster_error(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => ClusterError::Api {
            code: ae.code,
            reason: ae.reason,
            message: ae.message,
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ClusterHandle for KubeCluster {
    fn namespace(&self) -> Option<String> {
        Some(self.client.default_namespace().to_string())
    }

    async fn create_or_replace(
        &self,
        namespace: &str,
        doc: &ResourceDocument,
    ) -> Result<(), ClusterError> {
        let (ar, namespaced) = self.resolve(&doc.api_version, &doc.kind)?;
        let api: Api<DynamicObject> = if namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let mut obj: DynamicObject = serde_json::from_value(doc.raw.clone())
            .map_err(|e| ClusterError::InvalidResource(format!("{}: {}", doc.identity_key(), e)))?;
        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(kind = %doc.kind, name = %doc.name, "already exists, replacing");
                let live = api.get(&doc.name).await.map_err(to_cluster_error)?;
                // replace requires the live resourceVersion
                obj.metadata.resource_version = live.metadata.resource_version;
                api.replace(&doc.name, &PostParams::default(), &obj)
                    .await
                    .map_err(to_cluster_error)?;
                Ok(())
            }
            Err(e) => Err(to_cluster_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_enriches_known_status_codes() {
        let c = DefaultClassifier;
        let auth = ClusterError::Api { code: 401, reason: "Unauthorized".into(), message: "x".into() };
        assert!(c.classify(&auth).contains("token may have expired"));

        let quota = ClusterError::Api { code: 403, reason: "Forbidden".into(), message: "quota".into() };
        assert!(c.classify(&quota).contains("quota"));

        let conflict = ClusterError::Api { code: 409, reason: "Conflict".into(), message: "x".into() };
        assert!(c.classify(&conflict).contains("modified concurrently"));

        let transport = ClusterError::Transport("connection refused".into());
        assert!(c.classify(&transport).contains("reachable"));
    }

    #[test]
    fn classifier_passes_unknown_errors_through() {
        let c = DefaultClassifier;
        let e = ClusterError::Api { code: 500, reason: "InternalError".into(), message: "boom".into() };
        assert_eq!(c.classify(&e), e.to_string());
    }

    #[test]
    fn kube_api_errors_keep_status_details() {
        let e = to_cluster_error(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "deployments.apps is forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        }));
        match e {
            ClusterError::Api { code, reason, .. } => {
                assert_eq!(code, 403);
                assert_eq!(reason, "Forbidden");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
