//! Kubernetes objects and readiness waits
//!
//! Objects are `(present, current)`. Every manifest nodeforge applies
//! carries a checksum annotation over its own body, which is how drift is
//! detected without reading the object back.

use crate::error::HostResultExt;
use async_trait::async_trait;
use nodeforge_host::{sha256_hex, KubeClient};
use nodeforge_workflow::{
    Axis, Compensation, ErrorKind, Metadata, Observation, Outcome, PairedResource, Poller, Result,
    StepContext, StepError, StepHandler, StepState,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Annotation holding the SHA-256 of the manifest body
pub const CHECKSUM_ANNOTATION: &str = "nodeforge.io/checksum";

pub fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    })
}

pub fn secret_manifest(name: &str, namespace: &str, data: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": { "name": name, "namespace": namespace },
        "stringData": data,
    })
}

pub fn config_map_manifest(name: &str, namespace: &str, key: &str, content: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace },
        "data": { key: content },
    })
}

/// A single object applied from a generated manifest
pub struct KubeObject {
    kube: Arc<dyn KubeClient>,
    kind: String,
    name: String,
    namespace: Option<String>,
    checksum: String,
    manifest: String,
}

impl KubeObject {
    /// Fails with `IllegalArgument` when `body` lacks `kind` or
    /// `metadata.name`
    pub fn new(kube: Arc<dyn KubeClient>, mut body: Value) -> Result<Self> {
        let kind = body["kind"]
            .as_str()
            .ok_or_else(|| StepError::IllegalArgument("manifest without kind".to_string()))?
            .to_string();
        let name = body["metadata"]["name"]
            .as_str()
            .ok_or_else(|| StepError::IllegalArgument(format!("{} without metadata.name", kind)))?
            .to_string();
        let namespace = body["metadata"]["namespace"].as_str().map(str::to_string);

        let checksum = sha256_hex(body.to_string().as_bytes());
        body["metadata"]["annotations"] = json!({ CHECKSUM_ANNOTATION: checksum });
        let manifest = serde_yaml::to_string(&body)
            .map_err(|e| StepError::IllegalArgument(format!("{} {}: {}", kind, name, e)))?;

        Ok(Self {
            kube,
            kind,
            name,
            namespace,
            checksum,
            manifest,
        })
    }

    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    fn resource_kind(&self) -> String {
        self.kind.to_ascii_lowercase()
    }
}

#[async_trait]
impl PairedResource for KubeObject {
    fn describe(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{} {}/{}", self.kind, namespace, self.name),
            None => format!("{} {}", self.kind, self.name),
        }
    }

    fn axes(&self) -> (Axis, Axis) {
        (Axis::new("Present"), Axis::new("Current"))
    }

    async fn observe(&self, ctx: &StepContext) -> Result<Observation> {
        let cancel = ctx.cancellation();
        let kind = self.resource_kind();
        let namespace = self.namespace.as_deref();
        let present = self
            .kube
            .resource_exists(cancel, &kind, &self.name, namespace)
            .await
            .kind(ErrorKind::IllegalState)?;
        if !present {
            return Ok(Observation::default());
        }
        let checksum = self
            .kube
            .annotation(cancel, &kind, &self.name, namespace, CHECKSUM_ANNOTATION)
            .await
            .kind(ErrorKind::IllegalState)?;
        Ok(Observation::new(
            true,
            checksum.as_deref() == Some(self.checksum.as_str()),
        ))
    }

    async fn apply_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.kube
            .apply_manifest(ctx.cancellation(), &self.manifest)
            .await
            .kind(ErrorKind::Installation)
    }

    async fn apply_second(&self, ctx: &StepContext, _state: &mut StepState) -> Result<()> {
        self.kube
            .apply_manifest(ctx.cancellation(), &self.manifest)
            .await
            .kind(ErrorKind::Configuration)
    }

    async fn revert_first(&self, ctx: &StepContext, _state: &mut StepState) -> Result<Compensation> {
        self.kube
            .delete_manifest(ctx.cancellation(), &self.manifest)
            .await
            .kind(ErrorKind::Installation)?;
        Ok(Compensation::Reverted)
    }

    // the previous body is not kept, so an update of a pre-existing object stays
    async fn revert_second(
        &self,
        _ctx: &StepContext,
        _state: &mut StepState,
    ) -> Result<Compensation> {
        Ok(Compensation::Retained)
    }

    fn annotate(&self, metadata: &mut Metadata) {
        metadata.insert("kind".to_string(), self.kind.clone());
        metadata.insert("name".to_string(), self.name.clone());
    }
}

/// Waits until every pod in a namespace whose name starts with a prefix is
/// Ready. Changes nothing, so there is nothing to roll back.
pub struct WaitForPods {
    kube: Arc<dyn KubeClient>,
    namespace: String,
    prefix: String,
    poller: Poller,
}

impl WaitForPods {
    pub fn new(
        kube: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        prefix: impl Into<String>,
        poller: Poller,
    ) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
            prefix: prefix.into(),
            poller,
        }
    }
}

#[async_trait]
impl StepHandler for WaitForPods {
    async fn execute(
        &self,
        ctx: &StepContext,
        _state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        metadata.insert("namespace".to_string(), self.namespace.clone());
        metadata.insert("prefix".to_string(), self.prefix.clone());
        self.kube
            .wait_for_pods(ctx.cancellation(), &self.namespace, &self.prefix, &self.poller)
            .await
            .kind(ErrorKind::IllegalState)?;
        info!(namespace = %self.namespace, prefix = %self.prefix, "Pods ready");
        Ok(Outcome::Changed)
    }
}

/// Waits until a CustomResourceDefinition is registered
pub struct WaitForCrd {
    kube: Arc<dyn KubeClient>,
    name: String,
    poller: Poller,
}

impl WaitForCrd {
    pub fn new(kube: Arc<dyn KubeClient>, name: impl Into<String>, poller: Poller) -> Self {
        Self {
            kube,
            name: name.into(),
            poller,
        }
    }
}

#[async_trait]
impl StepHandler for WaitForCrd {
    async fn execute(
        &self,
        ctx: &StepContext,
        _state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        metadata.insert("crd".to_string(), self.name.clone());
        let cancel = ctx.cancellation();
        let kube = &self.kube;
        let name = self.name.as_str();
        self.poller
            .wait(cancel, move || async move {
                match kube.crd_exists(cancel, name).await {
                    Ok(exists) => exists,
                    Err(e) => {
                        debug!(crd = name, error = %e, "CRD lookup failed, retrying");
                        false
                    }
                }
            })
            .await?;
        info!(crd = %self.name, "CRD registered");
        Ok(Outcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_host::{FakeKube, PodInfo};
    use nodeforge_workflow::{paired_step, Step};
    use std::time::Duration;

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let kube = Arc::new(FakeKube::new());
        let object = KubeObject::new(kube.clone(), namespace_manifest("monitoring")).unwrap();
        assert!(object.manifest().contains(CHECKSUM_ANNOTATION));
        let mut step = paired_step("create-namespace", object).unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert!(report.is_success());
        assert!(kube.has_resource("namespace", "monitoring", None));

        let mut again = paired_step(
            "create-namespace",
            KubeObject::new(kube.clone(), namespace_manifest("monitoring")).unwrap(),
        )
        .unwrap();
        assert!(again.execute(&ctx).await.is_skipped());

        assert!(step.rollback(&ctx).await.is_success());
        assert!(!kube.has_resource("namespace", "monitoring", None));
    }

    #[tokio::test]
    async fn test_changed_config_map_is_updated_and_retained() {
        let kube = Arc::new(FakeKube::new());
        let old = KubeObject::new(
            kube.clone(),
            config_map_manifest("alloy-config", "monitoring", "config.alloy", "old"),
        )
        .unwrap();
        kube.apply_manifest(&Default::default(), old.manifest())
            .await
            .unwrap();

        let mut step = paired_step(
            "deploy-config",
            KubeObject::new(
                kube.clone(),
                config_map_manifest("alloy-config", "monitoring", "config.alloy", "new"),
            )
            .unwrap(),
        )
        .unwrap();
        let ctx = StepContext::new();

        let report = step.execute(&ctx).await;
        assert_eq!(report.metadata["alreadyPresent"], "true");
        assert_eq!(report.metadata["currentByThisStep"], "true");

        let rollback = step.rollback(&ctx).await;
        assert!(rollback.is_skipped());
        assert_eq!(rollback.metadata["CurrentRetained"], "true");
        assert!(kube.has_resource("configmap", "alloy-config", Some("monitoring")));
    }

    #[test]
    fn test_invalid_body() {
        let kube = Arc::new(FakeKube::new());
        assert!(matches!(
            KubeObject::new(kube, json!({"kind": "Secret", "metadata": {}})),
            Err(StepError::IllegalArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pods_timeout() {
        let kube = Arc::new(FakeKube::new());
        kube.set_pods(
            "monitoring",
            vec![PodInfo {
                name: "alloy-0".to_string(),
                phase: "Pending".to_string(),
                ready: false,
            }],
        );
        let mut step = Step::builder("wait-alloy")
            .handler(WaitForPods::new(
                kube,
                "monitoring",
                "alloy",
                Poller::new(Duration::from_secs(10), Duration::from_secs(1)),
            ))
            .build()
            .unwrap();

        let report = step.execute(&StepContext::new()).await;
        assert_eq!(report.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_crd() {
        let kube = Arc::new(FakeKube::new());
        kube.add_crd("servicemonitors.monitoring.coreos.com");
        let mut step = Step::builder("wait-crds")
            .handler(WaitForCrd::new(
                kube,
                "servicemonitors.monitoring.coreos.com",
                Poller::new(Duration::from_secs(10), Duration::from_secs(1)),
            ))
            .build()
            .unwrap();

        let report = step.execute(&StepContext::new()).await;
        assert!(report.is_success());
        assert!(step.rollback(&StepContext::new()).await.is_skipped());
    }
}
