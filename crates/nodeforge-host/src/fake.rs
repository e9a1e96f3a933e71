//! In-memory bindings for tests
//!
//! Each fake keeps its state behind a mutex, records every mutating call in
//! a journal and can be told to fail a named operation.

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{HostError, Result};
use crate::helm::{ChartSpec, HelmClient, ReleaseInfo};
use crate::installer::{Configurable, Installer};
use crate::kube::{KubeClient, PodInfo};
use crate::system::SystemManager;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared failure-injection and journal plumbing
#[derive(Debug, Default)]
struct Recorder {
    failures: Mutex<HashSet<String>>,
    journal: Mutex<Vec<String>>,
}

impl Recorder {
    fn fail_on(&self, op: &str) {
        lock(&self.failures).insert(op.to_string());
    }

    fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Check cancellation and injected failures, then journal the call
    fn call(&self, cancel: &CancellationToken, op: &str, target: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(format!("{} {}", op, target)));
        }
        if lock(&self.failures).contains(op) {
            return Err(HostError::Injected(op.to_string()));
        }
        let entry = if target.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, target)
        };
        lock(&self.journal).push(entry);
        Ok(())
    }

    fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }
}

#[derive(Debug, Default)]
struct SystemState {
    enabled: BTreeSet<String>,
    running: BTreeSet<String>,
    modules: BTreeSet<String>,
    mounts: BTreeMap<PathBuf, PathBuf>,
    swap_active: bool,
}

/// In-memory [`SystemManager`]
#[derive(Debug, Default)]
pub struct FakeSystem {
    state: Mutex<SystemState>,
    recorder: Recorder,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, module: &str) -> Self {
        lock(&self.state).modules.insert(module.to_string());
        self
    }

    pub fn with_mount(self, source: &Path, target: &Path) -> Self {
        lock(&self.state)
            .mounts
            .insert(target.to_path_buf(), source.to_path_buf());
        self
    }

    pub fn with_service(self, unit: &str, enabled: bool, running: bool) -> Self {
        {
            let mut state = lock(&self.state);
            if enabled {
                state.enabled.insert(unit.to_string());
            }
            if running {
                state.running.insert(unit.to_string());
            }
        }
        self
    }

    pub fn with_swap(self, active: bool) -> Self {
        lock(&self.state).swap_active = active;
        self
    }

    /// Make the named operation (e.g. `"load_module"`) fail
    pub fn fail_on(&self, op: &str) {
        self.recorder.fail_on(op);
    }

    pub fn clear_failures(&self) {
        self.recorder.clear_failures();
    }

    /// Every successful mutating call, in order
    pub fn journal(&self) -> Vec<String> {
        self.recorder.journal()
    }

    pub fn module_loaded(&self, module: &str) -> bool {
        lock(&self.state).modules.contains(module)
    }

    pub fn mounted(&self, target: &Path) -> bool {
        lock(&self.state).mounts.contains_key(target)
    }

    pub fn service_enabled(&self, unit: &str) -> bool {
        lock(&self.state).enabled.contains(unit)
    }

    pub fn service_running(&self, unit: &str) -> bool {
        lock(&self.state).running.contains(unit)
    }

    pub fn swap_is_active(&self) -> bool {
        lock(&self.state).swap_active
    }
}

#[async_trait]
impl SystemManager for FakeSystem {
    async fn enable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        self.recorder.call(cancel, "enable_service", unit)?;
        lock(&self.state).enabled.insert(unit.to_string());
        Ok(())
    }

    async fn disable_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        self.recorder.call(cancel, "disable_service", unit)?;
        lock(&self.state).enabled.remove(unit);
        Ok(())
    }

    async fn start_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        self.recorder.call(cancel, "start_service", unit)?;
        lock(&self.state).running.insert(unit.to_string());
        Ok(())
    }

    async fn stop_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        self.recorder.call(cancel, "stop_service", unit)?;
        lock(&self.state).running.remove(unit);
        Ok(())
    }

    async fn restart_service(&self, cancel: &CancellationToken, unit: &str) -> Result<()> {
        self.recorder.call(cancel, "restart_service", unit)?;
        lock(&self.state).running.insert(unit.to_string());
        Ok(())
    }

    async fn is_service_enabled(&self, _cancel: &CancellationToken, unit: &str) -> Result<bool> {
        Ok(self.service_enabled(unit))
    }

    async fn is_service_running(&self, _cancel: &CancellationToken, unit: &str) -> Result<bool> {
        Ok(self.service_running(unit))
    }

    async fn daemon_reload(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "daemon_reload", "")
    }

    async fn is_module_loaded(&self, _cancel: &CancellationToken, module: &str) -> Result<bool> {
        Ok(self.module_loaded(module))
    }

    async fn load_module(&self, cancel: &CancellationToken, module: &str) -> Result<()> {
        self.recorder.call(cancel, "load_module", module)?;
        lock(&self.state).modules.insert(module.to_string());
        Ok(())
    }

    async fn unload_module(&self, cancel: &CancellationToken, module: &str) -> Result<()> {
        self.recorder.call(cancel, "unload_module", module)?;
        lock(&self.state).modules.remove(module);
        Ok(())
    }

    async fn is_mounted(&self, _cancel: &CancellationToken, target: &Path) -> Result<bool> {
        Ok(self.mounted(target))
    }

    async fn bind_mount(
        &self,
        cancel: &CancellationToken,
        source: &Path,
        target: &Path,
    ) -> Result<()> {
        self.recorder
            .call(cancel, "bind_mount", &target.display().to_string())?;
        lock(&self.state)
            .mounts
            .insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, cancel: &CancellationToken, target: &Path) -> Result<()> {
        self.recorder
            .call(cancel, "unmount", &target.display().to_string())?;
        lock(&self.state).mounts.remove(target);
        Ok(())
    }

    async fn swap_active(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.swap_is_active())
    }

    async fn swap_off(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "swap_off", "")?;
        lock(&self.state).swap_active = false;
        Ok(())
    }

    async fn swap_on(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "swap_on", "")?;
        lock(&self.state).swap_active = true;
        Ok(())
    }
}

type ObjectKey = (String, String, Option<String>);

#[derive(Debug, Default)]
struct KubeState {
    manifests: Vec<String>,
    objects: BTreeMap<ObjectKey, BTreeMap<String, String>>,
    pods: BTreeMap<String, Vec<PodInfo>>,
}

fn object_key(kind: &str, name: &str, namespace: Option<&str>) -> ObjectKey {
    (
        kind.to_ascii_lowercase(),
        name.to_string(),
        namespace.map(str::to_string),
    )
}

/// Objects declared in a (possibly multi-document) YAML manifest
fn parse_objects(manifest: &str) -> Result<Vec<(ObjectKey, BTreeMap<String, String>)>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| HostError::Parse {
            command: "apply_manifest".to_string(),
            reason: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let (Some(kind), Some(name)) = (
            value["kind"].as_str(),
            value["metadata"]["name"].as_str(),
        ) else {
            return Err(HostError::Parse {
                command: "apply_manifest".to_string(),
                reason: "object without kind or metadata.name".to_string(),
            });
        };
        let annotations = value["metadata"]["annotations"]
            .as_mapping()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let namespace = value["metadata"]["namespace"].as_str();
        objects.push((object_key(kind, name, namespace), annotations));
    }
    Ok(objects)
}

/// In-memory [`KubeClient`]
///
/// Applied manifests are parsed so that `resource_exists` and `annotation`
/// see the objects they declare. Pods are seeded by the test.
#[derive(Debug, Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
    recorder: Recorder,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, kind: &str, name: &str, namespace: Option<&str>) {
        lock(&self.state)
            .objects
            .insert(object_key(kind, name, namespace), BTreeMap::new());
    }

    pub fn remove_resource(&self, kind: &str, name: &str, namespace: Option<&str>) {
        lock(&self.state)
            .objects
            .remove(&object_key(kind, name, namespace));
    }

    pub fn add_crd(&self, name: &str) {
        self.add_resource("customresourcedefinition", name, None);
    }

    pub fn has_resource(&self, kind: &str, name: &str, namespace: Option<&str>) -> bool {
        lock(&self.state)
            .objects
            .contains_key(&object_key(kind, name, namespace))
    }

    pub fn set_pods(&self, namespace: &str, pods: Vec<PodInfo>) {
        lock(&self.state).pods.insert(namespace.to_string(), pods);
    }

    /// Manifests currently applied
    pub fn manifests(&self) -> Vec<String> {
        lock(&self.state).manifests.clone()
    }

    pub fn fail_on(&self, op: &str) {
        self.recorder.fail_on(op);
    }

    pub fn journal(&self) -> Vec<String> {
        self.recorder.journal()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn apply_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()> {
        let objects = parse_objects(manifest)?;
        self.recorder.call(cancel, "apply_manifest", "")?;
        let mut state = lock(&self.state);
        for (key, annotations) in objects {
            state.objects.insert(key, annotations);
        }
        if !state.manifests.iter().any(|m| m == manifest) {
            state.manifests.push(manifest.to_string());
        }
        Ok(())
    }

    async fn delete_manifest(&self, cancel: &CancellationToken, manifest: &str) -> Result<()> {
        let objects = parse_objects(manifest)?;
        self.recorder.call(cancel, "delete_manifest", "")?;
        let mut state = lock(&self.state);
        for (key, _) in objects {
            state.objects.remove(&key);
        }
        state.manifests.retain(|m| m != manifest);
        Ok(())
    }

    async fn resource_exists(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled("resource_exists".to_string()));
        }
        Ok(self.has_resource(kind, name, namespace))
    }

    async fn annotation(
        &self,
        cancel: &CancellationToken,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        key: &str,
    ) -> Result<Option<String>> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled("annotation".to_string()));
        }
        Ok(lock(&self.state)
            .objects
            .get(&object_key(kind, name, namespace))
            .and_then(|annotations| annotations.get(key).cloned()))
    }

    async fn list_pods(&self, cancel: &CancellationToken, namespace: &str) -> Result<Vec<PodInfo>> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled("list_pods".to_string()));
        }
        Ok(lock(&self.state)
            .pods
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory [`HelmClient`]
#[derive(Debug, Default)]
pub struct FakeHelm {
    releases: Mutex<BTreeMap<(String, String), ReleaseInfo>>,
    repos: Mutex<BTreeMap<String, String>>,
    recorder: Recorder,
}

impl FakeHelm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an installed release
    pub fn with_release(self, name: &str, namespace: &str, chart_label: &str) -> Self {
        lock(&self.releases).insert(
            (namespace.to_string(), name.to_string()),
            ReleaseInfo {
                name: name.to_string(),
                namespace: namespace.to_string(),
                chart: chart_label.to_string(),
                app_version: String::new(),
                status: "deployed".to_string(),
            },
        );
        self
    }

    pub fn installed(&self, name: &str, namespace: &str) -> Option<ReleaseInfo> {
        lock(&self.releases)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn repos(&self) -> BTreeMap<String, String> {
        lock(&self.repos).clone()
    }

    pub fn fail_on(&self, op: &str) {
        self.recorder.fail_on(op);
    }

    pub fn journal(&self) -> Vec<String> {
        self.recorder.journal()
    }
}

#[async_trait]
impl HelmClient for FakeHelm {
    async fn release(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ReleaseInfo>> {
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled("helm list".to_string()));
        }
        Ok(self.installed(name, namespace))
    }

    async fn add_repo(&self, cancel: &CancellationToken, name: &str, url: &str) -> Result<()> {
        self.recorder.call(cancel, "add_repo", name)?;
        lock(&self.repos).insert(name.to_string(), url.to_string());
        Ok(())
    }

    async fn deploy_chart(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()> {
        self.recorder.call(cancel, "deploy_chart", &chart.release)?;
        lock(&self.releases).insert(
            (chart.namespace.clone(), chart.release.clone()),
            ReleaseInfo {
                name: chart.release.clone(),
                namespace: chart.namespace.clone(),
                chart: chart.chart_label(),
                app_version: String::new(),
                status: "deployed".to_string(),
            },
        );
        Ok(())
    }

    async fn uninstall_chart(
        &self,
        cancel: &CancellationToken,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        self.recorder.call(cancel, "uninstall_chart", name)?;
        lock(&self.releases).remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InstallerState {
    downloaded: bool,
    installed: bool,
    configured: bool,
}

/// In-memory [`Installer`] + [`Configurable`]
#[derive(Debug, Default)]
pub struct FakeInstaller {
    name: String,
    state: Mutex<InstallerState>,
    recorder: Recorder,
}

impl FakeInstaller {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_installed(self, installed: bool) -> Self {
        lock(&self.state).installed = installed;
        self
    }

    pub fn with_configured(self, configured: bool) -> Self {
        lock(&self.state).configured = configured;
        self
    }

    pub fn fail_on(&self, op: &str) {
        self.recorder.fail_on(op);
    }

    pub fn clear_failures(&self) {
        self.recorder.clear_failures();
    }

    pub fn journal(&self) -> Vec<String> {
        self.recorder.journal()
    }

    pub fn downloaded(&self) -> bool {
        lock(&self.state).downloaded
    }

    pub fn installed(&self) -> bool {
        lock(&self.state).installed
    }

    pub fn configured(&self) -> bool {
        lock(&self.state).configured
    }

    /// Simulate configuration drift on disk
    pub fn drift(&self) {
        lock(&self.state).configured = false;
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_installed(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.installed())
    }

    async fn download(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "download", &self.name)?;
        lock(&self.state).downloaded = true;
        Ok(())
    }

    async fn install(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "install", &self.name)?;
        lock(&self.state).installed = true;
        Ok(())
    }

    async fn cleanup(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "cleanup", &self.name)?;
        lock(&self.state).downloaded = false;
        Ok(())
    }

    async fn uninstall(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "uninstall", &self.name)?;
        lock(&self.state).installed = false;
        Ok(())
    }
}

#[async_trait]
impl Configurable for FakeInstaller {
    async fn is_configured(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.configured())
    }

    async fn configure(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder.call(cancel, "configure", &self.name)?;
        lock(&self.state).configured = true;
        Ok(())
    }

    async fn remove_configuration(&self, cancel: &CancellationToken) -> Result<()> {
        self.recorder
            .call(cancel, "remove_configuration", &self.name)?;
        lock(&self.state).configured = false;
        Ok(())
    }
}

/// [`CommandRunner`] that succeeds without running anything
///
/// Failures are injected per program name, e.g. `fail_on("kubeadm")`.
#[derive(Debug, Default)]
pub struct FakeRunner {
    recorder: Recorder,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, program: &str) {
        self.recorder.fail_on(program);
    }

    /// Every command line that ran
    pub fn journal(&self) -> Vec<String> {
        self.recorder.journal()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cancel: &CancellationToken, spec: &CommandSpec) -> Result<CommandOutput> {
        self.recorder
            .call(cancel, &spec.program, &spec.args.join(" "))?;
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}
