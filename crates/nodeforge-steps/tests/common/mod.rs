//! Fake-backed provisioning context rooted in a temporary directory

use nodeforge_host::{FakeHelm, FakeInstaller, FakeKube, FakeRunner, FakeSystem, PodInfo};
use nodeforge_steps::config::PollConfig;
use nodeforge_steps::{NodeConfig, ProvisionContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const FSTAB: &str = "UUID=3f1c / ext4 errors=remount-ro 0 1\n/swap.img none swap sw 0 0\n";

pub struct Harness {
    pub dir: TempDir,
    pub system: Arc<FakeSystem>,
    pub kube: Arc<FakeKube>,
    pub helm: Arc<FakeHelm>,
    pub runner: Arc<FakeRunner>,
    pub kubelet: Arc<FakeInstaller>,
    pub kubeadm: Arc<FakeInstaller>,
    pub ctx: ProvisionContext,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_system(FakeSystem::new())
    }

    pub fn with_system(system: FakeSystem) -> Self {
        Self::build(system, FakeHelm::new())
    }

    pub fn with_helm(helm: FakeHelm) -> Self {
        Self::build(FakeSystem::new(), helm)
    }

    fn build(system: FakeSystem, helm: FakeHelm) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("fstab"), FSTAB).unwrap();

        let mut config = NodeConfig {
            state_dir: root.join("state"),
            download_dir: root.join("downloads"),
            fstab_path: root.join("fstab"),
            modules_load_dir: root.join("modules-load.d"),
            mount_root: root.join("mounts"),
            bind_targets: ["etc/kubernetes", "var/lib/kubelet", "var/run/cilium"]
                .iter()
                .map(|p| root.join(p))
                .collect(),
            kubeconfig: None,
            poll: PollConfig {
                interval_secs: 1,
                service_timeout_secs: 5,
                crd_timeout_secs: 5,
                pod_timeout_secs: 5,
            },
            ..NodeConfig::default()
        };
        config.kubelet.config_path = root.join("var/lib/kubelet/config.yaml");
        config.kubeadm.package.config_path = root.join("etc/kubernetes/kubeadm-config.yaml");
        config.kubeadm.staged_config_path = root.join("templates/kubeadm-config.yaml.latest");

        let system = Arc::new(system);
        let kube = Arc::new(FakeKube::new());
        let helm = Arc::new(helm);
        let runner = Arc::new(FakeRunner::new());
        let kubelet = Arc::new(FakeInstaller::new("kubelet"));
        let kubeadm = Arc::new(FakeInstaller::new("kubeadm"));

        let ctx = ProvisionContext {
            config,
            runner: runner.clone(),
            system: system.clone(),
            kube: kube.clone(),
            helm: helm.clone(),
            kubelet: kubelet.clone(),
            kubeadm: kubeadm.clone(),
        };

        Self {
            dir,
            system,
            kube,
            helm,
            runner,
            kubelet,
            kubeadm,
            ctx,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn fstab(&self) -> String {
        std::fs::read_to_string(self.path("fstab")).unwrap()
    }

    /// Make every pod the Alloy stack waits for report Ready
    pub fn ready_cluster(&self) {
        self.kube.add_crd("servicemonitors.monitoring.coreos.com");
        self.kube.set_pods(
            "monitoring",
            vec![
                pod("node-exporter-prometheus-node-exporter-7xq2k"),
                pod("alloy-0"),
            ],
        );
    }
}

fn pod(name: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        phase: "Running".to_string(),
        ready: true,
    }
}
