//! Host bindings and configuration shared by every workflow builder

use crate::config::{NodeConfig, PackageConfig};
use crate::steps::software::Package;
use nodeforge_host::{
    CommandRunner, HelmCli, HelmClient, KubeClient, KubectlClient, LinuxSystem, ProcessRunner,
    ReleaseBinary, SystemManager,
};
use std::path::Path;
use std::sync::Arc;

/// Everything a workflow builder needs from the outside world
///
/// Built once at startup and passed by reference; steps clone the `Arc`s
/// they use.
#[derive(Clone)]
pub struct ProvisionContext {
    pub config: NodeConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub system: Arc<dyn SystemManager>,
    pub kube: Arc<dyn KubeClient>,
    pub helm: Arc<dyn HelmClient>,
    pub kubelet: Arc<dyn Package>,
    pub kubeadm: Arc<dyn Package>,
}

fn release_binary(name: &str, package: &PackageConfig, download_dir: &Path, unit: String) -> ReleaseBinary {
    let binary = ReleaseBinary::new(name, &package.url, &package.install_path, download_dir)
        .with_config(&package.unit_path, unit);
    match &package.sha256 {
        Some(digest) => binary.with_sha256(digest),
        None => binary,
    }
}

impl ProvisionContext {
    /// Bindings for the local Linux host
    pub fn linux(config: NodeConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());

        let mut kube = KubectlClient::new(runner.clone());
        let mut helm = HelmCli::new(runner.clone());
        if let Some(kubeconfig) = &config.kubeconfig {
            kube = kube.with_kubeconfig(kubeconfig);
            helm = helm.with_kubeconfig(kubeconfig);
        }

        let kubelet = release_binary(
            "kubelet",
            &config.kubelet,
            &config.download_dir,
            config.kubelet_unit(),
        );
        let kubeadm = release_binary(
            "kubeadm",
            &config.kubeadm.package,
            &config.download_dir,
            config.kubeadm_dropin(),
        );

        Self {
            system: Arc::new(LinuxSystem::new(runner.clone())),
            kube: Arc::new(kube),
            helm: Arc::new(helm),
            kubelet: Arc::new(kubelet),
            kubeadm: Arc::new(kubeadm),
            runner,
            config,
        }
    }
}

impl std::fmt::Debug for ProvisionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("config", &self.config)
            .field("kubelet", &self.kubelet.name())
            .field("kubeadm", &self.kubeadm.name())
            .finish_non_exhaustive()
    }
}
