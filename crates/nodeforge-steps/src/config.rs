//! Node configuration
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-node setup. Templates are compiled in and may be replaced
//! per file through the `*_template` fields.

use nodeforge_host::ChartSpec;
use nodeforge_workflow::Poller;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Built-in templates compiled into the binary
pub const KUBELET_UNIT_TEMPLATE: &str = include_str!("../templates/kubelet.service");
pub const KUBEADM_DROPIN_TEMPLATE: &str = include_str!("../templates/10-kubeadm.conf");
pub const KUBELET_CONFIG_TEMPLATE: &str = include_str!("../templates/kubelet-config.yaml");
pub const KUBEADM_CONFIG_TEMPLATE: &str = include_str!("../templates/kubeadm-config.yaml");
pub const ALLOY_CONFIG_TEMPLATE: &str = include_str!("../templates/config.alloy");

/// Where the configuration is looked up when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeforge/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Replace every `{{ key }}` in `template`
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{ {} }}}}", key), value)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Snapshots of executed workflows, used by teardown
    pub state_dir: PathBuf,
    /// Scratch space for downloads
    pub download_dir: PathBuf,
    pub fstab_path: PathBuf,
    pub modules_load_dir: PathBuf,
    /// Bind-mount sources live under this directory, mirroring the target path
    pub mount_root: PathBuf,
    pub bind_targets: Vec<PathBuf>,
    pub kernel_modules: Vec<String>,
    pub kubeconfig: Option<PathBuf>,
    pub cluster: ClusterConfig,
    pub kubelet: PackageConfig,
    pub kubeadm: KubeadmConfig,
    pub alloy: AlloyConfig,
    pub poll: PollConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/nodeforge/state"),
            download_dir: PathBuf::from("/var/lib/nodeforge/downloads"),
            fstab_path: PathBuf::from("/etc/fstab"),
            modules_load_dir: PathBuf::from("/etc/modules-load.d"),
            mount_root: PathBuf::from("/var/lib/nodeforge/mounts"),
            bind_targets: vec![
                PathBuf::from("/etc/kubernetes"),
                PathBuf::from("/var/lib/kubelet"),
                PathBuf::from("/var/run/cilium"),
            ],
            kernel_modules: vec!["overlay".to_string(), "br_netfilter".to_string()],
            kubeconfig: Some(PathBuf::from("/etc/kubernetes/admin.conf")),
            cluster: ClusterConfig::default(),
            kubelet: PackageConfig::kubelet(),
            kubeadm: KubeadmConfig::default(),
            alloy: AlloyConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_PATH`] when it exists,
    /// falling back to defaults
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !tokio::fs::try_exists(&default).await.unwrap_or(false) {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    fn template_vars(&self) -> Vec<(&str, String)> {
        vec![
            ("kubernetes_version", self.cluster.kubernetes_version.clone()),
            ("pod_subnet", self.cluster.pod_subnet.clone()),
            ("service_subnet", self.cluster.service_subnet.clone()),
            ("cluster_dns", self.cluster.cluster_dns.clone()),
            ("cluster_domain", self.cluster.cluster_domain.clone()),
            ("node_ip", self.cluster.node_ip.clone()),
            (
                "control_plane_endpoint",
                self.cluster.control_plane_endpoint.clone(),
            ),
            (
                "kubelet_path",
                self.kubelet.install_path.display().to_string(),
            ),
            (
                "kubelet_config",
                self.kubelet.config_path.display().to_string(),
            ),
            ("remote_write_url", self.alloy.remote_write_url.clone()),
        ]
    }

    /// Render `template` with the cluster and package settings
    pub fn render(&self, template: &str) -> String {
        let vars = self.template_vars();
        let borrowed: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        render(template, &borrowed)
    }

    pub fn kubelet_unit(&self) -> String {
        self.render(
            self.kubelet
                .unit_template
                .as_deref()
                .unwrap_or(KUBELET_UNIT_TEMPLATE),
        )
    }

    pub fn kubelet_config(&self) -> String {
        self.render(
            self.kubelet
                .config_template
                .as_deref()
                .unwrap_or(KUBELET_CONFIG_TEMPLATE),
        )
    }

    pub fn kubeadm_dropin(&self) -> String {
        self.render(
            self.kubeadm
                .package
                .unit_template
                .as_deref()
                .unwrap_or(KUBEADM_DROPIN_TEMPLATE),
        )
    }

    pub fn kubeadm_config(&self) -> String {
        self.render(
            self.kubeadm
                .package
                .config_template
                .as_deref()
                .unwrap_or(KUBEADM_CONFIG_TEMPLATE),
        )
    }

    pub fn alloy_config(&self) -> String {
        self.render(
            self.alloy
                .config_template
                .as_deref()
                .unwrap_or(ALLOY_CONFIG_TEMPLATE),
        )
    }

    /// Source directory backing the bind mount onto `target`
    pub fn mount_source(&self, target: &Path) -> PathBuf {
        self.mount_root
            .join(target.strip_prefix("/").unwrap_or(target))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubernetes_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    pub cluster_dns: String,
    pub cluster_domain: String,
    pub node_ip: String,
    pub control_plane_endpoint: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: "v1.31.4".to_string(),
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/12".to_string(),
            cluster_dns: "10.96.0.10".to_string(),
            cluster_domain: "cluster.local".to_string(),
            node_ip: "127.0.0.1".to_string(),
            control_plane_endpoint: "127.0.0.1:6443".to_string(),
        }
    }
}

/// A release binary plus the two files nodeforge renders for it
///
/// A package section in the configuration file replaces the default as a
/// whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub install_path: PathBuf,
    /// systemd unit (or drop-in) installed alongside the binary
    pub unit_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_template: Option<String>,
    /// Configuration written by the configure step
    pub config_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_template: Option<String>,
}

impl PackageConfig {
    fn release_url(binary: &str) -> String {
        format!(
            "https://dl.k8s.io/release/{}/bin/linux/amd64/{}",
            ClusterConfig::default().kubernetes_version,
            binary
        )
    }

    pub fn kubelet() -> Self {
        Self {
            url: Self::release_url("kubelet"),
            sha256: None,
            install_path: PathBuf::from("/usr/local/bin/kubelet"),
            unit_path: PathBuf::from("/etc/systemd/system/kubelet.service"),
            unit_template: None,
            config_path: PathBuf::from("/var/lib/kubelet/config.yaml"),
            config_template: None,
        }
    }

    pub fn kubeadm() -> Self {
        Self {
            url: Self::release_url("kubeadm"),
            sha256: None,
            install_path: PathBuf::from("/usr/local/bin/kubeadm"),
            unit_path: PathBuf::from("/etc/systemd/system/kubelet.service.d/10-kubeadm.conf"),
            unit_template: None,
            config_path: PathBuf::from("/etc/kubernetes/kubeadm-config.yaml"),
            config_template: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeadmConfig {
    pub package: PackageConfig,
    /// Staged copy of the configuration; the reset step deletes it so a
    /// stale or corrupted copy never survives into the next run
    pub staged_config_path: PathBuf,
}

impl Default for KubeadmConfig {
    fn default() -> Self {
        Self {
            package: PackageConfig::kubeadm(),
            staged_config_path: PathBuf::from(
                "/var/lib/nodeforge/templates/kubeadm-config.yaml.latest",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlloyConfig {
    pub namespace: String,
    pub external_secrets: ChartSpec,
    pub prometheus_crds: ChartSpec,
    /// CRD that must be registered before Alloy is installed
    pub required_crd: String,
    pub node_exporter: ChartSpec,
    pub chart: ChartSpec,
    pub secret_name: String,
    pub remote_write_url: String,
    pub remote_write_username: String,
    pub remote_write_password: String,
    pub config_map: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_template: Option<String>,
}

impl Default for AlloyConfig {
    fn default() -> Self {
        let namespace = "monitoring".to_string();
        Self {
            external_secrets: ChartSpec {
                release: "external-secrets".to_string(),
                namespace: "external-secrets".to_string(),
                repo_name: "external-secrets".to_string(),
                repo_url: "https://charts.external-secrets.io".to_string(),
                chart: "external-secrets".to_string(),
                version: "0.12.1".to_string(),
                values: Some("installCRDs: true\n".to_string()),
            },
            prometheus_crds: ChartSpec {
                release: "prometheus-operator-crds".to_string(),
                namespace: namespace.clone(),
                repo_name: "prometheus-community".to_string(),
                repo_url: "https://prometheus-community.github.io/helm-charts".to_string(),
                chart: "prometheus-operator-crds".to_string(),
                version: "17.0.2".to_string(),
                values: None,
            },
            required_crd: "servicemonitors.monitoring.coreos.com".to_string(),
            node_exporter: ChartSpec {
                release: "node-exporter".to_string(),
                namespace: namespace.clone(),
                repo_name: "prometheus-community".to_string(),
                repo_url: "https://prometheus-community.github.io/helm-charts".to_string(),
                chart: "prometheus-node-exporter".to_string(),
                version: "4.43.1".to_string(),
                values: Some("prometheus:\n  monitor:\n    enabled: true\n".to_string()),
            },
            chart: ChartSpec {
                release: "alloy".to_string(),
                namespace: namespace.clone(),
                repo_name: "grafana".to_string(),
                repo_url: "https://grafana.github.io/helm-charts".to_string(),
                chart: "alloy".to_string(),
                version: "0.11.0".to_string(),
                values: Some(
                    "alloy:\n  configMap:\n    create: false\n    name: alloy-config\n    key: config.alloy\n  envFrom:\n    - secretRef:\n        name: alloy-credentials\n"
                        .to_string(),
                ),
            },
            namespace,
            secret_name: "alloy-credentials".to_string(),
            remote_write_url: "http://prometheus.monitoring.svc:9090/api/v1/write".to_string(),
            remote_write_username: String::new(),
            remote_write_password: String::new(),
            config_map: "alloy-config".to_string(),
            config_template: None,
        }
    }
}

/// Polling cadence and budgets for readiness waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub service_timeout_secs: u64,
    pub crd_timeout_secs: u64,
    pub pod_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            service_timeout_secs: 30,
            crd_timeout_secs: 60,
            pod_timeout_secs: 300,
        }
    }
}

impl PollConfig {
    fn poller(&self, timeout_secs: u64) -> Poller {
        Poller::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(self.interval_secs),
        )
    }

    pub fn service(&self) -> Poller {
        self.poller(self.service_timeout_secs)
    }

    pub fn crd(&self) -> Poller {
        self.poller(self.crd_timeout_secs)
    }

    pub fn pods(&self) -> Poller {
        self.poller(self.pod_timeout_secs)
    }
}
