//! Workflow composition
//!
//! Each builder reads what it needs from the [`ProvisionContext`] and
//! returns a ready-to-run [`Workflow`]. Child order is dependency order.

use crate::context::ProvisionContext;
use crate::steps::{
    config_map_manifest, namespace_manifest, secret_manifest, BindMount, HelmRelease,
    KernelModule, KubeObject, KubeadmReset, PackageDownload, RenderedFile, SoftwarePackage, Swap,
    SystemdService, WaitForCrd, WaitForPods,
};
use nodeforge_host::{ChartSpec, Fstab};
use nodeforge_workflow::{paired_step, Result, Step, Workflow};
use std::collections::BTreeMap;
use std::path::Path;

/// `/var/lib/kubelet` becomes `var-lib-kubelet`
fn path_id(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn helm_step(ctx: &ProvisionContext, id: &str, chart: &ChartSpec) -> Result<Step> {
    paired_step(id, HelmRelease::new(ctx.helm.clone(), chart.clone()))
}

fn wait_for_pods(ctx: &ProvisionContext, id: &str, namespace: &str, prefix: &str) -> Result<Step> {
    Step::builder(id)
        .handler(WaitForPods::new(
            ctx.kube.clone(),
            namespace,
            prefix,
            ctx.config.poll.pods(),
        ))
        .build()
}

/// One step per kernel module
pub fn kernel_modules(ctx: &ProvisionContext) -> Result<Workflow> {
    let mut builder = Workflow::builder("setup-kernel-modules");
    for module in &ctx.config.kernel_modules {
        builder = builder.step(paired_step(
            module.as_str(),
            KernelModule::new(ctx.system.clone(), module.as_str(), &ctx.config.modules_load_dir),
        )?);
    }
    builder.build()
}

/// One step per bind-mount target
pub fn bind_mounts(ctx: &ProvisionContext) -> Result<Workflow> {
    let mut builder = Workflow::builder("setup-bind-mounts");
    for target in &ctx.config.bind_targets {
        builder = builder.step(paired_step(
            path_id(target),
            BindMount::new(
                ctx.system.clone(),
                Fstab::new(&ctx.config.fstab_path),
                ctx.config.mount_source(target),
                target,
            ),
        )?);
    }
    builder.build()
}

pub fn disable_swap(ctx: &ProvisionContext) -> Result<Workflow> {
    Workflow::builder("disable-swap")
        .step(paired_step(
            "swap",
            Swap::new(ctx.system.clone(), Fstab::new(&ctx.config.fstab_path)),
        )?)
        .build()
}

/// install, configure, enable
pub fn kubelet(ctx: &ProvisionContext) -> Result<Workflow> {
    let config = &ctx.config;
    Workflow::builder("setup-kubelet")
        .step(paired_step(
            "install-kubelet",
            SoftwarePackage::new(ctx.kubelet.clone()),
        )?)
        .step(paired_step(
            "configure-kubelet",
            RenderedFile::new(&config.kubelet.config_path, config.kubelet_config()),
        )?)
        .step(paired_step(
            "enable-kubelet",
            SystemdService::new(ctx.system.clone(), "kubelet.service", config.poll.service()),
        )?)
        .build()
}

/// download, install, reset prior state, stage the configuration, put it
/// in place
pub fn kubeadm(ctx: &ProvisionContext) -> Result<Workflow> {
    let config = &ctx.config;
    let rendered = config.kubeadm_config();
    Workflow::builder("setup-kubeadm")
        .step(
            Step::builder("download-kubeadm")
                .handler(PackageDownload::new(ctx.kubeadm.clone()))
                .build()?,
        )
        .step(paired_step(
            "install-kubeadm",
            SoftwarePackage::new(ctx.kubeadm.clone()).predownloaded(),
        )?)
        .step(
            Step::builder("reset-prior-state")
                .handler(
                    KubeadmReset::new(ctx.runner.clone(), &config.kubeadm.package.install_path)
                        .remove(&config.kubeadm.staged_config_path),
                )
                .build()?,
        )
        .step(paired_step(
            "download-config",
            RenderedFile::new(&config.kubeadm.staged_config_path, rendered.clone()),
        )?)
        .step(paired_step(
            "configure-kubeadm",
            RenderedFile::new(&config.kubeadm.package.config_path, rendered),
        )?)
        .build()
}

/// Alloy and the in-cluster pieces it depends on
pub fn alloy_stack(ctx: &ProvisionContext) -> Result<Workflow> {
    let alloy = &ctx.config.alloy;

    let prometheus_crds = Workflow::builder("install-prometheus-crds")
        .step(helm_step(ctx, "install-chart", &alloy.prometheus_crds)?)
        .step(
            Step::builder("wait-crds")
                .handler(WaitForCrd::new(
                    ctx.kube.clone(),
                    &alloy.required_crd,
                    ctx.config.poll.crd(),
                ))
                .build()?,
        )
        .build()?;

    let credentials = BTreeMap::from([
        (
            "REMOTE_WRITE_USERNAME".to_string(),
            alloy.remote_write_username.clone(),
        ),
        (
            "REMOTE_WRITE_PASSWORD".to_string(),
            alloy.remote_write_password.clone(),
        ),
    ]);

    let install_alloy = Workflow::builder("install-alloy")
        .step(paired_step(
            "create-namespace",
            KubeObject::new(ctx.kube.clone(), namespace_manifest(&alloy.namespace))?,
        )?)
        .step(helm_step(ctx, "install-node-exporter", &alloy.node_exporter)?)
        .step(wait_for_pods(
            ctx,
            "wait-node-exporter",
            &alloy.node_exporter.namespace,
            &alloy.node_exporter.release,
        )?)
        .step(paired_step(
            "create-secret",
            KubeObject::new(
                ctx.kube.clone(),
                secret_manifest(&alloy.secret_name, &alloy.namespace, &credentials),
            )?,
        )?)
        .step(paired_step(
            "deploy-config",
            KubeObject::new(
                ctx.kube.clone(),
                config_map_manifest(
                    &alloy.config_map,
                    &alloy.namespace,
                    "config.alloy",
                    &ctx.config.alloy_config(),
                ),
            )?,
        )?)
        .step(helm_step(ctx, "install-chart", &alloy.chart)?)
        .step(wait_for_pods(
            ctx,
            "wait-alloy",
            &alloy.chart.namespace,
            &alloy.chart.release,
        )?)
        .build()?;

    Workflow::builder("setup-alloy-stack")
        .step(helm_step(ctx, "install-external-secrets", &alloy.external_secrets)?)
        .workflow(prometheus_crds)
        .workflow(install_alloy)
        .build()
}

/// Every target, in dependency order
pub fn all(ctx: &ProvisionContext) -> Result<Workflow> {
    Workflow::builder("setup-all")
        .workflow(kernel_modules(ctx)?)
        .workflow(disable_swap(ctx)?)
        .workflow(bind_mounts(ctx)?)
        .workflow(kubelet(ctx)?)
        .workflow(kubeadm(ctx)?)
        .workflow(alloy_stack(ctx)?)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_id() {
        assert_eq!(path_id(Path::new("/var/run/cilium")), "var-run-cilium");
        assert_eq!(path_id(Path::new("/etc/kubernetes")), "etc-kubernetes");
    }
}
