//! Concrete provisioning steps
//!
//! - `kernel_module` - load a module and persist it in modules-load.d
//! - `bind_mount` - bind-mount a directory and record it in fstab
//! - `swap` - turn swap off and comment it out of fstab
//! - `systemd` - enable and start a unit
//! - `software` - download, install and configure a package
//! - `rendered_file` - write a rendered configuration file
//! - `helm` - install or upgrade a Helm release
//! - `kube` - apply generated objects, wait for pods and CRDs
//! - `kubeadm` - reset prior kubeadm state

pub mod bind_mount;
pub mod helm;
pub mod kernel_module;
pub mod kube;
pub mod kubeadm;
pub mod rendered_file;
pub mod software;
pub mod swap;
pub mod systemd;

pub use bind_mount::BindMount;
pub use helm::HelmRelease;
pub use kernel_module::KernelModule;
pub use kube::{
    config_map_manifest, namespace_manifest, secret_manifest, KubeObject, WaitForCrd,
    WaitForPods, CHECKSUM_ANNOTATION,
};
pub use kubeadm::KubeadmReset;
pub use rendered_file::RenderedFile;
pub use software::{Package, PackageDownload, SoftwarePackage};
pub use swap::Swap;
pub use systemd::SystemdService;
