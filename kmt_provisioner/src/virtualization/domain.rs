use std::{collections::BTreeMap, path::PathBuf};

use log::debug;
use serde::Serialize;
use thiserror::Error;

use super::identity::DomainIdentity;
use super::templates::{self, render, TemplateArgs, Templates};
use crate::config::VmSet;
use crate::recipe::Arch;
use crate::storage::{volume::VolumePlan, StorageLayout};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum DomainError {
    #[error("No filesystem was built for kernel {tag} of vm set {vmset}")]
    MissingFilesystem { vmset: String, tag: String },
    #[error("Vm set {vmset} has no kernel {tag}")]
    UnknownKernel { vmset: String, tag: String },
    #[error("Recipe {0} has no domain template")]
    NoDomainTemplate(String),
    #[error("Vm set {vmset} has an invalid recipe: {message}")]
    Recipe { vmset: String, message: String },
    #[error("Domain {0} has more disks than virtio targets")]
    TooManyDisks(String),
    #[error("Domain {domain} has {expected} disks but {actual} volumes were given")]
    VolumeCountMismatch {
        domain: String,
        expected: usize,
        actual: usize,
    },
}

pub const SHARED_FS_MOUNT_POINT: &str = "/opt/kernel-version-testing";
pub const BASELINE_CMDLINE: &str = "acpi=off panic=-1 root=/dev/vda net.ifnames=0 rw";
const ARM64_MACHINE: &str = "virt";
const X86_64_MACHINE: &str = "pc";
const CONSOLE_LOG_DIR: &str = "/var/log/libvirt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum ConsoleKind {
    File,
    #[default]
    Pty,
}

impl ConsoleKind {
    pub fn log_path(&self, libvirt_name: &str) -> Option<PathBuf> {
        match self {
            ConsoleKind::File => {
                Some(PathBuf::from(CONSOLE_LOG_DIR).join(format!("ddvm-{}.log", libvirt_name)))
            }
            ConsoleKind::Pty => None,
        }
    }

    fn xml(&self, libvirt_name: &str) -> String {
        match self.log_path(libvirt_name) {
            Some(log) => format!(
                "<serial type='file'><source path='{log}'/><target port='0'/></serial>\
                 <console type='file'><source path='{log}'/><target type='serial' port='0'/></console>",
                log = log.display()
            ),
            None => String::from("<console type='pty'><target type='serial' port='0'/></console>"),
        }
    }
}

/// Baseline parameters followed by the kernel's extras in key order.
pub fn kernel_cmdline(extra_params: &BTreeMap<String, String>) -> String {
    extra_params
        .iter()
        .fold(BASELINE_CMDLINE.to_string(), |mut cmdline, (key, value)| {
            cmdline.push(' ');
            cmdline.push_str(key);
            if !value.is_empty() {
                cmdline.push('=');
                cmdline.push_str(value);
            }
            cmdline
        })
}

/// Virtio block device name for the disk at `index`, `vda` being the root.
pub fn disk_target(index: usize) -> Option<String> {
    let letter = u8::try_from(index).ok().filter(|index| *index < 26)?;
    Some(format!("vd{}", (b'a' + letter) as char))
}

fn disk_xml(volume_key: &str, target: &str) -> String {
    format!(
        "<disk type='file' device='disk'><driver name='qemu' type='qcow2'/>\
         <source file='{}'/><target dev='{}' bus='virtio'/></disk>",
        volume_key, target
    )
}

/// Round-robin pinning of guest vcpus on host cpus, carried over between
/// domains of one instance.
#[derive(Debug, Clone, Default)]
pub struct CpuPinning {
    host_cpus: usize,
    next: usize,
}

impl CpuPinning {
    pub fn new(host_cpus: usize) -> Self {
        Self { host_cpus, next: 0 }
    }

    pub fn cputune(&mut self, vcpu: u32) -> String {
        if self.host_cpus == 0 {
            return String::new();
        }
        let pins: Vec<String> = (0..vcpu)
            .map(|guest| {
                let pin = format!("<vcpupin vcpu='{}' cpuset='{}'/>", guest, self.next);
                self.next = (self.next + 1) % self.host_cpus;
                pin
            })
            .collect();
        format!("<cputune>{}</cputune>", pins.join("\n"))
    }
}

/// Writable overlay of a base volume, private to one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainDisk {
    pub overlay_name: String,
    pub pool: String,
    pub base_volume_key: String,
    pub target: String,
    pub mount_point: String,
}

impl DomainDisk {
    pub fn device(&self) -> String {
        format!("/dev/{}", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainConfig {
    pub identity: DomainIdentity,
    pub disks: Vec<DomainDisk>,
    pub console_log: Option<PathBuf>,
    #[serde(skip)]
    descriptor: String,
}

impl DomainConfig {
    /// Embeds the allocated overlay keys, given in disk order. The network
    /// stays a placeholder until the network exists.
    pub fn finalize(&self, overlay_keys: &[String]) -> Result<FinalizedDomain, DomainError> {
        if overlay_keys.len() != self.disks.len() {
            return Err(DomainError::VolumeCountMismatch {
                domain: self.identity.domain_id.clone(),
                expected: self.disks.len(),
                actual: overlay_keys.len(),
            });
        }
        let disks: String = self
            .disks
            .iter()
            .zip(overlay_keys)
            .map(|(disk, key)| disk_xml(key, &disk.target))
            .collect();
        let args = TemplateArgs::from([(templates::DISKS, disks)]);
        Ok(FinalizedDomain {
            identity: self.identity.clone(),
            descriptor: render(&self.descriptor, &args),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedDomain {
    pub identity: DomainIdentity,
    descriptor: String,
}

impl FinalizedDomain {
    pub fn launch_descriptor(&self, network: &str) -> String {
        let args = TemplateArgs::from([(templates::NETWORK, network.to_string())]);
        render(&self.descriptor, &args)
    }
}

pub struct DomainConfigBuilder {
    layout: StorageLayout,
    console: ConsoleKind,
    pinning: CpuPinning,
}

impl DomainConfigBuilder {
    pub fn new(layout: StorageLayout, console: ConsoleKind, host_cpus: usize) -> Self {
        Self {
            layout,
            console,
            pinning: CpuPinning::new(host_cpus),
        }
    }

    pub fn build_domain(
        &mut self,
        identity: &DomainIdentity,
        vmset: &VmSet,
        volumes: &VolumePlan,
    ) -> Result<DomainConfig, DomainError> {
        let templates = Templates::for_recipe(&vmset.recipe).map_err(|err| DomainError::Recipe {
            vmset: vmset.name.clone(),
            message: err.to_string(),
        })?;
        let template = templates
            .domain
            .ok_or_else(|| DomainError::NoDomainTemplate(vmset.recipe.clone()))?;
        let kernel = vmset
            .kernels
            .iter()
            .find(|kernel| kernel.tag == identity.kernel_tag)
            .ok_or_else(|| DomainError::UnknownKernel {
                vmset: vmset.name.clone(),
                tag: identity.kernel_tag.clone(),
            })?;
        let attachments = volumes
            .attachments_for(&vmset.name, &kernel.tag)
            .ok_or_else(|| DomainError::MissingFilesystem {
                vmset: vmset.name.clone(),
                tag: kernel.tag.clone(),
            })?;

        let disks = attachments
            .iter()
            .enumerate()
            .map(|(index, attachment)| {
                let target = disk_target(index)
                    .ok_or_else(|| DomainError::TooManyDisks(identity.domain_id.clone()))?;
                let mut overlay_name = format!(
                    "{}-{}-final-overlay-{}",
                    attachment.pool, kernel.tag, identity.domain_id
                );
                if !attachment.is_root() {
                    overlay_name = format!("{}-{}", overlay_name, target);
                }
                Ok(DomainDisk {
                    overlay_name,
                    pool: attachment.pool.clone(),
                    base_volume_key: attachment.volume_key.clone(),
                    target,
                    mount_point: attachment.mount_point.clone(),
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        let mut args = TemplateArgs::from([
            (templates::DOMAIN_NAME, identity.libvirt_name.clone()),
            (templates::DOMAIN_ID, identity.domain_id.clone()),
            (templates::MAC_ADDRESS, identity.mac.clone()),
            (templates::MEMORY, identity.memory.to_string()),
            (templates::VCPU, identity.vcpu.to_string()),
            (templates::CPU_TUNE, self.pinning.cputune(identity.vcpu)),
            (templates::SHARED_FS_MOUNT, SHARED_FS_MOUNT_POINT.to_string()),
            (
                templates::KERNEL,
                self.layout.kernel_path(&kernel.dir).to_string_lossy().to_string(),
            ),
            (templates::CMDLINE, kernel_cmdline(&kernel.extra_params)),
            (templates::CONSOLE, self.console.xml(&identity.libvirt_name)),
        ]);
        match templates.family.arch() {
            Some(Arch::Arm64) => {
                args.insert(templates::MACHINE, ARM64_MACHINE.to_string());
                args.insert(
                    templates::NVRAM,
                    self.layout
                        .varstore_path(&identity.libvirt_name)
                        .to_string_lossy()
                        .to_string(),
                );
                args.insert(
                    templates::EFI,
                    self.layout.efi_path().to_string_lossy().to_string(),
                );
            }
            _ => {
                let machine = vmset.machine.as_deref().unwrap_or(X86_64_MACHINE);
                args.insert(templates::MACHINE, machine.to_string());
            }
        }

        debug!(
            "Rendering domain {} with {} disks",
            identity.domain_id,
            disks.len()
        );
        Ok(DomainConfig {
            identity: identity.clone(),
            disks,
            console_log: self.console.log_path(&identity.libvirt_name),
            descriptor: render(template, &args),
        })
    }
}
