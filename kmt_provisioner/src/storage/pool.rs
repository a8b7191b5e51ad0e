use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use super::StorageLayout;
use crate::config::{VmSet, DEFAULT_POOL, RAM_POOL};
use crate::engine::{ResourceArgs, ResourceEngine, ResourceHandle};
use crate::runner::{CommandArgs, CommandRunner};
use crate::virtualization::templates::{self, render, TemplateArgs, Templates};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum PoolError {
    #[error("Ram disk {target} of vm set {vmset} needs a size with a K, M or G suffix, got {size:?}")]
    InvalidRamSize {
        vmset: String,
        target: String,
        size: Option<String>,
    },
    #[error("Ram disk {target} of vm set {vmset} has zero size")]
    ZeroSizedRamDisk { vmset: String, target: String },
    #[error("Failed to set up pool {pool}: {message}")]
    Setup { pool: String, message: String },
}

/// Parses sizes such as `512M` or `4G` into bytes.
pub fn parse_ram_size(size: &str) -> Option<u64> {
    let size = size.trim();
    let suffix = size.chars().last()?;
    let digits = &size[..size.len() - suffix.len_utf8()];
    let multiplier: u64 = match suffix.to_ascii_uppercase() {
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibvirtPool {
    pub name: String,
    pub pool_type: String,
    pub path: PathBuf,
    pub ram_bytes: Option<u64>,
}

impl LibvirtPool {
    pub fn xml(&self) -> String {
        let args = TemplateArgs::from([
            (templates::POOL_NAME, self.name.clone()),
            (templates::POOL_PATH, self.path.to_string_lossy().to_string()),
        ]);
        render(Templates::defaults().pool, &args)
    }

    pub fn scratch_path(&self) -> String {
        format!("/tmp/pool-{}.tmp", self.name)
    }
}

pub struct StoragePoolManager {
    layout: StorageLayout,
}

impl StoragePoolManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// The default pool of a vm set followed by one pool per distinct extra
    /// disk type, in order of first use.
    pub fn plan_pools(&self, vmset: &VmSet) -> Result<Vec<LibvirtPool>, PoolError> {
        let mut pool_types = vec![DEFAULT_POOL.to_string()];
        for disk in &vmset.disks {
            if !pool_types.contains(&disk.pool_type) {
                pool_types.push(disk.pool_type.clone());
            }
        }

        pool_types
            .into_iter()
            .map(|pool_type| {
                let name = self.layout.pool_name(&vmset.name, &pool_type);
                let ram_bytes = match pool_type.as_str() {
                    RAM_POOL => Some(Self::ram_pool_size(vmset)?),
                    _ => None,
                };
                Ok(LibvirtPool {
                    path: self.layout.pool_path(&name),
                    name,
                    pool_type,
                    ram_bytes,
                })
            })
            .collect()
    }

    fn ram_pool_size(vmset: &VmSet) -> Result<u64, PoolError> {
        let mut total = 0u64;
        for disk in vmset.disks.iter().filter(|disk| disk.pool_type == RAM_POOL) {
            let bytes = disk
                .size
                .as_deref()
                .and_then(parse_ram_size)
                .ok_or_else(|| PoolError::InvalidRamSize {
                    vmset: vmset.name.clone(),
                    target: disk.target.clone(),
                    size: disk.size.clone(),
                })?;
            if bytes == 0 {
                return Err(PoolError::ZeroSizedRamDisk {
                    vmset: vmset.name.clone(),
                    target: disk.target.clone(),
                });
            }
            total = total.saturating_add(bytes);
        }
        Ok(total)
    }

    pub async fn setup_pool(
        &self,
        pool: &LibvirtPool,
        is_local: bool,
        runner: &(dyn CommandRunner + Send + Sync),
        engine: &(dyn ResourceEngine + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<Vec<ResourceHandle>, PoolError> {
        info!("Setting up pool {} ({})", pool.name, pool.pool_type);
        let mut deps = deps.to_vec();
        if let Some(bytes) = pool.ram_bytes {
            deps = vec![Self::mount_ram_backing(pool, bytes, runner, &deps).await?];
        }

        if is_local {
            Self::setup_local_pool(pool, engine, &deps).await
        } else {
            Self::setup_remote_pool(pool, runner, &deps).await
        }
    }

    async fn mount_ram_backing(
        pool: &LibvirtPool,
        bytes: u64,
        runner: &(dyn CommandRunner + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, PoolError> {
        let path = pool.path.to_string_lossy();
        let args = CommandArgs::new(format!(
            "mkdir -p {path} && mount -t tmpfs -o size={bytes} tmpfs {path}"
        ))
        .with_delete(format!("umount {path} && rm -rf {path}"))
        .with_sudo();
        runner
            .command(&format!("{}-mount-ramfs", pool.name), args, deps)
            .await
            .map_err(|err| PoolError::Setup {
                pool: pool.name.clone(),
                message: err.to_string(),
            })
    }

    async fn setup_local_pool(
        pool: &LibvirtPool,
        engine: &(dyn ResourceEngine + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<Vec<ResourceHandle>, PoolError> {
        let args = ResourceArgs::Pool {
            name: pool.name.clone(),
            path: pool.path.clone(),
            xml: pool.xml(),
        };
        let handle = engine
            .create(&format!("{}-create-libvirt-pool", pool.name), args, deps)
            .await
            .map_err(|err| PoolError::Setup {
                pool: pool.name.clone(),
                message: err.to_string(),
            })?;
        Ok(vec![handle])
    }

    /// Pools on a remote host are driven through the virsh cli in strict
    /// define, build, start, refresh order.
    async fn setup_remote_pool(
        pool: &LibvirtPool,
        runner: &(dyn CommandRunner + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<Vec<ResourceHandle>, PoolError> {
        let scratch = pool.scratch_path();
        let steps = [
            (
                "write-pool-xml",
                CommandArgs::new(format!("cat > {}", scratch))
                    .with_stdin(pool.xml())
                    .with_delete(format!("rm -f {}", scratch)),
            ),
            (
                "define-libvirt-pool",
                CommandArgs::new(format!("virsh pool-define {}", scratch))
                    .with_delete(format!("virsh pool-undefine {}", pool.name))
                    .with_sudo(),
            ),
            (
                "build-libvirt-pool",
                CommandArgs::new(format!("virsh pool-build {}", pool.name))
                    .with_delete(format!("virsh pool-delete {}", pool.name))
                    .with_sudo(),
            ),
            (
                "start-libvirt-pool",
                CommandArgs::new(format!("virsh pool-start {}", pool.name))
                    .with_delete(format!("virsh pool-destroy {}", pool.name))
                    .with_sudo(),
            ),
            (
                "refresh-libvirt-pool",
                CommandArgs::new(format!("virsh pool-refresh {}", pool.name)).with_sudo(),
            ),
        ];

        let mut previous = deps.to_vec();
        for (step, args) in steps {
            let name = format!("{}-{}", pool.name, step);
            debug!("Running pool step {}", name);
            let handle = runner
                .command(&name, args, &previous)
                .await
                .map_err(|err| PoolError::Setup {
                    pool: pool.name.clone(),
                    message: err.to_string(),
                })?;
            previous = vec![handle];
        }
        Ok(previous)
    }
}
