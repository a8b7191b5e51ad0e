use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use ipnet::Ipv4Net;
use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use utils::file_system::workspace_manager::WorkspaceManager;

use super::collection::VMCollection;
use super::instance::{InstanceCreator, InstanceError};
use super::outputs::OutputRecord;
use crate::config::{Config, InstanceArch, VmSet};
use crate::storage::download::DownloadPlan;
use crate::storage::pool::{LibvirtPool, StoragePoolManager};
use crate::storage::volume::{VolumeManager, VolumePlan};
use crate::storage::StorageLayout;
use crate::virtualization::domain::ConsoleKind;
use crate::virtualization::identity::{DomainIdentity, IdentityGenerator};
use crate::virtualization::subnet::SubnetAllocator;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum OrchestratorError {
    #[error("Failed to allocate subnet: {0}")]
    Subnet(String),
    #[error("Failed to generate domain identities: {0}")]
    Identity(String),
    #[error("Failed to plan storage of instance {instance}: {message}")]
    Storage { instance: String, message: String },
    #[error("Instance {instance} failed: {message}")]
    Instance { instance: String, message: String },
    #[error("Instance task failed: {0}")]
    Join(String),
    #[error("Failed to access state directory: {0}")]
    StateDir(String),
    #[error("Failed to save outputs: {0}")]
    Outputs(String),
}

/// Per run settings that shape what is launched, not what is planned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub console: ConsoleKind,
    pub host_cpus: usize,
    pub shutdown_period: u32,
    pub skip_shared_disk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstancePlan {
    pub instance: InstanceArch,
    #[serde(skip)]
    pub layout: StorageLayout,
    pub subnet: Ipv4Net,
    pub microvm_key: PathBuf,
    pub vmsets: Vec<VmSet>,
    pub identities: Vec<DomainIdentity>,
    pub pools: Vec<LibvirtPool>,
    pub volumes: VolumePlan,
    pub downloads: DownloadPlan,
}

impl InstancePlan {
    pub fn new(
        instance: InstanceArch,
        layout: StorageLayout,
        subnet: Ipv4Net,
        microvm_key: PathBuf,
        vmsets: Vec<VmSet>,
        identities: &[DomainIdentity],
    ) -> Result<Self, OrchestratorError> {
        let storage_error = |message: String| OrchestratorError::Storage {
            instance: instance.to_string(),
            message,
        };
        let pool_manager = StoragePoolManager::new(layout.clone());
        let mut pools = vec![];
        for vmset in &vmsets {
            pools.extend(
                pool_manager
                    .plan_pools(vmset)
                    .map_err(|err| storage_error(err.to_string()))?,
            );
        }
        let volumes = VolumeManager::new(layout.clone())
            .plan_volumes(&vmsets)
            .map_err(|err| storage_error(err.to_string()))?;
        // Sets sharing an image use the volume of the first set, leaving
        // their own pool empty.
        pools.retain(|pool| {
            let used = volumes.volumes.iter().any(|volume| volume.pool == pool.name);
            if !used {
                debug!("Skipping pool {} without volumes", pool.name);
            }
            used
        });
        let downloads = DownloadPlan::new(volumes.images());

        Ok(Self {
            instance,
            layout,
            subnet,
            microvm_key,
            identities: identities
                .iter()
                .filter(|identity| identity.instance == instance)
                .cloned()
                .collect(),
            vmsets,
            pools,
            volumes,
            downloads,
        })
    }

    pub fn stack(&self) -> &str {
        self.layout.stack()
    }

    pub fn vmset(&self, name: &str) -> Option<&VmSet> {
        self.vmsets.iter().find(|vmset| vmset.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningPlan {
    pub stack: String,
    pub subnet: Ipv4Net,
    pub instances: Vec<InstancePlan>,
}

fn journal_instance(prefix: &str, path: &Path) -> Option<InstanceArch> {
    let name = path.file_name()?.to_str()?;
    let instance = name.strip_prefix(prefix)?.strip_suffix(".yaml")?;
    InstanceArch::from_str(instance).ok()
}

pub struct ProvisioningOrchestrator {
    stack: String,
    state_dir: PathBuf,
    creator: Arc<dyn InstanceCreator + Send + Sync>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        stack: String,
        state_dir: PathBuf,
        creator: Arc<dyn InstanceCreator + Send + Sync>,
    ) -> Self {
        Self {
            stack,
            state_dir,
            creator,
        }
    }

    fn outputs_file(&self) -> String {
        format!("{}-outputs.yaml", self.stack)
    }

    fn microvm_key_file(&self, instance: &InstanceArch) -> String {
        format!("{}-{}-ddvm_rsa", self.stack, instance)
    }

    pub fn outputs_path(&self) -> PathBuf {
        self.state_dir.join(self.outputs_file())
    }

    /// Computes everything a run creates without touching any host.
    pub async fn plan(
        &self,
        config: &Config,
        allocator: &SubnetAllocator,
    ) -> Result<ProvisioningPlan, OrchestratorError> {
        let subnet = allocator
            .allocate()
            .await
            .map_err(|err| OrchestratorError::Subnet(err.to_string()))?;
        let identities = IdentityGenerator::new(self.stack.clone())
            .generate(&config.vmsets, &subnet)
            .map_err(|err| OrchestratorError::Identity(err.to_string()))?;
        let layout = StorageLayout::new(config.workdir.clone(), self.stack.clone());

        let mut instances = vec![];
        for instance in config.instance_archs() {
            let plan = InstancePlan::new(
                instance,
                layout.clone(),
                subnet,
                self.state_dir.join(self.microvm_key_file(&instance)),
                config.vmsets_for(instance),
                &identities,
            )?;
            info!(
                "Instance {}: {} domains, {} pools, {} volumes, {} downloads",
                instance,
                plan.identities.len(),
                plan.pools.len(),
                plan.volumes.volumes.len(),
                plan.downloads.tasks.len()
            );
            instances.push(plan);
        }

        Ok(ProvisioningPlan {
            stack: self.stack.clone(),
            subnet,
            instances,
        })
    }

    /// Provisions every instance of the plan concurrently. A failed instance
    /// does not stop its siblings; the first failure is returned once all
    /// of them finished and the outputs of the others are saved.
    pub async fn provision(
        &self,
        plan: ProvisioningPlan,
        options: LaunchOptions,
    ) -> Result<Vec<VMCollection>, OrchestratorError> {
        let options = Arc::new(options);
        let mut tasks = JoinSet::new();
        for instance_plan in plan.instances {
            let creator = self.creator.clone();
            let options = options.clone();
            tasks.spawn(async move {
                let arch = instance_plan.instance;
                let result: Result<VMCollection, InstanceError> = async {
                    let mut instance = creator.create_instance(arch).await?;
                    instance.provision(&instance_plan, &options).await
                }
                .await;
                (arch, result)
            });
        }

        let mut collections = vec![];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|err| OrchestratorError::Join(err.to_string()))? {
                (arch, Ok(collection)) => {
                    info!(
                        "Instance {} launched {} domains",
                        arch,
                        collection.domains.len()
                    );
                    collections.push(collection);
                }
                (arch, Err(err)) => {
                    error!("Instance {} failed: {}", arch, err);
                    failure.get_or_insert(OrchestratorError::Instance {
                        instance: arch.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        collections.sort_by_key(|collection| collection.instance);

        OutputRecord::new(&self.stack, &collections)
            .save(&self.outputs_path())
            .await
            .map_err(|err| OrchestratorError::Outputs(err.to_string()))?;

        match failure {
            Some(err) => Err(err),
            None => Ok(collections),
        }
    }

    /// Tears down every instance that has a journal for this stack.
    pub async fn destroy(&self) -> Result<(), OrchestratorError> {
        let state_error = |err: std::io::Error| OrchestratorError::StateDir(err.to_string());
        let workspace = WorkspaceManager::new(self.state_dir.clone())
            .await
            .map_err(state_error)?;
        let prefix = format!("{}-", self.stack);
        let instances: Vec<InstanceArch> = workspace
            .read_files_with_prefix(&prefix)
            .await
            .map_err(state_error)?
            .iter()
            .filter_map(|path| journal_instance(&prefix, path))
            .collect();
        info!(
            "Destroying stack {} on {} instances",
            self.stack,
            instances.len()
        );

        let mut tasks = JoinSet::new();
        for arch in instances {
            let creator = self.creator.clone();
            tasks.spawn(async move {
                let result: Result<(), InstanceError> = async {
                    let mut instance = creator.create_instance(arch).await?;
                    instance.teardown().await
                }
                .await;
                (arch, result)
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|err| OrchestratorError::Join(err.to_string()))? {
                (arch, Ok(())) => {
                    info!("Instance {} destroyed", arch);
                    workspace
                        .remove_file(&self.microvm_key_file(&arch))
                        .await
                        .map_err(state_error)?;
                }
                (arch, Err(err)) => {
                    error!("Failed to destroy instance {}: {}", arch, err);
                    failure.get_or_insert(OrchestratorError::Instance {
                        instance: arch.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        workspace
            .remove_file(&self.outputs_file())
            .await
            .map_err(state_error)
    }
}
