use std::{
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;

use super::collection::{LaunchedDomain, VMCollection};
use super::orchestrator::{InstancePlan, LaunchOptions};
use crate::config::InstanceArch;
use crate::engine::journal::{Journal, JournaledEngine, JournaledRunner};
use crate::engine::{ResourceArgs, ResourceEngine, ResourceHandle};
use crate::runner::ssh::{Connection, Transport};
use crate::runner::{shell_quote, CommandArgs, CommandRunner};
use crate::storage::download::DownloadPlan;
use crate::storage::pool::StoragePoolManager;
use crate::storage::volume::{VolumeManager, VOLUME_FORMAT};
use crate::virtualization::domain::{DomainConfig, DomainConfigBuilder, FinalizedDomain};
use crate::virtualization::lease;
use crate::virtualization::network::{network_name, NetworkBuilder};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum InstanceError {
    #[error("Instance {instance} can't move from {from:?} to {to:?}")]
    InvalidTransition {
        instance: String,
        from: InstanceState,
        to: InstanceState,
    },
    #[error("Failed to create instance: {0}")]
    Creation(String),
    #[error("Failed to prepare metal host: {0}")]
    Metal(String),
    #[error("Failed to set up pools: {0}")]
    Pool(String),
    #[error("Failed to download images: {0}")]
    Download(String),
    #[error("Failed to set up volumes: {0}")]
    Volume(String),
    #[error("Failed to configure domains: {0}")]
    Domain(String),
    #[error("Failed to build network: {0}")]
    Network(String),
    #[error("Failed to launch domains: {0}")]
    Launch(String),
    #[error("Failed to access domains: {0}")]
    Access(String),
    #[error("Failed to tear down instance: {0}")]
    Teardown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceState {
    Unprovisioned,
    MetalReady,
    PoolReady,
    VolumesReady,
    DomainsConfigured,
    NetworkReady,
    Launched,
}

impl InstanceState {
    pub fn next(&self) -> Option<InstanceState> {
        match self {
            InstanceState::Unprovisioned => Some(InstanceState::MetalReady),
            InstanceState::MetalReady => Some(InstanceState::PoolReady),
            InstanceState::PoolReady => Some(InstanceState::VolumesReady),
            InstanceState::VolumesReady => Some(InstanceState::DomainsConfigured),
            InstanceState::DomainsConfigured => Some(InstanceState::NetworkReady),
            InstanceState::NetworkReady => Some(InstanceState::Launched),
            InstanceState::Launched => None,
        }
    }
}

pub const SHARED_RAMFS_SIZE: &str = "5g";
pub const MICROVM_USER: &str = "root";

pub type ProxyRunnerCreator =
    Box<dyn Fn(Transport) -> Box<dyn CommandRunner + Send + Sync> + Send + Sync>;

/// Access to a remote metal host: the ssh connection commands run over and
/// the key pair authorizing the libvirt connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetalAccess {
    pub connection: Connection,
    pub libvirt_key: PathBuf,
}

impl MetalAccess {
    pub fn public_key(&self) -> PathBuf {
        PathBuf::from(format!("{}.pub", self.libvirt_key.display()))
    }
}

pub struct InstanceBackend {
    pub runner: Arc<dyn CommandRunner + Send + Sync>,
    pub engine: Arc<dyn ResourceEngine + Send + Sync>,
    pub local_runner: Arc<dyn CommandRunner + Send + Sync>,
}

#[async_trait]
pub trait InstanceCreator {
    async fn create_instance(&self, arch: InstanceArch) -> Result<Instance, InstanceError>;
}

struct ConfiguredDomain {
    config: DomainConfig,
    finalized: FinalizedDomain,
    ready: Vec<ResourceHandle>,
}

pub struct Instance {
    arch: InstanceArch,
    uri: String,
    state: InstanceState,
    metal: Option<MetalAccess>,
    journal: Arc<Journal>,
    runner: Arc<dyn CommandRunner + Send + Sync>,
    engine: Arc<dyn ResourceEngine + Send + Sync>,
    local_runner: Arc<dyn CommandRunner + Send + Sync>,
    raw_runner: Arc<dyn CommandRunner + Send + Sync>,
    raw_engine: Arc<dyn ResourceEngine + Send + Sync>,
    proxy_runner_creator: ProxyRunnerCreator,
}

impl Instance {
    pub fn new(
        arch: InstanceArch,
        uri: String,
        metal: Option<MetalAccess>,
        backend: InstanceBackend,
        journal: Arc<Journal>,
        proxy_runner_creator: ProxyRunnerCreator,
    ) -> Self {
        Instance {
            arch,
            uri,
            state: InstanceState::Unprovisioned,
            metal,
            runner: Arc::new(JournaledRunner::new(backend.runner.clone(), journal.clone())),
            engine: Arc::new(JournaledEngine::new(backend.engine.clone(), journal.clone())),
            local_runner: Arc::new(JournaledRunner::new(backend.local_runner, journal.clone())),
            raw_runner: backend.runner,
            raw_engine: backend.engine,
            journal,
            proxy_runner_creator,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn host(&self) -> Option<String> {
        self.metal
            .as_ref()
            .map(|metal| metal.connection.host.clone())
    }

    fn transition(&mut self, to: InstanceState) -> Result<(), InstanceError> {
        if self.state.next() != Some(to) {
            return Err(InstanceError::InvalidTransition {
                instance: self.arch.to_string(),
                from: self.state,
                to,
            });
        }
        info!("Instance {}: {:?} -> {:?}", self.arch, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Runs the whole pipeline of one instance. Steps already applied by an
    /// earlier run with the same inputs are taken from the journal.
    pub async fn provision(
        &mut self,
        plan: &InstancePlan,
        options: &LaunchOptions,
    ) -> Result<VMCollection, InstanceError> {
        let mut collection =
            VMCollection::new(self.arch, self.host(), self.uri.clone(), plan.subnet);

        let prepared = self.prepare_metal(plan, options).await?;
        self.transition(InstanceState::MetalReady)?;

        self.setup_pools(plan, &prepared, &mut collection).await?;
        self.transition(InstanceState::PoolReady)?;

        self.setup_volumes(plan, &mut collection).await?;
        self.transition(InstanceState::VolumesReady)?;

        let domains = self.configure_domains(plan, options, &collection).await?;
        self.transition(InstanceState::DomainsConfigured)?;

        collection.network = self.build_network(plan, &domains).await?;
        self.transition(InstanceState::NetworkReady)?;

        self.launch_domains(plan, domains, &mut collection).await?;
        self.transition(InstanceState::Launched)?;

        if let Some(metal) = self.metal.clone() {
            self.connect_domains(plan, &metal, &mut collection).await?;
        }
        self.reconcile_leases(&collection).await;
        Ok(collection)
    }

    pub async fn teardown(&mut self) -> Result<(), InstanceError> {
        info!("Tearing down instance {}", self.arch);
        self.journal
            .teardown(self.raw_runner.as_ref(), self.raw_engine.as_ref())
            .await
            .map_err(|err| InstanceError::Teardown(err.to_string()))?;
        self.state = InstanceState::Unprovisioned;
        Ok(())
    }

    async fn prepare_metal(
        &self,
        plan: &InstancePlan,
        options: &LaunchOptions,
    ) -> Result<Vec<ResourceHandle>, InstanceError> {
        let metal_error = |err: crate::runner::RunnerError| InstanceError::Metal(err.to_string());
        let mut prepared = vec![];

        if let Some(metal) = &self.metal {
            let private_key = metal.libvirt_key.display().to_string();
            let public_key = metal.public_key().display().to_string();
            let generated = self
                .local_runner
                .command(
                    "generate-libvirt-key",
                    CommandArgs::new(format!(
                        "rm -f {private_key} && rm -f {public_key} && ssh-keygen -t rsa -b 4096 -f {private_key} -q -N \"\" && cat {public_key}"
                    )),
                    &[],
                )
                .await
                .map_err(metal_error)?;
            let key = generated
                .output(ResourceHandle::STDOUT)
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            prepared.push(
                self.runner
                    .command(
                        "authorize-libvirt-key",
                        CommandArgs::new(format!(
                            "mkdir -p ~/.ssh && echo {} >> ~/.ssh/authorized_keys",
                            shell_quote(&key)
                        )),
                        &[generated],
                    )
                    .await
                    .map_err(metal_error)?,
            );

            if options.shutdown_period > 0 {
                debug!(
                    "Instance {} shuts down in {} minutes",
                    self.arch, options.shutdown_period
                );
                self.runner
                    .command(
                        "shutdown-timer",
                        CommandArgs::new(format!("shutdown -P +{}", options.shutdown_period))
                            .with_delete("shutdown -c")
                            .with_sudo(),
                        &[],
                    )
                    .await
                    .map_err(metal_error)?;
            }
        }

        if !options.skip_shared_disk {
            let dir = plan.layout.ramfs_dir().display().to_string();
            let mounted = self
                .runner
                .command(
                    "mount-shared-ramfs",
                    CommandArgs::new(format!(
                        "mkdir -p {dir} && mount -t ramfs -o size={SHARED_RAMFS_SIZE},mode=777 ramfs {dir}"
                    ))
                    .with_delete(format!("umount {dir} && rm -rf {dir}"))
                    .with_sudo(),
                    &prepared,
                )
                .await
                .map_err(metal_error)?;
            prepared.push(mounted);
        }
        Ok(prepared)
    }

    async fn setup_pools(
        &self,
        plan: &InstancePlan,
        deps: &[ResourceHandle],
        collection: &mut VMCollection,
    ) -> Result<(), InstanceError> {
        let manager = StoragePoolManager::new(plan.layout.clone());
        for pool in &plan.pools {
            let handles = manager
                .setup_pool(
                    pool,
                    self.arch.is_local(),
                    self.runner.as_ref(),
                    self.engine.as_ref(),
                    deps,
                )
                .await
                .map_err(|err| InstanceError::Pool(err.to_string()))?;
            collection.pools.insert(pool.name.clone(), handles);
        }
        Ok(())
    }

    async fn setup_volumes(
        &self,
        plan: &InstancePlan,
        collection: &mut VMCollection,
    ) -> Result<(), InstanceError> {
        let pools: Vec<ResourceHandle> = collection.pools.values().flatten().cloned().collect();
        let downloaded = plan
            .downloads
            .execute(
                &DownloadPlan::config_path(plan.stack()),
                self.arch.is_local(),
                self.runner.as_ref(),
                &pools,
            )
            .await
            .map_err(|err| InstanceError::Download(err.to_string()))?;

        let manager = VolumeManager::new(plan.layout.clone());
        for volume in &plan.volumes.volumes {
            let mut deps = collection
                .pools
                .get(&volume.pool)
                .cloned()
                .ok_or_else(|| {
                    InstanceError::Volume(format!(
                        "pool {} of volume {} was not set up",
                        volume.pool, volume.key
                    ))
                })?;
            deps.extend(downloaded.iter().cloned());
            let handle = manager
                .setup_volume(
                    volume,
                    self.arch.is_local(),
                    self.runner.as_ref(),
                    self.engine.as_ref(),
                    &deps,
                )
                .await
                .map_err(|err| InstanceError::Volume(err.to_string()))?;
            collection.volumes.insert(volume.key.clone(), handle);
        }
        Ok(())
    }

    async fn configure_domains(
        &self,
        plan: &InstancePlan,
        options: &LaunchOptions,
        collection: &VMCollection,
    ) -> Result<Vec<ConfiguredDomain>, InstanceError> {
        let domain_error = InstanceError::Domain;
        let mut builder =
            DomainConfigBuilder::new(plan.layout.clone(), options.console, options.host_cpus);
        let mut domains = vec![];

        for identity in &plan.identities {
            let vmset = plan.vmset(&identity.vmset).ok_or_else(|| {
                domain_error(format!(
                    "vm set {} of domain {} is not placed on this instance",
                    identity.vmset, identity.domain_id
                ))
            })?;
            let config = builder
                .build_domain(identity, vmset, &plan.volumes)
                .map_err(|err| domain_error(err.to_string()))?;

            let mut ready = vec![];
            for disk in &config.disks {
                let base = collection.volumes.get(&disk.base_volume_key).ok_or_else(|| {
                    domain_error(format!(
                        "base volume {} of {} was not set up",
                        disk.base_volume_key, disk.overlay_name
                    ))
                })?;
                let args = ResourceArgs::Overlay {
                    name: disk.overlay_name.clone(),
                    pool: disk.pool.clone(),
                    base_volume: base.id.clone(),
                    format: VOLUME_FORMAT.to_string(),
                };
                ready.push(
                    self.engine
                        .create(&disk.overlay_name, args, std::slice::from_ref(base))
                        .await
                        .map_err(|err| domain_error(err.to_string()))?,
                );
            }
            let overlay_keys: Vec<String> =
                ready.iter().map(|overlay| overlay.id.clone()).collect();
            let finalized = config
                .finalize(&overlay_keys)
                .map_err(|err| domain_error(err.to_string()))?;

            let socket = format!("rm -f /tmp/{}.sock", identity.domain_id);
            ready.push(
                self.runner
                    .command(
                        &format!("{}-clear-socket", identity.domain_id),
                        CommandArgs::new(socket.clone())
                            .with_delete(socket)
                            .with_sudo(),
                        &[],
                    )
                    .await
                    .map_err(|err| domain_error(err.to_string()))?,
            );
            if let Some(log) = &config.console_log {
                self.create_console_log(&identity.domain_id, log).await;
            }

            domains.push(ConfiguredDomain {
                config,
                finalized,
                ready,
            });
        }
        Ok(domains)
    }

    async fn create_console_log(&self, domain_id: &str, log: &Path) {
        let args = CommandArgs::new(format!("touch {}", log.display()))
            .with_sudo()
            .transient();
        if let Err(err) = self
            .runner
            .command(&format!("{}-console-log", domain_id), args, &[])
            .await
        {
            warn!("Failed to create console log of domain {}: {}", domain_id, err);
        }
    }

    async fn build_network(
        &self,
        plan: &InstancePlan,
        domains: &[ConfiguredDomain],
    ) -> Result<Vec<ResourceHandle>, InstanceError> {
        let finalized: Vec<FinalizedDomain> = domains
            .iter()
            .map(|domain| domain.finalized.clone())
            .collect();
        let deps: Vec<ResourceHandle> = domains
            .iter()
            .flat_map(|domain| domain.ready.iter().cloned())
            .collect();
        NetworkBuilder::new(plan.stack().to_string())
            .build_network(
                &self.arch,
                &plan.subnet,
                &finalized,
                self.runner.as_ref(),
                self.engine.as_ref(),
                &deps,
            )
            .await
            .map_err(|err| InstanceError::Network(err.to_string()))
    }

    async fn launch_domains(
        &self,
        plan: &InstancePlan,
        domains: Vec<ConfiguredDomain>,
        collection: &mut VMCollection,
    ) -> Result<(), InstanceError> {
        let network = network_name(plan.stack(), &self.arch);
        for domain in domains {
            let identity = domain.config.identity.clone();
            let mut deps = collection.network.clone();
            deps.extend(domain.ready);
            let args = ResourceArgs::Domain {
                name: identity.libvirt_name.clone(),
                xml: domain.finalized.launch_descriptor(&network),
            };
            let handle = self
                .engine
                .create(&format!("{}-domain", identity.domain_id), args, &deps)
                .await
                .map_err(|err| InstanceError::Launch(err.to_string()))?;
            debug!("Launched domain {} at {}", identity.libvirt_name, identity.ip);
            collection.domains.push(LaunchedDomain {
                identity,
                disks: domain.config.disks,
                handle,
                proxy: None,
            });
        }
        Ok(())
    }

    /// Fetches the key micro-vms accept and stores it beside the journal.
    async fn store_microvm_key(&self, plan: &InstancePlan) -> Result<(), InstanceError> {
        let access_error = InstanceError::Access;
        let key = self
            .runner
            .command(
                "read-microvm-key",
                CommandArgs::new(format!("cat {}", plan.layout.microvm_key_path().display()))
                    .transient(),
                &[],
            )
            .await
            .map_err(|err| access_error(err.to_string()))?;
        let content = format!("{}\n", key.output(ResourceHandle::STDOUT).unwrap_or_default());

        if let Some(dir) = plan.microvm_key.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| access_error(err.to_string()))?;
        }
        tokio::fs::write(&plan.microvm_key, content)
            .await
            .map_err(|err| access_error(err.to_string()))?;
        tokio::fs::set_permissions(&plan.microvm_key, Permissions::from_mode(0o600))
            .await
            .map_err(|err| access_error(err.to_string()))
    }

    /// Domains live behind the metal host's bridge and are reached by a
    /// jump over the metal connection.
    async fn connect_domains(
        &self,
        plan: &InstancePlan,
        metal: &MetalAccess,
        collection: &mut VMCollection,
    ) -> Result<(), InstanceError> {
        self.store_microvm_key(plan).await?;

        for domain in collection.domains.iter_mut() {
            let transport = Transport::through(
                &metal.connection,
                domain.identity.ip.to_string(),
                MICROVM_USER.to_string(),
                plan.microvm_key.clone(),
            );
            domain.proxy = Some(transport.clone());
            if domain.extra_disks().next().is_none() {
                continue;
            }

            let runner = (self.proxy_runner_creator)(transport);
            for disk in domain.extra_disks() {
                let mount_point = &disk.mount_point;
                debug!(
                    "Mounting {} at {} in domain {}",
                    disk.device(),
                    mount_point,
                    domain.identity.domain_id
                );
                runner
                    .command(
                        &format!("{}-mount-{}", domain.identity.domain_id, disk.target),
                        CommandArgs::new(format!(
                            "mkdir -p {mount_point} && (mountpoint -q {mount_point} || mount {} {mount_point})",
                            disk.device()
                        ))
                        .transient(),
                        &[],
                    )
                    .await
                    .map_err(|err| InstanceError::Access(err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn reconcile_leases(&self, collection: &VMCollection) {
        match lease::read_leases(self.arch.is_local(), self.runner.as_ref()).await {
            Ok(leases) => {
                lease::reconcile(&collection.identities(), &leases);
            }
            Err(err) => warn!("Failed to read leases of instance {}: {}", self.arch, err),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, str::FromStr, sync::Arc};

    use ipnet::Ipv4Net;

    use super::{Instance, InstanceBackend, InstanceError, InstanceState};
    use crate::config::InstanceArch;
    use crate::engine::journal::Journal;
    use crate::engine::{ResourceArgs, ResourceHandle};
    use crate::managers::orchestrator::{InstancePlan, LaunchOptions};
    use crate::runner::ssh::Transport;
    use crate::runner::CommandRunner;
    use crate::storage::StorageLayout;
    use crate::utils::test_utilities::{
        create_command_handle, create_example_vmset, InMemoryRepository, MockCommandRunner,
        MockResourceEngine,
    };
    use crate::virtualization::identity::IdentityGenerator;

    fn create_local_plan() -> InstancePlan {
        let mut vmset = create_example_vmset();
        vmset.recipe = String::from("custom-local");
        vmset.arch = InstanceArch::Local;
        let subnet = Ipv4Net::from_str("100.1.0.0/24").unwrap();
        let identities = IdentityGenerator::new(String::from("dev"))
            .generate(&[vmset.clone()], &subnet)
            .unwrap();
        InstancePlan::new(
            InstanceArch::Local,
            StorageLayout::new(PathBuf::from("/kvt"), String::from("dev")),
            subnet,
            PathBuf::from("/tmp/dev-local-ddvm_rsa"),
            vec![vmset],
            &identities,
        )
        .unwrap()
    }

    fn create_instance(runner: MockCommandRunner, engine: MockResourceEngine) -> Instance {
        let runner = Arc::new(runner);
        Instance::new(
            InstanceArch::Local,
            String::from("qemu:///system"),
            None,
            InstanceBackend {
                runner: runner.clone(),
                engine: Arc::new(engine),
                local_runner: runner,
            },
            Arc::new(Journal::new(Box::new(InMemoryRepository::default()))),
            Box::new(|_: Transport| -> Box<dyn CommandRunner + Send + Sync> {
                Box::new(MockCommandRunner::new())
            }),
        )
    }

    fn accepting_runner() -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_command()
            .returning(|name, _, _| Ok(create_command_handle(name, "")));
        runner
    }

    fn accepting_engine(creates: usize, destroys: usize) -> MockResourceEngine {
        let mut engine = MockResourceEngine::new();
        engine
            .expect_create()
            .times(creates)
            .returning(|name, args, _| {
                let id = match &args {
                    ResourceArgs::Pool { name, .. }
                    | ResourceArgs::Network { name, .. }
                    | ResourceArgs::Domain { name, .. } => name.clone(),
                    ResourceArgs::Volume { name, pool, .. }
                    | ResourceArgs::Overlay { name, pool, .. } => {
                        format!("/kvt/libvirt/pools/{}/{}", pool, name)
                    }
                };
                Ok(ResourceHandle::new(args.kind(), name, &id))
            });
        engine.expect_destroy().times(destroys).returning(|_| Ok(()));
        engine
    }

    #[test]
    fn transitions_are_sequential() {
        let mut instance = create_instance(MockCommandRunner::new(), MockResourceEngine::new());
        assert_eq!(
            instance.transition(InstanceState::PoolReady),
            Err(InstanceError::InvalidTransition {
                instance: String::from("local"),
                from: InstanceState::Unprovisioned,
                to: InstanceState::PoolReady,
            })
        );
        assert!(instance.transition(InstanceState::MetalReady).is_ok());
        assert_eq!(instance.state(), InstanceState::MetalReady);
        assert_eq!(InstanceState::Launched.next(), None);
    }

    #[tokio::test]
    async fn local_instance_launches_every_domain() {
        let plan = create_local_plan();
        // pool, base volume, two overlays, network, two domains
        let mut instance = create_instance(accepting_runner(), accepting_engine(7, 0));
        let collection = instance
            .provision(&plan, &LaunchOptions::default())
            .await
            .unwrap();

        assert_eq!(instance.state(), InstanceState::Launched);
        assert_eq!(collection.domains.len(), 2);
        assert_eq!(collection.pools.len(), 1);
        assert_eq!(collection.volumes.len(), 1);
        assert_eq!(collection.host, None);
        for domain in &collection.domains {
            assert!(domain.proxy.is_none());
            assert_eq!(domain.disks.len(), 1);
            assert_eq!(domain.disks[0].target, "vda");
            assert!(domain.handle.name.ends_with("-domain"));
        }
    }

    #[tokio::test]
    async fn teardown_destroys_recorded_resources() {
        let plan = create_local_plan();
        let mut instance = create_instance(accepting_runner(), accepting_engine(7, 7));
        instance
            .provision(&plan, &LaunchOptions::default())
            .await
            .unwrap();
        instance.teardown().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Unprovisioned);
    }

    #[tokio::test]
    async fn downloads_depend_on_pools() {
        let plan = create_local_plan();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_command()
            .withf(|name, _, deps| {
                name == "write-aria2c-config"
                    && deps.len() == 1
                    && deps[0].name == "dev-set-a-default-create-libvirt-pool"
            })
            .times(1)
            .returning(|name, _, _| Ok(create_command_handle(name, "")));
        runner
            .expect_command()
            .withf(|name, _, _| name != "write-aria2c-config")
            .returning(|name, _, _| Ok(create_command_handle(name, "")));
        let mut instance = create_instance(runner, accepting_engine(7, 0));
        instance
            .provision(&plan, &LaunchOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_pool_aborts_pipeline() {
        let plan = create_local_plan();
        let mut engine = MockResourceEngine::new();
        engine.expect_create().times(1).returning(|name, args, _| {
            Err(crate::engine::EngineError::Create {
                kind: args.kind(),
                name: name.to_string(),
                message: String::from("pool-define failed"),
            })
        });
        let mut instance = create_instance(accepting_runner(), engine);
        let result = instance.provision(&plan, &LaunchOptions::default()).await;
        assert!(matches!(result, Err(InstanceError::Pool(_))));
        assert_eq!(instance.state(), InstanceState::MetalReady);
    }
}
