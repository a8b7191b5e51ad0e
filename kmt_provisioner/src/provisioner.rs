use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Error};
use log::{error, info};

use super::cli::{Action, Cli};
use super::config::Config;
use super::fabric::instance_fabric::{InstanceFabric, MetalSettings};
use super::managers::orchestrator::{LaunchOptions, ProvisioningOrchestrator};
use super::virtualization::subnet::{NetlinkAddressSource, SubnetAllocator};

pub struct ProvisionerBuilder {
    orchestrator: Option<Arc<ProvisioningOrchestrator>>,
}

impl ProvisionerBuilder {
    pub async fn build(cli: Cli) -> anyhow::Result<Provisioner, Error> {
        let mut builder = Self { orchestrator: None };

        match builder.build_provisioner(cli).await {
            Err(error) => {
                builder.cleanup().await;
                Err(error)
            }
            provisioner => provisioner,
        }
    }

    fn create_orchestrator(&mut self, cli: &Cli) -> Arc<ProvisioningOrchestrator> {
        let fabric = InstanceFabric::new(
            cli.stack.clone(),
            cli.state_dir.clone(),
            MetalSettings {
                x86_host: cli.x86_metal_host.clone(),
                arm64_host: cli.arm64_metal_host.clone(),
                user: cli.metal_user.clone(),
                private_key: cli.metal_key.clone(),
                libvirt_key_x86: cli.libvirt_key_x86.clone(),
                libvirt_key_arm: cli.libvirt_key_arm.clone(),
                per_dial_timeout: Duration::from_secs(cli.dial_timeout_secs),
                dial_error_limit: cli.dial_error_limit,
            },
            cli.sudo_password.clone(),
        );
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            cli.stack.clone(),
            cli.state_dir.clone(),
            Arc::new(fabric),
        ));
        self.orchestrator = Some(orchestrator.clone());
        orchestrator
    }

    async fn load_config(cli: &Cli) -> anyhow::Result<Option<Config>, Error> {
        if cli.action == Action::Destroy {
            return Ok(None);
        }
        let path = cli
            .config
            .as_ref()
            .ok_or_else(|| anyhow!("--config is required to {:?}", cli.action))?;
        Ok(Some(Config::load(path).await?))
    }

    async fn build_provisioner(&mut self, cli: Cli) -> anyhow::Result<Provisioner, Error> {
        let config = Self::load_config(&cli).await?;
        let orchestrator = self.create_orchestrator(&cli);
        Ok(Provisioner {
            action: cli.action,
            config,
            orchestrator,
            allocator: SubnetAllocator::new(Box::new(NetlinkAddressSource)),
            options: LaunchOptions {
                console: cli.console,
                host_cpus: cli.host_cpus,
                shutdown_period: cli.shutdown_period,
                skip_shared_disk: cli.skip_shared_disk,
            },
        })
    }

    /// Nothing has touched a host before the provisioner runs, so only the
    /// partially built state is dropped.
    async fn cleanup(&mut self) {
        if self.orchestrator.take().is_some() {
            info!("Dropped partially built orchestrator");
        }
    }
}

pub struct Provisioner {
    action: Action,
    config: Option<Config>,
    orchestrator: Arc<ProvisioningOrchestrator>,
    allocator: SubnetAllocator,
    options: LaunchOptions,
}

impl Provisioner {
    fn config(&self) -> anyhow::Result<&Config, Error> {
        self.config
            .as_ref()
            .ok_or_else(|| anyhow!("No vm sets configuration loaded"))
    }

    pub async fn run(self) -> anyhow::Result<(), Error> {
        match self.action {
            Action::Plan => {
                let plan = self
                    .orchestrator
                    .plan(self.config()?, &self.allocator)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            Action::Provision => {
                let plan = self
                    .orchestrator
                    .plan(self.config()?, &self.allocator)
                    .await?;
                let collections = self.orchestrator.provision(plan, self.options).await?;
                info!(
                    "Provisioned {} instances, outputs written to {:?}",
                    collections.len(),
                    self.orchestrator.outputs_path()
                );
            }
            Action::Destroy => {
                if let Err(err) = self.orchestrator.destroy().await {
                    error!("Destroy failed, the journal is kept for a retry");
                    return Err(err.into());
                }
                info!("Stack destroyed");
            }
        }
        Ok(())
    }
}
