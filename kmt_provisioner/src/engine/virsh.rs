use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use super::{EngineError, ResourceArgs, ResourceEngine, ResourceHandle, ResourceKind};
use crate::runner::{shell_quote, CommandArgs, CommandRunner, RunnerError};

/// Resource engine driving libvirt through `virsh` on the instance runner.
pub struct VirshEngine {
    runner: Arc<dyn CommandRunner + Send + Sync>,
    uri: String,
}

impl VirshEngine {
    pub fn new(runner: Arc<dyn CommandRunner + Send + Sync>, uri: String) -> Self {
        Self { runner, uri }
    }

    fn virsh(&self, subcommand: &str) -> String {
        format!("virsh -c {} {}", shell_quote(&self.uri), subcommand)
    }

    pub fn scratch_path(kind: ResourceKind, name: &str) -> String {
        format!("/tmp/{}-{}.xml", kind, name)
    }

    async fn run(
        &self,
        name: &str,
        command: String,
        deps: &[ResourceHandle],
    ) -> Result<String, RunnerError> {
        let handle = self
            .runner
            .command(name, CommandArgs::new(command), deps)
            .await?;
        Ok(handle
            .output(ResourceHandle::STDOUT)
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn write_scratch(
        &self,
        name: &str,
        path: &str,
        xml: &str,
        deps: &[ResourceHandle],
    ) -> Result<(), RunnerError> {
        self.runner
            .command(
                &format!("{}-write-xml", name),
                CommandArgs::new(format!("cat > {}", path)).with_stdin(xml),
                deps,
            )
            .await
            .map(|_| ())
    }

    async fn create_pool(
        &self,
        name: &str,
        pool: &str,
        path: &str,
        xml: &str,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let scratch = Self::scratch_path(ResourceKind::Pool, pool);
        self.write_scratch(name, &scratch, xml, deps).await?;
        for step in ["pool-define", "pool-build", "pool-start", "pool-autostart"] {
            let target = if step == "pool-define" {
                scratch.as_str()
            } else {
                pool
            };
            self.run(
                &format!("{}-{}", name, step),
                self.virsh(&format!("{} {}", step, target)),
                deps,
            )
            .await?;
        }
        Ok(ResourceHandle::new(ResourceKind::Pool, name, pool)
            .with_output(ResourceHandle::PATH, path))
    }

    async fn create_volume(
        &self,
        name: &str,
        volume: &str,
        pool: &str,
        xml: &str,
        source: Option<&str>,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let scratch = Self::scratch_path(ResourceKind::Volume, volume);
        self.write_scratch(name, &scratch, xml, deps).await?;
        self.run(
            &format!("{}-vol-create", name),
            self.virsh(&format!("vol-create --pool {} {}", pool, scratch)),
            deps,
        )
        .await?;
        if let Some(source) = source {
            self.run(
                &format!("{}-vol-upload", name),
                self.virsh(&format!("vol-upload --pool {} {} {}", pool, volume, source)),
                deps,
            )
            .await?;
        }
        self.volume_handle(name, volume, pool, deps).await
    }

    async fn create_overlay(
        &self,
        name: &str,
        volume: &str,
        pool: &str,
        base_volume: &str,
        format: &str,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        self.run(
            &format!("{}-vol-create-as", name),
            self.virsh(&format!(
                "vol-create-as --pool {} {} 0 --format {} --backing-vol {} --backing-vol-format {}",
                pool, volume, format, base_volume, format
            )),
            deps,
        )
        .await?;
        self.volume_handle(name, volume, pool, deps).await
    }

    async fn volume_handle(
        &self,
        name: &str,
        volume: &str,
        pool: &str,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let key = self
            .run(
                &format!("{}-vol-key", name),
                self.virsh(&format!("vol-key --pool {} {}", pool, volume)),
                deps,
            )
            .await?;
        Ok(ResourceHandle::new(ResourceKind::Volume, name, &key)
            .with_output(ResourceHandle::POOL, pool)
            .with_output(ResourceHandle::VOLUME, volume))
    }

    async fn create_defined(
        &self,
        name: &str,
        kind: ResourceKind,
        resource: &str,
        xml: &str,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let scratch = Self::scratch_path(kind, resource);
        self.write_scratch(name, &scratch, xml, deps).await?;
        let (define, start) = match kind {
            ResourceKind::Network => ("net-define", "net-start"),
            _ => ("define", "start"),
        };
        self.run(
            &format!("{}-{}", name, define),
            self.virsh(&format!("{} {}", define, scratch)),
            deps,
        )
        .await?;
        self.run(
            &format!("{}-{}", name, start),
            self.virsh(&format!("{} {}", start, resource)),
            deps,
        )
        .await?;
        Ok(ResourceHandle::new(kind, name, resource))
    }

    fn teardown_commands(&self, handle: &ResourceHandle) -> Vec<String> {
        match handle.kind {
            ResourceKind::Pool => vec![
                format!("{} || true", self.virsh(&format!("pool-destroy {}", handle.id))),
                self.virsh(&format!("pool-delete {}", handle.id)),
                self.virsh(&format!("pool-undefine {}", handle.id)),
            ],
            ResourceKind::Volume => {
                let pool = handle.output(ResourceHandle::POOL).unwrap_or_default();
                let volume = handle.output(ResourceHandle::VOLUME).unwrap_or(&handle.id);
                vec![self.virsh(&format!("vol-delete --pool {} {}", pool, volume))]
            }
            ResourceKind::Network => vec![
                format!("{} || true", self.virsh(&format!("net-destroy {}", handle.id))),
                self.virsh(&format!("net-undefine {}", handle.id)),
            ],
            ResourceKind::Domain => vec![
                format!("{} || true", self.virsh(&format!("destroy {}", handle.id))),
                self.virsh(&format!("undefine {} --nvram", handle.id)),
            ],
            ResourceKind::Command => vec![],
        }
    }
}

#[async_trait]
impl ResourceEngine for VirshEngine {
    async fn create(
        &self,
        name: &str,
        args: ResourceArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, EngineError> {
        let kind = args.kind();
        debug!("Creating {} {} through {}", kind, name, self.uri);
        let result = match &args {
            ResourceArgs::Pool { name: pool, path, xml } => {
                self.create_pool(name, pool, &path.to_string_lossy(), xml, deps)
                    .await
            }
            ResourceArgs::Volume {
                name: volume,
                pool,
                xml,
                source,
            } => {
                let source = source.as_ref().map(|path| path.to_string_lossy().to_string());
                self.create_volume(name, volume, pool, xml, source.as_deref(), deps)
                    .await
            }
            ResourceArgs::Overlay {
                name: volume,
                pool,
                base_volume,
                format,
            } => {
                self.create_overlay(name, volume, pool, base_volume, format, deps)
                    .await
            }
            ResourceArgs::Network { name: network, xml } => {
                self.create_defined(name, ResourceKind::Network, network, xml, deps)
                    .await
            }
            ResourceArgs::Domain { name: domain, xml } => {
                self.create_defined(name, ResourceKind::Domain, domain, xml, deps)
                    .await
            }
        };
        let handle = result.map_err(|err| EngineError::Create {
            kind,
            name: name.to_string(),
            message: err.to_string(),
        })?;
        info!("Created {} {} with id: {}", kind, name, handle.id);
        Ok(handle)
    }

    async fn destroy(&self, handle: &ResourceHandle) -> Result<(), EngineError> {
        debug!("Destroying {} {}", handle.kind, handle.name);
        for (step, command) in self.teardown_commands(handle).into_iter().enumerate() {
            self.run(&format!("{}-destroy-{}", handle.name, step), command, &[])
                .await
                .map_err(|err| EngineError::Destroy {
                    kind: handle.kind,
                    name: handle.name.clone(),
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, sync::Arc};

    use mockall::{predicate, Sequence};

    use super::VirshEngine;
    use crate::engine::{EngineError, ResourceArgs, ResourceEngine, ResourceHandle, ResourceKind};
    use crate::runner::RunnerError;
    use crate::utils::test_utilities::{create_command_handle, MockCommandRunner};

    const URI: &str = "qemu:///system";

    fn expect_command(
        runner: &mut MockCommandRunner,
        seq: &mut Sequence,
        fragment: &'static str,
        stdout: &'static str,
    ) {
        runner
            .expect_command()
            .withf(move |_, args, _| args.create.contains(fragment))
            .times(1)
            .in_sequence(seq)
            .returning(move |name, _, _| Ok(create_command_handle(name, stdout)));
    }

    #[tokio::test]
    async fn pool_activation_is_ordered() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_command()
            .withf(|_, args, _| {
                args.create == "cat > /tmp/pool-stack-set-a.xml"
                    && args.stdin.as_deref() == Some("<pool/>")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _, _| Ok(create_command_handle(name, "")));
        for step in [
            "pool-define /tmp/pool-stack-set-a.xml",
            "pool-build stack-set-a",
            "pool-start stack-set-a",
            "pool-autostart stack-set-a",
        ] {
            expect_command(&mut runner, &mut seq, step, "");
        }
        let engine = VirshEngine::new(Arc::new(runner), String::from(URI));
        let handle = engine
            .create(
                "pool-set-a",
                ResourceArgs::Pool {
                    name: String::from("stack-set-a"),
                    path: PathBuf::from("/pools/stack-set-a"),
                    xml: String::from("<pool/>"),
                },
                &[],
            )
            .await
            .unwrap();
        assert_eq!(handle.kind, ResourceKind::Pool);
        assert_eq!(handle.id, "stack-set-a");
        assert_eq!(handle.output(ResourceHandle::PATH), Some("/pools/stack-set-a"));
    }

    #[tokio::test]
    async fn overlay_uses_backing_volume_key() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_command(
            &mut runner,
            &mut seq,
            "vol-create-as --pool stack-set-a overlay-1 0 --format qcow2 --backing-vol /pools/base --backing-vol-format qcow2",
            "",
        );
        expect_command(
            &mut runner,
            &mut seq,
            "vol-key --pool stack-set-a overlay-1",
            "/pools/stack-set-a/overlay-1\n",
        );
        let engine = VirshEngine::new(Arc::new(runner), String::from(URI));
        let handle = engine
            .create(
                "overlay-1",
                ResourceArgs::Overlay {
                    name: String::from("overlay-1"),
                    pool: String::from("stack-set-a"),
                    base_volume: String::from("/pools/base"),
                    format: String::from("qcow2"),
                },
                &[],
            )
            .await
            .unwrap();
        assert_eq!(handle.id, "/pools/stack-set-a/overlay-1");
        assert_eq!(handle.output(ResourceHandle::POOL), Some("stack-set-a"));
    }

    #[tokio::test]
    async fn destroy_domain_undefines_nvram() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_command(&mut runner, &mut seq, "destroy stack-ddvm-x || true", "");
        expect_command(&mut runner, &mut seq, "undefine stack-ddvm-x --nvram", "");
        let engine = VirshEngine::new(Arc::new(runner), String::from(URI));
        engine
            .destroy(&ResourceHandle::new(ResourceKind::Domain, "ddvm-x", "stack-ddvm-x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn runner_failure_is_create_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_command()
            .with(predicate::always(), predicate::always(), predicate::always())
            .returning(|name, _, _| {
                Err(RunnerError::Failed {
                    name: name.to_string(),
                    status: String::from("exit status: 1"),
                    stderr: String::from("network already exists"),
                })
            });
        let engine = VirshEngine::new(Arc::new(runner), String::from(URI));
        let result = engine
            .create(
                "network",
                ResourceArgs::Network {
                    name: String::from("stack-network-x86_64"),
                    xml: String::from("<network/>"),
                },
                &[],
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Create { kind: ResourceKind::Network, .. })
        ));
    }
}
