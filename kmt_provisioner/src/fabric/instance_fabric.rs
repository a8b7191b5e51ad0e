use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::info;

use crate::config::InstanceArch;
use crate::engine::journal::{Journal, JournalData};
use crate::engine::virsh::VirshEngine;
use crate::managers::instance::{
    Instance, InstanceBackend, InstanceCreator, InstanceError, MetalAccess, ProxyRunnerCreator,
};
use crate::recipe::Arch;
use crate::runner::local::LocalRunner;
use crate::runner::ssh::{Connection, SshRunner, Transport};
use crate::runner::CommandRunner;
use crate::utils::repository::YamlRepository;

pub const LOCAL_URI: &str = "qemu:///system";

pub fn metal_uri(user: &str, host: &str, libvirt_key: &Path) -> String {
    format!(
        "qemu+ssh://{}@{}/system?sshauth=privkey&keyfile={}&known_hosts_verify=ignore",
        user,
        host,
        libvirt_key.display()
    )
}

pub fn journal_path(state_dir: &Path, stack: &str, arch: &InstanceArch) -> PathBuf {
    state_dir.join(format!("{}-{}.yaml", stack, arch))
}

#[derive(Debug, Clone)]
pub struct MetalSettings {
    pub x86_host: Option<String>,
    pub arm64_host: Option<String>,
    pub user: String,
    pub private_key: Option<PathBuf>,
    pub libvirt_key_x86: PathBuf,
    pub libvirt_key_arm: PathBuf,
    pub per_dial_timeout: Duration,
    pub dial_error_limit: u32,
}

impl MetalSettings {
    fn access(&self, arch: Arch) -> Result<MetalAccess, InstanceError> {
        let (host, libvirt_key) = match arch {
            Arch::X86_64 => (&self.x86_host, &self.libvirt_key_x86),
            Arch::Arm64 => (&self.arm64_host, &self.libvirt_key_arm),
        };
        let host = host
            .clone()
            .ok_or_else(|| InstanceError::Creation(format!("no metal host given for {}", arch)))?;
        let private_key = self.private_key.clone().ok_or_else(|| {
            InstanceError::Creation(format!("no ssh key given for metal host {}", host))
        })?;
        Ok(MetalAccess {
            connection: Connection {
                host,
                user: self.user.clone(),
                port: Connection::DEFAULT_PORT,
                private_key,
                per_dial_timeout: self.per_dial_timeout,
                dial_error_limit: self.dial_error_limit,
            },
            libvirt_key: libvirt_key.clone(),
        })
    }
}

/// Builds instances for one stack. Local instances run commands on this
/// host, metal instances over ssh with libvirt reached through `qemu+ssh`.
pub struct InstanceFabric {
    stack: String,
    state_dir: PathBuf,
    metal: MetalSettings,
    sudo_password: Option<String>,
}

impl InstanceFabric {
    pub fn new(
        stack: String,
        state_dir: PathBuf,
        metal: MetalSettings,
        sudo_password: Option<String>,
    ) -> Self {
        InstanceFabric {
            stack,
            state_dir,
            metal,
            sudo_password,
        }
    }

    async fn open_journal(&self, arch: &InstanceArch) -> Result<Arc<Journal>, InstanceError> {
        let path = journal_path(&self.state_dir, &self.stack, arch);
        let repository = YamlRepository::open_or(JournalData::default(), &path)
            .await
            .map_err(|err| InstanceError::Creation(err.to_string()))?;
        Ok(Arc::new(Journal::new(Box::new(repository))))
    }

    fn proxy_runner_creator() -> ProxyRunnerCreator {
        Box::new(
            |transport: Transport| -> Box<dyn CommandRunner + Send + Sync> {
                Box::new(SshRunner::new(transport, None))
            },
        )
    }
}

#[async_trait]
impl InstanceCreator for InstanceFabric {
    async fn create_instance(&self, arch: InstanceArch) -> Result<Instance, InstanceError> {
        let (uri, metal, backend) = match arch {
            InstanceArch::Local => {
                let runner = Arc::new(LocalRunner::new(self.sudo_password.clone()));
                let uri = LOCAL_URI.to_string();
                let backend = InstanceBackend {
                    runner: runner.clone(),
                    engine: Arc::new(VirshEngine::new(runner.clone(), uri.clone())),
                    local_runner: runner,
                };
                (uri, None, backend)
            }
            InstanceArch::Metal(metal_arch) => {
                let access = self.metal.access(metal_arch)?;
                let uri = metal_uri(
                    &access.connection.user,
                    &access.connection.host,
                    &access.libvirt_key,
                );
                let local_runner = Arc::new(LocalRunner::new(None));
                let backend = InstanceBackend {
                    runner: Arc::new(SshRunner::new(
                        Transport::Direct(access.connection.clone()),
                        self.sudo_password.clone(),
                    )),
                    engine: Arc::new(VirshEngine::new(local_runner.clone(), uri.clone())),
                    local_runner,
                };
                (uri, Some(access), backend)
            }
        };
        info!("Creating instance {} on {}", arch, uri);

        Ok(Instance::new(
            arch,
            uri,
            metal,
            backend,
            self.open_journal(&arch).await?,
            Self::proxy_runner_creator(),
        ))
    }
}

#[cfg(test)]
mod test {
    use std::{
        path::{Path, PathBuf},
        time::Duration,
    };

    use super::{journal_path, metal_uri, InstanceFabric, MetalSettings};
    use crate::config::InstanceArch;
    use crate::managers::instance::{InstanceCreator, InstanceError, InstanceState};
    use crate::recipe::Arch;

    fn create_settings() -> MetalSettings {
        MetalSettings {
            x86_host: Some(String::from("10.1.0.4")),
            arm64_host: None,
            user: String::from("ubuntu"),
            private_key: Some(PathBuf::from("/keys/metal")),
            libvirt_key_x86: PathBuf::from("/tmp/libvirt_rsa-x86"),
            libvirt_key_arm: PathBuf::from("/tmp/libvirt_rsa-arm"),
            per_dial_timeout: Duration::from_secs(5),
            dial_error_limit: 60,
        }
    }

    #[test]
    fn metal_uri_uses_libvirt_key() {
        assert_eq!(
            metal_uri("ubuntu", "10.1.0.4", Path::new("/tmp/libvirt_rsa-x86")),
            "qemu+ssh://ubuntu@10.1.0.4/system?sshauth=privkey&keyfile=/tmp/libvirt_rsa-x86&known_hosts_verify=ignore"
        );
    }

    #[tokio::test]
    async fn instance_journal_is_created_in_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = InstanceFabric::new(
            String::from("dev"),
            dir.path().to_path_buf(),
            create_settings(),
            None,
        );
        let instance = fabric
            .create_instance(InstanceArch::Metal(Arch::X86_64))
            .await
            .unwrap();
        assert_eq!(instance.host().as_deref(), Some("10.1.0.4"));
        assert_eq!(instance.state(), InstanceState::Unprovisioned);
        assert!(journal_path(dir.path(), "dev", &InstanceArch::Metal(Arch::X86_64)).exists());
    }

    #[tokio::test]
    async fn metal_instance_needs_a_host() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = InstanceFabric::new(
            String::from("dev"),
            dir.path().to_path_buf(),
            create_settings(),
            None,
        );
        let result = fabric.create_instance(InstanceArch::Metal(Arch::Arm64)).await;
        assert!(matches!(result, Err(InstanceError::Creation(_))));
    }
}
