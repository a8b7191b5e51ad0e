use async_trait::async_trait;
use ipnet::IpNet;
use mockall::mock;

use super::repository::{Repository, RepositoryError};
use crate::config::{Image, InstanceArch, Kernel, VmSet};
use crate::engine::journal::JournalData;
use crate::engine::{EngineError, ResourceArgs, ResourceEngine, ResourceHandle};
use crate::recipe::Arch;
use crate::runner::{CommandArgs, CommandRunner, RunnerError};
use crate::virtualization::subnet::{InterfaceAddressSource, SubnetError};

pub fn create_example_kernel(tag: &str) -> Kernel {
    Kernel {
        dir: format!("kernel-{}", tag),
        tag: tag.to_string(),
        image_source: None,
        extra_params: Default::default(),
    }
}

pub fn create_example_vmset() -> VmSet {
    VmSet {
        name: String::from("set-a"),
        recipe: String::from("custom-x86_64"),
        arch: InstanceArch::Metal(Arch::X86_64),
        kernels: vec![create_example_kernel("k1"), create_example_kernel("k2")],
        vcpu: vec![2],
        memory: vec![2048],
        image: Image {
            image_path: String::from("bullseye.qcow2"),
            image_source: String::from("https://images.example.com/bullseye.qcow2"),
        },
        machine: None,
        disks: vec![],
    }
}

pub fn create_example_config_json() -> String {
    String::from(
        r#"{
    "workdir": "/home/kernel-version-testing",
    "vmsets": [
        {
            "name": "set-a",
            "recipe": "custom-x86_64",
            "arch": "x86_64",
            "kernels": [
                { "dir": "kernel-k1", "tag": "k1" },
                { "dir": "kernel-k2", "tag": "k2" }
            ],
            "vcpu": [2],
            "memory": [2048],
            "image": {
                "image_path": "bullseye.qcow2",
                "image_source": "https://images.example.com/bullseye.qcow2"
            }
        }
    ]
}"#,
    )
}

pub fn create_example_distro_set_json() -> String {
    String::from(
        r#"{
    "vmsets": [
        {
            "name": "distro-set",
            "recipe": "distro-local",
            "arch": "local",
            "kernels": [
                {
                    "image_source": "https://images.example.com/ubuntu.qcow2",
                    "dir": "ubuntu-jammy",
                    "tag": "jammy"
                }
            ],
            "vcpu": [2, 4],
            "memory": [4096]
        }
    ]
}"#,
    )
}

pub fn create_command_handle(name: &str, stdout: &str) -> ResourceHandle {
    crate::runner::command_handle(name, stdout.to_string())
}

#[derive(Default)]
pub struct InMemoryRepository {
    data: JournalData,
}

#[async_trait]
impl Repository for InMemoryRepository {
    type Data = JournalData;

    fn get(&self) -> &Self::Data {
        &self.data
    }

    fn get_mut(&mut self) -> &mut Self::Data {
        &mut self.data
    }

    async fn save(&mut self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn discard(&mut self) -> Result<(), RepositoryError> {
        self.data = JournalData::default();
        Ok(())
    }
}

mock! {
    pub CommandRunner {}

    #[async_trait]
    impl CommandRunner for CommandRunner {
        async fn command(
            &self,
            name: &str,
            args: CommandArgs,
            deps: &[ResourceHandle],
        ) -> Result<ResourceHandle, RunnerError>;
    }
}

mock! {
    pub ResourceEngine {}

    #[async_trait]
    impl ResourceEngine for ResourceEngine {
        async fn create(
            &self,
            name: &str,
            args: ResourceArgs,
            deps: &[ResourceHandle],
        ) -> Result<ResourceHandle, EngineError>;
        async fn destroy(&self, handle: &ResourceHandle) -> Result<(), EngineError>;
    }
}

mock! {
    pub InterfaceAddressSource {}

    #[async_trait]
    impl InterfaceAddressSource for InterfaceAddressSource {
        async fn addresses(&self) -> Result<Vec<IpNet>, SubnetError>;
    }
}
