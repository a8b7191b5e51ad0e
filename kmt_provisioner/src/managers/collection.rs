use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::config::InstanceArch;
use crate::engine::ResourceHandle;
use crate::runner::ssh::Transport;
use crate::virtualization::domain::DomainDisk;
use crate::virtualization::identity::DomainIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedDomain {
    pub identity: DomainIdentity,
    pub disks: Vec<DomainDisk>,
    pub handle: ResourceHandle,
    pub proxy: Option<Transport>,
}

impl LaunchedDomain {
    pub fn extra_disks(&self) -> impl Iterator<Item = &DomainDisk> {
        self.disks.iter().skip(1)
    }
}

/// Everything created on one instance by a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VMCollection {
    pub instance: InstanceArch,
    pub host: Option<String>,
    pub uri: String,
    pub subnet: Ipv4Net,
    pub pools: BTreeMap<String, Vec<ResourceHandle>>,
    pub volumes: BTreeMap<String, ResourceHandle>,
    pub network: Vec<ResourceHandle>,
    pub domains: Vec<LaunchedDomain>,
}

impl VMCollection {
    pub fn new(instance: InstanceArch, host: Option<String>, uri: String, subnet: Ipv4Net) -> Self {
        Self {
            instance,
            host,
            uri,
            subnet,
            pools: BTreeMap::new(),
            volumes: BTreeMap::new(),
            network: vec![],
            domains: vec![],
        }
    }

    pub fn identities(&self) -> Vec<DomainIdentity> {
        self.domains
            .iter()
            .map(|domain| domain.identity.clone())
            .collect()
    }
}
