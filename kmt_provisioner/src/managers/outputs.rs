use std::{collections::BTreeMap, net::Ipv4Addr, path::Path};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::collection::VMCollection;
use crate::config::InstanceArch;
use crate::utils::repository::{RepositoryError, YamlRepository};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutput {
    pub arch: InstanceArch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub uri: String,
    pub subnet: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOutput {
    pub id: String,
    pub libvirt_name: String,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub instance: InstanceArch,
}

/// What a provisioning run left behind, for the tools driving the domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub stack: String,
    pub instances: BTreeMap<String, InstanceOutput>,
    pub domains: Vec<DomainOutput>,
}

impl OutputRecord {
    pub fn new(stack: &str, collections: &[VMCollection]) -> Self {
        let instances = collections
            .iter()
            .map(|collection| {
                (
                    collection.instance.to_string(),
                    InstanceOutput {
                        arch: collection.instance,
                        host: collection.host.clone(),
                        uri: collection.uri.clone(),
                        subnet: collection.subnet,
                    },
                )
            })
            .collect();
        let domains = collections
            .iter()
            .flat_map(|collection| collection.identities())
            .map(|identity| DomainOutput {
                id: identity.domain_id,
                libvirt_name: identity.libvirt_name,
                ip: identity.ip,
                mac: identity.mac,
                instance: identity.instance,
            })
            .collect();

        OutputRecord {
            stack: stack.to_string(),
            instances,
            domains,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), RepositoryError> {
        YamlRepository::new(self.clone(), path).await.map(|_| ())
    }
}
