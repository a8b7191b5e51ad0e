use std::{collections::HashSet, net::Ipv4Addr};

use ipnet::Ipv4Net;
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::subnet::gateway;
use crate::config::{InstanceArch, VmSet};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdentityError {
    #[error("Subnet {0} has no address left for domain {1}")]
    AddressExhausted(Ipv4Net, String),
    #[error("Domain {0} is generated more than once")]
    DuplicateDomain(String),
}

const DHCP_ENTRY: &str = "<host mac='{mac}' name='{name}' ip='{ip}'/>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainIdentity {
    pub domain_id: String,
    pub libvirt_name: String,
    pub vmset: String,
    pub instance: InstanceArch,
    pub kernel_tag: String,
    pub vcpu: u32,
    pub memory: u32,
    pub mac: String,
    pub ip: Ipv4Addr,
}

impl DomainIdentity {
    pub fn dhcp_entry(&self) -> String {
        DHCP_ENTRY
            .replace("{mac}", &self.mac)
            .replace("{name}", &self.domain_id)
            .replace("{ip}", &self.ip.to_string())
    }
}

/// Consumers rely on the `{arch}-{tag}-{vmset}` prefix.
pub fn domain_id(arch: &InstanceArch, tag: &str, vmset: &str, vcpu: u32, memory: u32) -> String {
    format!("{}-{}-{}-ddvm-{}-{}", arch, tag, vmset, vcpu, memory)
}

pub fn libvirt_name(stack: &str, identifier: &str) -> String {
    format!("{}-ddvm-{}", stack, identifier)
}

pub fn unicast_mac(domain_id: &str) -> String {
    let seed = digest(&SHA256, domain_id.as_bytes());
    let mut seed_bytes = [0u8; 32];
    seed_bytes.copy_from_slice(seed.as_ref());
    let mut buf: Vec<u8> = StdRng::from_seed(seed_bytes)
        .sample_iter(&Alphanumeric)
        .take(6)
        .collect();
    buf[0] &= 0xfe;
    buf.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Hands out addresses after the gateway, in domain id order.
pub fn assign_addresses(
    identities: &mut [DomainIdentity],
    subnet: &Ipv4Net,
) -> Result<(), IdentityError> {
    identities.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));
    let broadcast = subnet.broadcast();
    let mut next = u32::from(gateway(subnet));
    for identity in identities.iter_mut() {
        next += 1;
        let ip = Ipv4Addr::from(next);
        if ip >= broadcast {
            return Err(IdentityError::AddressExhausted(
                *subnet,
                identity.domain_id.clone(),
            ));
        }
        identity.ip = ip;
    }
    Ok(())
}

pub struct IdentityGenerator {
    stack: String,
}

impl IdentityGenerator {
    pub fn new(stack: String) -> Self {
        Self { stack }
    }

    pub fn identities_for_set(&self, vmset: &VmSet) -> Vec<DomainIdentity> {
        let mut identities = vec![];
        for vcpu in &vmset.vcpu {
            for memory in &vmset.memory {
                for kernel in &vmset.kernels {
                    let id = domain_id(&vmset.arch, &kernel.tag, &vmset.name, *vcpu, *memory);
                    identities.push(DomainIdentity {
                        libvirt_name: libvirt_name(&self.stack, &id),
                        mac: unicast_mac(&id),
                        domain_id: id,
                        vmset: vmset.name.clone(),
                        instance: vmset.arch,
                        kernel_tag: kernel.tag.clone(),
                        vcpu: *vcpu,
                        memory: *memory,
                        ip: Ipv4Addr::UNSPECIFIED,
                    });
                }
            }
        }
        identities
    }

    /// Identities of every domain in the run, sorted by domain id with
    /// addresses assigned from the shared subnet.
    pub fn generate(
        &self,
        vmsets: &[VmSet],
        subnet: &Ipv4Net,
    ) -> Result<Vec<DomainIdentity>, IdentityError> {
        let mut identities: Vec<DomainIdentity> = vmsets
            .iter()
            .flat_map(|vmset| self.identities_for_set(vmset))
            .collect();
        let mut seen = HashSet::new();
        for identity in &identities {
            if !seen.insert(identity.domain_id.as_str()) {
                return Err(IdentityError::DuplicateDomain(identity.domain_id.clone()));
            }
        }
        assign_addresses(&mut identities, subnet)?;
        Ok(identities)
    }
}
