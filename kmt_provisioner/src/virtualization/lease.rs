use std::{net::Ipv4Addr, path::Path, str::FromStr};

use log::{debug, info, warn};
use thiserror::Error;

use super::identity::DomainIdentity;
use crate::engine::ResourceHandle;
use crate::runner::{CommandArgs, CommandRunner};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum LeaseError {
    #[error("Invalid lease line: {0}")]
    InvalidLine(String),
    #[error("Invalid mac address: {0}")]
    InvalidMac(String),
    #[error("Invalid hw_address entry: {0}")]
    InvalidHwAddress(String),
    #[error("Failed to read leases: {0}")]
    Read(String),
}

pub const BOOTP_LEASES: &str = "/var/db/dhcpd_leases";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpLease {
    pub name: String,
    pub ip: String,
    pub mac: String,
}

/// Pads every octet to two lowercase hex digits.
pub fn normalize_mac(mac: &str) -> Result<String, LeaseError> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 {
        return Err(LeaseError::InvalidMac(mac.to_string()));
    }
    octets
        .iter()
        .map(|octet| {
            u8::from_str_radix(octet, 16)
                .ok()
                .filter(|_| !octet.is_empty() && octet.len() <= 2)
                .map(|value| format!("{:02x}", value))
                .ok_or_else(|| LeaseError::InvalidMac(mac.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|octets| octets.join(":"))
}

/// Parses one `arp -an` line: `? (10.211.55.4) at 0:1c:42:a:70:b on bridge100 ...`.
pub fn parse_arp_line(line: &str) -> Result<DhcpLease, LeaseError> {
    let invalid = || LeaseError::InvalidLine(line.to_string());
    let fields: Vec<&str> = line.split_whitespace().collect();
    let at = fields.iter().position(|field| *field == "at").ok_or_else(invalid)?;
    if at == 0 {
        return Err(invalid());
    }
    let ip = fields[at - 1]
        .strip_prefix('(')
        .and_then(|ip| ip.strip_suffix(')'))
        .ok_or_else(invalid)?;
    Ipv4Addr::from_str(ip).map_err(|_| invalid())?;
    let mac = fields.get(at + 1).ok_or_else(invalid)?;
    normalize_mac(mac)?;

    Ok(DhcpLease {
        name: String::new(),
        ip: ip.to_string(),
        mac: mac.to_string(),
    })
}

/// Parses the bootp lease database, a list of `{ key=value ... }` blocks.
pub fn parse_bootp_leases(content: &str) -> Result<Vec<DhcpLease>, LeaseError> {
    let mut leases = vec![];
    let mut lease = DhcpLease::default();
    for line in content.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("name=") {
            lease.name = name.to_string();
        } else if let Some(ip) = line.strip_prefix("ip_address=") {
            lease.ip = ip.to_string();
        } else if let Some(hw_address) = line.strip_prefix("hw_address=") {
            let (_, mac) = hw_address
                .split_once(',')
                .filter(|(_, mac)| !mac.contains(','))
                .ok_or_else(|| LeaseError::InvalidHwAddress(hw_address.to_string()))?;
            lease.mac = mac.to_string();
        } else if line == "}" {
            leases.push(std::mem::take(&mut lease));
        }
    }
    Ok(leases)
}

/// Reads the lease table of an instance host. A local host answers from the
/// bootp database when present, every other host from its arp cache.
pub async fn read_leases(
    is_local: bool,
    runner: &(dyn CommandRunner + Send + Sync),
) -> Result<Vec<DhcpLease>, LeaseError> {
    if is_local && Path::new(BOOTP_LEASES).exists() {
        let content = tokio::fs::read_to_string(BOOTP_LEASES)
            .await
            .map_err(|err| LeaseError::Read(err.to_string()))?;
        return parse_bootp_leases(&content);
    }

    let arp = runner
        .command("read-arp-table", CommandArgs::new("arp -an").transient(), &[])
        .await
        .map_err(|err| LeaseError::Read(err.to_string()))?;
    Ok(arp
        .output(ResourceHandle::STDOUT)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| match parse_arp_line(line) {
            Ok(lease) => Some(lease),
            Err(err) => {
                debug!("Skipping arp entry: {}", err);
                None
            }
        })
        .collect())
}

/// Compares observed leases with the planned identities. Returns the number
/// of domains whose lease disagrees with the plan.
pub fn reconcile(identities: &[DomainIdentity], leases: &[DhcpLease]) -> usize {
    let mut mismatches = 0;
    for identity in identities {
        let observed = leases.iter().find(|lease| {
            normalize_mac(&lease.mac)
                .map(|mac| mac == identity.mac)
                .unwrap_or(false)
        });
        match observed {
            Some(lease) if lease.ip == identity.ip.to_string() => {
                debug!("Domain {} leased {}", identity.domain_id, lease.ip);
            }
            Some(lease) => {
                warn!(
                    "Domain {} leased {} instead of {}",
                    identity.domain_id, lease.ip, identity.ip
                );
                mismatches += 1;
            }
            None => {
                warn!(
                    "No lease observed for domain {} ({})",
                    identity.domain_id, identity.mac
                );
                mismatches += 1;
            }
        }
    }
    info!(
        "Lease reconciliation: {} of {} domains match",
        identities.len() - mismatches,
        identities.len()
    );
    mismatches
}
