use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum SubnetError {
    #[error("Could not find a free subnet")]
    NoFreeSubnet,
    #[error("Failed to read interface addresses: {0}")]
    InterfaceScan(String),
}

#[async_trait]
pub trait InterfaceAddressSource {
    async fn addresses(&self) -> Result<Vec<IpNet>, SubnetError>;
}

pub struct NetlinkAddressSource;

#[async_trait]
impl InterfaceAddressSource for NetlinkAddressSource {
    async fn addresses(&self) -> Result<Vec<IpNet>, SubnetError> {
        rtnetlink_wrapper::read_interface_addresses()
            .await
            .map_err(|err| SubnetError::InterfaceScan(err.to_string()))
    }
}

pub const SUBNET_PREFIX_LEN: u8 = 24;
const CANDIDATES: std::ops::RangeInclusive<u8> = 1..=254;

pub fn candidate_subnet(index: u8) -> Option<Ipv4Net> {
    Ipv4Net::new(Ipv4Addr::new(100, index, 0, 0), SUBNET_PREFIX_LEN).ok()
}

fn collides(candidate: &Ipv4Net, existing: &IpNet) -> bool {
    match existing {
        IpNet::V4(existing) => {
            candidate.contains(&existing.addr()) || existing.contains(&candidate.network())
        }
        IpNet::V6(_) => false,
    }
}

pub fn find_free_subnet(existing: &[IpNet]) -> Result<Ipv4Net, SubnetError> {
    CANDIDATES
        .filter_map(candidate_subnet)
        .find(|candidate| !existing.iter().any(|net| collides(candidate, net)))
        .ok_or(SubnetError::NoFreeSubnet)
}

pub fn gateway(subnet: &Ipv4Net) -> Ipv4Addr {
    let network = u32::from(subnet.network());
    Ipv4Addr::from(network + 1)
}

/// Allocates the micro-vm subnet once and hands the same value to every caller.
pub struct SubnetAllocator {
    source: Box<dyn InterfaceAddressSource + Send + Sync>,
    subnet: OnceCell<Ipv4Net>,
}

impl SubnetAllocator {
    pub fn new(source: Box<dyn InterfaceAddressSource + Send + Sync>) -> Self {
        Self {
            source,
            subnet: OnceCell::new(),
        }
    }

    pub async fn allocate(&self) -> Result<Ipv4Net, SubnetError> {
        self.subnet
            .get_or_try_init(|| async {
                let existing = self.source.addresses().await?;
                debug!("Existing interface networks: {:?}", existing);
                let subnet = find_free_subnet(&existing)?;
                info!("Allocated micro-vm subnet: {}", subnet);
                Ok::<Ipv4Net, SubnetError>(subnet)
            })
            .await
            .copied()
    }
}

mod rtnetlink_wrapper {
    use std::io;

    use futures::TryStreamExt;
    use ipnet::IpNet;
    use netlink_packet_route::address::AddressAttribute;
    use rtnetlink::{new_connection, Handle};
    use thiserror::Error;
    use tokio::task::JoinHandle;

    #[derive(Error, Debug)]
    pub enum RtNetLinkAddressError {
        #[error("Failed establish connection: {0}")]
        ConnectionCreation(#[source] io::Error),
        #[error("Failed to dump addresses: {0}")]
        AddressDump(#[source] rtnetlink::Error),
    }

    fn get_handler_and_connection() -> Result<(Handle, JoinHandle<()>), io::Error> {
        let (connection, handle, _) = new_connection()?;
        let join_handle = tokio::spawn(connection);
        Ok((handle, join_handle))
    }

    pub async fn read_interface_addresses() -> Result<Vec<IpNet>, RtNetLinkAddressError> {
        let (handle, connection) =
            get_handler_and_connection().map_err(RtNetLinkAddressError::ConnectionCreation)?;
        let mut addresses = vec![];
        let mut messages = handle.address().get().execute();
        let result = loop {
            match messages.try_next().await {
                Ok(Some(message)) => {
                    let prefix_len = message.header.prefix_len;
                    addresses.extend(message.attributes.iter().filter_map(|attribute| {
                        match attribute {
                            AddressAttribute::Address(ip) => IpNet::new(*ip, prefix_len).ok(),
                            _ => None,
                        }
                    }));
                }
                Ok(None) => break Ok(addresses),
                Err(err) => break Err(RtNetLinkAddressError::AddressDump(err)),
            }
        };
        connection.abort();
        result
    }
}
