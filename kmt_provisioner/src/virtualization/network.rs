use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::{debug, info};
use thiserror::Error;

use super::domain::FinalizedDomain;
use super::subnet::gateway;
use super::templates::{self, render, TemplateArgs, Templates};
use crate::config::InstanceArch;
use crate::engine::{ResourceArgs, ResourceEngine, ResourceHandle};
use crate::runner::{CommandArgs, CommandRunner};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum NetworkError {
    #[error("Failed to create network {network}: {message}")]
    Create { network: String, message: String },
    #[error("Failed to install firewall rules on {bridge}: {message}")]
    Firewall { bridge: String, message: String },
}

pub const NETMASK: &str = "255.255.255.0";
const LAST_HOST: u8 = 254;

const RPC_PORTS: &str = "rpcinfo -p | grep -e portmapper -e mountd -e nfs | grep {protocol} | rev | cut -d ' ' -f 3 | rev | sort | uniq | tr '\\n' ' ' | awk '{$1=$1};1' | tr ' ' ',' | tr -d '\\n'";
const TCP_RULE: &str = "iptables {flag} INPUT -p tcp -i {bridge} -s {subnet} -m multiport --dports $({ports}) -m state --state NEW,ESTABLISHED -j ACCEPT";
const UDP_RULE: &str = "iptables {flag} INPUT -p udp -i {bridge} -s {subnet} -m multiport --dports $({ports}) -j ACCEPT";

pub fn network_name(stack: &str, instance: &InstanceArch) -> String {
    format!("{}-network-{}", stack, instance)
}

pub fn bridge_name(subnet: &Ipv4Net) -> String {
    format!("ddvmbr{}", subnet.network().octets()[1])
}

pub fn dhcp_range(subnet: &Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    let [a, b, c, _] = subnet.network().octets();
    (
        Ipv4Addr::from(u32::from(gateway(subnet)) + 1),
        Ipv4Addr::new(a, b, c, LAST_HOST),
    )
}

pub fn render_network(name: &str, subnet: &Ipv4Net, domains: &[FinalizedDomain]) -> String {
    let (start, end) = dhcp_range(subnet);
    let entries: String = domains
        .iter()
        .map(|domain| domain.identity.dhcp_entry())
        .collect();
    let args = TemplateArgs::from([
        (templates::NETWORK_NAME, name.to_string()),
        (templates::BRIDGE, bridge_name(subnet)),
        (templates::GATEWAY, gateway(subnet).to_string()),
        (templates::NETMASK, NETMASK.to_string()),
        (templates::RANGE_START, start.to_string()),
        (templates::RANGE_END, end.to_string()),
        (templates::DHCP_ENTRIES, entries),
    ]);
    render(Templates::defaults().network, &args)
}

fn firewall_rule(rule: &str, protocol: &str, flag: &str, bridge: &str, subnet: &Ipv4Net) -> String {
    rule.replace("{flag}", flag)
        .replace("{bridge}", bridge)
        .replace("{subnet}", &subnet.to_string())
        .replace("{ports}", &RPC_PORTS.replace("{protocol}", protocol))
}

/// Rules admitting nfs traffic from the subnet on the bridge. The ports are
/// read from the rpc port registry when the rule runs.
pub fn firewall_rules(bridge: &str, subnet: &Ipv4Net) -> Vec<(&'static str, CommandArgs)> {
    [("tcp", TCP_RULE), ("udp", UDP_RULE)]
        .into_iter()
        .map(|(protocol, rule)| {
            let name = match protocol {
                "tcp" => "allow-nfs-ports-tcp",
                _ => "allow-nfs-ports-udp",
            };
            let args = CommandArgs::new(firewall_rule(rule, protocol, "-A", bridge, subnet))
                .with_delete(firewall_rule(rule, protocol, "-D", bridge, subnet))
                .with_sudo();
            (name, args)
        })
        .collect()
}

pub struct NetworkBuilder {
    stack: String,
}

impl NetworkBuilder {
    pub fn new(stack: String) -> Self {
        Self { stack }
    }

    /// Creates the instance network once every domain is finalized, then
    /// opens the export ports on its bridge.
    pub async fn build_network(
        &self,
        instance: &InstanceArch,
        subnet: &Ipv4Net,
        domains: &[FinalizedDomain],
        runner: &(dyn CommandRunner + Send + Sync),
        engine: &(dyn ResourceEngine + Send + Sync),
        deps: &[ResourceHandle],
    ) -> Result<Vec<ResourceHandle>, NetworkError> {
        let name = network_name(&self.stack, instance);
        info!(
            "Building network {} with {} dhcp entries",
            name,
            domains.len()
        );
        let args = ResourceArgs::Network {
            name: name.clone(),
            xml: render_network(&name, subnet, domains),
        };
        let network = engine
            .create(&format!("{}-network", name), args, deps)
            .await
            .map_err(|err| NetworkError::Create {
                network: name.clone(),
                message: err.to_string(),
            })?;

        let bridge = bridge_name(subnet);
        let mut handles = vec![network.clone()];
        for (rule, args) in firewall_rules(&bridge, subnet) {
            debug!("Installing {} on {}", rule, bridge);
            let handle = runner
                .command(
                    &format!("{}-{}", name, rule),
                    args,
                    std::slice::from_ref(&network),
                )
                .await
                .map_err(|err| NetworkError::Firewall {
                    bridge: bridge.clone(),
                    message: err.to_string(),
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }
}
