use std::collections::BTreeMap;
use std::str::FromStr;

use crate::recipe::{Arch, Recipe, RecipeError, TemplateFamily};

pub const SHARED_FS_MOUNT: &str = "sharedFSMount";
pub const DOMAIN_ID: &str = "domainID";
pub const DOMAIN_NAME: &str = "domainName";
pub const MAC_ADDRESS: &str = "mac";
pub const DHCP_ENTRIES: &str = "dhcpEntries";
pub const IMAGE_NAME: &str = "imageName";
pub const VOLUME_KEY: &str = "volumeKey";
pub const POOL_NAME: &str = "poolName";
pub const POOL_PATH: &str = "poolPath";
pub const NVRAM: &str = "nvram";
pub const EFI: &str = "efi";
pub const FORMAT: &str = "format";
pub const VCPU: &str = "vcpu";
pub const MEMORY: &str = "memory";
pub const MACHINE: &str = "machine";
pub const KERNEL: &str = "kernel";
pub const CMDLINE: &str = "cmdline";
pub const CPU_TUNE: &str = "cputune";
pub const DISKS: &str = "disks";
pub const CONSOLE: &str = "console";
pub const NETWORK: &str = "network";
pub const NETWORK_NAME: &str = "networkName";
pub const BRIDGE: &str = "bridge";
pub const GATEWAY: &str = "gateway";
pub const NETMASK: &str = "netmask";
pub const RANGE_START: &str = "rangeStart";
pub const RANGE_END: &str = "rangeEnd";

const CUSTOM_X86_64_DOMAIN: &str = include_str!("../../resources/custom/domain-x86_64.xml");
const CUSTOM_ARM64_DOMAIN: &str = include_str!("../../resources/custom/domain-arm64.xml");
const DISTRO_X86_64_DOMAIN: &str = include_str!("../../resources/distro/domain-x86_64.xml");
const DISTRO_ARM64_DOMAIN: &str = include_str!("../../resources/distro/domain-arm64.xml");
const DEFAULT_NETWORK: &str = include_str!("../../resources/default/network.xml");
const DEFAULT_POOL: &str = include_str!("../../resources/default/pool.xml");
const DEFAULT_VOLUME: &str = include_str!("../../resources/default/volume.xml");

pub type TemplateArgs = BTreeMap<&'static str, String>;

/// Descriptor templates for one recipe. Pools, volumes and networks share
/// the default templates across every family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Templates {
    pub family: TemplateFamily,
    pub domain: Option<&'static str>,
    pub pool: &'static str,
    pub volume: &'static str,
    pub network: &'static str,
}

impl Templates {
    pub fn for_family(family: TemplateFamily) -> Self {
        let domain = match family {
            TemplateFamily::Custom(Arch::X86_64) => Some(CUSTOM_X86_64_DOMAIN),
            TemplateFamily::Custom(Arch::Arm64) => Some(CUSTOM_ARM64_DOMAIN),
            TemplateFamily::Distro(Arch::X86_64) => Some(DISTRO_X86_64_DOMAIN),
            TemplateFamily::Distro(Arch::Arm64) => Some(DISTRO_ARM64_DOMAIN),
            TemplateFamily::Default => None,
        };
        Self {
            family,
            domain,
            pool: DEFAULT_POOL,
            volume: DEFAULT_VOLUME,
            network: DEFAULT_NETWORK,
        }
    }

    pub fn for_recipe(recipe: &str) -> Result<Self, RecipeError> {
        let family = Recipe::from_str(recipe)?.template_family()?;
        Ok(Self::for_family(family))
    }

    pub fn defaults() -> Self {
        Self::for_family(TemplateFamily::Default)
    }
}

/// Replaces every `{key}` token found in `args` in a single pass. Tokens
/// without a value are left untouched so they can be filled later.
pub fn render(template: &str, args: &TemplateArgs) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match candidate.find('}') {
            Some(end) => match args.get(&candidate[1..end]) {
                Some(value) => {
                    rendered.push_str(value);
                    rest = &candidate[end + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = &candidate[1..];
                }
            },
            None => {
                rendered.push_str(candidate);
                rest = "";
            }
        }
    }
    rendered.push_str(rest);
    rendered
}
