use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::{Arch, Recipe, RecipeError};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Read(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Vm set {0} is defined more than once")]
    DuplicateVmSet(String),
    #[error("Kernel tag {tag} is used more than once in vm set {vmset}")]
    DuplicateKernelTag { vmset: String, tag: String },
    #[error("Vm set {vmset} has an empty {field} list")]
    EmptyField { vmset: String, field: String },
    #[error("Vm set {vmset}: {message}")]
    UnknownRecipe { vmset: String, message: String },
    #[error("Vm set {vmset} has invalid image configuration: {message}")]
    InvalidImage { vmset: String, message: String },
    #[error("Vm set {vmset} has mismatching architecture: {message}")]
    ArchMismatch { vmset: String, message: String },
    #[error("Unknown instance architecture: {0}")]
    UnknownInstanceArch(String),
}

pub const RAM_POOL: &str = "ram";
pub const DEFAULT_POOL: &str = "default";

/// Host a vm set is placed on. Every distinct value becomes one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InstanceArch {
    Metal(Arch),
    Local,
}

impl InstanceArch {
    pub fn is_local(&self) -> bool {
        matches!(self, InstanceArch::Local)
    }
}

impl fmt::Display for InstanceArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceArch::Metal(arch) => arch.fmt(f),
            InstanceArch::Local => f.write_str("local"),
        }
    }
}

impl FromStr for InstanceArch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(InstanceArch::Local),
            other => Arch::from_str(other)
                .map(InstanceArch::Metal)
                .map_err(|_| ConfigError::UnknownInstanceArch(other.to_string())),
        }
    }
}

impl TryFrom<String> for InstanceArch {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        InstanceArch::from_str(&value)
    }
}

impl From<InstanceArch> for String {
    fn from(value: InstanceArch) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Kernel {
    pub dir: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Image {
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub image_source: String,
}

impl Image {
    pub fn is_empty(&self) -> bool {
        self.image_path.is_empty() && self.image_source.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    #[serde(rename = "type")]
    pub pool_type: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub mount_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmSet {
    pub name: String,
    pub recipe: String,
    pub arch: InstanceArch,
    pub kernels: Vec<Kernel>,
    pub vcpu: Vec<u32>,
    pub memory: Vec<u32>,
    #[serde(default, skip_serializing_if = "Image::is_empty")]
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
}

impl VmSet {
    pub fn recipe(&self) -> Result<Recipe, RecipeError> {
        Recipe::from_str(&self.recipe)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let recipe = self.recipe().map_err(|err| ConfigError::UnknownRecipe {
            vmset: self.name.clone(),
            message: err.to_string(),
        })?;

        for (field, empty) in [
            ("kernels", self.kernels.is_empty()),
            ("vcpu", self.vcpu.is_empty()),
            ("memory", self.memory.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::EmptyField {
                    vmset: self.name.clone(),
                    field: field.to_string(),
                });
            }
        }

        let mut tags = HashSet::new();
        for kernel in &self.kernels {
            if !tags.insert(kernel.tag.as_str()) {
                return Err(ConfigError::DuplicateKernelTag {
                    vmset: self.name.clone(),
                    tag: kernel.tag.clone(),
                });
            }
        }

        self.validate_arch(&recipe)?;
        self.validate_image(&recipe)
    }

    fn validate_arch(&self, recipe: &Recipe) -> Result<(), ConfigError> {
        let mismatch = |message: String| ConfigError::ArchMismatch {
            vmset: self.name.clone(),
            message,
        };
        match (recipe, self.arch) {
            (Recipe::Default, _) => Err(ConfigError::UnknownRecipe {
                vmset: self.name.clone(),
                message: String::from("recipe default cannot build domains"),
            }),
            (recipe, InstanceArch::Local) if !recipe.is_local() => Err(mismatch(format!(
                "recipe {} cannot run on the local instance",
                recipe
            ))),
            (recipe, InstanceArch::Metal(arch)) if recipe.arch() != Some(arch) => Err(mismatch(
                format!("recipe {} cannot run on {} instance", recipe, arch),
            )),
            _ => Ok(()),
        }
    }

    fn validate_image(&self, recipe: &Recipe) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidImage {
            vmset: self.name.clone(),
            message: message.to_string(),
        };
        if recipe.is_custom() {
            if self.kernels.iter().any(|kernel| kernel.image_source.is_some()) {
                return Err(invalid("custom recipe kernels cannot define image_source"));
            }
            if self.image.image_path.is_empty() || self.image.image_source.is_empty() {
                return Err(invalid(
                    "custom recipe requires image with image_path and image_source",
                ));
            }
        } else if recipe.is_distro() {
            if self.kernels.iter().any(|kernel| kernel.image_source.is_none()) {
                return Err(invalid("distro recipe requires image_source for every kernel"));
            }
            if !self.image.is_empty() {
                return Err(invalid("distro recipe cannot define a vm set image"));
            }
        }
        Ok(())
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/root")
}

fn default_ssh_user() -> String {
    String::from("root")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    pub vmsets: Vec<VmSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshkey: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let stripped: Vec<&str> = content
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect();
        let config: Config = serde_json::from_str(&stripped.join("\n"))
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading vm sets configuration from: {:?}", path);
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ConfigError::Read(err.to_string()))?;
        Self::parse(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for vmset in &self.vmsets {
            if !names.insert(vmset.name.as_str()) {
                return Err(ConfigError::DuplicateVmSet(vmset.name.clone()));
            }
            vmset.validate()?;
        }
        Ok(())
    }

    pub fn vmsets_for(&self, instance: InstanceArch) -> Vec<VmSet> {
        self.vmsets
            .iter()
            .filter(|vmset| vmset.arch == instance)
            .cloned()
            .collect()
    }

    pub fn instance_archs(&self) -> Vec<InstanceArch> {
        let mut archs: Vec<InstanceArch> = self.vmsets.iter().map(|vmset| vmset.arch).collect();
        archs.sort();
        archs.dedup();
        archs
    }
}
