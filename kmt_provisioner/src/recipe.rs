use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum RecipeError {
    #[error("Unknown recipe: {0}")]
    UnknownRecipe(String),
    #[error("Unknown architecture: {0}")]
    UnknownArch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Arch {
    pub fn host() -> Result<Self, RecipeError> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Arm64),
            other => Err(RecipeError::UnknownArch(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => Err(RecipeError::UnknownArch(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipe {
    CustomX86_64,
    CustomArm64,
    DistroX86_64,
    DistroArm64,
    CustomLocal,
    DistroLocal,
    Default,
}

/// Descriptor layout used to render a domain. Local recipes are resolved
/// to the host architecture before reaching this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateFamily {
    Custom(Arch),
    Distro(Arch),
    Default,
}

impl Recipe {
    pub fn is_local(&self) -> bool {
        matches!(self, Recipe::CustomLocal | Recipe::DistroLocal)
    }

    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            Recipe::CustomX86_64 | Recipe::CustomArm64 | Recipe::CustomLocal
        )
    }

    pub fn is_distro(&self) -> bool {
        matches!(
            self,
            Recipe::DistroX86_64 | Recipe::DistroArm64 | Recipe::DistroLocal
        )
    }

    /// Architecture named by the recipe itself, `None` for local and default recipes.
    pub fn arch(&self) -> Option<Arch> {
        match self {
            Recipe::CustomX86_64 | Recipe::DistroX86_64 => Some(Arch::X86_64),
            Recipe::CustomArm64 | Recipe::DistroArm64 => Some(Arch::Arm64),
            Recipe::CustomLocal | Recipe::DistroLocal | Recipe::Default => None,
        }
    }

    pub fn template_family(&self) -> Result<TemplateFamily, RecipeError> {
        self.template_family_for(Arch::host)
    }

    fn template_family_for(
        &self,
        host_arch: impl FnOnce() -> Result<Arch, RecipeError>,
    ) -> Result<TemplateFamily, RecipeError> {
        Ok(match self {
            Recipe::CustomX86_64 => TemplateFamily::Custom(Arch::X86_64),
            Recipe::CustomArm64 => TemplateFamily::Custom(Arch::Arm64),
            Recipe::DistroX86_64 => TemplateFamily::Distro(Arch::X86_64),
            Recipe::DistroArm64 => TemplateFamily::Distro(Arch::Arm64),
            Recipe::CustomLocal => TemplateFamily::Custom(host_arch()?),
            Recipe::DistroLocal => TemplateFamily::Distro(host_arch()?),
            Recipe::Default => TemplateFamily::Default,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::CustomX86_64 => "custom-x86_64",
            Recipe::CustomArm64 => "custom-arm64",
            Recipe::DistroX86_64 => "distro-x86_64",
            Recipe::DistroArm64 => "distro-arm64",
            Recipe::CustomLocal => "custom-local",
            Recipe::DistroLocal => "distro-local",
            Recipe::Default => "default",
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipe {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom-x86_64" => Ok(Recipe::CustomX86_64),
            "custom-arm64" => Ok(Recipe::CustomArm64),
            "distro-x86_64" => Ok(Recipe::DistroX86_64),
            "distro-arm64" => Ok(Recipe::DistroArm64),
            "custom-local" => Ok(Recipe::CustomLocal),
            "distro-local" => Ok(Recipe::DistroLocal),
            "default" => Ok(Recipe::Default),
            _ => Err(RecipeError::UnknownRecipe(s.to_string())),
        }
    }
}

impl TryFrom<String> for Recipe {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Recipe::from_str(&value)
    }
}

impl From<Recipe> for String {
    fn from(value: Recipe) -> Self {
        value.as_str().to_string()
    }
}

impl TemplateFamily {
    pub fn arch(&self) -> Option<Arch> {
        match self {
            TemplateFamily::Custom(arch) | TemplateFamily::Distro(arch) => Some(*arch),
            TemplateFamily::Default => None,
        }
    }
}
