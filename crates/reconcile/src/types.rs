//! Core types for services and their versions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of service; decides which attribute handlers apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Edge logic written in VCL
    #[default]
    Vcl,
    /// Edge logic compiled to a WebAssembly package
    Compute,
}

impl ServiceType {
    /// All service kinds
    pub const ALL: [ServiceType; 2] = [ServiceType::Vcl, ServiceType::Compute];

    /// Wire name of the service kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Vcl => "vcl",
            ServiceType::Compute => "compute",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vcl" => Ok(ServiceType::Vcl),
            "compute" | "wasm" => Ok(ServiceType::Compute),
            other => Err(format!(
                "unknown service type `{other}` (expected one of: vcl, compute)"
            )),
        }
    }
}

/// One numbered snapshot of a service's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub number: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Version {
    /// A fresh, unlocked version
    pub fn draft(number: u32) -> Self {
        Self {
            number,
            active: false,
            locked: false,
            comment: None,
        }
    }

    /// Whether sub-resources of this version may still be changed
    pub fn is_mutable(&self) -> bool {
        !self.active && !self.locked
    }
}

/// A remote service and its version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub versions: Vec<Version>,
}

impl Service {
    /// The version currently serving traffic, if any
    pub fn active_version(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.active)
    }

    /// The highest-numbered version
    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.iter().max_by_key(|v| v.number)
    }

    /// Look up a version by number
    pub fn version(&self, number: u32) -> Option<&Version> {
        self.versions.iter().find(|v| v.number == number)
    }
}

/// Input for creating a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub comment: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
}

/// Service-scoped (not version-scoped) changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub name: Option<String>,
    pub comment: Option<String>,
}

impl ServiceUpdate {
    /// Whether the update would change anything
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.comment.is_none()
    }
}

/// Outcome of a remote validation check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default)]
    pub message: String,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: String::new(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
        }
    }
}

/// One status reading of an asynchronous remote step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl Observation {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: None,
        }
    }

    pub fn with_message(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
        }
    }
}

/// Where a run is in the version lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionPhase {
    /// Service just created; version 1 is empty and mutable
    NoDraft,
    /// An unlocked version is the target
    #[default]
    Mutable,
    /// Creating a new mutable version from a locked one
    Cloning,
    /// Attribute handlers are running against the draft
    Processing,
    /// Remote validation is in flight
    Validating,
    /// The draft passed validation
    Validated,
    /// The draft failed validation
    Invalid,
    /// Activation is in flight
    Activating,
    /// The draft is now the active version
    Active,
}

impl fmt::Display for VersionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionPhase::NoDraft => "no-draft",
            VersionPhase::Mutable => "mutable",
            VersionPhase::Cloning => "cloning",
            VersionPhase::Processing => "processing",
            VersionPhase::Validating => "validating",
            VersionPhase::Validated => "validated",
            VersionPhase::Invalid => "invalid",
            VersionPhase::Activating => "activating",
            VersionPhase::Active => "active",
        };
        f.write_str(name)
    }
}
