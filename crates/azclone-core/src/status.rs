//! Lifecycle status enums.
//!
//! The state store keeps status columns as text, so every enum here
//! round-trips through its string form. Sessions move monotonically through
//! their state sets; the only backward-looking transition is an explicit
//! cancel.

use serde::{Deserialize, Serialize};

use crate::Error;

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Status of a discovery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(DiscoveryStatus {
    InProgress => "InProgress",
    Completed => "Completed",
    Failed => "Failed",
    Cancelled => "Cancelled",
});

impl DiscoveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Status of a discovered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Discovered,
    Analyzed,
    TemplateGenerated,
    ReadyForCloning,
    Cloning,
    Cloned,
    Failed,
}

status_strings!(ResourceStatus {
    Discovered => "Discovered",
    Analyzed => "Analyzed",
    TemplateGenerated => "TemplateGenerated",
    ReadyForCloning => "ReadyForCloning",
    Cloning => "Cloning",
    Cloned => "Cloned",
    Failed => "Failed",
});

/// Status of a deployment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Created,
    Validating,
    ValidationFailed,
    ValidationPassed,
    Deploying,
    PartiallyDeployed,
    Deployed,
    Failed,
    Cancelled,
}

status_strings!(DeploymentStatus {
    Created => "Created",
    Validating => "Validating",
    ValidationFailed => "ValidationFailed",
    ValidationPassed => "ValidationPassed",
    Deploying => "Deploying",
    PartiallyDeployed => "PartiallyDeployed",
    Deployed => "Deployed",
    Failed => "Failed",
    Cancelled => "Cancelled",
});

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PartiallyDeployed | Self::Deployed | Self::Failed | Self::Cancelled
        )
    }
}

/// Status of a single template deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStatus {
    Created,
    Validating,
    ValidationFailed,
    ValidationPassed,
    Queued,
    Deploying,
    Deployed,
    Failed,
    Skipped,
}

status_strings!(TemplateStatus {
    Created => "Created",
    Validating => "Validating",
    ValidationFailed => "ValidationFailed",
    ValidationPassed => "ValidationPassed",
    Queued => "Queued",
    Deploying => "Deploying",
    Deployed => "Deployed",
    Failed => "Failed",
    Skipped => "Skipped",
});

impl TemplateStatus {
    /// Terminal for the deployment workflow: nothing further will happen to
    /// this template.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed | Self::Deployed | Self::Failed | Self::Skipped
        )
    }
}

/// Classification of a dependency edge between two resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    Network,
    Storage,
    Identity,
    Configuration,
    ParentChild,
    CrossResourceGroup,
}

status_strings!(EdgeType {
    Network => "Network",
    Storage => "Storage",
    Identity => "Identity",
    Configuration => "Configuration",
    ParentChild => "ParentChild",
    CrossResourceGroup => "CrossResourceGroup",
});

/// ARM deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Add or update declared resources, leave the rest alone.
    Incremental,
    /// Reconcile the resource group to the template, deleting undeclared
    /// resources.
    Complete,
}

status_strings!(DeploymentMode {
    Incremental => "Incremental",
    Complete => "Complete",
});
