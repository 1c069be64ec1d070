//! Setup and cleanup tasks synthesized at traversal time.
//!
//! These tasks never live in the graph arena. Each one is resolved from an
//! object's own parameters, run once through the executor and dropped.

use crate::{ObjectId, ParamProvider, Params, SchedulerError, TestNode, restriction_str};
use serde::{Deserialize, Serialize};

const MANAGE_VARIANT: &str = "manage.unchanged";
const PREINSTALL_VARIANT: &str = "0preinstall";
const INSTALL_VARIANT: &str = "install";
const REDHAT_UNATTENDED_VARIANT: &str = "unattended_install.cdrom.extra_cdrom_ks";
const WINDOWS_UNATTENDED_VARIANT: &str = "unattended_install.cdrom";

pub const DEFAULT_INSTALL_METHOD: &str = "stepmaker";
pub const UNATTENDED_INSTALL_METHOD: &str = "unattended_install";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    RedHat,
    Windows,
}

impl OsFamily {
    /// Detects the family from an object's dotted variant name.
    pub fn detect(variant_name: &str) -> Result<Self, SchedulerError> {
        if variant_name.contains(".Fedora.") || variant_name.contains(".CentOS.") {
            Ok(Self::RedHat)
        } else if variant_name.contains(".Windows.") {
            Ok(Self::Windows)
        } else {
            Err(SchedulerError::Unsupported(format!(
                "unattended install tests are only supported on Windows and Fedora/CentOS, not '{variant_name}'"
            )))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "value", rename_all = "snake_case")]
pub enum InstallMethod {
    Unattended(OsFamily),
    Generic(String),
}

impl InstallMethod {
    /// Chooses the install method from the `configure_install` value reported
    /// by the pre-install configuration.
    pub fn from_configured(method: &str, object_variant: &str) -> Result<Self, SchedulerError> {
        if method == UNATTENDED_INSTALL_METHOD {
            OsFamily::detect(object_variant).map(Self::Unattended)
        } else {
            Ok(Self::Generic(method.to_string()))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum SetupTask {
    Create,
    PreInstall,
    Install(InstallMethod),
    ForcedUnset {
        state: String,
        kind: String,
        mode: String,
    },
}

impl SetupTask {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::PreInstall => "preinstall",
            Self::Install(_) => "install",
            Self::ForcedUnset { .. } => "unset",
        }
    }

    fn overrides(&self) -> Option<Params> {
        match self {
            Self::Create => Some(Params::from([
                ("vm_action", "set"),
                ("skip_image_processing", "yes"),
            ])),
            Self::ForcedUnset { .. } => Some(Params::from([
                ("vm_action", "unset"),
                ("skip_image_processing", "yes"),
            ])),
            Self::Install(InstallMethod::Generic(kind)) => {
                Some(Params::from([("type", kind.as_str())]))
            }
            Self::PreInstall | Self::Install(InstallMethod::Unattended(_)) => None,
        }
    }

    fn override_str(&self, param_str: &str) -> String {
        match self {
            Self::Create => restriction_str(MANAGE_VARIANT, param_str),
            Self::PreInstall => restriction_str(PREINSTALL_VARIANT, param_str),
            Self::Install(InstallMethod::Unattended(OsFamily::RedHat)) => {
                restriction_str(REDHAT_UNATTENDED_VARIANT, param_str)
            }
            Self::Install(InstallMethod::Unattended(OsFamily::Windows)) => {
                restriction_str(WINDOWS_UNATTENDED_VARIANT, param_str)
            }
            Self::Install(InstallMethod::Generic(_)) => restriction_str(INSTALL_VARIANT, param_str),
            Self::ForcedUnset { state, kind, mode } => {
                let unset = Params::from([
                    ("unset_state", state.as_str()),
                    ("unset_type", kind.as_str()),
                    ("unset_mode", mode.as_str()),
                ]);
                restriction_str(
                    MANAGE_VARIANT,
                    &format!("{}{}", unset.to_override_str(), param_str),
                )
            }
        }
    }

    /// Resolves the task parameters from the object's own parameters.
    pub fn resolve(
        &self,
        provider: &dyn ParamProvider,
        object_params: &Params,
        param_str: &str,
    ) -> Result<Params, SchedulerError> {
        let overrides = self.overrides();
        let override_str = self.override_str(param_str);
        provider.resolve(object_params, overrides.as_ref(), Some(&override_str))
    }
}

/// Extends a parameter block with the state every created object starts in.
pub fn create_param_str(param_str: &str) -> String {
    let root_state = Params::from([("set_state", "root"), ("set_type", "offline")]);
    format!("{}{}", with_trailing_newline(param_str), root_state.to_override_str())
}

fn with_trailing_newline(block: &str) -> String {
    if block.is_empty() || block.ends_with('\n') {
        block.to_string()
    } else {
        format!("{block}\n")
    }
}

pub fn preinstall_task_name(object_name: &str) -> String {
    format!("0p{object_name}")
}

pub fn install_task_name(object_name: &str) -> String {
    format!("0q{object_name}")
}

pub fn unset_task_name(node_name: &str) -> String {
    format!("c{node_name}")
}

/// Wraps resolved task parameters into a standalone node.
pub fn task_node(
    name: impl Into<String>,
    mut params: Params,
    objects: Vec<ObjectId>,
    object_names: &[&str],
) -> TestNode {
    let name = name.into();
    params.insert("shortname", name.clone());
    params.insert("vms", object_names.join(" "));
    TestNode::new(name, params, objects)
}
