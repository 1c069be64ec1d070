//! Command-line restriction parsing.
//!
//! Tokens of the form `key=value` split into a tests restriction block,
//! per-object restriction blocks and a block of plain parameter overrides.

use crate::{LayeredParamProvider, NO_KEY, ONLY_KEY, ParamProvider, Params, SchedulerError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Restrictions that replace the configured default selection.
pub const PRIMARY_RESTRICTIONS: [&str; 6] = ["all", "normal", "gui", "nongui", "minimal", "none"];
pub const DEFAULT_PRIMARY_RESTRICTION: &str = "all";

static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=(.*)").expect("token pattern is valid"));

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Restrictions {
    /// `only`/`no` lines followed by the parameter block and the default.
    pub tests_str: String,
    /// Restriction block per available object, each ending in the parameter
    /// block and (when unrestricted) the object's default variant.
    pub vm_strs: BTreeMap<String, String>,
    /// Plain `key = value` overrides.
    pub param_str: String,
    pub selected_vms: Vec<String>,
    /// More than one tests restriction was given.
    pub nontrivial: bool,
}

impl Restrictions {
    pub fn from_cmd<S: AsRef<str>>(
        tokens: &[S],
        available_vms: &[String],
        defaults: &Params,
    ) -> Result<Self, SchedulerError> {
        let mut use_tests_default = true;
        let mut use_vm_default: BTreeMap<&str, bool> = available_vms
            .iter()
            .map(|vm| (vm.as_str(), true))
            .collect();
        let mut restrictions = Restrictions {
            selected_vms: available_vms.to_vec(),
            ..Restrictions::default()
        };

        for token in tokens {
            let token = token.as_ref();
            let Some(captures) = TOKEN_REGEX.captures(token) else {
                debug!("Ignoring command token without assignment: {}", token);
                continue;
            };
            let key = &captures[1];
            let value = &captures[2];

            if key == ONLY_KEY || key == NO_KEY {
                if PRIMARY_RESTRICTIONS.contains(&value) {
                    use_tests_default = false;
                }
                if !restrictions.tests_str.is_empty() {
                    restrictions.nontrivial = true;
                }
                restrictions.tests_str.push_str(&format!("{key} {value}\n"));
            } else if let Some((keyword, vm)) = split_object_restriction(key) {
                let Some(use_default) = use_vm_default.get_mut(vm) else {
                    warn!("Ignoring restriction {} for unknown object {}", key, vm);
                    continue;
                };
                *use_default = false;
                restrictions
                    .vm_strs
                    .entry(vm.to_string())
                    .or_default()
                    .push_str(&format!("{keyword} {value}\n"));
            } else if key == "vms" {
                let selected: Vec<String> = value.split(',').map(str::to_string).collect();
                if let Some(unknown) = selected.iter().find(|vm| !available_vms.contains(vm)) {
                    return Err(SchedulerError::validation(format!(
                        "the vm '{}' is not among the supported vms: {}",
                        unknown,
                        available_vms.join(", ")
                    )));
                }
                restrictions.selected_vms = selected;
            } else {
                // a comma on the command line is a space in a parameter value
                restrictions
                    .param_str
                    .push_str(&format!("{} = {}\n", key, value.replace(',', " ")));
            }
        }
        debug!("Parsed param string '{}'", restrictions.param_str);

        let defaults = LayeredParamProvider.resolve(defaults, None, Some(&restrictions.param_str))?;

        restrictions.tests_str.push_str(&restrictions.param_str);
        if use_tests_default {
            let default = defaults.get_or("default_only", DEFAULT_PRIMARY_RESTRICTION);
            if !PRIMARY_RESTRICTIONS.contains(&default) {
                return Err(SchedulerError::validation(format!(
                    "invalid primary restriction 'only={}', it has to be one of {}",
                    default,
                    PRIMARY_RESTRICTIONS.join(", ")
                )));
            }
            restrictions.tests_str.push_str(&format!("{ONLY_KEY} {default}\n"));
        }
        debug!("Parsed tests string '{}'", restrictions.tests_str);

        for vm in available_vms {
            let vm_str = restrictions.vm_strs.entry(vm.clone()).or_default();
            vm_str.push_str(&restrictions.param_str);
            if use_vm_default.get(vm.as_str()).copied().unwrap_or(true) {
                let Some(default) = defaults.get(&format!("default_only_{vm}")) else {
                    return Err(SchedulerError::validation(format!(
                        "no default variant restriction found for {vm}"
                    )));
                };
                vm_str.push_str(&format!("{ONLY_KEY} {default}\n"));
            }
        }
        debug!("Parsed vm strings '{:?}'", restrictions.vm_strs);

        Ok(restrictions)
    }

    /// Whether a dotted variant name survives the non-primary tests
    /// restrictions.
    pub fn selects(&self, name: &str) -> bool {
        for line in self.tests_str.lines() {
            let Some((keyword, value)) = line.split_once(' ') else {
                continue;
            };
            let value = value.trim();
            if PRIMARY_RESTRICTIONS.contains(&value) {
                continue;
            }
            let matched = variant_matches(value, name);
            match keyword {
                ONLY_KEY if !matched => return false,
                NO_KEY if matched => return false,
                _ => {}
            }
        }
        true
    }

    /// Rejects restricting to internal or original tests from the command line.
    pub fn ensure_no_internal_selection<'a, I>(&self, names: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !self.nontrivial {
            return Ok(());
        }
        for name in names {
            if !self.selects(name) {
                continue;
            }
            if name.contains(".internal.") || name.contains(".original.") {
                return Err(SchedulerError::validation(format!(
                    "you cannot restrict to internal tests from the command line, \
                     use the manual steps or automated setup policies to run {name}"
                )));
            }
        }
        Ok(())
    }
}

fn split_object_restriction(key: &str) -> Option<(&'static str, &str)> {
    if let Some(vm) = key.strip_prefix("only_") {
        return Some((ONLY_KEY, vm));
    }
    key.strip_prefix("no_").map(|vm| (NO_KEY, vm))
}

/// Whether the dotted `variant` appears as whole consecutive segments of
/// `name`.
fn variant_matches(variant: &str, name: &str) -> bool {
    let wanted: Vec<&str> = variant.split('.').collect();
    let segments: Vec<&str> = name.split('.').collect();
    segments
        .windows(wanted.len())
        .any(|window| window == wanted.as_slice())
}
