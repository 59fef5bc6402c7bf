// SPDX-License-Identifier: MIT OR Apache-2.0
//! The classification catalog: the static, build-time table of every method
//! the sandbox may expose through the mediating proxy.
//!
//! Names absent from [`CATALOG`] are invisible through the proxy — they
//! cannot be discovered or invoked from a script, regardless of capability
//! set. Pure helper functions (pagination, date-diff, array chunking) are
//! never catalog entries; they live alongside the proxy but are not
//! mediated.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// The kind of side effect a catalogued method has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Never mutates state.
    Read,
    /// Mutates configuration (create/update/delete policy, script, group, profile).
    Write,
    /// Causes an effect on a managed device.
    Command,
}

impl Classification {
    /// Stable lowercase string form, matching the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Command => "command",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the classification catalog.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    /// Method name as invoked through the proxy, e.g. `"listComputers"`.
    pub name: &'static str,
    /// Read / write / command classification.
    pub classification: Classification,
    /// Capability token required to invoke this method, e.g. `"read:computers"`.
    pub required_capability: &'static str,
    /// Whether the method requires a valid approval token in apply mode.
    pub needs_approval: bool,
    /// Entity category, e.g. `"computers"`, `"policies"`.
    pub category: &'static str,
    /// Cache key prefixes invalidated on a successful call to this method.
    ///
    /// Empty for read methods; populated for writes/commands that mutate
    /// state the adapter cache might otherwise serve stale.
    pub invalidates: &'static [&'static str],
}

macro_rules! entry {
    ($name:expr, $classification:expr, $capability:expr, $needs_approval:expr, $category:expr) => {
        entry!($name, $classification, $capability, $needs_approval, $category, &[])
    };
    ($name:expr, $classification:expr, $capability:expr, $needs_approval:expr, $category:expr, $invalidates:expr) => {
        CatalogEntry {
            name: $name,
            classification: $classification,
            required_capability: $capability,
            needs_approval: $needs_approval,
            category: $category,
            invalidates: $invalidates,
        }
    };
}

use Classification::{Command, Read, Write};

/// The representative classification catalog.
///
/// Spans computers, policies, scripts, mobile devices, and groups across all
/// three classifications. A full device-management surface would extend
/// this table; the proxy and policy engine make no assumption about its
/// size.
pub static CATALOG: &[CatalogEntry] = &[
    // -- computers ---------------------------------------------------------
    entry!("listComputers", Read, "read:computers", false, "computers"),
    entry!("getComputerDetails", Read, "read:computers", false, "computers"),
    entry!("searchComputers", Read, "read:computers", false, "computers"),
    entry!(
        "updateComputer",
        Write,
        "write:computers",
        false,
        "computers",
        &["listComputers:", "getComputerDetails:", "searchComputers:"]
    ),
    entry!(
        "deleteComputer",
        Write,
        "write:computers",
        true,
        "computers",
        &["listComputers:", "getComputerDetails:", "searchComputers:"]
    ),
    entry!("lockComputer", Command, "command:computers", true, "computers"),
    entry!("eraseComputer", Command, "command:computers", true, "computers"),
    entry!(
        "sendComputerCommand",
        Command,
        "command:computers",
        true,
        "computers"
    ),
    // -- policies ------------------------------------------------------------
    entry!("listPolicies", Read, "read:policies", false, "policies"),
    entry!("getPolicyDetails", Read, "read:policies", false, "policies"),
    entry!("searchPolicies", Read, "read:policies", false, "policies"),
    entry!(
        "createPolicy",
        Write,
        "write:policies",
        false,
        "policies",
        &["listPolicies:", "searchPolicies:"]
    ),
    entry!(
        "updatePolicy",
        Write,
        "write:policies",
        false,
        "policies",
        &["listPolicies:", "getPolicyDetails:", "searchPolicies:"]
    ),
    entry!(
        "deletePolicy",
        Write,
        "write:policies",
        true,
        "policies",
        &["listPolicies:", "getPolicyDetails:", "searchPolicies:"]
    ),
    entry!("executePolicy", Command, "command:policies", true, "policies"),
    entry!("flushPolicyLogs", Command, "command:policies", true, "policies"),
    // -- scripts ---------------------------------------------------------
    entry!("listScripts", Read, "read:scripts", false, "scripts"),
    entry!("getScriptDetails", Read, "read:scripts", false, "scripts"),
    entry!(
        "createScript",
        Write,
        "write:scripts",
        false,
        "scripts",
        &["listScripts:"]
    ),
    entry!(
        "updateScript",
        Write,
        "write:scripts",
        false,
        "scripts",
        &["listScripts:", "getScriptDetails:"]
    ),
    entry!(
        "deleteScript",
        Write,
        "write:scripts",
        true,
        "scripts",
        &["listScripts:", "getScriptDetails:"]
    ),
    entry!("deployScript", Command, "command:scripts", true, "scripts"),
    // -- mobile devices ----------------------------------------------------
    entry!(
        "listMobileDevices",
        Read,
        "read:mobile-devices",
        false,
        "mobile-devices"
    ),
    entry!(
        "getMobileDeviceDetails",
        Read,
        "read:mobile-devices",
        false,
        "mobile-devices"
    ),
    entry!(
        "updateMobileDevice",
        Write,
        "write:mobile-devices",
        false,
        "mobile-devices",
        &["listMobileDevices:", "getMobileDeviceDetails:"]
    ),
    entry!(
        "lockMobileDevice",
        Command,
        "command:mobile-devices",
        true,
        "mobile-devices"
    ),
    entry!(
        "wipeMobileDevice",
        Command,
        "command:mobile-devices",
        true,
        "mobile-devices"
    ),
    entry!(
        "sendMobileDeviceCommand",
        Command,
        "command:mobile-devices",
        true,
        "mobile-devices"
    ),
    // -- groups --------------------------------------------------------------
    entry!("listComputerGroups", Read, "read:groups", false, "groups"),
    entry!("getComputerGroupDetails", Read, "read:groups", false, "groups"),
    entry!(
        "createComputerGroup",
        Write,
        "write:groups",
        false,
        "groups",
        &["listComputerGroups:"]
    ),
    entry!(
        "updateComputerGroup",
        Write,
        "write:groups",
        false,
        "groups",
        &["listComputerGroups:", "getComputerGroupDetails:"]
    ),
    entry!(
        "deleteComputerGroup",
        Write,
        "write:groups",
        true,
        "groups",
        &["listComputerGroups:", "getComputerGroupDetails:"]
    ),
];

/// Look up a catalog entry by method name. Constant-time via linear scan
/// over a small static table (the catalog is expected to stay in the low
/// hundreds of entries even for a full device-management surface).
#[must_use]
pub fn lookup(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.name == name)
}

/// Returns `true` if `name` is present in the catalog.
#[must_use]
pub fn contains(name: &str) -> bool {
    lookup(name).is_some()
}

/// All catalog entries with the given classification.
pub fn by_classification(classification: Classification) -> impl Iterator<Item = &'static CatalogEntry> {
    CATALOG.iter().filter(move |e| e.classification == classification)
}

/// Checks whether `capabilities` grants `required`.
///
/// A capability set grants a requirement if it contains the requirement
/// verbatim, or contains the wildcard `<verb>:*` for the requirement's verb.
#[must_use]
pub fn capability_grants(capabilities: &[String], required: &str) -> bool {
    if capabilities.iter().any(|c| c == required) {
        return true;
    }
    if let Some((verb, _category)) = required.split_once(':') {
        let wildcard = format!("{verb}:*");
        if capabilities.iter().any(|c| c == &wildcard) {
            return true;
        }
    }
    false
}
