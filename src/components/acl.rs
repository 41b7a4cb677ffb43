//! Access control lists
//!
//! ACL containers are few and managed one call at a time; their entries can
//! number in the thousands and go through the bulk endpoint.

use reconcile::Component;
use reconcile::record::{Record, composite_identity};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A named ACL that VCL can match client addresses against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
}

impl Component for Acl {
    const KEY: &'static str = "acl";
    const COLLECTION: &'static str = "acls";
    const DESCRIPTION: &'static str = "Access control lists";
    const FIELDS: &'static [&'static str] = &["name"];
}

/// Fields that together name one entry; an address may sit in several
/// ACLs and with several prefix lengths
const ENTRY_IDENTITY: &[&str] = &["acl", "ip", "subnet"];

/// One address or subnet in an ACL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub ip: String,
    /// Name of the ACL holding this entry
    pub acl: String,
    #[serde(default)]
    pub subnet: Option<u8>,
    #[serde(default)]
    pub negated: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Component for AclEntry {
    const KEY: &'static str = "acl_entry";
    const COLLECTION: &'static str = "acl_entries";
    const DESCRIPTION: &'static str = "ACL entries, written in bulk";
    const FIELDS: &'static [&'static str] = &["ip", "acl", "subnet", "negated", "comment"];
    const IDENTITY: &'static str = "ip";
    const DEPENDS_ON: &'static [&'static str] = &["acl"];

    fn identity(record: &Record) -> reconcile::Result<String> {
        composite_identity(record, ENTRY_IDENTITY)
    }

    fn check(&self) -> Result<(), String> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| format!("`{}` is not an IP address", self.ip))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if let Some(subnet) = self.subnet
            && subnet > max
        {
            return Err(format!("subnet /{subnet} is too wide for {ip}"));
        }
        if self.acl.trim().is_empty() {
            return Err("acl cannot be empty".to_string());
        }
        Ok(())
    }
}
