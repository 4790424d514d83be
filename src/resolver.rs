//! Address lists as produced by name resolution.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// Arbitrary string-keyed data attached to an [`Address`], intended for
/// consumption by load-balancing policies. Attributes do not participate in
/// address identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An identifier that indicates how to connect to a server, typically a
/// `host:port` string.
#[derive(Debug, Clone, Default)]
pub struct Address {
    pub address: String,
    pub attributes: Attributes,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            attributes: Attributes::default(),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// The state most recently produced by the name resolver: an ordered address
/// list, plus an optional human-readable note for inclusion in failure
/// messages.
#[derive(Debug, Clone, Default)]
pub struct ResolverUpdate {
    pub addresses: Vec<Address>,
    pub resolution_note: Option<String>,
}

impl ResolverUpdate {
    pub fn from_addresses(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            resolution_note: None,
        }
    }
}
