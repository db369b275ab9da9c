//! Address normalisation for relayed messages.
//!
//! Header values arrive in whatever shape the submitting client produced:
//! bare addresses, `Name <addr>` forms, or `,`/`;` separated lists of either.
//! [`AddressList`] flattens all of these into canonical [`AddressEntry`]
//! records, silently dropping fragments that do not look like addresses and
//! ignoring repeats (compared case-insensitively).

use std::{
    fmt::{self, Display},
    ops::Deref,
};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Maximum length of the local part of an address.
const MAX_LOCAL_PART: usize = 64;

/// Maximum length of the domain of an address.
const MAX_DOMAIN: usize = 255;

/// A single normalised address with an optional display name.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AddressEntry {
    #[must_use]
    pub fn new(address: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            display_name,
        }
    }

    /// Returns `true` if `address` refers to this entry, ignoring case.
    #[must_use]
    pub fn matches(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl PartialEq for AddressEntry {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.address)
    }
}

impl Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Everything [`AddressList::add`] knows how to consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressInput {
    /// A single formatted address, `Name <addr>` or a bare `addr`.
    ///
    /// A value that turns out to contain `,` or `;` is treated as
    /// [`AddressInput::Delimited`].
    Single(String),
    /// A `,` or `;` separated list of formatted addresses.
    Delimited(String),
    /// An already structured entry. Unlike strings, an invalid record is an error.
    Record(AddressEntry),
    /// Any mix of the above, added in order.
    Sequence(Vec<AddressInput>),
}

impl From<&str> for AddressInput {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for AddressInput {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<&String> for AddressInput {
    fn from(value: &String) -> Self {
        Self::Single(value.clone())
    }
}

impl From<AddressEntry> for AddressInput {
    fn from(value: AddressEntry) -> Self {
        Self::Record(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for AddressInput {
    fn from(value: Vec<T>) -> Self {
        Self::Sequence(value.into_iter().map(Into::into).collect())
    }
}

/// An ordered, case-insensitively unique list of addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AddressList(Vec<AddressEntry>);

impl AddressList {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a list seeded from `input`.
    ///
    /// # Errors
    ///
    /// See [`AddressList::add`].
    pub fn from_input(input: impl Into<AddressInput>) -> Result<Self, AddressError> {
        let mut list = Self::new();
        list.add(input)?;
        Ok(list)
    }

    /// Add one or more addresses to the list.
    ///
    /// Malformed strings are dropped without complaint so that sloppy headers
    /// can still be salvaged; addresses already present are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidAddressInput`] if a structured record
    /// carries an address that does not validate. Entries added before the
    /// failing record are kept.
    pub fn add(&mut self, input: impl Into<AddressInput>) -> Result<(), AddressError> {
        match input.into() {
            AddressInput::Single(value) if is_delimited(&value) => self.add_delimited(&value),
            AddressInput::Delimited(value) => self.add_delimited(&value),
            AddressInput::Single(value) => self.add_formatted(&value),
            AddressInput::Record(entry) => {
                if !is_valid_address(&entry.address) {
                    return Err(AddressError::InvalidAddressInput(entry.address));
                }
                self.push(entry);
            }
            AddressInput::Sequence(items) => {
                for item in items {
                    self.add(item)?;
                }
            }
        }

        Ok(())
    }

    /// The address of the earliest surviving entry.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::EmptyAddressList`] if the list has no entries.
    pub fn first_address(&self) -> Result<&str, AddressError> {
        self.0
            .first()
            .map(|entry| entry.address.as_str())
            .ok_or(AddressError::EmptyAddressList)
    }

    /// Returns `true` if `address` is already present, ignoring case.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|entry| entry.matches(address))
    }

    /// Iterate over the bare addresses in insertion order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|entry| entry.address.as_str())
    }

    fn add_delimited(&mut self, value: &str) {
        value
            .split([',', ';'])
            .for_each(|piece| self.add_formatted(piece));
    }

    fn add_formatted(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }

        let entry = if value.contains('<') && value.contains('>') {
            parse_named(value)
        } else if is_valid_address(value) {
            Some(AddressEntry::new(value, None))
        } else {
            None
        };

        if let Some(entry) = entry {
            self.push(entry);
        }
    }

    fn push(&mut self, entry: AddressEntry) {
        if !self.contains(&entry.address) {
            self.0.push(entry);
        }
    }
}

impl Deref for AddressList {
    type Target = [AddressEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a AddressEntry;
    type IntoIter = std::slice::Iter<'a, AddressEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for AddressList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            Display::fmt(entry, f)?;
        }
        Ok(())
    }
}

fn is_delimited(value: &str) -> bool {
    value.contains([',', ';'])
}

/// Parse a `Name <addr>` value, keeping the first mailbox found.
fn parse_named(value: &str) -> Option<AddressEntry> {
    let parsed = mailparse::addrparse(value).ok()?;
    let info = parsed.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.clone()),
        MailAddr::Group(group) => group.addrs.first().cloned(),
    })?;

    let address = info.addr.trim();
    if !is_valid_address(address) {
        return None;
    }

    let display_name = info
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    Some(AddressEntry::new(address, display_name))
}

/// Check that `address` is shaped like `local@label.tld`.
///
/// The local part is deliberately permissive (any printable ASCII except `@`);
/// the domain must pass [`is_valid_domain`].
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };

    !local.is_empty()
        && local.len() <= MAX_LOCAL_PART
        && local.chars().all(|c| c.is_ascii_graphic() && c != '@')
        && is_valid_domain(domain)
}

/// Check that `domain` has at least one dot and only alphanumeric/hyphen labels.
#[must_use]
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= MAX_DOMAIN
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
