//! Filter model: a named source of host names with active/whitelist flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use url::Url;

/// Stable identifier of a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterId(pub String);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a filter's hosts come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSource {
    /// A single literal host entered by the user.
    Single { host: String },
    /// A remote host list (fetched by an external collaborator).
    Link { url: Url },
    /// A local host-list file.
    File { path: PathBuf },
    /// An installed application (used for per-app allow rules).
    App { package: String },
}

impl fmt::Display for FilterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single { host } => write!(f, "host:{host}"),
            Self::Link { url } => write!(f, "link:{url}"),
            Self::File { path } => write!(f, "file:{}", path.display()),
            Self::App { package } => write!(f, "app:{package}"),
        }
    }
}

/// A block- or allow-list selected by the user.
///
/// Two filters are equal, and hash identically, when they point at the same
/// source - the active flag, resolved hosts, and metadata never participate.
/// The UI relies on this to deduplicate filters that differ only in
/// presentation.
#[derive(Debug, Clone)]
pub struct Filter {
    pub id: FilterId,
    pub source: FilterSource,
    pub active: bool,
    pub whitelist: bool,
    /// Resolved host list; empty until the compiler fills it.
    pub hosts: Vec<String>,
    /// Optional localized display name.
    pub title: Option<String>,
    /// Optional attribution for the list's upstream maintainer.
    pub credit: Option<String>,
}

impl Filter {
    pub fn new(id: impl Into<String>, source: FilterSource) -> Self {
        Self {
            id: FilterId(id.into()),
            source,
            active: false,
            whitelist: false,
            hosts: Vec::new(),
            title: None,
            credit: None,
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn whitelist(mut self, whitelist: bool) -> Self {
        self.whitelist = whitelist;
        self
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// Hosts-file names that are never block entries.
const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "broadcasthost",
    "local",
    "ip6-localhost",
    "ip6-loopback",
];

/// Parse raw host-list text into host names.
///
/// Accepts both hosts-file form (`0.0.0.0 ads.example.com`) and bare-host
/// lines; `#` starts a comment; loopback/localhost entries are skipped.
pub fn parse_hosts(text: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let first = match tokens.next() {
            Some(t) => t,
            None => continue,
        };

        // Hosts-file form puts a sink address first.
        let candidate = if first.parse::<std::net::IpAddr>().is_ok() {
            match tokens.next() {
                Some(t) => t,
                None => continue,
            }
        } else {
            first
        };

        let host = candidate.to_lowercase();
        if LOCAL_NAMES.contains(&host.as_str()) || !host.contains('.') {
            continue;
        }
        hosts.push(host);
    }
    hosts
}
