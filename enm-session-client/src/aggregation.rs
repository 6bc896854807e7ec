//! Safe-mode response bookkeeping
//!
//! Terminal responses are counted per `(method, normalized path)`, keeping the
//! first response seen for every failing status.

use enm_session_core::{HttpMethod, HttpResponse};
use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

fn digit_runs() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// Collapse identifiers in a URL path
///
/// The query string is dropped. A trailing all-digit segment becomes `<id>`;
/// otherwise every run of digits becomes `[NUM]`.
pub fn normalize_path(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    if let Some((head, last)) = path.rsplit_once('/') {
        if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
            return format!("{}/<id>", head);
        }
    }
    digit_runs().replace_all(&path, "[NUM]").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestKey {
    pub method: HttpMethod,
    pub path: String,
}

impl RequestKey {
    pub fn new(method: HttpMethod, url: &str) -> Self {
        Self {
            method,
            path: normalize_path(url),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseStats {
    pub success: u64,
    pub failure: u64,
    /// First response recorded for each failing status
    pub errors: BTreeMap<u16, HttpResponse>,
}

impl ResponseStats {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseTable {
    entries: BTreeMap<RequestKey, ResponseStats>,
}

/// Serialises as a map keyed by `"METHOD /path"`
impl Serialize for ResponseTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, stats) in &self.entries {
            map.serialize_entry(&key.to_string(), stats)?;
        }
        map.end()
    }
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, response: &HttpResponse) {
        let stats = self
            .entries
            .entry(RequestKey::new(response.method, &response.url))
            .or_default();
        if response.is_success() {
            stats.success += 1;
        } else {
            stats.failure += 1;
            stats
                .errors
                .entry(response.status)
                .or_insert_with(|| response.clone());
        }
    }

    pub fn get(&self, method: HttpMethod, path: &str) -> Option<&ResponseStats> {
        self.entries.get(&RequestKey {
            method,
            path: path.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RequestKey, &ResponseStats)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn failures(&self) -> u64 {
        self.entries.values().map(|stats| stats.failure).sum()
    }
}
