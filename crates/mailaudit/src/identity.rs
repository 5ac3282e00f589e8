//! Principal name resolution
//!
//! Permission grants name their grantee either by security identifier or by
//! display name. The resolver turns both into a stable principal name using an
//! injectable directory, and never fails: when the directory cannot answer,
//! the raw identifier is kept.

use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Prefix of domain-account SIDs as they appear in unresolved grants.
pub const DOMAIN_SID_PREFIX: &str = "S-1-5-21-";

static SID_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^S-1-\d+(-\d+)+$").expect("SID pattern is a valid regex")
});

/// True when a raw grantee looks like an unresolved domain SID.
pub fn looks_like_sid(value: &str) -> bool {
    value.starts_with(DOMAIN_SID_PREFIX)
}

/// True when `value` is a syntactically valid SID string.
pub fn is_well_formed_sid(value: &str) -> bool {
    SID_SHAPE.is_match(value)
}

/// A directory object as returned by the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    pub name: String,
    #[serde(default, rename = "userPrincipalName")]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

impl DirectoryObject {
    /// Principal name when present, plain name otherwise.
    pub fn principal_name(&self) -> &str {
        match self.user_principal_name.as_deref() {
            Some(upn) if !upn.trim().is_empty() => upn,
            _ => &self.name,
        }
    }
}

/// Identity directory lookups (external collaborator).
pub trait IdentityDirectory {
    fn find_by_sid(&self, sid: &str) -> Result<Option<DirectoryObject>>;
    fn find_by_display_name(&self, display_name: &str) -> Result<Option<DirectoryObject>>;
}

impl<T: IdentityDirectory + ?Sized> IdentityDirectory for &T {
    fn find_by_sid(&self, sid: &str) -> Result<Option<DirectoryObject>> {
        (**self).find_by_sid(sid)
    }

    fn find_by_display_name(&self, display_name: &str) -> Result<Option<DirectoryObject>> {
        (**self).find_by_display_name(display_name)
    }
}

/// Lookup counters for the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
}

/// Resolves identifiers through an [`IdentityDirectory`], caching per run.
pub struct IdentityResolver<I> {
    directory: I,
    cache: HashMap<(bool, String), String>,
    stats: ResolverStats,
}

impl<I: IdentityDirectory> IdentityResolver<I> {
    pub fn new(directory: I) -> Self {
        Self {
            directory,
            cache: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    /// Resolve a SID (`is_sid`) or display name to a principal name.
    ///
    /// Falls back to `identifier` unchanged on any failure.
    pub fn resolve(&mut self, identifier: &str, is_sid: bool) -> String {
        let key = (is_sid, identifier.to_string());
        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            return hit.clone();
        }

        self.stats.lookups += 1;
        let resolved = match self.lookup(identifier, is_sid) {
            Ok(Some(object)) => object.principal_name().to_string(),
            Ok(None) => {
                debug!(identifier, is_sid, "Identity not found, keeping raw value");
                self.stats.fallbacks += 1;
                identifier.to_string()
            }
            Err(err) => {
                debug!(identifier, is_sid, error = %err, "Identity lookup failed, keeping raw value");
                self.stats.fallbacks += 1;
                identifier.to_string()
            }
        };

        self.cache.insert(key, resolved.clone());
        resolved
    }

    fn lookup(&self, identifier: &str, is_sid: bool) -> Result<Option<DirectoryObject>> {
        if is_sid {
            if !is_well_formed_sid(identifier) {
                return Ok(None);
            }
            self.directory.find_by_sid(identifier)
        } else {
            self.directory.find_by_display_name(identifier)
        }
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }
}
