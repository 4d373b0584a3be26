//! Identity Registry.
//!
//! Resolves an opaque [`Principal`] to a role, display name and organisation. The registry is
//! a pure lookup over an injected [`IdentityDirectory`]; it has no state transitions of its own.
//!
//! Lookups are memoised in an [`IdentityCache`] owned by the registry. The cache is bounded
//! (capacity) and time-limited (TTL), and can be flushed or disabled, so tests never depend on
//! what an earlier test happened to resolve.
//!
//! The session layer in front of this crate authenticates callers; the core receives them as
//! an [`Actor`] and trusts the supplied principal and role.

use crate::error::{ConsentError, ConsentResult};
use consent_types::{NonEmptyText, Principal, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An authenticated caller as supplied by the session layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub principal: Principal,
    pub role: Role,
}

impl Actor {
    pub fn new(principal: Principal, role: Role) -> Self {
        Self { principal, role }
    }

    pub fn patient(principal: Principal) -> Self {
        Self::new(principal, Role::Patient)
    }

    pub fn doctor(principal: Principal) -> Self {
        Self::new(principal, Role::Doctor)
    }

    pub(crate) fn require_role(&self, role: Role, action: &'static str) -> ConsentResult<()> {
        if self.role != role {
            return Err(ConsentError::unauthorized(&self.principal, action));
        }
        Ok(())
    }

    /// The actor must be `principal` acting in `role`.
    pub(crate) fn require(
        &self,
        principal: &Principal,
        role: Role,
        action: &'static str,
    ) -> ConsentResult<()> {
        if self.role != role || &self.principal != principal {
            return Err(ConsentError::unauthorized(&self.principal, action));
        }
        Ok(())
    }
}

/// Directory entry for one principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: Principal,
    pub role: Role,
    pub display_name: NonEmptyText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<NonEmptyText>,
}

/// Source of identity data (a user table, an on-chain registry, a YAML file).
pub trait IdentityDirectory: Send + Sync {
    fn lookup(&self, principal: &Principal) -> ConsentResult<Option<Identity>>;

    fn list(&self) -> ConsentResult<Vec<Identity>>;
}

/// Fixed directory loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    entries: HashMap<Principal, Identity>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectoryFileWire {
    identities: Vec<Identity>,
}

impl StaticDirectory {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            entries: identities
                .into_iter()
                .map(|i| (i.principal.clone(), i))
                .collect(),
        }
    }

    /// Parse a directory from YAML text.
    ///
    /// Expected shape:
    ///
    /// ```yaml
    /// identities:
    ///   - principal: "0xabc"
    ///     role: patient
    ///     display_name: "Ada Patient"
    ///   - principal: "0xdef"
    ///     role: doctor
    ///     display_name: "Dr Grace"
    ///     organization: "St Mary's"
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::IdentityDirectory`] with the path of the offending field
    /// (for example `identities[2].role`) when the YAML does not match the schema.
    pub fn from_yaml_str(yaml_text: &str) -> ConsentResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let wire = match serde_path_to_error::deserialize::<_, DirectoryFileWire>(deserializer) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(ConsentError::IdentityDirectory(format!(
                    "at {path}: {source}"
                )));
            }
        };
        Ok(Self::new(wire.identities))
    }

    pub fn load(path: &Path) -> ConsentResult<Self> {
        let text = std::fs::read_to_string(path).map_err(ConsentError::FileRead)?;
        Self::from_yaml_str(&text)
    }
}

impl IdentityDirectory for StaticDirectory {
    fn lookup(&self, principal: &Principal) -> ConsentResult<Option<Identity>> {
        Ok(self.entries.get(principal).cloned())
    }

    fn list(&self) -> ConsentResult<Vec<Identity>> {
        let mut all: Vec<Identity> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.principal.cmp(&b.principal));
        Ok(all)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: Identity,
    inserted_at: Instant,
}

/// Bounded, time-limited memo of directory hits.
///
/// Misses are not cached, so a principal registered after a failed lookup becomes visible on
/// the next call.
#[derive(Debug)]
pub struct IdentityCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<Principal, CacheEntry>>,
}

impl IdentityCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.ttl.is_zero()
    }

    pub fn get(&self, principal: &Principal) -> ConsentResult<Option<Identity>> {
        self.get_at(principal, Instant::now())
    }

    pub fn insert(&self, identity: Identity) -> ConsentResult<()> {
        self.insert_at(identity, Instant::now())
    }

    pub fn flush(&self) -> ConsentResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> ConsentResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> ConsentResult<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn get_at(&self, principal: &Principal, now: Instant) -> ConsentResult<Option<Identity>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let mut entries = self.lock()?;
        match entries.get(principal) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                Ok(Some(entry.identity.clone()))
            }
            Some(_) => {
                entries.remove(principal);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn insert_at(&self, identity: Identity, now: Instant) -> ConsentResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut entries = self.lock()?;
        if entries.len() >= self.capacity && !entries.contains_key(&identity.principal) {
            let ttl = self.ttl;
            entries.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        }
        if entries.len() >= self.capacity && !entries.contains_key(&identity.principal) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(p, _)| p.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            identity.principal.clone(),
            CacheEntry {
                identity,
                inserted_at: now,
            },
        );
        Ok(())
    }

    fn lock(&self) -> ConsentResult<std::sync::MutexGuard<'_, HashMap<Principal, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| ConsentError::LockPoisoned("identity cache"))
    }
}

/// Principal → identity resolution with memoisation.
pub struct IdentityRegistry {
    directory: Arc<dyn IdentityDirectory>,
    cache: IdentityCache,
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl IdentityRegistry {
    pub fn new(directory: Arc<dyn IdentityDirectory>, cache: IdentityCache) -> Self {
        Self { directory, cache }
    }

    pub fn resolve(&self, principal: &Principal) -> ConsentResult<Option<Identity>> {
        if let Some(hit) = self.cache.get(principal)? {
            return Ok(Some(hit));
        }
        let found = self.directory.lookup(principal)?;
        if let Some(identity) = &found {
            self.cache.insert(identity.clone())?;
        }
        Ok(found)
    }

    /// Resolve or fail with [`ConsentError::UnknownPrincipal`].
    pub fn require(&self, principal: &Principal) -> ConsentResult<Identity> {
        self.resolve(principal)?
            .ok_or_else(|| ConsentError::UnknownPrincipal(principal.clone()))
    }

    /// Fails with [`ConsentError::Validation`] when the directory knows `principal` under a
    /// different role. Unknown principals pass; the session layer is trusted for those.
    pub fn check_role(&self, principal: &Principal, role: Role) -> ConsentResult<()> {
        match self.resolve(principal)? {
            Some(identity) if identity.role != role => Err(ConsentError::Validation(format!(
                "{principal} is registered as {}, not {role}",
                identity.role
            ))),
            _ => Ok(()),
        }
    }

    /// Display name, falling back to the raw identifier.
    pub fn display_name(&self, principal: &Principal) -> ConsentResult<String> {
        Ok(self
            .resolve(principal)?
            .map(|i| i.display_name.to_string())
            .unwrap_or_else(|| principal.to_string()))
    }

    pub fn organization(&self, principal: &Principal) -> ConsentResult<Option<NonEmptyText>> {
        Ok(self.resolve(principal)?.and_then(|i| i.organization))
    }

    pub fn list(&self) -> ConsentResult<Vec<Identity>> {
        self.directory.list()
    }

    pub fn flush_cache(&self) -> ConsentResult<()> {
        self.cache.flush()
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }
}
