use std::{collections::BTreeMap, path::Path, sync::Arc};

use color_eyre::eyre::Context;
use dashmap::DashMap;
use regex::Regex;

use crate::error::ServerError;

// An authenticated principal with an ordered list of address-pattern
// authorizations.
#[derive(Debug)]
pub(crate) struct User {
    pub(crate) name: String,
    pub(crate) secret: String,
    addrs: Vec<Regex>,
}

impl User {
    pub(crate) fn new(name: String, secret: String, addrs: Vec<Regex>) -> Self {
        User { name, secret, addrs }
    }

    // Whether `addr` (formatted `host:port`, with an `R:` prefix for
    // server-bound listeners) matches any of this user's patterns.
    pub(crate) fn has_access(&self, addr: &str) -> bool {
        self.addrs.iter().any(|pattern| pattern.is_match(addr))
    }
}

// Splits a `user:pass` credentials spec on the first colon.
pub(crate) fn parse_credentials(spec: &str) -> Result<(String, String), ServerError> {
    match spec.split_once(':') {
        Some((user, pass)) if !user.is_empty() => Ok((user.into(), pass.into())),
        _ => Err(ServerError::InvalidCredentials),
    }
}

// Read-only table of users, shared across sessions. Populated once at
// startup.
#[derive(Default)]
pub(crate) struct UserStore(DashMap<String, Arc<User>>);

impl UserStore {
    // Loads a user database file: a JSON object mapping `user:pass` to an
    // array of address regexes.
    pub(crate) fn load(path: &Path) -> color_eyre::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading user database {}", path.display()))?;
        // BTreeMap keeps file order irrelevant but deterministic.
        let entries: BTreeMap<String, Vec<String>> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing user database {}", path.display()))?;
        let store = UserStore::default();
        for (spec, patterns) in entries {
            let (name, secret) = parse_credentials(&spec)?;
            let addrs = patterns
                .iter()
                .map(|pattern| Regex::new(pattern))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid address pattern for user {name}"))?;
            store.insert(User::new(name, secret, addrs));
        }
        Ok(store)
    }

    // A single `user:pass` credential allowed to reach any address.
    pub(crate) fn single(spec: &str) -> Result<Self, ServerError> {
        let (name, secret) = parse_credentials(spec)?;
        let store = UserStore::default();
        let allow_all = Regex::new("").expect("empty pattern is valid");
        store.insert(User::new(name, secret, vec![allow_all]));
        Ok(store)
    }

    pub(crate) fn insert(&self, user: User) {
        self.0.insert(user.name.clone(), Arc::new(user));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<User>> {
        self.0.get(name).map(|user| Arc::clone(&user))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
