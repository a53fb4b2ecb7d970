//! Route ownership: which plugin, if any, answers a `(method, path)`.
//!
//! Routes are grouped by namespace, the first few segments of the literal
//! part of their pattern, and namespaces are spread over independently
//! locked shards. Loading or unloading a plugin only write-locks the shards
//! holding its namespaces, so lookups for other plugins keep flowing.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Arc, PoisonError, RwLock},
};

use http::Method;
use marquee_plugin_sdk::RouteDescriptor;
use serde::Serialize;

const SHARDS: usize = 16;
const NAMESPACE_DEPTH: usize = 3;

/// Owner of a matched route, captured at lookup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub plugin: String,
    pub route: RouteDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteConflict {
    pub route: RouteDescriptor,
    /// Plugin that already owns the `(method, path)`.
    pub owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterReport {
    pub registered: Vec<RouteDescriptor>,
    pub conflicts: Vec<RouteConflict>,
    /// Routes whose method or path could not be understood.
    pub rejected: Vec<RouteDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    /// Literal prefix of a `/*` pattern, without the trailing slash.
    Prefix(String),
}

impl Pattern {
    fn parse(path: &str) -> Option<Self> {
        if !path.starts_with('/') {
            return None;
        }
        match path.strip_suffix("/*") {
            Some(prefix) if prefix.contains('*') => None,
            Some(prefix) => Some(Pattern::Prefix(prefix.to_string())),
            None if path.contains('*') => None,
            None => Some(Pattern::Exact(path.to_string())),
        }
    }

    fn literal(&self) -> &str {
        match self {
            Pattern::Exact(path) | Pattern::Prefix(path) => path,
        }
    }
}

#[derive(Debug)]
struct Entry {
    plugin: String,
    method: Method,
    route: RouteDescriptor,
}

#[derive(Debug, Default)]
struct Namespace {
    exact: HashMap<(Method, String), Arc<Entry>>,
    prefixes: Vec<(String, Arc<Entry>)>,
}

impl Namespace {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    fn owner(&self, method: &Method, pattern: &Pattern) -> Option<&Arc<Entry>> {
        match pattern {
            Pattern::Exact(path) => self.exact.get(&(method.clone(), path.clone())),
            Pattern::Prefix(prefix) => self
                .prefixes
                .iter()
                .find(|(p, entry)| p == prefix && entry.method == *method)
                .map(|(_, entry)| entry),
        }
    }

    fn longest_prefix(&self, method: &Method, path: &str) -> Option<&Arc<Entry>> {
        self.prefixes
            .iter()
            .filter(|(prefix, entry)| entry.method == *method && prefix_matches(prefix, path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, entry)| entry)
    }
}

type Shard = RwLock<HashMap<String, Namespace>>;

/// Registry shared by the plugin manager (writer) and the dispatcher (reader).
#[derive(Debug)]
pub struct RouteRegistry {
    shards: Vec<Shard>,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// Claims `routes` for `plugin`. First registration wins; a claim on an
    /// owned `(method, path)` is reported as a conflict and skipped while the
    /// plugin's other routes still register.
    pub fn register(&self, plugin: &str, routes: &[RouteDescriptor]) -> RegisterReport {
        let mut report = RegisterReport::default();
        for route in routes {
            let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes()).ok();
            let pattern = Pattern::parse(&route.path);
            let (Some(method), Some(pattern)) = (method, pattern) else {
                report.rejected.push(route.clone());
                continue;
            };

            let ns = namespace(pattern.literal(), NAMESPACE_DEPTH);
            let mut shard = self.shard(&ns).write().unwrap_or_else(PoisonError::into_inner);
            let space = shard.entry(ns).or_default();
            if let Some(existing) = space.owner(&method, &pattern) {
                report.conflicts.push(RouteConflict {
                    route: route.clone(),
                    owner: existing.plugin.clone(),
                });
                continue;
            }
            let entry = Arc::new(Entry {
                plugin: plugin.to_string(),
                method: method.clone(),
                route: route.clone(),
            });
            match pattern {
                Pattern::Exact(path) => {
                    space.exact.insert((method, path), entry);
                }
                Pattern::Prefix(prefix) => space.prefixes.push((prefix, entry)),
            }
            report.registered.push(route.clone());
        }
        report
    }

    /// Drops every route owned by `plugin`, returning how many were removed.
    pub fn remove_plugin(&self, plugin: &str) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            for space in shard.values_mut() {
                let before = space.exact.len() + space.prefixes.len();
                space.exact.retain(|_, entry| entry.plugin != plugin);
                space.prefixes.retain(|(_, entry)| entry.plugin != plugin);
                removed += before - (space.exact.len() + space.prefixes.len());
            }
            shard.retain(|_, space| !space.is_empty());
        }
        removed
    }

    /// Finds the owner of a request. Exact patterns beat `/*` patterns, and
    /// among `/*` patterns the longest prefix wins.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let depth = segments(path).count().min(NAMESPACE_DEPTH);
        let ns = namespace(path, depth);
        {
            let shard = self.shard(&ns).read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = shard
                .get(&ns)
                .and_then(|space| space.exact.get(&(method.clone(), path.to_string())))
            {
                return Some(entry.to_match());
            }
        }
        // A prefix living in a deeper namespace is always longer than one in
        // a shallower namespace, so the first hit from the deepest level wins.
        for level in (0..=depth).rev() {
            let ns = namespace(path, level);
            let shard = self.shard(&ns).read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = shard
                .get(&ns)
                .and_then(|space| space.longest_prefix(method, path))
            {
                return Some(entry.to_match());
            }
        }
        None
    }

    pub fn routes_of(&self, plugin: &str) -> Vec<RouteDescriptor> {
        let mut routes = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            for space in shard.values() {
                let exact = space.exact.values();
                let prefixes = space.prefixes.iter().map(|(_, entry)| entry);
                routes.extend(
                    exact
                        .chain(prefixes)
                        .filter(|entry| entry.plugin == plugin)
                        .map(|entry| entry.route.clone()),
                );
            }
        }
        routes.sort_by(|a, b| (&a.path, &a.method).cmp(&(&b.path, &b.method)));
        routes
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
                shard
                    .values()
                    .map(|space| space.exact.len() + space.prefixes.len())
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, ns: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        ns.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

impl Entry {
    fn to_match(&self) -> RouteMatch {
        RouteMatch {
            plugin: self.plugin.clone(),
            route: self.route.clone(),
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

fn namespace(path: &str, depth: usize) -> String {
    segments(path).take(depth).fold(String::new(), |mut ns, segment| {
        ns.push('/');
        ns.push_str(segment);
        ns
    })
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
