//! Service registry for discovery between containers
//!
//! Entries are bucketed by a 32-bit hash of their name and confirmed by exact
//! string comparison. Names, namespaces and labels are held as
//! `Cow<'static, str>`: static strings are borrowed, everything else is owned
//! by the registry.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use parking_lot::RwLock;
use crate::{Error, Result};

/// Type-erased service implementation
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

pub const DEFAULT_NAMESPACE: &str = "default";

type Text = Cow<'static, str>;

/// FNV-1a hash of a service name
pub fn name_hash(name: &str) -> u32 {
    name.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// Registration request: name plus optional namespace and labels
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    name: Text,
    namespace: Option<Text>,
    labels: Vec<(Text, Text)>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<Text>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            labels: Vec::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<Text>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn label(mut self, key: impl Into<Text>, value: impl Into<Text>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// One criterion of a selector query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Namespace(Text),
    /// Label key, optionally with the value it must carry
    Label { key: Text, value: Option<Text> },
}

impl Selector {
    pub fn namespace(namespace: impl Into<Text>) -> Self {
        Selector::Namespace(namespace.into())
    }

    pub fn label(key: impl Into<Text>, value: impl Into<Text>) -> Self {
        Selector::Label {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn has_label(key: impl Into<Text>) -> Self {
        Selector::Label {
            key: key.into(),
            value: None,
        }
    }
}

struct ServiceEntry<S> {
    name: Text,
    namespace: Text,
    labels: Vec<(Text, Text)>,
    service: S,
    registered_at: Instant,
    seq: u64,
}

impl<S> ServiceEntry<S> {
    fn matches(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Namespace(ns) => self.namespace == *ns,
            Selector::Label { key, value } => self
                .labels
                .iter()
                .any(|(k, v)| k == key && value.as_ref().map_or(true, |value| v == value)),
        }
    }

    fn score(&self, selectors: &[Selector]) -> usize {
        selectors.iter().filter(|s| self.matches(s)).count()
    }
}

/// Public view of a registered service
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub labels: Vec<(String, String)>,
    pub registered_at: Instant,
}

struct Buckets<S> {
    buckets: HashMap<u32, Vec<ServiceEntry<S>>>,
    count: usize,
    next_seq: u64,
}

impl<S> Default for Buckets<S> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            count: 0,
            next_seq: 0,
        }
    }
}

impl<S> Buckets<S> {
    fn find(&self, name: &str) -> Option<&ServiceEntry<S>> {
        if self.count == 0 {
            return None;
        }
        self.buckets
            .get(&name_hash(name))?
            .iter()
            .find(|entry| entry.name == name)
    }

    fn entries(&self) -> impl Iterator<Item = &ServiceEntry<S>> {
        self.buckets.values().flatten()
    }
}

/// Name-based service directory
pub struct ServiceRegistry<S = ServiceHandle> {
    inner: RwLock<Buckets<S>>,
}

impl<S: Clone> Default for ServiceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> ServiceRegistry<S> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Buckets::default()),
        }
    }

    /// Register a service in the default namespace without labels
    pub fn register(&self, name: impl Into<Text>, service: S) -> Result<()> {
        self.register_spec(ServiceSpec::new(name), service)
    }

    /// Register a service; names must be unique across namespaces
    pub fn register_spec(&self, spec: ServiceSpec, service: S) -> Result<()> {
        if spec.name.is_empty() {
            return Err(Error::Config("service name cannot be empty".into()));
        }

        let hash = name_hash(&spec.name);
        let mut inner = self.inner.write();

        if inner.find(&spec.name).is_some() {
            tracing::warn!(service = %spec.name, "Service already registered");
            return Err(Error::AlreadyExists(spec.name.into_owned()));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = ServiceEntry {
            namespace: spec.namespace.unwrap_or(Cow::Borrowed(DEFAULT_NAMESPACE)),
            name: spec.name,
            labels: spec.labels,
            service,
            registered_at: Instant::now(),
            seq,
        };
        tracing::debug!(service = %entry.name, namespace = %entry.namespace, "Service registered");

        inner.buckets.entry(hash).or_default().insert(0, entry);
        inner.count += 1;
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> Option<S> {
        self.inner.read().find(name).map(|entry| entry.service.clone())
    }

    /// Look up the service registered as `"<namespace>.<name>"`
    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<S> {
        self.get_service(&format!("{}.{}", namespace, name))
    }

    /// Return the service satisfying the most selectors.
    ///
    /// Ties go to the most recently registered service. A service matching
    /// none of the selectors is never returned.
    pub fn get_with_selector(&self, selectors: &[Selector]) -> Option<S> {
        let inner = self.inner.read();
        inner
            .entries()
            .map(|entry| (entry.score(selectors), entry.seq, entry))
            .filter(|(score, _, _)| *score > 0)
            .max_by_key(|(score, seq, _)| (*score, *seq))
            .map(|(_, _, entry)| entry.service.clone())
    }

    /// Remove a service; returns whether it was registered
    pub fn unregister(&self, name: &str) -> bool {
        let hash = name_hash(name);
        let mut inner = self.inner.write();
        let Some(bucket) = inner.buckets.get_mut(&hash) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|entry| entry.name == name) else {
            return false;
        };

        bucket.remove(pos);
        if bucket.is_empty() {
            inner.buckets.remove(&hash);
        }
        inner.count -= 1;
        tracing::debug!(service = %name, "Service unregistered");
        true
    }

    pub fn count(&self) -> usize {
        self.inner.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Registered services, most recent first
    pub fn list(&self) -> Vec<ServiceInfo> {
        let inner = self.inner.read();
        let mut entries: Vec<_> = inner.entries().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
            .into_iter()
            .map(|entry| ServiceInfo {
                name: entry.name.to_string(),
                namespace: entry.namespace.to_string(),
                labels: entry
                    .labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                registered_at: entry.registered_at,
            })
            .collect()
    }
}
