//! Controller Memory Map
//!
//! The registry of named parameters a caller can read, and the request shapes
//! used to ask for one parameter or a whole nested bundle of them.

mod default_map;
mod descriptor;
mod values;

pub use default_map::{default_map, HEARTBEAT};
pub use descriptor::{Descriptor, DescriptorBuilder, Scale, StorageClass, RAM_ADDRESS_LIMIT};
pub use values::{Reading, Value};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or querying the memory map
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Parameter defined twice: {0}")]
    DuplicateParameter(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// What a caller asks to read: one parameter, or a named bundle of requests
///
/// Bundles keep insertion order, and that order is the order in which the
/// controller is queried.
#[derive(Debug, Clone)]
pub enum ParamRequest {
    Single(Arc<Descriptor>),
    Bundle(Vec<(String, ParamRequest)>),
}

impl ParamRequest {
    /// Build a bundle from named entries
    pub fn bundle<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamRequest)>,
    {
        ParamRequest::Bundle(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a flat bundle keyed by each descriptor's registry path
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = Arc<Descriptor>>) -> Self {
        ParamRequest::Bundle(
            descriptors
                .into_iter()
                .map(|d| (d.key().to_string(), ParamRequest::Single(d)))
                .collect(),
        )
    }

    /// Flatten into descriptors, depth-first in insertion order
    pub fn expand(&self) -> Vec<Arc<Descriptor>> {
        let mut out = Vec::new();
        self.expand_into(&mut out);
        out
    }

    fn expand_into(&self, out: &mut Vec<Arc<Descriptor>>) {
        match self {
            ParamRequest::Single(d) => out.push(Arc::clone(d)),
            ParamRequest::Bundle(entries) => {
                for (_, entry) in entries {
                    entry.expand_into(out);
                }
            }
        }
    }

    /// Number of frames needed to read every descriptor
    pub fn frame_count(&self) -> usize {
        self.expand().iter().map(|d| d.addresses().len()).sum()
    }
}

impl From<Arc<Descriptor>> for ParamRequest {
    fn from(descriptor: Arc<Descriptor>) -> Self {
        ParamRequest::Single(descriptor)
    }
}

/// Immutable table of named parameters
#[derive(Debug, Clone)]
pub struct Registry {
    root: Vec<(String, ParamRequest)>,
    index: HashMap<String, Arc<Descriptor>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Find a single parameter by dotted path
    pub fn lookup(&self, path: &str) -> Result<Arc<Descriptor>, RegistryError> {
        self.index
            .get(path)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownParameter(path.to_string()))
    }

    /// Resolve a path to a single parameter or a whole group
    ///
    /// An empty path resolves to the complete map.
    pub fn resolve(&self, path: &str) -> Result<ParamRequest, RegistryError> {
        if path.is_empty() {
            return Ok(ParamRequest::Bundle(self.root.clone()));
        }
        let mut entries = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let found = entries
                .iter()
                .find(|(name, _)| name == segment)
                .map(|(_, r)| r)
                .ok_or_else(|| RegistryError::UnknownParameter(path.to_string()))?;
            match found {
                ParamRequest::Bundle(children) if segments.peek().is_some() => entries = children,
                _ if segments.peek().is_none() => return Ok(found.clone()),
                _ => break,
            }
        }
        Err(RegistryError::UnknownParameter(path.to_string()))
    }

    /// Resolve several paths into one bundle keyed by path
    pub fn select<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Result<ParamRequest, RegistryError> {
        let entries = paths
            .into_iter()
            .map(|p| Ok((p.to_string(), self.resolve(p)?)))
            .collect::<Result<Vec<_>, RegistryError>>()?;
        Ok(ParamRequest::Bundle(entries))
    }

    /// Flatten a request into descriptors
    pub fn expand(&self, request: &ParamRequest) -> Vec<Arc<Descriptor>> {
        request.expand()
    }

    /// Top-level group names in definition order
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.root.iter().map(|(name, _)| name.as_str())
    }

    /// Every parameter in definition order
    pub fn iter(&self) -> impl Iterator<Item = Arc<Descriptor>> {
        ParamRequest::Bundle(self.root.clone()).expand().into_iter()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Collects descriptors by dotted path
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    params: Vec<(String, DescriptorBuilder)>,
}

impl RegistryBuilder {
    /// Add a parameter; intermediate path segments become groups
    pub fn param(mut self, path: impl Into<String>, descriptor: DescriptorBuilder) -> Self {
        self.params.push((path.into(), descriptor));
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut root = Vec::new();
        let mut index = HashMap::new();

        for (path, builder) in self.params {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(RegistryError::InvalidDescriptor {
                    name: path,
                    reason: "empty path segment".into(),
                });
            }
            if index.contains_key(&path) {
                return Err(RegistryError::DuplicateParameter(path));
            }
            let descriptor = Arc::new(builder.build(path.clone())?);
            let segments: Vec<&str> = path.split('.').collect();
            insert(&mut root, &segments, Arc::clone(&descriptor), &path)?;
            index.insert(path, descriptor);
        }

        Ok(Registry { root, index })
    }
}

fn insert(
    entries: &mut Vec<(String, ParamRequest)>,
    segments: &[&str],
    descriptor: Arc<Descriptor>,
    path: &str,
) -> Result<(), RegistryError> {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return Err(RegistryError::DuplicateParameter(path.to_string())),
    };

    let position = entries.iter().position(|(name, _)| name == head);
    if rest.is_empty() {
        if position.is_some() {
            return Err(RegistryError::DuplicateParameter(path.to_string()));
        }
        entries.push((head.to_string(), ParamRequest::Single(descriptor)));
        return Ok(());
    }

    let idx = match position {
        Some(idx) => idx,
        None => {
            entries.push((head.to_string(), ParamRequest::Bundle(Vec::new())));
            entries.len() - 1
        }
    };
    match &mut entries[idx].1 {
        ParamRequest::Bundle(children) => insert(children, rest, descriptor, path),
        ParamRequest::Single(_) => Err(RegistryError::DuplicateParameter(path.to_string())),
    }
}
