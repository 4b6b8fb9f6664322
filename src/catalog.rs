//! Stream identity and the destination catalog.
//!
//! The catalog is fixed at sync start and defines every stream the
//! [`SyncManager`](crate::state::SyncManager) will ever serve.

use crate::error::{CdkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identity of a logical stream: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Descriptor without a namespace.
    pub fn named(name: &str) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The fixed list of streams declared for one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCatalog {
    pub streams: Vec<StreamDescriptor>,
}

impl DestinationCatalog {
    /// Build a catalog, rejecting duplicate descriptors.
    pub fn new(streams: Vec<StreamDescriptor>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(streams.len());
        for stream in &streams {
            if !seen.insert(stream) {
                return Err(CdkError::Config(format!(
                    "stream {} declared more than once in catalog",
                    stream
                )));
            }
        }
        Ok(Self { streams })
    }

    /// Parse a catalog from its JSON form: `{"streams": [{"namespace": .., "name": ..}]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: DestinationCatalog = serde_json::from_str(json)
            .map_err(|e| CdkError::Config(format!("invalid catalog: {}", e)))?;
        Self::new(parsed.streams)
    }

    pub fn contains(&self, stream: &StreamDescriptor) -> bool {
        self.streams.contains(stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
