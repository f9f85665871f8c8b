use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Unexpected key format: {0:?}")]
    InvalidFormat(String),
}

/// Identity of a watched object, rendered as `<namespace>/<name>` or `<name>`
/// for cluster-scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Some(namespace.into()), name)
    }

    /// Key of a live object. Objects without `.metadata.name` have no identity
    /// yet and cannot be queued.
    pub fn for_resource<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let name = obj
            .meta()
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or(KeyError::MissingObjectKey(".metadata.name"))?;
        Ok(Self::new(obj.namespace(), name))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::new(None, name),
            (Some(namespace), Some(name), None) => Self::new(Some(namespace.to_string()), name),
            _ => return Err(KeyError::InvalidFormat(s.to_string())),
        };
        if key.name.is_empty() {
            return Err(KeyError::InvalidFormat(s.to_string()));
        }
        Ok(key)
    }
}
