//! Per-operation map from field identity to batch coordinator.

use std::{
    any::Any,
    collections::hash_map::{Entry, HashMap},
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    sync::Mutex,
};

use tracing::debug;

use crate::{
    batch::BatchCoordinator,
    error::{Error, Result},
    lock,
};

/// Identifies one occurrence of a field in an operation. Every parent object
/// resolved through the same occurrence shares a coordinator (and therefore
/// one bulk fetch), while two occurrences never do, even if they resolve the
/// same relation.
///
/// The line and column are the position of the field in the operation
/// document, which tells two occurrences of the same field apart. A field
/// inside a fragment has one position however many places the fragment is
/// spread into, so the response path of the parent (with list indices left
/// out) is part of the identity too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldIdentity {
    name: String,
    alias: Option<String>,
    line: usize,
    column: usize,
    path: Vec<String>,
}

impl FieldIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            line: 0,
            column: 0,
            path: Vec::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Position of the field in the operation document.
    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    /// Response keys leading to the parent object, root first.
    pub fn under<Segment: Into<String>>(mut self, path: impl IntoIterator<Item = Segment>) -> Self {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn position(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }
}

impl Display for FieldIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{}: ", alias)?;
        }
        write!(f, "{}@{}:{}", self.name, self.line, self.column)?;
        if !self.path.is_empty() {
            write!(f, " under {}", self.path.join("."))?;
        }
        Ok(())
    }
}

/// The coordinators for one inbound operation. Create a fresh `Registry` for
/// every operation and drop it when the operation completes; nothing it
/// holds is shared with other operations.
#[derive(Default)]
pub struct Registry {
    coordinators: Mutex<HashMap<FieldIdentity, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the coordinator for this field, creating it with `make` if this
    /// is the first time the field is seen in the operation. `make` is not
    /// called if the coordinator already exists.
    pub fn coordinator_for<Key, Value, FetchError>(
        &self,
        identity: &FieldIdentity,
        make: impl FnOnce() -> BatchCoordinator<Key, Value, FetchError>,
    ) -> Result<BatchCoordinator<Key, Value, FetchError>>
    where
        Key: Eq + Hash + Send + 'static,
        Value: Send + 'static,
        FetchError: Send + 'static,
    {
        let mut coordinators = lock(&self.coordinators);

        match coordinators.entry(identity.clone()) {
            Entry::Occupied(entry) => entry
                .get()
                .downcast_ref::<BatchCoordinator<Key, Value, FetchError>>()
                .cloned()
                .ok_or_else(|| Error::CoordinatorTypeMismatch {
                    identity: identity.clone(),
                }),
            Entry::Vacant(entry) => {
                let coordinator = make();
                debug!(field = %identity, "created batch coordinator");
                entry.insert(Box::new(coordinator.clone()));
                Ok(coordinator)
            }
        }
    }

    /// The number of fields that have a coordinator in this operation.
    pub fn len(&self) -> usize {
        lock(&self.coordinators).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.coordinators).is_empty()
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(lock(&self.coordinators).keys())
            .finish()
    }
}
