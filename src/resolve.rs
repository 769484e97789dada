//! The glue between a resolver and its batch coordinator.
//!
//! A relational field resolver doesn't query the store itself. It asks the
//! execution context for the operation's [`Registry`] and the identity of
//! the field being resolved, gets (or creates) the coordinator for that
//! field, registers the parent's key and awaits the result. That is all
//! [`load`] does.

use std::hash::Hash;

use thiserror::Error;

use crate::{
    batch::BatchCoordinator,
    error::{Error, Result},
    registry::{FieldIdentity, Registry},
};

/// What a resolver needs from the engine's per-call context.
pub trait ExecutionContext {
    /// The registry of the operation being executed.
    fn registry(&self) -> Result<&Registry>;

    /// The identity of the field occurrence being resolved.
    fn field_identity(&self) -> FieldIdentity;
}

/// Why [`load`] failed.
#[derive(Debug, Clone, Error)]
pub enum LoadError<FetchError> {
    #[error(transparent)]
    Registry(#[from] Error),

    #[error("batched fetch failed: {0}")]
    Fetch(FetchError),
}

/// Resolve a relational field for one parent object. `make` builds the
/// coordinator the first time the field is seen in this operation, and is
/// ignored afterwards.
pub async fn load<Ctx, Key, Value, FetchError>(
    ctx: &Ctx,
    key: Key,
    make: impl FnOnce() -> BatchCoordinator<Key, Value, FetchError>,
) -> Result<Value, LoadError<FetchError>>
where
    Ctx: ExecutionContext + ?Sized,
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    FetchError: Clone + Send + 'static,
{
    let coordinator = ctx
        .registry()?
        .coordinator_for(&ctx.field_identity(), make)?;

    coordinator.register(key).await.map_err(LoadError::Fetch)
}

#[cfg(feature = "graphql")]
mod graphql {
    use async_graphql::{Context, QueryPathSegment};

    use super::ExecutionContext;
    use crate::{
        error::{Error, Result},
        registry::{FieldIdentity, Registry},
    };

    /// The registry is per-request data (`Request::data(Registry::new())`);
    /// the field identity is the field node's name, alias and position in
    /// the query document, plus the response path of its parent without
    /// list indices.
    impl ExecutionContext for Context<'_> {
        fn registry(&self) -> Result<&Registry> {
            self.data_opt::<Registry>().ok_or(Error::MissingRegistry)
        }

        fn field_identity(&self) -> FieldIdentity {
            let field = &self.item.node;
            let mut path: Vec<&str> = self
                .path_node
                .iter()
                .flat_map(|node| node.parents())
                .filter_map(|node| match node.segment {
                    QueryPathSegment::Name(name) => Some(name),
                    QueryPathSegment::Index(..) => None,
                })
                .collect();
            path.reverse();

            let identity = FieldIdentity::new(field.name.node.as_str())
                .at(self.item.pos.line, self.item.pos.column)
                .under(path);

            match field.alias {
                Some(ref alias) => identity.with_alias(alias.node.as_str()),
                None => identity,
            }
        }
    }
}
