//! Fieldloader coordinates batched fetches for GraphQL relation fields, in
//! the style of the [dataloader pattern](https://github.com/graphql/dataloader).
//! When a query asks for a relation on every item of a list (the profile of
//! every user, the posts of every author), a naive resolver issues one query
//! per parent object. Fieldloader collects the keys registered by all of
//! those resolvers during one coalescing window, issues a single bulk fetch,
//! and hands each resolver the records matching its own key.
//!
//! ## Overview
//!
//! A bulk fetch function takes a list of keys and returns the matching
//! records, in any order:
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct Profile {
//!     id: u32,
//!     user_id: u32,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct StoreError;
//!
//! async fn profiles_by_user(user_ids: Vec<u32>) -> Result<Vec<Profile>, StoreError> {
//!     Ok(user_ids.into_iter().map(|user_id| Profile { id: user_id + 100, user_id }).collect())
//! }
//! ```
//!
//! A [`BatchCoordinator`] wraps it, along with a cardinality policy and a
//! function extracting the correlation key from a record:
//!
//! - [`BatchCoordinator::singular`]: each key matches at most one record, and
//!   resolves to `Option<Record>`.
//! - [`BatchCoordinator::plural`]: each key matches any number of records,
//!   and resolves to `Vec<Record>`.
//!
//! Records are matched to keys by value, never by position, so the fetch
//! doesn't have to preserve the order of its input, or return anything for
//! keys it has no record for.
//!
//! ```
//! # #[derive(Debug, Clone)] struct Profile { id: u32, user_id: u32 }
//! # #[derive(Debug, Clone)] struct StoreError;
//! # async fn profiles_by_user(user_ids: Vec<u32>) -> Result<Vec<Profile>, StoreError> {
//! #     Ok(user_ids.into_iter().map(|user_id| Profile { id: user_id + 100, user_id }).collect())
//! # }
//! use fieldloader::{BatchCoordinator, BatchRules};
//! use futures::{executor, future};
//!
//! let coordinator = BatchCoordinator::singular(
//!     BatchRules::default(),
//!     profiles_by_user,
//!     |profile: &Profile| profile.user_id,
//! );
//!
//! let profiles = executor::block_on(future::join_all([
//!     coordinator.register(1),
//!     coordinator.register(2),
//!     coordinator.register(1),
//! ]));
//!
//! // One bulk fetch, with the keys [1, 2]
//! assert_eq!(profiles[0].as_ref().unwrap().as_ref().unwrap().id, 101);
//! assert_eq!(profiles[2].as_ref().unwrap().as_ref().unwrap().id, 101);
//! ```
//!
//! In a GraphQL server, coordinators live in a per-operation [`Registry`],
//! keyed by the [`FieldIdentity`] of the field being resolved, and resolvers
//! reach them through [`resolve::load`]. With the `graphql` feature,
//! [`ExecutionContext`] is implemented for `async_graphql::Context`:
//!
//! ```ignore
//! #[ComplexObject]
//! impl User {
//!     async fn profile(&self, ctx: &Context<'_>) -> async_graphql::Result<Option<Profile>> {
//!         let store = ctx.data::<Arc<Store>>()?.clone();
//!         let profile = fieldloader::load(ctx, self.id, move || {
//!             BatchCoordinator::singular(
//!                 BatchRules::default(),
//!                 move |ids| store.profiles_by_user(ids),
//!                 |profile: &Profile| profile.user_id,
//!             )
//!         })
//!         .await?;
//!
//!         Ok(profile)
//!     }
//! }
//!
//! // Per request:
//! schema.execute(Request::new(query).data(Registry::new())).await;
//! ```
//!
//! ## Design notes
//!
//! ### The coalescing window
//!
//! A batch accepts keys until its window closes. The default window,
//! [`Window::Yield`], closes at the end of the current execution turn: the
//! future driving the batch yields to the executor exactly once, so every
//! sibling resolver that is already runnable gets to register its key before
//! the fetch is dispatched. [`Window::Delay`] closes after a fixed time
//! instead, for keys arriving from independent tasks. Either way, an
//! optional `max_keys` dispatches the batch early once it holds that many
//! unique keys.
//!
//! ### `KeySet` and `ValueSet`
//!
//! The batch function behind a coordinator takes a [`KeySet`] and returns a
//! [`ValueSet`]. The only way to create a [`ValueSet`] is with one of the
//! methods on [`KeySet`]; these methods all ensure that the [`ValueSet`] has
//! precisely one value for each of the keys.
//!
//! The [`KeySet`] deduplicates incoming keys, and only passes unique keys to
//! the batch function. The [`ValueSet`] internally stores how many requests
//! for a key have been made, and uses value cloning to give out values to
//! different futures (past the first) associated with the same key.
//!
//! ### Poll-driven design
//!
//! All of the asynchronous work is driven through polling [`BatchFuture`].
//! The bulk fetch is not spawned in any runtime; it is driven directly in
//! the foreground by one of the `BatchFuture`s, the "driver". The others are
//! woken only when data is available (or when the driver is dropped, so
//! that one of them takes over).
//!
//! ### Failures and caching
//!
//! If the bulk fetch fails, every future in the batch gets a clone of the
//! error; no future in a failed batch gets a value. Successful values are
//! cached by the coordinator (see [`BatchRules::cache`]); failures are not,
//! so the next registration of a failed key starts a new batch.

mod batch;
mod data;
mod error;
mod registry;
pub mod resolve;
mod wakerset;
mod window;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use batch::{BatchCoordinator, BatchFuture, BatchRules};
pub use data::{KeySet, OnDuplicate, ValueSet};
pub use error::{Error, Result};
pub use registry::{FieldIdentity, Registry};
pub use resolve::{load, ExecutionContext, LoadError};
pub use window::Window;

/// Lock a mutex, ignoring poisoning. State behind these mutexes is only
/// mutated by code that doesn't panic midway, and a panicking bulk fetch
/// future leaves the batch in the Running state, which is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
