use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, trace, warn};

use crate::{
    data::{KeySet, OnDuplicate, Token as KeyToken, ValueSet},
    lock,
    wakerset::{Token as WakerToken, WakerSet},
    window::Window,
};

type Batcher<Key, Value, Error> =
    dyn Fn(KeySet<Key>) -> BoxFuture<'static, Result<ValueSet<Value>, Error>> + Send + Sync;

type SharedState<Key, Value, Error> = Arc<Mutex<State<Key, Value, Error>>>;

struct AccumulatingState<Key: Eq + Hash> {
    keys: KeySet<Key>,
    window: Option<BoxFuture<'static, ()>>,
    wakers: WakerSet,
}

impl<Key: Debug + Eq + Hash> Debug for AccumulatingState<Key> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("window", &self.window.as_ref().map(|_| "<window>"))
            .field("wakers", &self.wakers)
            .finish()
    }
}

struct RunningState<Key, Value, Error> {
    fut: BoxFuture<'static, Result<ValueSet<Value>, Error>>,
    keys: HashMap<Key, KeyToken>,
    wakers: WakerSet,
    dropped_tokens: Vec<KeyToken>,
    late_tokens: Vec<KeyToken>,
}

enum State<Key: Eq + Hash, Value, Error> {
    Accum(AccumulatingState<Key>),
    Running(RunningState<Key, Value, Error>),
    Done(Result<ValueSet<Value>, Error>),
}

/// What the coordinator remembers about a key between batches.
enum CacheEntry<Key: Eq + Hash, Value, Error> {
    /// The key is part of a batch that has been dispatched but not settled;
    /// new registrations join it.
    InFlight(Weak<Mutex<State<Key, Value, Error>>>),
    Settled(Value),
}

/// Rules for a [`BatchCoordinator`].
#[derive(Debug, Clone)]
pub struct BatchRules {
    /// How long registrations are accumulated before the batch is
    /// dispatched.
    pub window: Window,

    /// If set, the batch is dispatched as soon as it holds this many unique
    /// keys, regardless of the window. Later keys go into a new batch.
    pub max_keys: Option<NonZeroUsize>,

    /// Keep successfully fetched values for the lifetime of the coordinator,
    /// so that a key registered again later resolves without a fetch, and a
    /// key registered while its batch is in flight joins that batch. Failed
    /// fetches are never cached.
    pub cache: bool,

    /// Which record wins when a singular fetch returns several for one key.
    pub on_duplicate: OnDuplicate,
}

impl Default for BatchRules {
    fn default() -> Self {
        Self {
            window: Window::Yield,
            max_keys: None,
            cache: true,
            on_duplicate: OnDuplicate::Ignore,
        }
    }
}

impl BatchRules {
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Cap the number of unique keys per batch. A limit of 0 means no limit.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = NonZeroUsize::new(max_keys);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_on_duplicate(mut self, on_duplicate: OnDuplicate) -> Self {
        self.on_duplicate = on_duplicate;
        self
    }
}

struct Shared<Key: Eq + Hash, Value, Error> {
    rules: BatchRules,
    batcher: Box<Batcher<Key, Value, Error>>,

    // The batch currently accepting keys. This is only a hint: a batch
    // found here that has already left the accumulating state is replaced
    // with a fresh one.
    current: ArcSwapOption<Mutex<State<Key, Value, Error>>>,
    cache: Mutex<HashMap<Key, CacheEntry<Key, Value, Error>>>,
}

/// A `BatchCoordinator` collects the keys registered against one field
/// during a coalescing window, dispatches them to the bulk fetch function in
/// a single call, and hands each caller the value for its own key.
///
/// The coordinator is a cheap handle; clones share the same queue and cache.
pub struct BatchCoordinator<Key: Eq + Hash, Value, Error> {
    shared: Arc<Shared<Key, Value, Error>>,
}

impl<Key: Eq + Hash, Value, Error> Clone for BatchCoordinator<Key, Value, Error> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Key: Eq + Hash, Value, Error> Debug for BatchCoordinator<Key, Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("rules", &self.shared.rules)
            .field("batcher", &"<closure>")
            .finish()
    }
}

impl<Key, Value, Error> BatchCoordinator<Key, Value, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    /// Create a coordinator from a batch function that maps a [`KeySet`]
    /// directly to a [`ValueSet`].
    pub fn new<Batch, Fut>(rules: BatchRules, batcher: Batch) -> Self
    where
        Batch: Fn(KeySet<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueSet<Value>, Error>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                rules,
                batcher: Box::new(move |keys| batcher(keys).boxed()),
                current: ArcSwapOption::empty(),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn rules(&self) -> &BatchRules {
        &self.shared.rules
    }

    /// Register a key and get a future for its value. Registration happens
    /// immediately, before the future is first polled; every key registered
    /// before the window closes goes into the same bulk fetch.
    pub fn register(&self, key: Key) -> BatchFuture<Key, Value, Error> {
        if self.shared.rules.cache {
            if let Some(fut) = self.register_cached(&key) {
                return fut;
            }
        }

        loop {
            let current = self.shared.current.load_full();

            if let Some(ref state) = current {
                let mut guard = lock(state);

                if let State::Accum(ref mut accum) = *guard {
                    let key_token = accum.keys.add_key(key);
                    trace!(keys = accum.keys.len(), "registered batch key");

                    // If we've hit the key limit, close the window, nudge
                    // the driver, and detach this batch from the
                    // coordinator so that the next key starts a new one.
                    match self.shared.rules.max_keys {
                        Some(max_keys) if accum.keys.len() >= max_keys.get() => {
                            accum.window = None;
                            accum.wakers.wake_driver();
                            drop(guard);
                            self.shared.current.compare_and_swap(&current, None);
                        }
                        _ => drop(guard),
                    }

                    return BatchFuture::waiting(key_token, Arc::clone(state), &self.shared);
                }
            }

            // Either there is no batch, or the one we found has already been
            // dispatched. Install a fresh one, unless another thread beat us
            // to it, and go around again to add the key to whichever won.
            let fresh = Arc::new(Mutex::new(State::Accum(AccumulatingState {
                keys: KeySet::new(),
                window: Some(self.shared.rules.window.open()),
                wakers: WakerSet::default(),
            })));

            self.shared.current.compare_and_swap(&current, Some(fresh));
        }
    }

    /// Alias for [`register`](Self::register).
    pub fn load(&self, key: Key) -> BatchFuture<Key, Value, Error> {
        self.register(key)
    }

    fn register_cached(&self, key: &Key) -> Option<BatchFuture<Key, Value, Error>> {
        // Don't hold the cache lock while locking a batch; settling a batch
        // locks them in the opposite order.
        let in_flight = match lock(&self.shared.cache).get(key) {
            None => return None,
            Some(CacheEntry::Settled(value)) => {
                trace!("batch key served from cache");
                return Some(BatchFuture::ready(value.clone()));
            }
            Some(CacheEntry::InFlight(state)) => state.upgrade()?,
        };

        let mut guard = lock(&in_flight);
        match *guard {
            State::Running(ref mut running) => {
                let key_token = running.keys.get(key)?.duplicate();
                running.late_tokens.push(key_token.duplicate());
                drop(guard);

                trace!("batch key joined an in-flight batch");
                Some(BatchFuture::waiting(key_token, Arc::clone(&in_flight), &self.shared))
            }
            // The batch settled between the two locks; the cache has the
            // value now.
            State::Done(Ok(..)) => {
                drop(guard);
                match lock(&self.shared.cache).get(key) {
                    Some(CacheEntry::Settled(value)) => Some(BatchFuture::ready(value.clone())),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Seed the cache with a value for this key, unless one is already
    /// known. Has no effect if caching is disabled.
    pub fn prime(&self, key: Key, value: Value) {
        if self.shared.rules.cache {
            lock(&self.shared.cache)
                .entry(key)
                .or_insert(CacheEntry::Settled(value));
        }
    }

    /// Forget the cached value for this key, so that the next registration
    /// fetches it again.
    pub fn clear(&self, key: &Key) {
        lock(&self.shared.cache).remove(key);
    }

    /// Forget every cached value.
    pub fn clear_all(&self) {
        lock(&self.shared.cache).clear();
    }
}

impl<Key, Record, Error> BatchCoordinator<Key, Option<Record>, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Record: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    /// A coordinator for a relation where each key matches at most one
    /// record. `key_of` extracts the correlation key from a fetched record;
    /// keys without a record resolve to `None`.
    pub fn singular<Fetch, Fut, KeyOf>(rules: BatchRules, fetch: Fetch, key_of: KeyOf) -> Self
    where
        Fetch: Fn(Vec<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Record>, Error>> + Send + 'static,
        KeyOf: Fn(&Record) -> Key + Send + Sync + 'static,
    {
        let on_duplicate = rules.on_duplicate;
        let key_of = Arc::new(key_of);

        Self::new(rules, move |keys: KeySet<Key>| {
            let records = fetch(keys.to_vec());
            let key_of = Arc::clone(&key_of);

            async move {
                records
                    .await
                    .map(|records| keys.match_one(on_duplicate, records, &*key_of))
            }
        })
    }
}

impl<Key, Record, Error> BatchCoordinator<Key, Vec<Record>, Error>
where
    Key: Eq + Hash + Clone + Send + 'static,
    Record: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    /// A coordinator for a relation where each key matches any number of
    /// records. Keys without records resolve to an empty Vec.
    pub fn plural<Fetch, Fut, KeyOf>(rules: BatchRules, fetch: Fetch, key_of: KeyOf) -> Self
    where
        Fetch: Fn(Vec<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Record>, Error>> + Send + 'static,
        KeyOf: Fn(&Record) -> Key + Send + Sync + 'static,
    {
        let key_of = Arc::new(key_of);

        Self::new(rules, move |keys: KeySet<Key>| {
            let records = fetch(keys.to_vec());
            let key_of = Arc::clone(&key_of);

            async move {
                records
                    .await
                    .map(|records| keys.match_many(records, &*key_of))
            }
        })
    }
}

/// A batch future is a request for a single key's value, which shares its
/// bulk fetch with every other future registered in the same window. It is
/// created by [`BatchCoordinator::register`].
pub struct BatchFuture<Key: Eq + Hash, Value, Error> {
    inner: Inner<Key, Value, Error>,
}

enum Inner<Key: Eq + Hash, Value, Error> {
    Ready(Option<Value>),
    Waiting(Waiting<Key, Value, Error>),
}

struct Waiting<Key: Eq + Hash, Value, Error> {
    key_token: KeyToken,
    waker_token: Option<WakerToken>,
    state: Option<SharedState<Key, Value, Error>>,
    shared: Arc<Shared<Key, Value, Error>>,
}

// No field is ever pinned; the batch futures are boxed.
impl<Key: Eq + Hash, Value, Error> Unpin for BatchFuture<Key, Value, Error> {}

impl<Key: Eq + Hash, Value, Error> BatchFuture<Key, Value, Error> {
    fn ready(value: Value) -> Self {
        Self {
            inner: Inner::Ready(Some(value)),
        }
    }

    fn waiting(
        key_token: KeyToken,
        state: SharedState<Key, Value, Error>,
        shared: &Arc<Shared<Key, Value, Error>>,
    ) -> Self {
        Self {
            inner: Inner::Waiting(Waiting {
                key_token,
                waker_token: None,
                state: Some(state),
                shared: Arc::clone(shared),
            }),
        }
    }
}

impl<Key, Value, Error> Future for BatchFuture<Key, Value, Error>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
{
    type Output = Result<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::into_inner(self).inner {
            Inner::Ready(ref mut value) => Poll::Ready(Ok(value
                .take()
                .expect("Can't re-poll a completed BatchFuture"))),
            Inner::Waiting(ref mut waiting) => waiting.poll(ctx),
        }
    }
}

impl<Key, Value, Error> Waiting<Key, Value, Error>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
{
    fn poll(&mut self, ctx: &mut Context<'_>) -> Poll<Result<Value, Error>> {
        let state = Arc::clone(
            self.state
                .as_ref()
                .expect("Can't re-poll a completed BatchFuture"),
        );

        // Note about this mutex: it is safe to use in an async context,
        // because the lock is released when poll returns.
        let mut guard = lock(&state);

        if let State::Accum(ref mut accum) = *guard {
            let waker_token = accum.wakers.upsert(&mut self.waker_token, ctx.waker());

            match accum.window {
                // Only the driving future polls the window. Everyone else
                // waits to be woken when the results are in.
                Some(ref mut window) => {
                    if !accum.wakers.claim_driver(waker_token) || window.poll_unpin(ctx).is_pending() {
                        return Poll::Pending;
                    }
                }
                // The key limit closed the window; whoever gets here first
                // dispatches the batch.
                None => accum.wakers.take_over(waker_token),
            }

            let wakers = mem::take(&mut accum.wakers);
            let keys = accum.keys.take();
            let snapshot = keys.snapshot();
            debug!(keys = keys.len(), "dispatching batch");

            let fut = (self.shared.batcher)(keys);

            if self.shared.rules.cache {
                let in_flight = Arc::downgrade(&state);
                let mut cache = lock(&self.shared.cache);
                for key in snapshot.keys() {
                    cache.insert(key.clone(), CacheEntry::InFlight(Weak::clone(&in_flight)));
                }
            }

            *guard = State::Running(RunningState {
                fut,
                keys: snapshot,
                wakers,
                dropped_tokens: Vec::new(),
                late_tokens: Vec::new(),
            });
        }

        if let State::Running(ref mut running) = *guard {
            let waker_token = running.wakers.upsert(&mut self.waker_token, ctx.waker());

            if !running.wakers.claim_driver(waker_token) {
                return Poll::Pending;
            }

            let mut result = match running.fut.poll_unpin(ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };

            self.settle(&state, running, &mut result);

            // Now that we have a result, signal all the waiting futures to
            // wake up so they can get their results. We're about to grab our
            // own result, so we don't need to wake ourself.
            let wakers = mem::take(&mut running.wakers);
            match self.waker_token.take() {
                Some(token) => wakers.discard_wake_all(&token),
                None => wakers.wake_all(),
            }

            *guard = State::Done(result);
        }

        let result = match *guard {
            State::Done(Ok(ref mut values)) => Ok(values
                .take(&self.key_token)
                .expect("Unknown logic error: no value in ValueSet associated with Token")),
            State::Done(Err(ref err)) => Err(err.clone()),
            _ => unreachable!("BatchFuture contained invalid state"),
        };

        drop(guard);
        self.state = None;
        Poll::Ready(result)
    }

    /// Bookkeeping once the bulk fetch has returned: account for futures
    /// that joined or left while it ran, and update the cache.
    fn settle(
        &self,
        state: &SharedState<Key, Value, Error>,
        running: &mut RunningState<Key, Value, Error>,
        result: &mut Result<ValueSet<Value>, Error>,
    ) {
        match result {
            Ok(values) => {
                running
                    .late_tokens
                    .drain(..)
                    .for_each(|token| values.claim(&token));

                if self.shared.rules.cache {
                    let mut cache = lock(&self.shared.cache);
                    for (key, token) in running.keys.iter() {
                        if let Some(value) = values.peek(token) {
                            cache.insert(key.clone(), CacheEntry::Settled(value.clone()));
                        }
                    }
                }

                running
                    .dropped_tokens
                    .drain(..)
                    .for_each(|token| values.discard(token));

                debug!(keys = running.keys.len(), "batch settled");
            }
            Err(..) => {
                warn!(
                    keys = running.keys.len(),
                    "bulk fetch failed, failing every caller in the batch"
                );

                // Failures are not cached: the next registration of any of
                // these keys starts a new batch.
                if self.shared.rules.cache {
                    let mut cache = lock(&self.shared.cache);
                    for key in running.keys.keys() {
                        let ours = matches!(
                            cache.get(key),
                            Some(CacheEntry::InFlight(in_flight))
                                if Weak::as_ptr(in_flight) == Arc::as_ptr(state)
                        );
                        if ours {
                            cache.remove(key);
                        }
                    }
                }
            }
        }
    }
}

impl<Key: Eq + Hash, Value, Error> Drop for BatchFuture<Key, Value, Error> {
    fn drop(&mut self) {
        // The batch is only ever driven by a single future, so if this one
        // was the driver, another has to be woken to take over. That logic
        // is mostly handled by the WakerSet type.
        let waiting = match self.inner {
            Inner::Waiting(ref mut waiting) => waiting,
            Inner::Ready(..) => return,
        };

        let state = match waiting.state.take() {
            Some(state) => state,
            None => return,
        };

        let mut guard = lock(&state);
        let key_token = waiting.key_token.duplicate();

        match *guard {
            State::Accum(ref mut accum) => {
                if let Some(waker_token) = waiting.waker_token.take() {
                    accum.wakers.discard_and_wake(waker_token);
                }

                accum.keys.discard_token(key_token);
            }
            State::Running(ref mut running) => {
                if let Some(waker_token) = waiting.waker_token.take() {
                    running.wakers.discard_and_wake(waker_token);
                }

                // The KeySet is owned by the bulk fetch at this point, so
                // remember the token and discard it from the ValueSet once
                // it's ready.
                running.dropped_tokens.push(key_token);
            }
            State::Done(Ok(ref mut values)) => values.discard(key_token),
            State::Done(Err(..)) => {}
        }
    }
}
