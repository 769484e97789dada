//! Data structures for passing keys into a bulk fetch, and matching the
//! fetched records back to the keys that asked for them.

use std::collections::hash_map::{Entry, HashMap};
use std::convert::Infallible;
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use indexmap::IndexMap;

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// What a singular match does when the fetch returns more than one record
/// for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDuplicate {
    /// Keep the first record encountered and discard the rest.
    #[default]
    Ignore,

    /// Keep the last record encountered.
    Replace,
}

/// A set of keys passed into a batch function. Use the `keys` method
/// to get the set of keys, all of which will be unique, so that you can
/// execute your request. Then, use one of the `into_values` or `match_*`
/// methods to transform your response data into a ValueSet, which is handed
/// back to the coordinator.
#[derive(Debug)]
pub struct KeySet<Key: Eq + Hash> {
    // Each key is associated with two pieces of information:
    //
    // - a Token, which is held by each future. The token is uniquely associated
    // with a key for a given KeySet.
    // - A count of how many futures are requesting the same key, *past the
    // first*; in other words, the number of times the value will need to be
    // cloned.
    //
    // Tokens are created from the len of keys, so keys are never removed from
    // this table; a key whose futures were all dropped loses its entry in
    // `tokens` instead. The IndexMap preserves first-registration order.
    keys: IndexMap<Key, Token>,
    tokens: HashMap<Token, usize>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: IndexMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. This token can then be used to pull a value out of the ValueSet
    /// associated with the key.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let new_token = Token(NonZeroUsize::MIN.saturating_add(self.keys.len()));
        let token = self.keys.entry(key).or_insert(new_token).duplicate();
        self.tokens
            .entry(token.duplicate())
            .and_modify(|count| *count += 1)
            .or_insert(0);

        token
    }

    pub(crate) fn discard_token(&mut self, token: Token) {
        match self.tokens.entry(token) {
            Entry::Occupied(entry) if *entry.get() == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
            }
            Entry::Vacant(_) => panic!("Attempted to remove nonexistent token from KeySet"),
        }
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when the state transitions out
    /// of Accumulating.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
            tokens: mem::take(&mut self.tokens),
        }
    }

    fn live_token(&self, key: &Key) -> Option<&Token> {
        self.keys
            .get(key)
            .filter(|token| self.tokens.contains_key(*token))
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the configured max_keys of the related BatchRules
    /// - In the order they were first registered
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        let tokens = &self.tokens;

        self.keys
            .iter()
            .filter(move |(_key, token)| tokens.contains_key(*token))
            .map(|(key, _token)| key)
    }

    /// After you've completed your request, use this method to pair each value
    /// in your result with its key.
    pub fn into_values<Value>(self, mut get_value: impl FnMut(&Key) -> Value) -> ValueSet<Value> {
        match self.try_into_values(move |key| -> Result<Value, Infallible> { Ok(get_value(key)) }) {
            Ok(values) => values,
            Err(never) => match never {},
        }
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error.
    pub fn try_into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value>, Error> {
        let KeySet { keys, mut tokens } = self;

        let values = keys
            .into_iter()
            .filter_map(move |(key, token)| {
                let count = tokens.remove(&token)?;
                Some((key, token, count))
            })
            .map(move |(key, token, count)| {
                let value = get_value(&key)?;
                Ok((token, ValueSetEntry { value, count }))
            })
            .collect::<Result<_, Error>>()?;

        Ok(ValueSet { values })
    }

    /// Match each record to at most one key by comparing the record's
    /// correlation key against the registered keys. Keys with no matching
    /// record get `None`; records whose key was never requested are dropped.
    pub fn match_one<Record>(
        self,
        on_duplicate: OnDuplicate,
        records: impl IntoIterator<Item = Record>,
        mut key_of: impl FnMut(&Record) -> Key,
    ) -> ValueSet<Option<Record>> {
        let mut matched: HashMap<Token, Record> = HashMap::new();

        for record in records {
            let token = match self.live_token(&key_of(&record)) {
                Some(token) => token.duplicate(),
                None => continue,
            };

            match matched.entry(token) {
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
                Entry::Occupied(mut entry) => {
                    if on_duplicate == OnDuplicate::Replace {
                        entry.insert(record);
                    }
                }
            }
        }

        self.into_values_by_token(|token| matched.remove(token))
    }

    /// Group records by their correlation key. Every key gets a (possibly
    /// empty) Vec, in the order the records were returned by the fetch.
    pub fn match_many<Record>(
        self,
        records: impl IntoIterator<Item = Record>,
        mut key_of: impl FnMut(&Record) -> Key,
    ) -> ValueSet<Vec<Record>> {
        let mut grouped: HashMap<Token, Vec<Record>> = HashMap::new();

        for record in records {
            if let Some(token) = self.live_token(&key_of(&record)) {
                grouped.entry(token.duplicate()).or_default().push(record);
            }
        }

        self.into_values_by_token(|token| grouped.remove(token).unwrap_or_default())
    }

    fn into_values_by_token<Value>(
        self,
        mut get_value: impl FnMut(&Token) -> Value,
    ) -> ValueSet<Value> {
        let values = self
            .tokens
            .into_iter()
            .map(|(token, count)| {
                let value = get_value(&token);
                (token, ValueSetEntry { value, count })
            })
            .collect();

        ValueSet { values }
    }
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    /// Clone the unique keys, in registration order, into a Vec. This is the
    /// shape most bulk queries (`WHERE id IN (...)`) want.
    pub fn to_vec(&self) -> Vec<Key> {
        self.keys().cloned().collect()
    }

    /// Live keys paired with their tokens, used to remember which key each
    /// token stood for once the KeySet has been handed to the batch function.
    pub(crate) fn snapshot(&self) -> HashMap<Key, Token> {
        self.keys
            .iter()
            .filter(|(_key, token)| self.tokens.contains_key(*token))
            .map(|(key, token)| (key.clone(), token.duplicate()))
            .collect()
    }
}

#[derive(Debug)]
struct ValueSetEntry<Value> {
    count: usize,
    value: Value,
}

/// A value set is an opaque data structure that contains the result of a batch
/// operation. It can only be created from a [`KeySet`], and is used by the
/// coordinator to distribute the values to the correct waiting futures.
#[derive(Debug)]
pub struct ValueSet<Value> {
    values: HashMap<Token, ValueSetEntry<Value>>,
}

impl<Value> ValueSet<Value> {
    /// Discard a token associated with this ValueSet without getting the
    /// value. No-op if the token isn't present.
    pub(crate) fn discard(&mut self, token: Token) {
        match self.values.entry(token) {
            Entry::Vacant(..) => {}
            Entry::Occupied(entry) if entry.get().count == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().count -= 1;
            }
        }
    }

    /// Register one more future interested in the value for this token. Used
    /// when a future joins a batch that is already running.
    pub(crate) fn claim(&mut self, token: &Token) {
        if let Some(entry) = self.values.get_mut(token) {
            entry.count += 1;
        }
    }

    pub(crate) fn peek(&self, token: &Token) -> Option<&Value> {
        self.values.get(token).map(|entry| &entry.value)
    }

    /// The number of distinct keys that still have a value waiting.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<Value: Clone> ValueSet<Value> {
    /// Take a value associated with a token out of this ValueSet. If the
    /// count of this token is > 0, the value is cloned.
    pub(crate) fn take(&mut self, token: &Token) -> Option<Value> {
        let entry = self.values.get_mut(token)?;
        if entry.count > 0 {
            entry.count -= 1;
            return Some(entry.value.clone());
        }

        self.values.remove(token).map(|entry| entry.value)
    }
}
