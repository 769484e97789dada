use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing the wakers of every caller suspended on a
/// single batch. Only one task needs to actually do the work of driving the
/// batch forward (polling the coalescing window, then the bulk fetch); the
/// others are parked until the results are in, and one of them takes over
/// if the driver is dropped.
///
/// Wakers are added to the set with a token, which is held by the future
/// that owns the waker. The token is used to:
/// - replace the waker on subsequent polls
/// - claim the driving role
/// - discard the waker from the set.
///
/// The driving waker is claimed explicitly. The first future that polls the
/// batch claims it, and keeps it until it is dropped or the batch completes.
/// Keeping a single driver is what makes the coalescing window work: a
/// window that completes on its second poll must only be polled by the one
/// future that started it, otherwise the very next sibling would close it.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. WakerSets are short-lived, so
    // there's no chance of running out of these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Store the waker for the future holding `slot`, and return its token.
    /// If the slot is empty, the waker is added and a new token is put in
    /// the slot; otherwise the existing waker is updated in place with
    /// clone_from, because it usually is the same waker.
    pub(crate) fn upsert<'a>(&mut self, slot: &'a mut Option<Token>, waker: &Waker) -> &'a Token {
        let token = match slot.take() {
            Some(token) => {
                match self.wakers.get_mut(&token) {
                    Some(existing) => existing.clone_from(waker),
                    None => {
                        self.wakers.insert(token.duplicate(), waker.clone());
                    }
                }
                token
            }
            None => {
                let token = Token(self.next_token);
                self.next_token = self.next_token.saturating_add(1);
                self.wakers.insert(token.duplicate(), waker.clone());
                token
            }
        };

        slot.insert(token)
    }

    /// Try to make this token the driving waker. Succeeds if there is no
    /// driver yet, or if this token is already the driver.
    pub(crate) fn claim_driver(&mut self, token: &Token) -> bool {
        match self.driving_waker {
            Some(ref driver) => driver == token,
            None => {
                self.driving_waker = Some(token.duplicate());
                true
            }
        }
    }

    /// Make this token the driving waker, unconditionally. Used when the
    /// batch can make progress without waiting for the driver (the key limit
    /// closed the window early).
    pub(crate) fn take_over(&mut self, token: &Token) {
        self.driving_waker = Some(token.duplicate());
    }

    /// Wake the driving waker, if any, so that it re-polls the batch.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// We create a new driving waker immediately because if a series of drops
    /// happen at the same time we need to ensure that at least one non-dropped
    /// waker is awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((token, waker)) => {
                    self.driving_waker = Some(token.duplicate());
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake every waker except the one associated with this token. Used by
    /// the future that completed the batch, which doesn't need a wakeup.
    pub(crate) fn discard_wake_all(mut self, token: &Token) {
        self.wakers.remove(token);
        self.wake_all()
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
