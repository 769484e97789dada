//! Wakers and futures for stepping batches by hand.
#![allow(dead_code)]

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::FutureExt;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// A waker for polling futures by hand when nobody cares about wakeups.
pub fn noop_waker() -> Waker {
    NoOpWaker.into_waker()
}

/// Remembers whether it was woken since the last reset.
#[derive(Debug, Clone, Default, IntoWaker)]
struct Flag {
    raised: Arc<AtomicBool>,
}

impl WakeRef for Flag {
    fn wake_by_ref(&self) {
        self.raised.store(true, Ordering::SeqCst)
    }
}

impl Wake for Flag {}

/// Returns Pending (waking itself) the given number of times, then Ready.
/// Awaited inside a bulk fetch, it keeps the batch in the running state for
/// that many polls.
#[derive(Debug, Clone)]
pub struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    pub fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A future with its own waker, so a test can see which futures a batch
/// woke up.
pub struct Task<F: Future + Unpin> {
    fut: F,
    flag: Flag,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    pub fn new(fut: F) -> Self {
        let flag = Flag::default();

        Task {
            fut,
            waker: flag.clone().into_waker(),
            flag,
        }
    }

    /// Poll the future, forgetting any earlier wakeup.
    pub fn poll(&mut self) -> Poll<F::Output> {
        self.flag.raised.store(false, Ordering::SeqCst);
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    pub fn is_signaled(&self) -> bool {
        self.flag.raised.load(Ordering::SeqCst)
    }
}
