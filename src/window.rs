//! Coalescing windows: how long a batch keeps accepting keys before it is
//! dispatched.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use futures_timer::Delay;

/// The span during which registrations against one coordinator are merged
/// into a single bulk fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    /// Close the window at the end of the current execution turn: the
    /// driving future yields to the executor once, so that every sibling
    /// future that is already runnable gets polled (and registers its key)
    /// before the batch is dispatched. This is the right choice for a
    /// single-task executor such as a GraphQL engine resolving a list.
    #[default]
    Yield,

    /// Close the window after a fixed delay, starting from the first key.
    /// Use this when keys arrive from independent tasks or threads.
    Delay(Duration),
}

impl Window {
    pub(crate) fn open(&self) -> BoxFuture<'static, ()> {
        match *self {
            Window::Yield => YieldOnce::default().boxed(),
            Window::Delay(duration) => Delay::new(duration).boxed(),
        }
    }
}

/// Returns Pending (and wakes itself) the first time it is polled, and
/// Ready after that.
#[derive(Debug, Default)]
struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
