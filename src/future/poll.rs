//! `std::future::Future` adapter for eventual values.
//!
//! Polling registers the task waker as a finished-observer, so eventual
//! values can be awaited from async code without this library taking any
//! runtime dependency. The output is the terminal [`Completion`].

use std::pin::Pin;
use std::task::{Context, Poll};

use crate::future::Eventual;
use crate::types::Completion;

impl<T, E> std::future::Future for Eventual<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Completion<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Ok(completion) = self.join_now() {
            return Poll::Ready(completion);
        }
        let waker = cx.waker().clone();
        self.on_finished(move || waker.wake());
        // A completion that raced the registration dispatched the waker
        // already; re-checking keeps the fast path loss-free.
        match self.join_now() {
            Ok(completion) => Poll::Ready(completion),
            Err(_) => Poll::Pending,
        }
    }
}
