//! Stream debouncing utilities

use futures::Stream;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// Extension trait to add debouncing to any Stream
pub trait DebounceExt: Stream {
    /// Emit an item only once the stream has been quiet for `duration`.
    ///
    /// Uses "latest-wins" semantics: a burst of items collapses into the last one,
    /// emitted `duration` after it arrived.
    fn debounce(self, duration: Duration) -> Debounce<Self>
    where
        Self: Sized,
    {
        Debounce::new(self, duration)
    }
}

impl<T: Stream> DebounceExt for T {}

pin_project! {
    /// A stream combinator that coalesces bursts
    pub struct Debounce<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        sleep: Sleep,
        duration: Duration,
        pending: Option<S::Item>,
        exhausted: bool,
    }
}

impl<S: Stream> Debounce<S> {
    /// Create a new debounced stream
    pub fn new(stream: S, duration: Duration) -> Self {
        Self { stream, sleep: sleep(duration), duration, pending: None, exhausted: false }
    }
}

impl<S: Stream> Stream for Debounce<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain everything ready, restarting the quiet period on each item
        while !*this.exhausted {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    *this.pending = Some(item);
                    this.sleep.as_mut().reset(Instant::now() + *this.duration);
                }
                Poll::Ready(None) => *this.exhausted = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            return if *this.exhausted { Poll::Ready(None) } else { Poll::Pending };
        }

        // Flush immediately once the source ends
        if *this.exhausted {
            return Poll::Ready(this.pending.take());
        }

        match this.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(this.pending.take()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_latest() {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(rx);
        let mut debounced = Box::pin(stream.debounce(Duration::from_millis(100)));

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        let started = Instant::now();
        assert_eq!(debounced.next().await, Some(3));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_items_pass_through() {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(rx);
        let mut debounced = Box::pin(stream.debounce(Duration::from_millis(100)));

        tx.send("network_on").unwrap();
        assert_eq!(debounced.next().await, Some("network_on"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send("protocol_error").unwrap();
        assert_eq!(debounced.next().await, Some("protocol_error"));
    }

    #[tokio::test(start_paused = true)]
    async fn items_within_window_restart_the_timer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(rx);
        let mut debounced = Box::pin(stream.debounce(Duration::from_millis(100)));

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
        });

        assert_eq!(debounced.next().await, Some(4));
        producer.await.unwrap();
        assert_eq!(debounced.next().await, None);
    }

    #[tokio::test]
    async fn end_of_stream_flushes_pending() {
        let debounced = futures::stream::iter(vec![1, 2, 3]).debounce(Duration::from_secs(60));
        let items: Vec<_> = debounced.collect().await;
        assert_eq!(items, vec![3]);
    }
}
