use futures::stream::{self, Stream};
use std::pin::Pin;
use std::time::Duration;

pub type TimeoutSignal = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// One-shot timer source.
///
/// With a duration, yields a single `()` once it elapses and then ends.
/// Without one, never yields and never ends. Must be created inside a Tokio
/// runtime; the clock starts at creation.
pub fn timeout_signal(duration: Option<Duration>) -> TimeoutSignal {
    match duration {
        Some(duration) => Box::pin(stream::once(tokio::time::sleep(duration))),
        None => Box::pin(stream::pending()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Instant;

    #[tokio::test]
    async fn test_fires_once_then_ends() {
        let start = Instant::now();
        let mut signal = timeout_signal(Some(Duration::from_millis(50)));

        assert_eq!(signal.next().await, Some(()));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(signal.next().await, None);
    }

    #[tokio::test]
    async fn test_unconfigured_never_fires() {
        let mut signal = timeout_signal(None);
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.next()).await;
        assert!(waited.is_err());
    }
}
