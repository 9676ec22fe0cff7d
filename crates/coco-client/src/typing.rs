//! Outbound typing indicator debouncing.
//!
//! Keystrokes are reduced to a handful of frames: `true` on the first
//! keystroke (and again every `refresh` while typing continues), a single
//! `false` once the input has been idle for `idle`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Where debounced typing changes go.
#[async_trait]
pub trait TypingPublisher: Send + Sync {
    async fn publish_typing(&self, is_typing: bool);
}

enum Signal {
    Keystroke,
    Stop,
}

/// Debounces typing activity for one channel.
///
/// Dropping the debouncer sends a final `false` if typing was reported.
pub struct TypingDebouncer {
    tx: mpsc::UnboundedSender<Signal>,
}

impl TypingDebouncer {
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(publisher: Arc<dyn TypingPublisher>, idle: Duration, refresh: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(publisher, rx, idle, refresh));
        Self { tx }
    }

    /// Record a keystroke.
    pub fn keystroke(&self) {
        let _ = self.tx.send(Signal::Keystroke);
    }

    /// Typing ended (message sent or input cleared).
    pub fn stop(&self) {
        let _ = self.tx.send(Signal::Stop);
    }
}

async fn run(
    publisher: Arc<dyn TypingPublisher>,
    mut rx: mpsc::UnboundedReceiver<Signal>,
    idle: Duration,
    refresh: Duration,
) {
    let mut typing = false;
    let mut last_true = Instant::now();
    let mut idle_deadline = Instant::now();

    loop {
        let signal = if typing {
            tokio::select! {
                signal = rx.recv() => signal,
                () = tokio::time::sleep_until(idle_deadline) => {
                    trace!("Typing idle");
                    publisher.publish_typing(false).await;
                    typing = false;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match signal {
            Some(Signal::Keystroke) => {
                let now = Instant::now();
                idle_deadline = now + idle;
                if !typing || now.duration_since(last_true) >= refresh {
                    publisher.publish_typing(true).await;
                    last_true = now;
                    typing = true;
                }
            }
            Some(Signal::Stop) => {
                if typing {
                    publisher.publish_typing(false).await;
                    typing = false;
                }
            }
            None => {
                if typing {
                    publisher.publish_typing(false).await;
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(bool, Instant)>>,
    }

    impl Recorder {
        fn values(&self) -> Vec<bool> {
            self.sent.lock().unwrap().iter().map(|(v, _)| *v).collect()
        }
    }

    #[async_trait]
    impl TypingPublisher for Recorder {
        async fn publish_typing(&self, is_typing: bool) {
            self.sent.lock().unwrap().push((is_typing, Instant::now()));
        }
    }

    fn debouncer(recorder: &Arc<Recorder>) -> TypingDebouncer {
        TypingDebouncer::new(
            recorder.clone(),
            Duration::from_secs(1),
            Duration::from_secs(3),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_sends_true_then_single_false() {
        let recorder = Arc::new(Recorder::default());
        let typing = debouncer(&recorder);

        for _ in 0..5 {
            typing.keystroke();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(recorder.values(), vec![true]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.values(), vec![true, false]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.values(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_typing_refreshes() {
        let recorder = Arc::new(Recorder::default());
        let typing = debouncer(&recorder);

        // Keystroke every 500ms for 4s.
        for _ in 0..8 {
            typing.keystroke();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(recorder.values(), vec![true, true]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.values(), vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sends_false_immediately() {
        let recorder = Arc::new(Recorder::default());
        let typing = debouncer(&recorder);

        typing.keystroke();
        settle().await;
        let start = Instant::now();
        typing.stop();
        settle().await;

        assert_eq!(recorder.values(), vec![true, false]);
        let sent = recorder.sent.lock().unwrap();
        assert!(sent[1].1.duration_since(start) < Duration::from_millis(10));
        drop(sent);

        // Stop while idle sends nothing.
        typing.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.values(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_sends_final_false() {
        let recorder = Arc::new(Recorder::default());
        let typing = debouncer(&recorder);

        typing.keystroke();
        settle().await;
        drop(typing);
        settle().await;

        assert_eq!(recorder.values(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_while_idle_sends_nothing() {
        let recorder = Arc::new(Recorder::default());
        let typing = debouncer(&recorder);
        drop(typing);
        settle().await;
        assert!(recorder.values().is_empty());
    }
}
