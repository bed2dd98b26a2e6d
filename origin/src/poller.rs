//! Periodic status polling
//!
//! One request per tick, rotating through the subsystems so the device
//! never sees a burst of status queries.

use crate::dispatcher::Dispatcher;
use crate::protocol::{commands, destinations};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Round-robin over the status requests sent by the poller
#[derive(Debug, Clone, Default)]
pub struct StatusRotation {
    counter: usize,
}

impl StatusRotation {
    const REQUESTS: [(&'static str, &'static str); 3] = [
        (commands::GET_STATUS, destinations::MOUNT),
        (commands::GET_STATUS, destinations::ENVIRONMENT),
        (commands::GET_CAPTURE_PARAMETERS, destinations::CAMERA),
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// `(command, destination)` for the next tick
    pub fn next_request(&mut self) -> (&'static str, &'static str) {
        let request = Self::REQUESTS[self.counter % Self::REQUESTS.len()];
        self.counter = self.counter.wrapping_add(1);
        request
    }
}

/// Poll until the transport drops
pub(crate) async fn poll_task(dispatcher: Arc<Dispatcher>, period: Duration) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut rotation = StatusRotation::new();
    loop {
        ticker.tick().await;
        if !dispatcher.is_connected() {
            tracing::debug!("Status poller stopping, transport is down");
            break;
        }

        let (command, destination) = rotation.next_request();
        if let Err(e) = dispatcher
            .send_command(command, destination, Value::Null)
            .await
        {
            tracing::warn!("Status poll {} to {} failed: {}", command, destination, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    #[test]
    fn test_rotation_order() {
        let mut rotation = StatusRotation::new();
        let seen: Vec<_> = (0..6).map(|_| rotation.next_request()).collect();
        assert_eq!(seen[0], ("GetStatus", "Mount"));
        assert_eq!(seen[1], ("GetStatus", "Environment"));
        assert_eq!(seen[2], ("GetCaptureParameters", "Camera"));
        assert_eq!(&seen[3..], &seen[..3]);
    }

    #[tokio::test]
    async fn test_poll_task_sends_one_request_per_tick() {
        let dispatcher = Arc::new(Dispatcher::new(16));
        let (tx, mut rx) = mpsc::channel(16);
        dispatcher.attach(tx).await;

        let handle = tokio::spawn(poll_task(dispatcher.clone(), Duration::from_millis(20)));

        let mut sent = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                Message::Text(text) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    sent.push((
                        v["Command"].as_str().unwrap().to_string(),
                        v["Destination"].as_str().unwrap().to_string(),
                    ));
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(sent[0], ("GetStatus".to_string(), "Mount".to_string()));
        assert_eq!(sent[1], ("GetStatus".to_string(), "Environment".to_string()));
        assert_eq!(
            sent[2],
            ("GetCaptureParameters".to_string(), "Camera".to_string())
        );

        dispatcher.detach().await;
        handle.await.unwrap();
    }
}
