//! Supervised long-poll loop for human-agent output.

use crate::engine::EngineMsg;
use confab_wire::{ChatEvent, ChatTransport, PollRequest};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Retry pacing for the long-poll loop.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub floor: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            multiplier: 1.5,
            ceiling: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs = self.floor.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.ceiling.as_secs_f64()))
    }
}

/// Run long-poll sessions until cancelled.
///
/// Each iteration opens a session with the latest request parameters from
/// the watch channel, so cursor updates applied by the engine reach the next
/// poll. A session that completes normally resets the failure counter and
/// the next poll is issued immediately; any failure — transport, decode, or
/// a server error event inside the stream — waits out an exponentially
/// growing delay. Failures never reach observers.
pub(crate) async fn run(
    transport: Arc<dyn ChatTransport>,
    params: watch::Receiver<PollRequest>,
    mailbox: mpsc::WeakUnboundedSender<EngineMsg>,
    cancel: CancellationToken,
    backoff: BackoffConfig,
) {
    let mut failures: u32 = 0;
    loop {
        if cancel.is_cancelled() || mailbox.upgrade().is_none() {
            return;
        }
        let request = params.borrow().clone();
        match open_and_pump(transport.as_ref(), request, &mailbox, &cancel).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    return;
                }
                failures = 0;
                // Let the engine apply the completed session's updates
                // before the next request is built, so the freshest cursor
                // is carried.
                tokio::task::yield_now().await;
            }
            Err(reason) => {
                if cancel.is_cancelled() {
                    return;
                }
                let delay = backoff.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                tracing::debug!(%reason, ?delay, failures, "long-poll failed, backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Open one long-poll session and forward its events to the engine.
/// `Ok` means the session completed normally (or the loop is shutting
/// down); `Err` carries a description of the failure for the debug log.
async fn open_and_pump(
    transport: &dyn ChatTransport,
    request: PollRequest,
    mailbox: &mpsc::WeakUnboundedSender<EngineMsg>,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        opened = transport.poll(request, cancel.child_token()) => {
            opened.map_err(|e| e.to_string())?
        }
    };

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(ChatEvent::Error {
                user_visible_message,
            })) => {
                // Server-level failure inside the poll stream: uniformly
                // retryable, never surfaced.
                return Err(user_visible_message.unwrap_or_else(|| "server error".into()));
            }
            Some(Ok(event)) => {
                let Some(tx) = mailbox.upgrade() else {
                    return Ok(());
                };
                if tx.send(EngineMsg::PollUpdate(event)).is_err() {
                    return Ok(());
                }
            }
            Some(Err(e)) => return Err(e.to_string()),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use confab_wire::{Error, EventStream, SendRequest};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[test]
    fn test_delay_for_attempt() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2250));
        assert_eq!(backoff.delay_for_attempt(50), Duration::from_secs(60));
    }

    /// Scripted poll transport: each entry is one session (`Err` fails at
    /// open, `Ok(events)` streams them then completes). When the script runs
    /// dry the session stays open forever, like a held long-poll.
    struct ScriptedPolls {
        script: Mutex<VecDeque<Result<Vec<confab_wire::Result<ChatEvent>>, Error>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedPolls {
        fn new(
            script: Vec<Result<Vec<confab_wire::Result<ChatEvent>>, Error>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedPolls {
        async fn send(
            &self,
            _request: SendRequest,
            _cancel: CancellationToken,
        ) -> confab_wire::Result<EventStream> {
            unreachable!("the poll loop never sends");
        }

        async fn poll(
            &self,
            _request: PollRequest,
            _cancel: CancellationToken,
        ) -> confab_wire::Result<EventStream> {
            self.calls.lock().push(Instant::now());
            match self.script.lock().pop_front() {
                Some(Ok(events)) => Ok(Box::pin(futures::stream::iter(events))),
                Some(Err(e)) => Err(e),
                None => Ok(Box::pin(futures::stream::pending())),
            }
        }
    }

    fn start_loop(
        transport: Arc<ScriptedPolls>,
    ) -> (
        mpsc::UnboundedReceiver<EngineMsg>,
        mpsc::UnboundedSender<EngineMsg>,
        watch::Sender<PollRequest>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (params_tx, params_rx) = watch::channel(PollRequest::default());
        let cancel = CancellationToken::new();
        tokio::spawn(run(
            transport,
            params_rx,
            tx.downgrade(),
            cancel.clone(),
            BackoffConfig::default(),
        ));
        (rx, tx, params_tx, cancel)
    }

    async fn wait_for_calls(transport: &ScriptedPolls, count: usize) {
        for _ in 0..2000 {
            if transport.call_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "poll loop made only {} of {} expected calls",
            transport.call_count(),
            count
        );
    }

    fn assert_gap_approx(gap: Duration, expected_millis: u64) {
        let diff = gap.as_millis().abs_diff(u128::from(expected_millis));
        assert!(diff <= 100, "gap {:?}, expected ~{}ms", gap, expected_millis);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_and_reset() {
        // Three failures, one success, then one more failure.
        let transport = ScriptedPolls::new(vec![
            Err(Error::Status(500)),
            Err(Error::Status(500)),
            Err(Error::Status(500)),
            Ok(vec![]),
            Err(Error::Status(500)),
        ]);
        let (_rx, _tx, _params, cancel) = start_loop(transport.clone());

        wait_for_calls(&transport, 6).await;
        cancel.cancel();

        let calls = transport.calls.lock().clone();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();

        assert_gap_approx(gaps[0], 1000);
        assert_gap_approx(gaps[1], 1500);
        assert_gap_approx(gaps[2], 2250);
        // Success: next poll is immediate and the failure counter resets.
        assert_gap_approx(gaps[3], 0);
        assert_gap_approx(gaps[4], 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_forwarded_to_engine() {
        let transport = ScriptedPolls::new(vec![Ok(vec![Ok(ChatEvent::LivePollCursor {
            cursor: serde_json::json!("c-1"),
        })])]);
        let (mut rx, _tx, _params, cancel) = start_loop(transport.clone());

        wait_for_calls(&transport, 2).await;
        cancel.cancel();

        match rx.recv().await {
            Some(EngineMsg::PollUpdate(ChatEvent::LivePollCursor { cursor })) => {
                assert_eq!(cursor, serde_json::json!("c-1"));
            }
            _ => panic!("expected a forwarded cursor update"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_event_retries_without_forwarding() {
        let transport = ScriptedPolls::new(vec![Ok(vec![Ok(ChatEvent::Error {
            user_visible_message: Some("agents are busy".into()),
        })])]);
        let (mut rx, _tx, _params, cancel) = start_loop(transport.clone());

        // The error event counts as a failed iteration: the next poll only
        // happens after the backoff floor.
        wait_for_calls(&transport, 2).await;
        cancel.cancel();

        let calls = transport.calls.lock().clone();
        assert_gap_approx(calls[1] - calls[0], 1000);
        assert!(rx.try_recv().is_err(), "poll failures must not reach the engine");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_without_retry() {
        let transport = ScriptedPolls::new(vec![]);
        let (mut rx, _tx, _params, cancel) = start_loop(transport.clone());

        wait_for_calls(&transport, 1).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.call_count(), 1);
        assert!(rx.try_recv().is_err());
    }
}
