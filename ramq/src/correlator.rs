//! Pairs outbound requests with the broker's responses.
//!
//! Each request owns a oneshot slot in a table keyed by command id. The table lock
//! is held only to insert or remove a slot, the wait itself is per request. A slot
//! is removed exactly once: by the matching response, by the caller when it stops
//! waiting (timeout or cancellation) or by [`ResponseCorrelator::dispose`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CmsError, Result};
use crate::transport::Transport;
use crate::types::{Command, CommandId, Frame, HashMap, Response};

type Slot = oneshot::Sender<Result<Response>>;

#[derive(Default)]
struct Requests {
    slots: HashMap<CommandId, Slot>,
    prior_error: Option<CmsError>,
}

pub struct ResponseCorrelator {
    next_command_id: AtomicU32,
    requests: Mutex<Requests>,
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self { next_command_id: AtomicU32::new(1), requests: Mutex::new(Requests::default()) }
    }

    #[inline]
    pub fn next_command_id(&self) -> CommandId {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends `command` without registering a slot.
    pub async fn oneway(&self, transport: &dyn Transport, command: Command) -> Result<()> {
        if let Some(err) = self.prior_error() {
            return Err(err);
        }
        let frame = Frame { command_id: self.next_command_id(), response_required: false, command };
        transport.oneway(frame).await
    }

    /// Sends `command` and waits for its response. A zero `timeout` waits forever.
    pub async fn request(&self, transport: &dyn Transport, command: Command, timeout: Duration) -> Result<Response> {
        let command_id = self.next_command_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut requests = self.requests.lock();
            if let Some(err) = requests.prior_error.as_ref() {
                return Err(err.clone());
            }
            requests.slots.insert(command_id, tx);
        }

        // Runs on every exit path, including the caller dropping this future.
        let _slot = scopeguard::guard(command_id, |id| {
            self.requests.lock().slots.remove(&id);
        });

        transport.oneway(Frame { command_id, response_required: true, command }).await?;

        let reply = if timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    log::debug!("request {} timed out after {:?}", command_id, timeout);
                    return Err(CmsError::RequestTimeout { command_id, timeout });
                }
            }
        };

        match reply {
            Ok(res) => res,
            Err(_) => Err(self.prior_error().unwrap_or(CmsError::Closed)),
        }
    }

    /// Completes the pending request matching `response`. Returns `false` when no
    /// request is waiting for it (late, duplicate or unknown).
    pub fn on_response(&self, response: Response) -> bool {
        let slot = self.requests.lock().slots.remove(&response.correlation_id);
        match slot {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    log::debug!("requester went away before its response arrived");
                }
                true
            }
            None => {
                log::debug!("no pending request for response {}, dropped", response.correlation_id);
                false
            }
        }
    }

    /// Fails every pending request with `error` and rejects new ones. The first
    /// error given is kept.
    pub fn dispose(&self, error: CmsError) {
        let (slots, error) = {
            let mut requests = self.requests.lock();
            let error = requests.prior_error.get_or_insert(error).clone();
            (std::mem::take(&mut requests.slots), error)
        };
        if !slots.is_empty() {
            log::debug!("failing {} pending requests, {}", slots.len(), error);
        }
        for (_, tx) in slots {
            let _ = tx.send(Err(error.clone()));
        }
    }

    #[inline]
    pub fn prior_error(&self) -> Option<CmsError> {
        self.requests.lock().prior_error.clone()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.requests.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn timeout_removes_slot_and_late_reply_is_dropped() {
        let transport = MockTransport::silent();
        let correlator = ResponseCorrelator::new();

        let start = Instant::now();
        let err = correlator.request(&transport, Command::KeepAlive, Duration::from_millis(50)).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        let command_id = match err {
            CmsError::RequestTimeout { command_id, .. } => command_id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.on_response(Response::ok(command_id)));
    }

    #[tokio::test]
    async fn out_of_order_responses_match_by_id() {
        let transport = Arc::new(MockTransport::silent());
        let correlator = Arc::new(ResponseCorrelator::new());

        let t1 = {
            let (c, t) = (correlator.clone(), transport.clone());
            tokio::spawn(async move { c.request(t.as_ref(), Command::KeepAlive, Duration::ZERO).await })
        };
        let t2 = {
            let (c, t) = (correlator.clone(), transport.clone());
            tokio::spawn(async move { c.request(t.as_ref(), Command::ShutdownInfo, Duration::ZERO).await })
        };
        assert!(transport.wait_for_sent(2, |_| true, Duration::from_secs(5)).await);

        let frames = transport.sent_frames();
        let id_of = |pred: fn(&Command) -> bool| frames.iter().find(|f| pred(&f.command)).map(|f| f.command_id).unwrap();
        let keep_alive = id_of(|c| matches!(c, Command::KeepAlive));
        let shutdown = id_of(|c| matches!(c, Command::ShutdownInfo));

        assert!(correlator.on_response(Response::ok(shutdown)));
        assert!(correlator.on_response(Response::ok(keep_alive)));
        assert_eq!(t1.await.unwrap().unwrap().correlation_id, keep_alive);
        assert_eq!(t2.await.unwrap().unwrap().correlation_id, shutdown);
    }

    #[tokio::test]
    async fn dispose_wakes_waiters_and_rejects_new_requests() {
        let transport = Arc::new(MockTransport::silent());
        let correlator = Arc::new(ResponseCorrelator::new());

        let waiter = {
            let (c, t) = (correlator.clone(), transport.clone());
            tokio::spawn(async move { c.request(t.as_ref(), Command::KeepAlive, Duration::ZERO).await })
        };
        assert!(transport.wait_for_sent(1, |_| true, Duration::from_secs(5)).await);

        correlator.dispose(CmsError::Transport("reset".into()));
        correlator.dispose(CmsError::Closed);
        assert!(matches!(waiter.await.unwrap(), Err(CmsError::Transport(_))));
        assert!(matches!(
            correlator.request(transport.as_ref(), Command::KeepAlive, Duration::ZERO).await,
            Err(CmsError::Transport(_))
        ));
        assert!(correlator.oneway(transport.as_ref(), Command::KeepAlive).await.is_err());
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn send_failure_releases_slot() {
        let transport = MockTransport::silent();
        transport.fail_sends(Some("broken pipe"));
        let correlator = ResponseCorrelator::new();
        assert!(correlator.request(&transport, Command::KeepAlive, Duration::ZERO).await.is_err());
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn command_ids_start_at_one() {
        let c = ResponseCorrelator::new();
        assert_eq!(c.next_command_id(), 1);
        assert_eq!(c.next_command_id(), 2);
    }
}
