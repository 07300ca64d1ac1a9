//! Bounded, stoppable delivery queue shared by async sessions and by consumers
//! that are read with `receive`.
//!
//! Producers (the transport receive task) suspend in [`DispatchChannel::enqueue`]
//! while the queue is full. Consumers suspend in [`DispatchChannel::dequeue`] while
//! it is empty or stopped. Closing wakes everyone.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::Message;
use crate::types::MessageDispatch;

struct Lanes {
    lanes: Vec<VecDeque<MessageDispatch>>,
    len: usize,
    running: bool,
    closed: bool,
}

impl Lanes {
    #[inline]
    fn lane_of(&self, d: &MessageDispatch) -> usize {
        if self.lanes.len() == 1 {
            0
        } else {
            (d.priority().min(Message::MAX_PRIORITY) as usize).min(self.lanes.len() - 1)
        }
    }

    #[inline]
    fn push_back(&mut self, d: MessageDispatch) {
        let lane = self.lane_of(&d);
        self.lanes[lane].push_back(d);
        self.len += 1;
    }

    #[inline]
    fn push_front(&mut self, d: MessageDispatch) {
        let lane = self.lane_of(&d);
        self.lanes[lane].push_front(d);
        self.len += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<MessageDispatch> {
        let d = self.lanes.iter_mut().rev().find_map(|lane| lane.pop_front());
        if d.is_some() {
            self.len -= 1;
        }
        d
    }

    #[inline]
    fn drain(&mut self) -> Vec<MessageDispatch> {
        let mut all = Vec::with_capacity(self.len);
        while let Some(d) = self.pop() {
            all.push(d);
        }
        all
    }
}

pub struct DispatchChannel {
    cap: usize,
    inner: Mutex<Lanes>,
    item_notify: Notify,
    space_notify: Notify,
}

impl DispatchChannel {
    /// `priority` selects ten lanes (highest priority first) instead of plain FIFO.
    pub fn new(cap: usize, priority: bool) -> Self {
        let lanes = if priority { Message::MAX_PRIORITY as usize + 1 } else { 1 };
        Self {
            cap: cap.max(1),
            inner: Mutex::new(Lanes {
                lanes: (0..lanes).map(|_| VecDeque::new()).collect(),
                len: 0,
                running: false,
                closed: false,
            }),
            item_notify: Notify::new(),
            space_notify: Notify::new(),
        }
    }

    /// Appends, waiting for space. Hands the dispatch back if the channel is closed.
    pub async fn enqueue(&self, d: MessageDispatch) -> Result<(), MessageDispatch> {
        loop {
            let space = self.space_notify.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(d);
                }
                if inner.len < self.cap {
                    inner.push_back(d);
                    drop(inner);
                    self.item_notify.notify_waiters();
                    return Ok(());
                }
            }
            space.await;
        }
    }

    /// Appends without waiting, past the bound if need be.
    pub fn enqueue_now(&self, d: MessageDispatch) -> Result<(), MessageDispatch> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(d);
            }
            inner.push_back(d);
        }
        self.item_notify.notify_waiters();
        Ok(())
    }

    /// Puts a dispatch back at the head of its lane, ignoring the bound.
    pub fn enqueue_first(&self, d: MessageDispatch) -> Result<(), MessageDispatch> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(d);
            }
            inner.push_front(d);
        }
        self.item_notify.notify_waiters();
        Ok(())
    }

    /// Next dispatch once the channel is running. `None` means closed.
    pub async fn dequeue(&self) -> Option<MessageDispatch> {
        loop {
            let item = self.item_notify.notified();
            tokio::pin!(item);
            item.as_mut().enable();
            let popped = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if inner.running {
                    inner.pop()
                } else {
                    None
                }
            };
            if let Some(d) = popped {
                self.space_notify.notify_waiters();
                return Some(d);
            }
            item.await;
        }
    }

    /// Pops without waiting, only while running.
    pub fn try_dequeue(&self) -> Option<MessageDispatch> {
        let popped = {
            let mut inner = self.inner.lock();
            if inner.closed || !inner.running {
                None
            } else {
                inner.pop()
            }
        };
        if popped.is_some() {
            self.space_notify.notify_waiters();
        }
        popped
    }

    pub fn start(&self) {
        self.inner.lock().running = true;
        self.item_notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.inner.lock().running = false;
    }

    /// Closes the channel and returns whatever was still queued.
    pub fn close(&self) -> Vec<MessageDispatch> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.running = false;
            inner.drain()
        };
        self.item_notify.notify_waiters();
        self.space_notify.notify_waiters();
        drained
    }

    /// Removes everything queued, keeping the channel open.
    pub fn clear(&self) -> Vec<MessageDispatch> {
        let drained = self.inner.lock().drain();
        self.space_notify.notify_waiters();
        drained
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionId, ConsumerId, SessionId};
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatch(body: &str, priority: u8) -> MessageDispatch {
        let cid = ConsumerId::new(&SessionId::new(&ConnectionId::new("c"), 1), 1);
        MessageDispatch::new(cid, Message::text(body).with_priority(priority))
    }

    fn body(d: &MessageDispatch) -> String {
        d.message.as_ref().and_then(|m| m.body_text()).unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn fifo_only_while_running() {
        let ch = DispatchChannel::new(10, false);
        ch.enqueue(dispatch("a", 1)).await.unwrap();
        ch.enqueue(dispatch("b", 9)).await.unwrap();
        assert!(ch.try_dequeue().is_none());
        ch.start();
        assert_eq!(body(&ch.dequeue().await.unwrap()), "a");
        assert_eq!(body(&ch.try_dequeue().unwrap()), "b");
        ch.stop();
        ch.enqueue(dispatch("c", 4)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), ch.dequeue()).await.is_err());
        ch.start();
        assert_eq!(body(&ch.dequeue().await.unwrap()), "c");
    }

    #[tokio::test]
    async fn priority_lanes() {
        let ch = DispatchChannel::new(10, true);
        ch.start();
        ch.enqueue(dispatch("low", 1)).await.unwrap();
        ch.enqueue(dispatch("high", 8)).await.unwrap();
        ch.enqueue(dispatch("high2", 8)).await.unwrap();
        ch.enqueue_first(dispatch("redelivered", 1)).unwrap();
        let order: Vec<_> = (0..4).map(|_| body(&ch.try_dequeue().unwrap())).collect();
        assert_eq!(order, vec!["high", "high2", "redelivered", "low"]);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let ch = Arc::new(DispatchChannel::new(1, false));
        ch.enqueue(dispatch("a", 4)).await.unwrap();
        let blocked = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.enqueue(dispatch("b", 4)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        ch.start();
        assert_eq!(body(&ch.dequeue().await.unwrap()), "a");
        assert!(tokio::time::timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap());
        assert_eq!(ch.len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_returns_leftovers() {
        let ch = Arc::new(DispatchChannel::new(1, false));
        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.dequeue().await.is_none() })
        };
        ch.enqueue(dispatch("a", 4)).await.unwrap();
        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.enqueue(dispatch("b", 4)).await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let leftovers = ch.close();
        assert_eq!(leftovers.len(), 1);
        assert!(tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap());
        assert!(tokio::time::timeout(Duration::from_secs(5), writer).await.unwrap().unwrap());
        assert!(ch.is_closed());
        assert!(ch.enqueue_first(dispatch("c", 4)).is_err());
    }

    #[tokio::test]
    async fn enqueue_now_ignores_the_bound() {
        let ch = DispatchChannel::new(1, false);
        ch.enqueue_now(dispatch("a", 4)).unwrap();
        ch.enqueue_now(dispatch("b", 4)).unwrap();
        ch.enqueue_first(dispatch("c", 4)).unwrap();
        assert_eq!(ch.len(), 3);
        ch.start();
        let order: Vec<_> = (0..3).map(|_| body(&ch.try_dequeue().unwrap())).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        ch.close();
        assert!(ch.enqueue_now(dispatch("d", 4)).is_err());
    }

    #[tokio::test]
    async fn clear_keeps_channel_open() {
        let ch = DispatchChannel::new(4, false);
        ch.enqueue(dispatch("a", 4)).await.unwrap();
        ch.enqueue(dispatch("b", 4)).await.unwrap();
        assert_eq!(ch.clear().len(), 2);
        assert!(ch.is_empty());
        assert!(!ch.is_closed());
        assert_eq!(ch.capacity(), 4);
    }
}
