//! In-process queue transport.
//!
//! Every destination is a FIFO queue shared by all of its subscribers
//! (competing consumers). A rejected delivery with `requeue` goes back to the
//! front of the queue. Faults can be injected for publish and ack calls.

use crate::messaging::envelope::Headers;
use crate::messaging::error::{TransportError, TransportResult};
use crate::messaging::transport::{
    Acknowledger, BrokerTransport, Delivery, DeliveryStream, TransportSubscribeOptions,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: Headers,
    delivery_count: u32,
}

#[derive(Default)]
struct Queue {
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl Queue {
    fn push_back(&self, message: StoredMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.messages.lock().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        self.messages.lock().pop_front()
    }
}

#[derive(Default)]
struct Faults {
    publish_failures: VecDeque<TransportError>,
    persistent_publish_failure: Option<TransportError>,
    ack_failures: usize,
}

#[derive(Default)]
struct Inner {
    queues: DashMap<String, Arc<Queue>>,
    faults: Mutex<Faults>,
    closed: AtomicBool,
    publish_attempts: AtomicU64,
    acks: AtomicU64,
    rejects: AtomicU64,
}

impl Inner {
    fn queue(&self, destination: &str) -> Arc<Queue> {
        self.queues
            .entry(destination.to_string())
            .or_default()
            .clone()
    }
}

/// Queue-semantics transport living entirely in memory
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with `error`
    pub fn fail_next_publishes(&self, count: usize, error: TransportError) {
        let mut faults = self.inner.faults.lock();
        for _ in 0..count {
            faults.publish_failures.push_back(error.clone());
        }
    }

    /// Fail every publish with `error` until cleared with `None`
    pub fn set_publish_failure(&self, error: Option<TransportError>) {
        self.inner.faults.lock().persistent_publish_failure = error;
    }

    /// Fail the next `count` ack or reject calls
    pub fn fail_next_acks(&self, count: usize) {
        self.inner.faults.lock().ack_failures += count;
    }

    /// Messages currently waiting in a destination's queue
    pub fn queue_depth(&self, destination: &str) -> usize {
        self.inner
            .queues
            .get(destination)
            .map(|queue| queue.messages.lock().len())
            .unwrap_or(0)
    }

    /// Headers of the messages waiting in a destination's queue, oldest first
    pub fn queued_headers(&self, destination: &str) -> Vec<Headers> {
        self.inner
            .queues
            .get(destination)
            .map(|queue| {
                queue
                    .messages
                    .lock()
                    .iter()
                    .map(|message| message.headers.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Publish calls that reached the transport, failed ones included
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> u64 {
        self.inner.acks.load(Ordering::SeqCst)
    }

    pub fn reject_count(&self) -> u64 {
        self.inner.rejects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn take_ack_fault(&self) -> TransportResult<()> {
        let mut faults = self.inner.faults.lock();
        if faults.ack_failures > 0 {
            faults.ack_failures -= 1;
            return Err(TransportError::AckFailed("injected ack failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn publish_raw(
        &self,
        destination: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> TransportResult<()> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        {
            let mut faults = self.inner.faults.lock();
            if let Some(error) = faults.publish_failures.pop_front() {
                return Err(error);
            }
            if let Some(error) = &faults.persistent_publish_failure {
                return Err(error.clone());
            }
        }

        self.inner.queue(destination).push_back(StoredMessage {
            payload: payload.to_vec(),
            headers: headers.clone(),
            delivery_count: 0,
        });
        debug!(destination, size = payload.len(), "Enqueued message");
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        _options: &TransportSubscribeOptions,
    ) -> TransportResult<Box<dyn DeliveryStream>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        Ok(Box::new(InMemoryDeliveryStream {
            transport: self.clone(),
            queue: self.inner.queue(destination),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        for queue in self.inner.queues.iter() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

struct InMemoryDeliveryStream {
    transport: InMemoryTransport,
    queue: Arc<Queue>,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next_delivery(&mut self) -> TransportResult<Option<Delivery>> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.transport.is_closed() {
                return Ok(None);
            }

            if let Some(message) = self.queue.pop() {
                let acknowledger = Arc::new(InMemoryAcknowledger {
                    transport: self.transport.clone(),
                    queue: self.queue.clone(),
                    message: Mutex::new(Some(message.clone())),
                });
                return Ok(Some(Delivery::new(
                    message.payload,
                    message.headers,
                    message.delivery_count,
                    acknowledger,
                )));
            }

            notified.await;
        }
    }
}

struct InMemoryAcknowledger {
    transport: InMemoryTransport,
    queue: Arc<Queue>,
    /// Taken on the first settle; later calls are no-ops
    message: Mutex<Option<StoredMessage>>,
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self) -> TransportResult<()> {
        self.transport.take_ack_fault()?;
        if self.message.lock().take().is_some() {
            self.transport.inner.acks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> TransportResult<()> {
        self.transport.take_ack_fault()?;
        let Some(mut message) = self.message.lock().take() else {
            return Ok(());
        };

        self.transport.inner.rejects.fetch_add(1, Ordering::SeqCst);
        if requeue && !self.transport.is_closed() {
            message.delivery_count += 1;
            self.queue.push_front(message);
        }
        Ok(())
    }
}

impl Drop for InMemoryAcknowledger {
    // An abandoned delivery goes back to the queue, like a broker reclaiming
    // an unacknowledged message from a lost consumer.
    fn drop(&mut self) {
        if let Some(mut message) = self.message.get_mut().take() {
            if !self.transport.is_closed() {
                message.delivery_count += 1;
                self.queue.push_front(message);
            }
        }
    }
}
