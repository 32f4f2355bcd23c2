//! Per-connection state: the receive queue, the at-most-one-waiter
//! handoff, and backpressure bookkeeping.
//!
//! A `Connection` is shared between three tasks spawned by the server
//! for each socket: the reader task (owns the read half, feeds
//! messages in), the dispatcher task (calls `recv_message`, invokes
//! handlers, replies) and the writer task (owns the write half, drains
//! an unbounded channel so sends are fire-and-forget). The queue and
//! waiter live behind a plain `std::sync::Mutex` - it is never held
//! across an `.await`, so a blocking lock never stalls the runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::ProtocolError;
use crate::protocol::frame::OutFrame;
use crate::protocol::message;

/// One item handed from the reader task to the dispatcher task.
pub enum Incoming {
    Message { msg_id: u32, body: Value },
    Lost(ProtocolError),
}

#[derive(Default)]
struct Inner {
    queue: std::collections::VecDeque<Incoming>,
    waiter: Option<oneshot::Sender<Incoming>>,
}

/// Snapshot of a connection's backpressure counters, exposed through
/// `Server::stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub recv_direct: u64,
    pub recv_enqueue: u64,
    pub recv_dequeue: u64,
    pub recv_wait: u64,
    pub pause_count: u64,
}

pub struct Connection {
    pub ident: u64,
    pub peer_addr: SocketAddr,
    pause_threshold: usize,
    resume_threshold: usize,
    paused: AtomicBool,
    resume_notify: Notify,
    inner: Mutex<Inner>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<OutFrame>>>,
    poll_id: Mutex<Option<u32>>,
    recv_direct: AtomicU64,
    recv_enqueue: AtomicU64,
    recv_dequeue: AtomicU64,
    recv_wait: AtomicU64,
    pause_count: AtomicU64,
}

impl Connection {
    pub fn new(
        ident: u64,
        peer_addr: SocketAddr,
        pause_threshold: usize,
        resume_threshold: usize,
        write_tx: mpsc::UnboundedSender<OutFrame>,
    ) -> Self {
        Self {
            ident,
            peer_addr,
            pause_threshold,
            resume_threshold,
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            inner: Mutex::new(Inner::default()),
            write_tx: Mutex::new(Some(write_tx)),
            poll_id: Mutex::new(None),
            recv_direct: AtomicU64::new(0),
            recv_enqueue: AtomicU64::new(0),
            recv_dequeue: AtomicU64::new(0),
            recv_wait: AtomicU64::new(0),
            pause_count: AtomicU64::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Waits until the reader task is allowed to read again. Returns
    /// immediately if not currently paused.
    pub async fn wait_for_resume(&self) {
        loop {
            if !self.is_paused() {
                return;
            }
            self.resume_notify.notified().await;
        }
    }

    /// Called by the reader task when a full message has been decoded.
    pub fn feed_message(&self, msg_id: u32, body: Value) {
        self.feed(Incoming::Message { msg_id, body });
    }

    /// Called by the reader task when the stream has died (fatal
    /// protocol error or EOF).
    pub fn feed_exception(&self, err: ProtocolError) {
        self.feed(Incoming::Lost(err));
    }

    fn feed(&self, item: Incoming) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.waiter.take() {
            drop(inner);
            self.recv_direct.fetch_add(1, Ordering::Relaxed);
            // Dispatcher may have been dropped already; nothing to do then.
            let _ = tx.send(item);
            return;
        }
        inner.queue.push_back(item);
        let queue_len = inner.queue.len();
        drop(inner);
        self.recv_enqueue.fetch_add(1, Ordering::Relaxed);
        if !self.is_paused() && queue_len >= self.pause_threshold {
            self.paused.store(true, Ordering::Release);
            self.pause_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pulls the next message, queuing as the at-most-one waiter if
    /// none is ready yet. The pop-or-register decision happens inside a
    /// single lock hold so a `feed()` racing in from the reader task can
    /// never land between "queue looked empty" and "waiter registered" -
    /// otherwise a message pushed in that window would sit in the queue
    /// with no one ever waking up to drain it.
    pub async fn recv_message(&self) -> Incoming {
        enum Next {
            Ready(Incoming, usize),
            Wait(oneshot::Receiver<Incoming>),
        }

        let next = {
            let mut inner = self.inner.lock().unwrap();
            match inner.queue.pop_front() {
                Some(item) => Next::Ready(item, inner.queue.len()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiter = Some(tx);
                    Next::Wait(rx)
                }
            }
        };

        match next {
            Next::Ready(item, remaining) => {
                self.recv_dequeue.fetch_add(1, Ordering::Relaxed);
                self.maybe_resume(remaining);
                item
            }
            Next::Wait(rx) => {
                self.recv_wait.fetch_add(1, Ordering::Relaxed);
                self.maybe_resume(0);
                rx.await.unwrap_or(Incoming::Lost(ProtocolError::ConnectionLost))
            }
        }
    }

    fn maybe_resume(&self, queue_len_after: usize) {
        if self.is_paused() && queue_len_after <= self.resume_threshold {
            self.paused.store(false, Ordering::Release);
            self.resume_notify.notify_waiters();
        }
    }

    /// Queues an outbound message for the writer task. Fire-and-forget:
    /// errors mean the writer task (and hence the socket) is already
    /// gone, which the dispatcher loop will observe via `recv_message`
    /// returning `Incoming::Lost` soon after.
    pub fn send_message(&self, msg_id: u32, value: &Value) -> Result<(), ProtocolError> {
        let (body, is_compressed) = message::encode(value, true)?;
        if let Some(tx) = self.write_tx.lock().unwrap().as_ref() {
            let _ = tx.send(OutFrame { msg_id, body, is_compressed });
        }
        Ok(())
    }

    /// Drops the writer task's channel handle, which closes the
    /// channel and lets the writer task's `recv` loop exit once any
    /// queued frames have drained.
    pub fn close_writer(&self) {
        self.write_tx.lock().unwrap().take();
    }

    /// Records the poll id of the most recent `start_poll` command so a
    /// later server-initiated push can reuse it.
    pub fn set_poll_id(&self, msg_id: u32) {
        *self.poll_id.lock().unwrap() = Some(msg_id);
    }

    /// Pushes a request to the client over its outstanding long poll.
    /// Fails if no `start_poll` has registered a poll id yet.
    pub fn push_poll_request(&self, request: Value) -> Result<(), ProtocolError> {
        let poll_id = self.poll_id.lock().unwrap().ok_or(ProtocolError::NoActivePoll)?;
        let envelope = serde_json::json!({
            "response_queue": Value::Null,
            "response_id": Value::Null,
            "request": request,
        });
        self.send_message(poll_id, &envelope)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            recv_direct: self.recv_direct.load(Ordering::Relaxed),
            recv_enqueue: self.recv_enqueue.load(Ordering::Relaxed),
            recv_dequeue: self.recv_dequeue.load(Ordering::Relaxed),
            recv_wait: self.recv_wait.load(Ordering::Relaxed),
            pause_count: self.pause_count.load(Ordering::Relaxed),
        }
    }
}
