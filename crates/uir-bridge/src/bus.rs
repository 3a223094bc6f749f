//! Bus multiplexer
//!
//! One task owns the CAN transport. Sessions submit translated requests
//! through a bounded queue; the task writes their frames back-to-back,
//! registers who is waiting for which reply, and routes reassembled replies
//! to the right waiter. Replies for a [`ReplyKey`] are matched to waiters in
//! submission order.
//!
//! When a waiter goes away part-way through its reply, the rest of that
//! reply is tracked as an [`AbandonedReply`] and swallowed, so the next
//! waiter on the same key only ever sees fragments of its own reply.
//!
//! A receive error on the transport is fatal: every waiter is failed, the
//! status watch flips to [`BusStatus::Failed`] and the task returns.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uir_proto::constants::node_id;
use uir_proto::{CanFrame, ReplyKey, Role, SimpleCanFrame};

use crate::error::BridgeError;
use crate::reassembly::{AbandonedReply, Absorb, CompletedReply, Progress, ReassemblyContext};
use crate::transport::{CanTransport, TransportError};
use crate::translate::OutboundRequest;

/// Identifies the session a request came from
pub type SessionId = u64;

/// Outcome delivered to a submitter: `Ok(None)` once a fire-and-forget
/// request is on the bus, `Ok(Some(_))` with the reply otherwise
pub type ReplyResult = Result<Option<CompletedReply>, BridgeError>;

/// Health of the bus task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusStatus {
    Running,
    /// The transport failed; the bridge cannot continue
    Failed(String),
    /// The bus task was shut down
    Stopped,
}

/// A translated request waiting to go on the bus
#[derive(Debug)]
pub struct Submission {
    pub session: SessionId,
    pub request: u64,
    pub frames: Vec<CanFrame>,
    pub expect: Option<ReplyKey>,
    pub timeout: Duration,
    pub reply_tx: oneshot::Sender<ReplyResult>,
}

#[derive(Debug)]
pub enum BusCommand {
    Submit(Submission),
    /// Drop every waiter belonging to a session
    CancelSession(SessionId),
}

/// Cloneable handle sessions use to reach the bus task
#[derive(Debug, Clone)]
pub struct BusHandle {
    commands: mpsc::Sender<BusCommand>,
    status: watch::Receiver<BusStatus>,
    next_request: Arc<AtomicU64>,
}

impl BusHandle {
    /// Queue a request; waits while the queue is full
    pub async fn submit(
        &self,
        session: SessionId,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ReplyResult>, BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let submission = Submission {
            session,
            request: self.next_request.fetch_add(1, Ordering::Relaxed),
            frames: request.frames,
            expect: request.expect,
            timeout,
            reply_tx,
        };

        self.commands
            .send(BusCommand::Submit(submission))
            .await
            .map_err(|_| self.closed_error())?;
        Ok(reply_rx)
    }

    /// Drop every outstanding request of `session`. Idempotent.
    pub async fn cancel_session(&self, session: SessionId) {
        // A stopped bus has nothing left to cancel
        let _ = self.commands.send(BusCommand::CancelSession(session)).await;
    }

    /// Watch for the bus failing or stopping
    pub fn status(&self) -> watch::Receiver<BusStatus> {
        self.status.clone()
    }

    /// Error matching why the bus task is gone
    fn closed_error(&self) -> BridgeError {
        match &*self.status.borrow() {
            BusStatus::Failed(reason) => BridgeError::TransportFailure(reason.clone()),
            _ => BridgeError::Shutdown,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    session: SessionId,
    request: u64,
    context: ReassemblyContext,
    reply_tx: oneshot::Sender<ReplyResult>,
}

/// The task owning the CAN transport
pub struct BusMultiplexer {
    transport: Box<dyn CanTransport>,
    /// Node ID replies must be addressed to
    local_node: u8,
    commands: mpsc::Receiver<BusCommand>,
    status: watch::Sender<BusStatus>,
    pending: HashMap<ReplyKey, VecDeque<Waiter>>,
    abandoned: HashMap<ReplyKey, AbandonedReply>,
    shutdown: CancellationToken,
}

impl BusMultiplexer {
    /// Create the multiplexer and the handle sessions talk to it through
    pub fn new(
        transport: Box<dyn CanTransport>,
        local_node: u8,
        queue_depth: usize,
        shutdown: CancellationToken,
    ) -> (Self, BusHandle) {
        let (commands_tx, commands) = mpsc::channel(queue_depth);
        let (status, status_rx) = watch::channel(BusStatus::Running);

        let mux = Self {
            transport,
            local_node,
            commands,
            status,
            pending: HashMap::new(),
            abandoned: HashMap::new(),
            shutdown,
        };
        let handle = BusHandle {
            commands: commands_tx,
            status: status_rx,
            next_request: Arc::new(AtomicU64::new(1)),
        };
        (mux, handle)
    }

    /// Run until shutdown, until every handle is dropped, or until the
    /// transport fails
    pub async fn run(mut self) -> Result<(), BridgeError> {
        tracing::info!(transport = %self.transport.name(), "Bus multiplexer started");

        loop {
            let next_deadline = self.next_deadline();
            let sleep_until =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Bus multiplexer shutting down");
                    self.fail_all(&BridgeError::Shutdown);
                    self.status.send_replace(BusStatus::Stopped);
                    return Ok(());
                }
                command = self.commands.recv() => match command {
                    Some(BusCommand::Submit(submission)) => self.submit(submission).await,
                    Some(BusCommand::CancelSession(session)) => self.cancel_session(session),
                    None => {
                        tracing::debug!("All bus handles dropped");
                        self.status.send_replace(BusStatus::Stopped);
                        return Ok(());
                    }
                },
                frame = self.transport.recv() => match frame {
                    Ok(frame) => self.dispatch(&frame),
                    Err(e) => return Err(self.fail(e.into())),
                },
                _ = tokio::time::sleep_until(sleep_until), if next_deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
    }

    /// Register the waiter, then write the frames. A write error fails
    /// only this request.
    async fn submit(&mut self, submission: Submission) {
        let Submission {
            session,
            request,
            frames,
            expect,
            timeout,
            reply_tx,
        } = submission;

        if reply_tx.is_closed() {
            tracing::debug!(session, request, "Submitter gone, not sending");
            return;
        }

        // Registered before the first frame goes out so a fast reply has a home
        let reply_tx = match expect {
            Some(key) => {
                self.pending.entry(key).or_default().push_back(Waiter {
                    session,
                    request,
                    context: ReassemblyContext::new(key, timeout),
                    reply_tx,
                });
                None
            }
            None => Some(reply_tx),
        };

        if let Err(e) = self.write_frames(session, &frames).await {
            tracing::warn!(session, request, error = %e, "Failed to write request");
            let error = BridgeError::from(e);
            match (reply_tx, expect) {
                (Some(reply_tx), _) => {
                    let _ = reply_tx.send(Err(error));
                }
                (None, Some(key)) => self.fail_request(key, request, error),
                (None, None) => {}
            }
            return;
        }
        tracing::debug!(session, request, frames = frames.len(), expect = ?expect, "Request sent");

        if let Some(reply_tx) = reply_tx {
            let _ = reply_tx.send(Ok(None));
        }
    }

    async fn write_frames(
        &mut self,
        session: SessionId,
        frames: &[CanFrame],
    ) -> Result<(), TransportError> {
        for frame in frames {
            tracing::trace!(
                session,
                id = format_args!("0x{:08X}", frame.id()),
                data = %hex::encode(frame.data()),
                "CAN frame out"
            );
            self.transport.send(frame).await?;
        }
        Ok(())
    }

    fn fail_request(&mut self, key: ReplyKey, request: u64, error: BridgeError) {
        let Some(queue) = self.pending.get_mut(&key) else {
            return;
        };
        if let Some(pos) = queue.iter().position(|waiter| waiter.request == request) {
            if let Some(waiter) = queue.remove(pos) {
                let _ = waiter.reply_tx.send(Err(error));
            }
        }
        if queue.is_empty() {
            self.pending.remove(&key);
        }
    }

    fn dispatch(&mut self, frame: &CanFrame) {
        let parsed = match SimpleCanFrame::decode(frame) {
            Ok(parsed) => parsed,
            Err(kind) => {
                tracing::debug!(
                    id = format_args!("0x{:08X}", frame.id()),
                    %kind,
                    "Ignoring non-SimpleCAN frame"
                );
                return;
            }
        };
        let id = *parsed.id();
        if id.role() == Role::Command {
            tracing::trace!(producer = id.producer(), "Ignoring command from another controller");
            return;
        }
        if id.consumer() != self.local_node && id.consumer() != node_id::GLOBAL {
            tracing::trace!(consumer = id.consumer(), "Ignoring reply to another controller");
            return;
        }

        let key = id.reply_key();
        if let Some(tail) = self.abandoned.get_mut(&key) {
            match tail.absorb(&parsed) {
                Absorb::Absorbed => {
                    tracing::trace!(%key, "Fragment of abandoned reply dropped");
                    return;
                }
                Absorb::Drained => {
                    tracing::debug!(%key, "Abandoned reply drained");
                    self.abandoned.remove(&key);
                    return;
                }
                Absorb::Foreign => {
                    self.abandoned.remove(&key);
                }
            }
        }

        let Some(queue) = self.pending.get_mut(&key) else {
            tracing::debug!(%key, "Unsolicited reply dropped");
            return;
        };
        let Some(waiter) = queue.front_mut() else {
            return;
        };

        let finished = match waiter.context.accept(&parsed) {
            Ok(Progress::Accumulating) => None,
            Ok(Progress::Complete(reply)) => Some(Ok(Some(reply))),
            Err(e) => {
                tracing::warn!(%key, error = %e, "Reply reassembly failed");
                Some(Err(e))
            }
        };

        if let Some(result) = finished {
            if let Some(waiter) = queue.pop_front() {
                if result.is_err() {
                    if let Some(tail) = waiter.context.abandon(Instant::now()) {
                        self.abandoned.insert(key, tail);
                    }
                }
                tracing::debug!(session = waiter.session, request = waiter.request, %key, "Reply routed");
                let _ = waiter.reply_tx.send(result);
            }
            if queue.is_empty() {
                self.pending.remove(&key);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        self.abandoned.retain(|_, tail| tail.deadline() > now);

        for (key, queue) in self.pending.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for mut waiter in queue.drain(..) {
                if waiter.context.check_deadline(now) {
                    tracing::debug!(session = waiter.session, %key, "Reply timed out");
                    if let Some(tail) = waiter.context.abandon(now) {
                        self.abandoned.insert(*key, tail);
                    }
                    let _ = waiter.reply_tx.send(Err(BridgeError::Timeout(*key)));
                } else {
                    kept.push_back(waiter);
                }
            }
            *queue = kept;
        }
        self.pending.retain(|_, queue| !queue.is_empty());
    }

    fn cancel_session(&mut self, session: SessionId) {
        let now = Instant::now();
        let mut cancelled = 0;
        for (key, queue) in self.pending.iter_mut() {
            let partial = queue
                .front()
                .filter(|waiter| waiter.session == session)
                .and_then(|waiter| waiter.context.abandon(now));
            if let Some(tail) = partial {
                self.abandoned.insert(*key, tail);
            }

            let before = queue.len();
            queue.retain(|waiter| waiter.session != session);
            cancelled += before - queue.len();
        }
        self.pending.retain(|_, queue| !queue.is_empty());
        if cancelled > 0 {
            tracing::debug!(session, cancelled, "Cancelled outstanding requests");
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let waiters = self
            .pending
            .values()
            .flatten()
            .map(|waiter| waiter.context.deadline());
        let tails = self.abandoned.values().map(AbandonedReply::deadline);
        waiters.chain(tails).min()
    }

    fn fail(&mut self, error: BridgeError) -> BridgeError {
        tracing::error!(transport = %self.transport.name(), error = %error, "CAN transport failed");
        self.fail_all(&error);
        self.status.send_replace(BusStatus::Failed(error.to_string()));
        error
    }

    fn fail_all(&mut self, error: &BridgeError) {
        self.abandoned.clear();
        for (_, queue) in self.pending.drain() {
            for waiter in queue {
                let _ = waiter.reply_tx.send(Err(error.clone()));
            }
        }
    }
}
