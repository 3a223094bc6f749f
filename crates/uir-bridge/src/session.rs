//! Client sessions
//!
//! A session reads UIMessages from one TCP connection, answers those
//! addressed to the gateway, and hands the rest to the bus. Replies are
//! written back as they complete, so a slow node never blocks replies from
//! other nodes. Only this session's connection ever sees its replies.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uir_proto::{Inbound, UiMessage, UiMessageCodec};

use crate::bus::{BusHandle, BusStatus, ReplyResult, SessionId};
use crate::config::SessionConfig;
use crate::device::GatewayDevice;
use crate::error::BridgeError;
use crate::translate::Translator;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// No longer reading; outstanding work is being cancelled
    Closing,
    Closed,
}

/// Everything sessions share
#[derive(Debug)]
pub struct SessionContext {
    pub translator: Translator,
    pub device: GatewayDevice,
    pub bus: BusHandle,
    pub config: SessionConfig,
}

enum Dispatch {
    /// Answer immediately
    Reply(UiMessage),
    /// Wait for the bus
    Pending(UiMessage, oneshot::Receiver<ReplyResult>),
    /// Nothing to send back
    Done,
}

/// One client connection
pub struct Session<S> {
    id: SessionId,
    peer: String,
    framed: Framed<S, UiMessageCodec>,
    ctx: Arc<SessionContext>,
    state: SessionState,
    malformed: u32,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: SessionId, peer: impl Into<String>, stream: S, ctx: Arc<SessionContext>) -> Self {
        Self {
            id,
            peer: peer.into(),
            framed: Framed::new(stream, UiMessageCodec::new()),
            ctx,
            state: SessionState::Connected,
            malformed: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until the peer leaves, the malformed budget is
    /// spent, the bridge shuts down, or the bus fails.
    ///
    /// Returns the transport failure in the last case.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        tracing::info!(session = self.id, peer = %self.peer, "Session opened");

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (UiMessage, ReplyResult)>> =
            FuturesUnordered::new();
        let mut bus_status = self.ctx.bus.status();
        let max_in_flight = self.ctx.config.max_in_flight;
        let max_malformed = self.ctx.config.max_malformed;

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(session = self.id, "Shutdown requested");
                    break Ok(());
                }
                changed = bus_status.changed() => {
                    let status = match changed {
                        Ok(()) => bus_status.borrow_and_update().clone(),
                        Err(_) => BusStatus::Stopped,
                    };
                    match status {
                        BusStatus::Running => {}
                        BusStatus::Stopped => break Ok(()),
                        BusStatus::Failed(reason) => {
                            let error = BridgeError::TransportFailure(reason);
                            let report = UiMessage::error_report(self.ctx.device.node_id(), error.code(), 0);
                            // Best effort; the connection is closing either way
                            let _ = self.framed.send(report).await;
                            break Err(error);
                        }
                    }
                }
                Some((request, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some(reply) = self.complete(&request, result) {
                        if let Err(e) = self.framed.send(reply).await {
                            tracing::warn!(session = self.id, error = %e, "Write failed");
                            break Ok(());
                        }
                    }
                }
                item = self.framed.next(), if in_flight.len() < max_in_flight => {
                    let reply = match item {
                        None => {
                            tracing::debug!(session = self.id, "Peer closed connection");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            tracing::warn!(session = self.id, error = %e, "Read failed");
                            break Ok(());
                        }
                        Some(Ok(Inbound::Malformed(kind))) => {
                            self.malformed += 1;
                            tracing::debug!(
                                session = self.id,
                                %kind,
                                count = self.malformed,
                                "Malformed message"
                            );
                            Some(UiMessage::error_report(self.ctx.device.node_id(), kind.code(), 0))
                        }
                        Some(Ok(Inbound::Message(msg))) => {
                            self.malformed = 0;
                            match self.dispatch(msg).await {
                                Dispatch::Reply(reply) => Some(reply),
                                Dispatch::Pending(request, rx) => {
                                    in_flight.push(await_reply(request, rx).boxed());
                                    None
                                }
                                Dispatch::Done => None,
                            }
                        }
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = self.framed.send(reply).await {
                            tracing::warn!(session = self.id, error = %e, "Write failed");
                            break Ok(());
                        }
                    }
                    if self.malformed >= max_malformed {
                        tracing::warn!(
                            session = self.id,
                            peer = %self.peer,
                            "Too many malformed messages, closing session"
                        );
                        break Ok(());
                    }
                }
            }
        };

        self.state = SessionState::Closing;
        self.ctx.bus.cancel_session(self.id).await;
        drop(in_flight);
        self.state = SessionState::Closed;

        tracing::info!(session = self.id, peer = %self.peer, "Session closed");
        result
    }

    async fn dispatch(&self, msg: UiMessage) -> Dispatch {
        tracing::debug!(session = self.id, %msg, "Request");

        if self.ctx.device.answers(msg.device_id()) {
            return match self.ctx.device.handle(&msg) {
                Ok(Some(reply)) => Dispatch::Reply(reply),
                Ok(None) => Dispatch::Done,
                Err(e) => Dispatch::Reply(error_reply(&msg, &e)),
            };
        }

        let request = match self.ctx.translator.outbound(&msg) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "Request not routable");
                return Dispatch::Reply(error_reply(&msg, &e));
            }
        };

        let timeout = self.ctx.config.reply_timeout();
        match self.ctx.bus.submit(self.id, request, timeout).await {
            Ok(rx) => Dispatch::Pending(msg, rx),
            Err(e) => Dispatch::Reply(error_reply(&msg, &e)),
        }
    }

    /// Message to write for a finished request, if any
    fn complete(&self, request: &UiMessage, result: ReplyResult) -> Option<UiMessage> {
        match result {
            Ok(Some(reply)) => match self.ctx.translator.inbound(&reply, request.sequence_tag()) {
                Ok(msg) => Some(msg),
                Err(e) => Some(error_reply(request, &e)),
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(session = self.id, error = %e, "Request failed");
                Some(error_reply(request, &e))
            }
        }
    }
}

async fn await_reply(
    request: UiMessage,
    rx: oneshot::Receiver<ReplyResult>,
) -> (UiMessage, ReplyResult) {
    let result = rx.await.unwrap_or(Err(BridgeError::Shutdown));
    (request, result)
}

/// ERROR_REPORT answering `request`
pub fn error_reply(request: &UiMessage, error: &BridgeError) -> UiMessage {
    UiMessage::error_report(request.device_id(), error.code(), request.control_word())
        .with_sequence_tag(request.sequence_tag())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMultiplexer;
    use crate::config::GatewayConfig;
    use crate::router::AddressMap;
    use crate::transport::mock::{self, MockBus};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use uir_proto::constants::{function_code, node_id};
    use uir_proto::{CanFrame, FragmentTag, SimpleCanFrame, SimpleCanId};

    struct Harness {
        client: DuplexStream,
        bus: MockBus,
        session: tokio::task::JoinHandle<(SessionState, Result<(), BridgeError>)>,
    }

    fn start(config: SessionConfig) -> Harness {
        let (transport, bus) = mock::pair();
        let token = CancellationToken::new();
        let (mux, handle) = BusMultiplexer::new(Box::new(transport), 2, 8, token.clone());
        tokio::spawn(mux.run());

        let map = AddressMap::new(2, [(5, 5), (20, node_id::GLOBAL)]).unwrap();
        let ctx = Arc::new(SessionContext {
            translator: Translator::new(Arc::new(map)),
            device: GatewayDevice::from_config(&GatewayConfig::default()).unwrap(),
            bus: handle,
            config,
        });

        let (client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(async move {
            let mut session = Session::new(1, "test", server, ctx);
            let result = session.run(token).await;
            (session.state(), result)
        });
        Harness {
            client,
            bus,
            session,
        }
    }

    async fn read_message(client: &mut DuplexStream) -> UiMessage {
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf).await.unwrap();
        UiMessage::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn gateway_messages_are_answered_locally() {
        let mut h = start(SessionConfig::default());
        let request = UiMessage::new(2, function_code::MODEL, Bytes::new())
            .unwrap()
            .with_ack(true)
            .with_sequence_tag(9);
        h.client.write_all(&request.to_bytes()).await.unwrap();

        let reply = read_message(&mut h.client).await;
        assert_eq!(reply.device_id(), 2);
        assert_eq!(reply.function_code(), function_code::MODEL);
        assert_eq!(reply.sequence_tag(), 9);
        assert!(h.bus.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn node_reply_is_translated_back() {
        let mut h = start(SessionConfig::default());
        let request = UiMessage::new(5, function_code::SERIAL_NUMBER, Bytes::new())
            .unwrap()
            .with_ack(true)
            .with_sequence_tag(0x33);
        h.client.write_all(&request.to_bytes()).await.unwrap();

        let sent = h.bus.next_sent().await.unwrap();
        assert_eq!(sent.id(), 0x0228_008C);

        let id = SimpleCanId::new(5, 2, function_code::SERIAL_NUMBER).unwrap();
        h.bus
            .inject(SimpleCanFrame::new(id, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap().encode());

        let reply = read_message(&mut h.client).await;
        assert_eq!(reply.device_id(), 5);
        assert_eq!(reply.sequence_tag(), 0x33);
        assert_eq!(reply.data().as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn unknown_address_is_reported_without_bus_traffic() {
        let mut h = start(SessionConfig::default());
        let request = UiMessage::new(77, function_code::MODEL, Bytes::new())
            .unwrap()
            .with_ack(true)
            .with_sequence_tag(4);
        h.client.write_all(&request.to_bytes()).await.unwrap();

        let reply = read_message(&mut h.client).await;
        assert_eq!(reply.function_code(), function_code::ERROR_REPORT);
        assert_eq!(reply.device_id(), 77);
        assert_eq!(reply.data().as_ref(), &[0x10, 0x8B]);
        assert_eq!(reply.sequence_tag(), 4);
        assert!(h.bus.try_next_sent().is_none());
    }

    fn serial_fragment(index: u8, more: bool, data: &[u8]) -> CanFrame {
        let id = SimpleCanId::new(5, 2, function_code::SERIAL_NUMBER)
            .unwrap()
            .with_fragment(FragmentTag { index, more })
            .unwrap();
        SimpleCanFrame::new(id, data).unwrap().encode()
    }

    #[tokio::test]
    async fn fragment_errors_are_reported_and_session_stays_open() {
        let mut h = start(SessionConfig::default());
        let serial = |tag| {
            UiMessage::new(5, function_code::SERIAL_NUMBER, Bytes::new())
                .unwrap()
                .with_ack(true)
                .with_sequence_tag(tag)
        };

        h.client.write_all(&serial(0x51).to_bytes()).await.unwrap();
        h.bus.next_sent().await.unwrap();
        h.bus.inject(serial_fragment(0, true, &[0; 8]));
        h.bus.inject(serial_fragment(0, true, &[0; 8]));

        let report = read_message(&mut h.client).await;
        assert_eq!(report.function_code(), function_code::ERROR_REPORT);
        assert_eq!(report.device_id(), 5);
        assert_eq!(report.data().as_ref(), &[0x20, 0x8C]);
        assert_eq!(report.sequence_tag(), 0x51);

        h.client.write_all(&serial(0x52).to_bytes()).await.unwrap();
        h.bus.next_sent().await.unwrap();
        h.bus.inject(serial_fragment(0, true, &[1; 8]));
        h.bus.inject(serial_fragment(1, true, &[1, 2, 3]));

        let report = read_message(&mut h.client).await;
        assert_eq!(report.data().as_ref(), &[0x21, 0x8C]);
        assert_eq!(report.sequence_tag(), 0x52);

        let model = UiMessage::new(2, function_code::MODEL, Bytes::new())
            .unwrap()
            .with_ack(true)
            .with_sequence_tag(0x53);
        h.client.write_all(&model.to_bytes()).await.unwrap();
        let reply = read_message(&mut h.client).await;
        assert_eq!(reply.function_code(), function_code::MODEL);
        assert_eq!(reply.sequence_tag(), 0x53);
        assert!(!h.session.is_finished());
    }

    #[tokio::test]
    async fn acknowledged_broadcast_is_refused() {
        let mut h = start(SessionConfig::default());
        let request = UiMessage::new(20, function_code::MODEL, Bytes::new())
            .unwrap()
            .with_ack(true)
            .with_sequence_tag(6);
        h.client.write_all(&request.to_bytes()).await.unwrap();

        let reply = read_message(&mut h.client).await;
        assert_eq!(reply.function_code(), function_code::ERROR_REPORT);
        assert_eq!(reply.data().as_ref(), &[0x13, 0x8B]);
        assert_eq!(reply.sequence_tag(), 6);
        assert!(h.bus.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn malformed_budget_closes_session() {
        let mut h = start(SessionConfig {
            max_malformed: 2,
            ..Default::default()
        });
        let mut corrupted = UiMessage::new(2, function_code::MODEL, Bytes::new())
            .unwrap()
            .to_bytes()
            .to_vec();
        corrupted[13] ^= 0xFF;

        h.client.write_all(&corrupted).await.unwrap();
        let first = read_message(&mut h.client).await;
        assert_eq!(first.data().as_ref(), &[0x01, 0x00]);

        h.client.write_all(&corrupted).await.unwrap();
        read_message(&mut h.client).await;

        let (state, result) = h.session.await.unwrap();
        assert_eq!(state, SessionState::Closed);
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn valid_message_resets_malformed_count() {
        let mut h = start(SessionConfig {
            max_malformed: 2,
            ..Default::default()
        });
        let valid = UiMessage::new(2, function_code::MODEL, Bytes::new())
            .unwrap()
            .with_ack(true);
        let mut corrupted = valid.to_bytes().to_vec();
        corrupted[13] ^= 0xFF;

        for _ in 0..3 {
            h.client.write_all(&corrupted).await.unwrap();
            read_message(&mut h.client).await;
            h.client.write_all(&valid.to_bytes()).await.unwrap();
            let reply = read_message(&mut h.client).await;
            assert_eq!(reply.function_code(), function_code::MODEL);
        }
        assert!(!h.session.is_finished());
    }

    #[tokio::test]
    async fn bus_failure_ends_session_with_error() {
        let mut h = start(SessionConfig::default());
        h.bus.disconnect();

        let report = read_message(&mut h.client).await;
        assert_eq!(report.data()[0], 0x40);

        let (state, result) = h.session.await.unwrap();
        assert_eq!(state, SessionState::Closed);
        assert!(matches!(result, Err(BridgeError::TransportFailure(_))));
    }
}
