//! # Session Relay
//!
//! Owns one browser connection and one upstream connection and pumps messages
//! between them until either side goes away.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: the upstream handshake runs while browser messages are
//!    queued in an [`OutboundQueue`]
//! 2. **Active**: the queue is drained in order, then both directions are
//!    pumped concurrently
//! 3. **HalfClosing**: one side closed or failed; the other side gets the
//!    matching close frame
//! 4. **Closed**: both sides finish their close handshakes together, bounded by
//!    one grace period, and are dropped
//!
//! ## Ordering:
//! Each direction runs its own loop and every send is awaited before the next
//! message of that direction is read, so per-direction order is exactly
//! arrival order. The two loops run concurrently: a slow reader on one side
//! never stalls the other direction. The first loop to end decides how the
//! session closes, and the other one is abandoned with it.
//!
//! Payloads are never inspected. Only data frames are relayed; ping and pong
//! are answered locally by each WebSocket endpoint.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::relay::queue::{OutboundQueue, QueueLimits};
use crate::relay::state::{ConnectionState, SessionOutcome, SessionPhase};
use crate::state::{AppState, Direction};

/// How long each side gets to finish its close handshake once the session is over.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Anything that behaves like a WebSocket connection.
///
/// Implemented for every `WebSocketStream`, whatever transport it runs on.
pub trait WsDuplex:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> WsDuplex for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

/// Result of waiting for the upstream handshake.
enum Handshake<O> {
    Open(O),
    Ended(SessionOutcome),
}

pub struct SessionRelay {
    id: Uuid,
    target: String,
    inbound_state: ConnectionState,
    outbound_state: ConnectionState,
    phase: SessionPhase,
    queue: OutboundQueue,
    handshake_timeout: Duration,
    app: AppState,
}

impl SessionRelay {
    pub fn new(app: AppState, target: impl Into<String>) -> Self {
        let config = app.config();
        let queue = OutboundQueue::new(QueueLimits::from(&config.relay));
        let handshake_timeout = config.handshake_timeout();

        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            inbound_state: ConnectionState::Open,
            outbound_state: ConnectionState::Connecting,
            phase: SessionPhase::Active,
            queue,
            handshake_timeout,
            app,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay between `inbound` and the connection produced by `connect`.
    ///
    /// `connect` is polled concurrently with the inbound stream, so browser
    /// messages sent during the handshake are queued rather than lost. It is
    /// abandoned if the browser leaves first or the handshake timeout expires.
    pub async fn run<I, O, F>(mut self, inbound: I, connect: F) -> SessionOutcome
    where
        I: WsDuplex,
        O: WsDuplex,
        F: Future<Output = RelayResult<O>>,
    {
        self.app.session_started();
        info!(session_id = %self.id, path = %self.target, "Session started");

        let (mut in_tx, mut in_rx) = inbound.split();

        let outcome = match self.await_upstream(&mut in_tx, &mut in_rx, connect).await {
            Handshake::Open(outbound) => {
                let (mut out_tx, mut out_rx) = outbound.split();
                let outcome = match self.drain_queue(&mut out_tx).await {
                    Ok(()) => self.pump(&mut in_tx, &mut in_rx, &mut out_tx, &mut out_rx).await,
                    Err(err) => {
                        self.outbound_state = ConnectionState::Closed;
                        self.fail(&mut in_tx, &mut out_tx, err).await
                    }
                };
                tokio::join!(finish(&mut in_tx, &mut in_rx), finish(&mut out_tx, &mut out_rx));
                outcome
            }
            Handshake::Ended(outcome) => {
                finish(&mut in_tx, &mut in_rx).await;
                outcome
            }
        };

        self.inbound_state = ConnectionState::Closed;
        self.outbound_state = ConnectionState::Closed;
        self.phase = SessionPhase::Closed;
        self.app.session_ended(outcome.is_failure());
        info!(session_id = %self.id, outcome = ?outcome, phase = %self.phase, "Session closed");

        outcome
    }

    async fn await_upstream<IS, IR, O, F>(
        &mut self,
        in_tx: &mut IS,
        in_rx: &mut IR,
        connect: F,
    ) -> Handshake<O>
    where
        IS: Sink<Message, Error = WsError> + Unpin,
        IR: Stream<Item = Result<Message, WsError>> + Unpin,
        F: Future<Output = RelayResult<O>>,
    {
        let connect = tokio::time::timeout(self.handshake_timeout, connect);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    let err = match result {
                        Ok(Ok(outbound)) => {
                            self.outbound_state = ConnectionState::Open;
                            debug!(session_id = %self.id, queued = self.queue.len(), "Upstream open");
                            return Handshake::Open(outbound);
                        }
                        Ok(Err(err)) => err,
                        Err(_) => RelayError::UpstreamTimeout(self.handshake_timeout),
                    };
                    self.outbound_state = ConnectionState::Closed;
                    self.discard_queue();
                    let outcome = self.failed(&err);
                    if let Some(frame) = err.inbound_close_frame() {
                        send_close(in_tx, &mut self.inbound_state, Some(frame)).await;
                    }
                    return Handshake::Ended(outcome);
                }
                event = in_rx.next() => match event {
                    Some(Ok(Message::Close(frame))) => {
                        self.inbound_state = ConnectionState::Closed;
                        self.phase = SessionPhase::HalfClosing;
                        self.discard_queue();
                        debug!(session_id = %self.id, "Client closed before upstream opened");
                        return Handshake::Ended(SessionOutcome::ClientClosed { code: close_code(&frame) });
                    }
                    Some(Ok(msg)) if is_data(&msg) => {
                        if let Err(err) = self.queue.enqueue(msg) {
                            let err = RelayError::from(err);
                            self.outbound_state = ConnectionState::Closed;
                            self.discard_queue();
                            let outcome = self.failed(&err);
                            send_close(in_tx, &mut self.inbound_state, err.inbound_close_frame()).await;
                            return Handshake::Ended(outcome);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.inbound_state = ConnectionState::Closed;
                        self.outbound_state = ConnectionState::Closed;
                        self.discard_queue();
                        let err = RelayError::ClientRuntime(e.to_string());
                        return Handshake::Ended(self.failed(&err));
                    }
                    None => {
                        self.inbound_state = ConnectionState::Closed;
                        self.phase = SessionPhase::HalfClosing;
                        self.discard_queue();
                        return Handshake::Ended(SessionOutcome::ClientClosed { code: None });
                    }
                }
            }
        }
    }

    async fn drain_queue<OS>(&mut self, out_tx: &mut OS) -> RelayResult<()>
    where
        OS: Sink<Message, Error = WsError> + Unpin,
    {
        if self.queue.is_empty() {
            self.queue.drain().for_each(drop);
            return Ok(());
        }

        let (drained, bytes) = (self.queue.len(), self.queue.bytes());
        for msg in self.queue.drain() {
            let size = msg.len();
            out_tx
                .feed(msg)
                .await
                .map_err(|e| RelayError::UpstreamRuntime(e.to_string()))?;
            self.app.record_relayed(Direction::ToUpstream, size);
        }
        out_tx
            .flush()
            .await
            .map_err(|e| RelayError::UpstreamRuntime(e.to_string()))?;
        debug!(session_id = %self.id, drained, bytes, "Flushed queued messages upstream");
        Ok(())
    }

    async fn pump<IS, IR, OS, OR>(
        &mut self,
        in_tx: &mut IS,
        in_rx: &mut IR,
        out_tx: &mut OS,
        out_rx: &mut OR,
    ) -> SessionOutcome
    where
        IS: Sink<Message, Error = WsError> + Unpin,
        IR: Stream<Item = Result<Message, WsError>> + Unpin,
        OS: Sink<Message, Error = WsError> + Unpin,
        OR: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        // Whichever direction ends first wins; the other loop is dropped with
        // any message it was still delivering.
        let (direction, end) = tokio::select! {
            end = relay_direction(in_rx, out_tx, &self.app, Direction::ToUpstream) => (Direction::ToUpstream, end),
            end = relay_direction(out_rx, in_tx, &self.app, Direction::ToClient) => (Direction::ToClient, end),
        };

        match (direction, end) {
            (Direction::ToUpstream, DirectionEnd::Closed(frame)) => self.client_closed(out_tx, frame).await,
            (Direction::ToClient, DirectionEnd::Closed(frame)) => self.upstream_closed(in_tx, frame).await,
            (Direction::ToUpstream, DirectionEnd::ReadFailed(e)) | (Direction::ToClient, DirectionEnd::WriteFailed(e)) => {
                self.inbound_state = ConnectionState::Closed;
                let err = RelayError::ClientRuntime(e.to_string());
                self.fail(in_tx, out_tx, err).await
            }
            (Direction::ToClient, DirectionEnd::ReadFailed(e)) | (Direction::ToUpstream, DirectionEnd::WriteFailed(e)) => {
                self.outbound_state = ConnectionState::Closed;
                let err = RelayError::UpstreamRuntime(e.to_string());
                self.fail(in_tx, out_tx, err).await
            }
        }
    }

    /// The browser closed: hand its code and reason to the upstream.
    async fn client_closed<OS>(&mut self, out_tx: &mut OS, frame: Option<CloseFrame<'static>>) -> SessionOutcome
    where
        OS: Sink<Message, Error = WsError> + Unpin,
    {
        self.inbound_state = ConnectionState::Closed;
        self.phase = SessionPhase::HalfClosing;
        let code = close_code(&frame);
        info!(
            session_id = %self.id,
            code = ?code,
            reason = %close_reason(&frame),
            "Client closed"
        );
        send_close(out_tx, &mut self.outbound_state, frame).await;
        SessionOutcome::ClientClosed { code }
    }

    /// The upstream closed: hand its code and reason to the browser.
    async fn upstream_closed<IS>(&mut self, in_tx: &mut IS, frame: Option<CloseFrame<'static>>) -> SessionOutcome
    where
        IS: Sink<Message, Error = WsError> + Unpin,
    {
        self.outbound_state = ConnectionState::Closed;
        self.phase = SessionPhase::HalfClosing;
        let code = close_code(&frame);
        info!(
            session_id = %self.id,
            code = ?code,
            reason = %close_reason(&frame),
            "Upstream closed"
        );
        send_close(in_tx, &mut self.inbound_state, frame).await;
        SessionOutcome::UpstreamClosed { code }
    }

    /// Close whichever sides are still open with the error's synthetic frames.
    ///
    /// Callers mark the failed side Closed first, so it never receives a frame.
    async fn fail<IS, OS>(&mut self, in_tx: &mut IS, out_tx: &mut OS, err: RelayError) -> SessionOutcome
    where
        IS: Sink<Message, Error = WsError> + Unpin,
        OS: Sink<Message, Error = WsError> + Unpin,
    {
        let outcome = self.failed(&err);
        if let Some(frame) = err.inbound_close_frame() {
            send_close(in_tx, &mut self.inbound_state, Some(frame)).await;
        }
        if let Some(frame) = err.outbound_close_frame() {
            send_close(out_tx, &mut self.outbound_state, Some(frame)).await;
        }
        outcome
    }

    fn failed(&mut self, err: &RelayError) -> SessionOutcome {
        self.phase = SessionPhase::HalfClosing;
        warn!(
            session_id = %self.id,
            kind = err.kind(),
            inbound = %self.inbound_state,
            outbound = %self.outbound_state,
            "Session failed: {}",
            err
        );
        SessionOutcome::Failed(err.kind())
    }

    fn discard_queue(&mut self) {
        let bytes = self.queue.bytes();
        let dropped = self.queue.discard();
        if dropped > 0 {
            debug!(session_id = %self.id, dropped, bytes, "Discarded queued messages");
        }
    }
}

fn is_data(msg: &Message) -> bool {
    matches!(msg, Message::Text(_) | Message::Binary(_))
}

fn close_code(frame: &Option<CloseFrame<'static>>) -> Option<u16> {
    frame.as_ref().map(|f| u16::from(f.code))
}

fn close_reason(frame: &Option<CloseFrame<'static>>) -> String {
    frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default()
}

/// How one direction of the pump ended.
enum DirectionEnd {
    /// The sending side closed, with or without a status
    Closed(Option<CloseFrame<'static>>),
    /// Reading from the sending side failed
    ReadFailed(WsError),
    /// Writing to the receiving side failed
    WriteFailed(WsError),
}

/// Copy data frames from `rx` to `tx` until `rx` closes or either side fails.
///
/// Control frames stay local: each WebSocket endpoint answers its own pings.
/// Once this returns nothing more is written to `tx`, so messages arriving
/// for a closed peer are dropped.
async fn relay_direction<R, S>(rx: &mut R, tx: &mut S, app: &AppState, direction: Direction) -> DirectionEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        match rx.next().await {
            Some(Ok(Message::Close(frame))) => return DirectionEnd::Closed(frame),
            Some(Ok(msg)) if is_data(&msg) => {
                let size = msg.len();
                if let Err(e) = tx.send(msg).await {
                    return DirectionEnd::WriteFailed(e);
                }
                app.record_relayed(direction, size);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return DirectionEnd::ReadFailed(e),
            None => return DirectionEnd::Closed(None),
        }
    }
}

/// Send a close frame to a peer that is still open. Never closes twice.
async fn send_close<S>(sink: &mut S, state: &mut ConnectionState, frame: Option<CloseFrame<'static>>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    if !state.is_open() {
        return;
    }
    *state = ConnectionState::Closing;
    if let Err(e) = sink.send(Message::Close(frame)).await {
        debug!(error = %e, "Close frame not delivered");
        *state = ConnectionState::Closed;
    }
}

/// Flush a side's close handshake and wait briefly for the peer to finish it.
async fn finish<S, R>(tx: &mut S, rx: &mut R)
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tx.close().await;
        while let Some(Ok(_)) = rx.next().await {}
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::borrow::Cow;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const TEST_TIMEOUT: Duration = Duration::from_secs(3);

    type Ws = WebSocketStream<DuplexStream>;

    /// An in-memory WebSocket pair: `(server side, client side)`.
    async fn ws_pair() -> (Ws, Ws) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn test_state(configure: impl FnOnce(&mut AppConfig)) -> AppState {
        let mut config = AppConfig::default();
        configure(&mut config);
        AppState::new(config)
    }

    struct Harness {
        /// The browser's end of the inbound connection
        browser: Ws,
        /// The upstream's end of the outbound connection, once released
        upstream: Option<Ws>,
        open_upstream: Option<oneshot::Sender<()>>,
        relay: JoinHandle<SessionOutcome>,
    }

    impl Harness {
        /// Start a relay whose upstream handshake completes only when
        /// `open()` is called.
        async fn start(app: AppState) -> Self {
            let (inbound, browser) = ws_pair().await;
            let (upstream_server, relay_client) = ws_pair().await;
            let (open_tx, open_rx) = oneshot::channel::<()>();

            let connect = async move {
                open_rx
                    .await
                    .map_err(|_| RelayError::UpstreamConnect("gate dropped".to_string()))?;
                Ok::<_, RelayError>(relay_client)
            };
            let relay = tokio::spawn(SessionRelay::new(app, "/ws/test").run(inbound, connect));

            Self {
                browser,
                upstream: Some(upstream_server),
                open_upstream: Some(open_tx),
                relay,
            }
        }

        /// Let the upstream handshake complete.
        fn release(&mut self) {
            if let Some(gate) = self.open_upstream.take() {
                let _ = gate.send(());
            }
        }

        fn open(&mut self) -> &mut Ws {
            self.release();
            self.upstream.as_mut().unwrap()
        }
    }

    async fn recv(ws: &mut Ws) -> Message {
        timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error")
    }

    /// Read until the peer goes away, answering its close handshake on the
    /// way. Returns everything received after the call.
    async fn drain_to_end(mut ws: Ws) -> Vec<Message> {
        let mut received = Vec::new();
        while let Ok(Some(Ok(msg))) = timeout(TEST_TIMEOUT, ws.next()).await {
            received.push(msg);
        }
        received
    }

    fn frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(reason),
        }
    }

    #[tokio::test]
    async fn test_messages_sent_before_open_arrive_in_order() {
        let app = test_state(|_| {});
        let mut h = Harness::start(app.clone()).await;

        h.browser.send(Message::Text("m1".into())).await.unwrap();
        h.browser.send(Message::Binary(vec![2])).await.unwrap();
        // Let the relay queue both before the upstream opens
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(app.get_metrics_snapshot().relay.messages_to_upstream, 0);

        let upstream = h.open();
        assert_eq!(recv(upstream).await, Message::Text("m1".into()));
        assert_eq!(recv(upstream).await, Message::Binary(vec![2]));
        assert_eq!(app.get_metrics_snapshot().relay.messages_to_upstream, 2);
    }

    #[tokio::test]
    async fn test_forwarding_after_open_keeps_order_both_ways() {
        let mut h = Harness::start(test_state(|_| {})).await;
        h.open();

        for i in 0..20 {
            h.browser.send(Message::Text(format!("up-{}", i))).await.unwrap();
        }
        let upstream = h.upstream.as_mut().unwrap();
        for i in 0..20 {
            assert_eq!(recv(upstream).await, Message::Text(format!("up-{}", i)));
        }

        for i in 0..20u8 {
            upstream.send(Message::Binary(vec![i])).await.unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(recv(&mut h.browser).await, Message::Binary(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_upstream_close_reaches_client_verbatim() {
        let mut h = Harness::start(test_state(|_| {})).await;
        let mut upstream = h.upstream.take().unwrap();
        h.release();
        upstream.send(Message::Close(Some(frame(1000, "done")))).await.unwrap();
        let upstream_done = tokio::spawn(drain_to_end(upstream));

        match recv(&mut h.browser).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1000);
                assert_eq!(received.reason, "done");
            }
            other => panic!("expected close, got {:?}", other),
        }
        // Exactly one close frame: the stream ends after it
        assert!(drain_to_end(h.browser).await.is_empty());

        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::UpstreamClosed { code: Some(1000) });
        upstream_done.await.unwrap();
    }

    #[tokio::test]
    async fn test_statusless_close_stays_statusless_to_client() {
        let mut h = Harness::start(test_state(|_| {})).await;
        let mut upstream = h.upstream.take().unwrap();
        h.release();
        upstream.send(Message::Close(None)).await.unwrap();
        tokio::spawn(drain_to_end(upstream));

        assert_eq!(recv(&mut h.browser).await, Message::Close(None));
        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::UpstreamClosed { code: None });
    }

    #[tokio::test]
    async fn test_statusless_close_stays_statusless_to_upstream() {
        let mut h = Harness::start(test_state(|_| {})).await;
        let mut upstream = h.upstream.take().unwrap();
        h.release();
        h.browser.send(Message::Close(None)).await.unwrap();

        assert_eq!(recv(&mut upstream).await, Message::Close(None));
        tokio::spawn(drain_to_end(upstream));
        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::ClientClosed { code: None });
    }

    #[tokio::test]
    async fn test_control_frames_are_not_relayed() {
        let app = test_state(|_| {});
        let mut h = Harness::start(app.clone()).await;
        h.open();

        h.browser.send(Message::Pong(vec![1])).await.unwrap();
        h.browser.send(Message::Text("after-pong".into())).await.unwrap();
        let upstream = h.upstream.as_mut().unwrap();
        assert_eq!(recv(upstream).await, Message::Text("after-pong".into()));

        upstream.send(Message::Ping(vec![2])).await.unwrap();
        upstream.send(Message::Binary(vec![3])).await.unwrap();
        assert_eq!(recv(&mut h.browser).await, Message::Binary(vec![3]));

        let relay = app.get_metrics_snapshot().relay;
        assert_eq!(relay.messages_to_upstream, 1);
        assert_eq!(relay.messages_to_client, 1);
    }

    #[tokio::test]
    async fn test_slow_client_does_not_stall_upstream_direction() {
        let mut h = Harness::start(test_state(|_| {})).await;
        h.open();
        let upstream = h.upstream.as_mut().unwrap();

        // The browser never reads, so relaying these towards it blocks once
        // its 64 KiB in-memory pipe is full
        let flood = vec![0u8; 16 * 1024];
        for _ in 0..6 {
            upstream.send(Message::Binary(flood.clone())).await.unwrap();
        }

        h.browser.send(Message::Text("mic".into())).await.unwrap();
        assert_eq!(recv(upstream).await, Message::Text("mic".into()));
    }

    #[tokio::test]
    async fn test_client_close_reaches_upstream_verbatim() {
        let mut h = Harness::start(test_state(|_| {})).await;
        h.open();
        h.browser.send(Message::Text("hello".into())).await.unwrap();
        let upstream = h.upstream.as_mut().unwrap();
        assert_eq!(recv(upstream).await, Message::Text("hello".into()));

        h.browser.send(Message::Close(Some(frame(4000, "bye")))).await.unwrap();
        match recv(upstream).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 4000);
                assert_eq!(received.reason, "bye");
            }
            other => panic!("expected close, got {:?}", other),
        }
        // Exactly one close frame: the stream ends after it
        assert!(timeout(TEST_TIMEOUT, upstream.next()).await.unwrap().map_or(true, |r| r.is_err()));
    }

    #[tokio::test]
    async fn test_client_error_closes_upstream_with_client_error() {
        let app = test_state(|_| {});
        let mut h = Harness::start(app.clone()).await;
        h.open();
        h.browser.send(Message::Text("hello".into())).await.unwrap();
        let mut upstream = h.upstream.take().unwrap();
        assert_eq!(recv(&mut upstream).await, Message::Text("hello".into()));

        // Vanish without a close handshake
        drop(h.browser);

        match recv(&mut upstream).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1011);
                assert_eq!(received.reason, "Client Error");
            }
            other => panic!("expected close, got {:?}", other),
        }

        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Failed("client_runtime"));
        assert_eq!(app.get_metrics_snapshot().relay.failed_sessions, 1);
    }

    #[tokio::test]
    async fn test_upstream_error_closes_client_with_upstream_error() {
        let mut h = Harness::start(test_state(|_| {})).await;
        h.open();
        drop(h.upstream.take());

        match recv(&mut h.browser).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1011);
                assert_eq!(received.reason, "Upstream API Error");
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_client_and_drops_queue() {
        let app = test_state(|_| {});
        let mut h = Harness::start(app.clone()).await;
        h.browser.send(Message::Text("never delivered".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Dropping the gate makes the handshake fail
        drop(h.open_upstream.take());

        match recv(&mut h.browser).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1011);
                assert_eq!(received.reason, "Upstream API Error");
            }
            other => panic!("expected close, got {:?}", other),
        }
        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Failed("upstream_connect"));
        assert_eq!(app.get_metrics_snapshot().relay.messages_to_upstream, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_client() {
        let app = test_state(|config| config.relay.handshake_timeout_ms = 50);
        let mut h = Harness::start(app).await;

        match recv(&mut h.browser).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1011);
                assert_eq!(received.reason, "Upstream Handshake Timeout");
            }
            other => panic!("expected close, got {:?}", other),
        }
        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Failed("upstream_timeout"));
    }

    #[tokio::test]
    async fn test_queue_overflow_terminates_session() {
        let app = test_state(|config| config.relay.max_queued_messages = 2);
        let mut h = Harness::start(app).await;

        for i in 0..3 {
            h.browser.send(Message::Text(format!("m{}", i))).await.unwrap();
        }

        match recv(&mut h.browser).await {
            Message::Close(Some(received)) => {
                assert_eq!(u16::from(received.code), 1009);
                assert_eq!(received.reason, "Message Queue Overflow");
            }
            other => panic!("expected close, got {:?}", other),
        }
        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Failed("queue_overflow"));
    }

    #[tokio::test]
    async fn test_client_leaving_before_open_abandons_handshake() {
        let app = test_state(|_| {});
        let mut h = Harness::start(app.clone()).await;
        h.browser.send(Message::Text("queued".into())).await.unwrap();
        h.browser.send(Message::Close(Some(frame(1000, "early")))).await.unwrap();

        let outcome = timeout(TEST_TIMEOUT, h.relay).await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::ClientClosed { code: Some(1000) });

        let relay = app.get_metrics_snapshot().relay;
        assert_eq!(relay.messages_to_upstream, 0);
        assert_eq!(relay.active_sessions, 0);
        assert_eq!(relay.total_sessions, 1);
    }
}
