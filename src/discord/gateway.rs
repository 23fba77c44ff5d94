use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use const_format::formatcp;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::spawn;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use url::Url;

use super::commands::CommandRegistry;
use super::dispatch::Dispatcher;
use super::payload::Payload;
use super::session::{ConnectionState, Session};
use super::{ControlChannel, GATEWAY_VERSION};
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 16;
const VERSION_PARAM: &str = formatcp!("{}", GATEWAY_VERSION);

/// Handle to the single writer task of a connection.
#[derive(Debug, Clone)]
pub struct Outbound(mpsc::Sender<Message>);

impl Outbound {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Outbound(sender)
    }

    pub async fn send(&self, payload: &Payload) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.0
            .send(Message::text(text))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) -> Result<()> {
        self.0
            .send(Message::Close(None))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Client for the real-time gateway.
///
/// [`connect`](GatewayClient::connect) returns once IDENTIFY has been sent; the
/// connection then runs in the background until it closes, which
/// [`wait`](GatewayClient::wait) blocks on.
pub struct GatewayClient {
    token: Box<str>,
    control: Arc<dyn ControlChannel>,
    commands: Arc<RwLock<CommandRegistry>>,
    prefix: Arc<str>,
    span: Span,
    session: Mutex<Arc<Session>>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    pub fn new(token: impl Into<Box<str>>, control: Arc<dyn ControlChannel>) -> Self {
        GatewayClient {
            token: token.into(),
            control,
            commands: Arc::new(RwLock::new(CommandRegistry::new())),
            prefix: Arc::from("!"),
            span: info_span!("gateway"),
            session: Mutex::new(Arc::new(Session::new())),
            connection: Mutex::new(None),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Span every log line and background task of this client is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn register_command<F>(&self, name: impl Into<Box<str>>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, handler);
    }

    pub fn command_count(&self) -> usize {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_connected()
    }

    /// State changes of the current connection.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.session().subscribe()
    }

    /// Looks up the gateway address, opens the websocket and identifies.
    pub async fn connect(&self) -> Result<()> {
        let session = {
            let mut current = lock(&self.session);
            if current.state() != ConnectionState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            let session = Arc::new(Session::new());
            session.set_state(ConnectionState::Connecting);
            *current = session.clone();
            session
        };

        match self.open(&session).instrument(self.span.clone()).await {
            Ok(connection) => {
                *lock(&self.connection) = Some(connection);
                Ok(())
            }
            Err(e) => {
                session.set_state(ConnectionState::Disconnected);
                self.span.in_scope(|| error!(error = %e, "gateway connect failed"));
                Err(e)
            }
        }
    }

    /// Blocks until the current connection is disconnected. Any number of
    /// callers may wait at once; all of them return when it closes.
    pub async fn wait(&self) {
        let mut states = self.subscribe();
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.await {
                self.span
                    .in_scope(|| error!(error = %e, "gateway connection task failed"));
            }
        }
        // Only fails once the session is gone, which also means disconnected.
        let _ = states
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Closes the current connection. [`wait`](GatewayClient::wait) returns
    /// once it has shut down.
    pub fn close(&self) {
        self.session().request_close();
    }

    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.control.send_message(channel_id, content).await
    }

    fn session(&self) -> Arc<Session> {
        lock(&self.session).clone()
    }

    async fn open(&self, session: &Arc<Session>) -> Result<JoinHandle<()>> {
        let address = self.control.gateway_url().await?;
        let url = gateway_url(&address)?;
        info!(%url, "connecting to gateway");

        let (socket, _) = connect_async(url.as_str()).await?;
        let (sink, stream) = socket.split();
        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = spawn(write_loop(sink, receiver).in_current_span());
        let outbound = Outbound::new(sender);

        outbound.send(&Payload::identify(&self.token)).await?;
        session.set_state(ConnectionState::Identified);
        info!("identified");

        let dispatcher = Dispatcher::new(
            session.clone(),
            self.commands.clone(),
            outbound.clone(),
            self.prefix.clone(),
        );
        Ok(spawn(
            read_loop(stream, dispatcher, outbound, session.clone(), writer).in_current_span(),
        ))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Appends the protocol version and encoding to the address handed out by
/// the control channel.
pub fn gateway_url(address: &str) -> Result<Url> {
    let mut url = Url::parse(address)?;
    url.query_pairs_mut()
        .append_pair("v", VERSION_PARAM)
        .append_pair("encoding", "json");
    Ok(url)
}

async fn write_loop(mut sink: SplitSink<Socket, Message>, mut receiver: mpsc::Receiver<Message>) {
    while let Some(message) = receiver.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "gateway send failed");
            break;
        }
    }
    debug!("gateway writer stopped");
}

/// Marks the session disconnected when the receive loop ends, including by
/// unwinding.
struct Disconnect(Arc<Session>);

impl Drop for Disconnect {
    fn drop(&mut self) {
        self.0.set_state(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    dispatcher: Dispatcher,
    outbound: Outbound,
    session: Arc<Session>,
    writer: JoinHandle<()>,
) {
    let disconnect = Disconnect(session.clone());

    loop {
        tokio::select! {
            () = session.close_requested() => {
                info!("closing gateway connection");
                dispatcher.shutdown();
                if let Err(e) = outbound.close().await {
                    warn!(error = %e, "gateway close frame not sent");
                }
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "gateway closed the connection");
                    break;
                }
                Some(Ok(message)) => dispatcher.handle(message).await,
                Some(Err(e)) => {
                    error!(error = %e, "gateway connection failed");
                    break;
                }
                None => {
                    info!("gateway stream ended");
                    break;
                }
            },
        }
    }

    dispatcher.shutdown();
    drop(disconnect);
    drop(dispatcher);
    drop(outbound);
    if let Err(e) = writer.await {
        error!(error = %e, "gateway writer task failed");
    }
    info!("disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(5);

    struct MockControl {
        url: Option<String>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ControlChannel for MockControl {
        async fn gateway_url(&self) -> Result<Box<str>> {
            match &self.url {
                Some(url) => Ok(url.as_str().into()),
                None => Err(Error::ControlChannel {
                    status: 401,
                    body: r#"{"message":"401: Unauthorized"}"#.to_owned(),
                }),
            }
        }

        async fn send_message(&self, channel_id: &str, content: &str) -> Result<Value> {
            lock(&self.sent).push((channel_id.to_owned(), content.to_owned()));
            Ok(json!({"content": content}))
        }
    }

    struct Harness {
        client: GatewayClient,
        control: Arc<MockControl>,
        server: WebSocketStream<TcpStream>,
        listener: Arc<TcpListener>,
    }

    async fn connected() -> Harness {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let control = Arc::new(MockControl {
            url: Some(format!("ws://{}", listener.local_addr().unwrap())),
            sent: Mutex::new(Vec::new()),
        });
        let client = GatewayClient::new("foo.bar.baz", control.clone());

        let accepting = listener.clone();
        let accept = spawn(async move {
            let listener = accepting;
            let (tcp, _) = listener.accept().await.unwrap();
            accept_async(tcp).await.unwrap()
        });
        client.connect().await.unwrap();
        let server = accept.await.unwrap();

        Harness {
            client,
            control,
            server,
            listener,
        }
    }

    async fn next_json(server: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let message = timeout(PATIENCE, server.next())
                .await
                .expect("no frame from client")
                .expect("client hung up")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json(server: &mut WebSocketStream<TcpStream>, value: Value) {
        server.send(Message::text(value.to_string())).await.unwrap();
    }

    async fn reach(client: &GatewayClient, state: ConnectionState) {
        let mut states = client.subscribe();
        timeout(PATIENCE, states.wait_for(|current| *current == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    /// Reads until the client's close frame, failing on any text after it.
    async fn assert_quiet_after_close(server: &mut WebSocketStream<TcpStream>) {
        let mut closed = false;
        while let Ok(Some(Ok(message))) =
            timeout(Duration::from_millis(300), server.next()).await
        {
            match message {
                Message::Close(_) => closed = true,
                Message::Text(text) => assert!(!closed, "frame after close: {text}"),
                _ => {}
            }
        }
    }

    #[test]
    fn url_selects_version_and_encoding() {
        assert_eq!(
            gateway_url("wss://gateway.discord.gg").unwrap().as_str(),
            "wss://gateway.discord.gg/?v=5&encoding=json"
        );
        assert!(gateway_url("not a url").is_err());
    }

    #[tokio::test]
    async fn identifies_on_open() {
        let mut h = connected().await;

        let identify = next_json(&mut h.server).await;
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "foo.bar.baz");
        assert_eq!(identify["d"]["compress"], true);
        assert_eq!(identify["d"]["large_threshold"], 250);
        assert_eq!(h.client.state(), ConnectionState::Identified);
        assert!(h.client.is_connected());
    }

    #[tokio::test]
    async fn hello_starts_heartbeat_with_sequence() {
        let mut h = connected().await;
        next_json(&mut h.server).await;

        send_json(&mut h.server, json!({"op": 10, "d": {"heartbeat_interval": 50}})).await;
        reach(&h.client, ConnectionState::Connected).await;

        let heartbeat = next_json(&mut h.server).await;
        assert_eq!(heartbeat, json!({"op": 1, "d": null}));

        send_json(
            &mut h.server,
            json!({"op": 0, "s": 42, "t": "GUILD_CREATE", "d": {}}),
        )
        .await;
        send_json(
            &mut h.server,
            json!({"op": 0, "s": 43, "t": "TYPING_START", "d": {}}),
        )
        .await;
        loop {
            let heartbeat = next_json(&mut h.server).await;
            assert_eq!(heartbeat["op"], 1);
            if heartbeat["d"] == 43 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn message_create_runs_command() {
        let mut h = connected().await;
        let (calls, mut called) = mpsc::unbounded_channel();
        h.client.register_command("ping", move |d| {
            let _ = calls.send(d.clone());
        });
        assert_eq!(h.client.command_count(), 1);
        next_json(&mut h.server).await;

        let d = json!({"content": "!PING", "channel_id": "81384788765712384"});
        send_json(
            &mut h.server,
            json!({"op": 0, "s": 1, "t": "MESSAGE_CREATE", "d": d.clone()}),
        )
        .await;

        let payload = timeout(PATIENCE, called.recv()).await.unwrap().unwrap();
        assert_eq!(payload, d);
        assert!(called.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_requires_connection() {
        let control = Arc::new(MockControl {
            url: None,
            sent: Mutex::new(Vec::new()),
        });
        let client = GatewayClient::new("", control.clone());

        assert!(matches!(
            client.send_message("123", "hi").await,
            Err(Error::NotConnected)
        ));
        assert!(lock(&control.sent).is_empty());
    }

    #[tokio::test]
    async fn send_message_while_connected() {
        let h = connected().await;
        h.client.send_message("123", "pong").await.unwrap();
        assert_eq!(
            *lock(&h.control.sent),
            vec![("123".to_owned(), "pong".to_owned())]
        );
    }

    #[tokio::test]
    async fn failed_lookup_leaves_client_disconnected() {
        let control = Arc::new(MockControl {
            url: None,
            sent: Mutex::new(Vec::new()),
        });
        let client = GatewayClient::new("", control);

        assert!(matches!(
            client.connect().await,
            Err(Error::ControlChannel { status: 401, .. })
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let h = connected().await;
        assert!(matches!(
            h.client.connect().await,
            Err(Error::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn server_close_disconnects() {
        let mut h = connected().await;
        next_json(&mut h.server).await;
        send_json(&mut h.server, json!({"op": 10, "d": {"heartbeat_interval": 20}})).await;
        reach(&h.client, ConnectionState::Connected).await;
        next_json(&mut h.server).await;

        h.server.close(None).await.unwrap();
        timeout(PATIENCE, h.client.wait()).await.unwrap();

        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(!h.client.is_connected());
        assert!(matches!(
            h.client.send_message("123", "hi").await,
            Err(Error::NotConnected)
        ));
        assert_quiet_after_close(&mut h.server).await;
    }

    #[tokio::test]
    async fn close_disconnects() {
        let mut h = connected().await;
        next_json(&mut h.server).await;
        send_json(&mut h.server, json!({"op": 10, "d": {"heartbeat_interval": 20}})).await;
        reach(&h.client, ConnectionState::Connected).await;

        h.client.close();
        timeout(PATIENCE, h.client.wait()).await.unwrap();

        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert_quiet_after_close(&mut h.server).await;
    }

    #[tokio::test]
    async fn concurrent_waits_block_until_close() {
        let mut h = connected().await;
        next_json(&mut h.server).await;

        let both = async { tokio::join!(h.client.wait(), h.client.wait()) };
        tokio::pin!(both);
        assert!(timeout(Duration::from_millis(200), &mut both).await.is_err());
        assert!(h.client.is_connected());

        h.client.close();
        timeout(PATIENCE, both).await.unwrap();
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wait_without_connection_returns() {
        let control = Arc::new(MockControl {
            url: None,
            sent: Mutex::new(Vec::new()),
        });
        let client = GatewayClient::new("", control);
        timeout(PATIENCE, client.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_keeps_connection() {
        let mut h = connected().await;
        let (calls, mut called) = mpsc::unbounded_channel();
        h.client.register_command("boom", |_| panic!("handler failed"));
        h.client.register_command("ping", move |d| {
            let _ = calls.send(d.clone());
        });
        next_json(&mut h.server).await;
        send_json(&mut h.server, json!({"op": 10, "d": {"heartbeat_interval": 20}})).await;
        reach(&h.client, ConnectionState::Connected).await;

        for (s, content) in [(1, "!boom"), (2, "!ping")] {
            send_json(
                &mut h.server,
                json!({"op": 0, "s": s, "t": "MESSAGE_CREATE", "d": {"content": content}}),
            )
            .await;
        }
        let payload = timeout(PATIENCE, called.recv()).await.unwrap().unwrap();
        assert_eq!(payload["content"], "!ping");
        assert_eq!(h.client.state(), ConnectionState::Connected);
        while next_json(&mut h.server).await != json!({"op": 1, "d": 2}) {}

        h.client.close();
        timeout(PATIENCE, h.client.wait()).await.unwrap();
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert_quiet_after_close(&mut h.server).await;

        let listener = h.listener;
        let accept = spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_async(tcp).await.unwrap()
        });
        h.client.connect().await.unwrap();
        let mut server = accept.await.unwrap();
        assert_eq!(next_json(&mut server).await["op"], 2);
    }

    #[tokio::test]
    async fn unwinding_receive_loop_disconnects() {
        let session = Arc::new(Session::new());
        session.set_state(ConnectionState::Connected);

        let guarded = session.clone();
        let task = spawn(async move {
            let _disconnect = Disconnect(guarded);
            panic!("receive loop failed");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn reconnect_builds_fresh_session() {
        let mut h = connected().await;
        next_json(&mut h.server).await;
        send_json(&mut h.server, json!({"op": 10, "d": {"heartbeat_interval": 20}})).await;
        send_json(
            &mut h.server,
            json!({"op": 0, "s": 42, "t": "READY", "d": {}}),
        )
        .await;
        while next_json(&mut h.server).await != json!({"op": 1, "d": 42}) {}

        h.client.close();
        timeout(PATIENCE, h.client.wait()).await.unwrap();
        assert_eq!(h.client.state(), ConnectionState::Disconnected);

        let listener = h.listener;
        let accept = spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_async(tcp).await.unwrap()
        });
        h.client.connect().await.unwrap();
        let mut server = accept.await.unwrap();

        assert_eq!(next_json(&mut server).await["op"], 2);
        assert_eq!(h.client.state(), ConnectionState::Identified);
        let session = h.client.session();
        assert_eq!(session.last_sequence().await, None);
        assert_eq!(session.heartbeat_interval(), None);
    }
}
