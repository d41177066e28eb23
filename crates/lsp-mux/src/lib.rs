//! Shared language server multiplexer.
//!
//! The mux owns one language server child (its standard streams) and a set
//! of client connections, and routes framed JSON-RPC between them: request
//! identifiers are rewritten in both directions so concurrent clients cannot
//! collide, server notifications are broadcast, the initialize handshake is
//! cached and replayed to late joiners, a handful of server-initiated
//! requests are answered locally, and an optional bridge synthesizes push
//! diagnostics from a pull-only server.
//!
//! Identifier spaces are disjoint by construction: the mux mints positive
//! integers for server-bound traffic (client-origin and bridge-internal
//! requests) and negative integers for requests forwarded to the primary
//! client. Identifiers minted by clients never reach the server.

#[macro_use]
extern crate tracing;

pub mod registry;

mod bridge;

pub use lsp_proto::{LspCodec, Message, MessageId, Notification, Request, Response};

use std::collections::{BTreeMap, HashMap};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::{Bridge, BridgeAction};
use crate::registry::{DiagnosticsMode, ServerSpec};

pub type ErasedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ErasedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The server side of the mux: the child's standard streams, plus the child
/// handle itself when the mux owns a real process.
pub struct ServerIo {
    reader: ErasedReader,
    writer: ErasedWriter,
    child: Option<Child>,
}

impl ServerIo {
    /// Takes ownership of an already-spawned child. Its stdin/stdout must be
    /// piped.
    pub fn from_child(mut child: Child) -> anyhow::Result<Self> {
        let stdin = child.stdin.take().context("server stdin is not piped")?;
        let stdout = child.stdout.take().context("server stdout is not piped")?;
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// Drives raw streams instead of a process; server exit is then observed
    /// through EOF only. Used by tests and embeddings.
    pub fn from_io(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Delay before the child is killed once the client set is empty.
    pub idle_timeout: Duration,
    /// Outbound queue depth per writer. A full server-bound queue pauses
    /// dispatch (and with it every client reader); a full client-bound queue
    /// pauses server-side reads the same way.
    pub write_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(500),
            write_buffer: 64,
        }
    }
}

/// How the mux terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The mux killed the child itself after the idle delay.
    pub idle: bool,
}

/// Clonable attach surface handed to the connection acceptor.
#[derive(Clone)]
pub struct MuxHandle {
    attach_tx: mpsc::Sender<NewClient>,
}

impl MuxHandle {
    /// Hands an accepted client connection to the mux.
    pub async fn attach<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.attach_tx
            .send(NewClient {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })
            .await
            .map_err(|_| anyhow::anyhow!("mux is gone"))
    }
}

struct NewClient {
    reader: ErasedReader,
    writer: ErasedWriter,
}

pub struct Mux {
    cfg: MuxConfig,
    spec: &'static ServerSpec,
    server: ServerIo,
    attach_rx: mpsc::Receiver<NewClient>,
}

impl Mux {
    pub fn new(server: ServerIo, spec: &'static ServerSpec) -> (Self, MuxHandle) {
        let (attach_tx, attach_rx) = mpsc::channel(8);
        let mux = Self {
            cfg: MuxConfig::default(),
            spec,
            server,
            attach_rx,
        };
        (mux, MuxHandle { attach_tx })
    }

    pub fn with_config(mut self, cfg: MuxConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Runs until the server exits or the idle timer fires.
    pub async fn run(self) -> anyhow::Result<MuxExit> {
        run_mux_impl(self).await
    }
}

// === implementation details === //

#[derive(Debug)]
enum Event {
    FromClient { client_id: u64, message: Message },
    ClientGone { client_id: u64 },
    BridgeTimer { uri: String, generation: u64 },
}

enum InitState {
    NotStarted,
    InProgress {
        client_id: u64,
        original_id: MessageId,
        server_id: i64,
    },
    Done {
        result: Option<Value>,
        error: Option<Value>,
    },
}

enum InternalRequest {
    PullDiagnostics { uri: String },
}

struct ClientCtx {
    tx: mpsc::Sender<Message>,
    /// Whether the client advertised pull-diagnostic capability in its
    /// `initialize` params.
    pull_diagnostics: bool,
    _reader_task: ChildTask<()>,
    _writer_task: ChildTask<()>,
}

struct MuxCtx {
    cfg: MuxConfig,
    spec: &'static ServerSpec,
    event_tx: mpsc::Sender<Event>,
    server_tx: mpsc::Sender<Message>,

    /// Monotonic ids keep the map in attach order, which is also the primary
    /// promotion order.
    clients: BTreeMap<u64, ClientCtx>,
    primary: Option<u64>,
    next_client_id: u64,

    next_server_id: i64,
    next_forward_id: i64,
    /// server-facing id -> (client, the id the client used)
    pending_client: HashMap<i64, (u64, MessageId)>,
    /// server-facing id -> bridge bookkeeping
    pending_internal: HashMap<i64, InternalRequest>,
    /// client-facing negative id -> the id the server used
    pending_forward: HashMap<i64, MessageId>,

    init: InitState,
    /// Initializers deferred while the primary's handshake is in flight.
    init_waiters: Vec<(u64, MessageId)>,

    bridge: Option<Bridge>,
}

async fn run_mux_impl(mux: Mux) -> anyhow::Result<MuxExit> {
    let Mux {
        cfg,
        spec,
        server,
        mut attach_rx,
    } = mux;

    info!(server = spec.name, "Starting mux");
    debug!(?cfg);

    let ServerIo {
        reader,
        writer,
        mut child,
    } = server;

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(cfg.write_buffer);
    let (server_tx, server_rx) = mpsc::channel::<Message>(cfg.write_buffer);

    let mut server_stream = FramedRead::new(reader, LspCodec::new());
    let _sender_task = ServerSenderTask {
        sink: FramedWrite::new(writer, LspCodec::new()),
        rx: server_rx,
    }
    .spawn();

    let bridge = match spec.diagnostics {
        DiagnosticsMode::PullToPush { debounce, .. } => Some(Bridge::new(debounce)),
        DiagnosticsMode::Passthrough => None,
    };

    let mut ctx = MuxCtx {
        cfg,
        spec,
        event_tx,
        server_tx,
        clients: BTreeMap::new(),
        primary: None,
        next_client_id: 0,
        next_server_id: 1,
        next_forward_id: -1,
        pending_client: HashMap::new(),
        pending_internal: HashMap::new(),
        pending_forward: HashMap::new(),
        init: InitState::NotStarted,
        init_waiters: Vec::new(),
        bridge,
    };

    // Armed from startup: a daemon nobody connects to should not outlive the
    // idle window either.
    let mut idle_deadline = Some(Instant::now() + cfg.idle_timeout);
    let mut attach_open = true;

    // NOTE: This loop is the single dispatch region: every piece of shared
    // state is mutated here and nowhere else. Sends into the bounded writer
    // queues may suspend; that suspension IS the backpressure policy (reads
    // from every source pause until the congested writer drains).
    let exit = loop {
        tokio::select! {
            new_client = attach_rx.recv(), if attach_open => match new_client {
                Some(NewClient { reader, writer }) => {
                    idle_deadline = None;
                    ctx.attach(reader, writer);
                }
                None => attach_open = false,
            },

            Some(event) = event_rx.recv() => {
                let result = match event {
                    Event::FromClient { client_id, message } => {
                        ctx.handle_client_message(client_id, message).await
                    }
                    Event::ClientGone { client_id } => {
                        if ctx.client_gone(client_id) && ctx.clients.is_empty() {
                            idle_deadline = Some(Instant::now() + ctx.cfg.idle_timeout);
                        }
                        Ok(())
                    }
                    Event::BridgeTimer { uri, generation } => {
                        ctx.bridge_timer(&uri, generation).await
                    }
                };
                if let Err(error) = result {
                    error!(error = format!("{error:#}"), "Server writer failed, stopping mux");
                    break reap(child.take(), false).await;
                }
            },

            frame = server_stream.next() => match frame {
                Some(Ok(message)) => {
                    if let Err(error) = ctx.handle_server_message(message).await {
                        error!(error = format!("{error:#}"), "Server writer failed, stopping mux");
                        break reap(child.take(), false).await;
                    }
                }
                Some(Err(error)) => {
                    error!(%error, "Server stream framing error, stopping mux");
                    break reap(child.take(), false).await;
                }
                None => {
                    info!("Server closed its stdout");
                    break reap(child.take(), false).await;
                }
            },

            status = wait_child(&mut child) => {
                info!("Server process exited");
                child = None;
                break exit_from_status(status.ok(), false);
            },

            () = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                if ctx.clients.is_empty() {
                    info!(timeout = ?cfg.idle_timeout, "Idle timeout expired, killing server");
                    break reap(child.take(), true).await;
                }
                idle_deadline = None;
            }
        }
    };

    // Dropping the context aborts every client reader/writer task, which
    // closes the client sockets.
    drop(ctx);

    info!(?exit, "Mux terminated");
    Ok(exit)
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Kills the child (a no-op when it already exited) and collects its status.
async fn reap(child: Option<Child>, idle: bool) -> MuxExit {
    let Some(mut child) = child else {
        return MuxExit {
            code: None,
            signal: None,
            idle,
        };
    };

    let _ = child.start_kill();
    exit_from_status(child.wait().await.ok(), idle)
}

fn exit_from_status(status: Option<ExitStatus>, idle: bool) -> MuxExit {
    let Some(status) = status else {
        return MuxExit {
            code: None,
            signal: None,
            idle,
        };
    };

    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    MuxExit {
        code: status.code(),
        signal,
        idle,
    }
}

impl MuxCtx {
    fn attach(&mut self, reader: ErasedReader, writer: ErasedWriter) {
        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let (tx, rx) = mpsc::channel(self.cfg.write_buffer);

        let writer_task = ClientWriterTask {
            client_id,
            sink: FramedWrite::new(writer, LspCodec::new()),
            rx,
            event_tx: self.event_tx.clone(),
        }
        .spawn();
        let reader_task = ChildTask(tokio::spawn(client_reader_task(
            client_id,
            reader,
            self.event_tx.clone(),
        )));

        self.clients.insert(
            client_id,
            ClientCtx {
                tx,
                pull_diagnostics: false,
                _reader_task: reader_task,
                _writer_task: writer_task,
            },
        );

        info!(client = client_id, total = self.clients.len(), "Client attached");
    }

    /// Removes a client; returns false when it was already gone.
    fn client_gone(&mut self, client_id: u64) -> bool {
        if self.clients.remove(&client_id).is_none() {
            return false;
        }
        info!(client = client_id, total = self.clients.len(), "Client disconnected");

        self.pending_client.retain(|_, (owner, _)| *owner != client_id);
        self.init_waiters.retain(|(owner, _)| *owner != client_id);

        if self.primary == Some(client_id) {
            // Outstanding forwarded server-origin requests are not replayed
            // to the inherited primary; the server may never see an answer
            // for them.
            self.primary = self.clients.keys().next().copied();
            if let Some(promoted) = self.primary {
                info!(client = promoted, "Promoted new primary client");
            }
        }

        true
    }

    async fn handle_client_message(&mut self, client_id: u64, message: Message) -> anyhow::Result<()> {
        trace!(client = client_id, ?message, "Client message");
        match message {
            Message::Request(request) => self.handle_client_request(client_id, request).await,
            Message::Notification(notification) => {
                self.handle_client_notification(client_id, notification).await
            }
            Message::Response(response) => self.handle_client_response(client_id, response).await,
        }
    }

    async fn handle_client_request(&mut self, client_id: u64, mut request: Request) -> anyhow::Result<()> {
        match request.method() {
            "initialize" => {
                let advertises_pull = params_advertise_pull(request.params());
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.pull_diagnostics = advertises_pull;
                }
                self.handle_initialize(client_id, request).await
            }
            "shutdown" => {
                // The shared server outlives any single editor; acknowledge
                // locally and let the idle timer govern the child's life.
                debug!(client = client_id, "Answering shutdown locally");
                let reply = Response::success(request.id(), Value::Null);
                self.send_to_client(client_id, Message::Response(reply)).await;
                Ok(())
            }
            _ => {
                let server_id = self.next_server_id();
                self.pending_client.insert(server_id, (client_id, request.id()));
                request.set_id(MessageId::Int(server_id));
                self.send_to_server(Message::Request(request)).await
            }
        }
    }

    async fn handle_initialize(&mut self, client_id: u64, mut request: Request) -> anyhow::Result<()> {
        if let InitState::Done { result, error } = &self.init {
            debug!(client = client_id, "Replaying cached initialize response");
            let reply = Response::from_parts(request.id(), result.clone(), error.clone());
            self.send_to_client(client_id, Message::Response(reply)).await;
            return Ok(());
        }

        if let InitState::InProgress { .. } = self.init {
            debug!(client = client_id, "Deferring initialize until the primary completes");
            self.init_waiters.push((client_id, request.id()));
            return Ok(());
        }

        // First initialize wins the primary role.
        if self.primary.is_none() {
            self.primary = Some(client_id);
        }

        if let Some(hook) = self.spec.prepare_initialize {
            hook(&mut request);
        }

        let server_id = self.next_server_id();
        self.init = InitState::InProgress {
            client_id,
            original_id: request.id(),
            server_id,
        };
        request.set_id(MessageId::Int(server_id));

        info!(client = client_id, "Forwarding initialize to server");
        self.send_to_server(Message::Request(request)).await
    }

    async fn handle_client_notification(
        &mut self,
        client_id: u64,
        notification: Notification,
    ) -> anyhow::Result<()> {
        match notification.method() {
            "initialized" => {
                if self.primary != Some(client_id) {
                    debug!(client = client_id, "Dropping initialized from non-primary client");
                    return Ok(());
                }
            }
            "exit" => {
                debug!(client = client_id, "Dropping client exit notification");
                return Ok(());
            }
            "textDocument/didOpen" | "textDocument/didChange" | "textDocument/didSave" => {
                if let Some(bridge) = self.bridge.as_mut() {
                    if let Some(uri) = text_document_uri(notification.params()) {
                        let actions = bridge.on_file_event(uri.to_owned());
                        self.run_bridge_actions(actions).await?;
                    }
                }
            }
            "textDocument/didClose" => {
                if let Some(bridge) = self.bridge.as_mut() {
                    if let Some(uri) = text_document_uri(notification.params()) {
                        bridge.on_close(uri);
                    }
                }
            }
            _ => {}
        }

        self.send_to_server(Message::Notification(notification)).await
    }

    async fn handle_client_response(&mut self, client_id: u64, mut response: Response) -> anyhow::Result<()> {
        if let Some(forward_id) = response.id().as_i64() {
            if forward_id < 0 {
                if let Some(server_original) = self.pending_forward.remove(&forward_id) {
                    response.set_id(server_original);
                    return self.send_to_server(Message::Response(response)).await;
                }
            }
        }

        // A stray response cannot be routed safely.
        debug!(client = client_id, id = %response.id(), "Dropping stray client response");
        Ok(())
    }

    async fn handle_server_message(&mut self, message: Message) -> anyhow::Result<()> {
        trace!(?message, "Server message");
        match message {
            Message::Notification(notification) => {
                self.broadcast(Message::Notification(notification)).await;
                Ok(())
            }
            Message::Response(response) => self.handle_server_response(response).await,
            Message::Request(request) => self.handle_server_request(request).await,
        }
    }

    async fn handle_server_response(&mut self, mut response: Response) -> anyhow::Result<()> {
        if let Some(server_id) = response.id().as_i64() {
            if let Some(internal) = self.pending_internal.remove(&server_id) {
                let InternalRequest::PullDiagnostics { uri } = internal;
                if let Some(bridge) = self.bridge.as_mut() {
                    let actions = bridge.on_response(&uri, &response);
                    self.run_bridge_actions(actions).await?;
                }
                return Ok(());
            }

            if let InitState::InProgress { server_id: init_id, .. } = &self.init {
                if server_id == *init_id {
                    return self.complete_initialize(&response).await;
                }
            }

            if let Some((client_id, original_id)) = self.pending_client.remove(&server_id) {
                response.set_id(original_id);
                self.send_to_client(client_id, Message::Response(response)).await;
                return Ok(());
            }
        }

        debug!(id = %response.id(), "Stray server response, broadcasting");
        self.broadcast(Message::Response(response)).await;
        Ok(())
    }

    async fn handle_server_request(&mut self, mut request: Request) -> anyhow::Result<()> {
        match request.method() {
            "client/registerCapability" | "client/unregisterCapability" => {
                let reply = Response::success(request.id(), Value::Null);
                self.send_to_server(Message::Response(reply)).await
            }
            "workspace/configuration" => {
                let len = request
                    .params()
                    .and_then(|params| params.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                let reply = Response::success(request.id(), Value::Array(vec![Value::Null; len]));
                self.send_to_server(Message::Response(reply)).await
            }
            _ => {
                let Some(primary) = self.primary else {
                    debug!(method = request.method(), "No client to forward server request to");
                    let reply = Response::failure(request.id(), -32601, "No clients connected");
                    return self.send_to_server(Message::Response(reply)).await;
                };

                let forward_id = self.next_forward_id();
                self.pending_forward.insert(forward_id, request.id());
                request.set_id(MessageId::Int(forward_id));
                self.send_to_client(primary, Message::Request(request)).await;
                Ok(())
            }
        }
    }

    async fn complete_initialize(&mut self, response: &Response) -> anyhow::Result<()> {
        let InitState::InProgress {
            client_id,
            original_id,
            ..
        } = core::mem::replace(&mut self.init, InitState::NotStarted)
        else {
            return Ok(());
        };

        let result = response.result().cloned();
        let error = response.error().cloned();
        self.init = InitState::Done {
            result: result.clone(),
            error: error.clone(),
        };
        info!(ok = error.is_none(), "Initialize completed, caching response");

        if self.clients.contains_key(&client_id) {
            let reply = Response::from_parts(original_id, result.clone(), error.clone());
            self.send_to_client(client_id, Message::Response(reply)).await;
        }

        for (waiter, waiter_id) in core::mem::take(&mut self.init_waiters) {
            if self.clients.contains_key(&waiter) {
                let reply = Response::from_parts(waiter_id, result.clone(), error.clone());
                self.send_to_client(waiter, Message::Response(reply)).await;
            }
        }

        if let Some(bridge) = self.bridge.as_mut() {
            let actions = bridge.on_init_done();
            self.run_bridge_actions(actions).await?;
        }

        Ok(())
    }

    async fn bridge_timer(&mut self, uri: &str, generation: u64) -> anyhow::Result<()> {
        let any_non_pull = any_non_pull(&self.clients);
        if let Some(bridge) = self.bridge.as_mut() {
            let actions = bridge.on_timer(uri, generation, any_non_pull);
            self.run_bridge_actions(actions).await?;
        }
        Ok(())
    }

    async fn run_bridge_actions(&mut self, actions: Vec<BridgeAction>) -> anyhow::Result<()> {
        for action in actions {
            match action {
                BridgeAction::ArmTimer {
                    uri,
                    generation,
                    delay,
                } => {
                    let event_tx = self.event_tx.clone();
                    // Fire-and-forget: a stale generation is ignored on receipt.
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = event_tx.send(Event::BridgeTimer { uri, generation }).await;
                    });
                }
                BridgeAction::SendPull { uri } => {
                    let server_id = self.next_server_id();
                    self.pending_internal
                        .insert(server_id, InternalRequest::PullDiagnostics { uri: uri.clone() });

                    let params = match self.spec.diagnostics {
                        DiagnosticsMode::PullToPush {
                            build_request: Some(build),
                            ..
                        } => build(&uri),
                        _ => default_pull_params(&uri),
                    };

                    debug!(%uri, "Pulling diagnostics");
                    let request = Request::new(MessageId::Int(server_id), "textDocument/diagnostic", Some(params));
                    self.send_to_server(Message::Request(request)).await?;
                }
                BridgeAction::Publish { uri, items } => {
                    self.publish_diagnostics(&uri, items).await;
                }
            }
        }
        Ok(())
    }

    async fn publish_diagnostics(&mut self, uri: &str, items: Value) {
        let params = json!({ "uri": uri, "diagnostics": items });

        let targets: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, client)| !client.pull_diagnostics)
            .map(|(id, _)| *id)
            .collect();

        debug!(%uri, clients = targets.len(), "Publishing bridged diagnostics");
        for client_id in targets {
            let notification = Notification::new("textDocument/publishDiagnostics", Some(params.clone()));
            self.send_to_client(client_id, Message::Notification(notification)).await;
        }
    }

    async fn broadcast(&mut self, message: Message) {
        let targets: Vec<u64> = self.clients.keys().copied().collect();
        for client_id in targets {
            self.send_to_client(client_id, message.clone()).await;
        }
    }

    async fn send_to_client(&mut self, client_id: u64, message: Message) {
        let Some(client) = self.clients.get(&client_id) else {
            return;
        };
        if client.tx.send(message).await.is_err() {
            // The writer task is gone; removal follows through ClientGone.
            debug!(client = client_id, "Client writer is gone");
        }
    }

    async fn send_to_server(&mut self, message: Message) -> anyhow::Result<()> {
        self.server_tx
            .send(message)
            .await
            .context("server writer task is gone")
    }

    fn next_server_id(&mut self) -> i64 {
        let id = self.next_server_id;
        self.next_server_id += 1;
        id
    }

    fn next_forward_id(&mut self) -> i64 {
        let id = self.next_forward_id;
        self.next_forward_id -= 1;
        id
    }
}

fn any_non_pull(clients: &BTreeMap<u64, ClientCtx>) -> bool {
    clients.values().any(|client| !client.pull_diagnostics)
}

fn params_advertise_pull(params: Option<&Value>) -> bool {
    params
        .and_then(|params| params.pointer("/capabilities/textDocument/diagnostic"))
        .is_some()
}

fn text_document_uri(params: Option<&Value>) -> Option<&str> {
    params
        .and_then(|params| params.pointer("/textDocument/uri"))
        .and_then(Value::as_str)
}

fn default_pull_params(uri: &str) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "identifier": null,
        "previousResultId": null,
    })
}

// === internal tasks === //

async fn client_reader_task(client_id: u64, reader: ErasedReader, event_tx: mpsc::Sender<Event>) {
    let mut stream = FramedRead::new(reader, LspCodec::new());

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(message) => {
                if event_tx.send(Event::FromClient { client_id, message }).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                // A framing error drops this client only.
                debug!(client = client_id, %error, "Client stream error");
                break;
            }
        }
    }

    let _ = event_tx.send(Event::ClientGone { client_id }).await;
}

struct ClientWriterTask {
    client_id: u64,
    sink: FramedWrite<ErasedWriter, LspCodec>,
    rx: mpsc::Receiver<Message>,
    event_tx: mpsc::Sender<Event>,
}

impl ClientWriterTask {
    fn spawn(self) -> ChildTask<()> {
        ChildTask(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let Self {
            client_id,
            mut sink,
            mut rx,
            event_tx,
        } = self;

        loop {
            let Some(message) = rx.recv().await else {
                // Context dropped; nothing left to report.
                return;
            };
            if let Err(error) = sink.feed(message).await {
                debug!(client = client_id, %error, "Client write failed");
                break;
            }
            if let Err(error) = sink.flush().await {
                debug!(client = client_id, %error, "Client flush failed");
                break;
            }
        }

        // Unblock a dispatcher waiting on queue capacity before reporting.
        drop(rx);
        let _ = event_tx.send(Event::ClientGone { client_id }).await;
    }
}

struct ServerSenderTask {
    sink: FramedWrite<ErasedWriter, LspCodec>,
    rx: mpsc::Receiver<Message>,
}

impl ServerSenderTask {
    fn spawn(self) -> ChildTask<()> {
        ChildTask(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let Self { mut sink, mut rx } = self;

        while let Some(message) = rx.recv().await {
            trace!(?message, "Send to server");
            if let Err(error) = sink.feed(message).await {
                warn!(%error, "Server write failed");
                break;
            }
            if let Err(error) = sink.flush().await {
                warn!(%error, "Server flush failed");
                break;
            }
        }

        info!("Closing server sender task...");
    }
}

/// Join handle whose task is aborted on drop, so a client's reader and
/// writer die with its `ClientCtx` instead of leaking into the runtime.
#[must_use]
struct ChildTask<T>(JoinHandle<T>);

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
