//! The session state machine: owns the TCP socket, drives the
//! disconnected → connecting → authenticated → ready lifecycle, and
//! pipelines caller requests over a single ordered stream.
//!
//! One agent thread owns the socket, the decode buffer and the pending
//! queue; callers hold a cloneable [`Session`] handle and talk to the agent
//! over a command channel paired with a `mio` readiness wake-up. Responses
//! arrive in send order, so the pending queue needs no correlation ids.

use crate::buffer::{Buffer, Ingress};
use crate::options::{Options, Target};
use crate::protocol::{self, Arg, Op, OpResponse, Scope};
use crate::record::{Rid, Schema};
use crate::support::{DriverError, DriverResult, WireError};
use crate::wire::Reader;
use ferrite::logging;
use mio::net::TcpStream;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SOCKET_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// The schema record lives at a fixed address on the schemaless cluster 0.
const SCHEMA_RID: Rid = Rid {
    cluster: 0,
    position: 1,
};
const SCHEMA_FETCH_PLAN: &str = "*:-1";

/// Bound on the write flush performed while draining.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);
const STOP_ACK_WINDOW: Duration = Duration::from_secs(2);

/// Public lifecycle of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Ready,
    Draining,
}

type Reply = mpsc::Sender<DriverResult<OpResponse>>;

/// One slot of the pending-response queue. Internal and caller requests
/// share the queue so their mutual order on the wire is preserved.
enum Pending {
    /// The `connect`/`db_open` handshake reply.
    Open,
    /// The internal schema `record_load`; carries a caller only when issued
    /// through [`Session::fetch_schema`].
    SchemaFetch { reply: Option<Reply> },
    /// An ordinary pipelined call.
    Call { op: Op, reply: Reply },
}

enum Command {
    Call {
        op: Op,
        args: Vec<Arg>,
        reply: Reply,
    },
    Cast {
        op: Op,
        args: Vec<Arg>,
    },
    FetchSchema {
        reply: Reply,
    },
    Stop {
        done: mpsc::Sender<()>,
    },
}

/// Sends a stop command once the last session handle is dropped, so the
/// agent thread never outlives its callers.
struct StopGuard {
    tx: mpsc::Sender<Command>,
    wake: SetReadiness,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let (done, _) = mpsc::channel();
        let _ = self.tx.send(Command::Stop { done });
        let _ = self.wake.set_readiness(Ready::readable());
    }
}

/// Cloneable handle to a running session agent.
#[derive(Clone)]
pub struct Session {
    tx: mpsc::Sender<Command>,
    wake: SetReadiness,
    target: Target,
    timeout: Duration,
    _guard: Arc<StopGuard>,
}

/// A dispatched request whose reply has not been awaited yet. Dropping it
/// abandons the pipeline slot: the response bytes are still drained, just
/// never delivered.
pub struct PendingReply {
    rx: mpsc::Receiver<DriverResult<OpResponse>>,
    timeout: Duration,
}

impl PendingReply {
    /// Waits with the session's default deadline.
    pub fn wait(self) -> DriverResult<OpResponse> {
        let timeout = self.timeout;
        self.wait_for(timeout)
    }

    /// Waits with an explicit deadline.
    pub fn wait_for(self, timeout: Duration) -> DriverResult<OpResponse> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DriverError::Closed),
        }
    }
}

impl Session {
    /// Opens a session against the configured target and waits for it to
    /// become ready. Fails with the handshake error when authentication or
    /// the protocol check rejects the connection.
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        log: L,
    ) -> DriverResult<Session> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let timeout = opts.timeout();
        let target = opts.connection.clone();

        let (command_tx, command_rx) = mpsc::channel();
        let (registration, wake_ready) = Registration::new2();
        let (ready_tx, ready_rx) = mpsc::channel();

        let agent = Agent::new(
            opts,
            command_rx,
            registration,
            wake_ready.clone(),
            ready_tx,
            log,
        )?;

        thread::Builder::new()
            .name("lodestone-session".to_string())
            .spawn(move || agent.run())
            .map_err(DriverError::from)?;

        let session = Session {
            tx: command_tx.clone(),
            wake: wake_ready.clone(),
            target,
            timeout,
            _guard: Arc::new(StopGuard {
                tx: command_tx,
                wake: wake_ready,
            }),
        };

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(session),
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DriverError::Closed),
        }
    }

    /// Issues an operation and waits for its reply with the default
    /// deadline.
    pub fn operation(&self, op: Op, args: Vec<Arg>) -> DriverResult<OpResponse> {
        self.dispatch(op, args)?.wait()
    }

    /// Issues an operation and waits with an explicit deadline.
    pub fn operation_deadline(
        &self,
        op: Op,
        args: Vec<Arg>,
        timeout: Duration,
    ) -> DriverResult<OpResponse> {
        self.dispatch(op, args)?.wait_for(timeout)
    }

    /// Sends an operation without waiting, returning the pending reply.
    /// Several dispatches may be in flight at once; replies arrive in
    /// dispatch order.
    pub fn dispatch(&self, op: Op, args: Vec<Arg>) -> DriverResult<PendingReply> {
        self.check_scope(op)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::Call {
            op,
            args,
            reply: reply_tx,
        })?;

        Ok(PendingReply {
            rx: reply_rx,
            timeout: self.timeout,
        })
    }

    /// Fire-and-forget send for cast-style operations such as `shutdown`.
    /// No pipeline slot is consumed and no reply is ever read.
    pub fn no_response_operation(&self, op: Op, args: Vec<Arg>) -> DriverResult<()> {
        self.check_scope(op)?;
        self.send(Command::Cast { op, args })
    }

    /// Refetches the schema record and replaces the cached property table.
    pub fn fetch_schema(&self) -> DriverResult<()> {
        if !self.target.is_database() {
            return Err(DriverError::WrongScope {
                op: "fetch_schema",
                target: self.target.scope_name(),
            });
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::FetchSchema { reply: reply_tx })?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DriverError::Closed),
        }
    }

    /// Stops the session: pending writes are flushed within a bounded
    /// window, queued callers receive `Closed`, the socket is closed and
    /// the agent thread exits.
    pub fn stop(&self) {
        let (done_tx, done_rx) = mpsc::channel();

        if self.send(Command::Stop { done: done_tx }).is_ok() {
            let _ = done_rx.recv_timeout(STOP_ACK_WINDOW);
        }
    }

    fn send(&self, command: Command) -> DriverResult<()> {
        self.tx.send(command).map_err(|_| DriverError::Closed)?;
        self.wake
            .set_readiness(Ready::readable())
            .map_err(|_| DriverError::Closed)
    }

    /// Scope misuse is a programmer error and fails synchronously, without
    /// touching the agent.
    fn check_scope(&self, op: Op) -> DriverResult<()> {
        let wrong_scope = || DriverError::WrongScope {
            op: op.name(),
            target: self.target.scope_name(),
        };

        let required = op.scope().ok_or_else(wrong_scope)?;

        let actual = match self.target {
            Target::Server => Scope::Server,
            Target::Database { .. } => Scope::Database,
        };

        if required != actual {
            return Err(wrong_scope());
        }

        Ok(())
    }
}

/// The agent: sole owner of the socket, decode buffer, pending queue and
/// every other piece of session state.
struct Agent {
    opts: Options,

    poll: Poll,
    events: Events,
    rx: mpsc::Receiver<Command>,
    _wake_registration: Registration,
    wake_ready: SetReadiness,

    stream: Option<TcpStream>,
    state: SessionState,
    session_id: i32,

    /// Pending responses, in send order.
    queue: VecDeque<Pending>,
    /// Commands received before the session became ready.
    parked: VecDeque<Command>,

    /// Unparsed bytes from prior socket reads.
    tail: Buffer,
    /// Bytes accepted for sending but not yet written out.
    egress: Buffer,

    schema: Option<Schema>,
    transaction_id: i32,
    protocol_seen: bool,

    ready_tx: Option<mpsc::Sender<DriverResult<()>>>,
    stopping: bool,
    shutdown: bool,

    log: logging::Logger,
}

impl Agent {
    fn new(
        opts: Options,
        rx: mpsc::Receiver<Command>,
        registration: Registration,
        wake_ready: SetReadiness,
        ready_tx: mpsc::Sender<DriverResult<()>>,
        log: logging::Logger,
    ) -> DriverResult<Agent> {
        let poll = Poll::new().map_err(DriverError::from)?;

        poll.register(
            &registration,
            WAKE_TOKEN,
            Ready::readable(),
            PollOpt::edge(),
        )
        .map_err(DriverError::from)?;

        Ok(Agent {
            opts,
            poll,
            events: Events::with_capacity(256),
            rx,
            _wake_registration: registration,
            wake_ready,
            stream: None,
            state: SessionState::Disconnected,
            session_id: -1,
            queue: VecDeque::new(),
            parked: VecDeque::new(),
            tail: Buffer::new(),
            egress: Buffer::new(),
            schema: None,
            transaction_id: 1,
            protocol_seen: false,
            ready_tx: Some(ready_tx),
            stopping: false,
            shutdown: false,
            log,
        })
    }

    fn run(mut self) {
        self.start_connect();

        let mut ready = Vec::with_capacity(8);

        while !self.shutdown {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                logging::error!(self.log, "poll failure"; "context" => "run", "error" => %err);
                break;
            }

            ready.clear();
            for event in &self.events {
                ready.push((event.token(), event.readiness()));
            }

            for &(token, readiness) in &ready {
                match token {
                    WAKE_TOKEN => self.on_wake(),
                    SOCKET_TOKEN => self.on_socket(readiness),
                    _ => (),
                }

                if self.shutdown {
                    break;
                }
            }
        }

        logging::debug!(self.log, "agent exited"; "context" => "run");
    }

    fn on_wake(&mut self) {
        let _ = self.wake_ready.set_readiness(Ready::empty());

        loop {
            match self.rx.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::TryRecvError::Empty) => return,
                Err(mpsc::TryRecvError::Disconnected) => {
                    if !self.shutdown {
                        let (done, _) = mpsc::channel();
                        self.drain_and_stop(done);
                    }
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match self.state {
            SessionState::Ready => match command {
                Command::Call { op, args, reply } => self.submit(op, args, reply),
                Command::Cast { op, args } => {
                    if let Err(err) = self.write_frame(op, &args) {
                        self.disconnect(err);
                    }
                }
                Command::FetchSchema { reply } => self.send_schema_fetch(Some(reply)),
                Command::Stop { done } => self.drain_and_stop(done),
            },
            SessionState::Disconnected | SessionState::Draining => match command {
                Command::Call { reply, .. } | Command::FetchSchema { reply } => {
                    let _ = reply.send(Err(DriverError::Closed));
                }
                Command::Cast { .. } => (),
                Command::Stop { done } => self.drain_and_stop(done),
            },
            // Connecting or authenticated: the pipeline is reserved for the
            // handshake and the schema fetch until the session is ready.
            SessionState::Connecting | SessionState::Authenticated => match command {
                Command::Stop { done } => self.drain_and_stop(done),
                other => self.parked.push_back(other),
            },
        }
    }

    /// Send path for an ordinary call. The queue is only touched once the
    /// write has been accepted.
    fn submit(&mut self, op: Op, mut args: Vec<Arg>, reply: Reply) {
        if op == Op::TxCommit {
            let transaction_id = self.transaction_id;
            self.transaction_id += 1;

            for arg in args.iter_mut() {
                if let Arg::TransactionId = arg {
                    *arg = Arg::Int(transaction_id);
                }
            }

            logging::debug!(self.log, "transaction id allocated";
                            "context" => "send",
                            "transaction_id" => transaction_id);
        }

        match self.write_frame(op, &args) {
            Ok(()) => self.queue.push_back(Pending::Call { op, reply }),
            Err(err) => {
                let _ = reply.send(Err(err.clone()));
                self.disconnect(err);
            }
        }
    }

    fn write_frame(&mut self, op: Op, args: &[Arg]) -> DriverResult<()> {
        if self.stream.is_none() {
            return Err(DriverError::Closed);
        }

        let mut frame = Vec::new();
        protocol::encode_request(op, self.session_id, args, &mut frame);

        logging::trace!(self.log, "request encoded";
                        "context" => "send",
                        "op" => op.name(),
                        "session_id" => self.session_id,
                        "frame_size" => frame.len());

        self.egress.extend(&frame);
        self.flush()
    }

    fn flush(&mut self) -> DriverResult<()> {
        let stream = self.stream.as_mut().expect("Flush requires a live stream");

        match self.egress.egress(stream) {
            Ok(_) => Ok(()),
            Err(err) => Err(DriverError::Transport(err.kind())),
        }
    }

    fn on_socket(&mut self, readiness: Ready) {
        if readiness.is_writable() {
            self.on_writable();
        }

        if readiness.is_readable() {
            self.on_readable();
        }
    }

    fn on_writable(&mut self) {
        if self.stream.is_none() {
            return;
        }

        if self.state == SessionState::Connecting {
            // Completion or failure of the non-blocking connect.
            let connect_error = self
                .stream
                .as_ref()
                .and_then(|stream| stream.take_error().ok())
                .and_then(|error| error);

            if let Some(err) = connect_error {
                self.disconnect(DriverError::Transport(err.kind()));
                return;
            }
        }

        if !self.egress.is_empty() {
            if let Err(err) = self.flush() {
                self.disconnect(err);
            }
        }
    }

    fn on_readable(&mut self) {
        let outcome = match self.stream.as_mut() {
            Some(stream) => self.tail.ingress(stream),
            None => return,
        };

        match outcome {
            Ok(Ingress::Drained(count)) => {
                logging::trace!(self.log, "bytes received";
                                "context" => "receive",
                                "count" => count,
                                "buffered" => self.tail.len());
                self.parse_inbound();
            }
            Ok(Ingress::Closed(_count)) => {
                // Whatever completed before the close still gets delivered.
                self.parse_inbound();

                if self.stream.is_some() {
                    self.disconnect(DriverError::Closed);
                }
            }
            Err(err) => self.disconnect(DriverError::Transport(err.kind())),
        }
    }

    /// Receive path: parse as many complete responses off the tail as the
    /// buffered bytes allow. One inbound chunk may complete several
    /// pipelined responses.
    fn parse_inbound(&mut self) {
        loop {
            if self.state == SessionState::Connecting && !self.protocol_seen {
                if self.tail.len() < 2 {
                    return;
                }

                let version = Reader::new(self.tail.data())
                    .read_u16()
                    .expect("two bytes are buffered");
                self.tail.consume(2);
                self.protocol_seen = true;

                logging::debug!(self.log, "server protocol announced";
                                "context" => "handshake",
                                "version" => version);

                if version < self.opts.min_protocol {
                    self.disconnect(DriverError::UnsupportedProtocol(version));
                    return;
                }

                self.send_open();
                if self.stream.is_none() {
                    return;
                }
                continue;
            }

            if self.tail.is_empty() {
                return;
            }

            // Push frames do not belong to any pipeline slot.
            if self.tail.data()[0] == protocol::STATUS_PUSH {
                match protocol::decode_push(self.tail.data()) {
                    Ok(consumed) => {
                        logging::debug!(self.log, "push frame skipped";
                                        "context" => "receive",
                                        "size" => consumed);
                        self.tail.consume(consumed);
                        continue;
                    }
                    Err(WireError::Wait) => return,
                    Err(_) => {
                        self.dead_frame();
                        return;
                    }
                }
            }

            let op = match self.queue.front() {
                Some(Pending::Open) => match self.opts.connection {
                    Target::Server => Op::Connect,
                    Target::Database { .. } => Op::DbOpen,
                },
                Some(Pending::SchemaFetch { .. }) => Op::RecordLoad,
                Some(Pending::Call { op, .. }) => *op,
                // Bytes with no request in flight: stash until one exists.
                None => return,
            };

            match protocol::decode_response(op, self.tail.data(), self.schema.as_ref()) {
                Err(WireError::Wait) => return,
                Err(_) => {
                    self.dead_frame();
                    return;
                }
                Ok((response, consumed)) => {
                    self.tail.consume(consumed);
                    let entry = self.queue.pop_front().expect("queue head vanished");

                    if !self.deliver(entry, response) {
                        return;
                    }
                }
            }
        }
    }

    /// Routes one parsed response to its pending slot. Returns false when
    /// the session tore itself down in the process.
    fn deliver(&mut self, entry: Pending, response: protocol::Response) -> bool {
        match entry {
            Pending::Open => self.finish_open(response),
            Pending::SchemaFetch { reply } => self.finish_schema_fetch(reply, response),
            Pending::Call { op, reply } => {
                if response.session_id != self.session_id {
                    logging::warn!(self.log, "session id mismatch in response";
                                   "context" => "receive",
                                   "op" => op.name(),
                                   "expected" => self.session_id,
                                   "received" => response.session_id);
                }

                // A failed send means the caller abandoned the slot (for
                // example after a timeout); the bytes are already drained,
                // so the reply is simply discarded.
                let _ = reply.send(response.body);
                true
            }
        }
    }

    fn finish_open(&mut self, response: protocol::Response) -> bool {
        match response.body {
            Ok(OpResponse::Opened(opened)) => {
                // On the handshake the status line carries the newly issued
                // session id.
                self.session_id = response.session_id;

                logging::debug!(self.log, "session authenticated";
                                "context" => "handshake",
                                "session_id" => self.session_id,
                                "clusters" => opened.clusters.len(),
                                "release" => opened.release.as_deref().unwrap_or(""));

                self.state = SessionState::Authenticated;

                if self.opts.connection.is_database() {
                    self.send_schema_fetch(None);
                    self.stream.is_some()
                } else {
                    self.become_ready();
                    true
                }
            }
            Ok(_) => {
                self.disconnect(DriverError::MalformedResponse("unexpected handshake payload"));
                false
            }
            Err(DriverError::Server(pairs)) => {
                let (class, message) = pairs.into_iter().next().unwrap_or_default();
                self.disconnect(DriverError::AuthFailed(class, message));
                false
            }
            Err(err) => {
                self.disconnect(err);
                false
            }
        }
    }

    fn finish_schema_fetch(&mut self, reply: Option<Reply>, response: protocol::Response) -> bool {
        let outcome = match response.body {
            Ok(OpResponse::Records(records)) => match records.first() {
                Some(record) => Schema::from_document(&record.document).map_err(DriverError::from),
                None => Err(DriverError::MalformedResponse("empty schema record")),
            },
            Ok(_) => Err(DriverError::MalformedResponse("unexpected schema payload")),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(schema) => {
                logging::debug!(self.log, "schema cached";
                                "context" => "schema",
                                "properties" => schema.len());
                self.schema = Some(schema);

                if let Some(reply) = reply {
                    let _ = reply.send(Ok(OpResponse::Unit));
                }

                if self.state == SessionState::Authenticated {
                    self.become_ready();
                }

                true
            }
            Err(err) => {
                // A session without a schema cannot decode schemaful
                // records; tear it down.
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.clone()));
                }

                self.disconnect(err);
                false
            }
        }
    }

    fn become_ready(&mut self) {
        self.state = SessionState::Ready;

        logging::info!(self.log, "session ready";
                       "context" => "handshake",
                       "session_id" => self.session_id,
                       "target" => self.opts.connection.scope_name());

        if let Some(ready) = self.ready_tx.take() {
            let _ = ready.send(Ok(()));
        }

        // Requests that arrived while the handshake was in flight.
        let parked: Vec<Command> = self.parked.drain(..).collect();
        for command in parked {
            self.handle_command(command);
        }
    }

    fn send_open(&mut self) {
        let args = match &self.opts.connection {
            Target::Server => protocol::connect_args(&self.opts.user, &self.opts.password),
            Target::Database { name, kind } => {
                protocol::db_open_args(name, *kind, &self.opts.user, &self.opts.password)
            }
        };

        let op = match self.opts.connection {
            Target::Server => Op::Connect,
            Target::Database { .. } => Op::DbOpen,
        };

        match self.write_frame(op, &args) {
            Ok(()) => self.queue.push_back(Pending::Open),
            Err(err) => self.disconnect(err),
        }
    }

    fn send_schema_fetch(&mut self, reply: Option<Reply>) {
        let args = vec![
            Arg::Rid(SCHEMA_RID),
            Arg::Str(SCHEMA_FETCH_PLAN.to_string()),
            Arg::Bool(true),  // ignore cache
            Arg::Bool(false), // load tombstones
        ];

        logging::debug!(self.log, "fetching schema";
                        "context" => "schema",
                        "rid" => %SCHEMA_RID);

        match self.write_frame(Op::RecordLoad, &args) {
            Ok(()) => self.queue.push_back(Pending::SchemaFetch { reply }),
            Err(err) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.clone()));
                }

                self.disconnect(err);
            }
        }
    }

    /// The stream cannot be resynchronized once a frame fails to parse: the
    /// head caller learns why, everyone behind it gets the disconnect.
    fn dead_frame(&mut self) {
        if let Some(entry) = self.queue.pop_front() {
            let reply = match entry {
                Pending::Call { reply, .. } => Some(reply),
                Pending::SchemaFetch { reply } => reply,
                Pending::Open => None,
            };

            if let Some(reply) = reply {
                let _ = reply.send(Err(DriverError::MalformedResponse("unparseable frame")));
            }
        }

        self.disconnect(DriverError::MalformedResponse("unparseable frame"));
    }

    fn start_connect(&mut self) {
        self.state = SessionState::Connecting;
        self.protocol_seen = false;

        logging::debug!(self.log, "connecting";
                        "context" => "connect",
                        "host" => %self.opts.host,
                        "port" => self.opts.port);

        let address = match resolve(&self.opts.host, self.opts.port) {
            Ok(address) => address,
            Err(err) => {
                self.connect_failed(DriverError::Transport(err.kind()));
                return;
            }
        };

        let stream = match TcpStream::connect(&address) {
            Ok(stream) => stream,
            Err(err) => {
                self.connect_failed(DriverError::Transport(err.kind()));
                return;
            }
        };

        self.tune_socket(&stream);

        if let Err(err) = self.poll.register(
            &stream,
            SOCKET_TOKEN,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        ) {
            self.connect_failed(DriverError::Transport(err.kind()));
            return;
        }

        self.stream = Some(stream);
    }

    fn connect_failed(&mut self, cause: DriverError) {
        logging::warn!(self.log, "connect failed";
                       "context" => "connect",
                       "cause" => ?cause);

        if let Some(ready) = self.ready_tx.take() {
            let _ = ready.send(Err(cause));
        }

        self.state = SessionState::Disconnected;
    }

    /// Raises the kernel send/receive buffers to the max of their current
    /// sizes and the configured floor, and applies nodelay.
    fn tune_socket(&self, stream: &TcpStream) {
        let send = stream.send_buffer_size().unwrap_or(0);
        let recv = stream.recv_buffer_size().unwrap_or(0);
        let size = send.max(recv).max(self.opts.socket.buffer_size);

        if let Err(err) = stream.set_send_buffer_size(size) {
            logging::warn!(self.log, "send buffer tuning failed";
                           "context" => "connect", "error" => %err);
        }

        if let Err(err) = stream.set_recv_buffer_size(size) {
            logging::warn!(self.log, "recv buffer tuning failed";
                           "context" => "connect", "error" => %err);
        }

        if let Err(err) = stream.set_nodelay(self.opts.socket.nodelay) {
            logging::warn!(self.log, "nodelay tuning failed";
                           "context" => "connect", "error" => %err);
        }
    }

    /// Tears the connection down: every queued and parked caller receives
    /// exactly one `Closed`, the transaction counter and session id reset,
    /// and a reconnect is scheduled when configured and the session had
    /// been established.
    fn disconnect(&mut self, cause: DriverError) {
        let was_established = matches!(
            self.state,
            SessionState::Authenticated | SessionState::Ready
        );

        logging::info!(self.log, "session disconnected";
                       "context" => "disconnect",
                       "cause" => ?cause,
                       "pending" => self.queue.len(),
                       "parked" => self.parked.len());

        if let Some(stream) = self.stream.take() {
            let _ = self.poll.deregister(&stream);
        }

        for entry in self.queue.drain(..) {
            let reply = match entry {
                Pending::Call { reply, .. } => Some(reply),
                Pending::SchemaFetch { reply } => reply,
                Pending::Open => None,
            };

            if let Some(reply) = reply {
                let _ = reply.send(Err(DriverError::Closed));
            }
        }

        for command in self.parked.drain(..) {
            match command {
                Command::Call { reply, .. } | Command::FetchSchema { reply } => {
                    let _ = reply.send(Err(DriverError::Closed));
                }
                _ => (),
            }
        }

        self.tail.clear();
        self.egress.clear();
        self.schema = None;
        self.session_id = -1;
        self.transaction_id = 1;
        self.protocol_seen = false;

        let initial = match self.ready_tx.take() {
            Some(ready) => {
                let _ = ready.send(Err(cause));
                true
            }
            None => false,
        };

        self.state = SessionState::Disconnected;

        if was_established && !initial && !self.stopping && self.opts.reconnect {
            logging::info!(self.log, "reconnecting"; "context" => "disconnect");
            self.start_connect();
        }
    }

    fn drain_and_stop(&mut self, done: mpsc::Sender<()>) {
        self.stopping = true;
        self.state = SessionState::Draining;

        logging::info!(self.log, "stopping session";
                       "context" => "stop",
                       "pending_writes" => self.egress.len(),
                       "pending_calls" => self.queue.len());

        // Finish pending writes within a bounded window.
        let deadline = Instant::now() + DRAIN_WINDOW;

        while self.stream.is_some() && !self.egress.is_empty() {
            if self.flush().is_err() || self.egress.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            if self.poll.poll(&mut self.events, Some(deadline - now)).is_err() {
                break;
            }
        }

        self.disconnect(DriverError::Closed);
        let _ = done.send(());
        self.shutdown = true;
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address for host"))
}
