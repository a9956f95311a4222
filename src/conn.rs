//! The per-connection actor.
//!
//! Every connection is one tokio task owning the socket. All state changes
//! happen in response to exactly one event at a time: a command from the
//! handle, one inbound frame, a timer firing, or the controller going away.
//! The read half lives in its own task gated by an arm-permit channel, so
//! the stream stays in single-shot read-arm mode: one frame is read per
//! permit, and a permit is only issued while a receiver is waiting on an
//! empty buffer.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::spawn;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::crypto::PublicKey;
use crate::errors::{Error, Result};
use crate::handshake::{ClientHandshake, ServerHandshake, Step};
use crate::inout::{self, FrameReader, MAX_FRAME_SIZE};
use crate::options::{ModeConfig, Options};
use crate::proto::data::{Packet, MSG_OVERHEAD};
use crate::proto::Metadata;
use crate::session::Session;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one `async_recv` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncRef(u64);

/// Notifications delivered to the controlling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An application message satisfied an asynchronous receiver.
    Message { conn: u64, payload: Vec<u8> },
    /// One asynchronous receiver timed out; any others stay queued.
    AsyncTimeout { conn: u64, handle: AsyncRef },
    /// The connection is gone. Sent at most once, and only if an
    /// asynchronous receiver was pending.
    Closed { conn: u64 },
}

/// The principal that owns asynchronous delivery for a connection.
///
/// The connection observes the controller's liveness through the channel:
/// dropping the [`Events`] mailbox reads as the controller dying, which
/// closes the connection.
#[derive(Clone)]
pub struct Controller {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl Controller {
    pub fn channel() -> (Controller, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Controller {
                id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
                tx,
            },
            Events(rx),
        )
    }
}

/// Mailbox half of a controller.
pub struct Events(mpsc::UnboundedReceiver<Event>);

impl Events {
    /// Next event; `None` once every connection owned by this controller is
    /// gone and the queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.0.recv().await
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.0.try_recv().ok()
    }
}

/// Handle to one established tunnel.
///
/// Dropping the handle drops the command channel (and the default
/// controller mailbox, when no controller was supplied), which shuts the
/// connection down.
pub struct Connection {
    id: u64,
    cmd: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    default: Option<(Controller, Events)>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The default controller's mailbox, when none was supplied in the
    /// options.
    pub fn events(&mut self) -> Option<&mut Events> {
        self.default.as_mut().map(|(_, events)| events)
    }

    /// The default controller, usable as the `current` proof when handing
    /// the connection to another controller.
    pub fn controller(&self) -> Option<&Controller> {
        self.default.as_ref().map(|(controller, _)| controller)
    }

    /// Encrypt and transmit one application message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        self.call(|tx| Command::Send(msg.to_vec(), tx)).await
    }

    /// Wait for the next application message.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.call(|tx| Command::Recv(timeout, tx)).await
    }

    /// Queue an asynchronous receiver; the message arrives at the
    /// controller as [`Event::Message`].
    pub async fn async_recv(&self, timeout: Option<Duration>) -> Result<AsyncRef> {
        self.call(|tx| Command::AsyncRecv(timeout, tx)).await
    }

    /// Remove a queued asynchronous receiver. Unknown (or already
    /// satisfied) handles succeed without effect.
    pub async fn async_cancel(&self, handle: AsyncRef) -> Result<()> {
        match self.call(|tx| Command::AsyncCancel(handle, tx)).await {
            Err(Error::Closed) => Ok(()),
            other => other,
        }
    }

    /// The peer's metadata as received during the handshake.
    pub async fn metadata(&self) -> Result<Metadata> {
        self.call(Command::Metadata).await
    }

    /// The peer's long-term public key.
    pub async fn peer_key(&self) -> Result<PublicKey> {
        self.call(Command::PeerKey).await
    }

    /// Hand asynchronous delivery over to `new`. Only the current
    /// controller may do this.
    pub async fn controlling_process(&self, current: &Controller, new: Controller) -> Result<()> {
        self.call(|tx| Command::SetController {
            current: current.id,
            new,
            reply: tx,
        })
        .await
    }

    /// Close the tunnel. Idempotent; closing an already-dead connection is
    /// not an error.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd.send(make(tx)).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

enum Command {
    Send(Vec<u8>, oneshot::Sender<Result<()>>),
    Recv(Option<Duration>, oneshot::Sender<Result<Vec<u8>>>),
    AsyncRecv(Option<Duration>, oneshot::Sender<Result<AsyncRef>>),
    AsyncCancel(AsyncRef, oneshot::Sender<Result<()>>),
    Metadata(oneshot::Sender<Result<Metadata>>),
    PeerKey(oneshot::Sender<Result<PublicKey>>),
    SetController {
        current: u64,
        new: Controller,
        reply: oneshot::Sender<Result<()>>,
    },
    Close(oneshot::Sender<()>),
}

enum Receiver {
    Sync {
        reply: oneshot::Sender<Result<Vec<u8>>>,
        deadline: Option<Instant>,
    },
    Async {
        handle: AsyncRef,
        deadline: Option<Instant>,
    },
}

impl Receiver {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Receiver::Sync { deadline, .. } | Receiver::Async { deadline, .. } => *deadline,
        }
    }
}

/// Run the handshake on `stream` and hand the connection to its actor.
pub(crate) async fn establish(
    stream: TcpStream,
    opts: Options,
    deadline: Option<Instant>,
) -> Result<Connection> {
    match deadline {
        Some(d) => timeout_at(d, handshake_then_spawn(stream, opts))
            .await
            .map_err(|_| Error::Timeout)?,
        None => handshake_then_spawn(stream, opts).await,
    }
}

async fn handshake_then_spawn(stream: TcpStream, opts: Options) -> Result<Connection> {
    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let session = match &opts.mode {
        ModeConfig::Client { server_key } => {
            let (mut machine, hello) =
                ClientHandshake::new(opts.vault.clone(), *server_key, opts.metadata.clone())?;
            inout::write_frame(&mut writer, &hello).await?;
            drive(&mut reader, &mut writer, move |packet| machine.step(packet)).await?
        }
        ModeConfig::Server {
            cookie_keys,
            registry,
        } => {
            let mut machine = ServerHandshake::new(
                opts.vault.clone(),
                cookie_keys.clone(),
                registry.clone(),
                local_addr,
                opts.metadata.clone(),
            );
            drive(&mut reader, &mut writer, move |packet| machine.step(packet)).await?
        }
    };
    debug!("[{peer_addr}] connected as {}", session.side());

    let (arm_tx, arm_rx) = mpsc::channel(1);
    let (frame_tx, frame_rx) = mpsc::channel(1);
    let reader_task = spawn(read_loop(reader, arm_rx, frame_tx));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

    let (controller, default) = match &opts.controller {
        Some(controller) => (controller.clone(), None),
        None => {
            let (controller, events) = Controller::channel();
            (controller.clone(), Some((controller, events)))
        }
    };

    let actor = ConnActor {
        id,
        writer,
        arm: arm_tx,
        frames: frame_rx,
        reader_task,
        cmds: cmd_rx,
        controller,
        session,
        armed: false,
        buf: None,
        queue: VecDeque::new(),
        next_ref: 1,
    };
    spawn(actor.run());

    Ok(Connection {
        id,
        cmd: cmd_tx,
        local_addr,
        peer_addr,
        default,
    })
}

async fn drive<F>(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    mut step: F,
) -> Result<Session>
where
    F: FnMut(Packet) -> Result<Step>,
{
    loop {
        let frame = reader.next_frame().await?;
        let packet = Packet::decode(&frame)?;
        match step(packet)? {
            Step::Send(frame) => inout::write_frame(writer, &frame).await?,
            Step::Done(done) => {
                if let Some(frame) = done.reply {
                    inout::write_frame(writer, &frame).await?;
                }
                return Ok(done.session);
            }
        }
    }
}

/// Reads exactly one frame per arm permit and hands it to the actor.
async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    mut arm: mpsc::Receiver<()>,
    frames: mpsc::Sender<std::io::Result<Vec<u8>>>,
) {
    while arm.recv().await.is_some() {
        let frame = reader.next_frame().await;
        let fatal = frame.is_err();
        if frames.send(frame).await.is_err() || fatal {
            return;
        }
    }
}

struct ConnActor {
    id: u64,
    writer: OwnedWriteHalf,
    arm: mpsc::Sender<()>,
    frames: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    reader_task: JoinHandle<()>,
    cmds: mpsc::UnboundedReceiver<Command>,
    controller: Controller,
    session: Session,
    armed: bool,
    buf: Option<Vec<u8>>,
    queue: VecDeque<Receiver>,
    next_ref: u64,
}

impl ConnActor {
    async fn run(mut self) {
        trace!("[conn {}] actor up ({})", self.id, self.session.side());
        let result = self.serve().await;
        self.shutdown(result.err()).await;
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.cmds.recv() => match cmd {
                    Some(Command::Close(reply)) => {
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(cmd) => self.on_command(cmd).await?,
                    // every handle is gone
                    None => return Ok(()),
                },
                frame = self.frames.recv(), if self.armed => {
                    self.armed = false;
                    self.on_frame(frame)?;
                }
                _ = self.controller.tx.closed() => {
                    debug!("[conn {}] controller went away", self.id);
                    return Ok(());
                }
                _ = async { sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Send(msg, reply) => {
                if msg.len() + MSG_OVERHEAD > MAX_FRAME_SIZE {
                    let _ = reply.send(Err(Error::TooLarge));
                    return Ok(());
                }
                let frame = match self.session.seal(&msg) {
                    Ok(packet) => packet.encode(),
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        return Err(e);
                    }
                };
                match inout::write_frame(&mut self.writer, &frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let e = Error::from(e);
                        let _ = reply.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
            Command::Recv(timeout, reply) => {
                self.queue.push_back(Receiver::Sync {
                    reply,
                    deadline: timeout.map(|t| Instant::now() + t),
                });
                self.process_queue()
            }
            Command::AsyncRecv(timeout, reply) => {
                let handle = AsyncRef(self.next_ref);
                self.next_ref += 1;
                let _ = reply.send(Ok(handle));
                self.queue.push_back(Receiver::Async {
                    handle,
                    deadline: timeout.map(|t| Instant::now() + t),
                });
                self.process_queue()
            }
            Command::AsyncCancel(handle, reply) => {
                self.queue
                    .retain(|r| !matches!(r, Receiver::Async { handle: h, .. } if *h == handle));
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Command::Metadata(reply) => {
                let _ = reply.send(Ok(self.session.peer_metadata().clone()));
                Ok(())
            }
            Command::PeerKey(reply) => {
                let _ = reply.send(Ok(*self.session.peer_key()));
                Ok(())
            }
            Command::SetController {
                current,
                new,
                reply,
            } => {
                if current != self.controller.id {
                    let _ = reply.send(Err(Error::NotOwner));
                } else {
                    trace!("[conn {}] controller reassigned", self.id);
                    self.controller = new;
                    let _ = reply.send(Ok(()));
                }
                Ok(())
            }
            Command::Close(reply) => {
                // handled in serve(); unreachable, but answer anyway
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    fn on_frame(&mut self, frame: Option<std::io::Result<Vec<u8>>>) -> Result<()> {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(Error::Closed),
        };
        let (n, sealed) = match Packet::decode(&frame)? {
            Packet::Msg { n, sealed } => (n, sealed),
            other => {
                return Err(Error::Unexpected {
                    got: other.kind(),
                    state: "connected",
                })
            }
        };
        if self.buf.is_some() {
            // a frame can only arrive on a permit, and permits are only
            // issued on an empty buffer
            return Err(Error::BadCount);
        }
        let payload = self.session.open(n, &sealed)?;
        trace!("[conn {}] msg {} ({} bytes)", self.id, n, payload.len());
        self.buf = Some(payload);
        self.process_queue()
    }

    /// The receive-queue processor: deliver while a message is buffered and
    /// a receiver is queued, arm for one frame when the head receiver finds
    /// the buffer empty, and otherwise do nothing.
    fn process_queue(&mut self) -> Result<()> {
        loop {
            if self.queue.is_empty() {
                return Ok(());
            }
            if self.buf.is_none() {
                return self.request_frame();
            }
            match self.queue.pop_front() {
                Some(Receiver::Sync { reply, .. }) => {
                    if reply.is_closed() {
                        // the caller gave up; don't burn the message on it
                        continue;
                    }
                    let payload = self.buf.take().unwrap_or_default();
                    let _ = reply.send(Ok(payload));
                }
                Some(Receiver::Async { .. }) => {
                    let payload = self.buf.take().unwrap_or_default();
                    let _ = self.controller.tx.send(Event::Message {
                        conn: self.id,
                        payload,
                    });
                }
                None => return Ok(()),
            }
        }
    }

    fn request_frame(&mut self) -> Result<()> {
        if !self.armed {
            self.arm.try_send(()).map_err(|_| Error::Closed)?;
            self.armed = true;
        }
        Ok(())
    }

    fn expire(&mut self, now: Instant) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for receiver in self.queue.drain(..) {
            if !receiver.deadline().is_some_and(|d| d <= now) {
                kept.push_back(receiver);
                continue;
            }
            match receiver {
                Receiver::Sync { reply, .. } => {
                    let _ = reply.send(Err(Error::Timeout));
                }
                Receiver::Async { handle, .. } => {
                    let _ = self.controller.tx.send(Event::AsyncTimeout {
                        conn: self.id,
                        handle,
                    });
                }
            }
        }
        self.queue = kept;
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().filter_map(Receiver::deadline).min()
    }

    async fn shutdown(mut self, err: Option<Error>) {
        match &err {
            Some(e) => warn!("[conn {}] terminating: {e}", self.id),
            None => debug!("[conn {}] closed", self.id),
        }
        let reason = err.unwrap_or(Error::Closed);
        let mut had_async = false;
        for receiver in self.queue.drain(..) {
            match receiver {
                Receiver::Sync { reply, .. } => {
                    let _ = reply.send(Err(reason.clone()));
                }
                Receiver::Async { .. } => had_async = true,
            }
        }
        if had_async {
            let _ = self.controller.tx.send(Event::Closed { conn: self.id });
        }
        self.reader_task.abort();
        let _ = self.writer.shutdown().await;
    }
}
