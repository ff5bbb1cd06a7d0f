//! Server thread loops.
//!
//! One domain runs as:
//! - an engine thread, the single serialisation point for all state;
//! - one acceptor thread per listener socket;
//! - one reader and one writer thread per accepted connection.
//!
//! Readers push raw lines to the engine; writers drain per-session
//! outbound queues, so the engine never blocks on a slow peer.

mod coalesce;
mod engine;
mod session;

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

use crate::config::DomainSettings;
use crate::transport::{self, Stream, TransportError};

pub use engine::EngineEvent;

use engine::Engine;

pub type ConnId = u64;

/// A session whose outbound queue has grown past this stops having
/// further inbound work read off its socket until the peer drains it.
const SOFT_OUT_QUEUE_LIMIT: usize = 128;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running domain server.
pub struct ServerHandle {
    name: Option<String>,
    shutdown: Arc<AtomicBool>,
    events: Sender<EngineEvent>,
    engine: Option<JoinHandle<()>>,
    acceptors: Vec<JoinHandle<()>>,
    addrs: Vec<String>,
}

impl ServerHandle {
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Block until the engine exits (which, absent a shutdown call, is
    /// never).
    pub fn wait(mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
    }

    /// Stop accepting, tear down every connection and join the threads.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.events.send(EngineEvent::Shutdown);
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
        for acceptor in self.acceptors.drain(..) {
            let _ = acceptor.join();
        }
    }
}

/// Bind a domain's sockets and start its threads.
pub fn start(settings: DomainSettings) -> Result<ServerHandle, ServerError> {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for socket in &settings.sockets {
        let listener = transport::bind(socket)?;
        tracing::info!(
            domain = settings.name.as_deref().unwrap_or("-"),
            addr = %socket.addr,
            "listening"
        );
        addrs.push(socket.addr.to_string());
        listeners.push(listener);
    }

    let (event_tx, event_rx) = unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let name = settings.name.clone();

    let engine = Engine::new(settings, event_rx);
    let engine_thread = thread::Builder::new()
        .name("pf-engine".to_string())
        .spawn(move || engine.run())?;

    let conn_counter = Arc::new(AtomicU64::new(1));
    let mut acceptors = Vec::new();
    for listener in listeners {
        let tx = event_tx.clone();
        let shutdown = Arc::clone(&shutdown);
        let counter = Arc::clone(&conn_counter);
        let acceptor = thread::Builder::new()
            .name("pf-accept".to_string())
            .spawn(move || run_acceptor(listener, tx, shutdown, counter))?;
        acceptors.push(acceptor);
    }

    Ok(ServerHandle {
        name,
        shutdown,
        events: event_tx,
        engine: Some(engine_thread),
        acceptors,
        addrs,
    })
}

fn run_acceptor(
    listener: transport::Listener,
    events: Sender<EngineEvent>,
    shutdown: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("unable to make listener non-blocking: {err}");
        return;
    }
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer_addr, user_id)) => {
                let conn = counter.fetch_add(1, Ordering::Relaxed);
                spawn_connection(conn, stream, peer_addr, user_id, events.clone());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::warn!("error accepting client: {err}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn spawn_connection(
    conn: ConnId,
    stream: Stream,
    peer_addr: String,
    user_id: String,
    events: Sender<EngineEvent>,
) {
    // Accepted sockets start blocking regardless of the listener mode.
    let halves = reset_blocking(&stream)
        .and_then(|()| stream.try_clone())
        .and_then(|read_half| Ok((read_half, stream.try_clone()?)));
    let (read_half, closer) = match halves {
        Ok(halves) => halves,
        Err(err) => {
            tracing::warn!(peer = %peer_addr, "unable to set up connection: {err}");
            return;
        }
    };

    let (out_tx, out_rx) = unbounded::<String>();
    let out_probe = out_tx.clone();

    let writer = thread::Builder::new()
        .name("pf-write".to_string())
        .spawn(move || run_writer(stream, out_rx));
    if writer.is_err() {
        tracing::warn!(peer = %peer_addr, "unable to spawn writer thread");
        return;
    }

    if events
        .send(EngineEvent::Connected {
            conn,
            peer_addr: peer_addr.clone(),
            user_id,
            writer: out_tx,
            closer,
        })
        .is_err()
    {
        return;
    }

    let reader = thread::Builder::new()
        .name("pf-read".to_string())
        .spawn(move || run_reader(conn, read_half, events, out_probe));
    if reader.is_err() {
        tracing::warn!(peer = %peer_addr, "unable to spawn reader thread");
    }
}

fn reset_blocking(stream: &Stream) -> std::io::Result<()> {
    match stream {
        Stream::Unix(s) => s.set_nonblocking(false),
        Stream::Tcp(s) => s.set_nonblocking(false),
    }
}

fn run_reader(
    conn: ConnId,
    stream: Stream,
    events: Sender<EngineEvent>,
    out_probe: Sender<String>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        // Backpressure: while this peer's outbound queue is saturated,
        // stop feeding it new work.
        while out_probe.len() >= SOFT_OUT_QUEUE_LIMIT {
            thread::sleep(Duration::from_millis(5));
        }
        if events.send(EngineEvent::Line { conn, line }).is_err() {
            return;
        }
    }
    let _ = events.send(EngineEvent::Disconnected { conn });
}

fn run_writer(stream: Stream, out_rx: Receiver<String>) {
    let shutdown_handle = stream.try_clone().ok();
    let mut writer = BufWriter::new(stream);
    while let Ok(line) = out_rx.recv() {
        if write_line(&mut writer, &line).is_err() {
            return;
        }
        // Drain whatever else is queued before flushing.
        while let Ok(line) = out_rx.try_recv() {
            if write_line(&mut writer, &line).is_err() {
                return;
            }
        }
        if writer.flush().is_err() {
            return;
        }
    }
    // The engine dropped the session: everything queued has been
    // written, so close the transport; the reader unblocks on EOF.
    let _ = writer.flush();
    if let Some(handle) = shutdown_handle {
        let _ = handle.shutdown();
    }
}

fn write_line(writer: &mut BufWriter<Stream>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")
}
