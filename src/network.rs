use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::decoder::{self, Dropped, ExportFormat, ExportReader, Record};
use crate::error::{Error, Result};
use crate::model::{DecodedPacket, RawFrame};

/// Port the exporter is pointed at unless configured otherwise.
pub const DEFAULT_PORT: u16 = 5123;

/// Largest datagram we accept.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Pause after a failed receive before trying again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub export_format: ExportFormat,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            export_format: ExportFormat::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    decoded: AtomicU64,
    dropped: AtomicU64,
    empty: AtomicU64,
    receive_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Receive-side counters for one listener run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub datagrams: u64,
    pub bytes: u64,
    /// Frames handed to the sink.
    pub decoded: u64,
    /// Datagrams or frames that could not be decoded.
    pub dropped: u64,
    /// Frames with a blank payload.
    pub empty: u64,
    pub receive_errors: u64,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Owns the receiving socket and the task that drains it.
///
/// `start` binds before returning, so frames sent as soon as it resolves
/// are not lost. `stop` cancels the receive loop, waits for it, and drops
/// the socket; once it returns the sink will not be called again.
pub struct PacketListener {
    config: ListenerConfig,
    counters: Arc<Counters>,
    running: Option<Running>,
}

impl PacketListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    /// Bind the endpoint and spawn the receive loop. Each decoded packet is
    /// passed to `sink` synchronously from the loop.
    pub async fn start<F>(&mut self, sink: F) -> Result<SocketAddr>
    where
        F: FnMut(DecodedPacket) + Send + 'static,
    {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let addr = self.config.bind;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        self.counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            socket,
            cancel.clone(),
            ExportReader::new(self.config.export_format),
            Arc::clone(&self.counters),
            sink,
        ));

        log::info!("Listening for exported frames on {}", local_addr);
        self.running = Some(Running {
            cancel,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop the receive loop and close the socket. No-op when not running.
    pub async fn stop(&mut self) -> ListenerStats {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                log::error!("Receive loop on {} ended abnormally: {}", running.local_addr, e);
            }
            log::info!("Listener on {} stopped", running.local_addr);
        }
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }
}

impl Drop for PacketListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for PacketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketListener")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

async fn receive_loop<F>(
    socket: UdpSocket,
    cancel: CancellationToken,
    mut reader: ExportReader,
    counters: Arc<Counters>,
    mut sink: F,
) where
    F: FnMut(DecodedPacket),
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r.map(|(len, _)| len),
        };

        if !on_receive(received, &buf, &mut reader, &counters, &mut sink) {
            // Errors such as ENOBUFS can repeat immediately.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
            }
        }
    }
}

/// Account for one `recv_from` outcome. Returns `false` on a receive error,
/// which is logged and counted but never ends the loop.
fn on_receive<F>(
    received: io::Result<usize>,
    buf: &[u8],
    reader: &mut ExportReader,
    counters: &Counters,
    sink: &mut F,
) -> bool
where
    F: FnMut(DecodedPacket),
{
    match received {
        Ok(len) => {
            Counters::bump(&counters.datagrams, 1);
            Counters::bump(&counters.bytes, len as u64);
            handle_datagram(&buf[..len], reader, counters, sink);
            true
        }
        Err(e) => {
            Counters::bump(&counters.receive_errors, 1);
            log::warn!("Receive error: {}", e);
            false
        }
    }
}

fn handle_datagram<F>(
    datagram: &[u8],
    reader: &mut ExportReader,
    counters: &Counters,
    sink: &mut F,
) where
    F: FnMut(DecodedPacket),
{
    let received_at = Local::now();
    let (data, link_type) = match reader.read(datagram) {
        Record::Header { .. } => return,
        Record::Invalid => {
            Counters::bump(&counters.dropped, 1);
            return;
        }
        Record::Frame { data, link_type } => (data, link_type),
    };

    match decoder::decode(&RawFrame::new(data, received_at, link_type)) {
        Ok(packet) => {
            Counters::bump(&counters.decoded, 1);
            sink(packet);
        }
        Err(Dropped::EmptyPayload) => Counters::bump(&counters.empty, 1),
        Err(_) => Counters::bump(&counters.dropped, 1),
    }
}
