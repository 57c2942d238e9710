use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use crate::config;
use crate::logging::{LogLevel, Logger};
use crate::registry::{Channel, ConnectionId};
use crate::wire::codec::{FrameReader, WireCodec};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl From<&config::ServerConfig> for ServerConfig {
    fn from(value: &config::ServerConfig) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port,
            tls_enabled: value.tls_enabled,
            read_timeout_ms: value.read_timeout_ms,
            write_timeout_ms: value.write_timeout_ms,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    TlsNotSupportedYet,
    ConfigureAcceptedStream { source: io::Error },
    StreamClone { source: io::Error },
    SpawnReader { source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::TlsNotSupportedYet => {
                write!(f, "TLS is enabled in config but TLS transport is not implemented yet")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
            Self::SpawnReader { source } => {
                write!(f, "failed to spawn connection reader thread: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// Callbacks the transport raises for every connection it owns.
pub trait ConnectionEvents: Send + Sync {
    fn on_connect(&self, channel: Arc<dyn Channel>);

    /// `frame` is one complete length-prefixed frame, header included.
    fn on_message(&self, connection_id: ConnectionId, frame: &[u8]);

    fn on_disconnect(&self, connection_id: ConnectionId);
}

/// Full-duplex TCP connection. Reads happen on a dedicated reader thread;
/// writes may come from any thread and are serialized per connection.
pub struct PersistentConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    // Shut down outside the writer lock so close never queues behind a
    // blocked write.
    control: TcpStream,
    closed: AtomicBool,
}

/// Zero in config means no timeout.
#[derive(Clone, Copy, Debug)]
struct SocketTimeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

impl SocketTimeouts {
    fn from_millis(read_ms: u64, write_ms: u64) -> Self {
        Self {
            read: (read_ms > 0).then(|| Duration::from_millis(read_ms)),
            write: (write_ms > 0).then(|| Duration::from_millis(write_ms)),
        }
    }
}

impl PersistentConnection {
    fn new(
        id: ConnectionId,
        stream: &TcpStream,
        peer_addr: SocketAddr,
        timeouts: SocketTimeouts,
    ) -> Result<Self, ServerError> {
        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_nodelay(true))
            .and_then(|()| stream.set_read_timeout(timeouts.read))
            .and_then(|()| stream.set_write_timeout(timeouts.write))
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;
        let control = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            writer: Mutex::new(writer),
            control,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for PersistentConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        let mut writer = self.writer.lock();
        let written = writer.write_all(frame).and_then(|()| writer.flush());
        if written.is_err() {
            // A timed-out or failed write may leave half a frame on the
            // wire; the peer can no longer find frame boundaries.
            self.close();
        }
        written
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

struct ActiveConnection {
    connection: Arc<PersistentConnection>,
    reader: JoinHandle<()>,
}

type ActiveConnections = Arc<Mutex<HashMap<ConnectionId, ActiveConnection>>>;

pub struct TcpServer {
    listener: TcpListener,
    codec: WireCodec,
    timeouts: SocketTimeouts,
    logger: Arc<Logger>,
    next_connection_id: AtomicU64,
    active_connections: ActiveConnections,
}

impl TcpServer {
    pub fn bind(
        config: &ServerConfig,
        codec: WireCodec,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError> {
        if config.tls_enabled {
            return Err(ServerError::TlsNotSupportedYet);
        }

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            codec,
            timeouts: SocketTimeouts::from_millis(
                config.read_timeout_ms,
                config.write_timeout_ms,
            ),
            logger,
            next_connection_id: AtomicU64::new(1),
            active_connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn from_app_config(
        app_config: &config::AppConfig,
        logger: Arc<Logger>,
    ) -> Result<Self, ServerError> {
        Self::bind(
            &ServerConfig::from(&app_config.server),
            WireCodec::from_app_config(app_config),
            logger,
        )
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts at most one pending connection, raises `on_connect` and starts
    /// its reader. Returns `Ok(None)` when nothing is waiting.
    pub fn try_accept_persistent(
        &self,
        events: &Arc<dyn ConnectionEvents>,
    ) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::ConfigureAcceptedStream { source }),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(PersistentConnection::new(
            id,
            &stream,
            peer_addr,
            self.timeouts,
        )?);
        events.on_connect(Arc::clone(&connection) as Arc<dyn Channel>);

        // Hold the map lock across spawn so the reader cannot deregister
        // itself before it was inserted.
        let mut active = self.active_connections.lock();
        let reader = ConnectionReader {
            stream,
            connection: Arc::clone(&connection),
            frames: FrameReader::new(self.codec),
            events: Arc::clone(events),
            logger: Arc::clone(&self.logger),
            active_connections: Arc::clone(&self.active_connections),
        };
        let handle = match thread::Builder::new()
            .name(format!("conn-reader-{id}"))
            .spawn(move || reader.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                drop(active);
                connection.close();
                events.on_disconnect(id);
                return Err(ServerError::SpawnReader { source });
            }
        };
        active.insert(
            id,
            ActiveConnection {
                connection: Arc::clone(&connection),
                reader: handle,
            },
        );
        drop(active);

        self.logger.log(
            LogLevel::Info,
            Some("server"),
            "Accepted persistent full-duplex TCP connection",
            Some(json!({
                "connection_id": id,
                "peer_addr": peer_addr.to_string(),
            })),
        );
        Ok(Some(connection))
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.lock().len()
    }

    /// Closes every socket and waits for the readers, which raise
    /// `on_disconnect` on their way out.
    pub fn shutdown_all_connections(&self) {
        let drained: Vec<ActiveConnection> = self
            .active_connections
            .lock()
            .drain()
            .map(|(_, active)| active)
            .collect();

        for active in &drained {
            active.connection.close();
        }
        let closed = drained.len();
        for active in drained {
            let _ = active.reader.join();
        }
        self.logger.log(
            LogLevel::Info,
            Some("server"),
            "All connections closed",
            Some(json!({ "closed": closed })),
        );
    }
}

struct ConnectionReader {
    stream: TcpStream,
    connection: Arc<PersistentConnection>,
    frames: FrameReader,
    events: Arc<dyn ConnectionEvents>,
    logger: Arc<Logger>,
    active_connections: ActiveConnections,
}

impl ConnectionReader {
    fn run(mut self) {
        let id = self.connection.id();
        let reason = self.read_until_closed();
        self.connection.close();
        self.active_connections.lock().remove(&id);
        self.logger.log(
            LogLevel::Info,
            Some("server::reader"),
            "Connection closed",
            Some(json!({
                "connection_id": id,
                "peer_addr": self.connection.peer_addr().to_string(),
                "reason": reason,
            })),
        );
        self.events.on_disconnect(id);
    }

    fn read_until_closed(&mut self) -> String {
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            if self.connection.is_closed() {
                return "closed by master".to_owned();
            }
            let read = match self.stream.read(&mut chunk) {
                Ok(0) => return "peer closed the connection".to_owned(),
                Ok(read) => read,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(error) => return format!("socket read error: {error}"),
            };

            self.frames.push(&chunk[..read]);
            loop {
                match self.frames.next_frame() {
                    Ok(Some(frame)) => self.events.on_message(self.connection.id(), &frame),
                    Ok(None) => break,
                    // Frame boundaries are lost; the stream cannot be resynchronised.
                    Err(error) => return format!("wire framing error: {error}"),
                }
            }
        }
    }
}
