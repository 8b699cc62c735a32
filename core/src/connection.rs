//! Connection handling and management
//!
//! Socket tasks never touch server state. Each connection gets a reader
//! task that turns lines into [`Event`]s for the event loop and a writer
//! task fed through an unbounded channel.

use crate::client::ConnId;
use crate::config::ServerLink;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

/// Longest line we will buffer before giving up on a peer
pub const MAX_LINE_LENGTH: usize = 4096;

/// What the socket tasks report to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Inbound connection on a client or server port
    Accepted {
        conn: ConnId,
        addr: SocketAddr,
        server_port: bool,
    },
    /// Outbound link connected
    Connected { conn: ConnId, addr: SocketAddr, link: String },
    /// One line, without its line ending
    Line { conn: ConnId, line: String },
    Closed { conn: ConnId },
}

struct ConnHandle {
    writer: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

/// Connection handler for client and server sockets
#[derive(Clone)]
pub struct ConnectionHandler {
    connections: Arc<DashMap<ConnId, ConnHandle>>,
    next_id: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandler {
    /// Create a new connection handler and the receiving end of its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let handler = Self {
            connections: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        };
        (handler, receiver)
    }

    /// Accept connections on `listener` until it fails
    pub fn spawn_listener(&self, listener: TcpListener, server_port: bool) {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let conn = handler.allocate_id();
                        info!("Accepted connection {} from {}", conn, addr);
                        handler.attach(stream, conn, Event::Accepted { conn, addr, server_port });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });
    }

    /// Dial a configured server link in the background
    pub fn spawn_connect(&self, link: &ServerLink) {
        let handler = self.clone();
        let name = link.name.clone();
        let target = format!("{}:{}", link.host, link.port);
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    let addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!("Connection to {} lost before registering: {}", name, e);
                            return;
                        }
                    };
                    let conn = handler.allocate_id();
                    info!("Connected to {} at {} as connection {}", name, addr, conn);
                    handler.attach(stream, conn, Event::Connected { conn, addr, link: name });
                }
                Err(e) => warn!("Cannot connect to {} ({}): {}", name, target, e),
            }
        });
    }

    fn allocate_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn attach(&self, stream: TcpStream, conn: ConnId, first: Event) {
        let (read_half, mut write_half) = stream.into_split();
        let (writer, mut outgoing) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(line) = outgoing.recv().await {
                let mut bytes = line.into_bytes();
                bytes.extend_from_slice(b"\r\n");
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Write to connection {} failed: {}", conn, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let events = self.events.clone();
        let connections = self.connections.clone();
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(next) = lines.next().await {
                match next {
                    Ok(line) if line.is_empty() => continue,
                    Ok(line) => {
                        if events.send(Event::Line { conn, line }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Read from connection {} failed: {}", conn, e);
                        break;
                    }
                }
            }
            connections.remove(&conn);
            let _ = events.send(Event::Closed { conn });
        });

        self.connections.insert(
            conn,
            ConnHandle {
                writer,
                reader: reader.abort_handle(),
            },
        );
        if self.events.send(first).is_err() {
            error!("Event loop is gone, dropping connection {}", conn);
            self.close(conn);
        }
    }

    /// Queue a line for a connection
    pub fn send(&self, conn: ConnId, line: String) -> Result<()> {
        let handle = self
            .connections
            .get(&conn)
            .ok_or_else(|| Error::Connection(format!("connection {} is gone", conn)))?;
        handle
            .writer
            .send(line)
            .map_err(|_| Error::Connection(format!("writer for connection {} is gone", conn)))
    }

    /// Close a connection once its queued lines are written
    pub fn close(&self, conn: ConnId) {
        if let Some((_, handle)) = self.connections.remove(&conn) {
            debug!("Closing connection {}", conn);
            handle.reader.abort();
            // Dropping the sender lets the writer drain and shut down
            drop(handle.writer);
            let _ = self.events.send(Event::Closed { conn });
        }
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_lines_round_trip_over_tcp() {
        let (handler, mut events) = ConnectionHandler::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        handler.spawn_listener(listener, false);

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();

        let conn = match events.recv().await.unwrap() {
            Event::Accepted { conn, server_port, .. } => {
                assert!(!server_port);
                conn
            }
            other => panic!("unexpected event {:?}", other),
        };

        write_half.write_all(b"NICK alice\r\n\r\nUSER a 0 * :A\n").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Line { conn, line: "NICK alice".into() });
        assert_eq!(events.recv().await.unwrap(), Event::Line { conn, line: "USER a 0 * :A".into() });

        handler.send(conn, ":irc.example.net 001 alice :hi".to_string()).unwrap();
        let mut reader = BufReader::new(read_half);
        let mut got = String::new();
        reader.read_line(&mut got).await.unwrap();
        assert_eq!(got, ":irc.example.net 001 alice :hi\r\n");

        handler.close(conn);
        assert!(!handler.is_open(conn));
        assert_eq!(events.recv().await.unwrap(), Event::Closed { conn });
        assert!(handler.send(conn, "late".to_string()).is_err());
    }
}
