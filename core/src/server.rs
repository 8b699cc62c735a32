//! Main IRC server implementation
//!
//! The [`Server`] is the single owner of [`State`]. Socket tasks feed it
//! [`Event`]s; each event is handled to completion and the resulting
//! output is flushed to the writer tasks before the next one is looked at.

use crate::client::ConnId;
use crate::connection::{ConnectionHandler, Event};
use crate::module::{Module, ModuleManager};
use crate::registration::{Registered, Registrar};
use crate::state::State;
use crate::{Config, Error, Message, MessageType, Prefix, Result};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Main IRC server
pub struct Server {
    state: State,
    modules: ModuleManager,
    registrar: Registrar,
    connections: ConnectionHandler,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self::with_state(State::new(config))
    }

    /// Server around an existing state, for tests
    pub fn with_state(state: State) -> Self {
        let (connections, events) = ConnectionHandler::new();
        Self {
            state,
            modules: ModuleManager::new(),
            registrar: Registrar::new(),
            connections,
            events: Some(events),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    /// Register a command module
    pub async fn load_module(&mut self, module: Box<dyn Module>) -> Result<()> {
        self.modules.load_module(module).await
    }

    /// Initialize the server
    pub async fn init(&mut self) -> Result<()> {
        self.state.config.validate()?;
        info!(
            "Server {} (numeric {}) initialised with modules: {}",
            self.state.config.server.name,
            self.state.clients.me_numeric(),
            self.modules.module_names().join(", ")
        );
        Ok(())
    }

    /// Bind the listeners, start autoconnect links and run the event loop
    pub async fn start(&mut self) -> Result<()> {
        let bind = self.state.config.connection.bind_address.clone();
        let ports: Vec<(u16, bool)> = self
            .state
            .config
            .connection
            .client_ports
            .iter()
            .map(|p| (*p, false))
            .chain(self.state.config.connection.server_ports.iter().map(|p| (*p, true)))
            .collect();
        for (port, server_port) in ports {
            let listener = TcpListener::bind(format!("{}:{}", bind, port)).await?;
            info!(
                "Listening on {}:{} for {}",
                bind,
                port,
                if server_port { "servers" } else { "clients" }
            );
            self.connections.spawn_listener(listener, server_port);
        }

        for link in self.state.config.links.iter().filter(|l| l.autoconnect) {
            self.connections.spawn_connect(link);
        }

        self.run().await
    }

    async fn run(&mut self) -> Result<()> {
        let mut events = self
            .events
            .take()
            .ok_or_else(|| Error::Generic("event loop already running".to_string()))?;
        let mut destruct = tokio::time::interval(Duration::from_secs(self.state.config.channels.destruct_tick.max(1)));
        let mut ping = tokio::time::interval(Duration::from_secs(self.state.config.connection.ping_interval.max(1)));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = destruct.tick() => self.state.exec_expired_destruct_events(),
                _ = ping.tick() => self.ping_connections(),
            }
            self.flush();
        }

        info!("Event loop stopped");
        Ok(())
    }

    /// Handle one event from the socket tasks (without flushing)
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted { conn, addr, server_port } => {
                self.registrar.accept(conn, Some(addr), server_port);
            }
            Event::Connected { conn, addr, link } => {
                if let Err(e) = self.registrar.connect(&mut self.state, conn, Some(addr), &link) {
                    warn!("Dropping outbound connection {}: {}", conn, e);
                    self.state.closing.push(conn);
                }
            }
            Event::Line { conn, line } => self.handle_line(conn, &line).await,
            Event::Closed { conn } => self.connection_closed(conn),
        }
    }

    async fn handle_line(&mut self, conn: ConnId, line: &str) {
        if self.registrar.is_pending(conn) {
            match self.registrar.handle_line(&mut self.state, conn, line) {
                Ok(Registered::User(id)) => debug!("Connection {} is user {}", conn, self.state.clients.name(id)),
                Ok(Registered::Server(id)) => debug!("Connection {} is server {}", conn, self.state.clients.name(id)),
                Ok(_) => {}
                Err(e) => debug!("Dropping line from connection {}: {}", conn, e),
            }
            return;
        }

        let Some(peer) = self.state.clients.by_link(conn) else {
            debug!("Line from unknown connection {}", conn);
            return;
        };
        match self.modules.dispatch(&mut self.state, conn, line).await {
            Ok(()) => {}
            Err(Error::Protocol(reason)) => {
                error!("Dropping link to {}: {}", self.state.clients.name(peer), reason);
                let error = Message::new(MessageType::Error, vec![format!("Closing Link: {}", reason)]);
                self.state.outbox.to_server(conn, &error);
                self.state.exit_server(peer, &reason, None);
            }
            Err(e) => debug!("Dropping line from connection {}: {}", conn, e),
        }
    }

    fn connection_closed(&mut self, conn: ConnId) {
        self.registrar.forget(conn);
        let Some(peer) = self.state.clients.by_link(conn) else {
            return;
        };
        if self.state.clients.is_server(peer) {
            self.state.exit_server(peer, "Connection closed", None);
        } else {
            self.state.exit_user(peer, "Connection closed", None);
        }
    }

    fn ping_connections(&mut self) {
        let me = self.state.me();
        let name = self.state.clients.me_name().to_string();
        let locals: Vec<(bool, ConnId)> = self
            .state
            .clients
            .iter()
            .filter(|c| c.is_local() && !c.is_me())
            .filter_map(|c| c.link.map(|l| (c.is_server(), l)))
            .collect();
        for (server, conn) in locals {
            if server {
                let ping = self.state.server_message(me, MessageType::Ping, vec![name.clone()]);
                self.state.outbox.to_server(conn, &ping);
            } else {
                let ping = Message::with_prefix(Prefix::Server(name.clone()), MessageType::Ping, vec![name.clone()]);
                self.state.outbox.to_user(conn, &ping);
            }
        }
    }

    /// Hand queued output to the writer tasks and close finished connections
    pub fn flush(&mut self) {
        for out in self.state.outbox.drain() {
            if let Err(e) = self.connections.send(out.conn, out.line) {
                debug!("Discarding output: {}", e);
            }
        }
        let mut closing = std::mem::take(&mut self.state.closing);
        closing.sort_unstable();
        closing.dedup();
        for conn in closing {
            self.registrar.forget(conn);
            self.connections.close(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerLink;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn server() -> Server {
        let mut config = Config::default();
        config.links.push(ServerLink {
            name: "leaf.example.net".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4400,
            password: "secret".to_string(),
            autoconnect: false,
        });
        Server::with_state(State::with_fixed_clock(config, 1000))
    }

    async fn line(s: &mut Server, conn: ConnId, text: &str) {
        s.handle_event(Event::Line { conn, line: text.to_string() }).await;
    }

    #[tokio::test]
    async fn test_registration_then_dispatch() {
        let mut s = server();
        s.handle_event(Event::Accepted { conn: 1, addr: addr(), server_port: false }).await;
        line(&mut s, 1, "NICK alice").await;
        line(&mut s, 1, "USER a 0 * :Alice").await;
        let alice = s.state().clients.find_user("alice").unwrap();
        assert_eq!(s.state().clients.get(alice).unwrap().host, "127.0.0.1");

        // No modules loaded: everything is unknown
        line(&mut s, 1, "FROB").await;
        assert!(s
            .state()
            .outbox
            .lines_for(1)
            .contains(&":irc.example.net 421 alice FROB :Unknown command"));
    }

    #[tokio::test]
    async fn test_closed_link_splits_server() {
        let mut s = server();
        s.handle_event(Event::Accepted { conn: 2, addr: addr(), server_port: true }).await;
        line(&mut s, 2, "PASS :secret").await;
        line(&mut s, 2, "SERVER leaf.example.net 1 900 1000 J10 ACAP] +s :Leaf").await;
        let leaf = s.state().clients.find_server("leaf.example.net").unwrap();
        let me = s.state().me();
        s.state_mut()
            .clients
            .add_remote_user(leaf, "ACAAA", "remote", "u", "h", None, "R", None, crate::client::ClientFlags::empty(), 900)
            .unwrap();
        assert!(s.state().clients.find_user("remote").is_some());

        s.handle_event(Event::Closed { conn: 2 }).await;
        assert!(s.state().clients.find_server("leaf.example.net").is_none());
        assert!(s.state().clients.find_user("remote").is_none());
        assert!(s.state().clients.get(me).is_some());
        s.flush();
        assert!(s.state().outbox.is_empty());
    }

    #[tokio::test]
    async fn test_closed_user_quits() {
        let mut s = server();
        s.handle_event(Event::Accepted { conn: 1, addr: addr(), server_port: false }).await;
        line(&mut s, 1, "NICK alice").await;
        line(&mut s, 1, "USER a 0 * :Alice").await;
        s.handle_event(Event::Closed { conn: 1 }).await;
        assert!(s.state().clients.find_user("alice").is_none());
        // A second close is harmless
        s.handle_event(Event::Closed { conn: 1 }).await;
    }
}
