//! Connection registration
//!
//! A connection is "pending" until it has either registered as a user
//! (`NICK` + `USER`) or as a server link (`PASS` + `SERVER`). Once
//! registered it lives in the client table and its lines go to the
//! [`ModuleManager`](crate::ModuleManager) instead.

use crate::burst::{send_net_burst, server_intro, user_intro};
use crate::client::{ClientFlags, ClientId, ConnId};
use crate::modes::available_modes;
use crate::numeric::NumericReply;
use crate::state::State;
use crate::{matching, Message, MessageType, Prefix, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Protocol announced in our SERVER line while bursting
const PROTOCOL: &str = "J10";

/// Outcome of a line from a pending connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// Still waiting for more
    Pending,
    User(ClientId),
    Server(ClientId),
    /// Refused; the connection is being closed
    Rejected,
}

#[derive(Debug, Clone, Default)]
struct Pending {
    addr: Option<SocketAddr>,
    server_port: bool,
    /// Link we dialed ourselves
    outbound: Option<String>,
    password: Option<String>,
    nick: Option<String>,
    username: Option<String>,
    realname: String,
}

/// Connections that have not registered yet
#[derive(Debug, Default)]
pub struct Registrar {
    pending: HashMap<ConnId, Pending>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was accepted on one of our ports
    pub fn accept(&mut self, conn: ConnId, addr: Option<SocketAddr>, server_port: bool) {
        debug!("Connection {} pending registration (server port: {})", conn, server_port);
        self.pending.insert(
            conn,
            Pending {
                addr,
                server_port,
                ..Pending::default()
            },
        );
    }

    /// We connected out to `link`; introduce ourselves
    pub fn connect(&mut self, state: &mut State, conn: ConnId, addr: Option<SocketAddr>, link: &str) -> Result<()> {
        let password = state
            .config
            .get_server_link(link)
            .map(|l| l.password.clone())
            .ok_or_else(|| crate::Error::Config(format!("No link block for {}", link)))?;
        self.pending.insert(
            conn,
            Pending {
                addr,
                server_port: true,
                outbound: Some(link.to_string()),
                ..Pending::default()
            },
        );
        send_server_hello(state, conn, &password);
        info!("Connecting to {} on connection {}", link, conn);
        Ok(())
    }

    pub fn is_pending(&self, conn: ConnId) -> bool {
        self.pending.contains_key(&conn)
    }

    /// Drop a connection that went away before registering
    pub fn forget(&mut self, conn: ConnId) {
        self.pending.remove(&conn);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Handle one line from a pending connection
    pub fn handle_line(&mut self, state: &mut State, conn: ConnId, line: &str) -> Result<Registered> {
        if !self.pending.contains_key(&conn) {
            return Err(crate::Error::Connection(format!("connection {} is not pending", conn)));
        }
        let message = Message::parse(line)?;

        match message.command {
            MessageType::Password => {
                if let (Some(pending), Some(pass)) = (self.pending.get_mut(&conn), message.param(0)) {
                    pending.password = Some(pass.to_string());
                }
                Ok(Registered::Pending)
            }
            MessageType::Nick => self.nick(state, conn, &message),
            MessageType::User => self.user(state, conn, &message),
            MessageType::Server => self.server(state, conn, &message),
            MessageType::Ping => {
                let me = state.clients.me_name().to_string();
                let token = message.param(0).unwrap_or(&me).to_string();
                let pong = Message::with_prefix(Prefix::Server(me.clone()), MessageType::Pong, vec![me, token]);
                state.outbox.to_user(conn, &pong);
                Ok(Registered::Pending)
            }
            MessageType::Pong => Ok(Registered::Pending),
            MessageType::Quit | MessageType::Error => Ok(self.reject(state, conn, "Client quit")),
            _ => {
                reply(state, conn, "*", NumericReply::not_registered());
                Ok(Registered::Pending)
            }
        }
    }

    fn nick(&mut self, state: &mut State, conn: ConnId, message: &Message) -> Result<Registered> {
        let Some(nick) = message.param(0).filter(|n| !n.is_empty()) else {
            reply(state, conn, "*", NumericReply::no_nickname_given());
            return Ok(Registered::Pending);
        };
        if !matching::is_valid_nick(nick) {
            reply(state, conn, "*", NumericReply::erroneous_nickname(nick));
            return Ok(Registered::Pending);
        }
        if state.clients.name_in_use(nick) {
            reply(state, conn, "*", NumericReply::nickname_in_use(nick));
            return Ok(Registered::Pending);
        }
        if let Some(pending) = self.pending.get_mut(&conn) {
            pending.nick = Some(nick.to_string());
        }
        self.try_complete_user(state, conn)
    }

    fn user(&mut self, state: &mut State, conn: ConnId, message: &Message) -> Result<Registered> {
        if message.params.len() < 4 {
            reply(state, conn, "*", NumericReply::need_more_params("USER"));
            return Ok(Registered::Pending);
        }
        if let Some(pending) = self.pending.get_mut(&conn) {
            pending.username = Some(message.params[0].chars().take(matching::USERLEN).collect());
            pending.realname = message.params[3].clone();
        }
        self.try_complete_user(state, conn)
    }

    fn try_complete_user(&mut self, state: &mut State, conn: ConnId) -> Result<Registered> {
        let ready = self
            .pending
            .get(&conn)
            .map_or(false, |p| p.nick.is_some() && p.username.is_some());
        if !ready {
            return Ok(Registered::Pending);
        }
        let Some(pending) = self.pending.remove(&conn) else {
            return Ok(Registered::Pending);
        };
        if pending.server_port {
            return Ok(self.reject(state, conn, "Users are not allowed on server ports"));
        }
        let local_users = state.clients.iter().filter(|c| c.is_user() && c.is_local()).count();
        if local_users >= state.config.server.max_clients {
            return Ok(self.reject(state, conn, "Server is full"));
        }

        let nick = pending.nick.unwrap_or_default();
        let username = pending.username.unwrap_or_default();
        let ip = pending.addr.map(|a| a.ip());
        let host = ip.map_or_else(|| "localhost".to_string(), |ip| ip.to_string());
        let now = state.now();
        let id = match state
            .clients
            .add_local_user(&nick, &username, &host, ip, &pending.realname, conn, now)
        {
            Ok(id) => id,
            Err(e) => {
                // Lost a race for the nick with a remote introduction
                debug!("Registration of {} failed: {}", nick, e);
                reply(state, conn, "*", NumericReply::nickname_in_use(&nick));
                self.pending.insert(
                    conn,
                    Pending {
                        nick: None,
                        username: Some(username),
                        ..pending
                    },
                );
                return Ok(Registered::Pending);
            }
        };

        info!("User {}!{}@{} registered on connection {}", nick, username, host, conn);
        let me_name = state.clients.me_name().to_string();
        let version = concat!("tsircd-", env!("CARGO_PKG_VERSION"));
        let chanmodes = available_modes(state.caps);
        state.send_numeric(id, NumericReply::welcome(&me_name, &nick, &username, &host));
        state.send_numeric(id, NumericReply::your_host(&me_name, version));
        let started = state.clients.get(state.me()).map_or(0, |c| c.timestamp);
        state.send_numeric(id, NumericReply::created(&started.to_string()));
        state.send_numeric(id, NumericReply::my_info(&me_name, version, &chanmodes));

        if let Some(intro) = user_intro(state, id) {
            state.send_to_servers(&intro, None);
        }
        Ok(Registered::User(id))
    }

    fn server(&mut self, state: &mut State, conn: ConnId, message: &Message) -> Result<Registered> {
        let Some(pending) = self.pending.get(&conn).cloned() else {
            return Ok(Registered::Rejected);
        };
        if !pending.server_port {
            return Ok(self.reject(state, conn, "Servers are not allowed on client ports"));
        }
        if message.params.len() < 7 {
            return Ok(self.reject(state, conn, "Bad SERVER line"));
        }
        let name = message.params[0].as_str();
        let hop = message.params[1].parse::<u32>().unwrap_or(0);
        let link_ts = message.params[3].parse::<i64>().unwrap_or_else(|_| state.now());
        let protocol = message.params[4].as_str();
        let numcap = message.params[5].as_str();
        let description = message.params.last().cloned().unwrap_or_default();

        if hop != 1 || !(protocol.ends_with("10")) || numcap.len() != 5 {
            return Ok(self.reject(state, conn, "Bad SERVER line"));
        }
        let Some(link) = state.config.get_server_link(name).cloned() else {
            warn!("Unauthorized server {} on connection {}", name, conn);
            return Ok(self.reject(state, conn, "No link block for your server"));
        };
        if pending.password.as_deref() != Some(link.password.as_str()) {
            warn!("Bad link password from {}", name);
            return Ok(self.reject(state, conn, "Password mismatch"));
        }
        if let Some(outbound) = &pending.outbound {
            if !outbound.eq_ignore_ascii_case(name) {
                return Ok(self.reject(state, conn, "Unexpected server name"));
            }
        }
        let numeric = &numcap[..2];
        if state.clients.find_server(name).is_some() || state.clients.find_by_numeric(numeric).is_some() {
            return Ok(self.reject(state, conn, "Server exists"));
        }

        if pending.outbound.is_none() {
            send_server_hello(state, conn, &link.password);
        }
        let me = state.me();
        let id = match state.clients.add_server(me, name, numeric, &description, Some(conn), link_ts) {
            Ok(id) => id,
            Err(e) => {
                warn!("Cannot register server {}: {}", name, e);
                return Ok(self.reject(state, conn, "Server exists"));
            }
        };
        self.pending.remove(&conn);
        if let Some(server) = state.clients.get_mut(id) {
            server.flags.insert(ClientFlags::BURST | ClientFlags::BURST_ACK);
        }
        if state.config.is_uworld(name) {
            if let Some(server) = state.clients.get_mut(id) {
                server.flags.insert(ClientFlags::UWORLD);
            }
        }

        info!("Link with {} ({}) established on connection {}", name, numeric, conn);
        if let Some(intro) = server_intro(state, id) {
            state.send_to_servers(&intro, Some(conn));
        }
        send_net_burst(state, conn);
        state.sendto_opmask(&format!("Link with {} established.", name));
        Ok(Registered::Server(id))
    }

    fn reject(&mut self, state: &mut State, conn: ConnId, reason: &str) -> Registered {
        info!("Rejecting connection {}: {}", conn, reason);
        self.pending.remove(&conn);
        let error = Message::new(MessageType::Error, vec![format!("Closing Link: {}", reason)]);
        state.outbox.to_user(conn, &error);
        state.closing.push(conn);
        Registered::Rejected
    }
}

/// Numeric to a connection that has no client yet
fn reply(state: &mut State, conn: ConnId, target: &str, mut message: Message) {
    if let Some(first) = message.params.first_mut() {
        *first = target.to_string();
    }
    message.prefix = Some(Prefix::Server(state.clients.me_name().to_string()));
    state.outbox.to_user(conn, &message);
}

/// Our `PASS` and `SERVER` lines
fn send_server_hello(state: &mut State, conn: ConnId, password: &str) {
    let (name, numeric, info, start) = match state.clients.get(state.me()) {
        Some(me) => (me.name.clone(), me.numeric.clone(), me.info.clone(), me.timestamp),
        None => return,
    };
    let pass = Message::new(MessageType::Password, vec![password.to_string()]);
    let server = Message::new(
        MessageType::Server,
        vec![
            name,
            "1".to_string(),
            start.to_string(),
            state.now().to_string(),
            PROTOCOL.to_string(),
            format!("{}]]]", numeric),
            "+s".to_string(),
            info,
        ],
    );
    state.outbox.to_server(conn, &pass);
    state.outbox.to_server(conn, &server);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerLink};

    fn state() -> State {
        let mut config = Config::default();
        config.links.push(ServerLink {
            name: "leaf.example.net".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4400,
            password: "secret".to_string(),
            autoconnect: false,
        });
        State::with_fixed_clock(config, 1000)
    }

    #[test]
    fn test_user_registration() {
        let mut st = state();
        let mut reg = Registrar::new();
        reg.accept(1, None, false);
        assert_eq!(reg.handle_line(&mut st, 1, "NICK 9bad").unwrap(), Registered::Pending);
        assert_eq!(reg.handle_line(&mut st, 1, "NICK alice").unwrap(), Registered::Pending);
        let done = reg.handle_line(&mut st, 1, "USER a 0 * :Alice A").unwrap();
        let Registered::User(id) = done else {
            panic!("not registered: {:?}", done);
        };
        assert!(!reg.is_pending(1));
        assert_eq!(st.clients.get(id).unwrap().numeric, "ABAAA");

        let lines = st.outbox.lines_for(1);
        assert!(lines[0].starts_with(":irc.example.net 432 * 9bad"));
        assert!(lines[1].starts_with(":irc.example.net 001 alice :Welcome"));
    }

    #[test]
    fn test_commands_before_registration() {
        let mut st = state();
        let mut reg = Registrar::new();
        reg.accept(1, None, false);
        reg.handle_line(&mut st, 1, "JOIN #test").unwrap();
        reg.handle_line(&mut st, 1, "PING :tok").unwrap();
        let lines = st.outbox.lines_for(1);
        assert_eq!(lines[0], ":irc.example.net 451 * :You have not registered");
        assert_eq!(lines[1], ":irc.example.net PONG irc.example.net tok");
    }

    #[test]
    fn test_server_link_handshake() {
        let mut st = state();
        let mut reg = Registrar::new();
        reg.accept(2, None, true);
        reg.handle_line(&mut st, 2, "PASS :secret").unwrap();
        let done = reg
            .handle_line(&mut st, 2, "SERVER leaf.example.net 1 900 1000 J10 ACAP] +s :Leaf server")
            .unwrap();
        let Registered::Server(id) = done else {
            panic!("not linked: {:?}", done);
        };
        let leaf = st.clients.get(id).unwrap();
        assert!(leaf.is_burst_or_burst_ack());
        assert_eq!(leaf.numeric, "AC");

        let lines = st.outbox.lines_for(2);
        assert_eq!(lines[0], "PASS secret");
        assert!(lines[1].starts_with("SERVER irc.example.net 1 "));
        assert_eq!(lines.last().copied(), Some("AB EB"));
    }

    #[test]
    fn test_server_link_refused() {
        let mut st = state();
        let mut reg = Registrar::new();
        reg.accept(2, None, true);
        reg.handle_line(&mut st, 2, "PASS :wrong").unwrap();
        let done = reg
            .handle_line(&mut st, 2, "SERVER leaf.example.net 1 900 1000 J10 ACAP] +s :Leaf")
            .unwrap();
        assert_eq!(done, Registered::Rejected);
        assert_eq!(st.closing, vec![2]);
        assert_eq!(st.outbox.lines_for(2), vec!["ERROR :Closing Link: Password mismatch"]);

        reg.accept(3, None, false);
        reg.handle_line(&mut st, 3, "PASS :secret").unwrap();
        let done = reg
            .handle_line(&mut st, 3, "SERVER leaf.example.net 1 900 1000 J10 ACAP] +s :Leaf")
            .unwrap();
        assert_eq!(done, Registered::Rejected);
    }
}
