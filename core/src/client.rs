//! Clients (users and servers) and the table that owns them

use crate::message::Prefix;
use crate::numnick::{self, NumericNick};
use crate::{matching, Error, Result};
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Handle of a client in the [`ClientTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Identifier of a socket connection
pub type ConnId = u64;

/// Client kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    User,
    Server,
}

bitflags! {
    /// Per-client flags
    pub struct ClientFlags: u32 {
        /// IRC operator (+o)
        const OPER = 0x0001;
        /// Connected over TLS (+z)
        const SSL = 0x0002;
        /// Invisible (+i)
        const INVISIBLE = 0x0004;
        /// Channel service (+k): cannot be kicked or deopped
        const CHANSERVICE = 0x0008;
        /// Directly connected to this server
        const LOCAL = 0x0010;
        /// Server is sending its burst
        const BURST = 0x0020;
        /// Server has not yet acknowledged our burst
        const BURST_ACK = 0x0040;
        /// U-lined server
        const UWORLD = 0x0080;
        /// This server
        const ME = 0x0100;
    }
}

/// A user or a server
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub kind: ClientKind,
    /// Wire numeric (2 chars for servers, 5 for users)
    pub numeric: String,
    /// Nick or server name
    pub name: String,
    pub username: String,
    pub host: String,
    pub ip: Option<IpAddr>,
    /// Real name or server description
    pub info: String,
    /// Logged-in account
    pub account: Option<String>,
    pub flags: ClientFlags,
    /// The user's server, or the server's uplink
    pub server: Option<ClientId>,
    /// Connection this client is reached through
    pub link: Option<ConnId>,
    pub hopcount: u32,
    /// Nick or link timestamp
    pub timestamp: i64,
}

impl Client {
    pub fn is_user(&self) -> bool {
        self.kind == ClientKind::User
    }

    pub fn is_server(&self) -> bool {
        self.kind == ClientKind::Server
    }

    /// Directly connected (a local user or an adjacent server)
    pub fn is_local(&self) -> bool {
        self.flags.contains(ClientFlags::LOCAL)
    }

    pub fn is_me(&self) -> bool {
        self.flags.contains(ClientFlags::ME)
    }

    pub fn is_oper(&self) -> bool {
        self.flags.contains(ClientFlags::OPER)
    }

    pub fn is_channel_service(&self) -> bool {
        self.flags.contains(ClientFlags::CHANSERVICE)
    }

    pub fn is_burst_or_burst_ack(&self) -> bool {
        self.flags.intersects(ClientFlags::BURST | ClientFlags::BURST_ACK)
    }

    /// User mode string, `+` alone when none are set
    pub fn umode_string(&self) -> String {
        let mut modes = String::from("+");
        for (flag, letter) in [
            (ClientFlags::OPER, 'o'),
            (ClientFlags::INVISIBLE, 'i'),
            (ClientFlags::CHANSERVICE, 'k'),
            (ClientFlags::SSL, 'z'),
        ] {
            if self.flags.contains(flag) {
                modes.push(letter);
            }
        }
        if self.account.is_some() {
            modes.push('r');
        }
        modes
    }

    /// Prefix used in client-facing lines
    pub fn prefix(&self) -> Prefix {
        match self.kind {
            ClientKind::User => Prefix::User {
                nick: self.name.clone(),
                user: self.username.clone(),
                host: self.host.clone(),
            },
            ClientKind::Server => Prefix::Server(self.name.clone()),
        }
    }

    /// Prefix used in server-to-server lines
    pub fn numeric_prefix(&self) -> Prefix {
        Prefix::Numeric(self.numeric.clone())
    }
}

/// All known clients, indexed by handle, numeric and name
#[derive(Debug)]
pub struct ClientTable {
    clients: HashMap<ClientId, Client>,
    by_numeric: HashMap<String, ClientId>,
    by_name: HashMap<String, ClientId>,
    me: ClientId,
    next_id: u32,
    next_local: u32,
}

impl ClientTable {
    /// Create a table holding only this server
    pub fn new(name: &str, numeric: u16, description: &str, now: i64) -> Self {
        let me = ClientId(0);
        let mut table = Self {
            clients: HashMap::new(),
            by_numeric: HashMap::new(),
            by_name: HashMap::new(),
            me,
            next_id: 1,
            next_local: 0,
        };
        let client = Client {
            id: me,
            kind: ClientKind::Server,
            numeric: NumericNick::server(numeric).to_string(),
            name: name.to_string(),
            username: String::new(),
            host: name.to_string(),
            ip: None,
            info: description.to_string(),
            account: None,
            flags: ClientFlags::ME,
            server: None,
            link: None,
            hopcount: 0,
            timestamp: now,
        };
        table.index(client);
        table
    }

    fn index(&mut self, client: Client) -> ClientId {
        let id = client.id;
        self.by_numeric.insert(client.numeric.clone(), id);
        self.by_name.insert(matching::irc_lower(&client.name), id);
        self.clients.insert(id, client);
        id
    }

    fn allocate_id(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        id
    }

    /// This server
    pub fn me(&self) -> ClientId {
        self.me
    }

    /// This server's numeric
    pub fn me_numeric(&self) -> &str {
        self.clients.get(&self.me).map(|c| c.numeric.as_str()).unwrap_or("")
    }

    /// This server's name
    pub fn me_name(&self) -> &str {
        self.clients.get(&self.me).map(|c| c.name.as_str()).unwrap_or("")
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Name of a client, or `*` if unknown
    pub fn name(&self, id: ClientId) -> &str {
        self.clients.get(&id).map(|c| c.name.as_str()).unwrap_or("*")
    }

    /// Numeric of a client, or an empty string if unknown
    pub fn numeric(&self, id: ClientId) -> &str {
        self.clients.get(&id).map(|c| c.numeric.as_str()).unwrap_or("")
    }

    /// Look up by wire numeric
    pub fn find_by_numeric(&self, numeric: &str) -> Option<ClientId> {
        self.by_numeric.get(numeric).copied()
    }

    /// Look up a user by nick
    pub fn find_user(&self, nick: &str) -> Option<ClientId> {
        self.by_name
            .get(&matching::irc_lower(nick))
            .copied()
            .filter(|id| self.clients.get(id).map_or(false, |c| c.is_user()))
    }

    /// Look up a server by name
    pub fn find_server(&self, name: &str) -> Option<ClientId> {
        self.by_name
            .get(&matching::irc_lower(name))
            .copied()
            .filter(|id| self.clients.get(id).map_or(false, |c| c.is_server()))
    }

    /// Is the name taken by any client?
    pub fn name_in_use(&self, name: &str) -> bool {
        self.by_name.contains_key(&matching::irc_lower(name))
    }

    /// Is this a user connected to us?
    pub fn is_local_user(&self, id: ClientId) -> bool {
        self.clients.get(&id).map_or(false, |c| c.is_user() && c.is_local())
    }

    pub fn is_server(&self, id: ClientId) -> bool {
        self.clients.get(&id).map_or(false, |c| c.is_server())
    }

    /// Server a client belongs to (itself for servers)
    pub fn server_of(&self, id: ClientId) -> Option<ClientId> {
        let client = self.clients.get(&id)?;
        match client.kind {
            ClientKind::Server => Some(id),
            ClientKind::User => client.server,
        }
    }

    /// Directly connected client on a connection
    pub fn by_link(&self, conn: ConnId) -> Option<ClientId> {
        self.clients
            .values()
            .find(|c| c.link == Some(conn) && c.is_local())
            .map(|c| c.id)
    }

    fn next_local_numeric(&mut self) -> Result<String> {
        let server = self.clients.get(&self.me).map(|c| c.numeric.clone()).unwrap_or_default();
        for _ in 0..=numnick::MAX_CLIENT_NUMERIC {
            let candidate = format!(
                "{}{}",
                server,
                numnick::int_to_base64(self.next_local, numnick::CLIENT_NUMERIC_LEN)
            );
            self.next_local = (self.next_local + 1) % (numnick::MAX_CLIENT_NUMERIC + 1);
            if !self.by_numeric.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Numnick("no free client numerics".to_string()))
    }

    /// Register a user connected to this server
    #[allow(clippy::too_many_arguments)]
    pub fn add_local_user(
        &mut self,
        nick: &str,
        username: &str,
        host: &str,
        ip: Option<IpAddr>,
        realname: &str,
        conn: ConnId,
        now: i64,
    ) -> Result<ClientId> {
        if self.name_in_use(nick) {
            return Err(Error::Client(format!("nick {} in use", nick)));
        }
        let numeric = self.next_local_numeric()?;
        let id = self.allocate_id();
        let client = Client {
            id,
            kind: ClientKind::User,
            numeric,
            name: nick.to_string(),
            username: username.to_string(),
            host: host.to_string(),
            ip,
            info: realname.to_string(),
            account: None,
            flags: ClientFlags::LOCAL,
            server: Some(self.me),
            link: Some(conn),
            hopcount: 0,
            timestamp: now,
        };
        Ok(self.index(client))
    }

    /// Register a user introduced by a remote server
    #[allow(clippy::too_many_arguments)]
    pub fn add_remote_user(
        &mut self,
        server: ClientId,
        numeric: &str,
        nick: &str,
        username: &str,
        host: &str,
        ip: Option<IpAddr>,
        realname: &str,
        account: Option<String>,
        flags: ClientFlags,
        timestamp: i64,
    ) -> Result<ClientId> {
        let parsed = NumericNick::parse(numeric)?;
        if parsed.is_server() {
            return Err(Error::Numnick(format!("{} is not a client numeric", numeric)));
        }
        if self.by_numeric.contains_key(numeric) {
            return Err(Error::Client(format!("numeric {} in use", numeric)));
        }
        if self.name_in_use(nick) {
            return Err(Error::Client(format!("nick {} in use", nick)));
        }
        let (link, hop) = match self.clients.get(&server) {
            Some(s) if s.is_server() => (s.link, s.hopcount + 1),
            _ => return Err(Error::Client(format!("unknown server for {}", nick))),
        };
        let id = self.allocate_id();
        let client = Client {
            id,
            kind: ClientKind::User,
            numeric: numeric.to_string(),
            name: nick.to_string(),
            username: username.to_string(),
            host: host.to_string(),
            ip,
            info: realname.to_string(),
            account,
            flags: flags & !(ClientFlags::LOCAL | ClientFlags::ME),
            server: Some(server),
            link,
            hopcount: hop,
            timestamp,
        };
        Ok(self.index(client))
    }

    /// Register a server. `conn` is set for adjacent servers.
    pub fn add_server(
        &mut self,
        uplink: ClientId,
        name: &str,
        numeric: &str,
        description: &str,
        conn: Option<ConnId>,
        timestamp: i64,
    ) -> Result<ClientId> {
        let parsed = NumericNick::parse(numeric)?;
        if !parsed.is_server() {
            return Err(Error::Numnick(format!("{} is not a server numeric", numeric)));
        }
        if self.by_numeric.contains_key(numeric) || self.name_in_use(name) {
            return Err(Error::Client(format!("server {} ({}) already exists", name, numeric)));
        }
        let (link, hop, flags) = match conn {
            Some(conn) => (Some(conn), 1, ClientFlags::LOCAL),
            None => {
                let up = self
                    .clients
                    .get(&uplink)
                    .ok_or_else(|| Error::Client(format!("unknown uplink for {}", name)))?;
                (up.link, up.hopcount + 1, ClientFlags::empty())
            }
        };
        let id = self.allocate_id();
        let client = Client {
            id,
            kind: ClientKind::Server,
            numeric: numeric.to_string(),
            name: name.to_string(),
            username: String::new(),
            host: name.to_string(),
            ip: None,
            info: description.to_string(),
            account: None,
            flags,
            server: Some(uplink),
            link,
            hopcount: hop,
            timestamp,
        };
        Ok(self.index(client))
    }

    /// Change a user's nick
    pub fn rename(&mut self, id: ClientId, nick: &str) -> Result<()> {
        let taken = self.find_user(nick).map_or(false, |other| other != id) || self.find_server(nick).is_some();
        if taken {
            return Err(Error::Client(format!("nick {} in use", nick)));
        }
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| Error::Client(format!("unknown client {}", id)))?;
        let old = matching::irc_lower(&client.name);
        client.name = nick.to_string();
        self.by_name.remove(&old);
        self.by_name.insert(matching::irc_lower(nick), id);
        Ok(())
    }

    /// Remove a client from every index
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        if id == self.me {
            return None;
        }
        let client = self.clients.remove(&id)?;
        self.by_numeric.remove(&client.numeric);
        let key = matching::irc_lower(&client.name);
        if self.by_name.get(&key) == Some(&id) {
            self.by_name.remove(&key);
        }
        Some(client)
    }

    /// Is `id` this server or reached through `server`?
    pub fn is_behind(&self, id: ClientId, server: ClientId) -> bool {
        let mut cursor = Some(id);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == server {
                return true;
            }
            if current == self.me || hops > 64 {
                return false;
            }
            cursor = self.clients.get(&current).and_then(|c| c.server);
            hops += 1;
        }
        false
    }

    /// Every client at or behind `server`, deepest first
    pub fn behind(&self, server: ClientId) -> Vec<ClientId> {
        let mut ids: Vec<(u32, ClientId)> = self
            .clients
            .values()
            .filter(|c| c.id != self.me && self.is_behind(c.id, server))
            .map(|c| (c.hopcount, c.id))
            .collect();
        // Users before their servers, far servers before near ones
        ids.sort_by(|a, b| {
            let a_user = self.clients.get(&a.1).map_or(false, |c| c.is_user());
            let b_user = self.clients.get(&b.1).map_or(false, |c| c.is_user());
            b_user.cmp(&a_user).then(b.0.cmp(&a.0))
        });
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Adjacent servers and their connections
    pub fn server_links(&self) -> Vec<(ClientId, ConnId)> {
        let mut links: Vec<(ClientId, ConnId)> = self
            .clients
            .values()
            .filter(|c| c.is_server() && c.is_local())
            .filter_map(|c| c.link.map(|l| (c.id, l)))
            .collect();
        links.sort();
        links
    }

    /// Connections of local IRC operators
    pub fn local_opers(&self) -> Vec<(ClientId, ConnId)> {
        self.clients
            .values()
            .filter(|c| c.is_user() && c.is_local() && c.is_oper())
            .filter_map(|c| c.link.map(|l| (c.id, l)))
            .collect()
    }

    /// All clients
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
