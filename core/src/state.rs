//! Server state owned by the event loop
//!
//! One task owns the [`State`]; every handler runs to completion against it
//! and queues its output in the [`Outbox`]. There is no locking in here.

use crate::client::{ClientFlags, ClientId, ClientTable, ConnId};
use crate::config::{Capabilities, Config};
use crate::membership::MemberFlags;
use crate::message::{Message, MessageType, Prefix};
use crate::registry::ChannelRegistry;
use crate::send::Outbox;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Everything the protocol handlers mutate
#[derive(Debug)]
pub struct State {
    pub config: Config,
    pub caps: Capabilities,
    pub clients: ClientTable,
    pub channels: ChannelRegistry,
    pub outbox: Outbox,
    /// Connections the event loop must close after this event
    pub closing: Vec<ConnId>,
    clock: Option<i64>,
}

impl State {
    pub fn new(config: Config) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self::with_time(config, now, None)
    }

    /// State with a frozen clock, for tests and benchmarks
    pub fn with_fixed_clock(config: Config, now: i64) -> Self {
        Self::with_time(config, now, Some(now))
    }

    fn with_time(config: Config, now: i64, clock: Option<i64>) -> Self {
        let caps = config.capabilities();
        let clients = ClientTable::new(&config.server.name, config.server.numeric, &config.server.description, now);
        let channels = ChannelRegistry::new(&config.channels, caps);
        Self {
            config,
            caps,
            clients,
            channels,
            outbox: Outbox::new(),
            closing: Vec::new(),
            clock,
        }
    }

    /// Current time in seconds
    pub fn now(&self) -> i64 {
        self.clock.unwrap_or_else(|| chrono::Utc::now().timestamp())
    }

    /// Move a frozen clock
    pub fn set_clock(&mut self, now: i64) {
        self.clock = Some(now);
    }

    pub fn me(&self) -> ClientId {
        self.clients.me()
    }

    pub fn has_cap(&self, cap: Capabilities) -> bool {
        self.caps.contains(cap)
    }

    /// Client-form prefix of any client
    pub fn prefix_of(&self, id: ClientId) -> Prefix {
        self.clients
            .get(id)
            .map(|c| c.prefix())
            .unwrap_or_else(|| Prefix::Server(self.clients.me_name().to_string()))
    }

    /// P10 prefix of any client
    pub fn numeric_prefix_of(&self, id: ClientId) -> Prefix {
        Prefix::Numeric(self.clients.numeric(id).to_string())
    }

    /// Server-form message from `source`
    pub fn server_message(&self, source: ClientId, command: MessageType, params: Vec<String>) -> Message {
        Message::with_prefix(self.numeric_prefix_of(source), command, params)
    }

    /// Client-form message from `source`
    pub fn client_message(&self, source: ClientId, command: MessageType, params: Vec<String>) -> Message {
        Message::with_prefix(self.prefix_of(source), command, params)
    }

    /// Deliver to a local user
    pub fn send_to_client(&mut self, to: ClientId, message: &Message) {
        match self.clients.get(to) {
            Some(client) if client.is_user() && client.is_local() => {
                if let Some(conn) = client.link {
                    self.outbox.to_user(conn, message);
                }
            }
            _ => {}
        }
    }

    /// Send a numeric reply to a user, local or remote
    pub fn send_numeric(&mut self, to: ClientId, mut reply: Message) {
        let Some(client) = self.clients.get(to) else {
            return;
        };
        let (local, link) = (client.is_local(), client.link);
        if let Some(first) = reply.params.first_mut() {
            *first = if local { client.name.clone() } else { client.numeric.clone() };
        }

        if local {
            reply.prefix = Some(Prefix::Server(self.clients.me_name().to_string()));
            self.send_to_client(to, &reply);
        } else if let Some(conn) = link {
            reply.prefix = Some(Prefix::Numeric(self.clients.me_numeric().to_string()));
            self.outbox.to_server(conn, &reply);
        }
    }

    /// Server NOTICE to a user
    pub fn send_notice(&mut self, to: ClientId, text: &str) {
        let nick = self.clients.name(to).to_string();
        let notice = Message::with_prefix(
            Prefix::Server(self.clients.me_name().to_string()),
            MessageType::Notice,
            vec![nick, text.to_string()],
        );
        self.send_to_client(to, &notice);
    }

    /// Deliver to the local members of a channel that pass `filter`
    pub fn send_to_channel_filtered<F>(&mut self, channel: &str, message: &Message, filter: F)
    where
        F: Fn(&crate::membership::Membership) -> bool,
    {
        let targets: Vec<ConnId> = match self.channels.get(channel) {
            Some(chan) => chan
                .members
                .iter()
                .filter(|m| !m.is_zombie() && filter(*m))
                .filter_map(|m| self.clients.get(m.user))
                .filter(|c| c.is_local())
                .filter_map(|c| c.link)
                .collect(),
            None => return,
        };
        for conn in targets {
            self.outbox.to_user(conn, message);
        }
    }

    /// Deliver to the local, non-zombie members of a channel, optionally skipping one
    pub fn send_to_channel(&mut self, channel: &str, message: &Message, skip: Option<ClientId>) {
        self.send_to_channel_filtered(channel, message, |m| Some(m.user) != skip);
    }

    /// Deliver to local channel operators only
    pub fn send_to_channel_ops(&mut self, channel: &str, message: &Message, skip: Option<ClientId>) {
        self.send_to_channel_filtered(channel, message, |m| m.is_chanop() && Some(m.user) != skip);
    }

    /// Deliver to every adjacent server except the one on `except`
    pub fn send_to_servers(&mut self, message: &Message, except: Option<ConnId>) {
        for (_, conn) in self.clients.server_links() {
            if Some(conn) != except {
                self.outbox.to_server(conn, message);
            }
        }
    }

    /// Deliver to one server link
    pub fn send_to_link(&mut self, conn: ConnId, message: &Message) {
        self.outbox.to_server(conn, message);
    }

    /// Notice to every local IRC operator; also logged
    pub fn sendto_opmask(&mut self, text: &str) {
        warn!("{}", text);
        let me = self.clients.me_name().to_string();
        for (id, conn) in self.clients.local_opers() {
            let notice = Message::with_prefix(
                Prefix::Server(me.clone()),
                MessageType::Notice,
                vec![self.clients.name(id).to_string(), format!("*** Notice -- {}", text)],
            );
            self.outbox.to_user(conn, &notice);
        }
    }

    /// Report a peer server breaking the protocol
    pub fn protocol_violation(&mut self, source: ClientId, text: &str) {
        let name = self.clients.name(source).to_string();
        self.sendto_opmask(&format!("Protocol Violation from {}: {}", name, text));
    }

    /// Is the client a U-lined server or a user on one?
    pub fn is_uworld(&self, id: ClientId) -> bool {
        self.clients
            .server_of(id)
            .and_then(|s| self.clients.get(s))
            .map_or(false, |s| s.flags.contains(ClientFlags::UWORLD))
    }

    /// Remove a membership, running the empty-channel rules
    pub fn remove_user_from_channel(&mut self, channel: &str, user: ClientId) {
        let now = self.now();
        self.channels.remove_user_from_channel(channel, user, now);
    }

    /// Turn a kicked member into a zombie, or remove it outright when the
    /// kick cannot cross a JOIN in flight.
    ///
    /// `via` is the link the kick arrived on (None when it originated
    /// here); `source` is who kicked.
    pub fn make_zombie(&mut self, channel: &str, who: ClientId, via: Option<ConnId>, source: ClientId) {
        if !self.channels.set_zombie(channel, who) {
            return;
        }

        if self.clients.is_local_user(who) {
            if let Some(conn) = via {
                let part = self.server_message(who, MessageType::Part, vec![channel.to_string()]);
                self.send_to_link(conn, &part);
            }
            self.remove_user_from_channel(channel, who);
            return;
        }

        let who_link = self.clients.get(who).and_then(|c| c.link);
        if via.is_some() && who_link == via {
            let who_server = self.clients.server_of(who);
            let source_server = self.clients.server_of(source);
            if let (Some(who_server), Some(source_server)) = (who_server, source_server) {
                if self.clients.is_behind(source_server, who_server) {
                    self.remove_user_from_channel(channel, who);
                    return;
                }
            }
        }

        if self.channels.channel_all_zombies(channel) {
            self.remove_user_from_channel(channel, who);
        }
        debug!("{} is now a zombie on {}", self.clients.name(who), channel);
    }

    /// Show a hidden delayed-join member to the channel
    pub fn reveal_delayed(&mut self, channel: &str, user: ClientId) {
        let revealed = self
            .channels
            .find_member_link_mut(channel, user)
            .map_or(false, |m| m.reveal());
        if !revealed {
            return;
        }
        let join = self.client_message(user, MessageType::Join, vec![channel.to_string()]);
        self.send_to_channel(channel, &join, Some(user));
        self.check_delayed_joins(channel);
    }

    /// Drop `+d` once the last hidden member is visible
    pub fn check_delayed_joins(&mut self, channel: &str) {
        use crate::channel::ChannelModes;
        let clear = match self.channels.get(channel) {
            Some(chan) => chan.mode.mode.contains(ChannelModes::WASDELJOINS) && !chan.has_delayed_members(),
            None => false,
        };
        if !clear {
            return;
        }
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.mode.mode.remove(ChannelModes::WASDELJOINS);
        }
        let me = self.me();
        let mode = self.client_message(me, MessageType::Mode, vec![channel.to_string(), "-d".to_string()]);
        self.send_to_channel(channel, &mode, None);
    }

    /// A user leaves the network. `from` is the link the QUIT arrived on.
    pub fn exit_user(&mut self, user: ClientId, reason: &str, from: Option<ConnId>) {
        self.exit_user_inner(user, reason, from, true);
    }

    fn exit_user_inner(&mut self, user: ClientId, reason: &str, from: Option<ConnId>, propagate: bool) {
        let Some(client) = self.clients.get(user) else {
            return;
        };
        if !client.is_user() {
            return;
        }
        let local = client.is_local();
        let link = client.link;
        info!("User {} quit: {}", client.name, reason);

        // Everyone who can see the user gets one QUIT
        let quit = self.client_message(user, MessageType::Quit, vec![reason.to_string()]);
        let mut seen = BTreeSet::new();
        for name in self.channels.channels_of(user) {
            let visible = self
                .channels
                .find_member_link(&name, user)
                .map_or(false, |m| !m.is_delayed() && !m.is_zombie());
            if visible {
                let conns: Vec<ConnId> = self
                    .channels
                    .get(&name)
                    .map(|chan| {
                        chan.active_members()
                            .filter(|m| m.user != user)
                            .filter_map(|m| self.clients.get(m.user))
                            .filter(|c| c.is_local())
                            .filter_map(|c| c.link)
                            .collect()
                    })
                    .unwrap_or_default();
                seen.extend(conns);
            }
            self.remove_user_from_channel(&name, user);
        }
        for conn in seen {
            self.outbox.to_user(conn, &quit);
        }
        self.channels.forget_user_invites(user);

        if propagate {
            let q = self.server_message(user, MessageType::Quit, vec![reason.to_string()]);
            self.send_to_servers(&q, from);
        }
        if local {
            if let Some(conn) = link {
                let error = Message::new(MessageType::Error, vec![format!("Closing Link: {}", reason)]);
                self.outbox.to_user(conn, &error);
                self.closing.push(conn);
            }
        }
        self.clients.remove(user);
    }

    /// A server and everything behind it leaves the network
    pub fn exit_server(&mut self, server: ClientId, reason: &str, from: Option<ConnId>) {
        let Some(client) = self.clients.get(server) else {
            return;
        };
        if client.is_me() {
            return;
        }
        let name = client.name.clone();
        let link = client.link;
        let adjacent = client.is_local();
        let uplink = client.server.map(|u| self.clients.name(u).to_string()).unwrap_or_default();
        info!("Server {} split: {}", name, reason);

        let squit = self.server_message(
            self.me(),
            MessageType::ServerQuit,
            vec![name.clone(), "0".to_string(), reason.to_string()],
        );
        self.send_to_servers(&squit, if adjacent { link } else { from });

        let split_reason = format!("{} {}", uplink, name);
        for id in self.clients.behind(server) {
            if self.clients.get(id).map_or(false, |c| c.is_user()) {
                // Already announced by the SQUIT
                self.exit_user_inner(id, &split_reason, link, false);
            } else {
                self.clients.remove(id);
            }
        }
        if adjacent {
            if let Some(conn) = link {
                self.closing.push(conn);
            }
        }
        self.sendto_opmask(&format!("Net break: {} {} ({})", uplink, name, reason));
    }

    /// Fire due destruct events and tell the other servers
    pub fn exec_expired_destruct_events(&mut self) {
        let now = self.now();
        for (name, ts) in self.channels.exec_expired_destruct_events(now) {
            info!("Destructing empty channel {} ({})", name, ts);
            if !name.starts_with('&') {
                let destruct = self.server_message(self.me(), MessageType::Destruct, vec![name, ts.to_string()]);
                self.send_to_servers(&destruct, None);
            }
        }
    }

    /// Clear burst-only member flags on a channel
    pub fn clear_burst_flags(&mut self, channel: &str) {
        if let Some(chan) = self.channels.get_mut(channel) {
            for member in &mut chan.members {
                member.status.remove(
                    MemberFlags::BURST_JOINED | MemberFlags::BURST_ALREADY_OPPED | MemberFlags::BURST_ALREADY_VOICED,
                );
            }
        }
    }
}
