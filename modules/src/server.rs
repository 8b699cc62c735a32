//! Server and user presence module
//!
//! Remote server and user introductions (`S`, `N`), nick changes, QUIT,
//! SQUIT, and the PING/PONG/ERROR housekeeping on both kinds of link.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tsircd_core::burst::{server_intro, user_intro};
use tsircd_core::matching::is_valid_nick;
use tsircd_core::numnick::base64_to_ip;
use tsircd_core::{
    debug, info, warn, ClientFlags, ClientId, ConnId, Context, Error, Message, MessageType, Module, ModuleResult,
    NumericReply, Prefix, Result, State,
};

/// Server and user presence module
pub struct ServerModule {
    name: String,
    version: String,
    description: String,
}

impl ServerModule {
    pub fn new() -> Self {
        Self {
            name: "server".to_string(),
            version: "1.0.0".to_string(),
            description: "Server links, nick changes, QUIT and SQUIT".to_string(),
        }
    }

    /// `S <name> <hop> <start> <link ts> <protocol> <numeric+cap> <flags> :<description>`
    fn handle_server_intro(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (source, conn) = (ctx.source, ctx.conn);
        if message.params.len() < 7 || !ctx.source_is_server() {
            ctx.state.protocol_violation(source, "Bad SERVER introduction");
            return Ok(());
        }
        let name = message.params[0].as_str();
        let link_ts = message.params[3].parse::<i64>().unwrap_or_else(|_| ctx.state.now());
        let protocol = message.params[4].as_str();
        let numcap = message.params[5].as_str();
        let description = message.params.last().cloned().unwrap_or_default();
        if numcap.len() < 2 {
            ctx.state.protocol_violation(source, &format!("Bad numeric for server {}", name));
            return Ok(());
        }

        let id = match ctx.state.clients.add_server(source, name, &numcap[..2], &description, None, link_ts) {
            Ok(id) => id,
            Err(e) => {
                // Loops and numeric clashes cannot be repaired from here
                return Err(Error::Protocol(format!("cannot introduce {}: {}", name, e)));
            }
        };
        let uworld = ctx.state.config.is_uworld(name);
        if let Some(server) = ctx.state.clients.get_mut(id) {
            if protocol.starts_with('J') {
                server.flags.insert(ClientFlags::BURST | ClientFlags::BURST_ACK);
            }
            if uworld {
                server.flags.insert(ClientFlags::UWORLD);
            }
        }
        info!("Server {} introduced by {}", name, ctx.state.clients.name(source));
        if let Some(intro) = server_intro(ctx.state, id) {
            ctx.state.send_to_servers(&intro, Some(conn));
        }
        Ok(())
    }

    /// `N` from a server introduces a user; `N` from a user renames them
    fn handle_server_nick(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        if !ctx.source_is_server() {
            let Some(nick) = message.param(0) else {
                return Ok(());
            };
            let ts = message
                .param(1)
                .and_then(|t| t.parse::<i64>().ok())
                .unwrap_or_else(|| ctx.state.now());
            let (source, conn) = (ctx.source, ctx.conn);
            if let Err(e) = change_nick(ctx.state, source, nick, ts, Some(conn)) {
                ctx.state.protocol_violation(source, &format!("Nick change to {} refused: {}", nick, e));
            }
            return Ok(());
        }
        self.introduce_user(ctx, message)
    }

    /// `N <nick> <hop> <ts> <user> <host> [+modes [account]] <ip> <numeric> :<realname>`
    fn introduce_user(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (source, conn) = (ctx.source, ctx.conn);
        let params = &message.params;
        if params.len() < 8 {
            ctx.state.protocol_violation(source, "Too few parameters for NICK");
            return Ok(());
        }
        let nick = params[0].as_str();
        let ts = params[2].parse::<i64>().unwrap_or(0);
        let (username, host) = (params[3].as_str(), params[4].as_str());
        let realname = params[params.len() - 1].as_str();
        let numeric = params[params.len() - 2].as_str();
        let ip = base64_to_ip(&params[params.len() - 3]);

        let mut flags = ClientFlags::empty();
        let mut account = None;
        if let Some(modes) = params.get(5).filter(|m| m.starts_with('+') && params.len() > 8) {
            let mut extra = 6;
            for letter in modes.chars().skip(1) {
                match letter {
                    'o' => flags.insert(ClientFlags::OPER),
                    'i' => flags.insert(ClientFlags::INVISIBLE),
                    'k' => flags.insert(ClientFlags::CHANSERVICE),
                    'z' => flags.insert(ClientFlags::SSL),
                    'r' => {
                        // Account name follows the mode string
                        if extra < params.len() - 3 {
                            account = Some(params[extra].split(':').next().unwrap_or_default().to_string());
                            extra += 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        // The introducing server is the numeric's own server
        let server = ctx.state.clients.find_by_numeric(numeric.get(..2).unwrap_or_default());
        let Some(server) = server.filter(|s| ctx.state.clients.is_server(*s)) else {
            ctx.state.protocol_violation(source, &format!("NICK {} with unknown server numeric {}", nick, numeric));
            return Ok(());
        };
        if !is_valid_nick(nick) {
            ctx.state.protocol_violation(source, &format!("Bad nick {} introduced", nick));
            return Ok(());
        }
        let added = ctx
            .state
            .clients
            .add_remote_user(server, numeric, nick, username, host, ip, realname, account, flags, ts);
        let id = match added {
            Ok(id) => id,
            Err(e) => {
                let text = format!("Nick collision on {} ({})", nick, e);
                ctx.state.protocol_violation(source, &text);
                return Err(Error::Protocol(text));
            }
        };
        debug!("Remote user {} ({}) introduced", nick, numeric);
        if let Some(intro) = user_intro(ctx.state, id) {
            ctx.state.send_to_servers(&intro, Some(conn));
        }
        Ok(())
    }

    /// Local NICK after registration
    fn handle_nick(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(nick) = message.param(0).filter(|n| !n.is_empty()) else {
            ctx.reply(NumericReply::no_nickname_given());
            return Ok(());
        };
        if !is_valid_nick(nick) {
            ctx.reply(NumericReply::erroneous_nickname(nick));
            return Ok(());
        }
        let source = ctx.source;
        if ctx.state.clients.name(source) == nick {
            return Ok(());
        }
        let taken = ctx.state.clients.find_user(nick).map_or(false, |other| other != source)
            || ctx.state.clients.find_server(nick).is_some();
        if taken {
            ctx.reply(NumericReply::nickname_in_use(nick));
            return Ok(());
        }
        let now = ctx.state.now();
        change_nick(ctx.state, source, nick, now, None)
    }

    fn handle_quit(&self, ctx: &mut Context<'_>, message: &Message, from_link: bool) -> Result<()> {
        let source = ctx.source;
        if ctx.source_is_server() {
            ctx.state.protocol_violation(source, "QUIT from a server");
            return Ok(());
        }
        let reason = message.param(0).unwrap_or_default();
        let reason = if from_link {
            reason.to_string()
        } else {
            format!("Quit: {}", reason)
        };
        let via = from_link.then_some(ctx.conn);
        ctx.state.exit_user(source, &reason, via);
        Ok(())
    }

    /// `SQ <server> <ts> :<reason>`
    fn handle_squit(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(name) = message.param(0) else {
            return Ok(());
        };
        let reason = message.param(2).or(message.param(1)).unwrap_or("Unknown reason").to_string();
        let me = ctx.state.me();
        let target = match ctx.state.clients.find_server(name) {
            // Asked to drop ourselves: drop the link it came from
            Some(id) if id == me => ctx.state.clients.by_link(ctx.conn),
            other => other,
        };
        let Some(target) = target else {
            debug!("SQUIT for unknown server {}", name);
            return Ok(());
        };
        ctx.state.exit_server(target, &reason, Some(ctx.conn));
        Ok(())
    }

    fn handle_ping(&self, ctx: &mut Context<'_>, message: &Message, from_link: bool) -> Result<()> {
        let me = ctx.state.me();
        let me_name = ctx.state.clients.me_name().to_string();
        if from_link {
            let origin = message.param(0).unwrap_or_default().to_string();
            let pong = ctx
                .state
                .server_message(me, MessageType::Pong, vec![me_name, origin]);
            ctx.state.send_to_link(ctx.conn, &pong);
        } else {
            let token = message.param(0).unwrap_or(&me_name).to_string();
            let pong = Message::with_prefix(Prefix::Server(me_name.clone()), MessageType::Pong, vec![me_name, token]);
            ctx.state.send_to_client(ctx.source, &pong);
        }
        Ok(())
    }
}

/// Rename a user, tell everyone who shares a channel with them and the
/// other servers. `via` is the link the change arrived on.
fn change_nick(state: &mut State, user: ClientId, nick: &str, ts: i64, via: Option<ConnId>) -> Result<()> {
    let announce = state.client_message(user, MessageType::Nick, vec![nick.to_string()]);
    state.clients.rename(user, nick)?;
    if let Some(client) = state.clients.get_mut(user) {
        client.timestamp = ts;
    }

    let mut seen = BTreeSet::new();
    for channel in state.channels.channels_of(user) {
        let Some(chan) = state.channels.get(&channel) else {
            continue;
        };
        let visible = chan.member(user).map_or(false, |m| !m.is_delayed() && !m.is_zombie());
        if !visible {
            continue;
        }
        seen.extend(
            chan.active_members()
                .filter(|m| m.user != user)
                .filter_map(|m| state.clients.get(m.user))
                .filter(|c| c.is_local())
                .filter_map(|c| c.link),
        );
    }
    if state.clients.is_local_user(user) {
        if let Some(conn) = state.clients.get(user).and_then(|c| c.link) {
            seen.insert(conn);
        }
    }
    for conn in seen {
        state.outbox.to_user(conn, &announce);
    }

    let relay = state.server_message(user, MessageType::Nick, vec![nick.to_string(), ts.to_string()]);
    state.send_to_servers(&relay, via);
    Ok(())
}

impl Default for ServerModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for ServerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn commands(&self) -> Vec<MessageType> {
        vec![
            MessageType::Server,
            MessageType::Nick,
            MessageType::Quit,
            MessageType::ServerQuit,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Error,
        ]
    }

    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Nick => self.handle_nick(ctx, message)?,
            MessageType::Quit => self.handle_quit(ctx, message, false)?,
            MessageType::Ping => self.handle_ping(ctx, message, false)?,
            MessageType::Pong => {}
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Server => self.handle_server_intro(ctx, message)?,
            MessageType::Nick => self.handle_server_nick(ctx, message)?,
            MessageType::Quit => self.handle_quit(ctx, message, true)?,
            MessageType::ServerQuit => self.handle_squit(ctx, message)?,
            MessageType::Ping => self.handle_ping(ctx, message, true)?,
            MessageType::Pong => {}
            MessageType::Error => {
                warn!(
                    "ERROR from {}: {}",
                    ctx.state.clients.name(ctx.source),
                    message.param(0).unwrap_or_default()
                );
            }
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }
}
