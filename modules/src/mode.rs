//! Mode commands module
//!
//! MODE for channels and users, the operator overrides OPMODE and
//! CLEARMODE, and BMODE for changes made in a service bot's name. Every
//! channel change goes through `mode_parse` into a [`ModeBuf`], which
//! applies it and tells the channel and the network.

use async_trait::async_trait;
use tsircd_core::channel::SIMPLE_MODES;
use tsircd_core::modes::send_channel_modes;
use tsircd_core::{
    debug, mode_parse, Capabilities, ChannelModes, ClientFlags, ClientId, ConnId, Context, Error, MemberFlags,
    Message, MessageType, ModeBuf, ModeBufDest, Module, ModuleResult, NumericReply, ParseFlags, Result, State,
};

/// What CLEARMODE removes when no letters are given
pub const DEFAULT_CLEARMODE: &str = "ovpsmikbl";

fn is_channel_name(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

/// Mode commands module
pub struct ModeModule {
    name: String,
    version: String,
    description: String,
}

impl ModeModule {
    pub fn new() -> Self {
        Self {
            name: "mode".to_string(),
            version: "1.0.0".to_string(),
            description: "MODE, OPMODE, BMODE and CLEARMODE".to_string(),
        }
    }

    fn handle_mode(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(target) = message.param(0) else {
            ctx.reply(NumericReply::need_more_params("MODE"));
            return Ok(());
        };
        if !is_channel_name(target) {
            return self.handle_user_mode(ctx, target, &message.params[1..]);
        }
        let source = ctx.source;
        let Some(chan) = ctx.state.channels.get(target) else {
            ctx.reply(NumericReply::no_such_channel(target));
            return Ok(());
        };
        let name = chan.name.clone();
        if message.params.len() < 2 {
            send_channel_modes(ctx.state, source, &name);
            return Ok(());
        }

        let mut flags = ParseFlags::SET;
        let member = match chan.active_member(source) {
            Some(m) => {
                if !m.is_chanop() {
                    flags |= ParseFlags::NOTOPER;
                }
                Some(source)
            }
            None => {
                flags |= ParseFlags::NOTMEMBER;
                None
            }
        };

        let mut mbuf = ModeBuf::new(source, None, &name, ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        mode_parse(ctx.state, Some(&mut mbuf), source, &name, &message.params[1..], flags, member);
        mbuf.flush(ctx.state);
        Ok(())
    }

    /// User modes: only `-o` and `+i`/`-i` can be changed here
    fn handle_user_mode(&self, ctx: &mut Context<'_>, target: &str, args: &[String]) -> Result<()> {
        let source = ctx.source;
        let Some(who) = ctx.state.clients.find_user(target) else {
            ctx.reply(NumericReply::no_such_nick(target));
            return Ok(());
        };
        if who != source {
            ctx.reply(NumericReply::users_dont_match());
            return Ok(());
        }
        let Some(modes) = args.first() else {
            let current = ctx.state.clients.get(source).map(|c| c.umode_string()).unwrap_or_default();
            ctx.reply(NumericReply::umode_is(&current));
            return Ok(());
        };

        let changed = apply_user_modes(ctx.state, source, modes, false);
        if changed.len() > 1 {
            let nick = ctx.state.clients.name(source).to_string();
            let local = ctx.state.client_message(source, MessageType::Mode, vec![nick.clone(), changed.clone()]);
            ctx.state.send_to_client(source, &local);
            let relay = ctx.state.server_message(source, MessageType::Mode, vec![nick, changed]);
            ctx.state.send_to_servers(&relay, None);
        }
        Ok(())
    }

    fn handle_server_mode(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(target), Some(_)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        let (source, conn) = (ctx.source, ctx.conn);
        if target.starts_with('&') {
            return Ok(());
        }
        if !target.starts_with('#') {
            // User mode change for one of the source's own users
            let Some(who) = ctx.state.clients.find_user(target) else {
                return Ok(());
            };
            if who != source {
                debug!("Ignoring user MODE for {} from {}", target, ctx.state.clients.name(source));
                return Ok(());
            }
            let changed = apply_user_modes(ctx.state, who, &message.params[1], true);
            if changed.len() > 1 {
                let relay = ctx
                    .state
                    .server_message(who, MessageType::Mode, vec![target.to_string(), changed]);
                ctx.state.send_to_servers(&relay, Some(conn));
            }
            return Ok(());
        }
        let Some(chan) = ctx.state.channels.get(target) else {
            return Ok(());
        };
        let name = chan.name.clone();
        let args = &message.params[1..];

        if ctx.source_is_server() {
            let mut dest = ModeBufDest::CHANNEL | ModeBufDest::SERVER;
            if ctx.state.is_uworld(source) {
                dest |= ModeBufDest::HACK4;
            } else if !ctx.state.has_cap(Capabilities::OPLEVELS) {
                dest |= ModeBufDest::HACK3;
            }
            let mut mbuf = ModeBuf::new(source, Some(conn), &name, dest);
            mode_parse(
                ctx.state,
                Some(&mut mbuf),
                source,
                &name,
                args,
                ParseFlags::SET | ParseFlags::STRICT | ParseFlags::FORCE,
                None,
            );
            mbuf.flush(ctx.state);
            return Ok(());
        }

        let is_op = chan.active_member(source).map_or(false, |m| m.is_chanop());
        if !is_op {
            // Desynced op: take it back and tell the sender's side
            let mut mbuf = ModeBuf::new(
                source,
                Some(conn),
                &name,
                ModeBufDest::SERVER | ModeBufDest::HACK2 | ModeBufDest::DEOP | ModeBufDest::BOUNCE,
            );
            mode_parse(
                ctx.state,
                Some(&mut mbuf),
                source,
                &name,
                args,
                ParseFlags::STRICT | ParseFlags::BOUNCE,
                None,
            );
            mbuf.flush(ctx.state);
            return Ok(());
        }

        let mut mbuf = ModeBuf::new(source, Some(conn), &name, ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        mode_parse(
            ctx.state,
            Some(&mut mbuf),
            source,
            &name,
            args,
            ParseFlags::SET | ParseFlags::STRICT | ParseFlags::FORCE,
            Some(source),
        );
        mbuf.flush(ctx.state);
        Ok(())
    }

    fn handle_opmode(&self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        let source = ctx.source;
        if !ctx.state.clients.get(source).map_or(false, |c| c.is_oper()) {
            ctx.reply(NumericReply::no_privileges());
            return Ok(ModuleResult::Handled);
        }
        let (Some(raw), Some(_)) = (message.param(0), message.param(1)) else {
            ctx.reply(NumericReply::need_more_params("OPMODE"));
            return Ok(ModuleResult::Handled);
        };
        let (target, force) = match raw.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let Some(chan) = ctx.state.channels.get(target).filter(|_| is_channel_name(target)) else {
            ctx.reply(NumericReply::no_such_channel(target));
            return Ok(ModuleResult::Handled);
        };
        let name = chan.name.clone();
        if chan.has_apass() && !force {
            return Ok(ModuleResult::Rejected(format!(
                "{} has an Admin password; use OPMODE !{} to override it",
                name, name
            )));
        }
        let member = chan.active_member(source).map(|_| source);

        let dest = ModeBufDest::CHANNEL
            | ModeBufDest::SERVER
            | ModeBufDest::OPMODE
            | ModeBufDest::HACK4
            | ModeBufDest::LOG;
        let mut mbuf = ModeBuf::new(source, None, &name, dest);
        mode_parse(
            ctx.state,
            Some(&mut mbuf),
            source,
            &name,
            &message.params[1..],
            ParseFlags::SET | ParseFlags::FORCE,
            member,
        );
        mbuf.flush(ctx.state);
        Ok(ModuleResult::Handled)
    }

    fn handle_server_opmode(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(target), Some(_)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        if target.starts_with('&') {
            return Ok(());
        }
        let (source, conn) = (ctx.source, ctx.conn);
        let Some(chan) = ctx.state.channels.get(target) else {
            return Ok(());
        };
        let name = chan.name.clone();
        let member = chan.active_member(source).map(|_| source);

        let dest = ModeBufDest::CHANNEL | ModeBufDest::SERVER | ModeBufDest::OPMODE | ModeBufDest::HACK4;
        let mut mbuf = ModeBuf::new(source, Some(conn), &name, dest);
        mode_parse(
            ctx.state,
            Some(&mut mbuf),
            source,
            &name,
            &message.params[1..],
            ParseFlags::SET | ParseFlags::FORCE,
            member,
        );
        mbuf.flush(ctx.state);
        Ok(())
    }

    /// BMODE <bot> <channel> <modes> [args]: a change shown as made by a
    /// service bot. Servers and IRC operators only.
    fn handle_bmode(&self, ctx: &mut Context<'_>, message: &Message, from_link: bool) -> Result<()> {
        let source = ctx.source;
        let allowed = ctx.source_is_server() || ctx.state.clients.get(source).map_or(false, |c| c.is_oper());
        if !allowed {
            if !from_link {
                ctx.reply(NumericReply::no_privileges());
            }
            return Ok(());
        }
        let (Some(bot), Some(target), Some(_)) = (message.param(0), message.param(1), message.param(2)) else {
            if !from_link {
                ctx.reply(NumericReply::need_more_params("BMODE"));
            }
            return Ok(());
        };
        let Some(chan) = ctx.state.channels.get(target).filter(|c| !c.is_local()) else {
            if !from_link {
                ctx.reply(NumericReply::no_such_channel(target));
            }
            return Ok(());
        };
        let name = chan.name.clone();
        let connect = from_link.then_some(ctx.conn);

        let mut mbuf = ModeBuf::new(
            source,
            connect,
            &name,
            ModeBufDest::CHANNEL | ModeBufDest::SERVER | ModeBufDest::BOTMODE,
        );
        mbuf.set_botname(bot);
        mode_parse(
            ctx.state,
            Some(&mut mbuf),
            source,
            &name,
            &message.params[2..],
            ParseFlags::SET | ParseFlags::FORCE,
            None,
        );
        mbuf.flush(ctx.state);
        Ok(())
    }

    fn handle_clearmode(&self, ctx: &mut Context<'_>, message: &Message, from_link: bool) -> Result<()> {
        let source = ctx.source;
        if !from_link && !ctx.state.clients.get(source).map_or(false, |c| c.is_oper()) {
            ctx.reply(NumericReply::no_privileges());
            return Ok(());
        }
        let Some(target) = message.param(0) else {
            if !from_link {
                ctx.reply(NumericReply::need_more_params("CLEARMODE"));
            }
            return Ok(());
        };
        let Some(chan) = ctx.state.channels.get(target).filter(|_| is_channel_name(target)) else {
            if !from_link {
                ctx.reply(NumericReply::no_such_channel(target));
            }
            return Ok(());
        };
        if from_link && chan.is_local() {
            return Ok(());
        }
        let name = chan.name.clone();
        let letters = message.param(1).unwrap_or(DEFAULT_CLEARMODE).to_string();

        let mut dest = ModeBufDest::CHANNEL | ModeBufDest::HACK4;
        if !from_link {
            dest |= ModeBufDest::LOG;
        }
        let connect = from_link.then_some(ctx.conn);
        clear_modes(ctx.state, source, connect, &name, &letters, dest);

        if !name.starts_with('&') {
            let relay = ctx
                .state
                .server_message(source, MessageType::ClearMode, vec![name, letters]);
            ctx.state.send_to_servers(&relay, connect);
        }
        Ok(())
    }
}

/// Apply a user mode string; returns the changes actually made, `+`
/// alone when nothing changed
fn apply_user_modes(state: &mut State, user: ClientId, modes: &str, from_link: bool) -> String {
    let Some(client) = state.clients.get_mut(user) else {
        return String::new();
    };
    let mut add = true;
    let mut plus = String::new();
    let mut minus = String::new();
    for letter in modes.chars() {
        let flag = match letter {
            '+' => {
                add = true;
                continue;
            }
            '-' => {
                add = false;
                continue;
            }
            'o' | 'O' => ClientFlags::OPER,
            'i' => ClientFlags::INVISIBLE,
            _ => continue,
        };
        // Operator status only comes from OPER or a server
        if flag == ClientFlags::OPER && add && !from_link {
            continue;
        }
        if client.flags.contains(flag) == add {
            continue;
        }
        client.flags.set(flag, add);
        let letter = if flag == ClientFlags::OPER { 'o' } else { 'i' };
        if add {
            plus.push(letter);
        } else {
            minus.push(letter);
        }
    }
    let mut out = String::new();
    if !plus.is_empty() {
        out.push('+');
        out.push_str(&plus);
    }
    if !minus.is_empty() {
        out.push('-');
        out.push_str(&minus);
    }
    if out.is_empty() {
        out.push('+');
    }
    out
}

/// Remove every mode named in `letters` from a channel and announce it
fn clear_modes(
    state: &mut State,
    source: ClientId,
    connect: Option<ConnId>,
    channel: &str,
    letters: &str,
    dest: ModeBufDest,
) {
    let mut del = ChannelModes::empty();
    let (mut ops, mut voices, mut bans) = (false, false, false);
    for letter in letters.chars() {
        match letter {
            'o' => ops = true,
            'v' => voices = true,
            'b' => bans = true,
            'k' => del |= ChannelModes::KEY,
            'l' => del |= ChannelModes::LIMIT,
            _ => {
                if let Some((flag, _)) = SIMPLE_MODES.iter().find(|(_, c)| *c == letter) {
                    del |= *flag;
                }
            }
        }
    }

    let Some(chan) = state.channels.get_mut(channel) else {
        return;
    };
    let mut mbuf = ModeBuf::new(source, connect, channel, dest);
    mbuf.mode(false, del & chan.mode.mode);

    if del.contains(ChannelModes::KEY) && !chan.mode.key.is_empty() {
        mbuf.mode_string(false, 'k', &chan.mode.key);
        chan.mode.key.clear();
    }
    if del.contains(ChannelModes::LIMIT) && chan.mode.limit > 0 {
        mbuf.mode_uint(false, chan.mode.limit);
        chan.mode.limit = 0;
    }
    let clear_invites = del.contains(ChannelModes::INVITEONLY);
    chan.mode.mode.remove(del);

    if bans {
        for ban in chan.bans.drain(..) {
            mbuf.mode_string(false, 'b', &ban.mask);
        }
        chan.invalidate_ban_cache();
    }
    if ops || voices {
        for member in chan.members.iter_mut().filter(|m| !m.is_zombie()) {
            if ops && member.is_chanop() {
                mbuf.mode_client(false, 'o', member.user, member.oplevel);
                member.status.remove(MemberFlags::CHANOP);
            }
            if voices && member.has_voice() {
                mbuf.mode_client(false, 'v', member.user, member.oplevel);
                member.status.remove(MemberFlags::VOICE);
            }
        }
    }
    if clear_invites {
        state.channels.clear_invites(channel);
    }
    mbuf.flush(state);
}

impl Default for ModeModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for ModeModule {
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
            MessageType::Mode,
            MessageType::OpMode,
            MessageType::BMode,
            MessageType::ClearMode,
        ]
    }

    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Mode => self.handle_mode(ctx, message)?,
            MessageType::OpMode => return self.handle_opmode(ctx, message),
            MessageType::BMode => self.handle_bmode(ctx, message, false)?,
            MessageType::ClearMode => self.handle_clearmode(ctx, message, false)?,
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Mode => self.handle_server_mode(ctx, message)?,
            MessageType::OpMode => self.handle_server_opmode(ctx, message)?,
            MessageType::BMode => self.handle_bmode(ctx, message, true)?,
            MessageType::ClearMode => self.handle_clearmode(ctx, message, true)?,
            _ => return Err(Error::Protocol(format!("unexpected {}", message.command))),
        }
        Ok(ModuleResult::Handled)
    }
}
