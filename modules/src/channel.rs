//! Channel operations module
//!
//! JOIN, CREATE, PART, KICK, TOPIC, INVITE and NAMES, from local users
//! and from server links.

use async_trait::async_trait;
use tsircd_core::ban::find_ban;
use tsircd_core::matching::is_valid_channel;
use tsircd_core::membership::MAXOPLEVEL;
use tsircd_core::wire::{pack_items, BUFSIZE};
use tsircd_core::{
    debug, Capabilities, ChannelModes, ClientId, ConnId, Context, Error, GetChannel, JoinBuf, JoinType, MemberFlags,
    Message, MessageType, ModeBuf, ModeBufDest, Module, ModuleResult, NumericReply, Prefix, Result, State,
};

use crate::messaging::member_can_send;

/// TS given to channels created by a remote JOIN that carried none
pub const MAGIC_REMOTE_JOIN_TS: i64 = 1_270_080_000;

/// A CREATE this much older than now is not believed
pub const TS_LAG_TIME: i64 = 86_400;

/// What a local JOIN will do to one channel
enum JoinPlan {
    /// Channel does not exist yet
    Create,
    /// Join an existing channel with these flags
    Join(MemberFlags),
    /// Already a member
    Skip,
}

/// Channel operations module
pub struct ChannelModule {
    name: String,
    version: String,
    description: String,
}

impl ChannelModule {
    pub fn new() -> Self {
        Self {
            name: "channel".to_string(),
            version: "1.0.0".to_string(),
            description: "Channel membership: JOIN, PART, KICK, TOPIC, INVITE, NAMES".to_string(),
        }
    }
}

impl Default for ChannelModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for ChannelModule {
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
            MessageType::Join,
            MessageType::Create,
            MessageType::Part,
            MessageType::Kick,
            MessageType::Topic,
            MessageType::Invite,
            MessageType::Names,
        ]
    }

    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Join => self.handle_join(ctx, message)?,
            MessageType::Part => self.handle_part(ctx, message)?,
            MessageType::Kick => self.handle_kick(ctx, message)?,
            MessageType::Topic => self.handle_topic(ctx, message)?,
            MessageType::Invite => self.handle_invite(ctx, message)?,
            MessageType::Names => self.handle_names(ctx, message)?,
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Join => self.handle_server_join(ctx, message)?,
            MessageType::Create => self.handle_server_create(ctx, message)?,
            MessageType::Part => self.handle_server_part(ctx, message)?,
            MessageType::Kick => self.handle_server_kick(ctx, message)?,
            MessageType::Topic => self.handle_server_topic(ctx, message)?,
            MessageType::Invite => self.handle_server_invite(ctx, message)?,
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }
}

impl ChannelModule {
    fn handle_join(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(list) = message.param(0).filter(|p| !p.is_empty()) else {
            ctx.reply(NumericReply::need_more_params("JOIN"));
            return Ok(());
        };
        let keys: Vec<&str> = message.param(1).map(|k| k.split(',').collect()).unwrap_or_default();
        let source = ctx.source;
        let now = ctx.state.now();
        let max_len = ctx.state.config.channels.channel_length;
        let max_channels = ctx.state.config.channels.max_channels_per_user;
        let local_ok = ctx.state.has_cap(Capabilities::LOCAL_CHANNELS);

        let mut create = JoinBuf::new(source, None, JoinType::Create, None, now);
        let mut joined: Vec<String> = Vec::new();

        for (idx, name) in list.split(',').enumerate() {
            if name == "0" {
                create.flush(ctx.state);
                part_all(ctx.state, source, None);
                joined.clear();
                continue;
            }
            if !is_valid_channel(name, max_len, local_ok) {
                ctx.reply(NumericReply::no_such_channel(name));
                continue;
            }
            if create.contains(name) {
                continue;
            }
            if ctx.state.channels.channel_count(source) + create.len() >= max_channels {
                ctx.reply(NumericReply::too_many_channels(name));
                break;
            }

            let key = keys.get(idx).copied().filter(|k| !k.is_empty());
            let plan = match plan_join(ctx.state, source, name, key) {
                Ok(plan) => plan,
                Err(reply) => {
                    ctx.reply(reply);
                    continue;
                }
            };
            match plan {
                JoinPlan::Skip => continue,
                JoinPlan::Create => {
                    ctx.state.channels.get_channel(name, GetChannel::Create, now);
                    let mut flags = MemberFlags::CHANOP | MemberFlags::CHANNEL_MANAGER;
                    if ctx.state.has_cap(Capabilities::OWNER) {
                        flags |= MemberFlags::OWNER;
                    }
                    create.join(ctx.state, name, flags);
                    joined.push(name.to_string());
                }
                JoinPlan::Join(flags) => {
                    let chan_name = ctx
                        .state
                        .channels
                        .get(name)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| name.to_string());
                    let mut join = JoinBuf::new(source, None, JoinType::Join, None, now);
                    join.join(ctx.state, &chan_name, flags);
                    join.flush(ctx.state);

                    if flags.contains(MemberFlags::CHANOP) {
                        let oplevel = ctx
                            .state
                            .channels
                            .find_member_link(&chan_name, source)
                            .map_or(MAXOPLEVEL, |m| m.oplevel);
                        let me = ctx.state.me();
                        let mut mbuf = ModeBuf::new(me, None, &chan_name, ModeBufDest::SERVER);
                        mbuf.mode_client(true, 'o', source, oplevel);
                        mbuf.flush(ctx.state);
                    }
                    joined.push(chan_name);
                }
            }
            ctx.state.channels.remove_invite(name, source);
        }
        create.flush(ctx.state);

        for name in joined {
            if ctx.state.channels.find_member_link(&name, source).is_none() {
                continue;
            }
            send_topic(ctx.state, source, &name, false);
            send_names(ctx.state, source, &name);
        }
        Ok(())
    }

    fn handle_server_join(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        if ctx.source_is_server() {
            let text = "server tried to JOIN a channel";
            ctx.state.protocol_violation(ctx.source, text);
            return Ok(());
        }
        let Some(list) = message.param(0) else {
            return Ok(());
        };
        let creation = message.param(1).and_then(|ts| ts.parse::<i64>().ok()).unwrap_or(0);
        let (source, conn) = (ctx.source, ctx.conn);
        let mut join = JoinBuf::new(source, Some(conn), JoinType::Join, None, creation);

        for name in list.split(',') {
            if name == "0" {
                join.flush(ctx.state);
                part_all(ctx.state, source, Some(conn));
                continue;
            }
            if name.starts_with('&') {
                ctx.state.protocol_violation(source, &format!("JOIN for local channel {}", name));
                continue;
            }

            let existing = ctx.state.channels.get(name).map(|c| c.name.clone());
            let name = match existing {
                None => {
                    let ts = if creation != 0 { creation } else { MAGIC_REMOTE_JOIN_TS };
                    match ctx.state.channels.get_channel(name, GetChannel::Create, ts) {
                        Some(chan) => {
                            chan.creationtime = ts;
                            chan.name.clone()
                        }
                        None => continue,
                    }
                }
                Some(name) => {
                    if let Some(member) = ctx.state.channels.find_member_link(&name, source) {
                        if !member.is_zombie() {
                            continue;
                        }
                        ctx.state
                            .protocol_violation(source, &format!("JOIN for {} while still a zombie", name));
                        ctx.state.remove_user_from_channel(&name, source);
                        if ctx.state.channels.get(&name).is_none() {
                            let ts = if creation != 0 { creation } else { MAGIC_REMOTE_JOIN_TS };
                            ctx.state.channels.get_channel(&name, GetChannel::Create, ts);
                        }
                    }
                    adopt_join_ts(ctx.state, source, conn, &name, creation);
                    name
                }
            };
            join.join(ctx.state, &name, MemberFlags::DEOPPED);
        }
        join.flush(ctx.state);
        Ok(())
    }

    fn handle_server_create(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        if ctx.source_is_server() {
            let name = ctx.state.clients.name(ctx.source).to_string();
            ctx.state
                .protocol_violation(ctx.source, &format!("{} tried to CREATE a channel", name));
            return Ok(());
        }
        let (Some(list), Some(ts)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        let chan_ts = ts.parse::<i64>().unwrap_or(0);
        let (source, conn) = (ctx.source, ctx.conn);
        let now = ctx.state.now();

        if now - chan_ts < -60 {
            let server = ctx
                .state
                .clients
                .server_of(source)
                .map(|s| ctx.state.clients.name(s).to_string())
                .unwrap_or_default();
            ctx.state
                .sendto_opmask(&format!("Timestamp drift from {} ({}s)", server, now - chan_ts));
        }

        let link_bursting = ctx
            .state
            .clients
            .by_link(conn)
            .and_then(|peer| ctx.state.clients.get(peer))
            .map_or(false, |peer| peer.is_burst_or_burst_ack());

        let mut join = JoinBuf::new(source, Some(conn), JoinType::Join, None, 0);
        let mut create = JoinBuf::new(source, Some(conn), JoinType::Create, None, chan_ts);

        for name in list.split(',') {
            if name.starts_with('&') {
                continue;
            }
            let badop = match ctx.state.channels.get(name) {
                Some(chan) => {
                    if chan.member(source).is_some() {
                        return Err(Error::Protocol(format!(
                            "{} tried to CREATE {}, already joined",
                            ctx.state.clients.name(source),
                            chan.name
                        )));
                    }
                    let zannel = chan.user_count() == 0 && !chan.has_apass();
                    now - chan_ts > TS_LAG_TIME || (chan.creationtime != 0 && chan_ts > chan.creationtime && !zannel)
                }
                None => {
                    ctx.state.channels.get_channel(name, GetChannel::Create, chan_ts);
                    false
                }
            };
            let chan_name = ctx
                .state
                .channels
                .get(name)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| name.to_string());

            if badop {
                if !link_bursting {
                    let mut mbuf = ModeBuf::new(
                        source,
                        Some(conn),
                        &chan_name,
                        ModeBufDest::SERVER | ModeBufDest::HACK2 | ModeBufDest::BOUNCE,
                    );
                    mbuf.mode_client(true, 'o', source, MAXOPLEVEL);
                    mbuf.flush(ctx.state);
                }
                join.join(ctx.state, &chan_name, MemberFlags::DEOPPED);
            } else {
                if let Some(chan) = ctx.state.channels.get_mut(&chan_name) {
                    chan.creationtime = chan_ts;
                }
                create.join(ctx.state, &chan_name, MemberFlags::CHANOP);
            }
        }
        join.flush(ctx.state);
        create.flush(ctx.state);
        Ok(())
    }

    fn handle_part(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(list) = message.param(0).filter(|p| !p.is_empty()) else {
            ctx.reply(NumericReply::need_more_params("PART"));
            return Ok(());
        };
        let comment = message.param(1).filter(|c| !c.is_empty());
        let source = ctx.source;
        let mut parts = JoinBuf::new(source, None, JoinType::Part, comment, 0);

        for name in list.split(',') {
            let Some(chan) = ctx.state.channels.get(name) else {
                ctx.reply(NumericReply::no_such_channel(name));
                continue;
            };
            let Some(member) = chan.member(source) else {
                let chan_name = chan.name.clone();
                ctx.reply(NumericReply::not_on_channel(&chan_name));
                continue;
            };
            let mut flags = member.status;
            let quiet = chan.mode.mode.contains(ChannelModes::NOQUITPARTS);
            let chan_name = chan.name.clone();
            if quiet || !member_can_send(ctx.state, &chan_name, source) {
                flags.insert(MemberFlags::BANNED);
            }
            parts.join(ctx.state, &chan_name, flags);
        }
        parts.flush(ctx.state);
        Ok(())
    }

    fn handle_server_part(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        if ctx.source_is_server() {
            ctx.state.protocol_violation(ctx.source, "server tried to PART a channel");
            return Ok(());
        }
        let Some(list) = message.param(0) else {
            return Ok(());
        };
        let (source, conn) = (ctx.source, ctx.conn);
        let mut parts = JoinBuf::new(source, Some(conn), JoinType::Part, message.param(1), 0);
        for name in list.split(',') {
            let flags = match ctx.state.channels.find_member_link(name, source) {
                Some(member) => member.status,
                None => continue,
            };
            parts.join(ctx.state, name, flags);
        }
        parts.flush(ctx.state);
        Ok(())
    }

    fn handle_kick(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(name), Some(target)) = (message.param(0), message.param(1)) else {
            ctx.reply(NumericReply::need_more_params("KICK"));
            return Ok(());
        };
        let source = ctx.source;
        let Some(chan) = ctx.state.channels.get(name) else {
            ctx.reply(NumericReply::no_such_channel(name));
            return Ok(());
        };
        let chan_name = chan.name.clone();
        let kicker = match chan.active_member(source) {
            Some(m) if m.is_chanop() => m.clone(),
            _ => {
                ctx.reply(NumericReply::chan_op_privs_needed(&chan_name));
                return Ok(());
            }
        };
        let Some(who) = ctx.state.clients.find_user(target) else {
            ctx.reply(NumericReply::no_such_nick(target));
            return Ok(());
        };
        let who_name = ctx.state.clients.name(who).to_string();
        if ctx.state.clients.get(who).map_or(false, |c| c.is_channel_service()) {
            ctx.reply(NumericReply::is_chan_service(&who_name, &chan_name));
            return Ok(());
        }
        let Some(victim) = ctx.state.channels.find_member_link(&chan_name, who).filter(|m| !m.is_zombie()).cloned()
        else {
            ctx.reply(NumericReply::user_not_in_channel(&who_name, &chan_name));
            return Ok(());
        };
        if ctx.state.has_cap(Capabilities::OPLEVELS)
            && (victim.oplevel < kicker.oplevel || (victim.oplevel == kicker.oplevel && victim.oplevel < MAXOPLEVEL))
        {
            ctx.reply(NumericReply::not_lower_op_level(
                &who_name,
                &chan_name,
                kicker.oplevel,
                victim.oplevel,
                "kick",
            ));
            return Ok(());
        }

        let nick = ctx.state.clients.name(source).to_string();
        let comment = message
            .param(2)
            .filter(|c| !c.is_empty())
            .unwrap_or(nick.as_str())
            .to_string();

        if !chan_name.starts_with('&') {
            let who_numeric = ctx.state.clients.numeric(who).to_string();
            let kick = ctx.state.server_message(
                source,
                MessageType::Kick,
                vec![chan_name.clone(), who_numeric, comment.clone()],
            );
            ctx.state.send_to_servers(&kick, None);
        }

        let kick = ctx
            .state
            .client_message(source, MessageType::Kick, vec![chan_name.clone(), who_name, comment]);
        if victim.is_delayed() {
            ctx.state.send_to_client(who, &kick);
            let join = ctx.state.client_message(who, MessageType::Join, vec![chan_name.clone()]);
            ctx.state.send_to_client(source, &join);
            ctx.state.send_to_client(source, &kick);
        } else {
            ctx.state.send_to_channel(&chan_name, &kick, None);
        }
        ctx.state.make_zombie(&chan_name, who, None, source);
        Ok(())
    }

    fn handle_server_kick(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(name), Some(target)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        if name.starts_with('&') {
            return Ok(());
        }
        let (source, conn) = (ctx.source, ctx.conn);
        let Some(chan_name) = ctx.state.channels.get(name).map(|c| c.name.clone()) else {
            return Ok(());
        };
        let Some(who) = ctx.state.clients.find_by_numeric(target).filter(|id| !ctx.state.clients.is_server(*id)) else {
            return Ok(());
        };
        let comment = message.param(2).unwrap_or("").to_string();
        let who_name = ctx.state.clients.name(who).to_string();
        let member = ctx.state.channels.find_member_link(&chan_name, who).cloned();

        let from_server = ctx.source_is_server();
        if from_server {
            let bursting = ctx.state.clients.get(source).map_or(false, |s| s.is_burst_or_burst_ack());
            if !bursting && !ctx.state.is_uworld(source) {
                let server = ctx.state.clients.name(source).to_string();
                ctx.state
                    .sendto_opmask(&format!("HACK: {} KICK {} {} {}", server, chan_name, who_name, comment));
            }
        }

        let kick = ctx.state.server_message(
            source,
            MessageType::Kick,
            vec![chan_name.clone(), target.to_string(), comment.clone()],
        );
        ctx.state.send_to_servers(&kick, Some(conn));

        let Some(member) = member else {
            return Ok(());
        };
        if !member.is_zombie() {
            let prefix = announce_prefix(ctx.state, source);
            let kick = Message::with_prefix(prefix, MessageType::Kick, vec![chan_name.clone(), who_name, comment]);
            if member.is_delayed() {
                ctx.state.send_to_client(who, &kick);
            } else {
                ctx.state.send_to_channel(&chan_name, &kick, None);
            }
        }
        ctx.state.make_zombie(&chan_name, who, Some(conn), source);
        Ok(())
    }

    fn handle_topic(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(name) = message.param(0).filter(|p| !p.is_empty()) else {
            ctx.reply(NumericReply::need_more_params("TOPIC"));
            return Ok(());
        };
        let source = ctx.source;
        let Some(chan) = ctx.state.channels.get(name) else {
            ctx.reply(NumericReply::no_such_channel(name));
            return Ok(());
        };
        let chan_name = chan.name.clone();
        let member = chan.active_member(source).cloned();
        let secret = chan.mode.mode.contains(ChannelModes::SECRET);
        let limited = chan.mode.mode.contains(ChannelModes::TOPICLIMIT);
        let creationtime = chan.creationtime;

        let Some(text) = message.param(1) else {
            if member.is_none() && secret {
                ctx.reply(NumericReply::not_on_channel(&chan_name));
            } else {
                send_topic(ctx.state, source, &chan_name, true);
            }
            return Ok(());
        };
        let Some(member) = member else {
            ctx.reply(NumericReply::not_on_channel(&chan_name));
            return Ok(());
        };
        if limited && !member.is_chanop() {
            ctx.reply(NumericReply::chan_op_privs_needed(&chan_name));
            return Ok(());
        }

        let text = truncate(text, ctx.state.config.channels.topic_length);
        let now = ctx.state.now();
        let nick = ctx.state.clients.name(source).to_string();
        if let Some(chan) = ctx.state.channels.get_mut(&chan_name) {
            chan.topic.text = text.clone();
            chan.topic.setter = nick;
            chan.topic.time = now;
        }
        if member.is_delayed() {
            ctx.state.reveal_delayed(&chan_name, source);
        }

        if !chan_name.starts_with('&') {
            let topic = ctx.state.server_message(
                source,
                MessageType::Topic,
                vec![chan_name.clone(), creationtime.to_string(), now.to_string(), text.clone()],
            );
            ctx.state.send_to_servers(&topic, None);
        }
        let topic = ctx.state.client_message(source, MessageType::Topic, vec![chan_name.clone(), text]);
        ctx.state.send_to_channel(&chan_name, &topic, None);
        Ok(())
    }

    fn handle_server_topic(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let Some(name) = message.param(0) else {
            return Ok(());
        };
        if name.starts_with('&') || message.params.len() < 2 {
            return Ok(());
        }
        let (source, conn) = (ctx.source, ctx.conn);
        let Some(chan) = ctx.state.channels.get(name) else {
            return Ok(());
        };
        let chan_name = chan.name.clone();
        let text = message.params[message.params.len() - 1].clone();

        let (chan_ts, topic_ts) = if message.params.len() >= 4 {
            (message.param(1).and_then(|t| t.parse::<i64>().ok()), message.param(2).and_then(|t| t.parse::<i64>().ok()))
        } else {
            (None, None)
        };
        if chan_ts.map_or(false, |ts| ts != 0 && chan.creationtime < ts) {
            debug!("Ignoring TOPIC for {} from a younger channel", chan_name);
            return Ok(());
        }
        if topic_ts.map_or(false, |ts| ts != 0 && chan.topic.time > ts) {
            debug!("Ignoring TOPIC for {}: ours is newer", chan_name);
            return Ok(());
        }
        let changed = chan.topic.text != text;
        let creationtime = chan.creationtime;

        let when = topic_ts.filter(|ts| *ts != 0).unwrap_or_else(|| ctx.state.now());
        let setter = ctx.state.clients.name(source).to_string();
        if let Some(chan) = ctx.state.channels.get_mut(&chan_name) {
            chan.topic.text = text.clone();
            chan.topic.setter = setter;
            chan.topic.time = when;
        }

        let topic = ctx.state.server_message(
            source,
            MessageType::Topic,
            vec![chan_name.clone(), creationtime.to_string(), when.to_string(), text.clone()],
        );
        ctx.state.send_to_servers(&topic, Some(conn));

        if changed {
            let prefix = announce_prefix(ctx.state, source);
            let topic = Message::with_prefix(prefix, MessageType::Topic, vec![chan_name.clone(), text]);
            ctx.state.send_to_channel(&chan_name, &topic, None);
        }
        Ok(())
    }

    fn handle_invite(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(nick), Some(name)) = (message.param(0), message.param(1).filter(|p| !p.is_empty())) else {
            ctx.reply(NumericReply::need_more_params("INVITE"));
            return Ok(());
        };
        let source = ctx.source;
        let Some(who) = ctx.state.clients.find_user(nick) else {
            ctx.reply(NumericReply::no_such_nick(nick));
            return Ok(());
        };
        let Some(chan) = ctx.state.channels.get(name) else {
            ctx.reply(NumericReply::no_such_channel(name));
            return Ok(());
        };
        let chan_name = chan.name.clone();
        let creationtime = chan.creationtime;
        let Some(member) = chan.active_member(source) else {
            ctx.reply(NumericReply::not_on_channel(&chan_name));
            return Ok(());
        };
        let is_op = member.is_chanop();
        let who_name = ctx.state.clients.name(who).to_string();
        if chan.active_member(who).is_some() {
            ctx.reply(NumericReply::user_on_channel(&who_name, &chan_name));
            return Ok(());
        }
        if !is_op {
            ctx.reply(NumericReply::chan_op_privs_needed(&chan_name));
            return Ok(());
        }

        ctx.reply(NumericReply::inviting(&who_name, &chan_name));
        if ctx.state.clients.is_local_user(who) {
            let inviter = ctx.state.prefix_of(source).to_string();
            ctx.state.channels.add_invite(&chan_name, who, &inviter);
            let invite = ctx.state.client_message(source, MessageType::Invite, vec![who_name, chan_name]);
            ctx.state.send_to_client(who, &invite);
        } else if !chan_name.starts_with('&') {
            if let Some(link) = ctx.state.clients.get(who).and_then(|c| c.link) {
                let invite = ctx.state.server_message(
                    source,
                    MessageType::Invite,
                    vec![who_name, chan_name, creationtime.to_string()],
                );
                ctx.state.send_to_link(link, &invite);
            }
        }
        Ok(())
    }

    fn handle_server_invite(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let source = ctx.source;
        if ctx.source_is_server() {
            ctx.state.protocol_violation(source, "server tried to INVITE a user");
            return Ok(());
        }
        let (Some(nick), Some(name)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        let Some(who) = ctx.state.clients.find_user(nick) else {
            return Ok(());
        };
        if name.starts_with('&') {
            ctx.state.protocol_violation(source, &format!("INVITE to local channel {}", name));
            return Ok(());
        }
        let Some(chan) = ctx.state.channels.get(name) else {
            return Ok(());
        };
        let chan_name = chan.name.clone();
        let invite_ts = message.param(2).and_then(|t| t.parse::<i64>().ok());
        if invite_ts.map_or(false, |ts| ts > chan.creationtime) {
            debug!("Ignoring INVITE to {} with a younger TS", chan_name);
            return Ok(());
        }

        if !ctx.state.clients.is_local_user(who) {
            if let Some(link) = ctx.state.clients.get(who).and_then(|c| c.link) {
                let mut relayed = message.clone();
                relayed.prefix = Some(ctx.state.numeric_prefix_of(source));
                ctx.state.send_to_link(link, &relayed);
            }
            return Ok(());
        }
        let inviter = ctx.state.prefix_of(source).to_string();
        ctx.state.channels.add_invite(&chan_name, who, &inviter);
        let who_name = ctx.state.clients.name(who).to_string();
        let invite = ctx.state.client_message(source, MessageType::Invite, vec![who_name, chan_name]);
        ctx.state.send_to_client(who, &invite);
        Ok(())
    }

    fn handle_names(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let source = ctx.source;
        match message.param(0).filter(|p| !p.is_empty()) {
            Some(list) => {
                for name in list.split(',') {
                    match ctx.state.channels.get(name).map(|c| c.name.clone()) {
                        Some(chan_name) => send_names(ctx.state, source, &chan_name),
                        None => ctx.reply(NumericReply::end_of_names(name)),
                    }
                }
            }
            None => {
                for name in ctx.state.channels.names() {
                    send_names_only(ctx.state, source, &name);
                }
                ctx.reply(NumericReply::end_of_names("*"));
            }
        }
        Ok(())
    }
}

/// Decide what a local JOIN does to `name`, or the error numeric to send
fn plan_join(state: &mut State, source: ClientId, name: &str, key: Option<&str>) -> std::result::Result<JoinPlan, Message> {
    let Some(client) = state.clients.get(source) else {
        return Ok(JoinPlan::Skip);
    };
    let Some(chan) = state.channels.get_mut(name) else {
        return Ok(JoinPlan::Create);
    };
    if chan.member(source).is_some() {
        return Ok(JoinPlan::Skip);
    }

    let mode = &chan.mode;
    let key_is = |pass: &str| !pass.is_empty() && key == Some(pass);
    if key_is(&mode.apass) {
        return Ok(JoinPlan::Join(MemberFlags::CHANOP | MemberFlags::CHANNEL_MANAGER));
    }
    if key_is(&mode.upass) {
        return Ok(JoinPlan::Join(MemberFlags::CHANOP));
    }
    if chan.user_count() == 0 && !chan.has_apass() && !mode.mode.contains(ChannelModes::REGISTERED) {
        // Rejoining a zannel: ops, and a TS that beats the DESTRUCT in flight
        chan.creationtime += 1;
        return Ok(JoinPlan::Join(MemberFlags::CHANOP));
    }
    if chan.is_invited(source) {
        return Ok(JoinPlan::Join(MemberFlags::DEOPPED));
    }

    let chan_name = chan.name.clone();
    let modes = mode.mode;
    if modes.contains(ChannelModes::INVITEONLY) {
        Err(NumericReply::invite_only_chan(&chan_name))
    } else if mode.limit > 0 && modes.contains(ChannelModes::LIMIT) && chan.user_count() >= mode.limit as usize {
        Err(NumericReply::channel_is_full(&chan_name))
    } else if modes.contains(ChannelModes::REGONLY) && client.account.is_none() {
        Err(NumericReply::need_regged_nick(&chan_name))
    } else if modes.contains(ChannelModes::SSLONLY) && !client.flags.contains(tsircd_core::ClientFlags::SSL) {
        Err(NumericReply::secure_only_chan(&chan_name))
    } else if find_ban(client, &chan.bans).is_some() {
        Err(NumericReply::banned_from_chan(&chan_name))
    } else if !mode.key.is_empty() && key != Some(mode.key.as_str()) {
        Err(NumericReply::bad_channel_key(&chan_name))
    } else {
        Ok(JoinPlan::Join(MemberFlags::DEOPPED))
    }
}

/// Copy an older (or rejoined-zannel) TS from a remote JOIN, wiping our
/// modes so nobody keeps ops gained under the younger TS.
fn adopt_join_ts(state: &mut State, source: ClientId, conn: ConnId, channel: &str, creation: i64) {
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    let adopt = creation != 0 && (creation < chan.creationtime || (!chan.has_apass() && chan.user_count() == 0));
    if !adopt {
        return;
    }

    let mode = chan.mode.clone();
    let privileged: Vec<(ClientId, bool, bool, u16)> = chan
        .members
        .iter()
        .filter(|m| m.is_chanop() || m.has_voice())
        .map(|m| (m.user, m.is_chanop(), m.has_voice(), m.oplevel))
        .collect();

    let mut mbuf = ModeBuf::new(source, Some(conn), channel, ModeBufDest::CHANNEL);
    mbuf.mode(false, mode.mode);
    if mode.mode.contains(ChannelModes::LIMIT) {
        mbuf.mode_uint(false, mode.limit);
    }
    if !mode.key.is_empty() {
        mbuf.mode_string(false, 'k', &mode.key);
    }
    if !mode.upass.is_empty() {
        mbuf.mode_string(false, 'U', &mode.upass);
    }
    if !mode.apass.is_empty() {
        mbuf.mode_string(false, 'A', &mode.apass);
    }
    for (user, op, voice, oplevel) in privileged {
        if op {
            mbuf.mode_client(false, 'o', user, oplevel);
        }
        if voice {
            mbuf.mode_client(false, 'v', user, oplevel);
        }
        if let Some(member) = state.channels.find_member_link_mut(channel, user) {
            member.status.remove(MemberFlags::CHANOP | MemberFlags::VOICE);
        }
    }

    if let Some(chan) = state.channels.get_mut(channel) {
        chan.creationtime = creation;
        chan.mode.limit = 0;
        chan.mode.key.clear();
        chan.mode.upass.clear();
        chan.mode.apass.clear();
        chan.mode.mode.remove(ChannelModes::LIMIT | ChannelModes::KEY | ChannelModes::UPASS | ChannelModes::APASS);
    }
    mbuf.flush(state);
}

/// `JOIN 0`: leave every channel
fn part_all(state: &mut State, source: ClientId, connect: Option<ConnId>) {
    let mut part = JoinBuf::new(source, connect, JoinType::PartAll, Some("Left all channels"), 0);
    part.join_zero();
    for name in state.channels.channels_of(source) {
        let flags = state
            .channels
            .find_member_link(&name, source)
            .map_or(MemberFlags::empty(), |m| m.status);
        part.join(state, &name, flags);
    }
    part.flush(state);
}

/// Who a channel sees as the source: servers hide behind the network name
fn announce_prefix(state: &State, source: ClientId) -> Prefix {
    if state.clients.is_server(source) {
        Prefix::Server(state.config.server.his_servername.clone())
    } else {
        state.prefix_of(source)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// RPL_TOPIC and RPL_TOPICWHOTIME; RPL_NOTOPIC only when asked
pub(crate) fn send_topic(state: &mut State, to: ClientId, channel: &str, reply_empty: bool) {
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    let topic = chan.topic.clone();
    let name = chan.name.clone();
    if topic.text.is_empty() {
        if reply_empty {
            state.send_numeric(to, NumericReply::no_topic(&name));
        }
        return;
    }
    state.send_numeric(to, NumericReply::topic(&name, &topic.text));
    state.send_numeric(to, NumericReply::topic_who_time(&name, &topic.setter, topic.time));
}

/// RPL_NAMREPLY lines followed by RPL_ENDOFNAMES
pub(crate) fn send_names(state: &mut State, to: ClientId, channel: &str) {
    send_names_only(state, to, channel);
    let name = state.channels.get(channel).map_or_else(|| channel.to_string(), |c| c.name.clone());
    state.send_numeric(to, NumericReply::end_of_names(&name));
}

fn send_names_only(state: &mut State, to: ClientId, channel: &str) {
    let Some(chan) = state.channels.get(channel) else {
        return;
    };
    let is_member = chan.active_member(to).is_some();
    if chan.mode.mode.contains(ChannelModes::SECRET) && !is_member {
        return;
    }
    let symbol = if chan.mode.mode.contains(ChannelModes::SECRET) {
        "@"
    } else if chan.mode.mode.contains(ChannelModes::PRIVATE) {
        "*"
    } else {
        "="
    };
    let names: Vec<String> = chan
        .members
        .iter()
        .filter(|m| !m.is_zombie() && (!m.is_delayed() || m.user == to))
        .filter_map(|m| state.clients.get(m.user).map(|c| format!("{}{}", m.names_prefix(), c.name)))
        .collect();
    let name = chan.name.clone();

    let header = state.clients.me_name().len() + state.clients.name(to).len() + name.len() + 12;
    for line in pack_items(names.iter().map(String::as_str), header, BUFSIZE - 2, ' ') {
        state.send_numeric(to, NumericReply::name_reply(symbol, &name, &line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Net;

    #[tokio::test]
    async fn test_join_creates_channel_with_ops() {
        let mut net = Net::new().await;
        let alice = net.user("alice", 10);
        net.server("leaf.example.net", "AC", 20);

        net.line(10, "JOIN #test").await;

        let chan = net.state.channels.get("#test").unwrap();
        assert_eq!(chan.creationtime, 1000);
        let member = chan.member(alice).unwrap();
        assert!(member.is_chanop());
        assert_eq!(member.oplevel, MAXOPLEVEL);

        let lines = net.lines(10);
        assert_eq!(lines.iter().filter(|l| l.as_str() == ":alice!a@h JOIN #test").count(), 1);
        assert!(lines.contains(&":irc.example.net 353 alice = #test @alice".to_string()));
        assert!(lines.contains(&":irc.example.net 366 alice #test :End of /NAMES list.".to_string()));
        assert_eq!(net.lines(20), vec!["ABAAA C #test 1000"]);
    }

    #[tokio::test]
    async fn test_join_existing_channel_checks() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        let bob = net.user("bob", 11);
        net.line(10, "JOIN #k").await;
        net.line(10, "MODE #k +ki sekrit").await;
        net.clear();

        net.line(11, "JOIN #k").await;
        assert_eq!(net.lines(11), vec![":irc.example.net 473 bob #k :Cannot join channel (+i)"]);
        net.clear();

        net.line(10, "INVITE bob #k").await;
        assert_eq!(net.lines(10), vec![":irc.example.net 341 alice bob #k"]);
        assert_eq!(net.lines(11), vec![":alice!a@h INVITE bob #k"]);
        net.clear();

        // The invite bypasses +i and +k, and is used up
        net.line(11, "JOIN #k").await;
        let member = net.state.channels.find_member_link("#k", bob).unwrap();
        assert!(!member.is_chanop());
        assert!(!net.state.channels.get("#k").unwrap().is_invited(bob));
    }

    #[tokio::test]
    async fn test_zannel_rejoin_bumps_ts() {
        let mut net = Net::new().await;
        let alice = net.user("alice", 10);
        net.server("leaf.example.net", "AC", 20);
        net.line(10, "JOIN #z").await;
        net.line(10, "PART #z").await;
        assert_eq!(net.state.channels.get("#z").unwrap().user_count(), 0);
        net.clear();

        net.line(10, "JOIN #z").await;
        let chan = net.state.channels.get("#z").unwrap();
        assert_eq!(chan.creationtime, 1001);
        assert!(chan.member(alice).unwrap().is_chanop());
        assert_eq!(net.lines(20), vec!["ABAAA J #z 1001", "AB M #z +o ABAAA 1001"]);
    }

    #[tokio::test]
    async fn test_join_zero_parts_everything() {
        let mut net = Net::new().await;
        let alice = net.user("alice", 10);
        net.server("leaf.example.net", "AC", 20);
        net.line(10, "JOIN #a,#b").await;
        net.clear();

        net.line(10, "JOIN 0").await;
        assert_eq!(net.state.channels.channel_count(alice), 0);
        assert_eq!(net.lines(20), vec!["ABAAA J 0"]);
        assert!(net
            .lines(10)
            .contains(&":alice!a@h PART #a :Left all channels".to_string()));
    }

    #[tokio::test]
    async fn test_remote_create_and_late_create_bounced() {
        let mut net = Net::new().await;
        let leaf = net.server("leaf.example.net", "AC", 20);
        let rem = net.remote_user(leaf, "ACAAA", "rem");
        let late = net.remote_user(leaf, "ACAAB", "late");

        net.line(20, "ACAAA C #r 900").await;
        let chan = net.state.channels.get("#r").unwrap();
        assert_eq!(chan.creationtime, 900);
        assert!(chan.member(rem).unwrap().is_chanop());
        net.clear();

        // Newer TS on a populated channel: joined without ops, op bounced
        net.line(20, "ACAAB C #r 950").await;
        let member = net.state.channels.find_member_link("#r", late).unwrap();
        assert!(!member.is_chanop());
        assert_eq!(net.state.channels.get("#r").unwrap().creationtime, 900);
        assert_eq!(net.lines(20), vec!["AB M #r -o ACAAB 900"]);

        // Creating a channel twice is fatal for the link
        assert!(matches!(
            net.try_line(20, "ACAAA C #r 900").await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_join_with_older_ts_wipes_modes() {
        let mut net = Net::new().await;
        let alice = net.user("alice", 10);
        let leaf = net.server("leaf.example.net", "AC", 20);
        let rem = net.remote_user(leaf, "ACAAA", "rem");
        net.line(10, "JOIN #w").await;
        net.line(10, "MODE #w +mk key").await;
        net.clear();

        net.line(20, "ACAAA J #w 500").await;
        let chan = net.state.channels.get("#w").unwrap();
        assert_eq!(chan.creationtime, 500);
        assert!(chan.mode.key.is_empty());
        assert!(!chan.mode.mode.contains(ChannelModes::MODERATED));
        assert!(!chan.member(alice).unwrap().is_chanop());
        assert!(chan.member(rem).is_some());
        assert_eq!(
            net.lines(10),
            vec![":rem!r@h MODE #w -mko key alice", ":rem!r@h JOIN #w"]
        );
    }

    #[tokio::test]
    async fn test_kick_makes_remote_zombie() {
        let mut net = Net::new().await;
        let alice = net.user("alice", 10);
        let leaf = net.server("leaf.example.net", "AC", 20);
        let rem = net.remote_user(leaf, "ACAAA", "rem");
        net.line(10, "JOIN #k").await;
        net.line(20, "ACAAA J #k 1000").await;
        net.clear();

        net.line(10, "KICK #k rem :get out").await;
        assert_eq!(net.lines(20), vec!["ABAAA K #k ACAAA :get out"]);
        assert_eq!(net.lines(10), vec![":alice!a@h KICK #k rem :get out"]);
        assert!(net.state.channels.find_member_link("#k", rem).unwrap().is_zombie());
        assert!(net.state.channels.find_member_link("#k", alice).is_some());

        // The remote PART completes the removal
        net.line(20, "ACAAA L #k").await;
        assert!(net.state.channels.find_member_link("#k", rem).is_none());
    }

    #[tokio::test]
    async fn test_kick_needs_ops_and_lower_oplevel() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        net.user("bob", 11);
        net.line(10, "JOIN #o").await;
        net.line(11, "JOIN #o").await;
        net.clear();

        net.line(11, "KICK #o alice").await;
        assert_eq!(
            net.lines(11),
            vec![":irc.example.net 482 bob #o :You're not channel operator"]
        );
        net.clear();

        // Both at the default level: nobody outranks anybody else
        net.line(10, "MODE #o +o bob").await;
        net.clear();
        net.line(10, "KICK #o bob").await;
        assert!(net.lines(10).iter().any(|l| l == ":alice!a@h KICK #o bob alice"));
    }

    #[tokio::test]
    async fn test_topic_set_and_relay() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        net.user("bob", 11);
        net.server("leaf.example.net", "AC", 20);
        net.line(10, "JOIN #t").await;
        net.line(11, "JOIN #t").await;
        net.line(10, "MODE #t +t").await;
        net.clear();

        net.line(11, "TOPIC #t :nope").await;
        assert!(net.lines(11)[0].contains(" 482 bob #t "));
        net.line(10, "TOPIC #t :hello world").await;
        assert_eq!(net.lines(20), vec!["ABAAA T #t 1000 1000 :hello world"]);
        assert!(net.lines(11).contains(&":alice!a@h TOPIC #t :hello world".to_string()));
        net.clear();

        // An older topic from a server loses to ours
        net.line(20, "AC T #t 1000 900 :old").await;
        assert_eq!(net.state.channels.get("#t").unwrap().topic.text, "hello world");
        net.line(20, "AC T #t 1000 1100 :newer").await;
        assert_eq!(net.state.channels.get("#t").unwrap().topic.text, "newer");
        assert_eq!(net.lines(11), vec![":*.example.net TOPIC #t newer"]);
    }

    #[tokio::test]
    async fn test_names_hides_delayed_and_secret() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        net.user("bob", 11);
        net.user("carol", 12);
        net.line(10, "JOIN #d").await;
        net.line(10, "MODE #d +Ds").await;
        net.line(11, "JOIN #d").await;
        net.clear();

        net.line(10, "NAMES #d").await;
        assert_eq!(
            net.lines(10),
            vec![
                ":irc.example.net 353 alice @ #d @alice",
                ":irc.example.net 366 alice #d :End of /NAMES list."
            ]
        );
        net.line(12, "NAMES #d").await;
        assert_eq!(net.lines(12), vec![":irc.example.net 366 carol #d :End of /NAMES list."]);
    }
}
