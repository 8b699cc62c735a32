//! Messaging module
//!
//! PRIVMSG and NOTICE to channels and users, with the channel send
//! restrictions (`+n`, `+m`, bans, `+c`, `+C`, `+N`, `+M`, `+r`).

use async_trait::async_trait;
use tsircd_core::ban::find_ban;
use tsircd_core::{
    ChannelModes, ClientId, ConnId, Context, Message, MessageType, Module, ModuleResult, NumericReply, Result,
    State,
};

/// Can `user` speak on `channel`? Non-members are held to the outside
/// rules, members to the moderation and ban rules.
pub(crate) fn member_can_send(state: &mut State, channel: &str, user: ClientId) -> bool {
    let Some(client) = state.clients.get(user) else {
        return false;
    };
    let Some(chan) = state.channels.get_mut(channel) else {
        return false;
    };
    let modes = chan.mode.mode;
    let no_account = client.account.is_none();

    let privileged = match chan.active_member(user) {
        Some(member) => member.is_chanop() || member.has_voice(),
        None => {
            if client.is_channel_service() {
                return true;
            }
            if modes.intersects(ChannelModes::NOPRIVMSGS | ChannelModes::MODERATED) {
                return false;
            }
            if no_account && modes.intersects(ChannelModes::REGONLY | ChannelModes::MODERATENOREG) {
                return false;
            }
            return find_ban(client, &chan.bans).is_none();
        }
    };
    if privileged {
        return true;
    }
    if modes.contains(ChannelModes::MODERATED) {
        return false;
    }
    if no_account && modes.intersects(ChannelModes::REGONLY | ChannelModes::MODERATENOREG) {
        return false;
    }
    !chan.is_banned(client)
}

/// Content rules that apply on top of [`member_can_send`]
fn content_allowed(modes: ChannelModes, text: &str, notice: bool) -> bool {
    if modes.contains(ChannelModes::NOCOLOUR) && text.contains('\x03') {
        return false;
    }
    if modes.contains(ChannelModes::NOCTCP) && text.starts_with('\x01') && !text.starts_with("\x01ACTION ") {
        return false;
    }
    !(notice && modes.contains(ChannelModes::NONOTICE))
}

/// PRIVMSG and NOTICE
pub struct MessagingModule {
    name: String,
    version: String,
    description: String,
}

impl MessagingModule {
    pub fn new() -> Self {
        Self {
            name: "messaging".to_string(),
            version: "1.0.0".to_string(),
            description: "PRIVMSG and NOTICE delivery".to_string(),
        }
    }

    fn handle_privmsg(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let notice = message.command == MessageType::Notice;
        let command = message.command.clone();
        let Some(targets) = message.param(0).filter(|t| !t.is_empty()) else {
            if !notice {
                ctx.reply(NumericReply::no_recipient(command.name()));
            }
            return Ok(());
        };
        let Some(text) = message.param(1).filter(|t| !t.is_empty()) else {
            if !notice {
                ctx.reply(NumericReply::no_text_to_send());
            }
            return Ok(());
        };

        let source = ctx.source;
        for target in targets.split(',') {
            let outcome = if target.starts_with('#') || target.starts_with('&') {
                self.to_channel(ctx.state, source, target, &command, text, None, true)
            } else {
                self.to_user(ctx.state, source, target, &command, text, None)
            };
            if let Err(reply) = outcome {
                if !notice {
                    ctx.reply(reply);
                }
            }
        }
        Ok(())
    }

    fn handle_server_privmsg(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(target), Some(text)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        let (source, conn) = (ctx.source, ctx.conn);
        let command = message.command.clone();
        let _ = if target.starts_with('#') || target.starts_with('&') {
            self.to_channel(ctx.state, source, target, &command, text, Some(conn), false)
        } else {
            self.to_user(ctx.state, source, target, &command, text, Some(conn))
        };
        Ok(())
    }

    /// Deliver to a channel's local members and to every link with members
    /// behind it
    #[allow(clippy::too_many_arguments)]
    fn to_channel(
        &self,
        state: &mut State,
        source: ClientId,
        channel: &str,
        command: &MessageType,
        text: &str,
        from: Option<ConnId>,
        check: bool,
    ) -> std::result::Result<(), Message> {
        let Some(chan) = state.channels.get(channel) else {
            return Err(NumericReply::no_such_channel(channel));
        };
        let name = chan.name.clone();
        let modes = chan.mode.mode;
        let delayed = chan.active_member(source).map_or(false, |m| m.is_delayed());

        if check
            && (!member_can_send(state, &name, source)
                || !content_allowed(modes, text, *command == MessageType::Notice))
        {
            return Err(NumericReply::cannot_send_to_chan(&name));
        }
        if delayed {
            state.reveal_delayed(&name, source);
        }

        let local = state.client_message(source, command.clone(), vec![name.clone(), text.to_string()]);
        state.send_to_channel(&name, &local, Some(source));

        let source_link = state.clients.get(source).and_then(|c| c.link).filter(|_| !state.clients.is_local_user(source));
        let mut links: Vec<ConnId> = match state.channels.get(&name) {
            Some(chan) => chan
                .active_members()
                .filter_map(|m| state.clients.get(m.user))
                .filter(|c| !c.is_local())
                .filter_map(|c| c.link)
                .filter(|l| Some(*l) != from && Some(*l) != source_link)
                .collect(),
            None => Vec::new(),
        };
        links.sort_unstable();
        links.dedup();
        if !links.is_empty() {
            let relay = state.server_message(source, command.clone(), vec![name, text.to_string()]);
            for link in links {
                state.send_to_link(link, &relay);
            }
        }
        Ok(())
    }

    /// Deliver to one user, locally or towards their server
    fn to_user(
        &self,
        state: &mut State,
        source: ClientId,
        target: &str,
        command: &MessageType,
        text: &str,
        from: Option<ConnId>,
    ) -> std::result::Result<(), Message> {
        let who = if from.is_some() {
            state.clients.find_by_numeric(target).or_else(|| state.clients.find_user(target))
        } else {
            state.clients.find_user(target)
        };
        let Some(who) = who.filter(|id| !state.clients.is_server(*id)) else {
            return Err(NumericReply::no_such_nick(target));
        };

        if state.clients.is_local_user(who) {
            let nick = state.clients.name(who).to_string();
            let msg = state.client_message(source, command.clone(), vec![nick, text.to_string()]);
            state.send_to_client(who, &msg);
        } else if let Some(link) = state.clients.get(who).and_then(|c| c.link).filter(|l| Some(*l) != from) {
            let numeric = state.clients.numeric(who).to_string();
            let msg = state.server_message(source, command.clone(), vec![numeric, text.to_string()]);
            state.send_to_link(link, &msg);
        }
        Ok(())
    }
}

impl Default for MessagingModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for MessagingModule {
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
        vec![MessageType::PrivMsg, MessageType::Notice]
    }

    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        self.handle_privmsg(ctx, message)?;
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        self.handle_server_privmsg(ctx, message)?;
        Ok(ModuleResult::Handled)
    }
}
