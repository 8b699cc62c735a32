//! JOIN/CREATE/PART accumulator
//!
//! Membership changes collected here take effect when the buffer is
//! flushed, together with their channel notifications and the batched
//! server lines.

use crate::client::{ClientId, ConnId};
use crate::membership::{MemberFlags, MAXOPLEVEL};
use crate::message::{MessageType, Prefix};
use crate::state::State;
use crate::wire::{LineBudget, BUFSIZE};
use tracing::debug;

/// Most channels carried by one buffered line
pub const MAXJOINARGS: usize = 15;
/// Header allowance for JOIN and PART lines
pub const STARTJOINLEN: usize = 10;
/// Header allowance for CREATE lines
pub const STARTCREATELEN: usize = 20;

/// Kind of membership change being batched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Join,
    Create,
    Part,
    /// `JOIN 0`
    PartAll,
}

#[derive(Debug, Clone)]
struct Entry {
    channel: String,
    flags: MemberFlags,
}

/// Batched membership changes for one user
#[derive(Debug)]
pub struct JoinBuf {
    source: ClientId,
    connect: Option<ConnId>,
    kind: JoinType,
    comment: Option<String>,
    create: i64,
    entries: Vec<Entry>,
    budget: LineBudget,
    join_zero: bool,
}

impl JoinBuf {
    /// `create` is the TS for CREATE lines; `connect` the link the change
    /// came from.
    pub fn new(source: ClientId, connect: Option<ConnId>, kind: JoinType, comment: Option<&str>, create: i64) -> Self {
        let start = match kind {
            JoinType::Create => STARTCREATELEN,
            _ => STARTJOINLEN,
        } + comment.map_or(0, |c| c.len() + 2);
        Self {
            source,
            connect,
            kind,
            comment: comment.map(str::to_string),
            create,
            entries: Vec::new(),
            budget: LineBudget::new(BUFSIZE, start),
            join_zero: false,
        }
    }

    pub fn kind(&self) -> JoinType {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.join_zero
    }

    /// Already queued in this buffer?
    pub fn contains(&self, channel: &str) -> bool {
        self.entries.iter().any(|e| crate::matching::irc_eq(&e.channel, channel))
    }

    /// Announce `JOIN 0` to the other servers
    pub fn join_zero(&mut self) {
        self.join_zero = true;
    }

    /// Queue a channel. `flags` are the new member's status for joins, or
    /// the leaving member's status for parts.
    pub fn join(&mut self, state: &mut State, channel: &str, flags: MemberFlags) {
        let len = channel.len() + 1;
        if !self.budget.take(len) {
            self.flush(state);
            self.budget.take(len);
        }
        self.entries.push(Entry {
            channel: channel.to_string(),
            flags,
        });
        if self.entries.len() >= MAXJOINARGS {
            self.flush(state);
        }
    }

    fn apply_join(&self, state: &mut State, entry: &Entry) {
        let Some(chan) = state.channels.get(&entry.channel) else {
            return;
        };
        let oplevel = if !chan.has_apass() {
            MAXOPLEVEL
        } else if entry.flags.contains(MemberFlags::CHANNEL_MANAGER) {
            0
        } else {
            1
        };
        let has_apass = chan.has_apass();
        let delayed = chan.mode.mode.contains(crate::channel::ChannelModes::DELJOINS)
            && !entry.flags.intersects(MemberFlags::CHANOP | MemberFlags::VOICE);
        let name = chan.name.clone();

        let mut flags = entry.flags;
        if delayed {
            flags.insert(MemberFlags::DELAYED);
        }
        if !state.channels.add_user_to_channel(&name, self.source, flags, oplevel) {
            debug!("{} already on {}", state.clients.name(self.source), name);
            return;
        }

        let local = state.clients.is_local_user(self.source);
        let join = state.client_message(self.source, MessageType::Join, vec![name.clone()]);
        if !delayed {
            state.send_to_channel(&name, &join, None);
            if flags.contains(MemberFlags::CHANOP) && (oplevel < MAXOPLEVEL || !local) {
                let nick = state.clients.name(self.source).to_string();
                let prefix = if has_apass {
                    Prefix::Server(state.config.server.his_servername.clone())
                } else {
                    state.prefix_of(self.source)
                };
                let mode = crate::Message::with_prefix(prefix, MessageType::Mode, vec![name.clone(), "+o".into(), nick]);
                state.send_to_channel(&name, &mode, None);
            }
        } else if local {
            state.send_to_client(self.source, &join);
        }
    }

    fn apply_part(&self, state: &mut State, entry: &Entry) {
        let Some(member) = state.channels.find_member_link_mut(&entry.channel, self.source) else {
            return;
        };
        if member.status.contains(MemberFlags::USER_PARTING) {
            return;
        }
        member.status.insert(MemberFlags::USER_PARTING);
        let name = state
            .channels
            .get(&entry.channel)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| entry.channel.clone());

        let mut params = vec![name.clone()];
        if let Some(comment) = &self.comment {
            if !entry.flags.contains(MemberFlags::BANNED) {
                params.push(comment.clone());
            }
        }
        let part = state.client_message(self.source, MessageType::Part, params);
        if !entry.flags.intersects(MemberFlags::ZOMBIE | MemberFlags::DELAYED) {
            state.send_to_channel(&name, &part, None);
        } else {
            state.send_to_client(self.source, &part);
        }
        state.remove_user_from_channel(&name, self.source);
    }

    /// Apply and announce everything queued
    pub fn flush(&mut self, state: &mut State) {
        let entries = std::mem::take(&mut self.entries);
        self.budget.reset(match self.kind {
            JoinType::Create => STARTCREATELEN,
            _ => STARTJOINLEN,
        } + self.comment.as_ref().map_or(0, |c| c.len() + 2));

        if self.join_zero {
            self.join_zero = false;
            let zero = state.server_message(self.source, MessageType::Join, vec!["0".to_string()]);
            state.send_to_servers(&zero, self.connect);
        }

        let mut batched = Vec::new();
        for entry in &entries {
            let is_local = entry.channel.starts_with('&');
            match self.kind {
                JoinType::Join | JoinType::Create => {
                    self.apply_join(state, entry);
                    if self.kind == JoinType::Join && !is_local {
                        let ts = state.channels.get(&entry.channel).map_or(self.create, |c| c.creationtime);
                        let join = state.server_message(
                            self.source,
                            MessageType::Join,
                            vec![entry.channel.clone(), ts.to_string()],
                        );
                        state.send_to_servers(&join, self.connect);
                    } else if !is_local {
                        batched.push(entry.channel.clone());
                    }
                }
                JoinType::Part | JoinType::PartAll => {
                    self.apply_part(state, entry);
                    if self.kind == JoinType::Part && !is_local {
                        batched.push(entry.channel.clone());
                    }
                }
            }
        }

        if batched.is_empty() {
            return;
        }
        let list = batched.join(",");
        let line = match self.kind {
            JoinType::Create => {
                state.server_message(self.source, MessageType::Create, vec![list, self.create.to_string()])
            }
            _ => {
                let mut params = vec![list];
                if let Some(comment) = &self.comment {
                    params.push(comment.clone());
                }
                state.server_message(self.source, MessageType::Part, params)
            }
        };
        state.send_to_servers(&line, self.connect);
    }
}
