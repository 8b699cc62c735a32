//! Mode change accumulator
//!
//! A [`ModeBuf`] collects the mode changes of one command against one
//! channel and turns them into as few MODE lines as possible when flushed.
//! The destination bits decide who sees the result: channel members,
//! other servers, the originating server only (bounce), and operators (HACK
//! notices). A buffer can be flushed once.

use crate::channel::{simple_mode_letters, ChannelModes};
use crate::client::{ClientId, ConnId};
use crate::config::Capabilities;
use crate::membership::MAXOPLEVEL;
use crate::message::{Message, MessageType, Prefix};
use crate::state::State;
use crate::wire::{LineBudget, BUFSIZE};
use bitflags::bitflags;
use tracing::{error, info};

/// Most argument-bearing changes per MODE line
pub const MAXMODEPARAMS: usize = 6;

bitflags! {
    /// Where a flushed ModeBuf goes
    pub struct ModeBufDest: u32 {
        /// Local channel members
        const CHANNEL = 0x0001;
        /// Other servers
        const SERVER = 0x0002;
        /// Desync notice
        const HACK2 = 0x0004;
        /// Bounce or TS notice
        const HACK3 = 0x0008;
        /// Privileged override notice
        const HACK4 = 0x0010;
        /// Deop the source first
        const DEOP = 0x0020;
        /// Send the inverse back to the originating server only
        const BOUNCE = 0x0040;
        /// Relay as OPMODE
        const OPMODE = 0x0080;
        /// Audit log line
        const LOG = 0x0100;
        /// Hide the key from members
        const NOKEY = 0x0200;
        /// Attribute to a service bot
        const BOTMODE = 0x0400;
    }
}

/// Argument of a mode change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeValue {
    /// o, v or q on a member
    Client { id: ClientId, oplevel: u16 },
    /// Key, password or ban mask
    Text(String),
    /// User limit
    Limit(u32),
}

/// One argument-bearing change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeArg {
    pub add: bool,
    pub letter: char,
    pub value: ModeValue,
}

#[derive(Debug, Clone)]
struct WireItem {
    plus: bool,
    letter: char,
    client_arg: Option<String>,
    server_arg: Option<String>,
}

/// Accumulated mode changes for one channel
#[derive(Debug)]
pub struct ModeBuf {
    source: ClientId,
    connect: Option<ConnId>,
    channel: String,
    dest: ModeBufDest,
    add: ChannelModes,
    rem: ChannelModes,
    args: Vec<ModeArg>,
    botname: Option<String>,
    flushed: bool,
}

impl ModeBuf {
    /// `connect` is the link the change arrived on, if any
    pub fn new(source: ClientId, connect: Option<ConnId>, channel: &str, dest: ModeBufDest) -> Self {
        Self {
            source,
            connect,
            channel: channel.to_string(),
            dest,
            add: ChannelModes::empty(),
            rem: ChannelModes::empty(),
            args: Vec::new(),
            botname: None,
            flushed: false,
        }
    }

    /// Name shown as the source of BOTMODE changes
    pub fn set_botname(&mut self, name: &str) {
        self.botname = Some(name.to_string());
    }

    pub fn source(&self) -> ClientId {
        self.source
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn dest(&self) -> ModeBufDest {
        self.dest
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Nothing recorded yet
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.rem.is_empty() && self.args.is_empty()
    }

    /// Pending simple mode changes as (added, removed)
    pub fn simple_changes(&self) -> (ChannelModes, ChannelModes) {
        (self.add, self.rem)
    }

    pub fn args(&self) -> &[ModeArg] {
        &self.args
    }

    /// Record flag-only modes
    pub fn mode(&mut self, add: bool, modes: ChannelModes) {
        let modes = modes & !(ChannelModes::KEY | ChannelModes::LIMIT | ChannelModes::APASS | ChannelModes::UPASS);
        if modes.is_empty() {
            return;
        }
        if add {
            self.rem.remove(modes);
            self.add.insert(modes);
        } else {
            self.add.remove(modes);
            self.rem.insert(modes);
        }
    }

    /// Record a limit change
    pub fn mode_uint(&mut self, add: bool, limit: u32) {
        self.args.push(ModeArg {
            add,
            letter: 'l',
            value: ModeValue::Limit(limit),
        });
    }

    /// Record a key, password or ban change
    pub fn mode_string(&mut self, add: bool, letter: char, text: &str) {
        self.args.push(ModeArg {
            add,
            letter,
            value: ModeValue::Text(text.to_string()),
        });
    }

    /// Record an o/v/q change on a member
    pub fn mode_client(&mut self, add: bool, letter: char, id: ClientId, oplevel: u16) {
        self.args.push(ModeArg {
            add,
            letter,
            value: ModeValue::Client { id, oplevel },
        });
    }

    fn render_arg(&self, state: &State, arg: &ModeArg, plus: bool) -> Option<(Option<String>, Option<String>)> {
        let pair = match &arg.value {
            ModeValue::Client { id, oplevel } => {
                let client = state.clients.get(*id)?;
                let mut numeric = client.numeric.clone();
                if arg.letter == 'o' && plus && *oplevel < MAXOPLEVEL && state.has_cap(Capabilities::OPLEVELS) {
                    numeric.push_str(&format!(":{}", oplevel));
                }
                (Some(client.name.clone()), Some(numeric))
            }
            ModeValue::Limit(limit) => {
                if plus {
                    (Some(limit.to_string()), Some(limit.to_string()))
                } else {
                    (None, None)
                }
            }
            ModeValue::Text(text) => {
                let shown = match arg.letter {
                    'k' if self.dest.contains(ModeBufDest::NOKEY) => "*".to_string(),
                    'A' | 'U' => "*".to_string(),
                    _ => text.clone(),
                };
                (Some(shown), Some(text.clone()))
            }
        };
        Some(pair)
    }

    fn wire_items(&self, state: &State) -> (Vec<WireItem>, Vec<WireItem>) {
        let bounce = self.dest.contains(ModeBufDest::BOUNCE);
        let mut flags = Vec::new();
        for (modes, plus) in [(self.rem, false), (self.add, true)] {
            for letter in simple_mode_letters(modes).chars() {
                flags.push(WireItem {
                    plus: plus != bounce,
                    letter,
                    client_arg: None,
                    server_arg: None,
                });
            }
        }

        let mut args = Vec::new();
        if self.dest.contains(ModeBufDest::DEOP) && state.clients.get(self.source).map_or(false, |c| c.is_user()) {
            let source = ModeArg {
                add: false,
                letter: 'o',
                value: ModeValue::Client {
                    id: self.source,
                    oplevel: MAXOPLEVEL,
                },
            };
            if let Some((client_arg, server_arg)) = self.render_arg(state, &source, false) {
                args.push(WireItem {
                    plus: false,
                    letter: 'o',
                    client_arg,
                    server_arg,
                });
            }
        }
        for arg in &self.args {
            let plus = arg.add != bounce;
            if let Some((client_arg, server_arg)) = self.render_arg(state, arg, plus) {
                args.push(WireItem {
                    plus,
                    letter: arg.letter,
                    client_arg,
                    server_arg,
                });
            }
        }
        (flags, args)
    }

    /// Split into per-line chunks: flags ride on the first line only
    fn chunk(flags: Vec<WireItem>, args: Vec<WireItem>) -> Vec<Vec<WireItem>> {
        let mut lines = Vec::new();
        let mut current = flags;
        let mut count = 0;
        let mut budget = LineBudget::new(BUFSIZE - 200, 0);

        for item in args {
            let cost = item.server_arg.as_ref().map_or(0, |a| a.len() + 1);
            let has_param = item.server_arg.is_some() || item.client_arg.is_some();
            if has_param && (count >= MAXMODEPARAMS || !budget.fits(cost)) && !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                count = 0;
                budget.reset(0);
            }
            if has_param {
                count += 1;
                budget.take(cost);
            }
            current.push(item);
        }
        if !current.is_empty() {
            lines.push(current);
        }
        lines
    }

    fn render(items: &[WireItem], server: bool) -> Vec<String> {
        let mut modestr = String::new();
        let mut params = Vec::new();
        for plus in [false, true] {
            let group: Vec<&WireItem> = items.iter().filter(|i| i.plus == plus).collect();
            if group.is_empty() {
                continue;
            }
            modestr.push(if plus { '+' } else { '-' });
            for item in &group {
                modestr.push(item.letter);
            }
            for item in group {
                let arg = if server { &item.server_arg } else { &item.client_arg };
                if let Some(arg) = arg {
                    params.push(arg.clone());
                }
            }
        }
        let mut out = vec![modestr];
        out.extend(params);
        out
    }

    fn client_source(&self, state: &State) -> Prefix {
        if self.dest.contains(ModeBufDest::BOTMODE) {
            if let Some(bot) = &self.botname {
                return Prefix::Server(bot.clone());
            }
        }
        let source_is_server = state.clients.get(self.source).map_or(true, |c| c.is_server());
        if state.config.features.his_modewho && (self.dest.contains(ModeBufDest::OPMODE) || source_is_server) {
            return Prefix::Server(state.config.server.his_servername.clone());
        }
        state.prefix_of(self.source)
    }

    /// Apply simple modes, then send everything. Returns whether anything
    /// was sent. A second flush does nothing.
    pub fn flush(&mut self, state: &mut State) -> bool {
        if self.flushed {
            error!("ModeBuf for {} flushed twice", self.channel);
            return false;
        }
        self.flushed = true;

        let bounce = self.dest.contains(ModeBufDest::BOUNCE);
        let (ts, local_channel) = match state.channels.get(&self.channel) {
            Some(chan) => (chan.creationtime, chan.is_local()),
            None => return false,
        };

        if !bounce {
            let mut add_wasdel = false;
            if let Some(chan) = state.channels.get_mut(&self.channel) {
                chan.mode.mode.remove(self.rem);
                chan.mode.mode.insert(self.add);
                if self.add.contains(ChannelModes::DELJOINS) {
                    chan.mode.mode.remove(ChannelModes::WASDELJOINS);
                }
                if self.rem.contains(ChannelModes::DELJOINS) && chan.has_delayed_members() {
                    chan.mode.mode.insert(ChannelModes::WASDELJOINS);
                    add_wasdel = true;
                }
            }
            if add_wasdel {
                self.add.insert(ChannelModes::WASDELJOINS);
            }
        }

        let (flags, args) = self.wire_items(state);
        if flags.is_empty() && args.is_empty() {
            return false;
        }
        let chunks = Self::chunk(flags, args);

        let source_name = state.clients.name(self.source).to_string();
        let client_prefix = self.client_source(state);

        for chunk in &chunks {
            let client_params = Self::render(chunk, false);

            if self.dest.intersects(ModeBufDest::HACK2 | ModeBufDest::HACK3 | ModeBufDest::HACK4) {
                let kind = if self.dest.contains(ModeBufDest::HACK4) {
                    "HACK(4): "
                } else if self.dest.contains(ModeBufDest::HACK3) {
                    "BOUNCE or HACK(3): "
                } else {
                    "HACK(2): "
                };
                state.sendto_opmask(&format!(
                    "{}{} MODE {} {} [{}]",
                    kind,
                    source_name,
                    self.channel,
                    client_params.join(" "),
                    ts
                ));
            }

            if self.dest.contains(ModeBufDest::LOG) {
                info!(
                    target: "opermode",
                    "{} OPMODE {} {}",
                    source_name,
                    self.channel,
                    client_params.join(" ")
                );
            }

            if self.dest.contains(ModeBufDest::CHANNEL) && !bounce {
                let mut params = vec![self.channel.clone()];
                params.extend(client_params.iter().cloned());
                let line = Message::with_prefix(client_prefix.clone(), MessageType::Mode, params);
                state.send_to_channel(&self.channel, &line, None);
            }

            if local_channel || !self.dest.intersects(ModeBufDest::SERVER | ModeBufDest::BOUNCE) {
                continue;
            }

            let server_params = Self::render(chunk, true);
            if bounce {
                let Some(conn) = self.connect else {
                    continue;
                };
                let mut params = vec![self.channel.clone()];
                params.extend(server_params);
                params.push(ts.to_string());
                let line = state.server_message(state.me(), MessageType::Mode, params);
                state.send_to_link(conn, &line);
            } else if self.dest.contains(ModeBufDest::OPMODE) {
                let mut params = vec![self.channel.clone()];
                params.extend(server_params);
                let line = state.server_message(self.source, MessageType::OpMode, params);
                state.send_to_servers(&line, self.connect);
            } else if self.dest.contains(ModeBufDest::BOTMODE) {
                let mut params = vec![self.botname.clone().unwrap_or_default(), self.channel.clone()];
                params.extend(server_params);
                params.push(ts.to_string());
                let line = state.server_message(self.source, MessageType::BMode, params);
                state.send_to_servers(&line, self.connect);
            } else {
                let mut params = vec![self.channel.clone()];
                params.extend(server_params);
                params.push(ts.to_string());
                let line = state.server_message(self.source, MessageType::Mode, params);
                state.send_to_servers(&line, self.connect);
            }
        }
        true
    }
}
