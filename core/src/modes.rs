//! Channel mode parser
//!
//! [`mode_parse`] walks a mode string and its arguments for one channel,
//! checks each change against the actor's rights, applies it when asked to
//! and records what changed in a [`ModeBuf`]. Each letter is accepted or
//! rejected on its own; unknown letters are skipped.

use crate::ban::{apply_ban, Ban, BanFlags};
use crate::channel::ChannelModes;
use crate::client::ClientId;
use crate::config::Capabilities;
use crate::matching::{collapse, irc_eq, pretty_mask};
use crate::membership::{MemberFlags, MAXOPLEVEL};
use crate::modebuf::{ModeBuf, MAXMODEPARAMS};
use crate::numeric::NumericReply;
use crate::state::State;
use bitflags::bitflags;
use tracing::debug;

bitflags! {
    /// How `mode_parse` treats the change
    pub struct ParseFlags: u32 {
        /// Apply the changes
        const SET = 0x0001;
        /// Only one mode string
        const STRICT = 0x0002;
        /// Skip permission checks
        const FORCE = 0x0004;
        /// Record the changes for a bounce
        const BOUNCE = 0x0008;
        /// Actor is not a channel operator
        const NOTOPER = 0x0010;
        /// Actor is not on the channel
        const NOTMEMBER = 0x0020;
        /// Replace the current modes (older BURST)
        const WIPEOUT = 0x0040;
        /// Arguments come from a BURST
        const BURST = 0x0080;
    }
}

bitflags! {
    struct Done: u32 {
        const LIMIT = 0x0001;
        const KEY = 0x0002;
        const BANLIST = 0x0004;
        const NOTOPER = 0x0008;
        const BANCLEAN = 0x0010;
        const APASS = 0x0020;
        const UPASS = 0x0040;
    }
}

/// What a mode letter does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Simple(ChannelModes),
    Limit,
    Key,
    Apass,
    Upass,
    Ban,
    /// o, v or q
    Member(MemberFlags),
}

struct ModeLetter {
    letter: char,
    kind: ModeKind,
    requires: Capabilities,
}

const MODE_TABLE: &[ModeLetter] = &[
    ModeLetter { letter: 'o', kind: ModeKind::Member(MemberFlags::CHANOP), requires: Capabilities::empty() },
    ModeLetter { letter: 'v', kind: ModeKind::Member(MemberFlags::VOICE), requires: Capabilities::empty() },
    ModeLetter { letter: 'q', kind: ModeKind::Member(MemberFlags::OWNER), requires: Capabilities::OWNER },
    ModeLetter { letter: 'b', kind: ModeKind::Ban, requires: Capabilities::empty() },
    ModeLetter { letter: 'k', kind: ModeKind::Key, requires: Capabilities::empty() },
    ModeLetter { letter: 'l', kind: ModeKind::Limit, requires: Capabilities::empty() },
    ModeLetter { letter: 'A', kind: ModeKind::Apass, requires: Capabilities::OPLEVELS },
    ModeLetter { letter: 'U', kind: ModeKind::Upass, requires: Capabilities::OPLEVELS },
    ModeLetter { letter: 'p', kind: ModeKind::Simple(ChannelModes::PRIVATE), requires: Capabilities::empty() },
    ModeLetter { letter: 's', kind: ModeKind::Simple(ChannelModes::SECRET), requires: Capabilities::empty() },
    ModeLetter { letter: 'm', kind: ModeKind::Simple(ChannelModes::MODERATED), requires: Capabilities::empty() },
    ModeLetter { letter: 't', kind: ModeKind::Simple(ChannelModes::TOPICLIMIT), requires: Capabilities::empty() },
    ModeLetter { letter: 'i', kind: ModeKind::Simple(ChannelModes::INVITEONLY), requires: Capabilities::empty() },
    ModeLetter { letter: 'n', kind: ModeKind::Simple(ChannelModes::NOPRIVMSGS), requires: Capabilities::empty() },
    ModeLetter { letter: 'r', kind: ModeKind::Simple(ChannelModes::REGONLY), requires: Capabilities::empty() },
    ModeLetter { letter: 'R', kind: ModeKind::Simple(ChannelModes::REGISTERED), requires: Capabilities::empty() },
    ModeLetter { letter: 'D', kind: ModeKind::Simple(ChannelModes::DELJOINS), requires: Capabilities::DELAYED_JOIN },
    ModeLetter { letter: 'u', kind: ModeKind::Simple(ChannelModes::NOQUITPARTS), requires: Capabilities::EXTENDED_MODES },
    ModeLetter { letter: 'c', kind: ModeKind::Simple(ChannelModes::NOCOLOUR), requires: Capabilities::EXTENDED_MODES },
    ModeLetter { letter: 'C', kind: ModeKind::Simple(ChannelModes::NOCTCP), requires: Capabilities::EXTENDED_MODES },
    ModeLetter { letter: 'N', kind: ModeKind::Simple(ChannelModes::NONOTICE), requires: Capabilities::EXTENDED_MODES },
    ModeLetter { letter: 'M', kind: ModeKind::Simple(ChannelModes::MODERATENOREG), requires: Capabilities::EXTENDED_MODES },
    ModeLetter { letter: 'z', kind: ModeKind::Simple(ChannelModes::SSLONLY), requires: Capabilities::EXTENDED_MODES },
];

/// Resolve a mode letter under the active capabilities
pub fn lookup_mode(letter: char, caps: Capabilities) -> Option<ModeKind> {
    MODE_TABLE
        .iter()
        .find(|m| m.letter == letter && caps.contains(m.requires))
        .map(|m| m.kind)
}

/// Every channel mode letter available, for RPL_MYINFO
pub fn available_modes(caps: Capabilities) -> String {
    MODE_TABLE
        .iter()
        .filter(|m| caps.contains(m.requires))
        .map(|m| m.letter)
        .collect()
}

/// Simple modes a wipeout may clear
fn parse_settable(caps: Capabilities) -> ChannelModes {
    MODE_TABLE
        .iter()
        .filter(|m| caps.contains(m.requires))
        .filter_map(|m| match m.kind {
            ModeKind::Simple(flag) => Some(flag),
            _ => None,
        })
        .fold(ChannelModes::empty(), |acc, f| acc | f)
}

#[derive(Debug, Clone)]
struct CliChange {
    add: bool,
    flag: MemberFlags,
    letter: char,
    client: ClientId,
    oplevel: Option<u16>,
}

struct ParseState<'a> {
    mbuf: Option<&'a mut ModeBuf>,
    origin: ClientId,
    channel: String,
    args: &'a [String],
    used: usize,
    flags: ParseFlags,
    member: Option<ClientId>,
    add_dir: bool,
    add: ChannelModes,
    del: ChannelModes,
    done: Done,
    max_args: i32,
    local: bool,
    bans: Option<Vec<Ban>>,
    changes: Vec<CliChange>,
}

impl<'a> ParseState<'a> {
    fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.used)
    }

    fn next_arg(&mut self) -> Option<&'a str> {
        let arg = self.args.get(self.used)?;
        self.used += 1;
        self.max_args -= 1;
        Some(arg.as_str())
    }

    fn refused(&self) -> bool {
        self.flags.intersects(ParseFlags::NOTOPER | ParseFlags::NOTMEMBER)
    }

    fn reply(&self, state: &mut State, msg: crate::Message) {
        if self.local {
            state.send_numeric(self.origin, msg);
        }
    }

    fn need_more_params(&self, state: &mut State, what: &str) {
        self.reply(state, NumericReply::need_more_params(&format!("MODE {}{}", if self.add_dir { '+' } else { '-' }, what)));
    }

    /// One ERR_CHANOPRIVSNEEDED or ERR_NOTONCHANNEL per command
    fn send_notoper(&mut self, state: &mut State) {
        if self.done.contains(Done::NOTOPER) {
            return;
        }
        let reply = if self.flags.contains(ParseFlags::NOTOPER) {
            NumericReply::chan_op_privs_needed(&self.channel)
        } else {
            NumericReply::not_on_channel(&self.channel)
        };
        self.reply(state, reply);
        self.done.insert(Done::NOTOPER);
    }

    fn too_many_args(&self) -> bool {
        self.local && self.max_args <= 0
    }

    fn actor_oplevel(&self, state: &State) -> Option<u16> {
        let member = self.member?;
        state.channels.find_member_link(&self.channel, member).map(|m| m.oplevel)
    }
}

/// Parse and apply a channel mode change.
///
/// `args` starts with the mode string. `member` is the actor's membership
/// on the channel, if any. Returns how many arguments were consumed,
/// mode strings included.
pub fn mode_parse(
    state: &mut State,
    mbuf: Option<&mut ModeBuf>,
    origin: ClientId,
    channel: &str,
    args: &[String],
    flags: ParseFlags,
    member: Option<ClientId>,
) -> usize {
    let Some(chan) = state.channels.get(channel) else {
        return 0;
    };
    let channel = chan.name.clone();
    let creationtime = chan.creationtime;
    let local = state.clients.is_local_user(origin);
    let from_link = !local && origin != state.me();

    // Newer TS from a server still bursting: it will wipe its own modes
    if from_link && !flags.contains(ParseFlags::BURST) && args.len() > 1 {
        if let Some(ts) = args.last().and_then(|a| a.parse::<i64>().ok()) {
            let server = state.clients.server_of(origin);
            let bursting = server.and_then(|s| state.clients.get(s)).map_or(false, |s| s.is_burst_or_burst_ack());
            if ts > creationtime && bursting {
                debug!("Ignoring MODE for {} with newer TS {} from bursting server", channel, ts);
                return args.len();
            }
        }
    }

    let mut ps = ParseState {
        mbuf,
        origin,
        channel,
        args,
        used: 0,
        flags,
        member,
        add_dir: true,
        add: ChannelModes::empty(),
        del: ChannelModes::empty(),
        done: Done::empty(),
        max_args: MAXMODEPARAMS as i32,
        local,
        bans: None,
        changes: Vec::new(),
    };

    if let Some(first) = ps.args.first() {
        ps.used = 1;
        let mut modestr: &str = first.as_str();
        loop {
            for letter in modestr.chars() {
                match letter {
                    '+' => ps.add_dir = true,
                    '-' => ps.add_dir = false,
                    _ => match lookup_mode(letter, state.caps) {
                        None => ps.reply(state, NumericReply::unknown_mode(letter)),
                        Some(ModeKind::Simple(flag)) => parse_simple(state, &mut ps, flag),
                        Some(ModeKind::Limit) => parse_limit(state, &mut ps),
                        Some(ModeKind::Key) => parse_key(state, &mut ps),
                        Some(ModeKind::Apass) => parse_apass(state, &mut ps),
                        Some(ModeKind::Upass) => parse_upass(state, &mut ps),
                        Some(ModeKind::Ban) => parse_ban(state, &mut ps),
                        Some(ModeKind::Member(flag)) => parse_client(state, &mut ps, flag, letter),
                    },
                }
            }

            if ps.flags.contains(ParseFlags::BURST) || ps.remaining() == 0 {
                break;
            }
            let next = ps.args[ps.used].as_str();
            // Trailing TS from a server link
            if from_link && ps.remaining() == 1 && next.starts_with(|c: char| c.is_ascii_digit()) {
                ps.used += 1;
                break;
            }
            if ps.flags.contains(ParseFlags::STRICT) || ps.too_many_args() {
                break;
            }
            ps.used += 1;
            modestr = next;
        }
    }

    if ps.mbuf.is_none() || ps.refused() {
        return ps.used;
    }

    finish_simple(state, &mut ps);

    if ps.done.contains(Done::BANCLEAN) {
        process_bans(state, &mut ps);
    }
    if !ps.changes.is_empty() {
        process_clients(state, &mut ps);
    }
    ps.used
}

fn parse_simple(state: &mut State, ps: &mut ParseState<'_>, flag: ChannelModes) {
    if ps.refused() {
        ps.send_notoper(state);
        return;
    }
    if ps.mbuf.is_none() {
        return;
    }
    // Registration status belongs to services
    if flag == ChannelModes::REGISTERED && !ps.flags.contains(ParseFlags::FORCE) && ps.local {
        return;
    }

    if ps.add_dir {
        ps.add.insert(flag);
        ps.del.remove(flag);
        if flag == ChannelModes::SECRET {
            ps.add.remove(ChannelModes::PRIVATE);
            ps.del.insert(ChannelModes::PRIVATE);
        } else if flag == ChannelModes::PRIVATE {
            ps.add.remove(ChannelModes::SECRET);
            ps.del.insert(ChannelModes::SECRET);
        }
    } else {
        ps.add.remove(flag);
        ps.del.insert(flag);
    }
}

fn parse_limit(state: &mut State, ps: &mut ParseState<'_>) {
    let current = state.channels.get(&ps.channel).map_or(0, |c| c.mode.limit);
    let has_limit = state
        .channels
        .get(&ps.channel)
        .map_or(false, |c| c.mode.mode.contains(ChannelModes::LIMIT));
    let wipeout = ps.flags.contains(ParseFlags::WIPEOUT);

    let limit = if ps.add_dir {
        if ps.too_many_args() {
            return;
        }
        if ps.remaining() == 0 {
            ps.need_more_params(state, "l");
            return;
        }
        let raw = ps.next_arg().unwrap_or("0");
        let limit: u32 = match raw.parse::<i64>() {
            Ok(v) if v >= 0 => v.min(u32::MAX as i64) as u32,
            Ok(_) => return,
            Err(_) => 0,
        };
        if limit == 0 {
            return;
        }
        if limit == current && has_limit {
            if wipeout {
                ps.done.insert(Done::LIMIT);
            }
            return;
        }
        limit
    } else {
        current
    };

    if ps.refused() {
        ps.send_notoper(state);
        return;
    }
    if !ps.add_dir && !has_limit {
        return;
    }
    // Lowest limit wins in a merge
    if ps.flags.contains(ParseFlags::BURST) && !wipeout && has_limit && current < limit {
        return;
    }
    if ps.done.contains(Done::LIMIT) {
        return;
    }
    ps.done.insert(Done::LIMIT);

    let Some(mbuf) = ps.mbuf.as_deref_mut() else {
        return;
    };
    mbuf.mode_uint(ps.add_dir, limit);

    if ps.flags.contains(ParseFlags::SET) {
        if let Some(chan) = state.channels.get_mut(&ps.channel) {
            if ps.add_dir {
                chan.mode.mode.insert(ChannelModes::LIMIT);
                chan.mode.limit = limit;
            } else {
                chan.mode.mode.remove(ChannelModes::LIMIT);
                chan.mode.limit = 0;
            }
        }
    }
}

/// Trim a key or password at the first unusable character
fn clean_key(raw: &str, max: usize) -> String {
    raw.chars()
        .take_while(|c| *c > ' ' && *c != ':' && *c != ',')
        .take(max)
        .collect()
}

/// Which password-like mode is being handled
#[derive(Clone, Copy, PartialEq, Eq)]
enum Secret {
    Key,
    Apass,
    Upass,
}

impl Secret {
    fn letter(self) -> char {
        match self {
            Secret::Key => 'k',
            Secret::Apass => 'A',
            Secret::Upass => 'U',
        }
    }

    fn done(self) -> Done {
        match self {
            Secret::Key => Done::KEY,
            Secret::Apass => Done::APASS,
            Secret::Upass => Done::UPASS,
        }
    }

    fn flag(self) -> ChannelModes {
        match self {
            Secret::Key => ChannelModes::KEY,
            Secret::Apass => ChannelModes::APASS,
            Secret::Upass => ChannelModes::UPASS,
        }
    }

    fn current(self, mode: &crate::channel::ChannelMode) -> String {
        match self {
            Secret::Key => mode.key.clone(),
            Secret::Apass => mode.apass.clone(),
            Secret::Upass => mode.upass.clone(),
        }
    }

    fn store(self, mode: &mut crate::channel::ChannelMode, value: Option<&str>) {
        let slot = match self {
            Secret::Key => &mut mode.key,
            Secret::Apass => &mut mode.apass,
            Secret::Upass => &mut mode.upass,
        };
        match value {
            Some(v) => {
                *slot = v.to_string();
                mode.mode.insert(self.flag());
            }
            None => {
                slot.clear();
                mode.mode.remove(self.flag());
            }
        }
    }
}

/// Checks a local, unforced Apass/Upass change; true when allowed
fn manager_check(state: &mut State, ps: &ParseState<'_>, which: Secret, value: &str) -> bool {
    let Some(chan) = state.channels.get(&ps.channel) else {
        return false;
    };
    let apass = chan.mode.apass.clone();
    let upass = chan.mode.upass.clone();
    let age = state.now() - chan.creationtime;
    let is_manager = ps
        .member
        .and_then(|m| chan.member(m))
        .map_or(false, |m| m.is_manager() || m.oplevel == 0);
    let secured_after = state.config.channels.destruct_delay_long;

    let refusal = match which {
        Secret::Apass => {
            if ps.add_dir && apass.is_empty() {
                (age >= secured_after).then(|| NumericReply::chan_secured(&ps.channel))
            } else if !is_manager {
                Some(NumericReply::not_manager(&ps.channel))
            } else if !ps.add_dir && !upass.is_empty() {
                Some(NumericReply::upass_set(&ps.channel))
            } else if ps.add_dir || !irc_eq(&apass, value) {
                Some(NumericReply::key_set(&ps.channel))
            } else {
                None
            }
        }
        Secret::Upass => {
            if apass.is_empty() {
                Some(NumericReply::upass_not_set(&ps.channel))
            } else if !is_manager {
                Some(NumericReply::not_manager(&ps.channel))
            } else if (ps.add_dir && !upass.is_empty()) || (!ps.add_dir && !irc_eq(&upass, value)) {
                Some(NumericReply::key_set(&ps.channel))
            } else {
                None
            }
        }
        Secret::Key => None,
    };
    match refusal {
        Some(reply) => {
            ps.reply(state, reply);
            false
        }
        None => true,
    }
}

fn parse_secret(state: &mut State, ps: &mut ParseState<'_>, which: Secret) {
    if ps.too_many_args() {
        return;
    }
    if ps.remaining() == 0 {
        ps.need_more_params(state, &which.letter().to_string());
        return;
    }
    let raw = ps.next_arg().unwrap_or("");

    if ps.refused() {
        ps.send_notoper(state);
        return;
    }
    if ps.done.contains(which.done()) {
        return;
    }
    ps.done.insert(which.done());

    let value = clean_key(raw, state.config.channels.key_length);
    if value.is_empty() {
        ps.need_more_params(state, &which.letter().to_string());
        return;
    }
    if ps.mbuf.is_none() {
        return;
    }
    let current = match state.channels.get(&ps.channel) {
        Some(chan) => which.current(&chan.mode),
        None => return,
    };
    let force = ps.flags.contains(ParseFlags::FORCE);
    let wipeout = ps.flags.contains(ParseFlags::WIPEOUT);

    // Smaller value wins a merge
    if ps.flags.contains(ParseFlags::BURST) && !wipeout && !current.is_empty() && current.as_str() <= value.as_str() {
        return;
    }

    if !force {
        match which {
            Secret::Key => {
                if (ps.add_dir && !current.is_empty()) || (!ps.add_dir && !irc_eq(&current, &value)) {
                    ps.reply(state, NumericReply::key_set(&ps.channel));
                    return;
                }
            }
            Secret::Apass | Secret::Upass => {
                if ps.local && !manager_check(state, ps, which, &value) {
                    return;
                }
            }
        }
    }

    if ps.add_dir && current == value {
        return;
    }

    let letter = which.letter();
    let Some(mbuf) = ps.mbuf.as_deref_mut() else {
        return;
    };
    if ps.flags.contains(ParseFlags::BOUNCE) {
        if !current.is_empty() {
            mbuf.mode_string(false, letter, &current);
        } else {
            mbuf.mode_string(true, letter, &value);
        }
    } else {
        mbuf.mode_string(ps.add_dir, letter, &value);
    }

    if ps.flags.contains(ParseFlags::SET) {
        let becomes_manager = which == Secret::Apass && ps.add_dir && ps.local;
        if let Some(chan) = state.channels.get_mut(&ps.channel) {
            which.store(&mut chan.mode, if ps.add_dir { Some(&value) } else { None });
            if becomes_manager {
                if let Some(m) = ps.member.and_then(|id| chan.member_mut(id)) {
                    m.status.insert(MemberFlags::CHANNEL_MANAGER);
                    m.oplevel = 0;
                }
            }
        }
        if becomes_manager {
            let text = format!(
                "Channel Admin password (+A) set to '{}'. Remember it: it cannot be changed once the channel is more than 48 hours old.",
                value
            );
            state.send_notice(ps.origin, &text);
        }
    }
}

fn parse_key(state: &mut State, ps: &mut ParseState<'_>) {
    parse_secret(state, ps, Secret::Key);
}

fn parse_apass(state: &mut State, ps: &mut ParseState<'_>) {
    parse_secret(state, ps, Secret::Apass);
}

fn parse_upass(state: &mut State, ps: &mut ParseState<'_>) {
    parse_secret(state, ps, Secret::Upass);
}

fn parse_ban(state: &mut State, ps: &mut ParseState<'_>) {
    if ps.remaining() == 0 {
        if ps.local && !ps.done.contains(Done::BANLIST) {
            send_ban_list(state, ps.origin, &ps.channel);
            ps.done.insert(Done::BANLIST);
        }
        return;
    }
    if ps.too_many_args() {
        return;
    }
    let raw = ps.next_arg().unwrap_or("");

    if ps.refused() {
        ps.send_notoper(state);
        return;
    }
    let raw = raw.split(' ').next().unwrap_or("");
    if raw.is_empty() || raw.starts_with(':') {
        ps.need_more_params(state, "b");
        return;
    }

    if !ps.done.contains(Done::BANCLEAN) {
        let mut working = state.channels.get(&ps.channel).map(|c| c.bans.clone()).unwrap_or_default();
        for ban in &mut working {
            ban.flags.remove(BanFlags::ADD | BanFlags::DEL | BanFlags::OVERLAPPED);
        }
        ps.bans = Some(working);
        ps.done.insert(Done::BANCLEAN);
    }

    let who = match state.clients.get(ps.origin) {
        Some(c) if c.is_user() => c.name.clone(),
        _ => "*".to_string(),
    };
    let mut newban = Ban::new(collapse(&pretty_mask(raw)), who, state.now());
    newban.flags.insert(if ps.add_dir { BanFlags::ADD } else { BanFlags::DEL });
    if let Some(list) = ps.bans.as_mut() {
        apply_ban(list, newban);
    }
}

fn process_bans(state: &mut State, ps: &mut ParseState<'_>) {
    let Some(working) = ps.bans.take() else {
        return;
    };
    let max_bans = state.config.channels.max_bans;
    let max_len = state.config.channels.avg_ban_length * max_bans;
    let set = ps.flags.contains(ParseFlags::SET);
    let bounce = ps.flags.contains(ParseFlags::BOUNCE);

    let mut kept = Vec::with_capacity(working.len());
    let mut count = 0usize;
    let mut len = 0usize;
    let mut changed = false;
    let mut full = Vec::new();

    for mut ban in working {
        let is_add = ban.flags.contains(BanFlags::ADD);
        let is_del = ban.flags.contains(BanFlags::DEL);

        if is_add && is_del {
            // Added and superseded within the same command
            continue;
        }
        if is_del {
            if let Some(mbuf) = ps.mbuf.as_deref_mut() {
                mbuf.mode_string(false, 'b', &ban.mask);
            }
            if set {
                changed = true;
                continue;
            }
            ban.flags &= BanFlags::IPMASK;
            count += 1;
            len += ban.mask.len();
            kept.push(ban);
            continue;
        }
        if is_add {
            if ban.flags.contains(BanFlags::OVERLAPPED) && !bounce {
                continue;
            }
            if set && ps.local && (count + 1 > max_bans || len + ban.mask.len() > max_len) {
                full.push(ban.mask.clone());
                continue;
            }
            if let Some(mbuf) = ps.mbuf.as_deref_mut() {
                mbuf.mode_string(true, 'b', &ban.mask);
            }
            if set {
                ban.flags &= BanFlags::IPMASK;
                count += 1;
                len += ban.mask.len();
                kept.push(ban);
                changed = true;
            }
            continue;
        }
        count += 1;
        len += ban.mask.len();
        kept.push(ban);
    }

    for mask in full {
        ps.reply(state, NumericReply::ban_list_full(&ps.channel, &mask));
    }
    if set {
        if let Some(chan) = state.channels.get_mut(&ps.channel) {
            chan.bans = kept;
            if changed {
                chan.invalidate_ban_cache();
            }
        }
    }
}

fn parse_client(state: &mut State, ps: &mut ParseState<'_>, flag: MemberFlags, letter: char) {
    if ps.too_many_args() || ps.remaining() == 0 {
        return;
    }
    let raw = ps.next_arg().unwrap_or("");

    if ps.refused() {
        ps.send_notoper(state);
        return;
    }

    let mut oplevel = None;
    let target = if ps.local {
        let (nick, requested) = match raw.split_once(':') {
            Some((nick, level)) => (nick, level.parse::<u16>().ok()),
            None => (raw, None),
        };
        if let Some(req) = requested {
            if flag == MemberFlags::CHANOP && ps.add_dir {
                let actor = ps.actor_oplevel(state);
                let forced = ps.flags.contains(ParseFlags::FORCE);
                match actor {
                    Some(own) if !forced && (req < own || (req == own && own < MAXOPLEVEL) || req > MAXOPLEVEL) => {
                        ps.reply(state, NumericReply::not_lower_op_level(nick, &ps.channel, own, req, "op"));
                    }
                    _ if req <= MAXOPLEVEL => oplevel = Some(req),
                    _ => {}
                }
            }
        }
        let found = state.clients.find_user(nick);
        if found.is_none() {
            ps.reply(state, NumericReply::no_such_nick(nick));
        }
        found
    } else {
        let (numeric, level) = match raw.split_once(':') {
            Some((n, l)) => (n, l.parse::<u16>().ok()),
            None => (raw, None),
        };
        oplevel = level.map(|l| l.min(MAXOPLEVEL));
        state.clients.find_by_numeric(numeric)
    };
    let Some(client) = target else {
        return;
    };

    // Owner changes need an owner or a forced change
    if flag == MemberFlags::OWNER && ps.local && !ps.flags.contains(ParseFlags::FORCE) {
        let actor_owner = ps
            .member
            .and_then(|m| state.channels.find_member_link(&ps.channel, m))
            .map_or(false, |m| m.is_owner());
        if !actor_owner {
            ps.reply(state, NumericReply::chan_op_privs_needed(&ps.channel));
            return;
        }
    }

    if ps.flags.contains(ParseFlags::BOUNCE) && !ps.add_dir && flag == MemberFlags::CHANOP {
        if let Some(m) = state.channels.find_member_link(&ps.channel, client) {
            oplevel = Some(m.oplevel);
        }
    }

    let add = ps.add_dir;
    if let Some(existing) = ps.changes.iter_mut().find(|c| c.client == client && c.flag == flag) {
        existing.add = add;
        existing.oplevel = oplevel;
    } else {
        ps.changes.push(CliChange {
            add,
            flag,
            letter,
            client,
            oplevel,
        });
    }
}

fn process_clients(state: &mut State, ps: &mut ParseState<'_>) {
    let changes = std::mem::take(&mut ps.changes);
    let set = ps.flags.contains(ParseFlags::SET);
    let force = ps.flags.contains(ParseFlags::FORCE);
    let (actor_level, actor_owner) = match ps.member.and_then(|m| state.channels.find_member_link(&ps.channel, m)) {
        Some(m) => (Some(m.oplevel), m.is_owner()),
        None => (None, false),
    };
    let has_apass = state.channels.get(&ps.channel).map_or(false, |c| c.has_apass());

    for change in changes {
        let target_name = state.clients.name(change.client).to_string();
        let member = match state.channels.find_member_link(&ps.channel, change.client) {
            Some(m) if !(ps.local && m.is_zombie()) => m.clone(),
            _ => {
                ps.reply(state, NumericReply::user_not_in_channel(&target_name, &ps.channel));
                continue;
            }
        };

        let present = member.status.contains(change.flag);
        if change.add == present {
            continue;
        }

        if !change.add && change.flag.intersects(MemberFlags::CHANOP | MemberFlags::OWNER) {
            let service = state.clients.get(change.client).map_or(false, |c| c.is_channel_service());
            if service {
                if force {
                    let by = state
                        .clients
                        .server_of(ps.origin)
                        .map(|s| state.clients.name(s).to_string())
                        .unwrap_or_default();
                    state.sendto_opmask(&format!("HACK(4): Deop of +k user on {} by {}", ps.channel, by));
                } else if ps.local && set {
                    ps.reply(state, NumericReply::is_chan_service(&target_name, &ps.channel));
                    continue;
                }
            }

            if ps.local && !force && change.client != ps.origin {
                if let Some(own) = actor_level.filter(|_| state.caps.contains(Capabilities::OPLEVELS)) {
                    let theirs = member.oplevel;
                    if theirs < own || (theirs == own && own < MAXOPLEVEL) {
                        ps.reply(
                            state,
                            NumericReply::not_lower_op_level(&target_name, &ps.channel, own, theirs, "deop"),
                        );
                        continue;
                    }
                }
                if member.is_owner() && !actor_owner {
                    ps.reply(state, NumericReply::chan_op_privs_needed(&ps.channel));
                    continue;
                }
            }
        }

        let mut oplevel = member.oplevel;
        if change.add && change.flag == MemberFlags::CHANOP {
            oplevel = match (change.oplevel, actor_level) {
                (Some(level), _) => level,
                (None, None) => MAXOPLEVEL,
                (None, Some(own)) if !has_apass || own == MAXOPLEVEL => MAXOPLEVEL,
                (None, Some(own)) => (own + 1).min(MAXOPLEVEL),
            };
        }

        if set {
            let mut reveal = false;
            if let Some(m) = state.channels.find_member_link_mut(&ps.channel, change.client) {
                if change.add {
                    reveal = m.is_delayed() && !m.is_zombie();
                    m.status.insert(change.flag);
                    if change.flag == MemberFlags::CHANOP {
                        m.status.remove(MemberFlags::DEOPPED);
                        m.oplevel = oplevel;
                    }
                } else {
                    m.status.remove(change.flag);
                }
            }
            if reveal {
                state.reveal_delayed(&ps.channel, change.client);
            }
        }

        if let Some(mbuf) = ps.mbuf.as_deref_mut() {
            mbuf.mode_client(change.add, change.letter, change.client, oplevel);
        }
    }
}

/// Turn the collected simple changes into ModeBuf entries and apply them
fn finish_simple(state: &mut State, ps: &mut ParseState<'_>) {
    let settable = parse_settable(state.caps);
    let Some(chan) = state.channels.get(&ps.channel) else {
        return;
    };
    let current = chan.mode.mode;
    let (limit, key, apass, upass) = (
        chan.mode.mode.contains(ChannelModes::LIMIT).then_some(chan.mode.limit),
        chan.mode.key.clone(),
        chan.mode.apass.clone(),
        chan.mode.upass.clone(),
    );
    let wipeout = ps.flags.contains(ParseFlags::WIPEOUT);

    if wipeout {
        ps.del |= current & settable & !ps.add;
    }

    let mut t_mode = current;
    let removing = ps.del & t_mode;
    let adding = ps.add & !t_mode;
    t_mode.remove(ps.del);
    t_mode.insert(ps.add);

    if let Some(mbuf) = ps.mbuf.as_deref_mut() {
        mbuf.mode(false, removing);
        mbuf.mode(true, adding);
        if wipeout {
            if let (Some(limit), false) = (limit, ps.done.contains(Done::LIMIT)) {
                mbuf.mode_uint(false, limit);
            }
            if !key.is_empty() && !ps.done.contains(Done::KEY) {
                mbuf.mode_string(false, 'k', &key);
            }
            if !upass.is_empty() && !ps.done.contains(Done::UPASS) {
                mbuf.mode_string(false, 'U', &upass);
            }
            if !apass.is_empty() && !ps.done.contains(Done::APASS) {
                mbuf.mode_string(false, 'A', &apass);
            }
        }
    }

    if ps.flags.contains(ParseFlags::SET) {
        let clear_invites = current.contains(ChannelModes::INVITEONLY) && !t_mode.contains(ChannelModes::INVITEONLY);
        let done = ps.done;
        if let Some(chan) = state.channels.get_mut(&ps.channel) {
            chan.mode.mode = t_mode;
            if wipeout {
                if !done.contains(Done::LIMIT) {
                    chan.mode.mode.remove(ChannelModes::LIMIT);
                    chan.mode.limit = 0;
                }
                if !done.contains(Done::KEY) {
                    Secret::Key.store(&mut chan.mode, None);
                }
                if !done.contains(Done::UPASS) {
                    Secret::Upass.store(&mut chan.mode, None);
                }
                if !done.contains(Done::APASS) {
                    Secret::Apass.store(&mut chan.mode, None);
                }
            }
        }
        if clear_invites {
            state.channels.clear_invites(&ps.channel);
        }
    }
}

/// RPL_BANLIST for every ban, then RPL_ENDOFBANLIST
pub fn send_ban_list(state: &mut State, to: ClientId, channel: &str) {
    let (name, bans) = match state.channels.get(channel) {
        Some(chan) => (
            chan.name.clone(),
            chan.bans.iter().map(|b| (b.mask.clone(), b.who.clone(), b.when)).collect::<Vec<_>>(),
        ),
        None => return,
    };
    for (mask, who, when) in bans {
        state.send_numeric(to, NumericReply::ban_list(&name, &mask, &who, when));
    }
    state.send_numeric(to, NumericReply::end_of_ban_list(&name));
}

/// RPL_CHANNELMODEIS and RPL_CREATIONTIME
pub fn send_channel_modes(state: &mut State, to: ClientId, channel: &str) {
    let (name, modes, params, ts) = match state.channels.get(channel) {
        Some(chan) => {
            let view = if chan.active_member(to).is_some() {
                crate::channel::ModeView::Member
            } else {
                crate::channel::ModeView::Public
            };
            let (modes, params) = chan.mode_listing(view);
            (chan.name.clone(), modes, params, chan.creationtime)
        }
        None => return,
    };
    state.send_numeric(to, NumericReply::channel_mode_is(&name, &modes, &params));
    state.send_numeric(to, NumericReply::creation_time(&name, ts));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientFlags;
    use crate::config::Config;
    use crate::modebuf::ModeBufDest;
    use crate::registry::GetChannel;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        st: State,
        alice: ClientId,
        bob: ClientId,
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default())
    }

    fn fixture_with(config: Config) -> Fixture {
        let mut st = State::with_fixed_clock(config, 5000);
        let alice = st.clients.add_local_user("alice", "a", "h", None, "A", 10, 1000).unwrap();
        let bob = st.clients.add_local_user("bob", "b", "h", None, "B", 11, 1000).unwrap();
        st.channels.get_channel("#test", GetChannel::Create, 1000);
        st.channels.add_user_to_channel("#test", alice, MemberFlags::CHANOP, MAXOPLEVEL);
        st.channels.add_user_to_channel("#test", bob, MemberFlags::empty(), MAXOPLEVEL);
        Fixture { st, alice, bob }
    }

    fn user_mode(f: &mut Fixture, who: ClientId, list: &[&str]) -> usize {
        let mut mb = ModeBuf::new(who, None, "#test", ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        let used = mode_parse(
            &mut f.st,
            Some(&mut mb),
            who,
            "#test",
            &args(list),
            ParseFlags::SET | ParseFlags::STRICT,
            Some(who),
        );
        mb.flush(&mut f.st);
        used
    }

    #[test]
    fn test_simple_modes_and_secret_private_exclusive() {
        let mut f = fixture();
        let alice = f.alice;
        assert_eq!(user_mode(&mut f, alice, &["+ntp"]), 1);
        user_mode(&mut f, alice, &["+s"]);
        let modes = f.st.channels.get("#test").unwrap().mode.mode;
        assert!(modes.contains(ChannelModes::SECRET | ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT));
        assert!(!modes.contains(ChannelModes::PRIVATE));
    }

    #[test]
    fn test_ban_supersede_scenario() {
        let mut f = fixture();
        let alice = f.alice;
        user_mode(&mut f, alice, &["+b", "*!*@bad.example.com"]);
        user_mode(&mut f, alice, &["+b", "*!*@*.example.com"]);
        let bans: Vec<&str> = f.st.channels.get("#test").unwrap().bans.iter().map(|b| b.mask.as_str()).collect();
        assert_eq!(bans, vec!["*!*@*.example.com"]);
        let lines = f.st.outbox.lines_for(11);
        assert_eq!(lines.last().copied(), Some(":alice!a@h MODE #test -b+b *!*@bad.example.com *!*@*.example.com"));
    }

    #[test]
    fn test_redundant_ban_is_noop() {
        let mut f = fixture();
        let alice = f.alice;
        user_mode(&mut f, alice, &["+b", "*!*@*.example.com"]);
        let sent = f.st.outbox.len();
        user_mode(&mut f, alice, &["+b", "*!*@bad.example.com"]);
        assert_eq!(f.st.outbox.len(), sent);
        assert_eq!(f.st.channels.get("#test").unwrap().bans.len(), 1);
    }

    #[test]
    fn test_ban_list_full() {
        let mut f = fixture();
        f.st.config.channels.max_bans = 2;
        let alice = f.alice;
        user_mode(&mut f, alice, &["+bbb", "a!*@*", "b!*@*", "c!*@*"]);
        assert_eq!(f.st.channels.get("#test").unwrap().bans.len(), 2);
        assert!(f.st.outbox.lines_for(10).iter().any(|l| l.contains(" 478 ")));
    }

    #[test]
    fn test_nonop_gets_one_error() {
        let mut f = fixture();
        let bob = f.bob;
        let mut mb = ModeBuf::new(bob, None, "#test", ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        mode_parse(
            &mut f.st,
            Some(&mut mb),
            bob,
            "#test",
            &args(&["+ntl", "5"]),
            ParseFlags::SET | ParseFlags::NOTOPER,
            Some(bob),
        );
        assert!(!mb.flush(&mut f.st));
        let errors: Vec<&str> = f.st.outbox.lines_for(11).into_iter().filter(|l| l.contains(" 482 ")).collect();
        assert_eq!(errors.len(), 1);
        assert!(f.st.channels.get("#test").unwrap().mode.mode.is_empty());
    }

    #[test]
    fn test_key_rules() {
        let mut f = fixture();
        let alice = f.alice;
        user_mode(&mut f, alice, &["+k", "secret"]);
        assert_eq!(f.st.channels.get("#test").unwrap().mode.key, "secret");
        user_mode(&mut f, alice, &["+k", "other"]);
        assert_eq!(f.st.channels.get("#test").unwrap().mode.key, "secret");
        assert!(f.st.outbox.lines_for(10).iter().any(|l| l.contains(" 467 ")));
        user_mode(&mut f, alice, &["-k", "secret"]);
        let chan = f.st.channels.get("#test").unwrap();
        assert!(chan.mode.key.is_empty());
        assert!(!chan.mode.mode.contains(ChannelModes::KEY));
    }

    #[test]
    fn test_oplevel_authority() {
        let mut f = fixture();
        let (alice, bob) = (f.alice, f.bob);
        f.st.channels.find_member_link_mut("#test", alice).unwrap().oplevel = 10;
        {
            let b = f.st.channels.find_member_link_mut("#test", bob).unwrap();
            b.op(5);
        }
        user_mode(&mut f, alice, &["-o", "bob"]);
        assert!(f.st.channels.find_member_link("#test", bob).unwrap().is_chanop());
        assert!(f.st.outbox.lines_for(10).iter().any(|l| l.contains(" 550 ")));

        // Equal levels below the maximum protect each other too
        f.st.channels.find_member_link_mut("#test", bob).unwrap().oplevel = 10;
        user_mode(&mut f, alice, &["-o", "bob"]);
        assert!(f.st.channels.find_member_link("#test", bob).unwrap().is_chanop());

        // Both at the maximum: allowed
        f.st.channels.find_member_link_mut("#test", bob).unwrap().oplevel = MAXOPLEVEL;
        f.st.channels.find_member_link_mut("#test", alice).unwrap().oplevel = MAXOPLEVEL;
        user_mode(&mut f, alice, &["-o", "bob"]);
        assert!(!f.st.channels.find_member_link("#test", bob).unwrap().is_chanop());
    }

    #[test]
    fn test_oplevels_ignored_without_passwords() {
        let mut config = Config::default();
        config.features.channel_managers = crate::config::ChannelManagers::None;
        let mut f = fixture_with(config);
        let (alice, bob) = (f.alice, f.bob);
        f.st.channels.find_member_link_mut("#test", alice).unwrap().oplevel = 10;
        f.st.channels.find_member_link_mut("#test", bob).unwrap().op(5);

        user_mode(&mut f, alice, &["-o", "bob"]);
        assert!(!f.st.channels.find_member_link("#test", bob).unwrap().is_chanop());
        assert!(!f.st.outbox.lines_for(10).iter().any(|l| l.contains(" 550 ")));
    }

    #[test]
    fn test_op_grant_oplevel_under_apass() {
        let mut f = fixture();
        let (alice, bob) = (f.alice, f.bob);
        {
            let chan = f.st.channels.get_mut("#test").unwrap();
            chan.mode.apass = "adm".into();
            chan.mode.mode |= ChannelModes::APASS;
        }
        f.st.channels.find_member_link_mut("#test", alice).unwrap().oplevel = 3;
        user_mode(&mut f, alice, &["+o", "bob"]);
        let b = f.st.channels.find_member_link("#test", bob).unwrap();
        assert!(b.is_chanop());
        assert_eq!(b.oplevel, 4);
    }

    #[test]
    fn test_remote_server_mode_with_oplevel_and_ts() {
        let mut f = fixture();
        let me = f.st.me();
        let leaf = f.st.clients.add_server(me, "leaf.example.net", "AC", "leaf", Some(20), 1000).unwrap();
        let bob = f.bob;
        let mut mb = ModeBuf::new(leaf, Some(20), "#test", ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        let used = mode_parse(
            &mut f.st,
            Some(&mut mb),
            leaf,
            "#test",
            &args(&["+ol", "ABAAB:7", "20", "1000"]),
            ParseFlags::SET | ParseFlags::FORCE,
            None,
        );
        assert_eq!(used, 4);
        mb.flush(&mut f.st);
        let b = f.st.channels.find_member_link("#test", bob).unwrap();
        assert!(b.is_chanop());
        assert_eq!(b.oplevel, 7);
        assert_eq!(f.st.channels.get("#test").unwrap().mode.limit, 20);
        assert_eq!(f.st.channels.get("#test").unwrap().creationtime, 1000);
    }

    #[test]
    fn test_bursting_server_newer_ts_ignored() {
        let mut f = fixture();
        let me = f.st.me();
        let leaf = f.st.clients.add_server(me, "leaf.example.net", "AC", "leaf", Some(20), 1000).unwrap();
        f.st.clients.get_mut(leaf).unwrap().flags |= ClientFlags::BURST;
        let mut mb = ModeBuf::new(leaf, Some(20), "#test", ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        mode_parse(
            &mut f.st,
            Some(&mut mb),
            leaf,
            "#test",
            &args(&["+m", "2000"]),
            ParseFlags::SET | ParseFlags::FORCE,
            None,
        );
        assert!(!mb.flush(&mut f.st));
        assert!(f.st.channels.get("#test").unwrap().mode.mode.is_empty());
    }

    #[test]
    fn test_burst_limit_lowest_wins() {
        let mut f = fixture();
        let me = f.st.me();
        let leaf = f.st.clients.add_server(me, "leaf.example.net", "AC", "leaf", Some(20), 1000).unwrap();
        {
            let chan = f.st.channels.get_mut("#test").unwrap();
            chan.mode.mode |= ChannelModes::LIMIT;
            chan.mode.limit = 10;
        }
        let mut mb = ModeBuf::new(leaf, Some(20), "#test", ModeBufDest::CHANNEL);
        let used = mode_parse(
            &mut f.st,
            Some(&mut mb),
            leaf,
            "#test",
            &args(&["+l", "50", "ABAAA"]),
            ParseFlags::SET | ParseFlags::FORCE | ParseFlags::BURST,
            None,
        );
        assert_eq!(used, 2);
        assert_eq!(f.st.channels.get("#test").unwrap().mode.limit, 10);
    }

    #[test]
    fn test_unknown_letters_reported_and_skipped() {
        let mut f = fixture();
        let alice = f.alice;
        user_mode(&mut f, alice, &["+Xn"]);
        assert!(f.st.channels.get("#test").unwrap().mode.mode.contains(ChannelModes::NOPRIVMSGS));
        assert!(f.st.outbox.lines_for(10).iter().any(|l| l.contains(" 472 ")));
    }

    #[test]
    fn test_ban_list_query() {
        let mut f = fixture();
        let alice = f.alice;
        user_mode(&mut f, alice, &["+b", "x!*@*"]);
        user_mode(&mut f, alice, &["+b"]);
        let lines = f.st.outbox.lines_for(10);
        assert!(lines.iter().any(|l| l.contains(" 367 alice #test x!*@* alice ")));
        assert!(lines.iter().any(|l| l.contains(" 368 ")));
    }
}
