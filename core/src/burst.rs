//! Net burst: merging a BURST from a linking server into our channel view,
//! and generating our own burst for a new link.
//!
//! Conflicts are resolved by channel TS. When the remote TS is older the
//! remote side is authoritative: our modes, bans and ops are wiped and any
//! local member the incoming modes would have kept out is kicked as a net
//! rider. Equal TS merges both sides. When our TS is older the remote view
//! is merged additively and the remote side wipes itself on our burst.

use crate::ban::{Ban, BanFlags};
use crate::channel::{ChannelModes, ModeView};
use crate::client::{ClientFlags, ClientId, ConnId};
use crate::config::Capabilities;
use crate::matching::{irc_eq, mmatch, pretty_mask};
use crate::membership::{MemberFlags, MAXOPLEVEL};
use crate::modebuf::{ModeBuf, ModeBufDest};
use crate::modes::{lookup_mode, mode_parse, ModeKind, ParseFlags};
use crate::numnick::ip_to_base64;
use crate::registry::GetChannel;
use crate::state::State;
use crate::wire::{LineBudget, BUFSIZE};
use crate::{Message, MessageType};
use tracing::{debug, info};

/// Which side's view of a channel wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstAuthority {
    /// Channel did not exist here
    New,
    /// Remote TS is older: wipe our state
    Remote,
    /// Same TS (or a zannel inside the slop window): merge
    Equal,
    /// Our TS is older: merge, keep our TS
    Local,
}

/// Decide authority for a BURST carrying `remote_ts`
pub fn burst_authority(local_ts: Option<i64>, remote_ts: i64, empty: bool, slop: i64) -> BurstAuthority {
    match local_ts {
        None => BurstAuthority::New,
        Some(ours) if remote_ts == ours => BurstAuthority::Equal,
        Some(ours) if remote_ts < ours => {
            if empty && ours - remote_ts <= slop {
                BurstAuthority::Equal
            } else {
                BurstAuthority::Remote
            }
        }
        Some(_) => BurstAuthority::Local,
    }
}

/// Net-ride relevant modes found in an incoming mode string
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RiderCheck {
    invite_only: bool,
    key: Option<String>,
    regonly: bool,
    ssl_only: bool,
}

impl RiderCheck {
    fn is_empty(&self) -> bool {
        !self.invite_only && self.key.is_none() && !self.regonly && !self.ssl_only
    }
}

/// Scan `modestr` and its arguments. Returns None on a `-` (not allowed in a BURST).
fn scan_rider_modes(modestr: &str, args: &[String], caps: Capabilities) -> Option<RiderCheck> {
    let mut check = RiderCheck::default();
    let mut next = 0;
    for letter in modestr.chars() {
        match letter {
            '+' => {}
            '-' => return None,
            'i' => check.invite_only = true,
            'r' => check.regonly = true,
            'z' if caps.contains(Capabilities::EXTENDED_MODES) => check.ssl_only = true,
            _ => match lookup_mode(letter, caps) {
                Some(ModeKind::Key) => {
                    check.key = args.get(next).cloned();
                    next += 1;
                }
                Some(ModeKind::Limit | ModeKind::Apass | ModeKind::Upass) => next += 1,
                _ => {}
            },
        }
    }
    Some(check)
}

/// Kick local members the incoming modes would have kept out. They stay
/// zombies until the burst is done; returns who was kicked.
fn kick_net_riders(state: &mut State, channel: &str, check: &RiderCheck) -> Vec<ClientId> {
    let our_key = state.channels.get(channel).map(|c| c.mode.key.clone()).unwrap_or_default();
    let key_changed = check.key.as_deref().map_or(false, |k| k != our_key);

    let candidates: Vec<ClientId> = match state.channels.get(channel) {
        Some(chan) => chan.active_members().map(|m| m.user).collect(),
        None => return Vec::new(),
    };
    let mut kicked = Vec::new();
    for user in candidates {
        let Some(client) = state.clients.get(user) else {
            continue;
        };
        if !client.is_local() {
            continue;
        }
        let rider = key_changed
            || (check.invite_only && !client.is_oper())
            || (check.regonly && client.account.is_none())
            || (check.ssl_only && !client.flags.contains(ClientFlags::SSL));
        if !rider {
            continue;
        }

        let me = state.me();
        let nick = client.name.clone();
        let numeric = client.numeric.clone();
        info!("Kicking net rider {} from {}", nick, channel);
        let to_servers = state.server_message(
            me,
            MessageType::Kick,
            vec![channel.to_string(), numeric, "Net Rider".to_string()],
        );
        state.send_to_servers(&to_servers, None);
        let to_channel = state.client_message(me, MessageType::Kick, vec![channel.to_string(), nick, "Net Rider".to_string()]);
        state.send_to_channel(channel, &to_channel, None);
        state.channels.set_zombie(channel, user);
        kicked.push(user);
    }
    kicked
}

/// Decoder for the member list of a BURST
struct MemberDecoder {
    base: MemberFlags,
    current: MemberFlags,
    /// -1 while the next digits are an absolute level
    oplevel: i32,
}

impl MemberDecoder {
    fn new(delayed: bool) -> Self {
        let mut base = MemberFlags::DEOPPED | MemberFlags::BURST_JOINED;
        if delayed {
            base |= MemberFlags::DELAYED;
        }
        Self {
            base,
            current: base,
            oplevel: -1,
        }
    }

    /// Apply a `:flags` suffix. Err carries a description of the bad input.
    fn apply(&mut self, flags: &str) -> Result<(), String> {
        let chars: Vec<char> = flags.chars().collect();
        let mut needs_reset = true;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                'o' => {
                    self.oplevel = i32::from(MAXOPLEVEL);
                    if needs_reset {
                        self.current = self.base;
                        needs_reset = false;
                    }
                    self.current = (self.current - MemberFlags::DEOPPED - MemberFlags::DELAYED) | MemberFlags::CHANOP;
                    if chars.get(i + 1) == Some(&'v') {
                        self.current |= MemberFlags::VOICE;
                        i += 1;
                    }
                }
                'v' => {
                    if needs_reset {
                        self.current = self.base;
                        needs_reset = false;
                    }
                    self.current = (self.current - MemberFlags::DELAYED) | MemberFlags::VOICE;
                    self.oplevel = -1;
                }
                d if d.is_ascii_digit() => {
                    if self.oplevel == -1 {
                        if needs_reset {
                            self.current = self.base;
                            needs_reset = false;
                        }
                        self.oplevel = 0;
                    }
                    self.current = (self.current - MemberFlags::DEOPPED - MemberFlags::DELAYED) | MemberFlags::CHANOP;
                    let mut increment: i32 = 0;
                    while let Some(digit) = chars.get(i).and_then(|c| c.to_digit(10)) {
                        increment = increment.saturating_mul(10).saturating_add(digit as i32);
                        i += 1;
                    }
                    i -= 1;
                    self.oplevel = self.oplevel.saturating_add(increment);
                    if self.oplevel > i32::from(MAXOPLEVEL) {
                        let bad = self.oplevel;
                        self.oplevel = i32::from(MAXOPLEVEL);
                        return Err(format!("Invalid cumulative oplevel {} during burst", bad));
                    }
                }
                other => return Err(format!("Invalid flag '{}' in nick part of burst", other)),
            }
            i += 1;
        }
        Ok(())
    }

    fn level(&self) -> u16 {
        if self.oplevel < 0 {
            MAXOPLEVEL
        } else {
            self.oplevel.min(i32::from(MAXOPLEVEL)) as u16
        }
    }
}

/// Merge the member list of a BURST
fn burst_members(state: &mut State, source: ClientId, via: ConnId, channel: &str, list: &str) {
    let delayed = state
        .channels
        .get(channel)
        .map_or(false, |c| c.mode.mode.contains(ChannelModes::DELJOINS));
    let mut decoder = MemberDecoder::new(delayed);

    for token in list.split(',').filter(|t| !t.is_empty()) {
        let (numeric, flags) = match token.split_once(':') {
            Some((n, f)) => (n, Some(f)),
            None => (token, None),
        };
        if let Some(flags) = flags {
            if let Err(text) = decoder.apply(flags) {
                state.protocol_violation(source, &text);
            }
        }

        let Some(user) = state.clients.find_by_numeric(numeric) else {
            continue;
        };
        let from_link = state
            .clients
            .get(user)
            .map_or(false, |c| c.is_user() && c.link == Some(via));
        if !from_link {
            debug!("Ignoring burst member {} from the wrong direction", numeric);
            continue;
        }

        let status = decoder.current;
        let oplevel = decoder.level();
        match state.channels.find_member_link_mut(channel, user) {
            None => {
                state.channels.add_user_to_channel(channel, user, status, oplevel);
                if !status.contains(MemberFlags::DELAYED) {
                    let join = state.client_message(user, MessageType::Join, vec![channel.to_string()]);
                    state.send_to_channel(channel, &join, None);
                }
            }
            Some(member) => {
                if member.is_chanop() {
                    member.status |= MemberFlags::BURST_ALREADY_OPPED;
                }
                if member.has_voice() {
                    member.status |= MemberFlags::BURST_ALREADY_VOICED;
                }
                member.status |= MemberFlags::BURST_JOINED | (status & (MemberFlags::CHANOP | MemberFlags::VOICE));
                if status.contains(MemberFlags::CHANOP) {
                    member.status.remove(MemberFlags::DEOPPED);
                    member.oplevel = oplevel;
                }
            }
        }
    }
}

/// Merge the `%ban ban...` part of a BURST
fn burst_bans(state: &mut State, source: ClientId, channel: &str, list: &str) {
    let who = state.clients.name(source).to_string();
    let now = state.now();
    let Some(chan) = state.channels.get_mut(channel) else {
        return;
    };
    for raw in list.trim_start_matches('%').split_whitespace() {
        let mask = pretty_mask(raw);
        let mut redundant = false;
        for existing in chan.bans.iter_mut() {
            if irc_eq(&existing.mask, &mask) {
                existing.flags.remove(BanFlags::BURST_WIPEOUT);
                redundant = true;
                break;
            }
            if !existing.flags.intersects(BanFlags::OVERLAPPED | BanFlags::BURST_WIPEOUT) && mmatch(&existing.mask, &mask) {
                redundant = true;
                break;
            }
        }
        if redundant {
            continue;
        }
        for existing in chan.bans.iter_mut() {
            if mmatch(&mask, &existing.mask) {
                existing.flags |= BanFlags::OVERLAPPED;
            }
        }
        let mut ban = Ban::new(mask, who.clone(), now);
        ban.flags |= BanFlags::BURSTED;
        chan.bans.push(ban);
    }
}

/// Announce ban changes and drop wiped or overlapped bans
fn settle_bans(state: &mut State, channel: &str, mbuf: &mut ModeBuf) {
    let Some(chan) = state.channels.get_mut(channel) else {
        return;
    };
    let mut changed = false;
    chan.bans.retain_mut(|ban| {
        if ban.flags.intersects(BanFlags::OVERLAPPED | BanFlags::BURST_WIPEOUT) {
            if !ban.flags.contains(BanFlags::BURSTED) {
                mbuf.mode_string(false, 'b', &ban.mask);
            }
            changed = true;
            false
        } else {
            if ban.flags.contains(BanFlags::BURSTED) {
                mbuf.mode_string(true, 'b', &ban.mask);
                ban.flags.remove(BanFlags::BURSTED);
                changed = true;
            }
            true
        }
    });
    if changed {
        chan.invalidate_ban_cache();
    }
}

/// Announce op/voice deltas; on wipeout, strip everyone the burst did not list
fn settle_members(state: &mut State, channel: &str, wipeout: bool, mbuf: &mut ModeBuf) {
    let Some(chan) = state.channels.get_mut(channel) else {
        return;
    };
    for member in chan.members.iter_mut() {
        if member.is_burst_joined() {
            if member.is_chanop() && !member.status.contains(MemberFlags::BURST_ALREADY_OPPED) {
                mbuf.mode_client(true, 'o', member.user, member.oplevel);
            }
            if member.has_voice() && !member.status.contains(MemberFlags::BURST_ALREADY_VOICED) {
                mbuf.mode_client(true, 'v', member.user, member.oplevel);
            }
        } else if wipeout {
            if !member.is_zombie() {
                if member.is_chanop() {
                    mbuf.mode_client(false, 'o', member.user, member.oplevel);
                }
                if member.has_voice() {
                    mbuf.mode_client(false, 'v', member.user, member.oplevel);
                }
            }
            member.status = (member.status - MemberFlags::CHANOP - MemberFlags::VOICE) | MemberFlags::DEOPPED;
        }
    }
}

/// Handle `BURST <chan> <ts> [+modes args] [members] [:%bans]` from `source`,
/// received on link `via`.
pub fn process_burst(state: &mut State, source: ClientId, via: ConnId, msg: &Message) {
    if msg.params.len() < 2 {
        state.protocol_violation(source, "Too few parameters for BURST");
        return;
    }
    let name = msg.params[0].clone();
    if !name.starts_with('#') {
        state.protocol_violation(source, &format!("BURST for invalid channel {}", name));
        return;
    }
    let Ok(ts) = msg.params[1].parse::<i64>() else {
        state.protocol_violation(source, &format!("BURST for {} with bad TS {}", name, msg.params[1]));
        return;
    };

    let slop = state.config.channels.zannel_slop;
    let (local_ts, empty) = match state.channels.get(&name) {
        Some(chan) => (Some(chan.creationtime), chan.active_members().next().is_none()),
        None => (None, true),
    };
    let authority = burst_authority(local_ts, ts, empty, slop);
    let now = state.now();
    let Some(chan) = state.channels.get_channel(&name, GetChannel::Create, now) else {
        return;
    };
    let name = chan.name.clone();
    debug!("BURST for {} (ours {:?}, theirs {}): {:?}", name, local_ts, ts, authority);

    let mut flags = ParseFlags::SET | ParseFlags::FORCE | ParseFlags::BURST;
    let mut riders = Vec::new();
    let modestr_idx = msg.params.iter().skip(2).position(|p| p.starts_with('+')).map(|i| i + 2);

    match authority {
        BurstAuthority::New => chan.creationtime = ts,
        BurstAuthority::Equal => {
            if ts < chan.creationtime {
                chan.creationtime = ts;
            }
        }
        BurstAuthority::Local => {}
        BurstAuthority::Remote => {
            flags |= ParseFlags::WIPEOUT;
            chan.creationtime = ts;
            for ban in chan.bans.iter_mut() {
                ban.flags |= BanFlags::BURST_WIPEOUT;
            }
            let check = modestr_idx
                .and_then(|i| scan_rider_modes(&msg.params[i], &msg.params[i + 1..], state.caps))
                .unwrap_or_default();
            state.channels.clear_invites(&name);
            if !check.is_empty() {
                riders = kick_net_riders(state, &name, &check);
            }
        }
    }

    let mut mbuf = ModeBuf::new(source, None, &name, ModeBufDest::CHANNEL);
    if flags.contains(ParseFlags::WIPEOUT) && modestr_idx.is_none() {
        // No modes from the older side: ours still go
        let bare = ["+".to_string()];
        mode_parse(state, Some(&mut mbuf), source, &name, &bare, flags, None);
    }
    let mut i = 2;
    while i < msg.params.len() {
        let param = &msg.params[i];
        if param.starts_with('+') {
            if param.contains('-') {
                state.protocol_violation(source, &format!("BURST mode string {} for {} has a '-'", param, name));
                i += 1;
                continue;
            }
            let used = mode_parse(state, Some(&mut mbuf), source, &name, &msg.params[i..], flags, None);
            i += used.max(1);
        } else if param.starts_with('%') {
            burst_bans(state, source, &name, param);
            i += 1;
        } else {
            burst_members(state, source, via, &name, param);
            i += 1;
        }
    }

    settle_bans(state, &name, &mut mbuf);
    settle_members(state, &name, flags.contains(ParseFlags::WIPEOUT), &mut mbuf);
    mbuf.flush(state);
    state.clear_burst_flags(&name);

    for user in riders {
        state.remove_user_from_channel(&name, user);
    }

    state.send_to_servers(msg, Some(via));

    let (gone, has_apass) = match state.channels.get(&name) {
        Some(chan) => (chan.members.is_empty(), chan.has_apass()),
        None => return,
    };
    if gone {
        if has_apass {
            state.channels.schedule_empty_destruct(&name, now);
        } else {
            debug!("Destructing {}: empty after burst", name);
            state.channels.destruct_channel(&name);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Group {
    Plain,
    Voice,
    Op,
    OpVoice,
}

/// Member list entries in burst order: plain, voiced, opped, opped and
/// voiced; ops by ascending oplevel
fn burst_member_order(state: &State, channel: &str) -> Vec<(String, Group, u16)> {
    let Some(chan) = state.channels.get(channel) else {
        return Vec::new();
    };
    let mut members: Vec<(String, Group, u16)> = chan
        .active_members()
        .map(|m| {
            let group = match (m.is_chanop(), m.has_voice()) {
                (false, false) => Group::Plain,
                (false, true) => Group::Voice,
                (true, false) => Group::Op,
                (true, true) => Group::OpVoice,
            };
            (state.clients.numeric(m.user).to_string(), group, m.oplevel)
        })
        .collect();
    members.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));
    members
}

/// Burst member token given the previous token on the same line
fn member_token(numeric: &str, group: Group, oplevel: u16, last: Option<(Group, u16)>, oplevels: bool) -> String {
    let mut token = numeric.to_string();
    match last {
        Some((g, level)) if g == group => {
            if oplevels && matches!(group, Group::Op | Group::OpVoice) && oplevel != level {
                token.push_str(&format!(":{}", oplevel - level));
            }
        }
        _ => match group {
            Group::Plain => {}
            Group::Voice => token.push_str(":v"),
            Group::Op if oplevels => token.push_str(&format!(":{}", oplevel)),
            Group::Op => token.push_str(":o"),
            Group::OpVoice if oplevels => token.push_str(&format!(":v{}", oplevel)),
            Group::OpVoice => token.push_str(":ov"),
        },
    }
    token
}

/// BURST lines describing a channel, modes on the first line only
pub fn channel_burst_lines(state: &State, channel: &str) -> Vec<Message> {
    let Some(chan) = state.channels.get(channel) else {
        return Vec::new();
    };
    let me = state.me();
    let oplevels = state.has_cap(Capabilities::OPLEVELS);
    let name = chan.name.clone();
    let ts = chan.creationtime.to_string();
    let (modes, mode_params) = chan.mode_listing(ModeView::Burst);
    let bans: Vec<String> = chan.bans.iter().map(|b| b.mask.clone()).collect();
    let members = burst_member_order(state, channel);

    // "AB B #chan ts " plus CRLF
    let header = state.clients.numeric(me).len() + name.len() + ts.len() + 7;
    let mut lines = Vec::new();
    let mut params = vec![name.clone(), ts.clone()];
    let mut budget = LineBudget::new(BUFSIZE, header);

    if modes.len() > 1 {
        budget.take(modes.len() + 1);
        params.push(modes);
        for p in mode_params {
            budget.take(p.len() + 1);
            params.push(p);
        }
    }

    let mut list = String::new();
    let mut last: Option<(Group, u16)> = None;
    for (numeric, group, oplevel) in &members {
        let mut token = member_token(numeric, *group, *oplevel, last, oplevels);
        let cost = token.len() + 1;
        if !budget.take(cost) {
            if !list.is_empty() {
                params.push(std::mem::take(&mut list));
            }
            lines.push(state.server_message(me, MessageType::Burst, std::mem::take(&mut params)));
            params = vec![name.clone(), ts.clone()];
            budget.reset(header);
            token = member_token(numeric, *group, *oplevel, None, oplevels);
            budget.take(token.len() + 1);
        }
        if !list.is_empty() {
            list.push(',');
        }
        list.push_str(&token);
        last = Some((*group, *oplevel));
    }
    if !list.is_empty() {
        params.push(list);
    }

    let mut banlist = String::new();
    for mask in &bans {
        // " :%" before the first, a space before the rest
        let cost = mask.len() + if banlist.is_empty() { 3 } else { 1 };
        if !budget.take(cost) {
            if !banlist.is_empty() {
                params.push(std::mem::take(&mut banlist));
            }
            lines.push(state.server_message(me, MessageType::Burst, std::mem::take(&mut params)));
            params = vec![name.clone(), ts.clone()];
            budget.reset(header);
            budget.take(mask.len() + 3);
        }
        if banlist.is_empty() {
            banlist.push('%');
        } else {
            banlist.push(' ');
        }
        banlist.push_str(mask);
    }
    if !banlist.is_empty() {
        params.push(banlist);
    }
    lines.push(state.server_message(me, MessageType::Burst, params));
    lines
}

/// Introduction line for a server we know about
pub fn server_intro(state: &State, server: ClientId) -> Option<Message> {
    let client = state.clients.get(server)?;
    let uplink = client.server?;
    Some(state.server_message(
        uplink,
        MessageType::Server,
        vec![
            client.name.clone(),
            (client.hopcount + 1).to_string(),
            client.timestamp.to_string(),
            client.timestamp.to_string(),
            "J10".to_string(),
            format!("{}]]]", client.numeric),
            "+s".to_string(),
            client.info.clone(),
        ],
    ))
}

/// `N` line introducing a user
pub fn user_intro(state: &State, user: ClientId) -> Option<Message> {
    let client = state.clients.get(user)?;
    let server = client.server?;
    let mut params = vec![
        client.name.clone(),
        (client.hopcount + 1).to_string(),
        client.timestamp.to_string(),
        client.username.clone(),
        client.host.clone(),
    ];
    let modes = client.umode_string();
    if modes.len() > 1 {
        params.push(modes);
        if let Some(account) = &client.account {
            params.push(account.clone());
        }
    }
    params.push(client.ip.map_or_else(|| "AAAAAA".to_string(), ip_to_base64));
    params.push(client.numeric.clone());
    params.push(client.info.clone());
    Some(state.server_message(server, MessageType::Nick, params))
}

/// Send our whole view of the network down a new link, ending with `EB`
pub fn send_net_burst(state: &mut State, conn: ConnId) {
    let me = state.me();
    let mut lines = Vec::new();

    let mut servers: Vec<&crate::client::Client> = state
        .clients
        .iter()
        .filter(|c| c.is_server() && !c.is_me() && c.link != Some(conn))
        .collect();
    servers.sort_by_key(|c| c.hopcount);
    lines.extend(servers.iter().filter_map(|s| server_intro(state, s.id)));

    let users: Vec<ClientId> = state
        .clients
        .iter()
        .filter(|c| c.is_user() && c.link != Some(conn))
        .map(|c| c.id)
        .collect();
    lines.extend(users.iter().filter_map(|u| user_intro(state, *u)));

    let mut topics = Vec::new();
    for name in state.channels.names() {
        let Some(chan) = state.channels.get(&name) else {
            continue;
        };
        if chan.is_local() {
            continue;
        }
        lines.extend(channel_burst_lines(state, &name));
        if !chan.topic.text.is_empty() {
            topics.push(state.server_message(
                me,
                MessageType::Topic,
                vec![
                    chan.name.clone(),
                    chan.creationtime.to_string(),
                    chan.topic.time.to_string(),
                    chan.topic.text.clone(),
                ],
            ));
        }
    }
    lines.extend(topics);
    lines.push(state.server_message(me, MessageType::EndOfBurst, Vec::new()));

    info!("Sending net burst of {} lines on link {}", lines.len(), conn);
    for line in lines {
        state.send_to_link(conn, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct Net {
        st: State,
        leaf: ClientId,
    }

    fn net(now: i64) -> Net {
        net_with(Config::default(), now)
    }

    fn net_with(config: Config, now: i64) -> Net {
        let mut st = State::with_fixed_clock(config, now);
        let me = st.me();
        let leaf = st.clients.add_server(me, "leaf.example.net", "AC", "leaf", Some(20), 900).unwrap();
        for (num, nick) in [("ACAAA", "aaa"), ("ACAAB", "bbb"), ("ACAAC", "ccc")] {
            st.clients
                .add_remote_user(leaf, num, nick, "u", "remote.host", None, "R", None, ClientFlags::empty(), 900)
                .unwrap();
        }
        Net { st, leaf }
    }

    fn burst(n: &mut Net, params: &[&str]) {
        let msg = Message::with_prefix(
            crate::Prefix::Numeric("AC".into()),
            MessageType::Burst,
            params.iter().map(|s| s.to_string()).collect(),
        );
        let leaf = n.leaf;
        process_burst(&mut n.st, leaf, 20, &msg);
    }

    fn id(n: &Net, numeric: &str) -> ClientId {
        n.st.clients.find_by_numeric(numeric).unwrap()
    }

    #[test]
    fn test_authority() {
        assert_eq!(burst_authority(None, 5, true, 4), BurstAuthority::New);
        assert_eq!(burst_authority(Some(10), 10, false, 4), BurstAuthority::Equal);
        assert_eq!(burst_authority(Some(10), 5, false, 4), BurstAuthority::Remote);
        assert_eq!(burst_authority(Some(10), 7, true, 4), BurstAuthority::Equal);
        assert_eq!(burst_authority(Some(10), 2, true, 4), BurstAuthority::Remote);
        assert_eq!(burst_authority(Some(10), 15, false, 4), BurstAuthority::Local);
    }

    #[test]
    fn test_member_decoder() {
        let mut d = MemberDecoder::new(false);
        d.apply("5").unwrap();
        assert_eq!(d.level(), 5);
        assert!(d.current.contains(MemberFlags::CHANOP));
        d.apply("3").unwrap();
        assert_eq!(d.level(), 8);
        d.apply("v").unwrap();
        assert!(!d.current.contains(MemberFlags::CHANOP));
        assert!(d.current.contains(MemberFlags::VOICE));
        d.apply("v2").unwrap();
        assert!(d.current.contains(MemberFlags::CHANOP | MemberFlags::VOICE));
        assert_eq!(d.level(), 2);
        d.apply("o").unwrap();
        assert_eq!(d.level(), MAXOPLEVEL);
        assert!(d.apply("1").is_err());
        assert!(d.apply("x").is_err());
    }

    #[test]
    fn test_local_older_merges() {
        let mut n = net(5000);
        let b = n.st.clients.add_local_user("bee", "b", "h", None, "B", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 1000);
        n.st.channels.add_user_to_channel("#test", b, MemberFlags::CHANOP, MAXOPLEVEL);

        burst(&mut n, &["#test", "1005", "+nt", "ACAAA,ACAAB:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        assert_eq!(chan.creationtime, 1000);
        assert!(chan.mode.mode.contains(ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT));
        assert!(!chan.member(id(&n, "ACAAA")).unwrap().is_chanop());
        assert!(chan.member(id(&n, "ACAAB")).unwrap().is_chanop());
        assert!(chan.member(b).unwrap().is_chanop());
        assert!(!n.st.outbox.lines_for(10).iter().any(|l| l.contains("KICK")));
        assert!(!chan.member(id(&n, "ACAAB")).unwrap().is_burst_joined());
    }

    #[test]
    fn test_remote_older_kicks_net_riders() {
        let mut n = net(5000);
        let c = n.st.clients.add_local_user("carol", "c", "h", None, "C", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 2000).unwrap().creationtime = 2000;
        n.st.channels.add_user_to_channel("#test", c, MemberFlags::empty(), MAXOPLEVEL);
        n.st.channels
            .get_mut("#test")
            .unwrap()
            .bans
            .push(Ban::new("*!*@old.example".into(), "x", 1500));

        burst(&mut n, &["#test", "1000", "+ik", "keyX", "ACAAA:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        assert_eq!(chan.creationtime, 1000);
        assert!(chan.mode.mode.contains(ChannelModes::INVITEONLY | ChannelModes::KEY));
        assert_eq!(chan.mode.key, "keyX");
        assert!(chan.bans.is_empty());
        assert!(chan.member(c).is_none());
        assert!(chan.member(id(&n, "ACAAA")).unwrap().is_chanop());
        assert!(n
            .st
            .outbox
            .lines_for(10)
            .contains(&":irc.example.net KICK #test carol :Net Rider"));
        assert!(n.st.outbox.lines_for(20).contains(&"AB K #test ABAAA :Net Rider"));
    }

    #[test]
    fn test_remote_older_deops_unlisted() {
        let mut n = net(5000);
        let b = n.st.clients.add_local_user("bee", "b", "h", None, "B", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 2000);
        n.st.channels.add_user_to_channel("#test", b, MemberFlags::CHANOP, MAXOPLEVEL);
        {
            let chan = n.st.channels.get_mut("#test").unwrap();
            chan.mode.mode |= ChannelModes::MODERATED | ChannelModes::LIMIT;
            chan.mode.limit = 5;
        }

        burst(&mut n, &["#test", "1000", "+n", "ACAAA:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        let bee = chan.member(b).unwrap();
        assert!(!bee.is_chanop());
        assert!(bee.is_deopped());
        assert_eq!(chan.mode.mode, ChannelModes::NOPRIVMSGS);
        assert_eq!(chan.mode.limit, 0);
        let lines = n.st.outbox.lines_for(10);
        assert!(lines.contains(&":aaa!u@remote.host JOIN #test"));
        assert!(lines.contains(&":*.example.net MODE #test -mlo+no bee aaa"));
    }

    #[test]
    fn test_remote_older_without_modes_wipes_ours() {
        let mut n = net(5000);
        let b = n.st.clients.add_local_user("bee", "b", "h", None, "B", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 2000).unwrap().creationtime = 2000;
        n.st.channels.add_user_to_channel("#test", b, MemberFlags::CHANOP, MAXOPLEVEL);
        {
            let chan = n.st.channels.get_mut("#test").unwrap();
            chan.mode.mode |= ChannelModes::SECRET
                | ChannelModes::MODERATED
                | ChannelModes::KEY
                | ChannelModes::LIMIT
                | ChannelModes::APASS
                | ChannelModes::UPASS;
            chan.mode.key = "ours".into();
            chan.mode.limit = 5;
            chan.mode.apass = "adm".into();
            chan.mode.upass = "usr".into();
        }

        burst(&mut n, &["#test", "1000", "ACAAA:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        assert_eq!(chan.creationtime, 1000);
        assert!(chan.mode.mode.is_empty());
        assert_eq!(chan.mode.limit, 0);
        assert!(chan.mode.key.is_empty());
        assert!(chan.mode.apass.is_empty());
        assert!(chan.mode.upass.is_empty());
        assert!(!chan.member(b).unwrap().is_chanop());
        assert!(chan.member(id(&n, "ACAAA")).unwrap().is_chanop());

        let lines = n.st.outbox.lines_for(10);
        let mode = lines
            .iter()
            .find(|l| l.starts_with(":*.example.net MODE #test -"))
            .expect("no MODE line for the wipe");
        let removed = mode.split(' ').nth(3).unwrap().trim_start_matches('-');
        let removed = removed.split('+').next().unwrap();
        for letter in ['s', 'm', 'k', 'l', 'o'] {
            assert!(removed.contains(letter), "{} missing from {}", letter, mode);
        }
        assert!(mode.contains(" ours"));
    }

    #[test]
    fn test_key_differing_in_case_kicks_riders() {
        let mut n = net(5000);
        let c = n.st.clients.add_local_user("carol", "c", "h", None, "C", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 2000).unwrap().creationtime = 2000;
        n.st.channels.add_user_to_channel("#test", c, MemberFlags::empty(), MAXOPLEVEL);
        {
            let chan = n.st.channels.get_mut("#test").unwrap();
            chan.mode.mode |= ChannelModes::KEY;
            chan.mode.key = "Secret".into();
        }

        burst(&mut n, &["#test", "1000", "+k", "secret", "ACAAA:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        assert_eq!(chan.mode.key, "secret");
        assert!(chan.member(c).is_none());
        assert!(n
            .st
            .outbox
            .lines_for(10)
            .contains(&":irc.example.net KICK #test carol :Net Rider"));
    }

    #[test]
    fn test_ssl_only_ignored_without_extended_modes() {
        let mut config = Config::default();
        config.features.extended_modes = false;
        let mut n = net_with(config, 5000);
        let c = n.st.clients.add_local_user("carol", "c", "h", None, "C", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 2000).unwrap().creationtime = 2000;
        n.st.channels.add_user_to_channel("#test", c, MemberFlags::empty(), MAXOPLEVEL);

        burst(&mut n, &["#test", "1000", "+nz", "ACAAA:o"]);

        let chan = n.st.channels.get("#test").unwrap();
        assert_eq!(chan.creationtime, 1000);
        assert!(chan.member(c).is_some());
        assert!(!chan.mode.mode.contains(ChannelModes::SSLONLY));
        assert!(!n.st.outbox.lines_for(10).iter().any(|l| l.contains("KICK")));
    }

    #[test]
    fn test_burst_is_idempotent() {
        let mut n = net(5000);
        let b = n.st.clients.add_local_user("bee", "b", "h", None, "B", 10, 1000).unwrap();
        n.st.channels.get_channel("#test", GetChannel::Create, 1000);
        n.st.channels.add_user_to_channel("#test", b, MemberFlags::CHANOP, MAXOPLEVEL);
        let params = ["#test", "1000", "+ntl", "20", "ACAAA,ACAAB:o", "%*!*@spam.example *!*@junk.example"];

        burst(&mut n, &params);
        let first = n.st.channels.get("#test").unwrap().clone();
        n.st.outbox.drain();
        burst(&mut n, &params);
        let second = n.st.channels.get("#test").unwrap();

        assert_eq!(first.mode, second.mode);
        assert_eq!(first.members, second.members);
        let masks = |c: &crate::channel::Channel| c.bans.iter().map(|b| b.mask.clone()).collect::<Vec<_>>();
        assert_eq!(masks(&first), masks(second));
        assert_eq!(second.bans.len(), 2);
        assert!(!n.st.outbox.lines_for(10).iter().any(|l| l.contains("MODE") || l.contains("JOIN")));
    }

    #[test]
    fn test_burst_ban_overlap() {
        let mut n = net(5000);
        n.st.channels.get_channel("#test", GetChannel::Create, 1000);
        n.st.channels
            .get_mut("#test")
            .unwrap()
            .bans
            .push(Ban::new("*!*@bad.example.com".into(), "x", 900));
        burst(&mut n, &["#test", "1000", "ACAAA", "%*!*@*.example.com *!*@worse.example.com"]);
        let chan = n.st.channels.get("#test").unwrap();
        let masks: Vec<&str> = chan.bans.iter().map(|b| b.mask.as_str()).collect();
        assert_eq!(masks, vec!["*!*@*.example.com"]);
    }

    #[test]
    fn test_wrong_direction_member_ignored() {
        let mut n = net(5000);
        let local = n.st.clients.add_local_user("loco", "l", "h", None, "L", 10, 1000).unwrap();
        let numeric = n.st.clients.numeric(local).to_string();
        let list = format!("ACAAA,{}:o", numeric);
        burst(&mut n, &["#test", "1000", &list]);
        let chan = n.st.channels.get("#test").unwrap();
        assert!(chan.member(local).is_none());
        assert_eq!(chan.members.len(), 1);
    }

    #[test]
    fn test_empty_burst_destructs_without_apass() {
        let mut n = net(5000);
        burst(&mut n, &["#ghost", "1000"]);
        assert!(n.st.channels.get("#ghost").is_none());
        burst(&mut n, &["#zannel", "1000", "+A", "secret"]);
        assert!(n.st.channels.get("#zannel").is_some());
        assert!(n.st.channels.destruct_event_time("#zannel").is_some());
    }

    #[test]
    fn test_burst_forwarded_verbatim() {
        let mut n = net(5000);
        let me = n.st.me();
        n.st.clients.add_server(me, "hub.example.net", "AD", "hub", Some(30), 900).unwrap();
        burst(&mut n, &["#test", "1000", "+n", "ACAAA:o", "%*!*@x"]);
        assert_eq!(n.st.outbox.lines_for(30), vec!["AC B #test 1000 +n ACAAA:o %*!*@x"]);
        assert!(n.st.outbox.lines_for(20).is_empty());
    }

    #[test]
    fn test_outbound_burst_round_trip() {
        let mut a = net(5000);
        a.st.channels.get_channel("#rt", GetChannel::Create, 1000);
        let ids: Vec<ClientId> = ["ACAAA", "ACAAB", "ACAAC"].iter().map(|n| id(&a, n)).collect();
        a.st.channels.add_user_to_channel("#rt", ids[0], MemberFlags::empty(), MAXOPLEVEL);
        a.st.channels.add_user_to_channel("#rt", ids[1], MemberFlags::CHANOP | MemberFlags::VOICE, 4);
        a.st.channels.add_user_to_channel("#rt", ids[2], MemberFlags::CHANOP, 7);
        {
            let chan = a.st.channels.get_mut("#rt").unwrap();
            chan.mode.mode |= ChannelModes::NOPRIVMSGS | ChannelModes::KEY;
            chan.mode.key = "pw".into();
            chan.bans.push(Ban::new("*!*@x.example".into(), "x", 900));
        }
        let lines = channel_burst_lines(&a.st, "#rt");
        assert_eq!(lines.len(), 1);

        let mut b = net(5000);
        let leaf = b.leaf;
        for line in &lines {
            let msg = Message::parse_p10(&line.to_string()).unwrap();
            process_burst(&mut b.st, leaf, 20, &msg);
        }
        let chan = b.st.channels.get("#rt").unwrap();
        assert_eq!(chan.mode.key, "pw");
        assert_eq!(chan.bans.len(), 1);
        let m1 = chan.member(id(&b, "ACAAB")).unwrap();
        assert!(m1.is_chanop() && m1.has_voice());
        let m2 = chan.member(id(&b, "ACAAC")).unwrap();
        assert!(m2.is_chanop() && !m2.has_voice());
        assert!(!chan.member(id(&b, "ACAAA")).unwrap().is_chanop());
    }

    #[test]
    fn test_member_tokens_split_lines() {
        let mut n = net(5000);
        n.st.channels.get_channel("#big", GetChannel::Create, 1000);
        let leaf = n.leaf;
        for i in 0..120u32 {
            let numeric = format!("AC{}", crate::numnick::int_to_base64(100 + i, 3));
            let nick = format!("user{}", i);
            let user = n
                .st
                .clients
                .add_remote_user(leaf, &numeric, &nick, "u", "h", None, "R", None, ClientFlags::empty(), 900)
                .unwrap();
            n.st.channels.add_user_to_channel("#big", user, MemberFlags::CHANOP, 10 + (i % 5) as u16);
        }
        let lines = channel_burst_lines(&n.st, "#big");
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.to_string().len() + 2 <= BUFSIZE);
            let members = line.params.last().unwrap();
            let first = members.split(',').next().unwrap();
            assert!(first.contains(':'), "continuation must restate the mode: {}", first);
        }
    }
}
