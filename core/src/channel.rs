//! Channel entity: modes, topic, members, bans and invites

use crate::ban::{find_ban, Ban};
use crate::client::{Client, ClientId};
use crate::membership::{MemberFlags, Membership};
use bitflags::bitflags;

bitflags! {
    /// Flag-only channel modes plus the presence bits of parameter modes
    pub struct ChannelModes: u32 {
        const PRIVATE = 0x0000_0001;
        const SECRET = 0x0000_0002;
        const MODERATED = 0x0000_0004;
        const TOPICLIMIT = 0x0000_0008;
        const INVITEONLY = 0x0000_0010;
        const NOPRIVMSGS = 0x0000_0020;
        const KEY = 0x0000_0040;
        const LIMIT = 0x0000_0080;
        const REGONLY = 0x0000_0100;
        const DELJOINS = 0x0000_0200;
        /// Hidden joiners remain after `-D`
        const WASDELJOINS = 0x0000_0400;
        const NOQUITPARTS = 0x0000_0800;
        const NOCOLOUR = 0x0000_1000;
        const NOCTCP = 0x0000_2000;
        const NONOTICE = 0x0000_4000;
        const MODERATENOREG = 0x0000_8000;
        const SSLONLY = 0x0001_0000;
        /// Registered with channel services
        const REGISTERED = 0x0002_0000;
        const APASS = 0x0004_0000;
        const UPASS = 0x0008_0000;
    }
}

/// Current mode state of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMode {
    pub mode: ChannelModes,
    pub limit: u32,
    pub key: String,
    pub apass: String,
    pub upass: String,
}

impl Default for ChannelMode {
    fn default() -> Self {
        Self {
            mode: ChannelModes::empty(),
            limit: 0,
            key: String::new(),
            apass: String::new(),
            upass: String::new(),
        }
    }
}

/// Channel topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub setter: String,
    pub time: i64,
}

/// A pending invite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub user: ClientId,
    /// `nick!user@host` of the inviter
    pub inviter: String,
}

/// Who a mode listing is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeView {
    /// Real key and passwords, for BURST
    Burst,
    /// Real key, hidden passwords
    Member,
    /// Nothing secret
    Public,
}

/// Simple mode letters in display order
pub const SIMPLE_MODES: &[(ChannelModes, char)] = &[
    (ChannelModes::PRIVATE, 'p'),
    (ChannelModes::SECRET, 's'),
    (ChannelModes::MODERATED, 'm'),
    (ChannelModes::TOPICLIMIT, 't'),
    (ChannelModes::INVITEONLY, 'i'),
    (ChannelModes::NOPRIVMSGS, 'n'),
    (ChannelModes::REGONLY, 'r'),
    (ChannelModes::DELJOINS, 'D'),
    (ChannelModes::WASDELJOINS, 'd'),
    (ChannelModes::NOQUITPARTS, 'u'),
    (ChannelModes::NOCOLOUR, 'c'),
    (ChannelModes::NOCTCP, 'C'),
    (ChannelModes::NONOTICE, 'N'),
    (ChannelModes::MODERATENOREG, 'M'),
    (ChannelModes::SSLONLY, 'z'),
    (ChannelModes::REGISTERED, 'R'),
];

/// Letters for the flag-only part of `modes`, in display order
pub fn simple_mode_letters(modes: ChannelModes) -> String {
    SIMPLE_MODES
        .iter()
        .filter(|(flag, _)| modes.contains(*flag))
        .map(|(_, letter)| *letter)
        .collect()
}

/// An IRC channel
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Channel TS
    pub creationtime: i64,
    pub mode: ChannelMode,
    pub topic: Topic,
    pub members: Vec<Membership>,
    pub bans: Vec<Ban>,
    pub invites: Vec<Invite>,
}

impl Channel {
    pub fn new(name: &str, creationtime: i64) -> Self {
        Self {
            name: name.to_string(),
            creationtime,
            mode: ChannelMode::default(),
            topic: Topic::default(),
            members: Vec::new(),
            bans: Vec::new(),
            invites: Vec::new(),
        }
    }

    /// `&` channels never leave this server
    pub fn is_local(&self) -> bool {
        self.name.starts_with('&')
    }

    /// Member count, zombies included
    pub fn user_count(&self) -> usize {
        self.members.len()
    }

    /// Members that are not zombies
    pub fn active_members(&self) -> impl Iterator<Item = &Membership> {
        self.members.iter().filter(|m| !m.is_zombie())
    }

    pub fn member(&self, user: ClientId) -> Option<&Membership> {
        self.members.iter().find(|m| m.user == user)
    }

    pub fn member_mut(&mut self, user: ClientId) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.user == user)
    }

    /// Non-zombie membership of `user`
    pub fn active_member(&self, user: ClientId) -> Option<&Membership> {
        self.member(user).filter(|m| !m.is_zombie())
    }

    pub fn has_apass(&self) -> bool {
        !self.mode.apass.is_empty()
    }

    /// True when every remaining member is a zombie
    pub fn all_zombies(&self) -> bool {
        self.members.iter().all(Membership::is_zombie)
    }

    /// Any member still hidden by delayed join?
    pub fn has_delayed_members(&self) -> bool {
        self.members.iter().any(Membership::is_delayed)
    }

    /// Drop cached ban results after the ban list changed
    pub fn invalidate_ban_cache(&mut self) {
        for member in &mut self.members {
            member.status.remove(MemberFlags::BANVALID | MemberFlags::BANNED);
        }
    }

    /// Ban check with the per-member cache
    pub fn is_banned(&mut self, client: &Client) -> bool {
        let banned = find_ban(client, &self.bans).is_some();
        if let Some(member) = self.member_mut(client.id) {
            if member.status.contains(MemberFlags::BANVALID) {
                return member.status.contains(MemberFlags::BANNED);
            }
            member.status.insert(MemberFlags::BANVALID);
            member.status.set(MemberFlags::BANNED, banned);
        }
        banned
    }

    pub fn is_invited(&self, user: ClientId) -> bool {
        self.invites.iter().any(|i| i.user == user)
    }

    /// Mode string and its parameters
    pub fn mode_listing(&self, view: ModeView) -> (String, Vec<String>) {
        let mut letters = String::from("+");
        let mut params = Vec::new();
        let simple = match view {
            ModeView::Burst => self.mode.mode - ChannelModes::WASDELJOINS,
            _ => self.mode.mode,
        };
        letters.push_str(&simple_mode_letters(simple));

        if self.mode.mode.contains(ChannelModes::LIMIT) {
            letters.push('l');
            params.push(self.mode.limit.to_string());
        }
        if self.mode.mode.contains(ChannelModes::KEY) {
            letters.push('k');
            params.push(match view {
                ModeView::Burst | ModeView::Member => self.mode.key.clone(),
                ModeView::Public => "*".to_string(),
            });
        }
        if self.mode.mode.contains(ChannelModes::APASS) {
            letters.push('A');
            params.push(match view {
                ModeView::Burst => self.mode.apass.clone(),
                _ => "*".to_string(),
            });
        }
        if self.mode.mode.contains(ChannelModes::UPASS) {
            letters.push('U');
            params.push(match view {
                ModeView::Burst => self.mode.upass.clone(),
                _ => "*".to_string(),
            });
        }
        (letters, params)
    }
}
