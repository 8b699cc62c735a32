//! Channel registry: name index, membership axes and deferred destruction
//!
//! Channels own their [`Membership`] records; the registry keeps the
//! reverse index (user to channels) and the destruct event queue for empty
//! channels.

use crate::channel::{Channel, ChannelModes, Invite};
use crate::client::ClientId;
use crate::config::{Capabilities, ChannelConfig};
use crate::matching::irc_lower;
use crate::membership::{MemberFlags, Membership};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// What `get_channel` does when the channel is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetChannel {
    Lookup,
    Create,
}

/// What happened to a channel that lost a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sub1Outcome {
    /// Still has members
    Alive,
    /// Emptied and freed
    Destructed,
    /// Emptied; a destruct event is pending
    Scheduled,
}

/// Every channel on the network, as seen from this server
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    user_channels: HashMap<ClientId, BTreeSet<String>>,
    user_invites: HashMap<ClientId, BTreeSet<String>>,
    destruct_queue: BTreeSet<(i64, String)>,
    destruct_times: HashMap<String, i64>,
    delay_short: i64,
    delay_long: i64,
    oplevels: bool,
}

impl ChannelRegistry {
    pub fn new(config: &ChannelConfig, caps: Capabilities) -> Self {
        Self {
            channels: HashMap::new(),
            user_channels: HashMap::new(),
            user_invites: HashMap::new(),
            destruct_queue: BTreeSet::new(),
            destruct_times: HashMap::new(),
            delay_short: config.destruct_delay_short,
            delay_long: config.destruct_delay_long,
            oplevels: caps.contains(Capabilities::OPLEVELS),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&irc_lower(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&irc_lower(name))
    }

    /// Look a channel up, creating it with TS `now` when asked
    pub fn get_channel(&mut self, name: &str, cgt: GetChannel, now: i64) -> Option<&mut Channel> {
        let key = irc_lower(name);
        if cgt == GetChannel::Create && !self.channels.contains_key(&key) {
            debug!("Creating channel {} with TS {}", name, now);
            self.channels.insert(key.clone(), Channel::new(name, now));
        }
        self.channels.get_mut(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Channel names sorted, for stable iteration
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels `user` is on, zombie memberships included
    pub fn channels_of(&self, user: ClientId) -> Vec<String> {
        self.user_channels
            .get(&user)
            .map(|set| {
                set.iter()
                    .filter_map(|key| self.channels.get(key))
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of channels `user` is on
    pub fn channel_count(&self, user: ClientId) -> usize {
        self.user_channels.get(&user).map_or(0, BTreeSet::len)
    }

    /// Add a membership. Returns false when the channel is unknown or the
    /// user is already on it.
    pub fn add_user_to_channel(&mut self, name: &str, user: ClientId, status: MemberFlags, oplevel: u16) -> bool {
        let key = irc_lower(name);
        let Some(channel) = self.channels.get_mut(&key) else {
            return false;
        };
        if channel.member(user).is_some() {
            return false;
        }
        channel.members.push(Membership::new(user, status, oplevel));
        self.user_channels.entry(user).or_default().insert(key.clone());
        self.remove_destruct_event(&key);
        true
    }

    /// Remove a membership and run the empty-channel rules
    pub fn remove_user_from_channel(&mut self, name: &str, user: ClientId, now: i64) -> Option<(Membership, Sub1Outcome)> {
        let key = irc_lower(name);
        let channel = self.channels.get_mut(&key)?;
        let idx = channel.members.iter().position(|m| m.user == user)?;
        let member = channel.members.remove(idx);

        if let Some(set) = self.user_channels.get_mut(&user) {
            set.remove(&key);
            if set.is_empty() {
                self.user_channels.remove(&user);
            }
        }
        self.del_invite(&key, user);

        let outcome = self.sub1_from_channel(&key, now);
        Some((member, outcome))
    }

    /// Empty-channel rules run after a member leaves
    fn sub1_from_channel(&mut self, key: &str, now: i64) -> Sub1Outcome {
        let Some(channel) = self.channels.get_mut(key) else {
            return Sub1Outcome::Destructed;
        };
        if !channel.members.is_empty() {
            return Sub1Outcome::Alive;
        }

        channel.mode.mode.remove(ChannelModes::INVITEONLY | ChannelModes::LIMIT);
        channel.mode.limit = 0;

        if !channel.has_apass() {
            channel.mode.mode = ChannelModes::empty();
            channel.mode.key.clear();
            channel.mode.upass.clear();
            channel.bans.clear();
            let invited: Vec<ClientId> = channel.invites.drain(..).map(|i| i.user).collect();
            for user in invited {
                if let Some(set) = self.user_invites.get_mut(&user) {
                    set.remove(key);
                }
            }

            if !self.oplevels {
                self.destruct_channel(key);
                return Sub1Outcome::Destructed;
            }
        }

        self.schedule_empty_destruct(key, now);
        Sub1Outcome::Scheduled
    }

    /// Schedule destruction of an empty channel: soon when it is young,
    /// after the long delay otherwise
    pub fn schedule_empty_destruct(&mut self, name: &str, now: i64) {
        let key = irc_lower(name);
        let creationtime = self.channels.get(&key).map_or(now, |c| c.creationtime);
        if now - creationtime < self.delay_long {
            self.schedule_destruct_event(&key, now + self.delay_short);
        } else {
            self.schedule_destruct_event(&key, now + self.delay_long);
        }
    }

    /// Membership of `user` on `name`
    pub fn find_member_link(&self, name: &str, user: ClientId) -> Option<&Membership> {
        self.get(name).and_then(|c| c.member(user))
    }

    pub fn find_member_link_mut(&mut self, name: &str, user: ClientId) -> Option<&mut Membership> {
        self.get_mut(name).and_then(|c| c.member_mut(user))
    }

    /// Flag a membership as zombie
    pub fn set_zombie(&mut self, name: &str, user: ClientId) -> bool {
        match self.find_member_link_mut(name, user) {
            Some(member) => {
                member.status.insert(MemberFlags::ZOMBIE);
                member.status.remove(MemberFlags::DELAYED);
                true
            }
            None => false,
        }
    }

    /// Every member of the channel is a zombie
    pub fn channel_all_zombies(&self, name: &str) -> bool {
        self.get(name).map_or(false, Channel::all_zombies)
    }

    /// Record an invite
    pub fn add_invite(&mut self, name: &str, user: ClientId, inviter: &str) -> bool {
        let key = irc_lower(name);
        let Some(channel) = self.channels.get_mut(&key) else {
            return false;
        };
        if !channel.is_invited(user) {
            channel.invites.push(Invite {
                user,
                inviter: inviter.to_string(),
            });
        }
        self.user_invites.entry(user).or_default().insert(key);
        true
    }

    fn del_invite(&mut self, key: &str, user: ClientId) {
        if let Some(channel) = self.channels.get_mut(key) {
            channel.invites.retain(|i| i.user != user);
        }
        if let Some(set) = self.user_invites.get_mut(&user) {
            set.remove(key);
            if set.is_empty() {
                self.user_invites.remove(&user);
            }
        }
    }

    /// Drop one invite
    pub fn remove_invite(&mut self, name: &str, user: ClientId) {
        self.del_invite(&irc_lower(name), user);
    }

    /// Drop every invite on a channel
    pub fn clear_invites(&mut self, name: &str) {
        let key = irc_lower(name);
        let users: Vec<ClientId> = match self.channels.get_mut(&key) {
            Some(channel) => channel.invites.drain(..).map(|i| i.user).collect(),
            None => return,
        };
        for user in users {
            if let Some(set) = self.user_invites.get_mut(&user) {
                set.remove(&key);
            }
        }
    }

    /// Forget every invite held by a departing user
    pub fn forget_user_invites(&mut self, user: ClientId) {
        if let Some(keys) = self.user_invites.remove(&user) {
            for key in keys {
                if let Some(channel) = self.channels.get_mut(&key) {
                    channel.invites.retain(|i| i.user != user);
                }
            }
        }
    }

    fn schedule_destruct_event(&mut self, key: &str, when: i64) {
        self.remove_destruct_event(key);
        debug!("Scheduling destruct of {} at {}", key, when);
        self.destruct_queue.insert((when, key.to_string()));
        self.destruct_times.insert(key.to_string(), when);
    }

    /// Cancel a pending destruct event
    pub fn remove_destruct_event(&mut self, name: &str) {
        let key = irc_lower(name);
        if let Some(when) = self.destruct_times.remove(&key) {
            self.destruct_queue.remove(&(when, key));
        }
    }

    /// Time the pending destruct event fires
    pub fn destruct_event_time(&self, name: &str) -> Option<i64> {
        self.destruct_times.get(&irc_lower(name)).copied()
    }

    /// Fire every due destruct event. Channels that regained members are
    /// skipped. Returns the name and TS of each destructed channel.
    pub fn exec_expired_destruct_events(&mut self, now: i64) -> Vec<(String, i64)> {
        let mut destructed = Vec::new();
        while let Some((when, key)) = self.destruct_queue.iter().next().cloned() {
            if when > now {
                break;
            }
            self.destruct_queue.remove(&(when, key.clone()));
            self.destruct_times.remove(&key);

            let info = match self.channels.get(&key) {
                Some(channel) if channel.members.is_empty() => (channel.name.clone(), channel.creationtime),
                _ => continue,
            };
            self.destruct_channel(&key);
            destructed.push(info);
        }
        destructed
    }

    /// Free a channel and everything it owns
    pub fn destruct_channel(&mut self, name: &str) -> Option<Channel> {
        let key = irc_lower(name);
        self.remove_destruct_event(&key);
        let channel = self.channels.remove(&key)?;
        for member in &channel.members {
            if let Some(set) = self.user_channels.get_mut(&member.user) {
                set.remove(&key);
            }
        }
        for invite in &channel.invites {
            if let Some(set) = self.user_invites.get_mut(&invite.user) {
                set.remove(&key);
            }
        }
        debug!("Destructed channel {}", channel.name);
        Some(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MAXOPLEVEL;

    fn registry(oplevels: bool) -> ChannelRegistry {
        let caps = if oplevels { Capabilities::OPLEVELS } else { Capabilities::empty() };
        ChannelRegistry::new(&ChannelConfig::default(), caps)
    }

    #[test]
    fn test_membership_round_trip() {
        let mut reg = registry(true);
        reg.get_channel("#Test", GetChannel::Create, 1000);
        assert!(reg.add_user_to_channel("#test", ClientId(1), MemberFlags::CHANOP, MAXOPLEVEL));
        let before = reg.get("#test").unwrap().members.clone();

        assert!(reg.add_user_to_channel("#TEST", ClientId(2), MemberFlags::empty(), MAXOPLEVEL));
        assert!(!reg.add_user_to_channel("#test", ClientId(2), MemberFlags::empty(), MAXOPLEVEL));
        let (member, outcome) = reg.remove_user_from_channel("#test", ClientId(2), 1000).unwrap();
        assert_eq!(member.user, ClientId(2));
        assert_eq!(outcome, Sub1Outcome::Alive);

        assert_eq!(reg.get("#test").unwrap().members, before);
        assert_eq!(reg.channels_of(ClientId(2)), Vec::<String>::new());
        assert_eq!(reg.channels_of(ClientId(1)), vec!["#Test".to_string()]);
    }

    #[test]
    fn test_empty_channel_without_oplevels_is_destructed() {
        let mut reg = registry(false);
        reg.get_channel("#gone", GetChannel::Create, 1000);
        reg.add_user_to_channel("#gone", ClientId(1), MemberFlags::CHANOP, MAXOPLEVEL);
        let (_, outcome) = reg.remove_user_from_channel("#gone", ClientId(1), 1010).unwrap();
        assert_eq!(outcome, Sub1Outcome::Destructed);
        assert!(reg.get("#gone").is_none());
    }

    #[test]
    fn test_destruct_delays() {
        let mut reg = registry(true);
        reg.get_channel("#young", GetChannel::Create, 1000);
        reg.add_user_to_channel("#young", ClientId(1), MemberFlags::empty(), MAXOPLEVEL);
        let (_, outcome) = reg.remove_user_from_channel("#young", ClientId(1), 1010).unwrap();
        assert_eq!(outcome, Sub1Outcome::Scheduled);
        assert_eq!(reg.destruct_event_time("#young"), Some(1070));

        reg.get_channel("#old", GetChannel::Create, 0);
        {
            let chan = reg.get_mut("#old").unwrap();
            chan.mode.apass = "pass".into();
            chan.mode.mode |= ChannelModes::APASS | ChannelModes::INVITEONLY;
        }
        reg.add_user_to_channel("#old", ClientId(1), MemberFlags::empty(), MAXOPLEVEL);
        reg.remove_user_from_channel("#old", ClientId(1), 200_000).unwrap();
        assert_eq!(reg.destruct_event_time("#old"), Some(200_000 + 172_800));
        let chan = reg.get("#old").unwrap();
        assert!(chan.mode.mode.contains(ChannelModes::APASS));
        assert!(!chan.mode.mode.contains(ChannelModes::INVITEONLY));

        let expired = reg.exec_expired_destruct_events(1070);
        assert_eq!(expired, vec![("#young".to_string(), 1000)]);
        assert!(reg.get("#young").is_none());
        assert!(reg.get("#old").is_some());
    }

    #[test]
    fn test_rejoin_cancels_destruct() {
        let mut reg = registry(true);
        reg.get_channel("#c", GetChannel::Create, 1000);
        reg.add_user_to_channel("#c", ClientId(1), MemberFlags::empty(), MAXOPLEVEL);
        reg.remove_user_from_channel("#c", ClientId(1), 1000);
        assert!(reg.destruct_event_time("#c").is_some());
        reg.add_user_to_channel("#c", ClientId(2), MemberFlags::empty(), MAXOPLEVEL);
        assert!(reg.destruct_event_time("#c").is_none());
        assert!(reg.exec_expired_destruct_events(i64::MAX).is_empty());
    }

    #[test]
    fn test_invites_follow_both_axes() {
        let mut reg = registry(true);
        reg.get_channel("#c", GetChannel::Create, 1000);
        reg.add_user_to_channel("#c", ClientId(1), MemberFlags::CHANOP, MAXOPLEVEL);
        assert!(reg.add_invite("#c", ClientId(5), "op!o@h"));
        assert!(reg.get("#c").unwrap().is_invited(ClientId(5)));
        reg.forget_user_invites(ClientId(5));
        assert!(!reg.get("#c").unwrap().is_invited(ClientId(5)));

        reg.add_invite("#c", ClientId(6), "op!o@h");
        reg.clear_invites("#c");
        assert!(reg.get("#c").unwrap().invites.is_empty());
    }
}
