//! Netsplit recovery tests
//!
//! Two servers that split and rejoin exchange net bursts; these tests feed
//! each side's burst into the other and check where the channels end up.

use tsircd_core::burst::channel_burst_lines;
use tsircd_core::channel::Channel;
use tsircd_core::membership::MAXOPLEVEL;
use tsircd_core::wire::BUFSIZE;
use tsircd_core::{
    process_burst, send_net_burst, Ban, ChannelModes, ClientFlags, ClientId, Config, ConnId, GetChannel, MemberFlags,
    Message, MessageType, State,
};

const LINK: ConnId = 20;
const NOW: i64 = 5000;

/// One side of the link
struct Side {
    st: State,
    peer: ClientId,
}

fn hub() -> Side {
    side(Config::default(), "leaf.example.net", "AC")
}

fn leaf() -> Side {
    let mut config = Config::default();
    config.server.name = "leaf.example.net".to_string();
    config.server.numeric = 2;
    side(config, "irc.example.net", "AB")
}

fn side(config: Config, peer_name: &str, peer_numeric: &str) -> Side {
    let mut st = State::with_fixed_clock(config, NOW);
    let me = st.me();
    let peer = st
        .clients
        .add_server(me, peer_name, peer_numeric, "peer", Some(LINK), 900)
        .unwrap();
    Side { st, peer }
}

impl Side {
    /// Local user here, already introduced on `other`
    fn user(&mut self, other: &mut Side, nick: &str, conn: ConnId) -> ClientId {
        let id = self
            .st
            .clients
            .add_local_user(nick, "u", "h.example", None, nick, conn, 900)
            .unwrap();
        let numeric = self.st.clients.numeric(id).to_string();
        let peer = other.peer;
        other
            .st
            .clients
            .add_remote_user(peer, &numeric, nick, "u", "h.example", None, nick, None, ClientFlags::empty(), 900)
            .unwrap();
        id
    }

    fn channel(&mut self, name: &str, ts: i64) -> &mut Channel {
        let chan = self.st.channels.get_channel(name, GetChannel::Create, ts).unwrap();
        chan.creationtime = ts;
        chan
    }

    fn join(&mut self, name: &str, nick: &str, status: MemberFlags) {
        let user = self.id(nick);
        assert!(self.st.channels.add_user_to_channel(name, user, status, MAXOPLEVEL));
    }

    fn id(&self, nick: &str) -> ClientId {
        self.st.clients.find_user(nick).unwrap()
    }

    fn member_status(&self, name: &str, nick: &str) -> Option<(bool, bool)> {
        let user = self.st.clients.find_user(nick)?;
        let member = self.st.channels.find_member_link(name, user)?;
        Some((member.is_chanop(), member.has_voice()))
    }

    fn sorted_bans(&self, name: &str) -> Vec<String> {
        let mut bans: Vec<String> = self
            .st
            .channels
            .get(name)
            .unwrap()
            .bans
            .iter()
            .map(|b| b.mask.clone())
            .collect();
        bans.sort();
        bans
    }

    /// Everything queued for the link, draining the whole outbox
    fn take_link_lines(&mut self) -> Vec<String> {
        self.st
            .outbox
            .drain()
            .into_iter()
            .filter(|o| o.conn == LINK)
            .map(|o| o.line)
            .collect()
    }

    /// Apply the BURST lines among `lines` as if they came from the peer
    fn receive(&mut self, lines: &[String]) {
        for line in lines {
            let msg = Message::parse_p10(line).unwrap();
            if msg.command == MessageType::Burst {
                let peer = self.peer;
                process_burst(&mut self.st, peer, LINK, &msg);
            }
        }
    }
}

/// Both sides burst at once, then each applies what the other sent
fn exchange(a: &mut Side, b: &mut Side) {
    send_net_burst(&mut a.st, LINK);
    send_net_burst(&mut b.st, LINK);
    let to_b = a.take_link_lines();
    let to_a = b.take_link_lines();
    assert_eq!(to_b.last().map(String::as_str), Some("AB EB"));
    assert_eq!(to_a.last().map(String::as_str), Some("AC EB"));
    b.receive(&to_b);
    a.receive(&to_a);
}

#[test]
fn test_equal_ts_rejoin_merges_both_sides() {
    let (mut a, mut b) = (hub(), leaf());
    a.user(&mut b, "alice", 10);
    b.user(&mut a, "bob", 10);

    let chan = a.channel("#merge", 1000);
    chan.mode.mode |= ChannelModes::NOPRIVMSGS;
    chan.bans.push(Ban::new("*!*@a.example".into(), "alice", 950));
    a.join("#merge", "alice", MemberFlags::CHANOP);

    let chan = b.channel("#merge", 1000);
    chan.mode.mode |= ChannelModes::TOPICLIMIT;
    chan.bans.push(Ban::new("*!*@b.example".into(), "bob", 960));
    b.join("#merge", "bob", MemberFlags::VOICE);

    exchange(&mut a, &mut b);

    for side in [&a, &b] {
        let chan = side.st.channels.get("#merge").unwrap();
        assert_eq!(chan.creationtime, 1000);
        assert_eq!(chan.mode.mode, ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT);
        assert_eq!(chan.members.len(), 2);
        assert_eq!(side.member_status("#merge", "alice"), Some((true, false)));
        assert_eq!(side.member_status("#merge", "bob"), Some((false, true)));
        assert_eq!(side.sorted_bans("#merge"), vec!["*!*@a.example", "*!*@b.example"]);
    }
    assert_eq!(
        a.st.channels.get("#merge").unwrap().mode.mode,
        b.st.channels.get("#merge").unwrap().mode.mode
    );
}

#[test]
fn test_older_side_wins_and_kicks_net_riders() {
    let (mut a, mut b) = (hub(), leaf());
    a.user(&mut b, "alice", 10);
    let dave = a.user(&mut b, "dave", 11);
    a.st.clients.get_mut(dave).unwrap().flags.insert(ClientFlags::OPER);
    b.user(&mut a, "bob", 10);

    // During the split alice created #split on the hub
    let chan = a.channel("#split", 2000);
    chan.mode.mode |= ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT;
    chan.bans.push(Ban::new("*!*@old.example".into(), "alice", 2000));
    a.join("#split", "alice", MemberFlags::CHANOP);
    a.join("#split", "dave", MemberFlags::empty());

    // The original channel lived on behind the leaf, invite only
    let chan = b.channel("#split", 1000);
    chan.mode.mode |= ChannelModes::INVITEONLY;
    b.join("#split", "bob", MemberFlags::CHANOP);

    exchange(&mut a, &mut b);

    let chan = a.st.channels.get("#split").unwrap();
    assert_eq!(chan.creationtime, 1000);
    assert!(chan.mode.mode.contains(ChannelModes::INVITEONLY));
    assert!(!chan
        .mode
        .mode
        .intersects(ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT));
    assert!(chan.bans.is_empty());
    assert_eq!(a.member_status("#split", "alice"), None);
    assert_eq!(a.member_status("#split", "dave"), Some((false, false)));
    assert_eq!(a.member_status("#split", "bob"), Some((true, false)));
    assert!(a
        .st
        .outbox
        .lines_for(LINK)
        .contains(&"AB K #split ABAAA :Net Rider"));
    assert!(a
        .st
        .outbox
        .lines_for(10)
        .iter()
        .any(|l| l.contains("KICK #split alice :Net Rider")));

    // The leaf keeps its older channel
    let chan = b.st.channels.get("#split").unwrap();
    assert_eq!(chan.creationtime, 1000);
    assert!(chan.mode.mode.contains(ChannelModes::INVITEONLY));
    assert_eq!(b.member_status("#split", "bob"), Some((true, false)));
    assert!(b.member_status("#split", "dave").is_some());
}

#[test]
fn test_channel_only_on_one_side_is_created_with_its_ts() {
    let (mut a, mut b) = (hub(), leaf());
    a.user(&mut b, "alice", 10);
    let chan = a.channel("#solo", 1234);
    chan.mode.mode |= ChannelModes::MODERATED;
    chan.mode.limit = 15;
    chan.mode.mode |= ChannelModes::LIMIT;
    a.join("#solo", "alice", MemberFlags::CHANOP | MemberFlags::VOICE);

    exchange(&mut a, &mut b);

    let chan = b.st.channels.get("#solo").unwrap();
    assert_eq!(chan.creationtime, 1234);
    assert!(chan.mode.mode.contains(ChannelModes::MODERATED | ChannelModes::LIMIT));
    assert_eq!(chan.mode.limit, 15);
    assert_eq!(b.member_status("#solo", "alice"), Some((true, true)));
}

#[test]
fn test_zannel_inside_slop_keeps_its_modes() {
    let (mut a, mut b) = (hub(), leaf());
    b.user(&mut a, "bob", 10);

    // Empty channels kept alive here, slightly younger and much younger
    a.channel("#near", 1003).mode.mode |= ChannelModes::NOPRIVMSGS;
    a.channel("#far", 1010).mode.mode |= ChannelModes::NOPRIVMSGS;

    a.receive(&[
        "AC B #near 1000 +t ACAAA:o".to_string(),
        "AC B #far 1000 +t ACAAA:o".to_string(),
    ]);

    let near = a.st.channels.get("#near").unwrap();
    assert_eq!(near.creationtime, 1000);
    assert_eq!(near.mode.mode, ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT);

    let far = a.st.channels.get("#far").unwrap();
    assert_eq!(far.creationtime, 1000);
    assert_eq!(far.mode.mode, ChannelModes::TOPICLIMIT);

    for name in ["#near", "#far"] {
        assert_eq!(a.member_status(name, "bob"), Some((true, false)));
    }
}

#[test]
fn test_large_channel_bursts_over_several_lines() {
    let (mut a, mut b) = (hub(), leaf());
    let count = 300;
    for i in 0..count {
        a.user(&mut b, &format!("user{}", i), 100 + i as ConnId);
    }
    b.user(&mut a, "bob", 10);

    a.channel("#big", 1000);
    for i in 0..count {
        let status = match i % 3 {
            0 => MemberFlags::CHANOP,
            1 => MemberFlags::VOICE,
            _ => MemberFlags::empty(),
        };
        a.join("#big", &format!("user{}", i), status);
    }
    b.channel("#big", 1000);
    b.join("#big", "bob", MemberFlags::CHANOP);

    let lines: Vec<String> = channel_burst_lines(&a.st, "#big")
        .iter()
        .map(|m| m.to_string())
        .collect();
    assert!(lines.len() > 1);
    for line in &lines {
        assert!(line.len() + 2 <= BUFSIZE, "{} bytes", line.len());
        assert!(line.starts_with("AB B #big 1000 "));
    }

    b.receive(&lines);
    let chan = b.st.channels.get("#big").unwrap();
    assert_eq!(chan.members.len(), count + 1);
    for i in 0..count {
        let expected = match i % 3 {
            0 => (true, false),
            1 => (false, true),
            _ => (false, false),
        };
        assert_eq!(b.member_status("#big", &format!("user{}", i)), Some(expected), "user{}", i);
    }
    assert_eq!(b.member_status("#big", "bob"), Some((true, false)));
    assert!(b.st.outbox.lines_for(10).iter().any(|l| l.starts_with(":user0!u@h.example JOIN #big")));

    // A repeated burst changes nothing and tells nobody
    b.st.outbox.drain();
    b.receive(&lines);
    assert!(b.st.outbox.is_empty());
    assert_eq!(b.st.channels.get("#big").unwrap().members.len(), count + 1);
}
