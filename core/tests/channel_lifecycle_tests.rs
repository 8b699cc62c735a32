//! Channel lifecycle tests
//!
//! A channel from CREATE through mode changes and parts to its destruct
//! event, checked against what each server and client is sent.

use tsircd_core::{
    mode_parse, ChannelModes, ClientId, Config, ConnId, GetChannel, JoinBuf, JoinType, MemberFlags, ModeBuf,
    ModeBufDest, ParseFlags, State,
};

const LINK: ConnId = 20;

struct Net {
    st: State,
    alice: ClientId,
    bob: ClientId,
}

fn net(now: i64) -> Net {
    let mut st = State::with_fixed_clock(Config::default(), now);
    let me = st.me();
    let alice = st.clients.add_local_user("alice", "a", "h", None, "A", 10, now).unwrap();
    let bob = st.clients.add_local_user("bob", "b", "h", None, "B", 11, now).unwrap();
    st.clients
        .add_server(me, "leaf.example.net", "AC", "leaf", Some(LINK), now)
        .unwrap();
    Net { st, alice, bob }
}

impl Net {
    fn join(&mut self, user: ClientId, name: &str, kind: JoinType) {
        let now = self.st.now();
        self.st.channels.get_channel(name, GetChannel::Create, now);
        let flags = if kind == JoinType::Create {
            MemberFlags::CHANOP
        } else {
            MemberFlags::empty()
        };
        let mut jbuf = JoinBuf::new(user, None, kind, None, now);
        jbuf.join(&mut self.st, name, flags);
        jbuf.flush(&mut self.st);
    }

    fn part(&mut self, user: ClientId, name: &str) {
        let now = self.st.now();
        let status = self.st.channels.find_member_link(name, user).unwrap().status;
        let mut jbuf = JoinBuf::new(user, None, JoinType::Part, Some("bye"), now);
        jbuf.join(&mut self.st, name, status);
        jbuf.flush(&mut self.st);
    }

    /// MODE from a local user, as the command handler runs it
    fn mode(&mut self, user: ClientId, name: &str, args: &[&str]) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut flags = ParseFlags::SET;
        match self.st.channels.find_member_link(name, user) {
            Some(member) if !member.is_chanop() => flags |= ParseFlags::NOTOPER,
            None => flags |= ParseFlags::NOTMEMBER,
            _ => {}
        }
        let mut mbuf = ModeBuf::new(user, None, name, ModeBufDest::CHANNEL | ModeBufDest::SERVER);
        mode_parse(&mut self.st, Some(&mut mbuf), user, name, &args, flags, Some(user));
        mbuf.flush(&mut self.st);
    }

    fn link_lines(&self) -> Vec<&str> {
        self.st.outbox.lines_for(LINK)
    }

    fn clear(&mut self) {
        self.st.outbox.drain();
    }
}

#[test]
fn test_create_modes_part_destruct() {
    let mut n = net(1000);
    let (alice, bob) = (n.alice, n.bob);

    n.join(alice, "#life", JoinType::Create);
    assert_eq!(n.link_lines(), vec!["ABAAA C #life 1000"]);
    n.join(bob, "#life", JoinType::Join);
    assert_eq!(n.link_lines()[1], "ABAAB J #life 1000");
    n.clear();

    n.mode(alice, "#life", &["+ntk", "sekrit"]);
    assert_eq!(n.link_lines(), vec!["ABAAA M #life +tnk sekrit 1000"]);
    assert!(n.st.outbox.lines_for(11)[0].starts_with(":alice!a@h MODE #life +tnk"));
    n.clear();

    // Not an op yet: one refusal, nothing sent on
    n.mode(bob, "#life", &["+im"]);
    let refusals: Vec<&str> = n
        .st
        .outbox
        .lines_for(11)
        .into_iter()
        .filter(|l| l.contains(" 482 "))
        .collect();
    assert_eq!(refusals.len(), 1);
    assert!(n.link_lines().is_empty());

    n.mode(alice, "#life", &["+bo", "*!*@spam.example", "bob"]);
    n.mode(bob, "#life", &["+i"]);
    {
        let chan = n.st.channels.get("#life").unwrap();
        assert!(chan.mode.mode.contains(ChannelModes::INVITEONLY | ChannelModes::NOPRIVMSGS | ChannelModes::KEY));
        assert_eq!(chan.bans.len(), 1);
        assert!(chan.member(bob).unwrap().is_chanop());
    }
    n.clear();

    n.part(alice, "#life");
    n.part(bob, "#life");
    assert_eq!(n.link_lines(), vec!["ABAAA L #life bye", "ABAAB L #life bye"]);
    {
        // Empty but kept for a while: the ops could come back
        let chan = n.st.channels.get("#life").unwrap();
        assert!(chan.mode.mode.is_empty());
        assert!(chan.mode.key.is_empty());
        assert!(chan.bans.is_empty());
    }
    assert_eq!(n.st.channels.destruct_event_time("#life"), Some(1060));
    n.clear();

    n.st.set_clock(1059);
    n.st.exec_expired_destruct_events();
    assert!(n.st.channels.get("#life").is_some());
    assert!(n.st.outbox.is_empty());

    n.st.set_clock(1060);
    n.st.exec_expired_destruct_events();
    assert!(n.st.channels.get("#life").is_none());
    assert_eq!(n.link_lines(), vec!["AB DE #life 1000"]);
}

#[test]
fn test_old_channel_waits_long_and_rejoin_cancels() {
    let mut n = net(1000);
    let (alice, bob) = (n.alice, n.bob);
    n.join(alice, "#old", JoinType::Create);

    let later = 1000 + 200_000;
    n.st.set_clock(later);
    n.part(alice, "#old");
    let delay = n.st.config.channels.destruct_delay_long;
    assert_eq!(n.st.channels.destruct_event_time("#old"), Some(later + delay));

    n.join(bob, "#old", JoinType::Join);
    assert_eq!(n.st.channels.destruct_event_time("#old"), None);
    n.st.set_clock(later + delay + 1);
    n.st.exec_expired_destruct_events();
    assert!(n.st.channels.get("#old").unwrap().member(bob).is_some());
}

#[test]
fn test_apass_channel_keeps_its_modes_when_empty() {
    let mut n = net(1000);
    let alice = n.alice;
    n.join(alice, "#kept", JoinType::Create);
    {
        let chan = n.st.channels.get_mut("#kept").unwrap();
        chan.mode.apass = "adminpass".to_string();
        chan.mode.key = "door".to_string();
        chan.mode.limit = 5;
        chan.mode.mode |= ChannelModes::APASS
            | ChannelModes::KEY
            | ChannelModes::NOPRIVMSGS
            | ChannelModes::INVITEONLY
            | ChannelModes::LIMIT;
    }
    n.part(alice, "#kept");

    let chan = n.st.channels.get("#kept").unwrap();
    assert!(chan.mode.mode.contains(ChannelModes::APASS | ChannelModes::KEY | ChannelModes::NOPRIVMSGS));
    assert!(!chan.mode.mode.intersects(ChannelModes::INVITEONLY | ChannelModes::LIMIT));
    assert_eq!(chan.mode.key, "door");
    assert!(n.st.channels.destruct_event_time("#kept").is_some());
}

#[test]
fn test_local_channel_destruct_stays_local() {
    let mut n = net(1000);
    let alice = n.alice;
    n.join(alice, "&here", JoinType::Create);
    n.part(alice, "&here");
    assert!(n.link_lines().is_empty());

    n.st.set_clock(5000);
    n.st.exec_expired_destruct_events();
    assert!(n.st.channels.get("&here").is_none());
    assert!(n.link_lines().is_empty());
}
