//! Channel ban entries and the overlap algorithm

use crate::client::Client;
use crate::matching::{match_mask, mmatch, pretty_mask};
use bitflags::bitflags;
use ipnet::IpNet;
use std::net::IpAddr;

bitflags! {
    /// Ban bookkeeping flags
    pub struct BanFlags: u32 {
        /// Host part parsed as an address or CIDR block
        const IPMASK = 0x0001;
        /// Superseded by a more general ban; pending removal
        const OVERLAPPED = 0x0002;
        /// Arrived in the current BURST
        const BURSTED = 0x0004;
        /// Existed before a wipeout BURST; removed unless re-announced
        const BURST_WIPEOUT = 0x0008;
        /// Being added by the current operation
        const ADD = 0x0010;
        /// Being removed by the current operation
        const DEL = 0x0020;
    }
}

/// A channel ban
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    /// Normalised `nick!user@host` mask
    pub mask: String,
    /// Who set it
    pub who: String,
    /// When it was set
    pub when: i64,
    pub flags: BanFlags,
    /// Parsed host part when it is an address or CIDR
    pub addr: Option<IpNet>,
    /// Length of the `nick!user` part
    nu_len: usize,
}

impl Ban {
    /// Build a ban from an already normalised mask
    pub fn new(mask: String, who: impl Into<String>, when: i64) -> Self {
        let nu_len = mask.rfind('@').unwrap_or(mask.len());
        let addr = mask.get(nu_len + 1..).and_then(parse_ipmask);
        let mut flags = BanFlags::empty();
        if addr.is_some() {
            flags |= BanFlags::IPMASK;
        }
        Self {
            mask,
            who: who.into(),
            when,
            flags,
            addr,
            nu_len,
        }
    }

    /// Normalise a raw mask and build a ban from it
    pub fn from_raw(raw: &str, who: impl Into<String>, when: i64) -> Self {
        Self::new(pretty_mask(raw), who, when)
    }

    fn nick_user(&self) -> &str {
        &self.mask[..self.nu_len]
    }

    fn host(&self) -> &str {
        self.mask.get(self.nu_len + 1..).unwrap_or("")
    }

    /// True when every client matched by `other` is also matched by `self`
    pub fn covers(&self, other: &Ban) -> bool {
        match (self.addr, other.addr) {
            (Some(old), Some(new)) => {
                old.prefix_len() <= new.prefix_len()
                    && mmatch(self.nick_user(), other.nick_user())
                    && old.contains(&new.network())
            }
            _ => mmatch(&self.mask, &other.mask),
        }
    }

    /// Does this ban match the client?
    pub fn matches_client(&self, client: &Client) -> bool {
        let nu = format!("{}!{}", client.name, client.username);
        if !match_mask(self.nick_user(), &nu) {
            return false;
        }

        let host = self.host();
        if let (Some(net), Some(ip)) = (self.addr, client.ip) {
            if net.contains(&ip) {
                return true;
            }
        }
        if match_mask(host, &client.host) {
            return true;
        }
        match client.ip {
            Some(ip) => match_mask(host, &ip.to_string()),
            None => false,
        }
    }
}

fn parse_ipmask(host: &str) -> Option<IpNet> {
    if host.contains('*') || host.contains('?') {
        return None;
    }
    if let Ok(net) = host.parse::<IpNet>() {
        return Some(net.trunc());
    }
    host.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Outcome of inserting a ban change into a working list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanApply {
    /// Added; more specific entries were marked for removal
    Added,
    /// An existing, more general ban already covers it
    Redundant,
    /// Removal matched at least one entry
    Removed,
    /// Removal matched nothing
    NotFound,
}

/// Apply an add (`BanFlags::ADD`) or delete (`BanFlags::DEL`) to `list`.
///
/// Adding a ban covered by an active entry is a no-op. Adding a ban that
/// covers existing entries marks them `OVERLAPPED | DEL`. Deleting marks every
/// entry the mask covers.
pub fn apply_ban(list: &mut Vec<Ban>, mut newban: Ban) -> BanApply {
    if newban.flags.contains(BanFlags::DEL) {
        let mut removed = false;
        for ban in list.iter_mut() {
            if newban.covers(ban) {
                ban.flags |= BanFlags::OVERLAPPED | BanFlags::DEL;
                removed = true;
            }
        }
        return if removed { BanApply::Removed } else { BanApply::NotFound };
    }

    if list.iter().any(|ban| !ban.flags.contains(BanFlags::DEL) && ban.covers(&newban)) {
        return BanApply::Redundant;
    }

    for ban in list.iter_mut() {
        if !ban.flags.contains(BanFlags::DEL) && newban.covers(ban) {
            ban.flags |= BanFlags::OVERLAPPED | BanFlags::DEL;
        }
    }
    newban.flags.insert(BanFlags::ADD);
    list.push(newban);
    BanApply::Added
}

/// First ban in `list` matching the client
pub fn find_ban<'a>(client: &Client, list: &'a [Ban]) -> Option<&'a Ban> {
    list.iter().find(|ban| ban.matches_client(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(mask: &str) -> Ban {
        let mut ban = Ban::from_raw(mask, "op", 0);
        ban.flags |= BanFlags::ADD;
        ban
    }

    fn visible(list: &[Ban]) -> Vec<&str> {
        list.iter()
            .filter(|b| !b.flags.contains(BanFlags::DEL))
            .map(|b| b.mask.as_str())
            .collect()
    }

    #[test]
    fn test_general_ban_supersedes_specific() {
        let mut list = Vec::new();
        assert_eq!(apply_ban(&mut list, add("*!*@bad.example.com")), BanApply::Added);
        assert_eq!(apply_ban(&mut list, add("*!*@*.example.com")), BanApply::Added);
        assert_eq!(visible(&list), vec!["*!*@*.example.com"]);
        assert!(list[0].flags.contains(BanFlags::OVERLAPPED));
    }

    #[test]
    fn test_specific_ban_is_redundant() {
        let mut list = vec![Ban::from_raw("*!*@*.example.com", "op", 0)];
        assert_eq!(apply_ban(&mut list, add("*!*@bad.example.com")), BanApply::Redundant);
        assert_eq!(apply_ban(&mut list, add("*!*@*.example.com")), BanApply::Redundant);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_delete_marks_matches() {
        let mut list = vec![Ban::from_raw("*!*@a.example.com", "op", 0), Ban::from_raw("nick", "op", 0)];
        let mut del = Ban::from_raw("*!*@*.example.com", "op", 0);
        del.flags |= BanFlags::DEL;
        assert_eq!(apply_ban(&mut list, del), BanApply::Removed);
        assert_eq!(visible(&list), vec!["nick!*@*"]);

        let mut del = Ban::from_raw("other", "op", 0);
        del.flags |= BanFlags::DEL;
        assert_eq!(apply_ban(&mut list, del), BanApply::NotFound);
    }

    #[test]
    fn test_cidr_overlap() {
        let wide = Ban::from_raw("*!*@10.0.0.0/8", "op", 0);
        let narrow = Ban::from_raw("*!*@10.1.2.0/24", "op", 0);
        let single = Ban::from_raw("*!*@10.1.2.3", "op", 0);
        assert!(wide.flags.contains(BanFlags::IPMASK));
        assert!(wide.covers(&narrow));
        assert!(narrow.covers(&single));
        assert!(!narrow.covers(&wide));
    }

    #[test]
    fn test_no_two_visible_entries_overlap() {
        let masks = ["a!*@*", "*!*@h1", "*!*@*", "b!c@d", "*!*@h?"];
        let mut list = Vec::new();
        for m in masks {
            apply_ban(&mut list, add(m));
        }
        let live: Vec<&Ban> = list.iter().filter(|b| !b.flags.contains(BanFlags::DEL)).collect();
        for (i, a) in live.iter().enumerate() {
            for (j, b) in live.iter().enumerate() {
                if i != j {
                    assert!(!a.covers(b), "{} covers {}", a.mask, b.mask);
                }
            }
        }
        assert_eq!(live.len(), 1);
    }
}
