//! Channel membership records

use crate::client::ClientId;
use bitflags::bitflags;

/// Least senior oplevel; also the level given by plain op grants
pub const MAXOPLEVEL: u16 = 999;

bitflags! {
    /// Status of a user on a channel
    pub struct MemberFlags: u32 {
        const CHANOP = 0x0001;
        const VOICE = 0x0002;
        /// Channel owner (+q)
        const OWNER = 0x0004;
        /// Joined without ops; ops must be bounced
        const DEOPPED = 0x0008;
        /// Kicked, removal still in flight
        const ZOMBIE = 0x0010;
        /// Joined by the BURST being processed
        const BURST_JOINED = 0x0020;
        /// `BANNED` holds a cached result
        const BANVALID = 0x0040;
        /// Cached ban match
        const BANNED = 0x0080;
        /// Already opped before the current BURST
        const BURST_ALREADY_OPPED = 0x0100;
        /// Already voiced before the current BURST
        const BURST_ALREADY_VOICED = 0x0200;
        /// Hidden by delayed join until they speak or get a status
        const DELAYED = 0x0400;
        /// PART is being processed
        const USER_PARTING = 0x0800;
        /// Joined with the Apass
        const CHANNEL_MANAGER = 0x1000;
    }
}

/// One user's relationship to one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub user: ClientId,
    pub status: MemberFlags,
    /// 0 is most senior
    pub oplevel: u16,
}

impl Membership {
    pub fn new(user: ClientId, status: MemberFlags, oplevel: u16) -> Self {
        Self {
            user,
            status,
            oplevel: oplevel.min(MAXOPLEVEL),
        }
    }

    pub fn is_chanop(&self) -> bool {
        self.status.contains(MemberFlags::CHANOP)
    }

    pub fn has_voice(&self) -> bool {
        self.status.contains(MemberFlags::VOICE)
    }

    pub fn is_owner(&self) -> bool {
        self.status.contains(MemberFlags::OWNER)
    }

    pub fn is_zombie(&self) -> bool {
        self.status.contains(MemberFlags::ZOMBIE)
    }

    pub fn is_delayed(&self) -> bool {
        self.status.contains(MemberFlags::DELAYED)
    }

    pub fn is_burst_joined(&self) -> bool {
        self.status.contains(MemberFlags::BURST_JOINED)
    }

    pub fn is_deopped(&self) -> bool {
        self.status.contains(MemberFlags::DEOPPED)
    }

    pub fn is_manager(&self) -> bool {
        self.status.contains(MemberFlags::CHANNEL_MANAGER)
    }

    /// Give ops at `oplevel`
    pub fn op(&mut self, oplevel: u16) {
        self.status.insert(MemberFlags::CHANOP);
        self.status.remove(MemberFlags::DEOPPED);
        self.oplevel = oplevel.min(MAXOPLEVEL);
    }

    pub fn deop(&mut self) {
        self.status.remove(MemberFlags::CHANOP);
        self.status.insert(MemberFlags::DEOPPED);
    }

    /// Is the member still hidden by delayed join?
    pub fn reveal(&mut self) -> bool {
        if self.is_delayed() {
            self.status.remove(MemberFlags::DELAYED);
            true
        } else {
            false
        }
    }

    /// `@`/`+` prefix for NAMES
    pub fn names_prefix(&self) -> &'static str {
        if self.is_owner() {
            "!"
        } else if self.is_chanop() {
            "@"
        } else if self.has_voice() {
            "+"
        } else {
            ""
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_and_deop() {
        let mut m = Membership::new(ClientId(1), MemberFlags::DEOPPED, 2000);
        assert_eq!(m.oplevel, MAXOPLEVEL);
        m.op(5);
        assert!(m.is_chanop());
        assert!(!m.is_deopped());
        assert_eq!(m.oplevel, 5);
        assert_eq!(m.names_prefix(), "@");
        m.deop();
        assert!(!m.is_chanop());
        assert!(m.is_deopped());
    }

    #[test]
    fn test_reveal_only_once() {
        let mut m = Membership::new(ClientId(1), MemberFlags::DELAYED, MAXOPLEVEL);
        assert!(m.reveal());
        assert!(!m.reveal());
    }
}
