//! IRC numeric replies as defined in RFC 1459 and the P10 extensions

use crate::{Message, MessageType};

/// IRC numeric reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NumericReply {
    // Connection registration
    RplWelcome = 1,
    RplYourHost = 2,
    RplCreated = 3,
    RplMyInfo = 4,
    RplUmodeIs = 221,

    // Channel queries
    RplChannelModeIs = 324,
    RplCreationTime = 329,
    RplNoTopic = 331,
    RplTopic = 332,
    RplTopicWhoTime = 333,
    RplInviting = 341,
    RplNameReply = 353,
    RplEndOfNames = 366,
    RplBanList = 367,
    RplEndOfBanList = 368,
    RplYoureOper = 381,

    // Errors
    ErrNoSuchNick = 401,
    ErrNoSuchChannel = 403,
    ErrCannotSendToChan = 404,
    ErrTooManyChannels = 405,
    ErrNoRecipient = 411,
    ErrNoTextToSend = 412,
    ErrUnknownCommand = 421,
    ErrNoNicknameGiven = 431,
    ErrErroneousNickname = 432,
    ErrNicknameInUse = 433,
    ErrUserNotInChannel = 441,
    ErrNotOnChannel = 442,
    ErrUserOnChannel = 443,
    ErrNotRegistered = 451,
    ErrNeedMoreParams = 461,
    ErrAlreadyRegistered = 462,
    ErrPasswdMismatch = 464,
    ErrKeySet = 467,
    ErrChannelIsFull = 471,
    ErrUnknownMode = 472,
    ErrInviteOnlyChan = 473,
    ErrBannedFromChan = 474,
    ErrBadChannelKey = 475,
    ErrBadChanMask = 476,
    ErrNeedReggedNick = 477,
    ErrBanListFull = 478,
    ErrNoPrivileges = 481,
    ErrChanOpPrivsNeeded = 482,
    ErrIsChanService = 484,
    ErrSecureOnlyChan = 489,
    ErrNoOperHost = 491,
    ErrUsersDontMatch = 502,

    // Oplevel extensions
    ErrNotLowerOpLevel = 550,
    ErrNotManager = 551,
    ErrChanSecured = 552,
    ErrUpassSet = 553,
    ErrUpassNotSet = 554,
}

impl NumericReply {
    /// Numeric value
    pub fn numeric_code(&self) -> u16 {
        *self as u16
    }

    /// Three digit wire form
    pub fn code(&self) -> String {
        format!("{:03}", self.numeric_code())
    }

    /// Create a numeric reply message
    pub fn reply(&self, target: &str, params: Vec<String>) -> Message {
        let mut all_params = vec![target.to_string()];
        all_params.extend(params);

        Message::new(MessageType::Custom(self.code()), all_params)
    }
}

/// Common numeric replies. The target is filled in when the reply is sent.
impl NumericReply {
    /// RPL_WELCOME
    pub fn welcome(network: &str, nick: &str, user: &str, host: &str) -> Message {
        Self::RplWelcome.reply(
            "*",
            vec![format!("Welcome to the {} IRC Network {}!{}@{}", network, nick, user, host)],
        )
    }

    /// RPL_YOURHOST
    pub fn your_host(server: &str, version: &str) -> Message {
        Self::RplYourHost.reply("*", vec![format!("Your host is {}, running version {}", server, version)])
    }

    /// RPL_CREATED
    pub fn created(date: &str) -> Message {
        Self::RplCreated.reply("*", vec![format!("This server was created {}", date)])
    }

    /// RPL_MYINFO
    pub fn my_info(server: &str, version: &str, channel_modes: &str) -> Message {
        Self::RplMyInfo.reply(
            "*",
            vec![server.to_string(), version.to_string(), "io".to_string(), channel_modes.to_string()],
        )
    }

    /// RPL_CHANNELMODEIS
    pub fn channel_mode_is(channel: &str, modes: &str, params: &[String]) -> Message {
        let mut all = vec![channel.to_string(), modes.to_string()];
        all.extend(params.iter().cloned());
        Self::RplChannelModeIs.reply("*", all)
    }

    /// RPL_CREATIONTIME
    pub fn creation_time(channel: &str, ts: i64) -> Message {
        Self::RplCreationTime.reply("*", vec![channel.to_string(), ts.to_string()])
    }

    /// RPL_NOTOPIC
    pub fn no_topic(channel: &str) -> Message {
        Self::RplNoTopic.reply("*", vec![channel.to_string(), "No topic is set.".to_string()])
    }

    /// RPL_TOPIC
    pub fn topic(channel: &str, topic: &str) -> Message {
        Self::RplTopic.reply("*", vec![channel.to_string(), topic.to_string()])
    }

    /// RPL_TOPICWHOTIME
    pub fn topic_who_time(channel: &str, setter: &str, time: i64) -> Message {
        Self::RplTopicWhoTime.reply("*", vec![channel.to_string(), setter.to_string(), time.to_string()])
    }

    /// RPL_INVITING
    pub fn inviting(nick: &str, channel: &str) -> Message {
        Self::RplInviting.reply("*", vec![nick.to_string(), channel.to_string()])
    }

    /// RPL_NAMREPLY
    pub fn name_reply(symbol: &str, channel: &str, names: &str) -> Message {
        Self::RplNameReply.reply("*", vec![symbol.to_string(), channel.to_string(), names.to_string()])
    }

    /// RPL_ENDOFNAMES
    pub fn end_of_names(channel: &str) -> Message {
        Self::RplEndOfNames.reply("*", vec![channel.to_string(), "End of /NAMES list.".to_string()])
    }

    /// RPL_BANLIST
    pub fn ban_list(channel: &str, mask: &str, who: &str, when: i64) -> Message {
        Self::RplBanList.reply(
            "*",
            vec![channel.to_string(), mask.to_string(), who.to_string(), when.to_string()],
        )
    }

    /// RPL_ENDOFBANLIST
    pub fn end_of_ban_list(channel: &str) -> Message {
        Self::RplEndOfBanList.reply("*", vec![channel.to_string(), "End of Channel Ban List".to_string()])
    }

    /// RPL_YOUREOPER
    pub fn youre_oper() -> Message {
        Self::RplYoureOper.reply("*", vec!["You are now an IRC operator".to_string()])
    }

    /// ERR_NOSUCHNICK
    pub fn no_such_nick(nick: &str) -> Message {
        Self::ErrNoSuchNick.reply("*", vec![nick.to_string(), "No such nick".to_string()])
    }

    /// ERR_NOSUCHCHANNEL
    pub fn no_such_channel(channel: &str) -> Message {
        Self::ErrNoSuchChannel.reply("*", vec![channel.to_string(), "No such channel".to_string()])
    }

    /// ERR_CANNOTSENDTOCHAN
    pub fn cannot_send_to_chan(channel: &str) -> Message {
        Self::ErrCannotSendToChan.reply("*", vec![channel.to_string(), "Cannot send to channel".to_string()])
    }

    /// ERR_TOOMANYCHANNELS
    pub fn too_many_channels(channel: &str) -> Message {
        Self::ErrTooManyChannels.reply(
            "*",
            vec![channel.to_string(), "You have joined too many channels".to_string()],
        )
    }

    /// ERR_NORECIPIENT
    pub fn no_recipient(command: &str) -> Message {
        Self::ErrNoRecipient.reply("*", vec![format!("No recipient given ({})", command)])
    }

    /// ERR_NOTEXTTOSEND
    pub fn no_text_to_send() -> Message {
        Self::ErrNoTextToSend.reply("*", vec!["No text to send".to_string()])
    }

    /// ERR_UNKNOWNCOMMAND
    pub fn unknown_command(command: &str) -> Message {
        Self::ErrUnknownCommand.reply("*", vec![command.to_string(), "Unknown command".to_string()])
    }

    /// ERR_NONICKNAMEGIVEN
    pub fn no_nickname_given() -> Message {
        Self::ErrNoNicknameGiven.reply("*", vec!["No nickname given".to_string()])
    }

    /// ERR_ERRONEUSNICKNAME
    pub fn erroneous_nickname(nick: &str) -> Message {
        Self::ErrErroneousNickname.reply("*", vec![nick.to_string(), "Erroneous nickname".to_string()])
    }

    /// ERR_NICKNAMEINUSE
    pub fn nickname_in_use(nick: &str) -> Message {
        Self::ErrNicknameInUse.reply("*", vec![nick.to_string(), "Nickname is already in use".to_string()])
    }

    /// ERR_USERNOTINCHANNEL
    pub fn user_not_in_channel(nick: &str, channel: &str) -> Message {
        Self::ErrUserNotInChannel.reply(
            "*",
            vec![nick.to_string(), channel.to_string(), "They aren't on that channel".to_string()],
        )
    }

    /// ERR_NOTONCHANNEL
    pub fn not_on_channel(channel: &str) -> Message {
        Self::ErrNotOnChannel.reply("*", vec![channel.to_string(), "You're not on that channel".to_string()])
    }

    /// ERR_USERONCHANNEL
    pub fn user_on_channel(nick: &str, channel: &str) -> Message {
        Self::ErrUserOnChannel.reply(
            "*",
            vec![nick.to_string(), channel.to_string(), "is already on channel".to_string()],
        )
    }

    /// ERR_NOTREGISTERED
    pub fn not_registered() -> Message {
        Self::ErrNotRegistered.reply("*", vec!["You have not registered".to_string()])
    }

    /// ERR_NEEDMOREPARAMS
    pub fn need_more_params(command: &str) -> Message {
        Self::ErrNeedMoreParams.reply("*", vec![command.to_string(), "Not enough parameters".to_string()])
    }

    /// ERR_ALREADYREGISTERED
    pub fn already_registered() -> Message {
        Self::ErrAlreadyRegistered.reply("*", vec!["You may not reregister".to_string()])
    }

    /// ERR_PASSWDMISMATCH
    pub fn password_mismatch() -> Message {
        Self::ErrPasswdMismatch.reply("*", vec!["Password incorrect".to_string()])
    }

    /// ERR_KEYSET
    pub fn key_set(channel: &str) -> Message {
        Self::ErrKeySet.reply("*", vec![channel.to_string(), "Channel key already set".to_string()])
    }

    /// ERR_CHANNELISFULL
    pub fn channel_is_full(channel: &str) -> Message {
        Self::ErrChannelIsFull.reply("*", vec![channel.to_string(), "Cannot join channel (+l)".to_string()])
    }

    /// ERR_UNKNOWNMODE
    pub fn unknown_mode(mode: char) -> Message {
        Self::ErrUnknownMode.reply("*", vec![mode.to_string(), "is unknown mode char to me".to_string()])
    }

    /// ERR_INVITEONLYCHAN
    pub fn invite_only_chan(channel: &str) -> Message {
        Self::ErrInviteOnlyChan.reply("*", vec![channel.to_string(), "Cannot join channel (+i)".to_string()])
    }

    /// ERR_BANNEDFROMCHAN
    pub fn banned_from_chan(channel: &str) -> Message {
        Self::ErrBannedFromChan.reply("*", vec![channel.to_string(), "Cannot join channel (+b)".to_string()])
    }

    /// ERR_BADCHANNELKEY
    pub fn bad_channel_key(channel: &str) -> Message {
        Self::ErrBadChannelKey.reply("*", vec![channel.to_string(), "Cannot join channel (+k)".to_string()])
    }

    /// ERR_BADCHANMASK
    pub fn bad_chan_mask(channel: &str) -> Message {
        Self::ErrBadChanMask.reply("*", vec![channel.to_string(), "Bad Channel Mask".to_string()])
    }

    /// ERR_NEEDREGGEDNICK
    pub fn need_regged_nick(channel: &str) -> Message {
        Self::ErrNeedReggedNick.reply(
            "*",
            vec![channel.to_string(), "Cannot join channel (+r)".to_string()],
        )
    }

    /// ERR_BANLISTFULL
    pub fn ban_list_full(channel: &str, mask: &str) -> Message {
        Self::ErrBanListFull.reply(
            "*",
            vec![channel.to_string(), mask.to_string(), "Channel ban/ignore list is full".to_string()],
        )
    }

    /// ERR_NOPRIVILEGES
    pub fn no_privileges() -> Message {
        Self::ErrNoPrivileges.reply("*", vec!["Permission Denied- You're not an IRC operator".to_string()])
    }

    /// ERR_CHANOPRIVSNEEDED
    pub fn chan_op_privs_needed(channel: &str) -> Message {
        Self::ErrChanOpPrivsNeeded.reply("*", vec![channel.to_string(), "You're not channel operator".to_string()])
    }

    /// ERR_ISCHANSERVICE
    pub fn is_chan_service(nick: &str, channel: &str) -> Message {
        Self::ErrIsChanService.reply(
            "*",
            vec![nick.to_string(), channel.to_string(), "Cannot kill, kick or deop a network service".to_string()],
        )
    }

    /// ERR_NOOPERHOST
    pub fn no_oper_host() -> Message {
        Self::ErrNoOperHost.reply("*", vec!["No O-lines for your host".to_string()])
    }

    /// ERR_SECUREONLYCHAN
    pub fn secure_only_chan(channel: &str) -> Message {
        Self::ErrSecureOnlyChan.reply("*", vec![channel.to_string(), "Cannot join channel (+z)".to_string()])
    }

    /// ERR_USERSDONTMATCH
    pub fn users_dont_match() -> Message {
        Self::ErrUsersDontMatch.reply("*", vec!["Cannot change mode for other users".to_string()])
    }

    /// RPL_UMODEIS
    pub fn umode_is(modes: &str) -> Message {
        Self::RplUmodeIs.reply("*", vec![modes.to_string()])
    }

    /// ERR_NOTLOWEROPLEVEL
    pub fn not_lower_op_level(nick: &str, channel: &str, their: u16, ours: u16, action: &str) -> Message {
        Self::ErrNotLowerOpLevel.reply(
            "*",
            vec![
                nick.to_string(),
                channel.to_string(),
                their.to_string(),
                ours.to_string(),
                format!("Cannot {} someone with an equal or lower op-level", action),
            ],
        )
    }

    /// ERR_NOTMANAGER
    pub fn not_manager(channel: &str) -> Message {
        Self::ErrNotManager.reply(
            "*",
            vec![channel.to_string(), "You must be channel manager (have the Apass) to do that".to_string()],
        )
    }

    /// ERR_CHANSECURED
    pub fn chan_secured(channel: &str) -> Message {
        Self::ErrChanSecured.reply(
            "*",
            vec![channel.to_string(), "Channel is older than 48 hours and secured".to_string()],
        )
    }

    /// ERR_UPASSSET
    pub fn upass_set(channel: &str) -> Message {
        Self::ErrUpassSet.reply(
            "*",
            vec![channel.to_string(), "Cannot remove Apass while Upass is still set".to_string()],
        )
    }

    /// ERR_UPASSNOTSET
    pub fn upass_not_set(channel: &str) -> Message {
        Self::ErrUpassNotSet.reply("*", vec![channel.to_string(), "Set the Upass before the Apass".to_string()])
    }
}
