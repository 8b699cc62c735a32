//! Net burst module
//!
//! BURST, DESTRUCT, END_OF_BURST and EOB_ACK. The channel merge itself
//! lives in `tsircd_core::burst`; this module routes the lines to it and
//! keeps the per-server burst state.

use async_trait::async_trait;
use tsircd_core::{
    debug, info, process_burst, ClientFlags, Context, Error, Message, MessageType, Module, ModuleResult, Result,
};

/// Net burst module
pub struct BurstModule {
    name: String,
    version: String,
    description: String,
}

impl BurstModule {
    pub fn new() -> Self {
        Self {
            name: "burst".to_string(),
            version: "1.0.0".to_string(),
            description: "Net burst and channel destruct propagation".to_string(),
        }
    }

    fn handle_burst(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        if !ctx.source_is_server() {
            let name = ctx.state.clients.name(ctx.source).to_string();
            ctx.state.protocol_violation(ctx.source, &format!("BURST from user {}", name));
            return Err(Error::Protocol(format!("BURST from user {}", name)));
        }
        process_burst(ctx.state, ctx.source, ctx.conn, message);
        Ok(())
    }

    /// DESTRUCT <channel> <ts>: the sender destroyed an empty channel
    fn handle_destruct(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(name), Some(ts)) = (message.param(0), message.param(1)) else {
            return Ok(());
        };
        let Ok(ts) = ts.parse::<i64>() else {
            ctx.state.protocol_violation(ctx.source, &format!("DESTRUCT for {} with bad TS {}", name, ts));
            return Ok(());
        };
        let Some(chan) = ctx.state.channels.get(name) else {
            return Ok(());
        };
        // Ours is older: it has history the sender never saw
        if ts > chan.creationtime {
            debug!("Ignoring DESTRUCT {} {}: ours is from {}", name, ts, chan.creationtime);
            return Ok(());
        }
        if !chan.members.is_empty() {
            debug!("Ignoring DESTRUCT {}: not empty", name);
            return Ok(());
        }
        let name = chan.name.clone();

        let me = ctx.state.me();
        let destruct = ctx
            .state
            .server_message(me, MessageType::Destruct, vec![name.clone(), ts.to_string()]);
        ctx.state.send_to_servers(&destruct, None);
        ctx.state.channels.remove_destruct_event(&name);
        ctx.state.channels.destruct_channel(&name);
        info!("Destructed {} on request of {}", name, ctx.state.clients.name(ctx.source));
        Ok(())
    }

    fn handle_end_of_burst(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (source, conn) = (ctx.source, ctx.conn);
        if !ctx.source_is_server() {
            return Ok(());
        }
        let name = ctx.state.clients.name(source).to_string();
        ctx.state.sendto_opmask(&format!("Completed net.burst from {}.", name));
        ctx.state.send_to_servers(message, Some(conn));

        let adjacent = match ctx.state.clients.get_mut(source) {
            Some(server) => {
                server.flags.remove(ClientFlags::BURST);
                server.flags.insert(ClientFlags::BURST_ACK);
                server.is_local()
            }
            None => return Ok(()),
        };
        if adjacent {
            let me = ctx.state.me();
            let ack = ctx.state.server_message(me, MessageType::EndOfBurstAck, Vec::new());
            ctx.state.send_to_link(conn, &ack);
        }
        for channel in ctx.state.channels.names() {
            ctx.state.clear_burst_flags(&channel);
        }
        Ok(())
    }

    fn handle_end_of_burst_ack(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (source, conn) = (ctx.source, ctx.conn);
        if !ctx.source_is_server() {
            return Ok(());
        }
        let name = ctx.state.clients.name(source).to_string();
        ctx.state
            .sendto_opmask(&format!("{} acknowledged end of net.burst.", name));
        ctx.state.send_to_servers(message, Some(conn));
        if let Some(server) = ctx.state.clients.get_mut(source) {
            server.flags.remove(ClientFlags::BURST_ACK);
        }
        Ok(())
    }
}

impl Default for BurstModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for BurstModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn commands(&self) -> Vec<MessageType> {
        vec![
            MessageType::Burst,
            MessageType::Destruct,
            MessageType::EndOfBurst,
            MessageType::EndOfBurstAck,
        ]
    }

    async fn handle_message(&mut self, _ctx: &mut Context<'_>, _message: &Message) -> Result<ModuleResult> {
        // Server-only commands
        Ok(ModuleResult::NotHandled)
    }

    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        match message.command {
            MessageType::Burst => self.handle_burst(ctx, message)?,
            MessageType::Destruct => self.handle_destruct(ctx, message)?,
            MessageType::EndOfBurst => self.handle_end_of_burst(ctx, message)?,
            MessageType::EndOfBurstAck => self.handle_end_of_burst_ack(ctx, message)?,
            _ => return Ok(ModuleResult::NotHandled),
        }
        Ok(ModuleResult::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Net;
    use tsircd_core::membership::MAXOPLEVEL;
    use tsircd_core::{ChannelModes, GetChannel};

    #[tokio::test]
    async fn test_burst_creates_channel_and_forwards() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        let leaf = net.server("leaf.example.net", "AC", 20);
        net.server("other.example.net", "AD", 21);
        net.remote_user(leaf, "ACAAA", "rem");

        net.line(20, "AC B #new 900 +nt ACAAA:o").await;
        let chan = net.state.channels.get("#new").unwrap();
        assert_eq!(chan.creationtime, 900);
        assert!(chan.mode.mode.contains(ChannelModes::NOPRIVMSGS | ChannelModes::TOPICLIMIT));
        let rem = net.state.clients.find_user("rem").unwrap();
        let member = chan.member(rem).unwrap();
        assert!(member.is_chanop());
        assert_eq!(member.oplevel, MAXOPLEVEL);
        assert_eq!(net.lines(21), vec!["AC B #new 900 +nt ACAAA:o"]);
        assert!(net.lines(20).is_empty());
    }

    #[tokio::test]
    async fn test_burst_from_user_drops_link() {
        let mut net = Net::new().await;
        let leaf = net.server("leaf.example.net", "AC", 20);
        net.remote_user(leaf, "ACAAA", "rem");
        let err = net.try_line(20, "ACAAA B #x 900").await;
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_destruct_rules() {
        let mut net = Net::new().await;
        net.user("alice", 10);
        net.server("leaf.example.net", "AC", 20);
        net.server("other.example.net", "AD", 21);
        net.state.channels.get_channel("#empty", GetChannel::Create, 1000);
        net.state.channels.get_channel("#old", GetChannel::Create, 500);
        net.line(10, "JOIN #busy").await;
        net.clear();

        net.line(20, "AC DE #busy 1000").await;
        net.line(20, "AC DE #old 900").await;
        net.line(20, "AC DE #nothere 900").await;
        assert!(net.state.channels.get("#busy").is_some());
        assert!(net.state.channels.get("#old").is_some());
        assert!(net.lines(21).is_empty());

        net.line(20, "AC DE #empty 1000").await;
        assert!(net.state.channels.get("#empty").is_none());
        assert_eq!(net.lines(20), vec!["AB DE #empty 1000"]);
        assert_eq!(net.lines(21), vec!["AB DE #empty 1000"]);
    }

    #[tokio::test]
    async fn test_end_of_burst_handshake() {
        let mut net = Net::new().await;
        let leaf = net.server("leaf.example.net", "AC", 20);
        net.server("other.example.net", "AD", 21);
        net.state
            .clients
            .get_mut(leaf)
            .unwrap()
            .flags
            .insert(ClientFlags::BURST | ClientFlags::BURST_ACK);

        net.line(20, "AC EB").await;
        let flags = net.state.clients.get(leaf).unwrap().flags;
        assert!(!flags.contains(ClientFlags::BURST));
        assert!(flags.contains(ClientFlags::BURST_ACK));
        assert_eq!(net.lines(20), vec!["AB EA"]);
        assert_eq!(net.lines(21), vec!["AC EB"]);
        net.clear();

        net.line(20, "AC EA").await;
        assert!(!net.state.clients.get(leaf).unwrap().is_burst_or_burst_ack());
        assert_eq!(net.lines(21), vec!["AC EA"]);
    }
}
