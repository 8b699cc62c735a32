//! Operator module
//!
//! OPER against the `[[operators]]` blocks of the configuration. A
//! successful OPER sets user mode `+o` and tells the network.

use async_trait::async_trait;
use tracing::info;
use tsircd_core::{ClientFlags, Context, Message, MessageType, Module, ModuleResult, NumericReply, Result};

/// Operator module for handling operator authentication
pub struct OperModule {
    name: String,
    version: String,
    description: String,
}

impl OperModule {
    /// Create a new oper module
    pub fn new() -> Self {
        Self {
            name: "oper".to_string(),
            version: "1.0.0".to_string(),
            description: "IRC operator authentication".to_string(),
        }
    }

    /// Handle OPER <name> <password>
    fn handle_oper(&self, ctx: &mut Context<'_>, message: &Message) -> Result<()> {
        let (Some(oper_name), Some(password)) = (message.param(0), message.param(1)) else {
            ctx.reply(NumericReply::need_more_params("OPER"));
            return Ok(());
        };
        let source = ctx.source;
        let Some(client) = ctx.state.clients.get(source) else {
            return Ok(());
        };
        if client.is_oper() {
            ctx.reply(NumericReply::youre_oper());
            return Ok(());
        }
        let (nick, username, host) = (client.name.clone(), client.username.clone(), client.host.clone());

        let authenticated = ctx
            .state
            .config
            .authenticate_operator(oper_name, password, &username, &host)
            .is_some();
        if !authenticated {
            let host_ok = ctx
                .state
                .config
                .operators
                .iter()
                .any(|o| o.name == oper_name && o.matches_hostmask(&username, &host));
            ctx.reply(if host_ok {
                NumericReply::password_mismatch()
            } else {
                NumericReply::no_oper_host()
            });
            ctx.state
                .sendto_opmask(&format!("Failed OPER attempt by {} ({}@{})", nick, username, host));
            return Ok(());
        }

        if let Some(client) = ctx.state.clients.get_mut(source) {
            client.flags.insert(ClientFlags::OPER);
        }
        info!("{} ({}@{}) is now operator {}", nick, username, host, oper_name);
        ctx.reply(NumericReply::youre_oper());

        let local = ctx
            .state
            .client_message(source, MessageType::Mode, vec![nick.clone(), "+o".to_string()]);
        ctx.state.send_to_client(source, &local);
        let relay = ctx
            .state
            .server_message(source, MessageType::Mode, vec![nick.clone(), "+o".to_string()]);
        ctx.state.send_to_servers(&relay, None);
        ctx.state
            .sendto_opmask(&format!("{} ({}@{}) is now operator (O)", nick, username, host));
        Ok(())
    }
}

impl Default for OperModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for OperModule {
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
        vec![MessageType::Oper]
    }

    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
        self.handle_oper(ctx, message)?;
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_message(&mut self, _ctx: &mut Context<'_>, _message: &Message) -> Result<ModuleResult> {
        // Operator status crosses links as a user MODE
        Ok(ModuleResult::NotHandled)
    }
}
