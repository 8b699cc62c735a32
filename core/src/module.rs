//! Module system for command handlers
//!
//! Every command the daemon understands lives in a [`Module`]. The
//! [`ModuleManager`] is the dispatcher: it turns a raw line from a
//! registered connection into a [`Message`], works out who sent it and
//! hands it to the module that claimed the command.

use crate::client::{ClientId, ConnId};
use crate::numeric::NumericReply;
use crate::state::State;
use crate::{Error, Message, MessageType, Prefix, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Module result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleResult {
    /// Message was handled
    Handled,
    /// Message was handled and nothing else should see it
    HandledStop,
    /// Module did not handle the message
    NotHandled,
    /// Message was rejected with the given reason
    Rejected(String),
}

/// What a handler gets to work with
pub struct Context<'a> {
    pub state: &'a mut State,
    /// Sender: the local user, or the client named by a P10 prefix
    pub source: ClientId,
    /// Connection the line arrived on
    pub conn: ConnId,
}

impl<'a> Context<'a> {
    pub fn new(state: &'a mut State, source: ClientId, conn: ConnId) -> Self {
        Self { state, source, conn }
    }

    /// Is the sender a server (rather than a user)?
    pub fn source_is_server(&self) -> bool {
        self.state.clients.is_server(self.source)
    }

    /// Send a numeric to the sender
    pub fn reply(&mut self, reply: Message) {
        self.state.send_numeric(self.source, reply);
    }
}

/// Module trait that all command modules must implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name
    fn name(&self) -> &str;

    /// Module description
    fn description(&self) -> &str;

    /// Module version
    fn version(&self) -> &str;

    /// Commands this module answers, from users and servers alike
    fn commands(&self) -> Vec<MessageType>;

    /// Initialize the module
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cleanup the module
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle a command from a local user
    async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult>;

    /// Handle a command arriving on a server link. Returning
    /// [`Error::Protocol`] drops the link.
    async fn handle_server_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult>;
}

/// Module manager and command dispatcher
pub struct ModuleManager {
    /// Loaded modules
    modules: HashMap<String, Box<dyn Module>>,
    /// Command to owning module
    commands: HashMap<MessageType, String>,
}

impl ModuleManager {
    /// Create a new module manager
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
            commands: HashMap::new(),
        }
    }

    /// Load a module
    pub async fn load_module(&mut self, mut module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            return Err(Error::Module(format!("Module {} already loaded", name)));
        }
        let commands = module.commands();
        if let Some(taken) = commands.iter().find(|c| self.commands.contains_key(*c)) {
            return Err(Error::Module(format!(
                "Command {} already handled by {}",
                taken,
                self.commands.get(taken).map(String::as_str).unwrap_or("?")
            )));
        }

        module.init().await?;
        for command in commands {
            self.commands.insert(command, name.clone());
        }
        info!("Loaded module: {} v{}", name, module.version());
        self.modules.insert(name, module);
        Ok(())
    }

    /// Unload a module
    pub async fn unload_module(&mut self, name: &str) -> Result<()> {
        let mut module = self
            .modules
            .remove(name)
            .ok_or_else(|| Error::Module(format!("Module {} not loaded", name)))?;
        self.commands.retain(|_, owner| owner != name);
        module.cleanup().await?;
        info!("Unloaded module: {}", name);
        Ok(())
    }

    /// Is a module loaded?
    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Names of loaded modules
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    fn module_for(&mut self, command: &MessageType) -> Option<&mut Box<dyn Module>> {
        let name = self.commands.get(command)?;
        self.modules.get_mut(name)
    }

    /// Parse and dispatch a line from a registered connection
    pub async fn dispatch(&mut self, state: &mut State, conn: ConnId, line: &str) -> Result<()> {
        let Some(peer) = state.clients.by_link(conn) else {
            return Err(Error::Connection(format!("connection {} is not registered", conn)));
        };
        if state.clients.is_server(peer) {
            let message = Message::parse_p10(line)?;
            self.dispatch_server(state, peer, conn, &message).await
        } else {
            let mut message = Message::parse(line)?;
            // Users don't get to pick their prefix
            message.prefix = None;
            self.dispatch_client(state, peer, conn, &message).await
        }
    }

    /// Dispatch a command from a local user
    pub async fn dispatch_client(
        &mut self,
        state: &mut State,
        source: ClientId,
        conn: ConnId,
        message: &Message,
    ) -> Result<()> {
        let mut ctx = Context::new(state, source, conn);
        let Some(module) = self.module_for(&message.command) else {
            ctx.reply(NumericReply::unknown_command(message.command.name()));
            return Ok(());
        };

        match module.handle_message(&mut ctx, message).await {
            Ok(ModuleResult::Rejected(reason)) => {
                ctx.state.send_notice(source, &reason);
                Ok(())
            }
            Ok(ModuleResult::NotHandled) => {
                ctx.reply(NumericReply::unknown_command(message.command.name()));
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Error in module {}: {}", module.name(), e);
                Ok(())
            }
        }
    }

    /// Dispatch a P10 line from an adjacent server
    pub async fn dispatch_server(
        &mut self,
        state: &mut State,
        peer: ClientId,
        conn: ConnId,
        message: &Message,
    ) -> Result<()> {
        let source = match &message.prefix {
            Some(Prefix::Numeric(numeric)) => match state.clients.find_by_numeric(numeric) {
                Some(id) => id,
                None => {
                    // Usually a client that quit while this line was in flight
                    debug!("Dropping {} from unknown numeric {}", message.command, numeric);
                    return Ok(());
                }
            },
            _ => peer,
        };
        if state.clients.get(source).and_then(|c| c.link) != Some(conn) {
            let text = format!(
                "{} from {} arrived on the wrong link",
                message.command,
                state.clients.name(source)
            );
            warn!("{}", text);
            state.protocol_violation(peer, &text);
            return Ok(());
        }

        let mut ctx = Context::new(state, source, conn);
        let Some(module) = self.module_for(&message.command) else {
            debug!("No handler for server command {}", message.command.token());
            return Ok(());
        };
        match module.handle_server_message(&mut ctx, message).await {
            Err(Error::Protocol(reason)) => Err(Error::Protocol(reason)),
            Err(e) => {
                error!("Error in module {}: {}", module.name(), e);
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    struct Echo {
        seen: Vec<String>,
    }

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "test module"
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn commands(&self) -> Vec<MessageType> {
            vec![MessageType::Custom("ECHO".to_string()), MessageType::Kick]
        }

        async fn handle_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> Result<ModuleResult> {
            self.seen.push(message.params.join(" "));
            ctx.state.send_notice(ctx.source, "echo");
            Ok(ModuleResult::Handled)
        }

        async fn handle_server_message(&mut self, _ctx: &mut Context<'_>, _message: &Message) -> Result<ModuleResult> {
            Err(Error::Protocol("bad kick".to_string()))
        }
    }

    fn echo() -> Box<dyn Module> {
        Box::new(Echo { seen: Vec::new() })
    }

    #[tokio::test]
    async fn test_unknown_command_gets_421() {
        let mut st = State::with_fixed_clock(Config::default(), 1000);
        st.clients.add_local_user("alice", "a", "h", None, "A", 10, 1000).unwrap();
        let mut mm = ModuleManager::new();
        mm.load_module(echo()).await.unwrap();

        mm.dispatch(&mut st, 10, "FROB x").await.unwrap();
        mm.dispatch(&mut st, 10, "ECHO hi").await.unwrap();
        let lines = st.outbox.lines_for(10);
        assert_eq!(lines[0], ":irc.example.net 421 alice FROB :Unknown command");
        assert_eq!(lines[1], ":irc.example.net NOTICE alice echo");
    }

    #[tokio::test]
    async fn test_duplicate_module_and_command_refused() {
        let mut mm = ModuleManager::new();
        mm.load_module(echo()).await.unwrap();
        assert!(mm.load_module(echo()).await.is_err());
        mm.unload_module("echo").await.unwrap();
        assert!(!mm.is_loaded("echo"));
        mm.load_module(echo()).await.unwrap();
        assert_eq!(mm.module_names(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_server_source_checks() {
        let mut st = State::with_fixed_clock(Config::default(), 1000);
        let me = st.me();
        st.clients.add_server(me, "leaf.example.net", "AC", "leaf", Some(20), 900).unwrap();
        let mut mm = ModuleManager::new();
        mm.load_module(echo()).await.unwrap();

        // Unknown numerics are dropped quietly
        assert!(mm.dispatch(&mut st, 20, "ACAAZ K #c ABAAA :x").await.is_ok());
        // Protocol errors reach the caller
        assert!(matches!(
            mm.dispatch(&mut st, 20, "AC K #c ABAAA :x").await,
            Err(Error::Protocol(_))
        ));
        // Lines from an unregistered connection are refused
        assert!(mm.dispatch(&mut st, 99, "NICK x").await.is_err());
    }
}
