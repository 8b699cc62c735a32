//! Small network fixture for the module tests

use crate::default_modules;
use tsircd_core::{ClientFlags, ClientId, Config, ConnId, ModuleManager, Result, State};

pub struct Net {
    pub state: State,
    pub modules: ModuleManager,
}

impl Net {
    /// This server (`irc.example.net`, numeric AB) at t=1000 with every module loaded
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let mut modules = ModuleManager::new();
        for module in default_modules() {
            modules.load_module(module).await.unwrap();
        }
        Self {
            state: State::with_fixed_clock(config, 1000),
            modules,
        }
    }

    /// Local user `nick!<first letter>@h` on `conn`
    pub fn user(&mut self, nick: &str, conn: ConnId) -> ClientId {
        let username = &nick[..1];
        self.state
            .clients
            .add_local_user(nick, username, "h", None, nick, conn, 1000)
            .unwrap()
    }

    /// Directly linked server on `conn`
    pub fn server(&mut self, name: &str, numeric: &str, conn: ConnId) -> ClientId {
        let me = self.state.me();
        self.state
            .clients
            .add_server(me, name, numeric, name, Some(conn), 1000)
            .unwrap()
    }

    pub fn remote_user(&mut self, server: ClientId, numeric: &str, nick: &str) -> ClientId {
        self.state
            .clients
            .add_remote_user(server, numeric, nick, &nick[..1], "h", None, nick, None, ClientFlags::empty(), 1000)
            .unwrap()
    }

    pub fn oper(&mut self, id: ClientId) {
        if let Some(client) = self.state.clients.get_mut(id) {
            client.flags.insert(ClientFlags::OPER);
        }
    }

    pub async fn line(&mut self, conn: ConnId, line: &str) {
        self.try_line(conn, line).await.unwrap();
    }

    pub async fn try_line(&mut self, conn: ConnId, line: &str) -> Result<()> {
        self.modules.dispatch(&mut self.state, conn, line).await
    }

    /// Output queued for one connection
    pub fn lines(&self, conn: ConnId) -> Vec<String> {
        self.state.outbox.lines_for(conn).into_iter().map(str::to_string).collect()
    }

    pub fn clear(&mut self) {
        self.state.outbox.drain();
    }
}
