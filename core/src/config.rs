//! Configuration management

use crate::{matching, Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server information
    pub server: ServerConfig,
    /// Listener settings
    pub connection: ConnectionConfig,
    /// Channel limits and timers
    pub channels: ChannelConfig,
    /// Optional channel features
    pub features: FeatureConfig,
    /// Server links
    pub links: Vec<ServerLink>,
    /// IRC operators
    pub operators: Vec<OperatorConfig>,
    /// U-lined (services) server names
    pub uworld: Vec<String>,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name
    pub name: String,
    /// Server description
    pub description: String,
    /// P10 server numeric (0..4095)
    pub numeric: u16,
    /// Name shown instead of a server on hidden-source mode changes
    pub his_servername: String,
    /// Maximum number of local clients
    pub max_clients: usize,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bind address
    pub bind_address: String,
    /// Ports accepting client connections
    pub client_ports: Vec<u16>,
    /// Ports accepting server links
    pub server_ports: Vec<u16>,
    /// Seconds between keepalive pings to links
    pub ping_interval: u64,
}

/// Channel limits and destruction timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum channels a local user may join
    pub max_channels_per_user: usize,
    /// Maximum number of bans per channel
    pub max_bans: usize,
    /// Average ban length used to bound total ban list size
    pub avg_ban_length: usize,
    /// Maximum key length
    pub key_length: usize,
    /// Maximum topic length
    pub topic_length: usize,
    /// Maximum channel name length
    pub channel_length: usize,
    /// Whether `&` channels are allowed
    pub local_channels: bool,
    /// Grace period for young empty channels (seconds)
    pub destruct_delay_short: i64,
    /// Grace period for old empty channels (seconds)
    pub destruct_delay_long: i64,
    /// A zannel BURST this much older than our TS is treated as the same channel (seconds)
    pub zannel_slop: i64,
    /// Seconds between destruct event sweeps
    pub destruct_tick: u64,
}

/// Channel manager semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelManagers {
    /// No manager concept
    None,
    /// Apass/Upass passwords with oplevels
    Passwords,
    /// Channel owner (+q)
    Owner,
}

/// Optional feature switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Which channel manager model is active
    pub channel_managers: ChannelManagers,
    /// Enables c C N u M z
    pub extended_modes: bool,
    /// Enables D/d
    pub delayed_join: bool,
    /// Hide the source of server and OPMODE changes behind `his_servername`
    pub his_modewho: bool,
}

bitflags! {
    /// Capability set resolved once at startup
    pub struct Capabilities: u32 {
        const OPLEVELS = 0x0001;
        const OWNER = 0x0002;
        const EXTENDED_MODES = 0x0004;
        const DELAYED_JOIN = 0x0008;
        const LOCAL_CHANNELS = 0x0010;
    }
}

/// Server link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerLink {
    /// Server name
    pub name: String,
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
    /// Link password
    pub password: String,
    /// Connect out at startup
    #[serde(default)]
    pub autoconnect: bool,
}

/// Operator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Operator name given to OPER
    pub name: String,
    /// Operator password (SHA256 hashed)
    pub password_hash: String,
    /// Operator hostmask (user@host pattern)
    pub hostmask: String,
}

impl OperatorConfig {
    /// Create a new operator entry from a plaintext password
    pub fn new(name: String, password: &str, hostmask: String) -> Self {
        Self {
            name,
            password_hash: PasswordHasher::hash_password(password),
            hostmask,
        }
    }

    /// Verify password
    pub fn verify_password(&self, password: &str) -> bool {
        PasswordHasher::verify_password(password, &self.password_hash)
    }

    /// Check if hostmask matches
    pub fn matches_hostmask(&self, user: &str, host: &str) -> bool {
        matching::match_mask(&self.hostmask, &format!("{}@{}", user, host))
    }
}

/// Password hashing utilities
pub struct PasswordHasher;

impl PasswordHasher {
    /// Hash a password using SHA256
    pub fn hash_password(password: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Verify a password against its hash
    pub fn verify_password(password: &str, hash: &str) -> bool {
        Self::hash_password(password) == hash
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            connection: ConnectionConfig::default(),
            channels: ChannelConfig::default(),
            features: FeatureConfig::default(),
            links: Vec::new(),
            operators: Vec::new(),
            uworld: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "irc.example.net".to_string(),
            description: "tsircd server".to_string(),
            numeric: 1,
            his_servername: "*.example.net".to_string(),
            max_clients: 1024,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            client_ports: vec![6667],
            server_ports: vec![4400],
            ping_interval: 90,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_channels_per_user: 10,
            max_bans: 45,
            avg_ban_length: 40,
            key_length: 23,
            topic_length: 250,
            channel_length: 200,
            local_channels: true,
            destruct_delay_short: 60,
            destruct_delay_long: 172_800,
            zannel_slop: 4,
            destruct_tick: 10,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            channel_managers: ChannelManagers::Passwords,
            extended_modes: true,
            delayed_join: true,
            his_modewho: true,
        }
    }
}

impl FeatureConfig {
    /// Resolve the capability set. Passwords and owner are exclusive by construction.
    pub fn capabilities(&self, local_channels: bool) -> Capabilities {
        let mut caps = match self.channel_managers {
            ChannelManagers::None => Capabilities::empty(),
            ChannelManagers::Passwords => Capabilities::OPLEVELS,
            ChannelManagers::Owner => Capabilities::OWNER,
        };
        if self.extended_modes {
            caps |= Capabilities::EXTENDED_MODES;
        }
        if self.delayed_join {
            caps |= Capabilities::DELAYED_JOIN;
        }
        if local_channels {
            caps |= Capabilities::LOCAL_CHANNELS;
        }
        caps
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Resolved capability set
    pub fn capabilities(&self) -> Capabilities {
        self.features.capabilities(self.channels.local_channels)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate server identity
        if self.server.name.is_empty() || !self.server.name.contains('.') {
            return Err(Error::Config(format!("Invalid server name '{}'", self.server.name)));
        }

        if self.server.numeric > crate::numnick::MAX_SERVER_NUMERIC {
            return Err(Error::Config(format!(
                "Server numeric {} out of range (0..={})",
                self.server.numeric,
                crate::numnick::MAX_SERVER_NUMERIC
            )));
        }

        // Validate ports
        if self.connection.client_ports.is_empty() && self.connection.server_ports.is_empty() {
            return Err(Error::Config("At least one port must be configured".to_string()));
        }

        let mut seen_ports = HashSet::new();
        for port in self.connection.client_ports.iter().chain(&self.connection.server_ports) {
            if *port == 0 {
                return Err(Error::Config("Port cannot be 0".to_string()));
            }
            if !seen_ports.insert(*port) {
                return Err(Error::Config(format!("Duplicate port {} in configuration", port)));
            }
        }

        // Validate limits
        if self.server.max_clients == 0 {
            return Err(Error::Config("Max clients must be greater than 0".to_string()));
        }

        if self.channels.max_channels_per_user == 0 {
            return Err(Error::Config("Max channels per user must be greater than 0".to_string()));
        }

        if self.channels.destruct_delay_short <= 0
            || self.channels.destruct_delay_long < self.channels.destruct_delay_short
        {
            return Err(Error::Config(
                "Destruct delays must be positive and the long delay at least the short one".to_string(),
            ));
        }

        if self.channels.zannel_slop < 0 {
            return Err(Error::Config("Zannel slop cannot be negative".to_string()));
        }

        self.validate_links()?;

        for oper in &self.operators {
            if oper.password_hash.len() != 64 || !oper.password_hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!("Operator {} has an invalid password hash", oper.name)));
            }
        }

        Ok(())
    }

    /// Validate server links configuration
    fn validate_links(&self) -> Result<()> {
        let mut seen_names = HashSet::new();

        for link in &self.links {
            if !seen_names.insert(link.name.to_lowercase()) {
                return Err(Error::Config(format!("Duplicate server link name: {}", link.name)));
            }

            if link.name.eq_ignore_ascii_case(&self.server.name) {
                return Err(Error::Config(format!("Server link {} uses our own name", link.name)));
            }

            if link.password.is_empty() {
                return Err(Error::Config(format!("Server link {} has no password", link.name)));
            }

            if link.autoconnect && (link.host.is_empty() || link.port == 0) {
                return Err(Error::Config(format!(
                    "Server link {} is autoconnect but has no host/port",
                    link.name
                )));
            }
        }

        Ok(())
    }

    /// Find a configured link by server name
    pub fn get_server_link(&self, server_name: &str) -> Option<&ServerLink> {
        self.links.iter().find(|l| l.name.eq_ignore_ascii_case(server_name))
    }

    /// Check if a server is U-lined
    pub fn is_uworld(&self, server_name: &str) -> bool {
        self.uworld.iter().any(|s| s.eq_ignore_ascii_case(server_name))
    }

    /// Authenticate an operator
    pub fn authenticate_operator(&self, name: &str, password: &str, user: &str, host: &str) -> Option<&OperatorConfig> {
        self.operators
            .iter()
            .find(|o| o.name == name && o.matches_hostmask(user, host) && o.verify_password(password))
    }
}
