//! tsircd core
//!
//! Protocol state and algorithms for a P10 IRC server: the client table,
//! channels and memberships, bans, the mode parser with its ModeBuf and
//! JoinBuf accumulators, the BURST netsplit-recovery protocol, and the
//! event loop that drives them.

pub mod ban;
pub mod burst;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod joinbuf;
pub mod matching;
pub mod membership;
pub mod message;
pub mod modebuf;
pub mod modes;
pub mod module;
pub mod numeric;
pub mod numnick;
pub mod registration;
pub mod registry;
pub mod send;
pub mod server;
pub mod state;
pub mod wire;

pub use ban::{Ban, BanFlags};
pub use burst::{process_burst, send_net_burst, BurstAuthority};
pub use channel::{Channel, ChannelModes, ModeView};
pub use client::{Client, ClientFlags, ClientId, ConnId};
pub use config::{Capabilities, Config};
pub use connection::{ConnectionHandler, Event};
pub use error::{Error, Result};
pub use joinbuf::{JoinBuf, JoinType};
pub use membership::{MemberFlags, Membership};
pub use message::{Message, MessageType, Prefix};
pub use modebuf::{ModeBuf, ModeBufDest};
pub use modes::{mode_parse, ParseFlags};
pub use module::{Context, Module, ModuleManager, ModuleResult};
pub use numeric::NumericReply;
pub use registry::{ChannelRegistry, GetChannel};
pub use server::Server;
pub use state::State;

// Re-export commonly used types
pub use async_trait::async_trait;
pub use tracing::{debug, error, info, warn};
