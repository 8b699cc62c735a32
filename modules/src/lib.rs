//! tsircd command modules
//!
//! Every command the daemon answers lives in one of these modules. Load
//! them with [`default_modules`].

pub mod burst;
pub mod channel;
pub mod messaging;
pub mod mode;
pub mod oper;
pub mod server;

#[cfg(test)]
mod test_support;

pub use burst::BurstModule;
pub use channel::ChannelModule;
pub use messaging::MessagingModule;
pub use mode::ModeModule;
pub use oper::OperModule;
pub use server::ServerModule;

use tsircd_core::Module;

/// One of each module, ready for `ModuleManager::load_module`
pub fn default_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(ServerModule::new()),
        Box::new(BurstModule::new()),
        Box::new(ChannelModule::new()),
        Box::new(ModeModule::new()),
        Box::new(MessagingModule::new()),
        Box::new(OperModule::new()),
    ]
}
