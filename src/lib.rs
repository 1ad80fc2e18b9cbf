pub mod action;
pub mod agent;
pub mod client;
pub mod command;
pub mod config;
pub mod coords;
pub mod device;
pub mod error;
pub mod lookup;
pub mod retry;
pub mod store;
pub mod verdict;
pub mod vision;

pub use agent::{Agent, RunReport, RunStatus};
pub use config::{AgentConfig, ModelConfig, Settings};
pub use device::{AdbDevice, DeviceChannel, Screenshot};
pub use error::AgentError;
pub use vision::{GroundingClient, VisionAssistant};
