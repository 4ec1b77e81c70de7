pub mod api;
pub mod config;
pub mod engine;
pub mod mqtt;

pub use config::Config;
pub use config::LogLevel;
pub use engine::Command;
pub use engine::CommandError;
pub use engine::Device;
pub use engine::DeviceChanged;
pub use engine::Engine;
pub use engine::TopicRouter;
