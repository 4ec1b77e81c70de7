mod command;
mod device;
mod engine;
mod error;
mod function;
mod message;
mod notifier;
mod payload;
mod reconciler;
mod store;
mod topic;

pub use command::Command;
pub use command::CommandEncoder;
pub use command::CommandFunction;
pub use device::Capabilities;
pub use device::Channel;
pub use device::ChannelId;
pub use device::DEFAULT_CHANNEL;
pub use device::Device;
pub use device::DeviceInfo;
pub use device::Eep;
pub use device::FunctionState;
pub use engine::Engine;
pub use error::CommandError;
pub use error::PayloadError;
pub use error::StoreError;
pub use error::ValueError;
pub use function::FunctionKey;
pub use function::Value;
pub use message::InboundMessage;
pub use message::InboundSender;
pub use message::OutboundMessage;
pub use message::OutboundReceiver;
pub use notifier::DeviceChanged;
pub use notifier::DeviceWatcher;
pub use notifier::Notifier;
pub use payload::DeviceBatch;
pub use payload::FunctionUpdate;
pub use payload::Normalizer;
pub use reconciler::DEFAULT_DEBOUNCE;
pub use reconciler::Reconciler;
pub use store::DeviceStore;
pub use store::MergeResult;
pub use topic::DEFAULT_TOPIC_BASE;
pub use topic::Direction;
pub use topic::Route;
pub use topic::TopicRouter;
