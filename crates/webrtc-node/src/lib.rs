pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod peer;
pub mod registry;
pub mod signaling;

pub use config::NodeConfig;
pub use error::{ConfigError, ConnectError, NegotiationError, NodeError, SendError};
pub use node::{Node, NodeLifecycle, NodeState, WebRtcNode};
pub use registry::{NodeRegistry, NodeType, RegistryError};
