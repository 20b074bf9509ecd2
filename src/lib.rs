pub mod breez_server;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod fees;
pub mod input;
pub mod keys;
pub mod lightning;
pub mod lnurl;
pub mod logging;
pub mod lsp;
pub mod models;
pub mod payments;
pub mod persist;
pub mod reverse_swap;
pub mod session;
pub mod swap;

pub use config::{Network, NodeConfig};
pub use error::{SdkError, SdkResult};
pub use events::{BreezEvent, EventBus};
pub use input::{InputParser, InputType};
pub use session::{Backends, NodeSession};
