pub mod client;
pub mod config;
pub mod connection;
pub mod execution;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod wire;

pub use client::{ClientError, Execution, KernelClient};
pub use config::ClientConfig;
pub use connection::{ConfigError, ConnectionInfo};
pub use execution::ExecutionError;
pub use session::{Channels, Session, SessionError, ZmqChannels};
pub use status::{KernelStatus, StatusSubscription, SubscriptionId};
pub use supervisor::{
    discover_kernels, start_kernel, start_kernel_directly, start_kernel_with_script,
    KernelProcess, KernelSpec, LifecycleError,
};
pub use wire::{Envelope, Header, Message, ProtocolError, SignatureScheme, Signer};
