pub mod channel;
pub mod messages;
pub mod rpc;

pub use channel::{LinkClosed, MessageSink, MessageSource};
pub use messages::{
    HostMessage, LaunchSpec, LogLevel, QueryKey, RequestId, RunnerMessage,
    ScriptOutcome,
};
pub use rpc::{PendingRequest, Resolution, RpcClient};
