pub mod board;
pub mod bridge;
pub mod config;
pub mod core;
pub mod error;
pub mod sandbox;
pub mod sim;
pub mod state;
pub mod supervisor;
pub mod watch;
pub mod wire;

pub use board::{Board, Cell};
pub use config::{Config, ExecutionMode, LinkConfig, SupervisorConfig};
pub use error::{CodecError, PadError};
pub use sim::SimDevice;
pub use state::{Address, ButtonState, ButtonStore};
pub use supervisor::{
    ConnectionStatus, ControlEvent, HostEvent, OperatorCommand, SessionHandle,
    SessionState, Supervisor,
};
pub use wire::{Color, Command, TcpLink};
