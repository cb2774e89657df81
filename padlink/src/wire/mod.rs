pub mod codec;
pub mod transport;

pub use codec::{
    CONFLICT_BYTE, Color, Command, DEFAULT_CONFLICT_THRESHOLD, Frame,
    FrameDecoder, MAX_RANGE_LEN, PRESSED_VALUE, RELEASED_VALUE,
    TrailingBytePolicy, conflict_heartbeat, decode_commands, encode_set_one,
    encode_set_range, encode_signal,
};
pub use transport::TcpLink;
