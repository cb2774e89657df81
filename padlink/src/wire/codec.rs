//! Byte protocol spoken with the pad hardware.
//!
//! Device → host is a stream of `(addr, value)` pairs interleaved with runs of
//! `0xFF` heartbeat bytes; a run of [`DEFAULT_CONFLICT_THRESHOLD`] or more
//! means the device is being driven from somewhere else. Host → device is a
//! color command: `[start, count, (r, g, b) * count]`, where setting a single
//! pad is simply a range of one.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::state::Address;
use crate::ternary;

pub const CONFLICT_BYTE: u8 = 0xFF;
pub const DEFAULT_CONFLICT_THRESHOLD: usize = 4;
pub const PRESSED_VALUE: u8 = 1;
pub const RELEASED_VALUE: u8 = 0;
pub const MAX_RANGE_LEN: usize = u8::MAX as usize;

/// Raw 8-bit RGB passed to the hardware unchanged.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq,
)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for Color {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// What to do with an address byte left over at the end of a receive buffer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TrailingBytePolicy {
    /// Hold it and pair it with the first byte of the next receive.
    #[default]
    Buffer,
    /// Discard it and report [`Frame::Truncated`].
    Drop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Frame {
    Signal { addr: Address, pressed: bool },
    /// Device in use elsewhere. Emitted once per heartbeat run.
    Conflict,
    /// An address byte discarded under [`TrailingBytePolicy::Drop`].
    Truncated { addr: Address },
}

/// Stateful device → host decoder. One per connection; the heartbeat run and
/// any held address byte carry over between receive buffers.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    policy: TrailingBytePolicy,
    conflict_threshold: usize,
    heartbeat_run: usize,
    held_addr: Option<Address>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(TrailingBytePolicy::default(), DEFAULT_CONFLICT_THRESHOLD)
    }
}

impl FrameDecoder {
    pub fn new(policy: TrailingBytePolicy, conflict_threshold: usize) -> Self {
        Self {
            policy,
            conflict_threshold: conflict_threshold.max(1),
            heartbeat_run: 0,
            held_addr: None,
        }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(bytes.len() / 2);

        for &byte in bytes {
            if let Some(addr) = self.held_addr.take() {
                frames.push(Frame::Signal {
                    addr,
                    pressed: byte == PRESSED_VALUE,
                });
                continue;
            }

            if byte == CONFLICT_BYTE {
                self.heartbeat_run += 1;
                if self.heartbeat_run == self.conflict_threshold {
                    frames.push(Frame::Conflict);
                }
                continue;
            }

            self.heartbeat_run = 0;
            self.held_addr = Some(byte);
        }

        if self.policy == TrailingBytePolicy::Drop {
            if let Some(addr) = self.held_addr.take() {
                frames.push(Frame::Truncated { addr });
            }
        }

        frames
    }

    /// True while an address byte is waiting for its value.
    pub fn has_partial_frame(&self) -> bool {
        self.held_addr.is_some()
    }

    pub fn reset(&mut self) {
        self.heartbeat_run = 0;
        self.held_addr = None;
    }
}

/// Host → device color command.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum Command {
    SetOne { addr: Address, color: Color },
    SetRange { start: Address, colors: Vec<Color> },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Command::SetOne { addr, color } => {
                Ok(encode_set_one(*addr, *color).to_vec())
            }
            Command::SetRange { start, colors } => {
                encode_set_range(*start, colors.len(), colors)
            }
        }
    }

    /// Every `(addr, color)` pair the command touches. Addresses wrap at 255.
    pub fn expand(&self) -> Vec<(Address, Color)> {
        match self {
            Command::SetOne { addr, color } => vec![(*addr, *color)],
            Command::SetRange { start, colors } => colors
                .iter()
                .enumerate()
                .map(|(i, color)| (start.wrapping_add(i as u8), *color))
                .collect(),
        }
    }
}

pub fn encode_set_one(addr: Address, color: Color) -> [u8; 5] {
    [addr, 1, color.r, color.g, color.b]
}

/// `count` is the caller's declared number of colors and must match
/// `colors.len()`.
pub fn encode_set_range(
    start: Address,
    count: usize,
    colors: &[Color],
) -> Result<Vec<u8>, CodecError> {
    if count != colors.len() {
        return Err(CodecError::CountMismatch {
            declared: count,
            actual: colors.len(),
        });
    }
    if colors.is_empty() {
        return Err(CodecError::EmptyRange);
    }
    if colors.len() > MAX_RANGE_LEN {
        return Err(CodecError::RangeTooLong(colors.len()));
    }

    let mut bytes = Vec::with_capacity(2 + colors.len() * 3);
    bytes.push(start);
    bytes.push(colors.len() as u8);
    for color in colors {
        bytes.extend_from_slice(&color.to_bytes());
    }
    Ok(bytes)
}

/// Decodes a buffer of host → device commands. A count of one decodes as
/// [`Command::SetOne`] since the two share a frame layout.
pub fn decode_commands(bytes: &[u8]) -> Result<Vec<Command>, CodecError> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(&count) = bytes.get(offset + 1) else {
            return Err(CodecError::Truncated {
                offset,
                detail: "missing count byte".to_string(),
            });
        };
        let start = bytes[offset];
        let count = count as usize;
        if count == 0 {
            return Err(CodecError::EmptyRange);
        }

        let body = offset + 2;
        let end = body + count * 3;
        if end > bytes.len() {
            return Err(CodecError::Truncated {
                offset,
                detail: format!(
                    "expected {} color bytes, found {}",
                    count * 3,
                    bytes.len() - body
                ),
            });
        }

        let colors: Vec<Color> = bytes[body..end]
            .chunks_exact(3)
            .map(|c| Color::new(c[0], c[1], c[2]))
            .collect();

        commands.push(if count == 1 {
            Command::SetOne {
                addr: start,
                color: colors[0],
            }
        } else {
            Command::SetRange { start, colors }
        });

        offset = end;
    }

    Ok(commands)
}

/// Device side of a signal frame.
pub fn encode_signal(addr: Address, pressed: bool) -> [u8; 2] {
    [addr, ternary!(pressed, PRESSED_VALUE, RELEASED_VALUE)]
}

pub fn conflict_heartbeat(run: usize) -> Vec<u8> {
    vec![CONFLICT_BYTE; run]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(frames: &[Frame]) -> Vec<(Address, bool)> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Signal { addr, pressed } => Some((*addr, *pressed)),
                _ => None,
            })
            .collect()
    }

    fn conflicts(frames: &[Frame]) -> usize {
        frames.iter().filter(|f| **f == Frame::Conflict).count()
    }

    #[test]
    fn decodes_pairs_and_treats_non_one_as_released() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&[5, 1, 4, 0, 3, 2]);
        assert_eq!(signals(&frames), vec![(5, true), (4, false), (3, false)]);
    }

    #[test]
    fn heartbeat_run_of_four_reports_once() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&[0xff; 4]);
        assert_eq!(conflicts(&frames), 1);
    }

    #[test]
    fn heartbeat_run_of_eight_still_reports_once() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&[0xff; 8]);
        assert_eq!(conflicts(&frames), 1);
    }

    #[test]
    fn short_heartbeat_run_is_ignored() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&[0xff, 0xff, 0xff, 2, 1]);
        assert_eq!(conflicts(&frames), 0);
        assert_eq!(signals(&frames), vec![(2, true)]);
    }

    #[test]
    fn separate_runs_report_separately() {
        let mut decoder = FrameDecoder::default();
        let mut bytes = vec![0xff; 4];
        bytes.extend_from_slice(&[1, 1]);
        bytes.extend_from_slice(&[0xff; 5]);
        let frames = decoder.decode(&bytes);
        assert_eq!(conflicts(&frames), 2);
        assert_eq!(signals(&frames), vec![(1, true)]);
    }

    #[test]
    fn heartbeat_run_spans_receive_buffers() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(conflicts(&decoder.decode(&[0xff, 0xff])), 0);
        assert_eq!(conflicts(&decoder.decode(&[0xff, 0xff])), 1);
        assert_eq!(conflicts(&decoder.decode(&[0xff, 0xff])), 0);
    }

    #[test]
    fn buffered_trailing_byte_completes_on_next_receive() {
        let mut decoder = FrameDecoder::default();
        let first = decoder.decode(&[1, 1, 7]);
        assert_eq!(signals(&first), vec![(1, true)]);
        assert!(decoder.has_partial_frame());

        let second = decoder.decode(&[1]);
        assert_eq!(signals(&second), vec![(7, true)]);
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn buffered_pair_accepts_ff_as_value_byte() {
        let mut decoder = FrameDecoder::default();
        decoder.decode(&[9]);
        let frames = decoder.decode(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(signals(&frames), vec![(9, false)]);
        assert_eq!(conflicts(&frames), 0);
    }

    #[test]
    fn drop_policy_discards_trailing_byte() {
        let mut decoder = FrameDecoder::new(
            TrailingBytePolicy::Drop,
            DEFAULT_CONFLICT_THRESHOLD,
        );
        let frames = decoder.decode(&[2, 1, 7]);
        assert_eq!(signals(&frames), vec![(2, true)]);
        assert!(frames.contains(&Frame::Truncated { addr: 7 }));

        let next = decoder.decode(&[3, 1]);
        assert_eq!(signals(&next), vec![(3, true)]);
    }

    #[test]
    fn set_one_layout() {
        assert_eq!(
            encode_set_one(3, Color::new(10, 20, 30)),
            [3, 1, 10, 20, 30]
        );
    }

    #[test]
    fn set_range_rejects_count_mismatch() {
        let colors = [Color::BLACK, Color::BLACK];
        assert_eq!(
            encode_set_range(0, 3, &colors),
            Err(CodecError::CountMismatch {
                declared: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn set_range_rejects_empty_and_oversized() {
        assert_eq!(encode_set_range(0, 0, &[]), Err(CodecError::EmptyRange));
        let colors = vec![Color::BLACK; 256];
        assert_eq!(
            encode_set_range(0, 256, &colors),
            Err(CodecError::RangeTooLong(256))
        );
    }

    #[test]
    fn set_range_round_trips_through_command_decoder() {
        let colors = vec![
            Color::new(255, 0, 0),
            Color::new(0, 255, 0),
            Color::new(0, 0, 255),
        ];
        let bytes = encode_set_range(10, 3, &colors).unwrap();
        assert_eq!(bytes[..2], [10, 3]);

        let commands = decode_commands(&bytes).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].expand(),
            vec![(10, colors[0]), (11, colors[1]), (12, colors[2])]
        );
    }

    #[test]
    fn command_decoder_reports_truncation() {
        let err = decode_commands(&[0, 2, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { offset: 0, .. }));
    }

    #[test]
    fn range_addresses_wrap() {
        let command = Command::SetRange {
            start: 254,
            colors: vec![Color::BLACK; 3],
        };
        let addrs: Vec<Address> =
            command.expand().into_iter().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![254, 255, 0]);
    }
}
