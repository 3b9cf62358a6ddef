//! Wire format of the scope command protocol.
//!
//! Every command is a fixed 9-byte frame: one ASCII opcode followed by an 8-byte payload.
//! Unused payload bytes are ASCII `'0'`. Integers and floats are little-endian.
//!
//! | Command        | Frame                                  | Response                        |
//! |----------------|----------------------------------------|---------------------------------|
//! | handshake      | `h00000000`                            | 14: u16 ch, u16 buf, 10-byte name |
//! | get timing     | `t00000000`                            | 8: u32 divider, u32 pretrigger  |
//! | set timing     | `T` u32 divider u32 pretrigger         | 1: ack                          |
//! | get state      | `s00000000`                            | 1: state byte                   |
//! | set state      | `S0000000` state                       | 1: ack                          |
//! | get register   | `b0000` u32 index                      | 4: f32                          |
//! | set register   | `B` u32 index f32 value                | 1: ack                          |
//! | get frame      | `f00000000`                            | channels × f32                  |
//! | get label      | `l0000` u32 channel                    | up to 41 bytes, NUL terminated  |
//! | download       | `d00000000`                            | buffer_length × channels × f32  |

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of every command frame.
pub const FRAME_LEN: usize = 9;
/// Size of one sample on the wire.
pub const BYTES_PER_SAMPLE: usize = 4;
/// Handshake response length.
pub const HANDSHAKE_RESPONSE_LEN: usize = 14;
/// Maximum label response length.
pub const LABEL_RESPONSE_LEN: usize = 41;
/// Length of the device name in the handshake.
pub const DEVICE_NAME_LEN: usize = 10;
/// Acknowledge byte returned by setters on success.
pub const ACK: u8 = 0x00;

const PAD: u8 = b'0';

/// A scope command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Query channel count, buffer length and device name
    Handshake,
    /// Read divider and pretrigger registers
    GetTiming,
    /// Write divider and pretrigger registers
    SetTiming {
        /// Sample-rate decimation factor
        divider: u32,
        /// Samples kept before the trigger
        pretrigger: u32,
    },
    /// Read the run state byte
    GetState,
    /// Request a run state
    SetState(u8),
    /// Read a real-time register
    GetRegister(u32),
    /// Write a real-time register
    SetRegister {
        /// Register index
        index: u32,
        /// New value
        value: f32,
    },
    /// Read the latest sample of every channel
    GetFrame,
    /// Read the label of one channel
    GetLabel(u32),
    /// Download the complete capture buffer
    Download,
}

/// How many bytes a command's response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSize {
    /// A fixed number of bytes
    Bytes(usize),
    /// This many bytes per channel of the answering device
    PerChannel(usize),
    /// The device's complete capture buffer
    FullBuffer,
}

impl ResponseSize {
    /// Resolve against one device's dimensions. `None` means "full buffer".
    pub fn resolve(self, channels: u16) -> Option<usize> {
        match self {
            ResponseSize::Bytes(n) => Some(n),
            ResponseSize::PerChannel(n) => Some(usize::from(channels) * n),
            ResponseSize::FullBuffer => None,
        }
    }
}

impl Command {
    /// ASCII opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Handshake => b'h',
            Command::GetTiming => b't',
            Command::SetTiming { .. } => b'T',
            Command::GetState => b's',
            Command::SetState(_) => b'S',
            Command::GetRegister(_) => b'b',
            Command::SetRegister { .. } => b'B',
            Command::GetFrame => b'f',
            Command::GetLabel(_) => b'l',
            Command::Download => b'd',
        }
    }

    /// Encode into a 9-byte frame.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(FRAME_LEN);
        frame.put_u8(self.opcode());
        match *self {
            Command::SetTiming {
                divider,
                pretrigger,
            } => {
                frame.put_u32_le(divider);
                frame.put_u32_le(pretrigger);
            }
            Command::SetState(state) => {
                frame.put_bytes(PAD, 7);
                frame.put_u8(state);
            }
            Command::GetRegister(index) | Command::GetLabel(index) => {
                frame.put_bytes(PAD, 4);
                frame.put_u32_le(index);
            }
            Command::SetRegister { index, value } => {
                frame.put_u32_le(index);
                frame.put_f32_le(value);
            }
            Command::Handshake
            | Command::GetTiming
            | Command::GetState
            | Command::GetFrame
            | Command::Download => {}
        }
        frame.resize(FRAME_LEN, PAD);
        frame.freeze()
    }

    /// Expected response size.
    pub fn response_size(&self) -> ResponseSize {
        match self {
            Command::Handshake => ResponseSize::Bytes(HANDSHAKE_RESPONSE_LEN),
            Command::GetTiming => ResponseSize::Bytes(8),
            Command::GetRegister(_) => ResponseSize::Bytes(4),
            Command::SetTiming { .. }
            | Command::GetState
            | Command::SetState(_)
            | Command::SetRegister { .. } => ResponseSize::Bytes(1),
            Command::GetFrame => ResponseSize::PerChannel(BYTES_PER_SAMPLE),
            Command::GetLabel(_) => ResponseSize::Bytes(LABEL_RESPONSE_LEN),
            Command::Download => ResponseSize::FullBuffer,
        }
    }
}

/// Decoded handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Number of channels
    pub channels: u16,
    /// Samples per channel in the capture buffer
    pub buffer_length: u16,
    /// Device name, empty when the firmware leaves it blank
    pub name: String,
}

impl Handshake {
    /// Decode a 14-byte handshake response.
    pub fn decode(response: &[u8]) -> Option<Self> {
        if response.len() != HANDSHAKE_RESPONSE_LEN {
            return None;
        }
        let mut buf = response;
        let channels = buf.get_u16_le();
        let buffer_length = buf.get_u16_le();
        Some(Self {
            channels,
            buffer_length,
            name: decode_text(&buf[..DEVICE_NAME_LEN]),
        })
    }

    /// Encode a handshake response, as the firmware sends it.
    pub fn encode(&self) -> Bytes {
        let mut response = BytesMut::with_capacity(HANDSHAKE_RESPONSE_LEN);
        response.put_u16_le(self.channels);
        response.put_u16_le(self.buffer_length);
        let name = self.name.as_bytes();
        let len = name.len().min(DEVICE_NAME_LEN);
        response.put_slice(&name[..len]);
        response.resize(HANDSHAKE_RESPONSE_LEN, 0);
        response.freeze()
    }
}

/// Decode a NUL padded UTF-8 string. Invalid sequences are dropped.
pub fn decode_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace(char::REPLACEMENT_CHARACTER, "")
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Decode the 8-byte timing response into `(divider, pretrigger)`.
pub fn decode_timing(response: &[u8]) -> Option<(u32, u32)> {
    if response.len() != 8 {
        return None;
    }
    let mut buf = response;
    Some((buf.get_u32_le(), buf.get_u32_le()))
}

/// Decode a single little-endian f32.
pub fn decode_f32(response: &[u8]) -> Option<f32> {
    if response.len() != BYTES_PER_SAMPLE {
        return None;
    }
    let mut buf = response;
    Some(buf.get_f32_le())
}

/// Decode a sequence of little-endian f32 values; trailing partial bytes are ignored.
pub fn decode_f32s(response: &[u8]) -> Vec<f32> {
    response
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|mut chunk| chunk.get_f32_le())
        .collect()
}

/// Whether a setter response is a single acknowledge byte.
pub fn is_ack(response: &[u8]) -> bool {
    response == [ACK]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_frames_are_padded_with_ascii_zero() {
        assert_eq!(&Command::Handshake.encode()[..], b"h00000000");
        assert_eq!(&Command::GetTiming.encode()[..], b"t00000000");
        assert_eq!(&Command::GetState.encode()[..], b"s00000000");
        assert_eq!(&Command::GetFrame.encode()[..], b"f00000000");
        assert_eq!(&Command::Download.encode()[..], b"d00000000");
    }

    #[test]
    fn payload_frames_are_little_endian() {
        assert_eq!(
            &Command::SetTiming {
                divider: 50,
                pretrigger: 0x0102_0304
            }
            .encode()[..],
            &[b'T', 50, 0, 0, 0, 4, 3, 2, 1]
        );
        assert_eq!(&Command::SetState(2).encode()[..], b"S0000000\x02");
        assert_eq!(&Command::GetRegister(7).encode()[..], b"b0000\x07\x00\x00\x00");
        assert_eq!(&Command::GetLabel(3).encode()[..], b"l0000\x03\x00\x00\x00");

        let frame = Command::SetRegister {
            index: 1,
            value: 1.5,
        }
        .encode();
        assert_eq!(frame[0], b'B');
        assert_eq!(&frame[1..5], &1u32.to_le_bytes());
        assert_eq!(&frame[5..9], &1.5f32.to_le_bytes());
    }

    #[test]
    fn every_frame_is_nine_bytes() {
        let commands = [
            Command::Handshake,
            Command::SetState(1),
            Command::GetRegister(u32::MAX),
            Command::SetRegister {
                index: 0,
                value: -1.0,
            },
            Command::GetLabel(0),
        ];
        for command in commands {
            assert_eq!(command.encode().len(), FRAME_LEN, "{command:?}");
        }
    }

    #[test]
    fn handshake_decodes_dimensions_and_trims_name() {
        let mut raw = vec![10, 0, 0xe8, 0x03];
        raw.extend_from_slice(b"scope-a\0\0\0");
        let handshake = Handshake::decode(&raw).unwrap();
        assert_eq!(handshake.channels, 10);
        assert_eq!(handshake.buffer_length, 1000);
        assert_eq!(handshake.name, "scope-a");

        assert!(Handshake::decode(&raw[..13]).is_none());
    }

    #[test]
    fn handshake_name_drops_invalid_utf8() {
        let mut raw = vec![1, 0, 1, 0];
        raw.extend_from_slice(&[0xff, b'a', b'b', b' ', 0, 0, 0, 0, 0, 0]);
        assert_eq!(Handshake::decode(&raw).unwrap().name, "ab");
    }

    #[test]
    fn handshake_encode_matches_decode() {
        let handshake = Handshake {
            channels: 4,
            buffer_length: 256,
            name: "left".into(),
        };
        let encoded = handshake.encode();
        assert_eq!(encoded.len(), HANDSHAKE_RESPONSE_LEN);
        assert_eq!(Handshake::decode(&encoded), Some(handshake));
    }

    #[test]
    fn response_sizes() {
        assert_eq!(Command::GetTiming.response_size().resolve(10), Some(8));
        assert_eq!(Command::GetFrame.response_size().resolve(10), Some(40));
        assert_eq!(Command::Download.response_size().resolve(10), None);
    }

    #[test]
    fn decoders_reject_wrong_lengths() {
        assert_eq!(decode_timing(&[1, 0, 0, 0, 2, 0, 0, 0]), Some((1, 2)));
        assert_eq!(decode_timing(&[1, 0, 0, 0]), None);
        assert_eq!(decode_f32(&0.25f32.to_le_bytes()), Some(0.25));
        assert_eq!(decode_f32(&[0, 0]), None);
        assert!(is_ack(&[0]));
        assert!(!is_ack(&[1]));
        assert!(!is_ack(&[]));
    }

    #[test]
    fn decode_f32s_ignores_trailing_bytes() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1.0f32.to_le_bytes());
        raw.extend_from_slice(&2.0f32.to_le_bytes());
        raw.push(9);
        assert_eq!(decode_f32s(&raw), vec![1.0, 2.0]);
    }
}
