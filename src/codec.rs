//! Wire framing of record streams.
//!
//! A connection carries the records of one partition from one node to another, followed by a single
//! end-of-stream marker. Two framings are supported:
//!
//! * [`Framing::Sentinel`]: raw [`RECORD_SIZE`] byte records without any length prefix, terminated by
//!   [`Record::SENTINEL`]. The sentinel travels as an ordinary record, so an all-zero data record cannot be
//!   transferred with this framing.
//! * [`Framing::Tagged`]: every frame starts with a tag byte. A data frame is [`TAG_DATA`] followed by the
//!   record bytes, an end frame is [`TAG_END`] followed by the sender node id as a big-endian `u32`.
//!
//! All nodes of a cluster must use the same framing.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::cluster::NodeId;
use crate::record::{Record, RECORD_SIZE};

/// Tag of a data frame.
pub const TAG_DATA: u8 = 0x01;
/// Tag of an end-of-stream frame.
pub const TAG_END: u8 = 0x00;

const NODE_ID_SIZE: usize = std::mem::size_of::<NodeId>();

/// Frame decoding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame starts with an unknown tag byte.
    UnknownTag(u8),
    /// Bytes received after the end-of-stream frame.
    TrailingData(usize),
    /// Stream ended in the middle of a frame.
    Truncated(usize),
}

impl Error for CodecError {}

impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownTag(tag) => write!(f, "unknown frame tag: {:#04x}", tag),
            CodecError::TrailingData(len) => write!(f, "{} bytes received after end of stream", len),
            CodecError::Truncated(len) => write!(f, "stream ended inside a frame ({} bytes pending)", len),
        }
    }
}

/// Record stream framing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Raw records terminated by an all-zero record.
    Sentinel,
    /// Tagged frames with an explicit end frame carrying the sender id.
    Tagged,
}

impl Framing {
    /// Checks if the end of a stream is signaled by [`Record::SENTINEL`] travelling as data.
    pub fn in_band_sentinel(&self) -> bool {
        matches!(self, Framing::Sentinel)
    }

    /// Appends an encoded data frame to the buffer.
    pub fn encode_record(&self, record: &Record, buf: &mut Vec<u8>) {
        if let Framing::Tagged = self {
            buf.push(TAG_DATA);
        }
        buf.extend_from_slice(record.as_bytes());
    }

    /// Appends an encoded end-of-stream frame to the buffer.
    pub fn encode_end(&self, sender: NodeId, buf: &mut Vec<u8>) {
        match self {
            Framing::Sentinel => buf.extend_from_slice(Record::SENTINEL.as_bytes()),
            Framing::Tagged => {
                buf.push(TAG_END);
                buf.extend_from_slice(&sender.to_be_bytes());
            }
        }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Tagged
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sentinel" => Ok(Framing::Sentinel),
            "tagged" => Ok(Framing::Tagged),
            _ => Err(format!("unknown framing: {}", s)),
        }
    }
}

impl Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Sentinel => write!(f, "sentinel"),
            Framing::Tagged => write!(f, "tagged"),
        }
    }
}

/// Decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A record. With [`Framing::Sentinel`] this includes the terminating sentinel record.
    Data(Record),
    /// End of stream sent by the given node.
    End(NodeId),
}

/// Incremental frame decoder.
///
/// Reassembles frames from byte chunks of arbitrary size: a frame may be split across any number of chunks and
/// a chunk may contain any number of frames.
pub struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        FrameDecoder {
            framing,
            buf: Vec::with_capacity(RECORD_SIZE * 16),
            pos: 0,
            finished: false,
        }
    }

    /// Appends received bytes to the decoder buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, or [`None`] if more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Frame>, CodecError> {
        let pending = &self.buf[self.pos..];
        if self.finished {
            return if pending.is_empty() {
                Ok(None)
            } else {
                Err(CodecError::TrailingData(pending.len()))
            };
        }

        let (frame, consumed) = match self.framing {
            Framing::Sentinel => match pending.get(..RECORD_SIZE).and_then(Record::from_slice) {
                Some(record) => {
                    self.finished = record.is_sentinel();
                    (Frame::Data(record), RECORD_SIZE)
                }
                None => return Ok(None),
            },
            Framing::Tagged => match pending.first() {
                None => return Ok(None),
                Some(&TAG_DATA) => match pending.get(1..1 + RECORD_SIZE).and_then(Record::from_slice) {
                    Some(record) => (Frame::Data(record), 1 + RECORD_SIZE),
                    None => return Ok(None),
                },
                Some(&TAG_END) => match pending.get(1..1 + NODE_ID_SIZE) {
                    Some(id) => {
                        let mut id_bytes = [0; NODE_ID_SIZE];
                        id_bytes.copy_from_slice(id);
                        self.finished = true;
                        (Frame::End(NodeId::from_be_bytes(id_bytes)), 1 + NODE_ID_SIZE)
                    }
                    None => return Ok(None),
                },
                Some(&tag) => return Err(CodecError::UnknownTag(tag)),
            },
        };

        self.pos += consumed;
        return Ok(Some(frame));
    }

    /// Checks if the end-of-stream frame has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Validates the decoder state once the stream is closed by the remote side.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            pending => Err(CodecError::Truncated(pending)),
        }
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;
    use rstest::*;

    use super::{CodecError, Frame, FrameDecoder, Framing};
    use crate::record::{Record, RECORD_SIZE};

    fn random_records(count: usize) -> Vec<Record> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let mut bytes = [0u8; RECORD_SIZE];
                rng.fill(&mut bytes[..]);
                bytes[0] |= 1;
                Record::new(bytes)
            })
            .collect()
    }

    fn encode_stream(framing: Framing, records: &[Record], sender: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            framing.encode_record(record, &mut buf);
        }
        framing.encode_end(sender, &mut buf);
        buf
    }

    fn decode_in_chunks(framing: Framing, bytes: &[u8], chunk_size: usize) -> Result<Vec<Frame>, CodecError> {
        let mut decoder = FrameDecoder::new(framing);
        let mut frames = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            decoder.extend(chunk);
            while let Some(frame) = decoder.decode()? {
                frames.push(frame);
            }
        }
        decoder.finish()?;
        Ok(frames)
    }

    #[rstest]
    #[case(Framing::Sentinel, 1)]
    #[case(Framing::Sentinel, 7)]
    #[case(Framing::Sentinel, RECORD_SIZE)]
    #[case(Framing::Sentinel, 4096)]
    #[case(Framing::Tagged, 1)]
    #[case(Framing::Tagged, 33)]
    #[case(Framing::Tagged, RECORD_SIZE + 1)]
    #[case(Framing::Tagged, 4096)]
    fn test_decoder_reassembles_split_frames(#[case] framing: Framing, #[case] chunk_size: usize) {
        let records = random_records(25);
        let bytes = encode_stream(framing, &records, 3);

        let frames = decode_in_chunks(framing, &bytes, chunk_size).unwrap();

        let mut expected: Vec<Frame> = records.into_iter().map(Frame::Data).collect();
        expected.push(match framing {
            Framing::Sentinel => Frame::Data(Record::SENTINEL),
            Framing::Tagged => Frame::End(3),
        });
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_sentinel_framing_cannot_carry_zero_record() {
        // known limitation: an all-zero data record ends the stream early
        let records = vec![Record::SENTINEL, random_records(1).remove(0)];
        let bytes = encode_stream(Framing::Sentinel, &records, 0);

        let result = decode_in_chunks(Framing::Sentinel, &bytes, bytes.len());

        assert_eq!(result, Err(CodecError::TrailingData(2 * RECORD_SIZE)));
    }

    #[test]
    fn test_tagged_framing_carries_zero_record() {
        let records = vec![Record::SENTINEL];
        let bytes = encode_stream(Framing::Tagged, &records, 1);

        let frames = decode_in_chunks(Framing::Tagged, &bytes, 64).unwrap();

        assert_eq!(frames, vec![Frame::Data(Record::SENTINEL), Frame::End(1)]);
    }

    #[test]
    fn test_unknown_tag() {
        let mut decoder = FrameDecoder::new(Framing::Tagged);
        decoder.extend(&[0x7f, 1, 2, 3]);

        assert_eq!(decoder.decode(), Err(CodecError::UnknownTag(0x7f)));
    }

    #[rstest]
    #[case(Framing::Sentinel, RECORD_SIZE / 2)]
    #[case(Framing::Tagged, 1)]
    #[case(Framing::Tagged, 3)]
    fn test_truncated_stream(#[case] framing: Framing, #[case] cut: usize) {
        let bytes = encode_stream(framing, &random_records(1), 0);
        let mut decoder = FrameDecoder::new(framing);
        decoder.extend(&bytes[..cut]);

        assert_eq!(decoder.decode(), Ok(None));
        assert_eq!(decoder.finish(), Err(CodecError::Truncated(cut)));
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_framing_from_str() {
        assert_eq!("sentinel".parse::<Framing>(), Ok(Framing::Sentinel));
        assert_eq!("tagged".parse::<Framing>(), Ok(Framing::Tagged));
        assert!("json".parse::<Framing>().is_err());
        assert_eq!(Framing::default(), Framing::Tagged);
    }
}
