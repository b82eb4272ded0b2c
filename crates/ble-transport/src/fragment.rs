//! Fragment framing for payloads larger than the link transmission unit
//!
//! Every fragment carries a 5-byte header followed by a slice of the payload:
//!
//! ```text
//! [type: 1][sequence: 2 BE][total: 2 BE][payload ...]
//! ```
//!
//! Single-fragment payloads still carry a header (type START, total 1) so the
//! receiver handles every transfer the same way.

use crate::error::{FrameError, TransportError, TransportResult};
use tracing::{debug, warn};

/// Size of the fragment header in bytes
pub const HEADER_SIZE: usize = 5;

/// Smallest unit size that can carry at least one payload byte
pub const MIN_UNIT_SIZE: u32 = HEADER_SIZE as u32 + 1;

/// Sequence numbers are 16-bit, so a transfer holds at most this many fragments
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Fragment count above which a payload is logged as expensive to send
const HIGH_FRAGMENT_COUNT: usize = 10;

/// Position of a fragment inside its transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Start = 0x01,
    Continue = 0x02,
    End = 0x03,
}

impl FrameType {
    /// Type implied by a fragment's position
    pub fn for_position(sequence: u16, total: u16) -> Self {
        if sequence == 0 {
            FrameType::Start
        } else if sequence.checked_add(1) == Some(total) {
            FrameType::End
        } else {
            FrameType::Continue
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Start),
            0x02 => Ok(FrameType::Continue),
            0x03 => Ok(FrameType::End),
            other => Err(FrameError::InvalidType(other)),
        }
    }
}

/// Decoded fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub sequence: u16,
    pub total: u16,
}

impl FrameHeader {
    pub fn new(sequence: u16, total: u16) -> Self {
        Self {
            frame_type: FrameType::for_position(sequence, total),
            sequence,
            total,
        }
    }

    /// Encode the header in network byte order
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let seq = self.sequence.to_be_bytes();
        let total = self.total.to_be_bytes();
        [self.frame_type as u8, seq[0], seq[1], total[0], total[1]]
    }

    /// Parse a frame into its header and payload slice
    ///
    /// Validates length, type and `sequence < total`; anything else about the
    /// transfer is the reassembler's business.
    pub fn parse(frame: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
        if frame.len() < HEADER_SIZE {
            return Err(FrameError::FrameTooShort {
                len: frame.len(),
                min: HEADER_SIZE,
            });
        }

        let frame_type = FrameType::try_from(frame[0])?;
        let sequence = u16::from_be_bytes([frame[1], frame[2]]);
        let total = u16::from_be_bytes([frame[3], frame[4]]);

        if sequence >= total {
            return Err(FrameError::SequenceOutOfRange { sequence, total });
        }

        Ok((
            FrameHeader {
                frame_type,
                sequence,
                total,
            },
            &frame[HEADER_SIZE..],
        ))
    }
}

/// Splits payloads into frames sized for one link
///
/// The unit size only changes through [`Fragmenter::update_unit_size`], which
/// takes `&mut self`; a payload that is being fragmented always sees a single
/// unit size.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    unit_size: u32,
}

impl Fragmenter {
    /// Create a fragmenter for the given transmission unit size
    pub fn new(unit_size: u32) -> TransportResult<Self> {
        check_unit_size(unit_size)?;
        Ok(Self { unit_size })
    }

    pub fn unit_size(&self) -> u32 {
        self.unit_size
    }

    /// Payload bytes carried by each full fragment
    pub fn payload_per_frame(&self) -> usize {
        self.unit_size as usize - HEADER_SIZE
    }

    /// Replace the unit size after a transmission-unit negotiation completes
    pub fn update_unit_size(&mut self, unit_size: u32) -> TransportResult<()> {
        check_unit_size(unit_size)?;
        if unit_size != self.unit_size {
            debug!(
                "Fragmenter unit size updated: {} -> {}",
                self.unit_size, unit_size
            );
        }
        self.unit_size = unit_size;
        Ok(())
    }

    /// Split a payload into framed fragments
    pub fn fragment(&self, payload: &[u8]) -> TransportResult<Vec<Vec<u8>>> {
        fragment(payload, self.unit_size)
    }

    /// Fragment count, header bytes and header overhead percentage for a payload size
    pub fn overhead(&self, payload_len: usize) -> (usize, usize, f64) {
        let fragments = payload_len.div_ceil(self.payload_per_frame());
        let header_bytes = fragments * HEADER_SIZE;
        let percent = if payload_len > 0 {
            header_bytes as f64 / payload_len as f64 * 100.0
        } else {
            0.0
        };
        (fragments, header_bytes, percent)
    }
}

fn check_unit_size(unit_size: u32) -> TransportResult<()> {
    if unit_size < MIN_UNIT_SIZE {
        return Err(TransportError::InvalidInput(format!(
            "unit size {} too small for fragmentation (min {})",
            unit_size, MIN_UNIT_SIZE
        )));
    }
    Ok(())
}

/// Split `payload` into frames of at most `unit_size` bytes
pub fn fragment(payload: &[u8], unit_size: u32) -> TransportResult<Vec<Vec<u8>>> {
    if payload.is_empty() {
        return Err(TransportError::InvalidInput(
            "cannot fragment empty payload".to_string(),
        ));
    }
    check_unit_size(unit_size)?;

    let per_frame = unit_size as usize - HEADER_SIZE;
    let total = payload.len().div_ceil(per_frame);

    if total > MAX_FRAGMENTS {
        return Err(TransportError::InvalidInput(format!(
            "payload of {} bytes needs {} fragments (max {}, {} bytes at unit size {})",
            payload.len(),
            total,
            MAX_FRAGMENTS,
            MAX_FRAGMENTS * per_frame,
            unit_size
        )));
    }

    if total > HIGH_FRAGMENT_COUNT {
        warn!(
            "High fragment count: {} fragments for {} bytes",
            total,
            payload.len()
        );
    } else if total > 1 {
        debug!(
            "Fragmenting {} bytes into {} fragments (unit size {})",
            payload.len(),
            total,
            unit_size
        );
    }

    let total_u16 = total as u16;
    let frames = payload
        .chunks(per_frame)
        .enumerate()
        .map(|(i, chunk)| {
            let header = FrameHeader::new(i as u16, total_u16);
            let mut frame = Vec::with_capacity(HEADER_SIZE + chunk.len());
            frame.extend_from_slice(&header.to_bytes());
            frame.extend_from_slice(chunk);
            frame
        })
        .collect();

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_layout() {
        let header = FrameHeader::new(0x0102, 0x0304);
        assert_eq!(header.to_bytes(), [0x02, 0x01, 0x02, 0x03, 0x04]);

        let (parsed, payload) = FrameHeader::parse(&[0x02, 0x01, 0x02, 0x03, 0x04, 0xAA]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &[0xAA]);
    }

    #[test]
    fn test_frame_types_follow_position() {
        let frames = fragment(&[7u8; 30], 15).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][0], FrameType::Start as u8);
        assert_eq!(frames[1][0], FrameType::Continue as u8);
        assert_eq!(frames[2][0], FrameType::End as u8);
    }

    #[test]
    fn test_single_fragment_is_start() {
        let frames = fragment(b"hello", 23).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..HEADER_SIZE], &[0x01, 0, 0, 0, 1]);
        assert_eq!(&frames[0][HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_boundary_sizes() {
        for unit in [23u32, 50, 185, 517] {
            let exact = vec![1u8; unit as usize - HEADER_SIZE];
            assert_eq!(fragment(&exact, unit).unwrap().len(), 1);

            let over = vec![1u8; unit as usize - HEADER_SIZE + 1];
            let frames = fragment(&over, unit).unwrap();
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[1].len(), HEADER_SIZE + 1);
        }
    }

    #[test]
    fn test_400_bytes_at_185() {
        let payload: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
        let frames = fragment(&payload, 185).unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![185, 185, 45]);
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            fragment(&[], 185),
            Err(TransportError::InvalidInput(_))
        ));
        assert!(matches!(
            fragment(&[1, 2, 3], HEADER_SIZE as u32),
            Err(TransportError::InvalidInput(_))
        ));
        assert!(fragment(&[1, 2, 3], MIN_UNIT_SIZE).is_ok());
    }

    #[test]
    fn test_too_many_fragments() {
        // one payload byte per frame
        let payload = vec![0u8; MAX_FRAGMENTS + 1];
        assert!(matches!(
            fragment(&payload, MIN_UNIT_SIZE),
            Err(TransportError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(
            FrameHeader::parse(&[0x01, 0, 0]).unwrap_err(),
            FrameError::FrameTooShort { len: 3, min: 5 }
        );
        assert_eq!(
            FrameHeader::parse(&[0x09, 0, 0, 0, 1]).unwrap_err(),
            FrameError::InvalidType(0x09)
        );
        assert_eq!(
            FrameHeader::parse(&[0x02, 0, 3, 0, 3]).unwrap_err(),
            FrameError::SequenceOutOfRange {
                sequence: 3,
                total: 3
            }
        );
        assert_eq!(
            FrameHeader::parse(&[0x01, 0, 0, 0, 0]).unwrap_err(),
            FrameError::SequenceOutOfRange {
                sequence: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_update_unit_size() {
        let mut fragmenter = Fragmenter::new(23).unwrap();
        assert_eq!(fragmenter.fragment(&[0u8; 100]).unwrap().len(), 6);

        fragmenter.update_unit_size(185).unwrap();
        assert_eq!(fragmenter.unit_size(), 185);
        assert_eq!(fragmenter.fragment(&[0u8; 100]).unwrap().len(), 1);

        assert!(fragmenter.update_unit_size(3).is_err());
        assert_eq!(fragmenter.unit_size(), 185);
    }

    #[test]
    fn test_overhead() {
        let fragmenter = Fragmenter::new(185).unwrap();
        let (count, bytes, pct) = fragmenter.overhead(400);
        assert_eq!(count, 3);
        assert_eq!(bytes, 15);
        assert!((pct - 3.75).abs() < f64::EPSILON);
        assert_eq!(fragmenter.overhead(0), (0, 0, 0.0));
    }
}
