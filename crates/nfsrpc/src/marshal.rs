//! Outbound record marking.
//!
//! A message is written as one or more fragments, each prefixed with a
//! big-endian word whose top bit flags the last fragment of the message and
//! whose low 31 bits hold the fragment length. Regions of the message are never
//! split: a fragment holds as many whole regions as fit under the maximum
//! fragment size.

use {
    crate::{error::Error, utils::Result, xdr::XdrBuffer},
    byteorder::{BigEndian, ByteOrder},
    bytes::{BufMut, Bytes, BytesMut},
};

/// Set on the header of the final fragment of a message.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Fragment length bits of a fragment header.
pub const FRAGMENT_LEN_MASK: u32 = 0x7fff_ffff;

/// Size of a fragment header.
pub const FRAGMENT_HEADER_LEN: usize = 4;

/// Default maximum fragment body. Some servers handle many small fragments per
/// message badly.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 1 << 20;

/// Build a fragment header word.
pub fn fragment_header(len: usize, last: bool) -> u32 {
    let len = len as u32 & FRAGMENT_LEN_MASK;
    if last { len | LAST_FRAGMENT } else { len }
}

/// Split a fragment header word into (last, length).
pub fn parse_fragment_header(word: u32) -> (bool, usize) {
    (word & LAST_FRAGMENT != 0, (word & FRAGMENT_LEN_MASK) as usize)
}

/// Transaction id of a reassembled message.
pub fn xid_of(message: &[u8]) -> Option<u32> {
    if message.len() < 4 {
        return None;
    }
    Some(BigEndian::read_u32(&message[..4]))
}

/// A message split into fragments, ready to be written.
///
/// `chunks` alternates between fragment header words and the regions that make
/// up each fragment's body; the regions share memory with the original
/// message.
#[derive(Clone, Debug)]
pub struct Marshalled {
    xid: u32,
    chunks: Vec<Bytes>,
    fragments: usize,
    wire_len: usize,
}

impl Marshalled {
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Number of fragments the message was split into.
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Bytes this message occupies on the wire, fragment headers included.
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Copy every chunk into `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len);
        for chunk in &self.chunks {
            dst.put_slice(chunk);
        }
    }
}

struct FragmentBuilder {
    chunks: Vec<Bytes>,
    current: Vec<Bytes>,
    current_len: usize,
    fragments: usize,
    wire_len: usize,
}

impl FragmentBuilder {
    fn flush(&mut self, last: bool) {
        let mut header = BytesMut::with_capacity(FRAGMENT_HEADER_LEN);
        header.put_u32(fragment_header(self.current_len, last));

        self.chunks.push(header.freeze());
        self.chunks.append(&mut self.current);
        self.wire_len += FRAGMENT_HEADER_LEN + self.current_len;
        self.current_len = 0;
        self.fragments += 1;
    }
}

fn oversized(len: usize, max_fragment_size: usize) -> Error {
    Error::Encoding(format!(
        "message region of {} bytes exceeds the maximum fragment size of {} bytes",
        len, max_fragment_size
    ))
}

/// Fragment `message` for the wire.
///
/// Regions accumulate into the current fragment while they fit; on overflow
/// the fragment is flushed and a new one started. The final fragment always
/// carries the last-fragment flag, even when its body is empty.
pub fn marshal(message: XdrBuffer, max_fragment_size: usize) -> Result<Marshalled> {
    if max_fragment_size == 0 || max_fragment_size > FRAGMENT_LEN_MASK as usize {
        return Err(Error::Encoding(format!(
            "invalid maximum fragment size {}",
            max_fragment_size
        )));
    }
    let xid = message
        .xid()
        .ok_or_else(|| Error::Encoding("message is too short to carry an xid".to_owned()))?;

    let (header, payloads) = message.into_parts();
    let mut builder = FragmentBuilder {
        chunks: Vec::with_capacity(2 * (payloads.len() + 1)),
        current: Vec::new(),
        current_len: 0,
        fragments: 0,
        wire_len: 0,
    };

    let regions = std::iter::once(header.freeze())
        .chain(payloads)
        .filter(|region| !region.is_empty());
    for region in regions {
        if builder.current_len + region.len() > max_fragment_size {
            if builder.current.is_empty() {
                return Err(oversized(region.len(), max_fragment_size));
            }
            builder.flush(false);
            if region.len() > max_fragment_size {
                return Err(oversized(region.len(), max_fragment_size));
            }
        }
        builder.current_len += region.len();
        builder.current.push(region);
    }
    builder.flush(true);

    Ok(Marshalled {
        xid,
        chunks: builder.chunks,
        fragments: builder.fragments,
        wire_len: builder.wire_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(header_len: usize, payloads: &[usize]) -> XdrBuffer {
        let mut msg = XdrBuffer::new();
        msg.put_u32(0x1234_5678);
        for w in 1..header_len / 4 {
            msg.put_u32(w as u32);
        }
        for (i, len) in payloads.iter().enumerate() {
            msg.add_payload(Bytes::from(vec![i as u8; *len]));
        }
        msg
    }

    fn headers(m: &Marshalled) -> Vec<(bool, usize)> {
        let mut out = Vec::new();
        let mut idx = 0;
        let chunks = m.chunks();
        while idx < chunks.len() {
            let (last, len) = parse_fragment_header(BigEndian::read_u32(&chunks[idx]));
            out.push((last, len));
            idx += 1;
            let mut body = 0;
            while body < len {
                body += chunks[idx].len();
                idx += 1;
            }
            assert_eq!(body, len);
        }
        out
    }

    #[test]
    fn header_word_layout() {
        assert_eq!(fragment_header(5, true), 0x8000_0005);
        assert_eq!(fragment_header(5, false), 5);
        assert_eq!(parse_fragment_header(0x8000_0010), (true, 16));
        assert_eq!(parse_fragment_header(0x7fff_ffff), (false, 0x7fff_ffff));
    }

    #[test]
    fn small_message_is_one_fragment() {
        let m = marshal(message(8, &[]), 16).unwrap();
        assert_eq!(m.xid(), 0x1234_5678);
        assert_eq!(m.fragments(), 1);
        assert_eq!(headers(&m), vec![(true, 8)]);
        assert_eq!(m.wire_len(), 12);
    }

    #[test]
    fn regions_exactly_filling_a_fragment_stay_together() {
        let m = marshal(message(8, &[8]), 16).unwrap();
        assert_eq!(headers(&m), vec![(true, 16)]);
    }

    #[test]
    fn overflow_starts_new_fragment() {
        let m = marshal(message(8, &[8, 8, 16, 1]), 16).unwrap();
        assert_eq!(
            headers(&m),
            vec![(false, 16), (false, 8), (false, 16), (true, 1)]
        );
        assert_eq!(m.wire_len(), 4 * 4 + 41);
    }

    #[test]
    fn oversized_region_is_rejected() {
        assert!(matches!(
            marshal(message(8, &[17]), 16),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(
            marshal(message(20, &[]), 16),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn empty_payloads_do_not_produce_fragments() {
        let m = marshal(message(8, &[0, 0]), 16).unwrap();
        assert_eq!(headers(&m), vec![(true, 8)]);
    }

    #[test]
    fn message_without_xid_is_rejected() {
        assert!(matches!(
            marshal(XdrBuffer::new(), 16),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn write_to_concatenates_chunks() {
        let m = marshal(message(4, &[2]), 16).unwrap();
        let mut dst = BytesMut::new();
        m.write_to(&mut dst);
        assert_eq!(
            &dst[..],
            &[0x80, 0, 0, 6, 0x12, 0x34, 0x56, 0x78, 0, 0][..]
        );
    }
}
