//! Record marking codec for the read side of a connection.
//!
//! Bytes arrive in whatever chunks the socket hands out: a read may end in the
//! middle of a fragment header, in the middle of a body, or carry several
//! fragments at once. [`scan`] walks the buffered bytes with an explicit
//! [`FrameState`] that the caller threads from one call to the next, so the
//! reassembly logic can be exercised with arbitrary chunk boundaries without a
//! socket.

use {
    crate::{
        io_err,
        marshal::{self, FRAGMENT_HEADER_LEN, Marshalled},
        utils::Result,
        xdr::XdrBuffer,
    },
    byteorder::{BigEndian, ByteOrder},
    bytes::{BufMut, Bytes, BytesMut},
    std::io,
    tokio_util::codec::{Decoder, Encoder},
};

/// Largest reassembled message accepted from a peer unless configured
/// otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Progress through the fragments of one message.
///
/// `confirmed` is how far into the buffered bytes complete, non-final
/// fragments (headers included) have been consumed; `total` is the sum of
/// their body lengths.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameState {
    confirmed: usize,
    total: usize,
}

impl FrameState {
    pub fn confirmed(&self) -> usize {
        self.confirmed
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Outcome of a [`scan`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scan {
    /// The message is not complete yet; keep the returned state and call again
    /// once more bytes are buffered.
    NeedMore(FrameState),
    /// A whole message is buffered. `consumed` bytes from the start of the
    /// buffer hold its fragments; `len` is the length of the concatenated
    /// bodies.
    Complete { consumed: usize, len: usize },
}

/// Look for the end of the message that starts at the beginning of `buf`.
///
/// Fragments already confirmed by an earlier call are not looked at again.
pub fn scan(mut state: FrameState, buf: &[u8]) -> Scan {
    loop {
        let header_end = state.confirmed + FRAGMENT_HEADER_LEN;
        if buf.len() < header_end {
            return Scan::NeedMore(state);
        }

        let word = BigEndian::read_u32(&buf[state.confirmed..header_end]);
        let (last, len) = marshal::parse_fragment_header(word);
        if buf.len() < header_end + len {
            return Scan::NeedMore(state);
        }

        state.confirmed = header_end + len;
        state.total += len;
        if last {
            return Scan::Complete {
                consumed: state.confirmed,
                len: state.total,
            };
        }
    }
}

/// Strip the fragment headers from a run of complete fragments.
///
/// `raw` must be exactly the bytes reported by [`Scan::Complete`].
pub fn assemble(raw: Bytes, len: usize) -> Bytes {
    let first = marshal::parse_fragment_header(BigEndian::read_u32(&raw[..FRAGMENT_HEADER_LEN]));
    if first.0 {
        // single fragment, no copy needed
        return raw.slice(FRAGMENT_HEADER_LEN..FRAGMENT_HEADER_LEN + first.1);
    }

    let mut message = BytesMut::with_capacity(len);
    let mut at = 0;
    while at < raw.len() {
        let word = BigEndian::read_u32(&raw[at..at + FRAGMENT_HEADER_LEN]);
        let (_, frag_len) = marshal::parse_fragment_header(word);
        at += FRAGMENT_HEADER_LEN;
        message.put_slice(&raw[at..at + frag_len]);
        at += frag_len;
    }
    message.freeze()
}

/// Decodes record-marked messages and encodes marshalled ones.
///
/// The decoder yields each reassembled message with fragment headers
/// removed. The encoder writes [`Marshalled`] messages as-is, or marshals an
/// [`XdrBuffer`] first using the configured maximum fragment size.
#[derive(Clone, Debug)]
pub struct RecordMarkingCodec {
    state: FrameState,
    max_message_size: usize,
    max_fragment_size: usize,
}

impl Default for RecordMarkingCodec {
    fn default() -> Self {
        RecordMarkingCodec::new()
    }
}

impl RecordMarkingCodec {
    pub fn new() -> RecordMarkingCodec {
        RecordMarkingCodec {
            state: FrameState::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_fragment_size: marshal::DEFAULT_MAX_FRAGMENT_SIZE,
        }
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size;
        self
    }

    /// Marshal with this codec's fragment size.
    pub fn marshal(&self, message: XdrBuffer) -> Result<Marshalled> {
        marshal::marshal(message, self.max_fragment_size)
    }

    fn check_size(&self, src: &BytesMut) -> io::Result<()> {
        // A message may not announce more body bytes than we are willing to
        // hold, counting the fragment in progress.
        let at = self.state.confirmed;
        if src.len() >= at + FRAGMENT_HEADER_LEN {
            let word = BigEndian::read_u32(&src[at..at + FRAGMENT_HEADER_LEN]);
            let (_, len) = marshal::parse_fragment_header(word);
            if self.state.total + len > self.max_message_size {
                return Err(io_err!(
                    InvalidData,
                    format!(
                        "incoming message exceeds {} bytes",
                        self.max_message_size
                    )
                ));
            }
        }
        Ok(())
    }
}

impl Decoder for RecordMarkingCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        loop {
            self.check_size(src)?;
            match scan(self.state, src) {
                Scan::NeedMore(state) => {
                    let progressed = state != self.state;
                    self.state = state;
                    if !progressed {
                        return Ok(None);
                    }
                    // check the next fragment header before waiting on it
                }
                Scan::Complete { consumed, len } => {
                    self.state = FrameState::default();
                    let raw = src.split_to(consumed).freeze();
                    return Ok(Some(assemble(raw, len)));
                }
            }
        }
    }
}

impl Encoder<Marshalled> for RecordMarkingCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Marshalled, dst: &mut BytesMut) -> io::Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

impl Encoder<XdrBuffer> for RecordMarkingCodec {
    type Error = io::Error;

    fn encode(&mut self, item: XdrBuffer, dst: &mut BytesMut) -> io::Result<()> {
        let marshalled = self
            .marshal(item)
            .map_err(|e| io_err!(InvalidInput, e.to_string()))?;
        marshalled.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> XdrBuffer {
        let mut msg = XdrBuffer::new();
        msg.put_u32(0xcafe_0001);
        let mut payloads = Vec::new();
        let mut left = len.saturating_sub(4);
        let mut n = 0u8;
        while left > 0 {
            let chunk = left.min(7);
            payloads.push(Bytes::from(vec![n; chunk]));
            left -= chunk;
            n = n.wrapping_add(1);
        }
        for p in payloads {
            msg.add_payload(p);
        }
        msg
    }

    fn encode(msg: &XdrBuffer, max_fragment: usize) -> BytesMut {
        let mut codec = RecordMarkingCodec::new().max_fragment_size(max_fragment);
        let mut dst = BytesMut::new();
        codec.encode(msg.clone(), &mut dst).unwrap();
        dst
    }

    fn feed_in_chunks(wire: &[u8], chunk: usize) -> Vec<Bytes> {
        let mut codec = RecordMarkingCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn scan_waits_for_header_and_body() {
        let wire = [0x80, 0, 0, 4, 1, 2, 3, 4];
        let state = FrameState::default();
        assert_eq!(scan(state, &wire[..3]), Scan::NeedMore(state));
        assert_eq!(scan(state, &wire[..7]), Scan::NeedMore(state));
        assert_eq!(
            scan(state, &wire),
            Scan::Complete {
                consumed: 8,
                len: 4
            }
        );
    }

    #[test]
    fn scan_confirms_non_final_fragments() {
        let wire = [0, 0, 0, 2, 1, 2, 0x80, 0, 0, 1, 3];
        let state = match scan(FrameState::default(), &wire[..8]) {
            Scan::NeedMore(state) => state,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(state.confirmed(), 6);
        assert_eq!(state.total(), 2);
        assert_eq!(
            scan(state, &wire),
            Scan::Complete {
                consumed: 11,
                len: 3
            }
        );
    }

    #[test]
    fn round_trip_below_at_and_above_fragment_size() {
        let max = 64;
        for size in [4, 12, 63, 64, 65, 200, 1000] {
            let msg = sample(size);
            let wire = encode(&msg, max);
            let decoded = feed_in_chunks(&wire, wire.len());
            assert_eq!(decoded.len(), 1, "size {}", size);
            assert_eq!(decoded[0], msg.to_bytes(), "size {}", size);
        }
    }

    #[test]
    fn many_fragments_are_produced_above_the_limit() {
        let msg = sample(1000);
        let marshalled = marshal::marshal(msg, 64).unwrap();
        assert!(marshalled.fragments() > 10);
    }

    #[test]
    fn byte_at_a_time_matches_whole_feed() {
        let mut wire = BytesMut::new();
        let first = sample(300);
        let second = sample(5);
        wire.extend_from_slice(&encode(&first, 32));
        wire.extend_from_slice(&encode(&second, 32));

        let whole = feed_in_chunks(&wire, wire.len());
        for chunk in [1, 2, 3, 5, 7, 33] {
            assert_eq!(feed_in_chunks(&wire, chunk), whole, "chunk {}", chunk);
        }
        assert_eq!(whole, vec![first.to_bytes(), second.to_bytes()]);
    }

    #[test]
    fn empty_final_fragment_ends_message() {
        let wire = [0, 0, 0, 4, 0, 0, 0, 9, 0x80, 0, 0, 0];
        let decoded = feed_in_chunks(&wire, 1);
        assert_eq!(decoded, vec![Bytes::from_static(&[0, 0, 0, 9])]);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut codec = RecordMarkingCodec::new().max_message_size(8);
        let mut buf = BytesMut::from(&[0, 0, 0, 6, 1, 2, 3, 4, 5, 6, 0x80, 0, 0, 6][..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
