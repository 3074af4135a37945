//! XDR message buffer.
//!
//! An outbound RPC message is a contiguous header region followed by zero or
//! more independent payload regions. Payloads are kept as separate `Bytes` so
//! large write data never has to be copied into the header buffer; the
//! record-marking layer walks the regions in order when it builds fragments.
//! Fields put after a payload go into a new region behind it, so regions
//! always hold the bytes in the order they were written.

use {
    crate::{error::Error, utils::Result},
    byteorder::{BigEndian, ByteOrder},
    bytes::{Buf, BufMut, Bytes, BytesMut},
};

/// XDR pads every variable length item to a multiple of four bytes.
const XDR_UNIT: usize = 4;

fn padding(len: usize) -> usize {
    (XDR_UNIT - len % XDR_UNIT) % XDR_UNIT
}

/// Outbound message under construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdrBuffer {
    header: BytesMut,
    payloads: Vec<Bytes>,
    // fields put after the last payload
    tail: BytesMut,
}

impl XdrBuffer {
    pub fn new() -> XdrBuffer {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> XdrBuffer {
        XdrBuffer {
            header: BytesMut::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.current().put_u32(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.current().put_i32(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.current().put_u64(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u32(v as u32)
    }

    /// Fixed length opaque data: the bytes plus padding, no length word.
    pub fn put_fixed_opaque(&mut self, data: &[u8]) -> &mut Self {
        let region = self.current();
        region.put_slice(data);
        region.put_bytes(0, padding(data.len()));
        self
    }

    /// Variable length opaque data: length word, bytes, padding.
    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.put_fixed_opaque(data)
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.put_opaque(s.as_bytes())
    }

    /// Region that `put_*` writes to: the header until the first payload,
    /// the tail after it.
    fn current(&mut self) -> &mut BytesMut {
        if self.payloads.is_empty() {
            &mut self.header
        } else {
            &mut self.tail
        }
    }

    /// Append an independent region after everything written so far.
    pub fn add_payload(&mut self, payload: Bytes) -> &mut Self {
        if !self.tail.is_empty() {
            let tail = self.tail.split().freeze();
            self.payloads.push(tail);
        }
        self.payloads.push(payload);
        self
    }

    /// Transaction id, the first word of every RPC message.
    pub fn xid(&self) -> Option<u32> {
        if self.header.len() < 4 {
            return None;
        }
        Some(BigEndian::read_u32(&self.header[..4]))
    }

    pub fn set_xid(&mut self, xid: u32) -> Result<()> {
        if self.header.len() < 4 {
            return Err(Error::Encoding(
                "message is too short to carry an xid".to_owned(),
            ));
        }
        BigEndian::write_u32(&mut self.header[..4], xid);
        Ok(())
    }

    /// Split into the header region and the regions that follow it.
    pub fn into_parts(mut self) -> (BytesMut, Vec<Bytes>) {
        if !self.tail.is_empty() {
            self.payloads.push(self.tail.freeze());
        }
        (self.header, self.payloads)
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Header followed by each payload and any trailing fields, as
    /// independent regions.
    pub fn regions(&self) -> impl Iterator<Item = &[u8]> {
        let tail = (!self.tail.is_empty()).then_some(&self.tail[..]);
        std::iter::once(&self.header[..])
            .chain(self.payloads.iter().map(|p| &p[..]))
            .chain(tail)
    }

    /// Total encoded length of all regions.
    pub fn len(&self) -> usize {
        self.header.len() + self.payloads.iter().map(Bytes::len).sum::<usize>() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for region in self.regions() {
            out.put_slice(region);
        }
        out.freeze()
    }
}

impl From<Bytes> for XdrBuffer {
    fn from(bytes: Bytes) -> Self {
        XdrBuffer {
            header: BytesMut::from(&bytes[..]),
            ..Default::default()
        }
    }
}

/// Cursor over a received message.
#[derive(Clone, Debug)]
pub struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    pub fn new(buf: Bytes) -> XdrReader {
        XdrReader { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Protocol(format!(
                "truncated message reading {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::Protocol(format!("invalid xdr bool {}", v))),
        }
    }

    /// Fixed length opaque data; the padding is consumed and discarded.
    pub fn get_fixed_opaque(&mut self, len: usize) -> Result<Bytes> {
        let padded = len + padding(len);
        self.need(padded, "opaque")?;
        let data = self.buf.split_to(len);
        self.buf.advance(padded - len);
        Ok(data)
    }

    pub fn get_opaque(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.get_fixed_opaque(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let data = self.get_opaque()?;
        String::from_utf8(data.to_vec())
            .map_err(|e| Error::Protocol(format!("invalid utf-8 in xdr string: {}", e)))
    }

    /// Whatever has not been read yet.
    pub fn into_inner(self) -> Bytes {
        self.buf
    }
}
