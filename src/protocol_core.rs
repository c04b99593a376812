//! Shared framing logic for the connection and the packet codecs
//!
//! Frame format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4) | payload

use crate::error::{Error, Result};
use crate::protocol::{FRAME_HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};
use std::io::{Read, Write};

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    check_frame_size(size, MAX_FRAME_SIZE)
}

fn check_frame_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(Error::MaliciousInput(format!(
            "frame payload too large: {} bytes (max: {})",
            size, max
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(Error::MaliciousInput("invalid magic in frame header".into()));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(Error::MaliciousInput(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

pub fn write_frame<W: Write + ?Sized>(w: &mut W, t: u8, payload: &[u8]) -> Result<()> {
    write_frame_with_limit(w, t, payload, MAX_FRAME_SIZE)
}

/// [`write_frame`] for payloads allowed to exceed `MAX_FRAME_SIZE`, such as
/// sealed payloads carrying an authentication tag.
pub fn write_frame_with_limit<W: Write + ?Sized>(
    w: &mut W,
    t: u8,
    payload: &[u8],
    max: usize,
) -> Result<()> {
    check_frame_size(payload.len(), max)?;
    let hdr = build_frame_header(t, payload.len() as u32);
    w.write_all(&hdr)?;
    if !payload.is_empty() {
        w.write_all(payload)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read + ?Sized>(r: &mut R) -> Result<(u8, Vec<u8>)> {
    read_frame_with_limit(r, MAX_FRAME_SIZE)
}

pub fn read_frame_with_limit<R: Read + ?Sized>(r: &mut R, max: usize) -> Result<(u8, Vec<u8>)> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut hdr)?;
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    check_frame_size(len, max)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload)?;
    }
    Ok((typ, payload))
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Length-prefixed (u16) UTF-8 string; longer strings are truncated on a
/// char boundary.
pub fn put_str(buf: &mut Vec<u8>, s: &str) {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    put_u16(buf, end as u16);
    buf.extend_from_slice(&s.as_bytes()[..end]);
}

/// Cursor over a frame payload. Every short read is a protocol violation.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::protocol(format!(
                "payload truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string is not valid utf-8"))
    }

    /// Everything not consumed yet
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(frame::CHANNEL_DATA, 12345);
        let (parsed_type, parsed_len) = parse_frame_header(&header).unwrap();
        assert_eq!(parsed_type, frame::CHANNEL_DATA);
        assert_eq!(parsed_len, 12345);
    }

    #[test]
    fn test_validate_frame_size() {
        assert!(validate_frame_size(0).is_ok()); // Empty payload is valid
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(matches!(
            validate_frame_size(MAX_FRAME_SIZE + 1),
            Err(Error::MaliciousInput(_))
        ));
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(b"WRNG");
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[6] = 1;
        header[7..11].copy_from_slice(&100u32.to_le_bytes());

        assert!(matches!(
            parse_frame_header(&header),
            Err(Error::MaliciousInput(_))
        ));
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        header[6] = 1;
        header[7..11].copy_from_slice(&100u32.to_le_bytes());

        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn write_then_read_frame_over_a_buffer() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame::HELLO, &[7, 8, 9]).unwrap();
        write_frame(&mut wire, frame::CLOSE, &[]).unwrap();

        let mut rd = std::io::Cursor::new(wire);
        assert_eq!(read_frame(&mut rd).unwrap(), (frame::HELLO, vec![7, 8, 9]));
        assert_eq!(read_frame(&mut rd).unwrap(), (frame::CLOSE, vec![]));
        assert!(matches!(read_frame(&mut rd), Err(Error::Io(_))));
    }

    #[test]
    fn read_frame_rejects_oversized_length() {
        let hdr = build_frame_header(frame::CHANNEL_DATA, (MAX_FRAME_SIZE + 1) as u32);
        let mut rd = std::io::Cursor::new(hdr.to_vec());
        assert!(matches!(read_frame(&mut rd), Err(Error::MaliciousInput(_))));
    }

    #[test]
    fn frame_limit_can_be_raised_per_call() {
        let payload = vec![5u8; 32];
        let mut wire = Vec::new();
        assert!(write_frame_with_limit(&mut wire, frame::CHANNEL_DATA, &payload, 16).is_err());
        assert!(wire.is_empty());
        write_frame_with_limit(&mut wire, frame::CHANNEL_DATA, &payload, 32).unwrap();

        let mut rd = std::io::Cursor::new(wire.clone());
        assert!(matches!(
            read_frame_with_limit(&mut rd, 31),
            Err(Error::MaliciousInput(_))
        ));
        let mut rd = std::io::Cursor::new(wire);
        assert_eq!(
            read_frame_with_limit(&mut rd, 32).unwrap(),
            (frame::CHANNEL_DATA, payload)
        );
    }

    #[test]
    fn payload_reader_reports_truncation() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 42);
        put_str(&mut buf, "file.bin");
        let mut rd = PayloadReader::new(&buf);
        assert_eq!(rd.u32().unwrap(), 42);
        assert_eq!(rd.string().unwrap(), "file.bin");
        assert!(rd.is_empty());
        assert!(matches!(rd.u8(), Err(Error::Protocol(_))));
    }

    #[test]
    fn put_str_truncates_on_char_boundary() {
        let long = "ä".repeat(40_000); // 80_000 bytes
        let mut buf = Vec::new();
        put_str(&mut buf, &long);
        let s = PayloadReader::new(&buf).string().unwrap();
        assert!(s.len() <= u16::MAX as usize);
        assert!(s.chars().all(|c| c == 'ä'));
    }
}
