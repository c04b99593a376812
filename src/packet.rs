//! Packet families carried over virtual channels
//!
//! A channel is declared for exactly one family. The download family is the
//! only one this client speaks.

use crate::error::{Error, Result};
use crate::protocol::{download_tag as tag, family};
use crate::protocol_core::{put_str, PayloadReader};
use std::fmt;

/// A packet family that can travel over a virtual channel.
pub trait Packet: Sized + Clone + Send + Sync + fmt::Debug + 'static {
    /// Family id sent with CHANNEL_OPEN
    const FAMILY: u8;

    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Transfer size and suggested name announced by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// `None` when the server does not know the size up front
    pub length: Option<u64>,
    pub file_name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum DownloadPacket {
    /// client -> server: begin serving this URL
    Request { url: String },
    /// server -> client
    Header(Header),
    /// client -> server: destination is open
    Ready,
    /// server -> client: one chunk of file content
    Data(Vec<u8>),
    /// server -> client: no more data follows
    Finish,
    /// either direction
    Cancel { message: Option<String> },
}

impl DownloadPacket {
    pub fn cancel() -> Self {
        DownloadPacket::Cancel { message: None }
    }

    pub fn cancel_with(message: impl Into<String>) -> Self {
        DownloadPacket::Cancel {
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DownloadPacket::Request { .. } => "Request",
            DownloadPacket::Header(_) => "Header",
            DownloadPacket::Ready => "Ready",
            DownloadPacket::Data(_) => "Data",
            DownloadPacket::Finish => "Finish",
            DownloadPacket::Cancel { .. } => "Cancel",
        }
    }
}

// Data packets can be megabytes; never dump the payload into logs
impl fmt::Debug for DownloadPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadPacket::Request { url } => f.debug_struct("Request").field("url", url).finish(),
            DownloadPacket::Header(h) => f.debug_tuple("Header").field(h).finish(),
            DownloadPacket::Ready => f.write_str("Ready"),
            DownloadPacket::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            DownloadPacket::Finish => f.write_str("Finish"),
            DownloadPacket::Cancel { message } => {
                f.debug_struct("Cancel").field("message", message).finish()
            }
        }
    }
}

impl Packet for DownloadPacket {
    const FAMILY: u8 = family::DOWNLOAD;

    fn encode(&self) -> Vec<u8> {
        match self {
            DownloadPacket::Request { url } => {
                let mut buf = Vec::with_capacity(1 + 2 + url.len());
                buf.push(tag::REQUEST);
                put_str(&mut buf, url);
                buf
            }
            DownloadPacket::Header(h) => {
                let mut buf = Vec::with_capacity(1 + 8 + 2 + h.file_name.len());
                buf.push(tag::HEADER);
                let len = h.length.and_then(|l| i64::try_from(l).ok()).unwrap_or(-1);
                buf.extend_from_slice(&len.to_le_bytes());
                put_str(&mut buf, &h.file_name);
                buf
            }
            DownloadPacket::Ready => vec![tag::READY],
            DownloadPacket::Data(bytes) => {
                let mut buf = Vec::with_capacity(1 + bytes.len());
                buf.push(tag::DATA);
                buf.extend_from_slice(bytes);
                buf
            }
            DownloadPacket::Finish => vec![tag::FINISH],
            DownloadPacket::Cancel { message } => {
                let mut buf = vec![tag::CANCEL];
                match message {
                    Some(m) => {
                        buf.push(1);
                        put_str(&mut buf, m);
                    }
                    None => buf.push(0),
                }
                buf
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rd = PayloadReader::new(bytes);
        let packet = match rd.u8()? {
            tag::REQUEST => DownloadPacket::Request { url: rd.string()? },
            tag::HEADER => {
                let raw_len = rd.i64()?;
                let file_name = rd.string()?;
                DownloadPacket::Header(Header {
                    length: u64::try_from(raw_len).ok(),
                    file_name,
                })
            }
            tag::READY => DownloadPacket::Ready,
            tag::DATA => return Ok(DownloadPacket::Data(rd.rest().to_vec())),
            tag::FINISH => DownloadPacket::Finish,
            tag::CANCEL => {
                let message = match rd.u8()? {
                    0 => None,
                    _ => Some(rd.string()?),
                };
                DownloadPacket::Cancel { message }
            }
            other => {
                return Err(Error::protocol(format!("unknown download packet tag {}", other)))
            }
        };
        if !rd.is_empty() {
            return Err(Error::protocol(format!(
                "trailing bytes after {} packet",
                packet.kind()
            )));
        }
        Ok(packet)
    }
}
