//! Fabricated SFTP server.
//!
//! Speaks just enough of SFTP v3 (draft-ietf-secsh-filexfer-02) to complete
//! the version handshake, then answers every request with
//! `SSH_FX_PERMISSION_DENIED`. Requested paths are reported back so they can
//! be audited.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted; anything bigger ends the subsystem.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FX_PERMISSION_DENIED: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SftpError {
    #[error("sftp packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("malformed sftp packet")]
    Malformed,
}

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpRequest {
    pub operation: &'static str,
    pub request_id: Option<u32>,
    pub path: Option<String>,
}

/// A request and the bytes to send back for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpReply {
    pub request: SftpRequest,
    pub response: Vec<u8>,
}

/// Per-channel SFTP reassembly buffer and handshake state.
#[derive(Debug, Default)]
pub struct SftpServer {
    buffer: BytesMut,
}

impl SftpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append channel data and answer every complete packet in it. Packets
    /// decoded before a bad one are still answered; once `error` is set the
    /// stream is unusable.
    pub fn feed(&mut self, data: &[u8]) -> SftpBatch {
        self.buffer.extend_from_slice(data);
        let mut batch = SftpBatch::default();
        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_PACKET_LEN {
                batch.error = Some(SftpError::PacketTooLarge(len));
                break;
            }
            if len == 0 {
                batch.error = Some(SftpError::Malformed);
                break;
            }
            if self.buffer.len() < 4 + len {
                break;
            }
            self.buffer.advance(4);
            let packet = self.buffer.split_to(len).freeze();
            match answer(packet) {
                Ok(reply) => batch.replies.push(reply),
                Err(e) => {
                    batch.error = Some(e);
                    break;
                }
            }
        }
        if batch.error.is_some() {
            self.buffer.clear();
        }
        batch
    }
}

/// Result of one `feed` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SftpBatch {
    pub replies: Vec<SftpReply>,
    pub error: Option<SftpError>,
}

fn read_u32(buf: &mut Bytes) -> Result<u32, SftpError> {
    if buf.remaining() < 4 {
        return Err(SftpError::Malformed);
    }
    Ok(buf.get_u32())
}

fn read_string(buf: &mut Bytes) -> Result<String, SftpError> {
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(SftpError::Malformed);
    }
    let raw = buf.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn operation_name(kind: u8) -> &'static str {
    match kind {
        3 => "open",
        4 => "close",
        5 => "read",
        6 => "write",
        7 => "lstat",
        8 => "fstat",
        9 => "setstat",
        10 => "fsetstat",
        11 => "opendir",
        12 => "readdir",
        13 => "remove",
        14 => "mkdir",
        15 => "rmdir",
        16 => "realpath",
        17 => "stat",
        18 => "rename",
        19 => "readlink",
        20 => "symlink",
        200 => "extended",
        _ => "unknown",
    }
}

fn answer(mut packet: Bytes) -> Result<SftpReply, SftpError> {
    if packet.is_empty() {
        return Err(SftpError::Malformed);
    }
    let kind = packet.get_u8();

    if kind == SSH_FXP_INIT {
        return Ok(SftpReply {
            request: SftpRequest {
                operation: "init",
                request_id: None,
                path: None,
            },
            response: version_packet(),
        });
    }

    let request_id = read_u32(&mut packet)?;
    let operation = operation_name(kind);
    let path = match kind {
        // Requests whose first field is a path (or extension name)
        3 | 7 | 9 | 11 | 13 | 14 | 15 | 16 | 17 | 19 | 200 => Some(read_string(&mut packet)?),
        18 | 20 => {
            let from = read_string(&mut packet)?;
            let to = read_string(&mut packet)?;
            Some(format!("{} -> {}", from, to))
        }
        // Handle-based requests carry no path
        _ => None,
    };

    Ok(SftpReply {
        request: SftpRequest {
            operation,
            request_id: Some(request_id),
            path,
        },
        response: status_packet(request_id, SSH_FX_PERMISSION_DENIED, "Permission denied"),
    })
}

fn version_packet() -> Vec<u8> {
    let mut body = BytesMut::with_capacity(9);
    body.put_u32(5);
    body.put_u8(SSH_FXP_VERSION);
    body.put_u32(SFTP_VERSION);
    body.to_vec()
}

fn status_packet(request_id: u32, code: u32, message: &str) -> Vec<u8> {
    let len = 1 + 4 + 4 + 4 + message.len() + 4;
    let mut body = BytesMut::with_capacity(4 + len);
    body.put_u32(len as u32);
    body.put_u8(SSH_FXP_STATUS);
    body.put_u32(request_id);
    body.put_u32(code);
    body.put_u32(message.len() as u32);
    body.put_slice(message.as_bytes());
    // language tag
    body.put_u32(0);
    body.to_vec()
}
