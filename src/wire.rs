//! Framing of control requests on the daemon's Unix socket.
//!
//! A request is `u32 command | u32 payload length | payload`; the payload
//! carries the length-prefixed name string of the control plane. A reply
//! is `i32 errno | u32 data length | data`.

use std::io;
use std::io::Read;
use std::io::Write;

/// Writes a control request.
pub fn write_request(out: &mut impl Write, cmd: u32, payload: &[u8]) -> io::Result<()> {
    out.write_all(&cmd.to_le_bytes())?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(payload)?;
    out.flush()
}

/// Reads a control request.
pub fn read_request(input: &mut impl Read) -> io::Result<(u32, Vec<u8>)> {
    let mut head = [0u8; 8];
    input.read_exact(&mut head)?;
    let cmd = u32::from_le_bytes(head[..4].try_into().unwrap());
    let len = u32::from_le_bytes(head[4..].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    Ok((cmd, payload))
}

/// Writes a control reply.
pub fn write_reply(out: &mut impl Write, errno: i32, data: &[u8]) -> io::Result<()> {
    out.write_all(&errno.to_le_bytes())?;
    out.write_all(&(data.len() as u32).to_le_bytes())?;
    out.write_all(data)?;
    out.flush()
}

/// Reads a control reply.
pub fn read_reply(input: &mut impl Read) -> io::Result<(i32, Vec<u8>)> {
    let mut head = [0u8; 8];
    input.read_exact(&mut head)?;
    let errno = i32::from_le_bytes(head[..4].try_into().unwrap());
    let len = u32::from_le_bytes(head[4..].try_into().unwrap()) as usize;
    let mut data = vec![0u8; len];
    input.read_exact(&mut data)?;
    Ok((errno, data))
}
