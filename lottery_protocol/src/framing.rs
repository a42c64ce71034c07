// Delimiter-based message framing over a byte stream.
//
// Messages carry no length prefix. A message ends where the bytes read so far
// end with `]` (`END_MSG_DELIMITER`): the reader keeps pulling chunks of
// whatever size the stream hands back and stops as soon as the last byte it
// received is the terminator. This is only sound because field values never
// contain `]` (see `codec::RESERVED_CHARS`), and because each side waits for
// the peer's reply before sending again, so two messages never share a read.
//
// There is no cap on how much is accumulated while waiting for a terminator.
//
// Both functions work on any `Read`/`Write`, so tests can drive them with
// in-memory cursors or localhost sockets.

use std::io::{self, Read, Write};

use crate::codec::END_MSG_DELIMITER;

/// Size of each individual read from the stream.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Write a complete message. Partial writes are retried until every byte is
/// out or the stream fails.
pub fn write_message<W: Write>(writer: &mut W, msg: &str) -> io::Result<()> {
    writer.write_all(msg.as_bytes())?;
    writer.flush()
}

/// Read one complete message.
///
/// Returns `UnexpectedEof` if the peer closes the connection before a
/// terminator arrives, and `InvalidData` if the accumulated bytes are not
/// UTF-8.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {} bytes without a terminator", buf.len()),
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.last() == Some(&(END_MSG_DELIMITER as u8)) {
            break;
        }
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
