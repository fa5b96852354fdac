//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Readers take the input slice plus a cursor offset and advance it on
//! success. Truncated input is always a [`SkiffError::Protocol`] error.

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Writes an SSH `string` from UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes an SSH `string` from raw bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes an SSH `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a comma separated `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an unsigned big-endian magnitude as an SSH `mpint`.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian magnitude as an SSH `mpint`.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the
/// high bit would otherwise mark the value negative.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut result = Vec::with_capacity(4 + length);
    result.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        result.push(0);
    }
    result.extend_from_slice(trimmed);
    result
}

/// Reads one byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SkiffResult<u8> {
    let byte = *data.get(*offset).ok_or_else(|| {
        SkiffError::Protocol(format!("Cannot read byte at offset {}", offset))
    })?;
    *offset += 1;
    Ok(byte)
}

/// Reads an SSH `boolean` (any non-zero value is true).
pub fn read_bool(data: &[u8], offset: &mut usize) -> SkiffResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a big-endian `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SkiffResult<u32> {
    if *offset + 4 > data.len() {
        return Err(SkiffError::Protocol(format!(
            "Cannot read u32 at offset {}",
            offset
        )));
    }

    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;

    Ok(value)
}

/// Reads an SSH `string` as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;

    if data.len() - *offset < length {
        return Err(SkiffError::Protocol(format!(
            "Data truncated: expected {} bytes at offset {}",
            length, offset
        )));
    }

    let bytes = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(bytes)
}

/// Reads an SSH `string` that must be valid UTF-8.
pub fn read_string(data: &[u8], offset: &mut usize) -> SkiffResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SkiffError::Protocol("String contains invalid UTF-8".to_string()))
}

/// Reads a comma separated `name-list`. An empty list yields no names.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let list = read_string(data, offset)?;
    if list.is_empty() {
        return Ok(Vec::new());
    }
    Ok(list.split(',').map(str::to_string).collect())
}

/// Returns the remaining bytes after `offset` and moves the cursor to the end.
pub fn read_rest(data: &[u8], offset: &mut usize) -> Vec<u8> {
    let rest = data.get(*offset..).unwrap_or_default().to_vec();
    *offset = data.len();
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "session");
        write_bool(&mut buf, true);
        buf.put_u32(7);

        let mut offset = 0;
        assert_eq!(read_string(&buf, &mut offset).unwrap(), "session");
        assert!(read_bool(&buf, &mut offset).unwrap());
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 7);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_truncated_string() {
        let data = [0u8, 0, 0, 10, b'a', b'b'];
        let mut offset = 0;
        assert!(matches!(
            read_bytes(&data, &mut offset),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &["a".to_string(), "b".to_string()]);
        write_name_list(&mut buf, &[]);

        let mut offset = 0;
        assert_eq!(read_name_list(&buf, &mut offset).unwrap(), vec!["a", "b"]);
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_encode_mpint() {
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0x12, 0x34]), vec![0, 0, 0, 2, 0x12, 0x34]);
        assert_eq!(encode_mpint(&[0x80, 0x00]), vec![0, 0, 0, 3, 0, 0x80, 0x00]);
        assert_eq!(
            encode_mpint(&[0x00, 0x00, 0x12, 0x34]),
            vec![0, 0, 0, 2, 0x12, 0x34]
        );
    }
}
