//! Binary encoding of alerts as opaque blobs
//!
//! Layout: uvarint name length, name bytes, zig-zag varint level code,
//! last change and start timestamps (i64 seconds BE + u32 nanos BE each),
//! zig-zag varint count.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::alert::{Alert, Level};
use crate::error::{Error, Result};

const TIMESTAMP_LEN: usize = 12;
const MAX_VARINT_LEN: usize = 10;

impl Alert {
    /// Encode into the binary blob form
    pub fn encode(&self) -> Bytes {
        let name = self.name().as_bytes();
        let mut buf = BytesMut::with_capacity(name.len() + 2 * TIMESTAMP_LEN + 3 * MAX_VARINT_LEN);

        put_uvarint(&mut buf, name.len() as u64);
        buf.put_slice(name);
        put_varint(&mut buf, self.level().code());
        put_timestamp(&mut buf, self.last_change());
        put_timestamp(&mut buf, self.start());
        put_varint(&mut buf, self.count());

        buf.freeze()
    }

    /// Decode a blob produced by [`Alert::encode`]
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let name_len = usize::try_from(get_uvarint(&mut data)?)
            .map_err(|_| Error::Decode("name length overflows".to_string()))?;
        if data.remaining() < name_len {
            return Err(Error::Decode(format!(
                "name length {name_len} exceeds remaining {} bytes",
                data.remaining()
            )));
        }
        let name = std::str::from_utf8(&data[..name_len])
            .map_err(|e| Error::Decode(format!("name is not utf-8: {e}")))?
            .to_string();
        data.advance(name_len);

        let code = get_varint(&mut data)?;
        let level = Level::try_from(code).map_err(|e| Error::Decode(e.to_string()))?;
        let last_change = get_timestamp(&mut data)?;
        let start = get_timestamp(&mut data)?;
        let count = get_varint(&mut data)?;

        if data.has_remaining() {
            return Err(Error::Decode(format!("{} trailing bytes", data.remaining())));
        }

        Ok(Alert::from_parts(name, level, count, last_change, start))
    }
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn put_varint(buf: &mut BytesMut, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

fn get_uvarint(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !data.has_remaining() {
            return Err(Error::Decode("truncated varint".to_string()));
        }
        let byte = data.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(Error::Decode("varint overflows u64".to_string()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte < 0x80 {
            return Ok(value);
        }
    }
    Err(Error::Decode("varint overflows u64".to_string()))
}

fn get_varint(data: &mut &[u8]) -> Result<i64> {
    let u = get_uvarint(data)?;
    Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
}

fn put_timestamp(buf: &mut BytesMut, ts: DateTime<Utc>) {
    buf.put_i64(ts.timestamp());
    buf.put_u32(ts.timestamp_subsec_nanos());
}

fn get_timestamp(data: &mut &[u8]) -> Result<DateTime<Utc>> {
    if data.remaining() < TIMESTAMP_LEN {
        return Err(Error::Decode("truncated timestamp".to_string()));
    }
    let secs = data.get_i64();
    let nanos = data.get_u32();
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Decode(format!("timestamp out of range: {secs}.{nanos}")))
}
