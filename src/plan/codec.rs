// Span list wire format: varint count, then (gap from previous end, width) pairs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{PlanDecodeError, Span};

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, PlanDecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(PlanDecodeError::Truncated);
        }
        let byte = buf.get_u8();
        let bits = u64::from(byte & 0x7f);
        if shift == 63 && bits > 1 {
            return Err(PlanDecodeError::VarintOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(PlanDecodeError::VarintOverflow);
        }
    }
}

/// Encode an ordered, non-overlapping span list.
pub fn encode_spans(spans: &[Span]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + spans.len() * 4);
    put_varint(&mut buf, spans.len() as u64);
    let mut cursor = 0u64;
    for span in spans {
        put_varint(&mut buf, span.start().saturating_sub(cursor));
        put_varint(&mut buf, span.width());
        cursor = span.end();
    }
    buf.freeze()
}

/// Decode a span list. An empty buffer is an empty list.
pub fn decode_spans(input: &[u8]) -> Result<Vec<Span>, PlanDecodeError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut buf = input;
    let count = get_varint(&mut buf)?;
    // Every span needs at least two bytes, so a larger count is a lie.
    if count > (buf.remaining() / 2) as u64 {
        return Err(PlanDecodeError::Truncated);
    }

    let mut spans = Vec::with_capacity(count as usize);
    let mut cursor = 0u64;
    for index in 0..count as usize {
        let gap = get_varint(&mut buf)?;
        let width = get_varint(&mut buf)?;
        if width == 0 {
            return Err(PlanDecodeError::ZeroWidth { index });
        }
        let start = cursor
            .checked_add(gap)
            .ok_or(PlanDecodeError::IndexOverflow { index })?;
        let end = start
            .checked_add(width)
            .ok_or(PlanDecodeError::IndexOverflow { index })?;
        spans.push(Span { start, end });
        cursor = end;
    }

    if buf.has_remaining() {
        return Err(PlanDecodeError::TrailingBytes(buf.remaining()));
    }
    Ok(spans)
}
