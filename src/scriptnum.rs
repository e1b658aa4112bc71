//! Minimally-encoded script integers.
//!
//! Stack numbers are little-endian sign-magnitude: the top bit of the
//! most significant byte is the sign. The empty string is zero. An
//! encoding is minimal when it has no superfluous trailing byte, which
//! means the last byte is never 0x00/0x80 unless the byte below it
//! needs its high bit for magnitude.

use crate::error::ScriptError;

/// Default cap on the encoded size of an interpreted number.
pub const DEFAULT_MAX_NUM_SIZE: usize = 4;

/// Encode an integer in minimal form.
pub fn encode(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);

    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    let last = *out.last().expect("non-zero magnitude");
    if last & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let idx = out.len() - 1;
        out[idx] |= 0x80;
    }

    out
}

/// Decode a script number of at most `max_size` bytes.
///
/// With `require_minimal`, a non-minimal encoding is rejected the way
/// the interpreter rejects it under MINIMALDATA.
pub fn decode(data: &[u8], require_minimal: bool, max_size: usize) -> Result<i64, ScriptError> {
    if data.len() > max_size {
        return Err(ScriptError::InvalidNumberRange);
    }

    if data.is_empty() {
        return Ok(0);
    }

    if require_minimal && !is_minimal(data) {
        return Err(ScriptError::MinimalData);
    }

    let mut value: i64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i == data.len() - 1 {
            value |= ((byte & 0x7f) as i64) << (8 * i);
            if byte & 0x80 != 0 {
                value = -value;
            }
        } else {
            value |= (byte as i64) << (8 * i);
        }
    }

    Ok(value)
}

/// True when `data` is already the minimal encoding of its value.
pub fn is_minimal(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }

    let last = data[data.len() - 1];
    if last & 0x7f != 0 {
        return true;
    }

    // Last byte carries only a sign. It is required exactly when the
    // byte below would otherwise read as a sign bit.
    if data.len() == 1 {
        return false;
    }

    data[data.len() - 2] & 0x80 != 0
}

/// Reduce a byte string to the minimal encoding of the same number.
///
/// This is the OP_BIN2NUM reduction; the result may still exceed the
/// interpreter's number range and must be range checked by the caller.
pub fn minimize(mut data: Vec<u8>) -> Vec<u8> {
    if data.is_empty() {
        return data;
    }

    let last = data[data.len() - 1];
    if last & 0x7f != 0 {
        return data;
    }

    if data.len() == 1 {
        // A lone 0x00 or 0x80 is zero.
        return Vec::new();
    }

    if data[data.len() - 2] & 0x80 != 0 {
        return data;
    }

    // Walk down past superfluous zero bytes, then reattach the sign.
    let sign = last & 0x80;
    for i in (1..data.len()).rev() {
        let below = data[i - 1];
        if below != 0 {
            if below & 0x80 != 0 {
                // The byte below needs its high bit for magnitude, so
                // a dedicated sign byte stays.
                data[i] = sign;
                data.truncate(i + 1);
            } else {
                data[i - 1] = below | sign;
                data.truncate(i);
            }
            return data;
        }
    }

    // All magnitude bytes were zero.
    Vec::new()
}
