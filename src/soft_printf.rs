// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Software printf for device code.

Device code appends records to a printf buffer; the host decodes the buffer after the launch
completed and writes the text to stdout.  The layout is shared by every backend:

```text
[ u32 bytes_written ][ u32 buffer_size ][ record ][ record ] ...
record = [ u32 entry_size ][ format string, NUL terminated, padded to 4 bytes ][ u32 args... ]
```

`bytes_written` starts at the header size and is bumped atomically by writers; `entry_size` is
the size of the whole record including its own word.  A writer whose record does not fit leaves
the buffer untouched apart from the counter, so decoding stops at the first zero `entry_size`.

Supported conversions are `%u %d %i %x %X %o %f %F %%` with flags, width and precision.  The
wide length modifiers `l ll j z t L` read two argument slots (low word first); `h` and `hh`
read one slot and truncate to 16 / 8 bits.
*/

use std::sync::atomic::{AtomicU32, Ordering};

/// Default size of a printf buffer.
pub const DEFAULT_PRINTF_BUFFER_SIZE: usize = 1024 * 1024;

/// `bytes_written` + `buffer_size`.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PrintfError {
    #[error("buffer is smaller than its header")]
    TruncatedHeader,
    #[error("record at offset {offset} is truncated")]
    TruncatedRecord { offset: usize },
    #[error("record at offset {offset} has invalid size {size}")]
    InvalidEntrySize { offset: usize, size: u32 },
    #[error("format string is missing its terminator")]
    MissingTerminator,
    #[error("format string is not valid UTF-8")]
    InvalidUtf8,
    #[error("conversion %{0} is not supported")]
    UnsupportedConversion(char),
    #[error("format string ends inside a conversion")]
    IncompleteConversion,
    #[error("format \"{0}\" needs more arguments than the record carries")]
    MissingArgument(String),
}

/// Host-side helpers for printf buffers.
pub struct PrintfBuffer;

impl PrintfBuffer {
    /// The initial contents of a buffer of `size` bytes: header plus zeroed records.
    pub fn initial_contents(size: usize) -> Vec<u8> {
        let mut contents = vec![0u8; size.max(HEADER_SIZE)];
        contents[0..4].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        contents[4..8].copy_from_slice(&(size as u32).to_le_bytes());
        contents
    }

    /// Size of the record `format` with `arg_count` argument slots.
    pub fn record_size(format: &str, arg_count: usize) -> usize {
        4 + (format.len() + 1).next_multiple_of(4) + arg_count * 4
    }

    /// Appends a record to a buffer in memory.
    ///
    /// Returns `false` when the record didn't fit.
    ///
    /// # Safety
    /// `base` must point to a 4-byte aligned, initialized printf buffer that stays valid for the
    /// call.  Concurrent writers are fine; concurrent readers are not.
    pub unsafe fn append(base: *mut u8, format: &str, args: &[u32]) -> bool {
        let size = Self::record_size(format, args.len());
        // SAFETY: the header words are aligned and only accessed atomically by writers
        let (written, capacity) = unsafe {
            (
                &*(base as *const AtomicU32),
                (*(base.add(4) as *const AtomicU32)).load(Ordering::Relaxed) as usize,
            )
        };
        // a record that doesn't fit reserves nothing, so the cursor never passes the capacity
        let reserved = written.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |offset| {
            let end = (offset as usize).checked_add(size)?;
            (end <= capacity).then_some(end as u32)
        });
        let Ok(offset) = reserved else {
            return false;
        };
        let offset = offset as usize;
        // SAFETY: [offset, offset + size) is inside the buffer and owned by this writer
        let record = unsafe { std::slice::from_raw_parts_mut(base.add(offset), size) };
        record[4..4 + format.len()].copy_from_slice(format.as_bytes());
        let args_start = size - args.len() * 4;
        for (slot, arg) in record[args_start..].chunks_exact_mut(4).zip(args) {
            slot.copy_from_slice(&arg.to_le_bytes());
        }
        // publish the size last so a reader never sees a half-written record
        // SAFETY: offset is 4-byte aligned because every record size is
        let header = unsafe { &*(base.add(offset) as *const AtomicU32) };
        header.store(size as u32, Ordering::Release);
        true
    }
}

fn word(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decodes every record of a printf buffer.
///
/// Records with an unsupported or malformed conversion are logged (once per record) and
/// skipped; a structurally broken buffer fails.
pub fn decode_buffer(buffer: &[u8]) -> Result<Vec<String>, PrintfError> {
    let written = word(buffer, 0).ok_or(PrintfError::TruncatedHeader)? as usize;
    let capacity = (word(buffer, 4).ok_or(PrintfError::TruncatedHeader)? as usize).min(buffer.len());
    if written > capacity {
        logwise::warn_sync!(
            "soft_printf: buffer overflow, {written} bytes requested of {capacity}; output is truncated",
            written = written,
            capacity = capacity
        );
    }
    let end = written.min(capacity);
    let mut out = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let size = word(buffer, offset).ok_or(PrintfError::TruncatedRecord { offset })?;
        if size == 0 {
            break;
        }
        if size % 4 != 0 || (size as usize) < 8 {
            return Err(PrintfError::InvalidEntrySize { offset, size });
        }
        let record = buffer
            .get(offset..offset + size as usize)
            .ok_or(PrintfError::TruncatedRecord { offset })?;
        match decode_record(record) {
            Ok(text) => out.push(text),
            Err(e) => logwise::error_sync!(
                "soft_printf: record at offset {offset}: {error}",
                offset = offset,
                error = e.to_string()
            ),
        }
        offset += size as usize;
    }
    Ok(out)
}

/// Decodes a buffer and writes the text to stdout.
pub fn print_buffer(buffer: &[u8]) -> Result<(), PrintfError> {
    use std::io::Write;
    let records = decode_buffer(buffer)?;
    let mut stdout = std::io::stdout().lock();
    for record in records {
        let _ = stdout.write_all(record.as_bytes());
    }
    let _ = stdout.flush();
    Ok(())
}

/// Decodes one record, starting at its `entry_size` word.
pub fn decode_record(record: &[u8]) -> Result<String, PrintfError> {
    let size = word(record, 0).ok_or(PrintfError::TruncatedRecord { offset: 0 })? as usize;
    if size < 8 {
        return Err(PrintfError::InvalidEntrySize {
            offset: 0,
            size: size as u32,
        });
    }
    let record = record
        .get(..size)
        .ok_or(PrintfError::TruncatedRecord { offset: 0 })?;
    let body = &record[4..];
    let len = body
        .iter()
        .position(|b| *b == 0)
        .ok_or(PrintfError::MissingTerminator)?;
    let format = std::str::from_utf8(&body[..len]).map_err(|_| PrintfError::InvalidUtf8)?;
    let args_start = 4 + (len + 1).next_multiple_of(4);
    if args_start > record.len() {
        return Err(PrintfError::TruncatedRecord { offset: 0 });
    }
    let args: Vec<u32> = record[args_start..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    format_with(format, &args)
}

#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
    wide: bool,
    truncate_bits: Option<u32>,
}

struct Args<'a> {
    format: &'a str,
    slots: std::slice::Iter<'a, u32>,
}

impl Args<'_> {
    fn next(&mut self) -> Result<u32, PrintfError> {
        self.slots
            .next()
            .copied()
            .ok_or_else(|| PrintfError::MissingArgument(self.format.to_string()))
    }
    fn next_wide(&mut self) -> Result<u64, PrintfError> {
        let lo = self.next()? as u64;
        let hi = self.next()? as u64;
        Ok(lo | (hi << 32))
    }
}

/// Formats `format` with 32-bit argument slots.
pub fn format_with(format: &str, slots: &[u32]) -> Result<String, PrintfError> {
    let mut out = String::with_capacity(format.len() + slots.len() * 4);
    let mut args = Args {
        format,
        slots: slots.iter(),
    };
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut directive = Directive::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => directive.left = true,
                '0' => directive.zero = true,
                '+' => directive.plus = true,
                ' ' => directive.space = true,
                '#' => directive.alternate = true,
                _ => break,
            }
            chars.next();
        }
        if chars.peek() == Some(&'*') {
            chars.next();
            let width = args.next()? as i32;
            if width < 0 {
                directive.left = true;
            }
            directive.width = width.unsigned_abs() as usize;
        } else {
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                directive.width = directive.width * 10 + d as usize;
                chars.next();
            }
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = 0usize;
            if chars.peek() == Some(&'*') {
                chars.next();
                precision = (args.next()? as i32).max(0) as usize;
            } else {
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    precision = precision * 10 + d as usize;
                    chars.next();
                }
            }
            directive.precision = Some(precision);
        }
        loop {
            match chars.peek() {
                Some('l') | Some('j') | Some('z') | Some('t') | Some('L') => directive.wide = true,
                Some('h') => {
                    directive.truncate_bits = Some(if directive.truncate_bits == Some(16) { 8 } else { 16 })
                }
                _ => break,
            }
            chars.next();
        }
        let conversion = chars.next().ok_or(PrintfError::IncompleteConversion)?;
        match conversion {
            '%' => out.push('%'),
            'u' | 'x' | 'X' | 'o' => {
                let value = truncate(read_int(&mut args, directive)?, directive.truncate_bits);
                let digits = match conversion {
                    'u' => value.to_string(),
                    'x' => format!("{value:x}"),
                    'X' => format!("{value:X}"),
                    _ => format!("{value:o}"),
                };
                let prefix = match conversion {
                    'x' if directive.alternate && value != 0 => "0x",
                    'X' if directive.alternate && value != 0 => "0X",
                    _ => "",
                };
                let digits = if conversion == 'o' && directive.alternate && !digits.starts_with('0') {
                    format!("0{digits}")
                } else {
                    digits
                };
                pad_number(&mut out, directive, "", prefix, &digits, value == 0);
            }
            'd' | 'i' => {
                let raw = truncate(read_int(&mut args, directive)?, directive.truncate_bits);
                let bits = directive.truncate_bits.unwrap_or(if directive.wide { 64 } else { 32 });
                let value = sign_extend(raw, bits);
                let sign = if value < 0 {
                    "-"
                } else if directive.plus {
                    "+"
                } else if directive.space {
                    " "
                } else {
                    ""
                };
                pad_number(&mut out, directive, sign, "", &value.unsigned_abs().to_string(), value == 0);
            }
            'f' | 'F' => {
                let value = if directive.wide {
                    f64::from_bits(args.next_wide()?)
                } else {
                    f32::from_bits(args.next()?) as f64
                };
                format_float(&mut out, directive, value, conversion == 'F');
            }
            other => return Err(PrintfError::UnsupportedConversion(other)),
        }
    }
    Ok(out)
}

fn read_int(args: &mut Args<'_>, directive: Directive) -> Result<u64, PrintfError> {
    if directive.wide {
        args.next_wide()
    } else {
        args.next().map(u64::from)
    }
}

fn truncate(value: u64, bits: Option<u32>) -> u64 {
    match bits {
        Some(bits) => value & ((1u64 << bits) - 1),
        None => value,
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Emits `sign prefix digits` honoring width, precision and the `-` / `0` flags.
fn pad_number(out: &mut String, directive: Directive, sign: &str, prefix: &str, digits: &str, is_zero: bool) {
    let digits = match directive.precision {
        // an explicit zero precision prints nothing for zero
        Some(0) if is_zero => String::new(),
        Some(p) if digits.len() < p => format!("{}{digits}", "0".repeat(p - digits.len())),
        _ => digits.to_string(),
    };
    let len = sign.len() + prefix.len() + digits.len();
    let fill = directive.width.saturating_sub(len);
    if directive.left {
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
        out.push_str(&" ".repeat(fill));
    } else if directive.zero && directive.precision.is_none() {
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&"0".repeat(fill));
        out.push_str(&digits);
    } else {
        out.push_str(&" ".repeat(fill));
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
    }
}

fn format_float(out: &mut String, directive: Directive, value: f64, upper: bool) {
    let sign = if value.is_sign_negative() && !value.is_nan() {
        "-"
    } else if directive.plus {
        "+"
    } else if directive.space {
        " "
    } else {
        ""
    };
    let precision = directive.precision.unwrap_or(6);
    let magnitude = value.abs();
    let (body, finite) = if value.is_nan() {
        (if upper { "NAN" } else { "nan" }.to_string(), false)
    } else if value.is_infinite() {
        (if upper { "INF" } else { "inf" }.to_string(), false)
    } else {
        let mut body = format!("{magnitude:.precision$}");
        if directive.alternate && precision == 0 {
            body.push('.');
        }
        (body, true)
    };
    let directive = Directive {
        zero: directive.zero && finite,
        precision: None,
        ..directive
    };
    pad_number(out, directive, sign, "", &body, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A printf buffer with the alignment device memory has.
    fn aligned(size: usize) -> Vec<u32> {
        let mut words = vec![0u32; size / 4];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words).copy_from_slice(&PrintfBuffer::initial_contents(size));
        words
    }

    fn record(format: &str, args: &[u32]) -> Vec<u8> {
        let size = PrintfBuffer::record_size(format, args.len());
        let mut buffer = aligned(HEADER_SIZE + size);
        assert!(unsafe { PrintfBuffer::append(buffer.as_mut_ptr() as *mut u8, format, args) });
        bytemuck::cast_slice::<u32, u8>(&buffer)[HEADER_SIZE..].to_vec()
    }

    #[test]
    fn decodes_the_reference_record() {
        let text = decode_record(&record("v=%u pi=%.2f\n", &[7, 3.14f32.to_bits()])).unwrap();
        assert_eq!(text, "v=7 pi=3.14\n");
    }

    #[test]
    fn integer_conversions() {
        assert_eq!(format_with("%d|%i", &[(-5i32) as u32, 12]).unwrap(), "-5|12");
        assert_eq!(format_with("%x %X %#x %o %#o", &[255, 255, 255, 8, 8]).unwrap(), "ff FF 0xff 10 010");
        assert_eq!(format_with("[%5d][%-5d][%05d]", &[42, 42, 42]).unwrap(), "[   42][42   ][00042]");
        assert_eq!(format_with("%+d % d", &[3, 3]).unwrap(), "+3  3");
        assert_eq!(format_with("%.3u|%.0u", &[7, 0]).unwrap(), "007|");
        assert_eq!(format_with("100%%", &[]).unwrap(), "100%");
    }

    #[test]
    fn length_modifiers() {
        let big = 0x1_0000_0002u64;
        assert_eq!(format_with("%llu", &[big as u32, (big >> 32) as u32]).unwrap(), "4294967298");
        assert_eq!(format_with("%ld", &[u32::MAX, u32::MAX]).unwrap(), "-1");
        assert_eq!(format_with("%zu", &[5, 0]).unwrap(), "5");
        assert_eq!(format_with("%hu", &[0x1_0005]).unwrap(), "5");
        assert_eq!(format_with("%hhd", &[0xff]).unwrap(), "-1");
        assert_eq!(format_with("%hd", &[0xffff]).unwrap(), "-1");
        let pi = std::f64::consts::PI.to_bits();
        assert_eq!(format_with("%.5lf", &[pi as u32, (pi >> 32) as u32]).unwrap(), "3.14159");
    }

    #[test]
    fn floats() {
        assert_eq!(format_with("%f", &[1.5f32.to_bits()]).unwrap(), "1.500000");
        assert_eq!(format_with("%8.3f|", &[(-2.25f32).to_bits()]).unwrap(), "  -2.250|");
        assert_eq!(format_with("%08.2f", &[2.5f32.to_bits()]).unwrap(), "00002.50");
        assert_eq!(format_with("%f %F", &[f32::INFINITY.to_bits(), f32::NAN.to_bits()]).unwrap(), "inf NAN");
        assert_eq!(format_with("%.0f", &[2.0f32.to_bits()]).unwrap(), "2");
        assert_eq!(format_with("%#.0f", &[2.0f32.to_bits()]).unwrap(), "2.");
    }

    #[test]
    fn rejected_conversions() {
        for conversion in ['c', 's', 'e', 'g', 'p', 'a', 'n'] {
            let format = format!("%{conversion}");
            assert_eq!(
                format_with(&format, &[0, 0]),
                Err(PrintfError::UnsupportedConversion(conversion))
            );
        }
        assert!(matches!(format_with("%u %u", &[1]), Err(PrintfError::MissingArgument(_))));
        assert_eq!(format_with("%", &[]), Err(PrintfError::IncompleteConversion));
    }

    #[test]
    fn buffers_skip_bad_records_and_stop_at_overflow() {
        let mut buffer = aligned(64);
        let base = buffer.as_mut_ptr() as *mut u8;
        unsafe {
            assert!(PrintfBuffer::append(base, "a=%u\n", &[1]));
            assert!(PrintfBuffer::append(base, "%s\n", &[0]));
            assert!(PrintfBuffer::append(base, "b\n", &[]));
            assert!(!PrintfBuffer::append(base, "this record does not fit anymore %u\n", &[2]));
        }
        assert_eq!(decode_buffer(bytemuck::cast_slice(&buffer)).unwrap(), vec!["a=1\n".to_string(), "b\n".to_string()]);
        assert_eq!(decode_buffer(&[0, 0]), Err(PrintfError::TruncatedHeader));
    }

    #[test]
    fn rejected_records_reserve_nothing() {
        let mut buffer = aligned(32);
        let base = buffer.as_mut_ptr() as *mut u8;
        unsafe {
            for _ in 0..10_000 {
                assert!(!PrintfBuffer::append(base, "far too long for this buffer %u %u\n", &[1, 2]));
            }
            // the 8 bytes after the header are still free
            assert!(PrintfBuffer::append(base, "c\n", &[]));
        }
        let written = buffer[0] as usize;
        assert!(written <= 32);
        assert_eq!(decode_buffer(bytemuck::cast_slice(&buffer)).unwrap(), vec!["c\n".to_string()]);
    }
}
