//! Decimal parsing and the ad-hoc fixed-point float packing used by the
//! `read_float`/`write_float`/`read_num`/`write_num` syscalls.

/// Parses a decimal integer, handling a single leading `-`, using a standard
/// `res = res*10 + digit` accumulator (not the source's buggy power-scaling).
/// Returns `(negative, magnitude)`.
pub fn parse_decimal(s: &str) -> (bool, u64) {
    let mut chars = s.chars().peekable();
    let negative = matches!(chars.peek(), Some('-'));
    if negative {
        chars.next();
    }
    let mut magnitude: u64 = 0;
    for c in chars {
        if let Some(digit) = c.to_digit(10) {
            magnitude = magnitude.wrapping_mul(10).wrapping_add(u64::from(digit));
        }
    }
    (negative, magnitude)
}

/// Splits a `<integer>.<fraction>` decimal string into its two raw digit values.
pub fn parse_decimal_float(s: &str) -> (u64, u64) {
    let mut parts = s.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    let (_, integer) = parse_decimal(int_part);
    let (_, fraction) = parse_decimal(frac_part);
    (integer, fraction)
}

/// Packs `(integer, fraction)` into the ad-hoc fixed-point layout: a marker bit
/// sits above a `4*width`-bit fraction field, with the integer above that. Not
/// IEEE-754 — preserved verbatim as a binary-compatibility decision; the
/// encode/decode shift amounts are made consistent with each other, unlike the
/// original source's two independent implementations.
pub fn pack_float(width: u8, integer: u64, fraction: u64) -> u64 {
    let frac_bits = 4 * u32::from(width);
    let int_mask = (1u64 << (frac_bits - 1)) - 1;
    let frac_mask = (1u64 << frac_bits) - 1;
    ((integer & int_mask) << 1 | 1) << frac_bits | (fraction & frac_mask)
}

/// Inverse of [`pack_float`]. Returns `(integer, fraction)`.
pub fn unpack_float(width: u8, value: u64) -> (u64, u64) {
    let frac_bits = 4 * u32::from(width);
    let frac_mask = (1u64 << frac_bits) - 1;
    let fraction = value & frac_mask;
    let integer = value >> (frac_bits + 1);
    (integer, fraction)
}

/// Formats an N-byte zero-extended value for `write_num`: if the top bit of the
/// N-byte value is set, prints `-` followed by its two's-complement magnitude;
/// otherwise prints it unsigned.
pub fn format_signed_num(width: u8, value: u64) -> String {
    let bits = 8 * u32::from(width);
    let sign_bit = 1u64 << (bits - 1);
    if value & sign_bit != 0 {
        let magnitude = if bits >= 64 {
            (!value).wrapping_add(1)
        } else {
            (1u64 << bits) - value
        };
        format!("-{magnitude}")
    } else {
        format!("{value}")
    }
}
