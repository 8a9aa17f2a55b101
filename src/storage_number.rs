// =============================================================================
// Storage Number — lossy 32-bit fixed-point sample encoding
// =============================================================================
//
// Every ring slot is one packed u32:
//
//   bit 31        sign (1 = negative)
//   bit 30        exponent direction (1 = multiply on unpack, 0 = divide)
//   bits 29..27   exponent, 0..=7
//   bits 26..24   flags (bit 24 = exists, bit 25 = exists+reset)
//   bits 23..0    mantissa
//
// A slot with neither flag bit set is NOT_EXISTS. The all-zero bit pattern
// of freshly allocated (or zeroed) memory reads back as "no sample", which
// is what makes reinitialized ring files immediately usable.
// =============================================================================

use tracing::warn;

const SN_SIGN_BIT: u32 = 1 << 31;
const SN_MULTIPLY_BIT: u32 = 1 << 30;
const SN_EXP_SHIFT: u32 = 27;
const SN_EXP_MASK: u32 = 0x7;
const SN_FLAG_EXISTS: u32 = 1 << 24;
const SN_FLAG_RESET: u32 = 1 << 25;
const SN_MANTISSA_MASK: u32 = 0x00ff_ffff;

/// Largest magnitude the codec can represent: mantissa 0xffffff scaled by
/// 10^7.
pub const STORAGE_MAX_POSITIVE: f64 = 167_772_150_000_000.0;
pub const STORAGE_MIN_NEGATIVE: f64 = -167_772_150_000_000.0;

/// Guaranteed relative accuracy of a pack/unpack round trip for magnitudes
/// of at least [`ACCURACY_FLOOR`].
pub const ACCURACY_LOSS: f64 = 0.0001;
/// Below this magnitude the 24-bit mantissa runs out of digits and the
/// relative error is no longer bounded by [`ACCURACY_LOSS`].
pub const ACCURACY_FLOOR: f64 = 0.001;

/// A packed sample as stored in a ring slot.
pub type StorageNumber = u32;

// =============================================================================
// Flags
// =============================================================================

/// The per-slot annotation packed alongside the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFlags {
    /// No sample for this slot.
    NotExists,
    /// A normal sample.
    Exists,
    /// A sample written in the cycle where an incremental counter went
    /// backwards.
    ExistsReset,
}

impl SlotFlags {
    fn bits(&self) -> u32 {
        match self {
            Self::NotExists => 0,
            Self::Exists => SN_FLAG_EXISTS,
            Self::ExistsReset => SN_FLAG_RESET,
        }
    }
}

/// The decoded form of a slot, as seen by the query layer. The packed u32 is
/// an implementation detail of the storage layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Missing,
    Present { value: f64, reset: bool },
}

// =============================================================================
// Pack / unpack
// =============================================================================

/// Pack a finite value into the 32-bit storage form.
///
/// The mantissa is scaled by powers of ten (at most seven) so that it uses
/// as many of its 24 bits as possible. Values beyond the representable
/// range saturate at the maximum mantissa. NaN and infinities are not
/// defined inputs; callers filter them.
pub fn pack(value: f64, flags: SlotFlags) -> StorageNumber {
    let mut r = flags.bits();
    if value == 0.0 {
        return r;
    }

    let mut n = value;
    if n < 0.0 {
        r |= SN_SIGN_BIT;
        n = -n;
    }

    let mut exp: u32 = 0;
    if n > SN_MANTISSA_MASK as f64 {
        // Too big for the mantissa: divide by ten up to seven times and
        // remember to multiply back on unpack.
        while exp < 7 && n > SN_MANTISSA_MASK as f64 {
            n /= 10.0;
            exp += 1;
        }
        r |= SN_MULTIPLY_BIT | (exp << SN_EXP_SHIFT);

        if n > SN_MANTISSA_MASK as f64 {
            warn!(value, "storage number overflow, saturating");
            return r | SN_MANTISSA_MASK;
        }
    } else {
        // Small enough: multiply by ten while the mantissa still fits, and
        // divide back on unpack. 0x0019999e is the largest mantissa that
        // can take one more factor of ten.
        while exp < 7 && n < 0x0019_999e as f64 {
            n *= 10.0;
            exp += 1;
        }
        r |= exp << SN_EXP_SHIFT;
    }

    // Round to nearest; without it 0.9 would decode as 0.89.
    r | (n.round() as u32).min(SN_MANTISSA_MASK)
}

/// Unpack a slot into its decoded form.
pub fn unpack(sn: StorageNumber) -> Slot {
    if !exists(sn) {
        return Slot::Missing;
    }

    let mantissa = (sn & SN_MANTISSA_MASK) as f64;
    let exp = (sn >> SN_EXP_SHIFT) & SN_EXP_MASK;
    let scale = 10_f64.powi(exp as i32);

    let mut value = if sn & SN_MULTIPLY_BIT != 0 {
        mantissa * scale
    } else {
        mantissa / scale
    };
    if sn & SN_SIGN_BIT != 0 {
        value = -value;
    }

    Slot::Present {
        value,
        reset: did_reset(sn),
    }
}

/// True when the slot holds a sample (either flag bit set).
pub fn exists(sn: StorageNumber) -> bool {
    sn & (SN_FLAG_EXISTS | SN_FLAG_RESET) != 0
}

/// True when the slot was written in a counter-reset cycle.
pub fn did_reset(sn: StorageNumber) -> bool {
    sn & SN_FLAG_RESET != 0
}

/// The NOT_EXISTS slot value. Identical to zeroed memory.
pub const EMPTY_SLOT: StorageNumber = 0;

// =============================================================================
// Tests
// =============================================================================
