//! Bit flags recorded on measurement results.
//!
//! Flags are accumulated with bitwise OR and never cleared, so a value of zero
//! always means every stage that touched the object succeeded. Catalog rows
//! carry three flag fields: the object's moments flags, the PSF moments flags,
//! and their union.

/// Object measurement was never attempted
pub const NO_ATTEMPT: u32 = 1 << 0;
/// Object stamp touches pixels whose bad-pixel mask intersects the reject bits
pub const IMAGE_FLAGS: u32 = 1 << 1;
/// PSF fit or PSF aggregation failed
pub const PSF_FAILURE: u32 = 1 << 2;
/// No pixel carried positive weight
pub const ZERO_WEIGHTS: u32 = 1 << 4;
/// Weighted flux was not positive
pub const NONPOS_FLUX: u32 = 1 << 5;
/// Weighted size was not positive
pub const NONPOS_SIZE: u32 = 1 << 6;
/// Flux variance was not positive
pub const NONPOS_VAR: u32 = 1 << 7;
/// A derived quantity was NaN or infinite
pub const NONFINITE: u32 = 1 << 8;

/// Bad-pixel mask bits written by the pipeline itself.
pub mod bmask {
    /// Stamp pixel lies outside the parent image
    pub const EDGE: i32 = 1 << 30;
}

const FLAG_NAMES: [(u32, &str); 8] = [
    (NO_ATTEMPT, "NO_ATTEMPT"),
    (IMAGE_FLAGS, "IMAGE_FLAGS"),
    (PSF_FAILURE, "PSF_FAILURE"),
    (ZERO_WEIGHTS, "ZERO_WEIGHTS"),
    (NONPOS_FLUX, "NONPOS_FLUX"),
    (NONPOS_SIZE, "NONPOS_SIZE"),
    (NONPOS_VAR, "NONPOS_VAR"),
    (NONFINITE, "NONFINITE"),
];

/// Names of the set bits, in bit order.
///
/// Bits without a name are reported as `UNKNOWN(0x..)`.
pub fn flag_names(flags: u32) -> Vec<String> {
    let mut names = Vec::new();
    let mut known = 0;
    for (bit, name) in FLAG_NAMES {
        known |= bit;
        if flags & bit != 0 {
            names.push(name.to_string());
        }
    }
    let unknown = flags & !known;
    if unknown != 0 {
        names.push(format!("UNKNOWN({unknown:#x})"));
    }
    names
}

/// Human readable form of a flag word, `"OK"` when no bits are set.
pub fn flag_string(flags: u32) -> String {
    if flags == 0 {
        return "OK".to_string();
    }
    flag_names(flags).join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let mut seen = 0u32;
        for (bit, _) in FLAG_NAMES {
            assert_eq!(bit.count_ones(), 1);
            assert_eq!(seen & bit, 0, "bit {bit:#x} reused");
            seen |= bit;
        }
    }

    #[test]
    fn test_flag_names() {
        assert!(flag_names(0).is_empty());
        assert_eq!(
            flag_names(IMAGE_FLAGS | NO_ATTEMPT),
            vec!["NO_ATTEMPT", "IMAGE_FLAGS"]
        );
    }

    #[test]
    fn test_unknown_bits_reported() {
        let names = flag_names(NONFINITE | (1 << 20));
        assert_eq!(names, vec!["NONFINITE".to_string(), "UNKNOWN(0x100000)".to_string()]);
    }

    #[test]
    fn test_flag_string() {
        assert_eq!(flag_string(0), "OK");
        assert_eq!(flag_string(PSF_FAILURE | NONPOS_VAR), "PSF_FAILURE|NONPOS_VAR");
    }
}
