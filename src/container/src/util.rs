//! Small helpers for propagating configuration between nested structs.
//!
//! Resource-level settings (SSH config, common images, CA certificates)
//! flow into member-level configs through explicit merges built on these
//! pickers, never through hidden global defaults.

/// Returns the first non-empty string from the given candidates, or an
/// empty string when all of them are empty.
pub fn pick_string<'a>(values: &[&'a str]) -> &'a str {
    values.iter().find(|v| !v.is_empty()).copied().unwrap_or("")
}

/// Returns the first non-zero value from the given candidates, or zero.
pub fn pick_u64(values: &[u64]) -> u64 {
    values.iter().find(|v| **v != 0).copied().unwrap_or(0)
}

/// Returns the first non-zero port from the given candidates, or zero.
pub fn pick_u16(values: &[u16]) -> u16 {
    values.iter().find(|v| **v != 0).copied().unwrap_or(0)
}
