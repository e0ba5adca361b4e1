//! `Range` header parsing.
//!
//! Distinguishes a syntactically invalid header (served as a full
//! response) from a syntactically valid but unsatisfiable one (416). Only
//! the first satisfiable range is honored; multi-range responses are not
//! produced.

/// Outcome of parsing a `Range` header against a known object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Malformed header; treat as if no range was requested.
    Invalid,
    /// Valid syntax, but no requested range overlaps the object.
    Unsatisfiable,
    /// First satisfiable range, both bounds inclusive.
    Satisfiable { start: u64, end: u64 },
}

/// Parses a `bytes=` range header against `size`.
pub fn parse_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Invalid;
    };
    if spec.is_empty() {
        return RangeOutcome::Invalid;
    }

    let mut saw_valid_syntax = false;
    for part in spec.split(',') {
        let part = part.trim();
        let Some((first, last)) = part.split_once('-') else {
            return RangeOutcome::Invalid;
        };

        let (start, end) = if first.is_empty() {
            // Suffix form: last N bytes.
            let Ok(suffix) = last.parse::<u64>() else {
                return RangeOutcome::Invalid;
            };
            saw_valid_syntax = true;
            if suffix == 0 || size == 0 {
                continue;
            }
            (size.saturating_sub(suffix), size - 1)
        } else {
            let Ok(start) = first.parse::<u64>() else {
                return RangeOutcome::Invalid;
            };
            let end = if last.is_empty() {
                size.saturating_sub(1)
            } else {
                match last.parse::<u64>() {
                    Ok(end) => end.min(size.saturating_sub(1)),
                    Err(_) => return RangeOutcome::Invalid,
                }
            };
            saw_valid_syntax = true;
            if start >= size || start > end {
                continue;
            }
            (start, end)
        };

        return RangeOutcome::Satisfiable { start, end };
    }

    if saw_valid_syntax {
        RangeOutcome::Unsatisfiable
    } else {
        RangeOutcome::Invalid
    }
}
