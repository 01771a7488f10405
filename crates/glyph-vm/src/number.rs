//! Inline numeric-literal scanner.
//!
//! Literals live in the instruction stream itself and follow the shape
//! `digits (. digits (. digits)?)?`: the first `.` opens the fractional
//! part and the second switches to accumulating a base-10 exponent. The
//! exponent commits when the literal ends — at a third `.` (consumed) or at
//! the first byte that is neither a digit nor `.` (left in place so it
//! dispatches as the next opcode).

use crate::image::Image;
use crate::{Loc, Value};

/// Parsed literals keyed by start offset. Both the prescanner and the
/// executor scan through this cache, so each literal is decoded once.
pub(crate) type LiteralCache = std::collections::HashMap<Loc, (Value, Loc)>;

enum State {
    Idle,
    Integer,
    Fraction,
    Exponent,
}

/// Parses the literal starting at `start`. Returns the value and the offset
/// of the first byte after the literal.
pub(crate) fn scan(image: &Image, start: Loc) -> (Value, Loc) {
    let mut state = State::Idle;
    let mut val: f64 = 0.0;
    let mut p: f64 = 0.0;
    let mut loc = start;

    loop {
        let byte = image.byte_at(loc);
        loc += 1;

        match byte {
            b'0'..=b'9' => {
                let digit = f64::from(byte - b'0');
                match state {
                    State::Idle => {
                        val = digit;
                        state = State::Integer;
                    }
                    State::Integer => val = val * 10.0 + digit,
                    State::Fraction => {
                        val += digit / p;
                        p *= 10.0;
                    }
                    State::Exponent => p = p * 10.0 + digit,
                }
            }

            b'.' => match state {
                State::Idle | State::Integer => {
                    state = State::Fraction;
                    p = 10.0;
                }
                State::Fraction => {
                    state = State::Exponent;
                    p = 0.0;
                }
                State::Exponent => {
                    val *= 10f64.powi(p as i32);
                    return (val, loc);
                }
            },

            _ => {
                loc -= 1; // the terminator is the next opcode
                if let State::Exponent = state {
                    val *= 10f64.powi(p as i32);
                }
                return (val, loc);
            }
        }
    }
}

/// Caching scan. Fills `cache` on a miss and records the literal's skip
/// target in `branch_target`, whether the call originates from the
/// prescanner or from the executor.
pub(crate) fn scan_cached(
    image: &Image,
    start: Loc,
    cache: &mut LiteralCache,
    branch_target: &mut [Loc],
) -> (Value, Loc) {
    if let Some(&hit) = cache.get(&start) {
        return hit;
    }
    let (val, end) = scan(image, start);
    cache.insert(start, (val, end));
    if let Some(slot) = branch_target.get_mut((start + 1) as usize) {
        *slot = end;
    }
    (val, end)
}
