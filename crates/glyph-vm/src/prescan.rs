//! Static analysis run once at construction.
//!
//! Three passes over the program image produce the branch-target table and
//! the global-label map, so every branch the executor takes is a single
//! table lookup regardless of how far apart label and branch sit in the
//! text.
//!
//! Local backward branches resolve in the forward pass and local forward
//! branches in the reverse pass; each pass tracks the most recent sighting
//! of every label byte. Conditional branches resolve in the reverse pass
//! with a stack of then/else frames: crossing `;` opens a frame pointing at
//! the continuation, crossing `:` records where the alternative starts, and
//! crossing `?` consumes the frame. The final pass collapses chains of
//! unconditional branches down to their last hop.
//!
//! Global branches (`C`/`G`) draw their destination from the stack and
//! cannot be resolved here; predecoding the label literals covers most of
//! that cost.

use std::collections::HashMap;

use tracing::debug;

use crate::image::{fix_ws, Image, TERMINATE_BYTE, TERMINATE_PC};
use crate::number::{self, LiteralCache};
use crate::Loc;

/// Prescan output: everything the executor reads but never writes.
pub(crate) struct Tables {
    /// Indexed by the PC just past an opcode fetch; length `len + 1`.
    pub branch_target: Vec<Loc>,
    /// Global label values (bit patterns of normal doubles) to PCs.
    pub global_label: HashMap<u64, Loc>,
}

/// Opcodes a branch can be chained through: they either redirect the PC
/// unconditionally or terminate.
fn chainable(byte: u8) -> bool {
    matches!(
        byte,
        b'L' | b'F' | b'B' | b'@' | b':' | b' ' | b'X' | b';'
    )
}

struct ThenElse {
    after_then: Loc,
    after_else: Loc,
}

pub(crate) fn prescan(image: &Image, literals: &mut LiteralCache, branch_debug: bool) -> Tables {
    let len = image.len();
    let mut branch_target = vec![TERMINATE_PC; len as usize + 1];
    let mut global_label: HashMap<u64, Loc> = HashMap::new();
    let mut recent_local = [TERMINATE_PC; 256];

    // Forward pass: backward branches, global labels, literal predecoding.
    let mut loc: Loc = 0;
    while loc < len {
        let bytecode = fix_ws(image.byte_at(loc));
        loc += 1;

        match bytecode {
            // The label byte is read un-normalized, so labels named by
            // whitespace bytes stay distinguishable.
            b'L' => recent_local[image.byte_at(loc) as usize] = loc + 1,
            b'B' => branch_target[loc as usize] = recent_local[image.byte_at(loc) as usize],

            b'@' => {
                let (val, end) = number::scan_cached(image, loc, literals, &mut branch_target);
                if val.is_normal() {
                    if branch_debug {
                        debug!(value = val, pc = end, "global label");
                    }
                    global_label.insert(val.to_bits(), end);
                }
                branch_target[loc as usize] = end;
                loc = end;
            }

            b'0'..=b'9' | b'.' => {
                let (_, end) = number::scan_cached(image, loc - 1, literals, &mut branch_target);
                loc = end;
            }

            _ => {}
        }
    }

    // Reverse pass: forward branches, labels as jumps, conditionals,
    // whitespace runs.
    recent_local = [TERMINATE_PC; 256];
    let mut prevbyte = TERMINATE_BYTE;
    let mut last_non_ws = TERMINATE_PC;
    let mut lnw1 = TERMINATE_PC;
    let mut lnw2 = TERMINATE_PC;
    let mut then_else = vec![ThenElse {
        after_then: TERMINATE_PC,
        after_else: TERMINATE_PC,
    }];

    let mut loc = len;
    while loc > 0 {
        let lloc = loc;
        loc -= 1;
        let currbyte = image.byte_at(loc);
        let bytecode = fix_ws(currbyte);

        // `;` is transparent here: the trailing pointers name the next
        // opcode that actually executes.
        if bytecode != b' ' && bytecode != b';' {
            lnw2 = lnw1;
            lnw1 = last_non_ws;
            last_non_ws = loc;
        }

        let top = then_else.len() - 1;
        match bytecode {
            b'L' => {
                // Skip the label byte: jump to the second following opcode.
                branch_target[lloc as usize] = lnw2;
                recent_local[prevbyte as usize] = loc + 2;
            }
            b'F' => branch_target[lloc as usize] = recent_local[prevbyte as usize],

            b';' => {
                branch_target[lloc as usize] = last_non_ws;
                then_else.push(ThenElse {
                    after_then: last_non_ws,
                    after_else: last_non_ws,
                });
            }
            b':' => {
                branch_target[lloc as usize] = then_else[top].after_else;
                then_else[top].after_then = lnw1;
            }
            b'?' => {
                branch_target[lloc as usize] = then_else[top].after_then;
                if then_else.len() > 1 {
                    then_else.pop();
                }
            }

            b' ' => branch_target[lloc as usize] = last_non_ws,

            _ => {}
        }

        prevbyte = currbyte;
    }

    // Branch-to-branch pass: chase chains of unconditional branches so a
    // dynamic branch costs one lookup.
    let mut froms: Vec<Loc> = Vec::new();
    for loc in 0..len {
        let mut from = loc + 1;
        let mut tgt = branch_target[from as usize];
        froms.clear();
        froms.push(from);

        let mut hops: Loc = 0;
        while tgt != TERMINATE_PC {
            let target_byte = fix_ws(image.byte_at(tgt));
            if !chainable(target_byte) {
                break;
            }
            if target_byte == TERMINATE_BYTE {
                tgt = TERMINATE_PC;
                break;
            }
            // A chain longer than the image is a cycle of pure branches;
            // nothing real is ever reached, so the sources terminate.
            hops += 1;
            if hops > len {
                tgt = TERMINATE_PC;
                break;
            }
            from = tgt + 1;
            froms.push(from);
            tgt = branch_target[from as usize];
        }

        if branch_debug && froms.len() > 1 {
            debug!(
                from = loc + 1,
                hops = froms.len() - 1,
                to = tgt,
                "collapsed branch chain"
            );
        }
        for &f in &froms {
            branch_target[f as usize] = tgt;
        }
    }

    // Global labels that landed on a chainable opcode follow the (already
    // flattened) chain one step.
    for target in global_label.values_mut() {
        let target_byte = fix_ws(image.byte_at(*target));
        if chainable(target_byte) {
            *target = if target_byte == TERMINATE_BYTE {
                TERMINATE_PC
            } else {
                branch_target[(*target + 1) as usize]
            };
        }
    }

    Tables {
        branch_target,
        global_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(src: &str) -> Tables {
        let image = Image::new(src);
        let mut literals = LiteralCache::new();
        prescan(&image, &mut literals, false)
    }

    #[test]
    fn backward_branch_lands_after_its_label() {
        // L at 0 defines 'a' at offset 2; B at 4 leaves PC=5
        let t = tables("La5 Ba");
        assert_eq!(t.branch_target[5], 2);
    }

    #[test]
    fn forward_branch_lands_after_its_label() {
        let t = tables("Fa La5");
        assert_eq!(t.branch_target[1], 5);
    }

    #[test]
    fn label_jumps_past_its_identifier_byte() {
        let t = tables("La5");
        assert_eq!(t.branch_target[1], 2);
    }

    #[test]
    fn whitespace_chains_to_next_opcode() {
        let t = tables("1   2");
        // space fetched at 1 leaves PC=2; the next opcode is the '2' at 4
        assert_eq!(t.branch_target[2], 4);
        assert_eq!(t.branch_target[3], 4);
        assert_eq!(t.branch_target[4], 4);
    }

    #[test]
    fn conditional_targets_point_at_the_arms() {
        let src = "1 ? 2 ' : 3 ' ;";
        let t = tables(src);
        // '?' fetched at 2 leaves PC=3: jump target is the alternative
        assert_eq!(t.branch_target[3], 10);
        // ':' fetched at 8 leaves PC=9: skip the alternative, nothing after
        assert_eq!(t.branch_target[9], TERMINATE_PC);
    }

    #[test]
    fn nested_conditionals_keep_their_frames() {
        let src = "?1?2:3;':4;";
        let t = tables(src);
        // inner '?' at 2 jumps to the inner alternative '3' at 5
        assert_eq!(t.branch_target[3], 5);
        // outer '?' at 0 jumps to the outer alternative '4' at 9
        assert_eq!(t.branch_target[1], 9);
        // inner ':' at 4 skips to the continuation after the inner ';'
        assert_eq!(t.branch_target[5], 7);
    }

    #[test]
    fn global_label_records_the_offset_after_its_literal() {
        let t = tables("X @5D");
        assert_eq!(t.global_label.get(&5.0f64.to_bits()), Some(&4));
    }

    #[test]
    fn non_normal_global_labels_are_not_recorded() {
        let t = tables("@0 ");
        assert!(t.global_label.is_empty());
    }

    #[test]
    fn chains_collapse_to_a_real_opcode() {
        // every resolved target is either the sentinel or a real opcode
        for src in ["La Ba", "1 ? 2 ' : 3 ' ;", "Fa  La  5' Ba", "@7 La1 Ba"] {
            let image = Image::new(src);
            let mut literals = LiteralCache::new();
            let t = prescan(&image, &mut literals, false);
            for &tgt in &t.branch_target {
                if tgt != TERMINATE_PC {
                    assert!(
                        !chainable(fix_ws(image.byte_at(tgt))),
                        "{src:?}: target {tgt} is still chainable"
                    );
                }
            }
        }
    }

    #[test]
    fn branch_cycles_resolve_to_the_sentinel() {
        let t = tables("LaBa");
        assert_eq!(t.branch_target[3], TERMINATE_PC);
        assert_eq!(t.branch_target[1], TERMINATE_PC);
    }

    #[test]
    fn chain_through_terminate_byte_is_the_sentinel() {
        let t = tables("  X");
        assert_eq!(t.branch_target[1], TERMINATE_PC);
    }

    #[test]
    fn global_label_on_whitespace_follows_the_chain() {
        // label literal ends at the space; the chain lands on the '1'
        let t = tables("X@5  1");
        assert_eq!(t.global_label.get(&5.0f64.to_bits()), Some(&5));
    }
}
