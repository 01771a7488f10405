//! Core virtual machine for glyph, a compact character-oriented bytecode
//! language.
//!
//! A glyph program is a stream of bytes. Most printable characters are
//! opcodes; numeric literals and label definitions are parsed inline from the
//! same stream. The machine keeps a stack of `f64` values, a 256-slot
//! variable table, and a program counter walking the byte stream.
//!
//! Construction runs a three-pass prescan that resolves every local and
//! global label, predecodes numeric literals, and collapses branch-to-branch
//! chains, so execution never scans the program text at run time.

pub mod convert;
mod exec;
pub mod image;
mod number;
mod prescan;
pub mod stack;
mod vm;

pub use image::Image;
pub use stack::{Stack, VarTable};
pub use vm::{Vm, VmError, VmOptions};

/// Byte offset into a program image. Signed so that complemented PCs used as
/// return markers survive the round trip through the value domain.
pub type Loc = i64;

/// The single run-time value type.
pub type Value = f64;
