//! Machine state and lifecycle.

use std::collections::HashMap;
use std::io::{self, Write};

use thiserror::Error;

use crate::image::Image;
use crate::number::LiteralCache;
use crate::prescan;
use crate::stack::{Stack, VarTable};
use crate::{Loc, Value};

/// Errors surfaced by execution. The machine itself tolerates every input;
/// only the host-facing output sink can fail.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("output error: {0}")]
    Io(#[from] io::Error),
}

/// Construction options.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Emit `debug!` events for branch-optimizer decisions during the
    /// prescan.
    pub branch_debug: bool,
}

/// A glyph virtual machine, generic over its output sink.
///
/// Construction copies the program image and runs the prescan; the tables
/// it produces are read-only afterwards. Stack, variables, PC, and the
/// terminate flag are mutated only by [`Vm::step`].
pub struct Vm<W: Write = io::Stdout> {
    pub(crate) image: Image,
    pub(crate) branch_target: Vec<Loc>,
    pub(crate) global_label: HashMap<u64, Loc>,
    pub(crate) literals: LiteralCache,
    pub(crate) vars: VarTable,
    pub(crate) stack: Stack,
    pub(crate) pc: Loc,
    pub(crate) terminate: bool,
    pub(crate) steps: u64,
    pub(crate) out: W,
}

impl Vm<io::Stdout> {
    /// Machine over `program` writing to stdout.
    pub fn new(program: impl Into<Vec<u8>>) -> Self {
        Self::with_output(program, VmOptions::default(), io::stdout())
    }
}

impl<W: Write> Vm<W> {
    /// Machine over `program` writing to `out`.
    pub fn with_output(program: impl Into<Vec<u8>>, options: VmOptions, out: W) -> Self {
        let image = Image::new(program);
        let mut literals = LiteralCache::new();
        let tables = prescan::prescan(&image, &mut literals, options.branch_debug);
        Self {
            image,
            branch_target: tables.branch_target,
            global_label: tables.global_label,
            literals,
            vars: VarTable::default(),
            stack: Stack::new(),
            pc: 0,
            terminate: false,
            steps: 0,
            out,
        }
    }

    /// Runs until the program terminates.
    pub fn run(&mut self) -> Result<(), VmError> {
        while !self.step()? {}
        Ok(())
    }

    /// Cached literal parse; see [`crate::number`].
    pub(crate) fn number_at(&mut self, start: Loc) -> (Value, Loc) {
        crate::number::scan_cached(
            &self.image,
            start,
            &mut self.literals,
            &mut self.branch_target,
        )
    }

    pub fn var(&self, var: u8) -> Value {
        self.vars.get(var)
    }

    pub fn set_var(&mut self, var: u8, val: Value) {
        self.vars.set(var, val);
    }

    pub fn pc(&self) -> Loc {
        self.pc
    }

    pub fn set_pc(&mut self, pc: Loc) {
        self.pc = pc;
    }

    /// Read-only view of the stack, bottom first.
    pub fn stack(&self) -> &[Value] {
        self.stack.values()
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn terminated(&self) -> bool {
        self.terminate
    }

    /// Byte at `loc`, the terminate byte out of range. For tracers.
    pub fn byte_at(&self, loc: Loc) -> u8 {
        self.image.byte_at(loc)
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Consumes the machine and hands back its sink.
    pub fn into_output(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(src: &str) -> Vm<Vec<u8>> {
        Vm::with_output(src, VmOptions::default(), Vec::new())
    }

    #[test]
    fn empty_program_terminates_immediately() {
        let mut machine = vm("");
        machine.run().unwrap();
        assert!(machine.terminated());
        assert_eq!(machine.steps(), 1);
        assert!(machine.output().is_empty());
    }

    #[test]
    fn accessors_round_trip() {
        let mut machine = vm("X");
        machine.set_var(b'q', 2.5);
        assert_eq!(machine.var(b'q'), 2.5);
        machine.set_pc(1);
        assert_eq!(machine.pc(), 1);
        assert_eq!(machine.byte_at(0), b'X');
        assert_eq!(machine.byte_at(9), b'X');
    }

    #[test]
    fn step_returns_the_terminate_flag() {
        let mut machine = vm("1 X");
        assert!(!machine.step().unwrap());
        assert_eq!(machine.stack(), &[1.0]);
        // the whitespace branch resolves straight into the terminator
        assert!(machine.step().unwrap());
        assert!(machine.terminated());
        assert_eq!(machine.steps(), 2);
    }
}
