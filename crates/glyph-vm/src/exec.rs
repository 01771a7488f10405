//! Single-instruction dispatch.
//!
//! One step fetches a byte, normalizes whitespace, widens `\`-escaped bytes
//! into the 256..512 half of the opcode space, and dispatches. Control-flow
//! opcodes never scan the program: they read the branch-target table the
//! prescanner built.

use std::io::Write;

use crate::convert;
use crate::image::{fix_ws, TERMINATE_BYTE, TERMINATE_PC};
use crate::vm::{Vm, VmError};
use crate::{Loc, Value};

impl<W: Write> Vm<W> {
    /// Executes one instruction. The terminate flag is cleared on entry and
    /// returned on exit, so callers loop with `while !vm.step()? {}`.
    pub fn step(&mut self) -> Result<bool, VmError> {
        self.terminate = false;
        self.steps += 1;

        let byte = fix_ws(self.next_byte());
        if byte == b'\\' {
            let escaped = self.next_byte();
            self.library(escaped)?;
        } else {
            self.base(byte)?;
        }
        Ok(self.terminate)
    }

    /// Fetches the byte at the PC and advances. Out-of-range fetches yield
    /// the terminate byte and leave the PC alone.
    fn next_byte(&mut self) -> u8 {
        if self.pc < 0 || self.pc >= self.image.len() {
            return TERMINATE_BYTE;
        }
        let byte = self.image.byte_at(self.pc);
        self.pc += 1;
        byte
    }

    /// Redirects the PC, or terminates when the destination is the sentinel.
    fn jump(&mut self, target: Loc) {
        if target == TERMINATE_PC {
            self.terminate = true;
        } else {
            self.pc = target;
        }
    }

    /// Takes the precomputed branch for the opcode just fetched.
    fn branch(&mut self) {
        let target = self.branch_target[self.pc as usize];
        self.jump(target);
    }

    /// Resolves a destination value into a PC. Negative values are
    /// complemented PCs (return markers from `C`); positive normal values
    /// name global labels. Anything else terminates.
    fn resolve(&self, val: Value) -> Loc {
        if val < 0.0 {
            return !convert::int(val);
        }
        if val.is_normal() {
            if let Some(&target) = self.global_label.get(&val.to_bits()) {
                return target;
            }
        }
        TERMINATE_PC
    }

    /// Pops the right operand and rewrites the (possibly materialized) top.
    fn binary(&mut self, op: impl FnOnce(Value, Value) -> Value) {
        let rhs = self.stack.pop();
        let top = self.stack.top();
        *top = op(*top, rhs);
    }

    fn unary(&mut self, op: impl FnOnce(Value) -> Value) {
        let top = self.stack.top();
        *top = op(*top);
    }

    fn print_value(&mut self, val: Value) -> Result<(), VmError> {
        writeln!(self.out, "{val}")?;
        Ok(())
    }

    fn undefined(&mut self, byte: u8) -> Result<(), VmError> {
        self.out.write_all(b"Undefined bytecode '")?;
        self.out.write_all(&[byte])?;
        writeln!(self.out, "' at {}. Terminating.", self.pc - 1)?;
        self.terminate = true;
        Ok(())
    }

    /// Base opcode space: bytes 0..256 after whitespace normalization.
    fn base(&mut self, opcode: u8) -> Result<(), VmError> {
        match opcode {
            b'X' => self.terminate = true,

            b'0'..=b'9' | b'.' => {
                let (val, end) = self.number_at(self.pc - 1);
                self.pc = end;
                self.stack.push(val);
            }

            b'a'..=b'z' => {
                let val = self.vars.get(opcode);
                self.stack.push(val);
            }

            b'+' => self.binary(|top, rhs| top + rhs),
            b'-' => self.binary(|top, rhs| top - rhs),
            b'*' => self.binary(|top, rhs| top * rhs),
            b'/' => self.binary(|top, rhs| top / rhs),
            b'%' => self.binary(|top, rhs| top % rhs),
            b'~' => self.unary(|top| -top),
            b'&' => self.binary(|top, rhs| (convert::uint(top) & convert::uint(rhs)) as Value),
            b'|' => self.binary(|top, rhs| (convert::uint(top) | convert::uint(rhs)) as Value),
            b'^' => self.binary(|top, rhs| (convert::uint(top) ^ convert::uint(rhs)) as Value),
            b'<' => self.binary(|top, rhs| top * rhs.exp2()),
            b'>' => self.binary(|top, rhs| top / rhs.exp2()),

            b'I' => self.unary(|top| convert::int(top) as Value),
            b'U' => self.unary(|top| convert::uint(top) as Value),

            b'\'' => {
                let val = *self.stack.top();
                self.print_value(val)?;
            }
            b'!' => {
                let var = self.next_byte();
                let val = self.vars.get(var);
                self.print_value(val)?;
            }

            b'D' => {
                let val = *self.stack.top();
                self.stack.push(val);
            }
            b'P' => {
                self.stack.pop();
            }
            b'Q' => {
                let n = convert::nat(self.stack.pop());
                self.stack.drop_n(n);
            }
            b'R' => {
                let n = convert::nat(self.stack.pop());
                self.stack.rotate(n);
            }
            b'S' => {
                let a = self.stack.pop();
                let b = self.stack.pop();
                self.stack.push(a);
                self.stack.push(b);
            }

            b'M' => {
                let var = self.next_byte();
                let val = self.stack.pop();
                self.vars.set(var, val);
            }
            b'V' => {
                let var = self.next_byte();
                let val = self.vars.get(var);
                self.stack.push(val);
            }

            b'C' => {
                let popped = self.stack.pop();
                let dst = self.resolve(popped);
                self.stack.push(!self.pc as Value);
                self.jump(dst);
            }
            b'G' => {
                let popped = self.stack.pop();
                let dst = self.resolve(popped);
                self.jump(dst);
            }

            // A non-negative condition skips to the alternative; a negative
            // one falls through into the consequent.
            b'?' => {
                let val = self.stack.pop();
                if !(val < 0.0) {
                    self.branch();
                }
            }

            b'L' | b'@' | b':' | b'B' | b'F' | b' ' | b';' => self.branch(),

            other => self.undefined(other)?,
        }
        Ok(())
    }

    /// Escape opcode space: `\` + byte dispatches the floating-point
    /// library.
    fn library(&mut self, opcode: u8) -> Result<(), VmError> {
        match opcode {
            b'^' => self.binary(Value::powf),
            b'h' => self.binary(Value::hypot),
            b'H' => {
                let x = self.stack.pop();
                let y = self.stack.pop();
                self.unary(|top| top.hypot(y).hypot(x));
            }
            b'a' => self.binary(Value::atan2),

            b's' => self.unary(Value::sin),
            b'S' => self.unary(Value::asin),
            b'c' => self.unary(Value::cos),
            b'C' => self.unary(Value::acos),
            b't' => self.unary(Value::tan),
            b'T' => self.unary(Value::atan),

            b'x' => self.unary(Value::sinh),
            b'X' => self.unary(Value::asinh),
            b'y' => self.unary(Value::cosh),
            b'Y' => self.unary(Value::acosh),
            b'z' => self.unary(Value::tanh),
            b'Z' => self.unary(Value::atanh),

            b'v' => self.unary(libm::erf),
            b'V' => self.unary(libm::erfc),
            b'u' => self.unary(libm::tgamma),
            b'U' => self.unary(libm::lgamma),

            b'e' => self.unary(Value::exp),
            b'l' => self.unary(Value::ln),
            b'2' => self.unary(Value::log2),
            b'q' => self.unary(Value::sqrt),
            b'3' => self.unary(Value::cbrt),

            b'>' => self.unary(Value::ceil),
            b'<' => self.unary(Value::floor),
            b'_' => self.unary(Value::trunc),
            b'|' => self.unary(Value::abs),
            b'i' => self.unary(Value::round),
            b'I' => self.unary(Value::round_ties_even),

            b'f' => {
                let (mantissa, exponent) = libm::frexp(*self.stack.top());
                *self.stack.top() = mantissa;
                self.stack.push(Value::from(exponent));
            }
            b'F' => self.binary(|top, rhs| libm::ldexp(top, rhs as i32)),
            b'm' => {
                let (fract, int_part) = libm::modf(*self.stack.top());
                *self.stack.top() = fract;
                self.stack.push(int_part);
            }
            b'-' => self.unary(|top| if top.is_sign_negative() { 1.0 } else { 0.0 }),
            b'+' => self.binary(Value::copysign),

            other => self.undefined(other)?,
        }
        Ok(())
    }
}
