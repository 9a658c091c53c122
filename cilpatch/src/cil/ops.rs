//! The supported CIL operation set.
//!
//! Operands are carried inline in the enum variants. Short and long opcode
//! encodings (`br.s` vs `br`, `ldc.i4.s` vs `ldc.i4`) are a serialization
//! concern only; in memory there is exactly one canonical form per
//! operation.

use crate::cil::{InstrId, SigLookup};
use crate::image::Token;
use crate::{Error, Result};

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Next,
    /// Unconditional jump
    Branch(InstrId),
    /// Two-way: falls through or jumps
    CondBranch(InstrId),
    /// Exits a protected region, emptying the evaluation stack
    Leave(InstrId),
    /// Returns from the method
    Return,
    /// Raises an exception
    Throw,
}

/// One CIL operation with its operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// No operation
    Nop,
    /// Load argument by index (0 = `this` for instance methods)
    Ldarg(u16),
    /// Store into argument slot
    Starg(u16),
    /// Load local variable
    Ldloc(u16),
    /// Store local variable
    Stloc(u16),
    /// Push a 32-bit integer constant
    LdcI4(i32),
    /// Push a 32-bit float constant
    LdcR4(f32),
    /// Push null
    Ldnull,
    /// Push a string literal
    Ldstr(String),
    /// Duplicate the top of stack
    Dup,
    /// Discard the top of stack
    Pop,
    /// Call a static or non-virtual method
    Call(Token),
    /// Call through the virtual dispatch path
    Callvirt(Token),
    /// Return from the method
    Ret,
    /// Raise the exception object on top of the stack
    Throw,
    /// Unconditional branch
    Br(InstrId),
    /// Branch if the top of stack is zero/null
    Brfalse(InstrId),
    /// Branch if the top of stack is non-zero
    Brtrue(InstrId),
    /// Exit a protected region
    Leave(InstrId),
    /// Load an instance field
    Ldfld(Token),
    /// Store an instance field
    Stfld(Token),
    /// Load a static field
    Ldsfld(Token),
    /// Store a static field
    Stsfld(Token),
}

impl Op {
    /// The ildasm-style mnemonic.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::Ldarg(_) => "ldarg",
            Op::Starg(_) => "starg",
            Op::Ldloc(_) => "ldloc",
            Op::Stloc(_) => "stloc",
            Op::LdcI4(_) => "ldc.i4",
            Op::LdcR4(_) => "ldc.r4",
            Op::Ldnull => "ldnull",
            Op::Ldstr(_) => "ldstr",
            Op::Dup => "dup",
            Op::Pop => "pop",
            Op::Call(_) => "call",
            Op::Callvirt(_) => "callvirt",
            Op::Ret => "ret",
            Op::Throw => "throw",
            Op::Br(_) => "br",
            Op::Brfalse(_) => "brfalse",
            Op::Brtrue(_) => "brtrue",
            Op::Leave(_) => "leave",
            Op::Ldfld(_) => "ldfld",
            Op::Stfld(_) => "stfld",
            Op::Ldsfld(_) => "ldsfld",
            Op::Stsfld(_) => "stsfld",
        }
    }

    /// Control-flow classification.
    #[must_use]
    pub fn flow(&self) -> FlowType {
        match self {
            Op::Br(target) => FlowType::Branch(*target),
            Op::Brtrue(target) | Op::Brfalse(target) => FlowType::CondBranch(*target),
            Op::Leave(target) => FlowType::Leave(*target),
            Op::Ret => FlowType::Return,
            Op::Throw => FlowType::Throw,
            _ => FlowType::Next,
        }
    }

    /// The branch target, for the four branching operations.
    #[must_use]
    pub fn branch_target(&self) -> Option<InstrId> {
        match self {
            Op::Br(t) | Op::Brtrue(t) | Op::Brfalse(t) | Op::Leave(t) => Some(*t),
            _ => None,
        }
    }

    /// The call target, for `call`/`callvirt`.
    #[must_use]
    pub fn call_target(&self) -> Option<Token> {
        match self {
            Op::Call(t) | Op::Callvirt(t) => Some(*t),
            _ => None,
        }
    }

    /// Evaluation-stack effect as (pops, pushes).
    ///
    /// `ret` reports zero here; the validator accounts for the return slot
    /// from the method signature, since the operation itself cannot know it.
    ///
    /// # Errors
    /// Fails when a call or field token cannot be resolved through `sigs` -
    /// an unresolvable token can never serialize into a loadable image.
    pub fn stack_effect(&self, sigs: &dyn SigLookup) -> Result<(usize, usize)> {
        Ok(match self {
            Op::Nop | Op::Ret => (0, 0),
            Op::Ldarg(_) | Op::Ldloc(_) | Op::LdcI4(_) | Op::LdcR4(_) | Op::Ldnull => (0, 1),
            Op::Ldstr(_) | Op::Ldsfld(_) => (0, 1),
            Op::Starg(_) | Op::Stloc(_) | Op::Pop | Op::Throw | Op::Stsfld(_) => (1, 0),
            Op::Brtrue(_) | Op::Brfalse(_) => (1, 0),
            Op::Br(_) | Op::Leave(_) => (0, 0),
            Op::Dup => (1, 2),
            Op::Ldfld(_) => (1, 1),
            Op::Stfld(_) => (2, 0),
            Op::Call(token) | Op::Callvirt(token) => {
                let sig = sigs.method_sig(*token).ok_or_else(|| {
                    Error::Serialization(format!("call target {token} is not a known method"))
                })?;
                (sig.arg_slots(), usize::from(sig.returns_value()))
            }
        })
    }
}
