//! Structural validation of method bodies.
//!
//! Runs before every serialization: a body that fails here must never reach
//! the file write, since the failure means an injector (or a hand-built
//! body) produced an image that would not load. Checks branch-target
//! existence, exception-region well-formedness, fall-off-the-end, and
//! simulates the evaluation stack across the control-flow graph to prove
//! balance and recompute the max-stack ceiling.

use std::collections::HashMap;

use crate::cil::{FlowType, InstrId, SigLookup};
use crate::image::{MethodBody, MethodSig};
use crate::{Error, Result};

/// Facts established about a valid body.
#[derive(Debug, Clone, Copy)]
pub struct BodyMetrics {
    /// Proven operand-stack ceiling
    pub max_stack: u16,
}

fn invariant(method: &str, details: String) -> Error {
    Error::StructuralInvariant {
        method: method.to_string(),
        details,
    }
}

/// Validate one method body, returning its stack metrics.
pub fn validate_body(
    method_name: &str,
    body: &MethodBody,
    sig: &MethodSig,
    sigs: &dyn SigLookup,
) -> Result<BodyMetrics> {
    let stream = &body.instructions;
    if stream.is_empty() {
        return Err(invariant(method_name, "method body has no instructions".into()));
    }

    let index_of: HashMap<InstrId, usize> = stream
        .iter()
        .enumerate()
        .map(|(idx, instr)| (instr.id, idx))
        .collect();

    // Branch targets must reference instructions that exist.
    for instr in stream {
        if let Some(target) = instr.op.branch_target() {
            if !index_of.contains_key(&target) {
                return Err(invariant(
                    method_name,
                    format!("{} targets a removed or foreign instruction", instr.op.mnemonic()),
                ));
            }
        }
    }

    // The last instruction must not fall off the end.
    let last = stream.at(stream.len() - 1).unwrap();
    if matches!(last.op.flow(), FlowType::Next | FlowType::CondBranch(_)) {
        return Err(invariant(
            method_name,
            format!("control can fall off the end after '{}'", last.op.mnemonic()),
        ));
    }

    let regions = resolve_regions(method_name, body, &index_of, stream.len())?;
    check_region_nesting(method_name, &regions)?;

    let max_stack = simulate_stack(method_name, body, sig, sigs, &index_of, &regions)?;

    Ok(BodyMetrics {
        max_stack: u16::try_from(max_stack)
            .map_err(|_| invariant(method_name, "stack depth exceeds u16".into()))?,
    })
}

/// An exception region with boundaries resolved to indices.
struct Region {
    try_range: (usize, usize),
    handler_range: (usize, usize),
    is_catch: bool,
}

fn resolve_regions(
    method_name: &str,
    body: &MethodBody,
    index_of: &HashMap<InstrId, usize>,
    len: usize,
) -> Result<Vec<Region>> {
    let resolve = |id: InstrId| -> Result<usize> {
        index_of.get(&id).copied().ok_or_else(|| {
            invariant(
                method_name,
                "exception region boundary references a removed instruction".into(),
            )
        })
    };
    let resolve_end = |id: Option<InstrId>| -> Result<usize> {
        match id {
            Some(id) => resolve(id),
            None => Ok(len),
        }
    };

    let mut regions = Vec::with_capacity(body.exception_handlers.len());
    for handler in &body.exception_handlers {
        let region = Region {
            try_range: (resolve(handler.try_start)?, resolve_end(handler.try_end)?),
            handler_range: (
                resolve(handler.handler_start)?,
                resolve_end(handler.handler_end)?,
            ),
            is_catch: handler.is_catch(),
        };
        for (label, (start, end)) in [
            ("try", region.try_range),
            ("handler", region.handler_range),
        ] {
            if start >= end {
                return Err(invariant(
                    method_name,
                    format!("{label} region is empty or inverted ({start}..{end})"),
                ));
            }
        }
        if overlaps(region.try_range, region.handler_range) {
            return Err(invariant(
                method_name,
                "try region overlaps its own handler".into(),
            ));
        }
        regions.push(region);
    }
    Ok(regions)
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn nested_or_disjoint(a: (usize, usize), b: (usize, usize)) -> bool {
    // disjoint
    if a.1 <= b.0 || b.1 <= a.0 {
        return true;
    }
    // one properly inside the other
    (a.0 >= b.0 && a.1 <= b.1) || (b.0 >= a.0 && b.1 <= a.1)
}

fn check_region_nesting(method_name: &str, regions: &[Region]) -> Result<()> {
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            if !nested_or_disjoint(a.try_range, b.try_range) {
                return Err(invariant(
                    method_name,
                    "try regions partially overlap; they must be disjoint or nested".into(),
                ));
            }
            if !nested_or_disjoint(a.handler_range, b.handler_range) {
                return Err(invariant(
                    method_name,
                    "handler regions partially overlap".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Walk the control-flow graph propagating stack depths; any underflow,
/// inconsistent merge, or misbalanced return fails validation.
fn simulate_stack(
    method_name: &str,
    body: &MethodBody,
    sig: &MethodSig,
    sigs: &dyn SigLookup,
    index_of: &HashMap<InstrId, usize>,
    regions: &[Region],
) -> Result<usize> {
    let stream = &body.instructions;
    let len = stream.len();
    let mut depths: Vec<Option<usize>> = vec![None; len];
    let mut worklist: Vec<(usize, usize)> = Vec::new();

    let mut seed = |worklist: &mut Vec<(usize, usize)>, idx: usize, depth: usize| {
        worklist.push((idx, depth));
    };

    seed(&mut worklist, 0, 0);
    for region in regions {
        // Catch and filter handlers start with the exception object pushed.
        let entry_depth = usize::from(region.is_catch);
        seed(&mut worklist, region.handler_range.0, entry_depth);
    }

    let mut max_depth = 0usize;

    while let Some((idx, depth)) = worklist.pop() {
        match depths[idx] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(invariant(
                    method_name,
                    format!(
                        "inconsistent stack depth at instruction {idx}: {known} vs {depth}"
                    ),
                ));
            }
            None => depths[idx] = Some(depth),
        }

        let instr = stream.at(idx).unwrap();
        let (pops, pushes) = instr.op.stack_effect(sigs).map_err(|e| {
            invariant(method_name, format!("unresolvable operand: {e}"))
        })?;
        if depth < pops {
            return Err(invariant(
                method_name,
                format!(
                    "stack underflow at '{}' (depth {depth}, pops {pops})",
                    instr.op.mnemonic()
                ),
            ));
        }
        let after = depth - pops + pushes;
        max_depth = max_depth.max(depth.max(after));

        match instr.op.flow() {
            FlowType::Next => seed(&mut worklist, idx + 1, after),
            FlowType::Branch(target) => seed(&mut worklist, index_of[&target], after),
            FlowType::CondBranch(target) => {
                seed(&mut worklist, idx + 1, after);
                seed(&mut worklist, index_of[&target], after);
            }
            FlowType::Leave(target) => {
                // leave empties the evaluation stack
                seed(&mut worklist, index_of[&target], 0);
            }
            FlowType::Return => {
                let wanted = usize::from(sig.returns_value());
                if after != wanted {
                    return Err(invariant(
                        method_name,
                        format!("ret with stack depth {after}, expected {wanted}"),
                    ));
                }
            }
            FlowType::Throw => {}
        }
    }

    Ok(max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{InstructionStream, Op};
    use crate::image::{ExceptionHandler, ExceptionHandlerFlags};
    use crate::image::{Token, TypeSig};

    struct NoSigs;
    impl SigLookup for NoSigs {
        fn method_sig(&self, _: Token) -> Option<MethodSig> {
            None
        }
        fn field_type(&self, _: Token) -> Option<TypeSig> {
            None
        }
    }

    fn void_sig() -> MethodSig {
        MethodSig::instance(TypeSig::Void, vec![TypeSig::String])
    }

    fn body_of(instructions: InstructionStream) -> MethodBody {
        MethodBody {
            init_locals: true,
            max_stack: 0,
            locals: Vec::new(),
            instructions,
            exception_handlers: Vec::new(),
        }
    }

    #[test]
    fn test_minimal_body_is_valid() -> Result<()> {
        let mut stream = InstructionStream::new();
        stream.push(Op::Ret);
        let metrics = validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs)?;
        assert_eq!(metrics.max_stack, 0);
        Ok(())
    }

    #[test]
    fn test_max_stack_computed() -> Result<()> {
        let mut stream = InstructionStream::new();
        stream.push(Op::LdcI4(1));
        stream.push(Op::LdcI4(2));
        stream.push(Op::Pop);
        stream.push(Op::Pop);
        stream.push(Op::Ret);
        let metrics = validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs)?;
        assert_eq!(metrics.max_stack, 2);
        Ok(())
    }

    #[test]
    fn test_underflow_rejected() {
        let mut stream = InstructionStream::new();
        stream.push(Op::Pop);
        stream.push(Op::Ret);
        assert!(validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs).is_err());
    }

    #[test]
    fn test_fall_off_end_rejected() {
        let mut stream = InstructionStream::new();
        stream.push(Op::Nop);
        assert!(validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs).is_err());
    }

    #[test]
    fn test_unbalanced_ret_rejected() {
        let mut stream = InstructionStream::new();
        stream.push(Op::LdcI4(3));
        stream.push(Op::Ret);
        assert!(validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs).is_err());
    }

    #[test]
    fn test_dangling_branch_target_rejected() {
        let mut other = InstructionStream::new();
        for _ in 0..4 {
            other.push(Op::Nop);
        }
        let foreign = other.push(Op::Ret);

        let mut stream = InstructionStream::new();
        stream.push(Op::Br(foreign));
        stream.push(Op::Ret);
        assert!(validate_body("T.M", &body_of(stream), &void_sig(), &NoSigs).is_err());
    }

    #[test]
    fn test_catch_region_validates_with_exception_depth() -> Result<()> {
        // try { nop; leave end } catch { pop; leave end } end: ret
        let mut stream = InstructionStream::new();
        let end = stream.push(Op::Ret);
        let try_start = stream.insert_before(end, Op::Nop)?;
        stream.insert_before(end, Op::Leave(end))?;
        let handler_start = stream.insert_before(end, Op::Pop)?;
        stream.insert_before(end, Op::Leave(end))?;

        let mut body = body_of(stream);
        body.exception_handlers.push(ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start,
            try_end: Some(handler_start),
            handler_start,
            handler_end: Some(end),
            catch_type: None,
        });
        validate_body("T.M", &body, &void_sig(), &NoSigs)?;
        Ok(())
    }

    #[test]
    fn test_inverted_region_rejected() {
        let mut stream = InstructionStream::new();
        let a = stream.push(Op::Nop);
        let b = stream.push(Op::Pop);
        let _ = b;
        stream.push(Op::Ret);

        let mut body = body_of(stream);
        body.exception_handlers.push(ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start: a,
            try_end: Some(a), // empty range
            handler_start: a,
            handler_end: None,
            catch_type: None,
        });
        assert!(validate_body("T.M", &body, &void_sig(), &NoSigs).is_err());
    }

    #[test]
    fn test_partially_overlapping_try_regions_rejected() -> Result<()> {
        let mut stream = InstructionStream::new();
        let end = stream.push(Op::Ret);
        let i0 = stream.insert_before(end, Op::Nop)?;
        let i1 = stream.insert_before(end, Op::Nop)?;
        let i2 = stream.insert_before(end, Op::Nop)?;
        let h0 = stream.insert_before(end, Op::Pop)?;
        stream.insert_before(end, Op::Leave(end))?;
        let h1 = stream.insert_before(end, Op::Pop)?;
        stream.insert_before(end, Op::Leave(end))?;

        let make = |try_start, try_end, handler_start, handler_end| ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start,
            try_end: Some(try_end),
            handler_start,
            handler_end: Some(handler_end),
            catch_type: None,
        };

        let mut body = body_of(stream);
        body.exception_handlers.push(make(i0, i2, h0, h1));
        body.exception_handlers.push(make(i1, h0, h1, end));
        let result = validate_body("T.M", &body, &void_sig(), &NoSigs);
        assert!(matches!(
            result,
            Err(Error::StructuralInvariant { .. })
        ));
        Ok(())
    }
}
