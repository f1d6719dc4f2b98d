//! SSA optimizer (spec.md §4.3, component C5): seven fixed passes run once
//! each, in order, over every function in a `Module`. No pass iterates to a
//! fixpoint (spec.md §10 resolved Open Question) — running the pipeline
//! twice may still find more to do, but the driver only runs it once.

use crate::config::OptimizerLevel;
use crate::ir::*;
use alloy_primitives::U256;
use std::collections::{HashMap, HashSet};

/// One optimizer-applied rewrite, for `optimizedIr`'s companion trail
/// (spec.md §6 `transformations`).
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationRecord {
    pub pass: &'static str,
    pub kind: String,
    pub original: String,
    pub result: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStats {
    pub pass: &'static str,
    pub transformations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct OptimizationReport {
    pub transformations: Vec<TransformationRecord>,
    pub stats: Vec<PassStats>,
}

impl OptimizationReport {
    fn record(&mut self, pass: &'static str, kind: impl Into<String>, original: impl Into<String>, result: impl Into<String>, reason: impl Into<String>) {
        self.transformations.push(TransformationRecord {
            pass,
            kind: kind.into(),
            original: original.into(),
            result: result.into(),
            reason: reason.into(),
        });
        match self.stats.iter_mut().find(|s| s.pass == pass) {
            Some(s) => s.transformations += 1,
            None => self.stats.push(PassStats { pass, transformations: 1 }),
        }
    }
}

/// Runs the fixed optimizer pipeline over every function in `module`
/// according to `level` (spec.md §4.3). `O0` is a no-op so debug builds see
/// IR that mirrors the generator's output one-for-one.
pub fn optimize(module: &mut Module, level: OptimizerLevel) -> OptimizationReport {
    let mut report = OptimizationReport::default();
    if level == OptimizerLevel::O0 {
        return report;
    }

    let functions = module
        .functions
        .iter_mut()
        .chain(module.create.iter_mut())
        .chain(module.main.iter_mut());

    for function in functions {
        let span = tracing::debug_span!("optimize", function = %function.name);
        let _enter = span.enter();

        constant_folding(function, &mut report);
        constant_propagation(function, &mut report);
        common_subexpression_elimination(function, &mut report);
        dead_code_elimination(function, &mut report);
        if level == OptimizerLevel::O2 {
            jump_optimization(function, &mut report);
            block_merging(function, &mut report);
            return_merging(function, &mut report);
        }
        function.recompute_predecessors();
    }

    tracing::debug!(transformations = report.transformations.len(), "optimization complete");
    report
}

fn const_to_u256(c: &ConstValue) -> Option<U256> {
    match c {
        ConstValue::Uint(v) => Some(U256::from(*v)),
        ConstValue::BigUint(s) => U256::from_str_radix(s, 10).ok(),
        ConstValue::Bool(b) => Some(U256::from(*b as u64)),
        _ => None,
    }
}

fn u256_to_const(v: U256) -> ConstValue {
    match u64::try_from(v) {
        Ok(small) => ConstValue::Uint(small),
        Err(_) => ConstValue::BigUint(v.to_string()),
    }
}

fn fold_binary(op: BinOp, lhs: &ConstValue, rhs: &ConstValue) -> Option<ConstValue> {
    if let (BinOp::And, ConstValue::Bool(a), ConstValue::Bool(b)) = (op, lhs, rhs) {
        return Some(ConstValue::Bool(*a && *b));
    }
    if let (BinOp::Or, ConstValue::Bool(a), ConstValue::Bool(b)) = (op, lhs, rhs) {
        return Some(ConstValue::Bool(*a || *b));
    }
    let a = const_to_u256(lhs)?;
    let b = const_to_u256(rhs)?;
    Some(match op {
        BinOp::Add => u256_to_const(a.wrapping_add(b)),
        BinOp::Sub => u256_to_const(a.wrapping_sub(b)),
        BinOp::Mul => u256_to_const(a.wrapping_mul(b)),
        BinOp::Div => {
            if b.is_zero() {
                return None;
            }
            u256_to_const(a / b)
        }
        BinOp::Mod => {
            if b.is_zero() {
                return None;
            }
            u256_to_const(a % b)
        }
        BinOp::Lt => ConstValue::Bool(a < b),
        BinOp::Gt => ConstValue::Bool(a > b),
        BinOp::Le => ConstValue::Bool(a <= b),
        BinOp::Ge => ConstValue::Bool(a >= b),
        BinOp::Eq => ConstValue::Bool(a == b),
        BinOp::Ne => ConstValue::Bool(a != b),
        BinOp::And => u256_to_const(a & b),
        BinOp::Or => u256_to_const(a | b),
        BinOp::Byte => match u64::try_from(a) {
            Ok(i) if i < 32 => u256_to_const((b >> (8 * (31 - i as usize))) & U256::from(0xffu8)),
            Ok(_) => ConstValue::Uint(0),
            Err(_) => return None,
        },
    })
}

fn fold_unary(op: UnOp, operand: &ConstValue) -> Option<ConstValue> {
    match (op, operand) {
        (UnOp::Not, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
        (UnOp::Neg, _) => const_to_u256(operand).map(|v| u256_to_const(U256::ZERO.wrapping_sub(v))),
        _ => None,
    }
}

fn const_bytes(c: &ConstValue) -> Option<Vec<u8>> {
    match c {
        ConstValue::Bytes(b) => Some(b.clone()),
        ConstValue::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn fold_hash(operand: &ConstValue) -> Option<ConstValue> {
    let bytes = const_bytes(operand)?;
    Some(ConstValue::Bytes(alloy_primitives::keccak256(&bytes).to_vec()))
}

fn fold_length(operand: &ConstValue) -> Option<ConstValue> {
    const_bytes(operand).map(|b| ConstValue::Uint(b.len() as u64))
}

fn fold_slice(operand: &ConstValue, start: &ConstValue, end: &ConstValue) -> Option<ConstValue> {
    let bytes = const_bytes(operand)?;
    let start = u64::try_from(const_to_u256(start)?).ok()? as usize;
    let end = u64::try_from(const_to_u256(end)?).ok()? as usize;
    let slice = bytes.get(start..end)?;
    match operand {
        ConstValue::String(_) => String::from_utf8(slice.to_vec()).ok().map(ConstValue::String),
        _ => Some(ConstValue::Bytes(slice.to_vec())),
    }
}

/// Pass 1: folds `binary`/`unary`/`hash`/`length`/`slice` instructions whose
/// operands are all constants into a single `const`. Division and modulo by
/// a constant zero are left unfolded — the EVM's own `DIV`/`MOD` zero
/// behavior is codegen's job, not the optimizer's (spec.md §4.3).
fn constant_folding(function: &mut Function, report: &mut OptimizationReport) {
    for block in &mut function.blocks {
        for instr in &mut block.instructions {
            let folded = match instr {
                Instruction::Binary { ty, op, lhs: Value::Const(l), rhs: Value::Const(r), .. } => {
                    fold_binary(*op, l, r).map(|v| (ty.clone(), v))
                }
                Instruction::Unary { ty, op, operand: Value::Const(c), .. } => {
                    fold_unary(*op, c).map(|v| (ty.clone(), v))
                }
                Instruction::Hash { operand: Value::Const(c), .. } => {
                    fold_hash(c).map(|v| (crate::types::Type::Bytes(Some(32)), v))
                }
                Instruction::Length { operand: Value::Const(c), .. } => {
                    fold_length(c).map(|v| (crate::types::Type::Uint(256), v))
                }
                Instruction::Slice { operand: Value::Const(c), start: Value::Const(s), end: Value::Const(e), .. } => {
                    fold_slice(c, s, e).map(|v| {
                        let ty = match &v {
                            ConstValue::String(_) => crate::types::Type::String,
                            _ => crate::types::Type::Bytes(None),
                        };
                        (ty, v)
                    })
                }
                _ => None,
            };
            if let Some((ty, value)) = folded {
                let dest = instr.dest().expect("foldable instructions always produce a dest");
                let original = format!("{instr:?}");
                *instr = Instruction::Const { dest, ty, value };
                report.record("constant_folding", "fold", original, format!("{instr:?}"), "both operands were constant");
            }
        }
    }
}

fn substitute(v: &mut Value, consts: &HashMap<ValueId, ConstValue>) -> bool {
    if let Value::Temp(id) = v {
        if let Some(c) = consts.get(id) {
            *v = Value::Const(c.clone());
            return true;
        }
    }
    false
}

pub(crate) fn for_each_value_mut(instr: &mut Instruction, mut f: impl FnMut(&mut Value)) {
    match instr {
        Instruction::Const { .. } | Instruction::Env { .. } => {}
        Instruction::Binary { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        Instruction::Unary { operand, .. }
        | Instruction::Cast { operand, .. }
        | Instruction::Hash { operand, .. }
        | Instruction::Length { operand, .. } => f(operand),
        Instruction::Slice { operand, start, end, .. } => {
            f(operand);
            f(start);
            f(end);
        }
        Instruction::ComputeSlot { computation, .. } => match computation {
            SlotComputation::Mapping { base, key } => {
                f(base);
                f(key);
            }
            SlotComputation::Array { base } | SlotComputation::Field { base, .. } => f(base),
        },
        Instruction::ComputeOffset { base, offset, .. } => {
            f(base);
            f(offset);
        }
        Instruction::Read { slot, offset, length, .. } => {
            if let Some(v) = slot {
                f(v);
            }
            if let Some(v) = offset {
                f(v);
            }
            if let Some(v) = length {
                f(v);
            }
        }
        Instruction::Write { slot, offset, length, value } => {
            if let Some(v) = slot {
                f(v);
            }
            if let Some(v) = offset {
                f(v);
            }
            if let Some(v) = length {
                f(v);
            }
            f(value);
        }
        Instruction::Allocate { size, .. } => f(size),
        Instruction::Call { arguments, .. } => arguments.iter_mut().for_each(f),
    }
}

/// Pass 2: replaces every use of a temp whose sole definition is a `const`
/// instruction with that constant directly, so later passes (CSE, folding
/// of instructions newly exposed) see through the indirection.
fn constant_propagation(function: &mut Function, report: &mut OptimizationReport) {
    let mut consts = HashMap::new();
    for block in &function.blocks {
        for instr in &block.instructions {
            if let Instruction::Const { dest, value, .. } = instr {
                consts.insert(*dest, value.clone());
            }
        }
    }
    if consts.is_empty() {
        return;
    }
    for block in &mut function.blocks {
        for instr in &mut block.instructions {
            let before = format!("{instr:?}");
            let mut changed = false;
            for_each_value_mut(instr, |v| changed |= substitute(v, &consts));
            if changed {
                report.record("constant_propagation", "substitute", before, format!("{instr:?}"), "operand was a known constant");
            }
        }
        for phi in &mut block.phis {
            for (_, v) in &mut phi.sources {
                substitute(v, &consts);
            }
        }
        match &mut block.terminator {
            Terminator::Branch { condition, .. } => {
                substitute(condition, &consts);
            }
            Terminator::Return { value: Some(v) } => {
                substitute(v, &consts);
            }
            _ => {}
        }
    }
}

/// A structural key for a "pure" instruction, excluding its `dest` — two
/// instructions sharing a key compute the same value (spec.md §4.3 CSE:
/// `compute_slot`/`env` are included despite reading ambient/storage state,
/// since within one function body their result does not change between
/// calls of the same shape).
fn cse_key(instr: &Instruction) -> Option<String> {
    match instr {
        Instruction::Const { ty, value, .. } => Some(format!("const:{ty}:{value:?}")),
        Instruction::Binary { ty, op, lhs, rhs, .. } => Some(format!("bin:{ty}:{op:?}:{lhs:?}:{rhs:?}")),
        Instruction::Unary { ty, op, operand, .. } => Some(format!("un:{ty}:{op:?}:{operand:?}")),
        Instruction::Cast { ty, operand, .. } => Some(format!("cast:{ty}:{operand:?}")),
        Instruction::Hash { operand, .. } => Some(format!("hash:{operand:?}")),
        Instruction::Length { operand, .. } => Some(format!("len:{operand:?}")),
        Instruction::Slice { operand, start, end, .. } => Some(format!("slice:{operand:?}:{start:?}:{end:?}")),
        Instruction::ComputeSlot { computation, .. } => Some(format!("slot:{computation:?}")),
        Instruction::ComputeOffset { base, offset, .. } => Some(format!("off:{base:?}:{offset:?}")),
        Instruction::Env { kind, .. } => Some(format!("env:{kind:?}")),
        _ => None,
    }
}

/// Pass 3: collapses repeated pure computations to the first evaluation,
/// rewriting later uses to reference its `dest`. `compute_slot`/`env` are
/// tracked function-wide, per [`cse_key`]'s doc comment. Every other pure
/// kind is tracked per-block only, and forgotten as soon as a side-effecting
/// instruction (`write`/`call`/`allocate`) is seen: their operands can be
/// pointers into memory a write between the two evaluations may have
/// mutated, so an identical instruction shape downstream of a write is not
/// guaranteed to recompute the same value.
fn common_subexpression_elimination(function: &mut Function, report: &mut OptimizationReport) {
    let mut persistent_seen: HashMap<String, ValueId> = HashMap::new();
    let mut replacements: HashMap<ValueId, ValueId> = HashMap::new();

    for block in &mut function.blocks {
        let mut block_seen: HashMap<String, ValueId> = HashMap::new();
        let mut kept = Vec::with_capacity(block.instructions.len());
        for mut instr in block.instructions.drain(..) {
            for_each_value_mut(&mut instr, |v| {
                if let Value::Temp(id) = v {
                    if let Some(&survivor) = replacements.get(id) {
                        *id = survivor;
                    }
                }
            });
            let persists = matches!(instr, Instruction::ComputeSlot { .. } | Instruction::Env { .. });
            let table = if persists { &mut persistent_seen } else { &mut block_seen };
            if let Some(key) = cse_key(&instr) {
                if let Some(&survivor) = table.get(&key) {
                    let dest = instr.dest().expect("cse-eligible instructions produce a dest");
                    replacements.insert(dest, survivor);
                    report.record(
                        "common_subexpression_elimination",
                        "eliminate",
                        format!("{instr:?}"),
                        format!("{survivor}"),
                        "identical pure computation already evaluated in this scope",
                    );
                    continue;
                }
                if let Some(dest) = instr.dest() {
                    table.insert(key, dest);
                }
            }
            if is_side_effecting(&instr) {
                block_seen.clear();
            }
            kept.push(instr);
        }
        block.instructions = kept;
    }

    if replacements.is_empty() {
        return;
    }
    for block in &mut function.blocks {
        for instr in &mut block.instructions {
            for_each_value_mut(instr, |v| {
                if let Value::Temp(id) = v {
                    if let Some(&survivor) = replacements.get(id) {
                        *id = survivor;
                    }
                }
            });
        }
        for phi in &mut block.phis {
            for (_, v) in &mut phi.sources {
                if let Value::Temp(id) = v {
                    if let Some(&survivor) = replacements.get(id) {
                        *id = survivor;
                    }
                }
            }
        }
        if let Terminator::Branch { condition: Value::Temp(id), .. } = &mut block.terminator {
            if let Some(&survivor) = replacements.get(id) {
                *id = survivor;
            }
        }
        if let Terminator::Return { value: Some(Value::Temp(id)) } = &mut block.terminator {
            if let Some(&survivor) = replacements.get(id) {
                *id = survivor;
            }
        }
    }
}

fn is_side_effecting(instr: &Instruction) -> bool {
    matches!(instr, Instruction::Write { .. } | Instruction::Call { .. } | Instruction::Allocate { .. })
}

fn used_value_ids(function: &Function) -> HashSet<ValueId> {
    let mut used = HashSet::new();
    for block in &function.blocks {
        for instr in &block.instructions {
            for v in instr.operands() {
                if let Value::Temp(id) = v {
                    used.insert(*id);
                }
            }
        }
        for phi in &block.phis {
            for (_, v) in &phi.sources {
                if let Value::Temp(id) = v {
                    used.insert(*id);
                }
            }
        }
        match &block.terminator {
            Terminator::Branch { condition: Value::Temp(id), .. } => {
                used.insert(*id);
            }
            Terminator::Return { value: Some(Value::Temp(id)) } => {
                used.insert(*id);
            }
            _ => {}
        }
    }
    for param in &function.parameters {
        used.insert(param.value);
    }
    used
}

/// Pass 4: drops pure instructions (and phis) whose result is never read.
fn dead_code_elimination(function: &mut Function, report: &mut OptimizationReport) {
    let used = used_value_ids(function);
    for block in &mut function.blocks {
        block.instructions.retain(|instr| {
            if is_side_effecting(instr) {
                return true;
            }
            match instr.dest() {
                Some(dest) if !used.contains(&dest) => {
                    report.record("dead_code_elimination", "remove", format!("{instr:?}"), "<removed>", "result is never used");
                    false
                }
                _ => true,
            }
        });
        block.phis.retain(|phi| {
            if used.contains(&phi.dest) {
                true
            } else {
                report.record("dead_code_elimination", "remove_phi", format!("{phi:?}"), "<removed>", "result is never used");
                false
            }
        });
    }
}

/// Pass 5: collapses a `Jump` to an empty passthrough block (no phis, no
/// instructions) directly to that block's own target, and a `Branch` whose
/// two arms already agree into a plain `Jump`.
fn jump_optimization(function: &mut Function, report: &mut OptimizationReport) {
    let passthroughs: HashMap<BlockId, BlockId> = function
        .blocks
        .iter()
        .filter_map(|b| {
            if b.phis.is_empty() && b.instructions.is_empty() {
                if let Terminator::Jump { target } = b.terminator {
                    return Some((b.id, target));
                }
            }
            None
        })
        .collect();

    let resolve = |mut target: BlockId| -> BlockId {
        let mut hops = 0;
        while let Some(&next) = passthroughs.get(&target) {
            if next == target || hops > function.blocks.len() {
                break;
            }
            target = next;
            hops += 1;
        }
        target
    };

    for block in &mut function.blocks {
        let before = format!("{:?}", block.terminator);
        match &mut block.terminator {
            Terminator::Jump { target } => {
                let resolved = resolve(*target);
                if resolved != *target {
                    *target = resolved;
                }
            }
            Terminator::Branch { then_block, else_block, condition } => {
                let then_resolved = resolve(*then_block);
                let else_resolved = resolve(*else_block);
                if then_resolved == else_resolved {
                    let target = then_resolved;
                    block.terminator = Terminator::Jump { target };
                } else {
                    *then_block = then_resolved;
                    *else_block = else_resolved;
                    let _ = condition;
                }
            }
            _ => {}
        }
        let after = format!("{:?}", block.terminator);
        if after != before {
            report.record("jump_optimization", "retarget", before, after, "collapsed jump through an empty block or a branch with identical arms");
        }
    }
}

/// Pass 6: inlines a block into its sole predecessor when that predecessor
/// has no other successor, so the two addresses fold to one in codegen.
fn block_merging(function: &mut Function, report: &mut OptimizationReport) {
    loop {
        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for b in &function.blocks {
            for succ in b.successors() {
                preds.entry(succ).or_default().push(b.id);
            }
        }

        let candidate = function.blocks.iter().find_map(|b| {
            if let Terminator::Jump { target } = b.terminator {
                if target != function.entry {
                    if let Some(ps) = preds.get(&target) {
                        if ps.len() == 1 && ps[0] == b.id {
                            return Some((b.id, target));
                        }
                    }
                }
            }
            None
        });

        let Some((into, from)) = candidate else { break };
        let moved = function.blocks.iter().position(|b| b.id == from).expect("candidate target exists");
        let moved_block = function.blocks.remove(moved);
        let target_idx = function.blocks.iter().position(|b| b.id == into).expect("candidate source exists");
        let target_block = &mut function.blocks[target_idx];
        target_block.instructions.extend(moved_block.instructions);
        target_block.terminator = moved_block.terminator;
        report.record(
            "block_merging",
            "merge",
            format!("{from} -> {into}"),
            format!("{into}"),
            "sole predecessor jumps directly into this block",
        );

        for b in &mut function.blocks {
            for succ_target in successor_targets_mut(&mut b.terminator) {
                if *succ_target == from {
                    *succ_target = into;
                }
            }
        }
    }
}

fn successor_targets_mut(term: &mut Terminator) -> Vec<&mut BlockId> {
    match term {
        Terminator::Jump { target } => vec![target],
        Terminator::Branch { then_block, else_block, .. } => vec![then_block, else_block],
        Terminator::Return { .. } | Terminator::Unreachable => vec![],
    }
}

/// Pass 7: redirects blocks that `return` the same value (most commonly no
/// value at all) to a single shared exit block, so codegen emits one
/// `RETURN`/`STOP` sequence instead of one per call site.
fn return_merging(function: &mut Function, report: &mut OptimizationReport) {
    let mut groups: HashMap<String, Vec<BlockId>> = HashMap::new();
    for b in &function.blocks {
        if let Terminator::Return { value } = &b.terminator {
            let key = match value {
                None => "none".to_string(),
                Some(Value::Const(c)) => format!("const:{c:?}"),
                Some(Value::Temp(_)) => continue,
            };
            groups.entry(key).or_default().push(b.id);
        }
    }

    for (_, blocks) in groups {
        if blocks.len() < 2 {
            continue;
        }
        let value = match &function.blocks.iter().find(|b| b.id == blocks[0]).unwrap().terminator {
            Terminator::Return { value } => value.clone(),
            _ => unreachable!(),
        };
        let exit_id = BlockId(function.blocks.iter().map(|b| b.id.0).max().unwrap_or(0) + 1);
        let mut exit = Block::new(exit_id);
        exit.terminator = Terminator::Return { value };
        function.blocks.push(exit);

        for id in &blocks {
            let b = function.blocks.iter_mut().find(|b| b.id == *id).unwrap();
            b.terminator = Terminator::Jump { target: exit_id };
        }
        report.record(
            "return_merging",
            "merge",
            blocks.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(","),
            exit_id.to_string(),
            "multiple blocks returned the same value",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_function(blocks: Vec<Block>) -> Function {
        Function { name: "f".into(), parameters: vec![], return_type: None, entry: BlockId(0), blocks }
    }

    #[test]
    fn constant_folding_collapses_add_of_two_consts() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Binary {
            dest: ValueId(2),
            ty: crate::types::Type::Uint(256),
            op: BinOp::Add,
            lhs: Value::Const(ConstValue::Uint(1)),
            rhs: Value::Const(ConstValue::Uint(2)),
        });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(2))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        constant_folding(&mut function, &mut report);
        assert!(matches!(
            function.blocks[0].instructions[0],
            Instruction::Const { value: ConstValue::Uint(3), .. }
        ));
    }

    #[test]
    fn division_by_constant_zero_is_left_unfolded() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Binary {
            dest: ValueId(2),
            ty: crate::types::Type::Uint(256),
            op: BinOp::Div,
            lhs: Value::Const(ConstValue::Uint(5)),
            rhs: Value::Const(ConstValue::Uint(0)),
        });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(2))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        constant_folding(&mut function, &mut report);
        assert!(matches!(function.blocks[0].instructions[0], Instruction::Binary { op: BinOp::Div, .. }));
    }

    #[test]
    fn dead_code_elimination_drops_unused_pure_instruction() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Const { dest: ValueId(0), ty: crate::types::Type::Uint(256), value: ConstValue::Uint(1) });
        block.instructions.push(Instruction::Const { dest: ValueId(1), ty: crate::types::Type::Uint(256), value: ConstValue::Uint(2) });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(1))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        dead_code_elimination(&mut function, &mut report);
        assert_eq!(function.blocks[0].instructions.len(), 1);
        assert_eq!(function.blocks[0].instructions[0].dest(), Some(ValueId(1)));
    }

    #[test]
    fn common_subexpression_elimination_dedupes_identical_compute_slot() {
        let mut entry = Block::new(BlockId(0));
        entry.instructions.push(Instruction::ComputeSlot {
            dest: ValueId(0),
            computation: SlotComputation::Array { base: Value::Const(ConstValue::Uint(3)) },
        });
        entry.instructions.push(Instruction::ComputeSlot {
            dest: ValueId(1),
            computation: SlotComputation::Array { base: Value::Const(ConstValue::Uint(3)) },
        });
        entry.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(1))) };
        let mut function = simple_function(vec![entry]);
        let mut report = OptimizationReport::default();
        common_subexpression_elimination(&mut function, &mut report);
        assert_eq!(function.blocks[0].instructions.len(), 1);
        assert_eq!(function.blocks[0].terminator, Terminator::Return { value: Some(Value::Temp(ValueId(0))) });
    }

    #[test]
    fn common_subexpression_elimination_does_not_cross_a_write() {
        let mut entry = Block::new(BlockId(0));
        entry.instructions.push(Instruction::Length {
            dest: ValueId(0),
            operand: Value::Const(ConstValue::Address("ptr".into())),
        });
        entry.instructions.push(Instruction::Write {
            location: Location::Memory,
            slot: None,
            offset: Some(Value::Const(ConstValue::Uint(0))),
            length: None,
            value: Value::Const(ConstValue::Uint(1)),
        });
        entry.instructions.push(Instruction::Length {
            dest: ValueId(1),
            operand: Value::Const(ConstValue::Address("ptr".into())),
        });
        entry.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(1))) };
        let mut function = simple_function(vec![entry]);
        let mut report = OptimizationReport::default();
        common_subexpression_elimination(&mut function, &mut report);
        let length_count = function.blocks[0].instructions.iter().filter(|i| matches!(i, Instruction::Length { .. })).count();
        assert_eq!(length_count, 2, "a write between two identical length reads invalidates the first evaluation");
    }

    #[test]
    fn constant_folding_folds_hash_of_a_constant_bytes_literal() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Hash { dest: ValueId(0), operand: Value::Const(ConstValue::Bytes(vec![0xab])) });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(0))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        constant_folding(&mut function, &mut report);
        assert!(matches!(
            &function.blocks[0].instructions[0],
            Instruction::Const { value: ConstValue::Bytes(b), .. } if b.len() == 32
        ));
    }

    #[test]
    fn constant_folding_folds_length_of_a_constant_string() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Length { dest: ValueId(0), operand: Value::Const(ConstValue::String("hello".into())) });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(0))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        constant_folding(&mut function, &mut report);
        assert!(matches!(function.blocks[0].instructions[0], Instruction::Const { value: ConstValue::Uint(5), .. }));
    }

    #[test]
    fn constant_folding_folds_slice_of_a_constant_bytes_literal() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(Instruction::Slice {
            dest: ValueId(0),
            operand: Value::Const(ConstValue::Bytes(vec![0x01, 0x02, 0x03, 0x04])),
            start: Value::Const(ConstValue::Uint(1)),
            end: Value::Const(ConstValue::Uint(3)),
        });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(0))) };
        let mut function = simple_function(vec![block]);
        let mut report = OptimizationReport::default();
        constant_folding(&mut function, &mut report);
        assert!(matches!(
            &function.blocks[0].instructions[0],
            Instruction::Const { value: ConstValue::Bytes(b), .. } if b == &vec![0x02, 0x03]
        ));
    }
}
