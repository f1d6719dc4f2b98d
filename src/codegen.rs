//! EVM code generator (spec.md §4.4, component C6): lowers optimized SSA
//! IR to a symbolic EVM instruction stream and assembles it to bytecode.
//!
//! Every SSA value is spilled to a fixed per-function memory slot the
//! instant it is produced, and reloaded on every use (spec.md §9 design
//! note: a builder-style realization is acceptable as long as the stack
//! invariants hold). This trades some gas for never needing a liveness-
//! driven register/stack allocator: correctness does not depend on
//! tracking which SSA values are "live" on the abstract stack across a
//! branch, because nothing ever is. See DESIGN.md for the write-up of
//! this simplification and its consequences.
//!
//! A function's `read`/`write` to user-defined functions is resolved by
//! inlining before emission (spec.md's calling convention is left
//! unspecified; this crate never emits an EVM subroutine-call sequence).

use crate::config::CompilerOptions;
use crate::ir::Instruction as IrInstruction;
use crate::ir::{
    BinOp, Block, BlockId, ConstValue, EnvKind, Function, Location, Module, Phi, SlotComputation, Terminator, UnOp,
    Value, ValueId,
};
use crate::optimizer::for_each_value_mut;
use crate::types::Type;
use alloy_primitives::U256;
use std::collections::HashMap;
use std::fmt;

/// Fatal, non-recoverable codegen failure (spec.md §4.4.3).
#[derive(Debug)]
pub enum CodeGenError {
    PhiMissingPredecessor { function: String, block: BlockId, predecessor: BlockId },
    MemoryAllocationFailed { reason: String },
    StackTooDeep { function: String },
    UnsupportedInstruction { detail: String },
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeGenError::PhiMissingPredecessor { function, block, predecessor } => {
                write!(f, "{function}: {block} has a phi with no source from predecessor {predecessor}")
            }
            CodeGenError::MemoryAllocationFailed { reason } => write!(f, "memory allocation failed: {reason}"),
            CodeGenError::StackTooDeep { function } => write!(f, "{function}: EVM stack depth exceeded 1024"),
            CodeGenError::UnsupportedInstruction { detail } => write!(f, "unsupported instruction: {detail}"),
        }
    }
}

impl std::error::Error for CodeGenError {}

/// A label a jump targets: either a real IR block or one minted by codegen
/// itself for a construct with no IR-level block (the `slice` copy loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Label {
    Block(BlockId),
    Synthetic(u32),
}

/// Tags an emitted [`Instruction`] as either defining a label's program
/// counter (`JUMPDEST`) or referencing one whose address isn't known until
/// the whole function has been emitted (`PUSH2` ahead of a `JUMP`/`JUMPI`).
/// [`resolve_labels`] walks the finished stream once to record every
/// definition's PC, then a second time to patch every reference's operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LabelRole {
    Definition(Label),
    Reference(Label),
}

/// A handful of these (`Pop`/`Dup`/`Swap`/`Revert`/`Not`/`Address`/
/// `CallDataSize`) have no emitter today — the memory-backed value model
/// never needs to reshuffle the stack or bail out mid-expression — but are
/// kept on the table since they're real EVM opcodes a future stack-aware
/// scheduler or `require`-style revert path would reach for.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
enum Opcode {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    Mod,
    Lt,
    Gt,
    Eq,
    IsZero,
    And,
    Or,
    Not,
    Byte,
    Sha3,
    Address,
    Caller,
    CallValue,
    CallDataLoad,
    CallDataSize,
    Timestamp,
    Number,
    Pop,
    MLoad,
    MStore,
    SLoad,
    SStore,
    Jump,
    JumpI,
    JumpDest(Label),
    Push(Vec<u8>),
    PushLabel(Label),
    Dup(u8),
    Swap(u8),
    Return,
    Revert,
    Invalid,
}

impl Opcode {
    fn stack_delta(&self) -> (i32, i32) {
        match self {
            Opcode::Stop | Opcode::Return | Opcode::Revert | Opcode::Invalid | Opcode::JumpDest(_) => (0, 0),
            Opcode::Add | Opcode::Mul | Opcode::Sub | Opcode::Div | Opcode::Mod | Opcode::Lt | Opcode::Gt
            | Opcode::Eq | Opcode::And | Opcode::Or | Opcode::Byte | Opcode::Sha3 => (2, 1),
            Opcode::IsZero | Opcode::Not | Opcode::MLoad | Opcode::CallDataLoad => (1, 1),
            Opcode::Address | Opcode::Caller | Opcode::CallValue | Opcode::CallDataSize | Opcode::Timestamp
            | Opcode::Number | Opcode::Push(_) | Opcode::PushLabel(_) => (0, 1),
            Opcode::Pop | Opcode::Jump => (1, 0),
            Opcode::MStore | Opcode::SStore | Opcode::JumpI => (2, 0),
            Opcode::SLoad => (1, 1),
            Opcode::Dup(_) => (0, 1),
            Opcode::Swap(_) => (0, 0),
        }
    }

    fn byte(&self) -> u8 {
        match self {
            Opcode::Stop => 0x00,
            Opcode::Add => 0x01,
            Opcode::Mul => 0x02,
            Opcode::Sub => 0x03,
            Opcode::Div => 0x04,
            Opcode::Mod => 0x06,
            Opcode::Lt => 0x10,
            Opcode::Gt => 0x11,
            Opcode::Eq => 0x14,
            Opcode::IsZero => 0x15,
            Opcode::And => 0x16,
            Opcode::Or => 0x17,
            Opcode::Not => 0x19,
            Opcode::Byte => 0x1a,
            Opcode::Sha3 => 0x20,
            Opcode::Address => 0x30,
            Opcode::Caller => 0x33,
            Opcode::CallValue => 0x34,
            Opcode::CallDataLoad => 0x35,
            Opcode::CallDataSize => 0x36,
            Opcode::Timestamp => 0x42,
            Opcode::Number => 0x43,
            Opcode::Pop => 0x50,
            Opcode::MLoad => 0x51,
            Opcode::MStore => 0x52,
            Opcode::SLoad => 0x54,
            Opcode::SStore => 0x55,
            Opcode::Jump => 0x56,
            Opcode::JumpI => 0x57,
            Opcode::JumpDest(_) => 0x5b,
            Opcode::Push(bytes) => 0x5f + bytes.len() as u8,
            Opcode::PushLabel(_) => 0x61, // always PUSH2
            Opcode::Dup(n) => 0x7f + n,
            Opcode::Swap(n) => 0x8f + n,
            Opcode::Return => 0xf3,
            Opcode::Revert => 0xfd,
            Opcode::Invalid => 0xfe,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Opcode::Push(bytes) => 1 + bytes.len(),
            Opcode::PushLabel(_) => 3,
            _ => 1,
        }
    }
}

/// One emitted instruction, carrying the source span of the IR op that
/// produced it when debug info is requested (spec.md §6 `emit_debug_info`).
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    opcode_repr: String,
    bytes: Vec<u8>,
    label: Option<LabelRole>,
}

impl Instruction {
    /// The assembled opcode byte(s) for this instruction, including any
    /// immediate operand.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A human-readable mnemonic, e.g. `PUSH2 0x0040` or `JUMPDEST`.
    pub fn mnemonic(&self) -> &str {
        &self.opcode_repr
    }
}

pub struct CodegenOutput {
    pub runtime: Vec<u8>,
    pub create: Vec<u8>,
    pub runtime_instructions: Vec<Instruction>,
    pub create_instructions: Vec<Instruction>,
}

const FREE_PTR: u64 = 0x40;
const HEAP_INIT: u64 = 0x80;
const SCRATCH_BASE: u64 = 0x80;

/// Generates runtime and create-time bytecode for a whole `Module`
/// (spec.md §4.4 contract, §6 external interface).
pub fn generate(module: &Module, options: &CompilerOptions) -> Result<CodegenOutput, CodeGenError> {
    let (main, create) = inline_all_calls(module)?;

    let runtime_instructions = match &main {
        Some(f) => emit_function(f, options)?,
        None => emit_function(&empty_function("runtime"), options)?,
    };
    let create_instructions = match &create {
        Some(f) => emit_function(f, options)?,
        None => emit_function(&empty_function("create"), options)?,
    };

    let runtime = assemble(&runtime_instructions)?;
    let create_bytes = assemble(&create_instructions)?;

    Ok(CodegenOutput {
        runtime,
        create: create_bytes,
        runtime_instructions,
        create_instructions,
    })
}

/// A function with no body at all (no `create`/`code` block declared).
/// Still runs through `emit_function` so it gets the free-memory-pointer
/// initialization spec.md §4.4 sub-pass 2 mandates as "the first runtime
/// action of a function" before falling back to `STOP` (spec.md §8 seed
/// scenario 1).
fn empty_function(name: &str) -> Function {
    Function {
        name: name.to_string(),
        parameters: vec![],
        return_type: None,
        entry: BlockId(0),
        blocks: vec![Block {
            id: BlockId(0),
            phis: vec![],
            instructions: vec![],
            terminator: Terminator::Return { value: None },
            predecessors: vec![],
        }],
    }
}

// ---------------------------------------------------------------------
// Inlining: every `call` to a user-defined function is resolved before
// emission, since this target has no native calling convention.
// ---------------------------------------------------------------------

fn inline_all_calls(module: &Module) -> Result<(Option<Function>, Option<Function>), CodeGenError> {
    let mut main = module.main.clone();
    let mut create = module.create.clone();
    for entry in [&mut main, &mut create] {
        if let Some(f) = entry {
            let mut guard = 0;
            loop {
                let Some((block_id, instr_index, callee_name)) = find_first_user_call(f, module) else { break };
                guard += 1;
                if guard > 256 {
                    return Err(CodeGenError::UnsupportedInstruction {
                        detail: format!("call depth limit exceeded inlining recursive or deeply-nested call to '{callee_name}'"),
                    });
                }
                let callee = module.function(&callee_name).ok_or_else(|| CodeGenError::UnsupportedInstruction {
                    detail: format!("call to undeclared function '{callee_name}'"),
                })?;
                splice_call(f, block_id, instr_index, callee);
            }
            f.recompute_predecessors();
            if let Some((_, _, callee_name)) = find_first_user_call(f, module) {
                return Err(CodeGenError::UnsupportedInstruction {
                    detail: format!("call to unknown external function '{callee_name}'"),
                });
            }
        }
    }
    Ok((main, create))
}

fn find_first_user_call(f: &Function, module: &Module) -> Option<(BlockId, usize, String)> {
    for block in &f.blocks {
        for (i, instr) in block.instructions.iter().enumerate() {
            if let IrInstruction::Call { callee, .. } = instr {
                if module.function(callee).is_some() {
                    return Some((block.id, i, callee.clone()));
                }
            }
        }
    }
    None
}

fn max_value_id(f: &Function) -> u32 {
    f.blocks
        .iter()
        .flat_map(|b| {
            b.phis
                .iter()
                .map(|p| p.dest.0)
                .chain(b.instructions.iter().filter_map(|i| i.dest().map(|d| d.0)))
        })
        .chain(f.parameters.iter().map(|p| p.value.0))
        .max()
        .unwrap_or(0)
}

fn max_block_id(f: &Function) -> u32 {
    f.blocks.iter().map(|b| b.id.0).max().unwrap_or(0)
}

fn remap_dest(instr: &mut IrInstruction, vo: u32) {
    match instr {
        IrInstruction::Const { dest, .. }
        | IrInstruction::Binary { dest, .. }
        | IrInstruction::Unary { dest, .. }
        | IrInstruction::Cast { dest, .. }
        | IrInstruction::Env { dest, .. }
        | IrInstruction::Hash { dest, .. }
        | IrInstruction::Length { dest, .. }
        | IrInstruction::Slice { dest, .. }
        | IrInstruction::ComputeSlot { dest, .. }
        | IrInstruction::ComputeOffset { dest, .. }
        | IrInstruction::Read { dest, .. }
        | IrInstruction::Allocate { dest, .. } => dest.0 += vo,
        IrInstruction::Call { dest: Some(d), .. } => d.0 += vo,
        IrInstruction::Call { dest: None, .. } | IrInstruction::Write { .. } => {}
    }
}

fn remap_value(v: &mut Value, vo: u32) {
    if let Value::Temp(id) = v {
        id.0 += vo;
    }
}

fn remap_function(f: &Function, value_offset: u32, block_offset: u32) -> Function {
    let mut nf = f.clone();
    nf.entry.0 += block_offset;
    for b in &mut nf.blocks {
        b.id.0 += block_offset;
        b.predecessors.clear();
        for instr in &mut b.instructions {
            remap_dest(instr, value_offset);
            for_each_value_mut(instr, |v| remap_value(v, value_offset));
        }
        for phi in &mut b.phis {
            phi.dest.0 += value_offset;
            for (bid, v) in &mut phi.sources {
                bid.0 += block_offset;
                remap_value(v, value_offset);
            }
        }
        match &mut b.terminator {
            Terminator::Jump { target } => target.0 += block_offset,
            Terminator::Branch { condition, then_block, else_block } => {
                remap_value(condition, value_offset);
                then_block.0 += block_offset;
                else_block.0 += block_offset;
            }
            Terminator::Return { value: Some(v) } => remap_value(v, value_offset),
            Terminator::Return { value: None } | Terminator::Unreachable => {}
        }
    }
    for p in &mut nf.parameters {
        p.value.0 += value_offset;
    }
    nf
}

fn substitute_values(instrs: &mut [IrInstruction], phis: &mut [Phi], terminator: &mut Terminator, subst: &HashMap<ValueId, Value>) {
    let apply = |v: &mut Value, subst: &HashMap<ValueId, Value>| {
        if let Value::Temp(id) = v {
            if let Some(replacement) = subst.get(id) {
                *v = replacement.clone();
            }
        }
    };
    for instr in instrs {
        for_each_value_mut(instr, |v| apply(v, subst));
    }
    for phi in phis {
        for (_, v) in &mut phi.sources {
            apply(v, subst);
        }
    }
    match terminator {
        Terminator::Branch { condition, .. } => apply(condition, subst),
        Terminator::Return { value: Some(v) } => apply(v, subst),
        _ => {}
    }
}

/// Splices `callee`'s body into `target` at `block_id[instr_index]`
/// (spec.md's calling-convention Open Question, resolved as full inlining
/// — see DESIGN.md). The host block jumps to the (renamed) callee entry;
/// the callee's `return`s are redirected to a fresh continuation block,
/// with a phi merging the returned value back in if the call had a dest.
fn splice_call(target: &mut Function, block_id: BlockId, instr_index: usize, callee: &Function) {
    let value_offset = max_value_id(target) + 1;
    let block_offset = max_block_id(target) + 1;
    let mut callee = remap_function(callee, value_offset, block_offset);

    let host_idx = target.blocks.iter().position(|b| b.id == block_id).expect("call site block exists");
    let call_instr = target.blocks[host_idx].instructions.remove(instr_index);
    let (call_dest, call_ty, arguments) = match call_instr {
        IrInstruction::Call { dest, ty, arguments, .. } => (dest, ty, arguments),
        other => panic!("splice_call invoked on a non-call instruction: {other:?}"),
    };

    let tail: Vec<IrInstruction> = target.blocks[host_idx].instructions.split_off(instr_index);
    let tail_terminator = std::mem::replace(&mut target.blocks[host_idx].terminator, Terminator::Unreachable);

    let continuation_id = BlockId(max_block_id(target).max(max_block_id(&callee)) + 1);
    let mut continuation = Block::new(continuation_id);
    continuation.instructions = tail;
    continuation.terminator = tail_terminator;

    let mut substitution: HashMap<ValueId, Value> = HashMap::new();
    for (param, arg) in callee.parameters.iter().zip(arguments.into_iter()) {
        substitution.insert(param.value, arg);
    }
    for b in &mut callee.blocks {
        substitute_values(&mut b.instructions, &mut b.phis, &mut b.terminator, &substitution);
    }

    let mut return_sources = Vec::new();
    for b in &mut callee.blocks {
        if let Terminator::Return { value } = &b.terminator {
            if let Some(v) = value.clone() {
                return_sources.push((b.id, v));
            }
            b.terminator = Terminator::Jump { target: continuation_id };
        }
    }
    if let Some(dest) = call_dest {
        if !return_sources.is_empty() {
            continuation.phis.push(Phi { dest, ty: call_ty.unwrap_or(Type::Failure), sources: return_sources });
        }
    }

    target.blocks[host_idx].terminator = Terminator::Jump { target: callee.entry };
    target.blocks.extend(callee.blocks);
    target.blocks.push(continuation);
}

// ---------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------

struct Emitter<'a> {
    options: &'a CompilerOptions,
    out: Vec<Instruction>,
    depth: i32,
    max_value: u32,
    synthetic_counter: u32,
    function_name: String,
}

const LENGTH_SLOT_OFFSET: u32 = 0;
const TMP_SLOT_OFFSET: u32 = 1;
const WORDS_SLOT_OFFSET: u32 = 2;
const RESULT_PTR_SLOT_OFFSET: u32 = 3;
const SOURCE_BASE_SLOT_OFFSET: u32 = 4;
const COUNTER_SLOT_OFFSET: u32 = 5;
const RESERVED_SLOTS: u32 = 6;

impl<'a> Emitter<'a> {
    fn new(options: &'a CompilerOptions, max_value: u32, function_name: String) -> Self {
        Emitter { options, out: Vec::new(), depth: 0, max_value, synthetic_counter: 0, function_name }
    }

    fn slot_addr(&self, id: ValueId) -> u64 {
        SCRATCH_BASE + (id.0 as u64) * 32
    }

    fn reserved_slot(&self, offset: u32) -> u64 {
        SCRATCH_BASE + (self.max_value as u64) * 32 + (offset as u64) * 32
    }

    fn heap_start(&self) -> u64 {
        self.reserved_slot(RESERVED_SLOTS)
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label::Synthetic(self.synthetic_counter);
        self.synthetic_counter += 1;
        l
    }

    fn emit(&mut self, op: Opcode) -> Result<(), CodeGenError> {
        let (pops, pushes) = op.stack_delta();
        self.depth -= pops;
        self.depth += pushes;
        if self.depth > 1024 {
            return Err(CodeGenError::StackTooDeep { function: self.function_name.clone() });
        }
        let mnemonic = if self.options.emit_debug_info {
            match &op {
                Opcode::Push(bytes) => format!("PUSH{} 0x{}", bytes.len(), hex(bytes)),
                Opcode::PushLabel(l) => format!("PUSH2 <{l:?}>"),
                Opcode::JumpDest(l) => format!("JUMPDEST <{l:?}>"),
                other => format!("{other:?}"),
            }
        } else {
            String::new()
        };
        let label = match &op {
            Opcode::JumpDest(l) => Some(LabelRole::Definition(*l)),
            Opcode::PushLabel(l) => Some(LabelRole::Reference(*l)),
            _ => None,
        };
        // `PushLabel`'s real 2-byte operand isn't known until the whole
        // function is emitted and every `JumpDest`'s PC is recorded; this
        // placeholder keeps `encoded_len` and `bytes.len()` in lockstep so
        // the PC-accounting pass in `resolve_labels` is exact.
        let bytes = match &op {
            Opcode::PushLabel(_) => vec![op.byte(), 0, 0],
            _ => vec![op.byte()],
        };
        self.out.push(Instruction { opcode_repr: mnemonic, bytes, label });
        Ok(())
    }

    fn push_u64(&mut self, v: u64) -> Result<(), CodeGenError> {
        self.emit(Opcode::Push(minimal_bytes(U256::from(v))))
    }

    fn push_const(&mut self, c: &ConstValue) -> Result<(), CodeGenError> {
        let bytes = const_bytes(c)?;
        self.emit(Opcode::Push(bytes))
    }

    fn push_label(&mut self, l: Label) -> Result<(), CodeGenError> {
        self.emit(Opcode::PushLabel(l))
    }

    fn read_raw(&mut self, addr: u64) -> Result<(), CodeGenError> {
        self.push_u64(addr)?;
        self.emit(Opcode::MLoad)
    }

    fn write_raw(&mut self, addr: u64) -> Result<(), CodeGenError> {
        self.push_u64(addr)?;
        self.emit(Opcode::MStore)
    }

    fn load_value(&mut self, v: &Value) -> Result<(), CodeGenError> {
        match v {
            Value::Const(c) => self.push_const(c),
            Value::Temp(id) => self.read_raw(self.slot_addr(*id)),
        }
    }

    fn store_temp(&mut self, dest: ValueId) -> Result<(), CodeGenError> {
        self.write_raw(self.slot_addr(dest))
    }

    /// Computes `lhs OP rhs`. The EVM's binary opcodes compute `s0 OP s1`
    /// (top-of-stack vs. second); pushing `rhs` then `lhs` puts `lhs` on
    /// top, giving the source-level left-to-right operand order directly.
    fn binop(&mut self, op: BinOp, lhs: &Value, rhs: &Value) -> Result<(), CodeGenError> {
        self.load_value(rhs)?;
        self.load_value(lhs)?;
        self.emit_binop(op)
    }

    fn emit_binop(&mut self, op: BinOp) -> Result<(), CodeGenError> {
        match op {
            BinOp::Add => self.emit(Opcode::Add),
            BinOp::Sub => self.emit(Opcode::Sub),
            BinOp::Mul => self.emit(Opcode::Mul),
            BinOp::Div => self.emit(Opcode::Div),
            BinOp::Mod => self.emit(Opcode::Mod),
            BinOp::Lt => self.emit(Opcode::Lt),
            BinOp::Gt => self.emit(Opcode::Gt),
            BinOp::Eq => self.emit(Opcode::Eq),
            BinOp::And => self.emit(Opcode::And),
            BinOp::Or => self.emit(Opcode::Or),
            BinOp::Byte => self.emit(Opcode::Byte),
            BinOp::Le => {
                self.emit(Opcode::Gt)?;
                self.emit(Opcode::IsZero)
            }
            BinOp::Ge => {
                self.emit(Opcode::Lt)?;
                self.emit(Opcode::IsZero)
            }
            BinOp::Ne => {
                self.emit(Opcode::Eq)?;
                self.emit(Opcode::IsZero)
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn minimal_bytes(v: U256) -> Vec<u8> {
    let full = v.to_be_bytes::<32>();
    let first_nonzero = full.iter().position(|b| *b != 0);
    match first_nonzero {
        Some(idx) => full[idx..].to_vec(),
        None => vec![0],
    }
}

fn const_bytes(c: &ConstValue) -> Result<Vec<u8>, CodeGenError> {
    Ok(match c {
        ConstValue::Uint(v) => minimal_bytes(U256::from(*v)),
        ConstValue::BigUint(s) => {
            let v = U256::from_str_radix(s, 10)
                .map_err(|_| CodeGenError::UnsupportedInstruction { detail: format!("invalid integer literal '{s}'") })?;
            minimal_bytes(v)
        }
        ConstValue::Bool(b) => vec![*b as u8],
        ConstValue::Address(addr) => {
            let digits = addr.trim_start_matches("0x");
            hex_decode(digits).map_err(|_| CodeGenError::UnsupportedInstruction { detail: format!("invalid address literal '{addr}'") })?
        }
        ConstValue::Bytes(bytes) => {
            if bytes.len() > 32 {
                return Err(CodeGenError::MemoryAllocationFailed {
                    reason: "byte-string constants over 32 bytes need a memory buffer, not a stack word".into(),
                });
            }
            bytes.clone()
        }
        ConstValue::String(s) => {
            if s.len() > 32 {
                return Err(CodeGenError::MemoryAllocationFailed {
                    reason: "string constants over 32 bytes need a memory buffer, not a stack word".into(),
                });
            }
            s.as_bytes().to_vec()
        }
    })
}

fn hex_decode(digits: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
    let padded = if digits.len() % 2 == 1 { format!("0{digits}") } else { digits.to_string() };
    (0..padded.len()).step_by(2).map(|i| u8::from_str_radix(&padded[i..i + 2], 16)).collect()
}

fn mask_for_bits(bits: u16) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1u8) << bits) - U256::from(1u8)
    }
}

/// Every block that reads a phi expects its sources written into that
/// phi's slot by every predecessor, just before that predecessor's own
/// terminator runs (spec.md §4.2.4 invariant, realized here as an
/// unconditional "parallel copy on the edge" — harmless on a branch arm
/// that does not actually reach the phi's block, since the slot it writes
/// is never read unless control does reach it).
fn collect_tail_copies(function: &Function) -> HashMap<BlockId, Vec<(ValueId, Value)>> {
    let mut copies: HashMap<BlockId, Vec<(ValueId, Value)>> = HashMap::new();
    for block in &function.blocks {
        for phi in &block.phis {
            for (pred, value) in &phi.sources {
                copies.entry(*pred).or_default().push((phi.dest, value.clone()));
            }
        }
    }
    copies
}

fn emit_function(function: &Function, options: &CompilerOptions) -> Result<Vec<Instruction>, CodeGenError> {
    let span = tracing::debug_span!("codegen", function = %function.name);
    let _enter = span.enter();

    for block in &function.blocks {
        for phi in &block.phis {
            for pred in &block.predecessors {
                if !phi.sources.iter().any(|(p, _)| p == pred) {
                    return Err(CodeGenError::PhiMissingPredecessor {
                        function: function.name.clone(),
                        block: block.id,
                        predecessor: *pred,
                    });
                }
            }
        }
    }

    let max_value = max_value_id(function);
    let mut em = Emitter::new(options, max_value, function.name.clone());
    let tail_copies = collect_tail_copies(function);

    em.push_u64(HEAP_INIT + (em.reserved_slot(RESERVED_SLOTS) - SCRATCH_BASE))?;
    em.write_raw(FREE_PTR)?;

    for (idx, block) in function.blocks.iter().enumerate() {
        em.emit(Opcode::JumpDest(Label::Block(block.id)))?;

        for phi_dest in block.phis.iter().map(|p| p.dest) {
            let _ = phi_dest; // phi values arrive via predecessor tail copies; nothing to emit here.
        }

        for instr in &block.instructions {
            emit_instruction(&mut em, instr)?;
        }

        if let Some(copies) = tail_copies.get(&block.id) {
            for (dest, value) in copies {
                em.load_value(value)?;
                em.store_temp(*dest)?;
            }
        }

        let next_block_id = function.blocks.get(idx + 1).map(|b| b.id);
        emit_terminator(&mut em, &block.terminator, next_block_id, &function.name)?;
    }

    let mut out = em.out;
    resolve_labels(&mut out)?;
    Ok(out)
}

/// Two-pass label resolution over one function's finished instruction
/// stream: first records each `JUMPDEST`'s program counter, then patches
/// every `PUSH2` reference's placeholder operand with the resolved PC
/// (spec.md §4.4 requires real jump targets, not symbolic ones, in the
/// final bytecode). Labels are local to a single `emit_function` call —
/// `main` and `create` are assembled and resolved independently.
fn resolve_labels(instructions: &mut [Instruction]) -> Result<(), CodeGenError> {
    let mut pc: u64 = 0;
    let mut targets: HashMap<Label, u64> = HashMap::new();
    for instr in instructions.iter() {
        if let Some(LabelRole::Definition(l)) = instr.label {
            targets.insert(l, pc);
        }
        pc += instr.bytes.len() as u64;
    }
    for instr in instructions.iter_mut() {
        if let Some(LabelRole::Reference(l)) = instr.label {
            let target_pc = *targets.get(&l).ok_or_else(|| CodeGenError::UnsupportedInstruction {
                detail: format!("jump target {l:?} was never defined"),
            })?;
            if target_pc > u64::from(u16::MAX) {
                return Err(CodeGenError::MemoryAllocationFailed {
                    reason: "function body exceeds 64KiB, PUSH2 label encoding overflows".into(),
                });
            }
            instr.bytes = vec![0x61, (target_pc >> 8) as u8, (target_pc & 0xff) as u8];
            if !instr.opcode_repr.is_empty() {
                instr.opcode_repr = format!("PUSH2 0x{target_pc:04x} <{l:?}>");
            }
        }
    }
    Ok(())
}

fn emit_terminator(em: &mut Emitter, term: &Terminator, next: Option<BlockId>, function_name: &str) -> Result<(), CodeGenError> {
    match term {
        Terminator::Jump { target } => {
            if Some(*target) != next {
                em.push_label(Label::Block(*target))?;
                em.emit(Opcode::Jump)?;
            }
            Ok(())
        }
        Terminator::Branch { condition, then_block, else_block } => {
            em.load_value(condition)?;
            em.push_label(Label::Block(*then_block))?;
            em.emit(Opcode::JumpI)?;
            if Some(*else_block) != next {
                em.push_label(Label::Block(*else_block))?;
                em.emit(Opcode::Jump)?;
            }
            Ok(())
        }
        Terminator::Return { value: Some(v) } => {
            em.load_value(v)?;
            em.write_raw(0x00)?;
            em.push_u64(0x00)?;
            em.push_u64(32)?;
            em.emit(Opcode::Return)
        }
        Terminator::Return { value: None } => em.emit(Opcode::Stop),
        Terminator::Unreachable => Err(CodeGenError::UnsupportedInstruction {
            detail: format!("{function_name}: block has no terminator"),
        }),
    }
}

fn emit_instruction(em: &mut Emitter, instr: &IrInstruction) -> Result<(), CodeGenError> {
    match instr {
        IrInstruction::Const { dest, value, .. } => {
            em.push_const(value)?;
            em.store_temp(*dest)
        }
        IrInstruction::Binary { dest, op, lhs, rhs, .. } => {
            em.binop(*op, lhs, rhs)?;
            em.store_temp(*dest)
        }
        IrInstruction::Unary { dest, op, operand, .. } => {
            match op {
                UnOp::Not => {
                    em.load_value(operand)?;
                    em.emit(Opcode::IsZero)?;
                }
                UnOp::Neg => {
                    em.push_u64(0)?;
                    em.load_value(operand)?;
                    em.emit(Opcode::Sub)?;
                }
            }
            em.store_temp(*dest)
        }
        IrInstruction::Cast { dest, ty, operand } => {
            em.load_value(operand)?;
            if let Type::Uint(bits) = ty {
                if *bits < 256 {
                    em.emit(Opcode::Push(minimal_bytes(mask_for_bits(*bits))))?;
                    em.emit(Opcode::And)?;
                }
            }
            em.store_temp(*dest)
        }
        IrInstruction::Env { dest, kind, .. } => {
            match kind {
                EnvKind::MsgSender => em.emit(Opcode::Caller)?,
                EnvKind::MsgValue => em.emit(Opcode::CallValue)?,
                EnvKind::MsgData => {
                    em.push_u64(0)?;
                    em.emit(Opcode::CallDataLoad)?;
                }
                EnvKind::BlockTimestamp => em.emit(Opcode::Timestamp)?,
                EnvKind::BlockNumber => em.emit(Opcode::Number)?,
            }
            em.store_temp(*dest)
        }
        IrInstruction::Hash { dest, operand } => {
            em.load_value(operand)?;
            em.write_raw(0x00)?;
            em.push_u64(0x00)?;
            em.push_u64(32)?;
            em.emit(Opcode::Sha3)?;
            em.store_temp(*dest)
        }
        IrInstruction::Length { dest, operand } => {
            em.load_value(operand)?;
            em.emit(Opcode::MLoad)?;
            em.store_temp(*dest)
        }
        IrInstruction::Slice { dest, operand, start, end } => emit_slice(em, *dest, operand, start, end),
        IrInstruction::ComputeSlot { dest, computation } => emit_compute_slot(em, *dest, computation),
        IrInstruction::ComputeOffset { dest, base, offset } => {
            em.load_value(base)?;
            em.load_value(offset)?;
            em.emit(Opcode::Add)?;
            em.store_temp(*dest)
        }
        IrInstruction::Read { dest, location, slot, offset, .. } => {
            match location {
                Location::Storage => {
                    em.load_value(slot.as_ref().ok_or_else(missing_operand("storage read", "slot"))?)?;
                    em.emit(Opcode::SLoad)?;
                }
                Location::Memory => {
                    em.load_value(offset.as_ref().ok_or_else(missing_operand("memory read", "offset"))?)?;
                    em.emit(Opcode::MLoad)?;
                }
                Location::Calldata => {
                    em.load_value(offset.as_ref().ok_or_else(missing_operand("calldata read", "offset"))?)?;
                    em.emit(Opcode::CallDataLoad)?;
                }
                Location::Returndata => {
                    return Err(CodeGenError::UnsupportedInstruction { detail: "returndata reads are not supported".into() });
                }
            }
            em.store_temp(*dest)
        }
        IrInstruction::Write { location, slot, offset, value, .. } => match location {
            Location::Storage => {
                em.load_value(value)?;
                em.load_value(slot.as_ref().ok_or_else(missing_operand("storage write", "slot"))?)?;
                em.emit(Opcode::SStore)
            }
            Location::Memory => {
                em.load_value(value)?;
                em.load_value(offset.as_ref().ok_or_else(missing_operand("memory write", "offset"))?)?;
                em.emit(Opcode::MStore)
            }
            Location::Calldata | Location::Returndata => {
                Err(CodeGenError::UnsupportedInstruction { detail: "calldata/returndata are not writable".into() })
            }
        },
        IrInstruction::Allocate { dest, size, .. } => {
            em.read_raw(FREE_PTR)?;
            em.store_temp(*dest)?;
            em.load_value_temp(*dest)?;
            em.load_value(size)?;
            em.emit(Opcode::Add)?;
            em.write_raw(FREE_PTR)
        }
        IrInstruction::Call { .. } => Err(CodeGenError::UnsupportedInstruction {
            detail: "call survived inlining — target is not a declared function".into(),
        }),
    }
}

fn missing_operand(op: &'static str, field: &'static str) -> impl FnOnce() -> CodeGenError {
    move || CodeGenError::UnsupportedInstruction { detail: format!("{op} missing its {field} operand") }
}

impl<'a> Emitter<'a> {
    fn load_value_temp(&mut self, id: ValueId) -> Result<(), CodeGenError> {
        self.read_raw(self.slot_addr(id))
    }
}

fn emit_compute_slot(em: &mut Emitter, dest: ValueId, computation: &SlotComputation) -> Result<(), CodeGenError> {
    match computation {
        SlotComputation::Mapping { base, key } => {
            em.load_value(key)?;
            em.write_raw(0x00)?;
            em.load_value(base)?;
            em.write_raw(0x20)?;
            em.push_u64(0x00)?;
            em.push_u64(0x40)?;
            em.emit(Opcode::Sha3)?;
            em.store_temp(dest)
        }
        SlotComputation::Array { base } => {
            em.load_value(base)?;
            em.write_raw(0x00)?;
            em.push_u64(0x00)?;
            em.push_u64(0x20)?;
            em.emit(Opcode::Sha3)?;
            em.store_temp(dest)
        }
        SlotComputation::Field { base, field_offset } => {
            em.load_value(base)?;
            em.push_u64((*field_offset as u64) / 32)?;
            em.emit(Opcode::Add)?;
            em.store_temp(dest)
        }
    }
}

/// Copies `[start, end)` out of `operand` (assumed laid out as a
/// length-prefixed buffer: `[length][data...]`, the usual ABI convention)
/// into a freshly allocated buffer of the same shape. Copies in 32-byte
/// words, so up to 31 trailing bytes of slack may be copied past the
/// declared length into the new buffer's unused tail — harmless, since
/// nothing reads past the length word it also carries.
fn emit_slice(em: &mut Emitter, dest: ValueId, operand: &Value, start: &Value, end: &Value) -> Result<(), CodeGenError> {
    let length_slot = em.reserved_slot(LENGTH_SLOT_OFFSET);
    let tmp_slot = em.reserved_slot(TMP_SLOT_OFFSET);
    let words_slot = em.reserved_slot(WORDS_SLOT_OFFSET);
    let result_ptr_slot = em.reserved_slot(RESULT_PTR_SLOT_OFFSET);
    let source_base_slot = em.reserved_slot(SOURCE_BASE_SLOT_OFFSET);
    let counter_slot = em.reserved_slot(COUNTER_SLOT_OFFSET);

    em.binop(BinOp::Sub, end, start)?;
    em.write_raw(length_slot)?;

    em.load_value(operand)?;
    em.push_u64(32)?;
    em.emit(Opcode::Add)?;
    em.load_value(start)?;
    em.emit(Opcode::Add)?;
    em.write_raw(source_base_slot)?;

    em.read_raw(length_slot)?;
    em.push_u64(31)?;
    em.emit(Opcode::Add)?;
    em.write_raw(tmp_slot)?;
    em.push_u64(32)?;
    em.read_raw(tmp_slot)?;
    em.emit(Opcode::Div)?;
    em.write_raw(words_slot)?;

    em.read_raw(words_slot)?;
    em.push_u64(32)?;
    em.emit(Opcode::Mul)?;
    em.push_u64(32)?;
    em.emit(Opcode::Add)?;
    em.write_raw(tmp_slot)?;

    em.read_raw(FREE_PTR)?;
    em.write_raw(result_ptr_slot)?;
    em.read_raw(result_ptr_slot)?;
    em.read_raw(tmp_slot)?;
    em.emit(Opcode::Add)?;
    em.write_raw(FREE_PTR)?;

    em.read_raw(length_slot)?;
    em.read_raw(result_ptr_slot)?;
    em.emit(Opcode::MStore)?;

    em.push_u64(0)?;
    em.write_raw(counter_slot)?;
    let loop_top = em.fresh_label();
    let loop_done = em.fresh_label();
    em.emit(Opcode::JumpDest(loop_top))?;

    em.read_raw(words_slot)?;
    em.read_raw(counter_slot)?;
    em.emit(Opcode::Lt)?;
    em.emit(Opcode::IsZero)?;
    em.push_label(loop_done)?;
    em.emit(Opcode::JumpI)?;

    em.read_raw(counter_slot)?;
    em.push_u64(32)?;
    em.emit(Opcode::Mul)?;
    em.write_raw(tmp_slot)?;

    em.read_raw(source_base_slot)?;
    em.read_raw(tmp_slot)?;
    em.emit(Opcode::Add)?;
    em.emit(Opcode::MLoad)?;

    em.read_raw(result_ptr_slot)?;
    em.push_u64(32)?;
    em.emit(Opcode::Add)?;
    em.read_raw(tmp_slot)?;
    em.emit(Opcode::Add)?;
    em.emit(Opcode::MStore)?;

    em.read_raw(counter_slot)?;
    em.push_u64(1)?;
    em.emit(Opcode::Add)?;
    em.write_raw(counter_slot)?;
    em.push_label(loop_top)?;
    em.emit(Opcode::Jump)?;

    em.emit(Opcode::JumpDest(loop_done))?;
    em.read_raw(result_ptr_slot)?;
    em.store_temp(dest)
}

// ---------------------------------------------------------------------
// Assembly: resolves symbolic labels to absolute byte offsets.
// ---------------------------------------------------------------------

fn assemble(instructions: &[Instruction]) -> Result<Vec<u8>, CodeGenError> {
    // Labels are already resolved to real PC-relative operands by
    // `resolve_labels` inside `emit_function`; concatenating bytes is all
    // that's left.
    Ok(instructions.iter().flat_map(|i| i.bytes().to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;

    fn opts() -> CompilerOptions {
        CompilerOptions::default()
    }

    #[test]
    fn empty_module_initializes_the_free_memory_pointer_then_stops() {
        let module = Module::new("Empty");
        let out = generate(&module, &opts()).expect("codegen succeeds");
        assert!(out.runtime_instructions.iter().any(|i| i.mnemonic() == "MStore"));
        assert_eq!(out.runtime_instructions.last().unwrap().mnemonic(), "Stop");
        assert_eq!(out.runtime.last(), Some(&0x00));
    }

    #[test]
    fn const_folds_into_push_and_store() {
        let mut block = Block::new(BlockId(0));
        block.instructions.push(IrInstruction::Const {
            dest: ValueId(0),
            ty: crate::types::Type::Uint(256),
            value: ConstValue::Uint(7),
        });
        block.terminator = Terminator::Return { value: Some(Value::Temp(ValueId(0))) };
        let mut function = Function { name: "main".into(), parameters: vec![], return_type: None, entry: BlockId(0), blocks: vec![block] };
        function.recompute_predecessors();
        let instrs = emit_function(&function, &opts()).expect("emits");
        assert!(instrs.iter().any(|i| i.mnemonic().starts_with("PUSH1 0x07")));
        assert!(instrs.iter().any(|i| i.mnemonic() == "Return"));
    }

    #[test]
    fn phi_missing_a_predecessor_source_is_rejected() {
        let mut entry = Block::new(BlockId(0));
        entry.terminator = Terminator::Jump { target: BlockId(1) };
        let mut merge = Block::new(BlockId(1));
        merge.phis.push(Phi { dest: ValueId(0), ty: crate::types::Type::Bool, sources: vec![] });
        merge.predecessors = vec![BlockId(0)];
        merge.terminator = Terminator::Return { value: None };
        let function = Function {
            name: "f".into(),
            parameters: vec![],
            return_type: None,
            entry: BlockId(0),
            blocks: vec![entry, merge],
        };
        let err = emit_function(&function, &opts()).unwrap_err();
        assert!(matches!(err, CodeGenError::PhiMissingPredecessor { .. }));
    }

    /// A forward branch (`then_block` placed before the fallthrough `else`)
    /// forces the `JUMPI`'s `PUSH2` to resolve to a PC it hasn't reached
    /// yet when it's emitted — exercises `resolve_labels` for real instead
    /// of relying on the trivial same-position case.
    #[test]
    fn branch_resolves_jump_targets_to_real_program_counters() {
        let mut entry = Block::new(BlockId(0));
        entry.terminator = Terminator::Branch {
            condition: Value::Const(ConstValue::Bool(true)),
            then_block: BlockId(1),
            else_block: BlockId(2),
        };
        let mut then_block = Block::new(BlockId(1));
        then_block.terminator = Terminator::Return { value: Some(Value::Const(ConstValue::Uint(1))) };
        let mut else_block = Block::new(BlockId(2));
        else_block.terminator = Terminator::Return { value: Some(Value::Const(ConstValue::Uint(2))) };
        let mut function = Function {
            name: "gate".into(),
            parameters: vec![],
            return_type: None,
            entry: BlockId(0),
            blocks: vec![entry, then_block, else_block],
        };
        function.recompute_predecessors();
        let instrs = emit_function(&function, &opts()).expect("emits");
        let bytes = assemble(&instrs).expect("assembles");

        let mut pc = 0usize;
        let mut jumpdest_pcs = Vec::new();
        for instr in &instrs {
            if matches!(instr.label, Some(LabelRole::Definition(_))) {
                jumpdest_pcs.push(pc);
            }
            pc += instr.bytes().len();
        }
        assert_eq!(jumpdest_pcs.len(), 3, "one JUMPDEST per block");

        for instr in &instrs {
            if let Some(LabelRole::Reference(_)) = instr.label {
                assert_eq!(instr.bytes()[0], 0x61, "PUSH2");
                let target = ((instr.bytes()[1] as usize) << 8) | instr.bytes()[2] as usize;
                assert!(jumpdest_pcs.contains(&target), "PUSH2 operand must resolve to a real JUMPDEST pc");
                assert_eq!(bytes[target], 0x5b, "resolved target byte is JUMPDEST");
            }
        }
    }
}
