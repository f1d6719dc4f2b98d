//! SSA intermediate representation (spec.md §3 DATA MODEL, component C3).
//!
//! A `Module` holds one `Function` per declared function plus the synthetic
//! `create` and `main` (runtime body) functions. Every `Block` is in SSA
//! form: values are produced exactly once, merges go through `Phi` nodes,
//! and every block ends in exactly one `Terminator`.

use crate::types::Type;
use std::fmt;

/// Stable numbering for IR-level values and blocks, distinct from
/// [`crate::ast::Id`] — the IR generator mints fresh ones as it lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// An SSA value: either a materialized constant or a reference to the
/// result of a prior instruction/phi (spec.md §3 "Value").
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(ConstValue),
    Temp(ValueId),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Const(c) => write!(f, "{c}"),
            Value::Temp(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Uint(u64),
    /// Arbitrary-precision literal, kept as the decimal string the parser
    /// handed us so 256-bit constants never lose precision round-tripping
    /// through this enum.
    BigUint(String),
    Bool(bool),
    Address(String),
    Bytes(Vec<u8>),
    String(String),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Uint(v) => write!(f, "{v}"),
            ConstValue::BigUint(v) => write!(f, "{v}"),
            ConstValue::Bool(v) => write!(f, "{v}"),
            ConstValue::Address(v) => write!(f, "{v}"),
            ConstValue::Bytes(v) => write!(f, "0x{}", hex_string(v)),
            ConstValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A phi node: one merged definition per predecessor block, in the same
/// order as the owning block's `predecessors` (spec.md §4.2.4 invariant).
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub dest: ValueId,
    pub ty: Type,
    pub sources: Vec<(BlockId, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    /// `BYTE(i, x)`: the `i`-th byte of 256-bit word `x`, counting from the
    /// most significant byte — how a dynamic `bytes` buffer's packed
    /// payload is indexed a single byte at a time (spec.md §4.2.1).
    Byte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    MsgSender,
    MsgValue,
    MsgData,
    BlockTimestamp,
    BlockNumber,
}

/// Where a `read`/`write`/`allocate` instruction addresses (spec.md §3 IR
/// `Instruction` summary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Storage,
    Memory,
    Calldata,
    Returndata,
}

/// How one level of a storage access chain collapses to a slot value
/// (spec.md §4.2.3). `base` is the slot value reaching this level — a
/// constant for the first level of a chain, or the `dest` of the prior
/// level's `compute_slot`/`binary{add}` for subsequent levels.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotComputation {
    /// `keccak256(pad32(key) . pad32(base))`, Solidity mapping layout.
    Mapping { base: Value, key: Value },
    /// `keccak256(pad32(base))`, the element base of a Solidity dynamic
    /// array; the caller adds the index separately (spec.md §4.2.3).
    Array { base: Value },
    /// `base + (fieldOffset / 32)`.
    Field { base: Value, field_offset: u32 },
}

/// One SSA instruction. Each produces at most one named result (`dest`);
/// `read`/`write` are the only storage-access primitives the IR generator
/// emits (spec.md §10 resolved Open Question — no legacy op family).
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Const {
        dest: ValueId,
        ty: Type,
        value: ConstValue,
    },
    Binary {
        dest: ValueId,
        ty: Type,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Unary {
        dest: ValueId,
        ty: Type,
        op: UnOp,
        operand: Value,
    },
    Cast {
        dest: ValueId,
        ty: Type,
        operand: Value,
    },
    Env {
        dest: ValueId,
        ty: Type,
        kind: EnvKind,
    },
    Hash {
        dest: ValueId,
        operand: Value,
    },
    Length {
        dest: ValueId,
        operand: Value,
    },
    Slice {
        dest: ValueId,
        operand: Value,
        start: Value,
        end: Value,
    },
    ComputeSlot {
        dest: ValueId,
        computation: SlotComputation,
    },
    /// Byte-offset addressing inside a memory/calldata region, e.g. a
    /// struct field or array element nested under a base pointer.
    ComputeOffset {
        dest: ValueId,
        base: Value,
        offset: Value,
    },
    Read {
        dest: ValueId,
        ty: Type,
        location: Location,
        slot: Option<Value>,
        offset: Option<Value>,
        length: Option<Value>,
    },
    Write {
        location: Location,
        slot: Option<Value>,
        offset: Option<Value>,
        length: Option<Value>,
        value: Value,
    },
    Allocate {
        dest: ValueId,
        ty: Type,
        location: Location,
        size: Value,
    },
    Call {
        dest: Option<ValueId>,
        ty: Option<Type>,
        callee: String,
        arguments: Vec<Value>,
    },
}

impl Instruction {
    pub fn dest(&self) -> Option<ValueId> {
        match self {
            Instruction::Const { dest, .. }
            | Instruction::Binary { dest, .. }
            | Instruction::Unary { dest, .. }
            | Instruction::Cast { dest, .. }
            | Instruction::Env { dest, .. }
            | Instruction::Hash { dest, .. }
            | Instruction::Length { dest, .. }
            | Instruction::Slice { dest, .. }
            | Instruction::ComputeSlot { dest, .. }
            | Instruction::ComputeOffset { dest, .. }
            | Instruction::Read { dest, .. }
            | Instruction::Allocate { dest, .. } => Some(*dest),
            Instruction::Call { dest, .. } => *dest,
            Instruction::Write { .. } => None,
        }
    }

    /// Operands read by this instruction, in evaluation order. Used by
    /// liveness analysis (C6) and by the optimizer's use-counting passes.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Instruction::Const { .. } | Instruction::Env { .. } => vec![],
            Instruction::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Instruction::Unary { operand, .. }
            | Instruction::Cast { operand, .. }
            | Instruction::Hash { operand, .. }
            | Instruction::Length { operand, .. } => vec![operand],
            Instruction::Slice { operand, start, end, .. } => vec![operand, start, end],
            Instruction::ComputeSlot { computation, .. } => slot_operands(computation),
            Instruction::ComputeOffset { base, offset, .. } => vec![base, offset],
            Instruction::Read { slot, offset, length, .. } => {
                [slot, offset, length].into_iter().flatten().collect()
            }
            Instruction::Write { slot, offset, length, value } => {
                let mut vs: Vec<&Value> = [slot, offset, length].into_iter().flatten().collect();
                vs.push(value);
                vs
            }
            Instruction::Allocate { size, .. } => vec![size],
            Instruction::Call { arguments, .. } => arguments.iter().collect(),
        }
    }
}

fn slot_operands(computation: &SlotComputation) -> Vec<&Value> {
    match computation {
        SlotComputation::Mapping { base, key } => vec![base, key],
        SlotComputation::Array { base } => vec![base],
        SlotComputation::Field { base, .. } => vec![base],
    }
}

/// A block's terminator. Every block has exactly one (spec.md §3 invariant).
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump { target: BlockId },
    Branch {
        condition: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return { value: Option<Value> },
    /// Present only before the IR generator finishes a block; never valid
    /// in a completed `Module` handed to the optimizer.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<Phi>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    pub predecessors: Vec<BlockId>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Block {
            id,
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
            predecessors: Vec::new(),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match &self.terminator {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Return { .. } | Terminator::Unreachable => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: ValueId,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub return_type: Option<Type>,
    pub entry: BlockId,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Recomputes every block's `predecessors` from the current terminators.
    /// Called once by the IR generator after a function is built, and again
    /// by the optimizer after any pass that rewires the CFG, so the
    /// invariant "predecessors matches actual incoming edges" always holds
    /// on a `Module` handed between C4/C5/C6.
    pub fn recompute_predecessors(&mut self) {
        let mut preds: std::collections::HashMap<BlockId, Vec<BlockId>> = std::collections::HashMap::new();
        for b in &self.blocks {
            for succ in b.successors() {
                preds.entry(succ).or_default().push(b.id);
            }
        }
        for b in &mut self.blocks {
            b.predecessors = preds.remove(&b.id).unwrap_or_default();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSlot {
    pub name: String,
    pub ty: Type,
    pub slot: i64,
}

/// The whole-program IR unit handed from C4 to C5 to C6 (spec.md §3
/// "Module").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: String,
    pub storage: Vec<StorageSlot>,
    pub functions: Vec<Function>,
    /// Constructor body, run once at deployment (`create {}` block).
    pub create: Option<Function>,
    /// Runtime dispatch body (`code {}` block), the contract's fallback.
    pub main: Option<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
