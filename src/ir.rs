#![allow(dead_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whole-program input handed over by the front end.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct Program {
    #[serde(default)]
    pub(crate) classes: Vec<ClassInfo>,
    #[serde(default)]
    pub(crate) annotations: Vec<MethodAnnotations>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

/// Class shape used for type tests and field lookups.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ClassInfo {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) is_interface: bool,
    #[serde(default)]
    pub(crate) fields: Vec<FieldInfo>,
    #[serde(default)]
    pub(crate) source_file: Option<String>,
}

/// Declared field attributes.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct FieldInfo {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) nullness: Nullness,
    #[serde(default)]
    pub(crate) is_final: bool,
    #[serde(default)]
    pub(crate) is_volatile: bool,
}

/// Externally declared contract and nullness for a method, analyzed or not.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MethodAnnotations {
    pub(crate) method: MethodId,
    #[serde(default)]
    pub(crate) contract: Option<String>,
    #[serde(default)]
    pub(crate) pure: bool,
    #[serde(default)]
    pub(crate) return_nullness: Nullness,
    #[serde(default)]
    pub(crate) parameter_nullness: Vec<Nullness>,
    #[serde(default)]
    pub(crate) returns_unmodifiable: bool,
}

/// Fully qualified method identity.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub(crate) struct MethodId {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodId {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Method body and declarations to analyze.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Method {
    pub(crate) id: MethodId,
    #[serde(default)]
    pub(crate) access: MethodAccess,
    #[serde(default)]
    pub(crate) nullness: MethodNullness,
    #[serde(default)]
    pub(crate) contract: Option<String>,
    #[serde(default)]
    pub(crate) pure: bool,
    pub(crate) cfg: ControlFlowGraph,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub(crate) struct MethodAccess {
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_varargs: bool,
}

/// Declared nullness of a method's return value and parameters.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct MethodNullness {
    #[serde(default)]
    pub(crate) return_nullness: Nullness,
    #[serde(default)]
    pub(crate) parameter_nullness: Vec<Nullness>,
}

impl MethodNullness {
    pub(crate) fn parameter(&self, index: usize) -> Nullness {
        self.parameter_nullness
            .get(index)
            .copied()
            .unwrap_or_default()
    }
}

/// Declared nullness annotation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Nullness {
    NonNull,
    Nullable,
    #[default]
    Unknown,
}

/// Control flow graph with explicit edges.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ControlFlowGraph {
    pub(crate) blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub(crate) edges: Vec<FlowEdge>,
}

/// Basic block identified by the offset of its first instruction.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct BasicBlock {
    pub(crate) start_offset: u32,
    pub(crate) instructions: Vec<Instruction>,
}

/// Control-flow edge between basic blocks.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct FlowEdge {
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) kind: EdgeKind,
}

/// Edge classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EdgeKind {
    FallThrough,
    Jump,
    BranchTrue,
    BranchFalse,
    Exception,
    /// Resume target of a finally body, taken only through `exit_finally`.
    Finally,
}

impl EdgeKind {
    /// Followed when control leaves a block without branching.
    pub(crate) fn is_normal(self) -> bool {
        matches!(self, EdgeKind::FallThrough | EdgeKind::Jump)
    }
}

/// One instruction with its location tokens.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    #[serde(default)]
    pub(crate) line: Option<u32>,
    pub(crate) kind: InstructionKind,
}

/// Closed instruction set understood by the interpreter.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum InstructionKind {
    Push { value: Constant },
    New { class: String },
    NewArray { component: String },
    Load { index: u16 },
    Store { index: u16 },
    GetField { field: FieldRef },
    PutField { field: FieldRef },
    GetStatic { field: FieldRef },
    PutStatic { field: FieldRef },
    ArrayLoad,
    ArrayStore,
    ArrayLength,
    Pop,
    Dup,
    Swap,
    Unary { operator: UnaryOp },
    Binary { operator: BinaryOp },
    InstanceOf { class: String },
    CheckCast { class: String },
    Invoke { call: CallSite },
    Box { class: String },
    Unbox { class: String },
    Return,
    ReturnVoid,
    Throw,
    Branch,
    MonitorEnter,
    MonitorExit,
    TryEnter,
    TryExit,
    EnterFinally { resume: ResumeTarget },
    ExitFinally,
    Unknown {
        name: String,
        #[serde(default)]
        pops: usize,
        #[serde(default)]
        pushes: usize,
    },
}

impl InstructionKind {
    /// Name used for coverage counters and debug output.
    pub(crate) fn name(&self) -> &str {
        match self {
            InstructionKind::Push { .. } => "push",
            InstructionKind::New { .. } => "new",
            InstructionKind::NewArray { .. } => "new_array",
            InstructionKind::Load { .. } => "load",
            InstructionKind::Store { .. } => "store",
            InstructionKind::GetField { .. } => "get_field",
            InstructionKind::PutField { .. } => "put_field",
            InstructionKind::GetStatic { .. } => "get_static",
            InstructionKind::PutStatic { .. } => "put_static",
            InstructionKind::ArrayLoad => "array_load",
            InstructionKind::ArrayStore => "array_store",
            InstructionKind::ArrayLength => "array_length",
            InstructionKind::Pop => "pop",
            InstructionKind::Dup => "dup",
            InstructionKind::Swap => "swap",
            InstructionKind::Unary { .. } => "unary",
            InstructionKind::Binary { .. } => "binary",
            InstructionKind::InstanceOf { .. } => "instance_of",
            InstructionKind::CheckCast { .. } => "check_cast",
            InstructionKind::Invoke { .. } => "invoke",
            InstructionKind::Box { .. } => "box",
            InstructionKind::Unbox { .. } => "unbox",
            InstructionKind::Return => "return",
            InstructionKind::ReturnVoid => "return_void",
            InstructionKind::Throw => "throw",
            InstructionKind::Branch => "branch",
            InstructionKind::MonitorEnter => "monitor_enter",
            InstructionKind::MonitorExit => "monitor_exit",
            InstructionKind::TryEnter => "try_enter",
            InstructionKind::TryExit => "try_exit",
            InstructionKind::EnterFinally { .. } => "enter_finally",
            InstructionKind::ExitFinally => "exit_finally",
            InstructionKind::Unknown { name, .. } => name,
        }
    }

    /// Instructions that must end their basic block.
    pub(crate) fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstructionKind::Return
                | InstructionKind::ReturnVoid
                | InstructionKind::Throw
                | InstructionKind::Branch
                | InstructionKind::ExitFinally
        )
    }
}

/// Literal operand of a push instruction.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub(crate) enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Nan,
    String(String),
    Class(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

/// Field reference resolved by owner and name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
}

/// Call site operand of an invoke instruction.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
}

impl CallSite {
    pub(crate) fn method_id(&self) -> MethodId {
        MethodId::new(&self.owner, &self.name, &self.descriptor)
    }
}

/// Call opcode classification used by CHA.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Where control continues once a finally body completes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(tag = "kind", content = "block", rename_all = "snake_case")]
pub(crate) enum ResumeTarget {
    Block(u32),
    Return,
    Rethrow,
}
