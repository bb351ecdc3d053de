use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::dataflow::context::AnalysisConfig;
use crate::engine::Environment;
use crate::ir::{
    BasicBlock, BinaryOp, CallKind, CallSite, ClassInfo, Constant, ControlFlowGraph, EdgeKind,
    FieldInfo, FieldRef, FlowEdge, Instruction, InstructionKind, Method, MethodAccess, MethodId,
    MethodNullness, Nullness, Program,
};

/// Builds one method body block by block.
///
/// Instructions of a block get consecutive offsets starting at the block
/// offset; line numbers mirror offsets so findings stay easy to locate.
pub(crate) struct MethodBuilder {
    method: Method,
}

impl MethodBuilder {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            method: Method {
                id: MethodId::new(owner, name, descriptor),
                access: MethodAccess::default(),
                nullness: MethodNullness::default(),
                contract: None,
                pure: false,
                cfg: ControlFlowGraph {
                    blocks: Vec::new(),
                    edges: Vec::new(),
                },
            },
        }
    }

    pub(crate) fn static_method(mut self) -> Self {
        self.method.access.is_static = true;
        self
    }

    pub(crate) fn varargs(mut self) -> Self {
        self.method.access.is_varargs = true;
        self
    }

    pub(crate) fn param_nullness(mut self, nullness: Vec<Nullness>) -> Self {
        self.method.nullness.parameter_nullness = nullness;
        self
    }

    pub(crate) fn returns(mut self, nullness: Nullness) -> Self {
        self.method.nullness.return_nullness = nullness;
        self
    }

    pub(crate) fn contract(mut self, contract: &str) -> Self {
        self.method.contract = Some(contract.to_string());
        self
    }

    pub(crate) fn block(mut self, start: u32, kinds: Vec<InstructionKind>) -> Self {
        let instructions = kinds
            .into_iter()
            .zip(start..)
            .map(|(kind, offset)| Instruction {
                offset,
                line: Some(offset + 1),
                kind,
            })
            .collect();
        self.method.cfg.blocks.push(BasicBlock {
            start_offset: start,
            instructions,
        });
        self
    }

    pub(crate) fn edge(mut self, from: u32, to: u32, kind: EdgeKind) -> Self {
        self.method.cfg.edges.push(FlowEdge { from, to, kind });
        self
    }

    pub(crate) fn build(self) -> Method {
        self.method
    }
}

/// Builds a whole program plus the session environment for it.
#[derive(Default)]
pub(crate) struct ProgramBuilder {
    program: Program,
    config: AnalysisConfig,
}

impl ProgramBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn class(mut self, class: ClassInfo) -> Self {
        self.program.classes.push(class);
        self
    }

    pub(crate) fn class_named(self, name: &str, super_name: Option<&str>) -> Self {
        self.class(ClassInfo {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            is_interface: false,
            fields: Vec::new(),
            source_file: None,
        })
    }

    /// Adds a field to `owner`, declaring the class when it is missing.
    pub(crate) fn field(mut self, owner: &str, field: FieldInfo) -> Self {
        if !self.program.classes.iter().any(|class| class.name == owner) {
            self = self.class_named(owner, None);
        }
        if let Some(class) = self
            .program
            .classes
            .iter_mut()
            .find(|class| class.name == owner)
        {
            class.fields.push(field);
        }
        self
    }

    pub(crate) fn method(mut self, method: Method) -> Self {
        self.program.methods.push(method);
        self
    }

    pub(crate) fn config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn program(self) -> Program {
        self.program
    }

    pub(crate) fn environment(self) -> Environment {
        Environment::new(&self.program, self.config)
    }
}

/// Input document written to a temporary directory.
pub(crate) struct InputFile {
    #[allow(dead_code)]
    temp_dir: TempDir,
    path: PathBuf,
}

impl InputFile {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn write_input(contents: &str) -> Result<InputFile> {
    let temp_dir = tempfile::tempdir().context("create temp dir")?;
    let path = temp_dir.path().join("program.json");
    fs::write(&path, contents).context("write input document")?;
    Ok(InputFile { temp_dir, path })
}

pub(crate) fn load(index: u16) -> InstructionKind {
    InstructionKind::Load { index }
}

pub(crate) fn store(index: u16) -> InstructionKind {
    InstructionKind::Store { index }
}

pub(crate) fn push_null() -> InstructionKind {
    InstructionKind::Push {
        value: Constant::Null,
    }
}

pub(crate) fn push_int(value: i64) -> InstructionKind {
    InstructionKind::Push {
        value: Constant::Int(value),
    }
}

pub(crate) fn push_bool(value: bool) -> InstructionKind {
    InstructionKind::Push {
        value: Constant::Bool(value),
    }
}

pub(crate) fn binary(operator: BinaryOp) -> InstructionKind {
    InstructionKind::Binary { operator }
}

pub(crate) fn branch() -> InstructionKind {
    InstructionKind::Branch
}

pub(crate) fn new(class: &str) -> InstructionKind {
    InstructionKind::New {
        class: class.to_string(),
    }
}

pub(crate) fn check_cast(class: &str) -> InstructionKind {
    InstructionKind::CheckCast {
        class: class.to_string(),
    }
}

pub(crate) fn get_field(owner: &str, name: &str) -> InstructionKind {
    InstructionKind::GetField {
        field: FieldRef {
            owner: owner.to_string(),
            name: name.to_string(),
        },
    }
}

pub(crate) fn put_field(owner: &str, name: &str) -> InstructionKind {
    InstructionKind::PutField {
        field: FieldRef {
            owner: owner.to_string(),
            name: name.to_string(),
        },
    }
}

fn invoke(kind: CallKind, owner: &str, name: &str, descriptor: &str) -> InstructionKind {
    InstructionKind::Invoke {
        call: CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
        },
    }
}

pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
    invoke(CallKind::Static, owner, name, descriptor)
}

pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
    invoke(CallKind::Virtual, owner, name, descriptor)
}

pub(crate) fn invoke_interface(owner: &str, name: &str, descriptor: &str) -> InstructionKind {
    invoke(CallKind::Interface, owner, name, descriptor)
}

pub(crate) fn ret() -> InstructionKind {
    InstructionKind::Return
}

pub(crate) fn ret_void() -> InstructionKind {
    InstructionKind::ReturnVoid
}

pub(crate) fn throw() -> InstructionKind {
    InstructionKind::Throw
}
