use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};

use crate::descriptor::method_shape;
use crate::ir::{EdgeKind, InstructionKind, Method, Program};

/// Read and validate the program document at `path`.
pub(crate) fn load_program(path: &Path) -> Result<Program> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let program = parse_program(BufReader::new(file))
        .with_context(|| format!("invalid input document {}", path.display()))?;
    Ok(program)
}

/// Deserialize a program document, reporting the JSON path of the first bad value.
pub(crate) fn parse_program<R: Read>(reader: R) -> Result<Program> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let program: Program = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| anyhow!("at `{}`: {}", err.path(), err.inner()))?;
    validate(&program)?;
    Ok(program)
}

fn validate(program: &Program) -> Result<()> {
    let mut seen = BTreeSet::new();
    for method in &program.methods {
        if !seen.insert(&method.id) {
            bail!("method {} is declared twice", method.id);
        }
        validate_method(method).with_context(|| format!("method {}", method.id))?;
    }
    Ok(())
}

fn validate_method(method: &Method) -> Result<()> {
    method_shape(&method.id.descriptor, method.access.is_static)?;

    let mut starts = BTreeSet::new();
    for block in &method.cfg.blocks {
        if !starts.insert(block.start_offset) {
            bail!("block {} is declared twice", block.start_offset);
        }
    }
    for edge in &method.cfg.edges {
        if !starts.contains(&edge.from) || !starts.contains(&edge.to) {
            bail!(
                "edge {} -> {} references an unknown block",
                edge.from,
                edge.to
            );
        }
    }

    for block in &method.cfg.blocks {
        let last = block.instructions.len().saturating_sub(1);
        for (index, instruction) in block.instructions.iter().enumerate() {
            if instruction.kind.is_terminator() && index != last {
                bail!(
                    "{} at offset {} must end its block",
                    instruction.kind.name(),
                    instruction.offset
                );
            }
            if let InstructionKind::Invoke { call } = &instruction.kind {
                method_shape(&call.descriptor, false).with_context(|| {
                    format!("call at offset {}", instruction.offset)
                })?;
            }
        }
        let branches = block
            .instructions
            .last()
            .is_some_and(|instruction| matches!(instruction.kind, InstructionKind::Branch));
        let has_true_edge = method
            .cfg
            .edges
            .iter()
            .any(|edge| edge.from == block.start_offset && edge.kind == EdgeKind::BranchTrue);
        if branches && !has_true_edge {
            bail!("branch block {} has no true edge", block.start_offset);
        }
    }
    Ok(())
}
