//! Source front ends: line-oriented assembly and arithmetic expressions.

mod assembler;
mod expr;

pub use assembler::Assembler;

use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::RuntimeConfig;
use crate::vm::{Machine, Program, RunReport, SourceKind};

/// A compile-time error with the offending 1-based source line.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub line: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Compile source text into an immutable program.
pub fn compile(source: &str, kind: SourceKind) -> Result<Program, CompileError> {
    match kind {
        SourceKind::Assembly => Assembler::new().assemble(source),
        SourceKind::Expression => expr::compile_expression(source),
    }
}

/// Compile a file, inferring the source kind from its extension
/// (`.expr` is expression mode, everything else assembly).
pub fn compile_file(path: &Path) -> Result<Program, String> {
    let source =
        fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let kind = match path.extension().and_then(|ext| ext.to_str()) {
        Some("expr") => SourceKind::Expression,
        _ => SourceKind::Assembly,
    };
    compile(&source, kind).map_err(|e| e.to_string())
}

/// Compile and run source text on a fresh machine.
pub fn run_source(
    source: &str,
    kind: SourceKind,
    config: &RuntimeConfig,
) -> Result<RunReport, String> {
    let program = compile(source, kind).map_err(|e| e.to_string())?;
    let mut machine = Machine::with_config(config.clone());
    machine.load(program);
    Ok(machine.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Value;

    #[test]
    fn test_compile_dispatches_on_kind() {
        let program = compile("PUSH 1\nHALT", SourceKind::Assembly).unwrap();
        assert_eq!(program.source_kind, SourceKind::Assembly);

        let program = compile("1 + 2", SourceKind::Expression).unwrap();
        assert_eq!(program.source_kind, SourceKind::Expression);
    }

    #[test]
    fn test_run_source() {
        let report = run_source("PUSH 2\nPUSH 3\nMUL\nHALT", SourceKind::Assembly, &RuntimeConfig::default())
            .unwrap();
        assert_eq!(report.state.stack, vec![Value::Integer(6)]);
    }

    #[test]
    fn test_compile_error_display() {
        let error = compile("FROB 1\nHALT", SourceKind::Assembly).unwrap_err();
        assert!(error.to_string().starts_with("syntax error at line 1"));
    }
}
