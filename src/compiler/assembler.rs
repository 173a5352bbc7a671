//! The line-oriented assembly front end.
//!
//! Assembly is processed in two passes. The first pass walks the source
//! collecting label addresses and `.const` declarations; the second
//! parses instructions with every symbol already resolvable, so forward
//! references cost nothing and the emitted program never contains a
//! symbolic operand.

use std::collections::HashMap;

use crate::compiler::CompileError;
use crate::vm::{Instruction, Opcode, Operand, Program, SourceKind, Value};

pub struct Assembler {
    labels: HashMap<String, usize>,
    constants: Vec<Value>,
    constant_names: HashMap<String, usize>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            labels: HashMap::new(),
            constants: Vec::new(),
            constant_names: HashMap::new(),
        }
    }

    pub fn assemble(mut self, source: &str) -> Result<Program, CompileError> {
        // First pass: labels and constants. Only real instructions
        // consume addresses.
        let mut pending: Vec<(usize, &str)> = Vec::new();
        let mut address = 0;

        for (index, raw) in source.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            if line.starts_with(".const") {
                self.declare_constant(line, line_number)?;
            } else if let Some(name) = line.strip_suffix(':') {
                let name = name.trim();
                if !is_identifier(name) {
                    return Err(CompileError::new(
                        line_number,
                        format!("malformed label name: {:?}", name),
                    ));
                }
                if self.labels.contains_key(name) {
                    return Err(CompileError::new(
                        line_number,
                        format!("duplicate label: {}", name),
                    ));
                }
                self.labels.insert(name.to_string(), address);
            } else {
                pending.push((line_number, line));
                address += 1;
            }
        }

        // Second pass: parse instructions with labels resolved.
        let mut instructions = Vec::with_capacity(pending.len());
        for (line_number, line) in pending {
            instructions.push(self.parse_instruction(line, line_number)?);
        }

        Ok(Program::new(
            instructions,
            self.constants,
            source,
            SourceKind::Assembly,
        ))
    }

    fn declare_constant(&mut self, line: &str, line_number: usize) -> Result<(), CompileError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 || parts[0] != ".const" {
            return Err(CompileError::new(
                line_number,
                "constant declaration must be: .const NAME VALUE",
            ));
        }

        let name = parts[1];
        if !is_identifier(name) {
            return Err(CompileError::new(
                line_number,
                format!("malformed constant name: {:?}", name),
            ));
        }
        if self.constant_names.contains_key(name) {
            return Err(CompileError::new(
                line_number,
                format!("duplicate constant: {}", name),
            ));
        }

        let value = parse_value(parts[2]).ok_or_else(|| {
            CompileError::new(line_number, format!("malformed constant value: {}", parts[2]))
        })?;
        let index = self.add_constant(value);
        self.constant_names.insert(name.to_string(), index);
        Ok(())
    }

    fn parse_instruction(
        &mut self,
        line: &str,
        line_number: usize,
    ) -> Result<Instruction, CompileError> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        let opcode = Opcode::from_mnemonic(&parts[0].to_uppercase()).ok_or_else(|| {
            CompileError::new(line_number, format!("unknown opcode: {}", parts[0]))
        })?;

        if opcode.takes_operand() && parts.len() < 2 {
            return Err(CompileError::new(
                line_number,
                format!("{} requires an operand", opcode),
            ));
        }
        if !opcode.takes_operand() && parts.len() > 1 {
            return Err(CompileError::new(
                line_number,
                format!("{} takes no operand", opcode),
            ));
        }
        if parts.len() > 2 {
            return Err(CompileError::new(
                line_number,
                format!("unexpected token: {}", parts[2]),
            ));
        }

        let operand = if parts.len() == 2 {
            let operand = self.parse_operand(parts[1], line_number)?;
            // Only PUSH may reach into the constant pool; every other
            // operand slot carries a plain integer.
            if opcode != Opcode::Push && matches!(operand, Operand::Const(_)) {
                return Err(CompileError::new(
                    line_number,
                    format!("{} requires an integer or label operand", opcode),
                ));
            }
            Some(operand)
        } else {
            None
        };

        Ok(Instruction::new(opcode, operand))
    }

    fn parse_operand(&mut self, token: &str, line_number: usize) -> Result<Operand, CompileError> {
        if let Some(&address) = self.labels.get(token) {
            return Ok(Operand::Literal(address as i64));
        }
        if let Some(&index) = self.constant_names.get(token) {
            return Ok(Operand::Const(index));
        }
        if let Ok(n) = token.parse::<i64>() {
            return Ok(Operand::Literal(n));
        }
        if let Some(value) = parse_value(token) {
            return Ok(Operand::Const(self.add_constant(value)));
        }
        Err(CompileError::new(
            line_number,
            format!("unknown label or malformed operand: {}", token),
        ))
    }

    /// Add a constant to the pool, reusing an existing equal entry.
    fn add_constant(&mut self, value: Value) -> usize {
        for (index, existing) in self.constants.iter().enumerate() {
            if existing == &value {
                return index;
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a literal token: float, boolean, or quoted string. Plain
/// integers are handled earlier so they stay inline.
fn parse_value(token: &str) -> Option<Value> {
    if let Ok(n) = token.parse::<i64>() {
        return Some(Value::Integer(n));
    }
    if let Ok(x) = token.parse::<f64>() {
        return Some(Value::Float(x));
    }
    match token {
        "true" => return Some(Value::Boolean(true)),
        "false" => return Some(Value::Boolean(false)),
        _ => {}
    }
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        return Some(Value::String(token[1..token.len() - 1].to_string()));
    }
    None
}
