use std::collections::HashMap;
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::vm::metrics::PerformanceMetrics;
use crate::vm::ops::Opcode;
use crate::vm::profiler::{ExecutionProfiler, JitProfile};
use crate::vm::value::{Value, floor_div};
use crate::vm::{Fault, Instruction, Operand, Program, SourceKind};

/// A call frame: return address plus the frame's local slots.
#[derive(Debug)]
struct Frame {
    return_address: usize,
    locals: HashMap<i64, Value>,
}

/// Lifecycle of a loaded machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Running,
    Halted,
    Faulted,
}

/// An immutable snapshot of the machine, the sole interchange contract
/// with callers. `call_stack` exposes return addresses only; frame-local
/// slots and the object table are interior bookkeeping.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub stack: Vec<Value>,
    pub memory: HashMap<i64, Value>,
    pub program_counter: usize,
    pub call_stack: Vec<usize>,
    pub running: bool,
    pub halted: bool,
    pub error: Option<Fault>,
    pub instruction_count: u64,
    pub execution_time_ms: f64,
}

/// One trace record: the executed instruction bracketed by state snapshots.
#[derive(Debug, Clone)]
pub struct ExecutionStep {
    pub instruction: Instruction,
    pub state_before: MachineState,
    pub state_after: MachineState,
    /// Offset of the step's start from the beginning of the run, in ms.
    pub timestamp_ms: f64,
    /// Cumulative wall-clock time at the end of this step, in ms.
    pub elapsed_ms: f64,
}

/// Everything a completed run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: MachineState,
    pub trace: Vec<ExecutionStep>,
    pub profile: JitProfile,
    pub metrics: PerformanceMetrics,
}

/// What a single fetch-execute round did.
enum StepEvent {
    /// An instruction at `pc` was executed. For JT/JF, `branch` records
    /// whether the branch was taken.
    Executed { pc: usize, branch: Option<bool> },
    /// The machine reached HALT or ran off the end of the program.
    Finished,
    /// The machine was already halted; nothing happened.
    Idle,
}

/// Whether the executed instruction already set the program counter.
struct Effect {
    pc_set: bool,
    branch: Option<bool>,
}

impl Effect {
    fn advance() -> Self {
        Effect {
            pc_set: false,
            branch: None,
        }
    }

    fn jumped() -> Self {
        Effect {
            pc_set: true,
            branch: None,
        }
    }
}

/// The bytecode interpreter.
///
/// One machine owns one program and all of its mutable state; nothing is
/// shared between machines, so independent sessions never interfere.
pub struct Machine {
    program: Program,
    config: RuntimeConfig,
    stack: Vec<Value>,
    memory: HashMap<i64, Value>,
    frames: Vec<Frame>,
    objects: Vec<Vec<Value>>,
    pc: usize,
    running: bool,
    halted: bool,
    fault: Option<Fault>,
    instruction_count: u64,
    execution_time_ms: f64,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            program: Program::new(Vec::new(), Vec::new(), "", SourceKind::Assembly),
            config,
            stack: Vec::with_capacity(1024),
            memory: HashMap::new(),
            frames: Vec::new(),
            objects: Vec::new(),
            pc: 0,
            running: false,
            halted: false,
            fault: None,
            instruction_count: 0,
            execution_time_ms: 0.0,
        }
    }

    /// Replace the active program and reset all execution state.
    pub fn load(&mut self, program: Program) {
        self.program = program;
        self.reset();
    }

    /// Return the machine to its initial state, keeping the loaded program.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.memory.clear();
        self.frames.clear();
        self.objects.clear();
        self.pc = 0;
        self.running = false;
        self.halted = false;
        self.fault = None;
        self.instruction_count = 0;
        self.execution_time_ms = 0.0;
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_counter(&self) -> usize {
        self.pc
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn stack_top(&self) -> Option<&Value> {
        self.stack.last()
    }

    pub fn status(&self) -> Status {
        if self.fault.is_some() {
            Status::Faulted
        } else if self.halted {
            Status::Halted
        } else if self.running {
            Status::Running
        } else {
            Status::Ready
        }
    }

    /// Snapshot the current state.
    pub fn state(&self) -> MachineState {
        MachineState {
            stack: self.stack.clone(),
            memory: self.memory.clone(),
            program_counter: self.pc,
            call_stack: self.frames.iter().map(|f| f.return_address).collect(),
            running: self.running,
            halted: self.halted,
            error: self.fault.clone(),
            instruction_count: self.instruction_count,
            execution_time_ms: self.execution_time_ms,
        }
    }

    /// Execute exactly one instruction.
    ///
    /// On a halted machine this is a no-op. A fault is recorded into the
    /// state (forcing the terminal `Faulted` status) and also returned.
    pub fn step(&mut self) -> Result<(), Fault> {
        match self.step_inner() {
            Ok(_) => Ok(()),
            Err(fault) => {
                self.fail(fault.clone());
                Err(fault)
            }
        }
    }

    /// Run to completion, recording a full execution trace and profile.
    pub fn run(&mut self) -> RunReport {
        self.run_with_cancel(|| false)
    }

    /// Run to completion, checking `cancel` between instructions.
    ///
    /// Cancellation never interrupts an instruction mid-flight: the check
    /// sits at the top of the loop, so the machine is always left with a
    /// valid program counter and an intact stack.
    pub fn run_with_cancel(&mut self, mut cancel: impl FnMut() -> bool) -> RunReport {
        let mut profiler = ExecutionProfiler::new(self.config.jit_threshold);
        let mut trace = Vec::new();
        let started = Instant::now();

        while !self.halted {
            if cancel() {
                break;
            }
            if self.instruction_count >= self.config.max_instructions {
                self.fail(Fault::InstructionBudgetExceeded(self.config.max_instructions));
                break;
            }

            let timestamp_ms = started.elapsed().as_secs_f64() * 1000.0;
            let state_before = self.state();

            match self.step_inner() {
                Ok(StepEvent::Executed { pc, branch }) => {
                    let instruction = self.program.instructions[pc].clone();
                    profiler.record_visit(pc);
                    if let Some(taken) = branch {
                        profiler.record_branch(pc, taken);
                    }
                    if self.config.trace_jit
                        && profiler.visit_count(pc) == self.config.jit_threshold + 1
                    {
                        eprintln!(
                            "[JIT] hot pc detected: {} (visits: {})",
                            pc,
                            profiler.visit_count(pc)
                        );
                    }

                    self.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                    trace.push(ExecutionStep {
                        instruction,
                        state_before,
                        state_after: self.state(),
                        timestamp_ms,
                        elapsed_ms: self.execution_time_ms,
                    });
                }
                Ok(_) => {}
                Err(fault) => self.fail(fault),
            }
        }

        self.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        let profile = profiler.finish(&self.program.instructions);
        let state = self.state();
        let metrics = PerformanceMetrics::from_run(&state, &profile);

        RunReport {
            state,
            trace,
            profile,
            metrics,
        }
    }

    fn fail(&mut self, fault: Fault) {
        self.fault = Some(fault);
        self.halted = true;
        self.running = false;
    }

    fn step_inner(&mut self) -> Result<StepEvent, Fault> {
        if self.halted {
            return Ok(StepEvent::Idle);
        }

        // Running off the end of the program is a normal terminal state,
        // not a fault: no instruction executes and the count is unchanged.
        if self.pc >= self.program.instructions.len() {
            self.running = false;
            self.halted = true;
            return Ok(StepEvent::Finished);
        }

        let instruction = self.program.instructions[self.pc].clone();

        // HALT is terminal bookkeeping, not work: it is neither counted
        // nor traced.
        if instruction.opcode == Opcode::Halt {
            self.running = false;
            self.halted = true;
            return Ok(StepEvent::Finished);
        }

        self.running = true;
        let pc = self.pc;
        let effect = self.execute(&instruction)?;
        if !effect.pc_set {
            self.pc += 1;
        }
        self.instruction_count += 1;

        Ok(StepEvent::Executed {
            pc,
            branch: effect.branch,
        })
    }

    fn execute(&mut self, instruction: &Instruction) -> Result<Effect, Fault> {
        match instruction.opcode {
            Opcode::Push => {
                let value = match instruction.operand {
                    Some(Operand::Literal(n)) => Value::Integer(n),
                    Some(Operand::Const(index)) => self
                        .program
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            Fault::InvalidOperand(format!(
                                "constant index {} out of bounds (pool size: {})",
                                index,
                                self.program.constants.len()
                            ))
                        })?,
                    None => {
                        return Err(Fault::InvalidOperand(
                            "PUSH requires an operand".to_string(),
                        ));
                    }
                };
                self.stack.push(value);
                Ok(Effect::advance())
            }
            Opcode::Pop => {
                self.pop()?;
                Ok(Effect::advance())
            }
            Opcode::Dup => {
                let top = self.stack.last().cloned().ok_or(Fault::StackUnderflow)?;
                self.stack.push(top);
                Ok(Effect::advance())
            }
            Opcode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
                Ok(Effect::advance())
            }

            Opcode::Add => self.arith("ADD", |a, b| Ok(a.wrapping_add(b)), |a, b| Ok(a + b)),
            Opcode::Sub => self.arith("SUB", |a, b| Ok(a.wrapping_sub(b)), |a, b| Ok(a - b)),
            Opcode::Mul => self.arith("MUL", |a, b| Ok(a.wrapping_mul(b)), |a, b| Ok(a * b)),
            Opcode::Div => self.arith(
                "DIV",
                |a, b| {
                    if b == 0 {
                        Err(Fault::DivideByZero)
                    } else {
                        Ok(floor_div(a, b))
                    }
                },
                |a, b| {
                    if b == 0.0 {
                        Err(Fault::DivideByZero)
                    } else {
                        Ok(a / b)
                    }
                },
            ),
            Opcode::Mod => {
                let (a, b) = self.pop_pair()?;
                match (&a, &b) {
                    (Value::Integer(x), Value::Integer(y)) => {
                        if *y == 0 {
                            return Err(Fault::DivideByZero);
                        }
                        self.stack.push(Value::Integer(x.wrapping_rem(*y)));
                        Ok(Effect::advance())
                    }
                    _ => Err(Self::mismatch("MOD", &a, &b)),
                }
            }

            Opcode::And => self.bitwise("AND", |a, b| a & b, |a, b| a && b),
            Opcode::Or => self.bitwise("OR", |a, b| a | b, |a, b| a || b),
            Opcode::Xor => self.bitwise("XOR", |a, b| a ^ b, |a, b| a != b),
            Opcode::Not => {
                let value = self.pop()?;
                let result = match value {
                    Value::Integer(n) => Value::Integer(!n),
                    Value::Boolean(b) => Value::Boolean(!b),
                    other => {
                        return Err(Fault::TypeMismatch {
                            operation: "NOT",
                            found: other.type_name().to_string(),
                        });
                    }
                };
                self.stack.push(result);
                Ok(Effect::advance())
            }
            Opcode::Shl | Opcode::Shr => {
                let shift = self.pop()?;
                let value = self.pop()?;
                match (&value, &shift) {
                    (Value::Integer(v), Value::Integer(s)) => {
                        // The shift amount is masked to 0..63.
                        let result = if instruction.opcode == Opcode::Shl {
                            v.wrapping_shl(*s as u32)
                        } else {
                            v.wrapping_shr(*s as u32)
                        };
                        self.stack.push(Value::Integer(result));
                        Ok(Effect::advance())
                    }
                    _ => Err(Self::mismatch("SHIFT", &value, &shift)),
                }
            }

            Opcode::Eq => self.equality("EQ", false),
            Opcode::Ne => self.equality("NE", true),
            Opcode::Lt => self.order("LT", |a, b| a < b, |a, b| a < b),
            Opcode::Le => self.order("LE", |a, b| a <= b, |a, b| a <= b),
            Opcode::Gt => self.order("GT", |a, b| a > b, |a, b| a > b),
            Opcode::Ge => self.order("GE", |a, b| a >= b, |a, b| a >= b),

            Opcode::Jmp => {
                self.pc = self.jump_target(instruction)?;
                Ok(Effect::jumped())
            }
            Opcode::JmpIfTrue | Opcode::JmpIfFalse => {
                let condition = self.pop()?;
                let Some(flag) = condition.as_boolean() else {
                    return Err(Fault::TypeMismatch {
                        operation: "conditional jump",
                        found: condition.type_name().to_string(),
                    });
                };
                let taken = if instruction.opcode == Opcode::JmpIfTrue {
                    flag
                } else {
                    !flag
                };
                if taken {
                    self.pc = self.jump_target(instruction)?;
                }
                Ok(Effect {
                    pc_set: taken,
                    branch: Some(taken),
                })
            }
            Opcode::Call => {
                let target = self.jump_target(instruction)?;
                self.frames.push(Frame {
                    return_address: self.pc + 1,
                    locals: HashMap::new(),
                });
                self.pc = target;
                Ok(Effect::jumped())
            }
            Opcode::Ret => {
                let frame = self.frames.pop().ok_or(Fault::CallStackUnderflow)?;
                self.pc = frame.return_address;
                Ok(Effect::jumped())
            }

            Opcode::Load => {
                let slot = Self::literal_operand(instruction)?;
                let value = match self.frames.last() {
                    Some(frame) => frame.locals.get(&slot).cloned(),
                    None => self.memory.get(&slot).cloned(),
                };
                let value = value.ok_or_else(|| {
                    Fault::InvalidOperand(format!("load from uninitialized slot {}", slot))
                })?;
                self.stack.push(value);
                Ok(Effect::advance())
            }
            Opcode::Store => {
                let slot = Self::literal_operand(instruction)?;
                let value = self.pop()?;
                match self.frames.last_mut() {
                    Some(frame) => {
                        frame.locals.insert(slot, value);
                    }
                    None => {
                        self.memory.insert(slot, value);
                    }
                }
                Ok(Effect::advance())
            }

            Opcode::NewObject => {
                let field_count = Self::index_operand(instruction)?;
                let handle = self.objects.len();
                self.objects.push(vec![Value::Integer(0); field_count]);
                self.stack.push(Value::Object(handle));
                Ok(Effect::advance())
            }
            Opcode::GetField => {
                let index = Self::literal_operand(instruction)?;
                let target = self.pop()?;
                let fields = self.object_fields(&target)?;
                let value = Self::field_at(fields, index)?.clone();
                self.stack.push(value);
                Ok(Effect::advance())
            }
            Opcode::SetField => {
                let index = Self::literal_operand(instruction)?;
                let value = self.pop()?;
                let target = self.pop()?;
                let handle = match &target {
                    Value::Object(handle) => *handle,
                    other => {
                        return Err(Fault::TypeMismatch {
                            operation: "SET_FIELD",
                            found: other.type_name().to_string(),
                        });
                    }
                };
                let fields = self.objects.get_mut(handle).ok_or_else(|| {
                    Fault::InvalidOperand(format!("dangling object handle {}", handle))
                })?;
                if index < 0 || index as usize >= fields.len() {
                    return Err(Fault::FieldIndexOutOfRange {
                        index,
                        len: fields.len(),
                    });
                }
                fields[index as usize] = value;
                Ok(Effect::advance())
            }

            Opcode::NewArray => {
                let count = Self::index_operand(instruction)?;
                if self.stack.len() < count {
                    return Err(Fault::StackUnderflow);
                }
                let items = self.stack.split_off(self.stack.len() - count);
                self.stack.push(Value::Array(items));
                Ok(Effect::advance())
            }
            Opcode::ArrayGet => {
                let index_value = self.pop()?;
                let array = self.pop()?;
                let (items, index) = Self::array_index(&array, &index_value)?;
                self.stack.push(items[index].clone());
                Ok(Effect::advance())
            }
            Opcode::ArraySet => {
                let value = self.pop()?;
                let index_value = self.pop()?;
                let array = self.pop()?;
                let (items, index) = Self::array_index(&array, &index_value)?;
                // Values are immutable: push an updated copy.
                let mut items = items.to_vec();
                items[index] = value;
                self.stack.push(Value::Array(items));
                Ok(Effect::advance())
            }
            Opcode::ArrayLen => {
                let value = self.pop()?;
                let len = match &value {
                    Value::Array(items) => items.len(),
                    Value::String(s) => s.len(),
                    other => {
                        return Err(Fault::TypeMismatch {
                            operation: "LEN",
                            found: other.type_name().to_string(),
                        });
                    }
                };
                self.stack.push(Value::Integer(len as i64));
                Ok(Effect::advance())
            }

            Opcode::Nop => Ok(Effect::advance()),

            // HALT is intercepted by the step loop; reaching it here means
            // a hand-built caller invoked execute directly, so just halt.
            Opcode::Halt => {
                self.running = false;
                self.halted = true;
                Ok(Effect::jumped())
            }
        }
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    /// Pop the right operand first, then the left.
    fn pop_pair(&mut self) -> Result<(Value, Value), Fault> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn mismatch(operation: &'static str, a: &Value, b: &Value) -> Fault {
        Fault::TypeMismatch {
            operation,
            found: format!("{} and {}", a.type_name(), b.type_name()),
        }
    }

    fn arith(
        &mut self,
        operation: &'static str,
        int_op: fn(i64, i64) -> Result<i64, Fault>,
        float_op: fn(f64, f64) -> Result<f64, Fault>,
    ) -> Result<Effect, Fault> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => Value::Integer(int_op(*x, *y)?),
            (Value::Float(x), Value::Float(y)) => Value::Float(float_op(*x, *y)?),
            (Value::Integer(x), Value::Float(y)) => Value::Float(float_op(*x as f64, *y)?),
            (Value::Float(x), Value::Integer(y)) => Value::Float(float_op(*x, *y as f64)?),
            _ => return Err(Self::mismatch(operation, &a, &b)),
        };
        self.stack.push(result);
        Ok(Effect::advance())
    }

    fn bitwise(
        &mut self,
        operation: &'static str,
        int_op: fn(i64, i64) -> i64,
        bool_op: fn(bool, bool) -> bool,
    ) -> Result<Effect, Fault> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => Value::Integer(int_op(*x, *y)),
            (Value::Boolean(x), Value::Boolean(y)) => Value::Boolean(bool_op(*x, *y)),
            _ => return Err(Self::mismatch(operation, &a, &b)),
        };
        self.stack.push(result);
        Ok(Effect::advance())
    }

    fn equality(&mut self, operation: &'static str, negate: bool) -> Result<Effect, Fault> {
        let (a, b) = self.pop_pair()?;
        let equal = match (&a, &b) {
            (Value::Integer(x), Value::Float(y)) | (Value::Float(y), Value::Integer(x)) => {
                (*x as f64) == *y
            }
            _ if a.type_name() == b.type_name() => a == b,
            _ => return Err(Self::mismatch(operation, &a, &b)),
        };
        self.stack.push(Value::Boolean(equal != negate));
        Ok(Effect::advance())
    }

    fn order(
        &mut self,
        operation: &'static str,
        int_test: fn(i64, i64) -> bool,
        float_test: fn(f64, f64) -> bool,
    ) -> Result<Effect, Fault> {
        let (a, b) = self.pop_pair()?;
        let result = match (&a, &b) {
            (Value::Integer(x), Value::Integer(y)) => int_test(*x, *y),
            (Value::Float(x), Value::Float(y)) => float_test(*x, *y),
            (Value::Integer(x), Value::Float(y)) => float_test(*x as f64, *y),
            (Value::Float(x), Value::Integer(y)) => float_test(*x, *y as f64),
            _ => return Err(Self::mismatch(operation, &a, &b)),
        };
        self.stack.push(Value::Boolean(result));
        Ok(Effect::advance())
    }

    fn literal_operand(instruction: &Instruction) -> Result<i64, Fault> {
        match instruction.operand {
            Some(Operand::Literal(n)) => Ok(n),
            Some(Operand::Const(_)) => Err(Fault::InvalidOperand(format!(
                "{} cannot take a constant-pool operand",
                instruction.opcode
            ))),
            None => Err(Fault::InvalidOperand(format!(
                "{} requires an operand",
                instruction.opcode
            ))),
        }
    }

    fn index_operand(instruction: &Instruction) -> Result<usize, Fault> {
        let n = Self::literal_operand(instruction)?;
        if n < 0 {
            return Err(Fault::InvalidOperand(format!(
                "{} requires a non-negative operand, got {}",
                instruction.opcode, n
            )));
        }
        Ok(n as usize)
    }

    /// Validate a jump target. Targeting one past the last instruction is
    /// allowed (the machine halts as program-end on the next step).
    fn jump_target(&self, instruction: &Instruction) -> Result<usize, Fault> {
        let target = Self::literal_operand(instruction)?;
        if target < 0 || target as usize > self.program.instructions.len() {
            return Err(Fault::InvalidJumpTarget(target));
        }
        Ok(target as usize)
    }

    fn object_fields(&self, target: &Value) -> Result<&[Value], Fault> {
        match target {
            Value::Object(handle) => self
                .objects
                .get(*handle)
                .map(|fields| fields.as_slice())
                .ok_or_else(|| {
                    Fault::InvalidOperand(format!("dangling object handle {}", handle))
                }),
            other => Err(Fault::TypeMismatch {
                operation: "GET_FIELD",
                found: other.type_name().to_string(),
            }),
        }
    }

    fn field_at(fields: &[Value], index: i64) -> Result<&Value, Fault> {
        if index < 0 || index as usize >= fields.len() {
            return Err(Fault::FieldIndexOutOfRange {
                index,
                len: fields.len(),
            });
        }
        Ok(&fields[index as usize])
    }

    fn array_index<'a>(
        array: &'a Value,
        index_value: &Value,
    ) -> Result<(&'a [Value], usize), Fault> {
        let Value::Array(items) = array else {
            return Err(Fault::TypeMismatch {
                operation: "array access",
                found: array.type_name().to_string(),
            });
        };
        let Some(index) = index_value.as_integer() else {
            return Err(Fault::TypeMismatch {
                operation: "array index",
                found: index_value.type_name().to_string(),
            });
        };
        if index < 0 || index as usize >= items.len() {
            return Err(Fault::FieldIndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        Ok((items.as_slice(), index as usize))
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(instructions: Vec<Instruction>) -> Program {
        Program::new(instructions, vec![], "", SourceKind::Assembly)
    }

    fn run_code(instructions: Vec<Instruction>) -> Result<Vec<Value>, Fault> {
        let mut machine = Machine::new();
        machine.load(program(instructions));
        let report = machine.run();
        match report.state.error {
            Some(fault) => Err(fault),
            None => Ok(report.state.stack),
        }
    }

    fn push(n: i64) -> Instruction {
        Instruction::new(Opcode::Push, Some(Operand::Literal(n)))
    }

    fn op(opcode: Opcode) -> Instruction {
        Instruction::new(opcode, None)
    }

    fn with_operand(opcode: Opcode, n: i64) -> Instruction {
        Instruction::new(opcode, Some(Operand::Literal(n)))
    }

    #[test]
    fn test_push_add() {
        let stack = run_code(vec![push(1), push(2), op(Opcode::Add), op(Opcode::Halt)]).unwrap();
        assert_eq!(stack, vec![Value::Integer(3)]);
    }

    #[test]
    fn test_push_from_constant_pool() {
        let mut machine = Machine::new();
        machine.load(Program::new(
            vec![
                Instruction::new(Opcode::Push, Some(Operand::Const(0))),
                op(Opcode::Halt),
            ],
            vec![Value::Float(2.5)],
            "",
            SourceKind::Assembly,
        ));
        let report = machine.run();
        assert_eq!(report.state.stack, vec![Value::Float(2.5)]);
    }

    #[test]
    fn test_floor_division() {
        let stack = run_code(vec![push(-7), push(2), op(Opcode::Div), op(Opcode::Halt)]).unwrap();
        assert_eq!(stack, vec![Value::Integer(-4)]);
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_float() {
        let mut machine = Machine::new();
        machine.load(Program::new(
            vec![
                push(1),
                Instruction::new(Opcode::Push, Some(Operand::Const(0))),
                op(Opcode::Add),
                op(Opcode::Halt),
            ],
            vec![Value::Float(0.5)],
            "",
            SourceKind::Assembly,
        ));
        assert_eq!(machine.run().state.stack, vec![Value::Float(1.5)]);
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let fault = run_code(vec![push(10), push(0), op(Opcode::Div), op(Opcode::Halt)])
            .unwrap_err();
        assert_eq!(fault, Fault::DivideByZero);
    }

    #[test]
    fn test_pop_empty_stack_faults() {
        let fault = run_code(vec![op(Opcode::Pop), op(Opcode::Halt)]).unwrap_err();
        assert_eq!(fault, Fault::StackUnderflow);
    }

    #[test]
    fn test_swap_and_dup() {
        let stack = run_code(vec![
            push(1),
            push(2),
            op(Opcode::Swap),
            op(Opcode::Dup),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(
            stack,
            vec![Value::Integer(2), Value::Integer(1), Value::Integer(1)]
        );
    }

    #[test]
    fn test_bitwise_integers_and_booleans() {
        let stack = run_code(vec![push(0b1100), push(0b1010), op(Opcode::And), op(Opcode::Halt)])
            .unwrap();
        assert_eq!(stack, vec![Value::Integer(0b1000)]);

        let stack = run_code(vec![
            push(1),
            push(0),
            op(Opcode::Gt),
            push(0),
            push(1),
            op(Opcode::Gt),
            op(Opcode::Or),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Boolean(true)]);
    }

    #[test]
    fn test_bitwise_mixed_tags_fault() {
        let fault = run_code(vec![
            push(1),
            push(1),
            op(Opcode::Gt),
            push(3),
            op(Opcode::And),
            op(Opcode::Halt),
        ])
        .unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn test_shifts() {
        let stack = run_code(vec![push(1), push(4), op(Opcode::Shl), op(Opcode::Halt)]).unwrap();
        assert_eq!(stack, vec![Value::Integer(16)]);

        let stack = run_code(vec![push(-16), push(2), op(Opcode::Shr), op(Opcode::Halt)]).unwrap();
        assert_eq!(stack, vec![Value::Integer(-4)]);
    }

    #[test]
    fn test_conditional_jump_requires_boolean() {
        let fault = run_code(vec![
            push(1),
            with_operand(Opcode::JmpIfTrue, 0),
            op(Opcode::Halt),
        ])
        .unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn test_jump_skips() {
        let stack = run_code(vec![
            with_operand(Opcode::Jmp, 2),
            push(111),
            push(7),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(7)]);
    }

    #[test]
    fn test_invalid_jump_target_faults() {
        let fault = run_code(vec![with_operand(Opcode::Jmp, 99), op(Opcode::Halt)]).unwrap_err();
        assert_eq!(fault, Fault::InvalidJumpTarget(99));
    }

    #[test]
    fn test_call_and_ret() {
        // 0: CALL 3 / 1: PUSH 10 / 2: HALT / 3: PUSH 32 / 4: RET
        let stack = run_code(vec![
            with_operand(Opcode::Call, 3),
            push(10),
            op(Opcode::Halt),
            push(32),
            op(Opcode::Ret),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(32), Value::Integer(10)]);
    }

    #[test]
    fn test_ret_without_call_faults() {
        let fault = run_code(vec![op(Opcode::Ret), op(Opcode::Halt)]).unwrap_err();
        assert_eq!(fault, Fault::CallStackUnderflow);
    }

    #[test]
    fn test_top_level_store_populates_memory() {
        let mut machine = Machine::new();
        machine.load(program(vec![
            push(42),
            with_operand(Opcode::Store, 7),
            with_operand(Opcode::Load, 7),
            op(Opcode::Halt),
        ]));
        let report = machine.run();
        assert_eq!(report.state.stack, vec![Value::Integer(42)]);
        assert_eq!(report.state.memory.get(&7), Some(&Value::Integer(42)));
    }

    #[test]
    fn test_frame_locals_are_scoped() {
        // Top-level slot 0 and callee slot 0 must not collide.
        let stack = run_code(vec![
            push(1),
            with_operand(Opcode::Store, 0),
            with_operand(Opcode::Call, 5),
            with_operand(Opcode::Load, 0),
            op(Opcode::Halt),
            push(99),
            with_operand(Opcode::Store, 0),
            op(Opcode::Ret),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(1)]);
    }

    #[test]
    fn test_load_uninitialized_slot_faults() {
        let fault = run_code(vec![with_operand(Opcode::Load, 3), op(Opcode::Halt)]).unwrap_err();
        assert!(matches!(fault, Fault::InvalidOperand(_)));
    }

    #[test]
    fn test_object_fields() {
        let stack = run_code(vec![
            with_operand(Opcode::NewObject, 2),
            op(Opcode::Dup),
            push(41),
            with_operand(Opcode::SetField, 1),
            with_operand(Opcode::GetField, 1),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(41)]);
    }

    #[test]
    fn test_field_index_out_of_range() {
        let fault = run_code(vec![
            with_operand(Opcode::NewObject, 1),
            with_operand(Opcode::GetField, 5),
            op(Opcode::Halt),
        ])
        .unwrap_err();
        assert_eq!(fault, Fault::FieldIndexOutOfRange { index: 5, len: 1 });
    }

    #[test]
    fn test_get_field_on_non_object_faults() {
        let fault = run_code(vec![
            push(3),
            with_operand(Opcode::GetField, 0),
            op(Opcode::Halt),
        ])
        .unwrap_err();
        assert!(matches!(fault, Fault::TypeMismatch { .. }));
    }

    #[test]
    fn test_array_roundtrip() {
        let stack = run_code(vec![
            push(1),
            push(2),
            push(3),
            with_operand(Opcode::NewArray, 3),
            push(1),
            push(20),
            op(Opcode::ArraySet),
            push(1),
            op(Opcode::ArrayGet),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(20)]);
    }

    #[test]
    fn test_array_len() {
        let stack = run_code(vec![
            push(1),
            push(2),
            with_operand(Opcode::NewArray, 2),
            op(Opcode::ArrayLen),
            op(Opcode::Halt),
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Integer(2)]);
    }

    #[test]
    fn test_instruction_budget() {
        let mut machine = Machine::with_config(RuntimeConfig {
            max_instructions: 10,
            ..RuntimeConfig::default()
        });
        // Jump to self forever.
        machine.load(program(vec![with_operand(Opcode::Jmp, 0)]));
        let report = machine.run();
        assert_eq!(
            report.state.error,
            Some(Fault::InstructionBudgetExceeded(10))
        );
        assert!(report.state.halted);
        assert_eq!(machine.status(), Status::Faulted);
    }

    #[test]
    fn test_halt_is_not_counted() {
        let mut machine = Machine::new();
        machine.load(program(vec![push(1), op(Opcode::Halt)]));
        let report = machine.run();
        assert_eq!(report.state.instruction_count, 1);
        assert_eq!(report.trace.len(), 1);
        assert!(report.state.halted);
        assert!(!report.state.running);
    }

    #[test]
    fn test_program_end_halts_without_fault() {
        let mut machine = Machine::new();
        machine.load(program(vec![push(1)]));
        let report = machine.run();
        assert!(report.state.halted);
        assert_eq!(report.state.error, None);
        assert_eq!(report.state.instruction_count, 1);
    }

    #[test]
    fn test_step_after_halt_is_noop() {
        let mut machine = Machine::new();
        machine.load(program(vec![op(Opcode::Halt)]));
        machine.step().unwrap();
        assert!(machine.is_halted());

        machine.step().unwrap();
        assert_eq!(machine.instruction_count(), 0);
        assert_eq!(machine.program_counter(), 0);
    }

    #[test]
    fn test_status_lifecycle() {
        let mut machine = Machine::new();
        machine.load(program(vec![push(1), op(Opcode::Halt)]));
        assert_eq!(machine.status(), Status::Ready);

        machine.step().unwrap();
        assert_eq!(machine.status(), Status::Running);

        machine.step().unwrap();
        assert_eq!(machine.status(), Status::Halted);

        machine.reset();
        assert_eq!(machine.status(), Status::Ready);
    }

    #[test]
    fn test_fault_is_terminal_until_reset() {
        let mut machine = Machine::new();
        machine.load(program(vec![op(Opcode::Pop), push(1), op(Opcode::Halt)]));
        assert!(machine.step().is_err());
        assert_eq!(machine.status(), Status::Faulted);

        // Further steps must not execute anything.
        machine.step().unwrap();
        assert_eq!(machine.instruction_count(), 0);

        machine.reset();
        assert_eq!(machine.status(), Status::Ready);
        assert!(machine.fault().is_none());
    }

    #[test]
    fn test_cancellation_leaves_consistent_state() {
        let mut machine = Machine::new();
        machine.load(program(vec![with_operand(Opcode::Jmp, 0)]));
        let mut budget = 5;
        let report = machine.run_with_cancel(|| {
            budget -= 1;
            budget == 0
        });
        assert!(!report.state.halted);
        assert_eq!(report.state.error, None);
        assert_eq!(report.state.program_counter, 0);
    }

    #[test]
    fn test_trace_matches_instruction_count() {
        let mut machine = Machine::new();
        machine.load(program(vec![
            push(5),
            push(3),
            op(Opcode::Add),
            push(2),
            op(Opcode::Mul),
            op(Opcode::Halt),
        ]));
        let report = machine.run();
        assert_eq!(report.state.instruction_count, 5);
        assert_eq!(report.trace.len(), 5);
        assert_eq!(report.state.stack, vec![Value::Integer(16)]);

        // Snapshots bracket each instruction.
        let first = &report.trace[0];
        assert_eq!(first.state_before.stack.len(), 0);
        assert_eq!(first.state_after.stack.len(), 1);
    }
}
