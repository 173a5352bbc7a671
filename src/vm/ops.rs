/// Bytecode operations for the ember machine.
///
/// The opcode set is a closed enum: the step function matches on it
/// exhaustively, so adding an opcode without execution semantics is a
/// compile error rather than a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Stack manipulation
    Push,
    Pop,
    Dup,
    Swap,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Bitwise / logical
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Control flow
    Jmp,
    JmpIfTrue,
    JmpIfFalse,
    Call,
    Ret,

    // Locals and memory
    Load,
    Store,

    // Objects and arrays
    NewObject,
    GetField,
    SetField,
    NewArray,
    ArrayGet,
    ArraySet,
    ArrayLen,

    // Misc
    Nop,
    Halt,
}

impl Opcode {
    /// Canonical assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::Eq => "EQ",
            Opcode::Ne => "NE",
            Opcode::Lt => "LT",
            Opcode::Le => "LE",
            Opcode::Gt => "GT",
            Opcode::Ge => "GE",
            Opcode::Jmp => "JMP",
            Opcode::JmpIfTrue => "JT",
            Opcode::JmpIfFalse => "JF",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::Load => "LOAD",
            Opcode::Store => "STORE",
            Opcode::NewObject => "NEW",
            Opcode::GetField => "GET_FIELD",
            Opcode::SetField => "SET_FIELD",
            Opcode::NewArray => "NEW_ARRAY",
            Opcode::ArrayGet => "GET_ARRAY",
            Opcode::ArraySet => "SET_ARRAY",
            Opcode::ArrayLen => "LEN",
            Opcode::Nop => "NOP",
            Opcode::Halt => "HALT",
        }
    }

    /// Parse an upper-cased mnemonic, including the historical aliases.
    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        match mnemonic {
            "PUSH" => Some(Opcode::Push),
            "POP" => Some(Opcode::Pop),
            "DUP" | "DUPLICATE" => Some(Opcode::Dup),
            "SWAP" => Some(Opcode::Swap),
            "ADD" => Some(Opcode::Add),
            "SUB" | "SUBTRACT" => Some(Opcode::Sub),
            "MUL" | "MULTIPLY" => Some(Opcode::Mul),
            "DIV" | "DIVIDE" => Some(Opcode::Div),
            "MOD" | "MODULO" => Some(Opcode::Mod),
            "AND" => Some(Opcode::And),
            "OR" => Some(Opcode::Or),
            "XOR" => Some(Opcode::Xor),
            "NOT" => Some(Opcode::Not),
            "SHL" | "SHIFT_LEFT" => Some(Opcode::Shl),
            "SHR" | "SHIFT_RIGHT" => Some(Opcode::Shr),
            "EQ" | "EQUAL" => Some(Opcode::Eq),
            "NE" | "NOT_EQUAL" => Some(Opcode::Ne),
            "LT" | "LESS" => Some(Opcode::Lt),
            "LE" | "LESS_EQUAL" => Some(Opcode::Le),
            "GT" | "GREATER" => Some(Opcode::Gt),
            "GE" | "GREATER_EQUAL" => Some(Opcode::Ge),
            "JMP" | "JUMP" => Some(Opcode::Jmp),
            "JT" | "JUMP_TRUE" => Some(Opcode::JmpIfTrue),
            "JF" | "JUMP_FALSE" => Some(Opcode::JmpIfFalse),
            "CALL" => Some(Opcode::Call),
            "RET" | "RETURN" => Some(Opcode::Ret),
            "LOAD" => Some(Opcode::Load),
            "STORE" => Some(Opcode::Store),
            "NEW" | "NEW_OBJECT" => Some(Opcode::NewObject),
            "GET_FIELD" => Some(Opcode::GetField),
            "SET_FIELD" => Some(Opcode::SetField),
            "NEW_ARRAY" => Some(Opcode::NewArray),
            "GET_ARRAY" => Some(Opcode::ArrayGet),
            "SET_ARRAY" => Some(Opcode::ArraySet),
            "LEN" | "LENGTH" => Some(Opcode::ArrayLen),
            "NOP" | "NO_OP" => Some(Opcode::Nop),
            "HALT" => Some(Opcode::Halt),
            _ => None,
        }
    }

    /// Whether the opcode carries an operand in its instruction slot.
    pub fn takes_operand(self) -> bool {
        matches!(
            self,
            Opcode::Push
                | Opcode::Jmp
                | Opcode::JmpIfTrue
                | Opcode::JmpIfFalse
                | Opcode::Call
                | Opcode::Load
                | Opcode::Store
                | Opcode::NewObject
                | Opcode::GetField
                | Opcode::SetField
                | Opcode::NewArray
        )
    }

    /// Whether the opcode sets the program counter itself when executed.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::JmpIfTrue | Opcode::JmpIfFalse | Opcode::Call | Opcode::Ret
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_roundtrip() {
        let opcodes = [
            Opcode::Push,
            Opcode::Add,
            Opcode::Jmp,
            Opcode::JmpIfFalse,
            Opcode::GetField,
            Opcode::Halt,
        ];

        for opcode in opcodes {
            assert_eq!(Opcode::from_mnemonic(opcode.mnemonic()), Some(opcode));
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!(Opcode::from_mnemonic("SUBTRACT"), Some(Opcode::Sub));
        assert_eq!(Opcode::from_mnemonic("JUMP_TRUE"), Some(Opcode::JmpIfTrue));
        assert_eq!(Opcode::from_mnemonic("LENGTH"), Some(Opcode::ArrayLen));
        assert_eq!(Opcode::from_mnemonic("FROB"), None);
    }

    #[test]
    fn test_operand_arity() {
        assert!(Opcode::Push.takes_operand());
        assert!(Opcode::Call.takes_operand());
        assert!(!Opcode::Add.takes_operand());
        assert!(!Opcode::Ret.takes_operand());
    }
}
