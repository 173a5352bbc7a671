//! The arithmetic-expression front end.
//!
//! A small recursive-descent parser with the usual precedence ladder
//! (`* / %` over `+ -`, parentheses, unary minus) that emits stack code
//! directly: operands push, operators pop two and push one, and the
//! sequence ends in HALT.

use crate::compiler::CompileError;
use crate::vm::{Instruction, Opcode, Operand, Program, SourceKind, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

/// A token with the 1-based column it started at.
type Spanned = (Token, usize);

pub fn compile_expression(source: &str) -> Result<Program, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens);
    parser.expression()?;
    if let Some((_, column)) = parser.peek() {
        return Err(CompileError::new(
            1,
            format!("unexpected trailing token at column {}", column),
        ));
    }
    parser.emit(Opcode::Halt, None);

    Ok(Program::new(
        parser.instructions,
        parser.constants,
        source,
        SourceKind::Expression,
    ))
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(index, ch)) = chars.peek() {
        let column = index + 1;
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push((Token::Plus, column));
            }
            '-' => {
                chars.next();
                tokens.push((Token::Minus, column));
            }
            '*' => {
                chars.next();
                tokens.push((Token::Star, column));
            }
            '/' => {
                chars.next();
                tokens.push((Token::Slash, column));
            }
            '%' => {
                chars.next();
                tokens.push((Token::Percent, column));
            }
            '(' => {
                chars.next();
                tokens.push((Token::LParen, column));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, column));
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if is_float {
                    Token::Float(text.parse::<f64>().map_err(|_| {
                        CompileError::new(1, format!("malformed number at column {}", column))
                    })?)
                } else {
                    Token::Int(text.parse::<i64>().map_err(|_| {
                        CompileError::new(1, format!("malformed number at column {}", column))
                    })?)
                };
                tokens.push((token, column));
            }
            other => {
                return Err(CompileError::new(
                    1,
                    format!("unexpected character {:?} at column {}", other, column),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            instructions: Vec::new(),
            constants: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.peek().map(|(t, _)| t) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn emit(&mut self, opcode: Opcode, operand: Option<Operand>) {
        self.instructions.push(Instruction::new(opcode, operand));
    }

    fn add_constant(&mut self, value: Value) -> usize {
        for (index, existing) in self.constants.iter().enumerate() {
            if existing == &value {
                return index;
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    // Expression parsing with precedence climbing

    fn expression(&mut self) -> Result<(), CompileError> {
        self.add_expr()
    }

    fn add_expr(&mut self) -> Result<(), CompileError> {
        self.mul_expr()?;

        loop {
            let opcode = if self.match_token(&Token::Plus) {
                Opcode::Add
            } else if self.match_token(&Token::Minus) {
                Opcode::Sub
            } else {
                break;
            };

            self.mul_expr()?;
            self.emit(opcode, None);
        }

        Ok(())
    }

    fn mul_expr(&mut self) -> Result<(), CompileError> {
        self.unary()?;

        loop {
            let opcode = if self.match_token(&Token::Star) {
                Opcode::Mul
            } else if self.match_token(&Token::Slash) {
                Opcode::Div
            } else if self.match_token(&Token::Percent) {
                Opcode::Mod
            } else {
                break;
            };

            self.unary()?;
            self.emit(opcode, None);
        }

        Ok(())
    }

    fn unary(&mut self) -> Result<(), CompileError> {
        if self.match_token(&Token::Minus) {
            // Negation as 0 - x keeps the operand stack discipline.
            self.emit(Opcode::Push, Some(Operand::Literal(0)));
            self.unary()?;
            self.emit(Opcode::Sub, None);
            return Ok(());
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<(), CompileError> {
        match self.advance() {
            Some((Token::Int(n), _)) => {
                self.emit(Opcode::Push, Some(Operand::Literal(n)));
                Ok(())
            }
            Some((Token::Float(x), _)) => {
                let index = self.add_constant(Value::Float(x));
                self.emit(Opcode::Push, Some(Operand::Const(index)));
                Ok(())
            }
            Some((Token::LParen, column)) => {
                self.expression()?;
                if !self.match_token(&Token::RParen) {
                    return Err(CompileError::new(
                        1,
                        format!("unclosed parenthesis opened at column {}", column),
                    ));
                }
                Ok(())
            }
            Some((token, column)) => Err(CompileError::new(
                1,
                format!("unexpected {:?} at column {}", token, column),
            )),
            None => Err(CompileError::new(1, "unexpected end of expression")),
        }
    }
}
