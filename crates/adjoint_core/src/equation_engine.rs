use crate::autodiff::{Tape, Var};
use crate::error::{check_len, Result, SolveError};
use crate::traits::DifferentiableFunction;
use std::cell::RefCell;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of tape variables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    /// Indices correspond to the order variables were defined (e.g., 0=x, 1=y).
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pushes the current time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Exp,
    Ln,
    Tanh,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

const BALANCED: &str = "compiled bytecode keeps the stack balanced";

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `record` takes all necessary context and a reusable
/// stack buffer.
pub struct VM;

impl VM {
    /// Replays the bytecode on a tape, one node per operation.
    pub fn record(
        bytecode: &Bytecode,
        tape: &mut Tape,
        t: Var,
        vars: &[Var],
        params: &[Var],
        stack: &mut Vec<Var>,
    ) -> Var {
        stack.clear();

        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(val) => tape.constant(val),
                OpCode::LoadVar(idx) => vars[idx],
                OpCode::LoadParam(idx) => params[idx],
                OpCode::LoadTime => t,
                OpCode::Neg | OpCode::Sin | OpCode::Cos | OpCode::Exp | OpCode::Ln | OpCode::Tanh => {
                    let a = stack.pop().expect(BALANCED);
                    match *op {
                        OpCode::Neg => tape.neg(a),
                        OpCode::Sin => tape.sin(a),
                        OpCode::Cos => tape.cos(a),
                        OpCode::Exp => tape.exp(a),
                        OpCode::Ln => tape.ln(a),
                        _ => tape.tanh(a),
                    }
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop().expect(BALANCED);
                    let a = stack.pop().expect(BALANCED);
                    match *op {
                        OpCode::Add => tape.add(a, b),
                        OpCode::Sub => tape.sub(a, b),
                        OpCode::Mul => tape.mul(a, b),
                        OpCode::Div => tape.div(a, b),
                        _ => tape.powf(a, b),
                    }
                }
            };
            stack.push(value);
        }

        match stack.pop() {
            Some(v) => v,
            None => tape.constant(0.0),
        }
    }
}

// --- AST & Compiler ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves names to state variables first, then parameters, then the time symbol `t`.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map, param_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if name == "t" {
                    ops.push(OpCode::LoadTime);
                } else {
                    return Err(SolveError::Compile(format!(
                        "Unknown variable or parameter: {name}"
                    )));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(SolveError::Compile(format!(
                            "Unknown binary operator: {op}"
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(SolveError::Compile(format!(
                            "Unknown unary operator: {op}"
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "ln" => OpCode::Ln,
                    "tanh" => OpCode::Tanh,
                    _ => {
                        return Err(SolveError::Compile(format!("Unknown function: {func}")))
                    }
                });
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(SolveError::Compile(format!(
            "Unexpected trailing token {token:?} in '{input}'"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| SolveError::Compile(format!("Malformed number: {num_str}")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => {
                    return Err(SolveError::Compile(format!(
                        "Unexpected character '{c}' in '{input}'"
                    )))
                }
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_sum(&mut self) -> Result<Expr> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Caret) = self.peek() {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), '^', Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_sum()?;
                    self.expect_close()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                self.expect_close()?;
                Ok(expr)
            }
            other => Err(SolveError::Compile(format!("Unexpected token {other:?}"))),
        }
    }

    fn expect_close(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(SolveError::Compile("Expected ')'".to_string())),
        }
    }
}

// --- EquationSystem ---

/// Right-hand side built from one compiled expression per state variable.
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub params: Vec<f64>,
    // Reused VM stack; makes the system !Sync.
    var_stack: RefCell<Vec<Var>>,
}

impl EquationSystem {
    pub fn new(equations: Vec<Bytecode>, params: Vec<f64>) -> Self {
        Self {
            equations,
            params,
            var_stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    /// Parses and compiles `equations` (one per entry of `var_names`).
    pub fn compile(
        var_names: &[String],
        param_names: &[String],
        equations: &[&str],
        params: Vec<f64>,
    ) -> Result<Self> {
        check_len("equations", var_names.len(), equations.len())?;
        check_len("parameter values", param_names.len(), params.len())?;
        let compiler = Compiler::new(var_names, param_names);
        let bytecodes = equations
            .iter()
            .map(|eq| parse(eq).and_then(|expr| compiler.compile(&expr)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(bytecodes, params))
    }
}

impl DifferentiableFunction for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn num_parameters(&self) -> usize {
        self.params.len()
    }

    fn parameters(&self) -> Vec<f64> {
        self.params.clone()
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        check_len("parameters", self.params.len(), params.len())?;
        self.params.copy_from_slice(params);
        Ok(())
    }

    fn record(&self, tape: &mut Tape, t: Var, u: &[Var], params: &[Var]) -> Result<Vec<Var>> {
        check_len("state", self.equations.len(), u.len())?;
        check_len("parameters", self.params.len(), params.len())?;
        let mut stack = self.var_stack.borrow_mut();
        Ok(self
            .equations
            .iter()
            .map(|eq| VM::record(eq, tape, t, u, params, &mut stack))
            .collect())
    }
}
