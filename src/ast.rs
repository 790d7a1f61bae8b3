//! Syntax tree built by the parser for a single compile. It is consumed by the
//! compiler and dropped as soon as the instruction list has been emitted.

use std::fmt;

use crate::{diagnostics::CodeLocation, value::Primitive};

#[derive(Debug, Clone)]
pub struct Script {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: CodeLocation,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Var {
        name: String,
        annotation: Option<TypeName>,
        initializer: Option<Expr>,
    },
    Assign {
        target: Target,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        condition: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Function(FunctionDecl),
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub annotation: Option<TypeName>,
    pub location: CodeLocation,
}

/// Something a script can assign to or increment.
#[derive(Debug, Clone)]
pub enum Target {
    Variable(String),
    /// `receiver.name`; a receiver naming a template is a static property.
    Property { receiver: Box<Expr>, name: String },
}

/// A template name written after `:` in a declaration.
#[derive(Debug, Clone)]
pub struct TypeName {
    pub name: String,
    pub location: CodeLocation,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: CodeLocation,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Primitive),
    Variable(String),
    SystemMacro(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `receiver.name(args)`; a receiver naming a template becomes a static call.
    Member {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `receiver.name` read through a getter.
    Property {
        receiver: Box<Expr>,
        name: String,
    },
    New {
        template: String,
        args: Vec<Expr>,
    },
    /// `++x`, `x++`, `--x`, `x--`, also on properties.
    Update {
        target: Target,
        delta: f64,
        prefix: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinaryOp {
    /// Binding strength; larger binds tighter. All binary operators are left-associative.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Multiply | Self::Divide | Self::Modulo => 10,
            Self::Add | Self::Subtract => 9,
            Self::ShiftLeft | Self::ShiftRight => 8,
            Self::Less | Self::LessEqual | Self::Greater | Self::GreaterEqual => 7,
            Self::Equal | Self::NotEqual => 6,
            Self::BitAnd => 5,
            Self::BitXor => 4,
            Self::BitOr => 3,
            Self::And => 2,
            Self::Or => 1,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::ShiftLeft => "<<",
            Self::ShiftRight => ">>",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::And => "&&",
            Self::Or => "||",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
        }
    }

    pub fn is_short_circuit(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Not => f.write_str("!"),
            Self::Negate => f.write_str("-"),
        }
    }
}
