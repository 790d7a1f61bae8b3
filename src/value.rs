use std::{fmt, sync::Arc};

use crate::{
    ast::{BinaryOp, UnaryOp},
    diagnostics::Diagnostic,
};

/// Index of an object template inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub(crate) u32);

impl TemplateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a host object living in a thread's heap. A handle outlived by
/// its object never reaches the slot's next occupant: the generation differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub handle: u32,
    pub generation: u32,
    pub template: TemplateId,
}

/// The only value type the VM manipulates.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Primitive {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    Object(ObjectRef),
}

impl Primitive {
    pub fn string(value: impl Into<Arc<str>>) -> Self {
        Self::String(value.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Boolean(_) => "Boolean",
            Self::Number(_) => "Number",
            Self::String(_) => "String",
            Self::Object(_) => "Object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(object) => Some(*object),
            _ => None,
        }
    }

    pub fn expect_bool(&self, context: &str) -> Result<bool, Diagnostic> {
        self.as_bool().ok_or_else(|| {
            Diagnostic::runtime(format!(
                "{context} expects a Boolean, found {}",
                self.type_name()
            ))
        })
    }

    pub fn expect_number(&self, context: &str) -> Result<f64, Diagnostic> {
        self.as_number().ok_or_else(|| {
            Diagnostic::runtime(format!(
                "{context} expects a Number, found {}",
                self.type_name()
            ))
        })
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Primitive, Diagnostic> {
        match (op, self) {
            (UnaryOp::Not, Self::Boolean(value)) => Ok(Self::Boolean(!value)),
            (UnaryOp::Negate, Self::Number(value)) => Ok(Self::Number(-value)),
            _ => Err(Diagnostic::runtime(format!(
                "cannot apply `{op}` to {}",
                self.type_name()
            ))),
        }
    }

    /// Applies a binary operator. Object operands are only accepted by `==` and `!=`;
    /// the executor renders objects to strings itself before string concatenation.
    pub fn binary(&self, op: BinaryOp, rhs: &Primitive) -> Result<Primitive, Diagnostic> {
        use BinaryOp as Op;
        match op {
            Op::Equal => return Ok(Self::Boolean(self == rhs)),
            Op::NotEqual => return Ok(Self::Boolean(self != rhs)),
            _ => {}
        }

        match (self, rhs) {
            (Self::Number(a), Self::Number(b)) => numeric(op, *a, *b),
            (Self::String(a), Self::String(b)) => match op {
                Op::Add => Ok(Self::string(format!("{a}{b}"))),
                Op::Less => Ok(Self::Boolean(a < b)),
                Op::LessEqual => Ok(Self::Boolean(a <= b)),
                Op::Greater => Ok(Self::Boolean(a > b)),
                Op::GreaterEqual => Ok(Self::Boolean(a >= b)),
                _ => Err(incompatible(op, self, rhs)),
            },
            (Self::String(a), other @ (Self::Number(_) | Self::Boolean(_) | Self::Null))
                if op == Op::Add =>
            {
                Ok(Self::string(format!("{a}{other}")))
            }
            (other @ (Self::Number(_) | Self::Boolean(_) | Self::Null), Self::String(b))
                if op == Op::Add =>
            {
                Ok(Self::string(format!("{other}{b}")))
            }
            (Self::Boolean(a), Self::Boolean(b)) => match op {
                Op::And | Op::BitAnd => Ok(Self::Boolean(*a && *b)),
                Op::Or | Op::BitOr => Ok(Self::Boolean(*a || *b)),
                Op::BitXor => Ok(Self::Boolean(a ^ b)),
                _ => Err(incompatible(op, self, rhs)),
            },
            _ => Err(incompatible(op, self, rhs)),
        }
    }
}

fn numeric(op: BinaryOp, a: f64, b: f64) -> Result<Primitive, Diagnostic> {
    use BinaryOp as Op;
    let value = match op {
        Op::Add => Primitive::Number(a + b),
        Op::Subtract => Primitive::Number(a - b),
        Op::Multiply => Primitive::Number(a * b),
        Op::Divide | Op::Modulo if b == 0.0 => {
            return Err(Diagnostic::runtime(if op == Op::Divide {
                "division by zero"
            } else {
                "modulo by zero"
            }));
        }
        Op::Divide => Primitive::Number(a / b),
        Op::Modulo => Primitive::Number(a % b),
        Op::Less => Primitive::Boolean(a < b),
        Op::LessEqual => Primitive::Boolean(a <= b),
        Op::Greater => Primitive::Boolean(a > b),
        Op::GreaterEqual => Primitive::Boolean(a >= b),
        Op::ShiftLeft | Op::ShiftRight | Op::BitAnd | Op::BitOr | Op::BitXor => {
            let (Some(x), Some(y)) = (integral(a), integral(b)) else {
                return Err(Diagnostic::runtime(format!(
                    "`{op}` requires integral operands, found {a} and {b}"
                )));
            };
            let result = match op {
                Op::ShiftLeft | Op::ShiftRight => {
                    if !(0..64).contains(&y) {
                        return Err(Diagnostic::runtime(format!(
                            "shift amount {y} is out of range"
                        )));
                    }
                    if op == Op::ShiftLeft { x << y } else { x >> y }
                }
                Op::BitAnd => x & y,
                Op::BitOr => x | y,
                _ => x ^ y,
            };
            Primitive::Number(result as f64)
        }
        Op::And | Op::Or | Op::Equal | Op::NotEqual => {
            return Err(Diagnostic::runtime(format!(
                "cannot apply `{op}` to Number and Number"
            )));
        }
    };
    Ok(value)
}

fn integral(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0).then_some(value as i64)
}

fn incompatible(op: BinaryOp, lhs: &Primitive, rhs: &Primitive) -> Diagnostic {
    Diagnostic::runtime(format!(
        "cannot apply `{op}` to {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Renders a number without a trailing `.0` when it is integral.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Number(value) => f.write_str(&format_number(*value)),
            Self::String(value) => f.write_str(value),
            Self::Object(object) => write!(f, "<object #{}>", object.handle),
        }
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Primitive {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Self::string(value)
    }
}

impl From<ObjectRef> for Primitive {
    fn from(value: ObjectRef) -> Self {
        Self::Object(value)
    }
}
