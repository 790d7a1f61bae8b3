use std::{fmt, fmt::Write as _, sync::Arc};

use crate::{
    ast::{BinaryOp, UnaryOp},
    diagnostics::CodeLocation,
    lexer::escape,
    registry::{CallHolder, CallTarget, PropertyTarget},
    value::{Primitive, TemplateId},
};

/// A single VM operation. Jump operands are absolute instruction offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Push(Primitive),
    Pop,
    Dup,
    Load(usize),
    Store(usize),
    LoadGlobal(usize),
    StoreGlobal(usize),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Jump(usize),
    /// Pops a Boolean and jumps when it is false.
    JumpIfFalse(usize),
    /// Pops a Boolean and jumps when it is true.
    JumpIfTrue(usize),
    /// Peeks a Boolean; jumps keeping it when it equals `when`, pops it otherwise.
    ShortCircuit { when: bool, target: usize },
    /// Faults unless the top of the stack is a Boolean; leaves it in place.
    CheckBool,
    /// Pops a case value and compares it with the switch subject below it.
    /// On a match the subject is popped too and control jumps to `target`.
    SwitchJump(usize),
    Call {
        target: CallTarget,
        name: String,
        arity: usize,
    },
    /// Pushes a property read through its getter, popping the receiver first
    /// for instance properties.
    GetProperty {
        target: PropertyTarget,
        name: String,
    },
    /// Pops a value and hands it to the setter; instance setters then pop
    /// their receiver.
    SetProperty {
        target: PropertyTarget,
        name: String,
    },
    Return,
}

impl Instruction {
    /// Net operand-stack change, or `None` for control flow.
    pub fn stack_effect(&self) -> Option<isize> {
        let effect = match self {
            Self::Push(_) | Self::Dup | Self::Load(_) | Self::LoadGlobal(_) => 1,
            Self::Pop | Self::Store(_) | Self::StoreGlobal(_) | Self::Binary(_) => -1,
            Self::Unary(_) | Self::CheckBool => 0,
            Self::GetProperty { target, .. } => match target {
                PropertyTarget::Instance(_) => 0,
                PropertyTarget::Static(_) => 1,
            },
            Self::SetProperty { target, .. } => match target {
                PropertyTarget::Instance(_) => -2,
                PropertyTarget::Static(_) => -1,
            },
            Self::Call { target, arity, .. } => {
                let receiver = matches!(target, CallTarget::TemplateInstance(_)) as isize;
                1 - *arity as isize - receiver
            }
            Self::Jump(_)
            | Self::JumpIfFalse(_)
            | Self::JumpIfTrue(_)
            | Self::ShortCircuit { .. }
            | Self::SwitchJump(_)
            | Self::Return => return None,
        };
        Some(effect)
    }

    pub(crate) fn set_jump_target(&mut self, destination: usize) {
        match self {
            Self::Jump(target)
            | Self::JumpIfFalse(target)
            | Self::JumpIfTrue(target)
            | Self::SwitchJump(target)
            | Self::ShortCircuit { target, .. } => *target = destination,
            _ => {}
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(Primitive::String(text)) => write!(f, "push \"{}\"", escape(text)),
            Self::Push(value) => write!(f, "push {value}"),
            Self::Pop => f.write_str("pop"),
            Self::Dup => f.write_str("dup"),
            Self::Load(slot) => write!(f, "load ${slot}"),
            Self::Store(slot) => write!(f, "store ${slot}"),
            Self::LoadGlobal(slot) => write!(f, "load_global ${slot}"),
            Self::StoreGlobal(slot) => write!(f, "store_global ${slot}"),
            Self::Unary(op) => write!(f, "unary {op}"),
            Self::Binary(op) => write!(f, "binary {op}"),
            Self::Jump(target) => write!(f, "jump @{target}"),
            Self::JumpIfFalse(target) => write!(f, "jump_if_false @{target}"),
            Self::JumpIfTrue(target) => write!(f, "jump_if_true @{target}"),
            Self::ShortCircuit { when, target } => write!(f, "short_circuit {when} @{target}"),
            Self::CheckBool => f.write_str("check_bool"),
            Self::SwitchJump(target) => write!(f, "switch_jump @{target}"),
            Self::Call {
                target,
                name,
                arity,
            } => write!(f, "call {name}/{arity} [{target}]"),
            Self::GetProperty { target, name } => write!(f, "get {name} [{target}]"),
            Self::SetProperty { target, name } => write!(f, "set {name} [{target}]"),
            Self::Return => f.write_str("ret"),
        }
    }
}

/// Entry point information for a declared script function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub arity: usize,
    pub entry: usize,
    pub locals: usize,
    pub location: CodeLocation,
}

/// A variable declared at the top level of a script. Its functions see it too.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInfo {
    pub name: String,
    /// Template statically known to be held by the variable.
    pub template: Option<TemplateId>,
    pub location: CodeLocation,
}

/// Output of one compile: an immutable instruction list plus debug info.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) name: Arc<str>,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) locations: Vec<CodeLocation>,
    pub(crate) functions: Vec<FunctionInfo>,
    pub(crate) function_table: CallHolder<usize>,
    pub(crate) globals: Vec<GlobalInfo>,
    pub(crate) main_locals: usize,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Source location recorded for the instruction at `offset`.
    pub fn location_at(&self, offset: usize) -> Option<&CodeLocation> {
        self.locations.get(offset)
    }

    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    pub fn function(&self, name: &str, arity: usize) -> Option<&FunctionInfo> {
        let id = *self.function_table.lookup(name, arity)?;
        self.functions.get(id)
    }

    /// Instruction offset of the first declared overload of `name`.
    pub fn function_offset(&self, name: &str) -> Option<usize> {
        self.functions
            .iter()
            .find(|function| function.name == name)
            .map(|function| function.entry)
    }

    pub fn globals(&self) -> &[GlobalInfo] {
        &self.globals
    }

    pub fn global_slot(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|global| global.name == name)
    }

    pub fn main_locals(&self) -> usize {
        self.main_locals
    }

    /// Human-readable listing with one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut listing = String::new();
        let _ = writeln!(listing, "; program {}", self.name);
        if !self.globals.is_empty() {
            let names = self
                .globals
                .iter()
                .map(|global| global.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(listing, "; globals: {names}");
        }
        for (offset, instruction) in self.instructions.iter().enumerate() {
            if let Some(function) = self.functions.iter().find(|f| f.entry == offset) {
                let _ = writeln!(
                    listing,
                    "\n{}/{} (locals: {}):",
                    function.name, function.arity, function.locals
                );
            }
            let text = instruction.to_string();
            match self.locations.get(offset) {
                Some(location) => {
                    let _ = writeln!(
                        listing,
                        "{offset:04}  {text:<32} ; {}:{}",
                        location.line, location.column
                    );
                }
                None => {
                    let _ = writeln!(listing, "{offset:04}  {text}");
                }
            }
        }
        listing
    }
}
