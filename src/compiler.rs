use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::{
    ast::{BinaryOp, Expr, ExprKind, FunctionDecl, Script, Stmt, StmtKind, SwitchCase, Target, TypeName},
    bytecode::{FunctionInfo, GlobalInfo, Instruction, Program},
    diagnostics::{CodeLocation, Diagnostic},
    engine::Engine,
    environment::Environment,
    lexer,
    parser,
    preprocessor,
    registry::{CallHolder, CallTarget, PropertyTarget},
    template::ObjectTemplate,
    value::{Primitive, TemplateId},
};

/// Runs the whole front end over `source` and emits a [`Program`].
pub fn compile(engine: &Engine, name: &str, source: &str) -> Result<Program, Diagnostic> {
    compile_with_globals(engine, name, source, &[])
}

/// Like [`compile`], with `globals` already declared at the same slots.
/// A carried global may be declared again once by the new source.
pub fn compile_with_globals(
    engine: &Engine,
    name: &str,
    source: &str,
    globals: &[GlobalInfo],
) -> Result<Program, Diagnostic> {
    let tokens = lexer::tokenize(name, source)?;
    let tokens = preprocessor::preprocess(engine, tokens)?;
    let script = parser::parse_script(tokens)?;
    let mut compiler = Compiler::new(engine, name);
    for global in globals {
        compiler.globals.insert(
            global.name.clone(),
            Global {
                info: global.clone(),
                carried: true,
            },
        );
    }
    let program = compiler.compile_script(script)?;
    debug!(
        "compiled `{name}`: {} instructions, {} functions, {} globals",
        program.len(),
        program.functions().len(),
        program.globals().len()
    );
    Ok(program)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpKind {
    Loop,
    Switch,
}

/// Pending `break`/`continue` jumps of one enclosing loop or switch.
#[derive(Debug)]
struct JumpScope {
    kind: JumpKind,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Debug)]
struct Global {
    info: GlobalInfo,
    carried: bool,
}

/// Where a named variable lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Local(usize),
    Global(usize),
}

/// What the left side of `.` resolved to.
enum Receiver {
    Template(TemplateId),
    /// The receiver value has been pushed.
    Instance(TemplateId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(self) -> bool {
        self != Self::Write
    }

    fn writes(self) -> bool {
        self != Self::Read
    }
}

struct Compiler<'e> {
    engine: &'e Engine,
    name: Arc<str>,
    instructions: Vec<Instruction>,
    locations: Vec<CodeLocation>,
    functions: Vec<FunctionInfo>,
    function_table: CallHolder<usize>,
    globals: IndexMap<String, Global>,
    env: Environment,
    in_function: bool,
    jumps: Vec<JumpScope>,
    last_location: CodeLocation,
}

impl<'e> Compiler<'e> {
    fn new(engine: &'e Engine, name: &str) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            engine,
            last_location: CodeLocation::new(Arc::clone(&name), 1, 1),
            name,
            instructions: Vec::new(),
            locations: Vec::new(),
            functions: Vec::new(),
            function_table: CallHolder::new(),
            globals: IndexMap::new(),
            env: Environment::new(),
            in_function: false,
            jumps: Vec::new(),
        }
    }

    fn compile_script(mut self, script: Script) -> Result<Program, Diagnostic> {
        let mut declarations = Vec::new();
        let mut statements = Vec::new();
        for statement in script.statements {
            match statement.kind {
                StmtKind::Function(decl) => {
                    self.declare_function(&decl, &statement.location)?;
                    declarations.push((decl, statement.location));
                }
                _ => statements.push(statement),
            }
        }

        for statement in &statements {
            self.statement(statement)?;
        }
        self.implicit_return(statements.last());
        let main_locals = self.env.slot_count();

        for (id, (decl, location)) in declarations.iter().enumerate() {
            self.function_body(id, decl, location)?;
        }

        Ok(Program {
            name: self.name,
            instructions: self.instructions,
            locations: self.locations,
            functions: self.functions,
            function_table: self.function_table,
            globals: self.globals.into_values().map(|global| global.info).collect(),
            main_locals,
        })
    }

    fn declare_function(&mut self, decl: &FunctionDecl, location: &CodeLocation) -> Result<(), Diagnostic> {
        let arity = decl.params.len();
        if let Some(&existing) = self.function_table.lookup(&decl.name, arity) {
            let mut error = Diagnostic::compiler(
                format!("duplicate declaration of function `{}/{arity}`", decl.name),
                location.clone(),
            );
            if let Some(previous) = self.functions.get(existing) {
                error = error.with_note(format!("previously declared at {}", previous.location));
            }
            return Err(error);
        }
        if self.engine.builtin(&decl.name, arity).is_some() {
            return Err(Diagnostic::compiler(
                format!("function `{}/{arity}` collides with a host builtin", decl.name),
                location.clone(),
            ));
        }
        let id = self.functions.len();
        self.function_table
            .register(decl.name.clone(), arity, id)
            .map_err(|message| Diagnostic::compiler(message, location.clone()))?;
        self.functions.push(FunctionInfo {
            name: decl.name.clone(),
            arity,
            entry: 0,
            locals: 0,
            location: location.clone(),
        });
        Ok(())
    }

    /// Function bodies are compiled after the main body, so every global is
    /// already declared when they reference it.
    fn function_body(&mut self, id: usize, decl: &FunctionDecl, location: &CodeLocation) -> Result<(), Diagnostic> {
        self.env = Environment::new();
        self.in_function = true;
        self.jumps.clear();
        self.last_location = location.clone();
        let entry = self.instructions.len();
        for param in &decl.params {
            let template = self.annotation(param.annotation.as_ref())?;
            self.env.declare(&param.name, template, param.location.clone())?;
        }
        for statement in &decl.body {
            self.statement(statement)?;
        }
        self.implicit_return(decl.body.last());
        if let Some(info) = self.functions.get_mut(id) {
            info.entry = entry;
            info.locals = self.env.slot_count();
        }
        Ok(())
    }

    /// Falling off the end of a body returns `null`.
    fn implicit_return(&mut self, last: Option<&Stmt>) {
        if matches!(last, Some(Stmt { kind: StmtKind::Return(_), .. })) {
            return;
        }
        let location = self.last_location.clone();
        self.emit(Instruction::Push(Primitive::Null), &location);
        self.emit(Instruction::Return, &location);
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), Diagnostic> {
        let location = &stmt.location;
        match &stmt.kind {
            StmtKind::Var {
                name,
                annotation,
                initializer,
            } => {
                let declared = self.annotation(annotation.as_ref())?;
                let value = match initializer {
                    Some(expr) => self.expression(expr)?,
                    None => {
                        self.emit(Instruction::Push(Primitive::Null), location);
                        None
                    }
                };
                if let Some(expr) = initializer {
                    self.check_assignable(name, declared, value, &expr.location)?;
                }
                let variable = self.declare_variable(name, declared.or(value), location.clone())?;
                self.store(variable, location);
            }
            StmtKind::Assign { target, op, value } => match target {
                Target::Variable(name) => self.assignment(name, *op, value, location)?,
                Target::Property { receiver, name } => {
                    self.property_assignment(receiver, name, *op, value, location)?
                }
            },
            StmtKind::Expr(Expr {
                kind: ExprKind::Update { target, delta, .. },
                location,
            }) => self.update_in_place(target, *delta, location)?,
            StmtKind::Expr(expr) => {
                self.expression(expr)?;
                self.emit(Instruction::Pop, &expr.location);
            }
            StmtKind::Block(statements) => {
                self.env.push_scope();
                let result = statements.iter().try_for_each(|statement| self.statement(statement));
                self.env.pop_scope();
                result?;
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expression(condition)?;
                let to_else = self.emit(Instruction::JumpIfFalse(0), location);
                self.scoped(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let to_end = self.emit(Instruction::Jump(0), location);
                        self.patch(to_else);
                        self.scoped(else_branch)?;
                        self.patch(to_end);
                    }
                    None => self.patch(to_else),
                }
            }
            StmtKind::While { condition, body } => {
                let start = self.instructions.len();
                self.expression(condition)?;
                let exit = self.emit(Instruction::JumpIfFalse(0), location);
                self.jumps.push(JumpScope::new(JumpKind::Loop));
                let result = self.scoped(body);
                let scope = self.pop_jumps();
                result?;
                self.emit(Instruction::Jump(start), location);
                self.patch(exit);
                self.close_jumps(scope, start);
            }
            StmtKind::DoWhile { body, condition } => {
                let start = self.instructions.len();
                self.jumps.push(JumpScope::new(JumpKind::Loop));
                let result = self.scoped(body);
                let scope = self.pop_jumps();
                result?;
                let check = self.instructions.len();
                self.expression(condition)?;
                self.emit(Instruction::JumpIfTrue(start), location);
                self.close_jumps(scope, check);
            }
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                self.env.push_scope();
                let result = self.for_loop(init.as_deref(), condition.as_ref(), step.as_deref(), body, location);
                self.env.pop_scope();
                result?;
            }
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => self.switch(subject, cases, default.as_deref(), location)?,
            StmtKind::Break => {
                let at = self.instructions.len();
                let Some(scope) = self.jumps.last_mut() else {
                    return Err(Diagnostic::compiler(
                        "`break` outside of a loop or switch",
                        location.clone(),
                    ));
                };
                scope.breaks.push(at);
                self.emit(Instruction::Jump(0), location);
            }
            StmtKind::Continue => {
                let at = self.instructions.len();
                let Some(scope) = self.jumps.iter_mut().rev().find(|scope| scope.kind == JumpKind::Loop) else {
                    return Err(Diagnostic::compiler("`continue` outside of a loop", location.clone()));
                };
                scope.continues.push(at);
                self.emit(Instruction::Jump(0), location);
            }
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => {
                        self.expression(expr)?;
                    }
                    None => {
                        self.emit(Instruction::Push(Primitive::Null), location);
                    }
                }
                self.emit(Instruction::Return, location);
            }
            StmtKind::Function(decl) => {
                return Err(Diagnostic::compiler(
                    format!("function `{}` must be declared at the top level", decl.name),
                    location.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Compiles a branch or loop body in its own block scope.
    fn scoped(&mut self, stmt: &Stmt) -> Result<(), Diagnostic> {
        self.env.push_scope();
        let result = self.statement(stmt);
        self.env.pop_scope();
        result
    }

    /// Declarations at the top level of the main body become globals.
    fn declare_variable(
        &mut self,
        name: &str,
        template: Option<TemplateId>,
        location: CodeLocation,
    ) -> Result<Variable, Diagnostic> {
        if self.in_function || !self.env.is_outermost() {
            return self.env.declare(name, template, location).map(Variable::Local);
        }
        if let Some((index, _, global)) = self.globals.get_full_mut(name) {
            if !global.carried {
                return Err(Diagnostic::compiler(format!("duplicate declaration of `{name}`"), location)
                    .with_note(format!("previously declared at {}", global.info.location)));
            }
            global.carried = false;
            global.info.template = template;
            global.info.location = location;
            return Ok(Variable::Global(index));
        }
        let index = self.globals.len();
        self.globals.insert(
            name.to_string(),
            Global {
                info: GlobalInfo {
                    name: name.to_string(),
                    template,
                    location,
                },
                carried: false,
            },
        );
        Ok(Variable::Global(index))
    }

    /// Locals of the current body shadow globals.
    fn lookup(&self, name: &str) -> Option<(Variable, Option<TemplateId>)> {
        if let Some(binding) = self.env.resolve(name) {
            return Some((Variable::Local(binding.slot), binding.template));
        }
        let (index, _, global) = self.globals.get_full(name)?;
        Some((Variable::Global(index), global.info.template))
    }

    fn variable(&self, name: &str, location: &CodeLocation) -> Result<Variable, Diagnostic> {
        self.lookup(name)
            .map(|(variable, _)| variable)
            .ok_or_else(|| self.unknown_variable(name, location))
    }

    /// Records that an untyped variable now holds `template`.
    fn refine(&mut self, name: &str, variable: Variable, template: TemplateId) {
        let known = match variable {
            Variable::Local(_) => self.env.resolve_mut(name).map(|binding| &mut binding.template),
            Variable::Global(index) => self
                .globals
                .get_index_mut(index)
                .map(|(_, global)| &mut global.info.template),
        };
        if let Some(known) = known {
            *known = Some(template);
        }
    }

    fn load(&mut self, variable: Variable, location: &CodeLocation) {
        let instruction = match variable {
            Variable::Local(slot) => Instruction::Load(slot),
            Variable::Global(slot) => Instruction::LoadGlobal(slot),
        };
        self.emit(instruction, location);
    }

    fn store(&mut self, variable: Variable, location: &CodeLocation) {
        let instruction = match variable {
            Variable::Local(slot) => Instruction::Store(slot),
            Variable::Global(slot) => Instruction::StoreGlobal(slot),
        };
        self.emit(instruction, location);
    }

    fn assignment(
        &mut self,
        name: &str,
        op: Option<BinaryOp>,
        value: &Expr,
        location: &CodeLocation,
    ) -> Result<(), Diagnostic> {
        if let Some(op) = op {
            let variable = self.variable(name, location)?;
            self.load(variable, location);
            self.expression(value)?;
            self.emit(Instruction::Binary(op), location);
            self.store(variable, location);
            return Ok(());
        }

        let template = self.expression(value)?;
        let variable = match self.lookup(name) {
            Some((variable, declared)) => {
                self.check_assignable(name, declared, template, &value.location)?;
                if let (None, Some(template)) = (declared, template) {
                    self.refine(name, variable, template);
                }
                variable
            }
            None => self.declare_variable(name, template, location.clone())?,
        };
        self.store(variable, location);
        Ok(())
    }

    fn property_assignment(
        &mut self,
        receiver: &Expr,
        name: &str,
        op: Option<BinaryOp>,
        value: &Expr,
        location: &CodeLocation,
    ) -> Result<(), Diagnostic> {
        let access = if op.is_some() { Access::ReadWrite } else { Access::Write };
        let target = self.property_target(receiver, name, access, location)?;
        if let Some(op) = op {
            if matches!(target, PropertyTarget::Instance(_)) {
                self.emit(Instruction::Dup, location);
            }
            self.emit(property_get(target, name), location);
            self.expression(value)?;
            self.emit(Instruction::Binary(op), location);
        } else {
            self.expression(value)?;
        }
        self.emit(property_set(target, name), location);
        Ok(())
    }

    /// `x++` or `obj.field--` whose value is discarded.
    fn update_in_place(&mut self, target: &Target, delta: f64, location: &CodeLocation) -> Result<(), Diagnostic> {
        match target {
            Target::Variable(name) => {
                let variable = self.variable(name, location)?;
                self.load(variable, location);
                self.step(delta, location);
                self.store(variable, location);
            }
            Target::Property { receiver, name } => {
                let target = self.property_target(receiver, name, Access::ReadWrite, location)?;
                if matches!(target, PropertyTarget::Instance(_)) {
                    self.emit(Instruction::Dup, location);
                }
                self.emit(property_get(target, name), location);
                self.step(delta, location);
                self.emit(property_set(target, name), location);
            }
        }
        Ok(())
    }

    /// Increment used as a value: prefix forms yield the new value, postfix the old.
    fn update(&mut self, target: &Target, delta: f64, prefix: bool, location: &CodeLocation) -> Result<(), Diagnostic> {
        let property = match target {
            Target::Variable(name) => {
                let variable = self.variable(name, location)?;
                self.load(variable, location);
                self.step_keeping(delta, prefix, location);
                self.store(variable, location);
                return Ok(());
            }
            Target::Property { receiver, name } => {
                (self.property_target(receiver, name, Access::ReadWrite, location)?, name)
            }
        };

        let (target, name) = property;
        if let PropertyTarget::Static(_) = target {
            self.emit(property_get(target, name), location);
            self.step_keeping(delta, prefix, location);
            self.emit(property_set(target, name), location);
            return Ok(());
        }

        // The receiver and the result both outlive the setter call.
        self.env.push_scope();
        let object = self.env.temporary();
        let result = self.env.temporary();
        self.emit(Instruction::Store(object), location);
        self.emit(Instruction::Load(object), location);
        self.emit(property_get(target, name), location);
        if prefix {
            self.step(delta, location);
            self.emit(Instruction::Store(result), location);
            self.emit(Instruction::Load(object), location);
            self.emit(Instruction::Load(result), location);
        } else {
            self.emit(Instruction::Store(result), location);
            self.emit(Instruction::Load(object), location);
            self.emit(Instruction::Load(result), location);
            self.step(delta, location);
        }
        self.emit(property_set(target, name), location);
        self.emit(Instruction::Load(result), location);
        self.env.pop_scope();
        Ok(())
    }

    fn step(&mut self, delta: f64, location: &CodeLocation) {
        self.emit(Instruction::Push(Primitive::Number(delta)), location);
        self.emit(Instruction::Binary(BinaryOp::Add), location);
    }

    /// Adds `delta` to the top of the stack, leaving a copy of the new value
    /// (prefix) or the old one (postfix) beneath it.
    fn step_keeping(&mut self, delta: f64, prefix: bool, location: &CodeLocation) {
        if prefix {
            self.step(delta, location);
            self.emit(Instruction::Dup, location);
        } else {
            self.emit(Instruction::Dup, location);
            self.step(delta, location);
        }
    }

    fn for_loop(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Stmt,
        location: &CodeLocation,
    ) -> Result<(), Diagnostic> {
        if let Some(init) = init {
            self.statement(init)?;
        }
        let start = self.instructions.len();
        let exit = match condition {
            Some(condition) => {
                self.expression(condition)?;
                Some(self.emit(Instruction::JumpIfFalse(0), location))
            }
            None => None,
        };
        self.jumps.push(JumpScope::new(JumpKind::Loop));
        let result = self.scoped(body);
        let scope = self.pop_jumps();
        result?;
        let next = self.instructions.len();
        if let Some(step) = step {
            self.statement(step)?;
        }
        self.emit(Instruction::Jump(start), location);
        if let Some(exit) = exit {
            self.patch(exit);
        }
        self.close_jumps(scope, next);
        Ok(())
    }

    /// Case tests come first, then the bodies in source order with `default`
    /// last. The subject is popped before any body runs.
    fn switch(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
        location: &CodeLocation,
    ) -> Result<(), Diagnostic> {
        self.expression(subject)?;
        let mut tests = Vec::with_capacity(cases.len());
        for case in cases {
            self.expression(&case.value)?;
            tests.push(self.emit(Instruction::SwitchJump(0), &case.value.location));
        }
        self.emit(Instruction::Pop, location);
        let no_match = self.emit(Instruction::Jump(0), location);

        self.jumps.push(JumpScope::new(JumpKind::Switch));
        self.env.push_scope();
        let mut result = Ok(());
        for (case, test) in cases.iter().zip(tests) {
            self.patch(test);
            result = case.body.iter().try_for_each(|statement| self.statement(statement));
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            self.patch(no_match);
            if let Some(default) = default {
                result = default.iter().try_for_each(|statement| self.statement(statement));
            }
        }
        self.env.pop_scope();
        let scope = self.pop_jumps();
        result?;

        let end = self.instructions.len();
        for at in scope.breaks {
            self.patch_to(at, end);
        }
        Ok(())
    }

    /// Emits code for `expr` and returns the template its value is statically known to have.
    fn expression(&mut self, expr: &Expr) -> Result<Option<TemplateId>, Diagnostic> {
        let location = &expr.location;
        match &expr.kind {
            ExprKind::Literal(value) => {
                self.emit(Instruction::Push(value.clone()), location);
                Ok(None)
            }
            ExprKind::Variable(name) => {
                let Some((variable, template)) = self.lookup(name) else {
                    return Err(self.unknown_variable(name, location));
                };
                self.load(variable, location);
                Ok(template)
            }
            ExprKind::SystemMacro(name) => {
                let engine = self.engine;
                let Some(instructions) = engine.system_macro(name) else {
                    return Err(Diagnostic::compiler(
                        format!("unknown system macro `{name}`"),
                        location.clone(),
                    ));
                };
                for instruction in instructions {
                    self.emit(instruction.clone(), location);
                }
                Ok(None)
            }
            ExprKind::Unary { op, operand } => {
                self.expression(operand)?;
                self.emit(Instruction::Unary(*op), location);
                Ok(None)
            }
            ExprKind::Binary { op, left, right } if op.is_short_circuit() => {
                self.expression(left)?;
                let jump = self.emit(
                    Instruction::ShortCircuit {
                        when: *op == BinaryOp::Or,
                        target: 0,
                    },
                    location,
                );
                self.expression(right)?;
                self.emit(Instruction::CheckBool, location);
                self.patch(jump);
                Ok(None)
            }
            ExprKind::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit(Instruction::Binary(*op), location);
                Ok(None)
            }
            ExprKind::Call { name, args } => self.call(name, args, location),
            ExprKind::Member {
                receiver,
                name,
                args,
            } => self.member_call(receiver, name, args, location),
            ExprKind::Property { receiver, name } => {
                let target = self.property_target(receiver, name, Access::Read, location)?;
                self.emit(property_get(target, name), location);
                Ok(None)
            }
            ExprKind::New { template, args } => self.construct(template, args, location),
            ExprKind::Update {
                target,
                delta,
                prefix,
            } => {
                self.update(target, *delta, *prefix, location)?;
                Ok(None)
            }
        }
    }

    /// Resolves `name(args)` against script functions, then host builtins.
    fn call(&mut self, name: &str, args: &[Expr], location: &CodeLocation) -> Result<Option<TemplateId>, Diagnostic> {
        let arity = args.len();
        let (target, returns) = if let Some(&id) = self.function_table.lookup(name, arity) {
            (CallTarget::Function(id), None)
        } else if let Some(builtin) = self.engine.builtin(name, arity) {
            let returns = builtin
                .returns
                .as_deref()
                .and_then(|template| self.engine.template_id(template));
            (CallTarget::Builtin, returns)
        } else {
            let mut arities = self.function_table.arities(name);
            arities.extend(self.engine.builtins().arities(name));
            return Err(unresolved(
                format!("unknown function `{name}/{arity}`"),
                &arities,
                location,
            ));
        };
        for arg in args {
            self.expression(arg)?;
        }
        self.emit(
            Instruction::Call {
                target,
                name: name.to_string(),
                arity,
            },
            location,
        );
        Ok(returns)
    }

    /// A bare name that is not a variable but names a template stands for the
    /// template itself. Any other receiver is evaluated and needs a known template.
    fn receiver(&mut self, receiver: &Expr, member: &str, location: &CodeLocation) -> Result<Receiver, Diagnostic> {
        if let ExprKind::Variable(type_name) = &receiver.kind {
            if self.lookup(type_name).is_none() {
                if let Some(id) = self.engine.template_id(type_name) {
                    return Ok(Receiver::Template(id));
                }
            }
        }
        let Some(id) = self.expression(receiver)? else {
            return Err(Diagnostic::compiler(
                format!("cannot resolve {member} on a value of unknown template"),
                location.clone(),
            )
            .with_note("declare the receiver with a `: Template` annotation"));
        };
        Ok(Receiver::Instance(id))
    }

    fn member_call(
        &mut self,
        receiver: &Expr,
        name: &str,
        args: &[Expr],
        location: &CodeLocation,
    ) -> Result<Option<TemplateId>, Diagnostic> {
        let engine = self.engine;
        let arity = args.len();
        let (target, returns) = match self.receiver(receiver, &format!("`{name}/{arity}`"), location)? {
            Receiver::Template(id) => {
                let template = self.template(id, location)?;
                let Some(function) = template.static_function(name, arity) else {
                    return Err(unresolved(
                        format!("template `{}` has no static function `{name}/{arity}`", template.name()),
                        &template.static_functions().arities(name),
                        location,
                    ));
                };
                let returns = function
                    .returns
                    .as_deref()
                    .and_then(|returns| engine.template_id(returns));
                (CallTarget::TemplateStatic(id), returns)
            }
            Receiver::Instance(id) => {
                let template = self.template(id, location)?;
                if template.instance_function(name, arity).is_none() {
                    return Err(unresolved(
                        format!("template `{}` has no method `{name}/{arity}`", template.name()),
                        &template.instance_functions().arities(name),
                        location,
                    ));
                }
                (CallTarget::TemplateInstance(id), None)
            }
        };
        for arg in args {
            self.expression(arg)?;
        }
        self.emit(
            Instruction::Call {
                target,
                name: name.to_string(),
                arity,
            },
            location,
        );
        Ok(returns)
    }

    /// Resolves `receiver.name` for `access`. Instance receivers are pushed.
    fn property_target(
        &mut self,
        receiver: &Expr,
        name: &str,
        access: Access,
        location: &CodeLocation,
    ) -> Result<PropertyTarget, Diagnostic> {
        let (target, kind) = match self.receiver(receiver, &format!("property `{name}`"), location)? {
            Receiver::Template(id) => (PropertyTarget::Static(id), "static property"),
            Receiver::Instance(id) => (PropertyTarget::Instance(id), "property"),
        };
        let template = self.template(target.template(), location)?;
        let (readable, writable) = match target {
            PropertyTarget::Static(_) => (
                template.static_getter(name).is_some(),
                template.static_setter(name).is_some(),
            ),
            PropertyTarget::Instance(_) => (template.getter(name).is_some(), template.setter(name).is_some()),
        };
        let missing = if access.reads() && !readable {
            "readable"
        } else if access.writes() && !writable {
            "writable"
        } else {
            return Ok(target);
        };
        let error = Diagnostic::compiler(
            format!("template `{}` has no {missing} {kind} `{name}`", template.name()),
            location.clone(),
        );
        Err(match target {
            PropertyTarget::Instance(_) if template.has_static_property(name) => {
                error.with_note(format!("`{name}` is static; use `{}.{name}`", template.name()))
            }
            _ => error,
        })
    }

    fn construct(&mut self, name: &str, args: &[Expr], location: &CodeLocation) -> Result<Option<TemplateId>, Diagnostic> {
        let arity = args.len();
        let Some((id, template)) = self.engine.template_by_name(name) else {
            return Err(Diagnostic::compiler(format!("unknown template `{name}`"), location.clone()));
        };
        if template.constructor(arity).is_none() {
            return Err(unresolved(
                format!("template `{name}` has no constructor taking {arity} arguments"),
                &template.constructor_arities(),
                location,
            ));
        }
        for arg in args {
            self.expression(arg)?;
        }
        self.emit(
            Instruction::Call {
                target: CallTarget::TemplateConstructor(id),
                name: name.to_string(),
                arity,
            },
            location,
        );
        Ok(Some(id))
    }

    fn template(&self, id: TemplateId, location: &CodeLocation) -> Result<&'e ObjectTemplate, Diagnostic> {
        let engine = self.engine;
        engine
            .template(id)
            .ok_or_else(|| Diagnostic::compiler("receiver has an unknown template", location.clone()))
    }

    fn annotation(&self, annotation: Option<&TypeName>) -> Result<Option<TemplateId>, Diagnostic> {
        let Some(annotation) = annotation else {
            return Ok(None);
        };
        self.engine
            .template_id(&annotation.name)
            .map(Some)
            .ok_or_else(|| {
                Diagnostic::compiler(
                    format!("unknown template `{}`", annotation.name),
                    annotation.location.clone(),
                )
            })
    }

    fn check_assignable(
        &self,
        name: &str,
        declared: Option<TemplateId>,
        value: Option<TemplateId>,
        location: &CodeLocation,
    ) -> Result<(), Diagnostic> {
        match (declared, value) {
            (Some(declared), Some(value)) if declared != value => {
                let label = |id| {
                    self.engine
                        .template(id)
                        .map(|template| template.name().to_string())
                        .unwrap_or_default()
                };
                Err(Diagnostic::compiler(
                    format!(
                        "cannot assign a `{}` to `{name}`, which holds `{}`",
                        label(value),
                        label(declared)
                    ),
                    location.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn unknown_variable(&self, name: &str, location: &CodeLocation) -> Diagnostic {
        let error = Diagnostic::compiler(format!("unknown variable `{name}`"), location.clone());
        if self.engine.template_id(name).is_some() {
            error.with_note(format!("`{name}` is a template; call `{name}.function(..)` or `new {name}(..)`"))
        } else {
            error
        }
    }

    fn emit(&mut self, instruction: Instruction, location: &CodeLocation) -> usize {
        let offset = self.instructions.len();
        self.instructions.push(instruction);
        self.locations.push(location.clone());
        self.last_location = location.clone();
        offset
    }

    /// Points the jump at `at` to the next instruction to be emitted.
    fn patch(&mut self, at: usize) {
        let here = self.instructions.len();
        self.patch_to(at, here);
    }

    fn patch_to(&mut self, at: usize, destination: usize) {
        if let Some(instruction) = self.instructions.get_mut(at) {
            instruction.set_jump_target(destination);
        }
    }

    fn pop_jumps(&mut self) -> JumpScope {
        self.jumps.pop().unwrap_or_else(|| JumpScope::new(JumpKind::Loop))
    }

    fn close_jumps(&mut self, scope: JumpScope, continue_target: usize) {
        let exit = self.instructions.len();
        for at in scope.breaks {
            self.patch_to(at, exit);
        }
        for at in scope.continues {
            self.patch_to(at, continue_target);
        }
    }
}

impl JumpScope {
    fn new(kind: JumpKind) -> Self {
        Self {
            kind,
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }
}

fn property_get(target: PropertyTarget, name: &str) -> Instruction {
    Instruction::GetProperty {
        target,
        name: name.to_string(),
    }
}

fn property_set(target: PropertyTarget, name: &str) -> Instruction {
    Instruction::SetProperty {
        target,
        name: name.to_string(),
    }
}

fn unresolved(message: String, arities: &[usize], location: &CodeLocation) -> Diagnostic {
    let error = Diagnostic::compiler(message, location.clone());
    if arities.is_empty() {
        return error;
    }
    let listed = arities
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    error.with_note(format!("available arities: {listed}"))
}
