use std::sync::Arc;

use log::{debug, trace, warn};

use crate::{
    ast::BinaryOp,
    bytecode::{Instruction, Program},
    diagnostics::{CodeLocation, Diagnostic, DiagnosticKind, NoodleError, Result, StackEntry},
    engine::Engine,
    heap::Heap,
    registry::{CallTarget, NativeContext, NativeFunction, PropertyTarget},
    template::ObjectTemplate,
    value::{ObjectRef, Primitive, TemplateId},
};

/// Lifecycle of a [`Thread`]. `Completed` and `Faulted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Suspended,
    Completed,
    Faulted,
}

impl ThreadState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted)
    }
}

/// Activation record of the top-level script or one script function call.
#[derive(Debug, Clone)]
pub struct Frame {
    pub return_address: usize,
    /// Index into the program's function table; `None` for the top-level script.
    pub function: Option<usize>,
    pub locals: Vec<Primitive>,
    pub stack_base: usize,
}

enum Flow {
    Next,
    Suspend,
    Complete(Primitive),
}

/// One execution of a compiled program. Owns its operand stack, frames,
/// globals and object heap; shares only the engine and the instruction list.
pub struct Thread {
    engine: Arc<Engine>,
    program: Arc<Program>,
    ip: usize,
    stack: Vec<Primitive>,
    frames: Vec<Frame>,
    globals: Vec<Primitive>,
    state: ThreadState,
    result: Option<Primitive>,
    error: Option<Diagnostic>,
    heap: Heap,
    arguments: Vec<Primitive>,
    watchdog: Option<u64>,
    executed: u64,
    /// Heap size at which the next collection runs.
    next_collection: usize,
}

impl Thread {
    pub(crate) fn new(
        engine: Arc<Engine>,
        program: Arc<Program>,
        entry: Option<&str>,
        arguments: Vec<Primitive>,
    ) -> Result<Self> {
        let (ip, frame) = match entry {
            None => (
                0,
                Frame {
                    return_address: 0,
                    function: None,
                    locals: vec![Primitive::Null; program.main_locals()],
                    stack_base: 0,
                },
            ),
            Some(name) => {
                let arity = arguments.len();
                let id = *program.function_table.lookup(name, arity).ok_or_else(|| {
                    NoodleError::from(Diagnostic::runtime(format!(
                        "program `{}` has no function `{name}/{arity}`",
                        program.name()
                    )))
                })?;
                let info = program.functions().get(id).ok_or_else(|| {
                    NoodleError::from(Diagnostic::runtime(format!("function `{name}/{arity}` has no body")))
                })?;
                let mut locals = arguments.clone();
                locals.resize(info.locals.max(arity), Primitive::Null);
                (
                    info.entry,
                    Frame {
                        return_address: 0,
                        function: Some(id),
                        locals,
                        stack_base: 0,
                    },
                )
            }
        };
        let watchdog = engine.config().watchdog;
        let next_collection = engine.config().gc_threshold;
        let globals = vec![Primitive::Null; program.globals().len()];
        debug!(
            "thread created for `{}` at {}",
            program.name(),
            entry.unwrap_or("<main>")
        );
        Ok(Self {
            engine,
            program,
            ip,
            stack: Vec::new(),
            frames: vec![frame],
            globals,
            state: ThreadState::Ready,
            result: None,
            error: None,
            heap: Heap::new(),
            arguments,
            watchdog,
            executed: 0,
            next_collection,
        })
    }

    /// Starts from globals and objects left behind by an earlier thread.
    pub(crate) fn with_state(mut self, globals: Vec<Primitive>, heap: Heap) -> Self {
        let count = self.globals.len().max(globals.len());
        self.globals = globals;
        self.globals.resize(count, Primitive::Null);
        self.heap = heap;
        self
    }

    pub(crate) fn into_state(self) -> (Vec<Primitive>, Heap) {
        (self.globals, self.heap)
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Return value of the entry point, once the thread has completed.
    pub fn result(&self) -> Option<&Primitive> {
        match self.state {
            ThreadState::Completed => self.result.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Diagnostic> {
        self.error.as_ref()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Current value of the top-level script variable `name`.
    pub fn global(&self, name: &str) -> Option<&Primitive> {
        self.globals.get(self.program.global_slot(name)?)
    }

    pub fn watchdog(&self) -> Option<u64> {
        self.watchdog
    }

    /// Overrides the engine's per-resume instruction cap for this thread.
    pub fn set_watchdog(&mut self, limit: Option<u64>) {
        self.watchdog = limit;
    }

    /// Instructions executed during the most recent `resume`.
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub fn resume(&mut self) -> ThreadState {
        self.resume_with(Primitive::Null)
    }

    /// Continues execution. When the thread is suspended, `value` becomes the
    /// result of the host call that suspended it.
    pub fn resume_with(&mut self, value: Primitive) -> ThreadState {
        match self.state {
            ThreadState::Completed | ThreadState::Faulted | ThreadState::Running => return self.state,
            ThreadState::Suspended => {
                if let Err(error) = self.push(value) {
                    let offset = self.ip.saturating_sub(1);
                    self.fault(error, offset);
                    return self.state;
                }
            }
            ThreadState::Ready => {}
        }

        self.state = ThreadState::Running;
        self.executed = 0;
        let engine = Arc::clone(&self.engine);
        let program = Arc::clone(&self.program);
        loop {
            let offset = self.ip;
            if self.heap.len() >= self.next_collection {
                self.collect_garbage(&engine);
            }
            if self.watchdog.is_some_and(|limit| self.executed >= limit) {
                let error = Diagnostic::new(
                    DiagnosticKind::Watchdog,
                    format!("instruction limit of {} reached", self.executed),
                );
                self.fault(error, offset);
                break;
            }
            let Some(instruction) = program.instructions().get(offset) else {
                self.fault(Diagnostic::runtime("instruction pointer out of range"), offset);
                break;
            };
            trace!("{offset:04} {instruction}");
            self.ip += 1;
            self.executed += 1;
            match self.step(&engine, instruction) {
                Ok(Flow::Next) => {}
                Ok(Flow::Suspend) => {
                    self.state = ThreadState::Suspended;
                    break;
                }
                Ok(Flow::Complete(value)) => {
                    debug!(
                        "thread for `{}` completed after {} instructions",
                        program.name(),
                        self.executed
                    );
                    self.result = Some(value);
                    self.state = ThreadState::Completed;
                    break;
                }
                Err(error) => {
                    self.fault(error, offset);
                    break;
                }
            }
        }
        self.state
    }

    /// Resumes until the thread finishes, answering every suspension with `null`.
    pub fn run(&mut self) -> Result<Primitive> {
        loop {
            match self.resume() {
                ThreadState::Completed => return Ok(self.result.clone().unwrap_or_default()),
                ThreadState::Faulted => {
                    let error = self
                        .error
                        .clone()
                        .unwrap_or_else(|| Diagnostic::runtime("thread faulted"));
                    return Err(error.into());
                }
                ThreadState::Ready | ThreadState::Running | ThreadState::Suspended => {}
            }
        }
    }

    fn step(&mut self, engine: &Engine, instruction: &Instruction) -> std::result::Result<Flow, Diagnostic> {
        match instruction {
            Instruction::Push(value) => self.push(value.clone())?,
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Dup => {
                let top = self.peek()?.clone();
                self.push(top)?;
            }
            Instruction::Load(slot) => {
                let value = self
                    .frame()?
                    .locals
                    .get(*slot)
                    .cloned()
                    .ok_or_else(|| Diagnostic::runtime(format!("local slot {slot} is out of range")))?;
                self.push(value)?;
            }
            Instruction::Store(slot) => {
                let value = self.pop()?;
                let frame = self.frame_mut()?;
                if *slot >= frame.locals.len() {
                    frame.locals.resize(slot + 1, Primitive::Null);
                }
                frame.locals[*slot] = value;
            }
            Instruction::LoadGlobal(slot) => {
                let value = self
                    .globals
                    .get(*slot)
                    .cloned()
                    .ok_or_else(|| Diagnostic::runtime(format!("global slot {slot} is out of range")))?;
                self.push(value)?;
            }
            Instruction::StoreGlobal(slot) => {
                let value = self.pop()?;
                if *slot >= self.globals.len() {
                    self.globals.resize(slot + 1, Primitive::Null);
                }
                self.globals[*slot] = value;
            }
            Instruction::Unary(op) => {
                let operand = self.pop()?;
                self.push(operand.unary(*op)?)?;
            }
            Instruction::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let value = self.binary(engine, *op, &lhs, &rhs)?;
                self.push(value)?;
            }
            Instruction::Jump(target) => self.ip = *target,
            Instruction::JumpIfFalse(target) => {
                if !self.pop()?.expect_bool("condition")? {
                    self.ip = *target;
                }
            }
            Instruction::JumpIfTrue(target) => {
                if self.pop()?.expect_bool("condition")? {
                    self.ip = *target;
                }
            }
            Instruction::ShortCircuit { when, target } => {
                let decided = self.peek()?.expect_bool("logical operator")?;
                if decided == *when {
                    self.ip = *target;
                } else {
                    self.pop()?;
                }
            }
            Instruction::CheckBool => {
                self.peek()?.expect_bool("logical operator")?;
            }
            Instruction::SwitchJump(target) => {
                let case = self.pop()?;
                if *self.peek()? == case {
                    self.pop()?;
                    self.ip = *target;
                }
            }
            Instruction::Call {
                target,
                name,
                arity,
            } => return self.call(engine, *target, name, *arity),
            Instruction::GetProperty { target, name } => {
                let value = self.get_property(engine, *target, name)?;
                self.push(value)?;
            }
            Instruction::SetProperty { target, name } => self.set_property(engine, *target, name)?,
            Instruction::Return => {
                let value = self.pop()?;
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| Diagnostic::runtime("return without an active frame"))?;
                self.stack.truncate(frame.stack_base);
                if self.frames.is_empty() {
                    return Ok(Flow::Complete(value));
                }
                self.ip = frame.return_address;
                self.push(value)?;
            }
        }
        Ok(Flow::Next)
    }

    fn binary(
        &self,
        engine: &Engine,
        op: BinaryOp,
        lhs: &Primitive,
        rhs: &Primitive,
    ) -> std::result::Result<Primitive, Diagnostic> {
        let concatenates = op == BinaryOp::Add
            && matches!(
                (lhs, rhs),
                (Primitive::String(_), Primitive::Object(_)) | (Primitive::Object(_), Primitive::String(_))
            );
        if concatenates {
            let text = engine.render(&self.heap, lhs)? + &engine.render(&self.heap, rhs)?;
            return Ok(Primitive::string(text));
        }
        lhs.binary(op, rhs)
    }

    fn call(
        &mut self,
        engine: &Engine,
        target: CallTarget,
        name: &str,
        arity: usize,
    ) -> std::result::Result<Flow, Diagnostic> {
        match target {
            CallTarget::Function(id) => {
                let program = Arc::clone(&self.program);
                let info = program
                    .functions()
                    .get(id)
                    .ok_or_else(|| Diagnostic::runtime(format!("unresolved function `{name}/{arity}`")))?;
                if self.frames.len() >= engine.config().max_call_depth {
                    return Err(Diagnostic::runtime(format!(
                        "call stack overflow: more than {} nested calls",
                        engine.config().max_call_depth
                    )));
                }
                let mut locals = self.pop_args(arity)?;
                locals.resize(info.locals.max(arity), Primitive::Null);
                self.frames.push(Frame {
                    return_address: self.ip,
                    function: Some(id),
                    locals,
                    stack_base: self.stack.len(),
                });
                self.ip = info.entry;
                Ok(Flow::Next)
            }
            CallTarget::Builtin => {
                let function = engine
                    .builtin(name, arity)
                    .ok_or_else(|| Diagnostic::runtime(format!("unresolved builtin `{name}/{arity}`")))?;
                self.call_native(engine, function)
            }
            CallTarget::TemplateStatic(id) => {
                let function = engine
                    .template(id)
                    .and_then(|template| template.static_function(name, arity))
                    .ok_or_else(|| Diagnostic::runtime(format!("unresolved static function `{name}/{arity}`")))?;
                self.call_native(engine, function)
            }
            CallTarget::TemplateConstructor(id) => {
                let constructor = engine
                    .template(id)
                    .and_then(|template| template.constructor(arity))
                    .ok_or_else(|| Diagnostic::runtime(format!("`{name}` has no constructor of arity {arity}")))?;
                let args = self.pop_args(arity)?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                let value = (constructor.callback)(&mut context, &args)?;
                let object = self.heap.alloc(id, value);
                self.push(Primitive::Object(object))?;
                Ok(Flow::Next)
            }
            CallTarget::TemplateInstance(id) => {
                let template = engine
                    .template(id)
                    .ok_or_else(|| Diagnostic::runtime("method call on an unknown template"))?;
                let method = template.instance_function(name, arity).ok_or_else(|| {
                    Diagnostic::runtime(format!(
                        "template `{}` has no method `{name}/{arity}`",
                        template.name()
                    ))
                })?;
                let args = self.pop_args(arity)?;
                let receiver = self.pop_receiver(engine, template, id, name)?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                let value = (method.callback)(&mut context, receiver, &args)?;
                let suspend = context.suspend;
                self.finish_native(value, suspend)
            }
        }
    }

    fn get_property(
        &mut self,
        engine: &Engine,
        target: PropertyTarget,
        name: &str,
    ) -> std::result::Result<Primitive, Diagnostic> {
        let template = property_template(engine, target)?;
        match target {
            PropertyTarget::Static(_) => {
                let getter = template
                    .static_getter(name)
                    .ok_or_else(|| missing_property(template, "readable static property", name))?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                getter(&mut context)
            }
            PropertyTarget::Instance(id) => {
                let getter = template
                    .getter(name)
                    .ok_or_else(|| missing_property(template, "readable property", name))?;
                let receiver = self.pop_receiver(engine, template, id, name)?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                getter(&mut context, receiver)
            }
        }
    }

    fn set_property(
        &mut self,
        engine: &Engine,
        target: PropertyTarget,
        name: &str,
    ) -> std::result::Result<(), Diagnostic> {
        let template = property_template(engine, target)?;
        let value = self.pop()?;
        match target {
            PropertyTarget::Static(_) => {
                let setter = template
                    .static_setter(name)
                    .ok_or_else(|| missing_property(template, "writable static property", name))?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                setter(&mut context, value)
            }
            PropertyTarget::Instance(id) => {
                let setter = template
                    .setter(name)
                    .ok_or_else(|| missing_property(template, "writable property", name))?;
                let receiver = self.pop_receiver(engine, template, id, name)?;
                let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
                setter(&mut context, receiver, value)
            }
        }
    }

    /// Pops the object a method or property is applied to.
    fn pop_receiver(
        &mut self,
        engine: &Engine,
        template: &ObjectTemplate,
        id: TemplateId,
        member: &str,
    ) -> std::result::Result<ObjectRef, Diagnostic> {
        match self.pop()? {
            Primitive::Object(object) if object.template == id => Ok(object),
            other => Err(Diagnostic::runtime(format!(
                "`{member}` expects a `{}` receiver, found {}",
                template.name(),
                receiver_name(engine, &other)
            ))),
        }
    }

    /// Releases every object no longer reachable from the stack, the frames,
    /// the globals or the thread arguments.
    fn collect_garbage(&mut self, engine: &Engine) {
        let roots = self
            .stack
            .iter()
            .chain(self.frames.iter().flat_map(|frame| frame.locals.iter()))
            .chain(self.globals.iter())
            .chain(self.arguments.iter())
            .filter_map(Primitive::as_object);
        self.heap.collect(roots, |template, value, out| {
            if let Some(template) = engine.template(template) {
                template.references(value, out);
            }
        });
        self.next_collection = engine.config().gc_threshold.max(self.heap.len() * 2);
    }

    fn call_native(&mut self, engine: &Engine, function: &NativeFunction) -> std::result::Result<Flow, Diagnostic> {
        let args = self.pop_args(function.arity)?;
        let mut context = NativeContext::new(engine, &mut self.heap, &self.arguments);
        let value = function.call(&mut context, &args)?;
        let suspend = context.suspend;
        self.finish_native(value, suspend)
    }

    fn finish_native(&mut self, value: Primitive, suspend: bool) -> std::result::Result<Flow, Diagnostic> {
        if suspend {
            return Ok(Flow::Suspend);
        }
        self.push(value)?;
        Ok(Flow::Next)
    }

    fn frame(&self) -> std::result::Result<&Frame, Diagnostic> {
        self.frames
            .last()
            .ok_or_else(|| Diagnostic::runtime("no active frame"))
    }

    fn frame_mut(&mut self) -> std::result::Result<&mut Frame, Diagnostic> {
        self.frames
            .last_mut()
            .ok_or_else(|| Diagnostic::runtime("no active frame"))
    }

    fn push(&mut self, value: Primitive) -> std::result::Result<(), Diagnostic> {
        let limit = self.engine.config().max_stack_depth;
        if self.stack.len() >= limit {
            return Err(Diagnostic::runtime(format!(
                "operand stack overflow: more than {limit} values"
            )));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops a value owned by the current frame.
    fn pop(&mut self) -> std::result::Result<Primitive, Diagnostic> {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        if self.stack.len() <= base {
            return Err(Diagnostic::runtime("operand stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| Diagnostic::runtime("operand stack underflow"))
    }

    fn peek(&self) -> std::result::Result<&Primitive, Diagnostic> {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        if self.stack.len() <= base {
            return Err(Diagnostic::runtime("operand stack underflow"));
        }
        self.stack
            .last()
            .ok_or_else(|| Diagnostic::runtime("operand stack underflow"))
    }

    /// Removes the top `count` values, first argument first.
    fn pop_args(&mut self, count: usize) -> std::result::Result<Vec<Primitive>, Diagnostic> {
        let base = self.frames.last().map_or(0, |frame| frame.stack_base);
        if self.stack.len() < base + count {
            return Err(Diagnostic::runtime(format!(
                "operand stack underflow: call needs {count} arguments"
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn fault(&mut self, error: Diagnostic, offset: usize) {
        let location = self.program.location_at(offset).cloned();
        let mut error = error.with_call_stack(self.call_stack(location.clone()));
        if error.location.is_none() {
            error.location = location;
        }
        warn!("thread for `{}` faulted: {}", self.program.name(), error.message);
        self.error = Some(error);
        self.state = ThreadState::Faulted;
    }

    /// Innermost first: the faulting frame at `location`, then each caller at
    /// its call site.
    fn call_stack(&self, location: Option<CodeLocation>) -> Vec<StackEntry> {
        let mut entries = Vec::with_capacity(self.frames.len());
        let mut location = location;
        for frame in self.frames.iter().rev() {
            let function = match frame.function.and_then(|id| self.program.functions().get(id)) {
                Some(info) => format!("{}/{}", info.name, info.arity),
                None => "<main>".to_string(),
            };
            entries.push(StackEntry { function, location });
            location = frame
                .return_address
                .checked_sub(1)
                .and_then(|call_site| self.program.location_at(call_site))
                .cloned();
        }
        entries
    }
}

fn property_template(engine: &Engine, target: PropertyTarget) -> std::result::Result<&ObjectTemplate, Diagnostic> {
    engine
        .template(target.template())
        .ok_or_else(|| Diagnostic::runtime("property access on an unknown template"))
}

fn missing_property(template: &ObjectTemplate, kind: &str, name: &str) -> Diagnostic {
    Diagnostic::runtime(format!("template `{}` has no {kind} `{name}`", template.name()))
}

fn receiver_name(engine: &Engine, value: &Primitive) -> String {
    match value {
        Primitive::Object(ObjectRef { template, .. }) => engine
            .template(*template)
            .map(|template| format!("`{}`", template.name()))
            .unwrap_or_else(|| "an object".to_string()),
        other => other.type_name().to_string(),
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("program", &self.program.name())
            .field("state", &self.state)
            .field("ip", &self.ip)
            .field("stack", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("globals", &self.globals.len())
            .field("heap", &self.heap.len())
            .finish()
    }
}
