use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::{
    bytecode::{Instruction, Program},
    compiler,
    diagnostics::{Diagnostic, NoodleError, Result},
    heap::Heap,
    preprocessor::{PreprocessorBuiltin, builtin_defined},
    registry::{CallHolder, CallTarget, NativeContext, NativeFunction},
    runtime::Thread,
    stdlib,
    template::ObjectTemplate,
    value::{ObjectRef, Primitive, TemplateId},
};

/// Host policy applied to every thread created by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum instructions executed per `resume` call.
    pub watchdog: Option<u64>,
    pub max_stack_depth: usize,
    pub max_call_depth: usize,
    /// Live object count that triggers the first heap collection of a thread.
    pub gc_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchdog: None,
            max_stack_depth: 1024,
            max_call_depth: 256,
            gc_threshold: 256,
        }
    }
}

/// Collects registrations; [`EngineBuilder::build`] freezes them into an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    builtins: Vec<NativeFunction>,
    system_macros: Vec<(String, Vec<Instruction>)>,
    constants: Vec<(String, Primitive)>,
    templates: Vec<ObjectTemplate>,
    preprocessor_builtins: Vec<PreprocessorBuiltin>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn watchdog(mut self, limit: Option<u64>) -> Self {
        self.config.watchdog = limit;
        self
    }

    pub fn register_builtin<F>(self, name: impl Into<String>, arity: usize, callback: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Primitive]) -> std::result::Result<Primitive, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        self.register_native(NativeFunction::new(name, arity, callback))
    }

    pub fn register_native(mut self, function: NativeFunction) -> Self {
        self.builtins.push(function);
        self
    }

    /// Registers a bare identifier that compiles to `instructions`. The sequence
    /// must leave exactly one value on the stack and may only call builtins.
    pub fn register_system_macro(mut self, name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        self.system_macros.push((name.into(), instructions));
        self
    }

    pub fn register_constant(mut self, name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        self.constants.push((name.into(), value.into()));
        self
    }

    pub fn register_template(mut self, template: ObjectTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn register_preprocessor_builtin(mut self, builtin: PreprocessorBuiltin) -> Self {
        self.preprocessor_builtins.push(builtin);
        self
    }

    /// Adds the host prelude (`argumentCount`, `getArgument`, logging, casts, `Array`).
    pub fn with_prelude(self) -> Self {
        stdlib::install(self)
    }

    pub fn build(self) -> Result<Engine> {
        let mut engine = Engine {
            config: self.config,
            builtins: CallHolder::new(),
            system_macros: IndexMap::new(),
            constants: IndexMap::new(),
            templates: Vec::new(),
            template_index: IndexMap::new(),
            preprocessor_builtins: CallHolder::new(),
        };

        engine
            .preprocessor_builtins
            .register("defined", 1, PreprocessorBuiltin::new("defined", 1, builtin_defined))
            .map_err(NoodleError::Registration)?;
        for builtin in self.preprocessor_builtins {
            engine
                .preprocessor_builtins
                .register(builtin.name.clone(), builtin.arity, builtin)
                .map_err(|message| NoodleError::Registration(format!("preprocessor builtin {message}")))?;
        }

        for mut template in self.templates {
            if let Some(message) = template.errors.first() {
                return Err(NoodleError::Registration(message.clone()));
            }
            let name = template.name().to_string();
            if engine.template_index.contains_key(&name) {
                return Err(NoodleError::Registration(format!(
                    "template `{name}` is already registered"
                )));
            }
            template.install_builtin_methods();
            let id = TemplateId(engine.templates.len() as u32);
            engine.template_index.insert(name, id);
            engine.templates.push(template);
        }

        for function in self.builtins {
            engine
                .builtins
                .register(function.name.clone(), function.arity, function)
                .map_err(|message| NoodleError::Registration(format!("builtin {message}")))?;
        }

        for (name, value) in self.constants {
            if engine.constants.contains_key(&name) {
                return Err(NoodleError::Registration(format!(
                    "constant `{name}` is already registered"
                )));
            }
            engine.constants.insert(name, value);
        }

        for (name, instructions) in self.system_macros {
            if engine.system_macros.contains_key(&name) || engine.constants.contains_key(&name) {
                return Err(NoodleError::Registration(format!(
                    "system macro `{name}` is already registered"
                )));
            }
            engine.validate_system_macro(&name, &instructions)?;
            engine.system_macros.insert(name, instructions);
        }

        engine.validate_return_templates()?;
        debug!(
            "engine built: {} builtins, {} system macros, {} constants, {} templates",
            engine.builtins.len(),
            engine.system_macros.len(),
            engine.constants.len(),
            engine.templates.len()
        );
        Ok(engine)
    }
}

/// Immutable registry shared by every compile and every thread.
pub struct Engine {
    config: EngineConfig,
    builtins: CallHolder<NativeFunction>,
    system_macros: IndexMap<String, Vec<Instruction>>,
    constants: IndexMap<String, Primitive>,
    templates: Vec<ObjectTemplate>,
    template_index: IndexMap<String, TemplateId>,
    preprocessor_builtins: CallHolder<PreprocessorBuiltin>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lexes, preprocesses and compiles `source`; `name` only labels diagnostics.
    pub fn compile(&self, name: &str, source: &str) -> Result<Program> {
        compiler::compile(self, name, source).map_err(NoodleError::from)
    }

    /// Creates a thread running the top-level script (`entry == None`) or the
    /// declared function `entry` with `args.len()` parameters.
    pub fn create_thread(
        self: &Arc<Self>,
        program: &Arc<Program>,
        entry: Option<&str>,
        args: Vec<Primitive>,
    ) -> Result<Thread> {
        Thread::new(Arc::clone(self), Arc::clone(program), entry, args)
    }

    pub fn builtin(&self, name: &str, arity: usize) -> Option<&NativeFunction> {
        self.builtins.lookup(name, arity)
    }

    pub fn builtins(&self) -> &CallHolder<NativeFunction> {
        &self.builtins
    }

    /// Whether `name` is a host builtin (any arity) or a system macro.
    pub fn has_symbol(&self, name: &str) -> bool {
        self.builtins.has_name(name) || self.system_macros.contains_key(name)
    }

    pub fn system_macro(&self, name: &str) -> Option<&[Instruction]> {
        self.system_macros.get(name).map(Vec::as_slice)
    }

    pub fn constant(&self, name: &str) -> Option<&Primitive> {
        self.constants.get(name)
    }

    pub fn preprocessor_builtins(&self) -> &CallHolder<PreprocessorBuiltin> {
        &self.preprocessor_builtins
    }

    pub fn template(&self, id: TemplateId) -> Option<&ObjectTemplate> {
        self.templates.get(id.index())
    }

    pub fn template_id(&self, name: &str) -> Option<TemplateId> {
        self.template_index.get(name).copied()
    }

    pub fn template_by_name(&self, name: &str) -> Option<(TemplateId, &ObjectTemplate)> {
        let id = self.template_id(name)?;
        Some((id, self.template(id)?))
    }

    /// Text form of a value; objects use their template's display hook.
    pub fn render(&self, heap: &Heap, value: &Primitive) -> std::result::Result<String, Diagnostic> {
        let Primitive::Object(object) = value else {
            return Ok(value.to_string());
        };
        let template = self
            .template(object.template)
            .ok_or_else(|| Diagnostic::runtime("object has an unknown template"))?;
        let contents = heap.get_any(*object)?;
        Ok(template
            .render(contents)
            .unwrap_or_else(|| format!("{}#{}", template.name(), object.handle)))
    }

    /// Value equality used by the built-in `equals` method.
    pub fn objects_equal(
        &self,
        heap: &Heap,
        object: ObjectRef,
        other: &Primitive,
    ) -> std::result::Result<bool, Diagnostic> {
        let Primitive::Object(other) = other else {
            return Ok(false);
        };
        if other.template != object.template {
            return Ok(false);
        }
        if *other == object {
            return Ok(true);
        }
        let template = self
            .template(object.template)
            .ok_or_else(|| Diagnostic::runtime("object has an unknown template"))?;
        Ok(template
            .contents_equal(heap.get_any(object)?, heap.get_any(*other)?)
            .unwrap_or(false))
    }

    fn validate_system_macro(&self, name: &str, instructions: &[Instruction]) -> Result<()> {
        let mut depth: isize = 0;
        for instruction in instructions {
            let effect = instruction.stack_effect().ok_or_else(|| {
                NoodleError::Registration(format!(
                    "system macro `{name}` uses control flow instruction `{instruction}`"
                ))
            })?;
            match instruction {
                Instruction::Load(_)
                | Instruction::Store(_)
                | Instruction::LoadGlobal(_)
                | Instruction::StoreGlobal(_)
                | Instruction::GetProperty { .. }
                | Instruction::SetProperty { .. } => {
                    return Err(NoodleError::Registration(format!(
                        "system macro `{name}` cannot access variables or properties"
                    )));
                }
                Instruction::Call {
                    target: CallTarget::Builtin,
                    name: callee,
                    arity,
                } if self.builtin(callee, *arity).is_none() => {
                    return Err(NoodleError::Registration(format!(
                        "system macro `{name}` calls unknown builtin `{callee}/{arity}`"
                    )));
                }
                Instruction::Call { target, .. } if *target != CallTarget::Builtin => {
                    return Err(NoodleError::Registration(format!(
                        "system macro `{name}` may only call builtins"
                    )));
                }
                _ => {}
            }
            let arguments = match instruction {
                Instruction::Call { arity, .. } => *arity as isize,
                Instruction::Binary(_) => 2,
                Instruction::Pop | Instruction::Unary(_) | Instruction::Dup | Instruction::CheckBool => 1,
                _ => 0,
            };
            if depth < arguments {
                return Err(NoodleError::Registration(format!(
                    "system macro `{name}` underflows the stack at `{instruction}`"
                )));
            }
            depth += effect;
        }
        if depth != 1 {
            return Err(NoodleError::Registration(format!(
                "system macro `{name}` must produce exactly one value, produces {depth}"
            )));
        }
        Ok(())
    }

    fn validate_return_templates(&self) -> Result<()> {
        let statics = self
            .templates
            .iter()
            .flat_map(|template| template.static_functions().iter().map(|(_, _, function)| function));
        for function in self.builtins.iter().map(|(_, _, function)| function).chain(statics) {
            if let Some(returns) = &function.returns {
                if self.template_id(returns).is_none() {
                    return Err(NoodleError::Registration(format!(
                        "`{}/{}` returns unknown template `{returns}`",
                        function.name, function.arity
                    )));
                }
            }
        }
        Ok(())
    }
}
