//! Host-defined object types exposed to scripts.

use std::{any::Any, fmt, marker::PhantomData, sync::Arc};

use indexmap::IndexMap;

use crate::{
    diagnostics::Diagnostic,
    registry::{CallHolder, NativeContext, NativeFunction},
    value::{ObjectRef, Primitive},
};

/// Name constructors are registered under. It cannot be written as an identifier.
pub const CONSTRUCTOR: &str = "<new>";

pub type ConstructorFn =
    dyn Fn(&mut NativeContext<'_>, &[Primitive]) -> Result<Box<dyn Any>, Diagnostic> + Send + Sync;

pub type MethodFn = dyn Fn(&mut NativeContext<'_>, ObjectRef, &[Primitive]) -> Result<Primitive, Diagnostic>
    + Send
    + Sync;

pub type GetterFn = dyn Fn(&mut NativeContext<'_>, ObjectRef) -> Result<Primitive, Diagnostic> + Send + Sync;

pub type SetterFn =
    dyn Fn(&mut NativeContext<'_>, ObjectRef, Primitive) -> Result<(), Diagnostic> + Send + Sync;

pub type StaticGetterFn = dyn Fn(&mut NativeContext<'_>) -> Result<Primitive, Diagnostic> + Send + Sync;

pub type StaticSetterFn = dyn Fn(&mut NativeContext<'_>, Primitive) -> Result<(), Diagnostic> + Send + Sync;

type DisplayFn = dyn Fn(&dyn Any) -> Option<String> + Send + Sync;
type EqualityFn = dyn Fn(&dyn Any, &dyn Any) -> Option<bool> + Send + Sync;
type TraceFn = dyn Fn(&dyn Any, &mut Vec<ObjectRef>) + Send + Sync;

#[derive(Clone)]
pub struct Constructor {
    pub arity: usize,
    pub callback: Arc<ConstructorFn>,
}

#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub arity: usize,
    pub callback: Arc<MethodFn>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<method {}/{}>", self.name, self.arity)
    }
}

fn constructor_fn<F>(callback: F) -> Arc<ConstructorFn>
where
    F: Fn(&mut NativeContext<'_>, &[Primitive]) -> Result<Box<dyn Any>, Diagnostic> + Send + Sync + 'static,
{
    Arc::new(callback)
}

fn method_fn<F>(callback: F) -> Arc<MethodFn>
where
    F: Fn(&mut NativeContext<'_>, ObjectRef, &[Primitive]) -> Result<Primitive, Diagnostic>
        + Send
        + Sync
        + 'static,
{
    Arc::new(callback)
}

fn getter_fn<F>(callback: F) -> Arc<GetterFn>
where
    F: Fn(&mut NativeContext<'_>, ObjectRef) -> Result<Primitive, Diagnostic> + Send + Sync + 'static,
{
    Arc::new(callback)
}

fn setter_fn<F>(callback: F) -> Arc<SetterFn>
where
    F: Fn(&mut NativeContext<'_>, ObjectRef, Primitive) -> Result<(), Diagnostic> + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Constructors, static functions and instance functions of one host type,
/// each table keyed by `(name, arity)`, plus properties keyed by name.
pub struct ObjectTemplate {
    name: String,
    pub(crate) constructors: CallHolder<Constructor>,
    pub(crate) static_functions: CallHolder<NativeFunction>,
    pub(crate) instance_functions: CallHolder<Method>,
    getters: IndexMap<String, Arc<GetterFn>>,
    setters: IndexMap<String, Arc<SetterFn>>,
    static_getters: IndexMap<String, Arc<StaticGetterFn>>,
    static_setters: IndexMap<String, Arc<StaticSetterFn>>,
    display: Option<Arc<DisplayFn>>,
    equality: Option<Arc<EqualityFn>>,
    trace: Option<Arc<TraceFn>>,
    pub(crate) errors: Vec<String>,
}

impl ObjectTemplate {
    fn new(name: String) -> Self {
        Self {
            name,
            constructors: CallHolder::new(),
            static_functions: CallHolder::new(),
            instance_functions: CallHolder::new(),
            getters: IndexMap::new(),
            setters: IndexMap::new(),
            static_getters: IndexMap::new(),
            static_setters: IndexMap::new(),
            display: None,
            equality: None,
            trace: None,
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constructor(&self, arity: usize) -> Option<&Constructor> {
        self.constructors.lookup(CONSTRUCTOR, arity)
    }

    pub fn constructor_arities(&self) -> Vec<usize> {
        self.constructors.arities(CONSTRUCTOR)
    }

    pub fn static_function(&self, name: &str, arity: usize) -> Option<&NativeFunction> {
        self.static_functions.lookup(name, arity)
    }

    pub fn instance_function(&self, name: &str, arity: usize) -> Option<&Method> {
        self.instance_functions.lookup(name, arity)
    }

    pub fn static_functions(&self) -> &CallHolder<NativeFunction> {
        &self.static_functions
    }

    pub fn instance_functions(&self) -> &CallHolder<Method> {
        &self.instance_functions
    }

    pub fn getter(&self, name: &str) -> Option<&Arc<GetterFn>> {
        self.getters.get(name)
    }

    pub fn setter(&self, name: &str) -> Option<&Arc<SetterFn>> {
        self.setters.get(name)
    }

    pub fn static_getter(&self, name: &str) -> Option<&Arc<StaticGetterFn>> {
        self.static_getters.get(name)
    }

    pub fn static_setter(&self, name: &str) -> Option<&Arc<StaticSetterFn>> {
        self.static_setters.get(name)
    }

    /// Whether the template names `name` as any kind of static member.
    pub(crate) fn has_static_property(&self, name: &str) -> bool {
        self.static_getters.contains_key(name) || self.static_setters.contains_key(name)
    }

    pub(crate) fn references(&self, value: &dyn Any, out: &mut Vec<ObjectRef>) {
        if let Some(trace) = &self.trace {
            trace(value, out);
        }
    }

    pub(crate) fn render(&self, value: &dyn Any) -> Option<String> {
        self.display.as_ref().and_then(|display| display(value))
    }

    pub(crate) fn contents_equal(&self, lhs: &dyn Any, rhs: &dyn Any) -> Option<bool> {
        self.equality.as_ref().and_then(|equality| equality(lhs, rhs))
    }

    /// Adds `toString/0`, `equals/1` and the `template` getter unless the
    /// host supplied its own.
    pub(crate) fn install_builtin_methods(&mut self) {
        if !self.getters.contains_key("template") {
            let name = Primitive::string(self.name.as_str());
            self.getters
                .insert("template".to_string(), getter_fn(move |_ctx, _this| Ok(name.clone())));
        }
        if self.instance_functions.lookup("toString", 0).is_none() {
            let method = Method {
                name: "toString".to_string(),
                arity: 0,
                callback: method_fn(|ctx, this, _args| {
                    Ok(Primitive::string(ctx.render(&Primitive::Object(this))?))
                }),
            };
            let _ = self.instance_functions.register("toString", 0, method);
        }
        if self.instance_functions.lookup("equals", 1).is_none() {
            let method = Method {
                name: "equals".to_string(),
                arity: 1,
                callback: method_fn(|ctx, this, args| {
                    let equal = ctx.engine.objects_equal(&*ctx.heap, this, &args[0])?;
                    Ok(Primitive::Boolean(equal))
                }),
            };
            let _ = self.instance_functions.register("equals", 1, method);
        }
    }
}

impl fmt::Debug for ObjectTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTemplate")
            .field("name", &self.name)
            .field("constructors", &self.constructor_arities())
            .field("static_functions", &self.static_functions.len())
            .field("instance_functions", &self.instance_functions.len())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("setters", &self.setters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Typed builder for an [`ObjectTemplate`] whose instances are `T`.
pub struct TemplateBuilder<T> {
    template: ObjectTemplate,
    marker: PhantomData<fn() -> T>,
}

impl<T: Any> TemplateBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            template: ObjectTemplate::new(name.into()),
            marker: PhantomData,
        }
    }

    fn record(&mut self, outcome: Result<(), String>) {
        if let Err(message) = outcome {
            self.template
                .errors
                .push(format!("template `{}`: {message}", self.template.name));
        }
    }

    pub fn constructor<F>(mut self, arity: usize, constructor: F) -> Self
    where
        F: Fn(&[Primitive]) -> Result<T, Diagnostic> + Send + Sync + 'static,
    {
        let callback = constructor_fn(move |_ctx, args| {
            constructor(args).map(|value| Box::new(value) as Box<dyn Any>)
        });
        let outcome = self
            .template
            .constructors
            .register(CONSTRUCTOR, arity, Constructor { arity, callback });
        self.record(outcome);
        self
    }

    pub fn static_function<F>(self, name: impl Into<String>, arity: usize, function: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Primitive]) -> Result<Primitive, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        self.static_native(NativeFunction::new(name, arity, function))
    }

    /// Static function with full control, e.g. a declared return template.
    pub fn static_native(mut self, function: NativeFunction) -> Self {
        let outcome = self
            .template
            .static_functions
            .register(function.name.clone(), function.arity, function);
        self.record(outcome);
        self
    }

    pub fn method<F>(self, name: impl Into<String>, arity: usize, method: F) -> Self
    where
        F: Fn(&mut T, &[Primitive]) -> Result<Primitive, Diagnostic> + Send + Sync + 'static,
    {
        self.method_with_context(name, arity, move |ctx, this, args| {
            let value = ctx.heap.get_mut::<T>(this)?;
            method(value, args)
        })
    }

    /// Method that needs the thread's heap or engine, e.g. to allocate.
    pub fn method_with_context<F>(mut self, name: impl Into<String>, arity: usize, method: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, ObjectRef, &[Primitive]) -> Result<Primitive, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let entry = Method {
            name: name.clone(),
            arity,
            callback: method_fn(method),
        };
        let outcome = self.template.instance_functions.register(name, arity, entry);
        self.record(outcome);
        self
    }

    pub fn getter<F>(self, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&T) -> Result<Primitive, Diagnostic> + Send + Sync + 'static,
    {
        self.getter_with_context(name, move |ctx, this| getter(ctx.heap.get::<T>(this)?))
    }

    pub fn getter_with_context<F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, ObjectRef) -> Result<Primitive, Diagnostic> + Send + Sync + 'static,
    {
        let name = name.into();
        let outcome = unique(&self.template.getters, &name, "getter");
        self.record(outcome);
        self.template.getters.insert(name, getter_fn(getter));
        self
    }

    pub fn setter<F>(mut self, name: impl Into<String>, setter: F) -> Self
    where
        F: Fn(&mut T, Primitive) -> Result<(), Diagnostic> + Send + Sync + 'static,
    {
        let name = name.into();
        let outcome = unique(&self.template.setters, &name, "setter");
        self.record(outcome);
        let callback = setter_fn(move |ctx, this, value| setter(ctx.heap.get_mut::<T>(this)?, value));
        self.template.setters.insert(name, callback);
        self
    }

    pub fn static_getter<F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>) -> Result<Primitive, Diagnostic> + Send + Sync + 'static,
    {
        let name = name.into();
        let outcome = unique(&self.template.static_getters, &name, "static getter");
        self.record(outcome);
        self.template.static_getters.insert(name, Arc::new(getter));
        self
    }

    pub fn static_setter<F>(mut self, name: impl Into<String>, setter: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, Primitive) -> Result<(), Diagnostic> + Send + Sync + 'static,
    {
        let name = name.into();
        let outcome = unique(&self.template.static_setters, &name, "static setter");
        self.record(outcome);
        self.template.static_setters.insert(name, Arc::new(setter));
        self
    }

    /// Reports the objects an instance refers to, keeping them alive while it is.
    pub fn trace<F>(mut self, trace: F) -> Self
    where
        F: Fn(&T, &mut Vec<ObjectRef>) + Send + Sync + 'static,
    {
        self.template.trace = Some(Arc::new(move |value: &dyn Any, out: &mut Vec<ObjectRef>| {
            if let Some(value) = value.downcast_ref::<T>() {
                trace(value, out);
            }
        }));
        self
    }

    pub fn display<F>(mut self, display: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.template.display = Some(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().map(&display)
        }));
        self
    }

    pub fn equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.template.equality = Some(Arc::new(move |lhs: &dyn Any, rhs: &dyn Any| {
            Some(equality(lhs.downcast_ref::<T>()?, rhs.downcast_ref::<T>()?))
        }));
        self
    }

    pub fn build(self) -> ObjectTemplate {
        self.template
    }
}

fn unique<V>(table: &IndexMap<String, V>, name: &str, kind: &str) -> Result<(), String> {
    if table.contains_key(name) {
        Err(format!("{kind} `{name}` is already registered"))
    } else {
        Ok(())
    }
}
