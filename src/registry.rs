//! Name + arity keyed call tables shared by the preprocessor, compiler and VM.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    diagnostics::Diagnostic,
    engine::Engine,
    heap::Heap,
    value::{ObjectRef, Primitive, TemplateId},
};

/// Map from `(name, arity)` to a callable. Overloading is exact: a lookup with
/// any other arity misses even when the name is known.
#[derive(Debug, Clone, PartialEq)]
pub struct CallHolder<T> {
    entries: IndexMap<String, IndexMap<usize, T>>,
}

impl<T> Default for CallHolder<T> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<T> CallHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, refusing to replace an existing key.
    pub fn register(&mut self, name: impl Into<String>, arity: usize, value: T) -> Result<(), String> {
        let name = name.into();
        let arities = self.entries.entry(name.clone()).or_default();
        if arities.contains_key(&arity) {
            return Err(format!("`{name}/{arity}` is already registered"));
        }
        arities.insert(arity, value);
        Ok(())
    }

    pub fn lookup(&self, name: &str, arity: usize) -> Option<&T> {
        self.entries.get(name)?.get(&arity)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|arities| !arities.is_empty())
    }

    /// Registered arities for `name`, in registration order.
    pub fn arities(&self, name: &str) -> Vec<usize> {
        self.entries
            .get(name)
            .map(|arities| arities.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove_name(&mut self, name: &str) -> bool {
        self.entries.shift_remove(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &T)> {
        self.entries.iter().flat_map(|(name, arities)| {
            arities
                .iter()
                .map(move |(arity, value)| (name.as_str(), *arity, value))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a resolved call site refers to. Stored inside `Call` instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Builtin,
    /// Index into the program's function table.
    Function(usize),
    TemplateConstructor(TemplateId),
    TemplateStatic(TemplateId),
    TemplateInstance(TemplateId),
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => f.write_str("builtin"),
            Self::Function(id) => write!(f, "function#{id}"),
            Self::TemplateConstructor(id) => write!(f, "new#{}", id.index()),
            Self::TemplateStatic(id) => write!(f, "static#{}", id.index()),
            Self::TemplateInstance(id) => write!(f, "method#{}", id.index()),
        }
    }
}

/// Owner of a property accessed by `GetProperty`/`SetProperty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyTarget {
    /// Read or written on the receiver below the value.
    Instance(TemplateId),
    Static(TemplateId),
}

impl PropertyTarget {
    pub fn template(self) -> TemplateId {
        match self {
            Self::Instance(id) | Self::Static(id) => id,
        }
    }
}

impl fmt::Display for PropertyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(id) => write!(f, "field#{}", id.index()),
            Self::Static(id) => write!(f, "static#{}", id.index()),
        }
    }
}

pub type NativeFn =
    dyn Fn(&mut NativeContext<'_>, &[Primitive]) -> Result<Primitive, Diagnostic> + Send + Sync;

/// Host function callable from scripts, either globally or as a template static.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub arity: usize,
    /// Template of the returned object, when the function produces one.
    pub returns: Option<String>,
    pub callback: Arc<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, arity: usize, callback: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Primitive]) -> Result<Primitive, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            arity,
            returns: None,
            callback: Arc::new(callback),
        }
    }

    pub fn returning(mut self, template: impl Into<String>) -> Self {
        self.returns = Some(template.into());
        self
    }

    pub fn call(&self, context: &mut NativeContext<'_>, args: &[Primitive]) -> Result<Primitive, Diagnostic> {
        if args.len() != self.arity {
            return Err(Diagnostic::runtime(format!(
                "function `{}` expected {} arguments but received {}",
                self.name,
                self.arity,
                args.len()
            )));
        }
        (self.callback)(context, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}/{}>", self.name, self.arity)
    }
}

/// Everything a host callable may touch while it runs on a thread.
pub struct NativeContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) heap: &'a mut Heap,
    pub(crate) arguments: &'a [Primitive],
    pub(crate) suspend: bool,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(engine: &'a Engine, heap: &'a mut Heap, arguments: &'a [Primitive]) -> Self {
        Self {
            engine,
            heap,
            arguments,
            suspend: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    /// Arguments the thread was created with.
    pub fn arguments(&self) -> &[Primitive] {
        self.arguments
    }

    /// Allocates `value` as an instance of the named template.
    pub fn alloc<T: std::any::Any>(&mut self, template: &str, value: T) -> Result<Primitive, Diagnostic> {
        let id = self
            .engine
            .template_id(template)
            .ok_or_else(|| Diagnostic::runtime(format!("unknown template `{template}`")))?;
        Ok(Primitive::Object(self.heap.alloc(id, Box::new(value))))
    }

    pub fn get<T: std::any::Any>(&self, object: ObjectRef) -> Result<&T, Diagnostic> {
        self.heap.get(object)
    }

    pub fn get_mut<T: std::any::Any>(&mut self, object: ObjectRef) -> Result<&mut T, Diagnostic> {
        self.heap.get_mut(object)
    }

    /// Converts a value to text, rendering objects through their template.
    pub fn render(&self, value: &Primitive) -> Result<String, Diagnostic> {
        self.engine.render(&*self.heap, value)
    }

    /// Parks the thread after this call returns; the host's resume value becomes
    /// the call's result.
    pub fn suspend(&mut self) {
        self.suspend = true;
    }
}
