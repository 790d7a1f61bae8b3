use indexmap::IndexMap;

use crate::{
    diagnostics::{CodeLocation, Diagnostic},
    value::TemplateId,
};

/// Compile-time view of the locals of one function body.
#[derive(Debug)]
pub struct Environment {
    scopes: Vec<Scope>,
    next_slot: usize,
    max_slots: usize,
}

#[derive(Debug, Default)]
struct Scope {
    first_slot: usize,
    bindings: IndexMap<String, Binding>,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub slot: usize,
    /// Template statically known to be held by the slot.
    pub template: Option<TemplateId>,
    pub location: CodeLocation,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            next_slot: 0,
            max_slots: 0,
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope {
            first_slot: self.next_slot,
            bindings: IndexMap::new(),
        });
    }

    /// Leaves a block; its slots are reused by later declarations.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            if let Some(scope) = self.scopes.pop() {
                self.next_slot = scope.first_slot;
            }
        }
    }

    /// Whether no block scope is open.
    pub fn is_outermost(&self) -> bool {
        self.scopes.len() == 1
    }

    /// Reserves an unnamed slot that lives until the current scope closes.
    pub fn temporary(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slots = self.max_slots.max(self.next_slot);
        slot
    }

    pub fn declare(
        &mut self,
        name: &str,
        template: Option<TemplateId>,
        location: CodeLocation,
    ) -> Result<usize, Diagnostic> {
        let slot = self.next_slot;
        let Some(scope) = self.scopes.last_mut() else {
            return Err(Diagnostic::compiler("no open scope", location));
        };
        if let Some(existing) = scope.bindings.get(name) {
            return Err(Diagnostic::compiler(
                format!("duplicate declaration of `{name}`"),
                location,
            )
            .with_note(format!("previously declared at {}", existing.location)));
        }
        scope.bindings.insert(
            name.to_string(),
            Binding {
                slot,
                template,
                location,
            },
        );
        self.next_slot += 1;
        self.max_slots = self.max_slots.max(self.next_slot);
        Ok(slot)
    }

    pub fn resolve(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(name))
    }

    pub fn resolve_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.bindings.get_mut(name))
    }

    /// Number of local slots a frame for this body needs.
    pub fn slot_count(&self) -> usize {
        self.max_slots
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
