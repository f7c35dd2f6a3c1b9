//! Frame slots and closure cells of the lambda being lowered.

use super::CompileError;
use crate::tree::Variable;
use crate::vm::InstructionList;
use hashbrown::HashMap;

/// Where a variable lives at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub index: u32,
    /// The slot holds a cell instead of the value.
    pub is_boxed: bool,
    /// `index` addresses the closure array, not the frame.
    pub in_closure: bool,
}

impl LocalVariable {
    pub fn in_closure_or_boxed(&self) -> bool {
        self.is_boxed || self.in_closure
    }
}

/// Handle returned by [`LocalVariables::define_local`].
#[derive(Clone, Debug)]
pub struct LocalDefinition {
    scope: usize,
    index: u32,
    variable: Variable,
}

impl LocalDefinition {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }
}

/// Instruction range in which one definition of a variable is live.
#[derive(Debug)]
struct VariableScope {
    local: LocalVariable,
    start: usize,
    stop: usize,
    parent: Option<usize>,
    /// Redefinitions of the same variable nested inside this range.
    children: Vec<usize>,
}

#[derive(Default)]
pub struct LocalVariables {
    scopes: Vec<VariableScope>,
    variables: HashMap<Variable, usize>,
    closure_order: Vec<Variable>,
    closure: HashMap<Variable, LocalVariable>,
    local_count: usize,
    max_local_count: usize,
}

impl LocalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot for `variable`, live from instruction `start`. A
    /// variable that is already defined gets a nested scope which shadows
    /// the outer one until it is undefined.
    pub fn define_local(&mut self, variable: &Variable, start: usize) -> Result<LocalDefinition, CompileError> {
        let index = u32::try_from(self.local_count).map_err(|_| CompileError::TooManyLocals)?;
        self.local_count += 1;
        self.max_local_count = self.max_local_count.max(self.local_count);

        let id = self.scopes.len();
        let parent = self.variables.get(variable).copied();
        self.scopes.push(VariableScope {
            local: LocalVariable { index, is_boxed: false, in_closure: false },
            start,
            stop: usize::MAX,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.scopes[parent].children.push(id);
        }
        self.variables.insert(variable.clone(), id);
        Ok(LocalDefinition { scope: id, index, variable: variable.clone() })
    }

    /// Ends the scope of `definition` at instruction `end`. Its slot becomes
    /// free for the next definition.
    pub fn undefine_local(&mut self, definition: &LocalDefinition, end: usize) {
        let scope = &mut self.scopes[definition.scope];
        scope.stop = end;
        match scope.parent {
            Some(parent) => {
                self.variables.insert(definition.variable.clone(), parent);
            }
            None => {
                self.variables.remove(&definition.variable);
            }
        }
        self.local_count -= 1;
    }

    /// Turns the current definition of `variable` into a cell and rewrites
    /// every access already emitted in its range. Ranges of nested
    /// redefinitions are skipped; they own a different slot state.
    pub fn box_variable(&mut self, variable: &Variable, instructions: &mut InstructionList) {
        let Some(&id) = self.variables.get(variable) else {
            return;
        };
        self.scopes[id].local.is_boxed = true;
        let scope = &self.scopes[id];
        let index = scope.local.index;
        let mut children = scope.children.iter().map(|&c| &self.scopes[c]).peekable();
        let mut i = scope.start;
        while i < scope.stop && i < instructions.count() {
            if let Some(child) = children.next_if(|child| child.start == i) {
                i = child.stop;
                continue;
            }
            instructions.switch_to_boxed(index, i);
            i += 1;
        }
    }

    /// Marks a definition whose slot already holds a cell when its scope
    /// starts, such as a by-reference parameter.
    pub fn mark_boxed(&mut self, definition: &LocalDefinition) {
        self.scopes[definition.scope].local.is_boxed = true;
    }

    pub fn try_get_local_or_closure(&self, variable: &Variable) -> Option<LocalVariable> {
        match self.variables.get(variable) {
            Some(&id) => Some(self.scopes[id].local),
            None => self.closure.get(variable).copied(),
        }
    }

    pub fn contains_variable(&self, variable: &Variable) -> bool {
        self.variables.contains_key(variable)
    }

    /// Registers a free variable captured from an enclosing lambda.
    pub fn add_closure_variable(&mut self, variable: &Variable) -> LocalVariable {
        if let Some(existing) = self.closure.get(variable) {
            return *existing;
        }
        let local = LocalVariable { index: self.closure_order.len() as u32, is_boxed: true, in_closure: true };
        self.closure_order.push(variable.clone());
        self.closure.insert(variable.clone(), local);
        local
    }

    pub fn closure_variables(&self) -> &[Variable] {
        &self.closure_order
    }

    /// Peak number of simultaneously live slots.
    pub fn local_count(&self) -> usize {
        self.max_local_count
    }

    /// Scope ids of every variable currently in scope. Resolve them with
    /// [`Self::resolve`] once lowering is done, when boxing is final.
    pub fn visible_scopes(&self) -> Vec<(Variable, usize)> {
        self.variables.iter().map(|(variable, &id)| (variable.clone(), id)).collect()
    }

    pub fn resolve(&self, scope: usize) -> LocalVariable {
        self.scopes[scope].local
    }
}
