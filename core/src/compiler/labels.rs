//! Tree labels: where each label is visible, and which jumps are legal.
//!
//! Every node being lowered runs inside a label scope. Statement-like nodes
//! (blocks, loops, conditionals, switches) can be jumped into; try bodies,
//! handlers and value-producing expressions cannot. Labels written directly
//! in a block are defined when the block is entered, so jumps may target
//! them from anywhere inside the block, forwards or backwards.

use super::CompileError;
use crate::tree::{Expr, LabelTarget};
use crate::vm::{BranchLabel, InstructionList};
use hashbrown::HashMap;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelScopeKind {
    /// Any statement-like node: conditional, loop, goto, label.
    Statement,
    Block,
    Switch,
    Lambda,
    Try,
    Catch,
    Finally,
    Filter,
    /// A node whose evaluation leaves values on the operand stack.
    Expression,
}

impl LabelScopeKind {
    fn can_jump_into(self) -> bool {
        matches!(
            self,
            LabelScopeKind::Block | LabelScopeKind::Statement | LabelScopeKind::Switch | LabelScopeKind::Lambda
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelId(usize);

struct LabelScope {
    kind: LabelScopeKind,
    parent: Option<usize>,
    labels: HashMap<LabelTarget, LabelId>,
}

struct LabelInfo {
    node: Option<LabelTarget>,
    label: Option<BranchLabel>,
    definitions: SmallVec<[usize; 1]>,
    references: Vec<usize>,
    across_block_jump: bool,
}

impl LabelInfo {
    fn new(node: Option<LabelTarget>) -> Self {
        Self { node, label: None, definitions: SmallVec::new(), references: Vec::new(), across_block_jump: false }
    }

    fn name(&self) -> &str {
        self.node.as_ref().map(|n| n.name()).unwrap_or("<anonymous>")
    }
}

pub struct LabelScopes {
    scopes: Vec<LabelScope>,
    infos: Vec<LabelInfo>,
    tree_labels: HashMap<LabelTarget, LabelId>,
    current: usize,
}

impl Default for LabelScopes {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelScopes {
    pub fn new() -> Self {
        Self {
            scopes: vec![LabelScope { kind: LabelScopeKind::Lambda, parent: None, labels: HashMap::new() }],
            infos: Vec::new(),
            tree_labels: HashMap::new(),
            current: 0,
        }
    }

    pub fn kind(&self) -> LabelScopeKind {
        self.scopes[self.current].kind
    }

    fn parent_kind(&self) -> Option<LabelScopeKind> {
        self.scopes[self.current].parent.map(|p| self.scopes[p].kind)
    }

    pub fn push(&mut self, kind: LabelScopeKind) {
        self.scopes.push(LabelScope { kind, parent: Some(self.current), labels: HashMap::new() });
        self.current = self.scopes.len() - 1;
    }

    pub fn pop(&mut self, kind: LabelScopeKind) {
        debug_assert_eq!(self.kind(), kind);
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    fn contains_target(&self, scope: usize, target: &LabelTarget) -> bool {
        self.scopes[scope].labels.contains_key(target)
    }

    /// Opens the scope `node` is lowered in. Returns the kind pushed, if
    /// any, so the caller can pop it afterwards.
    pub fn try_push(&mut self, node: &Expr) -> Result<Option<LabelScopeKind>, CompileError> {
        let kind = match node {
            Expr::Label { target, .. } => {
                if self.kind() == LabelScopeKind::Block {
                    if self.contains_target(self.current, target) {
                        return Ok(None);
                    }
                    if let Some(parent) = self.scopes[self.current].parent {
                        if self.scopes[parent].kind == LabelScopeKind::Switch && self.contains_target(parent, target) {
                            return Ok(None);
                        }
                    }
                }
                LabelScopeKind::Statement
            }
            Expr::Block(block) => {
                self.push(LabelScopeKind::Block);
                // Labels of switch case bodies were defined with the switch.
                if self.parent_kind() != Some(LabelScopeKind::Switch) {
                    self.define_block_labels(&block.expressions)?;
                }
                return Ok(Some(LabelScopeKind::Block));
            }
            Expr::Switch(switch) => {
                self.push(LabelScopeKind::Switch);
                for case in &switch.cases {
                    if let Expr::Block(block) = &case.body {
                        self.define_block_labels(&block.expressions)?;
                    }
                }
                if let Some(Expr::Block(block)) = &switch.default {
                    self.define_block_labels(&block.expressions)?;
                }
                return Ok(Some(LabelScopeKind::Switch));
            }
            Expr::Convert { ty, .. } if ty.is_void() => LabelScopeKind::Statement,
            Expr::Conditional { .. } | Expr::Loop(_) | Expr::Goto { .. } => LabelScopeKind::Statement,
            _ => {
                if self.kind() == LabelScopeKind::Expression {
                    return Ok(None);
                }
                LabelScopeKind::Expression
            }
        };
        self.push(kind);
        Ok(Some(kind))
    }

    fn define_block_labels(&mut self, expressions: &[Expr]) -> Result<(), CompileError> {
        for expression in expressions {
            if let Expr::Label { target, .. } = expression {
                self.define(Some(target))?;
            }
        }
        Ok(())
    }

    fn ensure(&mut self, node: &LabelTarget) -> LabelId {
        if let Some(id) = self.tree_labels.get(node) {
            return *id;
        }
        let id = LabelId(self.infos.len());
        self.infos.push(LabelInfo::new(Some(node.clone())));
        self.tree_labels.insert(node.clone(), id);
        id
    }

    /// Defines `node` in the current scope. `None` makes a fresh label no
    /// jump can name, for loops without break or continue targets.
    pub fn define(&mut self, node: Option<&LabelTarget>) -> Result<LabelId, CompileError> {
        let Some(node) = node else {
            self.infos.push(LabelInfo::new(None));
            return Ok(LabelId(self.infos.len() - 1));
        };
        let id = self.ensure(node);

        // No shadowing: keeps one active branch label per tree label.
        let mut scope = Some(self.current);
        while let Some(s) = scope {
            if self.contains_target(s, node) {
                return Err(CompileError::InvalidJump(format!("label '{}' is already defined", node.name())));
            }
            scope = self.scopes[s].parent;
        }

        self.infos[id.0].definitions.push(self.current);
        self.scopes[self.current].labels.insert(node.clone(), id);

        let info = &self.infos[id.0];
        if info.definitions.len() == 1 {
            for reference in info.references.clone() {
                self.validate_jump(id, reference)?;
            }
        } else {
            if info.across_block_jump {
                return Err(CompileError::InvalidJump(format!("ambiguous jump to label '{}'", info.name())));
            }
            // Only local jumps so far; the redefinition gets its own
            // branch label.
            self.infos[id.0].label = None;
        }
        Ok(id)
    }

    /// Records a jump from the current scope to `node`.
    pub fn reference(&mut self, node: &LabelTarget) -> Result<LabelId, CompileError> {
        let id = self.ensure(node);
        self.infos[id.0].references.push(self.current);
        if !self.infos[id.0].definitions.is_empty() {
            self.validate_jump(id, self.current)?;
        }
        Ok(id)
    }

    fn ancestors(&self, scope: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(scope), move |&s| self.scopes[s].parent)
    }

    fn validate_jump(&mut self, id: LabelId, reference: usize) -> Result<(), CompileError> {
        // A jump out to an enclosing definition is always fine, unless it
        // leaves a finally or filter.
        for scope in self.ancestors(reference) {
            if self.infos[id.0].definitions.contains(&scope) {
                return Ok(());
            }
            if matches!(self.scopes[scope].kind, LabelScopeKind::Finally | LabelScopeKind::Filter) {
                break;
            }
        }

        let info = &mut self.infos[id.0];
        info.across_block_jump = true;
        if info.definitions.len() > 1 {
            return Err(CompileError::InvalidJump(format!("ambiguous jump to label '{}'", info.name())));
        }
        let definition = info.definitions[0];
        let name = info.name().to_string();

        let definition_path: Vec<usize> = self.ancestors(definition).collect();
        let common = self.ancestors(reference).find(|s| definition_path.contains(s));

        for scope in self.ancestors(reference).take_while(|s| Some(*s) != common) {
            match self.scopes[scope].kind {
                LabelScopeKind::Finally => {
                    return Err(CompileError::InvalidJump(format!("jump to '{}' leaves a finally block", name)));
                }
                LabelScopeKind::Filter => {
                    return Err(CompileError::InvalidJump(format!("jump to '{}' leaves a catch filter", name)));
                }
                _ => {}
            }
        }
        for scope in definition_path.into_iter().take_while(|s| Some(*s) != common) {
            let kind = self.scopes[scope].kind;
            if !kind.can_jump_into() {
                let what = if kind == LabelScopeKind::Expression { "an expression" } else { "a try or catch block" };
                return Err(CompileError::InvalidJump(format!("jump to '{}' enters {}", name, what)));
            }
        }
        Ok(())
    }

    /// The label defined for `node` directly in the current block, or in
    /// the enclosing switch.
    pub fn find_in_block(&self, node: &LabelTarget) -> Option<LabelId> {
        if self.kind() != LabelScopeKind::Block {
            return None;
        }
        if let Some(id) = self.scopes[self.current].labels.get(node) {
            return Some(*id);
        }
        let parent = self.scopes[self.current].parent?;
        if self.scopes[parent].kind == LabelScopeKind::Switch {
            return self.scopes[parent].labels.get(node).copied();
        }
        None
    }

    pub fn branch_label(&mut self, id: LabelId, instructions: &mut InstructionList) -> BranchLabel {
        let info = &mut self.infos[id.0];
        *info.label.get_or_insert_with(|| instructions.make_label())
    }

    /// Current branch label of a tree label, if it has been given one.
    pub fn branch_label_of(&self, node: &LabelTarget) -> Option<BranchLabel> {
        self.tree_labels.get(node).and_then(|id| self.infos[id.0].label)
    }

    /// Every jump target must have been defined somewhere.
    pub fn validate_finish(&self) -> Result<(), CompileError> {
        for info in &self.infos {
            if !info.references.is_empty() && info.definitions.is_empty() {
                return Err(CompileError::InvalidJump(format!("label '{}' is never defined", info.name())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_and_forward_references_resolve() -> Result<(), CompileError> {
        let mut scopes = LabelScopes::new();
        let target = LabelTarget::new("l");
        scopes.push(LabelScopeKind::Block);
        scopes.reference(&target)?;
        scopes.define(Some(&target))?;
        scopes.reference(&target)?;
        scopes.pop(LabelScopeKind::Block);
        scopes.validate_finish()
    }

    #[test]
    fn test_jump_out_of_finally_is_rejected() -> Result<(), CompileError> {
        let mut scopes = LabelScopes::new();
        let target = LabelTarget::new("out");
        scopes.push(LabelScopeKind::Block);
        scopes.define(Some(&target))?;
        scopes.push(LabelScopeKind::Finally);
        let result = scopes.reference(&target);
        assert!(matches!(result, Err(CompileError::InvalidJump(_))));
        Ok(())
    }

    #[test]
    fn test_jump_into_try_is_rejected() -> Result<(), CompileError> {
        let mut scopes = LabelScopes::new();
        let target = LabelTarget::new("inside");
        scopes.push(LabelScopeKind::Block);
        scopes.reference(&target)?;
        scopes.push(LabelScopeKind::Try);
        scopes.push(LabelScopeKind::Block);
        let result = scopes.define(Some(&target));
        assert!(matches!(result, Err(CompileError::InvalidJump(_))));
        Ok(())
    }

    #[test]
    fn test_undefined_label() -> Result<(), CompileError> {
        let mut scopes = LabelScopes::new();
        scopes.reference(&LabelTarget::new("nowhere"))?;
        assert!(scopes.validate_finish().is_err());
        Ok(())
    }

    #[test]
    fn test_shadowing_is_rejected() -> Result<(), CompileError> {
        let mut scopes = LabelScopes::new();
        let target = LabelTarget::new("l");
        scopes.push(LabelScopeKind::Block);
        scopes.define(Some(&target))?;
        scopes.push(LabelScopeKind::Block);
        assert!(scopes.define(Some(&target)).is_err());
        Ok(())
    }
}
