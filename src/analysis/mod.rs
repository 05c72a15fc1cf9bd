//! Two-pass variable / scope analyzer (§4.2).
//!
//! `analyze(program)` walks the AST and produces an [`Analysis`]: for every
//! identifier reference, its [`VarClass`] and index; for every function, its
//! local count, per-block local counts, and ordered `nfrees`/`cfrees` sets.
//! Scopes and function frames are arena-allocated and referenced by handle
//! (`ScopeHandle`/`FuncHandle`) rather than back-pointers, per spec.md §9's
//! design note on cyclic ownership among AST/scope/function frames.

use std::collections::{HashMap, HashSet};

use crate::ast::{Node, NodeKind, Program};

pub type ScopeHandle = u32;
pub type FuncHandle = u32;

/// Classification of a single identifier reference (§3 "Variable
/// classification"). `Undefined` is not an error at this stage — the
/// compiler reports it when it tries to emit code for the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarClass {
    Undefined,
    Local(u32),
    Argument(u32),
    Upvalue(u32),
    Global(u32),
}

#[derive(Debug, Clone)]
struct ScopeFrame {
    parent: Option<ScopeHandle>,
    func: FuncHandle,
    depth: u32,
    locals: HashMap<String, u32>,
    args: HashMap<String, u32>,
    globals: HashMap<String, u32>,
    aliases: HashMap<String, String>,
    used_namespaces: Vec<String>,
    namespace: String,
    /// Pattern-variable bindings introduced by a match arm: name -> slot
    /// within the arm's reserved block (resolved to a real local index
    /// once the owning function's block offsets are known).
    pattern_locals: HashMap<String, u32>,
    pattern_block: Option<usize>,
}

impl ScopeFrame {
    fn find_local_or_arg(&self, name: &str) -> Option<VarClass> {
        if let Some(&slot) = self.pattern_locals.get(name) {
            // resolved later via PatternRef rewriting; index carries the
            // slot only, real index patched in once block offsets exist.
            return Some(VarClass::Local(slot));
        }
        if let Some(&idx) = self.locals.get(name) {
            return Some(VarClass::Local(idx));
        }
        if let Some(&idx) = self.args.get(name) {
            return Some(VarClass::Argument(idx));
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionFrameInfo {
    pub local_count: u32,
    pub nfrees: Vec<(String, u32)>,
    pub cfrees: HashSet<String>,
    pub block_offsets: Vec<u32>,
    pub mods_offset: u32,
    /// Names this frame owns directly (its own locals/arguments, not
    /// forwarded upvalues) that some nested closure captures, with the
    /// slot they live in. Lets the compiler emit `get_local`/`get_arg`
    /// capture directives for a `mk_closure` whose enclosing frame is the
    /// direct owner, instead of always forwarding through `nfrees`.
    pub owned_bindings: HashMap<String, VarClass>,
}

#[derive(Debug)]
struct FunctionFrame {
    parent: Option<FuncHandle>,
    scope_stack: Vec<ScopeHandle>,
    next_local: u32,
    pending_block_sizes: Vec<u32>,
    block_offsets: Vec<u32>,
    nfrees: Vec<(String, u32)>,
    nfree_index: HashMap<String, u32>,
    cfrees: HashSet<String>,
    mods_offset: u32,
    owned_bindings: HashMap<String, VarClass>,
    /// `owned_bindings` entries whose origin turned out to be a match
    /// pattern variable rather than an ordinary local/argument: the raw
    /// per-arm slot can't become a real local index until this frame's
    /// `block_offsets` are known, so the patch is deferred the same way
    /// `PatternRef`s are (see `finish_current_function`).
    pending_owned_pattern: Vec<(String, usize, u32)>,
}

impl FunctionFrame {
    fn new(parent: Option<FuncHandle>) -> Self {
        Self {
            parent,
            scope_stack: Vec::new(),
            next_local: 0,
            pending_block_sizes: Vec::new(),
            block_offsets: Vec::new(),
            nfrees: Vec::new(),
            nfree_index: HashMap::new(),
            cfrees: HashSet::new(),
            mods_offset: 0,
            owned_bindings: HashMap::new(),
            pending_owned_pattern: Vec::new(),
        }
    }

    fn top_scope(&self) -> ScopeHandle {
        self.scope_stack[0]
    }

    fn current_scope(&self) -> ScopeHandle {
        *self.scope_stack.last().expect("live scope stack")
    }
}

/// Where a particular match expression's pattern-variable slots start,
/// once the owning function's per-block layout is finalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockLayout {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Default)]
pub struct Analysis {
    /// Scope active when each node was visited, dense by `NodeId`.
    pub node_scope: Vec<ScopeHandle>,
    /// Classification for every `Ident` node visited.
    pub classifications: HashMap<u32, VarClass>,
    /// Per-match-node block layout (§4.3's `block_off`).
    pub match_blocks: HashMap<u32, BlockLayout>,
    /// Indexed by [`FuncHandle`]; index 0 is the program's top-level frame.
    pub functions: Vec<FunctionFrameInfo>,
    /// Maps a `Fun` node's id to the [`FuncHandle`] of the frame analyzing
    /// its body, so the compiler can fetch that function's locals/frees.
    pub node_func: HashMap<u32, FuncHandle>,
    pub program_local_count: u32,
    pub program_global_count: u32,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub atoms: Vec<String>,
    /// Qualified top-level variable name -> its global slot index, so an
    /// importing module's compiler can resolve `Module:name` to a
    /// concrete `(module, idx)` pair (§4.4 "Imports & atoms").
    pub global_names: HashMap<String, u32>,
}

/// Deferred pattern-variable classification, resolved once the owning
/// function's block offsets are known (happens when that function frame
/// is popped, always before analysis as a whole finishes).
struct PatternRef {
    node_id: u32,
    block_idx: usize,
    slot: u32,
}

pub struct Analyzer {
    scopes: Vec<ScopeFrame>,
    funcs: Vec<FunctionFrame>,
    func_stack: Vec<FuncHandle>,
    known_globals: HashMap<String, u32>,
    next_glob_idx: u32,
    node_scope: Vec<ScopeHandle>,
    classifications: HashMap<u32, VarClass>,
    match_blocks: HashMap<u32, BlockLayout>,
    finished_functions: Vec<Option<FunctionFrameInfo>>,
    pattern_ref_stack: Vec<Vec<PatternRef>>,
    import_names: Vec<String>,
    export_names: Vec<String>,
    atom_names: Vec<String>,
    namespace_stack: Vec<String>,
    match_node_block: HashMap<u32, (FuncHandle, usize)>,
    node_func: HashMap<u32, FuncHandle>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            funcs: Vec::new(),
            func_stack: Vec::new(),
            known_globals: HashMap::new(),
            next_glob_idx: 0,
            node_scope: Vec::new(),
            classifications: HashMap::new(),
            match_blocks: HashMap::new(),
            finished_functions: Vec::new(),
            pattern_ref_stack: Vec::new(),
            import_names: Vec::new(),
            export_names: Vec::new(),
            atom_names: Vec::new(),
            namespace_stack: Vec::new(),
            match_node_block: HashMap::new(),
            node_func: HashMap::new(),
        }
    }

    /// Registers a name the REPL already bound as a global, consulted
    /// only when no function frame resolves the name (§4.2). A REPL
    /// session's incremental `analyze` calls each start a fresh
    /// `Analyzer`, so the next fresh global index has to be advanced past
    /// every previously bound one here, or a later line's own `var` would
    /// reuse (and silently alias) an earlier line's global slot.
    pub fn add_known_global(&mut self, name: impl Into<String>, idx: u32) {
        self.known_globals.insert(name.into(), idx);
        self.next_glob_idx = self.next_glob_idx.max(idx + 1);
    }

    pub fn analyze(mut self, program: &Program) -> Analysis {
        self.node_scope = vec![0; program.node_count as usize];

        let root_func = self.push_function(None);
        self.func_stack.push(root_func);
        let root_scope = self.push_scope(root_func, None);
        self.funcs[root_func as usize].scope_stack.push(root_scope);
        for (name, idx) in &self.known_globals.clone() {
            self.scopes[root_scope as usize]
                .globals
                .insert(name.clone(), *idx);
        }

        self.analyze_block(&program.stmts, true);

        let root_info = self.finish_current_function();

        let program_global_count = self.next_glob_idx;
        let program_local_count = root_info.local_count;
        let functions: Vec<FunctionFrameInfo> = self
            .finished_functions
            .into_iter()
            .map(|f| f.unwrap_or_default())
            .collect();
        let global_names = self.scopes[root_scope as usize].globals.clone();

        Analysis {
            node_scope: self.node_scope,
            classifications: self.classifications,
            match_blocks: self.match_blocks,
            functions,
            node_func: self.node_func,
            program_local_count,
            program_global_count,
            imports: self.import_names,
            exports: self.export_names,
            atoms: self.atom_names,
            global_names,
        }
    }

    // ---- arena helpers ----

    fn push_function(&mut self, parent: Option<FuncHandle>) -> FuncHandle {
        let handle = self.funcs.len() as FuncHandle;
        self.funcs.push(FunctionFrame::new(parent));
        self.pattern_ref_stack.push(Vec::new());
        self.finished_functions.push(None);
        handle
    }

    fn push_scope(&mut self, func: FuncHandle, parent: Option<ScopeHandle>) -> ScopeHandle {
        let (aliases, used_namespaces, globals) = match parent {
            Some(p) => (
                self.scopes[p as usize].aliases.clone(),
                self.scopes[p as usize].used_namespaces.clone(),
                self.scopes[p as usize].globals.clone(),
            ),
            None => (HashMap::new(), Vec::new(), HashMap::new()),
        };
        let depth = parent.map(|p| self.scopes[p as usize].depth + 1).unwrap_or(0);
        let handle = self.scopes.len() as ScopeHandle;
        self.scopes.push(ScopeFrame {
            parent,
            func,
            depth,
            locals: HashMap::new(),
            args: HashMap::new(),
            globals,
            aliases,
            used_namespaces,
            namespace: self.namespace_stack.last().cloned().unwrap_or_default(),
            pattern_locals: HashMap::new(),
            pattern_block: None,
        });
        handle
    }

    fn tag(&mut self, node: &Node, scope: ScopeHandle) {
        if (node.id as usize) < self.node_scope.len() {
            self.node_scope[node.id as usize] = scope;
        }
    }

    fn cur_func(&self) -> FuncHandle {
        *self.func_stack.last().unwrap_or(&0)
    }

    fn qualify(&self, name: &str, scope: ScopeHandle) -> String {
        let s = &self.scopes[scope as usize];
        if s.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", s.namespace, name)
        }
    }

    fn finish_current_function(&mut self) -> FunctionFrameInfo {
        let handle = self.func_stack.pop().unwrap_or(self.funcs.len() as u32 - 1);
        let func = &mut self.funcs[handle as usize];
        let mut block_offsets = Vec::with_capacity(func.pending_block_sizes.len());
        for &size in &func.pending_block_sizes {
            block_offsets.push(func.next_local);
            func.next_local += size;
        }
        func.block_offsets = block_offsets.clone();

        let refs = self.pattern_ref_stack.pop().unwrap_or_default();
        for r in refs {
            let real_idx = block_offsets[r.block_idx] + r.slot;
            self.classifications
                .insert(r.node_id, VarClass::Local(real_idx));
        }

        // A closure nested inside a match arm may capture a pattern
        // variable as its origin binding (`resolve_with_capture`
        // recorded the raw per-arm slot in `owned_bindings` before this
        // function's `block_offsets` existed); patch those now that they
        // do, the same way the `PatternRef`s above just were.
        let pending_owned =
            std::mem::take(&mut self.funcs[handle as usize].pending_owned_pattern);
        for (name, block_idx, slot) in pending_owned {
            let real_idx = block_offsets[block_idx] + slot;
            self.funcs[handle as usize]
                .owned_bindings
                .insert(name, VarClass::Local(real_idx));
        }

        let mut patched = Vec::new();
        for (&node_id, &(owner_func, block_idx)) in self.match_node_block.iter() {
            if owner_func != handle {
                continue;
            }
            if let Some(layout) = self.match_blocks.get(&node_id) {
                patched.push((
                    node_id,
                    BlockLayout {
                        offset: block_offsets[block_idx],
                        size: layout.size,
                    },
                ));
            }
        }
        for (node_id, layout) in patched {
            self.match_blocks.insert(node_id, layout);
        }

        let func = &self.funcs[handle as usize];
        let info = FunctionFrameInfo {
            local_count: func.next_local,
            nfrees: func.nfrees.clone(),
            cfrees: func.cfrees.clone(),
            block_offsets,
            mods_offset: func.mods_offset,
            owned_bindings: func.owned_bindings.clone(),
        };
        self.finished_functions[handle as usize] = Some(info.clone());
        info
    }

    // ---- statement-level prepass/full-pass ----

    fn analyze_block(&mut self, stmts: &[Node], toplevel: bool) {
        for s in stmts {
            self.prepass_stmt(s, toplevel);
        }
        for s in stmts {
            self.full_pass_stmt(s, toplevel);
        }
    }

    fn prepass_stmt(&mut self, node: &Node, toplevel: bool) {
        let scope = self.current_scope_handle();
        match &node.kind {
            NodeKind::VarDef { name, .. } => {
                let qn = self.qualify(name, scope);
                let class = self.declare_var(qn, toplevel);
                self.classifications.insert(node.id, class);
            }
            NodeKind::AtomDef(name) => {
                let qn = self.qualify(name, scope);
                self.atom_names.push(qn);
            }
            NodeKind::Namespace { name, body } => {
                self.namespace_stack.push(name.clone());
                for s in body {
                    self.prepass_stmt(s, toplevel);
                }
                self.namespace_stack.pop();
            }
            NodeKind::Using { namespace, alias } => {
                let scope = self.current_scope_handle();
                let s = &mut self.scopes[scope as usize];
                s.used_namespaces.push(namespace.clone());
                if let Some(alias) = alias {
                    s.aliases.insert(alias.clone(), namespace.clone());
                }
            }
            NodeKind::Import(name) => self.import_names.push(name.clone()),
            NodeKind::Export(names) => self.export_names.extend(names.iter().cloned()),
            NodeKind::Module(_) => {}
            _ => {}
        }
    }

    fn declare_var(&mut self, qualified_name: String, toplevel: bool) -> VarClass {
        let scope = self.current_scope_handle();
        if toplevel {
            let idx = self.next_glob_idx;
            self.next_glob_idx += 1;
            self.scopes[scope as usize]
                .globals
                .insert(qualified_name, idx);
            VarClass::Global(idx)
        } else {
            let func = self.cur_func();
            let idx = self.funcs[func as usize].next_local;
            self.funcs[func as usize].next_local += 1;
            self.scopes[scope as usize]
                .locals
                .insert(qualified_name, idx);
            VarClass::Local(idx)
        }
    }

    fn current_scope_handle(&self) -> ScopeHandle {
        let func = self.cur_func();
        self.funcs[func as usize].current_scope()
    }

    fn full_pass_stmt(&mut self, node: &Node, toplevel: bool) {
        let scope = self.current_scope_handle();
        self.tag(node, scope);
        match &node.kind {
            NodeKind::VarDef { value, .. } => self.visit(value),
            NodeKind::ExprStmt(e) => self.visit(e),
            NodeKind::Return(Some(e)) => self.visit(e),
            NodeKind::Return(None) => {}
            NodeKind::Namespace { name, body } => {
                self.namespace_stack.push(name.clone());
                for s in body {
                    self.full_pass_stmt(s, toplevel);
                }
                self.namespace_stack.pop();
            }
            NodeKind::AtomDef(_)
            | NodeKind::Module(_)
            | NodeKind::Import(_)
            | NodeKind::Export(_)
            | NodeKind::Using { .. } => {}
            other => self.visit_kind(node, other),
        }
    }

    // ---- expression-level visiting ----

    fn visit(&mut self, node: &Node) {
        let scope = self.current_scope_handle();
        self.tag(node, scope);
        self.visit_kind(node, &node.kind);
    }

    fn visit_kind(&mut self, node: &Node, kind: &NodeKind) {
        match kind {
            NodeKind::Integer(_)
            | NodeKind::Float(_)
            | NodeKind::Str(_)
            | NodeKind::Atom(_)
            | NodeKind::Bool(_)
            | NodeKind::Nil => {}
            NodeKind::Vector(elems) => elems.iter().for_each(|e| self.visit(e)),
            NodeKind::Cons(a, b) => {
                self.visit(a);
                self.visit(b);
            }
            NodeKind::ListLit { items, tail } => {
                items.iter().for_each(|e| self.visit(e));
                if let Some(t) = tail {
                    self.visit(t);
                }
            }
            NodeKind::Ident(name) => self.analyze_ident(node, name),
            NodeKind::UnOp(_, e) => self.visit(e),
            NodeKind::BinOp(_, l, r) => {
                self.visit(l);
                self.visit(r);
            }
            NodeKind::Fun { params, body } => self.analyze_fun(node.id, params, body),
            NodeKind::FunCall { callee, args } => {
                self.visit(callee);
                args.iter().for_each(|a| self.visit(a));
            }
            NodeKind::If {
                cond,
                conseq,
                antecedent,
            } => {
                self.visit(cond);
                self.visit(conseq);
                if let Some(a) = antecedent {
                    self.visit(a);
                }
            }
            NodeKind::Match {
                subject,
                arms,
                else_body,
            } => self.analyze_match(node, subject, arms, else_body.as_deref()),
            NodeKind::Subscript { target, index } => {
                self.visit(target);
                self.visit(index);
            }
            NodeKind::Let { bindings, body } => self.analyze_let(bindings, body),
            NodeKind::PrecisionBlock { digits, body } => {
                self.visit(digits);
                self.visit(body);
            }
            NodeKind::Assign { target, value } => {
                self.visit(target);
                self.visit(value);
            }
            NodeKind::StmtBlock(stmts) => {
                let func = self.cur_func();
                let parent = self.funcs[func as usize].current_scope();
                let child = self.push_scope(func, Some(parent));
                self.funcs[func as usize].scope_stack.push(child);
                self.analyze_block(stmts, false);
                self.funcs[func as usize].scope_stack.pop();
            }
            NodeKind::ExprStmt(e) => self.visit(e),
            NodeKind::VarDef { value, .. } => self.visit(value),
            NodeKind::Return(Some(e)) => self.visit(e),
            NodeKind::Return(None) => {}
            NodeKind::Module(_)
            | NodeKind::Import(_)
            | NodeKind::Export(_)
            | NodeKind::AtomDef(_)
            | NodeKind::Using { .. } => {}
            NodeKind::Namespace { name, body } => {
                self.namespace_stack.push(name.clone());
                for s in body {
                    self.full_pass_stmt(s, true);
                }
                self.namespace_stack.pop();
            }
        }
    }

    fn analyze_ident(&mut self, node: &Node, name: &str) {
        if name == "$" {
            // `$` is the compiler's self-reference sentinel, resolved by
            // literal name rather than scope classification (§4.4).
            return;
        }
        let scope = self.current_scope_handle();
        if let Some((block_idx, slot)) = self.find_pattern_local_same_function(name, scope) {
            // A reference to a match pattern variable from within its own
            // arm body: the real local index isn't known until the
            // enclosing function's block offsets are computed, so defer
            // it exactly like a pattern-occurrence reference (§4.2
            // per-block sizing).
            self.pattern_ref_stack.last_mut().unwrap().push(PatternRef {
                node_id: node.id,
                block_idx,
                slot,
            });
            self.classifications.insert(node.id, VarClass::Local(slot));
            return;
        }
        let class = self.resolve(name, scope);
        self.classifications.insert(node.id, class);
    }

    /// Walks the scope chain from `scope` up to the current function's
    /// root scope looking for `name` bound as a match-arm pattern
    /// variable, stopping as soon as a scope shadows it with an ordinary
    /// local or argument — the same precedence `find_local_or_arg` gives
    /// pattern variables within a single scope, extended across the
    /// chain. Never crosses a function boundary (a function's top scope
    /// has no parent, §4.2), so this can't misidentify an outer
    /// function's pattern variable as belonging to the referencer.
    fn find_pattern_local_same_function(
        &self,
        name: &str,
        scope: ScopeHandle,
    ) -> Option<(usize, u32)> {
        let mut cur = Some(scope);
        while let Some(handle) = cur {
            let frame = &self.scopes[handle as usize];
            if let Some(&slot) = frame.pattern_locals.get(name) {
                let block_idx = frame
                    .pattern_block
                    .expect("pattern_locals implies pattern_block");
                return Some((block_idx, slot));
            }
            if frame.locals.contains_key(name) || frame.args.contains_key(name) {
                return None;
            }
            cur = frame.parent;
        }
        None
    }

    /// Name qualification per §4.2: used namespaces, then aliases, then
    /// the current namespace, then the bare name — first non-undefined
    /// classification wins.
    fn resolve(&mut self, name: &str, scope: ScopeHandle) -> VarClass {
        let candidates = self.qualification_candidates(name, scope);
        for candidate in &candidates {
            if let Some(class) = self.resolve_within_function_chain(candidate, scope) {
                return class;
            }
        }
        // Fall back to the bare name through the full cross-function
        // upvalue search (candidates beyond the bare name only ever
        // widen qualification of top-level/global bindings).
        self.resolve_with_capture(name, scope)
    }

    fn qualification_candidates(&self, name: &str, scope: ScopeHandle) -> Vec<String> {
        let s = &self.scopes[scope as usize];
        let mut out = Vec::new();
        for ns in &s.used_namespaces {
            out.push(format!("{ns}:{name}"));
        }
        for (alias, real_ns) in &s.aliases {
            if let Some(rest) = name.strip_prefix(&format!("{alias}:")) {
                out.push(format!("{real_ns}:{rest}"));
            }
        }
        if !s.namespace.is_empty() {
            out.push(format!("{}:{}", s.namespace, name));
        }
        out.push(name.to_string());
        out
    }

    fn resolve_within_function_chain(&self, name: &str, scope: ScopeHandle) -> Option<VarClass> {
        let mut cur = Some(scope);
        while let Some(handle) = cur {
            let frame = &self.scopes[handle as usize];
            if let Some(class) = frame.find_local_or_arg(name) {
                return Some(class);
            }
            if let Some(&idx) = frame.globals.get(name) {
                return Some(VarClass::Global(idx));
            }
            cur = frame.parent;
        }
        None
    }

    /// Like [`resolve_within_function_chain`], but also reports the
    /// `(block_idx, slot)` of a hit that came from a match-arm pattern
    /// variable rather than an ordinary local/argument. Used by
    /// [`resolve_with_capture`]'s ancestor-frame search, where a pattern
    /// variable found in an outer function's current scope becomes that
    /// closure's captured origin and needs its `owned_bindings` entry
    /// patched once the owning function's block offsets exist (mirrors
    /// how a direct reference is deferred via `pattern_ref_stack`).
    fn resolve_chain_with_pattern_info(
        &self,
        name: &str,
        scope: ScopeHandle,
    ) -> Option<(VarClass, Option<(usize, u32)>)> {
        let mut cur = Some(scope);
        while let Some(handle) = cur {
            let frame = &self.scopes[handle as usize];
            if let Some(&slot) = frame.pattern_locals.get(name) {
                let block_idx = frame
                    .pattern_block
                    .expect("pattern_locals implies pattern_block");
                return Some((VarClass::Local(slot), Some((block_idx, slot))));
            }
            if let Some(&idx) = frame.locals.get(name) {
                return Some((VarClass::Local(idx), None));
            }
            if let Some(&idx) = frame.args.get(name) {
                return Some((VarClass::Argument(idx), None));
            }
            if let Some(&idx) = frame.globals.get(name) {
                return Some((VarClass::Global(idx), None));
            }
            cur = frame.parent;
        }
        None
    }

    /// Full cross-function search per §4.2: walks ancestor function
    /// frames' currently-live scope looking for the origin, wiring
    /// nfrees/cfrees along every frame strictly between referencer and
    /// origin.
    fn resolve_with_capture(&mut self, name: &str, scope: ScopeHandle) -> VarClass {
        if let Some(class) = self.resolve_within_function_chain(name, scope) {
            return class;
        }

        let referencing_func = self.scopes[scope as usize].func;

        // Ancestor function frames from nearest parent out to the root,
        // in that order.
        let mut frames = Vec::new();
        let mut f = self.funcs[referencing_func as usize].parent;
        while let Some(fh) = f {
            frames.push(fh);
            f = self.funcs[fh as usize].parent;
        }

        let mut origin_idx = None;
        let mut origin_class = None;
        let mut origin_pattern = None;
        for (i, &fh) in frames.iter().enumerate() {
            let top = self.funcs[fh as usize].current_scope();
            if let Some((class, pattern_info)) =
                self.resolve_chain_with_pattern_info(name, top)
            {
                match class {
                    VarClass::Local(_) | VarClass::Argument(_) => {
                        origin_idx = Some(i);
                        origin_class = Some(class);
                        origin_pattern = pattern_info;
                        break;
                    }
                    VarClass::Global(idx) => return VarClass::Global(idx),
                    _ => {}
                }
            }
        }

        let Some(origin_idx) = origin_idx else {
            if let Some(&idx) = self.known_globals.get(name) {
                return VarClass::Global(idx);
            }
            return VarClass::Undefined;
        };

        // `frames[origin_idx]` is the function whose own scope owns the
        // binding: it lends the value down via cfrees. Every frame
        // strictly between the referencer and the origin relays it one
        // hop further (both nfrees, to receive, and cfrees, to lend).
        // The referencing function itself only borrows (nfrees).
        let origin_class = origin_class.expect("origin_idx implies a Local/Argument class");
        let origin_func = frames[origin_idx];
        self.funcs[origin_func as usize]
            .owned_bindings
            .insert(name.to_string(), origin_class);
        if let Some((block_idx, slot)) = origin_pattern {
            // The origin is itself a match pattern variable: its real
            // local index isn't known until `origin_func` finishes (see
            // `finish_current_function`), so defer the `owned_bindings`
            // patch the same way a direct pattern-variable reference is.
            self.funcs[origin_func as usize]
                .pending_owned_pattern
                .push((name.to_string(), block_idx, slot));
        }
        self.funcs[frames[origin_idx] as usize]
            .cfrees
            .insert(name.to_string());
        for &fh in &frames[0..origin_idx] {
            self.add_nfree(fh, name);
            self.funcs[fh as usize].cfrees.insert(name.to_string());
        }
        let idx = self.add_nfree(referencing_func, name);
        VarClass::Upvalue(idx)
    }

    fn add_nfree(&mut self, func: FuncHandle, name: &str) -> u32 {
        let frame = &mut self.funcs[func as usize];
        if let Some(&idx) = frame.nfree_index.get(name) {
            return idx;
        }
        let idx = frame.nfrees.len() as u32;
        frame.nfrees.push((name.to_string(), idx));
        frame.nfree_index.insert(name.to_string(), idx);
        idx
    }

    fn analyze_fun(&mut self, node_id: u32, params: &[String], body: &Node) {
        let parent_func = self.cur_func();
        let func = self.push_function(Some(parent_func));
        self.node_func.insert(node_id, func);
        let scope = self.push_scope(func, None);
        {
            let s = &mut self.scopes[scope as usize];
            for (i, p) in params.iter().enumerate() {
                s.args.insert(p.clone(), i as u32);
            }
        }
        self.funcs[func as usize].scope_stack.push(scope);
        self.func_stack.push(func);

        match &body.kind {
            NodeKind::StmtBlock(stmts) => self.analyze_block(stmts, false),
            _ => self.visit(body),
        }

        self.finish_current_function();
    }

    fn analyze_let(&mut self, bindings: &[crate::ast::LetBinding], body: &Node) {
        for b in bindings {
            self.visit(&b.value);
            let scope = self.current_scope_handle();
            let qn = self.qualify(&b.name, scope);
            let class = self.declare_var(qn, false);
            self.classifications.insert(b.id, class);
        }
        self.visit(body);
    }

    fn analyze_match(
        &mut self,
        node: &Node,
        subject: &Node,
        arms: &[crate::ast::MatchArm],
        else_body: Option<&Node>,
    ) {
        self.visit(subject);

        let func = self.cur_func();
        let block_idx = self.funcs[func as usize].pending_block_sizes.len();
        self.funcs[func as usize].pending_block_sizes.push(0);

        let mut max_pvc = 0u32;
        for arm in arms {
            let parent_scope = self.funcs[func as usize].current_scope();
            let arm_scope = self.push_scope(func, Some(parent_scope));
            self.scopes[arm_scope as usize].pattern_block = Some(block_idx);
            self.funcs[func as usize].scope_stack.push(arm_scope);

            let mut slot = 0u32;
            self.analyze_pattern(&arm.pattern, arm_scope, &mut slot);
            max_pvc = max_pvc.max(slot);

            self.funcs[func as usize]
                .pending_block_sizes
                .get_mut(block_idx)
                .map(|s| *s = max_pvc);

            self.visit(&arm.body);

            self.funcs[func as usize].scope_stack.pop();
        }
        if let Some(body) = else_body {
            self.visit(body);
        }

        self.match_blocks.insert(
            node.id,
            BlockLayout {
                offset: 0, // patched in finish_current_function once block_offsets exist
                size: max_pvc,
            },
        );
        self.match_node_block.insert(node.id, (func, block_idx));
    }

    /// Registers every identifier occurrence in a match pattern as a
    /// fresh pattern-variable slot. Repeated names keep separate slots;
    /// the compiler emits an equality chain across them at runtime.
    fn analyze_pattern(&mut self, pattern: &Node, scope: ScopeHandle, slot: &mut u32) {
        self.tag(pattern, scope);
        match &pattern.kind {
            NodeKind::Ident(name) => {
                let this_slot = *slot;
                *slot += 1;
                // First occurrence of `name` is the canonical binding
                // location used for ordinary references within the body.
                self.scopes[scope as usize]
                    .pattern_locals
                    .entry(name.clone())
                    .or_insert(this_slot);
                let func = self.scopes[scope as usize].func;
                let block_idx = self.funcs[func as usize].pending_block_sizes.len() - 1;
                self.pattern_ref_stack.last_mut().unwrap().push(PatternRef {
                    node_id: pattern.id,
                    block_idx,
                    slot: this_slot,
                });
            }
            NodeKind::Cons(a, b) => {
                self.analyze_pattern(a, scope, slot);
                self.analyze_pattern(b, scope, slot);
            }
            NodeKind::ListLit { items, tail } => {
                for item in items {
                    self.analyze_pattern(item, scope, slot);
                }
                if let Some(t) = tail {
                    self.analyze_pattern(t, scope, slot);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse;

    fn analyze_source(src: &str) -> Analysis {
        let program = parse(src).expect("parses");
        Analyzer::new().analyze(&program)
    }

    /// S2: the inner closure's mutating reference to `x` must be an
    /// upvalue, and the outer `fun (x)` frame must record `x` as a cfree.
    #[test]
    fn closure_capture_marks_upvalue_and_cfree() {
        let analysis = analyze_source(
            "var mk = fun (x) { fun () { x = x + 1; x } };\nvar c = mk(10);\nc();",
        );
        let upvalues: Vec<_> = analysis
            .classifications
            .values()
            .filter(|c| matches!(c, VarClass::Upvalue(_)))
            .collect();
        assert!(!upvalues.is_empty(), "expected at least one upvalue classification");

        let outer_fn = analysis
            .functions
            .iter()
            .find(|f| f.cfrees.contains("x"))
            .expect("an outer frame lends x");
        assert!(outer_fn.cfrees.contains("x"));
    }

    /// S3: `n` and `acc` are parameters of the tail-recursive `loop`
    /// function, never promoted to upvalues, and `$` is left unclassified
    /// (resolved by the compiler, not the analyzer).
    #[test]
    fn tail_recursive_params_stay_arguments() {
        let analysis = analyze_source(
            "var loop = fun (n, acc) { if n == 0 then acc else $(n - 1, acc + n) };",
        );
        let arg_classes: Vec<_> = analysis
            .classifications
            .values()
            .filter(|c| matches!(c, VarClass::Argument(_)))
            .collect();
        assert_eq!(arg_classes.len(), 4, "n and acc each referenced twice");
        assert!(analysis
            .classifications
            .values()
            .all(|c| !matches!(c, VarClass::Upvalue(_))));
    }

    /// S4: both occurrences of `x` in `'(x . (y . x))` get distinct
    /// pattern-variable slots, and the match's reserved block covers both
    /// names (`x`, `y`) even though `x` appears twice.
    #[test]
    fn repeated_match_pattern_vars_get_distinct_slots() {
        let analysis = analyze_source(
            "match '(1 . (2 . 1)) {\n  case '(x . (y . x)) => x + y;\n  else => 0;\n}",
        );
        assert_eq!(analysis.match_blocks.len(), 1);
        let layout = analysis.match_blocks.values().next().unwrap();
        assert_eq!(layout.size, 3, "x, y, and the repeated x each reserve a slot");
    }

    /// A pattern variable referenced from its arm body must land at
    /// `block_off + slot`, not the raw per-arm slot, once a preceding
    /// local (here `a`, from the enclosing `let`) has already claimed slot
    /// 0 — otherwise `x`'s raw slot 0 collides with `a`.
    #[test]
    fn pattern_var_reference_in_arm_body_accounts_for_block_offset() {
        let analysis = analyze_source(
            "var f = fun (n) {\n  let a = n in\n  match '(3 . 4) {\n    case '(x . y) => x + y + a;\n    else => 0;\n  }\n};",
        );
        let func = analysis
            .functions
            .last()
            .expect("f's frame was recorded");
        let locals: HashSet<u32> = analysis
            .classifications
            .values()
            .filter_map(|c| match c {
                VarClass::Local(idx) => Some(*idx),
                _ => None,
            })
            .collect();
        assert_eq!(
            locals.len(),
            func.local_count as usize,
            "a, x, and y must each resolve to a distinct local slot"
        );
        assert_eq!(
            func.block_offsets.len(),
            1,
            "only the match introduces a reserved block; `a` is an ordinary local"
        );
        assert!(
            func.block_offsets[0] > 0,
            "the match's block must start after the let-bound `a`'s slot, not at 0"
        );
    }
}
