use crate::diagnostics::Span;
use crate::symbols::Symbol;

/// Stable arena address of one expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

impl ExprId {
    pub(crate) fn new(index: usize) -> Self {
        ExprId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Compact position handle, resolved through [`PosTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PosIdx(u32);

#[derive(Debug, Default)]
pub struct PosTable {
    spans: Vec<Span>,
}

impl PosTable {
    pub fn add(&mut self, span: Span) -> PosIdx {
        let idx = PosIdx(self.spans.len() as u32);
        self.spans.push(span);
        idx
    }

    pub fn span(&self, idx: PosIdx) -> Span {
        self.spans[idx.0 as usize]
    }

    pub(crate) fn len(&self) -> usize {
        self.spans.len()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.spans.truncate(len);
    }
}

/// How a variable reference was resolved by the binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarBinding {
    /// Not yet visited by the binder.
    Unresolved,
    /// Bound in the `level`-th enclosing binding env, at slot `index`.
    /// `with` scopes do not count towards `level`.
    Static { level: usize, index: usize },
    /// Only reachable through an enclosing `with` scope at runtime.
    FromWith,
    /// No static binding and no enclosing `with`.
    Unbound,
}

#[derive(Debug, Clone)]
pub enum StrPart {
    Lit(String),
    Interp(ExprId),
}

#[derive(Debug, Clone)]
pub struct AttrDef {
    pub name: Symbol,
    pub name_pos: PosIdx,
    pub value: ExprId,
    /// `inherit` bindings take their value from the enclosing scope.
    pub inherited: bool,
}

#[derive(Debug, Clone)]
pub struct DynamicAttrDef {
    pub name: ExprId,
    pub value: ExprId,
}

#[derive(Debug, Clone)]
pub enum AttrName {
    Static { name: Symbol, pos: PosIdx },
    Dynamic(ExprId),
}

#[derive(Debug, Clone)]
pub struct Formal {
    pub name: Symbol,
    pub pos: PosIdx,
    pub default: Option<ExprId>,
}

#[derive(Debug, Clone)]
pub struct Formals {
    pub formals: Vec<Formal>,
    pub ellipsis: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Implies,
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Update,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Negate,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int {
        value: i64,
        pos: PosIdx,
    },
    Float {
        value: f64,
        pos: PosIdx,
    },
    Str {
        parts: Vec<StrPart>,
        pos: PosIdx,
    },
    Path {
        text: String,
        pos: PosIdx,
    },
    SearchPath {
        text: String,
        pos: PosIdx,
    },
    Var {
        name: Symbol,
        pos: PosIdx,
        binding: VarBinding,
    },
    List {
        items: Vec<ExprId>,
        pos: PosIdx,
    },
    AttrSet {
        recursive: bool,
        attrs: Vec<AttrDef>,
        dynamic: Vec<DynamicAttrDef>,
        pos: PosIdx,
    },
    Let {
        attrs: Vec<AttrDef>,
        body: ExprId,
        pos: PosIdx,
    },
    Lambda {
        /// `x: ...` or the `name` in `name@{ ... }: ...`.
        arg: Option<(Symbol, PosIdx)>,
        formals: Option<Formals>,
        body: ExprId,
        pos: PosIdx,
    },
    Apply {
        func: ExprId,
        arg: ExprId,
        pos: PosIdx,
    },
    Select {
        base: ExprId,
        path: Vec<AttrName>,
        default: Option<ExprId>,
        pos: PosIdx,
    },
    HasAttr {
        base: ExprId,
        path: Vec<AttrName>,
        pos: PosIdx,
    },
    If {
        cond: ExprId,
        then_body: ExprId,
        else_body: ExprId,
        pos: PosIdx,
    },
    With {
        scope: ExprId,
        body: ExprId,
        pos: PosIdx,
    },
    Assert {
        cond: ExprId,
        body: ExprId,
        pos: PosIdx,
    },
    BinaryOp {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        pos: PosIdx,
    },
    UnaryOp {
        op: UnOp,
        operand: ExprId,
        pos: PosIdx,
    },
    /// Injected by the parser to keep the tree well-formed on syntax errors.
    Error {
        pos: PosIdx,
    },
}

impl Expr {
    pub fn pos(&self) -> PosIdx {
        match self {
            Expr::Int { pos, .. }
            | Expr::Float { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Path { pos, .. }
            | Expr::SearchPath { pos, .. }
            | Expr::Var { pos, .. }
            | Expr::List { pos, .. }
            | Expr::AttrSet { pos, .. }
            | Expr::Let { pos, .. }
            | Expr::Lambda { pos, .. }
            | Expr::Apply { pos, .. }
            | Expr::Select { pos, .. }
            | Expr::HasAttr { pos, .. }
            | Expr::If { pos, .. }
            | Expr::With { pos, .. }
            | Expr::Assert { pos, .. }
            | Expr::BinaryOp { pos, .. }
            | Expr::UnaryOp { pos, .. }
            | Expr::Error { pos } => *pos,
        }
    }
}

/// Immutable expression tree for one source file. Nodes live in an arena
/// and reference each other by [`ExprId`]; spans live in the side table.
#[derive(Debug)]
pub struct Ast {
    nodes: Vec<Expr>,
    pub root: ExprId,
    pub positions: PosTable,
}

impl Ast {
    pub(crate) fn new(nodes: Vec<Expr>, root: ExprId, positions: PosTable) -> Self {
        Ast {
            nodes,
            root,
            positions,
        }
    }

    pub fn node(&self, id: ExprId) -> &Expr {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ExprId> {
        (0..self.nodes.len()).map(ExprId::new)
    }

    pub fn span(&self, id: ExprId) -> Span {
        self.positions.span(self.node(id).pos())
    }

    /// Invoke `f` on every direct child of `id`, in source order.
    /// Descent for every variant is encoded here and nowhere else.
    pub fn for_each_child(&self, id: ExprId, mut f: impl FnMut(ExprId)) {
        match self.node(id) {
            Expr::Int { .. }
            | Expr::Float { .. }
            | Expr::Path { .. }
            | Expr::SearchPath { .. }
            | Expr::Var { .. }
            | Expr::Error { .. } => {}
            Expr::Str { parts, .. } => {
                for part in parts {
                    if let StrPart::Interp(e) = part {
                        f(*e);
                    }
                }
            }
            Expr::List { items, .. } => {
                for item in items {
                    f(*item);
                }
            }
            Expr::AttrSet { attrs, dynamic, .. } => {
                for attr in attrs {
                    f(attr.value);
                }
                for dyn_attr in dynamic {
                    f(dyn_attr.name);
                    f(dyn_attr.value);
                }
            }
            Expr::Let { attrs, body, .. } => {
                for attr in attrs {
                    f(attr.value);
                }
                f(*body);
            }
            Expr::Lambda { formals, body, .. } => {
                if let Some(formals) = formals {
                    for formal in &formals.formals {
                        if let Some(default) = formal.default {
                            f(default);
                        }
                    }
                }
                f(*body);
            }
            Expr::Apply { func, arg, .. } => {
                f(*func);
                f(*arg);
            }
            Expr::Select {
                base,
                path,
                default,
                ..
            } => {
                f(*base);
                for seg in path {
                    if let AttrName::Dynamic(e) = seg {
                        f(*e);
                    }
                }
                if let Some(default) = default {
                    f(*default);
                }
            }
            Expr::HasAttr { base, path, .. } => {
                f(*base);
                for seg in path {
                    if let AttrName::Dynamic(e) = seg {
                        f(*e);
                    }
                }
            }
            Expr::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                f(*cond);
                f(*then_body);
                f(*else_body);
            }
            Expr::With { scope, body, .. } | Expr::Assert { cond: scope, body, .. } => {
                f(*scope);
                f(*body);
            }
            Expr::BinaryOp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Expr::UnaryOp { operand, .. } => {
                f(*operand);
            }
        }
    }

    /// Depth-first walk from `id` with pre-order and post-order hooks.
    pub fn walk(
        &self,
        id: ExprId,
        pre: &mut impl FnMut(ExprId),
        post: &mut impl FnMut(ExprId),
    ) {
        pre(id);
        let mut children = Vec::new();
        self.for_each_child(id, |child| children.push(child));
        for child in children {
            self.walk(child, pre, post);
        }
        post(id);
    }
}
