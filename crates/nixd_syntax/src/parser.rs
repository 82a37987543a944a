use crate::ast::{
    AttrDef, AttrName, Ast, BinOp, DynamicAttrDef, Expr, ExprId, Formal, Formals, PosIdx,
    PosTable, StrPart, UnOp, VarBinding,
};
use crate::diagnostics::{merge_span, Diagnostic, Span};
use crate::lexer::{lex, Token, TokenKind};
use crate::symbols::SymbolTable;

/// Result of parsing one source file. The tree is always well-formed;
/// syntax errors surface as diagnostics plus `Expr::Error` nodes.
#[derive(Debug)]
pub struct Parse {
    pub ast: Ast,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn parse(source: &str) -> Parse {
    let (tokens, mut diagnostics) = lex(source);
    let mut parser = Parser {
        tokens,
        pos: 0,
        nodes: Vec::new(),
        positions: PosTable::default(),
        symbols: SymbolTable::new(),
        diagnostics: Vec::new(),
    };
    let root = parser.parse_root();
    diagnostics.append(&mut parser.diagnostics);
    Parse {
        ast: Ast::new(parser.nodes, root, parser.positions),
        symbols: parser.symbols,
        diagnostics,
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nodes: Vec<Expr>,
    positions: PosTable,
    symbols: SymbolTable,
    diagnostics: Vec<Diagnostic>,
}

struct Checkpoint {
    pos: usize,
    nodes: usize,
    positions: usize,
    diagnostics: usize,
}

impl Parser {
    fn parse_root(&mut self) -> ExprId {
        if self.tokens.is_empty() {
            let span = Span::point(1, 1);
            return self.add_expr(span, |pos| Expr::Error { pos });
        }
        let root = self.parse_expr();
        if let Some(token) = self.peek() {
            self.diagnostics.push(Diagnostic::new(
                "E0100",
                format!("unexpected '{}' after expression", token.text),
                token.span,
            ));
        }
        root
    }

    // ------------------------------------------------------------------
    // Cursor helpers

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check_symbol(&self, text: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Symbol && t.text == text)
    }

    fn check_keyword(&self, text: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword && t.text == text)
    }

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|t| t.kind == kind)
    }

    fn consume_symbol(&mut self, text: &str) -> bool {
        if self.check_symbol(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_keyword(&mut self, text: &str) -> bool {
        if self.check_keyword(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, text: &str, message: &str) {
        if !self.consume_symbol(text) {
            let span = self.current_span();
            self.diagnostics
                .push(Diagnostic::new("E0101", message.to_string(), span));
        }
    }

    fn expect_keyword(&mut self, text: &str, message: &str) {
        if !self.consume_keyword(text) {
            let span = self.current_span();
            self.diagnostics
                .push(Diagnostic::new("E0101", message.to_string(), span));
        }
    }

    fn current_span(&self) -> Span {
        match self.peek() {
            Some(token) => token.span,
            None => self.previous_span(),
        }
    }

    fn previous_span(&self) -> Span {
        if self.pos == 0 {
            return Span::point(1, 1);
        }
        self.tokens[self.pos - 1].span
    }

    fn end_span(&self) -> Span {
        let span = self.previous_span();
        Span {
            start: span.end,
            end: span.end,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            pos: self.pos,
            nodes: self.nodes.len(),
            positions: self.positions.len(),
            diagnostics: self.diagnostics.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.pos = checkpoint.pos;
        self.nodes.truncate(checkpoint.nodes);
        self.positions.truncate(checkpoint.positions);
        self.diagnostics.truncate(checkpoint.diagnostics);
    }

    // ------------------------------------------------------------------
    // Node construction

    fn add_expr(&mut self, span: Span, make: impl FnOnce(PosIdx) -> Expr) -> ExprId {
        let pos = self.positions.add(span);
        let id = ExprId::new(self.nodes.len());
        self.nodes.push(make(pos));
        id
    }

    fn node_span(&self, id: ExprId) -> Span {
        self.positions.span(self.nodes[id.index()].pos())
    }

    fn error_expr(&mut self, code: &str, message: impl Into<String>, span: Span) -> ExprId {
        self.diagnostics.push(Diagnostic::new(code, message, span));
        self.add_expr(span, |pos| Expr::Error { pos })
    }

    /// Rebuild a subtree with fresh node ids. `inherit (src) a b;` expands
    /// into one selection per name, and nodes must not share children.
    fn clone_subtree(&mut self, id: ExprId) -> ExprId {
        let node = self.nodes[id.index()].clone();
        let span = self.node_span(id);
        match node {
            Expr::Int { value, .. } => self.add_expr(span, |pos| Expr::Int { value, pos }),
            Expr::Float { value, .. } => self.add_expr(span, |pos| Expr::Float { value, pos }),
            Expr::Path { text, .. } => self.add_expr(span, |pos| Expr::Path { text, pos }),
            Expr::SearchPath { text, .. } => {
                self.add_expr(span, |pos| Expr::SearchPath { text, pos })
            }
            Expr::Var { name, .. } => self.add_expr(span, |pos| Expr::Var {
                name,
                pos,
                binding: VarBinding::Unresolved,
            }),
            Expr::Error { .. } => self.add_expr(span, |pos| Expr::Error { pos }),
            Expr::Str { parts, .. } => {
                let parts = parts
                    .into_iter()
                    .map(|part| match part {
                        StrPart::Lit(text) => StrPart::Lit(text),
                        StrPart::Interp(e) => StrPart::Interp(self.clone_subtree(e)),
                    })
                    .collect();
                self.add_expr(span, |pos| Expr::Str { parts, pos })
            }
            Expr::List { items, .. } => {
                let items = items.into_iter().map(|e| self.clone_subtree(e)).collect();
                self.add_expr(span, |pos| Expr::List { items, pos })
            }
            Expr::AttrSet {
                recursive,
                attrs,
                dynamic,
                ..
            } => {
                let attrs = attrs
                    .into_iter()
                    .map(|a| AttrDef {
                        value: self.clone_subtree(a.value),
                        ..a
                    })
                    .collect();
                let dynamic = dynamic
                    .into_iter()
                    .map(|d| DynamicAttrDef {
                        name: self.clone_subtree(d.name),
                        value: self.clone_subtree(d.value),
                    })
                    .collect();
                self.add_expr(span, |pos| Expr::AttrSet {
                    recursive,
                    attrs,
                    dynamic,
                    pos,
                })
            }
            Expr::Let { attrs, body, .. } => {
                let attrs = attrs
                    .into_iter()
                    .map(|a| AttrDef {
                        value: self.clone_subtree(a.value),
                        ..a
                    })
                    .collect();
                let body = self.clone_subtree(body);
                self.add_expr(span, |pos| Expr::Let { attrs, body, pos })
            }
            Expr::Lambda {
                arg, formals, body, ..
            } => {
                let formals = formals.map(|f| Formals {
                    formals: f
                        .formals
                        .into_iter()
                        .map(|formal| Formal {
                            default: formal.default.map(|d| self.clone_subtree(d)),
                            ..formal
                        })
                        .collect(),
                    ellipsis: f.ellipsis,
                });
                let body = self.clone_subtree(body);
                self.add_expr(span, |pos| Expr::Lambda {
                    arg,
                    formals,
                    body,
                    pos,
                })
            }
            Expr::Apply { func, arg, .. } => {
                let func = self.clone_subtree(func);
                let arg = self.clone_subtree(arg);
                self.add_expr(span, |pos| Expr::Apply { func, arg, pos })
            }
            Expr::Select {
                base,
                path,
                default,
                ..
            } => {
                let base = self.clone_subtree(base);
                let path = path
                    .into_iter()
                    .map(|seg| match seg {
                        AttrName::Static { name, pos } => AttrName::Static { name, pos },
                        AttrName::Dynamic(e) => AttrName::Dynamic(self.clone_subtree(e)),
                    })
                    .collect();
                let default = default.map(|d| self.clone_subtree(d));
                self.add_expr(span, |pos| Expr::Select {
                    base,
                    path,
                    default,
                    pos,
                })
            }
            Expr::HasAttr { base, path, .. } => {
                let base = self.clone_subtree(base);
                let path = path
                    .into_iter()
                    .map(|seg| match seg {
                        AttrName::Static { name, pos } => AttrName::Static { name, pos },
                        AttrName::Dynamic(e) => AttrName::Dynamic(self.clone_subtree(e)),
                    })
                    .collect();
                self.add_expr(span, |pos| Expr::HasAttr { base, path, pos })
            }
            Expr::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let cond = self.clone_subtree(cond);
                let then_body = self.clone_subtree(then_body);
                let else_body = self.clone_subtree(else_body);
                self.add_expr(span, |pos| Expr::If {
                    cond,
                    then_body,
                    else_body,
                    pos,
                })
            }
            Expr::With { scope, body, .. } => {
                let scope = self.clone_subtree(scope);
                let body = self.clone_subtree(body);
                self.add_expr(span, |pos| Expr::With { scope, body, pos })
            }
            Expr::Assert { cond, body, .. } => {
                let cond = self.clone_subtree(cond);
                let body = self.clone_subtree(body);
                self.add_expr(span, |pos| Expr::Assert { cond, body, pos })
            }
            Expr::BinaryOp { op, lhs, rhs, .. } => {
                let lhs = self.clone_subtree(lhs);
                let rhs = self.clone_subtree(rhs);
                self.add_expr(span, |pos| Expr::BinaryOp { op, lhs, rhs, pos })
            }
            Expr::UnaryOp { op, operand, .. } => {
                let operand = self.clone_subtree(operand);
                self.add_expr(span, |pos| Expr::UnaryOp { op, operand, pos })
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn parse_expr(&mut self) -> ExprId {
        if self.check_keyword("let") {
            return self.parse_let();
        }
        if self.check_keyword("if") {
            return self.parse_if();
        }
        if self.check_keyword("with") {
            return self.parse_with();
        }
        if self.check_keyword("assert") {
            return self.parse_assert();
        }
        if let Some(lambda) = self.try_parse_lambda() {
            return lambda;
        }
        self.parse_implies()
    }

    fn parse_let(&mut self) -> ExprId {
        let start = self.current_span();
        self.bump();
        let attrs = self.parse_bindings(|p| p.check_keyword("in"));
        self.expect_keyword("in", "expected 'in' after let bindings");
        let body = self.parse_expr();
        let span = merge_span(start, self.node_span(body));
        self.add_expr(span, |pos| Expr::Let { attrs, body, pos })
    }

    fn parse_if(&mut self) -> ExprId {
        let start = self.current_span();
        self.bump();
        let cond = self.parse_expr();
        self.expect_keyword("then", "expected 'then'");
        let then_body = self.parse_expr();
        self.expect_keyword("else", "expected 'else'");
        let else_body = self.parse_expr();
        let span = merge_span(start, self.node_span(else_body));
        self.add_expr(span, |pos| Expr::If {
            cond,
            then_body,
            else_body,
            pos,
        })
    }

    fn parse_with(&mut self) -> ExprId {
        let start = self.current_span();
        self.bump();
        let scope = self.parse_expr();
        self.expect_symbol(";", "expected ';' after with scope");
        let body = self.parse_expr();
        let span = merge_span(start, self.node_span(body));
        self.add_expr(span, |pos| Expr::With { scope, body, pos })
    }

    fn parse_assert(&mut self) -> ExprId {
        let start = self.current_span();
        self.bump();
        let cond = self.parse_expr();
        self.expect_symbol(";", "expected ';' after assert condition");
        let body = self.parse_expr();
        let span = merge_span(start, self.node_span(body));
        self.add_expr(span, |pos| Expr::Assert { cond, body, pos })
    }

    fn try_parse_lambda(&mut self) -> Option<ExprId> {
        if self.check_kind(TokenKind::Ident) {
            let next = self.peek_at(1);
            let is_lambda_head = next.is_some_and(|t| {
                t.kind == TokenKind::Symbol && (t.text == ":" || t.text == "@")
            });
            if !is_lambda_head {
                return None;
            }
            let token = self.bump()?;
            let name = self.symbols.intern(&token.text);
            let arg_pos = self.positions.add(token.span);
            if self.consume_symbol("@") {
                let checkpoint = self.checkpoint();
                let Some(formals) = self.parse_formals() else {
                    self.restore(checkpoint);
                    let span = self.current_span();
                    let body = self.error_expr("E0102", "expected formals after '@'", span);
                    let span = merge_span(token.span, span);
                    return Some(self.add_expr(span, |pos| Expr::Lambda {
                        arg: Some((name, arg_pos)),
                        formals: None,
                        body,
                        pos,
                    }));
                };
                self.expect_symbol(":", "expected ':' after lambda formals");
                let body = self.parse_expr();
                let span = merge_span(token.span, self.node_span(body));
                return Some(self.add_expr(span, |pos| Expr::Lambda {
                    arg: Some((name, arg_pos)),
                    formals: Some(formals),
                    body,
                    pos,
                }));
            }
            self.expect_symbol(":", "expected ':' in lambda");
            let body = self.parse_expr();
            let span = merge_span(token.span, self.node_span(body));
            return Some(self.add_expr(span, |pos| Expr::Lambda {
                arg: Some((name, arg_pos)),
                formals: None,
                body,
                pos,
            }));
        }

        if self.check_symbol("{") {
            let checkpoint = self.checkpoint();
            let start = self.current_span();
            let Some(formals) = self.parse_formals() else {
                self.restore(checkpoint);
                return None;
            };
            let arg = if self.consume_symbol("@") {
                match self.bump() {
                    Some(token) if token.kind == TokenKind::Ident => {
                        let name = self.symbols.intern(&token.text);
                        let pos = self.positions.add(token.span);
                        Some((name, pos))
                    }
                    _ => {
                        self.restore(checkpoint);
                        return None;
                    }
                }
            } else {
                None
            };
            if !self.consume_symbol(":") {
                self.restore(checkpoint);
                return None;
            }
            let body = self.parse_expr();
            let span = merge_span(start, self.node_span(body));
            return Some(self.add_expr(span, |pos| Expr::Lambda {
                arg,
                formals: Some(formals),
                body,
                pos,
            }));
        }

        None
    }

    /// Parses `{ a, b ? default, ... }`. Returns `None` (to be backtracked)
    /// when the braces turn out to delimit an attribute set instead.
    fn parse_formals(&mut self) -> Option<Formals> {
        if !self.consume_symbol("{") {
            return None;
        }
        let mut formals = Vec::new();
        let mut ellipsis = false;
        loop {
            if self.consume_symbol("}") {
                return Some(Formals { formals, ellipsis });
            }
            if self.consume_symbol("...") {
                ellipsis = true;
            } else if self.check_kind(TokenKind::Ident) {
                let token = self.bump()?;
                let name = self.symbols.intern(&token.text);
                let pos = self.positions.add(token.span);
                let default = if self.consume_symbol("?") {
                    Some(self.parse_expr())
                } else {
                    None
                };
                formals.push(Formal { name, pos, default });
            } else {
                return None;
            }
            if self.consume_symbol(",") {
                continue;
            }
            if self.check_symbol("}") {
                continue;
            }
            return None;
        }
    }

    // Operator cascade, loosest first.

    fn parse_implies(&mut self) -> ExprId {
        let lhs = self.parse_or_op();
        if self.consume_symbol("->") {
            let rhs = self.parse_implies();
            return self.binary(BinOp::Implies, lhs, rhs);
        }
        lhs
    }

    fn parse_or_op(&mut self) -> ExprId {
        let mut lhs = self.parse_and_op();
        while self.consume_symbol("||") {
            let rhs = self.parse_and_op();
            lhs = self.binary(BinOp::Or, lhs, rhs);
        }
        lhs
    }

    fn parse_and_op(&mut self) -> ExprId {
        let mut lhs = self.parse_eq();
        while self.consume_symbol("&&") {
            let rhs = self.parse_eq();
            lhs = self.binary(BinOp::And, lhs, rhs);
        }
        lhs
    }

    fn parse_eq(&mut self) -> ExprId {
        let lhs = self.parse_cmp();
        let op = if self.consume_symbol("==") {
            BinOp::Equal
        } else if self.consume_symbol("!=") {
            BinOp::NotEqual
        } else {
            return lhs;
        };
        let rhs = self.parse_cmp();
        self.binary(op, lhs, rhs)
    }

    fn parse_cmp(&mut self) -> ExprId {
        let lhs = self.parse_update();
        let op = if self.consume_symbol("<=") {
            BinOp::LessEq
        } else if self.consume_symbol(">=") {
            BinOp::GreaterEq
        } else if self.consume_symbol("<") {
            BinOp::Less
        } else if self.consume_symbol(">") {
            BinOp::Greater
        } else {
            return lhs;
        };
        let rhs = self.parse_update();
        self.binary(op, lhs, rhs)
    }

    fn parse_update(&mut self) -> ExprId {
        let lhs = self.parse_not();
        if self.consume_symbol("//") {
            let rhs = self.parse_update();
            return self.binary(BinOp::Update, lhs, rhs);
        }
        lhs
    }

    fn parse_not(&mut self) -> ExprId {
        if self.check_symbol("!") {
            let start = self.current_span();
            self.bump();
            let operand = self.parse_not();
            let span = merge_span(start, self.node_span(operand));
            return self.add_expr(span, |pos| Expr::UnaryOp {
                op: UnOp::Not,
                operand,
                pos,
            });
        }
        self.parse_add()
    }

    fn parse_add(&mut self) -> ExprId {
        let mut lhs = self.parse_mul();
        loop {
            let op = if self.consume_symbol("+") {
                BinOp::Add
            } else if self.consume_symbol("-") {
                BinOp::Sub
            } else {
                return lhs;
            };
            let rhs = self.parse_mul();
            lhs = self.binary(op, lhs, rhs);
        }
    }

    fn parse_mul(&mut self) -> ExprId {
        let mut lhs = self.parse_concat();
        loop {
            let op = if self.consume_symbol("*") {
                BinOp::Mul
            } else if self.consume_symbol("/") {
                BinOp::Div
            } else {
                return lhs;
            };
            let rhs = self.parse_concat();
            lhs = self.binary(op, lhs, rhs);
        }
    }

    fn parse_concat(&mut self) -> ExprId {
        let lhs = self.parse_has_attr();
        if self.consume_symbol("++") {
            let rhs = self.parse_concat();
            return self.binary(BinOp::Concat, lhs, rhs);
        }
        lhs
    }

    fn parse_has_attr(&mut self) -> ExprId {
        let lhs = self.parse_neg();
        if self.consume_symbol("?") {
            let path = self.parse_attrpath();
            let span = merge_span(self.node_span(lhs), self.previous_span());
            return self.add_expr(span, |pos| Expr::HasAttr {
                base: lhs,
                path,
                pos,
            });
        }
        lhs
    }

    fn parse_neg(&mut self) -> ExprId {
        if self.check_symbol("-") {
            let start = self.current_span();
            self.bump();
            let operand = self.parse_neg();
            let span = merge_span(start, self.node_span(operand));
            return self.add_expr(span, |pos| Expr::UnaryOp {
                op: UnOp::Negate,
                operand,
                pos,
            });
        }
        self.parse_app()
    }

    fn parse_app(&mut self) -> ExprId {
        let mut func = self.parse_select_expr();
        while self.starts_atom() {
            let arg = self.parse_select_expr();
            let span = merge_span(self.node_span(func), self.node_span(arg));
            func = self.add_expr(span, |pos| Expr::Apply { func, arg, pos });
        }
        func
    }

    fn starts_atom(&self) -> bool {
        let Some(token) = self.peek() else {
            return false;
        };
        match token.kind {
            TokenKind::Ident
            | TokenKind::Int
            | TokenKind::Float
            | TokenKind::Path
            | TokenKind::SearchPath
            | TokenKind::StrOpen
            | TokenKind::IndStrOpen => true,
            TokenKind::Keyword => token.text == "rec",
            TokenKind::Symbol => matches!(token.text.as_str(), "(" | "{" | "["),
            _ => false,
        }
    }

    fn parse_select_expr(&mut self) -> ExprId {
        let mut base = self.parse_atom();
        while self.consume_symbol(".") {
            let path = self.parse_attrpath();
            let default = if self.consume_keyword("or") {
                Some(self.parse_select_expr())
            } else {
                None
            };
            let end = match default {
                Some(d) => self.node_span(d),
                None => self.previous_span(),
            };
            let span = merge_span(self.node_span(base), end);
            base = self.add_expr(span, |pos| Expr::Select {
                base,
                path,
                default,
                pos,
            });
        }
        base
    }

    fn parse_attrpath(&mut self) -> Vec<AttrName> {
        let mut path = Vec::new();
        loop {
            if let Some(seg) = self.parse_attrname() {
                path.push(seg);
            } else {
                let span = self.current_span();
                self.diagnostics.push(Diagnostic::new(
                    "E0103",
                    "expected attribute name",
                    span,
                ));
                break;
            }
            if !self.consume_symbol(".") {
                break;
            }
        }
        path
    }

    fn parse_attrname(&mut self) -> Option<AttrName> {
        if self.check_kind(TokenKind::Ident) {
            let token = self.bump()?;
            let name = self.symbols.intern(&token.text);
            let pos = self.positions.add(token.span);
            return Some(AttrName::Static { name, pos });
        }
        if self.check_kind(TokenKind::StrOpen) {
            let string = self.parse_string(TokenKind::StrClose);
            if let Expr::Str { parts, pos } = &self.nodes[string.index()] {
                if let [StrPart::Lit(text)] = parts.as_slice() {
                    let name = self.symbols.intern(text);
                    return Some(AttrName::Static { name, pos: *pos });
                }
                if parts.is_empty() {
                    let name = self.symbols.intern("");
                    return Some(AttrName::Static { name, pos: *pos });
                }
            }
            return Some(AttrName::Dynamic(string));
        }
        if self.check_kind(TokenKind::InterpOpen) {
            self.bump();
            let expr = self.parse_expr();
            self.expect_symbol("}", "expected '}' after interpolated attribute name");
            return Some(AttrName::Dynamic(expr));
        }
        None
    }

    fn parse_atom(&mut self) -> ExprId {
        let Some(token) = self.peek().cloned() else {
            let span = self.end_span();
            return self.error_expr("E0104", "expected expression", span);
        };
        match token.kind {
            TokenKind::Int => {
                self.bump();
                let value = match token.text.parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => {
                        self.diagnostics.push(Diagnostic::new(
                            "E0105",
                            "integer literal out of range",
                            token.span,
                        ));
                        0
                    }
                };
                self.add_expr(token.span, |pos| Expr::Int { value, pos })
            }
            TokenKind::Float => {
                self.bump();
                let value = token.text.parse::<f64>().unwrap_or(0.0);
                self.add_expr(token.span, |pos| Expr::Float { value, pos })
            }
            TokenKind::Path => {
                self.bump();
                self.add_expr(token.span, |pos| Expr::Path {
                    text: token.text,
                    pos,
                })
            }
            TokenKind::SearchPath => {
                self.bump();
                let text = token.text[1..token.text.len() - 1].to_string();
                self.add_expr(token.span, |pos| Expr::SearchPath { text, pos })
            }
            TokenKind::Ident => {
                self.bump();
                let name = self.symbols.intern(&token.text);
                self.add_expr(token.span, |pos| Expr::Var {
                    name,
                    pos,
                    binding: VarBinding::Unresolved,
                })
            }
            TokenKind::StrOpen => self.parse_string(TokenKind::StrClose),
            TokenKind::IndStrOpen => self.parse_string(TokenKind::IndStrClose),
            TokenKind::Keyword if token.text == "rec" => {
                self.bump();
                self.expect_symbol("{", "expected '{' after 'rec'");
                self.parse_attrset(true, token.span)
            }
            TokenKind::Symbol if token.text == "(" => {
                self.bump();
                let inner = self.parse_expr();
                self.expect_symbol(")", "expected ')'");
                inner
            }
            TokenKind::Symbol if token.text == "{" => {
                self.bump();
                self.parse_attrset(false, token.span)
            }
            TokenKind::Symbol if token.text == "[" => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    if self.consume_symbol("]") {
                        break;
                    }
                    if !self.starts_atom() {
                        let span = self.current_span();
                        self.diagnostics.push(Diagnostic::new(
                            "E0106",
                            "expected ']' to close list",
                            span,
                        ));
                        break;
                    }
                    items.push(self.parse_select_expr());
                }
                let span = merge_span(token.span, self.previous_span());
                self.add_expr(span, |pos| Expr::List { items, pos })
            }
            _ => {
                let span = token.span;
                self.error_expr(
                    "E0104",
                    format!("expected expression, found '{}'", token.text),
                    span,
                )
            }
        }
    }

    fn parse_string(&mut self, close: TokenKind) -> ExprId {
        let Some(open) = self.bump() else {
            let span = self.end_span();
            return self.error_expr("E0104", "expected string literal", span);
        };
        let mut parts = Vec::new();
        loop {
            let Some(token) = self.peek().cloned() else {
                break;
            };
            if token.kind == close {
                self.bump();
                break;
            }
            match token.kind {
                TokenKind::StrLit => {
                    self.bump();
                    parts.push(StrPart::Lit(token.text));
                }
                TokenKind::InterpOpen => {
                    self.bump();
                    let expr = self.parse_expr();
                    self.expect_symbol("}", "expected '}' after interpolation");
                    parts.push(StrPart::Interp(expr));
                }
                _ => break,
            }
        }
        let span = merge_span(open.span, self.previous_span());
        self.add_expr(span, |pos| Expr::Str { parts, pos })
    }

    fn binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        let span = merge_span(self.node_span(lhs), self.node_span(rhs));
        self.add_expr(span, |pos| Expr::BinaryOp { op, lhs, rhs, pos })
    }

    // ------------------------------------------------------------------
    // Bindings (attribute sets and let)

    fn parse_attrset(&mut self, recursive: bool, open_span: Span) -> ExprId {
        let mut attrs = Vec::new();
        let mut dynamic = Vec::new();
        self.parse_binding_list(&mut attrs, &mut dynamic, |p| p.check_symbol("}"));
        self.expect_symbol("}", "expected '}' to close attribute set");
        let span = merge_span(open_span, self.previous_span());
        self.add_expr(span, |pos| Expr::AttrSet {
            recursive,
            attrs,
            dynamic,
            pos,
        })
    }

    fn parse_bindings(&mut self, at_end: impl Fn(&Parser) -> bool) -> Vec<AttrDef> {
        let mut attrs = Vec::new();
        let mut dynamic = Vec::new();
        self.parse_binding_list(&mut attrs, &mut dynamic, at_end);
        for dyn_attr in dynamic {
            let span = self.node_span(dyn_attr.name);
            self.diagnostics.push(Diagnostic::new(
                "E0107",
                "dynamic attributes are not allowed in let",
                span,
            ));
        }
        attrs
    }

    fn parse_binding_list(
        &mut self,
        attrs: &mut Vec<AttrDef>,
        dynamic: &mut Vec<DynamicAttrDef>,
        at_end: impl Fn(&Parser) -> bool,
    ) {
        loop {
            if at_end(self) || self.peek().is_none() {
                return;
            }
            if self.consume_keyword("inherit") {
                self.parse_inherit(attrs);
                continue;
            }
            let Some(first) = self.parse_attrname() else {
                let span = self.current_span();
                self.diagnostics.push(Diagnostic::new(
                    "E0108",
                    "expected attribute binding",
                    span,
                ));
                self.bump();
                continue;
            };
            let mut rest = Vec::new();
            while self.consume_symbol(".") {
                match self.parse_attrname() {
                    Some(seg) => rest.push(seg),
                    None => break,
                }
            }
            self.expect_symbol("=", "expected '=' in attribute binding");
            let mut value = self.parse_expr();
            self.expect_symbol(";", "expected ';' after attribute binding");

            // a.b.c = v desugars to nested non-recursive sets.
            for seg in rest.into_iter().rev() {
                let span = self.node_span(value);
                let (seg_attrs, seg_dynamic) = match seg {
                    AttrName::Static { name, pos } => (
                        vec![AttrDef {
                            name,
                            name_pos: pos,
                            value,
                            inherited: false,
                        }],
                        Vec::new(),
                    ),
                    AttrName::Dynamic(name) => {
                        (Vec::new(), vec![DynamicAttrDef { name, value }])
                    }
                };
                value = self.add_expr(span, |pos| Expr::AttrSet {
                    recursive: false,
                    attrs: seg_attrs,
                    dynamic: seg_dynamic,
                    pos,
                });
            }

            match first {
                AttrName::Static { name, pos } => {
                    if attrs.iter().any(|a| a.name == name) {
                        self.diagnostics.push(Diagnostic::new(
                            "E0109",
                            format!("duplicate attribute '{}'", self.symbols.resolve(name)),
                            self.positions.span(pos),
                        ));
                    }
                    attrs.push(AttrDef {
                        name,
                        name_pos: pos,
                        value,
                        inherited: false,
                    });
                }
                AttrName::Dynamic(name) => dynamic.push(DynamicAttrDef { name, value }),
            }
        }
    }

    fn parse_inherit(&mut self, attrs: &mut Vec<AttrDef>) {
        let source = if self.consume_symbol("(") {
            let expr = self.parse_expr();
            self.expect_symbol(")", "expected ')' after inherit source");
            Some(expr)
        } else {
            None
        };
        let mut first_use_of_source = true;
        while self.check_kind(TokenKind::Ident) {
            let Some(token) = self.bump() else {
                break;
            };
            let name = self.symbols.intern(&token.text);
            let name_pos = self.positions.add(token.span);
            let value = match source {
                Some(src) => {
                    let base = if first_use_of_source {
                        src
                    } else {
                        self.clone_subtree(src)
                    };
                    first_use_of_source = false;
                    let path = vec![AttrName::Static {
                        name,
                        pos: name_pos,
                    }];
                    self.add_expr(token.span, |pos| Expr::Select {
                        base,
                        path,
                        default: None,
                        pos,
                    })
                }
                None => self.add_expr(token.span, |pos| Expr::Var {
                    name,
                    pos,
                    binding: VarBinding::Unresolved,
                }),
            };
            attrs.push(AttrDef {
                name,
                name_pos,
                value,
                inherited: true,
            });
        }
        self.expect_symbol(";", "expected ';' after inherit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_of(src: &str) -> (Parse, ExprId) {
        let parsed = parse(src);
        let root = parsed.ast.root;
        (parsed, root)
    }

    #[test]
    fn parses_let_structure() {
        let (parsed, root) = root_of("let x = 1; y = 2; in x");
        let Expr::Let { attrs, body, .. } = parsed.ast.node(root) else {
            panic!("expected let");
        };
        assert_eq!(attrs.len(), 2);
        assert!(matches!(parsed.ast.node(*body), Expr::Var { .. }));
        assert!(parsed.diagnostics.is_empty());
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let (parsed, root) = root_of("1 + 2 * 3");
        let Expr::BinaryOp { op, rhs, .. } = parsed.ast.node(root) else {
            panic!("expected binary op");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            parsed.ast.node(*rhs),
            Expr::BinaryOp { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn update_is_right_associative() {
        let (parsed, root) = root_of("a // b // c");
        let Expr::BinaryOp { op, rhs, .. } = parsed.ast.node(root) else {
            panic!("expected binary op");
        };
        assert_eq!(*op, BinOp::Update);
        assert!(matches!(
            parsed.ast.node(*rhs),
            Expr::BinaryOp {
                op: BinOp::Update,
                ..
            }
        ));
    }

    #[test]
    fn attrpath_desugars_to_nested_sets() {
        let (parsed, root) = root_of("{ a.b = 1; }");
        let Expr::AttrSet { attrs, .. } = parsed.ast.node(root) else {
            panic!("expected attrset");
        };
        assert_eq!(attrs.len(), 1);
        assert_eq!(parsed.symbols.resolve(attrs[0].name), "a");
        let Expr::AttrSet {
            recursive: false,
            attrs: inner,
            ..
        } = parsed.ast.node(attrs[0].value)
        else {
            panic!("expected synthesized attrset");
        };
        assert_eq!(parsed.symbols.resolve(inner[0].name), "b");
        assert!(matches!(
            parsed.ast.node(inner[0].value),
            Expr::Int { value: 1, .. }
        ));
    }

    #[test]
    fn lambda_forms_parse() {
        for src in ["x: x", "{ a, b ? 2, ... }: a", "args@{ a }: args", "{}: 1"] {
            let (parsed, root) = root_of(src);
            assert!(
                matches!(parsed.ast.node(root), Expr::Lambda { .. }),
                "{src} should parse as a lambda"
            );
            assert!(parsed.diagnostics.is_empty(), "{src} parses cleanly");
        }
    }

    #[test]
    fn empty_braces_are_an_attrset() {
        let (parsed, root) = root_of("{ }");
        assert!(matches!(
            parsed.ast.node(root),
            Expr::AttrSet {
                recursive: false,
                ..
            }
        ));
    }

    #[test]
    fn select_with_or_default() {
        let (parsed, root) = root_of("a.b or c");
        let Expr::Select { path, default, .. } = parsed.ast.node(root) else {
            panic!("expected select");
        };
        assert_eq!(path.len(), 1);
        assert!(default.is_some());
    }

    #[test]
    fn has_attr_takes_an_attrpath() {
        let (parsed, root) = root_of("a ? b.c");
        let Expr::HasAttr { path, .. } = parsed.ast.node(root) else {
            panic!("expected hasattr");
        };
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn inherit_from_clones_the_source() {
        let (parsed, root) = root_of("{ inherit (s) b c; }");
        let Expr::AttrSet { attrs, .. } = parsed.ast.node(root) else {
            panic!("expected attrset");
        };
        assert_eq!(attrs.len(), 2);
        assert!(attrs.iter().all(|a| a.inherited));
        let bases: Vec<ExprId> = attrs
            .iter()
            .map(|a| match parsed.ast.node(a.value) {
                Expr::Select { base, .. } => *base,
                other => panic!("expected select, got {other:?}"),
            })
            .collect();
        assert_ne!(bases[0], bases[1], "each selection owns its source");
    }

    #[test]
    fn string_interpolation_creates_parts() {
        let (parsed, root) = root_of(r#""a${x}b""#);
        let Expr::Str { parts, .. } = parsed.ast.node(root) else {
            panic!("expected string");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(parts[1], StrPart::Interp(_)));
    }

    #[test]
    fn list_elements_are_select_level() {
        let (parsed, root) = root_of("[ f x ]");
        let Expr::List { items, .. } = parsed.ast.node(root) else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn recovery_keeps_later_bindings() {
        let parsed = parse("{ a = 1; ; b = 2; }");
        assert!(!parsed.diagnostics.is_empty());
        let Expr::AttrSet { attrs, .. } = parsed.ast.node(parsed.ast.root) else {
            panic!("expected attrset");
        };
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn missing_value_yields_error_node() {
        let parsed = parse("let x = ; in x");
        assert!(parsed.diagnostics.iter().any(|d| d.code == "E0104"));
        let Expr::Let { attrs, .. } = parsed.ast.node(parsed.ast.root) else {
            panic!("expected let");
        };
        assert!(matches!(
            parsed.ast.node(attrs[0].value),
            Expr::Error { .. }
        ));
    }

    #[test]
    fn trailing_tokens_are_reported() {
        let parsed = parse("1; x");
        assert!(parsed.diagnostics.iter().any(|d| d.code == "E0100"));
    }

    #[test]
    fn empty_source_yields_error_root() {
        let parsed = parse("");
        assert!(matches!(
            parsed.ast.node(parsed.ast.root),
            Expr::Error { .. }
        ));
    }

    #[test]
    fn duplicate_attributes_are_reported() {
        let parsed = parse("{ a = 1; a = 2; }");
        assert!(parsed.diagnostics.iter().any(|d| d.code == "E0109"));
    }
}
