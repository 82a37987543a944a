use std::path::{Component, Path, PathBuf};

use crate::ast::{AttrName, Expr, ExprId, PosIdx, VarBinding};
use crate::binder::bind_variables;
use crate::diagnostics::{Diagnostic, Position, Span};
use crate::parser::parse;
use crate::resolver::{collect_symbols, definition_of, ParentMap, ResolveError};
use crate::symbols::SymbolTable;
use crate::Ast;

/// One parsed, bound, and indexed source file. Immutable once built;
/// concurrent readers share it freely.
#[derive(Debug)]
pub struct ParsedFile {
    pub path: String,
    pub ast: Ast,
    pub symbols: SymbolTable,
    pub parents: ParentMap,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionContext {
    /// The cursor names an attribute, e.g. a binding or option path.
    AttrName,
    /// The cursor sits in expression position.
    Value,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolEntryKind {
    Attribute,
    Function,
    Value,
}

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub kind: SymbolEntryKind,
    pub span: Span,
    pub selection: Span,
    pub children: Vec<SymbolEntry>,
}

impl ParsedFile {
    pub fn parse_source(path: &str, source: &str) -> ParsedFile {
        let parsed = parse(source);
        let mut ast = parsed.ast;
        let mut symbols = parsed.symbols;
        let mut diagnostics = parsed.diagnostics;
        diagnostics.extend(bind_variables(&mut ast, &mut symbols));
        let parents = ParentMap::build(&ast);
        ParsedFile {
            path: path.to_string(),
            ast,
            symbols,
            parents,
            diagnostics,
        }
    }

    /// Deepest node whose span contains `pos`.
    pub fn node_at(&self, pos: Position) -> Option<ExprId> {
        if !self.ast.span(self.ast.root).contains(pos) {
            return None;
        }
        let mut current = self.ast.root;
        loop {
            let mut next = None;
            self.ast.for_each_child(current, |child| {
                if next.is_none() && self.ast.span(child).contains(pos) {
                    next = Some(child);
                }
            });
            match next {
                Some(child) => current = child,
                None => return Some(current),
            }
        }
    }

    /// The static attribute-path segment under `pos`, if any.
    fn selector_at(&self, pos: Position) -> Option<PosIdx> {
        let mut found = None;
        let mut check = |id: ExprId| {
            let path = match self.ast.node(id) {
                Expr::Select { path, .. } | Expr::HasAttr { path, .. } => path,
                _ => return,
            };
            for seg in path {
                if let AttrName::Static { pos: seg_pos, .. } = seg {
                    if self.ast.positions.span(*seg_pos).contains(pos) {
                        found = Some(*seg_pos);
                    }
                }
            }
        };
        self.ast.walk(self.ast.root, &mut check, &mut |_| {});
        found
    }

    /// Statically locate the definition of the identifier under `pos`.
    pub fn definition(&self, pos: Position) -> Result<Span, ResolveError> {
        if self.selector_at(pos).is_some() {
            return Err(ResolveError::NotADefinition);
        }
        let node = self.node_at(pos).ok_or(ResolveError::NotFound)?;
        let def = definition_of(&self.ast, &self.parents, node)?;
        Ok(self.ast.positions.span(def))
    }

    pub fn completion_context(&self, pos: Position) -> CompletionContext {
        if self.selector_at(pos).is_some() {
            return CompletionContext::AttrName;
        }
        match self.node_at(pos).map(|id| self.ast.node(id)) {
            Some(Expr::AttrSet { .. }) => CompletionContext::AttrName,
            Some(Expr::Error { .. }) | None => CompletionContext::Unknown,
            Some(_) => CompletionContext::Value,
        }
    }

    /// Identifier names statically visible at `pos`, innermost first.
    pub fn scope_completions(&self, pos: Position) -> Vec<String> {
        let Some(node) = self.node_at(pos) else {
            return Vec::new();
        };
        collect_symbols(&self.ast, &self.parents, node)
            .into_iter()
            .map(|sym| self.symbols.resolve(sym).to_string())
            .collect()
    }

    pub fn document_symbols(&self) -> Vec<SymbolEntry> {
        self.symbols_of(self.ast.root)
    }

    fn symbols_of(&self, id: ExprId) -> Vec<SymbolEntry> {
        match self.ast.node(id) {
            Expr::AttrSet { attrs, .. } | Expr::Let { attrs, .. } => attrs
                .iter()
                .map(|attr| {
                    let selection = self.ast.positions.span(attr.name_pos);
                    let value_span = self.ast.span(attr.value);
                    let kind = match self.ast.node(attr.value) {
                        Expr::Lambda { .. } => SymbolEntryKind::Function,
                        Expr::AttrSet { .. } => SymbolEntryKind::Attribute,
                        _ => SymbolEntryKind::Value,
                    };
                    SymbolEntry {
                        name: self.symbols.resolve(attr.name).to_string(),
                        kind,
                        span: Span {
                            start: selection.start,
                            end: value_span.end,
                        },
                        selection,
                        children: self.symbols_of(attr.value),
                    }
                })
                .collect(),
            Expr::Lambda { body, .. }
            | Expr::With { body, .. }
            | Expr::Assert { body, .. } => self.symbols_of(*body),
            _ => Vec::new(),
        }
    }

    /// Path literals resolved against the file's directory.
    pub fn document_links(&self) -> Vec<(Span, PathBuf)> {
        let base = Path::new(&self.path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut links = Vec::new();
        let mut collect = |id: ExprId| {
            if let Expr::Path { text, .. } = self.ast.node(id) {
                let target = if text.starts_with('/') {
                    PathBuf::from(text)
                } else {
                    normalize(&base.join(text))
                };
                links.push((self.ast.span(id), target));
            }
        };
        self.ast.walk(self.ast.root, &mut collect, &mut |_| {});
        links
    }

    /// The binding occurrence addressed by `pos`, either directly (the
    /// cursor is on a binding name) or through a variable reference.
    fn rename_target(&self, pos: Position) -> Option<(PosIdx, Span)> {
        for id in self.reachable() {
            let candidates: Vec<PosIdx> = match self.ast.node(id) {
                Expr::Let { attrs, .. } => attrs.iter().map(|a| a.name_pos).collect(),
                Expr::AttrSet {
                    recursive: true,
                    attrs,
                    ..
                } => attrs.iter().map(|a| a.name_pos).collect(),
                Expr::Lambda { arg, formals, .. } => {
                    let mut out: Vec<PosIdx> = arg.iter().map(|(_, p)| *p).collect();
                    if let Some(formals) = formals {
                        out.extend(formals.formals.iter().map(|f| f.pos));
                    }
                    out
                }
                _ => continue,
            };
            for name_pos in candidates {
                let span = self.ast.positions.span(name_pos);
                if span.contains(pos) {
                    return Some((name_pos, span));
                }
            }
        }

        let node = self.node_at(pos)?;
        if !matches!(
            self.ast.node(node),
            Expr::Var {
                binding: VarBinding::Static { .. },
                ..
            }
        ) {
            return None;
        }
        let def = definition_of(&self.ast, &self.parents, node).ok()?;
        Some((def, self.ast.positions.span(def)))
    }

    pub fn prepare_rename(&self, pos: Position) -> Option<Span> {
        // Highlight the identifier under the cursor, not the binding.
        if let Some(node) = self.node_at(pos) {
            if matches!(
                self.ast.node(node),
                Expr::Var {
                    binding: VarBinding::Static { .. },
                    ..
                }
            ) {
                return Some(self.ast.span(node));
            }
        }
        self.rename_target(pos).map(|(_, span)| span)
    }

    /// Edits renaming a binding and every reference that resolves to it.
    pub fn rename(&self, pos: Position, new_name: &str) -> Option<Vec<(Span, String)>> {
        let (target, target_span) = self.rename_target(pos)?;
        let mut edits = vec![(target_span, new_name.to_string())];
        for id in self.reachable() {
            if !matches!(
                self.ast.node(id),
                Expr::Var {
                    binding: VarBinding::Static { .. },
                    ..
                }
            ) {
                continue;
            }
            if definition_of(&self.ast, &self.parents, id) == Ok(target) {
                edits.push((self.ast.span(id), new_name.to_string()));
            }
        }
        Some(edits)
    }

    pub fn hover(&self, pos: Position) -> Option<String> {
        let node = self.node_at(pos)?;
        let text = match self.ast.node(node) {
            Expr::Var { name, binding, .. } => {
                let name = self.symbols.resolve(*name);
                match binding {
                    VarBinding::Static { .. } => {
                        match definition_of(&self.ast, &self.parents, node) {
                            Ok(def) => {
                                let def_pos = self.ast.positions.span(def).start;
                                format!("`{name}`\n\nbound at line {}", def_pos.line)
                            }
                            Err(_) => format!("`{name}`"),
                        }
                    }
                    VarBinding::FromWith => format!("`{name}`\n\nbrought into scope by `with`"),
                    _ => format!("`{name}`"),
                }
            }
            Expr::Int { value, .. } => format!("`{value}`: integer"),
            Expr::Float { value, .. } => format!("`{value}`: float"),
            Expr::Str { .. } => "string".to_string(),
            Expr::Path { text, .. } => format!("path `{text}`"),
            Expr::SearchPath { text, .. } => format!("search path `<{text}>`"),
            Expr::Lambda { .. } => "function".to_string(),
            Expr::AttrSet {
                recursive, attrs, ..
            } => {
                let rec = if *recursive { "recursive " } else { "" };
                format!("{rec}attribute set of {} attributes", attrs.len())
            }
            Expr::List { items, .. } => format!("list of {} elements", items.len()),
            _ => return None,
        };
        Some(text)
    }

    fn reachable(&self) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut collect = |id: ExprId| out.push(id);
        self.ast.walk(self.ast.root, &mut collect, &mut |_| {});
        out
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(src: &str) -> ParsedFile {
        ParsedFile::parse_source("/ws/a.nix", src)
    }

    fn pos_of(src: &str, needle: &str) -> Position {
        let offset = src.find(needle).expect("needle exists");
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in src.char_indices() {
            if idx == offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Position { line, column }
    }

    #[test]
    fn definition_of_let_body_use() {
        let src = "let x = 1; in x";
        let parsed = file(src);
        let span = parsed
            .definition(Position { line: 1, column: 15 })
            .expect("resolves");
        assert_eq!(span.start, Position { line: 1, column: 5 });
    }

    #[test]
    fn definition_in_plain_attrset_is_unbound() {
        let parsed = file("{ a = 1; b = a; }");
        let pos = Position {
            line: 1,
            column: 14,
        };
        assert_eq!(parsed.definition(pos), Err(ResolveError::Unbound));
    }

    #[test]
    fn definition_in_recursive_attrset() {
        let src = "rec { a = 1; b = a; }";
        let parsed = file(src);
        let span = parsed
            .definition(pos_of(src, "a; }"))
            .expect("resolves");
        assert_eq!(span.start, Position { line: 1, column: 7 });
    }

    #[test]
    fn definition_of_formal_parameter() {
        let src = "{ pkgs }: pkgs.hello";
        let parsed = file(src);
        let span = parsed
            .definition(pos_of(src, "pkgs.hello"))
            .expect("resolves");
        assert_eq!(span.start, Position { line: 1, column: 3 });
    }

    #[test]
    fn selector_component_is_not_a_definition() {
        let src = "{ pkgs }: pkgs.hello";
        let parsed = file(src);
        assert_eq!(
            parsed.definition(pos_of(src, "hello")),
            Err(ResolveError::NotADefinition)
        );
    }

    #[test]
    fn completion_context_classification() {
        let src = "{ a = b; }";
        let parsed = file(src);
        // On the value expression.
        assert_eq!(
            parsed.completion_context(pos_of(src, "b;")),
            CompletionContext::Value
        );
        // Between bindings, directly inside the set.
        assert_eq!(
            parsed.completion_context(Position { line: 1, column: 9 }),
            CompletionContext::AttrName
        );
    }

    #[test]
    fn scope_completions_list_visible_names() {
        let src = "let alpha = 1; beta = 2; in gamma: gamma";
        let parsed = file(src);
        let names = parsed.scope_completions(Position {
            line: 1,
            column: 36,
        });
        assert!(names.contains(&"alpha".to_string()));
        assert!(names.contains(&"beta".to_string()));
        assert!(names.contains(&"gamma".to_string()));
    }

    #[test]
    fn document_symbols_nest() {
        let src = "{ server = { port = 80; }; start = x: x; }";
        let parsed = file(src);
        let symbols = parsed.document_symbols();
        assert_eq!(symbols.len(), 2);
        let server = &symbols[0];
        assert_eq!(server.name, "server");
        assert_eq!(server.kind, SymbolEntryKind::Attribute);
        assert_eq!(server.children.len(), 1);
        assert_eq!(server.children[0].name, "port");
        assert_eq!(symbols[1].kind, SymbolEntryKind::Function);
    }

    #[test]
    fn document_links_resolve_relative_paths() {
        let src = "{ a = import ./lib/default.nix; b = /etc/nixos.nix; }";
        let parsed = file(src);
        let links = parsed.document_links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, PathBuf::from("/ws/lib/default.nix"));
        assert_eq!(links[1].1, PathBuf::from("/etc/nixos.nix"));
    }

    #[test]
    fn rename_rewrites_binding_and_references() {
        let src = "let x = 1; in x + x";
        let parsed = file(src);
        let edits = parsed
            .rename(pos_of(src, "x +"), "y")
            .expect("rename available");
        assert_eq!(edits.len(), 3);
        assert!(edits.iter().all(|(_, text)| text == "y"));
        // One edit covers the binding occurrence.
        assert!(edits
            .iter()
            .any(|(span, _)| span.start == Position { line: 1, column: 5 }));
    }

    #[test]
    fn rename_from_binding_name_touches_uses() {
        let src = "{ pkgs }: pkgs.hello";
        let parsed = file(src);
        let edits = parsed
            .rename(Position { line: 1, column: 3 }, "packages")
            .expect("rename available");
        assert_eq!(edits.len(), 2);
    }

    #[test]
    fn rename_rejects_with_variables() {
        let src = "s: with s; hello";
        let parsed = file(src);
        assert!(parsed.rename(pos_of(src, "hello"), "x").is_none());
    }

    #[test]
    fn prepare_rename_returns_identifier_span() {
        let src = "let x = 1; in x";
        let parsed = file(src);
        let span = parsed
            .prepare_rename(Position { line: 1, column: 15 })
            .expect("renameable");
        assert_eq!(span.start, Position { line: 1, column: 15 });
    }

    #[test]
    fn hover_describes_bindings_and_literals() {
        let src = "let x = 1; in x";
        let parsed = file(src);
        let text = parsed
            .hover(Position { line: 1, column: 15 })
            .expect("hover available");
        assert!(text.contains("`x`"));
        assert!(text.contains("line 1"));

        let parsed = file("42");
        let text = parsed.hover(Position { line: 1, column: 1 }).unwrap();
        assert!(text.contains("integer"));
    }

    #[test]
    fn error_recovery_still_produces_a_tree() {
        let parsed = file("let x = ; in x");
        assert!(!parsed.diagnostics.is_empty());
        assert!(parsed.ast.len() > 0);
        // The body variable still resolves to the broken binding.
        let span = parsed
            .definition(Position { line: 1, column: 14 })
            .expect("resolves through the error node");
        assert_eq!(span.start, Position { line: 1, column: 5 });
    }
}
