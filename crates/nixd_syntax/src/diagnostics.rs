use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// 1-based line.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn point(line: usize, column: usize) -> Self {
        let p = Position { line, column };
        Span { start: p, end: p }
    }

    pub fn contains(&self, pos: Position) -> bool {
        let after_start = pos.line > self.start.line
            || (pos.line == self.start.line && pos.column >= self.start.column);
        let before_end =
            pos.line < self.end.line || (pos.line == self.end.line && pos.column < self.end.column);
        after_start && before_end
    }

    /// True when `other` lies entirely within `self`.
    pub fn encloses(&self, other: Span) -> bool {
        let starts_before = self.start.line < other.start.line
            || (self.start.line == other.start.line && self.start.column <= other.start.column);
        let ends_after = self.end.line > other.end.line
            || (self.end.line == other.end.line && self.end.column >= other.end.column);
        starts_before && ends_after
    }
}

pub fn merge_span(start: Span, end: Span) -> Span {
    Span {
        start: start.start,
        end: end.end,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(code: &str, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            code: code.to_string(),
            message: message.into(),
            span,
        }
    }
}

pub fn render_diagnostics(path: &str, diagnostics: &[Diagnostic]) -> String {
    let mut output = String::new();
    for (index, diagnostic) in diagnostics.iter().enumerate() {
        if index > 0 {
            output.push('\n');
        }
        let start = diagnostic.span.start;
        output.push_str(&format!(
            "error[{}] {}:{}:{} {}",
            diagnostic.code, path, start.line, start.column, diagnostic.message
        ));
    }
    output
}
