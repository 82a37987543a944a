//! Conversions between syntax-level spans and LSP shapes.

use std::path::PathBuf;

use nixd_syntax::{Diagnostic as SynDiagnostic, Position as SynPosition, Span};
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, NumberOrString, Position, Range, Url,
};

pub fn span_to_range(span: Span) -> Range {
    let start = Position::new(
        span.start.line.saturating_sub(1) as u32,
        span.start.column.saturating_sub(1) as u32,
    );
    let end = Position::new(
        span.end.line.saturating_sub(1) as u32,
        span.end.column.saturating_sub(1) as u32,
    );
    Range::new(start, end)
}

pub fn position_from_lsp(position: Position) -> SynPosition {
    SynPosition {
        line: position.line as usize + 1,
        column: position.character as usize + 1,
    }
}

pub fn path_from_uri(uri: &Url) -> String {
    uri.to_file_path()
        .unwrap_or_else(|_| PathBuf::from(uri.to_string()))
        .display()
        .to_string()
}

pub fn diagnostic_to_lsp(diagnostic: &SynDiagnostic) -> Diagnostic {
    Diagnostic {
        range: span_to_range(diagnostic.span),
        severity: Some(DiagnosticSeverity::ERROR),
        code: Some(NumberOrString::String(diagnostic.code.clone())),
        source: Some("nixd".to_string()),
        message: diagnostic.message.clone(),
        ..Diagnostic::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_convert_to_zero_based_ranges() {
        let span = Span {
            start: SynPosition { line: 1, column: 5 },
            end: SynPosition { line: 1, column: 6 },
        };
        let range = span_to_range(span);
        assert_eq!(range.start, Position::new(0, 4));
        assert_eq!(range.end, Position::new(0, 5));
    }

    #[test]
    fn lsp_positions_convert_to_one_based() {
        let pos = position_from_lsp(Position::new(0, 14));
        assert_eq!(pos, SynPosition { line: 1, column: 15 });
    }
}
