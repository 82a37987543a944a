use crate::diagnostics::{Diagnostic, Position, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Int,
    Float,
    Path,
    SearchPath,
    Keyword,
    Symbol,
    StrOpen,
    StrClose,
    IndStrOpen,
    IndStrClose,
    /// One literal piece of a string, escapes already decoded.
    StrLit,
    /// `${`
    InterpOpen,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

const KEYWORDS: &[&str] = &[
    "let", "in", "rec", "with", "if", "then", "else", "assert", "inherit", "or",
];

#[derive(Debug, Clone, Copy)]
enum Mode {
    Str,
    IndStr,
    Interp { depth: usize },
}

struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: usize,
    col: usize,
    modes: Vec<Mode>,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
}

pub fn lex(content: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lexer = Lexer {
        chars: content.chars().collect(),
        index: 0,
        line: 1,
        col: 1,
        modes: Vec::new(),
        tokens: Vec::new(),
        diagnostics: Vec::new(),
    };
    lexer.run();
    (lexer.tokens, lexer.diagnostics)
}

impl Lexer {
    fn run(&mut self) {
        while self.index < self.chars.len() {
            match self.modes.last().copied() {
                Some(Mode::Str) => self.lex_string_piece(),
                Some(Mode::IndStr) => self.lex_ind_string_piece(),
                _ => self.lex_normal(),
            }
        }
        match self.modes.last() {
            Some(Mode::Str) => {
                let pos = self.pos();
                self.diagnostics.push(Diagnostic::new(
                    "E0001",
                    "unterminated string literal",
                    Span { start: pos, end: pos },
                ));
            }
            Some(Mode::IndStr) => {
                let pos = self.pos();
                self.diagnostics.push(Diagnostic::new(
                    "E0002",
                    "unterminated indented string literal",
                    Span { start: pos, end: pos },
                ));
            }
            _ => {}
        }
    }

    fn pos(&self) -> Position {
        Position {
            line: self.line,
            column: self.col,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn bump(&mut self) -> char {
        let ch = self.chars[self.index];
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        ch
    }

    fn push(&mut self, kind: TokenKind, text: String, start: Position) {
        let span = Span {
            start,
            end: self.pos(),
        };
        self.tokens.push(Token { kind, text, span });
    }

    fn lex_normal(&mut self) {
        let ch = self.chars[self.index];

        if ch == ' ' || ch == '\t' || ch == '\r' || ch == '\n' {
            self.bump();
            return;
        }

        if ch == '#' {
            while self.index < self.chars.len() && self.chars[self.index] != '\n' {
                self.bump();
            }
            return;
        }

        if ch == '/' && self.peek(1) == Some('*') {
            let start = self.pos();
            self.bump();
            self.bump();
            loop {
                if self.index >= self.chars.len() {
                    self.diagnostics.push(Diagnostic::new(
                        "E0003",
                        "unterminated block comment",
                        Span {
                            start,
                            end: self.pos(),
                        },
                    ));
                    return;
                }
                if self.chars[self.index] == '*' && self.peek(1) == Some('/') {
                    self.bump();
                    self.bump();
                    return;
                }
                self.bump();
            }
        }

        if ch == '"' {
            let start = self.pos();
            self.bump();
            self.push(TokenKind::StrOpen, "\"".to_string(), start);
            self.modes.push(Mode::Str);
            return;
        }

        if ch == '\'' && self.peek(1) == Some('\'') {
            let start = self.pos();
            self.bump();
            self.bump();
            self.push(TokenKind::IndStrOpen, "''".to_string(), start);
            self.modes.push(Mode::IndStr);
            return;
        }

        if ch == '$' && self.peek(1) == Some('{') {
            let start = self.pos();
            self.bump();
            self.bump();
            self.push(TokenKind::InterpOpen, "${".to_string(), start);
            self.modes.push(Mode::Interp { depth: 0 });
            return;
        }

        if ch == '{' {
            if let Some(Mode::Interp { depth }) = self.modes.last_mut() {
                *depth += 1;
            }
            let start = self.pos();
            self.bump();
            self.push(TokenKind::Symbol, "{".to_string(), start);
            return;
        }

        if ch == '}' {
            if let Some(Mode::Interp { depth }) = self.modes.last_mut() {
                if *depth == 0 {
                    self.modes.pop();
                } else {
                    *depth -= 1;
                }
            }
            let start = self.pos();
            self.bump();
            self.push(TokenKind::Symbol, "}".to_string(), start);
            return;
        }

        if ch == '<' {
            if let Some(len) = self.search_path_len() {
                let start = self.pos();
                let text: String = self.chars[self.index..self.index + len].iter().collect();
                for _ in 0..len {
                    self.bump();
                }
                self.push(TokenKind::SearchPath, text, start);
                return;
            }
        }

        if is_path_char(ch) || ch == '~' || ch == '/' {
            if let Some(len) = self.path_len() {
                let start = self.pos();
                let text: String = self.chars[self.index..self.index + len].iter().collect();
                for _ in 0..len {
                    self.bump();
                }
                self.push(TokenKind::Path, text, start);
                return;
            }
        }

        if is_ident_start(ch) {
            let start = self.pos();
            let mut text = String::new();
            while self.index < self.chars.len() && is_ident_continue(self.chars[self.index]) {
                text.push(self.bump());
            }
            let kind = if KEYWORDS.contains(&text.as_str()) {
                TokenKind::Keyword
            } else {
                TokenKind::Ident
            };
            self.push(kind, text, start);
            return;
        }

        if ch.is_ascii_digit() {
            let start = self.pos();
            let mut text = String::new();
            let mut is_float = false;
            while self.index < self.chars.len() && self.chars[self.index].is_ascii_digit() {
                text.push(self.bump());
            }
            if self.chars.get(self.index) == Some(&'.')
                && self.peek(1).is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                text.push(self.bump());
                while self.index < self.chars.len() && self.chars[self.index].is_ascii_digit() {
                    text.push(self.bump());
                }
            }
            if matches!(self.chars.get(self.index), Some('e') | Some('E'))
                && self
                    .peek(1)
                    .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
            {
                is_float = true;
                text.push(self.bump());
                if matches!(self.chars.get(self.index), Some('+') | Some('-')) {
                    text.push(self.bump());
                }
                while self.index < self.chars.len() && self.chars[self.index].is_ascii_digit() {
                    text.push(self.bump());
                }
            }
            let kind = if is_float {
                TokenKind::Float
            } else {
                TokenKind::Int
            };
            self.push(kind, text, start);
            return;
        }

        for multi in ["...", "&&", "||", "->", "==", "!=", "<=", ">=", "++", "//"] {
            if self.starts_with(multi) {
                let start = self.pos();
                for _ in 0..multi.chars().count() {
                    self.bump();
                }
                self.push(TokenKind::Symbol, multi.to_string(), start);
                return;
            }
        }

        if "()[];:,.=?@!<>+-*/".contains(ch) {
            let start = self.pos();
            self.bump();
            self.push(TokenKind::Symbol, ch.to_string(), start);
            return;
        }

        let start = self.pos();
        self.bump();
        self.diagnostics.push(Diagnostic::new(
            "E0004",
            format!("unexpected character '{ch}'"),
            Span {
                start,
                end: self.pos(),
            },
        ));
    }

    fn lex_string_piece(&mut self) {
        let start = self.pos();
        let mut text = String::new();
        while self.index < self.chars.len() {
            let ch = self.chars[self.index];
            if ch == '"' {
                if !text.is_empty() {
                    self.push(TokenKind::StrLit, std::mem::take(&mut text), start);
                }
                let quote_start = self.pos();
                self.bump();
                self.push(TokenKind::StrClose, "\"".to_string(), quote_start);
                self.modes.pop();
                return;
            }
            if ch == '$' && self.peek(1) == Some('{') {
                if !text.is_empty() {
                    self.push(TokenKind::StrLit, std::mem::take(&mut text), start);
                }
                let interp_start = self.pos();
                self.bump();
                self.bump();
                self.push(TokenKind::InterpOpen, "${".to_string(), interp_start);
                self.modes.push(Mode::Interp { depth: 0 });
                return;
            }
            if ch == '\\' {
                self.bump();
                if self.index < self.chars.len() {
                    let escaped = self.bump();
                    text.push(decode_escape(escaped));
                }
                continue;
            }
            text.push(self.bump());
        }
        if !text.is_empty() {
            self.push(TokenKind::StrLit, text, start);
        }
    }

    fn lex_ind_string_piece(&mut self) {
        let start = self.pos();
        let mut text = String::new();
        while self.index < self.chars.len() {
            let ch = self.chars[self.index];
            if ch == '\'' && self.peek(1) == Some('\'') {
                match self.peek(2) {
                    Some('\'') => {
                        self.bump();
                        self.bump();
                        self.bump();
                        text.push_str("''");
                        continue;
                    }
                    Some('$') => {
                        self.bump();
                        self.bump();
                        self.bump();
                        text.push('$');
                        continue;
                    }
                    Some('\\') => {
                        self.bump();
                        self.bump();
                        self.bump();
                        if self.index < self.chars.len() {
                            let escaped = self.bump();
                            text.push(decode_escape(escaped));
                        }
                        continue;
                    }
                    _ => {
                        if !text.is_empty() {
                            self.push(TokenKind::StrLit, std::mem::take(&mut text), start);
                        }
                        let quote_start = self.pos();
                        self.bump();
                        self.bump();
                        self.push(TokenKind::IndStrClose, "''".to_string(), quote_start);
                        self.modes.pop();
                        return;
                    }
                }
            }
            if ch == '$' && self.peek(1) == Some('{') {
                if !text.is_empty() {
                    self.push(TokenKind::StrLit, std::mem::take(&mut text), start);
                }
                let interp_start = self.pos();
                self.bump();
                self.bump();
                self.push(TokenKind::InterpOpen, "${".to_string(), interp_start);
                self.modes.push(Mode::Interp { depth: 0 });
                return;
            }
            text.push(self.bump());
        }
        if !text.is_empty() {
            self.push(TokenKind::StrLit, text, start);
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, ch)| self.peek(i) == Some(ch))
    }

    /// `<path>` with at least one path character, no whitespace.
    fn search_path_len(&self) -> Option<usize> {
        let mut len = 1;
        while let Some(ch) = self.peek(len) {
            if ch == '>' {
                return if len > 1 { Some(len + 1) } else { None };
            }
            if !is_path_char(ch) && ch != '/' {
                return None;
            }
            len += 1;
        }
        None
    }

    /// A run of path characters that contains a slash, with no empty
    /// segment. `a//b` is the update operator, not a path.
    fn path_len(&self) -> Option<usize> {
        let mut len = 0;
        if self.peek(0) == Some('~') {
            if self.peek(1) != Some('/') {
                return None;
            }
            len = 1;
        }
        let mut has_slash = false;
        while let Some(ch) = self.peek(len) {
            if ch == '/' {
                if self.peek(len + 1).is_some_and(is_path_char) {
                    has_slash = true;
                } else {
                    return None;
                }
            } else if !is_path_char(ch) {
                break;
            }
            len += 1;
        }
        (has_slash && len > 0).then_some(len)
    }
}

fn decode_escape(ch: char) -> char {
    match ch {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        other => other,
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '\'' || ch == '-'
}

fn is_path_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '+')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, String)> {
        let (tokens, _) = lex(src);
        tokens
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn lexes_let_binding() {
        let tokens = kinds("let x = 1; in x");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Keyword, "let".to_string()),
                (TokenKind::Ident, "x".to_string()),
                (TokenKind::Symbol, "=".to_string()),
                (TokenKind::Int, "1".to_string()),
                (TokenKind::Symbol, ";".to_string()),
                (TokenKind::Keyword, "in".to_string()),
                (TokenKind::Ident, "x".to_string()),
            ]
        );
    }

    #[test]
    fn lexes_string_with_interpolation() {
        let tokens = kinds(r#""pre ${x} post""#);
        assert_eq!(
            tokens,
            vec![
                (TokenKind::StrOpen, "\"".to_string()),
                (TokenKind::StrLit, "pre ".to_string()),
                (TokenKind::InterpOpen, "${".to_string()),
                (TokenKind::Ident, "x".to_string()),
                (TokenKind::Symbol, "}".to_string()),
                (TokenKind::StrLit, " post".to_string()),
                (TokenKind::StrClose, "\"".to_string()),
            ]
        );
    }

    #[test]
    fn interpolation_tracks_nested_braces() {
        let tokens = kinds(r#""${{ a = 1; }.a}""#);
        let closes: Vec<_> = tokens
            .iter()
            .filter(|t| t.0 == TokenKind::Symbol && t.1 == "}")
            .collect();
        assert_eq!(closes.len(), 2);
        assert_eq!(tokens.last().unwrap().0, TokenKind::StrClose);
    }

    #[test]
    fn lexes_paths_and_update_operator() {
        let tokens = kinds("./foo.nix");
        assert_eq!(tokens, vec![(TokenKind::Path, "./foo.nix".to_string())]);

        let tokens = kinds("/etc/nixos/configuration.nix");
        assert_eq!(
            tokens,
            vec![(
                TokenKind::Path,
                "/etc/nixos/configuration.nix".to_string()
            )]
        );

        let tokens = kinds("a // b");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Ident, "a".to_string()),
                (TokenKind::Symbol, "//".to_string()),
                (TokenKind::Ident, "b".to_string()),
            ]
        );

        let tokens = kinds("<nixpkgs>");
        assert_eq!(
            tokens,
            vec![(TokenKind::SearchPath, "<nixpkgs>".to_string())]
        );
    }

    #[test]
    fn lexes_floats_and_ints() {
        let tokens = kinds("1 2.5 3.0e-2");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Int, "1".to_string()),
                (TokenKind::Float, "2.5".to_string()),
                (TokenKind::Float, "3.0e-2".to_string()),
            ]
        );
    }

    #[test]
    fn reports_unterminated_string() {
        let (_, diagnostics) = lex("\"abc");
        assert!(diagnostics.iter().any(|d| d.code == "E0001"));
    }

    #[test]
    fn indented_string_escapes() {
        let tokens = kinds("''a''$b''");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::IndStrOpen, "''".to_string()),
                (TokenKind::StrLit, "a$b".to_string()),
                (TokenKind::IndStrClose, "''".to_string()),
            ]
        );
    }

    #[test]
    fn spans_are_one_based() {
        let (tokens, _) = lex("let x");
        assert_eq!(tokens[0].span.start, Position { line: 1, column: 1 });
        assert_eq!(tokens[1].span.start, Position { line: 1, column: 5 });
    }
}
