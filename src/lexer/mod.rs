use logos::Logos;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
pub enum Token {
    // Keywords
    #[token("State")]
    State,
    #[token("Function")]
    Function,
    #[token("Entity")]
    Entity,
    #[token("OnEnter")]
    OnEnter,
    #[token("OnExit")]
    OnExit,
    #[token("OnUpdate")]
    OnUpdate,
    #[token("ChangeState")]
    ChangeState,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,

    // Operators
    #[token("=")]
    Assign,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEq,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("!")]
    Bang,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,

    // Literals. No sign on numbers: unary minus is an operator, otherwise
    // `a-1` would lex as an identifier followed by the number -1.
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""[^"\n]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].to_string())
    })]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Byte-offset → 1-based line lookup, built once per lex.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineIndex { line_starts }
    }

    fn line_of(&self, offset: usize) -> u32 {
        match self.line_starts.binary_search(&offset) {
            Ok(line) => line as u32 + 1,
            Err(next) => next as u32,
        }
    }
}

/// Lex source code into a flat stream of tokens tagged with line numbers.
/// Braces delimit blocks, so newlines carry no meaning of their own.
pub fn lex(source: &str) -> Result<Vec<(Token, u32)>, LexError> {
    let lines = LineIndex::new(source);
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push((token, lines.line_of(span.start))),
            Err(()) => {
                return Err(LexError {
                    line: lines.line_of(span.start),
                    snippet: source[span].to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: unrecognized input '{snippet}'")]
pub struct LexError {
    pub line: u32,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lex_state_block() {
        let source = r#"State Idle {
    OnEnter() {
        x = 1
    }
}"#;
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].0, Token::State);
        assert_eq!(tokens[1].0, Token::Ident("Idle".to_string()));
        assert_eq!(tokens[2].0, Token::LBrace);
        assert_eq!(tokens[3].0, Token::OnEnter);
    }

    #[test]
    fn lex_string_literal() {
        let tokens = lex(r#"Entity target = "Boss""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                (Token::Entity, 1),
                (Token::Ident("target".to_string()), 1),
                (Token::Assign, 1),
                (Token::Str("Boss".to_string()), 1),
            ]
        );
    }

    #[test]
    fn lex_line_numbers_are_one_based() {
        let source = "Number a = 1\nNumber b = 2\n\nBool c";
        let tokens = lex(source).unwrap();
        assert_eq!(tokens[0].1, 1);
        let b_line = tokens
            .iter()
            .find(|(t, _)| *t == Token::Ident("b".to_string()))
            .map(|(_, l)| *l);
        assert_eq!(b_line, Some(2));
        let c_line = tokens
            .iter()
            .find(|(t, _)| *t == Token::Ident("c".to_string()))
            .map(|(_, l)| *l);
        assert_eq!(c_line, Some(4));
    }

    #[test]
    fn lex_comment_ignored() {
        let source = "// header comment\nreturn // trailing\n";
        let tokens = lex(source).unwrap();
        assert_eq!(tokens, vec![(Token::Return, 2)]);
    }

    #[test]
    fn lex_two_char_operators() {
        let tokens = lex("a >= 1 && b != 2").unwrap();
        let kinds: Vec<&Token> = tokens.iter().map(|(t, _)| t).collect();
        assert!(kinds.contains(&&Token::GreaterEq));
        assert!(kinds.contains(&&Token::AndAnd));
        assert!(kinds.contains(&&Token::NotEq));
    }

    #[test]
    fn lex_unknown_character_reports_line() {
        let err = lex("Number x = 1\n@").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.snippet, "@");
    }

    #[test]
    fn lex_subtraction_is_not_a_negative_literal() {
        let tokens = lex("a-1").unwrap();
        assert_eq!(
            tokens,
            vec![
                (Token::Ident("a".to_string()), 1),
                (Token::Minus, 1),
                (Token::Number(1.0), 1),
            ]
        );
    }
}
