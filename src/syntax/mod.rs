//! Front end for the surface expression grammar.
//!
//! ```text
//! expr    := term (("+"|"-") term)*
//! term    := power (("*"|"/"|"%") power)*
//! power   := unary ("^" power)?
//! unary   := "-" unary | call
//! call    := ident "(" expr ("," expr)* ")" | atom
//! atom    := number | ident | "(" expr ")"
//! ```

pub mod lexer;
pub mod parser;

pub use lexer::{Lexer, Spanned, Token};
pub use parser::Parser;

use crate::expression::Expression;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("unexpected character `{character}` at position {position}")]
    UnexpectedCharacter { character: char, position: usize },

    #[error("malformed number at position {position}")]
    MalformedNumber { position: usize },

    #[error("mismatched parenthesis at position {position}")]
    MismatchedParenthesis { position: usize },

    #[error("`{name}` expects {expected} argument(s) but was given {found} at position {position}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
        position: usize,
    },

    #[error("expression ends with an operator at position {position}")]
    TrailingOperator { position: usize },

    #[error("unexpected {found} at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unknown function `{name}` at position {position}")]
    UnknownFunction { name: String, position: usize },

    #[error("function `{name}` used without arguments at position {position}")]
    UncalledFunction { name: String, position: usize },

    #[error("empty expression")]
    Empty,
}

impl SyntaxError {
    pub fn position(&self) -> Option<usize> {
        match self {
            SyntaxError::UnexpectedCharacter { position, .. }
            | SyntaxError::MalformedNumber { position }
            | SyntaxError::MismatchedParenthesis { position }
            | SyntaxError::Arity { position, .. }
            | SyntaxError::TrailingOperator { position }
            | SyntaxError::UnexpectedToken { position, .. }
            | SyntaxError::UnknownFunction { position, .. }
            | SyntaxError::UncalledFunction { position, .. } => Some(*position),
            SyntaxError::Empty => None,
        }
    }

    pub fn is_lexical(&self) -> bool {
        matches!(
            self,
            SyntaxError::UnexpectedCharacter { .. } | SyntaxError::MalformedNumber { .. }
        )
    }
}

/// Tokenizes and parses a single expression.
pub fn parse(input: &str) -> Result<Expression, SyntaxError> {
    Parser::new(input)?.parse()
}

/// Offset of the first occurrence of identifier `name` in `input`.
pub fn find_identifier(input: &str, name: &str) -> Option<usize> {
    Lexer::new(input)
        .map_while(Result::ok)
        .find(|spanned| matches!(&spanned.token, Token::Ident(ident) if ident == name))
        .map(|spanned| spanned.position)
}
