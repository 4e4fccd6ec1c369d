use std::iter::Peekable;
use std::str::Chars;

use super::SyntaxError;
use crate::functions::{BinaryOp, Callable, NamedConstant};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    Constant(NamedConstant),
    Function(String, Callable),
    Op(BinaryOp),
    /// A `-` in operand position.
    UnaryMinus,
    LParen,
    RParen,
    Comma,
    EOF,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number `{}`", n),
            Token::Ident(name) => format!("identifier `{}`", name),
            Token::Constant(c) => format!("constant `{}`", c.name()),
            Token::Function(name, _) => format!("function `{}`", name),
            Token::Op(op) => format!("operator `{}`", op.symbol()),
            Token::UnaryMinus => "operator `-`".to_string(),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::Comma => "`,`".to_string(),
            Token::EOF => "end of input".to_string(),
        }
    }

    /// Whether a `-` following this token is a negation.
    fn precedes_operand(&self) -> bool {
        matches!(
            self,
            Token::Op(_) | Token::UnaryMinus | Token::LParen | Token::Comma
        )
    }
}

/// A token with the character offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub type LexResult = Result<Spanned, SyntaxError>;

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    pos: usize,
    previous: Option<Token>,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            chars: input.chars().peekable(),
            pos: 0,
            previous: None,
            finished: false,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    pub fn skip_whitespaces(&mut self) {
        while let Some(ch) = self.chars.peek() {
            if !ch.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    /// Lexes and returns the next token.
    pub fn lex(&mut self) -> LexResult {
        self.skip_whitespaces();
        let start = self.pos;

        let next = match self.bump() {
            Some(ch) => ch,
            None => {
                return Ok(Spanned {
                    token: Token::EOF,
                    position: start,
                })
            }
        };

        let token = match next {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '-' => {
                let negation = match &self.previous {
                    None => true,
                    Some(prev) => prev.precedes_operand(),
                };
                if negation {
                    Token::UnaryMinus
                } else {
                    Token::Op(BinaryOp::Sub)
                }
            }
            '+' | '*' | '/' | '^' | '%' => match BinaryOp::from_char(next) {
                Some(op) => Token::Op(op),
                None => unreachable!("operator characters are covered by BinaryOp"),
            },
            '.' | '0'..='9' => self.lex_number(next, start)?,
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::from(next);
                while let Some(&ch) = self.chars.peek() {
                    if ch != '_' && !ch.is_ascii_alphanumeric() {
                        break;
                    }
                    ident.push(ch);
                    self.bump();
                }

                if let Some(c) = NamedConstant::from_name(&ident) {
                    Token::Constant(c)
                } else if let Some(callable) = Callable::lookup(&ident) {
                    Token::Function(ident, callable)
                } else {
                    Token::Ident(ident)
                }
            }
            character => {
                return Err(SyntaxError::UnexpectedCharacter {
                    character,
                    position: start,
                })
            }
        };

        self.previous = Some(token.clone());
        Ok(Spanned {
            token,
            position: start,
        })
    }

    fn lex_number(&mut self, first: char, start: usize) -> Result<Token, SyntaxError> {
        let mut text = String::from(first);
        let mut seen_dot = first == '.';
        while let Some(&ch) = self.chars.peek() {
            if ch == '.' && !seen_dot {
                seen_dot = true;
            } else if !ch.is_ascii_digit() {
                break;
            }
            text.push(ch);
            self.bump();
        }

        if text == "." {
            return Err(SyntaxError::MalformedNumber { position: start });
        }
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| SyntaxError::MalformedNumber { position: start })
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = LexResult;

    /// Yields tokens up to and including `EOF`, or the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.lex();
        match &result {
            Ok(Spanned {
                token: Token::EOF, ..
            })
            | Err(_) => self.finished = true,
            Ok(_) => {}
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        Lexer::new(src)
            .map(|t| t.map(|s| s.token))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn classifies_minus_by_context() {
        assert_eq!(
            tokens("-x - (-1, -y)"),
            vec![
                Token::UnaryMinus,
                Token::Ident("x".into()),
                Token::Op(BinaryOp::Sub),
                Token::LParen,
                Token::UnaryMinus,
                Token::Number(1.0),
                Token::Comma,
                Token::UnaryMinus,
                Token::Ident("y".into()),
                Token::RParen,
                Token::EOF,
            ]
        );
        assert_eq!(tokens("2*-3")[2], Token::UnaryMinus);
    }

    #[test]
    fn lexes_numbers_and_reserved_words() {
        assert_eq!(tokens(".5")[0], Token::Number(0.5));
        assert_eq!(tokens("12.")[0], Token::Number(12.0));
        assert_eq!(tokens("PI")[0], Token::Constant(NamedConstant::Pi));
        assert!(matches!(tokens("atan2")[0], Token::Function(_, _)));
        assert_eq!(tokens("x_1")[0], Token::Ident("x_1".into()));
    }

    #[test]
    fn reports_position_of_unknown_character() {
        let err = Lexer::new("x + $").find_map(|t| t.err()).unwrap();
        assert_eq!(
            err,
            SyntaxError::UnexpectedCharacter {
                character: '$',
                position: 4
            }
        );
        assert_eq!(
            Lexer::new(" .").find_map(|t| t.err()),
            Some(SyntaxError::MalformedNumber { position: 1 })
        );
    }
}
