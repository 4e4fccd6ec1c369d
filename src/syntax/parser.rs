use super::lexer::{Lexer, Spanned, Token};
use super::SyntaxError;
use crate::expression::Expression;
use crate::functions::{BinaryOp, Callable};

pub type ParserResult<T> = Result<T, SyntaxError>;

/// Precedence of prefix negation: above `*`, below `^`.
const NEGATION_PRECEDENCE: u8 = 3;

#[derive(Debug)]
enum StackItem {
    Op(BinaryOp, usize),
    Negate(usize),
    LParen(usize),
    Call {
        name: String,
        callable: Callable,
        argc: usize,
        position: usize,
    },
}

impl StackItem {
    fn precedence(&self) -> Option<u8> {
        match self {
            StackItem::Op(op, _) => Some(op.precedence()),
            StackItem::Negate(_) => Some(NEGATION_PRECEDENCE),
            StackItem::LParen(_) | StackItem::Call { .. } => None,
        }
    }
}

/// Shunting-yard parser over a pre-lexed token stream.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    output: Vec<Expression>,
    stack: Vec<StackItem>,
}

impl Parser {
    pub fn new(input: &str) -> ParserResult<Self> {
        let tokens = Lexer::new(input).collect::<Result<Vec<_>, _>>()?;
        Ok(Parser {
            tokens,
            pos: 0,
            output: Vec::new(),
            stack: Vec::new(),
        })
    }

    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(spanned: &Spanned) -> SyntaxError {
        SyntaxError::UnexpectedToken {
            found: spanned.token.describe(),
            position: spanned.position,
        }
    }

    pub fn parse(mut self) -> ParserResult<Expression> {
        let mut expect_operand = true;

        while let Some(spanned) = self.advance() {
            let position = spanned.position;
            match spanned.token {
                Token::Number(_) | Token::Constant(_) | Token::Ident(_) if !expect_operand => {
                    return Err(Self::unexpected(&spanned));
                }
                Token::Number(n) => {
                    self.output.push(Expression::Number(n));
                    expect_operand = false;
                }
                Token::Constant(c) => {
                    self.output.push(Expression::Constant(c));
                    expect_operand = false;
                }
                Token::Ident(name) => {
                    if matches!(self.peek(), Some(Spanned { token: Token::LParen, .. })) {
                        return Err(SyntaxError::UnknownFunction { name, position });
                    }
                    self.output.push(Expression::Variable(name));
                    expect_operand = false;
                }
                Token::Function(name, callable) => {
                    if !expect_operand {
                        return Err(Self::unexpected(&Spanned {
                            token: Token::Function(name, callable),
                            position,
                        }));
                    }
                    match self.advance() {
                        Some(Spanned { token: Token::LParen, .. }) => {}
                        _ => return Err(SyntaxError::UncalledFunction { name, position }),
                    }
                    self.stack.push(StackItem::Call {
                        name,
                        callable,
                        argc: 1,
                        position,
                    });
                }
                Token::UnaryMinus => {
                    self.stack.push(StackItem::Negate(position));
                }
                Token::Op(op) => {
                    if expect_operand {
                        return Err(Self::unexpected(&spanned));
                    }
                    self.push_operator(op, position)?;
                    expect_operand = true;
                }
                Token::LParen => {
                    if !expect_operand {
                        return Err(Self::unexpected(&spanned));
                    }
                    self.stack.push(StackItem::LParen(position));
                }
                Token::Comma => {
                    if expect_operand {
                        return Err(self.dangling(&spanned));
                    }
                    self.unwind_operators()?;
                    match self.stack.last_mut() {
                        Some(StackItem::Call { argc, .. }) => *argc += 1,
                        _ => return Err(Self::unexpected(&spanned)),
                    }
                    expect_operand = true;
                }
                Token::RParen => {
                    if expect_operand {
                        return Err(self.dangling(&spanned));
                    }
                    self.unwind_operators()?;
                    match self.stack.pop() {
                        Some(StackItem::LParen(_)) => {}
                        Some(StackItem::Call {
                            name,
                            callable,
                            argc,
                            position,
                        }) => self.apply_call(name, callable, argc, position)?,
                        _ => return Err(SyntaxError::MismatchedParenthesis { position }),
                    }
                }
                Token::EOF => {
                    if expect_operand {
                        return Err(self.dangling(&spanned));
                    }
                    break;
                }
            }
        }

        while let Some(item) = self.stack.pop() {
            match item {
                StackItem::LParen(position) | StackItem::Call { position, .. } => {
                    return Err(SyntaxError::MismatchedParenthesis { position })
                }
                item => self.apply(item)?,
            }
        }

        match (self.output.pop(), self.output.is_empty()) {
            (Some(expr), true) => Ok(expr),
            _ => Err(SyntaxError::Empty),
        }
    }

    /// Error for a `)`, `,` or end of input that arrives where an operand
    /// was expected.
    fn dangling(&self, spanned: &Spanned) -> SyntaxError {
        match self.stack.last() {
            None if self.output.is_empty() => SyntaxError::Empty,
            Some(StackItem::Call {
                name,
                callable,
                argc: 1,
                ..
            }) if spanned.token == Token::RParen => SyntaxError::Arity {
                name: name.clone(),
                expected: callable.expected_arity(),
                found: 0,
                position: spanned.position,
            },
            Some(StackItem::Op(..)) | Some(StackItem::Negate(_)) => {
                SyntaxError::TrailingOperator {
                    position: spanned.position,
                }
            }
            _ => Self::unexpected(spanned),
        }
    }

    fn push_operator(&mut self, op: BinaryOp, position: usize) -> ParserResult<()> {
        let prec = op.precedence();
        while let Some(top) = self.stack.last() {
            let top_prec = match top.precedence() {
                Some(p) => p,
                None => break,
            };
            let pops = top_prec > prec || (top_prec == prec && !op.is_right_associative());
            if !pops {
                break;
            }
            if let Some(item) = self.stack.pop() {
                self.apply(item)?;
            }
        }
        self.stack.push(StackItem::Op(op, position));
        Ok(())
    }

    /// Reduces operators until the stack is empty or a group is on top.
    fn unwind_operators(&mut self) -> ParserResult<()> {
        while self.stack.last().and_then(StackItem::precedence).is_some() {
            if let Some(item) = self.stack.pop() {
                self.apply(item)?;
            }
        }
        Ok(())
    }

    fn pop_operand(&mut self, position: usize) -> ParserResult<Expression> {
        self.output
            .pop()
            .ok_or(SyntaxError::TrailingOperator { position })
    }

    fn apply(&mut self, item: StackItem) -> ParserResult<()> {
        match item {
            StackItem::Op(op, position) => {
                let rhs = self.pop_operand(position)?;
                let lhs = self.pop_operand(position)?;
                self.output.push(Expression::binary(op, lhs, rhs));
            }
            StackItem::Negate(position) => {
                let operand = self.pop_operand(position)?;
                self.output
                    .push(Expression::binary(BinaryOp::Sub, Expression::zero(), operand));
            }
            StackItem::LParen(position) | StackItem::Call { position, .. } => {
                return Err(SyntaxError::MismatchedParenthesis { position })
            }
        }
        Ok(())
    }

    fn apply_call(
        &mut self,
        name: String,
        callable: Callable,
        argc: usize,
        position: usize,
    ) -> ParserResult<()> {
        if !callable.accepts(argc) {
            return Err(SyntaxError::Arity {
                name,
                expected: callable.expected_arity(),
                found: argc,
                position,
            });
        }
        if self.output.len() < argc {
            return Err(SyntaxError::MismatchedParenthesis { position });
        }
        let mut args = self.output.split_off(self.output.len() - argc).into_iter();
        let mut next = || args.next().ok_or(SyntaxError::MismatchedParenthesis { position });

        let expr = match callable {
            Callable::Unary(f) => Expression::unary(f, next()?),
            Callable::Binary(f) => {
                let lhs = next()?;
                Expression::function(f, lhs, next()?)
            }
            Callable::Operator(op) => {
                let lhs = next()?;
                Expression::binary(op, lhs, next()?)
            }
            Callable::Atan if argc == 2 => {
                let y = next()?;
                Expression::atan2(y, next()?)
            }
            Callable::Atan => Expression::unary(crate::functions::UnaryFunction::Atan, next()?),
        };
        self.output.push(expr);
        Ok(())
    }
}
