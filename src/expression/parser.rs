//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Binary operators are resolved by precedence climbing over [`BINARY_LEVELS`]; unary operators,
//! calls and the right-associative conditional are handled separately.

use crate::expression::ast::{BinaryOp, Expr, Lit, UnaryOp};
use crate::expression::error::ExprError;
use crate::expression::lexer::{Punct, Token, TokenKind, lex};

/// Upper bound on syntactic nesting; keeps hostile module sources from exhausting the stack.
pub(crate) const MAX_NESTING_DEPTH: usize = 64;

/// Binary operators grouped by precedence, loosest first. All levels are left-associative.
const BINARY_LEVELS: &[&[(Punct, BinaryOp)]] = &[
    &[(Punct::Or, BinaryOp::Or)],
    &[(Punct::And, BinaryOp::And)],
    &[(Punct::Eq, BinaryOp::Eq), (Punct::NotEq, BinaryOp::Ne)],
    &[
        (Punct::Less, BinaryOp::Lt),
        (Punct::LessEq, BinaryOp::Le),
        (Punct::Greater, BinaryOp::Gt),
        (Punct::GreaterEq, BinaryOp::Ge),
    ],
    &[(Punct::Plus, BinaryOp::Add), (Punct::Minus, BinaryOp::Sub)],
    &[
        (Punct::Star, BinaryOp::Mul),
        (Punct::Slash, BinaryOp::Div),
        (Punct::Percent, BinaryOp::Mod),
    ],
];

pub(crate) fn parse_expr(src: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: lex(src)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.conditional()?;
    let trailing = parser.current();
    if trailing.kind != TokenKind::End {
        return Err(ExprError::new(
            trailing.offset,
            format!("expected end of expression, found {}", trailing.kind),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // `lex` always terminates the stream with `End`, and `advance` never steps past it.
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::End {
            self.pos += 1;
        }
        token
    }

    fn at(&self, punct: Punct) -> bool {
        self.current().kind == TokenKind::Punct(punct)
    }

    fn eat(&mut self, punct: Punct) -> bool {
        let hit = self.at(punct);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn eat_any<T: Copy>(&mut self, table: &[(Punct, T)]) -> Option<T> {
        let &(punct, value) = table.iter().find(|(punct, _)| self.at(*punct))?;
        self.eat(punct);
        Some(value)
    }

    fn expect(&mut self, punct: Punct) -> Result<(), ExprError> {
        if self.eat(punct) {
            return Ok(());
        }
        let found = self.current();
        Err(ExprError::new(
            found.offset,
            format!("expected '{punct}', found {}", found.kind),
        ))
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ExprError>) -> Result<T, ExprError> {
        if self.depth == MAX_NESTING_DEPTH {
            return Err(ExprError::new(
                self.current().offset,
                format!("expression nesting exceeds {MAX_NESTING_DEPTH} levels"),
            ));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    /// `binary ('?' conditional ':' conditional)?`
    fn conditional(&mut self) -> Result<Expr, ExprError> {
        self.nested(|p| {
            let cond = p.binary(0)?;
            if !p.eat(Punct::Question) {
                return Ok(cond);
            }
            let then = p.conditional()?;
            p.expect(Punct::Colon)?;
            let otherwise = p.conditional()?;
            Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        })
    }

    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        let Some(ops) = BINARY_LEVELS.get(level) else {
            return self.unary();
        };
        let mut left = self.binary(level + 1)?;
        while let Some(op) = self.eat_any(ops) {
            let right = self.binary(level + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        const PREFIX: &[(Punct, UnaryOp)] = &[(Punct::Minus, UnaryOp::Neg), (Punct::Not, UnaryOp::Not)];
        match self.eat_any(PREFIX) {
            Some(op) => self.nested(|p| {
                Ok(Expr::Unary {
                    op,
                    expr: Box::new(p.unary()?),
                })
            }),
            None => self.call(),
        }
    }

    /// A primary, optionally applied to a parenthesised argument list.
    fn call(&mut self) -> Result<Expr, ExprError> {
        let callee = self.primary()?;
        if !self.at(Punct::LParen) {
            return Ok(callee);
        }
        let Expr::Ident { name, offset } = callee else {
            return Err(ExprError::new(
                self.current().offset,
                "only named functions can be called",
            ));
        };
        self.advance();

        let mut args = Vec::new();
        if !self.eat(Punct::RParen) {
            loop {
                args.push(self.conditional()?);
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
            self.expect(Punct::RParen)?;
        }
        Ok(Expr::Call {
            func: name,
            offset,
            args,
        })
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Token { kind, offset } = self.advance();
        match kind {
            TokenKind::Number(v) => Ok(Expr::Lit(Lit::F64(v))),
            TokenKind::Bool(b) => Ok(Expr::Lit(Lit::Bool(b))),
            TokenKind::Ident(name) => Ok(Expr::Ident { name, offset }),
            TokenKind::Punct(Punct::LParen) => {
                let inner = self.conditional()?;
                self.expect(Punct::RParen)?;
                Ok(inner)
            }
            other => Err(ExprError::new(offset, format!("expected a value, found {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let Expr::Binary {
            op: BinaryOp::Add,
            right,
            ..
        } = parse_expr("1+2*3").unwrap()
        else {
            panic!("expected an addition at the root");
        };
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn same_level_operators_associate_left() {
        let Expr::Binary {
            op: BinaryOp::Sub,
            left,
            ..
        } = parse_expr("10 - 4 - 3").unwrap()
        else {
            panic!("expected a subtraction at the root");
        };
        assert!(matches!(
            *left,
            Expr::Binary {
                op: BinaryOp::Sub,
                ..
            }
        ));
    }

    #[test]
    fn calls_collect_their_arguments() {
        let Expr::Call { func, args, offset } = parse_expr("min(1, frameIndex)").unwrap() else {
            panic!("expected a call");
        };
        assert_eq!(func, "min");
        assert_eq!(offset, 0);
        assert_eq!(args.len(), 2);

        let Expr::Call { args, .. } = parse_expr("now()").unwrap() else {
            panic!("expected a call");
        };
        assert!(args.is_empty());
    }

    #[test]
    fn conditionals_nest_to_the_right() {
        let Expr::Conditional { otherwise, .. } = parse_expr("a ? 1 : b ? 2 : 3").unwrap() else {
            panic!("expected conditional");
        };
        assert!(matches!(*otherwise, Expr::Conditional { .. }));
    }

    #[test]
    fn only_identifiers_can_be_called() {
        let err = parse_expr("(1)(2)").unwrap_err();
        assert_eq!(err.offset, 3);
    }

    #[test]
    fn trailing_tokens_are_reported_where_they_start() {
        let err = parse_expr("1 2").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.message.contains("number 2"));
    }

    #[test]
    fn unclosed_groups_name_the_missing_delimiter() {
        let err = parse_expr("max(1, 2").unwrap_err();
        assert_eq!(err.offset, 8);
        assert_eq!(err.message, "expected ')', found end of expression");
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse_expr(&deep).unwrap_err();
        assert!(err.message.contains("nesting"));

        let negations = format!("{}1", "-".repeat(200));
        assert!(parse_expr(&negations).is_err());
    }
}
