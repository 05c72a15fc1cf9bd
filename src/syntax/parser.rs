//! Recursive-descent / precedence-climbing parser (spec.md §4.1's AST, §6's
//! source surface). Produces a [`Program`] of top-level [`Node`]s; function
//! bodies, `let`, `match`, and block statements recurse into the same
//! grammar.

use crate::ast::{BinOp, LetBinding, MatchArm, Node, NodeKind, Program, Span, UnOp};
use crate::syntax::lexer::LexError;
use crate::syntax::token::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    Lex(LexError),
    Syntax { message: String, line: u32, col: u32 },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Lex(e) => write!(f, "{e}"),
            ParseError::Syntax { message, line, col } => write!(f, "{line}:{col}: {message}"),
        }
    }
}

pub fn parse(src: &str) -> Result<Program, ParseError> {
    let tokens = crate::syntax::lexer::Lexer::new(src)
        .tokenize()
        .map_err(ParseError::Lex)?;
    Parser::new(tokens).parse_program()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_id: u32,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.peek() == &kind {
            Ok(self.advance())
        } else {
            let span = self.peek_span();
            Err(ParseError::Syntax {
                message: format!("expected {kind:?}, found {:?}", self.peek()),
                line: span.line,
                col: span.col,
            })
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => {
                let span = self.peek_span();
                Err(ParseError::Syntax {
                    message: format!("expected identifier, found {other:?}"),
                    line: span.line,
                    col: span.col,
                })
            }
        }
    }

    pub fn parse_program(mut self) -> Result<Program, ParseError> {
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        Ok(Program {
            stmts,
            node_count: self.next_id,
        })
    }

    fn node(&mut self, span: Span, kind: NodeKind) -> Node {
        Node::new(self.fresh_id(), span, kind)
    }

    // ---- statements ----

    fn parse_stmt(&mut self) -> Result<Node, ParseError> {
        let start = self.peek_span();
        let stmt = match self.peek().clone() {
            TokenKind::Module => {
                self.advance();
                let name = self.expect_ident()?;
                self.eat_semi();
                self.node(start, NodeKind::Module(name))
            }
            TokenKind::Import => {
                self.advance();
                let name = self.expect_ident()?;
                self.eat_semi();
                self.node(start, NodeKind::Import(name))
            }
            TokenKind::Export => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let mut names = Vec::new();
                if !self.at(&TokenKind::RParen) {
                    names.push(self.expect_ident()?);
                    while self.at(&TokenKind::Comma) {
                        self.advance();
                        names.push(self.expect_ident()?);
                    }
                }
                self.expect(TokenKind::RParen)?;
                self.eat_semi();
                self.node(start, NodeKind::Export(names))
            }
            TokenKind::Namespace => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(TokenKind::LBrace)?;
                let mut body = Vec::new();
                while !self.at(&TokenKind::RBrace) {
                    body.push(self.parse_stmt()?);
                }
                self.expect(TokenKind::RBrace)?;
                self.node(start, NodeKind::Namespace { name, body })
            }
            TokenKind::AtomKw => {
                self.advance();
                let name = self.expect_ident()?;
                self.eat_semi();
                self.node(start, NodeKind::AtomDef(name))
            }
            TokenKind::Using => {
                self.advance();
                let namespace = self.expect_ident()?;
                let alias = if self.at(&TokenKind::As) {
                    self.advance();
                    Some(self.expect_ident()?)
                } else {
                    None
                };
                self.eat_semi();
                self.node(start, NodeKind::Using { namespace, alias })
            }
            TokenKind::Var => {
                self.advance();
                let name = self.expect_ident()?;
                self.expect(TokenKind::Eq)?;
                let value = self.parse_expr()?;
                self.eat_semi();
                self.node(
                    start,
                    NodeKind::VarDef {
                        name,
                        value: Box::new(value),
                    },
                )
            }
            TokenKind::Ret => {
                self.advance();
                let value = if self.at(&TokenKind::Semi) || self.at(&TokenKind::RBrace) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                self.eat_semi();
                self.node(start, NodeKind::Return(value))
            }
            _ => {
                let expr = self.parse_expr()?;
                self.eat_semi();
                let span = expr.span;
                self.node(span, NodeKind::ExprStmt(Box::new(expr)))
            }
        };
        Ok(stmt)
    }

    fn eat_semi(&mut self) {
        if self.at(&TokenKind::Semi) {
            self.advance();
        }
    }

    fn parse_block(&mut self) -> Result<Node, ParseError> {
        let start = self.peek_span();
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            stmts.push(self.parse_stmt()?);
        }
        let end = self.peek_span();
        self.expect(TokenKind::RBrace)?;
        Ok(self.node(start.to(end), NodeKind::StmtBlock(stmts)))
    }

    // ---- expressions (precedence climbing) ----

    fn parse_expr(&mut self) -> Result<Node, ParseError> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Result<Node, ParseError> {
        let target = self.parse_binary(0)?;
        if self.at(&TokenKind::Eq) {
            self.advance();
            let value = self.parse_assign()?;
            let span = target.span.to(value.span);
            return Ok(self.node(
                span,
                NodeKind::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                },
            ));
        }
        Ok(target)
    }

    fn binop_for(kind: &TokenKind) -> Option<(BinOp, u8, bool)> {
        // (op, precedence, right_associative)
        Some(match kind {
            TokenKind::OrOr => (BinOp::Or, 1, false),
            TokenKind::AndAnd => (BinOp::And, 2, false),
            TokenKind::EqEq => (BinOp::Eq, 3, false),
            TokenKind::BangEq => (BinOp::Neq, 3, false),
            TokenKind::Lt => (BinOp::Lt, 4, false),
            TokenKind::Lte => (BinOp::Lte, 4, false),
            TokenKind::Gt => (BinOp::Gt, 4, false),
            TokenKind::Gte => (BinOp::Gte, 4, false),
            TokenKind::Plus => (BinOp::Add, 5, false),
            TokenKind::Minus => (BinOp::Sub, 5, false),
            TokenKind::Star => (BinOp::Mul, 6, false),
            TokenKind::Slash => (BinOp::Div, 6, false),
            TokenKind::Percent => (BinOp::Mod, 6, false),
            TokenKind::Caret => (BinOp::Pow, 7, true),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Node, ParseError> {
        let mut lhs = self.parse_cons()?;
        while let Some((op, prec, right_assoc)) = Self::binop_for(self.peek()) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;
            let span = lhs.span.to(rhs.span);
            lhs = self.node(span, NodeKind::BinOp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    /// `a . b` forms an explicit dotted pair (§3's "Cons(fst,snd)"),
    /// binding looser than comparisons so `1 . 2 == x` still parses as
    /// `1 . (2 == x)`... chosen right-associative to match list-literal
    /// tails (`a . b . c` nests as `a . (b . c)`).
    fn parse_cons(&mut self) -> Result<Node, ParseError> {
        let lhs = self.parse_unary()?;
        if self.at(&TokenKind::Dot) {
            self.advance();
            let rhs = self.parse_cons()?;
            let span = lhs.span.to(rhs.span);
            return Ok(self.node(span, NodeKind::Cons(Box::new(lhs), Box::new(rhs))));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        let start = self.peek_span();
        match self.peek().clone() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.to(operand.span);
                Ok(self.node(span, NodeKind::UnOp(UnOp::Neg, Box::new(operand))))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                let span = start.to(operand.span);
                Ok(self.node(span, NodeKind::UnOp(UnOp::Not, Box::new(operand))))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Node, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().clone() {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.at(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        while self.at(&TokenKind::Comma) {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    let end = self.peek_span();
                    self.expect(TokenKind::RParen)?;
                    let span = expr.span.to(end);
                    expr = self.node(
                        span,
                        NodeKind::FunCall {
                            callee: Box::new(expr),
                            args,
                        },
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let end = self.peek_span();
                    self.expect(TokenKind::RBracket)?;
                    let span = expr.span.to(end);
                    expr = self.node(
                        span,
                        NodeKind::Subscript {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let start = self.peek_span();
        match self.peek().clone() {
            TokenKind::Integer(v) => {
                self.advance();
                Ok(self.node(start, NodeKind::Integer(v)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(self.node(start, NodeKind::Float(v)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(self.node(start, NodeKind::Str(s)))
            }
            TokenKind::Atom(name) => {
                self.advance();
                Ok(self.node(start, NodeKind::Atom(name)))
            }
            TokenKind::True => {
                self.advance();
                Ok(self.node(start, NodeKind::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(self.node(start, NodeKind::Bool(false)))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(self.node(start, NodeKind::Nil))
            }
            TokenKind::Dollar => {
                self.advance();
                Ok(self.node(start, NodeKind::Ident("$".to_string())))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(self.node(start, NodeKind::Ident(name)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.at(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    while self.at(&TokenKind::Comma) {
                        self.advance();
                        items.push(self.parse_expr()?);
                    }
                }
                let end = self.peek_span();
                self.expect(TokenKind::RBracket)?;
                Ok(self.node(start.to(end), NodeKind::Vector(items)))
            }
            TokenKind::Quote => {
                self.advance();
                self.parse_list_literal(start)
            }
            TokenKind::Fun => self.parse_fun(start),
            TokenKind::If => self.parse_if(start),
            TokenKind::Match => self.parse_match(start),
            TokenKind::Let => self.parse_let(start),
            TokenKind::LBrace => self.parse_block(),
            _ => {
                // `<digits> : prec { body }` precision block; digits is any
                // primary expression already parsed by the caller chain, so
                // this arm only triggers when a bare numeral starts it —
                // handled via look-ahead from parse_postfix's caller instead.
                let span = self.peek_span();
                Err(ParseError::Syntax {
                    message: format!("unexpected token {:?}", self.peek()),
                    line: span.line,
                    col: span.col,
                })
            }
        }
        .and_then(|expr| self.maybe_precision_block(expr))
    }

    /// `<expr> : prec { body }` — precision block. Checked as a postfix on
    /// whatever primary expression was just parsed, since the digit count
    /// is itself an arbitrary expression (§4.4).
    fn maybe_precision_block(&mut self, digits: Node) -> Result<Node, ParseError> {
        if self.at(&TokenKind::Colon) {
            let save = self.pos;
            self.advance();
            if self.at(&TokenKind::Prec) {
                self.advance();
                let body = self.parse_block()?;
                let span = digits.span.to(body.span);
                return Ok(self.node(
                    span,
                    NodeKind::PrecisionBlock {
                        digits: Box::new(digits),
                        body: Box::new(body),
                    },
                ));
            }
            self.pos = save;
        }
        Ok(digits)
    }

    fn parse_list_literal(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut items = Vec::new();
        let mut tail = None;
        while !self.at(&TokenKind::RParen) {
            if self.at(&TokenKind::Dot) {
                self.advance();
                tail = Some(Box::new(self.parse_expr()?));
                break;
            }
            items.push(self.parse_expr()?);
        }
        let end = self.peek_span();
        self.expect(TokenKind::RParen)?;
        Ok(self.node(start.to(end), NodeKind::ListLit { items, tail }))
    }

    fn parse_fun(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect(TokenKind::Fun)?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            params.push(self.expect_ident()?);
            while self.at(&TokenKind::Comma) {
                self.advance();
                params.push(self.expect_ident()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = if self.at(&TokenKind::LBrace) {
            self.parse_block()?
        } else {
            self.parse_expr()?
        };
        let span = start.to(body.span);
        Ok(self.node(
            span,
            NodeKind::Fun {
                params,
                body: Box::new(body),
            },
        ))
    }

    fn parse_if(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect(TokenKind::If)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        let conseq = self.parse_expr()?;
        let antecedent = if self.at(&TokenKind::Else) {
            self.advance();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let span = antecedent
            .as_ref()
            .map(|a| start.to(a.span))
            .unwrap_or_else(|| start.to(conseq.span));
        Ok(self.node(
            span,
            NodeKind::If {
                cond: Box::new(cond),
                conseq: Box::new(conseq),
                antecedent,
            },
        ))
    }

    fn parse_match(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect(TokenKind::Match)?;
        let subject = self.parse_expr()?;
        self.expect(TokenKind::LBrace)?;
        let mut arms = Vec::new();
        let mut else_body = None;
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Else) {
                self.advance();
                self.expect(TokenKind::Arrow)?;
                let body = self.parse_expr()?;
                self.eat_semi();
                else_body = Some(Box::new(body));
                continue;
            }
            self.expect(TokenKind::Case)?;
            let pattern = self.parse_pattern()?;
            self.expect(TokenKind::Arrow)?;
            let body = self.parse_expr()?;
            self.eat_semi();
            arms.push(MatchArm { pattern, body });
        }
        let end = self.peek_span();
        self.expect(TokenKind::RBrace)?;
        Ok(self.node(
            start.to(end),
            NodeKind::Match {
                subject: Box::new(subject),
                arms,
                else_body,
            },
        ))
    }

    /// Patterns are a restricted subset of expressions: literals, bare
    /// identifiers (pattern variables), and `'(...)`/`a . b` structure
    /// (§4.2 "Pattern variables").
    fn parse_pattern(&mut self) -> Result<Node, ParseError> {
        let start = self.peek_span();
        match self.peek().clone() {
            TokenKind::Quote => {
                self.advance();
                self.parse_list_literal(start)
            }
            _ => self.parse_cons(),
        }
    }

    fn parse_let(&mut self, start: Span) -> Result<Node, ParseError> {
        self.expect(TokenKind::Let)?;
        let mut bindings = Vec::new();
        loop {
            let bind_id = self.fresh_id();
            let name = self.expect_ident()?;
            self.expect(TokenKind::Eq)?;
            let value = self.parse_expr()?;
            bindings.push(LetBinding {
                id: bind_id,
                name,
                value,
            });
            if self.at(&TokenKind::Comma) {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(TokenKind::In)?;
        let body = self.parse_expr()?;
        let span = start.to(body.span);
        Ok(self.node(
            span,
            NodeKind::Let {
                bindings,
                body: Box::new(body),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_precedence() {
        let program = parse("1 + 2 * 3;").unwrap();
        assert_eq!(program.stmts.len(), 1);
        match &program.stmts[0].kind {
            NodeKind::ExprStmt(e) => match &e.kind {
                NodeKind::BinOp(BinOp::Add, lhs, rhs) => {
                    assert!(matches!(lhs.kind, NodeKind::Integer(1)));
                    assert!(matches!(rhs.kind, NodeKind::BinOp(BinOp::Mul, _, _)));
                }
                other => panic!("expected BinOp::Add, got {other:?}"),
            },
            other => panic!("expected ExprStmt, got {other:?}"),
        }
    }

    #[test]
    fn parses_closure_and_call() {
        let program = parse(
            "var mk = fun (x) { fun () { x = x + 1; x } };\nvar c = mk(10);\nc(); c(); c()",
        )
        .unwrap();
        assert_eq!(program.stmts.len(), 5);
    }

    #[test]
    fn parses_match_with_dotted_pattern() {
        let program = parse(
            "match '(1 . (2 . 1)) {\n  case '(x . (y . x)) => x + y;\n  else => 0;\n}",
        )
        .unwrap();
        let NodeKind::ExprStmt(e) = &program.stmts[0].kind else {
            panic!("expected expr stmt")
        };
        assert!(matches!(e.kind, NodeKind::Match { .. }));
    }

    #[test]
    fn parses_import_and_qualified_call() {
        let program = parse("module B;\nimport A;\nA:f(21)").unwrap();
        assert_eq!(program.stmts.len(), 3);
        assert!(matches!(program.stmts[0].kind, NodeKind::Module(_)));
        assert!(matches!(program.stmts[1].kind, NodeKind::Import(_)));
    }

    #[test]
    fn parses_precision_block() {
        let program = parse("20:prec { 1 + 2 }").unwrap();
        let NodeKind::ExprStmt(e) = &program.stmts[0].kind else {
            panic!("expected expr stmt")
        };
        assert!(matches!(e.kind, NodeKind::PrecisionBlock { .. }));
    }
}
