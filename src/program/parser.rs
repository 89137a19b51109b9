//! Recursive-descent parser for the program language.
//!
//! The grammar is the subset of Python that generated reasoning programs
//! use. Anything outside it (classes, decorators, `with`, set literals) is
//! rejected at compile time with a line and column.

use std::rc::Rc;

use crate::error::ProgramError;

use super::ast::{
    Arg, BinOp, Block, BoolOp, CmpOp, Comprehension, Constant, Expr, ExprKind, FStringPart, FunctionDef, Handler,
    Param, ParamKind, Stmt, StmtKind, Target, UnaryOp,
};
use super::lexer::{tokenize, tokenize_at, unescape, Tok, Token};

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

const AUG_OPS: [(&str, BinOp); 7] = [
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

/// Deepest nesting of blocks, brackets, unary operators and operator
/// chains a program may use. Each level costs native stack when parsing,
/// evaluating and dropping the tree.
const MAX_NESTING: usize = 100;

type PResult<T> = Result<T, ProgramError>;

/// Parses a whole program.
pub fn parse_module(source: &str) -> PResult<Block> {
    Parser::new(tokenize(source)?).module()
}

/// Parses a single expression (used for f-string fields).
pub fn parse_expression_at(source: &str, line: usize) -> PResult<Expr> {
    let mut parser = Parser::new(tokenize_at(source, line)?);
    let expr = parser.testlist()?;
    while matches!(parser.peek().tok, Tok::Newline) {
        parser.advance();
    }
    if !matches!(parser.peek().tok, Tok::Eof) {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, depth: 0 }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(&self.peek().tok, Tok::Op(o) if *o == op)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(&self.peek().tok, Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let hit = self.is_op(op);
        if hit {
            self.advance();
        }
        hit
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        let hit = self.is_kw(kw);
        if hit {
            self.advance();
        }
        hit
    }

    fn expect_op(&mut self, op: &str) -> PResult<Token> {
        if self.is_op(op) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected '{op}' but found {}", describe(&self.peek().tok))))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}' but found {}", describe(&self.peek().tok))))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match &self.peek().tok {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name but found {}", describe(other)))),
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek().tok, Tok::Newline | Tok::Eof) || self.is_op(";")
    }

    fn error(&self, message: impl Into<String>) -> ProgramError {
        let token = self.peek();
        ProgramError::compile(token.line, token.column, message)
    }

    fn unexpected(&self) -> ProgramError {
        self.error(format!("invalid syntax near {}", describe(&self.peek().tok)))
    }

    /// Takes one nesting level; callers give it back by restoring `depth`.
    fn deepen(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(format!("program is nested more than {MAX_NESTING} levels deep")));
        }
        Ok(())
    }

    // ---- statements ----

    fn module(&mut self) -> PResult<Block> {
        let mut body = Vec::new();
        loop {
            match self.peek().tok {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match &self.peek().tok {
            Tok::Name(name) => Some(name.clone()),
            _ => None,
        };
        if self.is_op("@") {
            return Err(self.error("decorators are not supported"));
        }
        if matches!(self.peek().tok, Tok::Indent) {
            return Err(self.error("unexpected indent"));
        }
        let kind = match keyword.as_deref() {
            Some("if") => self.if_stmt()?,
            Some("while") => self.while_stmt()?,
            Some("for") => self.for_stmt()?,
            Some("try") => self.try_stmt()?,
            Some("def") => StmtKind::FunctionDef(self.function_def()?),
            Some("class") => return Err(self.error("class definitions are not supported")),
            Some("with") => return Err(self.error("'with' statements are not supported")),
            Some("async") => return Err(self.error("async code is not supported")),
            _ => return self.simple_stmt(),
        };
        Ok(vec![Stmt { line, kind }])
    }

    fn block(&mut self) -> PResult<Block> {
        self.expect_op(":")?;
        if !matches!(self.peek().tok, Tok::Newline) {
            return self.simple_stmt();
        }
        self.advance();
        if !matches!(self.peek().tok, Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        self.deepen()?;
        let mut body = Vec::new();
        loop {
            match self.peek().tok {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
        self.depth -= 1;
        Ok(body)
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut branches = vec![(self.test()?, self.block()?)];
        let mut orelse = None;
        loop {
            if self.eat_kw("elif") {
                branches.push((self.test()?, self.block()?));
            } else if self.eat_kw("else") {
                orelse = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") { Some(self.block()?) } else { None };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") { Some(self.block()?) } else { None };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn try_stmt(&mut self) -> PResult<StmtKind> {
        self.advance();
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.is_kw("except") {
            let line = self.line();
            self.advance();
            let (kind, name) = if self.is_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                (Some(kind), name)
            };
            handlers.push(Handler {
                line,
                kind,
                name,
                body: self.block()?,
            });
        }
        let orelse = if self.eat_kw("else") { Some(self.block()?) } else { None };
        let finally = if self.eat_kw("finally") { Some(self.block()?) } else { None };
        if handlers.is_empty() && finally.is_none() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finally,
        })
    }

    fn function_def(&mut self) -> PResult<Rc<FunctionDef>> {
        let line = self.line();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            body,
            line,
            is_lambda: false,
        }))
    }

    fn params(&mut self, end: &str, annotations: bool) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(end) {
            if self.eat_op("**") {
                params.push(Param {
                    name: self.expect_name()?,
                    default: None,
                    kind: ParamKind::KwArgs,
                });
            } else if self.eat_op("*") {
                if matches!(self.peek().tok, Tok::Name(_)) {
                    params.push(Param {
                        name: self.expect_name()?,
                        default: None,
                        kind: ParamKind::VarArgs,
                    });
                }
            } else if self.eat_op("/") {
                // Positional-only marker.
            } else {
                let name = self.expect_name()?;
                if params.iter().any(|p| p.name == name) {
                    return Err(self.error(format!("duplicate argument '{name}' in function definition")));
                }
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
                let default = if self.eat_op("=") { Some(self.test()?) } else { None };
                params.push(Param {
                    name,
                    default,
                    kind: ParamKind::Normal,
                });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn simple_stmt(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.small_stmt()?];
        while self.eat_op(";") {
            if matches!(self.peek().tok, Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.small_stmt()?);
        }
        match self.peek().tok {
            Tok::Newline => {
                self.advance();
            }
            Tok::Eof | Tok::Dedent => {}
            _ => return Err(self.unexpected()),
        }
        Ok(stmts)
    }

    fn small_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let keyword = match &self.peek().tok {
            Tok::Name(name) => Some(name.clone()),
            _ => None,
        };
        let kind = match keyword.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                StmtKind::Return(if self.at_line_end() { None } else { Some(self.testlist()?) })
            }
            Some("raise") => {
                self.advance();
                let exc = if self.at_line_end() { None } else { Some(self.test()?) };
                if self.eat_kw("from") {
                    self.test()?;
                }
                StmtKind::Raise(exc)
            }
            Some("assert") => {
                self.advance();
                let test = self.test()?;
                let msg = if self.eat_op(",") { Some(self.test()?) } else { None };
                StmtKind::Assert { test, msg }
            }
            Some("import" | "from" | "global" | "nonlocal") => {
                while !self.at_line_end() {
                    self.advance();
                }
                StmtKind::Pass
            }
            Some("del") => {
                self.advance();
                let mut targets = vec![to_target(self.expr()?)?];
                while self.eat_op(",") {
                    if self.at_line_end() {
                        break;
                    }
                    targets.push(to_target(self.expr()?)?);
                }
                StmtKind::Delete(targets)
            }
            _ => self.expr_stmt()?,
        };
        Ok(Stmt { line, kind })
    }

    fn expr_stmt(&mut self) -> PResult<StmtKind> {
        let first = self.testlist()?;

        if let Some((_, op)) = AUG_OPS.iter().find(|(sym, _)| self.is_op(sym)) {
            let op = *op;
            self.advance();
            let value = self.testlist()?;
            return Ok(StmtKind::AugAssign {
                target: to_target(first)?,
                op,
                value,
            });
        }

        if self.is_op(":") {
            // Annotated assignment; the annotation is ignored.
            self.advance();
            self.test()?;
            if !self.eat_op("=") {
                return Ok(StmtKind::Pass);
            }
            let value = self.testlist()?;
            return Ok(StmtKind::Assign {
                targets: vec![to_target(first)?],
                value,
            });
        }

        if self.is_op("=") {
            let mut targets = vec![to_target(first)?];
            let value = loop {
                self.advance();
                let next = self.testlist()?;
                if self.is_op("=") {
                    targets.push(to_target(next)?);
                } else {
                    break next;
                }
            };
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    /// Loop targets: expressions below the comparison level, so `in` is
    /// left for the caller.
    fn target_list(&mut self) -> PResult<Target> {
        let line = self.line();
        let first = self.expr()?;
        if !self.is_op(",") {
            return to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op("=") {
                break;
            }
            items.push(self.expr()?);
        }
        to_target(Expr::new(line, ExprKind::Tuple(items)))
    }

    // ---- expressions ----

    fn testlist(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.test()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_line_end() || self.is_op("=") || self.is_op(")") || self.starts_aug_or_colon() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::new(line, ExprKind::Tuple(items)))
    }

    fn starts_aug_or_colon(&self) -> bool {
        self.is_op(":") || AUG_OPS.iter().any(|(sym, _)| self.is_op(sym))
    }

    fn test(&mut self) -> PResult<Expr> {
        self.deepen()?;
        let expr = self.conditional()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        if self.is_kw("lambda") {
            return self.lambda();
        }
        let line = self.line();
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.test()?;
            return Ok(Expr::new(
                line,
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
            ));
        }
        Ok(body)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.params(":", false)?;
        self.expect_op(":")?;
        let body = self.test()?;
        let def = FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
            line,
            is_lambda: true,
        };
        Ok(Expr::new(line, ExprKind::Lambda(Rc::new(def))))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut left = self.and_test()?;
        while self.is_kw("or") {
            let line = self.line();
            self.advance();
            self.deepen()?;
            let right = self.and_test()?;
            left = Expr::new(
                line,
                ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        self.depth = depth;
        Ok(left)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut left = self.not_test()?;
        while self.is_kw("and") {
            let line = self.line();
            self.advance();
            self.deepen()?;
            let right = self.not_test()?;
            left = Expr::new(
                line,
                ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        self.depth = depth;
        Ok(left)
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.is_kw("not") {
            let line = self.line();
            self.advance();
            self.deepen()?;
            let operand = self.not_test()?;
            self.depth -= 1;
            return Ok(Expr::new(
                line,
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let line = self.line();
        let left = self.expr()?;
        let mut ops = Vec::new();
        while let Some((op, width)) = self.comparison_op() {
            for _ in 0..width {
                self.advance();
            }
            ops.push((op, self.expr()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            line,
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
        ))
    }

    /// The comparison operator at the cursor and how many tokens it spans.
    fn comparison_op(&self) -> Option<(CmpOp, usize)> {
        let next_is = |word: &str| matches!(&self.peek_at(1).tok, Tok::Name(m) if m == word);
        let op = match &self.peek().tok {
            Tok::Op("==") => (CmpOp::Eq, 1),
            Tok::Op("!=") => (CmpOp::NotEq, 1),
            Tok::Op("<") => (CmpOp::Lt, 1),
            Tok::Op("<=") => (CmpOp::LtE, 1),
            Tok::Op(">") => (CmpOp::Gt, 1),
            Tok::Op(">=") => (CmpOp::GtE, 1),
            Tok::Name(n) if n == "in" => (CmpOp::In, 1),
            Tok::Name(n) if n == "not" && next_is("in") => (CmpOp::NotIn, 2),
            Tok::Name(n) if n == "is" && next_is("not") => (CmpOp::IsNot, 2),
            Tok::Name(n) if n == "is" => (CmpOp::Is, 1),
            _ => return None,
        };
        Some(op)
    }

    fn expr(&mut self) -> PResult<Expr> {
        if self.is_op("|") || self.is_op("&") || self.is_op("^") {
            return Err(self.error("bitwise operators are not supported"));
        }
        let expr = self.arith()?;
        if self.is_op("|") || self.is_op("&") || self.is_op("^") || self.is_op("<<") || self.is_op(">>") {
            return Err(self.error("bitwise operators are not supported"));
        }
        Ok(expr)
    }

    fn arith(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut left = self.term()?;
        loop {
            let op = if self.is_op("+") {
                BinOp::Add
            } else if self.is_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let line = self.line();
            self.advance();
            self.deepen()?;
            let right = self.term()?;
            left = binop(line, op, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let mut left = self.factor()?;
        loop {
            let op = match &self.peek().tok {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                Tok::Op("@") => return Err(self.error("matrix multiplication is not supported")),
                _ => break,
            };
            let line = self.line();
            self.advance();
            self.deepen()?;
            let right = self.factor()?;
            left = binop(line, op, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let line = self.line();
        let op = match &self.peek().tok {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => return Err(self.error("bitwise operators are not supported")),
            _ => return self.power(),
        };
        self.advance();
        self.deepen()?;
        let operand = self.factor()?;
        self.depth -= 1;
        Ok(Expr::new(
            line,
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
        ))
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.atom_expr()?;
        if self.is_op("**") {
            let line = self.line();
            self.advance();
            self.deepen()?;
            let exponent = self.factor()?;
            self.depth -= 1;
            return Ok(binop(line, BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn atom_expr(&mut self) -> PResult<Expr> {
        if self.is_kw("await") {
            return Err(self.error("async code is not supported"));
        }
        let depth = self.depth;
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.is_op("(") || self.is_op("[") || self.is_op(".") {
                self.deepen()?;
            }
            if self.eat_op("(") {
                let args = self.arguments()?;
                expr = Expr::new(
                    line,
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                );
            } else if self.eat_op("[") {
                let index = self.subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    line,
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                );
            } else if self.eat_op(".") {
                let name = match &self.peek().tok {
                    Tok::Name(name) => name.clone(),
                    other => return Err(self.error(format!("expected attribute name but found {}", describe(other)))),
                };
                self.advance();
                expr = Expr::new(
                    line,
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        name,
                    },
                );
            } else {
                break;
            }
        }
        self.depth = depth;
        Ok(expr)
    }

    fn arguments(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.is_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.test()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.test()?));
            } else if matches!(self.peek().tok, Tok::Name(_)) && matches!(self.peek_at(1).tok, Tok::Op("=")) {
                let name = self.expect_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.test()?));
            } else {
                let line = self.line();
                let value = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehension()?;
                    args.push(Arg::Positional(Expr::new(
                        line,
                        ExprKind::ListComp {
                            elt: Box::new(value),
                            generators,
                        },
                    )));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn subscript_list(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.subscript()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.subscript()?);
        }
        Ok(Expr::new(line, ExprKind::Tuple(items)))
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let line = self.line();
        let lower = if self.is_op(":") { None } else { Some(self.test()?) };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.unexpected());
        }
        let ends = |p: &Self| p.is_op("]") || p.is_op(",") || p.is_op(":");
        let upper = if ends(self) { None } else { Some(Box::new(self.test()?)) };
        let step = if self.eat_op(":") {
            if ends(self) {
                None
            } else {
                Some(Box::new(self.test()?))
            }
        } else {
            None
        };
        Ok(Expr::new(
            line,
            ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
        ))
    }

    fn comprehension(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let line = token.line;
        match token.tok {
            Tok::Op("(") => {
                self.advance();
                if self.eat_op(")") {
                    return Ok(Expr::new(line, ExprKind::Tuple(Vec::new())));
                }
                let first = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehension()?;
                    self.expect_op(")")?;
                    return Ok(Expr::new(
                        line,
                        ExprKind::ListComp {
                            elt: Box::new(first),
                            generators,
                        },
                    ));
                }
                if !self.is_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op(")") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op(")")?;
                Ok(Expr::new(line, ExprKind::Tuple(items)))
            }
            Tok::Op("[") => {
                self.advance();
                if self.eat_op("]") {
                    return Ok(Expr::new(line, ExprKind::List(Vec::new())));
                }
                let first = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehension()?;
                    self.expect_op("]")?;
                    return Ok(Expr::new(
                        line,
                        ExprKind::ListComp {
                            elt: Box::new(first),
                            generators,
                        },
                    ));
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op("]") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op("]")?;
                Ok(Expr::new(line, ExprKind::List(items)))
            }
            Tok::Op("{") => {
                self.advance();
                if self.eat_op("}") {
                    return Ok(Expr::new(line, ExprKind::Dict(Vec::new())));
                }
                let key = self.test()?;
                if !self.eat_op(":") {
                    return Err(self.error("set literals are not supported"));
                }
                let value = self.test()?;
                if self.is_kw("for") {
                    let generators = self.comprehension()?;
                    self.expect_op("}")?;
                    return Ok(Expr::new(
                        line,
                        ExprKind::DictComp {
                            key: Box::new(key),
                            value: Box::new(value),
                            generators,
                        },
                    ));
                }
                let mut pairs = vec![(key, value)];
                while self.eat_op(",") {
                    if self.is_op("}") {
                        break;
                    }
                    let key = self.test()?;
                    self.expect_op(":")?;
                    pairs.push((key, self.test()?));
                }
                self.expect_op("}")?;
                Ok(Expr::new(line, ExprKind::Dict(pairs)))
            }
            Tok::Op("...") => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Constant(Constant::None)))
            }
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Constant(Constant::Int(v))))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(Expr::new(line, ExprKind::Constant(Constant::Float(v))))
            }
            Tok::Str { .. } => self.strings(),
            Tok::Name(name) => {
                let constant = match name.as_str() {
                    "None" => Some(Constant::None),
                    "True" => Some(Constant::Bool(true)),
                    "False" => Some(Constant::Bool(false)),
                    _ => None,
                };
                if let Some(constant) = constant {
                    self.advance();
                    return Ok(Expr::new(line, ExprKind::Constant(constant)));
                }
                if KEYWORDS.contains(&name.as_str()) {
                    return Err(self.unexpected());
                }
                self.advance();
                Ok(Expr::new(line, ExprKind::Name(name)))
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Adjacent string literals concatenate; any f-string among them makes
    /// the whole an f-string.
    fn strings(&mut self) -> PResult<Expr> {
        let line = self.line();
        let mut parts = Vec::new();
        let mut formatted = false;
        while let Tok::Str { value, fstring, raw } = self.peek().tok.clone() {
            let token = self.advance();
            if fstring {
                formatted = true;
                parts.extend(fstring_parts(&value, raw, token.line, token.column)?);
            } else {
                parts.push(FStringPart::Literal(value));
            }
        }
        if formatted {
            return Ok(Expr::new(line, ExprKind::FString(parts)));
        }
        let text: String = parts
            .into_iter()
            .map(|part| match part {
                FStringPart::Literal(s) => s,
                FStringPart::Field { .. } => String::new(),
            })
            .collect();
        Ok(Expr::new(line, ExprKind::Constant(Constant::Str(text.into()))))
    }
}

fn binop(line: usize, op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::new(
        line,
        ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
    )
}

fn to_target(expr: Expr) -> PResult<Target> {
    match expr.kind {
        ExprKind::Name(name) => Ok(Target::Name(name)),
        ExprKind::Subscript { value, index } => Ok(Target::Subscript {
            value: *value,
            index: *index,
        }),
        ExprKind::Attribute { value, name } => Ok(Target::Attribute { value: *value, name }),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            Ok(Target::Tuple(items.into_iter().map(to_target).collect::<PResult<_>>()?))
        }
        _ => Err(ProgramError::compile(expr.line, 1, "cannot assign to expression")),
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(name) => format!("'{name}'"),
        Tok::Int(v) => format!("'{v}'"),
        Tok::Float(v) => format!("'{v}'"),
        Tok::Str { .. } => "string literal".to_string(),
        Tok::Op(op) => format!("'{op}'"),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

/// Splits an f-string body into literal text and replacement fields.
fn fstring_parts(body: &str, raw: bool, line: usize, column: usize) -> PResult<Vec<FStringPart>> {
    let chars: Vec<char> = body.chars().collect();
    let err = |message: &str| ProgramError::compile(line, column, format!("f-string: {message}"));
    let mut parts = Vec::new();
    let mut literal = String::new();
    let flush = |literal: &mut String, parts: &mut Vec<FStringPart>| {
        if !literal.is_empty() {
            let text = if raw { std::mem::take(literal) } else { unescape(&std::mem::take(literal)) };
            parts.push(FStringPart::Literal(text));
        }
    };

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err(err("single '}' is not allowed")),
            '{' => {
                flush(&mut literal, &mut parts);
                i += 1;
                let start = i;
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                while i < chars.len() {
                    let c = chars[i];
                    if let Some(q) = quote {
                        if c == q {
                            quote = None;
                        }
                        i += 1;
                        continue;
                    }
                    match c {
                        '\'' | '"' => quote = Some(c),
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' => depth = depth.saturating_sub(1),
                        '}' if depth == 0 => break,
                        '}' => depth -= 1,
                        '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => break,
                        ':' if depth == 0 => break,
                        _ => {}
                    }
                    i += 1;
                }
                let source: String = chars[start..i].iter().collect();
                if source.trim().is_empty() {
                    return Err(err("empty expression not allowed"));
                }

                let conversion = if chars.get(i) == Some(&'!') {
                    let c = chars.get(i + 1).copied().ok_or_else(|| err("expecting '}'"))?;
                    if !matches!(c, 'r' | 's' | 'a') {
                        return Err(err("invalid conversion character"));
                    }
                    i += 2;
                    Some(c)
                } else {
                    None
                };

                let spec = if chars.get(i) == Some(&':') {
                    i += 1;
                    let spec_start = i;
                    let mut nested = 0usize;
                    while i < chars.len() && (chars[i] != '}' || nested > 0) {
                        match chars[i] {
                            '{' => nested += 1,
                            '}' => nested -= 1,
                            _ => {}
                        }
                        i += 1;
                    }
                    Some(chars[spec_start..i].iter().collect::<String>())
                } else {
                    None
                };

                if chars.get(i) != Some(&'}') {
                    return Err(err("expecting '}'"));
                }
                i += 1;

                let expr = parse_expression_at(source.trim(), line)?;
                parts.push(FStringPart::Field {
                    expr: Box::new(expr),
                    conversion,
                    spec,
                });
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush(&mut literal, &mut parts);
    Ok(parts)
}
