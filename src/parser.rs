// File: src/parser.rs
//
// Recursive-descent parser for Hemlock. Consumes the token stream from the
// lexer and produces the AST consumed by the bytecode compiler. Stops at the
// first syntax error; the compiler handles its own error synchronisation.

use crate::ast::{BinaryOp, Expr, Param, Stmt, UnaryOp};
use crate::errors::HemlockError;
use crate::lexer::{tokenize, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse_program(source: &str) -> Result<Vec<Stmt>, HemlockError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse()
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>, HemlockError> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    // ----- token helpers -----

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn line(&self) -> u32 {
        self.current().line
    }

    fn at_eof(&self) -> bool {
        matches!(self.kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check_sym(&self, sym: &str) -> bool {
        matches!(self.kind(), TokenKind::Sym(s) if s == sym)
    }

    fn match_sym(&mut self, sym: &str) -> bool {
        if self.check_sym(sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), HemlockError> {
        if self.match_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("Expected '{}', found {}", sym, self.describe())))
        }
    }

    fn check_keyword(&self, kw: &str) -> bool {
        matches!(self.kind(), TokenKind::Keyword(k) if k == kw)
    }

    fn match_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), HemlockError> {
        if self.match_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("Expected '{}', found {}", kw, self.describe())))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, HemlockError> {
        match self.kind().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("Expected identifier, found {}", self.describe()))),
        }
    }

    fn describe(&self) -> String {
        match self.kind() {
            TokenKind::Int(n) => format!("'{}'", n),
            TokenKind::Float(n) => format!("'{}'", n),
            TokenKind::Str(_) | TokenKind::InterpStr { .. } => "string literal".to_string(),
            TokenKind::Rune(r) => format!("'{}'", r),
            TokenKind::Identifier(name) => format!("'{}'", name),
            TokenKind::Keyword(kw) => format!("'{}'", kw),
            TokenKind::Sym(s) => format!("'{}'", s),
            TokenKind::Eof => "end of input".to_string(),
        }
    }

    fn error(&self, message: impl Into<String>) -> HemlockError {
        HemlockError::parse(message, self.current().line, self.current().column)
    }

    /// Optional statement terminator.
    fn end_stmt(&mut self) {
        self.match_sym(";");
    }

    // ----- statements -----

    fn parse_stmt(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        match self.kind().clone() {
            TokenKind::Keyword(kw) => match kw.as_str() {
                "let" | "const" => self.parse_let(kw == "const"),
                "if" => self.parse_if(),
                "while" => self.parse_while(),
                "for" => self.parse_for(),
                "return" => {
                    self.advance();
                    let value = if self.check_sym(";") || self.check_sym("}") || self.at_eof() {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    self.end_stmt();
                    Ok(Stmt::Return { value, line })
                }
                "break" => {
                    self.advance();
                    self.end_stmt();
                    Ok(Stmt::Break { line })
                }
                "continue" => {
                    self.advance();
                    self.end_stmt();
                    Ok(Stmt::Continue { line })
                }
                "switch" => self.parse_switch(),
                "try" => self.parse_try(),
                "throw" => {
                    self.advance();
                    let value = self.parse_expr()?;
                    self.end_stmt();
                    Ok(Stmt::Throw { value, line })
                }
                "defer" => {
                    self.advance();
                    let call = self.parse_expr()?;
                    if !matches!(call, Expr::Call { .. } | Expr::OptionalChain { is_call: true, .. })
                    {
                        return Err(self.error("defer expects a call expression"));
                    }
                    self.end_stmt();
                    Ok(Stmt::Defer { call, line })
                }
                "enum" => self.parse_enum(),
                _ => {
                    let expr = self.parse_expr()?;
                    self.end_stmt();
                    Ok(Stmt::Expr { expr, line })
                }
            },
            TokenKind::Sym(s) if s == "{" => {
                let body = self.parse_block()?;
                Ok(Stmt::Block { body, line })
            }
            _ => {
                let expr = self.parse_expr()?;
                self.end_stmt();
                Ok(Stmt::Expr { expr, line })
            }
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, HemlockError> {
        self.expect_sym("{")?;
        let mut body = Vec::new();
        while !self.check_sym("}") && !self.at_eof() {
            body.push(self.parse_stmt()?);
        }
        self.expect_sym("}")?;
        Ok(body)
    }

    fn parse_type_annotation(&mut self) -> Result<Option<String>, HemlockError> {
        if !self.match_sym(":") {
            return Ok(None);
        }
        let name = self.expect_identifier()?;
        Ok(Some(name))
    }

    fn parse_let(&mut self, is_const: bool) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance(); // let / const
        let name = self.expect_identifier()?;
        let type_name = self.parse_type_annotation()?;
        let initializer = if self.match_sym("=") { Some(self.parse_expr()?) } else { None };
        if is_const && initializer.is_none() {
            return Err(self.error("const declaration requires an initializer"));
        }
        self.end_stmt();
        Ok(Stmt::Let { name, type_name, initializer, is_const, line })
    }

    fn parse_if(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        self.expect_sym("(")?;
        let condition = self.parse_expr()?;
        self.expect_sym(")")?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.match_keyword("else") {
            if self.check_keyword("if") {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::If { condition, then_branch, else_branch, line })
    }

    fn parse_while(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        self.expect_sym("(")?;
        let condition = self.parse_expr()?;
        self.expect_sym(")")?;
        let body = self.parse_block()?;
        Ok(Stmt::While { condition, body, line })
    }

    fn parse_for(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        self.expect_sym("(")?;

        // `for (x in e)` and `for (k, v in e)` need bounded lookahead to tell
        // them apart from a C-style header.
        if let TokenKind::Identifier(first) = self.kind().clone() {
            let next = self.tokens.get(self.pos + 1).map(|t| &t.kind);
            if matches!(next, Some(TokenKind::Keyword(kw)) if kw == "in") {
                self.advance();
                self.advance();
                let iterable = self.parse_expr()?;
                self.expect_sym(")")?;
                let body = self.parse_block()?;
                return Ok(Stmt::ForIn { key_var: None, value_var: first, iterable, body, line });
            }
            if matches!(next, Some(TokenKind::Sym(s)) if s == ",") {
                let after = self.tokens.get(self.pos + 2).map(|t| &t.kind);
                let in_follows = matches!(
                    self.tokens.get(self.pos + 3).map(|t| &t.kind),
                    Some(TokenKind::Keyword(kw)) if kw == "in"
                );
                if matches!(after, Some(TokenKind::Identifier(_))) && in_follows {
                    self.advance();
                    self.advance();
                    let value_var = self.expect_identifier()?;
                    self.advance(); // in
                    let iterable = self.parse_expr()?;
                    self.expect_sym(")")?;
                    let body = self.parse_block()?;
                    return Ok(Stmt::ForIn {
                        key_var: Some(first),
                        value_var,
                        iterable,
                        body,
                        line,
                    });
                }
            }
        }

        let init = if self.match_sym(";") {
            None
        } else if self.check_keyword("let") || self.check_keyword("const") {
            let is_const = self.check_keyword("const");
            Some(Box::new(self.parse_let(is_const)?))
        } else {
            let expr_line = self.line();
            let expr = self.parse_expr()?;
            self.expect_sym(";")?;
            Some(Box::new(Stmt::Expr { expr, line: expr_line }))
        };

        let condition = if self.check_sym(";") { None } else { Some(self.parse_expr()?) };
        self.expect_sym(";")?;
        let increment = if self.check_sym(")") { None } else { Some(self.parse_expr()?) };
        self.expect_sym(")")?;
        let body = self.parse_block()?;
        Ok(Stmt::For { init, condition, increment, body, line })
    }

    fn parse_switch(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        self.expect_sym("(")?;
        let scrutinee = self.parse_expr()?;
        self.expect_sym(")")?;
        self.expect_sym("{")?;

        let mut case_values = Vec::new();
        let mut case_bodies = Vec::new();
        while !self.check_sym("}") && !self.at_eof() {
            if self.match_keyword("case") {
                let value = self.parse_expr()?;
                self.expect_sym(":")?;
                case_values.push(Some(value));
            } else if self.match_keyword("default") {
                self.expect_sym(":")?;
                case_values.push(None);
            } else {
                return Err(self.error("Expected 'case' or 'default' in switch body"));
            }
            let mut body = Vec::new();
            while !self.check_keyword("case")
                && !self.check_keyword("default")
                && !self.check_sym("}")
                && !self.at_eof()
            {
                body.push(self.parse_stmt()?);
            }
            case_bodies.push(body);
        }
        self.expect_sym("}")?;
        Ok(Stmt::Switch { scrutinee, case_values, case_bodies, line })
    }

    fn parse_try(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        let try_block = self.parse_block()?;

        let mut catch_param = None;
        let catch_block = if self.match_keyword("catch") {
            if self.match_sym("(") {
                catch_param = Some(self.expect_identifier()?);
                self.expect_sym(")")?;
            }
            Some(self.parse_block()?)
        } else {
            None
        };

        let finally_block =
            if self.match_keyword("finally") { Some(self.parse_block()?) } else { None };

        if catch_block.is_none() && finally_block.is_none() {
            return Err(self.error("try requires a catch or finally block"));
        }
        Ok(Stmt::Try { try_block, catch_param, catch_block, finally_block, line })
    }

    fn parse_enum(&mut self) -> Result<Stmt, HemlockError> {
        let line = self.line();
        self.advance();
        let name = self.expect_identifier()?;
        self.expect_sym("{")?;
        let mut variants = Vec::new();
        while !self.check_sym("}") && !self.at_eof() {
            let variant = self.expect_identifier()?;
            let value = if self.match_sym("=") { Some(self.parse_expr()?) } else { None };
            variants.push((variant, value));
            if !self.match_sym(",") {
                break;
            }
        }
        self.expect_sym("}")?;
        self.end_stmt();
        Ok(Stmt::Enum { name, variants, line })
    }

    // ----- expressions -----

    pub fn parse_expr(&mut self) -> Result<Expr, HemlockError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, HemlockError> {
        let expr = self.parse_ternary()?;
        let line = self.line();

        if self.match_sym("=") {
            let value = Box::new(self.parse_assignment()?);
            return self.build_assignment(expr, value, line);
        }

        for (sym, op) in
            [("+=", BinaryOp::Add), ("-=", BinaryOp::Sub), ("*=", BinaryOp::Mul), ("/=", BinaryOp::Div), ("%=", BinaryOp::Mod)]
        {
            if self.check_sym(sym) {
                self.advance();
                let rhs = self.parse_assignment()?;
                let value = Box::new(Expr::Binary {
                    op,
                    left: Box::new(expr.clone()),
                    right: Box::new(rhs),
                    line,
                });
                return self.build_assignment(expr, value, line);
            }
        }

        Ok(expr)
    }

    fn build_assignment(
        &self,
        target: Expr,
        value: Box<Expr>,
        line: u32,
    ) -> Result<Expr, HemlockError> {
        match target {
            Expr::Identifier { name, resolved, .. } => {
                Ok(Expr::Assign { name, value, resolved, line })
            }
            Expr::Index { object, index, .. } => {
                Ok(Expr::IndexAssign { object, index, value, line })
            }
            Expr::GetProperty { object, property, .. } => {
                Ok(Expr::SetProperty { object, property, value, line })
            }
            _ => Err(self.error("Invalid assignment target")),
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr, HemlockError> {
        let cond = self.parse_coalesce()?;
        if self.check_sym("?") {
            let line = self.line();
            self.advance();
            let then_expr = Box::new(self.parse_expr()?);
            self.expect_sym(":")?;
            let else_expr = Box::new(self.parse_expr()?);
            return Ok(Expr::Ternary { cond: Box::new(cond), then_expr, else_expr, line });
        }
        Ok(cond)
    }

    fn parse_coalesce(&mut self) -> Result<Expr, HemlockError> {
        let mut left = self.parse_or()?;
        while self.check_sym("??") {
            let line = self.line();
            self.advance();
            let right = self.parse_or()?;
            left = Expr::NullCoalesce { left: Box::new(left), right: Box::new(right), line };
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, HemlockError>,
    ) -> Result<Expr, HemlockError> {
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in ops {
                if self.check_sym(sym) {
                    let line = self.line();
                    self.advance();
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                        line,
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::parse_bit_or)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("|", BinaryOp::BitOr)], Self::parse_bit_xor)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("^", BinaryOp::BitXor)], Self::parse_bit_and)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("&", BinaryOp::BitAnd)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(
            &[("<=", BinaryOp::Le), (">=", BinaryOp::Ge), ("<", BinaryOp::Lt), (">", BinaryOp::Gt)],
            Self::parse_shift,
        )
    }

    fn parse_shift(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("<<", BinaryOp::Shl), (">>", BinaryOp::Shr)], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::parse_factor)
    }

    fn parse_factor(&mut self) -> Result<Expr, HemlockError> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Mod)],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, HemlockError> {
        let line = self.line();
        if self.match_sym("!") {
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Unary { op: UnaryOp::Not, operand, line });
        }
        if self.match_sym("-") {
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Unary { op: UnaryOp::Negate, operand, line });
        }
        if self.match_sym("~") {
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Unary { op: UnaryOp::BitNot, operand, line });
        }
        if self.match_keyword("typeof") {
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Unary { op: UnaryOp::Typeof, operand, line });
        }
        if self.match_keyword("await") {
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Await { operand, line });
        }
        if self.match_sym("++") {
            let target = Box::new(self.parse_unary()?);
            self.check_inc_target(&target)?;
            return Ok(Expr::PrefixInc { target, line });
        }
        if self.match_sym("--") {
            let target = Box::new(self.parse_unary()?);
            self.check_inc_target(&target)?;
            return Ok(Expr::PrefixDec { target, line });
        }
        self.parse_postfix()
    }

    fn check_inc_target(&self, target: &Expr) -> Result<(), HemlockError> {
        match target {
            Expr::Identifier { .. } | Expr::Index { .. } | Expr::GetProperty { .. } => Ok(()),
            _ => Err(self.error("Invalid increment/decrement operand")),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, HemlockError> {
        let mut args = Vec::new();
        if !self.check_sym(")") {
            loop {
                args.push(self.parse_expr()?);
                if !self.match_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym(")")?;
        Ok(args)
    }

    fn parse_postfix(&mut self) -> Result<Expr, HemlockError> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            if self.match_sym("(") {
                let args = self.parse_call_args()?;
                expr = Expr::Call { func: Box::new(expr), args, line };
            } else if self.match_sym("[") {
                let index = Box::new(self.parse_expr()?);
                self.expect_sym("]")?;
                expr = Expr::Index { object: Box::new(expr), index, line };
            } else if self.match_sym(".") {
                let property = self.expect_identifier()?;
                expr = Expr::GetProperty { object: Box::new(expr), property, line };
            } else if self.match_sym("?.") {
                expr = self.parse_optional_chain(expr, line)?;
            } else if self.match_sym("++") {
                self.check_inc_target(&expr)?;
                expr = Expr::PostfixInc { target: Box::new(expr), line };
            } else if self.match_sym("--") {
                self.check_inc_target(&expr)?;
                expr = Expr::PostfixDec { target: Box::new(expr), line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_optional_chain(&mut self, object: Expr, line: u32) -> Result<Expr, HemlockError> {
        if self.match_sym("[") {
            let index = Box::new(self.parse_expr()?);
            self.expect_sym("]")?;
            return Ok(Expr::OptionalChain {
                object: Box::new(object),
                property: None,
                index: Some(index),
                is_call: false,
                args: Vec::new(),
                line,
            });
        }
        if self.match_sym("(") {
            let args = self.parse_call_args()?;
            return Ok(Expr::OptionalChain {
                object: Box::new(object),
                property: None,
                index: None,
                is_call: true,
                args,
                line,
            });
        }
        let property = self.expect_identifier()?;
        if self.match_sym("(") {
            let args = self.parse_call_args()?;
            return Ok(Expr::OptionalChain {
                object: Box::new(object),
                property: Some(property),
                index: None,
                is_call: true,
                args,
                line,
            });
        }
        Ok(Expr::OptionalChain {
            object: Box::new(object),
            property: Some(property),
            index: None,
            is_call: false,
            args: Vec::new(),
            line,
        })
    }

    fn parse_function(&mut self, is_async: bool) -> Result<Expr, HemlockError> {
        let line = self.line();
        self.expect_keyword("fn")?;
        let name = match self.kind().clone() {
            TokenKind::Identifier(n) => {
                self.advance();
                Some(n)
            }
            _ => None,
        };
        self.expect_sym("(")?;
        let mut params = Vec::new();
        let mut rest_param = None;
        while !self.check_sym(")") {
            if self.match_sym("...") {
                rest_param = Some(self.expect_identifier()?);
                break;
            }
            let param_name = self.expect_identifier()?;
            let type_name = self.parse_type_annotation()?;
            let default = if self.match_sym("=") { Some(self.parse_expr()?) } else { None };
            params.push(Param { name: param_name, type_name, default });
            if !self.match_sym(",") {
                break;
            }
        }
        self.expect_sym(")")?;
        // Return-type annotations are accepted and discarded; types never
        // reject a program.
        if self.match_sym("->") {
            self.expect_identifier()?;
        }
        let body = self.parse_block()?;
        Ok(Expr::Function { name, params, rest_param, body, is_async, line })
    }

    fn parse_interp(
        &mut self,
        string_parts: Vec<String>,
        expr_sources: Vec<String>,
        line: u32,
    ) -> Result<Expr, HemlockError> {
        let mut expr_parts = Vec::new();
        for source in &expr_sources {
            let tokens = tokenize(source)
                .map_err(|e| HemlockError::parse(e.message, line, e.column))?;
            let mut sub = Parser::new(tokens);
            let expr = sub.parse_expr()?;
            if !sub.at_eof() {
                return Err(HemlockError::parse(
                    "Unexpected trailing tokens in interpolation",
                    line,
                    0,
                ));
            }
            expr_parts.push(expr);
        }
        Ok(Expr::StringInterp { string_parts, expr_parts, line })
    }

    fn parse_primary(&mut self) -> Result<Expr, HemlockError> {
        let line = self.line();
        match self.kind().clone() {
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int { value, line })
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::Float { value, line })
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str { value, line })
            }
            TokenKind::InterpStr { string_parts, expr_sources } => {
                self.advance();
                self.parse_interp(string_parts, expr_sources, line)
            }
            TokenKind::Rune(value) => {
                self.advance();
                Ok(Expr::Rune { value, line })
            }
            TokenKind::Keyword(kw) => match kw.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Bool { value: true, line })
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Bool { value: false, line })
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null { line })
                }
                "self" => {
                    self.advance();
                    Ok(Expr::SelfExpr { line })
                }
                "fn" => self.parse_function(false),
                "async" => {
                    self.advance();
                    self.parse_function(true)
                }
                _ => Err(self.error(format!("Unexpected keyword '{}'", kw))),
            },
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Identifier { name, resolved: None, line })
            }
            TokenKind::Sym(sym) => match sym.as_str() {
                "(" => {
                    self.advance();
                    let expr = self.parse_expr()?;
                    self.expect_sym(")")?;
                    Ok(expr)
                }
                "[" => {
                    self.advance();
                    let mut elements = Vec::new();
                    while !self.check_sym("]") {
                        elements.push(self.parse_expr()?);
                        if !self.match_sym(",") {
                            break;
                        }
                    }
                    self.expect_sym("]")?;
                    Ok(Expr::ArrayLiteral { elements, line })
                }
                "{" => {
                    self.advance();
                    let mut field_names = Vec::new();
                    let mut field_values = Vec::new();
                    while !self.check_sym("}") {
                        let name = match self.kind().clone() {
                            TokenKind::Identifier(n) => {
                                self.advance();
                                n
                            }
                            TokenKind::Str(s) => {
                                self.advance();
                                s
                            }
                            _ => return Err(self.error("Expected field name in object literal")),
                        };
                        self.expect_sym(":")?;
                        field_values.push(self.parse_expr()?);
                        field_names.push(name);
                        if !self.match_sym(",") {
                            break;
                        }
                    }
                    self.expect_sym("}")?;
                    Ok(Expr::ObjectLiteral { field_names, field_values, line })
                }
                _ => Err(self.error(format!("Unexpected token '{}'", sym))),
            },
            TokenKind::Eof => Err(self.error("Unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        parse_program(source).unwrap()
    }

    #[test]
    fn for_in_with_key_and_value() {
        let stmts = parse("for (k, v in obj) { k; }");
        match &stmts[0] {
            Stmt::ForIn { key_var, value_var, .. } => {
                assert_eq!(key_var.as_deref(), Some("k"));
                assert_eq!(value_var, "v");
            }
            other => panic!("expected for-in, got {:?}", other),
        }
    }

    #[test]
    fn c_style_for_keeps_three_clauses() {
        let stmts = parse("for (let i = 0; i < 10; i++) { i; }");
        match &stmts[0] {
            Stmt::For { init, condition, increment, .. } => {
                assert!(init.is_some());
                assert!(condition.is_some());
                assert!(increment.is_some());
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn switch_collects_cases_and_default() {
        let stmts = parse("switch (x) { case 1: a; break; case 2: b; default: c; }");
        match &stmts[0] {
            Stmt::Switch { case_values, case_bodies, .. } => {
                assert_eq!(case_values.len(), 3);
                assert!(case_values[0].is_some());
                assert!(case_values[2].is_none());
                assert_eq!(case_bodies.len(), 3);
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn compound_assignment_desugars_to_binary() {
        let stmts = parse("x += 2;");
        match &stmts[0] {
            Stmt::Expr { expr: Expr::Assign { value, .. }, .. } => {
                assert!(matches!(**value, Expr::Binary { op: BinaryOp::Add, .. }));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn optional_chain_method_call() {
        let stmts = parse("a?.m(1, 2);");
        match &stmts[0] {
            Stmt::Expr { expr: Expr::OptionalChain { property, is_call, args, .. }, .. } => {
                assert_eq!(property.as_deref(), Some("m"));
                assert!(is_call);
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected optional chain, got {:?}", other),
        }
    }

    #[test]
    fn function_params_with_defaults_and_rest() {
        let stmts = parse("let f = fn(a, b: i32 = 5, ...rest) { return a; };");
        match &stmts[0] {
            Stmt::Let { initializer: Some(Expr::Function { params, rest_param, .. }), .. } => {
                assert_eq!(params.len(), 2);
                assert!(params[1].default.is_some());
                assert_eq!(params[1].type_name.as_deref(), Some("i32"));
                assert_eq!(rest_param.as_deref(), Some("rest"));
            }
            other => panic!("expected function let, got {:?}", other),
        }
    }

    #[test]
    fn interpolated_string_parses_embedded_exprs() {
        let stmts = parse(r#"let s = "n=${n + 1}!";"#);
        match &stmts[0] {
            Stmt::Let { initializer: Some(Expr::StringInterp { string_parts, expr_parts, .. }), .. } => {
                assert_eq!(string_parts.len(), 2);
                assert_eq!(expr_parts.len(), 1);
            }
            other => panic!("expected interp, got {:?}", other),
        }
    }

    #[test]
    fn ternary_and_coalesce_nest() {
        let stmts = parse("let x = a ?? b ? 1 : 2;");
        match &stmts[0] {
            Stmt::Let { initializer: Some(Expr::Ternary { cond, .. }), .. } => {
                assert!(matches!(**cond, Expr::NullCoalesce { .. }));
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn enum_variants_with_explicit_values() {
        let stmts = parse("enum Color { Red, Green = 5, Blue }");
        match &stmts[0] {
            Stmt::Enum { name, variants, .. } => {
                assert_eq!(name, "Color");
                assert_eq!(variants.len(), 3);
                assert!(variants[1].1.is_some());
            }
            other => panic!("expected enum, got {:?}", other),
        }
    }
}
