/// Recursive-descent parser: tokens -> AST.
use crate::ast::{
    BinOp, Block, Expr, FuncBody, FuncName, Name, Stat, TableField, UnOp, UNARY_PRIORITY,
};
use crate::lexer::{LexError, Lexer};
use crate::token::Token;
use lunac_core::string::StringInterner;
use std::fmt;

/// Parser error.
#[derive(Clone, Debug)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Parse a chunk into its AST, returning the string interner holding every
/// name and string literal.
pub fn parse_chunk(source: &[u8]) -> Result<(Block, StringInterner), ParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(source),
    };
    let block = parser.block()?;
    parser.expect(&Token::Eof)?;
    Ok((block, parser.lexer.strings))
}

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    // ---- Token helpers ----

    fn current_token(&self) -> Result<&Token, ParseError> {
        self.lexer
            .current()
            .map(|st| &st.token)
            .map_err(|e| ParseError {
                message: e.message.clone(),
                line: e.line,
            })
    }

    /// Line of the current (unconsumed) token.
    fn current_line(&self) -> u32 {
        match self.lexer.current() {
            Ok(st) => st.span.line,
            Err(e) => e.line,
        }
    }

    fn check(&self, expected: &Token) -> bool {
        self.current_token().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        Ok(self.lexer.advance()?.token)
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, ParseError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!(
                "'{expected}' expected near '{}'",
                self.lexer.token_text
            )))
        }
    }

    /// Like `expect`, but reports where the opening token was when the
    /// match spans lines (e.g. a missing `end`).
    fn expect_match(
        &mut self,
        expected: &Token,
        opening: &Token,
        opening_line: u32,
    ) -> Result<(), ParseError> {
        if self.test_next(expected)? {
            Ok(())
        } else if opening_line == self.current_line() {
            Err(self.error(format!(
                "'{expected}' expected near '{}'",
                self.lexer.token_text
            )))
        } else {
            Err(self.error(format!(
                "'{expected}' expected (to close '{opening}' at line {opening_line}) near '{}'",
                self.lexer.token_text
            )))
        }
    }

    fn expect_name(&mut self) -> Result<Name, ParseError> {
        let line = self.current_line();
        match self.current_token()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Ok(Name { id, line })
            }
            _ => Err(self.error(format!(
                "<name> expected near '{}'",
                self.lexer.token_text
            ))),
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.current_line(),
        }
    }

    // ---- Blocks and statements ----

    fn block_follow(token: &Token) -> bool {
        matches!(
            token,
            Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof
        )
    }

    fn block(&mut self) -> Result<Block, ParseError> {
        let mut stats = Vec::new();
        loop {
            if Self::block_follow(self.current_token()?) {
                break;
            }
            let is_last = matches!(self.current_token()?, Token::Return | Token::Break);
            if let Some(stat) = self.statement()? {
                stats.push(stat);
            }
            if is_last {
                // return and break must close the block
                break;
            }
        }
        Ok(Block { stats })
    }

    /// Parse one statement; bare semicolons produce none.
    fn statement(&mut self) -> Result<Option<Stat>, ParseError> {
        match self.current_token()?.clone() {
            Token::Semi => {
                self.advance()?;
                Ok(None)
            }
            Token::Local => self.local_statement().map(Some),
            Token::If => self.if_statement().map(Some),
            Token::While => self.while_statement().map(Some),
            Token::Do => {
                let line = self.current_line();
                self.advance()?;
                let body = self.block()?;
                self.expect_match(&Token::End, &Token::Do, line)?;
                Ok(Some(Stat::Do { body }))
            }
            Token::For => self.for_statement().map(Some),
            Token::Repeat => self.repeat_statement().map(Some),
            Token::Function => self.function_statement().map(Some),
            Token::Return => self.return_statement().map(Some),
            Token::Break => {
                let line = self.current_line();
                self.advance()?;
                self.test_next(&Token::Semi)?;
                Ok(Some(Stat::Break { line }))
            }
            _ => self.expr_statement().map(Some),
        }
    }

    /// `local name {, name} ['=' explist]` or `local function name body`.
    fn local_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'local'

        if self.test_next(&Token::Function)? {
            let name = self.expect_name()?;
            let body = self.function_body(false)?;
            return Ok(Stat::LocalFunction { name, body });
        }

        let mut names = vec![self.expect_name()?];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        let exprs = if self.test_next(&Token::Assign)? {
            self.expression_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::Local { names, exprs, line })
    }

    /// `if cond then block {elseif cond then block} [else block] end`.
    fn if_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'if'
        let mut arms = Vec::new();

        let cond = self.expression()?;
        self.expect(&Token::Then)?;
        arms.push((cond, self.block()?));

        while self.test_next(&Token::ElseIf)? {
            let cond = self.expression()?;
            self.expect(&Token::Then)?;
            arms.push((cond, self.block()?));
        }

        let else_body = if self.test_next(&Token::Else)? {
            Some(self.block()?)
        } else {
            None
        };
        self.expect_match(&Token::End, &Token::If, line)?;
        Ok(Stat::If {
            arms,
            else_body,
            line,
        })
    }

    /// `while cond do block end`.
    fn while_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'while'
        let cond = self.expression()?;
        self.expect(&Token::Do)?;
        let body = self.block()?;
        self.expect_match(&Token::End, &Token::While, line)?;
        Ok(Stat::While { cond, body, line })
    }

    /// `repeat block until cond`.
    fn repeat_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'repeat'
        let body = self.block()?;
        self.expect_match(&Token::Until, &Token::Repeat, line)?;
        let cond = self.expression()?;
        Ok(Stat::Repeat { body, cond, line })
    }

    /// `for name '=' e1 ',' e2 [',' e3] do block end`
    /// `for namelist in explist do block end`.
    fn for_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'for'
        let first = self.expect_name()?;

        if self.test_next(&Token::Assign)? {
            let start = self.expression()?;
            self.expect(&Token::Comma)?;
            let limit = self.expression()?;
            let step = if self.test_next(&Token::Comma)? {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(&Token::Do)?;
            let body = self.block()?;
            self.expect_match(&Token::End, &Token::For, line)?;
            Ok(Stat::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
                line,
            })
        } else {
            let mut names = vec![first];
            while self.test_next(&Token::Comma)? {
                names.push(self.expect_name()?);
            }
            self.expect(&Token::In)?;
            let exprs = self.expression_list()?;
            self.expect(&Token::Do)?;
            let body = self.block()?;
            self.expect_match(&Token::End, &Token::For, line)?;
            Ok(Stat::GenericFor {
                names,
                exprs,
                body,
                line,
            })
        }
    }

    /// `function name {'.' name} [':' name] body`.
    fn function_statement(&mut self) -> Result<Stat, ParseError> {
        self.advance()?; // 'function'
        let base = self.expect_name()?;
        let mut fields = Vec::new();
        let mut method = None;
        loop {
            if self.test_next(&Token::Dot)? {
                fields.push(self.expect_name()?);
            } else if self.test_next(&Token::Colon)? {
                method = Some(self.expect_name()?);
                break;
            } else {
                break;
            }
        }
        let body = self.function_body(method.is_some())?;
        Ok(Stat::Function {
            name: FuncName {
                base,
                fields,
                method,
            },
            body,
        })
    }

    /// `( params ) block end` following the `function` keyword.
    fn function_body(&mut self, is_method: bool) -> Result<FuncBody, ParseError> {
        let line = self.lexer.lastline;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                match self.current_token()?.clone() {
                    Token::Name(id) => {
                        let pline = self.current_line();
                        self.advance()?;
                        params.push(Name { id, line: pline });
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        is_vararg = true;
                        break;
                    }
                    _ => {
                        return Err(self.error(format!(
                            "<name> expected near '{}'",
                            self.lexer.token_text
                        )))
                    }
                }
                if !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let body = self.block()?;
        let end_line = self.current_line();
        self.expect_match(&Token::End, &Token::Function, line)?;
        let _ = is_method; // the walker adds the implicit `self` parameter
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
        })
    }

    /// `return [explist] [';']`.
    fn return_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        self.advance()?; // 'return'
        let exprs = if Self::block_follow(self.current_token()?) || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expression_list()?
        };
        self.test_next(&Token::Semi)?;
        Ok(Stat::Return { exprs, line })
    }

    /// Expression statement: either an assignment or a call.
    fn expr_statement(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line();
        let first = self.suffixed_expression()?;

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Token::Comma)? {
                targets.push(self.suffixed_expression()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index { .. }) {
                    return Err(self.error("syntax error: cannot assign to this expression"));
                }
            }
            self.expect(&Token::Assign)?;
            let exprs = self.expression_list()?;
            return Ok(Stat::Assign {
                targets,
                exprs,
                line,
            });
        }

        match first {
            Expr::Call { .. } | Expr::MethodCall { .. } => Ok(Stat::Call { expr: first }),
            _ => Err(self.error(format!(
                "syntax error near '{}'",
                self.lexer.token_text
            ))),
        }
    }

    // ---- Expressions ----

    fn expression_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![self.expression()?];
        while self.test_next(&Token::Comma)? {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    pub(crate) fn expression(&mut self) -> Result<Expr, ParseError> {
        self.sub_expression(0)
    }

    /// Precedence-climbing expression parser.
    fn sub_expression(&mut self, limit: u8) -> Result<Expr, ParseError> {
        let left = if let Some(unop) = self.check_unary_op()? {
            let line = self.current_line();
            self.advance()?;
            let operand = self.sub_expression(UNARY_PRIORITY)?;
            Expr::UnOp {
                op: unop,
                operand: Box::new(operand),
                line,
            }
        } else {
            self.simple_expression()?
        };
        self.sub_expression_with(left, limit)
    }

    /// Continue a partially parsed expression with binary operators.
    fn sub_expression_with(&mut self, mut left: Expr, limit: u8) -> Result<Expr, ParseError> {
        while let Some(binop) = self.check_binary_op()? {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= limit {
                break;
            }
            let line = self.current_line();
            self.advance()?;
            let rhs = self.sub_expression(right_prec)?;
            left = Expr::BinOp {
                op: binop,
                lhs: Box::new(left),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(left)
    }

    fn check_unary_op(&self) -> Result<Option<UnOp>, ParseError> {
        Ok(match self.current_token()? {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        })
    }

    fn check_binary_op(&self) -> Result<Option<BinOp>, ParseError> {
        Ok(match self.current_token()? {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::NotEq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::LtEq),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::GtEq),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        })
    }

    fn simple_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line();
        match self.current_token()?.clone() {
            Token::Number(value) => {
                self.advance()?;
                Ok(Expr::Number { value, line })
            }
            Token::String(id) => {
                self.advance()?;
                Ok(Expr::Str { id, line })
            }
            Token::Nil => {
                self.advance()?;
                Ok(Expr::Nil { line })
            }
            Token::True => {
                self.advance()?;
                Ok(Expr::True { line })
            }
            Token::False => {
                self.advance()?;
                Ok(Expr::False { line })
            }
            Token::DotDotDot => {
                self.advance()?;
                Ok(Expr::Vararg { line })
            }
            Token::LBrace => self.table_constructor(),
            Token::Function => {
                self.advance()?;
                Ok(Expr::Function(Box::new(self.function_body(false)?)))
            }
            _ => self.suffixed_expression(),
        }
    }

    /// Name or parenthesized expression, followed by any chain of
    /// `.field`, `[key]`, `:method(args)`, and call suffixes.
    fn suffixed_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line();
        let mut expr = match self.current_token()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Expr::Name(Name { id, line })
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.expression()?;
                self.expect_match(&Token::RParen, &Token::LParen, line)?;
                Expr::Paren(Box::new(inner))
            }
            other => {
                return Err(self.error(format!("unexpected symbol near '{other}'")));
            }
        };

        loop {
            match self.current_token()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(Expr::Str {
                            id: field.id,
                            line: field.line,
                        }),
                        line: field.line,
                    };
                }
                Token::LBracket => {
                    let bline = self.current_line();
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(key),
                        line: bline,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let cline = self.current_line();
                    let args = self.call_arguments()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                        line: cline,
                    };
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    let cline = self.current_line();
                    let args = self.call_arguments()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line: cline,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// `( explist )`, a table constructor, or a string literal.
    fn call_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let line = self.current_line();
        match self.current_token()?.clone() {
            Token::LParen => {
                if line != self.lexer.lastline {
                    return Err(
                        self.error("ambiguous syntax (function call x new statement)")
                    );
                }
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expression_list()?
                };
                self.expect_match(&Token::RParen, &Token::LParen, line)?;
                Ok(args)
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::String(id) => {
                self.advance()?;
                Ok(vec![Expr::Str { id, line }])
            }
            _ => Err(self.error(format!(
                "function arguments expected near '{}'",
                self.lexer.token_text
            ))),
        }
    }

    /// `{ [field {sep field} [sep]] }` where sep is ',' or ';'.
    fn table_constructor(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line();
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();

        while !self.check(&Token::RBrace) {
            match self.current_token()?.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    let value = self.expression()?;
                    fields.push(TableField::Pair(key, value));
                }
                Token::Name(id) => {
                    let nline = self.current_line();
                    self.advance()?;
                    if self.test_next(&Token::Assign)? {
                        let value = self.expression()?;
                        fields.push(TableField::Pair(
                            Expr::Str { id, line: nline },
                            value,
                        ));
                    } else {
                        // an expression that happens to start with a name
                        let base = Expr::Name(Name { id, line: nline });
                        let suffixed = self.finish_suffixed(base)?;
                        let item = self.sub_expression_with(suffixed, 0)?;
                        fields.push(TableField::Item(item));
                    }
                }
                _ => {
                    fields.push(TableField::Item(self.expression()?));
                }
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }

        self.expect_match(&Token::RBrace, &Token::LBrace, line)?;
        Ok(Expr::Table { fields, line })
    }

    /// Continue the suffix chain of an already-parsed prefix expression.
    fn finish_suffixed(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.current_token()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(Expr::Str {
                            id: field.id,
                            line: field.line,
                        }),
                        line: field.line,
                    };
                }
                Token::LBracket => {
                    let bline = self.current_line();
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(key),
                        line: bline,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let cline = self.current_line();
                    let args = self.call_arguments()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                        line: cline,
                    };
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    let cline = self.current_line();
                    let args = self.call_arguments()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line: cline,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }
}
