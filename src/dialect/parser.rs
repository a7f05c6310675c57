use super::ast::{
    Aggregate, AggregateArg, AggregateFunc, BinaryOp, CanonicalQuery, DateUnit, Expr, Function, TableRef, UnaryOp,
};
use super::lexer::{tokenize, Spanned, Token};
use super::TranspileError;

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "IS", "NULL", "BETWEEN", "IN", "LIKE", "AS", "WITH",
    "DISTINCT", "JOIN", "INNER", "OUTER", "LEFT", "RIGHT", "FULL", "CROSS", "ON", "GROUP", "ORDER", "BY",
    "HAVING", "UNION", "TOP", "INTO", "CASE", "WHEN", "THEN", "ELSE", "END", "EXISTS", "ALL", "ANY", "MOD",
    "CURRENT_TIMESTAMP",
];

const LOCK_HINTS: &[&str] = &["NOLOCK", "READUNCOMMITTED"];

pub fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|reserved| reserved.eq_ignore_ascii_case(word))
}

fn is_lock_hint(word: &str) -> bool {
    LOCK_HINTS.iter().any(|hint| hint.eq_ignore_ascii_case(word))
}

pub fn parse(source: &str) -> Result<CanonicalQuery, TranspileError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(TranspileError::unsupported(source, 0, "expression is empty"));
    }
    let mut parser = Parser {
        source,
        tokens,
        index: 0,
    };
    parser.query()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    index: usize,
}

impl<'a> Parser<'a> {
    fn query(&mut self) -> Result<CanonicalQuery, TranspileError> {
        self.eat_word("SELECT");
        if self.peek_word("TOP") {
            return Err(self.reject("TOP is not supported"));
        }

        let aggregate = self.aggregate()?;
        self.alias()?;
        if self.peek() == Some(&Token::Comma) {
            return Err(self.reject("only one select item is supported"));
        }
        if !self.eat_word("FROM") {
            return Err(self.reject("expected FROM"));
        }

        let table = self.table()?;
        self.lock_hints()?;

        let filter = if self.eat_word("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };

        if self.peek().is_some() {
            let reason = match self.peek() {
                Some(Token::Comma) => "only one table is supported",
                Some(token) if token.is_word("JOIN") || token.is_word("INNER") || token.is_word("LEFT")
                    || token.is_word("RIGHT") || token.is_word("FULL") || token.is_word("CROSS") => "joins are not supported",
                Some(token) if token.is_word("GROUP") || token.is_word("ORDER") || token.is_word("HAVING")
                    || token.is_word("UNION") => "only a single ungrouped aggregate is supported",
                _ => "unexpected trailing input",
            };
            return Err(self.reject(reason));
        }

        Ok(CanonicalQuery {
            aggregate,
            table,
            filter,
        })
    }

    fn aggregate(&mut self) -> Result<Aggregate, TranspileError> {
        let func = match self.peek() {
            Some(Token::Word(word)) => AggregateFunc::parse(word),
            _ => None,
        };
        let Some(func) = func else {
            return Err(self.reject("expected an aggregate function (COUNT, SUM, AVG, MIN, MAX)"));
        };
        self.advance();
        self.expect(Token::LParen, "expected ( after aggregate")?;

        let distinct = self.eat_word("DISTINCT");
        let argument = if self.peek() == Some(&Token::Star) {
            if func != AggregateFunc::Count || distinct {
                return Err(self.reject("* is only valid in COUNT(*)"));
            }
            self.advance();
            AggregateArg::Star
        } else {
            AggregateArg::Expr(self.expr()?)
        };
        self.expect(Token::RParen, "expected ) after aggregate argument")?;

        Ok(Aggregate {
            func,
            distinct,
            argument,
        })
    }

    /// Any alias is accepted and discarded; output is always aliased `value`.
    fn alias(&mut self) -> Result<(), TranspileError> {
        if self.eat_word("AS") {
            return match self.advance_token() {
                Some(Token::Word(word)) if !is_reserved(&word) => Ok(()),
                Some(Token::QuotedIdent(_)) | Some(Token::Text(_)) => Ok(()),
                _ => Err(self.reject_previous("expected alias after AS")),
            };
        }
        match self.peek() {
            Some(Token::QuotedIdent(_)) => {
                self.advance();
            }
            Some(Token::Word(word)) if !is_reserved(word) => {
                self.advance();
            }
            _ => {}
        }
        Ok(())
    }

    fn table(&mut self) -> Result<TableRef, TranspileError> {
        let mut parts = vec![self.identifier("expected table name")?];
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            parts.push(self.identifier("expected identifier after .")?);
        }
        // `t (NOLOCK)` is the legacy hint spelling; anything else in parens is a call.
        if self.peek() == Some(&Token::LParen) && !matches!(self.peek_at(1), Some(Token::Word(word)) if is_lock_hint(word)) {
            return Err(self.reject("table-valued functions are not supported"));
        }

        let mut parts = parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(TableRef { schema: None, name }),
            (Some(schema), Some(name), None) => Ok(TableRef {
                schema: Some(schema),
                name,
            }),
            _ => Err(self.reject_previous("three-part table names are not supported")),
        }
    }

    fn lock_hints(&mut self) -> Result<(), TranspileError> {
        let with = self.peek_word("WITH");
        if with {
            self.advance();
        }
        let legacy = !with && self.peek() == Some(&Token::LParen);
        if !with && !legacy {
            return Ok(());
        }
        self.expect(Token::LParen, "expected ( after WITH")?;
        loop {
            match self.peek() {
                Some(Token::Word(word)) if is_lock_hint(word) => {
                    self.advance();
                }
                _ => return Err(self.reject("only NOLOCK / READUNCOMMITTED table hints are supported")),
            }
            if self.peek() == Some(&Token::Comma) {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(Token::RParen, "expected ) after table hints")
    }

    // ─── Expressions ────────────────────────────────────────────────────────

    fn expr(&mut self) -> Result<Expr, TranspileError> {
        let mut left = self.and_expr()?;
        while self.eat_word("OR") {
            let right = self.and_expr()?;
            left = binary(left, BinaryOp::Or, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, TranspileError> {
        let mut left = self.not_expr()?;
        while self.eat_word("AND") {
            let right = self.not_expr()?;
            left = binary(left, BinaryOp::And, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, TranspileError> {
        if self.eat_word("NOT") {
            let expr = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, TranspileError> {
        let left = self.additive()?;

        let comparison = match self.peek() {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Ne) => Some(BinaryOp::Ne),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::Le) => Some(BinaryOp::Le),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = comparison {
            self.advance();
            let right = self.additive()?;
            return Ok(binary(left, op, right));
        }

        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            if !self.eat_word("NULL") {
                return Err(self.reject("expected NULL after IS"));
            }
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.peek_word("NOT")
            && matches!(self.peek_at(1), Some(token) if token.is_word("BETWEEN") || token.is_word("IN") || token.is_word("LIKE"));
        if negated {
            self.advance();
        }

        if self.eat_word("BETWEEN") {
            let low = self.additive()?;
            if !self.eat_word("AND") {
                return Err(self.reject("expected AND in BETWEEN"));
            }
            let high = self.additive()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }

        if self.eat_word("IN") {
            self.expect(Token::LParen, "expected ( after IN")?;
            if self.peek_word("SELECT") {
                return Err(self.reject("subqueries are not supported"));
            }
            let items = self.expr_list()?;
            self.expect(Token::RParen, "expected ) after IN list")?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                items,
                negated,
            });
        }

        if self.eat_word("LIKE") {
            let pattern = self.additive()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
            });
        }

        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, TranspileError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, TranspileError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                Some(token) if token.is_word("MOD") => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, TranspileError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let expr = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                })
            }
            Some(Token::Plus) => {
                self.advance();
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, TranspileError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.reject("unexpected end of expression"));
        };

        match token {
            Token::Number(number) => {
                self.advance();
                Ok(Expr::Number(number))
            }
            Token::Text(text) => {
                self.advance();
                Ok(Expr::Text(text))
            }
            Token::Date(date) => {
                self.advance();
                Ok(Expr::Date(date))
            }
            Token::LParen => {
                self.advance();
                if self.peek_word("SELECT") {
                    return Err(self.reject("subqueries are not supported"));
                }
                let inner = self.expr()?;
                self.expect(Token::RParen, "expected )")?;
                Ok(Expr::Nested(Box::new(inner)))
            }
            Token::QuotedIdent(_) => self.column(),
            Token::Word(word) => {
                if word.eq_ignore_ascii_case("NULL") {
                    self.advance();
                    return Ok(Expr::Null);
                }
                if word.eq_ignore_ascii_case("CURRENT_TIMESTAMP") {
                    self.advance();
                    return Ok(Expr::Call {
                        func: Function::Now,
                        args: Vec::new(),
                    });
                }
                if self.peek_at(1) == Some(&Token::LParen) {
                    return self.call(&word);
                }
                if is_reserved(&word) {
                    let reason = if word.eq_ignore_ascii_case("CASE") {
                        "CASE expressions are not supported"
                    } else {
                        "unexpected keyword"
                    };
                    return Err(self.reject(reason));
                }
                self.column()
            }
            _ => Err(self.reject("unexpected token")),
        }
    }

    fn column(&mut self) -> Result<Expr, TranspileError> {
        let mut parts = vec![self.identifier("expected column name")?];
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            parts.push(self.identifier("expected identifier after .")?);
        }
        if parts.len() > 2 {
            return Err(self.reject_previous("column references may have at most two parts"));
        }
        Ok(Expr::Column(parts))
    }

    fn call(&mut self, name: &str) -> Result<Expr, TranspileError> {
        let name_index = self.index;
        self.advance();
        self.expect(Token::LParen, "expected (")?;
        let args = if self.peek() == Some(&Token::RParen) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.expect(Token::RParen, "expected ) after function arguments")?;

        let reject = |parser: &Self, reason: &str| parser.reject_at(name_index, reason);
        let upper = name.to_ascii_uppercase();
        let arity = args.len();

        let expr = match (upper.as_str(), arity) {
            ("GETDATE" | "NOW" | "DATE", 0) => call(Function::Now, args),
            ("DATEADD" | "DATEDIFF", 3) => {
                let mut args = args.into_iter();
                let unit = args.next().and_then(|unit| date_unit(&unit));
                let Some(unit) = unit else {
                    return Err(reject(self, "unsupported date interval"));
                };
                let func = if upper == "DATEADD" {
                    Function::DateAdd(unit)
                } else {
                    Function::DateDiff(unit)
                };
                call(func, args.collect())
            }
            ("DATEPART", 2) => {
                let mut args = args.into_iter();
                let func = match args.next().and_then(|unit| date_unit(&unit)) {
                    Some(DateUnit::Month) => Function::Month,
                    Some(DateUnit::Year) => Function::Year,
                    _ => return Err(reject(self, "only month and year date parts are supported")),
                };
                call(func, args.collect())
            }
            ("MONTH", 1) => call(Function::Month, args),
            ("YEAR", 1) => call(Function::Year, args),
            // Kept parenthesised so it stays a single operand wherever it lands.
            ("ISNULL", 1) => {
                let mut args = args;
                Expr::Nested(Box::new(Expr::IsNull {
                    expr: Box::new(args.remove(0)),
                    negated: false,
                }))
            }
            ("ISNULL" | "NZ", 2) => call(Function::Coalesce, args),
            ("NZ", 1) => {
                let mut args = args;
                args.push(Expr::Number("0".to_string()));
                call(Function::Coalesce, args)
            }
            ("COALESCE", n) if n >= 2 => fold_coalesce(args),
            ("IIF", 3) => iif(args),
            ("ABS", 1) => call(Function::Abs, args),
            ("ROUND", 1 | 2) => call(Function::Round, args),
            (_, _) if AggregateFunc::parse(name).is_some() => {
                return Err(reject(self, "nested aggregates are not supported"));
            }
            _ => return Err(reject(self, "unsupported function or argument count")),
        };
        Ok(expr)
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, TranspileError> {
        let mut items = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.advance();
            items.push(self.expr()?);
        }
        Ok(items)
    }

    // ─── Token helpers ──────────────────────────────────────────────────────

    fn identifier(&mut self, reason: &str) -> Result<String, TranspileError> {
        match self.peek().cloned() {
            Some(Token::QuotedIdent(name)) => {
                self.advance();
                Ok(name)
            }
            Some(Token::Word(word)) if !is_reserved(&word) => {
                self.advance();
                Ok(word)
            }
            _ => Err(self.reject(reason)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|spanned| &spanned.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.index + offset).map(|spanned| &spanned.token)
    }

    fn peek_word(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|token| token.is_word(keyword))
    }

    fn eat_word(&mut self, keyword: &str) -> bool {
        if self.peek_word(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        self.index += 1;
    }

    fn advance_token(&mut self) -> Option<Token> {
        let token = self.peek().cloned();
        self.advance();
        token
    }

    fn expect(&mut self, expected: Token, reason: &str) -> Result<(), TranspileError> {
        if self.peek() == Some(&expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.reject(reason))
        }
    }

    fn reject(&self, reason: &str) -> TranspileError {
        self.reject_at(self.index, reason)
    }

    fn reject_previous(&self, reason: &str) -> TranspileError {
        self.reject_at(self.index.saturating_sub(1), reason)
    }

    fn reject_at(&self, index: usize, reason: &str) -> TranspileError {
        let pos = self
            .tokens
            .get(index)
            .map(|spanned| spanned.pos)
            .unwrap_or(self.source.len());
        TranspileError::unsupported(self.source, pos, reason)
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn call(func: Function, args: Vec<Expr>) -> Expr {
    Expr::Call { func, args }
}

fn date_unit(expr: &Expr) -> Option<DateUnit> {
    match expr {
        Expr::Column(parts) if parts.len() == 1 => DateUnit::parse(&parts[0]),
        Expr::Text(text) => DateUnit::parse(text),
        _ => None,
    }
}

/// `COALESCE(a, b, c)` nests right: `Coalesce(a, Coalesce(b, c))`.
fn fold_coalesce(mut args: Vec<Expr>) -> Expr {
    let mut acc = args.pop().unwrap_or(Expr::Null);
    while let Some(previous) = args.pop() {
        acc = call(Function::Coalesce, vec![previous, acc]);
    }
    acc
}

/// `IIf(IsNull(a), b, a)` is the Access spelling of coalesce.
fn iif(args: Vec<Expr>) -> Expr {
    if let [test, fallback, value] = args.as_slice() {
        let test = match test {
            Expr::Nested(inner) => inner.as_ref(),
            other => other,
        };
        if let Expr::IsNull { expr, negated: false } = test {
            if expr.as_ref() == value {
                return call(Function::Coalesce, vec![value.clone(), fallback.clone()]);
            }
        }
    }
    call(Function::Iif, args)
}
