//! Canonical metric expression → backend SQL.
//!
//! Expressions are parsed once into a [`CanonicalQuery`] and rendered by the
//! dialect of the metric's target server. Rendering only ever emits syntax the
//! parser accepts and maps back to the same AST, so transpiling already
//! transpiled text is a no-op.

pub mod access;
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod tsql;

use crate::models::{ErrorKind, TargetServer};
use ast::{AggregateArg, AggregateFunc, BinaryOp, CanonicalQuery, Expr, Function, TableRef, UnaryOp};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

pub use access::AccessDialect;
pub use tsql::TsqlDialect;

/// Alias every transpiled query gives its single result column.
pub const RESULT_ALIAS: &str = "value";
pub const DEFAULT_SCHEMA: &str = "dbo";

const FRAGMENT_CHARS: usize = 48;

static SIMPLE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranspileError {
    #[error("unsupported expression near `{fragment}`: {reason}")]
    UnsupportedExpression { fragment: String, reason: String },
}

impl TranspileError {
    pub fn unsupported(source: &str, pos: usize, reason: &str) -> Self {
        let fragment: String = source
            .get(pos..)
            .unwrap_or_default()
            .chars()
            .take(FRAGMENT_CHARS)
            .collect();
        Self::UnsupportedExpression {
            fragment: fragment.trim_end().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UnsupportedExpression
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranspileOptions {
    /// Schema applied to unqualified tables on the relational server.
    pub default_schema: String,
}

impl Default for TranspileOptions {
    fn default() -> Self {
        Self {
            default_schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

pub trait SqlDialect: Send + Sync {
    fn aggregate_name(&self, func: AggregateFunc) -> &'static str;

    fn table_clause(&self, table: &TableRef) -> String;

    fn date_literal(&self, raw: &str) -> String;

    fn modulo_operator(&self) -> &'static str;

    /// Renders a normalised function call from already-rendered arguments.
    fn render_call(&self, func: Function, args: &[String]) -> String;

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    /// Dialect-specific grammar restrictions on top of the shared parser.
    fn validate(&self, _query: &CanonicalQuery) -> Result<(), TranspileError> {
        Ok(())
    }

    fn render(&self, query: &CanonicalQuery) -> Result<String, TranspileError> {
        self.validate(query)?;

        let aggregate = &query.aggregate;
        let argument = match &aggregate.argument {
            AggregateArg::Star => "*".to_string(),
            AggregateArg::Expr(expr) => render_expr(self, expr),
        };
        let distinct = if aggregate.distinct { "DISTINCT " } else { "" };

        let mut sql = format!(
            "SELECT {}({}{}) AS {} FROM {}",
            self.aggregate_name(aggregate.func),
            distinct,
            argument,
            RESULT_ALIAS,
            self.table_clause(&query.table)
        );
        if let Some(filter) = &query.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&render_expr(self, filter));
        }
        Ok(sql)
    }
}

pub fn dialect_for(target: TargetServer, options: &TranspileOptions) -> Box<dyn SqlDialect> {
    match target {
        TargetServer::RelationalServer => Box::new(TsqlDialect::new(&options.default_schema)),
        TargetServer::FileDatabase => Box::new(AccessDialect),
    }
}

/// Translates a canonical expression into SQL for `target`.
pub fn transpile(expression: &str, target: TargetServer) -> Result<String, TranspileError> {
    transpile_with(expression, target, &TranspileOptions::default())
}

pub fn transpile_with(
    expression: &str,
    target: TargetServer,
    options: &TranspileOptions,
) -> Result<String, TranspileError> {
    let query = parser::parse(expression)?;
    dialect_for(target, options).render(&query)
}

pub(crate) fn render_identifier<D: SqlDialect + ?Sized>(dialect: &D, name: &str) -> String {
    if SIMPLE_IDENTIFIER.is_match(name) && !parser::is_reserved(name) {
        name.to_string()
    } else {
        dialect.quote_identifier(name)
    }
}

fn render_expr<D: SqlDialect + ?Sized>(dialect: &D, expr: &Expr) -> String {
    match expr {
        Expr::Column(parts) => parts
            .iter()
            .map(|part| render_identifier(dialect, part))
            .collect::<Vec<_>>()
            .join("."),
        Expr::Number(number) => number.clone(),
        Expr::Text(text) => format!("'{}'", text.replace('\'', "''")),
        Expr::Date(raw) => dialect.date_literal(raw),
        Expr::Null => "NULL".to_string(),
        Expr::Call { func, args } => {
            let rendered = args.iter().map(|arg| render_expr(dialect, arg)).collect::<Vec<_>>();
            dialect.render_call(*func, &rendered)
        }
        Expr::Unary { op: UnaryOp::Neg, expr } => {
            let inner = render_expr(dialect, expr);
            // "--" would read back as a comment
            if inner.starts_with('-') {
                format!("-({inner})")
            } else {
                format!("-{inner}")
            }
        }
        Expr::Unary { op: UnaryOp::Not, expr } => format!("NOT {}", render_expr(dialect, expr)),
        Expr::Binary { left, op, right } => format!(
            "{} {} {}",
            render_expr(dialect, left),
            binary_operator(dialect, *op),
            render_expr(dialect, right)
        ),
        Expr::IsNull { expr, negated } => format!(
            "{} IS {}NULL",
            render_expr(dialect, expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => format!(
            "{} {}BETWEEN {} AND {}",
            render_expr(dialect, expr),
            not_prefix(*negated),
            render_expr(dialect, low),
            render_expr(dialect, high)
        ),
        Expr::InList { expr, items, negated } => format!(
            "{} {}IN ({})",
            render_expr(dialect, expr),
            not_prefix(*negated),
            items
                .iter()
                .map(|item| render_expr(dialect, item))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Expr::Like {
            expr,
            pattern,
            negated,
        } => format!(
            "{} {}LIKE {}",
            render_expr(dialect, expr),
            not_prefix(*negated),
            render_expr(dialect, pattern)
        ),
        Expr::Nested(inner) => format!("({})", render_expr(dialect, inner)),
    }
}

fn not_prefix(negated: bool) -> &'static str {
    if negated {
        "NOT "
    } else {
        ""
    }
}

fn binary_operator<D: SqlDialect + ?Sized>(dialect: &D, op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => dialect.modulo_operator(),
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
    }
}
