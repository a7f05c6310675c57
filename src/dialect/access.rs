use super::ast::{AggregateArg, AggregateFunc, CanonicalQuery, DateUnit, Function, TableRef};
use super::{SqlDialect, TranspileError};

/// Access/Jet SQL for the file database. Schemas and lock hints have no
/// meaning there and are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessDialect;

impl SqlDialect for AccessDialect {
    fn aggregate_name(&self, func: AggregateFunc) -> &'static str {
        match func {
            AggregateFunc::Count => "Count",
            AggregateFunc::Sum => "Sum",
            AggregateFunc::Avg => "Avg",
            AggregateFunc::Min => "Min",
            AggregateFunc::Max => "Max",
        }
    }

    fn table_clause(&self, table: &TableRef) -> String {
        self.quote_identifier(&table.name)
    }

    fn date_literal(&self, raw: &str) -> String {
        format!("#{raw}#")
    }

    fn modulo_operator(&self) -> &'static str {
        "Mod"
    }

    fn validate(&self, query: &CanonicalQuery) -> Result<(), TranspileError> {
        if query.aggregate.distinct {
            let argument = match &query.aggregate.argument {
                AggregateArg::Star => "*".to_string(),
                AggregateArg::Expr(expr) => super::render_expr(self, expr),
            };
            return Err(TranspileError::UnsupportedExpression {
                fragment: format!("{}(DISTINCT {})", self.aggregate_name(query.aggregate.func), argument),
                reason: "DISTINCT aggregates are not supported by the file database".to_string(),
            });
        }
        Ok(())
    }

    fn render_call(&self, func: Function, args: &[String]) -> String {
        match func {
            Function::Now => "Date()".to_string(),
            Function::DateAdd(unit) => format!("DateAdd('{}', {})", interval(unit), args.join(", ")),
            Function::DateDiff(unit) => format!("DateDiff('{}', {})", interval(unit), args.join(", ")),
            Function::Month => format!("Month({})", args.join(", ")),
            Function::Year => format!("Year({})", args.join(", ")),
            Function::Coalesce => match args {
                [value, fallback] => format!("IIf(IsNull({value}), {fallback}, {value})"),
                _ => format!("Nz({})", args.join(", ")),
            },
            Function::Iif => format!("IIf({})", args.join(", ")),
            Function::Abs => format!("Abs({})", args.join(", ")),
            Function::Round => format!("Round({})", args.join(", ")),
        }
    }
}

fn interval(unit: DateUnit) -> &'static str {
    match unit {
        DateUnit::Day => "d",
        DateUnit::Week => "ww",
        DateUnit::Month => "m",
        DateUnit::Quarter => "q",
        DateUnit::Year => "yyyy",
    }
}
