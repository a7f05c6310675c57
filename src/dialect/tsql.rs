use super::ast::{AggregateFunc, DateUnit, Function, TableRef};
use super::SqlDialect;

/// T-SQL for the relational server. Every table is schema-qualified and read
/// with `WITH (NOLOCK)`.
#[derive(Debug, Clone)]
pub struct TsqlDialect {
    default_schema: String,
}

impl TsqlDialect {
    pub fn new(default_schema: &str) -> Self {
        Self {
            default_schema: default_schema.to_string(),
        }
    }
}

impl SqlDialect for TsqlDialect {
    fn aggregate_name(&self, func: AggregateFunc) -> &'static str {
        match func {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }

    fn table_clause(&self, table: &TableRef) -> String {
        let schema = table.schema.as_deref().unwrap_or(&self.default_schema);
        format!(
            "{}.{} WITH (NOLOCK)",
            self.quote_identifier(schema),
            self.quote_identifier(&table.name)
        )
    }

    fn date_literal(&self, raw: &str) -> String {
        format!("'{}'", raw.replace('\'', "''"))
    }

    fn modulo_operator(&self) -> &'static str {
        "%"
    }

    fn render_call(&self, func: Function, args: &[String]) -> String {
        match func {
            Function::Now => "GETDATE()".to_string(),
            Function::DateAdd(unit) => format!("DATEADD({}, {})", datepart(unit), args.join(", ")),
            Function::DateDiff(unit) => format!("DATEDIFF({}, {})", datepart(unit), args.join(", ")),
            Function::Month => format!("MONTH({})", args.join(", ")),
            Function::Year => format!("YEAR({})", args.join(", ")),
            Function::Coalesce => format!("ISNULL({})", args.join(", ")),
            Function::Iif => format!("IIF({})", args.join(", ")),
            Function::Abs => format!("ABS({})", args.join(", ")),
            Function::Round => match args {
                [value] => format!("ROUND({value}, 0)"),
                _ => format!("ROUND({})", args.join(", ")),
            },
        }
    }
}

fn datepart(unit: DateUnit) -> &'static str {
    match unit {
        DateUnit::Day => "day",
        DateUnit::Week => "week",
        DateUnit::Month => "month",
        DateUnit::Quarter => "quarter",
        DateUnit::Year => "year",
    }
}
