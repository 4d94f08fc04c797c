use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Money;

/// One `VALUES` row of a booking insert. Dates are kept raw so the caller
/// decides how to report an inverted or empty stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRow {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProperty {
        id: Ulid,
        host_id: Ulid,
        nightly_rate: Money,
        max_guests: u32,
        name: Option<String>,
    },
    UpdateProperty {
        id: Ulid,
        nightly_rate: Money,
        max_guests: u32,
        name: Option<String>,
    },
    DeleteProperty {
        id: Ulid,
    },
    InsertBooking(BookingRow),
    BatchInsertBookings {
        bookings: Vec<BookingRow>,
    },
    /// Hard delete.
    DeleteBooking {
        id: Ulid,
    },
    ConfirmBooking {
        id: Ulid,
    },
    RejectBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    AmendBooking {
        id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectProperties,
    SelectProperty {
        id: Ulid,
    },
    SelectBookings {
        property_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBlockedDates {
        property_id: Ulid,
    },
    SelectDisabledDates {
        property_id: Ulid,
    },
    SelectOverlap {
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectAvailability {
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let first = &rows[0];

    match table.as_str() {
        "properties" => {
            expect_arity("properties", first, 4)?;
            Ok(Command::InsertProperty {
                id: parse_ulid_expr(&first[0])?,
                host_id: parse_ulid_expr(&first[1])?,
                nightly_rate: parse_i64_expr(&first[2])?,
                max_guests: parse_u32_expr(&first[3])?,
                name: first.get(4).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "property_updates" => {
            expect_arity("property_updates", first, 3)?;
            Ok(Command::UpdateProperty {
                id: parse_ulid_expr(&first[0])?,
                nightly_rate: parse_i64_expr(&first[1])?,
                max_guests: parse_u32_expr(&first[2])?,
                name: first.get(3).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            if rows.len() == 1 {
                return Ok(Command::InsertBooking(parse_booking_row(first)?));
            }
            let bookings = rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    parse_booking_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::BatchInsertBookings { bookings })
        }
        "confirmations" => Ok(Command::ConfirmBooking { id: single_booking_id("confirmations", first)? }),
        "rejections" => Ok(Command::RejectBooking { id: single_booking_id("rejections", first)? }),
        "cancellations" => Ok(Command::CancelBooking { id: single_booking_id("cancellations", first)? }),
        "amendments" => {
            expect_arity("amendments", first, 3)?;
            Ok(Command::AmendBooking {
                id: parse_ulid_expr(&first[0])?,
                check_in: parse_date_expr(&first[1])?,
                check_out: parse_date_expr(&first[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_row(row: &[Expr]) -> Result<BookingRow, SqlError> {
    expect_arity("bookings", row, 5)?;
    Ok(BookingRow {
        id: parse_ulid_expr(&row[0])?,
        property_id: parse_ulid_expr(&row[1])?,
        guest_id: parse_ulid_expr(&row[2])?,
        check_in: parse_date_expr(&row[3])?,
        check_out: parse_date_expr(&row[4])?,
        guests: row.get(5).map(parse_u32_expr).transpose()?.unwrap_or(1),
    })
}

fn single_booking_id(table: &'static str, row: &[Expr]) -> Result<Ulid, SqlError> {
    expect_arity(table, row, 1)?;
    parse_ulid_expr(&row[0])
}

fn expect_arity(table: &'static str, row: &[Expr], min: usize) -> Result<(), SqlError> {
    if row.len() < min {
        return Err(SqlError::WrongArity(table, min, row.len()));
    }
    Ok(())
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = filters.ulid("id", BinaryOperator::Eq)?;

    match table.as_str() {
        "properties" => Ok(Command::DeleteProperty { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "properties" if filters.has("id") => Ok(Command::SelectProperty {
            id: filters.ulid("id", BinaryOperator::Eq)?,
        }),
        "properties" => Ok(Command::SelectProperties),
        "bookings" => {
            if filters.has("id") {
                Ok(Command::SelectBooking { id: filters.ulid("id", BinaryOperator::Eq)? })
            } else {
                Ok(Command::SelectBookings {
                    property_id: filters.ulid("property_id", BinaryOperator::Eq)?,
                })
            }
        }
        "blocked_dates" => Ok(Command::SelectBlockedDates {
            property_id: filters.ulid("property_id", BinaryOperator::Eq)?,
        }),
        "disabled_dates" => Ok(Command::SelectDisabledDates {
            property_id: filters.ulid("property_id", BinaryOperator::Eq)?,
        }),
        "overlaps" => Ok(Command::SelectOverlap {
            property_id: filters.ulid("property_id", BinaryOperator::Eq)?,
            check_in: filters.date("check_in", BinaryOperator::Eq)?,
            check_out: filters.date("check_out", BinaryOperator::Eq)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            property_id: filters.ulid("property_id", BinaryOperator::Eq)?,
            check_in: filters.date("check_in", BinaryOperator::GtEq)?,
            check_out: filters.date("check_out", BinaryOperator::LtEq)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `column <op> value` comparisons of a conjunction, flattened.
struct Filters<'a>(Vec<(String, BinaryOperator, &'a Expr)>);

fn collect_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        flatten_conjunction(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn flatten_conjunction<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => flatten_conjunction(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            flatten_conjunction(left, out)?;
            flatten_conjunction(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

impl<'a> Filters<'a> {
    fn has(&self, col: &str) -> bool {
        self.0.iter().any(|(c, _, _)| c == col)
    }

    fn find(&self, col: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
            .ok_or(SqlError::MissingFilter(col))
    }

    fn ulid(&self, col: &'static str, op: BinaryOperator) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.find(col, op)?)
    }

    fn date(&self, col: &'static str, op: BinaryOperator) -> Result<NaiveDate, SqlError> {
        parse_date_expr(self.find(col, op)?)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Result<&Value, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Ok(value),
        _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr)? {
        Value::SingleQuotedString(s) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
    }
}

/// Dates travel as `'YYYY-MM-DD'` strings.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr)? {
        Value::SingleQuotedString(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        other => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {other}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other}"))),
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr)? {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) => Ok(Some(s.clone())),
        other => Err(SqlError::Parse(format!("expected string or NULL, got {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
