use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{PredictionQuery, ReserveRequest};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Ulid,
        slot_number: String,
        floor: i32,
        slot_type: SlotType,
    },
    /// `INSERT INTO bookings`. Missing fields are left empty for the engine
    /// to reject, so they surface as validation errors.
    Reserve(ReserveRequest),
    CancelBooking {
        id: Ulid,
    },
    ForceMaintenance {
        slot_id: Ulid,
    },
    SetSlotStatus {
        slot_id: Ulid,
        status: SlotStatus,
        vehicle_number: Option<String>,
    },
    SelectSlots {
        filter: SlotFilter,
    },
    SelectBookings,
    SelectPrediction {
        query: PredictionQuery,
    },
    SelectForecast {
        force_fallback: bool,
    },
    SelectDashboard,
    SelectHourlyAverages,
    SelectFloors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFilter {
    All,
    Id(Ulid),
    Status(SlotStatus),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The row shape a statement returns, decided from its verb and target
/// table alone so it can be answered before parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Slot,
    Booking,
    Prediction,
    Forecast,
    Dashboard,
    HourlyAverage,
    Floor,
}

pub fn row_shape(sql: &str) -> Option<RowShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => match insert_table_name(insert).ok()?.as_str() {
            "bookings" => Some(RowShape::Booking),
            "maintenance" | "slot_status" => Some(RowShape::Slot),
            _ => None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "slots" => Some(RowShape::Slot),
                "bookings" => Some(RowShape::Booking),
                "prediction" => Some(RowShape::Prediction),
                "forecast" => Some(RowShape::Forecast),
                "dashboard" => Some(RowShape::Dashboard),
                "hourly_averages" => Some(RowShape::HourlyAverage),
                "floors" => Some(RowShape::Floor),
                _ => None,
            }
        }
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

const SLOT_COLUMNS: &[&str] = &["id", "slot_number", "floor", "slot_type"];
const BOOKING_COLUMNS: &[&str] = &[
    "user_name",
    "user_phone",
    "vehicle_number",
    "slot_id",
    "duration_hours",
];
const MAINTENANCE_COLUMNS: &[&str] = &["slot_id"];
const SLOT_STATUS_COLUMNS: &[&str] = &["slot_id", "status", "vehicle_number"];

/// One VALUES row keyed by column name. Without a column list the values
/// are taken in the table's declared order.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        declared: &[&'static str],
        required: usize,
    ) -> Result<Self, SqlError> {
        let values = single_values_row(insert)?;
        let columns: Vec<&'static str> = if insert.columns.is_empty() {
            declared.iter().take(values.len()).copied().collect()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    declared
                        .iter()
                        .find(|c| **c == name)
                        .copied()
                        .ok_or(SqlError::UnknownColumn(table, name))
                })
                .collect::<Result<_, _>>()?
        };
        if values.len() != columns.len() || (insert.columns.is_empty() && values.len() < required) {
            return Err(SqlError::WrongArity(
                table,
                columns.len().max(required),
                values.len(),
            ));
        }
        Ok(Self {
            table,
            cells: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "slots" => {
            let row = Row::new(insert, "slots", SLOT_COLUMNS, 3)?;
            let slot_type = match row.get("slot_type") {
                Some(e) => match parse_string_or_null(e)? {
                    Some(s) => SlotType::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad slot_type: {s}")))?,
                    None => SlotType::Regular,
                },
                None => SlotType::Regular,
            };
            Ok(Command::InsertSlot {
                id: parse_ulid(row.require("id")?)?,
                slot_number: parse_string(row.require("slot_number")?)?,
                floor: parse_i32(row.require("floor")?)?,
                slot_type,
            })
        }
        "bookings" => {
            let row = Row::new(insert, "bookings", BOOKING_COLUMNS, 4)?;
            let text = |column: &str| -> Result<String, SqlError> {
                Ok(row
                    .get(column)
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default())
            };
            Ok(Command::Reserve(ReserveRequest {
                user_name: text("user_name")?,
                user_phone: text("user_phone")?,
                vehicle_number: text("vehicle_number")?,
                slot_id: row
                    .get("slot_id")
                    .map(parse_ulid_or_null)
                    .transpose()?
                    .flatten(),
                duration_hours: row
                    .get("duration_hours")
                    .map(parse_u32_or_null)
                    .transpose()?
                    .flatten(),
            }))
        }
        "maintenance" => {
            let row = Row::new(insert, "maintenance", MAINTENANCE_COLUMNS, 1)?;
            Ok(Command::ForceMaintenance {
                slot_id: parse_ulid(row.require("slot_id")?)?,
            })
        }
        "slot_status" => {
            let row = Row::new(insert, "slot_status", SLOT_STATUS_COLUMNS, 2)?;
            let status = parse_string(row.require("status")?)?;
            Ok(Command::SetSlotStatus {
                slot_id: parse_ulid(row.require("slot_id")?)?,
                status: SlotStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("bad status: {status}")))?,
                vehicle_number: row
                    .get("vehicle_number")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => {
            let filter = match filters.as_slice() {
                [] => SlotFilter::All,
                [(col, value)] if col == "id" => SlotFilter::Id(parse_ulid(value)?),
                [(col, value)] if col == "status" => {
                    let s = parse_string(value)?;
                    SlotFilter::Status(
                        SlotStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                    )
                }
                _ => {
                    return Err(SqlError::Unsupported(
                        "slots can be filtered by id or status only".into(),
                    ));
                }
            };
            Ok(Command::SelectSlots { filter })
        }
        "prediction" => {
            let mut query = PredictionQuery::default();
            for (col, value) in &filters {
                match col.as_str() {
                    "hour" => query.hour = Some(parse_u8(value)?),
                    "day" => query.day = Some(parse_u8(value)?),
                    "fallback" => query.force_fallback = parse_bool(value)?,
                    other => return Err(SqlError::UnknownColumn("prediction", other.into())),
                }
            }
            Ok(Command::SelectPrediction { query })
        }
        "forecast" => {
            let mut force_fallback = false;
            for (col, value) in &filters {
                match col.as_str() {
                    "fallback" => force_fallback = parse_bool(value)?,
                    other => return Err(SqlError::UnknownColumn("forecast", other.into())),
                }
            }
            Ok(Command::SelectForecast { force_fallback })
        }
        "bookings" | "dashboard" | "hourly_averages" | "floors" if !filters.is_empty() => Err(
            SqlError::Unsupported(format!("{table} does not take a WHERE clause")),
        ),
        "bookings" => Ok(Command::SelectBookings),
        "dashboard" => Ok(Command::SelectDashboard),
        "hourly_averages" => Ok(Command::SelectHourlyAverages),
        "floors" => Ok(Command::SelectFloors),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters)?;
    match filters.as_slice() {
        [(col, value)] if col == "id" => parse_ulid(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// Integers arrive as bare numbers, or as quoted text when they come from
/// bound parameters.
fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
