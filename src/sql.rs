use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which reservations a `SELECT ... FROM reservations` wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    Space(Ulid),
    User(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        id: Ulid,
        listing: SpaceListing,
    },
    UpdateSpace {
        id: Ulid,
        patch: SpacePatch,
    },
    UpdateUser {
        id: Ulid,
        patch: UserPatch,
    },
    DeleteSpace {
        id: Ulid,
    },
    InsertUser {
        id: Ulid,
        profile: UserProfile,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertReservation(BookingRequest),
    DeleteReservation {
        id: Ulid,
    },
    SelectSpaces {
        id: Option<Ulid>,
        page: Option<usize>,
        per_page: Option<usize>,
    },
    SelectSpaceLocations,
    SelectUsers {
        id: Option<Ulid>,
    },
    SelectReservations(ReservationFilter),
    SelectConflicts {
        space_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
    },
    SelectReport,
    SelectRankings {
        metric: RankingMetric,
    },
}

const SPACE_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "address",
    "latitude",
    "longitude",
    "capacity",
    "price_per_day",
    "image_url",
];
const USER_COLUMNS: &[&str] = &["id", "name", "email", "admin"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "space_id",
    "user_id",
    "start_date",
    "end_date",
    "start_time",
    "end_time",
    "details",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("one statement per query".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = match table.as_str() {
        "spaces" => Row::new(insert, "spaces", SPACE_COLUMNS)?,
        "users" => Row::new(insert, "users", USER_COLUMNS)?,
        "reservations" => Row::new(insert, "reservations", RESERVATION_COLUMNS)?,
        _ => return Err(SqlError::UnknownTable(table)),
    };

    match table.as_str() {
        "spaces" => Ok(Command::InsertSpace {
            id: parse_ulid(row.require("id")?)?,
            listing: SpaceListing {
                title: parse_string(row.require("title")?)?,
                description: row
                    .optional("description", parse_string_or_null)?
                    .unwrap_or_default(),
                address: parse_string(row.require("address")?)?,
                location: Location {
                    latitude: parse_f64(row.require("latitude")?)?,
                    longitude: parse_f64(row.require("longitude")?)?,
                },
                capacity: parse_u32(row.require("capacity")?)?,
                price_per_day: parse_u64(row.require("price_per_day")?)?,
                image_url: row.optional("image_url", parse_string_or_null)?,
            },
        }),
        "users" => Ok(Command::InsertUser {
            id: parse_ulid(row.require("id")?)?,
            profile: UserProfile {
                name: parse_string(row.require("name")?)?,
                email: parse_string(row.require("email")?)?,
                admin: row.optional("admin", parse_bool_or_null)?.unwrap_or(false),
            },
        }),
        _ => Ok(Command::InsertReservation(BookingRequest {
            id: parse_ulid(row.require("id")?)?,
            space_id: parse_ulid(row.require("space_id")?)?,
            user_id: parse_ulid(row.require("user_id")?)?,
            start_date: parse_date(row.require("start_date")?)?,
            end_date: parse_date(row.require("end_date")?)?,
            start_time: row.optional("start_time", parse_time_or_null)?,
            end_time: row.optional("end_time", parse_time_or_null)?,
            details: row.optional("details", parse_string_or_null)?,
        })),
    }
}

/// One VALUES row keyed by column. With an explicit column list the names
/// decide; without one, values bind to `expected` in order.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn new(insert: &ast::Insert, table: &'static str, expected: &[&str]) -> Result<Self, SqlError> {
        let rows = insert_rows(insert)?;
        let [values] = rows else {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        };

        let names: Vec<String> = if insert.columns.is_empty() {
            if values.len() > expected.len() {
                return Err(SqlError::WrongArity(table, expected.len(), values.len()));
            }
            expected.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
            if let Some(unknown) = names.iter().find(|n| !expected.contains(&n.as_str())) {
                return Err(SqlError::UnknownColumn(unknown.clone()));
            }
            names
        };

        Ok(Self {
            table,
            values: names.into_iter().zip(values.iter().cloned()).collect(),
        })
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.values
            .get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// Absent column and explicit NULL both read as `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: fn(&Expr) -> Result<Option<T>, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.values.get(column) {
            Some(expr) => parse(expr),
            None => Ok(None),
        }
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    match name.as_str() {
        "spaces" => parse_space_update(assignments, selection),
        "users" => parse_user_update(assignments, selection),
        "reservations" => Err(SqlError::Unsupported(format!("UPDATE {name}"))),
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
    .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))
}

fn parse_space_update(assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;

    let mut patch = SpacePatch::default();
    let (mut latitude, mut longitude) = (None, None);
    for assignment in assignments {
        let column = assignment_column(assignment)?;
        let value = &assignment.value;
        match column.as_str() {
            "title" => patch.title = Some(parse_string(value)?),
            "description" => patch.description = Some(parse_string(value)?),
            "address" => patch.address = Some(parse_string(value)?),
            "latitude" => latitude = Some(parse_f64(value)?),
            "longitude" => longitude = Some(parse_f64(value)?),
            "capacity" => patch.capacity = Some(parse_u32(value)?),
            "price_per_day" => patch.price_per_day = Some(parse_u64(value)?),
            "image_url" => patch.image_url = Some(parse_string(value)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    patch.location = match (latitude, longitude) {
        (None, None) => None,
        (Some(latitude), Some(longitude)) => Some(Location { latitude, longitude }),
        _ => {
            return Err(SqlError::InvalidValue(
                "latitude and longitude must be updated together".into(),
            ));
        }
    };

    Ok(Command::UpdateSpace { id, patch })
}

fn parse_user_update(assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let id = extract_where_id(selection)?;

    let mut patch = UserPatch::default();
    for assignment in assignments {
        let column = assignment_column(assignment)?;
        let value = &assignment.value;
        match column.as_str() {
            "name" => patch.name = Some(parse_string(value)?),
            "email" => patch.email = Some(parse_string(value)?),
            "admin" => patch.admin = Some(parse_bool(value)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateUser { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "spaces" => Ok(Command::DeleteSpace { id }),
        "users" => Ok(Command::DeleteUser { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let ulid_filter = |col: &str| filters.get(col).map(parse_ulid).transpose();

    match table.as_str() {
        "spaces" => Ok(Command::SelectSpaces {
            id: ulid_filter("id")?,
            page: filters.get("page").map(parse_usize).transpose()?,
            per_page: filters.get("per_page").map(parse_usize).transpose()?,
        }),
        "space_locations" => Ok(Command::SelectSpaceLocations),
        "users" => Ok(Command::SelectUsers {
            id: ulid_filter("id")?,
        }),
        "reservations" => {
            let filter = if let Some(id) = ulid_filter("id")? {
                ReservationFilter::Id(id)
            } else if let Some(space_id) = ulid_filter("space_id")? {
                ReservationFilter::Space(space_id)
            } else if let Some(user_id) = ulid_filter("user_id")? {
                ReservationFilter::User(user_id)
            } else {
                ReservationFilter::All
            };
            Ok(Command::SelectReservations(filter))
        }
        "conflicts" => {
            let required = |col: &'static str| filters.get(col).ok_or(SqlError::MissingFilter(col));
            Ok(Command::SelectConflicts {
                space_id: parse_ulid(required("space_id")?)?,
                start_date: parse_date(required("start_date")?)?,
                end_date: parse_date(required("end_date")?)?,
                start_time: filters.get("start_time").map(parse_time).transpose()?,
                end_time: filters.get("end_time").map(parse_time).transpose()?,
            })
        }
        "report" => Ok(Command::SelectReport),
        "rankings" => {
            let metric = filters
                .get("metric")
                .ok_or(SqlError::MissingFilter("metric"))
                .and_then(parse_string)?;
            let metric = match metric.to_lowercase().as_str() {
                "revenue" => RankingMetric::BestRevenue,
                "revenue_asc" => RankingMetric::WorstRevenue,
                "bookings" => RankingMetric::MostBooked,
                other => return Err(SqlError::InvalidValue(format!("unknown ranking metric: {other}"))),
            };
            Ok(Command::SelectRankings { metric })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value [AND col = value ...]`, keyed by lowercased column name.
fn collect_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
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
            out.insert(col, right.as_ref().clone());
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.as_slice()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::InvalidValue(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s}: {e}")))
}

/// Digits of a numeric literal, with a leading `-` for negated literals.
fn numeric_text(expr: &Expr) -> Result<String, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(format!("-{}", numeric_text(expr)?)),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
            Some(other) => Err(SqlError::InvalidValue(format!("expected number, got {other}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let s = numeric_text(expr)?;
    s.trim().parse().map_err(|_| SqlError::InvalidValue(format!("bad unsigned integer: {s}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_u64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_u64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = numeric_text(expr)?;
    match s.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(SqlError::InvalidValue(format!("bad number: {s}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::InvalidValue(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool_or_null(expr: &Expr) -> Result<Option<bool>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_bool(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("bad date {s}, expected YYYY-MM-DD")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::InvalidValue(format!("bad time {s}, expected HH:MM")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// A literal that is well-formed SQL but not a valid value for its column.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
