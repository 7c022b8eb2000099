use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{error, info};

use crate::auth::FlexdeskAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter, SqlError};
use crate::tenant::TenantManager;

pub struct FlexdeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FlexdeskQueryParser>,
}

impl FlexdeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FlexdeskQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, run and time one statement. `format` picks text or binary per
    /// result column.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSpace { id, listing } => {
                engine.create_space(id, listing).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSpace { id, patch } => {
                engine.update_space(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSpace { id } => {
                engine.delete_space(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertUser { id, profile } => {
                engine.create_user(id, profile).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateUser { id, patch } => {
                engine.update_user(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation(request) => {
                // Answer like INSERT ... RETURNING * so the client sees the price
                // and deadline it was charged.
                let reservation = engine.book(request).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(vec![reservation], format)])
            }
            Command::DeleteReservation { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSpaces { id: Some(id), .. } => {
                let space = engine.get_space_info(id).await.map_err(engine_err)?;
                Ok(vec![space_rows(vec![space], 1, 1, 1, format)])
            }
            Command::SelectSpaces {
                id: None,
                page,
                per_page,
            } => {
                let page = engine.list_spaces(page, per_page).await.map_err(engine_err)?;
                Ok(vec![space_rows(
                    page.items,
                    page.total,
                    page.page,
                    page.total_pages,
                    format,
                )])
            }
            Command::SelectSpaceLocations => {
                let locations = engine.list_space_locations().await;
                let schema = Arc::new(location_schema(format));
                let rows: Vec<PgWireResult<DataRow>> = locations
                    .into_iter()
                    .map(|l| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&l.id.to_string())?;
                        encoder.encode_field(&l.title)?;
                        encoder.encode_field(&l.description)?;
                        encoder.encode_field(&l.location.latitude)?;
                        encoder.encode_field(&l.location.longitude)?;
                        encoder.encode_field(&int(l.price_per_day))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => vec![engine.get_user_info(id).await.map_err(engine_err)?],
                    None => engine.list_users().await,
                };
                let schema = Arc::new(user_schema(format));
                let rows: Vec<PgWireResult<DataRow>> = users
                    .into_iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.id.to_string())?;
                        encoder.encode_field(&u.profile.name)?;
                        encoder.encode_field(&u.profile.email)?;
                        encoder.encode_field(&u.profile.admin)?;
                        encoder.encode_field(&join_ids(&u.reservations))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations(filter) => {
                let reservations = match filter {
                    ReservationFilter::All => engine.list_reservations().await,
                    ReservationFilter::Id(id) => {
                        vec![engine.get_reservation(id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::Space(space_id) => engine
                        .reservations_for_space(space_id)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::User(user_id) => engine
                        .reservations_for_user(user_id)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(vec![reservation_rows(reservations, format)])
            }
            Command::SelectConflicts {
                space_id,
                start_date,
                end_date,
                start_time,
                end_time,
            } => {
                let window = Window::from_parts(start_date, end_date, start_time, end_time)
                    .map_err(engine_err)?;
                let conflicts = engine
                    .find_conflicts(space_id, &window)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(conflicts, format)])
            }
            Command::SelectReport => {
                let report = engine.report().await;
                let schema = Arc::new(report_schema(format));
                let top = |list: &[RankedSpace]| list.first().map(|r| r.id.to_string());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&int(report.total_revenue))?;
                encoder.encode_field(&(report.total_spaces as i64))?;
                encoder.encode_field(&(report.total_reservations as i64))?;
                encoder.encode_field(&top(&report.best_revenue))?;
                encoder.encode_field(&top(&report.worst_revenue))?;
                encoder.encode_field(&top(&report.most_booked))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRankings { metric } => {
                let ranked = engine.rankings(metric).await;
                let schema = Arc::new(ranking_schema(format));
                let rows: Vec<PgWireResult<DataRow>> = ranked
                    .into_iter()
                    .enumerate()
                    .map(|(i, r)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(i as i64 + 1))?;
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.title)?;
                        encoder.encode_field(&int(r.times_booked))?;
                        encoder.encode_field(&int(r.economic_performance))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

/// Postgres has no unsigned integers; amounts past i64::MAX saturate.
fn int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn join_ids(ids: &[ulid::Ulid]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn space_rows(
    spaces: Vec<SpaceInfo>,
    total: usize,
    page: usize,
    total_pages: usize,
    format: &Format,
) -> Response {
    let schema = Arc::new(space_schema(format));
    let rows: Vec<PgWireResult<DataRow>> = spaces
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.listing.title)?;
            encoder.encode_field(&s.listing.description)?;
            encoder.encode_field(&s.listing.address)?;
            encoder.encode_field(&s.listing.location.latitude)?;
            encoder.encode_field(&s.listing.location.longitude)?;
            encoder.encode_field(&(s.listing.capacity as i64))?;
            encoder.encode_field(&int(s.listing.price_per_day))?;
            encoder.encode_field(&s.listing.image_url)?;
            encoder.encode_field(&int(s.times_booked))?;
            encoder.encode_field(&int(s.economic_performance))?;
            encoder.encode_field(&join_ids(&s.reservations))?;
            encoder.encode_field(&(total as i64))?;
            encoder.encode_field(&(page as i64))?;
            encoder.encode_field(&(total_pages as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<Reservation>, format: &Format) -> Response {
    let schema = Arc::new(reservation_schema(format));
    let rows: Vec<PgWireResult<DataRow>> = reservations
        .into_iter()
        .map(|r| {
            let times = r.window.times;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.space_id.to_string())?;
            encoder.encode_field(&r.user_id.to_string())?;
            encoder.encode_field(&r.window.dates.start.to_string())?;
            encoder.encode_field(&r.window.dates.end.to_string())?;
            encoder.encode_field(&times.map(|t| t.start.format("%H:%M").to_string()))?;
            encoder.encode_field(&times.map(|t| t.end.format("%H:%M").to_string()))?;
            encoder.encode_field(&r.details)?;
            encoder.encode_field(&int(r.total_price))?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.cancellation_deadline)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Binary only where the client asked for it; describe-time schemas are text.
fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = match format {
                Format::Individual(codes) if i >= codes.len() => FieldFormat::Text,
                _ => format.format_for(i),
            };
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn space_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("address", Type::VARCHAR),
            ("latitude", Type::FLOAT8),
            ("longitude", Type::FLOAT8),
            ("capacity", Type::INT8),
            ("price_per_day", Type::INT8),
            ("image_url", Type::VARCHAR),
            ("times_booked", Type::INT8),
            ("economic_performance", Type::INT8),
            ("reservations", Type::VARCHAR),
            ("total", Type::INT8),
            ("page", Type::INT8),
            ("total_pages", Type::INT8),
        ],
        format,
    )
}

fn location_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("latitude", Type::FLOAT8),
            ("longitude", Type::FLOAT8),
            ("price_per_day", Type::INT8),
        ],
        format,
    )
}

fn user_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("admin", Type::BOOL),
            ("reservations", Type::VARCHAR),
        ],
        format,
    )
}

fn reservation_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("space_id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("start_date", Type::VARCHAR),
            ("end_date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("details", Type::VARCHAR),
            ("total_price", Type::INT8),
            ("created_at", Type::INT8),
            ("cancellation_deadline", Type::INT8),
        ],
        format,
    )
}

fn report_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("total_revenue", Type::INT8),
            ("total_spaces", Type::INT8),
            ("total_reservations", Type::INT8),
            ("best_revenue_space", Type::VARCHAR),
            ("worst_revenue_space", Type::VARCHAR),
            ("most_booked_space", Type::VARCHAR),
        ],
        format,
    )
}

fn ranking_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("rank", Type::INT8),
            ("id", Type::VARCHAR),
            ("title", Type::VARCHAR),
            ("times_booked", Type::INT8),
            ("economic_performance", Type::INT8),
        ],
        format,
    )
}

/// Result columns of a statement, judged from its text so it also works on
/// statements that still carry `$n` placeholders.
fn schema_for_sql(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let select = upper.trim_start().starts_with("SELECT");
    if upper.trim_start().starts_with("INSERT") && upper.contains("RESERVATIONS") {
        return reservation_schema(format);
    }
    if !select {
        return vec![];
    }
    if upper.contains("SPACE_LOCATIONS") {
        location_schema(format)
    } else if upper.contains("CONFLICTS") || upper.contains("RESERVATIONS") {
        reservation_schema(format)
    } else if upper.contains("SPACES") {
        space_schema(format)
    } else if upper.contains("USERS") {
        user_schema(format)
    } else if upper.contains("RANKINGS") {
        ranking_schema(format)
    } else if upper.contains("REPORT") {
        report_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for FlexdeskHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FlexdeskQueryParser;

#[async_trait]
impl QueryParser for FlexdeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let text = Format::UnifiedText;
        Ok(schema_for_sql(stmt, column_format.unwrap_or(&text)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FlexdeskHandler {
    type Statement = String;
    type QueryParser = FlexdeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        let responses = self
            .run(client, &sql, &portal.result_column_format)
            .await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside quoted text and line comments, as byte range
/// and N.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote reads as close then reopen.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters as quoted literals in one pass over the statement.
/// Bound values are copied, never rescanned; placeholders with no bound value
/// stay as written.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FlexdeskFactory {
    handler: Arc<FlexdeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FlexdeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FlexdeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FlexdeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FlexdeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FlexdeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FlexdeskFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::Conflict => "23P01",
        EngineError::AlreadyExists(_) | EngineError::Duplicate { .. } => "23505",
        EngineError::CancellationWindowExpired { .. } => "55000",
        EngineError::HasReservations(_) => "2BP01",
        EngineError::WalError(_) => "58030",
    }
}

/// SQLSTATE and client-facing message for an engine error.
fn engine_error_parts(e: &EngineError) -> (&'static str, String) {
    let code = sqlstate(e);
    if e.is_retryable() {
        // Storage details stay in the log.
        error!("storage failure: {e}");
        return (code, "internal storage error, retry later".into());
    }
    if matches!(e, EngineError::CancellationWindowExpired { .. }) {
        info!("late cancellation rejected: {e}");
    }
    (code, e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    let (code, message) = engine_error_parts(&e);
    user_error(code, message)
}

/// Bad literal values are validation failures like any other; only
/// malformed or unsupported statements are syntax errors.
fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) | SqlError::MissingColumn(..) | SqlError::MissingFilter(_) => {
            "22023"
        }
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn code_of(e: EngineError) -> &'static str {
        engine_error_parts(&e).0
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        assert_eq!(code_of(EngineError::Conflict), "23P01");
        assert_eq!(code_of(EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(code_of(EngineError::Validation("x".into())), "22023");
        assert_eq!(code_of(EngineError::LimitExceeded("x")), "22023");
        assert_eq!(code_of(EngineError::AlreadyExists(Ulid::new())), "23505");
        assert_eq!(
            code_of(EngineError::Duplicate {
                field: "email",
                value: "a@b.co".into()
            }),
            "23505"
        );
        assert_eq!(
            code_of(EngineError::CancellationWindowExpired { deadline: 0 }),
            "55000"
        );
        assert_eq!(code_of(EngineError::HasReservations(Ulid::new())), "2BP01");
        assert_eq!(code_of(EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn storage_errors_hide_details() {
        let (_, message) =
            engine_error_parts(&EngineError::WalError("/data/secret.wal: EIO".into()));
        assert!(!message.contains("secret"));
    }

    #[test]
    fn conflict_message_names_no_reservation() {
        let (_, message) = engine_error_parts(&EngineError::Conflict);
        assert_eq!(message, "date already reserved");
    }

    #[test]
    fn sql_errors_map_to_sqlstate() {
        assert_eq!(sql_sqlstate(&SqlError::InvalidValue("bad date".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::MissingColumn("reservations", "start_date")), "22023");
        assert_eq!(sql_sqlstate(&SqlError::MissingFilter("id")), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Parse("x".into())), "42601");
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("desks".into())), "42601");

        let date = sql::parse_sql(
            "INSERT INTO reservations VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', \
             '01ARZ3NDEKTSV4RRFFQ69G5FAV', '01ARZ3NDEKTSV4RRFFQ69G5FAV', '2030-02-30', '2030-03-01')",
        )
        .unwrap_err();
        assert_eq!(sql_sqlstate(&date), "22023");
        let syntax = sql::parse_sql("SELEC * FROM spaces").unwrap_err();
        assert_eq!(sql_sqlstate(&syntax), "42601");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM spaces"), 0);
        assert_eq!(count_params("SELECT * FROM users WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO users VALUES ($1, $2, $10, $3)"),
            10
        );
        assert_eq!(count_params("SELECT '$' FROM report"), 0);
        assert_eq!(count_params("SELECT '$7' FROM report WHERE metric = $2"), 2);
        assert_eq!(count_params("SELECT * FROM report -- $9\n"), 0);
    }

    #[test]
    fn bound_values_are_never_rescanned() {
        let sql = "UPDATE spaces SET description = $2 WHERE id = $1";
        let bound = bind_params(
            sql,
            &[Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"), Some("deposit of $1 due at 9 o'clock")],
        );
        assert_eq!(
            bound,
            "UPDATE spaces SET description = 'deposit of $1 due at 9 o''clock' \
             WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
        match sql::parse_sql(&bound).unwrap() {
            Command::UpdateSpace { patch, .. } => assert_eq!(
                patch.description.as_deref(),
                Some("deposit of $1 due at 9 o'clock")
            ),
            cmd => panic!("expected UpdateSpace, got {cmd:?}"),
        }
    }

    #[test]
    fn bind_handles_nulls_quotes_and_wide_indexes() {
        assert_eq!(bind_params("SELECT $1, $3", &[None::<&str>]), "SELECT NULL, $3");
        assert_eq!(
            bind_params("SELECT * FROM spaces WHERE title = '$1' AND id = $1", &[Some("x")]),
            "SELECT * FROM spaces WHERE title = '$1' AND id = 'x'"
        );
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(format!("v{i}"))).collect();
        assert_eq!(bind_params("VALUES ($1, $10)", &params), "VALUES ('v1', 'v10')");
        assert_eq!(bind_params("SELECT $$x$$", &[Some("y")]), "SELECT $$x$$");
    }

    #[test]
    fn binary_columns_follow_the_portal_format() {
        let binary = user_schema(&Format::UnifiedBinary);
        assert!(binary.iter().all(|f| f.format() == FieldFormat::Binary));
        let text = user_schema(&Format::UnifiedText);
        assert!(text.iter().all(|f| f.format() == FieldFormat::Text));
        // A short per-column list falls back to text.
        let mixed = user_schema(&Format::Individual(vec![1]));
        assert_eq!(mixed[0].format(), FieldFormat::Binary);
        assert_eq!(mixed[4].format(), FieldFormat::Text);
    }

    #[test]
    fn schemas_follow_table() {
        let text = Format::UnifiedText;
        let schema = |sql: &str| schema_for_sql(sql, &text);
        let names = |schema: Vec<FieldInfo>| -> Vec<String> {
            schema.iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names(schema("select * from space_locations"))[0], "id");
        assert_eq!(schema("SELECT * FROM spaces").len(), 15);
        assert_eq!(schema("SELECT * FROM conflicts WHERE space_id = $1").len(), 11);
        assert_eq!(
            schema("INSERT INTO reservations VALUES ($1, $2, $3, $4, $5)").len(),
            11
        );
        assert!(schema("INSERT INTO users VALUES ($1, $2, $3)").is_empty());
        assert!(schema("DELETE FROM reservations WHERE id = $1").is_empty());
        assert_eq!(names(schema("SELECT * FROM report"))[0], "total_revenue");
        assert_eq!(names(schema("SELECT * FROM rankings WHERE metric = $1"))[0], "rank");
    }
}
