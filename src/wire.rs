use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{DayForecast, Engine, EngineError, HourlyForecast, Prediction};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, RowShape, SlotFilter, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
) -> io::Result<()> {
    let factory = ParkdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

pub struct ParkdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    /// Parse, run and time one statement.
    async fn execute(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(SqlError::Empty) => return Ok(Response::EmptyQuery),
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlot {
                id,
                slot_number,
                floor,
                slot_type,
            } => {
                engine
                    .create_slot(id, &slot_number, floor, slot_type)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Reserve(req) => {
                let booking = engine.reserve(req).await.map_err(engine_err)?;
                Ok(rows(booking_schema(), format, &[booking], encode_booking))
            }
            Command::CancelBooking { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ForceMaintenance { slot_id } => {
                let slot = engine.force_maintenance(slot_id).await.map_err(engine_err)?;
                Ok(rows(slot_schema(), format, &[slot], encode_slot))
            }
            Command::SetSlotStatus {
                slot_id,
                status,
                vehicle_number,
            } => {
                let slot = engine
                    .update_status(slot_id, status, vehicle_number.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(rows(slot_schema(), format, &[slot], encode_slot))
            }
            Command::SelectSlots { filter } => {
                let slots = match filter {
                    SlotFilter::All => engine.list_slots().await,
                    SlotFilter::Id(id) => vec![engine.get_slot(id).await.map_err(engine_err)?],
                    SlotFilter::Status(status) => engine.list_slots_with_status(status).await,
                };
                Ok(rows(slot_schema(), format, &slots, encode_slot))
            }
            Command::SelectBookings => {
                Ok(rows(booking_schema(), format, &engine.list_bookings(), encode_booking))
            }
            Command::SelectPrediction { query } => {
                let prediction = engine.predict(query).await.map_err(engine_err)?;
                Ok(rows(prediction_schema(), format, &[prediction], encode_prediction))
            }
            Command::SelectForecast { force_fallback } => {
                let forecast = engine.predict_full_day(force_fallback).await;
                Ok(forecast_rows(&forecast, format))
            }
            Command::SelectDashboard => {
                let dashboard = engine.dashboard().await;
                Ok(rows(dashboard_schema(), format, &[dashboard], encode_dashboard))
            }
            Command::SelectHourlyAverages => Ok(rows(
                hourly_schema(),
                format,
                &engine.hourly_averages().await,
                encode_hourly,
            )),
            Command::SelectFloors => Ok(rows(
                floor_schema(),
                format,
                &engine.slots_by_floor().await,
                encode_floor,
            )),
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Re-tag each column with the format the client asked for.
fn with_format(schema: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(
                f.name().into(),
                None,
                None,
                f.datatype().clone(),
                format.format_for(i),
            )
        })
        .collect()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    format: &Format,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(with_format(schema, format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn schema_for(shape: Option<RowShape>) -> Vec<FieldInfo> {
    match shape {
        Some(RowShape::Slot) => slot_schema(),
        Some(RowShape::Booking) => booking_schema(),
        Some(RowShape::Prediction) => prediction_schema(),
        Some(RowShape::Forecast) => forecast_schema(),
        Some(RowShape::Dashboard) => dashboard_schema(),
        Some(RowShape::HourlyAverage) => hourly_schema(),
        Some(RowShape::Floor) => floor_schema(),
        None => vec![],
    }
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slot_number", Type::VARCHAR),
        field("floor", Type::INT4),
        field("slot_type", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("vehicle_number", Type::VARCHAR),
        field("updated_at", Type::INT8),
    ]
}

fn encode_slot(e: &mut DataRowEncoder, s: &Slot) -> PgWireResult<()> {
    e.encode_field(&s.id.to_string())?;
    e.encode_field(&s.slot_number)?;
    e.encode_field(&s.floor)?;
    e.encode_field(&s.slot_type.as_str().to_string())?;
    e.encode_field(&s.status.as_str().to_string())?;
    e.encode_field(&s.vehicle_number)?;
    e.encode_field(&s.updated_at)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_name", Type::VARCHAR),
        field("user_phone", Type::VARCHAR),
        field("vehicle_number", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("slot_number", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
        field("duration_hours", Type::INT4),
        field("status", Type::VARCHAR),
    ]
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.user_name)?;
    e.encode_field(&b.user_phone)?;
    e.encode_field(&b.vehicle_number)?;
    e.encode_field(&b.slot_id.to_string())?;
    e.encode_field(&b.slot_number)?;
    e.encode_field(&b.start_time)?;
    e.encode_field(&b.end_time)?;
    e.encode_field(&(b.duration_hours as i32))?;
    e.encode_field(&b.status.as_str().to_string())
}

fn prediction_schema() -> Vec<FieldInfo> {
    vec![
        field("hour", Type::INT4),
        field("day", Type::INT4),
        field("method", Type::VARCHAR),
        field("is_fallback", Type::BOOL),
        field("predicted_rate", Type::INT4),
        field("predicted_occupied", Type::INT4),
        field("confidence", Type::INT4),
        field("sample_count", Type::INT4),
        field("total_slots", Type::INT4),
        field("available", Type::INT4),
        field("occupied", Type::INT4),
        field("reserved", Type::INT4),
        field("maintenance", Type::INT4),
        field("occupancy_rate", Type::INT4),
        field("recommendation", Type::VARCHAR),
        field("message", Type::VARCHAR),
        field("peak_hours", Type::VARCHAR),
    ]
}

fn encode_prediction(e: &mut DataRowEncoder, p: &Prediction) -> PgWireResult<()> {
    let peak_hours = p
        .peak_hours
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",");
    e.encode_field(&i32::from(p.bucket.hour))?;
    e.encode_field(&i32::from(p.bucket.day))?;
    e.encode_field(&p.method.as_str().to_string())?;
    e.encode_field(&p.is_fallback())?;
    e.encode_field(&(p.estimate.predicted_rate as i32))?;
    e.encode_field(&(p.predicted_occupied as i32))?;
    e.encode_field(&(p.estimate.confidence as i32))?;
    e.encode_field(&(p.estimate.sample_count as i32))?;
    encode_stats(e, &p.current)?;
    e.encode_field(&p.recommendation.level.as_str().to_string())?;
    e.encode_field(&p.recommendation.message.to_string())?;
    e.encode_field(&peak_hours)
}

/// total, available, occupied, reserved, maintenance, rate.
fn encode_stats(e: &mut DataRowEncoder, s: &OccupancyStats) -> PgWireResult<()> {
    for n in [
        s.total,
        s.available,
        s.occupied,
        s.reserved,
        s.maintenance,
        s.occupancy_rate,
    ] {
        e.encode_field(&(n as i32))?;
    }
    Ok(())
}

fn forecast_schema() -> Vec<FieldInfo> {
    vec![
        field("day", Type::INT4),
        field("hour", Type::INT4),
        field("predicted_rate", Type::INT4),
        field("method", Type::VARCHAR),
    ]
}

fn forecast_rows(forecast: &DayForecast, format: &Format) -> Response {
    let day = i32::from(forecast.day_of_week);
    let rows_with_day: Vec<(i32, HourlyForecast)> =
        forecast.hours.iter().map(|h| (day, *h)).collect();
    rows(forecast_schema(), format, &rows_with_day, encode_forecast_hour)
}

fn encode_forecast_hour(
    e: &mut DataRowEncoder,
    (day, h): &(i32, HourlyForecast),
) -> PgWireResult<()> {
    e.encode_field(day)?;
    e.encode_field(&i32::from(h.hour))?;
    e.encode_field(&(h.predicted_rate as i32))?;
    e.encode_field(&h.method.as_str().to_string())
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        field("total_slots", Type::INT4),
        field("available", Type::INT4),
        field("occupied", Type::INT4),
        field("reserved", Type::INT4),
        field("maintenance", Type::INT4),
        field("occupancy_rate", Type::INT4),
        field("total_bookings", Type::INT4),
        field("active_bookings", Type::INT4),
        field("today_bookings", Type::INT4),
    ]
}

fn encode_dashboard(e: &mut DataRowEncoder, d: &Dashboard) -> PgWireResult<()> {
    encode_stats(e, &d.slots)?;
    e.encode_field(&(d.bookings.total as i32))?;
    e.encode_field(&(d.bookings.active as i32))?;
    e.encode_field(&(d.bookings.today as i32))
}

fn hourly_schema() -> Vec<FieldInfo> {
    vec![field("hour", Type::INT4), field("avg_rate", Type::FLOAT8)]
}

fn encode_hourly(e: &mut DataRowEncoder, h: &HourlyAverage) -> PgWireResult<()> {
    e.encode_field(&i32::from(h.hour_of_day))?;
    e.encode_field(&h.avg_rate)
}

fn floor_schema() -> Vec<FieldInfo> {
    vec![
        field("floor", Type::INT4),
        field("total_slots", Type::INT4),
        field("available", Type::INT4),
        field("occupied", Type::INT4),
        field("reserved", Type::INT4),
        field("maintenance", Type::INT4),
        field("occupancy_rate", Type::INT4),
        field("slots", Type::VARCHAR),
    ]
}

fn encode_floor(e: &mut DataRowEncoder, f: &FloorSummary) -> PgWireResult<()> {
    e.encode_field(&f.floor)?;
    encode_stats(e, &f.stats)?;
    let numbers: Vec<&str> = f.slots.iter().map(|s| s.slot_number.as_str()).collect();
    e.encode_field(&numbers.join(","))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        debug!("simple query: {query}");
        Ok(vec![self.execute(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
        let schema = schema_for(sql::row_shape(stmt));
        Ok(match column_format {
            Some(format) => with_format(schema, format),
            None => schema,
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        debug!("extended query: {sql}");
        self.execute(&sql, &portal.result_column_format).await
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
            schema_for(sql::row_shape(&target.statement)),
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
        let schema = schema_for(sql::row_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(with_format(
            schema,
            &target.result_column_format,
        )))
    }
}

/// Byte range and index of every `$N` placeholder outside quoted literals
/// and identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // '' closes and reopens the literal, so escapes need no special case.
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>()
                    && n > 0
                {
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

/// Inline bound text parameters as quoted literals in one pass, so a value
/// that itself contains `$1` is copied as-is. Placeholders with no bound
/// value are left for the parser to reject.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
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

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Startup ──────────────────────────────────────────────────────

/// Shared connection secret checked at startup. Any user name is accepted.
#[derive(Debug)]
pub struct ConnectionSecret {
    password: String,
}

#[async_trait]
impl AuthSource for ConnectionSecret {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ConnectionSecret, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(ParkdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ConnectionSecret { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::AlreadyExists(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Timeout(_) => "55P03",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
