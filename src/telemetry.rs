use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "veilhub";

pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("veilhub=info,info"));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter)
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

/// Emits `key=value` lines with a stable field order so downstream parsing
/// can rely on `ts`, `level`, `service`, `component` and `msg` being present.
struct KeyValueFormatter;

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut line = String::new();
        push_field(
            &mut line,
            "ts",
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", SERVICE_NAME);
        push_field(&mut line, "component", metadata.target());
        push_field(&mut line, "msg", &message);
        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '='))
    {
        buffer.push('"');
        for ch in value.chars() {
            match ch {
                '"' => buffer.push_str("\\\""),
                '\\' => buffer.push_str("\\\\"),
                '\n' => buffer.push_str("\\n"),
                '\r' => buffer.push_str("\\r"),
                '\t' => buffer.push_str("\\t"),
                _ => buffer.push(ch),
            }
        }
        buffer.push('"');
    } else {
        buffer.push_str(value);
    }
}

/// Process-wide relay counters. These are observability bookkeeping only;
/// relay routing state never lives here.
#[derive(Default)]
pub struct RelayCounters {
    envelopes_queued: AtomicU64,
    queue_flushes: AtomicU64,
    envelopes_flushed: AtomicU64,
    send_failures: AtomicU64,
    broadcast_fallbacks: AtomicU64,
    unknown_topics_dropped: AtomicU64,
    chunks_emitted: AtomicU64,
    items_dropped: AtomicU64,
    malformed_acks: AtomicU64,
    commits_acked: AtomicU64,
    commits_errored: AtomicU64,
    commits_timed_out: AtomicU64,
    origin_evictions: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayCountersSnapshot {
    pub envelopes_queued: u64,
    pub queue_flushes: u64,
    pub envelopes_flushed: u64,
    pub send_failures: u64,
    pub broadcast_fallbacks: u64,
    pub unknown_topics_dropped: u64,
    pub chunks_emitted: u64,
    pub items_dropped: u64,
    pub malformed_acks: u64,
    pub commits_acked: u64,
    pub commits_errored: u64,
    pub commits_timed_out: u64,
    pub origin_evictions: u64,
}

impl RelayCounters {
    pub fn inc_envelopes_queued(&self) {
        self.envelopes_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, delivered: u64) {
        self.queue_flushes.fetch_add(1, Ordering::Relaxed);
        self.envelopes_flushed.fetch_add(delivered, Ordering::Relaxed);
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_fallbacks(&self) {
        self.broadcast_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_topics_dropped(&self) {
        self.unknown_topics_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_emitted(&self) {
        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_items_dropped(&self, count: u64) {
        self.items_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_malformed_acks(&self) {
        self.malformed_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits_acked(&self) {
        self.commits_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits_errored(&self) {
        self.commits_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits_timed_out(&self) {
        self.commits_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_origin_evictions(&self, count: u64) {
        self.origin_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayCountersSnapshot {
        RelayCountersSnapshot {
            envelopes_queued: self.envelopes_queued.load(Ordering::Relaxed),
            queue_flushes: self.queue_flushes.load(Ordering::Relaxed),
            envelopes_flushed: self.envelopes_flushed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            broadcast_fallbacks: self.broadcast_fallbacks.load(Ordering::Relaxed),
            unknown_topics_dropped: self.unknown_topics_dropped.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            malformed_acks: self.malformed_acks.load(Ordering::Relaxed),
            commits_acked: self.commits_acked.load(Ordering::Relaxed),
            commits_errored: self.commits_errored.load(Ordering::Relaxed),
            commits_timed_out: self.commits_timed_out.load(Ordering::Relaxed),
            origin_evictions: self.origin_evictions.load(Ordering::Relaxed),
        }
    }
}

static RELAY_COUNTERS: OnceLock<RelayCounters> = OnceLock::new();

pub fn relay_counters() -> &'static RelayCounters {
    RELAY_COUNTERS.get_or_init(RelayCounters::default)
}
