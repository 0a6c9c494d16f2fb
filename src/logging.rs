//! Helper macro enforcing consistent relay log fields.
//!
//! Keeps a `topic` field present on every log emitted from the routing and
//! worker layers so downstream parsing can rely on it.

/// Log an event for a topic plus any extra fields.
#[macro_export]
macro_rules! relay_event {
    ($level:ident, $target:expr, $event:expr, topic = $topic:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            topic = %$topic,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            $($field = %$value,)*
        )
    };
}
