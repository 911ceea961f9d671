//! Helper macro enforcing consistent bridge log fields.
//!
//! Keeps `endpoint` (and optionally `route`) fields present on every log
//! emitted from transport/dispatcher layers so downstream parsing can rely on
//! them.

/// Log an event for an endpoint/route pair plus any extra fields.
#[macro_export]
macro_rules! bridge_event {
    ($level:ident, $target:expr, $event:expr, endpoint = $endpoint:expr, route = $route:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            endpoint = $endpoint,
            route = $route,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, endpoint = $endpoint:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target = $target,
            event = $event,
            endpoint = $endpoint,
            $($field = %$value,)*
        )
    };
}
