pub mod actions;
pub mod backoff;
pub mod engine;
pub mod issue;
pub mod item_list;
pub mod lanes;
pub mod local_watcher;
pub mod paths;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod router;
pub mod store;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

use time::OffsetDateTime;

/// Wall clock in unix seconds, used for row timestamps.
pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Wall clock in unix milliseconds, used for wait deadlines.
pub(crate) fn unix_now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
