use chrono::{DateTime, FixedOffset, Offset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::str::FromStr;

/// Default filter for the engine binary; HTTP internals stay at info.
pub const ENGINE_LOG_FILTER: &str = "debug,reqwest=info,hyper=info,rustls=info";

/// Local offset from `TIMEZONE_OFFSET` seconds, 3600 when unset or invalid.
pub fn local_offset() -> FixedOffset {
    env::var("TIMEZONE_OFFSET")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .and_then(FixedOffset::east_opt)
        .or_else(|| FixedOffset::east_opt(3600))
        .unwrap_or_else(|| Utc.fix())
}

/// Formats lines as `<local time> [LEVEL] - message`. `RUST_LOG` wins over
/// `default_filter`.
pub fn init_logging(default_filter: &str) {
    let offset = local_offset();
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::from_str(&filter).unwrap_or(LevelFilter::Debug))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_falls_back_to_one_hour() {
        env::set_var("TIMEZONE_OFFSET", "not-a-number");
        assert_eq!(local_offset().local_minus_utc(), 3600);
        env::set_var("TIMEZONE_OFFSET", "32400");
        assert_eq!(local_offset().local_minus_utc(), 32400);
        env::remove_var("TIMEZONE_OFFSET");
    }
}
