use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// The current absolute instant. All wire and persisted timestamps are
/// zone-independent; zones only enter for presentation.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Resolves an IANA zone name, falling back to the host zone and finally
/// UTC when nothing resolves.
pub fn resolve_zone(name: Option<&str>) -> Tz {
    if let Some(name) = name {
        match name.parse::<Tz>() {
            Ok(tz) => return tz,
            Err(_) => warn!("unknown timezone {name:?}; falling back to the host zone"),
        }
    }
    host_zone().unwrap_or(chrono_tz::UTC)
}

fn host_zone() -> Option<Tz> {
    iana_time_zone::get_timezone().ok()?.parse().ok()
}

/// Renders an instant for humans in the given zone, `YYYY-MM-DD HH:MM:SS`.
pub fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
