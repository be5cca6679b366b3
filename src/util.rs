//! Utility functions used by Hatchling, and available when writing load tests.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Once;
use std::time::Duration;
use url::Url;

use crate::{HatchlingError, CANCELED};

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?$")
            .expect("failed to compile timespan regex");
}

static CTRLC_HANDLER: Once = Once::new();

/// Parse a string representing a time span and return it as a [`Duration`].
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 250ms, 1s500ms, etc.
///
/// Returns `None` for a time span too long to count in milliseconds.
///
/// # Example
/// ```rust
/// use hatchling::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // A bare integer is a number of seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Think times are often shorter than a second.
/// assert_eq!(util::parse_timespan("250ms"), Some(Duration::from_millis(250)));
///
/// // Invalid values can't be parsed.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return None;
    }

    // If an integer is passed in, assume it's seconds.
    let total = if let Ok(seconds) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, seconds);
        Duration::from_secs(seconds)
    } else {
        let captures = TIMESPAN.captures(time_str)?;
        let part = |name: &str| -> Option<u64> {
            match captures.name(name) {
                Some(m) => u64::from_str(m.as_str()).ok(),
                None => Some(0),
            }
        };
        let hours = part("hours")?;
        let minutes = part("minutes")?;
        let seconds = part("seconds")?;
        let millis = part("millis")?;
        let total_seconds = hours
            .checked_mul(60 * 60)?
            .checked_add(minutes.checked_mul(60)?)?
            .checked_add(seconds)?;
        let total =
            Duration::from_secs(total_seconds).checked_add(Duration::from_millis(millis))?;
        trace!(
            "{} hours {} minutes {} seconds {} milliseconds: {:?}",
            hours,
            minutes,
            seconds,
            millis,
            total
        );
        total
    };

    // Time spans are tracked in whole milliseconds.
    u64::try_from(total.as_millis()).ok()?;
    Some(total)
}

/// Parse a time span into the whole milliseconds a test plan step is measured in.
pub(crate) fn parse_timespan_millis(time_str: &str) -> Option<usize> {
    parse_timespan(time_str).and_then(|timespan| usize::try_from(timespan.as_millis()).ok())
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Returns a new drift timer, so the caller can keep a regular cadence in a loop.
pub async fn sleep_minus_drift(
    duration: Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Calculate median for a BTreeMap of usizes.
///
/// The list is made of pairs: the (rounded) value on the left, and the number of
/// occurrences of that value on the right. Because values are rounded, the result
/// is clamped to the real `min` and `max` that were seen.
///
/// # Example
/// ```rust
/// use std::collections::BTreeMap;
/// use hatchling::util;
///
/// let mut btree: BTreeMap<usize, usize> = BTreeMap::new();
/// btree.insert(7, 5);
/// btree.insert(8, 1);
/// btree.insert(13, 21);
/// btree.insert(19, 44);
/// btree.insert(21, 5);
///
/// // Median (middle) value in this list of 76 integers is 19.
/// assert_eq!(util::median(&btree, 76, 7, 21), 19);
/// ```
pub fn median(
    btree: &BTreeMap<usize, usize>,
    total_elements: usize,
    min: usize,
    max: usize,
) -> usize {
    let mut total_count: usize = 0;
    let half_elements: usize = (total_elements as f64 / 2.0).round() as usize;
    for (value, counter) in btree {
        total_count += counter;
        if total_count >= half_elements {
            return (*value).clamp(min, max.max(min));
        }
    }
    0
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, this function removes the
/// extra characters and replaces the last two with a double-period ellipsis.
///
/// # Example
/// ```rust
/// use hatchling::util;
///
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if max_length > 2 && str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length - 2) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Helper function to determine if a host can be parsed, returning the parsed base url.
///
/// # Example
/// ```rust
/// use hatchling::util;
///
/// assert!(util::is_valid_host("http://localhost/").is_ok());
/// assert!(util::is_valid_host("http://127.0.0.1:8080").is_ok());
///
/// // Protocol is required.
/// assert!(util::is_valid_host("example.com/").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<Url, HatchlingError> {
    let url = Url::parse(host).map_err(|parse_error| HatchlingError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })?;
    if url.cannot_be_a_base() {
        return Err(HatchlingError::InvalidOption {
            option: "`configuration.host`".to_string(),
            value: host.to_string(),
            detail: "`configuration.host` must be a base url such as http://127.0.0.1/."
                .to_string(),
        });
    }
    Ok(url)
}

// Internal helper to configure the control-c handler. Stop cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler() {
    CTRLC_HANDLER.call_once(|| {
        if let Err(e) = ctrlc::set_handler(move || {
            if CANCELED.swap(true, Ordering::SeqCst) {
                warn!("caught another ctrl-c, exiting immediately...");
                std::process::exit(1);
            } else {
                warn!("caught ctrl-c, stopping...");
            }
        }) {
            info!("failed to set ctrl-c handler: {}", e);
        }
    });
}
