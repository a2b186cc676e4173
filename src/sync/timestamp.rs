//! Snapshot filename timestamp codec
//!
//! Snapshot names carry the time of the data they hold. Three filename
//! generations exist on real servers and all of them stay readable:
//!
//! - `{prefix}_{13-digit epoch ms}.json`
//! - `{prefix}_{yyMMdd}_{HHmmss}_{sss}.json`
//! - `{clientId}_{prefix}_{yyMMdd}_{HHmmss}_{sss}.json`
//!
//! New names always use the structured `yyMMdd_HHmmss_sss` token, rendered
//! from wall-clock components of the codec's time zone.

use chrono::{Datelike, Local, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::SNAPSHOT_EXTENSION;

/// Window past "now" a decoded two-digit year may land in before it is
/// read as the previous century
const CENTURY_LOOKAHEAD_YEARS: i32 = 10;

static STRUCTURED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})(\d{2})_(\d{2})(\d{2})(\d{2})_(\d{3})$").unwrap());

static EPOCH_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{13}$").unwrap());

static STRUCTURED_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|_)(\d{6}_\d{6}_\d{3})$").unwrap());

static EPOCH_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|_)(\d{13})$").unwrap());

/// Token generations, in decode priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// `yyMMdd_HHmmss_sss` in local wall-clock time
    Structured,
    /// Raw 13-digit epoch milliseconds
    EpochMillis,
}

impl TokenFormat {
    pub const DECODE_ORDER: [TokenFormat; 2] = [TokenFormat::Structured, TokenFormat::EpochMillis];

    fn suffix_pattern(&self) -> &'static Regex {
        match self {
            TokenFormat::Structured => &STRUCTURED_SUFFIX,
            TokenFormat::EpochMillis => &EPOCH_SUFFIX,
        }
    }
}

/// Bidirectional mapping between epoch milliseconds and filename tokens
#[derive(Debug, Clone)]
pub struct TimestampCodec<Tz: TimeZone = Local> {
    tz: Tz,
}

impl Default for TimestampCodec<Local> {
    fn default() -> Self {
        Self::local()
    }
}

impl TimestampCodec<Local> {
    /// Codec using the machine's local time zone
    pub fn local() -> Self {
        Self { tz: Local }
    }
}

impl<Tz: TimeZone> TimestampCodec<Tz>
where
    Tz::Offset: std::fmt::Display,
{
    /// Codec pinned to a specific time zone
    pub fn with_timezone(tz: Tz) -> Self {
        Self { tz }
    }

    /// Render a fixed-width, string-sortable token.
    ///
    /// Tokens carry wall-clock time without an offset. In a zone with DST,
    /// instants in the repeated fall-back hour decode one hour early; pin a
    /// `FixedOffset` or `Utc` codec where that matters.
    pub fn encode(&self, ms: i64) -> String {
        match self.tz.timestamp_millis_opt(ms).earliest() {
            Some(dt) => format!(
                "{}_{:03}",
                dt.format("%y%m%d_%H%M%S"),
                dt.timestamp_subsec_millis()
            ),
            // Out of chrono's range; the epoch form is still decodable
            None => format!("{:013}", ms),
        }
    }

    /// Decode a bare token, resolving the century against the current time
    pub fn decode(&self, token: &str) -> Option<i64> {
        self.decode_at(token, Utc::now().timestamp_millis())
    }

    /// Decode a bare token relative to an explicit "now"
    pub fn decode_at(&self, token: &str, now_ms: i64) -> Option<i64> {
        let token = token.trim();
        TokenFormat::DECODE_ORDER
            .iter()
            .find_map(|format| self.decode_format(*format, token, now_ms))
    }

    /// Extract and decode the timestamp from a snapshot filename of any
    /// generation
    pub fn decode_filename(&self, name: &str) -> Option<i64> {
        self.decode_filename_at(name, Utc::now().timestamp_millis())
    }

    pub fn decode_filename_at(&self, name: &str, now_ms: i64) -> Option<i64> {
        let stem = name.strip_suffix(SNAPSHOT_EXTENSION).unwrap_or(name);
        TokenFormat::DECODE_ORDER.iter().find_map(|format| {
            let caps = format.suffix_pattern().captures(stem)?;
            self.decode_format(*format, caps.get(1)?.as_str(), now_ms)
        })
    }

    fn decode_format(&self, format: TokenFormat, token: &str, now_ms: i64) -> Option<i64> {
        match format {
            TokenFormat::Structured => self.decode_structured(token, now_ms),
            TokenFormat::EpochMillis => {
                if EPOCH_TOKEN.is_match(token) {
                    token.parse().ok()
                } else {
                    None
                }
            }
        }
    }

    fn decode_structured(&self, token: &str, now_ms: i64) -> Option<i64> {
        let caps = STRUCTURED_TOKEN.captures(token)?;
        let field = |i: usize| -> Option<u32> { caps.get(i)?.as_str().parse().ok() };
        let yy = field(1)? as i32;

        let now_year = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .map(|dt| dt.year())
            .unwrap_or(2000);
        let mut year = 2000 + yy;
        if year > now_year + CENTURY_LOOKAHEAD_YEARS {
            year -= 100;
        }

        let naive = NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?.and_hms_milli_opt(
            field(4)?,
            field(5)?,
            field(6)?,
            field(7)?,
        )?;
        let local = self.tz.from_local_datetime(&naive).earliest()?;
        Some(local.timestamp_millis())
    }
}
