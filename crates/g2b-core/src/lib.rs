//! Core domain model for the G2B bid collector: announcements, revisions, windows, watermarks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

pub const CRATE_NAME: &str = "g2b-core";

/// Date format the upstream API expects for `inqryBgnDt` / `inqryEndDt`.
pub const INQUIRY_DATE_FORMAT: &str = "%Y%m%d%H%M";

/// Seconds east of UTC for Korea Standard Time. The upstream API speaks KST wall-clock time.
pub const KST_OFFSET_SECS: i32 = 9 * 3600;

pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

pub fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt - Duration::seconds(i64::from(dt.second())) - Duration::nanoseconds(i64::from(dt.nanosecond()))
}

/// Parse the datetime shapes seen in `bidNtceDt` (upstream "YYYY-MM-DD HH:MM:SS", stored
/// ISO-8601, or RFC 3339 with an offset) into KST wall-clock time.
pub fn parse_bid_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.with_timezone(&kst()).naive_local());
    }
    const FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%Y%m%d%H%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Raw `bidNtceOrd` as delivered upstream: usually a zero-padded string, sometimes a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RevisionField {
    Number(Number),
    Text(String),
}

/// Dual representation of a revision: the string key used in document ids and the
/// numeric ordinal used for ordering. Revisions are not purely numeric ("001" vs "1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionKey {
    pub key: String,
    pub ordinal: i64,
}

impl RevisionKey {
    pub fn empty() -> Self {
        Self {
            key: String::new(),
            ordinal: 0,
        }
    }

    pub fn parse(raw: Option<&RevisionField>) -> Self {
        match raw {
            None => Self::empty(),
            Some(RevisionField::Text(text)) => {
                let key = text.trim().to_string();
                let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
                // Digit runs past i64 saturate instead of sorting as revision zero.
                let ordinal = if digits.is_empty() {
                    0
                } else {
                    digits.parse::<i64>().unwrap_or(i64::MAX)
                };
                Self { key, ordinal }
            }
            Some(RevisionField::Number(number)) => {
                let ordinal = if let Some(n) = number.as_i64() {
                    Some(n)
                } else {
                    number
                        .as_f64()
                        .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                        .map(|f| f.trunc() as i64)
                };
                match ordinal {
                    Some(n) => Self {
                        key: format!("{n:03}"),
                        ordinal: n,
                    },
                    None => Self::empty(),
                }
            }
        }
    }
}

/// One bid announcement as returned by `getBidPblancListInfoServcPPSSrch`.
///
/// Fields the collector reasons about are typed; everything else the API returns is kept
/// verbatim in `extra` so the stored document carries the complete upstream record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BidAnnouncement {
    #[serde(rename = "bidNtceNo", default, deserialize_with = "de_opt_text")]
    pub announcement_no: Option<String>,
    #[serde(rename = "bidNtceOrd", default)]
    pub revision: Option<RevisionField>,
    #[serde(rename = "bidNtceNm", default, deserialize_with = "de_opt_text")]
    pub title: Option<String>,
    #[serde(rename = "ntceInsttNm", default, deserialize_with = "de_opt_text")]
    pub notice_org: Option<String>,
    #[serde(rename = "dminsttNm", default, deserialize_with = "de_opt_text")]
    pub demand_org: Option<String>,
    #[serde(rename = "bidNtceDt", default, deserialize_with = "de_opt_datetime")]
    pub announced_at: Option<NaiveDateTime>,
    #[serde(rename = "presmptPrce", default, deserialize_with = "de_opt_text")]
    pub estimated_price: Option<String>,
    #[serde(rename = "VAT", default, deserialize_with = "de_opt_text")]
    pub vat: Option<String>,
    #[serde(rename = "bidNtceDtlUrl", default, deserialize_with = "de_opt_text")]
    pub detail_url: Option<String>,
    #[serde(rename = "untyNtceNo", default, deserialize_with = "de_opt_text")]
    pub unified_no: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl BidAnnouncement {
    /// Trimmed announcement number; empty when the record carries none.
    pub fn identifier(&self) -> &str {
        self.announcement_no.as_deref().map(str::trim).unwrap_or_default()
    }

    pub fn revision_key(&self) -> RevisionKey {
        RevisionKey::parse(self.revision.as_ref())
    }

    pub fn title_text(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    /// Organization shown to people reading the collection brief.
    pub fn organization(&self) -> &str {
        self.demand_org
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.notice_org.as_deref())
            .unwrap_or_default()
    }
}

/// An announcement plus auction-outcome data from the result endpoints.
///
/// Enrichment fields are omitted (not nulled) when unknown so that a merge upsert never
/// erases an outcome found by an earlier run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnrichedBid {
    #[serde(flatten)]
    pub bid: BidAnnouncement,
    #[serde(rename = "sucsfbidAmt", skip_serializing_if = "Option::is_none", default)]
    pub award_amount: Option<String>,
    #[serde(rename = "opengCorpInfo", skip_serializing_if = "Option::is_none", default)]
    pub winner_info: Option<String>,
    #[serde(rename = "bidClsfcNo", skip_serializing_if = "Option::is_none", default)]
    pub classification_no: Option<String>,
    #[serde(rename = "nobidRsn", skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
}

impl EnrichedBid {
    /// Lift any outcome fields the list API already returned out of `extra`.
    pub fn from_announcement(mut bid: BidAnnouncement) -> Self {
        let mut take = |name: &str| bid.extra.remove(name).and_then(json_text);
        let award_amount = take("sucsfbidAmt");
        let winner_info = take("opengCorpInfo");
        let classification_no = take("bidClsfcNo");
        let failure_reason = take("nobidRsn");
        Self {
            bid,
            award_amount,
            winner_info,
            classification_no,
            failure_reason,
        }
    }

    pub fn needs_enrichment(&self) -> bool {
        self.award_amount.is_none()
    }
}

/// Inclusive inquiry window in KST wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidWindow {
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl BidWindow {
    pub fn begin_param(&self) -> String {
        self.begin.format(INQUIRY_DATE_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format(INQUIRY_DATE_FORMAT).to_string()
    }
}

/// Split `[start, end]` into windows of at most `max_days` days with a one-minute gap
/// between consecutive windows. Returns no windows when `start >= end`.
pub fn plan_windows(start: NaiveDateTime, end: NaiveDateTime, max_days: u32) -> Vec<BidWindow> {
    let mut windows = Vec::new();
    if start >= end {
        return windows;
    }
    let span = Duration::days(i64::from(max_days.max(1))) - Duration::minutes(1);
    let mut begin = start;
    while begin <= end {
        let chunk_end = begin
            .checked_add_signed(span)
            .map_or(end, |candidate| candidate.min(end));
        windows.push(BidWindow {
            begin,
            end: chunk_end,
        });
        match chunk_end.checked_add_signed(Duration::minutes(1)) {
            Some(next) => begin = next,
            None => break,
        }
    }
    windows
}

/// Case-insensitive title filter. An empty keyword keeps everything.
pub fn filter_by_keyword(records: Vec<BidAnnouncement>, keyword: &str) -> Vec<BidAnnouncement> {
    let needle = keyword.trim().to_lowercase();
    if needle.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| r.title_text().to_lowercase().contains(&needle))
        .collect()
}

/// Revision keys to purge, per announcement identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleRevisionSet(BTreeMap<String, BTreeSet<String>>);

impl StaleRevisionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: &str, revision_key: &str) {
        if identifier.is_empty() || revision_key.is_empty() {
            return;
        }
        self.0
            .entry(identifier.to_string())
            .or_default()
            .insert(revision_key.to_string());
    }

    pub fn remove(&mut self, identifier: &str, revision_key: &str) {
        if let Some(keys) = self.0.get_mut(identifier) {
            keys.remove(revision_key);
            if keys.is_empty() {
                self.0.remove(identifier);
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&BTreeSet<String>> {
        self.0.get(identifier)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of revision keys across identifiers.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    pub fn document_keys(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(id, keys)| keys.iter().map(move |k| format!("{id}-{k}")))
            .collect()
    }
}

/// Metadata document written once per successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionWatermark {
    pub collected_at: DateTime<FixedOffset>,
    pub collected_date: NaiveDate,
    pub upserted_records: u64,
    #[serde(default)]
    pub total_upserted: u64,
    #[serde(default)]
    pub latest_bid_ntce_dt: Option<NaiveDateTime>,
}

/// Store key for a bid: `"{identifier}-{revision}"`, then `untyNtceNo`, then `auto-{index}`.
pub fn document_key(bid: &BidAnnouncement, index: usize) -> String {
    let revision = bid.revision_key();
    let key = format!("{}-{}", bid.identifier(), revision.key);
    let key = key.trim_matches('-');
    if !key.is_empty() {
        return key.to_string();
    }
    match bid.unified_no.as_deref().map(str::trim) {
        Some(unified) if !unified.is_empty() => unified.to_string(),
        _ => format!("auto-{index}"),
    }
}

/// Flatten an enriched bid into a store document with `collectedAt` stamped on it.
pub fn normalize_document(
    bid: &EnrichedBid,
    collected_at: DateTime<FixedOffset>,
) -> Result<JsonMap<String, JsonValue>, serde_json::Error> {
    let mut doc = match serde_json::to_value(bid)? {
        JsonValue::Object(map) => map,
        other => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    doc.insert(
        "collectedAt".to_string(),
        JsonValue::String(collected_at.to_rfc3339()),
    );
    Ok(doc)
}

fn json_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(json_text))
}

fn de_opt_datetime<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(raw)) => parse_bid_datetime(&raw),
        _ => None,
    })
}
