//! data.go.kr (G2B) API adapters: bid-list paging and auction-result lookups.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use g2b_core::{truncate_to_minute, BidAnnouncement, BidWindow, INQUIRY_DATE_FORMAT};
use g2b_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "g2b-adapters";

pub const BID_LIST_URL: &str =
    "https://apis.data.go.kr/1230000/ad/BidPublicInfoService/getBidPblancListInfoServcPPSSrch";
pub const AWARD_STATUS_URL: &str =
    "https://apis.data.go.kr/1230000/as/ScsbidInfoService/getScsbidListSttusServc";
pub const OPENING_RESULT_URL: &str =
    "https://apis.data.go.kr/1230000/as/ScsbidInfoService/getOpengResultListInfoServcPPSSrch";
pub const FAILED_BID_URL: &str =
    "https://apis.data.go.kr/1230000/as/ScsbidInfoService/getOpengResultListInfoFailing";

/// Classification of the `resultCode` carried in every data.go.kr response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCodeClass {
    Success,
    NoData,
    /// Upstream hiccup (gateway HTTP error, service timeout); read as an empty page.
    Transient,
    /// Key unregistered, expired, denied or IP-restricted.
    Auth,
    Upstream,
}

pub fn classify_result_code(code: &str) -> ResultCodeClass {
    match code.trim() {
        "00" | "0" => ResultCodeClass::Success,
        "03" => ResultCodeClass::NoData,
        "04" | "05" => ResultCodeClass::Transient,
        "20" | "30" | "31" | "32" => ResultCodeClass::Auth,
        _ => ResultCodeClass::Upstream,
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("upstream rejected credentials (resultCode {code}): {message}")]
    Auth { code: String, message: String },
    #[error("upstream error (resultCode {code}): {message}")]
    Upstream { code: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl PageError {
    /// Auth and unexpected result codes abort the run; everything else only ends the window.
    pub fn is_fatal(&self) -> bool {
        match self {
            PageError::Auth { .. } | PageError::Upstream { .. } => true,
            PageError::Fetch(err) => err.is_unauthorized(),
            PageError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: EnvelopeResponse,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResponse {
    header: EnvelopeHeader,
    #[serde(default)]
    body: Option<EnvelopeBody>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    #[serde(rename = "resultCode")]
    result_code: String,
    #[serde(rename = "resultMsg", default)]
    result_msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeBody {
    #[serde(default)]
    items: Option<JsonValue>,
}

/// Items of a successful response; empty for the no-data and transient codes.
fn decode_items(body: &[u8]) -> Result<Vec<JsonMap<String, JsonValue>>, PageError> {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(json_err) => {
            return Err(match gateway_reason_code(body) {
                Some((code, message)) => result_code_error(code, message),
                None => PageError::Decode(json_err.to_string()),
            });
        }
    };

    let header = envelope.response.header;
    match classify_result_code(&header.result_code) {
        ResultCodeClass::Success => {}
        ResultCodeClass::NoData => return Ok(Vec::new()),
        ResultCodeClass::Transient => {
            warn!(
                code = %header.result_code,
                message = %header.result_msg,
                "transient upstream result code; treating as empty"
            );
            return Ok(Vec::new());
        }
        ResultCodeClass::Auth | ResultCodeClass::Upstream => {
            return Err(result_code_error(header.result_code, header.result_msg));
        }
    }

    let items = envelope.response.body.unwrap_or_default().items;
    Ok(match items {
        Some(JsonValue::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Some(JsonValue::Object(map)) => vec![map],
        _ => Vec::new(),
    })
}

fn result_code_error(code: String, message: String) -> PageError {
    if classify_result_code(&code) == ResultCodeClass::Auth {
        PageError::Auth { code, message }
    } else {
        PageError::Upstream { code, message }
    }
}

/// The data.go.kr gateway answers key problems with an XML envelope regardless of `type=json`.
fn gateway_reason_code(body: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(body).ok()?;
    let code = xml_tag(text, "returnReasonCode")?;
    let message = xml_tag(text, "returnAuthMsg")
        .or_else(|| xml_tag(text, "errMsg"))
        .unwrap_or_default();
    Some((code, message))
}

fn xml_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

/// Decode one bid-list page into announcements. Items that do not decode are skipped.
pub fn parse_bid_page(body: &[u8]) -> Result<Vec<BidAnnouncement>, PageError> {
    Ok(decode_items(body)?
        .into_iter()
        .filter_map(|item| {
            let bid_no = item_text(&item, "bidNtceNo").unwrap_or_default();
            match serde_json::from_value(JsonValue::Object(item)) {
                Ok(bid) => Some(bid),
                Err(err) => {
                    warn!(bid_id = %bid_no, error = %err, "undecodable bid item skipped");
                    None
                }
            }
        })
        .collect())
}

/// The configured key may be stored URL-encoded (as data.go.kr hands it out); the HTTP
/// layer encodes query values itself, so decode it once here.
pub fn decode_service_key(key: &str) -> String {
    let key = key.trim();
    if !key.contains('%') {
        return key.to_string();
    }
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Upper bound for the result endpoints' look-back.
pub const MAX_LOOKUP_LOOKBACK_DAYS: i64 = 3650;

/// Query of one bid-list page.
pub fn bid_list_query(
    service_key: &str,
    window: &BidWindow,
    keyword: &str,
    page: u32,
    rows_per_page: u32,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("serviceKey", service_key.to_string()),
        ("pageNo", page.to_string()),
        ("numOfRows", rows_per_page.to_string()),
        ("type", "json".to_string()),
        ("inqryDiv", "1".to_string()),
        ("inqryBgnDt", window.begin_param()),
        ("inqryEndDt", window.end_param()),
    ];
    if !keyword.trim().is_empty() {
        query.push(("bidNtceNm", keyword.trim().to_string()));
    }
    query
}

/// Inquiry range of the result endpoints: `lookback_days` (clamped to
/// `1..=MAX_LOOKUP_LOOKBACK_DAYS`) ending at `now`, truncated to the minute.
pub fn lookup_range(now: NaiveDateTime, lookback_days: i64) -> (String, String) {
    let end = truncate_to_minute(now);
    let days = lookback_days.clamp(1, MAX_LOOKUP_LOOKBACK_DAYS);
    let begin = end
        .checked_sub_signed(Duration::days(days))
        .unwrap_or(NaiveDateTime::MIN);
    (
        begin.format(INQUIRY_DATE_FORMAT).to_string(),
        end.format(INQUIRY_DATE_FORMAT).to_string(),
    )
}

/// Which auction-result endpoint a lookup goes to, with its endpoint-specific parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLookup {
    AwardStatus,
    OpeningResult,
    FailedBid { classification_no: String },
}

impl ResultLookup {
    fn params(&self) -> (&'static str, String) {
        match self {
            ResultLookup::AwardStatus => ("inqryDiv", "4".to_string()),
            ResultLookup::OpeningResult => ("inqryDiv", "3".to_string()),
            ResultLookup::FailedBid { classification_no } => {
                ("bidClsfcNo", classification_no.clone())
            }
        }
    }
}

/// Query of a single-row result lookup for `bid_no`.
pub fn lookup_query(
    service_key: &str,
    lookup: &ResultLookup,
    bid_no: &str,
    range: (String, String),
) -> Vec<(&'static str, String)> {
    let (begin, end) = range;
    vec![
        ("serviceKey", service_key.to_string()),
        ("pageNo", "1".to_string()),
        ("numOfRows", "1".to_string()),
        ("type", "json".to_string()),
        ("bidNtceNo", bid_no.to_string()),
        ("inqryBgnDt", begin),
        ("inqryEndDt", end),
        lookup.params(),
    ]
}

#[derive(Debug, Clone)]
pub struct G2bClientConfig {
    pub service_key: String,
    /// Look-back for the result endpoints' mandatory inquiry range.
    pub lookup_lookback_days: i64,
    pub bid_list_url: String,
    pub award_status_url: String,
    pub opening_result_url: String,
    pub failed_bid_url: String,
}

impl G2bClientConfig {
    pub fn new(service_key: &str) -> Self {
        Self {
            service_key: decode_service_key(service_key),
            lookup_lookback_days: 730,
            bid_list_url: BID_LIST_URL.to_string(),
            award_status_url: AWARD_STATUS_URL.to_string(),
            opening_result_url: OPENING_RESULT_URL.to_string(),
            failed_bid_url: FAILED_BID_URL.to_string(),
        }
    }
}

/// One page of the bid list, as the collector sees it.
#[async_trait]
pub trait BidSource: Send + Sync {
    async fn fetch_page(
        &self,
        window: &BidWindow,
        keyword: &str,
        page: u32,
        rows_per_page: u32,
    ) -> Result<Vec<BidAnnouncement>, PageError>;

    /// Throttle between page requests.
    async fn pause(&self) {}
}

/// Follow-up lookups on the auction-result endpoints. Failures resolve to `None`.
#[async_trait]
pub trait AwardLookup: Send + Sync {
    async fn award_amount(&self, bid_no: &str) -> Option<String>;
    async fn opening_result(&self, bid_no: &str) -> Option<OpeningResult>;
    async fn failure_reason(&self, bid_no: &str, classification_no: &str) -> Option<String>;

    async fn pause(&self) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpeningResult {
    pub winner_info: Option<String>,
    pub classification_no: Option<String>,
}

pub struct G2bClient {
    http: Arc<HttpFetcher>,
    config: G2bClientConfig,
}

impl G2bClient {
    pub fn new(http: Arc<HttpFetcher>, config: G2bClientConfig) -> Self {
        Self { http, config }
    }

    /// First item of a single-row lookup. Any failure is logged and read as "no data".
    async fn lookup_first_item(
        &self,
        lookup: ResultLookup,
        bid_no: &str,
    ) -> Option<JsonMap<String, JsonValue>> {
        let url = match lookup {
            ResultLookup::AwardStatus => &self.config.award_status_url,
            ResultLookup::OpeningResult => &self.config.opening_result_url,
            ResultLookup::FailedBid { .. } => &self.config.failed_bid_url,
        };
        let range = lookup_range(
            g2b_core::now_kst().naive_local(),
            self.config.lookup_lookback_days,
        );
        let query = lookup_query(&self.config.service_key, &lookup, bid_no, range);

        let response = match self.http.get(url, &query).await {
            Ok(response) => response,
            Err(err) => {
                warn!(bid_id = bid_no, error = %err, "result lookup failed");
                return None;
            }
        };
        match decode_items(&response.body) {
            Ok(items) => items.into_iter().next(),
            Err(err) => {
                warn!(bid_id = bid_no, error = %err, "result lookup returned no usable data");
                None
            }
        }
    }
}

fn item_text(item: &JsonMap<String, JsonValue>, field: &str) -> Option<String> {
    match item.get(field)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl BidSource for G2bClient {
    async fn fetch_page(
        &self,
        window: &BidWindow,
        keyword: &str,
        page: u32,
        rows_per_page: u32,
    ) -> Result<Vec<BidAnnouncement>, PageError> {
        let query = bid_list_query(
            &self.config.service_key,
            window,
            keyword,
            page,
            rows_per_page,
        );
        let response = self.http.get(&self.config.bid_list_url, &query).await?;
        parse_bid_page(&response.body)
    }

    async fn pause(&self) {
        self.http.pause().await;
    }
}

#[async_trait]
impl AwardLookup for G2bClient {
    async fn award_amount(&self, bid_no: &str) -> Option<String> {
        let item = self
            .lookup_first_item(ResultLookup::AwardStatus, bid_no)
            .await?;
        item_text(&item, "sucsfbidAmt")
    }

    async fn opening_result(&self, bid_no: &str) -> Option<OpeningResult> {
        let item = self
            .lookup_first_item(ResultLookup::OpeningResult, bid_no)
            .await?;
        Some(OpeningResult {
            winner_info: item_text(&item, "opengCorpInfo"),
            classification_no: item_text(&item, "bidClsfcNo"),
        })
    }

    async fn failure_reason(&self, bid_no: &str, classification_no: &str) -> Option<String> {
        let lookup = ResultLookup::FailedBid {
            classification_no: classification_no.to_string(),
        };
        let item = self.lookup_first_item(lookup, bid_no).await?;
        item_text(&item, "nobidRsn")
    }

    async fn pause(&self) {
        self.http.pause().await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PagingConfig {
    pub rows_per_page: u32,
    /// Guard against a server that never returns an empty page.
    pub max_pages: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            rows_per_page: 50,
            max_pages: 200,
        }
    }
}

/// Every page for `window`, until a page comes back empty.
///
/// Fatal page errors propagate. Any other page failure is logged and ends the window with
/// what was gathered so far. Every request after the first is preceded by
/// `BidSource::pause`; callers fetching several windows pause between them.
pub async fn fetch_window(
    source: &dyn BidSource,
    window: &BidWindow,
    keyword: &str,
    paging: PagingConfig,
) -> Result<Vec<BidAnnouncement>, PageError> {
    let mut collected = Vec::new();
    let mut page = 1u32;
    loop {
        if page > paging.max_pages {
            warn!(
                window_begin = %window.begin_param(),
                max_pages = paging.max_pages,
                "page limit reached; remaining pages skipped"
            );
            break;
        }
        if page > 1 {
            source.pause().await;
        }
        let rows = match source
            .fetch_page(window, keyword, page, paging.rows_per_page)
            .await
        {
            Ok(rows) => rows,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(page, window_begin = %window.begin_param(), error = %err, "page request failed; ending window");
                break;
            }
        };
        if rows.is_empty() {
            break;
        }
        collected.extend(rows);
        debug!(page, total = collected.len(), "page received");
        page += 1;
    }
    info!(
        window_begin = %window.begin_param(),
        window_end = %window.end_param(),
        records = collected.len(),
        "window fetched"
    );
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn body(value: JsonValue) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn envelope(code: &str, items: JsonValue) -> Vec<u8> {
        body(json!({
            "response": {
                "header": {"resultCode": code, "resultMsg": "msg"},
                "body": {"items": items, "totalCount": 0}
            }
        }))
    }

    fn window() -> BidWindow {
        let begin = NaiveDateTime::parse_from_str("2025-01-01 00:00", "%Y-%m-%d %H:%M").unwrap();
        BidWindow {
            begin,
            end: begin + Duration::days(1),
        }
    }

    #[test]
    fn result_codes_are_classified() {
        assert_eq!(classify_result_code("00"), ResultCodeClass::Success);
        assert_eq!(classify_result_code("03"), ResultCodeClass::NoData);
        assert_eq!(classify_result_code("05"), ResultCodeClass::Transient);
        assert_eq!(classify_result_code("30"), ResultCodeClass::Auth);
        assert_eq!(classify_result_code("99"), ResultCodeClass::Upstream);
        assert_eq!(classify_result_code("22"), ResultCodeClass::Upstream);
    }

    #[test]
    fn success_page_decodes_list_and_single_object_items() {
        let list = envelope(
            "00",
            json!([{"bidNtceNo": "A1", "bidNtceOrd": "000"}, {"bidNtceNo": "A2"}]),
        );
        assert_eq!(parse_bid_page(&list).unwrap().len(), 2);

        let single = envelope("00", json!({"bidNtceNo": "A1", "bidNtceNm": "AX"}));
        let rows = parse_bid_page(&single).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title.as_deref(), Some("AX"));

        let absent = body(json!({"response": {"header": {"resultCode": "00"}, "body": {}}}));
        assert!(parse_bid_page(&absent).unwrap().is_empty());

        let empty_string = envelope("00", json!(""));
        assert!(parse_bid_page(&empty_string).unwrap().is_empty());
    }

    #[test]
    fn no_data_and_transient_codes_are_empty_pages() {
        assert!(parse_bid_page(&envelope("03", json!(null))).unwrap().is_empty());
        assert!(parse_bid_page(&envelope("04", json!(null))).unwrap().is_empty());
    }

    #[test]
    fn unexpected_result_code_is_fatal_upstream_error() {
        let err = parse_bid_page(&envelope("99", json!([]))).unwrap_err();
        assert!(matches!(err, PageError::Upstream { ref code, .. } if code == "99"));
        assert!(err.is_fatal());
    }

    #[test]
    fn auth_result_code_is_fatal() {
        let err = parse_bid_page(&envelope("30", json!([]))).unwrap_err();
        assert!(matches!(err, PageError::Auth { .. }));
        assert!(err.is_fatal());

        let http = PageError::Fetch(FetchError::HttpStatus { status: 401, url: "u".into() });
        assert!(http.is_fatal());
        let http = PageError::Fetch(FetchError::HttpStatus { status: 500, url: "u".into() });
        assert!(!http.is_fatal());
    }

    #[test]
    fn gateway_xml_errors_are_classified() {
        let xml = br#"<OpenAPI_ServiceResponse><cmmMsgHeader><errMsg>SERVICE ERROR</errMsg><returnAuthMsg>SERVICE_KEY_IS_NOT_REGISTERED_ERROR</returnAuthMsg><returnReasonCode>30</returnReasonCode></cmmMsgHeader></OpenAPI_ServiceResponse>"#;
        let err = parse_bid_page(xml).unwrap_err();
        match err {
            PageError::Auth { code, message } => {
                assert_eq!(code, "30");
                assert_eq!(message, "SERVICE_KEY_IS_NOT_REGISTERED_ERROR");
            }
            other => panic!("expected auth error, got {other:?}"),
        }

        let garbage = parse_bid_page(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(garbage, PageError::Decode(_)));
        assert!(!garbage.is_fatal());
    }

    #[test]
    fn undecodable_items_are_skipped_not_the_page() {
        let page = envelope(
            "00",
            json!([
                {"bidNtceNo": "A1", "bidNtceOrd": "000"},
                {"bidNtceNo": "BAD", "bidNtceOrd": true},
                {"bidNtceNo": "A3", "bidNtceOrd": 1}
            ]),
        );
        let rows = parse_bid_page(&page).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.identifier()).collect();
        assert_eq!(ids, vec!["A1", "A3"]);
    }

    fn query_value<'a>(query: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        query
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn bid_list_query_carries_window_and_keyword() {
        let window = BidWindow {
            begin: NaiveDateTime::parse_from_str("2025-01-01 00:00:30", "%Y-%m-%d %H:%M:%S")
                .unwrap(),
            end: NaiveDateTime::parse_from_str("2025-01-03 23:59", "%Y-%m-%d %H:%M").unwrap(),
        };
        let config = G2bClientConfig::new("abc%2Bdef%3D%3D");
        let query = bid_list_query(&config.service_key, &window, " AX ", 2, 50);
        assert_eq!(query_value(&query, "serviceKey"), Some("abc+def=="));
        assert_eq!(query_value(&query, "pageNo"), Some("2"));
        assert_eq!(query_value(&query, "numOfRows"), Some("50"));
        assert_eq!(query_value(&query, "type"), Some("json"));
        assert_eq!(query_value(&query, "inqryDiv"), Some("1"));
        assert_eq!(query_value(&query, "inqryBgnDt"), Some("202501010000"));
        assert_eq!(query_value(&query, "inqryEndDt"), Some("202501032359"));
        assert_eq!(query_value(&query, "bidNtceNm"), Some("AX"));

        let unfiltered = bid_list_query(&config.service_key, &window, "  ", 1, 50);
        assert_eq!(query_value(&unfiltered, "bidNtceNm"), None);
    }

    #[test]
    fn lookup_queries_carry_endpoint_parameters() {
        let range = ("202301010000".to_string(), "202501010000".to_string());
        let award = lookup_query("key", &ResultLookup::AwardStatus, "R25BK001", range.clone());
        assert_eq!(query_value(&award, "inqryDiv"), Some("4"));
        assert_eq!(query_value(&award, "bidNtceNo"), Some("R25BK001"));
        assert_eq!(query_value(&award, "numOfRows"), Some("1"));
        assert_eq!(query_value(&award, "inqryBgnDt"), Some("202301010000"));

        let opening = lookup_query("key", &ResultLookup::OpeningResult, "R25BK001", range.clone());
        assert_eq!(query_value(&opening, "inqryDiv"), Some("3"));

        let failed = ResultLookup::FailedBid { classification_no: "2".into() };
        let failed = lookup_query("key", &failed, "R25BK001", range);
        assert_eq!(query_value(&failed, "bidClsfcNo"), Some("2"));
        assert_eq!(query_value(&failed, "inqryDiv"), None);
    }

    #[test]
    fn lookup_range_is_clamped() {
        let now = NaiveDateTime::parse_from_str("2025-01-08 09:15:42", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(
            lookup_range(now, 730),
            ("202301090915".to_string(), "202501080915".to_string())
        );
        assert_eq!(lookup_range(now, 0).0, "202501070915");
        let (begin, _) = lookup_range(now, i64::MAX);
        assert_eq!(begin, "201501110915");
    }

    #[test]
    fn service_key_is_decoded_once() {
        assert_eq!(decode_service_key("abc%2Bdef%3D%3D"), "abc+def==");
        assert_eq!(decode_service_key(" plain+key== "), "plain+key==");
        assert_eq!(decode_service_key("trailing%2"), "trailing%2");
    }

    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Vec<BidAnnouncement>, PageError>>>,
        requested: Mutex<Vec<u32>>,
        pauses: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Vec<BidAnnouncement>, PageError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requested: Mutex::new(Vec::new()),
                pauses: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BidSource for ScriptedSource {
        async fn fetch_page(
            &self,
            _window: &BidWindow,
            _keyword: &str,
            page: u32,
            _rows_per_page: u32,
        ) -> Result<Vec<BidAnnouncement>, PageError> {
            self.requested.lock().unwrap().push(page);
            self.pages.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn bids(n: usize) -> Vec<BidAnnouncement> {
        (0..n)
            .map(|i| BidAnnouncement {
                announcement_no: Some(format!("B{i}")),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn fetch_window_pages_until_empty() {
        let source = ScriptedSource::new(vec![Ok(bids(2)), Ok(bids(1)), Ok(Vec::new())]);
        let rows = fetch_window(&source, &window(), "AX", PagingConfig::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(source.pauses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_empty_page_needs_no_pause() {
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let rows = fetch_window(&source, &window(), "AX", PagingConfig::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(source.pauses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_window_ends_on_recoverable_page_error() {
        let source = ScriptedSource::new(vec![
            Ok(bids(2)),
            Err(PageError::Decode("truncated".into())),
            Ok(bids(5)),
        ]);
        let rows = fetch_window(&source, &window(), "AX", PagingConfig::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2]);
        assert_eq!(source.pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_window_propagates_fatal_errors() {
        let source = ScriptedSource::new(vec![
            Ok(bids(2)),
            Err(PageError::Upstream { code: "99".into(), message: "boom".into() }),
        ]);
        let err = fetch_window(&source, &window(), "AX", PagingConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn fetch_window_respects_page_limit() {
        let source = ScriptedSource::new(vec![Ok(bids(1)), Ok(bids(1)), Ok(bids(1))]);
        let paging = PagingConfig { rows_per_page: 1, max_pages: 2 };
        let rows = fetch_window(&source, &window(), "", paging).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(source.pauses.load(Ordering::SeqCst), 1);
    }
}
