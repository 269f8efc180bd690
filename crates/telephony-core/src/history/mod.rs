//! # Call History Query Service
//!
//! Read-only, paginated view over call records, newest first. Periods are
//! calendar-aligned in the tenant's timezone.
//!
//! A first request pins a snapshot: the highest record `seq` visible at that
//! moment. Later pages only see records up to the snapshot, and cursors
//! continue strictly after the last `(started_at, seq)` returned, so inserts
//! made while a client pages never shift, skip or repeat rows. Numbered
//! pages pin the period start the same way through `since_ms`, so a day
//! boundary passing between two pages does not change the filtered set.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::HistoryConfig;
use crate::error::{Result, TelephonyError};
use crate::store::{CallRecordFilter, CallRecordStore, CatalogStore};
use crate::types::{CallRecord, TenantId};

/// Time window of a history query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Today,
    Week,
    Month,
    Year,
    #[default]
    All,
}

impl Period {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "today" => Some(Period::Today),
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            "year" => Some(Period::Year),
            "all" => Some(Period::All),
            _ => None,
        }
    }

    /// Inclusive start of the period containing `now`, as seen in `tz`
    pub fn start(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&tz).date_naive();
        let first_day = match self {
            Period::All => return None,
            Period::Today => today,
            Period::Week => today - Duration::days(today.weekday().num_days_from_monday() as i64),
            Period::Month => today.with_day(1)?,
            Period::Year => NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
        };
        Some(local_midnight(first_day, tz))
    }
}

/// First instant of `date` in `tz`
fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let mut naive = date.and_time(chrono::NaiveTime::MIN);
    // A DST gap can swallow midnight; the day then starts at the first valid hour
    for _ in 0..3 {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => naive += Duration::hours(1),
        }
    }
    Utc.from_utc_datetime(&naive)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    /// 1-based page number, ignored when `cursor` is set
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub period: Period,
    /// Opaque continuation token from a previous page
    pub cursor: Option<String>,
    /// Snapshot from a previous page, for `page`-based paging
    pub snapshot: Option<i64>,
    /// Period start from a previous page, in epoch milliseconds
    pub since_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<CallRecord>,
    pub has_more: bool,
    /// Size of the filtered set at the snapshot
    pub total_count: i64,
    pub next_cursor: Option<String>,
    pub snapshot: i64,
    /// Period start the page was filtered from, `None` for all time
    pub since_ms: Option<i64>,
    pub limit: u32,
}

/// Decoded continuation token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    since_ms: Option<i64>,
    started_at_ms: i64,
    seq: i64,
    snapshot: i64,
}

impl Cursor {
    fn encode(&self) -> String {
        let since = self.since_ms.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        let raw = format!("v1:{}:{}:{}:{}", since, self.started_at_ms, self.seq, self.snapshot);
        URL_SAFE_NO_PAD.encode(raw)
    }

    fn decode(token: &str) -> Result<Self> {
        let invalid = || TelephonyError::validation("invalid history cursor");
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let parts: Vec<&str> = raw.split(':').collect();
        let [version, since, started_at_ms, seq, snapshot] = parts.as_slice() else {
            return Err(invalid());
        };
        if *version != "v1" {
            return Err(invalid());
        }
        let since_ms = match *since {
            "-" => None,
            value => Some(value.parse().map_err(|_| invalid())?),
        };
        Ok(Self {
            since_ms,
            started_at_ms: started_at_ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
            snapshot: snapshot.parse().map_err(|_| invalid())?,
        })
    }
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TelephonyError::validation("invalid history cursor"))
}

pub struct CallHistoryService {
    records: Arc<dyn CallRecordStore>,
    catalog: Arc<dyn CatalogStore>,
    config: HistoryConfig,
}

impl CallHistoryService {
    pub fn new(
        records: Arc<dyn CallRecordStore>,
        catalog: Arc<dyn CatalogStore>,
        config: HistoryConfig,
    ) -> Self {
        Self {
            records,
            catalog,
            config,
        }
    }

    pub async fn list(&self, tenant_id: TenantId, query: &HistoryQuery) -> Result<HistoryPage> {
        self.list_at(tenant_id, query, Utc::now()).await
    }

    /// [`list`](Self::list) with an explicit clock
    pub async fn list_at(
        &self,
        tenant_id: TenantId,
        query: &HistoryQuery,
        now: DateTime<Utc>,
    ) -> Result<HistoryPage> {
        let limit = query
            .limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit);

        let (since, snapshot, after, offset) = match &query.cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                let since = cursor.since_ms.map(from_ms).transpose()?;
                let after = (from_ms(cursor.started_at_ms)?, cursor.seq);
                (since, cursor.snapshot, Some(after), 0)
            }
            None => {
                let since = match query.since_ms {
                    Some(ms) => Some(
                        DateTime::from_timestamp_millis(ms)
                            .ok_or_else(|| TelephonyError::validation("invalid history period start"))?,
                    ),
                    None => query.period.start(now, self.timezone(tenant_id).await?),
                };
                let snapshot = match query.snapshot {
                    Some(snapshot) => snapshot,
                    None => self.records.max_seq(tenant_id).await?,
                };
                let page = query.page.unwrap_or(1).max(1);
                (since, snapshot, None, (page - 1).saturating_mul(limit))
            }
        };

        let filter = CallRecordFilter {
            tenant_id,
            since,
            max_seq: snapshot,
            after,
            offset,
            limit: limit + 1,
        };
        let mut records = self.records.query_call_records(&filter).await?;
        let total_count = self.records.count_call_records(&filter).await?;

        let has_more = records.len() > limit as usize;
        records.truncate(limit as usize);
        let next_cursor = match records.last() {
            Some(last) if has_more => Some(
                Cursor {
                    since_ms: since.map(|t| t.timestamp_millis()),
                    started_at_ms: last.started_at.timestamp_millis(),
                    seq: last.seq,
                    snapshot,
                }
                .encode(),
            ),
            _ => None,
        };

        debug!(tenant_id, returned = records.len(), total_count, has_more, "History page");
        Ok(HistoryPage {
            records,
            has_more,
            total_count,
            next_cursor,
            snapshot,
            since_ms: since.map(|t| t.timestamp_millis()),
            limit,
        })
    }

    async fn timezone(&self, tenant_id: TenantId) -> Result<Tz> {
        let default = || {
            self.config
                .default_timezone
                .parse::<Tz>()
                .map_err(|_| TelephonyError::Config(format!("unknown timezone '{}'", self.config.default_timezone)))
        };
        match self.catalog.tenant_timezone(tenant_id).await? {
            Some(name) => match name.parse::<Tz>() {
                Ok(tz) => Ok(tz),
                Err(_) => {
                    warn!(tenant_id, timezone = %name, "Stored timezone is unknown, using default");
                    default()
                }
            },
            None => default(),
        }
    }
}
