//! Alert-source backend contract and the SkyPortal HTTP client.
//!
//! The correlation loop talks to the backend exclusively through the
//! [`AlertSource`] trait; [`SkyPortalClient`] is the production
//! implementation. List endpoints are paginated by page number with a
//! reported total-match count terminating the walk.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::crossmatch::types::{PhotometryPoint, TransientObject};
use crate::error::CrossmatchError;

const CALL_TIMEOUT: Duration = Duration::from_secs(40);
const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_secs(5);
const PAGE_SIZE: usize = 1000;
const PAGE_DELAY: Duration = Duration::from_millis(300);

/// A notice event as returned by the event query, localizations ordered
/// most-recent-first.
#[derive(Debug, Clone)]
pub struct NoticeEvent {
    pub event_id: String,
    pub dateobs: DateTime<Utc>,
    pub alias: String,
    pub localizations: Vec<LocalizationRef>,
}

/// Pointer to one downloadable localization of an event.
#[derive(Debug, Clone)]
pub struct LocalizationRef {
    /// Raw dateobs key as used in download paths.
    pub dateobs_key: String,
    pub dateobs: DateTime<Utc>,
    pub name: String,
}

/// Filter for the paginated object query.
#[derive(Debug, Clone)]
pub struct ObjectQuery {
    pub start_time: DateTime<Utc>,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instrument {
    pub name: String,
    #[serde(default)]
    pub telescope: Option<TelescopeRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelescopeRef {
    pub name: String,
}

/// Pull interface to the alert backend.
#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Cheap probe that the backend is up at all (no auth involved).
    async fn check_liveness(&self) -> Result<(), CrossmatchError>;

    /// Probe that our token is accepted.
    async fn check_auth(&self) -> Result<(), CrossmatchError>;

    /// Events with a qualifying localization observed since `since`.
    async fn list_events(&self, since: DateTime<Utc>)
        -> Result<Vec<NoticeEvent>, CrossmatchError>;

    /// All objects matching the filter, across every page.
    async fn list_objects(
        &self,
        query: &ObjectQuery,
    ) -> Result<Vec<TransientObject>, CrossmatchError>;

    /// Full (unordered) photometry of one object.
    async fn fetch_photometry(
        &self,
        object_id: &str,
    ) -> Result<Vec<PhotometryPoint>, CrossmatchError>;

    /// Raw probability-grid bytes of one localization.
    async fn download_localization(
        &self,
        dateobs_key: &str,
        name: &str,
    ) -> Result<Vec<u8>, CrossmatchError>;

    async fn list_instruments(&self) -> Result<Vec<Instrument>, CrossmatchError>;
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_matches: usize,
}

/// Walk a paginated endpoint until the accumulated count meets the reported
/// total. `fetch_page` receives 1-based page numbers; `page_delay` is the
/// pause between successive fetches.
pub async fn collect_pages<T, F, Fut>(
    mut fetch_page: F,
    page_delay: Duration,
) -> Result<Vec<T>, CrossmatchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Page<T>, CrossmatchError>>,
{
    let mut items = Vec::new();
    let mut page_number = 1;
    loop {
        let mut page = fetch_page(page_number).await?;
        if page.items.is_empty() && page.total_matches > items.len() {
            // a stalled page would otherwise loop forever
            return Err(CrossmatchError::MalformedResponse(format!(
                "page {page_number} returned no items but {} matches remain",
                page.total_matches - items.len()
            )));
        }
        let total = page.total_matches;
        items.append(&mut page.items);
        if total <= items.len() {
            return Ok(items);
        }
        page_number += 1;
        tokio::time::sleep(page_delay).await;
    }
}

/// HTTP client for a SkyPortal-style backend.
#[derive(Clone)]
pub struct SkyPortalClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl SkyPortalClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, CrossmatchError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| CrossmatchError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// GET an endpoint and unwrap the `{status, data, message}` envelope.
    async fn get_data(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, CrossmatchError> {
        let started = Instant::now();
        let response = self
            .http
            .get(self.url(endpoint))
            .header("Authorization", format!("token {}", self.token))
            .query(params)
            .send()
            .await?;
        let latency = started.elapsed();
        if latency > SLOW_RESPONSE_THRESHOLD {
            log::warn!(
                "⏳ backend responding slowly to {endpoint}: {:.2}s",
                latency.as_secs_f64()
            );
        }

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CrossmatchError::Auth(format!(
                "{endpoint} rejected our token ({status})"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CrossmatchError::MalformedResponse(e.to_string()))?;
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("server error")
                .to_string();
            return Err(if status.is_server_error() {
                CrossmatchError::Unavailable(message)
            } else {
                CrossmatchError::MalformedResponse(message)
            });
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| CrossmatchError::MalformedResponse("missing data envelope".to_string()))
    }

    async fn fetch_page(
        &self,
        endpoint: &str,
        mut params: Vec<(String, String)>,
        page_number: usize,
        item_key: &str,
    ) -> Result<Page<Value>, CrossmatchError> {
        params.push(("pageNumber".to_string(), page_number.to_string()));
        params.push(("numPerPage".to_string(), PAGE_SIZE.to_string()));
        let data = self.get_data(endpoint, &params).await?;
        let total_matches = data
            .get("totalMatches")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                CrossmatchError::MalformedResponse(format!("{endpoint}: missing totalMatches"))
            })? as usize;
        let items = data
            .get(item_key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                CrossmatchError::MalformedResponse(format!("{endpoint}: missing {item_key} array"))
            })?;
        Ok(Page {
            items,
            total_matches,
        })
    }

    async fn fetch_all_pages(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
        item_key: &'static str,
    ) -> Result<Vec<Value>, CrossmatchError> {
        let client = self.clone();
        let endpoint = endpoint.to_string();
        collect_pages(
            move |page_number| {
                let client = client.clone();
                let endpoint = endpoint.clone();
                let params = params.clone();
                async move {
                    client
                        .fetch_page(&endpoint, params, page_number, item_key)
                        .await
                }
            },
            PAGE_DELAY,
        )
        .await
    }
}

/// Format a timestamp the way the backend keys events.
fn format_dateobs(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Backend timestamps arrive as naive ISO strings, with or without
/// fractional seconds.
fn parse_dateobs(raw: &str) -> Option<DateTime<Utc>> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_event(value: &Value) -> Result<NoticeEvent, CrossmatchError> {
    let event_id = value
        .get("dateobs")
        .and_then(Value::as_str)
        .ok_or_else(|| CrossmatchError::MalformedResponse("event without dateobs".to_string()))?
        .to_string();
    let dateobs = parse_dateobs(&event_id).ok_or_else(|| {
        CrossmatchError::MalformedResponse(format!("unparseable event dateobs {event_id:?}"))
    })?;

    // the canonical alias is the text after the '#' separator; fall back to
    // the event key when none is set
    let alias = value
        .get("aliases")
        .and_then(Value::as_array)
        .and_then(|aliases| aliases.first())
        .and_then(Value::as_str)
        .and_then(|a| a.split('#').nth(1))
        .unwrap_or(&event_id)
        .to_string();

    let localizations = value
        .get("localizations")
        .and_then(Value::as_array)
        .map(|locs| {
            locs.iter()
                .filter_map(|loc| {
                    let key = loc.get("dateobs").and_then(Value::as_str)?;
                    Some(LocalizationRef {
                        dateobs_key: key.to_string(),
                        dateobs: parse_dateobs(key)?,
                        name: loc.get("localization_name").and_then(Value::as_str)?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(NoticeEvent {
        event_id,
        dateobs,
        alias,
        localizations,
    })
}

#[async_trait]
impl AlertSource for SkyPortalClient {
    async fn check_liveness(&self) -> Result<(), CrossmatchError> {
        let response = self.http.get(self.url("api/sysinfo")).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CrossmatchError::Unavailable(format!(
                "liveness probe returned {}",
                response.status()
            )))
        }
    }

    async fn check_auth(&self) -> Result<(), CrossmatchError> {
        self.get_data("api/config", &[]).await.map(|_| ())
    }

    async fn list_events(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<NoticeEvent>, CrossmatchError> {
        let base = vec![
            ("startDate".to_string(), format_dateobs(since)),
            ("excludeNoticeContent".to_string(), "true".to_string()),
        ];

        // GW-family events by tag, then well-localized Fermi bursts
        let mut gw_params = base.clone();
        gw_params.push(("gcnTagKeep".to_string(), "GW,BNS,NSBH,SVOM".to_string()));
        gw_params.push(("gcnTagRemove".to_string(), "BBH,MLy,Terrestrial".to_string()));

        let mut fermi_params = base;
        fermi_params.push(("gcnTagKeep".to_string(), "Fermi".to_string()));
        fermi_params.push((
            "localizationTagKeep".to_string(),
            "< 1000 sq. deg.".to_string(),
        ));

        let mut raw = self
            .fetch_all_pages("api/gcn_event", gw_params, "events")
            .await?;
        raw.extend(
            self.fetch_all_pages("api/gcn_event", fermi_params, "events")
                .await?,
        );

        let mut events = Vec::with_capacity(raw.len());
        for value in &raw {
            match parse_event(value) {
                Ok(event) => events.push(event),
                Err(e) => log::warn!("skipping malformed event: {e}"),
            }
        }
        Ok(events)
    }

    async fn list_objects(
        &self,
        query: &ObjectQuery,
    ) -> Result<Vec<TransientObject>, CrossmatchError> {
        let mut params = vec![("startDate".to_string(), format_dateobs(query.start_time))];
        if !query.group_ids.is_empty() {
            params.push(("groupIDs".to_string(), query.group_ids.join(",")));
        }

        let raw = self
            .fetch_all_pages("api/candidates", params, "candidates")
            .await?;
        let mut objects = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<TransientObject>(value) {
                Ok(object) => objects.push(object),
                Err(e) => log::warn!("skipping malformed object: {e}"),
            }
        }
        Ok(objects)
    }

    async fn fetch_photometry(
        &self,
        object_id: &str,
    ) -> Result<Vec<PhotometryPoint>, CrossmatchError> {
        let params = vec![
            ("individualOrSeries".to_string(), "individual".to_string()),
            ("deduplicatePhotometry".to_string(), "true".to_string()),
        ];
        let data = self
            .get_data(&format!("api/sources/{object_id}/photometry"), &params)
            .await?;
        let raw = data.as_array().cloned().ok_or_else(|| {
            CrossmatchError::MalformedResponse(format!(
                "photometry of {object_id} is not an array"
            ))
        })?;
        let mut points = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<PhotometryPoint>(value) {
                Ok(point) => points.push(point),
                Err(e) => log::warn!("skipping malformed photometry of {object_id}: {e}"),
            }
        }
        Ok(points)
    }

    async fn download_localization(
        &self,
        dateobs_key: &str,
        name: &str,
    ) -> Result<Vec<u8>, CrossmatchError> {
        let endpoint = format!("api/localization/{dateobs_key}/name/{name}/download");
        let response = self
            .http
            .get(self.url(&endpoint))
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CrossmatchError::MalformedResponse(format!(
                "localization download failed with {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>, CrossmatchError> {
        let data = self.get_data("api/instrument", &[]).await?;
        serde_json::from_value(data)
            .map_err(|e| CrossmatchError::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pagination_walks_until_total() {
        // Test: 2500 items at page size 1000 means 3 fetches, 2500 collected
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let items = collect_pages(
            move |page_number| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let count = if page_number < 3 { 1000 } else { 500 };
                    let start = (page_number - 1) * 1000;
                    Ok(Page {
                        items: (start..start + count).collect::<Vec<usize>>(),
                        total_matches: 2500,
                    })
                }
            },
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(items.len(), 2500);
        assert_eq!(items[0], 0);
        assert_eq!(items[2499], 2499);
    }

    #[tokio::test]
    async fn test_pagination_single_short_page() {
        // Test: a total below the page size finishes in one fetch
        let items = collect_pages(
            |_page| async {
                Ok(Page {
                    items: vec![1, 2, 3],
                    total_matches: 3,
                })
            },
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pagination_rejects_stalled_listing() {
        // Test: an empty page with matches still owed is malformed, not an
        // infinite loop
        let err = collect_pages(
            |_page| async {
                Ok(Page::<usize> {
                    items: vec![],
                    total_matches: 10,
                })
            },
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrossmatchError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_event_extracts_alias_and_localizations() {
        let value = serde_json::json!({
            "dateobs": "2025-06-10T12:00:00",
            "aliases": ["LVC#S250610ab"],
            "localizations": [
                {"dateobs": "2025-06-10T12:00:00", "localization_name": "bayestar.multiorder.fits,1"},
                {"dateobs": "2025-06-10T12:00:00", "localization_name": "bayestar.multiorder.fits,0"}
            ]
        });
        let event = parse_event(&value).unwrap();
        assert_eq!(event.event_id, "2025-06-10T12:00:00");
        assert_eq!(event.alias, "S250610ab");
        assert_eq!(event.localizations.len(), 2);
        assert_eq!(event.localizations[0].name, "bayestar.multiorder.fits,1");
    }

    #[test]
    fn test_parse_event_without_alias_falls_back_to_key() {
        let value = serde_json::json!({
            "dateobs": "2025-06-10T12:00:00.123",
            "aliases": [],
            "localizations": []
        });
        let event = parse_event(&value).unwrap();
        assert_eq!(event.alias, "2025-06-10T12:00:00.123");
        assert!(event.localizations.is_empty());
    }

    #[test]
    fn test_parse_event_rejects_missing_dateobs() {
        let err = parse_event(&serde_json::json!({"aliases": []})).unwrap_err();
        assert!(matches!(err, CrossmatchError::MalformedResponse(_)));
    }
}
