//! Outbound notification of confirmed crossmatches.
//!
//! One report is assembled per object with at least one matched region and
//! handed to every configured sink. Delivery is synchronous and best-effort:
//! a failed sink is logged and the loop moves on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crossmatch::types::{FilteredDetectionSet, SkyEvent, TransientObject};
use crate::error::CrossmatchError;
use crate::skyportal::Instrument;

/// Instrument → telescope lookup, resolved once at startup and threaded
/// through the loop.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCatalog {
    telescopes: HashMap<String, String>,
}

impl InstrumentCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_instruments(instruments: Vec<Instrument>) -> Self {
        let telescopes = instruments
            .into_iter()
            .filter_map(|i| Some((i.name, i.telescope?.name)))
            .collect();
        Self { telescopes }
    }

    pub fn telescope_for(&self, instrument: &str) -> Option<&str> {
        self.telescopes.get(instrument).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.telescopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.telescopes.is_empty()
    }
}

/// A region an object landed in.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedRegion {
    pub event_id: String,
    pub alias: String,
    pub dateobs: DateTime<Utc>,
}

/// One photometry row of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub mjd: f64,
    pub instrument: Option<String>,
    pub telescope: Option<String>,
    pub band: Option<String>,
    pub magnitude: Option<f64>,
    pub magnitude_error: Option<f64>,
    pub limiting_magnitude: Option<f64>,
}

/// The structured crossmatch notification.
#[derive(Debug, Clone, Serialize)]
pub struct CrossmatchReport {
    pub title: String,
    pub object_id: String,
    pub ra: f64,
    pub dec: f64,
    pub classifications: Vec<String>,
    pub matched_regions: Vec<MatchedRegion>,
    pub photometry: Vec<ReportRow>,
    pub generated_at: DateTime<Utc>,
}

impl CrossmatchReport {
    pub fn assemble(
        object: &TransientObject,
        set: &FilteredDetectionSet,
        matched: &[SkyEvent],
        catalog: &InstrumentCatalog,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let photometry = set
            .timeline()
            .into_iter()
            .map(|point| ReportRow {
                mjd: point.mjd,
                instrument: point.instrument_name.clone(),
                telescope: point
                    .instrument_name
                    .as_deref()
                    .and_then(|name| catalog.telescope_for(name))
                    .map(str::to_string),
                band: point.filter.clone(),
                magnitude: point.mag,
                magnitude_error: point.magerr,
                limiting_magnitude: point.limiting_mag,
            })
            .collect();

        Self {
            title: format!("Crossmatch report for {}", object.object_id),
            object_id: object.object_id.clone(),
            ra: object.ra,
            dec: object.dec,
            classifications: object
                .classifications
                .iter()
                .map(|c| c.classification.clone())
                .collect(),
            matched_regions: matched
                .iter()
                .map(|event| MatchedRegion {
                    event_id: event.event_id.clone(),
                    alias: event.alias.clone(),
                    dateobs: event.dateobs,
                })
                .collect(),
            photometry,
            generated_at,
        }
    }
}

/// Delivery channel for crossmatch reports.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, report: &CrossmatchReport) -> Result<(), CrossmatchError>;
}

fn delivery_error(e: impl std::fmt::Display) -> CrossmatchError {
    CrossmatchError::NotificationDelivery(e.to_string())
}

/// Chat sink posting to a Slack channel via `chat.postMessage`.
pub struct SlackSink {
    http: reqwest::Client,
    token: String,
    channel: String,
    portal_url: String,
}

impl SlackSink {
    pub fn new(token: &str, channel: &str, portal_url: &str) -> Result<Self, CrossmatchError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(40))
            .build()
            .map_err(delivery_error)?;
        Ok(Self {
            http,
            token: token.to_string(),
            channel: channel.to_string(),
            portal_url: portal_url.trim_end_matches('/').to_string(),
        })
    }

    fn message_text(&self, report: &CrossmatchReport) -> String {
        let mut text = format!(
            "*New object in skymap localization:*\n\
             *Date:* {}\n\
             *Object:* <{}/source/{}|{}>\n\
             *Crossmatches:*",
            report.generated_at.format("%Y-%m-%dT%H:%M:%S"),
            self.portal_url,
            report.object_id,
            report.object_id,
        );
        for region in &report.matched_regions {
            text.push_str(&format!(
                "\n<{}/gcn_events/{}|{}>",
                self.portal_url, region.event_id, region.alias
            ));
        }
        text
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, report: &CrossmatchReport) -> Result<(), CrossmatchError> {
        let body = serde_json::json!({
            "channel": format!("#{}", self.channel),
            "text": self.message_text(report),
            "mrkdwn": true,
        });
        let response = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(delivery_error)?;

        let reply: serde_json::Value = response.json().await.map_err(delivery_error)?;
        if reply.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            let reason = reply
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            return Err(delivery_error(format!("slack refused message: {reason}")));
        }
        Ok(())
    }
}

/// Circular-notice sink posting the structured report to a relay endpoint.
pub struct CircularSink {
    http: reqwest::Client,
    endpoint: String,
}

impl CircularSink {
    pub fn new(endpoint: &str) -> Result<Self, CrossmatchError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(40))
            .build()
            .map_err(delivery_error)?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    fn payload(report: &CrossmatchReport) -> serde_json::Value {
        serde_json::json!({
            "title": report.title,
            "data": {
                "targets": [{
                    "name": report.object_id,
                    "ra": report.ra,
                    "dec": report.dec,
                    "classifications": report.classifications,
                    "gcn_crossmatch": report
                        .matched_regions
                        .iter()
                        .map(|r| r.alias.clone())
                        .collect::<Vec<String>>(),
                }],
                "photometry": report.photometry,
            },
        })
    }
}

#[async_trait]
impl NotificationSink for CircularSink {
    fn name(&self) -> &'static str {
        "circular"
    }

    async fn deliver(&self, report: &CrossmatchReport) -> Result<(), CrossmatchError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&Self::payload(report))
            .send()
            .await
            .map_err(delivery_error)?;
        if !response.status().is_success() {
            return Err(delivery_error(format!(
                "circular relay returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossmatch::types::{Classification, PhotometryPoint};
    use crate::region::CoverageRegion;
    use chrono::TimeZone;
    use std::sync::Arc;

    struct WholeSky;

    impl CoverageRegion for WholeSky {
        fn contains(&self, _ra: f64, _dec: f64) -> bool {
            true
        }
    }

    fn make_report() -> CrossmatchReport {
        let object = TransientObject {
            object_id: "ZTF25abcdef".to_string(),
            ra: 10.0,
            dec: 20.0,
            classifications: vec![Classification {
                classification: "Kilonova".to_string(),
                probability: Some(0.7),
            }],
        };
        let set = FilteredDetectionSet {
            last_non_detection: Some(PhotometryPoint {
                mjd: 60099.5,
                flux: None,
                flux_error: None,
                mag: None,
                magerr: None,
                limiting_mag: Some(20.5),
                filter: Some("ztfg".to_string()),
                instrument_name: Some("ZTF".to_string()),
            }),
            detections: vec![PhotometryPoint {
                mjd: 60100.0,
                flux: Some(80.0),
                flux_error: Some(10.0),
                mag: Some(18.2),
                magerr: Some(0.1),
                limiting_mag: None,
                filter: Some("ztfr".to_string()),
                instrument_name: Some("ZTF".to_string()),
            }],
        };
        let matched = [SkyEvent {
            event_id: "2025-06-10T12:00:00".to_string(),
            dateobs: Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap(),
            alias: "S250610ab".to_string(),
            region: Arc::new(WholeSky),
        }];
        let catalog = InstrumentCatalog::from_instruments(vec![Instrument {
            name: "ZTF".to_string(),
            telescope: Some(crate::skyportal::TelescopeRef {
                name: "P48".to_string(),
            }),
        }]);
        CrossmatchReport::assemble(
            &object,
            &set,
            &matched,
            &catalog,
            Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_report_assembly_resolves_telescopes() {
        // Test: rows are chronological, non-detection first, telescope
        // resolved through the catalog
        let report = make_report();
        assert_eq!(report.photometry.len(), 2);
        assert_eq!(report.photometry[0].mjd, 60099.5);
        assert_eq!(report.photometry[0].limiting_magnitude, Some(20.5));
        assert_eq!(report.photometry[1].telescope.as_deref(), Some("P48"));
        assert_eq!(report.classifications, vec!["Kilonova".to_string()]);
        assert_eq!(report.matched_regions[0].alias, "S250610ab");
        assert_eq!(report.title, "Crossmatch report for ZTF25abcdef");
    }

    #[test]
    fn test_slack_message_links_object_and_events() {
        let sink = SlackSink::new("xoxb-test", "gw-alerts", "https://portal.example/").unwrap();
        let text = sink.message_text(&make_report());
        assert!(text.contains("<https://portal.example/source/ZTF25abcdef|ZTF25abcdef>"));
        assert!(text.contains("<https://portal.example/gcn_events/2025-06-10T12:00:00|S250610ab>"));
    }

    #[test]
    fn test_circular_payload_shape() {
        let payload = CircularSink::payload(&make_report());
        assert_eq!(payload["title"], "Crossmatch report for ZTF25abcdef");
        assert_eq!(payload["data"]["targets"][0]["name"], "ZTF25abcdef");
        assert_eq!(payload["data"]["targets"][0]["gcn_crossmatch"][0], "S250610ab");
        assert_eq!(payload["data"]["photometry"][1]["mjd"], 60100.0);
        assert_eq!(payload["data"]["photometry"][1]["telescope"], "P48");
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = InstrumentCatalog::from_instruments(vec![
            Instrument {
                name: "ZTF".to_string(),
                telescope: Some(crate::skyportal::TelescopeRef {
                    name: "P48".to_string(),
                }),
            },
            Instrument {
                name: "orphan".to_string(),
                telescope: None,
            },
        ]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.telescope_for("ZTF"), Some("P48"));
        assert_eq!(catalog.telescope_for("orphan"), None);
    }
}
