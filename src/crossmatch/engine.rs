//! The correlation loop: orchestration, cursors, error containment, cadence.
//!
//! A single cooperative loop drives everything. Per cycle: probe the backend,
//! refresh the skymap cache, query recent objects, qualify their photometry,
//! dedup against the previous pass, point-test the survivors against every
//! candidate region and notify on matches. Any error below the loop surfaces
//! here; only an authentication failure is terminal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::cache::SkymapCache;
use super::dedup::DedupWindow;
use super::detection::DetectionFilter;
use super::types::{
    datetime_to_mjd, FilteredDetectionSet, ProcessingCursor, SkyEvent, TransientObject,
};
use crate::error::CrossmatchError;
use crate::notify::{CrossmatchReport, InstrumentCatalog, NotificationSink};
use crate::region::RegionBuilder;
use crate::skyportal::{AlertSource, ObjectQuery};

/// Time source and sleeper, injectable for deterministic tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Loop tuning, decoupled from the env-var surface.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// TTL of cached skymaps and lookback of the event query.
    pub gcn_ttl: chrono::Duration,
    /// Floor of the object refresh window.
    pub alert_window: chrono::Duration,
    /// How far back a qualifying first detection may lie.
    pub first_detection_lookback: chrono::Duration,
    /// Cadence of the polling cycle, also the post-error delay.
    pub poll_interval: Duration,
    pub snr_threshold: f64,
    pub cumulative_probability: f64,
    pub group_ids: Vec<String>,
    /// Pause between successive per-object photometry fetches.
    pub photometry_fetch_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Polling,
    Failed,
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub skipped_liveness: bool,
    pub skymaps_refreshed: usize,
    pub skymaps_evicted: usize,
    pub active_skymaps: usize,
    pub objects_seen: usize,
    pub objects_accepted: usize,
    pub notifications_sent: usize,
}

/// The stateful correlation engine.
///
/// Owns the skymap cache and the processing cursors exclusively; there is no
/// concurrent mutator.
pub struct CorrelationLoop {
    source: Arc<dyn AlertSource>,
    region_builder: Arc<dyn RegionBuilder>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
    instruments: InstrumentCatalog,

    cache: SkymapCache,
    cursor: ProcessingCursor,
    state: LoopState,
    first_run: bool,
}

impl fmt::Debug for CorrelationLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationLoop")
            .field("settings", &self.settings)
            .field("instruments", &self.instruments)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .field("first_run", &self.first_run)
            .finish_non_exhaustive()
    }
}

impl CorrelationLoop {
    /// Validate the backend and assemble the loop.
    ///
    /// Fails when the backend is unreachable or rejects the token; both are
    /// unrecoverable at boot. A missing instrument catalog is not: telescope
    /// names are enrichment only.
    pub async fn startup(
        source: Arc<dyn AlertSource>,
        region_builder: Arc<dyn RegionBuilder>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
    ) -> Result<Self, CrossmatchError> {
        source.check_liveness().await?;
        source.check_auth().await?;

        let instruments = match source.list_instruments().await {
            Ok(list) => InstrumentCatalog::from_instruments(list),
            Err(e) => {
                log::warn!("instrument catalog unavailable, telescope names will be blank: {e}");
                InstrumentCatalog::empty()
            }
        };
        log::info!("🔭 instrument catalog loaded ({} telescopes)", instruments.len());

        let start = clock.now() - settings.alert_window;
        Ok(Self {
            source,
            region_builder,
            sinks,
            clock,
            settings,
            instruments,
            cache: SkymapCache::new(),
            cursor: ProcessingCursor::new(start),
            state: LoopState::Init,
            first_run: true,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until a fatal error. Per-cycle errors are logged and the loop
    /// resumes after the regular delay.
    pub async fn run(&mut self) -> Result<(), CrossmatchError> {
        self.state = LoopState::Polling;
        log::info!(
            "🛰️ polling every {}s ({} notification sink(s))",
            self.settings.poll_interval.as_secs(),
            self.sinks.len()
        );

        loop {
            match self.run_cycle().await {
                Ok(stats) => {
                    log::info!(
                        "cycle done: {} skymaps active, {} objects seen, {} accepted, {} notified",
                        stats.active_skymaps,
                        stats.objects_seen,
                        stats.objects_accepted,
                        stats.notifications_sent
                    );
                }
                Err(e) if e.is_fatal() => {
                    self.state = LoopState::Failed;
                    log::error!("❌ unrecoverable error, stopping: {e}");
                    return Err(e);
                }
                Err(e) => {
                    log::error!("cycle failed, retrying next tick: {e}");
                }
            }
            self.clock.sleep(self.settings.poll_interval).await;
        }
    }

    /// One polling cycle. Cursors advance only past work that completed.
    pub async fn run_cycle(&mut self) -> Result<CycleStats, CrossmatchError> {
        let mut stats = CycleStats::default();
        let now = self.clock.now();

        // 1. liveness probe: on failure assume the backend is down and touch
        // nothing else this cycle
        if let Err(e) = self.source.check_liveness().await {
            log::warn!("backend liveness probe failed, skipping cycle: {e}");
            stats.skipped_liveness = true;
            return Ok(stats);
        }

        // 2. refresh the skymap cache
        stats.skymaps_refreshed = self.refresh_skymaps(now).await?;

        // 3. prune only on quiet cycles
        if stats.skymaps_refreshed == 0 {
            stats.skymaps_evicted = self.cache.evict(now, self.settings.gcn_ttl);
            if stats.skymaps_evicted > 0 {
                log::info!("evicted {} expired skymap(s)", stats.skymaps_evicted);
            }
        }
        stats.active_skymaps = self.cache.len();

        if self.cache.is_empty() {
            log::info!("no active skymaps, nothing to correlate");
            return Ok(stats);
        }

        // 4. object query; the cursor target is captured before the query so
        // an object created mid-query is re-seen next cycle
        let pre_query = self.clock.now();
        let query = ObjectQuery {
            start_time: self
                .cursor
                .object_query_floor
                .max(now - self.settings.alert_window),
            group_ids: self.settings.group_ids.clone(),
        };
        let objects = self.source.list_objects(&query).await?;
        stats.objects_seen = objects.len();

        // 5-7. qualify, dedup, point-test, notify
        let snapshot = self.cache.snapshot();
        let floor_mjd = datetime_to_mjd(now - self.settings.first_detection_lookback);
        let filter = DetectionFilter::new(self.settings.snr_threshold, floor_mjd);
        let dedup = DedupWindow {
            processed_mjd: self.cursor.processed_mjd,
            is_first_run: self.first_run,
        };

        for (index, object) in objects.iter().enumerate() {
            if index > 0 {
                // backend rate limit on per-object photometry fetches
                self.clock.sleep(self.settings.photometry_fetch_delay).await;
            }
            let photometry = match self.source.fetch_photometry(&object.object_id).await {
                Ok(points) => points,
                Err(e @ CrossmatchError::MalformedResponse(_)) => {
                    log::warn!("skipping {}: {e}", object.object_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(set) = filter.filter(&photometry) else {
                continue;
            };
            stats.objects_accepted += 1;

            let candidates = dedup.candidate_regions(&set, &snapshot);
            let matched: Vec<SkyEvent> = candidates
                .into_iter()
                .filter(|event| event.region.contains(object.ra, object.dec))
                .collect();
            if matched.is_empty() {
                continue;
            }

            self.notify(object, &set, &matched, now).await;
            stats.notifications_sent += 1;
        }

        self.cursor.advance(pre_query);
        self.first_run = false;
        Ok(stats)
    }

    /// Pull recent events and upsert their most recent localization.
    ///
    /// Events without any qualifying localization are ignored; localizations
    /// the cache already holds (same or older `dateobs`) are not downloaded
    /// again. A single bad event never aborts the refresh.
    async fn refresh_skymaps(&mut self, now: DateTime<Utc>) -> Result<usize, CrossmatchError> {
        let since = now - self.settings.gcn_ttl;
        let events = self.source.list_events(since).await?;

        let mut refreshed = 0;
        for event in events {
            let Some(localization) = event.localizations.first() else {
                continue;
            };
            if !self.cache.would_refresh(&event.event_id, localization.dateobs) {
                continue;
            }

            let bytes = match self
                .source
                .download_localization(&localization.dateobs_key, &localization.name)
                .await
            {
                Ok(bytes) => bytes,
                Err(e @ CrossmatchError::MalformedResponse(_)) => {
                    log::warn!("skipping localization of {}: {e}", event.event_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let region = match self
                .region_builder
                .build(&bytes, self.settings.cumulative_probability)
            {
                Ok(region) => region,
                Err(e) => {
                    log::warn!("unusable localization for {}: {e}", event.event_id);
                    continue;
                }
            };

            if self.cache.upsert(SkyEvent {
                event_id: event.event_id.clone(),
                dateobs: localization.dateobs,
                alias: event.alias.clone(),
                region,
            }) {
                log::info!("🗺️ active skymap {} ({})", event.alias, event.event_id);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Best-effort dispatch to every sink; failures are logged, never fatal,
    /// and never roll back cursor advancement.
    async fn notify(
        &self,
        object: &TransientObject,
        set: &FilteredDetectionSet,
        matched: &[SkyEvent],
        now: DateTime<Utc>,
    ) {
        let aliases: Vec<&str> = matched.iter().map(|e| e.alias.as_str()).collect();
        log::info!(
            "🚨 {} at ({:.4}, {:.4}) matches {:?}",
            object.object_id,
            object.ra,
            object.dec,
            aliases
        );

        let report = CrossmatchReport::assemble(object, set, matched, &self.instruments, now);
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&report).await {
                log::error!("delivery via {} failed for {}: {e}", sink.name(), object.object_id);
            }
        }
    }
}
