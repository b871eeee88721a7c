//! SQLite persistence for the engine
//!
//! The engine consumes a narrow contract: ROI/settings/link/rule reads that
//! feed the per-venue refresh, and idempotent writes for the facts it derives
//! (visits, queue sessions, snapshots, ledger entries). The HTTP layer shares
//! the same store for its CRUD surface.
//!
//! All writes are idempotent by primary key so the retrying writer task can
//! safely re-issue them.

use crate::domain::geometry::Point;
use crate::domain::session::{
    AlertRule, LedgerEntry, OccupancySnapshot, QueueSession, Severity, VenueDefaults, ZoneLink,
    ZoneSettings, ZoneVisit,
};
use crate::domain::types::{Roi, RoiId, RoiMetadata, TrackKey, VenueId};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS venues (
                id                      INTEGER PRIMARY KEY,
                name                    TEXT NOT NULL DEFAULT '',
                width                   REAL NOT NULL DEFAULT 0,
                depth                   REAL NOT NULL DEFAULT 0,
                dwell_threshold_sec     INTEGER,
                engagement_threshold_sec INTEGER
            );

            CREATE TABLE IF NOT EXISTS regions_of_interest (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                venue_id      INTEGER NOT NULL,
                name          TEXT NOT NULL,
                vertices      TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_roi_venue ON regions_of_interest(venue_id);

            CREATE TABLE IF NOT EXISTS zone_settings (
                roi_id                       INTEGER PRIMARY KEY,
                venue_id                     INTEGER NOT NULL,
                dwell_threshold_sec          INTEGER,
                engagement_threshold_sec     INTEGER,
                max_occupancy                INTEGER,
                visit_end_grace_sec          INTEGER,
                min_visit_duration_sec       INTEGER,
                queue_warning_threshold_sec  INTEGER,
                queue_critical_threshold_sec INTEGER,
                is_open                      INTEGER NOT NULL DEFAULT 1,
                lane_number                  INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_settings_venue ON zone_settings(venue_id);

            CREATE TABLE IF NOT EXISTS zone_links (
                queue_roi_id   INTEGER PRIMARY KEY,
                venue_id       INTEGER NOT NULL,
                service_roi_id INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_links_venue ON zone_links(venue_id);

            CREATE TABLE IF NOT EXISTS zone_visits (
                id            TEXT PRIMARY KEY,
                venue_id      INTEGER NOT NULL,
                roi_id        INTEGER NOT NULL,
                track_key     TEXT NOT NULL,
                start_time    INTEGER NOT NULL,
                end_time      INTEGER,
                duration_ms   INTEGER,
                is_dwell      INTEGER NOT NULL DEFAULT 0,
                is_engagement INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_visits_roi ON zone_visits(roi_id, start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_visits_venue ON zone_visits(venue_id, start_time DESC);

            CREATE TABLE IF NOT EXISTS queue_sessions (
                id                 TEXT PRIMARY KEY,
                venue_id           INTEGER NOT NULL,
                queue_zone_id      INTEGER NOT NULL,
                service_zone_id    INTEGER,
                track_key          TEXT NOT NULL,
                queue_entry_time   INTEGER NOT NULL,
                queue_exit_time    INTEGER,
                waiting_time_ms    INTEGER,
                service_entry_time INTEGER,
                service_exit_time  INTEGER,
                is_abandoned       INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_queue_venue
                ON queue_sessions(venue_id, queue_entry_time DESC);

            CREATE TABLE IF NOT EXISTS occupancy_snapshots (
                venue_id INTEGER NOT NULL,
                roi_id   INTEGER NOT NULL,
                ts       INTEGER NOT NULL,
                count    INTEGER NOT NULL,
                PRIMARY KEY (venue_id, roi_id, ts)
            );

            CREATE TABLE IF NOT EXISTS zone_alert_rules (
                id               TEXT PRIMARY KEY,
                roi_id           INTEGER NOT NULL,
                venue_id         INTEGER NOT NULL,
                rule_name        TEXT NOT NULL,
                metric           TEXT NOT NULL,
                operator         TEXT NOT NULL,
                threshold_value  REAL NOT NULL,
                severity         TEXT NOT NULL,
                enabled          INTEGER NOT NULL DEFAULT 1,
                message_template TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_rules_roi ON zone_alert_rules(roi_id);

            CREATE TABLE IF NOT EXISTS activity_ledger (
                id              TEXT PRIMARY KEY,
                venue_id        INTEGER NOT NULL,
                roi_id          INTEGER,
                rule_id         TEXT,
                event_type      TEXT NOT NULL,
                severity        TEXT NOT NULL,
                title           TEXT NOT NULL,
                message         TEXT NOT NULL,
                metric_name     TEXT,
                metric_value    REAL,
                threshold_value REAL,
                acknowledged    INTEGER NOT NULL DEFAULT 0,
                acknowledged_at INTEGER,
                timestamp       INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_venue
                ON activity_ledger(venue_id, timestamp DESC);
            ",
        )?;
        Ok(())
    }

    // --- venues ---

    pub fn upsert_venue(&self, venue: &VenueDefaults) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO venues (id, name, width, depth, dwell_threshold_sec, engagement_threshold_sec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, width = excluded.width, depth = excluded.depth,
                dwell_threshold_sec = excluded.dwell_threshold_sec,
                engagement_threshold_sec = excluded.engagement_threshold_sec",
            params![
                venue.venue_id.0,
                venue.name,
                venue.width,
                venue.depth,
                venue.dwell_threshold_sec,
                venue.engagement_threshold_sec
            ],
        )?;
        Ok(())
    }

    pub fn venue_defaults(&self, venue_id: VenueId) -> anyhow::Result<Option<VenueDefaults>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, width, depth, dwell_threshold_sec, engagement_threshold_sec
             FROM venues WHERE id = ?1",
            params![venue_id.0],
            |row| {
                Ok(VenueDefaults {
                    venue_id: VenueId(row.get(0)?),
                    name: row.get(1)?,
                    width: row.get(2)?,
                    depth: row.get(3)?,
                    dwell_threshold_sec: row.get(4)?,
                    engagement_threshold_sec: row.get(5)?,
                })
            },
        )
        .optional()
        .context("venue_defaults query failed")
    }

    // --- regions of interest ---

    fn roi_from_row(row: &Row<'_>) -> rusqlite::Result<Roi> {
        let vertices_json: String = row.get(3)?;
        let metadata_json: String = row.get(4)?;
        let vertices: Vec<Point> = serde_json::from_str(&vertices_json).unwrap_or_default();
        let metadata: RoiMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();
        Ok(Roi {
            id: RoiId(row.get(0)?),
            venue_id: VenueId(row.get(1)?),
            name: row.get(2)?,
            vertices,
            metadata,
        })
    }

    pub fn rois_for_venue(&self, venue_id: VenueId) -> anyhow::Result<Vec<Roi>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, venue_id, name, vertices, metadata_json
             FROM regions_of_interest WHERE venue_id = ?1 ORDER BY id",
        )?;
        let rois = stmt
            .query_map(params![venue_id.0], Self::roi_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rois)
    }

    pub fn get_roi(&self, roi_id: RoiId) -> anyhow::Result<Option<Roi>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, venue_id, name, vertices, metadata_json
             FROM regions_of_interest WHERE id = ?1",
            params![roi_id.0],
            Self::roi_from_row,
        )
        .optional()
        .context("get_roi query failed")
    }

    pub fn create_roi(
        &self,
        venue_id: VenueId,
        name: &str,
        vertices: &[Point],
        metadata: &RoiMetadata,
    ) -> anyhow::Result<Roi> {
        let vertices_json = serde_json::to_string(vertices)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO regions_of_interest (venue_id, name, vertices, metadata_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![venue_id.0, name, vertices_json, metadata_json],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Roi {
            id: RoiId(id),
            venue_id,
            name: name.to_string(),
            vertices: vertices.to_vec(),
            metadata: metadata.clone(),
        })
    }

    pub fn update_roi(
        &self,
        roi_id: RoiId,
        name: &str,
        vertices: &[Point],
        metadata: &RoiMetadata,
    ) -> anyhow::Result<bool> {
        let vertices_json = serde_json::to_string(vertices)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE regions_of_interest SET name = ?2, vertices = ?3, metadata_json = ?4
             WHERE id = ?1",
            params![roi_id.0, name, vertices_json, metadata_json],
        )?;
        Ok(changed > 0)
    }

    /// Delete an ROI and its dependent settings, links, and rules
    pub fn delete_roi(&self, roi_id: RoiId) -> anyhow::Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM zone_settings WHERE roi_id = ?1", params![roi_id.0])?;
        tx.execute(
            "DELETE FROM zone_links WHERE queue_roi_id = ?1 OR service_roi_id = ?1",
            params![roi_id.0],
        )?;
        tx.execute("DELETE FROM zone_alert_rules WHERE roi_id = ?1", params![roi_id.0])?;
        let changed =
            tx.execute("DELETE FROM regions_of_interest WHERE id = ?1", params![roi_id.0])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    // --- zone settings ---

    fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<ZoneSettings> {
        Ok(ZoneSettings {
            roi_id: RoiId(row.get(0)?),
            venue_id: VenueId(row.get(1)?),
            dwell_threshold_sec: row.get(2)?,
            engagement_threshold_sec: row.get(3)?,
            max_occupancy: row.get(4)?,
            visit_end_grace_sec: row.get(5)?,
            min_visit_duration_sec: row.get(6)?,
            queue_warning_threshold_sec: row.get(7)?,
            queue_critical_threshold_sec: row.get(8)?,
            is_open: row.get::<_, i64>(9)? != 0,
            lane_number: row.get(10)?,
        })
    }

    const SETTINGS_COLUMNS: &'static str = "roi_id, venue_id, dwell_threshold_sec, \
        engagement_threshold_sec, max_occupancy, visit_end_grace_sec, min_visit_duration_sec, \
        queue_warning_threshold_sec, queue_critical_threshold_sec, is_open, lane_number";

    pub fn zone_settings(&self, roi_id: RoiId) -> anyhow::Result<Option<ZoneSettings>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM zone_settings WHERE roi_id = ?1", Self::SETTINGS_COLUMNS),
            params![roi_id.0],
            Self::settings_from_row,
        )
        .optional()
        .context("zone_settings query failed")
    }

    pub fn zone_settings_for_venue(&self, venue_id: VenueId) -> anyhow::Result<Vec<ZoneSettings>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM zone_settings WHERE venue_id = ?1",
            Self::SETTINGS_COLUMNS
        ))?;
        let settings = stmt
            .query_map(params![venue_id.0], Self::settings_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(settings)
    }

    pub fn upsert_zone_settings(&self, settings: &ZoneSettings) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO zone_settings (roi_id, venue_id, dwell_threshold_sec,
                engagement_threshold_sec, max_occupancy, visit_end_grace_sec,
                min_visit_duration_sec, queue_warning_threshold_sec,
                queue_critical_threshold_sec, is_open, lane_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(roi_id) DO UPDATE SET
                venue_id = excluded.venue_id,
                dwell_threshold_sec = excluded.dwell_threshold_sec,
                engagement_threshold_sec = excluded.engagement_threshold_sec,
                max_occupancy = excluded.max_occupancy,
                visit_end_grace_sec = excluded.visit_end_grace_sec,
                min_visit_duration_sec = excluded.min_visit_duration_sec,
                queue_warning_threshold_sec = excluded.queue_warning_threshold_sec,
                queue_critical_threshold_sec = excluded.queue_critical_threshold_sec,
                is_open = excluded.is_open,
                lane_number = excluded.lane_number",
            params![
                settings.roi_id.0,
                settings.venue_id.0,
                settings.dwell_threshold_sec,
                settings.engagement_threshold_sec,
                settings.max_occupancy,
                settings.visit_end_grace_sec,
                settings.min_visit_duration_sec,
                settings.queue_warning_threshold_sec,
                settings.queue_critical_threshold_sec,
                settings.is_open as i64,
                settings.lane_number
            ],
        )?;
        Ok(())
    }

    /// Flip a queue lane open or closed, creating a settings row if none exists
    pub fn set_lane_state(
        &self,
        venue_id: VenueId,
        roi_id: RoiId,
        is_open: bool,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO zone_settings (roi_id, venue_id, is_open) VALUES (?1, ?2, ?3)
             ON CONFLICT(roi_id) DO UPDATE SET is_open = excluded.is_open",
            params![roi_id.0, venue_id.0, is_open as i64],
        )?;
        Ok(())
    }

    /// Queue ROIs currently accepting sessions. An ROI with no settings row is
    /// open by default.
    pub fn open_lanes(&self, venue_id: VenueId) -> anyhow::Result<Vec<(RoiId, bool)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT roi_id, is_open FROM zone_settings WHERE venue_id = ?1",
        )?;
        let lanes = stmt
            .query_map(params![venue_id.0], |row| {
                Ok((RoiId(row.get(0)?), row.get::<_, i64>(1)? != 0))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lanes)
    }

    // --- zone links ---

    pub fn zone_links(&self, venue_id: VenueId) -> anyhow::Result<Vec<ZoneLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT venue_id, queue_roi_id, service_roi_id FROM zone_links WHERE venue_id = ?1",
        )?;
        let links = stmt
            .query_map(params![venue_id.0], |row| {
                Ok(ZoneLink {
                    venue_id: VenueId(row.get(0)?),
                    queue_roi_id: RoiId(row.get(1)?),
                    service_roi_id: RoiId(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    pub fn upsert_zone_link(&self, link: &ZoneLink) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO zone_links (queue_roi_id, venue_id, service_roi_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(queue_roi_id) DO UPDATE SET
                venue_id = excluded.venue_id, service_roi_id = excluded.service_roi_id",
            params![link.queue_roi_id.0, link.venue_id.0, link.service_roi_id.0],
        )?;
        Ok(())
    }

    // --- zone visits ---

    pub fn insert_zone_visit(&self, visit: &ZoneVisit) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO zone_visits
                (id, venue_id, roi_id, track_key, start_time, end_time, duration_ms,
                 is_dwell, is_engagement)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                visit.id,
                visit.venue_id.0,
                visit.roi_id.0,
                visit.track_key.as_str(),
                visit.start_ts,
                visit.end_ts,
                visit.duration_ms,
                visit.is_dwell as i64,
                visit.is_engagement as i64
            ],
        )?;
        Ok(())
    }

    pub fn close_zone_visit(
        &self,
        id: &str,
        end_ts: u64,
        duration_ms: u64,
        is_dwell: bool,
        is_engagement: bool,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE zone_visits
             SET end_time = ?2, duration_ms = ?3, is_dwell = ?4, is_engagement = ?5
             WHERE id = ?1",
            params![id, end_ts, duration_ms, is_dwell as i64, is_engagement as i64],
        )?;
        Ok(())
    }

    // --- queue sessions ---

    pub fn upsert_queue_session(&self, session: &QueueSession) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO queue_sessions
                (id, venue_id, queue_zone_id, service_zone_id, track_key,
                 queue_entry_time, queue_exit_time, waiting_time_ms,
                 service_entry_time, service_exit_time, is_abandoned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id,
                session.venue_id.0,
                session.queue_roi_id.0,
                session.service_roi_id.map(|r| r.0),
                session.track_key.as_str(),
                session.queue_entry_ts,
                session.queue_exit_ts,
                session.waiting_time_ms,
                session.service_entry_ts,
                session.service_exit_ts,
                session.is_abandoned as i64
            ],
        )?;
        Ok(())
    }

    fn queue_session_from_row(row: &Row<'_>) -> rusqlite::Result<QueueSession> {
        Ok(QueueSession {
            id: row.get(0)?,
            venue_id: VenueId(row.get(1)?),
            queue_roi_id: RoiId(row.get(2)?),
            service_roi_id: row.get::<_, Option<i64>>(3)?.map(RoiId),
            track_key: TrackKey(row.get(4)?),
            queue_entry_ts: row.get(5)?,
            queue_exit_ts: row.get(6)?,
            waiting_time_ms: row.get(7)?,
            service_entry_ts: row.get(8)?,
            service_exit_ts: row.get(9)?,
            is_abandoned: row.get::<_, i64>(10)? != 0,
        })
    }

    /// Sessions that have not reached a terminal state (abandoned or served)
    pub fn open_queue_sessions(&self, venue_id: VenueId) -> anyhow::Result<Vec<QueueSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, venue_id, queue_zone_id, service_zone_id, track_key,
                    queue_entry_time, queue_exit_time, waiting_time_ms,
                    service_entry_time, service_exit_time, is_abandoned
             FROM queue_sessions
             WHERE venue_id = ?1 AND is_abandoned = 0 AND service_exit_time IS NULL
             ORDER BY queue_entry_time",
        )?;
        let sessions = stmt
            .query_map(params![venue_id.0], Self::queue_session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // --- occupancy snapshots ---

    pub fn insert_occupancy_snapshot(&self, snapshot: &OccupancySnapshot) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO occupancy_snapshots (venue_id, roi_id, ts, count)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.venue_id.0, snapshot.roi_id.0, snapshot.ts, snapshot.count],
        )?;
        Ok(())
    }

    // --- alert rules ---

    fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
        let metric: String = row.get(4)?;
        let operator: String = row.get(5)?;
        let severity: String = row.get(7)?;
        Ok(AlertRule {
            id: row.get(0)?,
            roi_id: RoiId(row.get(1)?),
            venue_id: VenueId(row.get(2)?),
            rule_name: row.get(3)?,
            metric: metric.parse().unwrap_or(crate::domain::session::AlertMetric::Occupancy),
            operator: operator.parse().unwrap_or(crate::domain::session::AlertOperator::Gte),
            threshold_value: row.get(6)?,
            severity: severity.parse().unwrap_or(Severity::Info),
            enabled: row.get::<_, i64>(8)? != 0,
            message_template: row.get(9)?,
        })
    }

    const RULE_COLUMNS: &'static str = "id, roi_id, venue_id, rule_name, metric, operator, \
        threshold_value, severity, enabled, message_template";

    pub fn alert_rules_for_roi(&self, roi_id: RoiId) -> anyhow::Result<Vec<AlertRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM zone_alert_rules WHERE roi_id = ?1 ORDER BY rule_name",
            Self::RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map(params![roi_id.0], Self::rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn alert_rules_for_venue(&self, venue_id: VenueId) -> anyhow::Result<Vec<AlertRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM zone_alert_rules WHERE venue_id = ?1",
            Self::RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map(params![venue_id.0], Self::rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn get_alert_rule(&self, id: &str) -> anyhow::Result<Option<AlertRule>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM zone_alert_rules WHERE id = ?1", Self::RULE_COLUMNS),
            params![id],
            Self::rule_from_row,
        )
        .optional()
        .context("get_alert_rule query failed")
    }

    pub fn upsert_alert_rule(&self, rule: &AlertRule) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO zone_alert_rules
                (id, roi_id, venue_id, rule_name, metric, operator, threshold_value,
                 severity, enabled, message_template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.id,
                rule.roi_id.0,
                rule.venue_id.0,
                rule.rule_name,
                rule.metric.as_str(),
                rule.operator.as_str(),
                rule.threshold_value,
                rule.severity.as_str(),
                rule.enabled as i64,
                rule.message_template
            ],
        )?;
        Ok(())
    }

    pub fn delete_alert_rule(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM zone_alert_rules WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // --- activity ledger ---

    pub fn insert_ledger_entry(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO activity_ledger
                (id, venue_id, roi_id, rule_id, event_type, severity, title, message,
                 metric_name, metric_value, threshold_value, acknowledged,
                 acknowledged_at, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.id,
                entry.venue_id.0,
                entry.roi_id.map(|r| r.0),
                entry.rule_id,
                entry.event_type,
                entry.severity.as_str(),
                entry.title,
                entry.message,
                entry.metric_name,
                entry.metric_value,
                entry.threshold_value,
                entry.acknowledged as i64,
                entry.acknowledged_at,
                entry.ts
            ],
        )?;
        Ok(())
    }

    fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
        let severity: String = row.get(5)?;
        Ok(LedgerEntry {
            id: row.get(0)?,
            venue_id: VenueId(row.get(1)?),
            roi_id: row.get::<_, Option<i64>>(2)?.map(RoiId),
            rule_id: row.get(3)?,
            event_type: row.get(4)?,
            severity: severity.parse().unwrap_or(Severity::Info),
            title: row.get(6)?,
            message: row.get(7)?,
            metric_name: row.get(8)?,
            metric_value: row.get(9)?,
            threshold_value: row.get(10)?,
            acknowledged: row.get::<_, i64>(11)? != 0,
            acknowledged_at: row.get(12)?,
            ts: row.get(13)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn query_ledger(
        &self,
        venue_id: VenueId,
        limit: u32,
        offset: u32,
        roi_id: Option<RoiId>,
        severity: Option<Severity>,
        acknowledged: Option<bool>,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, venue_id, roi_id, rule_id, event_type, severity, title, message,
                    metric_name, metric_value, threshold_value, acknowledged,
                    acknowledged_at, timestamp
             FROM activity_ledger
             WHERE venue_id = ?1
               AND (?2 IS NULL OR roi_id = ?2)
               AND (?3 IS NULL OR severity = ?3)
               AND (?4 IS NULL OR acknowledged = ?4)
             ORDER BY timestamp DESC
             LIMIT ?5 OFFSET ?6",
        )?;
        let entries = stmt
            .query_map(
                params![
                    venue_id.0,
                    roi_id.map(|r| r.0),
                    severity.map(|s| s.as_str()),
                    acknowledged.map(|a| a as i64),
                    limit,
                    offset
                ],
                Self::ledger_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn ledger_entry_exists(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activity_ledger WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn acknowledge_ledger_entry(&self, id: &str, ts: u64) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE activity_ledger SET acknowledged = 1, acknowledged_at = ?2
             WHERE id = ?1 AND acknowledged = 0",
            params![id, ts],
        )?;
        Ok(changed > 0)
    }

    pub fn unacknowledged_count(&self, venue_id: VenueId) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activity_ledger WHERE venue_id = ?1 AND acknowledged = 0",
            params![venue_id.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- KPI aggregates ---

    /// Visit and occupancy aggregates for one ROI since `since_ts`
    pub fn roi_kpis(&self, roi_id: RoiId, since_ts: u64) -> anyhow::Result<RoiKpis> {
        let conn = self.conn.lock();
        let (total_visits, avg_duration_ms, dwell_count, engagement_count) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(AVG(duration_ms), 0),
                    COALESCE(SUM(is_dwell), 0),
                    COALESCE(SUM(is_engagement), 0)
             FROM zone_visits
             WHERE roi_id = ?1 AND start_time >= ?2 AND end_time IS NOT NULL",
            params![roi_id.0, since_ts],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;
        let (avg_occupancy, peak_occupancy) = conn.query_row(
            "SELECT COALESCE(AVG(count), 0), COALESCE(MAX(count), 0)
             FROM occupancy_snapshots WHERE roi_id = ?1 AND ts >= ?2",
            params![roi_id.0, since_ts],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(RoiKpis {
            total_visits: total_visits as u64,
            avg_duration_ms,
            dwell_count: dwell_count as u64,
            engagement_count: engagement_count as u64,
            avg_occupancy,
            peak_occupancy: peak_occupancy as u32,
        })
    }
}

/// Aggregate view returned by the KPI endpoint
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiKpis {
    pub total_visits: u64,
    pub avg_duration_ms: f64,
    pub dwell_count: u64,
    pub engagement_count: u64,
    pub avg_occupancy: f64,
    pub peak_occupancy: u32,
}
