//! Anomaly log: inserts from the engine, reads for operator summaries.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::detect::{AnomalyResult, AnomalyType, Severity};
use crate::storage::AnomalyRecord;

const TOP_PARAMETERS: usize = 5;

/// Fixed-width UTC timestamps so text comparison matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub fn insert(conn: &Connection, record: &AnomalyRecord) -> Result<()> {
    let r = &record.result;
    conn.execute(
        "INSERT INTO anomalies (id, session_id, vehicle_id, parameter_name, value, anomaly_score,
                                confidence, severity, anomaly_type, description, recommended_action,
                                detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.id.to_string(),
            record.session_id,
            record.vehicle_id,
            r.parameter_name,
            r.value,
            r.anomaly_score,
            r.confidence,
            r.severity.as_str(),
            r.anomaly_type.as_str(),
            r.description,
            r.recommended_action,
            format_ts(r.timestamp),
        ],
    )
    .with_context(|| format!("failed to insert anomaly {}", record.id))?;
    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AnomalyRecord> {
    let id: String = row.get(0)?;
    let severity: String = row.get(7)?;
    let anomaly_type: String = row.get(8)?;
    let detected_at: String = row.get(11)?;

    Ok(AnomalyRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e.to_string()))?,
        session_id: row.get(1)?,
        vehicle_id: row.get(2)?,
        result: AnomalyResult {
            parameter_name: row.get(3)?,
            value: row.get(4)?,
            anomaly_score: row.get(5)?,
            is_anomaly: true,
            confidence: row.get(6)?,
            severity: severity.parse::<Severity>().map_err(|e| conversion_error(7, e))?,
            anomaly_type: anomaly_type
                .parse::<AnomalyType>()
                .map_err(|e| conversion_error(8, e))?,
            description: row.get(9)?,
            recommended_action: row.get(10)?,
            timestamp: DateTime::parse_from_rfc3339(&detected_at)
                .map_err(|e| conversion_error(11, e.to_string()))?
                .with_timezone(&Utc),
        },
    })
}

const SELECT_COLUMNS: &str = "SELECT id, session_id, vehicle_id, parameter_name, value, anomaly_score,
        confidence, severity, anomaly_type, description, recommended_action, detected_at
        FROM anomalies";

/// Most recent anomalies of a session, newest first.
pub fn list_recent(conn: &Connection, session_id: &str, limit: usize) -> Result<Vec<AnomalyRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE session_id = ?1 ORDER BY detected_at DESC, rowid DESC LIMIT ?2",
        SELECT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![session_id, limit as i64], row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn list_since(conn: &Connection, session_id: &str, since: DateTime<Utc>) -> Result<Vec<AnomalyRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE session_id = ?1 AND detected_at >= ?2 ORDER BY detected_at ASC, rowid ASC",
        SELECT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![session_id, format_ts(since)], row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Aggregate view of a session's anomalies over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySummary {
    pub session_id: String,
    pub since: DateTime<Utc>,
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<AnomalyType, usize>,
    /// Most frequently flagged parameters, descending; ties by name.
    pub top_parameters: Vec<(String, usize)>,
    /// Distinct actions from high and critical findings, in first-seen order.
    pub urgent_actions: Vec<String>,
}

impl AnomalySummary {
    pub fn from_records(session_id: &str, since: DateTime<Utc>, records: &[AnomalyRecord]) -> Self {
        let mut by_severity = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        let mut by_parameter: BTreeMap<&str, usize> = BTreeMap::new();
        let mut seen_actions = BTreeSet::new();
        let mut urgent_actions = Vec::new();

        for record in records {
            let r = &record.result;
            *by_severity.entry(r.severity).or_insert(0) += 1;
            *by_type.entry(r.anomaly_type).or_insert(0) += 1;
            *by_parameter.entry(r.parameter_name.as_str()).or_insert(0) += 1;
            if r.severity >= Severity::High && seen_actions.insert(r.recommended_action.as_str()) {
                urgent_actions.push(r.recommended_action.clone());
            }
        }

        let mut top_parameters: Vec<(String, usize)> = by_parameter
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        // Stable sort keeps the name order among equal counts.
        top_parameters.sort_by(|a, b| b.1.cmp(&a.1));
        top_parameters.truncate(TOP_PARAMETERS);

        Self {
            session_id: session_id.to_string(),
            since,
            total: records.len(),
            by_severity,
            by_type,
            top_parameters,
            urgent_actions,
        }
    }
}

pub fn summarize(conn: &Connection, session_id: &str, since: DateTime<Utc>) -> Result<AnomalySummary> {
    let records = list_since(conn, session_id, since)?;
    Ok(AnomalySummary::from_records(session_id, since, &records))
}
