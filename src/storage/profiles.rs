//! Vehicle baseline profiles, stored as one JSON document per vehicle.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::detect::profile::VehicleBaselineProfile;

pub fn upsert(conn: &Connection, profile: &VehicleBaselineProfile) -> Result<()> {
    let json = serde_json::to_string(&profile.baseline_parameters)?;
    conn.execute(
        "INSERT INTO vehicle_profiles (vehicle_id, baseline_json, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(vehicle_id) DO UPDATE SET
            baseline_json = excluded.baseline_json,
            updated_at = excluded.updated_at",
        params![profile.vehicle_id, json],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, vehicle_id: &str) -> Result<Option<VehicleBaselineProfile>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT baseline_json FROM vehicle_profiles WHERE vehicle_id = ?1",
            [vehicle_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(json) = json else {
        return Ok(None);
    };
    let baseline_parameters = serde_json::from_str(&json)
        .with_context(|| format!("corrupt baseline profile for vehicle {}", vehicle_id))?;
    Ok(Some(VehicleBaselineProfile {
        vehicle_id: vehicle_id.to_string(),
        baseline_parameters,
    }))
}
