//! JSON exporter for simulation reports.
//!
//! Writes every entity's final cell and contact history together with the
//! tracker counters, so a run can be inspected or diffed after the fact.

use contact_core::{ContactRecord, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Final state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity_id: String,
    pub speed: f64,
    pub final_x: f64,
    pub final_y: f64,
    /// Oldest first
    pub contacts: Vec<ContactRecord>,
}

/// Simulation event (outages, recoveries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub time_sec: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Complete simulation export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimExport {
    pub seed: u64,
    pub board_size: u32,
    pub duration_sec: f64,
    pub ticks: u64,

    /// Position reports the walkers tried to publish
    pub attempted: u64,
    /// Position reports that reached the tracker's queue
    pub published: u64,
    /// Position reports that never reached the tracker, either because the
    /// broker was down or because the tracker had not resubscribed yet
    pub lost: u64,

    pub entities: Vec<EntityReport>,
    pub stats: StatsSnapshot,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

impl SimExport {
    pub fn new(seed: u64, board_size: u32) -> Self {
        Self {
            seed,
            board_size,
            duration_sec: 0.0,
            ticks: 0,
            attempted: 0,
            published: 0,
            lost: 0,
            entities: Vec::new(),
            stats: StatsSnapshot::default(),
            events: Vec::new(),
        }
    }

    pub fn add_entity(&mut self, entity: EntityReport) {
        self.entities.push(entity);
    }

    pub fn add_event(&mut self, time_sec: f64, message: impl Into<String>, level: Option<&str>) {
        self.events.push(SimEvent {
            time_sec,
            message: message.into(),
            level: level.map(str::to_string),
        });
    }

    /// Contact records across all entities (each contact counted once per side).
    pub fn total_contacts(&self) -> usize {
        self.entities.iter().map(|e| e.contacts.len()).sum()
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
