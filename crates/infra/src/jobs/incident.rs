//! Incident notification.
//!
//! Incidents are persisted by the job store in the same commit that exhausts a
//! job's retries. Sinks are told afterwards so monitoring collaborators can
//! react without polling.

use std::sync::Mutex;

use tracing::warn;

use super::types::Incident;

/// Receiver of freshly committed incidents.
pub trait IncidentSink: Send + Sync {
    fn incident_created(&self, incident: &Incident);
}

/// Default sink: one structured warning per incident.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogIncidentSink;

impl IncidentSink for LogIncidentSink {
    fn incident_created(&self, incident: &Incident) {
        warn!(
            incident_id = %incident.id,
            job_id = %incident.job_id,
            job_type = %incident.job_type,
            message = %incident.message,
            occurrences = incident.occurrences,
            "incident created, job needs operator action"
        );
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIncidentSink {
    inner: Mutex<Vec<Incident>>,
}

impl InMemoryIncidentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Incident> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl IncidentSink for InMemoryIncidentSink {
    fn incident_created(&self, incident: &Incident) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(incident.clone());
        }
    }
}
