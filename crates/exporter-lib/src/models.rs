//! Core data models for the exporter
//!
//! A scrape produces a flat list of [`MetricRecord`]s. Each record points at
//! the static [`MetricDesc`] it was built from, so name, help text, type and
//! label names are fixed at compile time and only the label values and the
//! sample value travel with the record.

use serde::Serialize;
use std::time::Duration;

/// Prometheus metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing value (cumulative times, byte counts)
    Counter,
    /// Point-in-time value
    Gauge,
}

/// Static descriptor of one metric family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

impl MetricDesc {
    pub const fn gauge(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            labels,
        }
    }

    pub const fn counter(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            labels,
        }
    }

    /// Build a record for this family.
    ///
    /// `label_values` must be given in the order of [`MetricDesc::labels`].
    pub fn record<S: AsRef<str>>(&'static self, label_values: &[S], value: f64) -> MetricRecord {
        debug_assert_eq!(
            label_values.len(),
            self.labels.len(),
            "label arity mismatch for {}",
            self.name
        );
        MetricRecord {
            desc: self,
            label_values: label_values
                .iter()
                .map(|v| v.as_ref().to_string())
                .collect(),
            value,
        }
    }
}

/// One labeled sample produced during a scrape
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub desc: &'static MetricDesc,
    pub label_values: Vec<String>,
    pub value: f64,
}

impl MetricRecord {
    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn kind(&self) -> MetricKind {
        self.desc.kind
    }

    /// Value of a label by name
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .labels
            .iter()
            .position(|l| *l == name)
            .and_then(|idx| self.label_values.get(idx))
            .map(String::as_str)
    }

    /// Whether the record carries the full label set of its descriptor
    pub fn is_complete(&self) -> bool {
        self.label_values.len() == self.desc.labels.len()
    }
}

/// Result of one scrape cycle
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<MetricRecord>,
    /// Whether the cycle reached the hypervisor and enumerated domains
    pub up: bool,
    pub duration: Duration,
}

impl Snapshot {
    /// All records of one family
    pub fn family<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricRecord> + 'a {
        self.records.iter().filter(move |r| r.name() == name)
    }

    /// First record of a family whose labels match every given pair
    pub fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&MetricRecord> {
        self.records.iter().find(|r| {
            r.name() == name
                && labels
                    .iter()
                    .all(|(key, value)| r.label(key) == Some(*value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DISK_READS: MetricDesc = MetricDesc::counter(
        "test_disk_reads_total",
        "Reads",
        &["domain", "uuid", "device"],
    );

    #[test]
    fn test_record_label_lookup() {
        let record = DISK_READS.record(&["alpha", "1234", "vda"], 42.0);
        assert_eq!(record.name(), "test_disk_reads_total");
        assert_eq!(record.kind(), MetricKind::Counter);
        assert_eq!(record.label("device"), Some("vda"));
        assert_eq!(record.label("missing"), None);
        assert!(record.is_complete());
    }

    #[test]
    fn test_snapshot_find() {
        let snapshot = Snapshot {
            records: vec![
                DISK_READS.record(&["alpha", "1", "vda"], 1.0),
                DISK_READS.record(&["alpha", "1", "vdb"], 2.0),
            ],
            up: true,
            duration: Duration::from_millis(5),
        };

        assert_eq!(snapshot.family("test_disk_reads_total").count(), 2);
        let vdb = snapshot
            .find("test_disk_reads_total", &[("device", "vdb")])
            .unwrap();
        assert_eq!(vdb.value, 2.0);
    }
}
