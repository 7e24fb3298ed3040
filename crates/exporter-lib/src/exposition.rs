//! Prometheus text exposition of a scrape snapshot
//!
//! Every scrape is encoded through a fresh [`prometheus::Registry`], so series
//! of domains that disappeared never linger in the output.

use crate::models::{MetricKind, MetricRecord, Snapshot};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};

/// Content type of [`encode_text`] output
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl Family {
    fn new(
        record: &MetricRecord,
        const_labels: &HashMap<String, String>,
    ) -> prometheus::Result<Self> {
        let desc = record.desc;
        if let Some(clash) = desc.labels.iter().find(|l| const_labels.contains_key(**l)) {
            return Err(prometheus::Error::Msg(format!(
                "extra label {clash:?} collides with a label of {}",
                desc.name
            )));
        }
        let opts = Opts::new(desc.name, desc.help).const_labels(const_labels.clone());
        Ok(match desc.kind {
            MetricKind::Gauge => Family::Gauge(GaugeVec::new(opts, desc.labels)?),
            MetricKind::Counter => Family::Counter(CounterVec::new(opts, desc.labels)?),
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        match self {
            Family::Gauge(vec) => registry.register(Box::new(vec.clone())),
            Family::Counter(vec) => registry.register(Box::new(vec.clone())),
        }
    }

    fn observe(&self, record: &MetricRecord) -> prometheus::Result<()> {
        let values: Vec<&str> = record.label_values.iter().map(String::as_str).collect();
        match self {
            Family::Gauge(vec) => vec.get_metric_with_label_values(&values)?.set(record.value),
            // counters cannot go down; the hypervisor's cumulative value is the sample
            Family::Counter(vec) => vec
                .get_metric_with_label_values(&values)?
                .inc_by(record.value.max(0.0)),
        }
        Ok(())
    }
}

/// Encode a snapshot in the Prometheus text format.
///
/// `extra_labels` are attached to every series as constant labels.
pub fn encode_text(
    snapshot: &Snapshot,
    extra_labels: &BTreeMap<String, String>,
) -> prometheus::Result<String> {
    if let Some(reserved) = extra_labels.keys().find(|k| k.starts_with("__")) {
        return Err(prometheus::Error::Msg(format!(
            "extra label {reserved:?} uses a reserved name"
        )));
    }
    let const_labels: HashMap<String, String> = extra_labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut families: BTreeMap<&'static str, Family> = BTreeMap::new();
    for record in &snapshot.records {
        let family = match families.entry(record.name()) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Family::new(record, &const_labels)?)
            }
        };
        family.observe(record)?;
    }

    let registry = Registry::new();
    for family in families.values() {
        family.register(&registry)?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
