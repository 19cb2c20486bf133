//! `nimbusio_datawriter`のメトリクス。

use nimbusio_nodedb::NodeId;
use prometrics::metrics::{Counter, CounterBuilder, Histogram, HistogramBuilder};

use crate::Result;

#[derive(Debug, Clone)]
pub struct WriterMetrics {
    pub(crate) created_segments_total: Counter,
    pub(crate) finalized_segments_total: Counter,
    pub(crate) incomplete_segments_total: Counter,
    pub(crate) aborted_segments_total: Counter,
    pub(crate) written_bytes_total: Counter,
    pub(crate) rejected_sequences_total: Counter,
}
impl WriterMetrics {
    pub(crate) fn new(node_id: NodeId) -> Result<Self> {
        let node = node_id.to_string();
        let counter = |name: &str, help: &str| {
            track!(CounterBuilder::new(name)
                .namespace("nimbusio")
                .subsystem("data_writer")
                .help(help)
                .label("node", &node)
                .default_registry()
                .finish())
        };
        Ok(WriterMetrics {
            created_segments_total: counter(
                "created_segments_total",
                "Number of created segments",
            )?,
            finalized_segments_total: counter(
                "finalized_segments_total",
                "Number of finalized segments",
            )?,
            incomplete_segments_total: counter(
                "incomplete_segments_total",
                "Number of segments which failed the final size or digest check",
            )?,
            aborted_segments_total: counter(
                "aborted_segments_total",
                "Number of aborted segments",
            )?,
            written_bytes_total: counter(
                "written_bytes_total",
                "Number of payload bytes written (including padding)",
            )?,
            rejected_sequences_total: counter(
                "rejected_sequences_total",
                "Number of rejected sequence chunks",
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub(crate) canceled_segments_total: Counter,
    pub(crate) segment_duration_seconds: Histogram,
}
impl ServiceMetrics {
    pub(crate) fn new(node_id: NodeId) -> Result<Self> {
        let node = node_id.to_string();
        let canceled_segments_total = track!(CounterBuilder::new("canceled_segments_total")
            .namespace("nimbusio")
            .subsystem("data_writer")
            .help("Number of segment streams closed without a finish message")
            .label("node", &node)
            .default_registry()
            .finish())?;
        let segment_duration_seconds = track!(HistogramBuilder::new("segment_duration_seconds")
            .namespace("nimbusio")
            .subsystem("data_writer")
            .help("Time from segment creation to its final outcome")
            .bucket(0.001)
            .bucket(0.01)
            .bucket(0.1)
            .bucket(1.0)
            .bucket(10.0)
            .bucket(60.0)
            .label("node", &node)
            .default_registry()
            .finish())?;
        Ok(ServiceMetrics {
            canceled_segments_total,
            segment_duration_seconds,
        })
    }
}
