//! Prometheus metrics for the synchronization core

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Counters and gauges labelled by endpoint
#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    /// Inbound frames received
    pub frames: IntCounterVec,
    /// Frames the adapter could not decode
    pub protocol_errors: IntCounterVec,
    /// Book desyncs, labelled by reason
    pub desyncs: IntCounterVec,
    /// Successful reconnects
    pub reconnects: IntCounterVec,
    /// Topic resolutions published to waiters
    pub resolutions: IntCounterVec,
    /// Topics currently subscribed
    pub topics: IntGaugeVec,
}

impl SyncMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let frames = IntCounterVec::new(
            Opts::new("sync_frames_total", "Inbound frames received"),
            &["endpoint"],
        )?;
        let protocol_errors = IntCounterVec::new(
            Opts::new("sync_protocol_errors_total", "Frames dropped by the adapter"),
            &["endpoint"],
        )?;
        let desyncs = IntCounterVec::new(
            Opts::new("sync_desyncs_total", "Order book desyncs"),
            &["endpoint", "reason"],
        )?;
        let reconnects = IntCounterVec::new(
            Opts::new("sync_reconnects_total", "Successful reconnects"),
            &["endpoint"],
        )?;
        let resolutions = IntCounterVec::new(
            Opts::new("sync_resolutions_total", "Topic updates published"),
            &["endpoint"],
        )?;
        let topics = IntGaugeVec::new(
            Opts::new("sync_topics", "Subscribed topics"),
            &["endpoint"],
        )?;

        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(protocol_errors.clone()))?;
        registry.register(Box::new(desyncs.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(resolutions.clone()))?;
        registry.register(Box::new(topics.clone()))?;

        Ok(Self {
            registry,
            frames,
            protocol_errors,
            desyncs,
            reconnects,
            resolutions,
            topics,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
