#![forbid(unsafe_code)]

// Relay metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds in microseconds, paired with their `le` labels.
const BUCKETS: [(u64, &str); 10] = [
    (250, "0.00025"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Point-in-time registry sizes, sampled on demand when rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySizes {
    pub connections: usize,
    pub channels: usize,
    pub rooms: usize,
    pub participants: usize,
}

#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    frames_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    chat_messages_total: AtomicU64,
    voice_joins_total: AtomicU64,
    voice_leaves_total: AtomicU64,
    signals_relayed_total: AtomicU64,

    connections_active: AtomicU64,

    event_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                frames_received_total: AtomicU64::new(0),
                frames_sent_total: AtomicU64::new(0),
                frames_dropped_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                voice_joins_total: AtomicU64::new(0),
                voice_leaves_total: AtomicU64::new(0),
                signals_relayed_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_received(&self) {
        self.inner.frames_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_sent(&self) {
        self.inner.frames_sent_total.fetch_add(1, Relaxed);
    }

    pub fn add_frames_dropped(&self, n: u64) {
        if n > 0 {
            self.inner.frames_dropped_total.fetch_add(n, Relaxed);
        }
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_voice_joins(&self) {
        self.inner.voice_joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_voice_leaves(&self) {
        self.inner.voice_leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_relayed(&self) {
        self.inner.signals_relayed_total.fetch_add(1, Relaxed);
    }

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    pub fn errors_total(&self) -> u64 {
        self.inner.errors_total.load(Relaxed)
    }

    pub fn frames_dropped_total(&self) -> u64 {
        self.inner.frames_dropped_total.load(Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self, sizes: RegistrySizes) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "echosphere_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "echosphere_frames_received_total", "Total frames received from clients", i.frames_received_total.load(Relaxed));
        render_counter(&mut out, "echosphere_frames_sent_total", "Total frames written to clients", i.frames_sent_total.load(Relaxed));
        render_counter(&mut out, "echosphere_frames_dropped_total", "Queued frames discarded by the drop-oldest policy", i.frames_dropped_total.load(Relaxed));
        render_counter(&mut out, "echosphere_errors_total", "Total error events returned to clients", i.errors_total.load(Relaxed));
        render_counter(&mut out, "echosphere_chat_messages_total", "Total chat messages persisted and broadcast", i.chat_messages_total.load(Relaxed));
        render_counter(&mut out, "echosphere_voice_joins_total", "Total voice room joins", i.voice_joins_total.load(Relaxed));
        render_counter(&mut out, "echosphere_voice_leaves_total", "Total voice room departures", i.voice_leaves_total.load(Relaxed));
        render_counter(&mut out, "echosphere_signals_relayed_total", "Total signaling payloads relayed", i.signals_relayed_total.load(Relaxed));

        render_gauge(&mut out, "echosphere_connections_active", "Currently open WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "echosphere_connections_registered", "Connections registered with the gateway", sizes.connections as u64);
        render_gauge(&mut out, "echosphere_channels_active", "Chat channels with at least one subscriber", sizes.channels as u64);
        render_gauge(&mut out, "echosphere_rooms_active", "Voice rooms with at least one participant", sizes.rooms as u64);
        render_gauge(&mut out, "echosphere_participants_active", "Voice participants across all rooms", sizes.participants as u64);

        i.event_handling.render(
            "echosphere_event_handling_seconds",
            "Inbound event handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_event_handling(Duration::from_micros(100));
        metrics.observe_event_handling(Duration::from_millis(20));
        let text = metrics.render_prometheus(RegistrySizes::default());
        assert!(text.contains("echosphere_event_handling_seconds_bucket{le=\"0.00025\"} 1"));
        assert!(text.contains("echosphere_event_handling_seconds_bucket{le=\"0.025\"} 2"));
        assert!(text.contains("echosphere_event_handling_seconds_count 2"));
    }

    #[test]
    fn test_active_guard_decrements_on_drop() {
        let metrics = ServerMetrics::new();
        let guard = metrics.connection_active_guard();
        assert!(metrics
            .render_prometheus(RegistrySizes::default())
            .contains("echosphere_connections_active 1"));
        drop(guard);
        assert!(metrics
            .render_prometheus(RegistrySizes::default())
            .contains("echosphere_connections_active 0"));
    }

    #[test]
    fn test_registry_sizes_are_rendered() {
        let metrics = ServerMetrics::new();
        let text = metrics.render_prometheus(RegistrySizes {
            connections: 4,
            channels: 3,
            rooms: 2,
            participants: 5,
        });
        assert!(text.contains("echosphere_channels_active 3"));
        assert!(text.contains("echosphere_rooms_active 2"));
        assert!(text.contains("echosphere_participants_active 5"));
    }
}
