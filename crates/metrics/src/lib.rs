//! The pool's observability side channel (spec §6 "Observability").
//!
//! A Prometheus-compatible registry producing text in the exposition
//! format. Entirely optional: nothing elsewhere in this workspace requires
//! a `Metrics` to exist, and a pool or broker that never constructs one
//! emits no metrics at all.

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Core metrics an implementation exposes if it chooses to expose any
/// (spec §6). Tenant-labeled series carry a `client_id` label; the rest are
/// process-global.
pub struct Metrics {
	registry: Registry,
	pub compile_processes_spawned_total: Counter,
	pub compile_processes_current: Gauge,
	pub client_connections_current: GaugeVec,
	pub client_connections_total: CounterVec,
	pub compile_duration_seconds: Histogram,
	pub transaction_serialization_errors_total: Counter,
	pub connection_errors_total: Counter,
}

impl Metrics {
	/// Build a fresh registry and register every metric in it. Panics only
	/// if two metrics were registered under the same name, which would be
	/// a bug in this constructor, not a runtime condition.
	#[must_use]
	pub fn new() -> Self {
		let registry = Registry::new();

		let compile_processes_spawned_total = Counter::with_opts(Opts::new(
			"compile_processes_spawned_total",
			"Number of compiler worker processes ever spawned",
		))
		.expect("valid metric opts");
		let compile_processes_current = Gauge::with_opts(Opts::new(
			"compile_processes_current",
			"Number of compiler worker processes currently live",
		))
		.expect("valid metric opts");
		let client_connections_current = GaugeVec::new(
			Opts::new("client_connections_current", "Number of client connections currently open"),
			&["tenant"],
		)
		.expect("valid metric opts");
		let client_connections_total = CounterVec::new(
			Opts::new("client_connections_total", "Number of client connections ever accepted"),
			&["tenant"],
		)
		.expect("valid metric opts");
		let compile_duration_seconds = Histogram::with_opts(HistogramOpts::new(
			"compile_duration_seconds",
			"Per-request compilation duration",
		))
		.expect("valid metric opts");
		let transaction_serialization_errors_total = Counter::with_opts(Opts::new(
			"transaction_serialization_errors_total",
			"Count of transaction-serialization errors",
		))
		.expect("valid metric opts");
		let connection_errors_total = Counter::with_opts(Opts::new(
			"connection_errors_total",
			"Count of IPC connection errors",
		))
		.expect("valid metric opts");

		registry
			.register(Box::new(compile_processes_spawned_total.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(compile_processes_current.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(client_connections_current.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(client_connections_total.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(compile_duration_seconds.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(transaction_serialization_errors_total.clone()))
			.expect("unique metric name");
		registry
			.register(Box::new(connection_errors_total.clone()))
			.expect("unique metric name");

		Self {
			registry,
			compile_processes_spawned_total,
			compile_processes_current,
			client_connections_current,
			client_connections_total,
			compile_duration_seconds,
			transaction_serialization_errors_total,
			connection_errors_total,
		}
	}

	/// Render every registered metric family in the Prometheus text
	/// exposition format, for `GET /metrics`.
	#[must_use]
	pub fn gather_text(&self) -> String {
		let families = self.registry.gather();
		let mut buf = Vec::new();
		TextEncoder::new()
			.encode(&families, &mut buf)
			.expect("exposition encoding never fails for well-formed metric families");
		String::from_utf8(buf).expect("Prometheus text exposition is always valid UTF-8")
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gathers_help_and_type_lines() {
		let m = Metrics::new();
		m.compile_processes_spawned_total.inc();
		m.client_connections_current.with_label_values(&["acme"]).set(3.0);

		let text = m.gather_text();
		assert!(text.contains("# HELP compile_processes_spawned_total"));
		assert!(text.contains("# TYPE compile_processes_spawned_total counter"));
		assert!(text.contains("compile_processes_spawned_total 1"));
		assert!(text.contains("client_connections_current{tenant=\"acme\"} 3"));
	}
}
