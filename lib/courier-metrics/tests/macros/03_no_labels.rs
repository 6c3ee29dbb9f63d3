use courier_metrics::static_metrics;

static_metrics! {
	name => Metrics,
	prefix => no_labels,
	metrics => [counter(retries), histogram(backoff_ms)],
}

fn main() {
	let metrics = Metrics::new();
	metrics.retries().increment(1);
	metrics.backoff_ms().record(25.0);
}
