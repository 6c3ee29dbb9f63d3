mod stats {
	use courier_metrics::static_metrics;

	static_metrics! {
		vis => pub(crate),
		name => Metrics,
		prefix => explicit_visibility,
		labels => [cluster_name: String],
		metrics => [counter(retries)],
	}
}

fn main() {
	let metrics = stats::Metrics::new("backend".to_string());
	metrics.retries().increment(1);
	assert_eq!(stats::Metrics::retries_name(), "explicit_visibility_retries");
}
