use courier_metrics::static_metrics;

static_metrics! {
	name => Metrics,
	prefix => basic_usage,
	labels => [cluster_name: String],
	metrics => [counter(requests_retried)],
}

fn main() {
	let metrics = Metrics::new("backend".to_string());
	metrics.requests_retried().increment(1);
	assert_eq!(Metrics::requests_retried_name(), "basic_usage_requests_retried");
}
