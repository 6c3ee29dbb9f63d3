use courier_metrics::static_metrics;

static_metrics! {
	name => Metrics,
	prefix => trailing_commas,
	labels => [cluster_name: String, priority: u8,],
	metrics => [counter(retries), gauge(open),],
}

fn main() {
	let metrics = Metrics::new("backend".to_string(), 1);
	metrics.open().set(1.0);
}
