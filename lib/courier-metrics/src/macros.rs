#[doc(hidden)]
#[macro_export]
macro_rules! __static_metric_handle {
    (counter) => { ::metrics::Counter };
    (gauge) => { ::metrics::Gauge };
    (histogram) => { ::metrics::Histogram };
    ($other:ident) => {
        compile_error!(concat!("unsupported metric kind `", stringify!($other), "`: expected `counter`, `gauge`, or `histogram`"))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __static_metric_register {
    (counter, $key:expr, $labels:expr) => { ::metrics::counter!($key, $labels) };
    (gauge, $key:expr, $labels:expr) => { ::metrics::gauge!($key, $labels) };
    (histogram, $key:expr, $labels:expr) => { ::metrics::histogram!($key, $labels) };
}

/// Declares a fixed set of metrics that share the same labels.
///
/// Call sites that emit the same few metrics over and over end up repeating metric names and rebuilding labels each
/// time. `static_metrics!` generates a container struct instead: its `new` constructor takes one argument per label,
/// registers every metric once with those labels, and each metric is then reachable through an accessor of the same
/// name.
///
/// Each metric is registered as `<prefix>_<metric>`. The full name is also returned by a generated `<metric>_name()`
/// associated function, which keeps assertions in tests in sync with the registered name.
///
/// The `vis` and `labels` entries are optional. Without `vis`, the struct is private to the declaring module. Label
/// values can be of any type implementing `Display`.
///
/// ## Example
///
/// ```rust
/// # use courier_metrics::static_metrics;
/// static_metrics!(
///    vis => pub(crate),
///    name => ListenerMetrics,
///    prefix => listener,
///    labels => [listener_name: String, port: u16],
///    metrics => [
///        counter(connections_accepted),
///        gauge(connections_active),
///    ],
/// );
///
/// let metrics = ListenerMetrics::new("ingress".to_string(), 8080);
/// metrics.connections_accepted().increment(1);
/// metrics.connections_active().set(1.0);
/// assert_eq!(ListenerMetrics::connections_accepted_name(), "listener_connections_accepted");
/// ```
#[macro_export]
macro_rules! static_metrics {
    (
        $(vis => $vis:vis,)?
        name => $name:ident,
        prefix => $prefix:ident,
        $(labels => [$($label_key:ident: $label_ty:ty),* $(,)?],)?
        metrics => [$($kind:ident($metric:ident)),+ $(,)?] $(,)?
    ) => {
        #[derive(Clone)]
        $($vis)? struct $name {
            $($metric: $crate::__static_metric_handle!($kind),)+
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new($($($label_key: $label_ty),*)?) -> Self
            where
                $($($label_ty: $crate::Stringable,)*)?
            {
                #[allow(unused_imports)]
                use $crate::Stringable as _;

                #[allow(unused_mut)]
                let mut labels = ::std::vec::Vec::<::metrics::Label>::new();
                $($(
                    labels.push(::metrics::Label::new(stringify!($label_key), $label_key.to_shared_string()));
                )*)?

                Self {
                    $($metric: $crate::__static_metric_register!(
                        $kind,
                        concat!(stringify!($prefix), "_", stringify!($metric)),
                        labels.clone()
                    ),)+
                }
            }

            $(
                pub fn $metric(&self) -> &$crate::__static_metric_handle!($kind) {
                    &self.$metric
                }

                $crate::__paste::paste! {
                    #[allow(dead_code)]
                    pub const fn [<$metric _name>]() -> &'static str {
                        concat!(stringify!($prefix), "_", stringify!($metric))
                    }
                }
            )+
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}
