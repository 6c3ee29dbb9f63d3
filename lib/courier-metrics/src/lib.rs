//! Helpers for declaring and testing metrics.

mod macros;


#[doc(hidden)]
pub use paste as __paste;

/// A type that can be rendered as a metric label value.
///
/// Blanket-implemented for anything that implements `Display`, so label values declared in `static_metrics!` can be
/// integers, enums, or strings without manual conversion.
pub trait Stringable {
    /// Renders `self` as a label value.
    fn to_shared_string(&self) -> ::metrics::SharedString;
}

impl<T> Stringable for T
where
    T: std::fmt::Display,
{
    fn to_shared_string(&self) -> ::metrics::SharedString {
        std::string::ToString::to_string(&self).into()
    }
}
