//! SYMFORM core library: forward-mode symbolic differentiation of
//! tensor-valued form expressions.
pub mod autodiff;
pub mod diagnostics;
pub mod expr;
pub mod shapes;

pub use autodiff::{forward_ad, forward_ad_with_options, AdError, AdOptions};
