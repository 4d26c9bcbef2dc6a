//! Built-in adapters of the `dfm` provider.
//!
//! Each adapter implements one api class of the built-in registry. Sites
//! bind them through the YAML interface table by adapter class name (see
//! [`crate::dispatch`]).

mod basic;
mod era5;
mod image;
mod timing;
mod transform;

pub use basic::{ConstantAdapter, GreetMeAdapter, SignalClientAdapter};
pub use era5::Era5Adapter;
pub use image::ConvertToImageAdapter;
pub use timing::{DelayAdapter, SlowConstantAdapter};
pub use transform::{EvalExprAdapter, MergeAdapter};
