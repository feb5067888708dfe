pub mod runtime;
pub mod timing;
