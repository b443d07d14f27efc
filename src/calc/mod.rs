pub mod aggregate;
pub mod completion;
pub mod recalc;
pub mod scoring;
pub mod validate;
