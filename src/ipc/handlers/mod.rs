pub mod assignments;
pub mod batch;
pub mod classes;
pub mod core;
pub mod questions;
pub mod reports;
pub mod scores;
pub mod stats;
pub mod students;
