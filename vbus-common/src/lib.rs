pub mod clock;
pub mod consolidator;
pub mod header;
pub mod header_set;
pub mod mapping;
pub mod metrics;
pub mod settlement;
pub mod specification;
