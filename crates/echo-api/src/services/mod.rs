//! Boundary services between HTTP handlers and the pipeline.

pub mod lookup;
pub mod producer;

pub use lookup::ResultLookup;
pub use producer::JobProducer;
