pub mod sink;
pub mod writer;

pub use sink::TimeseriesSink;
pub use writer::PersistenceWriter;
