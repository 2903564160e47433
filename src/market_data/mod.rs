pub mod candle_builder;
pub mod source;

pub use candle_builder::{CandleBuilder, TickOutcome};
pub use source::{EventSink, SourceEvent, TickSource};
