pub mod processor;

pub use processor::{process_available, run_processor, ProcessorError};
