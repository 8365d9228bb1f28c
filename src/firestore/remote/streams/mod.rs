pub mod listen;
pub mod write;

pub use listen::WatchStream;
pub use write::{WriteStream, WriteStreamResponse};
