pub mod backend;
pub mod chunk;
pub mod config;
pub mod copy;
pub mod error;
pub mod file;
pub mod location;
pub mod mem;
pub mod multiple;
pub mod retrieve;
pub mod system;
pub mod traits;

pub use backend::{BackendKind, DataBackend};
pub use config::DataConfig;
pub use copy::{BucketView, CopyObjectRequest};
pub use error::DriverError;
pub use retrieve::{ChannelSink, ResponseSink, retrieve_data};
pub use system::{BatchDeleteReport, DataSys, PutOutcome, RequestMethod};
pub use traits::{ByteSink, DataDriver};
