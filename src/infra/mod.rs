pub mod http_queue;
pub mod log_queue;

pub use http_queue::HttpDownstreamQueue;
pub use log_queue::LogOnlyQueue;
