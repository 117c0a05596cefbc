pub mod handler;

pub use tokio_util::sync::CancellationToken;
