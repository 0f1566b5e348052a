pub mod frame;
pub mod transport;

pub use frame::{Request, Response};
pub use transport::{Transport, TransportGuard, TransportSettings};
