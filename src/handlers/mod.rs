//! 핸들러 모듈

pub mod connection;
pub mod room;
pub mod signaling;
pub mod sync;
pub mod turn;

pub use connection::*;
pub use room::*;
pub use signaling::*;
pub use sync::*;
pub use turn::*;
