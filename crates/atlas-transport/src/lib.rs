//! atlas-transport — the reliable-delivery layer riding on top of the
//! fixed-MTU, half-duplex radio link: reassembly, dedupe, spool, reliability
//! strategies, and the transport core that ties them together.

pub mod deduper;
pub mod radio;
pub mod reassembler;
pub mod reliability;
pub mod spool;
pub mod transport;

pub use deduper::Deduper;
pub use radio::RadioLink;
pub use reassembler::Reassembler;
pub use spool::Spool;
pub use transport::Transport;
