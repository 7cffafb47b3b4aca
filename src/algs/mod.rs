//! Message passing: communicators, restricted sub-groups, wire records and
//! the all-to-all payload exchange.

pub mod communicator;
pub mod exchange;
pub mod sub_group;
pub mod wire;

pub use communicator::{CommTag, Communicator, ExchangeTags, NoComm, RayonComm, Wait};
pub use exchange::{PairwiseSchedule, TransferStrategy, exchange_payloads};
pub use sub_group::SubGroup;
