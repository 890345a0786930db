//! Swaps, exchanges, their settlement and the notifications and messages
//! that travel with them.

mod exchanges;
mod messages;
mod notify;
mod swaps;

pub use exchanges::{ExchangeDetail, ExchangeProposal, ExchangeService};
pub use messages::{MAX_MESSAGE_CHARS, MessageService, Transcript};
pub use notify::Notifier;
pub use swaps::{SwapProposal, SwapService};
