pub mod feed;
pub mod memory;

pub use feed::{ChangeFeed, Subscription};
pub use memory::InMemoryMarketStore;
