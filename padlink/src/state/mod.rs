pub mod cache;
pub mod record;
pub mod store;

pub use cache::ButtonCache;
pub use record::{
    Address, ButtonRecord, ButtonState, Edge, EdgeCounter, EdgeKind,
};
pub use store::ButtonStore;
