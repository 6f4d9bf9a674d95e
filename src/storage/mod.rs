//! Storage layer: pages, cache, freelist, pager and page transforms

pub mod cache;
pub mod codec;
pub mod encoding;
pub mod freelist;
pub mod page;
pub mod pager;

pub use cache::CacheMode;
pub use codec::PageTransform;
pub use freelist::Freelist;
pub use page::{Page, PageKind, PageRef, PAGE_HEADER_SIZE};
pub use pager::Pager;
