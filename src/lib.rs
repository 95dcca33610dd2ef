mod bins;
mod btree;
mod cache;
mod cursor;
mod db;
mod error;
mod file_lock;
mod history;
mod id;
mod integrity;
mod overflow;
mod page;
mod pager;

pub use btree::Comparator;
pub use cursor::{Cursor, RangePolicy};
pub use db::{OpenMode, Setting, Stats, Store, Transaction};
pub use error::Error;
