//! FITS header/data units with lazily mapped data and in-place or staged
//! rewrites.
//!
//! An [`HduList`] is opened from a file, a buffer or a stream. Headers are
//! parsed up front; data units stay on disk until read, and are copied only
//! when written to.

pub mod bintable;
pub mod block;
pub mod card;
pub mod checksum;
pub mod column;
pub mod config;
pub mod data;
pub mod endian;
pub mod error;
pub mod hdu;
pub mod hdulist;
pub mod header;
pub mod image;
pub mod io;
pub mod table;
pub mod value;

pub use block::{BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE};
pub use card::{Card, CardBody};
pub use column::{ColumnData, ColumnDef, ColumnLayout, TableKind};
pub use config::{AccessMode, Config};
pub use data::{DataRegion, ElementType, RegionState, Scaling};
pub use error::{Error, Result};
pub use hdu::{Hdu, HduKind, HduState, Location};
pub use hdulist::{HduList, OpenMode};
pub use header::{Anchor, Header, Placement};
pub use image::{ImageData, ImageView};
pub use value::Value;
