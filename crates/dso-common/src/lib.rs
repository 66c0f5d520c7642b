//! # DSO common
//!
//! Identity and wire model shared by the managed object store (server) and
//! the client object manager.
//!
//! - [`ObjectId`]: process-independent, monotonically assigned identifier
//! - [`ObjectIdSet`]: compact ordered id set stored as ranges
//! - [`Dna`]: full state or delta of one object, as an ordered action list
//! - [`DsoError`]: the error taxonomy crossing the store/client boundary

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod dna;
pub mod error;
pub mod id;
pub mod id_set;
pub mod value;

pub use dna::{Dna, DnaAction, DnaKind, DnaWriter, LogicalOp};
pub use error::{DsoError, DsoResult};
pub use id::{ClientId, LockScope, NULL_OBJECT_ID, ObjectId, ObjectIdBatch};
pub use id_set::ObjectIdSet;
pub use value::Value;
