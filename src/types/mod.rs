mod coll;
mod object;

pub use coll::CollectionId;
pub use object::{ObjectId, SnapId};
