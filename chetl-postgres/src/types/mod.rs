mod lsn;
mod schema;
mod tuple;

pub use lsn::*;
pub use schema::*;
pub use tuple::*;
