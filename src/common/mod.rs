mod finger_table;
mod id;
mod messages;
mod node;
mod successor_list;

pub use finger_table::*;
pub use id::*;
pub use messages::*;
pub use node::*;
pub use successor_list::*;
