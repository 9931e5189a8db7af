//! Entity data model: values, keys, identities and shared instances

pub mod entity;
pub mod key;
pub mod state;
pub mod value;

pub use entity::{Entity, EntityRef, Related};
pub(crate) use entity::{DetachedState, ErasedRef, RelatedHandle};
pub use key::{Identity, Key, KeyType};
pub use state::EntityState;
pub use value::{FieldType, Row, Value};
