use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.simple().to_string()[24..])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Identity of an object in the observed graph. Assigned once at construction
// and never derived from the object's state.
uuid_id!(ObjectId);
uuid_id!(ListenerId);
uuid_id!(MementoId);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<ObjectId> = (0..1000).map(|_| ObjectId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = MementoId::new();
        let b = MementoId::new();
        assert!(a < b, "expected {a:?} < {b:?}");
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = ObjectId::new();
        let debug = format!("{id:?}");
        assert!(debug.starts_with("ObjectId("));
        assert_eq!(debug.len(), "ObjectId()".len() + 8);
    }
}
