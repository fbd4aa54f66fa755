use crate::ConcurrentMap;
use serde::{
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::fmt::{self, Formatter};
use std::hash::BuildHasher;
use std::marker::PhantomData;

struct ConcurrentMapVisitor<V, S> {
    value_marker: PhantomData<V>,
    hash_builder_marker: PhantomData<S>,
}

impl<V, S> Serialize for ConcurrentMap<V, S>
where
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        // the length may change while we walk the segments, so don't promise one
        let mut map = serializer.serialize_map(None)?;
        let mut result = Ok(());
        self.for_each(|k, v| {
            if result.is_ok() {
                result = map.serialize_entry(k, v);
            }
        });
        result?;
        map.end()
    }
}

impl<'de, V, S> Deserialize<'de> for ConcurrentMap<V, S>
where
    V: Deserialize<'de> + Send + Sync,
    S: Default + BuildHasher,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ConcurrentMapVisitor::new())
    }
}

impl<V, S> ConcurrentMapVisitor<V, S> {
    pub(crate) fn new() -> Self {
        Self {
            value_marker: PhantomData,
            hash_builder_marker: PhantomData,
        }
    }
}

impl<'de, V, S> Visitor<'de> for ConcurrentMapVisitor<V, S>
where
    V: Deserialize<'de> + Send + Sync,
    S: Default + BuildHasher,
{
    type Value = ConcurrentMap<V, S>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map with string keys")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = ConcurrentMap::default();
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            if !map.put(key, value).map_err(de::Error::custom)? {
                return Err(de::Error::custom("serialized map held two values with the same key"));
            }
        }
        Ok(map)
    }
}
