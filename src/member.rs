use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;

use crate::error::{Error, ErrorKind, Result};

/// Positional call arguments with typed extraction.
///
/// The wire carries untagged JSON values; the member table knows the static
/// types and pulls each argument out here.
pub struct Args<'a>(pub &'a [serde_json::Value]);

impl Args<'_> {
    /// # Errors
    ///
    /// `InvalidArguments` when the argument is missing or mistyped.
    pub fn get<A: DeserializeOwned>(&self, i: usize) -> Result<A> {
        let value = self.0.get(i).ok_or_else(|| {
            Error::new(ErrorKind::InvalidArguments, format!("missing argument {i}"))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::new(ErrorKind::InvalidArguments, e.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

type Getter<T> = Box<dyn Fn(&T) -> Result<serde_json::Value> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&T, serde_json::Value) -> Result<()> + Send + Sync>;
type MethodFn<T> = Box<dyn Fn(&T, Args<'_>) -> Result<serde_json::Value> + Send + Sync>;

/// The declared members of one remotable type: every property and method a
/// client may address by name. Built once per type at startup; dispatch is a
/// plain map lookup, no runtime reflection.
pub struct MemberTable<T: ?Sized> {
    getters: HashMap<String, Getter<T>, RandomState>,
    setters: HashMap<String, Setter<T>, RandomState>,
    methods: HashMap<String, MethodFn<T>, RandomState>,
}

impl<T: ?Sized> Default for MemberTable<T> {
    fn default() -> Self {
        Self {
            getters: HashMap::default(),
            setters: HashMap::default(),
            methods: HashMap::default(),
        }
    }
}

impl<T: ?Sized> MemberTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a readable property.
    #[must_use]
    pub fn getter<V, F>(mut self, name: &str, f: F) -> Self
    where
        V: Serialize,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.getters.insert(
            name.to_string(),
            Box::new(move |target| {
                serde_json::to_value(f(target))
                    .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))
            }),
        );
        self
    }

    /// Declares a writable property; the setter receives the already-decoded
    /// typed value.
    #[must_use]
    pub fn setter<V, F>(mut self, name: &str, f: F) -> Self
    where
        V: DeserializeOwned,
        F: Fn(&T, V) + Send + Sync + 'static,
    {
        self.setters.insert(
            name.to_string(),
            Box::new(move |target, value| {
                let value = serde_json::from_value(value)
                    .map_err(|e| Error::new(ErrorKind::InvalidArguments, e.to_string()))?;
                f(target, value);
                Ok(())
            }),
        );
        self
    }

    /// Declares a callable method.
    #[must_use]
    pub fn method<V, F>(mut self, name: &str, f: F) -> Self
    where
        V: Serialize,
        F: Fn(&T, Args<'_>) -> Result<V> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Box::new(move |target, args| {
                serde_json::to_value(f(target, args)?)
                    .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))
            }),
        );
        self
    }

    /// # Errors
    ///
    /// `UnknownMember` when no such property is declared.
    pub fn get(&self, target: &T, name: &str) -> Result<serde_json::Value> {
        let getter = self.getters.get(name).ok_or_else(|| unknown_member(name))?;
        getter(target)
    }

    /// # Errors
    pub fn set(&self, target: &T, name: &str, value: serde_json::Value) -> Result<()> {
        let setter = self.setters.get(name).ok_or_else(|| unknown_member(name))?;
        setter(target, value)
    }

    /// # Errors
    pub fn call(&self, target: &T, name: &str, args: Args<'_>) -> Result<serde_json::Value> {
        let method = self.methods.get(name).ok_or_else(|| unknown_member(name))?;
        method(target, args)
    }

    /// Serializes every declared getter into one JSON object, the object's
    /// full state as seen by a fresh subscriber.
    ///
    /// # Errors
    pub fn full_state(&self, target: &T) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut state = serde_json::Map::new();
        for (name, getter) in &self.getters {
            state.insert(name.clone(), getter(target)?);
        }
        Ok(state)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &String> {
        self.getters.keys()
    }
}

fn unknown_member(name: &str) -> Error {
    Error::new(ErrorKind::UnknownMember, format!("no such member: {name}"))
}

impl<T: ?Sized> std::fmt::Debug for MemberTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberTable")
            .field("getters", &self.getters.keys())
            .field("setters", &self.setters.keys())
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter {
        value: AtomicI64,
    }

    fn table() -> MemberTable<Counter> {
        MemberTable::new()
            .getter("Value", |c: &Counter| c.value.load(Ordering::Acquire))
            .setter("Value", |c: &Counter, v: i64| {
                c.value.store(v, Ordering::Release);
            })
            .method("Add", |c: &Counter, args| {
                let delta: i64 = args.get(0)?;
                Ok(c.value.fetch_add(delta, Ordering::AcqRel) + delta)
            })
    }

    #[test]
    fn test_member_dispatch() {
        let table = table();
        let counter = Counter {
            value: AtomicI64::new(3),
        };

        assert_eq!(table.get(&counter, "Value").unwrap(), serde_json::json!(3));
        table.set(&counter, "Value", serde_json::json!(10)).unwrap();
        let sum = table
            .call(&counter, "Add", Args(&[serde_json::json!(5)]))
            .unwrap();
        assert_eq!(sum, serde_json::json!(15));

        let state = table.full_state(&counter).unwrap();
        assert_eq!(state.get("Value").unwrap(), &serde_json::json!(15));
    }

    #[test]
    fn test_member_errors() {
        let table = table();
        let counter = Counter {
            value: AtomicI64::new(0),
        };

        assert_eq!(
            table.get(&counter, "Missing").unwrap_err().kind,
            ErrorKind::UnknownMember
        );
        assert_eq!(
            table
                .set(&counter, "Value", serde_json::json!("nope"))
                .unwrap_err()
                .kind,
            ErrorKind::InvalidArguments
        );
        assert_eq!(
            table.call(&counter, "Add", Args(&[])).unwrap_err().kind,
            ErrorKind::InvalidArguments
        );
    }
}
