//! Mock instantiation of the abstract [`client`](super) interface.
//!
//! This instantiation is built on a simple in-memory database. It is useful for testing in
//! isolation from an actual Tarantool instance. Besides data operations it understands the small
//! set of schema functions used by this crate (`box.schema.space.create`, `box.space.<name>:format`,
//! `:create_index`, `:truncate` and `:drop`), and arbitrary functions can be registered with
//! [`Client::register_function`].
#![cfg(any(test, feature = "mocks"))]

use super::{
    Error as _, ErrorKind, FieldMetadata, IndexMetadata, SpaceMetadata, Tuple, UpdateOperation,
};
use crate::query::{compare_keys, Conditions};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use rmpv::Value;
use snafu::Snafu;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Display;

/// Errors returned by the in-memory database.
#[derive(Debug, Snafu)]
#[snafu(display("mock DB error ({}): {}", kind, message))]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl super::Error for Error {
    fn new(kind: ErrorKind, msg: impl Display) -> Self {
        Self {
            kind,
            message: msg.to_string(),
        }
    }

    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// A function which can be called through the mock client.
pub type Function = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, Error> + Send + Sync>;

/// The in-memory database.
#[derive(Default)]
struct Db {
    spaces: HashMap<String, Space>,
    functions: HashMap<String, Function>,
    next_space_id: u32,
}

/// An in-memory space.
#[derive(Debug)]
struct Space {
    metadata: SpaceMetadata,
    /// Tuples in primary key order.
    tuples: Vec<Tuple>,
}

impl Space {
    fn primary(&self) -> Result<&IndexMetadata, Error> {
        self.metadata.primary_index().ok_or_else(|| {
            Error::new(
                ErrorKind::NoSuchIndex,
                format!("space {} has no primary index", self.metadata.name),
            )
        })
    }

    /// Find the position of the tuple with primary key `key`, or where it would be inserted.
    fn search(&self, key: &[Value]) -> Result<Result<usize, usize>, Error> {
        let primary = self.primary()?;
        Ok(self
            .tuples
            .binary_search_by(|t| compare_keys(&primary.key_of(t), key)))
    }

    fn check_format(&self, tuple: &[Value]) -> Result<(), Error> {
        for (i, field) in self.metadata.format.iter().enumerate() {
            let missing = matches!(tuple.get(i), None | Some(Value::Nil));
            if missing && !field.is_nullable && field.ty != "any" {
                return Err(Error::new(
                    ErrorKind::TupleConversion,
                    format!(
                        "tuple field {} ({}) required by space format is missing",
                        i + 1,
                        field.name
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Check that `tuple` does not conflict with any tuple other than the one at `skip` in a unique
    /// index.
    fn check_unique(&self, tuple: &[Value], skip: Option<usize>) -> Result<(), Error> {
        for index in self.metadata.indexes.iter().filter(|i| i.unique) {
            let key = index.key_of(tuple);
            let conflict = self
                .tuples
                .iter()
                .enumerate()
                .any(|(i, t)| Some(i) != skip && compare_keys(&index.key_of(t), &key).is_eq());
            if conflict {
                return Err(Error::new(
                    ErrorKind::SpaceOperation,
                    format!(
                        "Duplicate key exists in unique index \"{}\" in space \"{}\"",
                        index.name, self.metadata.name
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, tuple: Tuple) -> Result<Tuple, Error> {
        self.check_format(&tuple)?;
        let key = self.primary()?.key_of(&tuple);
        match self.search(&key)? {
            Ok(_) => Err(Error::new(
                ErrorKind::SpaceOperation,
                format!(
                    "Duplicate key exists in unique index \"{}\" in space \"{}\"",
                    self.primary()?.name,
                    self.metadata.name
                ),
            )),
            Err(pos) => {
                self.check_unique(&tuple, None)?;
                self.tuples.insert(pos, tuple.clone());
                Ok(tuple)
            }
        }
    }

    fn replace(&mut self, tuple: Tuple) -> Result<Tuple, Error> {
        self.check_format(&tuple)?;
        let key = self.primary()?.key_of(&tuple);
        match self.search(&key)? {
            Ok(pos) => {
                self.check_unique(&tuple, Some(pos))?;
                self.tuples[pos] = tuple.clone();
            }
            Err(pos) => {
                self.check_unique(&tuple, None)?;
                self.tuples.insert(pos, tuple.clone());
            }
        }
        Ok(tuple)
    }

    fn update(&mut self, key: &[Value], ops: &[UpdateOperation]) -> Result<Option<Tuple>, Error> {
        let Ok(pos) = self.search(key)? else { return Ok(None); };
        let mut tuple = self.tuples[pos].clone();
        for op in ops {
            apply(&mut tuple, op)?;
        }
        let primary = self.primary()?;
        if compare_keys(&primary.key_of(&tuple), key) != Ordering::Equal {
            return Err(Error::new(
                ErrorKind::SpaceOperation,
                format!(
                    "Attempt to modify a tuple field which is part of primary index in space '{}'",
                    self.metadata.name
                ),
            ));
        }
        self.check_format(&tuple)?;
        self.check_unique(&tuple, Some(pos))?;
        self.tuples[pos] = tuple.clone();
        Ok(Some(tuple))
    }

    fn delete(&mut self, key: &[Value]) -> Result<Option<Tuple>, Error> {
        match self.search(key)? {
            Ok(pos) => Ok(Some(self.tuples.remove(pos))),
            Err(_) => Ok(None),
        }
    }
}

/// Apply a single update operation to a tuple.
fn apply(tuple: &mut Tuple, op: &UpdateOperation) -> Result<(), Error> {
    if tuple.len() <= op.field {
        tuple.resize(op.field + 1, Value::Nil);
    }
    let field = &mut tuple[op.field];
    *field = match op.op.as_str() {
        "=" => op.value.clone(),
        "+" | "-" => {
            let (Some(l), Some(r)) = (field.as_i64(), op.value.as_i64()) else {
                return Err(Error::new(
                    ErrorKind::SpaceOperation,
                    format!(
                        "argument type in operation '{}' on field {} does not match field type",
                        op.op,
                        op.field + 1
                    ),
                ));
            };
            Value::from(if op.op == "+" { l + r } else { l - r })
        }
        other => {
            return Err(Error::new(
                ErrorKind::SpaceOperation,
                format!("unknown UPDATE operation '{other}'"),
            ))
        }
    };
    Ok(())
}

/// A connection to the in-memory database.
#[derive(Clone)]
pub struct Client(Arc<RwLock<Db>>);

impl Client {
    /// Create a new database and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. It will not be connected or
    /// related to any previous connection or database. Once the database is created, this
    /// connection can be [cloned](Clone) in order to create multiple simultaneous connections to
    /// the same database.
    pub fn create() -> Self {
        Self(Arc::new(RwLock::new(Db {
            next_space_id: 512,
            ..Default::default()
        })))
    }

    /// Create a space.
    ///
    /// The space ID in `metadata` is ignored; spaces are numbered in order of creation.
    pub async fn create_space(&self, metadata: SpaceMetadata) -> Result<(), Error> {
        self.create_space_with_tuples(metadata, []).await
    }

    /// Create a space and populate it with tuples.
    pub async fn create_space_with_tuples(
        &self,
        mut metadata: SpaceMetadata,
        tuples: impl IntoIterator<Item = Tuple>,
    ) -> Result<(), Error> {
        let mut db = self.0.write().await;
        if db.spaces.contains_key(&metadata.name) {
            return Err(Error::new(
                ErrorKind::SpaceOperation,
                format!("space {} already exists", metadata.name),
            ));
        }
        metadata.id = db.next_space_id;
        let mut space = Space {
            metadata,
            tuples: vec![],
        };
        for tuple in tuples {
            space.insert(tuple)?;
        }
        db.next_space_id += 1;
        db.spaces.insert(space.metadata.name.clone(), space);
        Ok(())
    }

    /// Make `f` callable as the stored function `name`.
    pub async fn register_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>, Error> + Send + Sync + 'static,
    {
        self.0.write().await.functions.insert(name.into(), Arc::new(f));
    }

    /// Get all tuples in `space`.
    pub async fn tuples(&self, space: &str) -> Result<Vec<Tuple>, Error> {
        let db = self.0.read().await;
        Ok(db
            .spaces
            .get(space)
            .ok_or_else(|| Error::no_such_space(space))?
            .tuples
            .clone())
    }

    async fn with_space<T>(
        &self,
        space: &str,
        f: impl FnOnce(&mut Space) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut db = self.0.write().await;
        let space = db
            .spaces
            .get_mut(space)
            .ok_or_else(|| Error::no_such_space(space))?;
        f(space)
    }

    /// Handle a call to one of the schema methods of `box.space.<name>`.
    async fn call_space_method(
        &self,
        space: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, Error> {
        match method {
            "truncate" => {
                self.with_space(space, |s| {
                    s.tuples.clear();
                    Ok(())
                })
                .await?;
                Ok(vec![])
            }
            "drop" => {
                let mut db = self.0.write().await;
                db.spaces
                    .remove(space)
                    .ok_or_else(|| Error::no_such_space(space))?;
                Ok(vec![])
            }
            "format" => {
                let format = args
                    .first()
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::custom("format expects an array of fields"))?
                    .iter()
                    .map(parse_field)
                    .collect::<Result<Vec<_>, _>>()?;
                self.with_space(space, |s| {
                    s.metadata.format = format;
                    Ok(())
                })
                .await?;
                Ok(vec![])
            }
            "create_index" => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::custom("create_index expects an index name"))?
                    .to_string();
                let opts = args.get(1).cloned().unwrap_or(Value::Map(vec![]));
                self.with_space(space, |s| {
                    let index = parse_index(&s.metadata, name, &opts)?;
                    s.metadata.indexes.push(index);
                    Ok(())
                })
                .await?;
                Ok(vec![])
            }
            _ => Err(Error::new(
                ErrorKind::NoSuchProcedure,
                format!("Procedure 'box.space.{space}:{method}' is not defined"),
            )),
        }
    }
}

fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn parse_field(field: &Value) -> Result<FieldMetadata, Error> {
    let name = map_get(field, "name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::custom("field format requires a name"))?;
    let ty = map_get(field, "type").and_then(Value::as_str).unwrap_or("any");
    let is_nullable = map_get(field, "is_nullable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(FieldMetadata {
        name: name.into(),
        ty: ty.into(),
        is_nullable,
    })
}

fn parse_index(space: &SpaceMetadata, name: String, opts: &Value) -> Result<IndexMetadata, Error> {
    let parts = map_get(opts, "parts")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::custom("create_index expects parts"))?
        .iter()
        .map(|part| {
            let field = part
                .as_str()
                .ok_or_else(|| Error::custom("index parts must be field names"))?;
            space.field_position(field).ok_or_else(|| {
                Error::new(
                    ErrorKind::NoSuchField,
                    format!("field {field} not found in space {}", space.name),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let unique = map_get(opts, "unique")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    Ok(IndexMetadata::new(
        space.indexes.len() as u32,
        name,
        unique,
        parts,
    ))
}

#[async_trait]
impl super::Client for Client {
    type Error = Error;

    async fn space(&self, space: &str) -> Result<Option<SpaceMetadata>, Error> {
        let db = self.0.read().await;
        Ok(db.spaces.get(space).map(|s| s.metadata.clone()))
    }

    async fn refresh_metadata(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn select(&self, space: &str, conditions: &Conditions) -> Result<Vec<Tuple>, Error> {
        let db = self.0.read().await;
        let space = db
            .spaces
            .get(space)
            .ok_or_else(|| Error::no_such_space(space))?;
        conditions.filter(space.tuples.iter().cloned(), &space.metadata)
    }

    async fn insert(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Error> {
        self.with_space(space, |s| Ok(vec![s.insert(tuple)?])).await
    }

    async fn replace(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Error> {
        self.with_space(space, |s| Ok(vec![s.replace(tuple)?])).await
    }

    async fn update(
        &self,
        space: &str,
        key: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<Vec<Tuple>, Error> {
        self.with_space(space, |s| Ok(s.update(&key, &ops)?.into_iter().collect()))
            .await
    }

    async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), Error> {
        self.with_space(space, |s| {
            let key = s.primary()?.key_of(&tuple);
            if s.update(&key, &ops)?.is_none() {
                s.insert(tuple)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, space: &str, key: Tuple) -> Result<Vec<Tuple>, Error> {
        self.with_space(space, |s| Ok(s.delete(&key)?.into_iter().collect()))
            .await
    }

    async fn truncate(&self, space: &str) -> Result<(), Error> {
        self.call_space_method(space, "truncate", vec![]).await?;
        Ok(())
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        if let Some((space, method)) = function
            .strip_prefix("box.space.")
            .and_then(|f| f.split_once(':'))
        {
            return self.call_space_method(space, method, args).await;
        }
        let f = self.0.read().await.functions.get(function).cloned();
        match f {
            Some(f) => f(args),
            None => Err(Error::new(
                ErrorKind::NoSuchProcedure,
                format!("Procedure '{function}' is not defined"),
            )),
        }
    }

    async fn eval(&self, expression: &str, _args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let expression = expression.trim().trim_start_matches("return ").trim();
        if let Some(name) = expression
            .strip_prefix("box.schema.space.create('")
            .and_then(|rest| rest.strip_suffix("')"))
        {
            self.create_space(SpaceMetadata::new(0, name, vec![])).await?;
            return Ok(vec![]);
        }
        if let Some((space, method)) = expression
            .strip_prefix("box.space.")
            .and_then(|rest| rest.strip_suffix("()"))
            .and_then(|f| f.split_once(':'))
        {
            return self.call_space_method(space, method, vec![]).await;
        }
        Err(Error::new(
            ErrorKind::Function,
            format!("unsupported expression in mock DB: {expression}"),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::Client as _;

    fn users() -> SpaceMetadata {
        SpaceMetadata::new(
            0,
            "users",
            vec![
                FieldMetadata::new("id", "unsigned"),
                FieldMetadata::new("email", "string"),
                FieldMetadata::nullable("visits", "unsigned"),
            ],
        )
        .with_index(IndexMetadata::new(0, "primary", true, vec![0]))
        .with_index(IndexMetadata::new(1, "email", true, vec![1]))
    }

    fn user(id: u64, email: &str) -> Tuple {
        vec![Value::from(id), Value::from(email), Value::Nil]
    }

    #[async_std::test]
    async fn test_create_space() {
        let db = Client::create();
        db.create_space(users()).await.unwrap();
        assert_eq!(
            db.create_space(users()).await.unwrap_err().kind(),
            ErrorKind::SpaceOperation
        );

        // A duplicate tuple leaves no space behind.
        let mut posts = users();
        posts.name = "posts".into();
        assert!(db
            .create_space_with_tuples(posts.clone(), [user(1, "a@x"), user(1, "b@x")])
            .await
            .is_err());
        assert!(db.space("posts").await.unwrap().is_none());

        db.create_space(posts).await.unwrap();
        assert_eq!(db.space("users").await.unwrap().unwrap().id, 512);
        assert_eq!(db.space("posts").await.unwrap().unwrap().id, 513);
    }

    #[async_std::test]
    async fn test_insert_ordering_and_uniqueness() {
        let db = Client::create();
        db.create_space(users()).await.unwrap();
        db.insert("users", user(3, "c@x")).await.unwrap();
        db.insert("users", user(1, "a@x")).await.unwrap();
        db.insert("users", user(2, "b@x")).await.unwrap();

        let ids = db
            .tuples("users")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t[0].as_u64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, [1, 2, 3]);

        let err = db.insert("users", user(1, "z@x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpaceOperation);
        let err = db.insert("users", user(4, "a@x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpaceOperation);
        let err = db
            .insert("users", vec![Value::from(5)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TupleConversion);
    }

    #[async_std::test]
    async fn test_update_upsert_delete() {
        let db = Client::create();
        db.create_space_with_tuples(users(), [user(1, "a@x")])
            .await
            .unwrap();

        let updated = db
            .update(
                "users",
                vec![Value::from(1)],
                vec![UpdateOperation::set(2, Value::from(10))],
            )
            .await
            .unwrap();
        assert_eq!(updated[0][2], Value::from(10));

        let op = UpdateOperation {
            op: "+".into(),
            field: 2,
            value: Value::from(5),
        };
        db.upsert("users", user(1, "a@x"), vec![op.clone()])
            .await
            .unwrap();
        db.upsert("users", user(2, "b@x"), vec![op]).await.unwrap();
        let tuples = db.tuples("users").await.unwrap();
        assert_eq!(tuples[0][2], Value::from(15));
        assert_eq!(tuples[1], user(2, "b@x"));

        assert!(db
            .update("users", vec![Value::from(7)], vec![])
            .await
            .unwrap()
            .is_empty());

        let deleted = db.delete("users", vec![Value::from(2)]).await.unwrap();
        assert_eq!(deleted, [user(2, "b@x")]);
        assert!(db
            .delete("users", vec![Value::from(2)])
            .await
            .unwrap()
            .is_empty());
    }

    #[async_std::test]
    async fn test_schema_functions() {
        let db = Client::create();
        db.eval("box.schema.space.create('cache')", vec![])
            .await
            .unwrap();
        db.call(
            "box.space.cache:format",
            vec![Value::Array(vec![
                Value::Map(vec![
                    (Value::from("name"), Value::from("key")),
                    (Value::from("type"), Value::from("varbinary")),
                ]),
                Value::Map(vec![
                    (Value::from("name"), Value::from("value")),
                    (Value::from("type"), Value::from("varbinary")),
                ]),
            ])],
        )
        .await
        .unwrap();
        db.call(
            "box.space.cache:create_index",
            vec![
                Value::from("primary"),
                Value::Map(vec![(
                    Value::from("parts"),
                    Value::Array(vec![Value::from("key")]),
                )]),
            ],
        )
        .await
        .unwrap();

        let space = db.space("cache").await.unwrap().unwrap();
        assert_eq!(space.format.len(), 2);
        assert_eq!(space.primary_index().unwrap().parts, [0]);

        db.truncate("cache").await.unwrap();
        db.eval("box.space.cache:drop()", vec![]).await.unwrap();
        assert!(db.space("cache").await.unwrap().is_none());
    }

    #[async_std::test]
    async fn test_registered_function() {
        let db = Client::create();
        db.register_function("sum", |args| {
            Ok(vec![Value::from(
                args.iter().filter_map(Value::as_i64).sum::<i64>(),
            )])
        })
        .await;
        assert_eq!(
            db.call("sum", vec![Value::from(1), Value::from(2)])
                .await
                .unwrap(),
            [Value::from(3)]
        );
        let err = db.call("missing", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchProcedure);
    }
}
