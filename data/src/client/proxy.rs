//! Instantiation of the abstract [`client`](super) interface for Cartridge clusters.
//!
//! This client wraps another client connected to a router and sends data operations to the
//! cluster-wide `crud` functions instead of individual spaces. The names of those functions are
//! configurable through [`OperationMapping`]. Space metadata comes from the `ddl` schema of the
//! cluster. Calls and evaluations pass through to the wrapped client unchanged.

use super::{
    Client as _, Error as _, ErrorKind, FieldMetadata, IndexMetadata, SpaceMetadata, Tuple,
    UpdateOperation,
};
use crate::options::OperationMapping;
use crate::query::{compare_keys, Conditions, Operator};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use derivative::Derivative;
use rmpv::Value;
use std::collections::HashMap;

type Schema = HashMap<String, SpaceMetadata>;

/// A client routing data operations through `crud` functions.
#[derive(Derivative)]
#[derivative(Clone(bound = "C: Clone"), Debug(bound = "C: std::fmt::Debug"))]
pub struct Client<C> {
    inner: C,
    mapping: OperationMapping,
    #[derivative(Debug = "ignore")]
    schema: Arc<RwLock<Option<Schema>>>,
}

fn field<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn metadata_error<E: super::Error>(msg: impl std::fmt::Display) -> E {
    E::new(ErrorKind::Metadata, msg)
}

/// Fail if the error slot of a `crud` result is set.
fn check_error<E: super::Error>(err: Option<Value>) -> Result<(), E> {
    let err = match err {
        None | Some(Value::Nil) => return Ok(()),
        Some(err) => err,
    };
    let message = field(&err, "err")
        .or_else(|| field(&err, "str"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| err.to_string());
    let kind = if message.contains("doesn't exist") {
        ErrorKind::NoSuchSpace
    } else {
        ErrorKind::SpaceOperation
    };
    Err(E::new(kind, message))
}

/// Extract the rows from the result of a `crud` data function.
fn rows<E: super::Error>(result: Vec<Value>) -> Result<Vec<Tuple>, E> {
    let mut result = result.into_iter();
    let data = result.next().unwrap_or(Value::Nil);
    check_error::<E>(result.next())?;
    if data.is_nil() {
        return Ok(vec![]);
    }
    let rows = field(&data, "rows").and_then(Value::as_array).ok_or_else(|| {
        E::new(
            ErrorKind::TupleConversion,
            format!("malformed crud result {data}"),
        )
    })?;
    rows.iter()
        .map(|row| match row {
            Value::Array(tuple) => Ok(tuple.clone()),
            other => Err(E::new(
                ErrorKind::TupleConversion,
                format!("expected a tuple, got {other}"),
            )),
        })
        .collect()
}

/// Encode `conditions` as a list of `{operator, field_or_index, value}` triples.
fn encode_conditions<E: super::Error>(
    conditions: &Conditions,
    space: &SpaceMetadata,
) -> Result<Value, E> {
    let mut encoded = vec![];
    if let Some(query) = conditions.index() {
        let index = space.index(&query.index).ok_or_else(|| {
            E::new(
                ErrorKind::NoSuchIndex,
                format!("index {} not found in space {}", query.index, space.name),
            )
        })?;
        encoded.push(Value::Array(vec![
            Value::from(query.op.to_string()),
            Value::from(index.name.as_str()),
            Value::Array(query.key.clone()),
        ]));
    }
    for cond in conditions.filters() {
        encoded.push(Value::Array(vec![
            Value::from(cond.op.to_string()),
            Value::from(cond.field.as_str()),
            cond.value.clone(),
        ]));
    }
    Ok(Value::Array(encoded))
}

/// Whether `crud.select` will scan `space` forward in primary key order with these conditions,
/// so that the result limit can be applied by the cluster.
///
/// A `<` or `<=` condition on the primary key makes the cluster scan backwards, so the first
/// rows it returns are the largest keys.
fn scans_primary(conditions: &Conditions, space: &SpaceMetadata) -> bool {
    let is_primary = |name: &str| space.index(name).map_or(true, |index| index.id == 0);
    let is_key = |name: &str| {
        space.index(name).is_some()
            || match (space.primary_index(), space.field_position(name)) {
                (Some(primary), Some(pos)) => primary.parts.contains(&pos),
                _ => false,
            }
    };
    let forward = |op: Operator| matches!(op, Operator::Eq | Operator::Ge | Operator::Gt);
    conditions.has_default_window()
        && conditions
            .index()
            .map_or(true, |query| is_primary(&query.index) && forward(query.op))
        && conditions
            .filters()
            .iter()
            .all(|cond| is_primary(&cond.field) && (forward(cond.op) || !is_key(&cond.field)))
}

fn encode_operations(ops: &[UpdateOperation], space: &SpaceMetadata) -> Value {
    Value::Array(
        ops.iter()
            .map(|op| {
                let field = match space.format.get(op.field) {
                    Some(field) => Value::from(field.name.as_str()),
                    None => Value::from(op.field as u64 + 1),
                };
                Value::Array(vec![
                    Value::from(op.op.as_str()),
                    field,
                    op.value.clone(),
                ])
            })
            .collect(),
    )
}

fn parse_field<E: super::Error>(field_format: &Value) -> Result<FieldMetadata, E> {
    let name = field(field_format, "name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            metadata_error::<E>(format!("field format {field_format} has no name"))
        })?;
    Ok(FieldMetadata {
        name: name.into(),
        ty: field(field_format, "type")
            .and_then(Value::as_str)
            .unwrap_or("any")
            .into(),
        is_nullable: field(field_format, "is_nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Parse one entry of the `spaces` map returned by the schema function.
fn parse_space<E: super::Error>(name: &Value, space: &Value) -> Result<SpaceMetadata, E> {
    let name = name
        .as_str()
        .ok_or_else(|| metadata_error::<E>(format!("invalid space name {name}")))?;
    let format = field(space, "format")
        .and_then(Value::as_array)
        .ok_or_else(|| metadata_error::<E>(format!("space {name} has no format")))?
        .iter()
        .map(parse_field)
        .collect::<Result<Vec<_>, E>>()?;
    let id = field(space, "id").and_then(Value::as_u64).unwrap_or(0) as u32;
    let mut metadata = SpaceMetadata::new(id, name, format);

    let indexes = field(space, "indexes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (id, index) in indexes.iter().enumerate() {
        let index_name = field(index, "name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                metadata_error::<E>(format!("index {id} of space {name} has no name"))
            })?;
        let parts = field(index, "parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|part| {
                let path = field(part, "path").and_then(Value::as_str).unwrap_or("");
                metadata.field_position(path).ok_or_else(|| {
                    metadata_error(format!(
                        "index {index_name} of space {name} refers to unknown field {path}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, E>>()?;
        let unique = field(index, "unique")
            .and_then(Value::as_bool)
            .unwrap_or(id == 0);
        metadata
            .indexes
            .push(IndexMetadata::new(id as u32, index_name, unique, parts));
    }
    Ok(metadata)
}

impl<C: super::Client> Client<C> {
    pub fn new(inner: C, mapping: OperationMapping) -> Self {
        Self {
            inner,
            mapping,
            schema: Default::default(),
        }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn mapping(&self) -> &OperationMapping {
        &self.mapping
    }

    async fn load_schema(&self) -> Result<Schema, C::Error> {
        let result = match self.inner.call(&self.mapping.schema_function, vec![]).await {
            Ok(result) => result,
            Err(err) if err.kind() == ErrorKind::NoSuchProcedure => {
                tracing::warn!("cluster schema is not available: {err}");
                return Ok(Schema::new());
            }
            Err(err) => return Err(err),
        };
        let spaces = result
            .first()
            .and_then(|schema| field(schema, "spaces"))
            .and_then(Value::as_map)
            .ok_or_else(|| metadata_error::<C::Error>("cluster schema has no spaces"))?;
        spaces
            .iter()
            .map(|(name, space)| {
                let space = parse_space::<C::Error>(name, space)?;
                Ok((space.name.clone(), space))
            })
            .collect()
    }

    /// Look up `space` in the cluster schema, loading the schema if necessary.
    async fn cluster_space(&self, space: &str) -> Result<Option<SpaceMetadata>, C::Error> {
        if let Some(schema) = &*self.schema.read().await {
            return Ok(schema.get(space).cloned());
        }
        let mut schema = self.schema.write().await;
        if schema.is_none() {
            *schema = Some(self.load_schema().await?);
        }
        Ok(schema.as_ref().and_then(|schema| schema.get(space).cloned()))
    }

    async fn call_crud(&self, function: &str, args: Vec<Value>) -> Result<Vec<Tuple>, C::Error> {
        let shown = Value::Array(args.clone());
        tracing::info!("{function}({shown})");
        rows(self.inner.call(function, args).await?)
    }
}

#[async_trait]
impl<C: super::Client> super::Client for Client<C> {
    type Error = C::Error;

    async fn space(&self, space: &str) -> Result<Option<SpaceMetadata>, C::Error> {
        match self.cluster_space(space).await? {
            Some(metadata) => Ok(Some(metadata)),
            None => self.inner.space(space).await,
        }
    }

    async fn refresh_metadata(&self) -> Result<(), C::Error> {
        self.inner.refresh_metadata().await?;
        let schema = self.load_schema().await?;
        *self.schema.write().await = Some(schema);
        Ok(())
    }

    async fn select(&self, space: &str, conditions: &Conditions) -> Result<Vec<Tuple>, C::Error> {
        let metadata = self.required_space(space).await?;
        let primary = metadata.primary_index().ok_or_else(|| {
            C::Error::new(
                ErrorKind::NoSuchIndex,
                format!("space {space} has no primary index"),
            )
        })?;
        let mut options = vec![];
        if let (true, Some(limit)) = (scans_primary(conditions, &metadata), conditions.limit()) {
            options.push((Value::from("first"), Value::from(limit as u64)));
        }
        let mut tuples = self
            .call_crud(
                &self.mapping.select_function,
                vec![
                    Value::from(space),
                    encode_conditions::<C::Error>(conditions, &metadata)?,
                    Value::Map(options),
                ],
            )
            .await?;
        tuples.sort_by(|l, r| compare_keys(&primary.key_of(l), &primary.key_of(r)));
        Ok(conditions.window(tuples))
    }

    async fn insert(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, C::Error> {
        self.call_crud(
            &self.mapping.insert_function,
            vec![Value::from(space), Value::Array(tuple)],
        )
        .await
    }

    async fn replace(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, C::Error> {
        self.call_crud(
            &self.mapping.replace_function,
            vec![Value::from(space), Value::Array(tuple)],
        )
        .await
    }

    async fn update(
        &self,
        space: &str,
        key: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<Vec<Tuple>, C::Error> {
        let metadata = self.required_space(space).await?;
        self.call_crud(
            &self.mapping.update_function,
            vec![
                Value::from(space),
                Value::Array(key),
                encode_operations(&ops, &metadata),
            ],
        )
        .await
    }

    async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), C::Error> {
        let metadata = self.required_space(space).await?;
        self.call_crud(
            &self.mapping.upsert_function,
            vec![
                Value::from(space),
                Value::Array(tuple),
                encode_operations(&ops, &metadata),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, space: &str, key: Tuple) -> Result<Vec<Tuple>, C::Error> {
        self.call_crud(
            &self.mapping.delete_function,
            vec![Value::from(space), Value::Array(key)],
        )
        .await
    }

    async fn truncate(&self, space: &str) -> Result<(), C::Error> {
        let function = &self.mapping.truncate_function;
        tracing::info!("{function}({space})");
        let mut result = self
            .inner
            .call(function, vec![Value::from(space)])
            .await?
            .into_iter();
        let truncated = result.next();
        check_error::<C::Error>(result.next())?;
        match truncated {
            Some(Value::Boolean(true)) => Ok(()),
            _ => Err(C::Error::new(
                ErrorKind::SpaceOperation,
                format!("failed to truncate space {space}"),
            )),
        }
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>, C::Error> {
        self.inner.call(function, args).await
    }

    async fn eval(&self, expression: &str, args: Vec<Value>) -> Result<Vec<Value>, C::Error> {
        self.inner.eval(expression, args).await
    }

    fn is_proxy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{mock, Client as _};
    use crate::query::Operator;
    use std::sync::Mutex;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        )
    }

    fn schema() -> Value {
        let field = |name: &str, ty: &str| map(vec![("name", name.into()), ("type", ty.into())]);
        let index = |name: &str, unique: bool, path: &str| {
            map(vec![
                ("name", name.into()),
                ("unique", unique.into()),
                ("parts", Value::Array(vec![map(vec![("path", path.into())])])),
            ])
        };
        map(vec![(
            "spaces",
            map(vec![(
                "books",
                map(vec![
                    (
                        "format",
                        Value::Array(vec![
                            field("id", "unsigned"),
                            field("bucket_id", "unsigned"),
                            field("title", "string"),
                            field("year", "unsigned"),
                        ]),
                    ),
                    (
                        "indexes",
                        Value::Array(vec![
                            index("id", true, "id"),
                            index("bucket_id", false, "bucket_id"),
                            index("year", false, "year"),
                        ]),
                    ),
                ]),
            )]),
        )])
    }

    fn book(id: u64, title: &str, year: u64) -> Value {
        Value::Array(vec![
            id.into(),
            Value::from(7),
            title.into(),
            year.into(),
        ])
    }

    fn crud_result(rows: Vec<Value>) -> Vec<Value> {
        vec![map(vec![("rows", Value::Array(rows))]), Value::Nil]
    }

    /// A proxy over a mock router which records the arguments of every `crud` call.
    async fn cluster() -> (Client<mock::Client>, Arc<Mutex<Vec<(String, Vec<Value>)>>>) {
        let router = mock::Client::create();
        let calls: Arc<Mutex<Vec<(String, Vec<Value>)>>> = Default::default();
        router
            .register_function("ddl.get_schema", |_| Ok(vec![schema()]))
            .await;
        router
            .register_function("crud.select", {
                let calls = calls.clone();
                move |args| {
                    calls.lock().unwrap().push(("select".into(), args));
                    Ok(crud_result(vec![
                        book(3, "Ubik", 1969),
                        book(1, "Dune", 1965),
                        book(2, "Emma", 1815),
                    ]))
                }
            })
            .await;
        for op in ["insert", "update", "delete"] {
            let calls = calls.clone();
            router
                .register_function(format!("crud.{op}"), move |args| {
                    calls.lock().unwrap().push((op.into(), args));
                    Ok(crud_result(vec![book(1, "Dune", 1965)]))
                })
                .await;
        }
        router
            .register_function("crud.replace", |_| {
                Ok(vec![
                    Value::Nil,
                    map(vec![(
                        "err",
                        "Duplicate key exists in unique index \"title\"".into(),
                    )]),
                ])
            })
            .await;
        router
            .register_function("crud.truncate", |args| {
                Ok(match args[0].as_str() {
                    Some("books") => vec![Value::from(true)],
                    _ => vec![
                        Value::Nil,
                        map(vec![("err", "Space \"authors\" doesn't exist".into())]),
                    ],
                })
            })
            .await;
        (Client::new(router, OperationMapping::default()), calls)
    }

    fn last_call(calls: &Mutex<Vec<(String, Vec<Value>)>>) -> (String, Vec<Value>) {
        calls.lock().unwrap().last().cloned().unwrap()
    }

    #[async_std::test]
    async fn test_schema() {
        let (client, _) = cluster().await;
        assert!(client.is_proxy());
        let space = client.space("books").await.unwrap().unwrap();
        assert_eq!(space.field_position("title"), Some(2));
        assert_eq!(space.primary_index().unwrap().name, "id");
        assert_eq!(space.index("year").unwrap().parts, [3]);
        assert!(!space.index("year").unwrap().unique);
        assert!(client.space("authors").await.unwrap().is_none());
    }

    #[async_std::test]
    async fn test_select() {
        let (client, calls) = cluster().await;

        // The limit is pushed to the cluster and rows come back in primary key order.
        let tuples = client
            .select(
                "books",
                &Conditions::primary_key(vec![Value::from(1)])
                    .and_less_than("title", "Z")
                    .with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(
            tuples
                .iter()
                .map(|t| t[0].as_u64().unwrap())
                .collect::<Vec<_>>(),
            [1, 2]
        );
        let (_, args) = last_call(&calls);
        assert_eq!(args[0], Value::from("books"));
        assert_eq!(
            args[1],
            Value::Array(vec![
                Value::Array(vec![
                    "==".into(),
                    "id".into(),
                    Value::Array(vec![Value::from(1)])
                ]),
                Value::Array(vec!["<".into(), "title".into(), "Z".into()]),
            ])
        );
        assert_eq!(args[2], map(vec![("first", Value::from(2))]));

        // With an offset or a secondary index the window is applied locally.
        let tuples = client
            .select(
                "books",
                &Conditions::any()
                    .and_index("year", Operator::Ge, vec![Value::from(1800)])
                    .descending()
                    .with_offset(1)
                    .with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0][2], Value::from("Emma"));
        let (_, args) = last_call(&calls);
        assert_eq!(args[2], Value::Map(vec![]));
    }

    /// A proxy over a router whose `crud.select` scans the primary key of five books, backwards
    /// when the first condition is `<` or `<=`, and stops after `first` rows.
    async fn scanning_cluster() -> Client<mock::Client> {
        let router = mock::Client::create();
        router
            .register_function("ddl.get_schema", |_| Ok(vec![schema()]))
            .await;
        router
            .register_function("crud.select", |args| {
                let conditions = args[1].as_array().cloned().unwrap_or_default();
                let bound = |cond: &Value| {
                    let cond = cond.as_array().unwrap();
                    let value = match &cond[2] {
                        Value::Array(key) => key[0].as_u64().unwrap(),
                        value => value.as_u64().unwrap(),
                    };
                    (cond[0].as_str().unwrap().to_string(), value)
                };
                let mut ids = (1..=5u64)
                    .filter(|id| {
                        conditions.iter().map(bound).all(|(op, value)| match op.as_str() {
                            "<" => *id < value,
                            "<=" => *id <= value,
                            ">" => *id > value,
                            ">=" => *id >= value,
                            _ => *id == value,
                        })
                    })
                    .collect::<Vec<_>>();
                if matches!(conditions.first().map(bound), Some((op, _)) if op.starts_with('<')) {
                    ids.reverse();
                }
                let first = args[2]
                    .as_map()
                    .and_then(|opts| opts.iter().find(|(k, _)| k.as_str() == Some("first")))
                    .and_then(|(_, v)| v.as_u64())
                    .map_or(ids.len(), |n| n as usize);
                Ok(crud_result(
                    ids.into_iter()
                        .take(first)
                        .map(|id| book(id, "Book", 2000))
                        .collect(),
                ))
            })
            .await;
        Client::new(router, OperationMapping::default())
    }

    #[async_std::test]
    async fn test_select_below_key() {
        let client = scanning_cluster().await;
        let ids = |tuples: Vec<Tuple>| {
            tuples
                .iter()
                .map(|t| t[0].as_u64().unwrap())
                .collect::<Vec<_>>()
        };

        let below = Conditions::any()
            .and_index("id", Operator::Lt, vec![Value::from(4)])
            .with_limit(2);
        assert_eq!(ids(client.select("books", &below).await.unwrap()), [1, 2]);

        let at_most = Conditions::any()
            .and_less_or_equals("id", 4)
            .with_limit(2);
        assert_eq!(ids(client.select("books", &at_most).await.unwrap()), [1, 2]);

        let above = Conditions::any()
            .and_greater_than("id", 1)
            .with_limit(2);
        assert_eq!(ids(client.select("books", &above).await.unwrap()), [2, 3]);
    }

    #[async_std::test]
    async fn test_writes() {
        let (client, calls) = cluster().await;

        let inserted = client
            .insert(
                "books",
                vec![Value::from(1), Value::Nil, "Dune".into(), Value::from(1965)],
            )
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(last_call(&calls).0, "insert");

        client
            .update(
                "books",
                vec![Value::from(1)],
                vec![
                    UpdateOperation::set(2, "Dune Messiah".into()),
                    UpdateOperation::set(9, Value::Nil),
                ],
            )
            .await
            .unwrap();
        let (op, args) = last_call(&calls);
        assert_eq!(op, "update");
        assert_eq!(args[1], Value::Array(vec![Value::from(1)]));
        assert_eq!(
            args[2],
            Value::Array(vec![
                Value::Array(vec!["=".into(), "title".into(), "Dune Messiah".into()]),
                Value::Array(vec!["=".into(), Value::from(10), Value::Nil]),
            ])
        );

        client.delete("books", vec![Value::from(1)]).await.unwrap();
        assert_eq!(last_call(&calls).0, "delete");

        let err = client
            .replace("books", vec![Value::from(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpaceOperation);
        assert!(err.to_string().contains("Duplicate key"));
    }

    #[async_std::test]
    async fn test_truncate() {
        let (client, _) = cluster().await;
        client.truncate("books").await.unwrap();
        let err = client.truncate("authors").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchSpace);
    }

    #[async_std::test]
    async fn test_missing_schema_function() {
        let router = mock::Client::create();
        router
            .create_space(
                SpaceMetadata::new(0, "local", vec![FieldMetadata::new("id", "unsigned")])
                    .with_index(IndexMetadata::new(0, "primary", true, vec![0])),
            )
            .await
            .unwrap();
        let client = Client::new(router, OperationMapping::default());
        let space = client.space("local").await.unwrap().unwrap();
        assert_eq!(space.name, "local");
    }
}
