//! Client speaking the Tarantool binary protocol.
//!
//! A [`Client`] holds a pool of connections to one or more Tarantool instances. Requests are spread
//! over the pool round-robin; each connection carries one request at a time. Connections which fail
//! are dropped and reopened on their next use.
//!
//! Space metadata is loaded from the `_vspace` and `_vindex` system spaces when the client connects
//! and again on [`refresh_metadata`](super::Client::refresh_metadata).

use super::{Client as _, Error as _, ErrorKind, SpaceMetadata, Tuple, UpdateOperation};
use crate::query::{compare_keys, Conditions, Operator};
use async_std::sync::{Arc, Mutex, RwLock};
use async_trait::async_trait;
use codec::{code, key, IteratorType};
use connection::Connection;
use rmpv::Value;
use snafu::Snafu;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub mod codec;
mod connection;

/// Errors returned by the network client.
#[derive(Debug, Snafu)]
#[snafu(display("Tarantool error ({}): {}", kind, message))]
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

impl Error {
    fn io(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Connection,
        };
        Self::new(kind, err)
    }

    /// Whether a connection which returned this error should be discarded.
    fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Connection | ErrorKind::Timeout)
    }
}

/// Connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Addresses (`host:port`) of the instances to connect to.
    pub nodes: Vec<String>,
    pub user: String,
    pub password: String,
    /// Number of connections to open to each node.
    pub connections: usize,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost:3301".into()],
            user: "guest".into(),
            password: String::new(),
            connections: 1,
            connect_timeout: None,
            read_timeout: None,
            request_timeout: None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    address: String,
    connection: Mutex<Option<Connection>>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    pool: Vec<Slot>,
    next: AtomicUsize,
    schema: RwLock<HashMap<String, SpaceMetadata>>,
}

/// A connection pool to Tarantool.
#[derive(Clone, Debug)]
pub struct Client(Arc<Inner>);

impl Client {
    /// Connect to the instances listed in `config` and load the schema.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        if config.nodes.is_empty() {
            return Err(Error::custom("no Tarantool nodes configured"));
        }
        let mut pool = vec![];
        for address in &config.nodes {
            for _ in 0..config.connections.max(1) {
                let conn = Connection::open(address, &config).await?;
                pool.push(Slot {
                    address: address.clone(),
                    connection: Mutex::new(Some(conn)),
                });
            }
        }
        let client = Self(Arc::new(Inner {
            config,
            pool,
            next: AtomicUsize::new(0),
            schema: Default::default(),
        }));
        client.load_schema().await?;
        Ok(client)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Check that a server is reachable.
    pub async fn ping(&self) -> Result<(), Error> {
        self.request(code::PING, vec![]).await?;
        Ok(())
    }

    /// The metadata of all spaces visible to the user, ordered by space ID.
    pub async fn spaces(&self) -> Vec<SpaceMetadata> {
        let mut spaces = self
            .0
            .schema
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        spaces.sort_by_key(|space| space.id);
        spaces
    }

    async fn request(&self, request: u8, body: Vec<(u8, Value)>) -> Result<Vec<Value>, Error> {
        let pool = &self.0.pool;
        let slot = &pool[self.0.next.fetch_add(1, Ordering::Relaxed) % pool.len()];
        let mut conn = slot.connection.lock().await;
        let mut c = match conn.take() {
            Some(c) => c,
            None => Connection::open(&slot.address, &self.0.config).await?,
        };
        let result = c.request(request, body).await;
        match &result {
            Err(err) if err.is_fatal() => {
                tracing::warn!("dropping connection to {}: {err}", slot.address);
            }
            _ => *conn = Some(c),
        }
        result
    }

    async fn select_raw(
        &self,
        space_id: u32,
        index_id: u32,
        iterator: IteratorType,
        key: Vec<Value>,
        window: Option<(usize, usize)>,
    ) -> Result<Vec<Tuple>, Error> {
        let (offset, limit) = window.unwrap_or((0, u32::MAX as usize));
        let tuples = self
            .request(
                code::SELECT,
                vec![
                    (key::SPACE_ID, Value::from(space_id)),
                    (key::INDEX_ID, Value::from(index_id)),
                    (key::ITERATOR, Value::from(iterator as u8)),
                    (key::OFFSET, Value::from(offset as u64)),
                    (key::LIMIT, Value::from(limit as u64)),
                    (key::KEY, Value::Array(key)),
                ],
            )
            .await?;
        tuples.into_iter().map(into_tuple).collect()
    }

    async fn load_schema(&self) -> Result<(), Error> {
        let spaces = self
            .select_raw(codec::VSPACE_ID, 0, IteratorType::All, vec![], None)
            .await?;
        let mut by_id = spaces
            .iter()
            .map(|tuple| codec::parse_space(tuple).map(|space| (space.id, space)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        let indexes = self
            .select_raw(codec::VINDEX_ID, 0, IteratorType::All, vec![], None)
            .await?;
        for tuple in &indexes {
            let (space_id, index) = codec::parse_index(tuple)?;
            if let Some(space) = by_id.get_mut(&space_id) {
                space.indexes.push(index);
            }
        }
        let schema = by_id
            .into_values()
            .map(|mut space| {
                space.indexes.sort_by_key(|index| index.id);
                (space.name.clone(), space)
            })
            .collect::<HashMap<_, _>>();
        tracing::info!("loaded metadata for {} spaces", schema.len());
        *self.0.schema.write().await = schema;
        Ok(())
    }

    async fn metadata(&self, space: &str) -> Result<SpaceMetadata, Error> {
        self.0
            .schema
            .read()
            .await
            .get(space)
            .cloned()
            .ok_or_else(|| Error::no_such_space(space))
    }

    async fn write(
        &self,
        request: u8,
        space: &str,
        mut body: Vec<(u8, Value)>,
    ) -> Result<Vec<Tuple>, Error> {
        let space = self.metadata(space).await?;
        body.insert(0, (key::SPACE_ID, Value::from(space.id)));
        let tuples = self.request(request, body).await?;
        tuples.into_iter().map(into_tuple).collect()
    }
}

fn into_tuple(value: Value) -> Result<Tuple, Error> {
    match value {
        Value::Array(tuple) => Ok(tuple),
        value => Err(Error::new(
            ErrorKind::TupleConversion,
            format!("expected a tuple, got {value}"),
        )),
    }
}

fn iterator_type(op: Operator) -> IteratorType {
    match op {
        Operator::Eq => IteratorType::Eq,
        Operator::Lt => IteratorType::Lt,
        Operator::Le => IteratorType::Le,
        Operator::Gt => IteratorType::Gt,
        Operator::Ge => IteratorType::Ge,
    }
}

#[async_trait]
impl super::Client for Client {
    type Error = Error;

    async fn space(&self, space: &str) -> Result<Option<SpaceMetadata>, Error> {
        Ok(self.0.schema.read().await.get(space).cloned())
    }

    async fn refresh_metadata(&self) -> Result<(), Error> {
        self.load_schema().await
    }

    async fn select(&self, space: &str, conditions: &Conditions) -> Result<Vec<Tuple>, Error> {
        tracing::info!("select from {space}: {conditions}");
        let space = self.metadata(space).await?;
        let (index, iterator, key) = match conditions.index() {
            Some(query) => {
                let index = space.index(&query.index).ok_or_else(|| {
                    Error::new(
                        ErrorKind::NoSuchIndex,
                        format!("index {} not found in space {}", query.index, space.name),
                    )
                })?;
                (index.id, iterator_type(query.op), query.key.clone())
            }
            None => (0, IteratorType::All, vec![]),
        };

        // The server returns tuples in index order, which is primary key order only for forward
        // iteration over the primary index.
        let in_primary_order = index == 0
            && matches!(
                iterator,
                IteratorType::All | IteratorType::Eq | IteratorType::Ge | IteratorType::Gt
            );
        if in_primary_order && conditions.filters().is_empty() && !conditions.is_descending() {
            let window = (
                conditions.offset(),
                conditions.limit().unwrap_or(u32::MAX as usize),
            );
            return self
                .select_raw(space.id, index, iterator, key, Some(window))
                .await;
        }

        let mut tuples = self.select_raw(space.id, index, iterator, key, None).await?;
        if !in_primary_order {
            if let Some(primary) = space.primary_index() {
                tuples.sort_by(|l, r| compare_keys(&primary.key_of(l), &primary.key_of(r)));
            }
        }
        conditions.filter(tuples, &space)
    }

    async fn insert(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Error> {
        tracing::info!("insert into {space}");
        self.write(code::INSERT, space, vec![(key::TUPLE, Value::Array(tuple))])
            .await
    }

    async fn replace(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Error> {
        tracing::info!("replace into {space}");
        self.write(code::REPLACE, space, vec![(key::TUPLE, Value::Array(tuple))])
            .await
    }

    async fn update(
        &self,
        space: &str,
        key: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<Vec<Tuple>, Error> {
        let shown = Value::Array(key.clone());
        tracing::info!("update {space} {shown}");
        let ops = ops.iter().map(UpdateOperation::to_value).collect();
        self.write(
            code::UPDATE,
            space,
            vec![
                (key::INDEX_ID, Value::from(0)),
                (key::KEY, Value::Array(key)),
                (key::TUPLE, Value::Array(ops)),
            ],
        )
        .await
    }

    async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), Error> {
        tracing::info!("upsert into {space}");
        let ops = ops.iter().map(UpdateOperation::to_value).collect();
        self.write(
            code::UPSERT,
            space,
            vec![
                (key::TUPLE, Value::Array(tuple)),
                (key::OPS, Value::Array(ops)),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, space: &str, key: Tuple) -> Result<Vec<Tuple>, Error> {
        let shown = Value::Array(key.clone());
        tracing::info!("delete from {space} {shown}");
        self.write(
            code::DELETE,
            space,
            vec![
                (key::INDEX_ID, Value::from(0)),
                (key::KEY, Value::Array(key)),
            ],
        )
        .await
    }

    async fn truncate(&self, space: &str) -> Result<(), Error> {
        tracing::info!("truncate {space}");
        self.call(&format!("box.space.{space}:truncate"), vec![])
            .await?;
        Ok(())
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        tracing::info!("call {function}");
        self.request(
            code::CALL,
            vec![
                (key::FUNCTION_NAME, Value::from(function)),
                (key::TUPLE, Value::Array(args)),
            ],
        )
        .await
    }

    async fn eval(&self, expression: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        tracing::info!("eval {expression}");
        self.request(
            code::EVAL,
            vec![
                (key::EXPR, Value::from(expression)),
                (key::TUPLE, Value::Array(args)),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{Client as _, Error as _};
    use async_std::{
        io::{ReadExt, WriteExt},
        net::TcpListener,
        task::spawn,
    };

    fn body_get(body: &Value, k: u8) -> Value {
        body.as_map()
            .and_then(|map| map.iter().find(|(key, _)| key.as_u64() == Some(k as u64)))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    }

    fn field(name: &str, ty: &str) -> Value {
        Value::Map(vec![
            (Value::from("name"), Value::from(name)),
            (Value::from("type"), Value::from(ty)),
        ])
    }

    /// Handle one connection, answering requests like a server with a single `books` space.
    async fn serve(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let greeting = format!(
            "{:<63}\n{:<63}\n",
            "Tarantool 2.11.1 (Binary)", "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="
        );
        stream.write_all(greeting.as_bytes()).await.unwrap();

        let books = vec![
            Value::Array(vec![Value::from(1), Value::from("Dune")]),
            Value::Array(vec![Value::from(2), Value::from("Emma")]),
            Value::Array(vec![Value::from(3), Value::from("Ubik")]),
        ];
        loop {
            let mut len = [0; codec::LENGTH_SIZE];
            if stream.read_exact(&mut len).await.is_err() {
                break;
            }
            let mut payload = vec![0; codec::decode_length(&len).unwrap()];
            stream.read_exact(&mut payload).await.unwrap();
            let request = codec::Response::decode(&payload).unwrap();
            let data = match request.code as u8 {
                code::SELECT => match body_get(&request.body, key::SPACE_ID).as_u64() {
                    Some(281) => vec![Value::Array(vec![
                        Value::from(512),
                        Value::from(1),
                        Value::from("books"),
                        Value::from("memtx"),
                        Value::from(0),
                        Value::Map(vec![]),
                        Value::Array(vec![field("id", "unsigned"), field("title", "string")]),
                    ])],
                    Some(289) => vec![Value::Array(vec![
                        Value::from(512),
                        Value::from(0),
                        Value::from("primary"),
                        Value::from("tree"),
                        Value::Map(vec![(Value::from("unique"), Value::from(true))]),
                        Value::Array(vec![Value::Array(vec![
                            Value::from(0),
                            Value::from("unsigned"),
                        ])]),
                    ])],
                    _ => {
                        let offset = body_get(&request.body, key::OFFSET).as_u64().unwrap() as usize;
                        let limit = body_get(&request.body, key::LIMIT).as_u64().unwrap() as usize;
                        books.iter().skip(offset).take(limit).cloned().collect()
                    }
                },
                code::CALL => body_get(&request.body, key::TUPLE)
                    .as_array()
                    .cloned()
                    .unwrap_or_default(),
                _ => vec![],
            };
            let reply =
                codec::encode_request(0, request.sync, vec![(key::DATA, Value::Array(data))])
                    .unwrap();
            stream.write_all(&reply).await.unwrap();
        }
    }

    #[async_std::test]
    async fn test_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        spawn(serve(listener));

        let client = Client::connect(Config {
            nodes: vec![address],
            ..Default::default()
        })
        .await
        .unwrap();
        client.ping().await.unwrap();

        let books = client.space("books").await.unwrap().unwrap();
        assert_eq!(books.id, 512);
        assert_eq!(books.primary_index().unwrap().parts, [0]);
        assert_eq!(client.spaces().await, [books]);

        let pushed = client
            .select("books", &Conditions::any().with_offset(1).with_limit(1))
            .await
            .unwrap();
        assert_eq!(pushed, [vec![Value::from(2), Value::from("Emma")]]);

        let filtered = client
            .select(
                "books",
                &Conditions::any().and_greater_than("id", 1).descending(),
            )
            .await
            .unwrap();
        assert_eq!(
            filtered,
            [
                vec![Value::from(3), Value::from("Ubik")],
                vec![Value::from(2), Value::from("Emma")],
            ]
        );

        assert!(client
            .delete("books", vec![Value::from(9)])
            .await
            .unwrap()
            .is_empty());
        assert!(client
            .update("books", vec![Value::from(9)], vec![])
            .await
            .unwrap()
            .is_empty());

        assert_eq!(
            client.call("echo", vec![Value::from("hi")]).await.unwrap(),
            [Value::from("hi")]
        );
        assert_eq!(
            client
                .select("authors", &Conditions::any())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NoSuchSpace
        );
    }
}
