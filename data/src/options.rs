//! Client configuration.
//!
//! [`ClientOptions`] can be parsed from the command line and environment (it implements
//! [`clap::Args`], so it can be flattened into a CLI) or deserialized from a configuration file.
//! Every option reads from an environment variable with the prefix `TARANTOOL_`.

use crate::client::{iproto, proxy, Client, SpaceMetadata, Tuple, UpdateOperation};
use crate::error::{Error, Result};
use crate::query::Conditions;
use async_trait::async_trait;
use clap::{ArgAction, Args};
use rmpv::Value;
use serde::Deserialize;
use std::time::Duration;

/// Names of the cluster functions used for data operations when `crud` is available.
#[derive(Clone, Debug, PartialEq, Eq, Args, Deserialize)]
#[serde(default)]
pub struct OperationMapping {
    /// Function returning the cluster schema.
    #[clap(
        long = "schema-function",
        env = "TARANTOOL_SCHEMA_FUNCTION",
        default_value = "ddl.get_schema"
    )]
    pub schema_function: String,

    #[clap(
        long = "select-function",
        env = "TARANTOOL_SELECT_FUNCTION",
        default_value = "crud.select"
    )]
    pub select_function: String,

    #[clap(
        long = "insert-function",
        env = "TARANTOOL_INSERT_FUNCTION",
        default_value = "crud.insert"
    )]
    pub insert_function: String,

    #[clap(
        long = "replace-function",
        env = "TARANTOOL_REPLACE_FUNCTION",
        default_value = "crud.replace"
    )]
    pub replace_function: String,

    #[clap(
        long = "update-function",
        env = "TARANTOOL_UPDATE_FUNCTION",
        default_value = "crud.update"
    )]
    pub update_function: String,

    #[clap(
        long = "upsert-function",
        env = "TARANTOOL_UPSERT_FUNCTION",
        default_value = "crud.upsert"
    )]
    pub upsert_function: String,

    #[clap(
        long = "delete-function",
        env = "TARANTOOL_DELETE_FUNCTION",
        default_value = "crud.delete"
    )]
    pub delete_function: String,

    #[clap(
        long = "truncate-function",
        env = "TARANTOOL_TRUNCATE_FUNCTION",
        default_value = "crud.truncate"
    )]
    pub truncate_function: String,
}

impl Default for OperationMapping {
    fn default() -> Self {
        Self {
            schema_function: "ddl.get_schema".into(),
            select_function: "crud.select".into(),
            insert_function: "crud.insert".into(),
            replace_function: "crud.replace".into(),
            update_function: "crud.update".into(),
            upsert_function: "crud.upsert".into(),
            delete_function: "crud.delete".into(),
            truncate_function: "crud.truncate".into(),
        }
    }
}

/// Options for connecting to Tarantool.
#[derive(Clone, Debug, PartialEq, Eq, Args, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Addresses of the Tarantool instances, as `host:port`.
    #[clap(
        long,
        env = "TARANTOOL_NODES",
        value_delimiter = ',',
        default_value = "localhost:3301"
    )]
    pub nodes: Vec<String>,

    /// User as which to connect.
    #[clap(long, env = "TARANTOOL_USER", default_value = "guest")]
    pub user: String,

    #[clap(long, env = "TARANTOOL_PASSWORD", default_value = "")]
    pub password: String,

    /// Number of connections per node. 0 means one.
    #[clap(long, env = "TARANTOOL_CONNECTIONS", default_value = "0")]
    pub connections: usize,

    /// Connect timeout in milliseconds. 0 disables the timeout.
    #[clap(long, env = "TARANTOOL_CONNECT_TIMEOUT", default_value = "0")]
    pub connect_timeout: u64,

    /// Read timeout in milliseconds. 0 disables the timeout.
    #[clap(long, env = "TARANTOOL_READ_TIMEOUT", default_value = "0")]
    pub read_timeout: u64,

    /// Request timeout in milliseconds. 0 disables the timeout.
    #[clap(long, env = "TARANTOOL_REQUEST_TIMEOUT", default_value = "0")]
    pub request_timeout: u64,

    /// Whether the nodes form a Cartridge cluster.
    #[clap(
        long,
        env = "TARANTOOL_CLUSTER",
        action = ArgAction::Set,
        default_value = "true"
    )]
    pub cluster: bool,

    /// Whether the cluster exposes the `crud` module.
    #[clap(
        long,
        env = "TARANTOOL_CRUD_AVAILABLE",
        action = ArgAction::Set,
        default_value = "true"
    )]
    pub crud_available: bool,

    #[clap(flatten)]
    #[serde(flatten)]
    pub mapping: OperationMapping,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost:3301".into()],
            user: "guest".into(),
            password: String::new(),
            connections: 0,
            connect_timeout: 0,
            read_timeout: 0,
            request_timeout: 0,
            cluster: true,
            crud_available: true,
            mapping: Default::default(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Check that `node` has the form `host:port`.
fn check_node(node: &str) -> Result<()> {
    let valid = match node.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_usage(format!(
            "node {node} must have host and port parts"
        )))
    }
}

impl ClientOptions {
    /// Whether data operations will be routed through the `crud` functions.
    pub fn uses_proxy(&self) -> bool {
        self.cluster && self.crud_available
    }

    /// The configuration of the network client described by these options.
    pub fn iproto_config(&self) -> Result<iproto::Config> {
        if self.nodes.is_empty() {
            return Err(Error::invalid_usage("at least one node is required"));
        }
        for node in &self.nodes {
            check_node(node)?;
        }
        Ok(iproto::Config {
            nodes: self.nodes.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connections: self.connections.max(1),
            connect_timeout: millis(self.connect_timeout),
            read_timeout: millis(self.read_timeout),
            request_timeout: millis(self.request_timeout),
        })
    }

    /// Connect to Tarantool.
    pub async fn connect(&self) -> Result<Connection> {
        let config = self.iproto_config()?;
        let client = iproto::Client::connect(config)
            .await
            .map_err(Error::translate)?;
        if self.uses_proxy() {
            Ok(Connection::Proxy(proxy::Client::new(
                client,
                self.mapping.clone(),
            )))
        } else {
            Ok(Connection::Direct(client))
        }
    }
}

/// A client built from [`ClientOptions`].
#[derive(Clone, Debug)]
pub enum Connection {
    /// Operations go straight to the instances.
    Direct(iproto::Client),
    /// Operations go through the `crud` functions of the cluster.
    Proxy(proxy::Client<iproto::Client>),
}

impl Connection {
    /// The underlying network client.
    pub fn iproto(&self) -> &iproto::Client {
        match self {
            Self::Direct(client) => client,
            Self::Proxy(client) => client.inner(),
        }
    }
}

macro_rules! delegate {
    ($self:expr, $client:ident => $e:expr) => {
        match $self {
            Connection::Direct($client) => $e,
            Connection::Proxy($client) => $e,
        }
    };
}

#[async_trait]
impl Client for Connection {
    type Error = iproto::Error;

    async fn space(&self, space: &str) -> Result<Option<SpaceMetadata>, Self::Error> {
        delegate!(self, c => c.space(space).await)
    }

    async fn refresh_metadata(&self) -> Result<(), Self::Error> {
        delegate!(self, c => c.refresh_metadata().await)
    }

    async fn select(
        &self,
        space: &str,
        conditions: &Conditions,
    ) -> Result<Vec<Tuple>, Self::Error> {
        delegate!(self, c => c.select(space, conditions).await)
    }

    async fn insert(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Self::Error> {
        delegate!(self, c => c.insert(space, tuple).await)
    }

    async fn replace(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Self::Error> {
        delegate!(self, c => c.replace(space, tuple).await)
    }

    async fn update(
        &self,
        space: &str,
        key: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<Vec<Tuple>, Self::Error> {
        delegate!(self, c => c.update(space, key, ops).await)
    }

    async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), Self::Error> {
        delegate!(self, c => c.upsert(space, tuple, ops).await)
    }

    async fn delete(&self, space: &str, key: Tuple) -> Result<Vec<Tuple>, Self::Error> {
        delegate!(self, c => c.delete(space, key).await)
    }

    async fn truncate(&self, space: &str) -> Result<(), Self::Error> {
        delegate!(self, c => c.truncate(space).await)
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>, Self::Error> {
        delegate!(self, c => c.call(function, args).await)
    }

    async fn eval(&self, expression: &str, args: Vec<Value>) -> Result<Vec<Value>, Self::Error> {
        delegate!(self, c => c.eval(expression, args).await)
    }

    fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        options: ClientOptions,
    }

    #[test]
    fn test_defaults() {
        let parsed = Cli::parse_from(["test"]).options;
        assert_eq!(parsed, ClientOptions::default());
        assert!(parsed.uses_proxy());

        let config = parsed.iproto_config().unwrap();
        assert_eq!(config.nodes, ["localhost:3301"]);
        assert_eq!(config.user, "guest");
        assert_eq!(config.connections, 1);
        assert_eq!(config.connect_timeout, None);
        assert_eq!(parsed.mapping.select_function, "crud.select");
        assert_eq!(parsed.mapping.schema_function, "ddl.get_schema");
    }

    #[test]
    fn test_command_line() {
        let parsed = Cli::parse_from([
            "test",
            "--nodes",
            "a:3301,b:3302",
            "--user",
            "admin",
            "--connections",
            "4",
            "--request-timeout",
            "1500",
            "--crud-available",
            "false",
            "--select-function",
            "app.select",
        ])
        .options;
        assert_eq!(parsed.nodes, ["a:3301", "b:3302"]);
        assert!(!parsed.uses_proxy());
        assert_eq!(parsed.mapping.select_function, "app.select");

        let config = parsed.iproto_config().unwrap();
        assert_eq!(config.user, "admin");
        assert_eq!(config.connections, 4);
        assert_eq!(config.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.read_timeout, None);
    }

    #[test]
    fn test_deserialize() {
        let parsed: ClientOptions = serde_json::from_str(
            r#"{"nodes": ["db:3301"], "cluster": false, "update_function": "app.update"}"#,
        )
        .unwrap();
        assert_eq!(parsed.nodes, ["db:3301"]);
        assert_eq!(parsed.user, "guest");
        assert!(!parsed.uses_proxy());
        assert_eq!(parsed.mapping.update_function, "app.update");
        assert_eq!(parsed.mapping.insert_function, "crud.insert");
    }

    #[test]
    fn test_invalid_nodes() {
        for node in ["localhost", ":3301", "localhost:port"] {
            let options = ClientOptions {
                nodes: vec![node.into()],
                ..Default::default()
            };
            assert!(
                matches!(options.iproto_config(), Err(Error::InvalidApiUsage { .. })),
                "{node} accepted"
            );
        }
    }
}
