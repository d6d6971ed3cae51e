use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use rmpv::Value;
use std::time::Duration;
use tarantool_data::{
    cache::{CacheConfiguration, CacheManager},
    client::Client,
    init_logging,
    options::ClientOptions,
    Conditions, Operator,
};

/// Inspect and manipulate data stored in Tarantool.
#[derive(Parser)]
enum Command {
    /// Check that every node is reachable.
    Ping {
        #[clap(flatten)]
        options: ClientOptions,
    },
    /// List the spaces defined on the nodes.
    Spaces {
        #[clap(flatten)]
        options: ClientOptions,
    },
    /// Print the tuples in SPACE as JSON arrays, one per line.
    Select {
        #[clap(value_name = "SPACE")]
        space: String,

        /// Select tuples by INDEX. Defaults to the primary index when a key is given.
        #[clap(short, long, value_name = "INDEX")]
        index: Option<String>,

        /// Select tuples whose index key equals KEY, given as a JSON array.
        #[clap(short, long, value_name = "KEY")]
        key: Option<String>,

        /// Return at most LIMIT tuples.
        #[clap(short, long, value_name = "LIMIT")]
        limit: Option<usize>,

        /// Skip the first OFFSET tuples.
        #[clap(long, value_name = "OFFSET", default_value = "0")]
        offset: usize,

        /// Return tuples in descending primary key order.
        #[clap(long)]
        desc: bool,

        #[clap(flatten)]
        options: ClientOptions,
    },
    /// Call a stored function and print its results as JSON.
    Call {
        #[clap(value_name = "FUNCTION")]
        function: String,

        /// Arguments to the function, as JSON values.
        #[clap(value_name = "ARGS")]
        args: Vec<String>,

        #[clap(flatten)]
        options: ClientOptions,
    },
    /// Evaluate a Lua expression and print its results as JSON.
    Eval {
        #[clap(value_name = "EXPRESSION")]
        expression: String,

        /// Arguments available to the expression as `...`, as JSON values.
        #[clap(value_name = "ARGS")]
        args: Vec<String>,

        #[clap(flatten)]
        options: ClientOptions,
    },
    /// Delete every tuple in SPACE.
    Truncate {
        #[clap(value_name = "SPACE")]
        space: String,

        #[clap(flatten)]
        options: ClientOptions,
    },
    /// Work with caches stored in Tarantool spaces.
    Cache {
        #[clap(subcommand)]
        command: CacheCommand,

        #[clap(flatten)]
        options: ClientOptions,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print the value cached under KEY.
    Get {
        #[clap(value_name = "CACHE")]
        cache: String,
        /// The key, as a JSON value.
        #[clap(value_name = "KEY")]
        key: String,
    },
    /// Cache VALUE under KEY.
    Put {
        #[clap(value_name = "CACHE")]
        cache: String,
        /// The key, as a JSON value.
        #[clap(value_name = "KEY")]
        key: String,
        /// The value, as a JSON value.
        #[clap(value_name = "VALUE")]
        value: String,
        /// Expire the entry after SECONDS. 0 means the entry never expires.
        #[clap(long, value_name = "SECONDS", default_value = "0")]
        ttl: u64,
    },
    /// Remove the value cached under KEY.
    Evict {
        #[clap(value_name = "CACHE")]
        cache: String,
        /// The key, as a JSON value.
        #[clap(value_name = "KEY")]
        key: String,
    },
    /// Remove every entry from a cache.
    Clear {
        #[clap(value_name = "CACHE")]
        cache: String,
    },
}

fn parse_json(arg: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(arg).with_context(|| format!("invalid JSON {arg}"))
}

fn parse_args(args: &[String]) -> anyhow::Result<Vec<Value>> {
    args.iter()
        .map(|arg| Ok(rmpv::ext::to_value(parse_json(arg)?)?))
        .collect()
}

fn to_json(value: Value) -> anyhow::Result<serde_json::Value> {
    Ok(rmpv::ext::from_value(value)?)
}

/// Build the conditions of a `select` command.
fn conditions(
    index: Option<String>,
    key: Option<&str>,
    limit: Option<usize>,
    offset: usize,
    desc: bool,
) -> anyhow::Result<Conditions> {
    let mut conditions = Conditions::any();
    if index.is_some() || key.is_some() {
        let key = match key {
            Some(key) => match rmpv::ext::to_value(parse_json(key)?)? {
                Value::Array(key) => key,
                scalar => vec![scalar],
            },
            None => vec![],
        };
        let index = index.unwrap_or_else(|| "primary".into());
        conditions = conditions.and_index(index, Operator::Eq, key);
    }
    if let Some(limit) = limit {
        conditions = conditions.with_limit(limit);
    }
    conditions = conditions.with_offset(offset);
    Ok(if desc {
        conditions.descending()
    } else {
        conditions
    })
}

async fn select(
    client: &impl Client,
    space: &str,
    conditions: &Conditions,
) -> anyhow::Result<Vec<serde_json::Value>> {
    client
        .select(space, conditions)
        .await?
        .into_iter()
        .map(|tuple| to_json(Value::Array(tuple)))
        .collect()
}

async fn call(
    client: &impl Client,
    function: &str,
    args: &[String],
) -> anyhow::Result<Vec<serde_json::Value>> {
    client
        .call(function, parse_args(args)?)
        .await?
        .into_iter()
        .map(to_json)
        .collect()
}

async fn eval(
    client: &impl Client,
    expression: &str,
    args: &[String],
) -> anyhow::Result<Vec<serde_json::Value>> {
    client
        .eval(expression, parse_args(args)?)
        .await?
        .into_iter()
        .map(to_json)
        .collect()
}

/// Run a cache command, returning the value to print, if any.
async fn cache<C: Client>(
    client: C,
    command: CacheCommand,
) -> anyhow::Result<Option<serde_json::Value>> {
    let ttl = match &command {
        CacheCommand::Put { ttl, .. } => Duration::from_secs(*ttl),
        _ => Duration::ZERO,
    };
    let manager = CacheManager::builder_for(client)
        .cache_defaults(CacheConfiguration::default().entry_ttl(ttl))
        .build();
    let name = match &command {
        CacheCommand::Get { cache, .. }
        | CacheCommand::Put { cache, .. }
        | CacheCommand::Evict { cache, .. }
        | CacheCommand::Clear { cache } => cache.clone(),
    };
    let cache = manager
        .cache(&name)
        .await?
        .ok_or_else(|| anyhow!("cache {name} is not configured"))?;
    match command {
        CacheCommand::Get { key, .. } => Ok(cache.get(&parse_json(&key)?).await?),
        CacheCommand::Put { key, value, .. } => {
            cache.put(&parse_json(&key)?, &parse_json(&value)?).await?;
            Ok(None)
        }
        CacheCommand::Evict { key, .. } => {
            cache.evict(&parse_json(&key)?).await?;
            Ok(None)
        }
        CacheCommand::Clear { .. } => {
            cache.clear().await?;
            Ok(None)
        }
    }
}

fn print_all(values: Vec<serde_json::Value>) {
    for value in values {
        println!("{value}");
    }
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();

    match Command::parse() {
        Command::Ping { options } => {
            let conn = options.connect().await?;
            conn.iproto().ping().await?;
            println!("ok");
        }
        Command::Spaces { options } => {
            let conn = options.connect().await?;
            for space in conn.iproto().spaces().await {
                let fields = space.field_names().collect::<Vec<_>>().join(", ");
                println!("{} {} ({fields})", space.id, space.name);
            }
        }
        Command::Select {
            space,
            index,
            key,
            limit,
            offset,
            desc,
            options,
        } => {
            let conditions = conditions(index, key.as_deref(), limit, offset, desc)?;
            tracing::debug!("select from {space} where {conditions}");
            let conn = options.connect().await?;
            print_all(select(&conn, &space, &conditions).await?);
        }
        Command::Call {
            function,
            args,
            options,
        } => {
            let conn = options.connect().await?;
            print_all(call(&conn, &function, &args).await?);
        }
        Command::Eval {
            expression,
            args,
            options,
        } => {
            let conn = options.connect().await?;
            print_all(eval(&conn, &expression, &args).await?);
        }
        Command::Truncate { space, options } => {
            let conn = options.connect().await?;
            conn.truncate(&space).await?;
        }
        Command::Cache { command, options } => {
            let conn = options.connect().await?;
            if let Some(value) = cache(conn, command).await? {
                println!("{value}");
            }
        }
    }

    Ok(())
}
