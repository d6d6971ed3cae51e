use super::codec::{self, code, key, Greeting, Response, GREETING_SIZE, LENGTH_SIZE};
use super::{Config, Error};
use crate::client::{Error as _, ErrorKind};
use async_std::{
    future::timeout,
    io::{ReadExt, WriteExt},
    net::TcpStream,
};
use rmpv::Value;
use std::future::Future;
use std::time::Duration;

/// Run `f`, failing with a timeout error after `limit`, if there is one.
async fn with_timeout<T>(
    limit: Option<Duration>,
    what: &str,
    f: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match limit {
        Some(limit) => timeout(limit, f).await.map_err(|_| {
            Error::new(
                ErrorKind::Timeout,
                format!("{what} timed out after {}ms", limit.as_millis()),
            )
        })?,
        None => f.await,
    }
}

/// A single connection to a Tarantool instance.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    sync: u64,
    read_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Connection {
    /// Connect to the instance at `address` and authenticate.
    pub async fn open(address: &str, config: &Config) -> Result<Self, Error> {
        let stream = with_timeout(config.connect_timeout, "connect", async {
            TcpStream::connect(address).await.map_err(Error::io)
        })
        .await?;
        let mut conn = Self {
            stream,
            sync: 0,
            read_timeout: config.read_timeout,
            request_timeout: config.request_timeout,
        };

        let mut greeting = [0; GREETING_SIZE];
        with_timeout(conn.read_timeout, "greeting", async {
            conn.stream.read_exact(&mut greeting).await.map_err(Error::io)
        })
        .await?;
        let greeting = Greeting::parse(&greeting)?;
        tracing::info!("connected to {address}: {}", greeting.version);

        if config.user != "guest" {
            let scramble = codec::scramble(&greeting.salt, &config.password);
            conn.request(
                code::AUTH,
                vec![
                    (key::USER_NAME, Value::from(config.user.as_str())),
                    (
                        key::TUPLE,
                        Value::Array(vec![Value::from("chap-sha1"), Value::Binary(scramble)]),
                    ),
                ],
            )
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::Connection | ErrorKind::Timeout => err,
                _ => Error::new(ErrorKind::AccessDenied, err),
            })?;
        }
        Ok(conn)
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &mut self,
        request: u8,
        body: Vec<(u8, Value)>,
    ) -> Result<Vec<Value>, Error> {
        self.sync += 1;
        let sync = self.sync;
        let packet = codec::encode_request(request, sync, body)?;
        let request_timeout = self.request_timeout;
        let response = with_timeout(request_timeout, "request", async {
            self.stream.write_all(&packet).await.map_err(Error::io)?;
            self.read_response().await
        })
        .await?;
        if response.sync != sync {
            return Err(Error::new(
                ErrorKind::Connection,
                format!("response {} does not match request {sync}", response.sync),
            ));
        }
        response.into_result()
    }

    async fn read_response(&mut self) -> Result<Response, Error> {
        let read_timeout = self.read_timeout;
        let stream = &mut self.stream;
        with_timeout(read_timeout, "read", async move {
            let mut len = [0; LENGTH_SIZE];
            stream.read_exact(&mut len).await.map_err(Error::io)?;
            let mut payload = vec![0; codec::decode_length(&len)?];
            stream.read_exact(&mut payload).await.map_err(Error::io)?;
            Response::decode(&payload)
        })
        .await
    }
}
