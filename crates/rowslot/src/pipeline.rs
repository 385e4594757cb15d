//! Per-node pipelined batch execution.
//!
//! A batch opens one connection to one node, queues every command without
//! waiting, flushes, then reads exactly one reply per command in queue
//! order. The connection is closed on every exit path. A failed batch fails
//! only that node's share of the work; nothing here retries.

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Result, RowSlotError};
use crate::resp::{error_message, Command};

/// One open RESP connection to a node.
pub struct NodeConnection {
    addr: String,
    framed: Framed<TcpStream, Resp2>,
    timeout: Duration,
}

impl NodeConnection {
    /// Connects to `addr`, then authenticates and selects the database if
    /// the configuration asks for it.
    pub async fn open(addr: &str, config: &ConnectionConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out(addr, "connect"))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            addr: addr.to_string(),
            framed: Framed::new(stream, Resp2::default()),
            timeout: config.timeout,
        };

        let mut setup = Vec::new();
        if let Some(auth) = config.auth.as_deref() {
            setup.push(Command::new("AUTH").arg(auth));
        }
        if config.db_num != 0 {
            setup.push(Command::new("SELECT").arg_int(config.db_num));
        }
        if !setup.is_empty() {
            if let Err(err) = conn.pipeline(setup).await {
                conn.close().await;
                return Err(err);
            }
        }
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `commands` as one pipeline and returns every reply, error
    /// replies included.
    pub async fn send_raw(&mut self, commands: Vec<Command>) -> Result<Vec<BytesFrame>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.round_trip(commands)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(&self.addr, "pipeline")),
        }
    }

    /// Like [`NodeConnection::send_raw`], but any error reply fails the
    /// whole pipeline once all replies have been drained.
    pub async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<BytesFrame>> {
        let replies = self.send_raw(commands).await?;
        if let Some(message) = replies.iter().find_map(error_message) {
            return Err(RowSlotError::protocol(&self.addr, message));
        }
        Ok(replies)
    }

    /// Sends `commands` in pipelines of at most `max_pipeline` commands.
    pub async fn pipeline_chunked(
        &mut self,
        commands: Vec<Command>,
        max_pipeline: usize,
    ) -> Result<Vec<BytesFrame>> {
        let max_pipeline = max_pipeline.max(1);
        let mut replies = Vec::with_capacity(commands.len());
        let mut pending = commands.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk = pending.by_ref().take(max_pipeline).collect::<Vec<_>>();
            replies.extend(self.pipeline(chunk).await?);
        }
        Ok(replies)
    }

    /// Flushes and shuts the socket down; errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::close(&mut self.framed).await;
    }

    async fn round_trip(&mut self, commands: Vec<Command>) -> Result<Vec<BytesFrame>> {
        let expected = commands.len();
        for command in commands {
            self.framed
                .feed(command.into_frame())
                .await
                .map_err(|err| codec_error(&self.addr, err))?;
        }
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut self.framed)
            .await
            .map_err(|err| codec_error(&self.addr, err))?;

        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            match self.framed.next().await {
                Some(Ok(frame)) => replies.push(frame),
                Some(Err(err)) => return Err(codec_error(&self.addr, err)),
                None => {
                    return Err(RowSlotError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} closed the connection after {} of {expected} replies",
                            self.addr,
                            replies.len()
                        ),
                    )))
                }
            }
        }
        debug!(node = %self.addr, commands = expected, "pipeline completed");
        Ok(replies)
    }
}

/// Runs one batch against `addr` on a fresh connection.
pub async fn run_batch(
    addr: &str,
    config: &ConnectionConfig,
    commands: Vec<Command>,
    max_pipeline: usize,
) -> Result<Vec<BytesFrame>> {
    if commands.is_empty() {
        return Ok(Vec::new());
    }
    let mut conn = NodeConnection::open(addr, config).await?;
    let result = conn.pipeline_chunked(commands, max_pipeline).await;
    conn.close().await;
    result
}

fn timed_out(addr: &str, stage: &str) -> RowSlotError {
    RowSlotError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{stage} to {addr} timed out"),
    ))
}

fn codec_error(addr: &str, err: impl std::fmt::Display) -> RowSlotError {
    RowSlotError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{addr}: {err}"),
    ))
}
