//! beanstalkd client over the text protocol
//!
//! Two TCP connections are kept: one for reserving and deleting (beanstalkd
//! only lets the reserving connection delete a reserved job) and one for
//! publishing, so puts made while a job is being processed never wait behind
//! a blocking reserve. A connection that fails is dropped and re-established,
//! replaying its `use`/`watch` state, on the next call.

use super::{Job, JobId, Queue, DEFAULT_TTR_SECS};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default beanstalkd address
pub const DEFAULT_BEANSTALK_ADDR: &str = "127.0.0.1:11300";

struct Connection {
    stream: BufReader<TcpStream>,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PipelineError::queue(format!("cannot connect to beanstalkd at {}: {}", addr, e)))?;
        debug!(addr = %addr, "Connected to beanstalkd");
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> Result<()> {
        let mut frame = Vec::with_capacity(command.len() + 2 + body.map_or(0, |b| b.len() + 2));
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
        }
        self.stream.get_mut().write_all(&frame).await.map_err(io_error)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.map_err(io_error)?;
        if n == 0 {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "beanstalkd closed the connection",
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut body = vec![0u8; len + 2];
        self.stream.read_exact(&mut body).await.map_err(io_error)?;
        body.truncate(len);
        Ok(body)
    }

    async fn command(&mut self, command: &str) -> Result<String> {
        self.send(command, None).await?;
        self.read_line().await
    }
}

fn io_error(err: std::io::Error) -> PipelineError {
    PipelineError::Io(err)
}

fn unexpected(command: &str, reply: &str) -> PipelineError {
    PipelineError::queue(format!("unexpected beanstalkd reply to '{}': {}", command, reply))
}

fn parse_id(reply: &str, prefix: &str) -> Option<JobId> {
    reply.strip_prefix(prefix)?.trim().parse().ok()
}

/// Value of `key` in a YAML stats body
fn stat_value(stats: &str, key: &str) -> Option<u64> {
    stats.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim().parse().ok()).flatten()
    })
}

#[derive(Default)]
struct Slot {
    conn: Option<Connection>,
}

struct ConsumerState {
    slot: Slot,
    watched: Vec<String>,
}

struct PublisherState {
    slot: Slot,
    used: String,
}

pub struct BeanstalkQueue {
    addr: String,
    ttr: Duration,
    consumer: Mutex<ConsumerState>,
    publisher: Mutex<PublisherState>,
}

impl BeanstalkQueue {
    /// Connect lazily to `addr`; nothing is opened until the first command.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ttr: Duration::from_secs(DEFAULT_TTR_SECS),
            consumer: Mutex::new(ConsumerState {
                slot: Slot::default(),
                watched: Vec::new(),
            }),
            publisher: Mutex::new(PublisherState {
                slot: Slot::default(),
                used: "default".to_string(),
            }),
        }
    }

    pub fn with_ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }

    async fn watch_on(conn: &mut Connection, tube: &str) -> Result<()> {
        let cmd = format!("watch {}", tube);
        let reply = conn.command(&cmd).await?;
        if !reply.starts_with("WATCHING") {
            return Err(unexpected(&cmd, &reply));
        }
        Ok(())
    }

    async fn use_on(conn: &mut Connection, tube: &str) -> Result<()> {
        let cmd = format!("use {}", tube);
        let reply = conn.command(&cmd).await?;
        if reply != format!("USING {}", tube) {
            return Err(unexpected(&cmd, &reply));
        }
        Ok(())
    }

    /// Consumer connection, reconnecting and re-watching as needed
    async fn consumer_conn<'a>(&self, state: &'a mut ConsumerState) -> Result<&'a mut Connection> {
        if state.slot.conn.is_none() {
            let mut conn = Connection::open(&self.addr).await?;
            for tube in &state.watched {
                Self::watch_on(&mut conn, tube).await?;
            }
            if !state.watched.is_empty() && !state.watched.iter().any(|t| t == "default") {
                conn.command("ignore default").await?;
            }
            state.slot.conn = Some(conn);
        }
        state
            .slot
            .conn
            .as_mut()
            .ok_or_else(|| PipelineError::queue("beanstalkd consumer connection unavailable"))
    }

    async fn publisher_conn<'a>(&self, state: &'a mut PublisherState) -> Result<&'a mut Connection> {
        if state.slot.conn.is_none() {
            let mut conn = Connection::open(&self.addr).await?;
            if state.used != "default" {
                Self::use_on(&mut conn, &state.used).await?;
            }
            state.slot.conn = Some(conn);
        }
        state
            .slot
            .conn
            .as_mut()
            .ok_or_else(|| PipelineError::queue("beanstalkd publisher connection unavailable"))
    }

    /// Point the publisher connection at `tube`. Runs under the publisher
    /// lock so the `use` and the command that follows it are not split.
    async fn select_tube(&self, state: &mut PublisherState, tube: &str) -> Result<()> {
        if state.slot.conn.is_none() {
            // A fresh connection starts on `default`
            state.used = "default".to_string();
        }
        let needs_use = state.used != tube;
        let conn = self.publisher_conn(state).await?;
        if needs_use {
            Self::use_on(conn, tube).await?;
            state.used = tube.to_string();
        }
        Ok(())
    }
}

/// Drop the connection after transport failures so the next call reconnects
fn reset_on_error<T>(slot: &mut Slot, result: Result<T>) -> Result<T> {
    if let Err(err @ PipelineError::Io(_)) = &result {
        warn!(error = %err, "Dropping beanstalkd connection");
        slot.conn = None;
    }
    result
}

#[async_trait]
impl Queue for BeanstalkQueue {
    async fn watch(&self, tube: &str) -> Result<()> {
        let mut state = self.consumer.lock().await;
        if state.watched.iter().any(|t| t == tube) {
            return Ok(());
        }

        let first = state.watched.is_empty();
        let result = async {
            let conn = self.consumer_conn(&mut state).await?;
            Self::watch_on(conn, tube).await?;
            if first && tube != "default" {
                let reply = conn.command("ignore default").await?;
                if !reply.starts_with("WATCHING") {
                    return Err(unexpected("ignore default", &reply));
                }
            }
            Ok(())
        }
        .await;

        let result = reset_on_error(&mut state.slot, result);
        if result.is_ok() {
            state.watched.push(tube.to_string());
        }
        result
    }

    async fn use_tube(&self, tube: &str) -> Result<()> {
        let mut state = self.publisher.lock().await;
        let result = self.select_tube(&mut state, tube).await;
        reset_on_error(&mut state.slot, result)
    }

    async fn put(&self, tube: &str, body: &[u8], priority: u32, delay: Duration) -> Result<JobId> {
        let mut state = self.publisher.lock().await;
        let ttr = self.ttr.as_secs().max(1);
        let result = async {
            self.select_tube(&mut state, tube).await?;
            let conn = self.publisher_conn(&mut state).await?;
            let cmd = format!("put {} {} {} {}", priority, delay.as_secs(), ttr, body.len());
            conn.send(&cmd, Some(body)).await?;
            let reply = conn.read_line().await?;
            parse_id(&reply, "INSERTED ").ok_or_else(|| unexpected(&cmd, &reply))
        }
        .await;

        reset_on_error(&mut state.slot, result)
    }

    async fn reserve(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        let mut state = self.consumer.lock().await;
        if state.watched.is_empty() {
            return Err(PipelineError::queue("reserve called before watching a tube"));
        }

        let result = async {
            let conn = self.consumer_conn(&mut state).await?;
            let cmd = match timeout {
                Some(t) => format!("reserve-with-timeout {}", t.as_secs()),
                None => "reserve".to_string(),
            };
            let reply = conn.command(&cmd).await?;

            if reply == "TIMED_OUT" || reply == "DEADLINE_SOON" {
                return Ok(None);
            }

            let mut parts = reply.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("RESERVED"), Some(id), Some(len)) => {
                    let id: JobId = id.parse().map_err(|_| unexpected(&cmd, &reply))?;
                    let len: usize = len.parse().map_err(|_| unexpected(&cmd, &reply))?;
                    let body = conn.read_body(len).await?;
                    Ok(Some(Job { id, body }))
                },
                _ => Err(unexpected(&cmd, &reply)),
            }
        }
        .await;

        reset_on_error(&mut state.slot, result)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        let mut state = self.consumer.lock().await;
        let result = async {
            let conn = self.consumer_conn(&mut state).await?;
            let cmd = format!("delete {}", id);
            match conn.command(&cmd).await?.as_str() {
                "DELETED" => Ok(()),
                "NOT_FOUND" => Err(PipelineError::queue(format!("job {} not found", id))),
                other => Err(unexpected(&cmd, other)),
            }
        }
        .await;

        reset_on_error(&mut state.slot, result)
    }

    async fn ready_count(&self, tube: &str) -> Result<u64> {
        let mut state = self.publisher.lock().await;
        let result = async {
            let conn = self.publisher_conn(&mut state).await?;
            let cmd = format!("stats-tube {}", tube);
            let reply = conn.command(&cmd).await?;
            if reply == "NOT_FOUND" {
                return Ok(0);
            }
            let len: usize = reply
                .strip_prefix("OK ")
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| unexpected(&cmd, &reply))?;
            let body = conn.read_body(len).await?;
            let stats = String::from_utf8_lossy(&body);
            stat_value(&stats, "current-jobs-ready").ok_or_else(|| unexpected(&cmd, "missing current-jobs-ready"))
        }
        .await;

        reset_on_error(&mut state.slot, result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal scripted beanstalkd: answers each expected command line in order
    async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            for (expected, reply) in script {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                assert_eq!(line.trim_end(), expected);
                if expected.starts_with("put ") {
                    let len: usize = expected.rsplit(' ').next().unwrap().parse().unwrap();
                    let mut body = vec![0u8; len + 2];
                    stream.read_exact(&mut body).await.unwrap();
                }
                stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        addr
    }

    /// Accepts one connection, tracks the used tube and reports every put as
    /// (tube, body)
    async fn recording_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(socket);
            let mut used = "default".to_string();
            let mut next_id = 0u64;
            loop {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                let reply = if let Some(tube) = line.strip_prefix("use ") {
                    used = tube.to_string();
                    format!("USING {}\r\n", tube)
                } else if line.starts_with("put ") {
                    let len: usize = line.rsplit(' ').next().unwrap().parse().unwrap();
                    let mut body = vec![0u8; len + 2];
                    stream.read_exact(&mut body).await.unwrap();
                    body.truncate(len);
                    tx.send((used.clone(), body)).unwrap();
                    next_id += 1;
                    format!("INSERTED {}\r\n", next_id)
                } else {
                    "UNKNOWN_COMMAND\r\n".to_string()
                };
                stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        (addr, rx)
    }

    #[test]
    fn test_stat_value() {
        let stats = "---\nname: odr_rruff_file_builder\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: 17\n";
        assert_eq!(stat_value(stats, "current-jobs-ready"), Some(17));
        assert_eq!(stat_value(stats, "current-jobs-buried"), None);
    }

    #[tokio::test]
    async fn test_put_uses_tube_and_returns_id() {
        let addr = scripted_server(vec![
            ("use builder", "USING builder\r\n"),
            ("put 1 5 120 2", "INSERTED 42\r\n"),
        ])
        .await;

        let queue = BeanstalkQueue::new(addr);
        let id = queue.put("builder", b"{}", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn test_concurrent_puts_land_on_their_own_tube() {
        let (addr, mut puts) = recording_server().await;
        let queue = std::sync::Arc::new(BeanstalkQueue::new(addr));

        let tasks: Vec<_> = ["odr_builder", "odr_dead"]
            .into_iter()
            .map(|tube| {
                let queue = std::sync::Arc::clone(&queue);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        queue.put(tube, tube.as_bytes(), 1024, Duration::ZERO).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = 0;
        while let Ok((tube, body)) = puts.try_recv() {
            assert_eq!(tube.as_bytes(), body.as_slice());
            seen += 1;
        }
        assert_eq!(seen, 50);
    }

    #[tokio::test]
    async fn test_put_skips_use_for_current_tube() {
        let addr = scripted_server(vec![
            ("use builder", "USING builder\r\n"),
            ("put 1 0 120 1", "INSERTED 1\r\n"),
            ("put 1 0 120 1", "INSERTED 2\r\n"),
        ])
        .await;

        let queue = BeanstalkQueue::new(addr);
        queue.put("builder", b"a", 1, Duration::ZERO).await.unwrap();
        assert_eq!(queue.put("builder", b"b", 1, Duration::ZERO).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watch_reserve_delete() {
        let addr = scripted_server(vec![
            ("watch finisher", "WATCHING 2\r\n"),
            ("ignore default", "WATCHING 1\r\n"),
            ("reserve-with-timeout 1", "RESERVED 7 5\r\nhello\r\n"),
            ("delete 7", "DELETED\r\n"),
            ("reserve-with-timeout 1", "TIMED_OUT\r\n"),
            ("delete 8", "NOT_FOUND\r\n"),
        ])
        .await;

        let queue = BeanstalkQueue::new(addr);
        queue.watch("finisher").await.unwrap();

        let job = queue.reserve(Some(Duration::from_secs(1))).await.unwrap().unwrap();
        assert_eq!(job, Job { id: 7, body: b"hello".to_vec() });
        queue.delete(7).await.unwrap();

        assert!(queue.reserve(Some(Duration::from_secs(1))).await.unwrap().is_none());
        assert!(queue.delete(8).await.is_err());
    }

    #[tokio::test]
    async fn test_ready_count_reads_stats() {
        let addr = scripted_server(vec![(
            "stats-tube analyzer",
            "OK 34\r\n---\nname: x\ncurrent-jobs-ready: 3\n\r\n",
        )])
        .await;

        let queue = BeanstalkQueue::new(addr);
        assert_eq!(queue.ready_count("analyzer").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_reply_is_queue_error() {
        let addr = scripted_server(vec![
            ("use builder", "USING builder\r\n"),
            ("put 1024 0 120 1", "JOB_TOO_BIG\r\n"),
        ])
        .await;

        let queue = BeanstalkQueue::new(addr);
        let err = queue.put("builder", b"x", 1024, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, PipelineError::Queue(_)));
    }
}
