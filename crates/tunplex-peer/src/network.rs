//! Rendezvous between peers that cannot reach each other directly.
//!
//! A member joins a hub by name; the joining channel becomes a session in
//! which the hub is the client. Anyone connected to the hub can then list
//! members and dial through one of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};
use tunplex_transport::BoxMsgStream;

use crate::dispatch::Dispatcher;
use crate::error::{PeerError, Result};
use crate::mux::Role;
use crate::relay::relay_streams;
use crate::session::{ConnectMode, Session, SessionConfig};
use crate::wire::{decode_strings, encode_strings, status, Command, Destination, Reply, Request};

const OK: &str = "ok";
const ERR: &str = "err";

type Members = Arc<Mutex<HashMap<String, Arc<Session>>>>;

fn lock(members: &Members) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
    members
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Members currently joined to this hub.
#[derive(Default)]
pub struct NetworkRegistry {
    members: Members,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joined member names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.members).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        lock(&self.members).get(name).cloned()
    }

    /// Register `member` under `name`, replacing any earlier member. The
    /// entry goes away when the member's session ends.
    pub fn register(&self, name: &str, member: Arc<Session>) {
        if let Some(old) = lock(&self.members).insert(name.to_string(), Arc::clone(&member)) {
            debug!(name, "network member replaced");
            tokio::spawn(async move { old.close().await });
        }
        info!(name, "network member joined");

        let members = Arc::clone(&self.members);
        let name = name.to_string();
        tokio::spawn(async move {
            let reason = member.closed().await;
            let mut current = lock(&members);
            if current
                .get(&name)
                .is_some_and(|joined| Arc::ptr_eq(joined, &member))
            {
                current.remove(&name);
                info!(name = %name, %reason, "network member left");
            }
        });
    }

    pub(crate) async fn serve(&self, stream: BoxMsgStream, config: SessionConfig) -> Result<()> {
        stream
            .send(Reply::ok(Destination::unspecified()).encode()?)
            .await?;
        let Some(msg) = stream.recv().await? else {
            return Ok(());
        };
        let args = decode_strings(&msg)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(?args, "network command");

        match args.as_slice() {
            ["join", name] => {
                send_strings(&stream, &[OK]).await?;
                let member = Session::start(stream, Role::Client, config, None);
                self.register(name, member);
            }
            ["list"] => {
                let mut answer = vec![OK.to_string()];
                answer.extend(self.names());
                send_strings(&stream, &answer).await?;
            }
            ["dial", name, host, port] => {
                let Some(member) = self.get(name) else {
                    let reason = format!("no member named {name}");
                    return send_strings(&stream, &[ERR, reason.as_str()]).await;
                };
                let Ok(port) = port.parse::<u16>() else {
                    let reason = format!("bad port {port}");
                    return send_strings(&stream, &[ERR, reason.as_str()]).await;
                };
                let destination = Destination::new(*host, port);
                match member.connect(&destination, ConnectMode::Safe).await {
                    Ok(conn) => {
                        let endpoint = conn.confirmation.wait().await?.endpoint;
                        send_strings(&stream, &[OK, endpoint.to_string().as_str()]).await?;
                        let stats = relay_streams(stream, conn.stream).await?;
                        debug!(member = %name, %destination, ?stats, "network dial finished");
                    }
                    Err(e) => {
                        send_strings(&stream, &[ERR, e.reason().as_str()]).await?;
                    }
                }
            }
            _ => {
                send_strings(&stream, &[ERR, "unknown network command"]).await?;
            }
        }
        Ok(())
    }
}

async fn send_strings<S: AsRef<str>>(stream: &BoxMsgStream, items: &[S]) -> Result<()> {
    stream.send(encode_strings(items)?).await?;
    Ok(())
}

impl Session {
    async fn network_command(
        &self,
        args: &[&str],
        wait: Duration,
    ) -> Result<(BoxMsgStream, Vec<String>)> {
        let request = Request::new(Destination::unspecified(), Command::Network);
        let (stream, reply) = self.exchange(&request).await?;
        if !reply.is_ok() {
            let _ = stream.close().await;
            return Err(PeerError::Rejected {
                status: reply.status,
                message: reply.message,
            });
        }

        let answer = async {
            stream.send(encode_strings(args)?).await?;
            let msg: Bytes = tokio::time::timeout(wait, stream.recv())
                .await
                .map_err(|_| PeerError::Timeout(wait))??
                .ok_or_else(|| PeerError::SessionClosed("network answer missing".to_string()))?;
            Ok::<_, PeerError>(decode_strings(&msg)?)
        }
        .await;

        let mut answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                let _ = stream.close().await;
                return Err(e);
            }
        };
        match answer.first().map(String::as_str) {
            Some(OK) => {
                answer.remove(0);
                Ok((stream, answer))
            }
            _ => {
                let _ = stream.close().await;
                let message = answer
                    .get(1)
                    .cloned()
                    .unwrap_or_else(|| "network command failed".to_string());
                Err(PeerError::Rejected {
                    status: status::FAILED,
                    message,
                })
            }
        }
    }

    /// Join the hub on the other end of this session as `name`. Requests the
    /// hub forwards are served by `dispatcher`.
    pub async fn network_join(
        &self,
        name: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Session>> {
        let (stream, _) = self
            .network_command(&["join", name], self.config().request_timeout)
            .await?;
        Ok(Session::start(
            stream,
            Role::Server,
            self.config().clone(),
            Some(dispatcher),
        ))
    }

    pub async fn network_list(&self) -> Result<Vec<String>> {
        let (stream, names) = self
            .network_command(&["list"], self.config().request_timeout)
            .await?;
        let _ = stream.close().await;
        Ok(names)
    }

    /// Open a connection to `destination` through member `name`. Returns the
    /// stream and the endpoint the member reached.
    pub async fn network_dial(
        &self,
        name: &str,
        destination: &Destination,
    ) -> Result<(BoxMsgStream, Destination)> {
        let port = destination.port.to_string();
        let wait = self.config().request_timeout * 2;
        let (stream, rest) = self
            .network_command(&["dial", name, &destination.host, &port], wait)
            .await?;
        let endpoint = rest
            .first()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Destination::unspecified);
        Ok((stream, endpoint))
    }
}
