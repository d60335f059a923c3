use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;
use tunplex_transport::{BoxMsgStream, TransportError};

use crate::error::{PeerError, Result};
use crate::session::Session;
use crate::wire::{status, Reply, Request};

/// DNS record types a tunnel peer will look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordType {
    #[default]
    A,
    Aaaa,
    Any,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Any => "ANY",
        }
    }

    pub fn matches(self, addr: &IpAddr) -> bool {
        match self {
            RecordType::A => addr.is_ipv4(),
            RecordType::Aaaa => addr.is_ipv6(),
            RecordType::Any => true,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "ANY" => Ok(RecordType::Any),
            _ => Err(s.to_string()),
        }
    }
}

/// Name resolution used to answer `dns:` requests.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str, record: RecordType) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str, record: RecordType) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(TransportError::from)?;
        let mut out: Vec<IpAddr> = Vec::new();
        for addr in addrs.map(|a| a.ip()).filter(|ip| record.matches(ip)) {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        Ok(out)
    }
}

pub(crate) async fn serve(
    stream: &BoxMsgStream,
    resolver: &dyn Resolver,
    name: &str,
    extras: &[String],
) -> Result<()> {
    let requested = extras.first().map(String::as_str).unwrap_or_default();
    let reply = if requested.trim().is_empty() {
        lookup(resolver, name, RecordType::A).await
    } else {
        match requested.parse() {
            Ok(record) => lookup(resolver, name, record).await,
            Err(raw) => Reply::failure(
                status::UNSUPPORTED_RECORD,
                format!("unsupported record type {raw}"),
            ),
        }
    };
    debug!(name, status = reply.status, answer = %reply.message, "dns request");
    stream.send(reply.encode()?).await?;
    stream.shutdown_send().await?;
    Ok(())
}

async fn lookup(resolver: &dyn Resolver, name: &str, record: RecordType) -> Reply {
    match resolver.resolve(name, record).await {
        Ok(addrs) if !addrs.is_empty() => {
            let list: Vec<String> = addrs.iter().map(IpAddr::to_string).collect();
            Reply::ok_with_message(list.join(","))
        }
        Ok(_) => Reply::failure(status::FAILED, format!("no {record} records for {name}")),
        Err(e) => Reply::failure(status::FAILED, e.reason()),
    }
}

impl Session {
    /// Resolve `name` on the far side of the tunnel.
    pub async fn resolve(&self, name: &str, record: RecordType) -> Result<Vec<IpAddr>> {
        let (stream, reply) = self
            .exchange(&Request::dns(name, record.as_str()))
            .await?;
        let _ = stream.close().await;
        if !reply.is_ok() {
            return Err(PeerError::Rejected {
                status: reply.status,
                message: reply.message,
            });
        }
        reply
            .message
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| PeerError::SessionClosed(format!("bad address in dns answer: {s}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tunplex_transport::{pipe, MsgStream};

    use super::*;

    struct StaticResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, name: &str, record: RecordType) -> Result<Vec<IpAddr>> {
            match self.0.get(name) {
                Some(addrs) => Ok(addrs.iter().copied().filter(|a| record.matches(a)).collect()),
                None => Err(PeerError::Transport(TransportError::Disconnected(format!(
                    "lookup {name} failed"
                )))),
            }
        }
    }

    fn resolver() -> StaticResolver {
        StaticResolver(HashMap::from([(
            "dual.example",
            vec!["192.0.2.1".parse().unwrap(), "2001:db8::1".parse().unwrap()],
        )]))
    }

    async fn ask(name: &str, extras: &[&str]) -> Reply {
        let (a, b) = pipe();
        let stream: BoxMsgStream = Arc::new(a);
        let extras: Vec<String> = extras.iter().map(|s| s.to_string()).collect();
        serve(&stream, &resolver(), name, &extras).await.unwrap();
        Reply::decode(&b.recv().await.unwrap().unwrap()).unwrap()
    }

    #[test]
    fn record_types_parse_case_insensitively() {
        assert_eq!("aaaa".parse::<RecordType>(), Ok(RecordType::Aaaa));
        assert_eq!("ANY".parse::<RecordType>(), Ok(RecordType::Any));
        assert_eq!("MX".parse::<RecordType>(), Err("MX".to_string()));
    }

    #[tokio::test]
    async fn answers_default_to_a_records() {
        let reply = ask("dual.example", &[]).await;
        assert!(reply.is_ok());
        assert_eq!(reply.message, "192.0.2.1");
    }

    #[tokio::test]
    async fn any_lists_every_address() {
        let reply = ask("dual.example", &["ANY"]).await;
        assert_eq!(reply.message, "192.0.2.1,2001:db8::1");
    }

    #[tokio::test]
    async fn unsupported_type_and_failures_have_distinct_status() {
        let reply = ask("dual.example", &["MX"]).await;
        assert_eq!(reply.status, status::UNSUPPORTED_RECORD);

        let reply = ask("missing.example", &["A"]).await;
        assert_eq!(reply.status, status::FAILED);
        assert!(reply.message.contains("missing.example"));
    }
}
